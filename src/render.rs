//! Heat-map rendering of the contribution graph.

use crate::{
    graph::{ContributionGraph, GRAPH_COLUMNS, GRAPH_ROWS},
    matrix::{Color, MatrixDimensions, PixelBuffer, palette},
};

/// Intensity bucket of a day's commit count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContributionLevel {
    None,
    Low,
    Medium,
    High,
    Max,
}

impl ContributionLevel {
    /// Buckets: 0, 1-3, 4-6, 7-9, 10+.
    pub const fn from_count(count: u32) -> Self {
        match count {
            0 => Self::None,
            1..=3 => Self::Low,
            4..=6 => Self::Medium,
            7..=9 => Self::High,
            _ => Self::Max,
        }
    }

    pub const fn color(self) -> Color {
        match self {
            Self::None => palette::BACKGROUND,
            Self::Low => palette::LEVEL_1,
            Self::Medium => palette::LEVEL_2,
            Self::High => palette::LEVEL_3,
            Self::Max => palette::LEVEL_4,
        }
    }
}

/// Turns a [`ContributionGraph`] into a 32x7 pixel block.
///
/// Pure: the output depends only on the graph's counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContributionRenderer;

impl ContributionRenderer {
    pub const DIMENSIONS: MatrixDimensions = MatrixDimensions::new(GRAPH_COLUMNS, GRAPH_ROWS);

    pub fn render(&self, graph: &ContributionGraph) -> PixelBuffer {
        let mut buffer = PixelBuffer::filled(Self::DIMENSIONS, palette::BACKGROUND);
        for column in 0..GRAPH_COLUMNS {
            for row in 0..GRAPH_ROWS {
                let level = ContributionLevel::from_count(graph.cell(column, row));
                buffer.set(column, row, level.color());
            }
        }
        buffer
    }
}
