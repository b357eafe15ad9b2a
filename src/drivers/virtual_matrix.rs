//! In-memory LED matrix.
//!
//! Keeps a staged and a latched frame in physical strip order so the wiring
//! layout is exercised the same way a real strip driver would see it.

use log::debug;

use crate::{
    config::MatrixLayout,
    matrix::{Color, MatrixDimensions, MatrixError, MatrixWriter, PixelBuffer},
};

const OFF: Color = Color { r: 0, g: 0, b: 0 };

#[derive(Debug, Clone)]
pub struct VirtualMatrix {
    layout: MatrixLayout,
    dimensions: MatrixDimensions,
    staged: Vec<Color>,
    latched: Vec<Color>,
    brightness: u8,
    initialized: bool,
    frames_shown: u64,
    last_changed: usize,
    /// Makes the next [`show`](MatrixWriter::show) fail once.
    pub fail_next_show: bool,
}

impl VirtualMatrix {
    pub fn new(layout: MatrixLayout) -> Self {
        Self {
            layout,
            dimensions: MatrixDimensions::new(0, 0),
            staged: Vec::new(),
            latched: Vec::new(),
            brightness: u8::MAX,
            initialized: false,
            frames_shown: 0,
            last_changed: 0,
            fail_next_show: false,
        }
    }

    /// Strip index of logical `(x, y)`.
    pub fn strip_index(&self, x: usize, y: usize) -> Option<usize> {
        if !self.dimensions.contains(x, y) {
            return None;
        }
        let width = self.dimensions.width;
        let column = match self.layout {
            MatrixLayout::Serpentine if y % 2 == 1 => width - 1 - x,
            _ => x,
        };
        Some(y * width + column)
    }

    /// Latched color at logical `(x, y)`.
    pub fn pixel(&self, x: usize, y: usize) -> Option<Color> {
        self.strip_index(x, y).map(|i| self.latched[i])
    }

    /// The latched frame in logical coordinates.
    pub fn frame(&self) -> PixelBuffer {
        let mut frame = PixelBuffer::filled(self.dimensions, OFF);
        for y in 0..self.dimensions.height {
            for x in 0..self.dimensions.width {
                if let Some(color) = self.pixel(x, y) {
                    frame.set(x, y, color);
                }
            }
        }
        frame
    }

    pub fn is_dark(&self) -> bool {
        self.latched.iter().all(|c| *c == OFF)
    }

    pub const fn brightness(&self) -> u8 {
        self.brightness
    }

    pub const fn frames_shown(&self) -> u64 {
        self.frames_shown
    }

    /// LEDs that changed on the most recent show.
    pub const fn last_changed(&self) -> usize {
        self.last_changed
    }
}

impl MatrixWriter for VirtualMatrix {
    fn init(&mut self, dimensions: MatrixDimensions) -> Result<(), MatrixError> {
        if dimensions.total_pixels() == 0 {
            return Err(MatrixError::InitFailed(format!(
                "empty surface {}x{}",
                dimensions.width, dimensions.height
            )));
        }
        self.dimensions = dimensions;
        self.staged = vec![OFF; dimensions.total_pixels()];
        self.latched = vec![OFF; dimensions.total_pixels()];
        self.initialized = true;
        debug!(
            "Virtual matrix initialised at {}x{} ({:?})",
            dimensions.width, dimensions.height, self.layout
        );
        Ok(())
    }

    fn set_pixel(&mut self, x: usize, y: usize, color: Color) {
        if let Some(index) = self.strip_index(x, y) {
            self.staged[index] = color;
        }
    }

    fn fill(&mut self, color: Color) {
        self.staged.fill(color);
    }

    fn show(&mut self) -> Result<(), MatrixError> {
        if !self.initialized {
            return Err(MatrixError::WriteFailed("matrix not initialised".into()));
        }
        if self.fail_next_show {
            self.fail_next_show = false;
            return Err(MatrixError::WriteFailed("simulated strip fault".into()));
        }

        self.last_changed = self
            .staged
            .iter()
            .zip(&self.latched)
            .filter(|(staged, latched)| staged != latched)
            .count();
        self.latched.copy_from_slice(&self.staged);
        self.frames_shown += 1;
        Ok(())
    }

    fn clear(&mut self) {
        self.staged.fill(OFF);
    }

    fn set_brightness(&mut self, brightness: u8) {
        self.brightness = brightness;
    }

    fn dimensions(&self) -> MatrixDimensions {
        self.dimensions
    }
}
