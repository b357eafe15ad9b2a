//! LED matrix abstraction: colors, pixel buffers and the writer capability.
//!
//! The core never addresses LEDs directly. It produces [`PixelBuffer`]s in
//! logical `(x, y)` coordinates and hands them to a [`MatrixWriter`], which
//! owns the physical wiring (serpentine strips, color order, gamma).

use rgb::RGB8;
use thiserror::Error;

/// Color type used for every pixel.
pub type Color = RGB8;

/// GitHub's dark-theme palette.
pub mod palette {
    use super::Color;

    pub const BACKGROUND: Color = Color { r: 22, g: 27, b: 34 };
    pub const LEVEL_1: Color = Color { r: 14, g: 68, b: 41 };
    pub const LEVEL_2: Color = Color { r: 0, g: 109, b: 50 };
    pub const LEVEL_3: Color = Color { r: 38, g: 166, b: 65 };
    pub const LEVEL_4: Color = Color { r: 57, g: 211, b: 83 };

    pub const PR_OPENED: Color = Color { r: 33, g: 136, b: 255 };
    pub const PR_MERGED: Color = Color { r: 40, g: 167, b: 69 };
    pub const PR_CLOSED: Color = Color { r: 220, g: 53, b: 69 };
    pub const REVIEW_COMMENT: Color = Color { r: 255, g: 193, b: 7 };
}

/// Width and height of a pixel surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatrixDimensions {
    pub width: usize,
    pub height: usize,
}

impl MatrixDimensions {
    pub const fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    pub const fn total_pixels(&self) -> usize {
        self.width * self.height
    }

    pub const fn contains(&self, x: usize, y: usize) -> bool {
        x < self.width && y < self.height
    }

    /// Row-major index of `(x, y)`, if it lies on the surface.
    pub const fn index_of(&self, x: usize, y: usize) -> Option<usize> {
        if self.contains(x, y) {
            Some(y * self.width + x)
        } else {
            None
        }
    }
}

/// A rectangular block of pixels in logical coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    dimensions: MatrixDimensions,
    pixels: Vec<Color>,
}

impl PixelBuffer {
    /// Creates a buffer with every pixel set to `color`.
    pub fn filled(dimensions: MatrixDimensions, color: Color) -> Self {
        Self {
            dimensions,
            pixels: vec![color; dimensions.total_pixels()],
        }
    }

    pub const fn dimensions(&self) -> MatrixDimensions {
        self.dimensions
    }

    pub fn pixels(&self) -> &[Color] {
        &self.pixels
    }

    pub fn get(&self, x: usize, y: usize) -> Option<Color> {
        self.dimensions
            .index_of(x, y)
            .map(|index| self.pixels[index])
    }

    /// Sets a pixel. Coordinates outside the buffer are ignored.
    pub fn set(&mut self, x: usize, y: usize, color: Color) {
        if let Some(index) = self.dimensions.index_of(x, y) {
            self.pixels[index] = color;
        }
    }

    /// Copies `source` into this buffer with its top-left corner at
    /// `(x_offset, y_offset)`, clipping whatever does not fit.
    pub fn blit(&mut self, source: &PixelBuffer, x_offset: usize, y_offset: usize) {
        for (x, y, color) in source.iter() {
            self.set(x + x_offset, y + y_offset, color);
        }
    }

    /// Iterates `(x, y, color)` in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, Color)> + '_ {
        let width = self.dimensions.width.max(1);
        self.pixels
            .iter()
            .enumerate()
            .map(move |(index, color)| (index % width, index / width, *color))
    }
}

/// Failures reported by a matrix driver.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MatrixError {
    #[error("matrix initialisation failed: {0}")]
    InitFailed(String),
    #[error("matrix write failed: {0}")]
    WriteFailed(String),
}

/// Capability trait for LED matrix hardware.
///
/// # Implementations
/// - [`VirtualMatrix`](crate::drivers::virtual_matrix::VirtualMatrix): in-memory
///   framebuffer used on hosts without an LED panel and in tests.
#[cfg_attr(test, mockall::automock)]
pub trait MatrixWriter: Send {
    /// Prepares the hardware for a surface of the given size.
    fn init(&mut self, dimensions: MatrixDimensions) -> Result<(), MatrixError>;

    /// Stages one pixel; nothing is visible until [`show`](Self::show).
    fn set_pixel(&mut self, x: usize, y: usize, color: Color);

    /// Stages the same color on every pixel.
    fn fill(&mut self, color: Color);

    /// Latches the staged frame onto the LEDs.
    fn show(&mut self) -> Result<(), MatrixError>;

    /// Stages an all-off frame.
    fn clear(&mut self);

    fn set_brightness(&mut self, brightness: u8);

    fn dimensions(&self) -> MatrixDimensions;
}

/// Stages every pixel of `frame` and latches it.
pub fn write_frame(writer: &mut dyn MatrixWriter, frame: &PixelBuffer) -> Result<(), MatrixError> {
    for (x, y, color) in frame.iter() {
        writer.set_pixel(x, y, color);
    }
    writer.show()
}
