//! Window configuration.

use crate::FrameError;
use crate::compositor::{PixelBufferSpec, PixelFormat};

/// Default window width in pixels.
pub const DEFAULT_WIDTH: u32 = 250;
/// Default window height in pixels.
pub const DEFAULT_HEIGHT: u32 = 250;
/// Default border left unpainted by the animation.
pub const DEFAULT_PADDING: u32 = 20;
/// Default opacity written to the parameter buffer.
pub const DEFAULT_OPACITY: f32 = 0.5;

/// Fixed properties of a window, decided at creation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    /// Border width around the animated interior.
    pub padding: u32,
    /// Opacity in `[0, 1]`, passed to the renderer per frame.
    pub opacity: f32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            padding: DEFAULT_PADDING,
            opacity: DEFAULT_OPACITY,
        }
    }
}

impl WindowConfig {
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::InvalidConfig("width and height must be > 0"));
        }
        if i32::try_from(self.width).is_err() || i32::try_from(self.height).is_err() {
            return Err(FrameError::InvalidConfig("width and height must fit in i32"));
        }
        if PixelBufferSpec::packed(self.width, self.height, PixelFormat::Xrgb8888).is_none() {
            return Err(FrameError::InvalidConfig(
                "width × height × 4 does not fit a pixel buffer",
            ));
        }
        if self.padding.saturating_mul(2) >= self.width.min(self.height) {
            return Err(FrameError::InvalidConfig("padding leaves no interior"));
        }
        if !(0.0..=1.0).contains(&self.opacity) {
            return Err(FrameError::InvalidConfig("opacity must be within [0, 1]"));
        }
        Ok(())
    }

    /// Size in bytes of one pixel buffer.
    pub fn pixel_buffer_size(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}
