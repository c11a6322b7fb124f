//! Errors surfaced by the frame pipeline.

use framepace_region::AllocError;

use crate::compositor::CompositorError;
use crate::params::LayoutError;

/// Errors from the frame pipeline.
#[derive(Debug)]
pub enum FrameError {
    /// Shared memory for a buffer could not be allocated.
    Alloc(AllocError),
    /// Both buffers were busy when a frame had to be drawn.
    ///
    /// The busy-flag protocol allows at most one outstanding buffer at
    /// steady state, so this means the compositor broke the release contract
    /// (or, on the first frame, that buffer creation failed).
    PoolExhausted { first_frame: bool },
    /// The compositor rejected a request.
    Compositor(CompositorError),
    /// The parameter region could not hold the parameter block.
    Layout(LayoutError),
    /// Window configuration out of range.
    InvalidConfig(&'static str),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alloc(e) => write!(f, "buffer allocation failed: {}", e),
            Self::PoolExhausted { first_frame: true } => {
                write!(f, "failed to create the first buffer")
            }
            Self::PoolExhausted { first_frame: false } => {
                write!(f, "both buffers busy at redraw, compositor bug?")
            }
            Self::Compositor(e) => write!(f, "compositor error: {}", e),
            Self::Layout(e) => write!(f, "layout error: {}", e),
            Self::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Alloc(e) => Some(e),
            Self::Compositor(e) => Some(e),
            Self::Layout(e) => Some(e),
            _ => None,
        }
    }
}

impl From<AllocError> for FrameError {
    fn from(e: AllocError) -> Self {
        Self::Alloc(e)
    }
}

impl From<CompositorError> for FrameError {
    fn from(e: CompositorError) -> Self {
        Self::Compositor(e)
    }
}

impl From<LayoutError> for FrameError {
    fn from(e: LayoutError) -> Self {
        Self::Layout(e)
    }
}
