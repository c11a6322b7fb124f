#![doc = include_str!("../README.md")]

mod compositor;
mod config;
mod driver;
mod error;
pub mod loopback;
pub mod paint;
pub mod params;
mod pool;
mod window;

pub use compositor::{
    BufferId, BufferRelease, Compositor, CompositorError, EventSinks, EventStreams, FrameTick,
    PixelBufferSpec, PixelFormat, Rect, SurfaceId, TickToken, event_channels,
};
pub use config::{DEFAULT_HEIGHT, DEFAULT_OPACITY, DEFAULT_PADDING, DEFAULT_WIDTH, WindowConfig};
pub use driver::{DriverExit, DriverReport, RunFlag, run};
pub use error::FrameError;
pub use params::{PARAMETER_BLOCK_SIZE, ParameterBlock, ParameterLayout, QUAD_LAYOUT};
pub use pool::{
    FrameBuffer, FramePool, ImportedRegion, POOL_SLOTS, ReadyBuffer, RegionSlot, ReleaseOutcome,
};
pub use window::{PacerState, Window};

// Re-exported so callers need not depend on the region crate directly.
pub use framepace_region::{AllocError, SharedRegion, SharedView};
