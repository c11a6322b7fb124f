//! The display-server collaborator.
//!
//! [`Compositor`] is everything the frame pipeline needs from the display
//! connection: importing shared regions as buffers, attaching them to a
//! surface, damage, commit, and one-shot frame notifications. Connection
//! setup, global discovery and shell integration live behind it.
//!
//! Asynchronous notifications do not come back through the trait. They are
//! delivered on two independent channels, bundled as [`EventStreams`]:
//! buffer releases and frame ticks. The driver selects over both.

use std::os::fd::BorrowedFd;

use tokio::sync::mpsc;

use crate::params::ParameterLayout;

/// A surface created by the compositor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u32);

/// A pixel or parameter buffer imported by the compositor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

/// Identifies one outstanding frame notification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TickToken(pub u64);

/// Pixel formats a compositor can advertise for shared-memory buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 32-bit, top byte unused (or read as alpha by some renderers).
    Xrgb8888,
    /// 32-bit with premultiplied alpha in the top byte.
    Argb8888,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> u32 {
        4
    }
}

/// A damaged rectangle in surface coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Geometry of a shared-memory pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBufferSpec {
    pub width: u32,
    pub height: u32,
    /// Bytes per row.
    pub stride: u32,
    pub format: PixelFormat,
}

impl PixelBufferSpec {
    /// Tightly packed rows. `None` if the stride overflows `u32` or the
    /// total size overflows `usize`.
    pub const fn packed(width: u32, height: u32, format: PixelFormat) -> Option<Self> {
        let Some(stride) = width.checked_mul(format.bytes_per_pixel()) else {
            return None;
        };
        if stride as u64 * height as u64 > usize::MAX as u64 {
            return None;
        }
        Some(Self {
            width,
            height,
            stride,
            format,
        })
    }

    /// Bytes the backing region must hold.
    pub const fn size(&self) -> usize {
        (self.stride as usize).saturating_mul(self.height as usize)
    }
}

/// Requests the frame pipeline issues to the display server.
///
/// Calls are buffered until [`commit`](Compositor::commit), mirroring a
/// double-buffered surface protocol: attachments, damage and frame requests
/// become current together.
pub trait Compositor {
    /// Whether shared-memory buffers of `format` are accepted.
    fn supports_format(&self, format: PixelFormat) -> bool;

    fn create_surface(&mut self) -> Result<SurfaceId, CompositorError>;

    /// Declare the layout of the parameter buffers that will accompany this
    /// surface's pixel buffers.
    fn attach_parameter_layout(
        &mut self,
        surface: SurfaceId,
        layout: &ParameterLayout,
    ) -> Result<(), CompositorError>;

    /// Import a shared region as a pixel buffer. The compositor duplicates
    /// or maps `fd`; the caller may close its copy on return.
    fn import_pixel_buffer(
        &mut self,
        fd: BorrowedFd<'_>,
        spec: PixelBufferSpec,
    ) -> Result<BufferId, CompositorError>;

    /// Import a shared region of `size` bytes as a parameter buffer.
    fn import_parameter_buffer(
        &mut self,
        fd: BorrowedFd<'_>,
        size: usize,
    ) -> Result<BufferId, CompositorError>;

    fn submit_pixel_buffer(
        &mut self,
        surface: SurfaceId,
        buffer: BufferId,
        x: i32,
        y: i32,
    ) -> Result<(), CompositorError>;

    fn submit_parameter_buffer(
        &mut self,
        surface: SurfaceId,
        buffer: BufferId,
    ) -> Result<(), CompositorError>;

    fn mark_damaged(&mut self, surface: SurfaceId, rect: Rect) -> Result<(), CompositorError>;

    /// Ask for one [`FrameTick`] before the next frame is composed.
    fn request_next_frame(&mut self, surface: SurfaceId) -> Result<TickToken, CompositorError>;

    fn commit(&mut self, surface: SurfaceId) -> Result<(), CompositorError>;

    fn destroy_buffer(&mut self, buffer: BufferId);

    fn destroy_surface(&mut self, surface: SurfaceId);
}

// =============================================================================
// Events
// =============================================================================

/// A frame notification firing. Exactly one per requested token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTick {
    pub token: TickToken,
    /// Milliseconds on the compositor's clock; monotonically increasing.
    pub time: u32,
}

/// The compositor finished reading a committed pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRelease {
    pub buffer: BufferId,
}

/// Receiving ends of the compositor's two notification channels.
#[derive(Debug)]
pub struct EventStreams {
    pub ticks: mpsc::UnboundedReceiver<FrameTick>,
    pub releases: mpsc::UnboundedReceiver<BufferRelease>,
}

/// Sending ends, held by the compositor implementation.
#[derive(Debug, Clone)]
pub struct EventSinks {
    pub ticks: mpsc::UnboundedSender<FrameTick>,
    pub releases: mpsc::UnboundedSender<BufferRelease>,
}

/// Create a connected pair of event sinks and streams.
pub fn event_channels() -> (EventSinks, EventStreams) {
    let (tick_tx, tick_rx) = mpsc::unbounded_channel();
    let (release_tx, release_rx) = mpsc::unbounded_channel();
    (
        EventSinks {
            ticks: tick_tx,
            releases: release_tx,
        },
        EventStreams {
            ticks: tick_rx,
            releases: release_rx,
        },
    )
}

// =============================================================================
// Errors
// =============================================================================

/// Errors reported by a [`Compositor`].
#[derive(Debug)]
pub enum CompositorError {
    /// Shared-memory buffers of this format are not accepted.
    UnsupportedFormat(PixelFormat),
    UnknownSurface(SurfaceId),
    UnknownBuffer(BufferId),
    /// The compositor could not map an imported region.
    Import(framepace_region::AllocError),
    /// The connection is gone.
    Disconnected,
}

impl std::fmt::Display for CompositorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedFormat(format) => write!(f, "{:?} not available", format),
            Self::UnknownSurface(id) => write!(f, "unknown surface {}", id.0),
            Self::UnknownBuffer(id) => write!(f, "unknown buffer {}", id.0),
            Self::Import(e) => write!(f, "buffer import failed: {}", e),
            Self::Disconnected => write!(f, "compositor disconnected"),
        }
    }
}

impl From<framepace_region::AllocError> for CompositorError {
    fn from(e: framepace_region::AllocError) -> Self {
        Self::Import(e)
    }
}

impl std::error::Error for CompositorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Import(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_spec() {
        let spec = PixelBufferSpec::packed(250, 100, PixelFormat::Xrgb8888).unwrap();
        assert_eq!(spec.stride, 1000);
        assert_eq!(spec.size(), 100_000);
    }

    #[test]
    fn test_packed_rejects_stride_overflow() {
        assert!(PixelBufferSpec::packed(1 << 30, 100, PixelFormat::Xrgb8888).is_none());
        assert!(PixelBufferSpec::packed(u32::MAX, 1, PixelFormat::Argb8888).is_none());
        let widest = PixelBufferSpec::packed(u32::MAX / 4, 1, PixelFormat::Xrgb8888).unwrap();
        assert_eq!(widest.stride, (u32::MAX / 4) * 4);
    }

    #[test]
    fn test_event_channels_are_independent() {
        let (sinks, mut streams) = event_channels();
        sinks
            .releases
            .send(BufferRelease {
                buffer: BufferId(3),
            })
            .unwrap();

        assert!(streams.ticks.try_recv().is_err());
        assert_eq!(
            streams.releases.try_recv().unwrap(),
            BufferRelease {
                buffer: BufferId(3)
            }
        );
    }
}
