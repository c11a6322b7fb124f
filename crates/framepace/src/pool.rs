//! Double-buffered frame pool.
//!
//! Each window owns exactly two [`FrameBuffer`]s. A buffer is *busy* from the
//! moment it is committed until the compositor reports it released; a busy
//! buffer is never handed out for writing. Selection always takes the first
//! free slot in order (slot 0, then slot 1), so under a well-behaved
//! compositor the two slots alternate.
//!
//! Shared memory is created lazily: the first time a slot is acquired its
//! pixel region and parameter region go from `Unallocated` to `Allocated`
//! and are then reused for the lifetime of the pool.

use framepace_region::SharedRegion;

use crate::compositor::{BufferId, Compositor, PixelBufferSpec, PixelFormat};
use crate::params::QUAD_LAYOUT;
use crate::{FrameError, paint};

/// Buffers per window.
pub const POOL_SLOTS: usize = 2;

/// Allocation state of one region of a [`FrameBuffer`].
#[derive(Debug, Default)]
pub enum RegionSlot {
    #[default]
    Unallocated,
    Allocated(ImportedRegion),
}

impl RegionSlot {
    pub fn is_allocated(&self) -> bool {
        matches!(self, Self::Allocated(_))
    }

    fn buffer(&self) -> Option<BufferId> {
        match self {
            Self::Allocated(imported) => Some(imported.buffer),
            Self::Unallocated => None,
        }
    }

    /// Run the `Unallocated -> Allocated` transition if it has not happened yet.
    fn get_or_try_init(
        &mut self,
        init: impl FnOnce() -> Result<ImportedRegion, FrameError>,
    ) -> Result<&mut ImportedRegion, FrameError> {
        if let Self::Unallocated = self {
            *self = Self::Allocated(init()?);
        }
        match self {
            Self::Allocated(imported) => Ok(imported),
            Self::Unallocated => unreachable!("region was just allocated"),
        }
    }
}

/// A shared region together with the compositor's name for it.
#[derive(Debug)]
pub struct ImportedRegion {
    region: SharedRegion,
    buffer: BufferId,
}

impl ImportedRegion {
    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }
}

/// One slot of the pool.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pixels: RegionSlot,
    params: RegionSlot,
    busy: bool,
}

impl FrameBuffer {
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn pixels(&self) -> &RegionSlot {
        &self.pixels
    }

    pub fn params(&self) -> &RegionSlot {
        &self.params
    }

    /// The compositor id of the pixel buffer, once allocated.
    pub fn pixel_buffer(&self) -> Option<BufferId> {
        self.pixels.buffer()
    }

    /// The compositor id of the parameter buffer, once allocated.
    pub fn parameter_buffer(&self) -> Option<BufferId> {
        self.params.buffer()
    }
}

/// A free, fully allocated buffer borrowed from the pool for one frame.
#[derive(Debug)]
pub struct ReadyBuffer<'a> {
    slot: usize,
    pixels: &'a mut ImportedRegion,
    params: &'a mut ImportedRegion,
    busy: &'a mut bool,
}

impl ReadyBuffer<'_> {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn pixel_buffer(&self) -> BufferId {
        self.pixels.buffer
    }

    pub fn parameter_buffer(&self) -> BufferId {
        self.params.buffer
    }

    /// Row-major pixels, one `u32` per pixel.
    pub fn pixels_mut(&mut self) -> &mut [u32] {
        self.pixels.region.as_words_mut()
    }

    pub fn params_mut(&mut self) -> &mut [u8] {
        self.params.region.as_bytes_mut()
    }

    /// Mark the buffer busy. Call once it has been committed.
    pub fn mark_busy(self) {
        *self.busy = true;
    }
}

/// What a release did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The slot went from busy to free.
    Released(usize),
    /// The slot was already free; nothing changed.
    AlreadyFree(usize),
    /// No slot owns this buffer.
    Unknown,
}

/// The two buffers of a window.
#[derive(Debug)]
pub struct FramePool {
    buffers: [FrameBuffer; POOL_SLOTS],
    spec: PixelBufferSpec,
    param_size: usize,
}

impl FramePool {
    /// A pool for `width × height` XRGB8888 frames. Nothing is allocated yet.
    pub fn new(width: u32, height: u32) -> Result<Self, FrameError> {
        let spec = PixelBufferSpec::packed(width, height, PixelFormat::Xrgb8888)
            .ok_or(FrameError::InvalidConfig("pixel buffer size overflows"))?;
        Ok(Self {
            buffers: Default::default(),
            spec,
            param_size: QUAD_LAYOUT.total_size(),
        })
    }

    pub fn spec(&self) -> PixelBufferSpec {
        self.spec
    }

    pub fn buffer(&self, slot: usize) -> Option<&FrameBuffer> {
        self.buffers.get(slot)
    }

    pub fn busy_count(&self) -> usize {
        self.buffers.iter().filter(|b| b.busy).count()
    }

    /// The slot owning `buffer`, if any.
    pub fn slot_of(&self, buffer: BufferId) -> Option<usize> {
        self.buffers
            .iter()
            .position(|b| b.pixel_buffer() == Some(buffer))
    }

    /// Take the first free slot, allocating its regions on first use.
    ///
    /// Returns `Ok(None)` when both slots are busy.
    pub fn acquire_free_buffer<C: Compositor + ?Sized>(
        &mut self,
        compositor: &mut C,
    ) -> Result<Option<ReadyBuffer<'_>>, FrameError> {
        let Some(slot) = self.buffers.iter().position(|b| !b.busy) else {
            return Ok(None);
        };

        let spec = self.spec;
        let param_size = self.param_size;
        let buffer = &mut self.buffers[slot];

        let pixels = buffer.pixels.get_or_try_init(|| {
            let mut region = framepace_region::allocate(spec.size())?;
            // Paints the border once; frames only repaint the interior.
            paint::fill_opaque(region.as_words_mut());
            let id = region.share(|fd| {
                compositor
                    .import_pixel_buffer(fd, spec)
                    .map_err(FrameError::from)
            })?;
            tracing::debug!(slot, buffer = id.0, size = spec.size(), "created pixel buffer");
            Ok(ImportedRegion { region, buffer: id })
        })?;

        let params = buffer.params.get_or_try_init(|| {
            let mut region = framepace_region::allocate(param_size)?;
            let id = region.share(|fd| {
                compositor
                    .import_parameter_buffer(fd, param_size)
                    .map_err(FrameError::from)
            })?;
            tracing::debug!(slot, buffer = id.0, size = param_size, "created parameter buffer");
            Ok(ImportedRegion { region, buffer: id })
        })?;

        Ok(Some(ReadyBuffer {
            slot,
            pixels,
            params,
            busy: &mut buffer.busy,
        }))
    }

    /// Apply the compositor's release of `buffer`.
    ///
    /// Releasing a free buffer is tolerated and changes nothing.
    pub fn release(&mut self, buffer: BufferId) -> ReleaseOutcome {
        let Some(slot) = self.slot_of(buffer) else {
            tracing::warn!(buffer = buffer.0, "release for a buffer this pool does not own");
            return ReleaseOutcome::Unknown;
        };

        let frame = &mut self.buffers[slot];
        if !frame.busy {
            tracing::trace!(slot, buffer = buffer.0, "release of a free buffer ignored");
            return ReleaseOutcome::AlreadyFree(slot);
        }

        frame.busy = false;
        tracing::trace!(slot, buffer = buffer.0, "buffer released");
        ReleaseOutcome::Released(slot)
    }

    /// Destroy every allocated buffer on the compositor side and unmap the regions.
    pub fn destroy<C: Compositor + ?Sized>(self, compositor: &mut C) {
        for (slot, frame) in self.buffers.into_iter().enumerate() {
            for id in [frame.pixel_buffer(), frame.parameter_buffer()]
                .into_iter()
                .flatten()
            {
                compositor.destroy_buffer(id);
            }
            tracing::trace!(slot, "frame buffer destroyed");
        }
    }
}
