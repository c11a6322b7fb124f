//! A window and its frame pacer.
//!
//! After the first frame, drawing is driven only by frame ticks: every redraw
//! requests the next tick before committing, so there is at most one
//! outstanding request and the animation runs at the compositor's pace.

use crate::compositor::{
    BufferRelease, Compositor, CompositorError, FrameTick, PixelFormat, Rect, SurfaceId, TickToken,
};
use crate::config::WindowConfig;
use crate::params::{self, QUAD_LAYOUT};
use crate::pool::{FramePool, ReleaseOutcome};
use crate::{FrameError, paint};

/// Where the pacer is between frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacerState {
    /// Nothing drawn yet.
    Idle,
    /// A frame was committed and the tick it requested has not fired.
    AwaitingTick(TickToken),
}

/// A surface with its double-buffered pool.
#[derive(Debug)]
pub struct Window {
    config: WindowConfig,
    surface: SurfaceId,
    pool: FramePool,
    state: PacerState,
    frames: u64,
}

impl Window {
    /// Create the surface and declare its parameter layout. No buffers are
    /// allocated until the first [`redraw`](Self::redraw).
    pub fn create<C: Compositor + ?Sized>(
        compositor: &mut C,
        config: WindowConfig,
    ) -> Result<Self, FrameError> {
        config.validate()?;

        if !compositor.supports_format(PixelFormat::Xrgb8888) {
            tracing::error!("XRGB8888 shared-memory format not available");
            return Err(CompositorError::UnsupportedFormat(PixelFormat::Xrgb8888).into());
        }

        let pool = FramePool::new(config.width, config.height)?;
        let surface = compositor.create_surface()?;
        compositor.attach_parameter_layout(surface, &QUAD_LAYOUT)?;

        tracing::info!(
            surface = surface.0,
            width = config.width,
            height = config.height,
            "window created"
        );

        Ok(Self {
            config,
            surface,
            pool,
            state: PacerState::Idle,
            frames: 0,
        })
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    pub fn surface(&self) -> SurfaceId {
        self.surface
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    pub fn state(&self) -> PacerState {
        self.state
    }

    /// Frames committed so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Draw and commit one frame at `time` milliseconds.
    ///
    /// Fails with [`FrameError::PoolExhausted`] if both buffers are busy.
    pub fn redraw<C: Compositor + ?Sized>(
        &mut self,
        compositor: &mut C,
        time: u32,
    ) -> Result<(), FrameError> {
        let WindowConfig {
            width,
            height,
            padding,
            opacity,
        } = self.config;
        let surface = self.surface;
        let first_frame = self.frames == 0;

        let Some(mut buffer) = self.pool.acquire_free_buffer(compositor)? else {
            let err = FrameError::PoolExhausted { first_frame };
            tracing::error!(error = %err, "no free buffer");
            return Err(err);
        };

        paint::paint_pixels(buffer.pixels_mut(), padding, width, height, time);
        params::encode(buffer.params_mut(), width as f32, height as f32, opacity)?;

        // The border is only ever painted by the initial fill.
        if first_frame {
            compositor.mark_damaged(surface, Rect::new(0, 0, width as i32, height as i32))?;
        }

        compositor.submit_parameter_buffer(surface, buffer.parameter_buffer())?;
        compositor.submit_pixel_buffer(surface, buffer.pixel_buffer(), 0, 0)?;

        let (pad, w, h) = (padding as i32, width as i32, height as i32);
        compositor.mark_damaged(surface, Rect::new(pad, pad, w - pad * 2, h - pad * 2))?;

        let token = compositor.request_next_frame(surface)?;
        compositor.commit(surface)?;

        tracing::trace!(slot = buffer.slot(), time, frame = self.frames, "frame committed");
        buffer.mark_busy();

        self.state = PacerState::AwaitingTick(token);
        self.frames += 1;
        Ok(())
    }

    /// Redraw in response to `tick`. Returns `false` if the tick was not the
    /// one this window is waiting for.
    pub fn handle_tick<C: Compositor + ?Sized>(
        &mut self,
        compositor: &mut C,
        tick: FrameTick,
    ) -> Result<bool, FrameError> {
        match self.state {
            PacerState::AwaitingTick(token) if token == tick.token => {
                self.redraw(compositor, tick.time)?;
                Ok(true)
            }
            state => {
                tracing::warn!(token = tick.token.0, ?state, "ignoring unexpected frame tick");
                Ok(false)
            }
        }
    }

    pub fn handle_release(&mut self, release: BufferRelease) -> ReleaseOutcome {
        self.pool.release(release.buffer)
    }

    /// Destroy the buffers and the surface.
    pub fn destroy<C: Compositor + ?Sized>(self, compositor: &mut C) {
        self.pool.destroy(compositor);
        compositor.destroy_surface(self.surface);
        tracing::debug!(surface = self.surface.0, frames = self.frames, "window destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackCompositor, LoopbackConfig};
    use crate::params::ParameterBlock;

    fn setup() -> (LoopbackCompositor, crate::EventStreams, Window) {
        let (mut compositor, events) = LoopbackCompositor::new(LoopbackConfig::default());
        let window = Window::create(&mut compositor, WindowConfig::default()).unwrap();
        (compositor, events, window)
    }

    #[test]
    fn test_create_requires_xrgb() {
        let (mut compositor, _events) = LoopbackCompositor::new(LoopbackConfig {
            formats: vec![PixelFormat::Argb8888],
            ..Default::default()
        });
        let err = Window::create(&mut compositor, WindowConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            FrameError::Compositor(CompositorError::UnsupportedFormat(PixelFormat::Xrgb8888))
        ));
    }

    #[test]
    fn test_create_rejects_overflowing_size() {
        let (mut compositor, _events) = LoopbackCompositor::new(LoopbackConfig::default());
        let config = WindowConfig {
            width: 1 << 30,
            height: 100,
            ..Default::default()
        };
        let err = Window::create(&mut compositor, config).unwrap_err();
        assert!(matches!(err, FrameError::InvalidConfig(_)));
        assert_eq!(compositor.server().surface_count(), 0);
    }

    #[test]
    fn test_create_declares_layout_and_allocates_nothing() {
        let (compositor, _events, window) = setup();
        assert_eq!(compositor.server().layout(window.surface()), Some(QUAD_LAYOUT));
        assert_eq!(compositor.imported_buffers(), 0);
        assert_eq!(window.state(), PacerState::Idle);
    }

    #[test]
    fn test_first_frame_damage_and_parameters() {
        let (mut compositor, mut events, mut window) = setup();
        let server = compositor.server();

        window.redraw(&mut compositor, 0).unwrap();
        assert_eq!(window.frames(), 1);
        assert_eq!(window.pool().busy_count(), 1);
        assert!(matches!(window.state(), PacerState::AwaitingTick(_)));

        assert_eq!(server.present(16), 1);
        let frame = server.last_presented().unwrap();
        assert_eq!(
            frame.damage,
            vec![Rect::new(0, 0, 250, 250), Rect::new(20, 20, 210, 210)]
        );
        assert_eq!(frame.parameters, Some(ParameterBlock::quad(250.0, 250.0, 0.5)));
        // Border from the initial fill, center from the pattern.
        assert_eq!(frame.pixel(0, 0), Some(0xffff_ffff));
        assert_eq!(frame.pixel(125, 125), Some(0));

        let tick = events.ticks.try_recv().unwrap();
        assert!(window.handle_tick(&mut compositor, tick).unwrap());
        server.present(32);
        // Later frames damage only the interior.
        assert_eq!(
            server.last_presented().unwrap().damage,
            vec![Rect::new(20, 20, 210, 210)]
        );
    }

    #[test]
    fn test_stale_tick_ignored() {
        let (mut compositor, _events, mut window) = setup();
        window.redraw(&mut compositor, 0).unwrap();

        let stale = FrameTick {
            token: TickToken(u64::MAX),
            time: 5,
        };
        assert!(!window.handle_tick(&mut compositor, stale).unwrap());
        assert_eq!(window.frames(), 1);
    }

    #[test]
    fn test_exhausted_pool_is_an_error() {
        let (mut compositor, _events, mut window) = setup();
        window.redraw(&mut compositor, 0).unwrap();
        window.redraw(&mut compositor, 1).unwrap();

        let err = window.redraw(&mut compositor, 2).unwrap_err();
        assert!(matches!(err, FrameError::PoolExhausted { first_frame: false }));
    }

    #[test]
    fn test_release_frees_slot() {
        let (mut compositor, _events, mut window) = setup();
        window.redraw(&mut compositor, 0).unwrap();
        let buffer = window.pool().buffer(0).and_then(|b| b.pixel_buffer()).unwrap();

        assert_eq!(
            window.handle_release(BufferRelease { buffer }),
            ReleaseOutcome::Released(0)
        );
        assert_eq!(
            window.handle_release(BufferRelease { buffer }),
            ReleaseOutcome::AlreadyFree(0)
        );
    }

    #[test]
    fn test_destroy_releases_compositor_objects() {
        let (mut compositor, _events, mut window) = setup();
        window.redraw(&mut compositor, 0).unwrap();
        assert_eq!(compositor.imported_buffers(), 2);

        window.destroy(&mut compositor);
        assert_eq!(compositor.imported_buffers(), 0);
        assert_eq!(compositor.server().surface_count(), 0);
    }

    /// Forwards to a loopback compositor and records the request order.
    struct Recording {
        inner: LoopbackCompositor,
        calls: Vec<&'static str>,
    }

    impl Compositor for Recording {
        fn supports_format(&self, format: PixelFormat) -> bool {
            self.inner.supports_format(format)
        }

        fn create_surface(&mut self) -> Result<SurfaceId, CompositorError> {
            self.inner.create_surface()
        }

        fn attach_parameter_layout(
            &mut self,
            surface: SurfaceId,
            layout: &crate::ParameterLayout,
        ) -> Result<(), CompositorError> {
            self.inner.attach_parameter_layout(surface, layout)
        }

        fn import_pixel_buffer(
            &mut self,
            fd: std::os::fd::BorrowedFd<'_>,
            spec: crate::PixelBufferSpec,
        ) -> Result<crate::BufferId, CompositorError> {
            self.inner.import_pixel_buffer(fd, spec)
        }

        fn import_parameter_buffer(
            &mut self,
            fd: std::os::fd::BorrowedFd<'_>,
            size: usize,
        ) -> Result<crate::BufferId, CompositorError> {
            self.inner.import_parameter_buffer(fd, size)
        }

        fn submit_pixel_buffer(
            &mut self,
            surface: SurfaceId,
            buffer: crate::BufferId,
            x: i32,
            y: i32,
        ) -> Result<(), CompositorError> {
            self.calls.push("submit_pixels");
            self.inner.submit_pixel_buffer(surface, buffer, x, y)
        }

        fn submit_parameter_buffer(
            &mut self,
            surface: SurfaceId,
            buffer: crate::BufferId,
        ) -> Result<(), CompositorError> {
            self.calls.push("submit_params");
            self.inner.submit_parameter_buffer(surface, buffer)
        }

        fn mark_damaged(&mut self, surface: SurfaceId, rect: Rect) -> Result<(), CompositorError> {
            self.calls.push(if rect.x == 0 { "damage_full" } else { "damage_interior" });
            self.inner.mark_damaged(surface, rect)
        }

        fn request_next_frame(&mut self, surface: SurfaceId) -> Result<TickToken, CompositorError> {
            self.calls.push("frame");
            self.inner.request_next_frame(surface)
        }

        fn commit(&mut self, surface: SurfaceId) -> Result<(), CompositorError> {
            self.calls.push("commit");
            self.inner.commit(surface)
        }

        fn destroy_buffer(&mut self, buffer: crate::BufferId) {
            self.inner.destroy_buffer(buffer)
        }

        fn destroy_surface(&mut self, surface: SurfaceId) {
            self.inner.destroy_surface(surface)
        }
    }

    #[test]
    fn test_first_frame_damage_precedes_submits() {
        let (inner, _events) = LoopbackCompositor::new(LoopbackConfig::default());
        let mut compositor = Recording {
            inner,
            calls: Vec::new(),
        };
        let mut window = Window::create(&mut compositor, WindowConfig::default()).unwrap();

        window.redraw(&mut compositor, 0).unwrap();
        assert_eq!(
            compositor.calls,
            [
                "damage_full",
                "submit_params",
                "submit_pixels",
                "damage_interior",
                "frame",
                "commit"
            ]
        );

        // Later frames only damage the interior.
        compositor.calls.clear();
        window.redraw(&mut compositor, 16).unwrap();
        assert_eq!(
            compositor.calls,
            ["submit_params", "submit_pixels", "damage_interior", "frame", "commit"]
        );
    }
}
