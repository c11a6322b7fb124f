//! In-process compositor.
//!
//! [`LoopbackCompositor`] implements [`Compositor`] without a display server.
//! It maps every imported region read-only, the way a real compositor maps a
//! client's shared memory, and composes a frame whenever its
//! [`LoopbackServer`] half is told to [`present`](LoopbackServer::present):
//!
//! 1. the newest commit of each surface is read (pixels, decoded parameter
//!    block, damage) and recorded;
//! 2. the pixel buffer it replaces on screen is released;
//! 3. every frame request committed so far fires with the presentation time.
//!
//! A displayed buffer is held until a newer one replaces it. A committed
//! buffer that is replaced before it was ever presented is released at the
//! replacing commit.

use std::collections::{HashMap, VecDeque};
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::time::Duration;

use framepace_region::SharedView;
use parking_lot::Mutex;

use crate::compositor::{
    BufferId, BufferRelease, Compositor, CompositorError, EventSinks, EventStreams, FrameTick,
    PixelBufferSpec, PixelFormat, Rect, SurfaceId, TickToken, event_channels,
};
use crate::driver::RunFlag;
use crate::params::{ParameterBlock, ParameterLayout};

/// Presented frames kept for inspection.
const HISTORY_LIMIT: usize = 8;

/// Configuration for a [`LoopbackCompositor`].
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Shared-memory formats advertised to clients.
    pub formats: Vec<PixelFormat>,
    /// Interval between presentations in [`LoopbackServer::run_vsync`].
    pub refresh: Duration,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            formats: vec![PixelFormat::Xrgb8888, PixelFormat::Argb8888],
            refresh: Duration::from_micros(16_667),
        }
    }
}

/// A frame as the loopback compositor read it out of shared memory.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentedFrame {
    pub surface: SurfaceId,
    pub time: u32,
    pub pixel_buffer: BufferId,
    pub offset: (i32, i32),
    pub spec: PixelBufferSpec,
    /// Row-major copy of the pixel buffer.
    pub pixels: Vec<u32>,
    /// Decoded parameter block, if one was attached.
    pub parameters: Option<ParameterBlock>,
    /// Damage accumulated since the previous presentation.
    pub damage: Vec<Rect>,
}

impl PresentedFrame {
    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.spec.width || y >= self.spec.height {
            return None;
        }
        self.pixels
            .get((y * self.spec.width + x) as usize)
            .copied()
    }
}

enum ImportedBuffer {
    Pixels {
        spec: PixelBufferSpec,
        view: SharedView,
    },
    Parameters {
        view: SharedView,
    },
}

#[derive(Default)]
struct PendingState {
    pixels: Option<(BufferId, i32, i32)>,
    params: Option<BufferId>,
    damage: Vec<Rect>,
    frame_requests: Vec<TickToken>,
}

#[derive(Default)]
struct SurfaceState {
    layout: Option<ParameterLayout>,
    pending: PendingState,
    /// Newest commit not yet presented.
    committed: Option<CommittedFrame>,
    /// Damage committed since the last presentation.
    committed_damage: Vec<Rect>,
    /// Frame requests committed since the last presentation.
    frame_requests: Vec<TickToken>,
    /// Buffer currently on screen.
    held: Option<BufferId>,
    commits: u64,
}

struct CommittedFrame {
    pixels: BufferId,
    offset: (i32, i32),
    params: Option<BufferId>,
}

struct State {
    formats: Vec<PixelFormat>,
    refresh: Duration,
    sinks: Option<EventSinks>,
    buffers: HashMap<BufferId, ImportedBuffer>,
    surfaces: HashMap<SurfaceId, SurfaceState>,
    next_surface: u32,
    next_buffer: u32,
    next_token: u64,
    history: VecDeque<PresentedFrame>,
}

impl State {
    fn sinks(&self) -> Result<&EventSinks, CompositorError> {
        self.sinks.as_ref().ok_or(CompositorError::Disconnected)
    }

    fn surface_mut(&mut self, surface: SurfaceId) -> Result<&mut SurfaceState, CompositorError> {
        self.sinks()?;
        self.surfaces
            .get_mut(&surface)
            .ok_or(CompositorError::UnknownSurface(surface))
    }

    fn insert_buffer(&mut self, buffer: ImportedBuffer) -> BufferId {
        self.next_buffer += 1;
        let id = BufferId(self.next_buffer);
        self.buffers.insert(id, buffer);
        id
    }

    fn release(&self, buffer: BufferId) {
        if let Some(sinks) = &self.sinks {
            tracing::trace!(buffer = buffer.0, "loopback releasing buffer");
            let _ = sinks.releases.send(BufferRelease { buffer });
        }
    }

    fn read_frame(
        &self,
        surface: SurfaceId,
        time: u32,
        commit: &CommittedFrame,
    ) -> Option<PresentedFrame> {
        let Some(ImportedBuffer::Pixels { spec, view }) = self.buffers.get(&commit.pixels) else {
            // Destroyed after commit; nothing to show.
            return None;
        };

        let pixels = (0..view.len() / 4).filter_map(|i| view.word(i)).collect();
        let parameters = commit.params.and_then(|id| match self.buffers.get(&id) {
            Some(ImportedBuffer::Parameters { view }) => ParameterBlock::decode(view.as_bytes()).ok(),
            _ => None,
        });

        Some(PresentedFrame {
            surface,
            time,
            pixel_buffer: commit.pixels,
            offset: commit.offset,
            spec: *spec,
            pixels,
            parameters,
            damage: Vec::new(),
        })
    }
}

/// Client-facing half of the loopback compositor.
pub struct LoopbackCompositor {
    state: Arc<Mutex<State>>,
}

/// Server-facing half: drives presentation and exposes what was shown.
#[derive(Clone)]
pub struct LoopbackServer {
    state: Arc<Mutex<State>>,
}

impl LoopbackCompositor {
    /// A new compositor and the event streams it delivers to.
    pub fn new(config: LoopbackConfig) -> (Self, EventStreams) {
        let (sinks, streams) = event_channels();
        let state = State {
            formats: config.formats,
            refresh: config.refresh,
            sinks: Some(sinks),
            buffers: HashMap::new(),
            surfaces: HashMap::new(),
            next_surface: 0,
            next_buffer: 0,
            next_token: 0,
            history: VecDeque::new(),
        };
        (
            Self {
                state: Arc::new(Mutex::new(state)),
            },
            streams,
        )
    }

    pub fn server(&self) -> LoopbackServer {
        LoopbackServer {
            state: self.state.clone(),
        }
    }

    /// Number of live imported buffers (pixel and parameter).
    pub fn imported_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }
}

impl Compositor for LoopbackCompositor {
    fn supports_format(&self, format: PixelFormat) -> bool {
        self.state.lock().formats.contains(&format)
    }

    fn create_surface(&mut self) -> Result<SurfaceId, CompositorError> {
        let mut state = self.state.lock();
        state.sinks()?;
        state.next_surface += 1;
        let id = SurfaceId(state.next_surface);
        state.surfaces.insert(id, SurfaceState::default());
        tracing::debug!(surface = id.0, "loopback surface created");
        Ok(id)
    }

    fn attach_parameter_layout(
        &mut self,
        surface: SurfaceId,
        layout: &ParameterLayout,
    ) -> Result<(), CompositorError> {
        let mut state = self.state.lock();
        state.surface_mut(surface)?.layout = Some(*layout);
        Ok(())
    }

    fn import_pixel_buffer(
        &mut self,
        fd: BorrowedFd<'_>,
        spec: PixelBufferSpec,
    ) -> Result<BufferId, CompositorError> {
        let mut state = self.state.lock();
        state.sinks()?;
        if !state.formats.contains(&spec.format) {
            return Err(CompositorError::UnsupportedFormat(spec.format));
        }
        let view = SharedView::map(fd, spec.size()).map_err(CompositorError::Import)?;
        Ok(state.insert_buffer(ImportedBuffer::Pixels { spec, view }))
    }

    fn import_parameter_buffer(
        &mut self,
        fd: BorrowedFd<'_>,
        size: usize,
    ) -> Result<BufferId, CompositorError> {
        let mut state = self.state.lock();
        state.sinks()?;
        let view = SharedView::map(fd, size).map_err(CompositorError::Import)?;
        Ok(state.insert_buffer(ImportedBuffer::Parameters { view }))
    }

    fn submit_pixel_buffer(
        &mut self,
        surface: SurfaceId,
        buffer: BufferId,
        x: i32,
        y: i32,
    ) -> Result<(), CompositorError> {
        let mut state = self.state.lock();
        if !matches!(state.buffers.get(&buffer), Some(ImportedBuffer::Pixels { .. })) {
            return Err(CompositorError::UnknownBuffer(buffer));
        }
        state.surface_mut(surface)?.pending.pixels = Some((buffer, x, y));
        Ok(())
    }

    fn submit_parameter_buffer(
        &mut self,
        surface: SurfaceId,
        buffer: BufferId,
    ) -> Result<(), CompositorError> {
        let mut state = self.state.lock();
        if !matches!(state.buffers.get(&buffer), Some(ImportedBuffer::Parameters { .. })) {
            return Err(CompositorError::UnknownBuffer(buffer));
        }
        state.surface_mut(surface)?.pending.params = Some(buffer);
        Ok(())
    }

    fn mark_damaged(&mut self, surface: SurfaceId, rect: Rect) -> Result<(), CompositorError> {
        let mut state = self.state.lock();
        state.surface_mut(surface)?.pending.damage.push(rect);
        Ok(())
    }

    fn request_next_frame(&mut self, surface: SurfaceId) -> Result<TickToken, CompositorError> {
        let mut state = self.state.lock();
        state.next_token += 1;
        let token = TickToken(state.next_token);
        state.surface_mut(surface)?.pending.frame_requests.push(token);
        Ok(token)
    }

    fn commit(&mut self, surface: SurfaceId) -> Result<(), CompositorError> {
        let mut state = self.state.lock();
        let surf = state.surface_mut(surface)?;
        let pending = std::mem::take(&mut surf.pending);

        surf.commits += 1;
        surf.committed_damage.extend(pending.damage);
        surf.frame_requests.extend(pending.frame_requests);

        let mut replaced = None;
        if let Some((pixels, x, y)) = pending.pixels {
            let params = pending
                .params
                .or_else(|| surf.committed.as_ref().and_then(|c| c.params));
            let previous = surf.committed.replace(CommittedFrame {
                pixels,
                offset: (x, y),
                params,
            });
            replaced = previous.map(|c| c.pixels).filter(|&id| id != pixels);
        }

        tracing::trace!(surface = surface.0, commits = surf.commits, "loopback commit");
        if let Some(buffer) = replaced {
            state.release(buffer);
        }
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        let mut state = self.state.lock();
        state.buffers.remove(&buffer);
        for surf in state.surfaces.values_mut() {
            if surf.held == Some(buffer) {
                surf.held = None;
            }
        }
    }

    fn destroy_surface(&mut self, surface: SurfaceId) {
        self.state.lock().surfaces.remove(&surface);
        tracing::debug!(surface = surface.0, "loopback surface destroyed");
    }
}

impl LoopbackServer {
    /// Compose one frame at `time` milliseconds. Returns how many surfaces
    /// had a new buffer to show.
    pub fn present(&self, time: u32) -> usize {
        let mut state = self.state.lock();
        if state.sinks.is_none() {
            return 0;
        }

        let mut shown = 0;
        let mut releases = Vec::new();
        let mut ticks = Vec::new();
        let mut frames = Vec::new();

        let ids: Vec<SurfaceId> = state.surfaces.keys().copied().collect();
        for id in ids {
            let Some(surf) = state.surfaces.get_mut(&id) else {
                continue;
            };
            let commit = surf.committed.take();
            let damage = std::mem::take(&mut surf.committed_damage);
            ticks.extend(surf.frame_requests.drain(..));

            let Some(commit) = commit else {
                continue;
            };

            let previous = surf.held.replace(commit.pixels);
            if let Some(previous) = previous.filter(|&p| p != commit.pixels) {
                releases.push(previous);
            }

            if let Some(mut frame) = state.read_frame(id, time, &commit) {
                frame.damage = damage;
                frames.push(frame);
                shown += 1;
            }
        }

        for frame in frames {
            if state.history.len() == HISTORY_LIMIT {
                state.history.pop_front();
            }
            state.history.push_back(frame);
        }

        for buffer in releases {
            state.release(buffer);
        }
        if let Some(sinks) = &state.sinks {
            for token in ticks {
                let _ = sinks.ticks.send(FrameTick { token, time });
            }
        }

        shown
    }

    /// Present every `refresh` interval until `running` is stopped or the
    /// compositor disconnects. Times are milliseconds since the call.
    pub async fn run_vsync(&self, running: RunFlag) {
        let refresh = self.state.lock().refresh;
        let start = tokio::time::Instant::now();
        let mut interval = tokio::time::interval(refresh);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while running.is_running() && self.is_connected() {
            tokio::select! {
                _ = interval.tick() => {
                    self.present(start.elapsed().as_millis() as u32);
                }
                _ = running.stopped() => break,
            }
        }
        tracing::debug!("loopback vsync stopped");
    }

    /// Drop the event channels, as if the connection went away.
    pub fn disconnect(&self) {
        self.state.lock().sinks = None;
        tracing::debug!("loopback compositor disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().sinks.is_some()
    }

    /// Up to the last few presented frames, oldest first.
    pub fn presented(&self) -> Vec<PresentedFrame> {
        self.state.lock().history.iter().cloned().collect()
    }

    pub fn last_presented(&self) -> Option<PresentedFrame> {
        self.state.lock().history.back().cloned()
    }

    /// The parameter layout declared for `surface`.
    pub fn layout(&self, surface: SurfaceId) -> Option<ParameterLayout> {
        self.state.lock().surfaces.get(&surface)?.layout
    }

    pub fn commits(&self, surface: SurfaceId) -> u64 {
        self.state
            .lock()
            .surfaces
            .get(&surface)
            .map(|s| s.commits)
            .unwrap_or(0)
    }

    pub fn surface_count(&self) -> usize {
        self.state.lock().surfaces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::QUAD_LAYOUT;

    fn import(
        compositor: &mut LoopbackCompositor,
        width: u32,
        height: u32,
        word: u32,
    ) -> (framepace_region::SharedRegion, BufferId) {
        let spec = PixelBufferSpec::packed(width, height, PixelFormat::Xrgb8888).unwrap();
        let mut region = framepace_region::allocate(spec.size()).unwrap();
        region.as_words_mut().fill(word);
        let id = region
            .share(|fd| compositor.import_pixel_buffer(fd, spec))
            .unwrap();
        (region, id)
    }

    #[test]
    fn test_rejects_unadvertised_format() {
        let (mut compositor, _events) = LoopbackCompositor::new(LoopbackConfig {
            formats: vec![PixelFormat::Argb8888],
            ..Default::default()
        });
        assert!(!compositor.supports_format(PixelFormat::Xrgb8888));

        let spec = PixelBufferSpec::packed(4, 4, PixelFormat::Xrgb8888).unwrap();
        let mut region = framepace_region::allocate(spec.size()).unwrap();
        let err = region
            .share(|fd| compositor.import_pixel_buffer(fd, spec))
            .unwrap_err();
        assert!(matches!(err, CompositorError::UnsupportedFormat(PixelFormat::Xrgb8888)));
    }

    #[test]
    fn test_present_reads_shared_memory_and_fires_ticks() {
        let (mut compositor, mut events) = LoopbackCompositor::new(LoopbackConfig::default());
        let server = compositor.server();
        let surface = compositor.create_surface().unwrap();
        compositor.attach_parameter_layout(surface, &QUAD_LAYOUT).unwrap();
        assert_eq!(server.layout(surface), Some(QUAD_LAYOUT));

        let (mut region, id) = import(&mut compositor, 4, 2, 0x00ab_cdef);
        compositor.submit_pixel_buffer(surface, id, 0, 0).unwrap();
        compositor.mark_damaged(surface, Rect::new(0, 0, 4, 2)).unwrap();
        let token = compositor.request_next_frame(surface).unwrap();

        // Nothing fires before commit.
        assert_eq!(server.present(5), 0);
        assert!(events.ticks.try_recv().is_err());

        compositor.commit(surface).unwrap();
        // The client writes after commit; the compositor sees it at present.
        region.as_words_mut()[7] = 0xff00_0000;
        assert_eq!(server.present(16), 1);

        let frame = server.last_presented().unwrap();
        assert_eq!(frame.pixel(0, 0), Some(0x00ab_cdef));
        assert_eq!(frame.pixel(3, 1), Some(0xff00_0000));
        assert_eq!(frame.pixel(4, 0), None);
        assert_eq!(frame.damage, vec![Rect::new(0, 0, 4, 2)]);
        assert!(frame.parameters.is_none());

        assert_eq!(events.ticks.try_recv().unwrap(), FrameTick { token, time: 16 });
        // First buffer is held on screen, not released.
        assert!(events.releases.try_recv().is_err());
    }

    #[test]
    fn test_held_buffer_released_when_replaced() {
        let (mut compositor, mut events) = LoopbackCompositor::new(LoopbackConfig::default());
        let server = compositor.server();
        let surface = compositor.create_surface().unwrap();
        let (_a, a) = import(&mut compositor, 2, 2, 1);
        let (_b, b) = import(&mut compositor, 2, 2, 2);

        compositor.submit_pixel_buffer(surface, a, 0, 0).unwrap();
        compositor.commit(surface).unwrap();
        server.present(1);
        assert!(events.releases.try_recv().is_err());

        compositor.submit_pixel_buffer(surface, b, 0, 0).unwrap();
        compositor.commit(surface).unwrap();
        server.present(2);
        assert_eq!(events.releases.try_recv().unwrap(), BufferRelease { buffer: a });
        assert_eq!(server.presented().len(), 2);
    }

    #[test]
    fn test_unpresented_commit_released_at_replacing_commit() {
        let (mut compositor, mut events) = LoopbackCompositor::new(LoopbackConfig::default());
        let surface = compositor.create_surface().unwrap();
        let (_a, a) = import(&mut compositor, 2, 2, 1);
        let (_b, b) = import(&mut compositor, 2, 2, 2);

        compositor.submit_pixel_buffer(surface, a, 0, 0).unwrap();
        compositor.commit(surface).unwrap();
        compositor.submit_pixel_buffer(surface, b, 0, 0).unwrap();
        compositor.commit(surface).unwrap();

        assert_eq!(events.releases.try_recv().unwrap(), BufferRelease { buffer: a });
    }

    #[test]
    fn test_unknown_objects_rejected() {
        let (mut compositor, _events) = LoopbackCompositor::new(LoopbackConfig::default());
        let surface = compositor.create_surface().unwrap();
        assert!(matches!(
            compositor.submit_pixel_buffer(surface, BufferId(77), 0, 0),
            Err(CompositorError::UnknownBuffer(BufferId(77)))
        ));
        assert!(matches!(
            compositor.commit(SurfaceId(99)),
            Err(CompositorError::UnknownSurface(SurfaceId(99)))
        ));
    }

    #[test]
    fn test_disconnect_closes_channels() {
        let (mut compositor, mut events) = LoopbackCompositor::new(LoopbackConfig::default());
        let server = compositor.server();
        server.disconnect();

        assert!(!server.is_connected());
        assert!(matches!(
            compositor.create_surface(),
            Err(CompositorError::Disconnected)
        ));
        assert!(matches!(
            events.ticks.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
