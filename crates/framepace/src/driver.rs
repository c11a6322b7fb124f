//! The event loop that paces a [`Window`].
//!
//! Releases and ticks arrive on separate channels. The loop selects over
//! both with releases polled first, so a release that was sent before a
//! tick is always applied before the redraw that tick triggers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

use crate::FrameError;
use crate::compositor::{Compositor, EventStreams};
use crate::window::Window;

/// Shared "keep running" flag.
///
/// Cloned into whatever may stop the loop: a signal handler, a vsync task,
/// a test. Once stopped it stays stopped.
#[derive(Debug, Clone)]
pub struct RunFlag {
    inner: Arc<RunFlagInner>,
}

#[derive(Debug)]
struct RunFlagInner {
    running: AtomicBool,
    notify: Notify,
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl RunFlag {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RunFlagInner {
                running: AtomicBool::new(true),
                notify: Notify::new(),
            }),
        }
    }

    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::AcqRel) {
            tracing::debug!("stop requested");
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        loop {
            // Register before checking so a concurrent stop is not missed.
            let notified = self.inner.notify.notified();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }
}

/// Why [`run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverExit {
    /// The run flag was cleared.
    Stopped,
    /// The requested number of frames was committed.
    FrameLimit,
    /// The compositor closed its event channels.
    Disconnected,
}

/// Summary of one [`run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverReport {
    pub exit: DriverExit,
    /// Frames committed by the window in total.
    pub frames: u64,
    pub releases: u64,
    /// Ticks that did not match the outstanding request.
    pub stale_ticks: u64,
}

/// Drive `window` until stopped, disconnected, or `frame_limit` frames have
/// been committed.
///
/// Draws the first frame synchronously if the window has not drawn yet;
/// after that every frame is triggered by a tick. Any [`FrameError`] ends
/// the loop.
pub async fn run<C: Compositor + ?Sized>(
    window: &mut Window,
    compositor: &mut C,
    events: &mut EventStreams,
    running: &RunFlag,
    frame_limit: Option<u64>,
) -> Result<DriverReport, FrameError> {
    if window.frames() == 0 {
        window.redraw(compositor, 0)?;
    }

    let mut releases = 0;
    let mut stale_ticks = 0;

    let exit = loop {
        if !running.is_running() {
            break DriverExit::Stopped;
        }
        if frame_limit.is_some_and(|limit| window.frames() >= limit) {
            break DriverExit::FrameLimit;
        }

        tokio::select! {
            biased;

            release = events.releases.recv() => match release {
                Some(release) => {
                    window.handle_release(release);
                    releases += 1;
                }
                None => break DriverExit::Disconnected,
            },
            tick = events.ticks.recv() => match tick {
                Some(tick) => {
                    if !window.handle_tick(compositor, tick)? {
                        stale_ticks += 1;
                    }
                }
                None => break DriverExit::Disconnected,
            },
            _ = running.stopped() => break DriverExit::Stopped,
        }
    };

    let report = DriverReport {
        exit,
        frames: window.frames(),
        releases,
        stale_ticks,
    };
    tracing::info!(
        exit = ?report.exit,
        frames = report.frames,
        releases = report.releases,
        "frame loop finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowConfig;
    use crate::loopback::{LoopbackCompositor, LoopbackConfig};

    #[tokio::test]
    async fn test_stopped_resolves_after_stop() {
        let flag = RunFlag::new();
        assert!(flag.is_running());

        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.stopped().await })
        };
        tokio::task::yield_now().await;
        flag.stop();
        waiter.await.unwrap();

        assert!(!flag.is_running());
        // Already stopped: resolves immediately.
        flag.stopped().await;
    }

    #[tokio::test]
    async fn test_stop_before_run_draws_one_frame() {
        let (mut compositor, mut events) = LoopbackCompositor::new(LoopbackConfig::default());
        let mut window = Window::create(&mut compositor, WindowConfig::default()).unwrap();
        let flag = RunFlag::new();
        flag.stop();

        let report = run(&mut window, &mut compositor, &mut events, &flag, None)
            .await
            .unwrap();
        assert_eq!(report.exit, DriverExit::Stopped);
        assert_eq!(report.frames, 1);
    }

    #[tokio::test]
    async fn test_disconnect_ends_loop() {
        let (mut compositor, mut events) = LoopbackCompositor::new(LoopbackConfig::default());
        let mut window = Window::create(&mut compositor, WindowConfig::default()).unwrap();
        window.redraw(&mut compositor, 0).unwrap();
        compositor.server().disconnect();

        let report = run(&mut window, &mut compositor, &mut events, &RunFlag::new(), None)
            .await
            .unwrap();
        assert_eq!(report.exit, DriverExit::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_to_frame_limit_under_vsync() {
        let (mut compositor, mut events) = LoopbackCompositor::new(LoopbackConfig::default());
        let server = compositor.server();
        let mut window = Window::create(&mut compositor, WindowConfig::default()).unwrap();

        let flag = RunFlag::new();
        let vsync = tokio::spawn({
            let flag = flag.clone();
            async move { server.run_vsync(flag).await }
        });

        let report = run(&mut window, &mut compositor, &mut events, &flag, Some(10))
            .await
            .unwrap();
        flag.stop();
        vsync.await.unwrap();

        assert_eq!(report.exit, DriverExit::FrameLimit);
        assert_eq!(report.frames, 10);
        assert_eq!(report.stale_ticks, 0);
        // One buffer on screen, at most one committed behind it.
        assert!(window.pool().busy_count() <= 2);
        assert!(report.releases >= 8);
    }
}
