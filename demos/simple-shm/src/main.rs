//! simple-shm: an animated window paced by frame callbacks.
//!
//! Runs the frame pipeline against the in-process loopback compositor, which
//! presents at a fixed refresh rate. Stops on Ctrl-C or after `--frames`.
//!
//! ```bash
//! RUST_LOG=framepace=trace simple-shm --frames 120
//! ```

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use framepace::loopback::{LoopbackCompositor, LoopbackConfig};
use framepace::{FrameError, RunFlag, Window, WindowConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "simple-shm")]
#[command(about = "Animated shared-memory window driven by compositor frame ticks")]
struct Args {
    /// Window width in pixels
    #[arg(long, default_value_t = framepace::DEFAULT_WIDTH)]
    width: u32,

    /// Window height in pixels
    #[arg(long, default_value_t = framepace::DEFAULT_HEIGHT)]
    height: u32,

    /// Stop after this many frames (runs until Ctrl-C otherwise)
    #[arg(long)]
    frames: Option<u64>,

    /// Presentation rate of the loopback compositor
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u32).range(1..=1000))]
    refresh_hz: u32,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    let args = Args::parse();

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to create runtime");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "simple-shm failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), FrameError> {
    let config = WindowConfig {
        width: args.width,
        height: args.height,
        ..WindowConfig::default()
    };

    let running = RunFlag::new();
    let (mut compositor, mut events) = LoopbackCompositor::new(LoopbackConfig {
        refresh: Duration::from_secs(1) / args.refresh_hz,
        ..LoopbackConfig::default()
    });

    let server = compositor.server();
    let vsync = tokio::spawn({
        let running = running.clone();
        async move { server.run_vsync(running).await }
    });

    tokio::spawn({
        let running = running.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted");
                running.stop();
            }
        }
    });

    let mut window = Window::create(&mut compositor, config)?;
    let result = framepace::run(
        &mut window,
        &mut compositor,
        &mut events,
        &running,
        args.frames,
    )
    .await;

    running.stop();
    if let Err(e) = vsync.await {
        tracing::warn!(error = %e, "vsync task failed");
    }
    window.destroy(&mut compositor);

    tracing::info!("simple-shm exiting");
    let report = result?;
    tracing::debug!(?report, "frame loop report");
    Ok(())
}
