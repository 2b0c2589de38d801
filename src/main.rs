//! CLI entry point for the acquisition engine.
//!
//! Three subcommands cover the supported modes:
//!
//! - `online` — live acquisition from the network front end for a fixed
//!   duration, then a clean end-of-run handshake.
//! - `replay` — offline replay of recorded event files through the sort
//!   routine.
//! - `simulate` — run a mock front end against a receiver, for exercising
//!   the pipeline without hardware.
//!
//! The built-in demo routine accumulates a one-dimensional spectrum; real
//! deployments link their own [`SortRoutine`](nudaq::sort::SortRoutine).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nudaq::codec::StreamFormat;
use nudaq::config::Settings;
use nudaq::mock::{MockFrontEnd, SpectrumRoutine};
use nudaq::pipeline::{OfflinePipeline, OnlinePipeline};
use nudaq::run::NullController;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "nudaq")]
#[command(about = "Event-stream acquisition and sorting engine", long_about = None)]
struct Cli {
    /// Path to a TOML settings file (default: config/default.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire live data from the network front end.
    Online {
        /// Run title recorded in the output header.
        title: String,

        /// Stream format of the front end.
        #[arg(long, default_value = "l002")]
        format: StreamFormat,

        /// Run number for the first run.
        #[arg(long, default_value_t = 1)]
        run_number: u32,

        /// Parameters per event.
        #[arg(long, default_value_t = 16)]
        event_size: usize,

        /// How long to acquire before ending the run.
        #[arg(long, default_value_t = 10)]
        duration_secs: u64,
    },

    /// Replay recorded event files through the sort routine.
    Replay {
        /// Event files, replayed in order.
        files: Vec<PathBuf>,

        /// Stream format of the files.
        #[arg(long, default_value = "l002")]
        format: StreamFormat,

        /// Parameters per event.
        #[arg(long, default_value_t = 16)]
        event_size: usize,

        /// Title for the replay session.
        #[arg(long, default_value = "replay")]
        title: String,
    },

    /// Send synthetic buffers to a receiver.
    Simulate {
        /// Receiver address to send to.
        target: SocketAddr,

        /// Stream format to encode.
        #[arg(long, default_value = "l002")]
        format: StreamFormat,

        /// Parameters per event.
        #[arg(long, default_value_t = 16)]
        event_size: usize,

        /// Number of buffers to send.
        #[arg(long, default_value_t = 100)]
        buffers: u64,

        /// Events per buffer.
        #[arg(long, default_value_t = 32)]
        events: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => Settings::new(None).context("loading default settings")?,
    };
    nudaq::logging::init_from_settings(&settings);

    match cli.command {
        Commands::Online {
            title,
            format,
            run_number,
            event_size,
            duration_secs,
        } => online(settings, &title, format, run_number, event_size, duration_secs),
        Commands::Replay {
            files,
            format,
            event_size,
            title,
        } => replay(settings, files, format, event_size, &title),
        Commands::Simulate {
            target,
            format,
            event_size,
            buffers,
            events,
        } => simulate(&settings, target, format, event_size, buffers, events),
    }
}

fn online(
    settings: Settings,
    title: &str,
    format: StreamFormat,
    run_number: u32,
    event_size: usize,
    duration_secs: u64,
) -> Result<()> {
    let mut pipeline = OnlinePipeline::start(
        settings,
        format,
        Box::new(SpectrumRoutine::new(event_size)),
        Box::new(NullController),
        run_number,
    )
    .context("assembling online pipeline")?;
    info!(addr = %pipeline.receiver_addr(), "waiting for front-end data");

    let ctx = pipeline.begin_run(title)?;
    std::thread::sleep(Duration::from_secs(duration_secs));

    pipeline.end_run(
        || info!(run = ctx.number, "stop command issued to front end"),
        || false,
    )?;
    let stats = pipeline.stats();
    info!(?stats, "run finished");
    pipeline.shutdown();
    Ok(())
}

fn replay(
    settings: Settings,
    files: Vec<PathBuf>,
    format: StreamFormat,
    event_size: usize,
    title: &str,
) -> Result<()> {
    let mut pipeline = OfflinePipeline::start(
        settings,
        format,
        Box::new(SpectrumRoutine::new(event_size)),
        Box::new(NullController),
        files,
    )
    .context("assembling offline pipeline")?;

    pipeline.begin(title)?;
    pipeline.wait_complete(Duration::from_millis(100), || false);
    pipeline.finish()?;
    let stats = pipeline.stats();
    info!(?stats, "replay finished");
    pipeline.shutdown();
    Ok(())
}

fn simulate(
    settings: &Settings,
    target: SocketAddr,
    format: StreamFormat,
    event_size: usize,
    buffers: u64,
    events: usize,
) -> Result<()> {
    let mut frontend = MockFrontEnd::connect(
        target,
        format,
        event_size,
        settings.storage.record_length,
    )
    .context("connecting mock front end")?;

    for _ in 0..buffers {
        frontend.send_buffer(events)?;
        std::thread::sleep(Duration::from_millis(20));
    }
    frontend.send_run_end()?;
    info!(buffers, events_per_buffer = events, "simulation complete");
    Ok(())
}
