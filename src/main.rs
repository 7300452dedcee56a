//! `capture-meter`: record from the microphone for a few seconds and log the
//! session clock and input level.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`AppConfig`] (explicit `--config` path or the platform default).
//! 3. Open the cpal input device and bind a [`CaptureSource`] to it.
//! 4. Spawn the consumer thread, which reads buffers and reports every
//!    `meter.report_every` of them.
//! 5. Sleep for the capture length, then stop the source and log totals.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pcm_capture::{
    audio::{CaptureDevice, CaptureSource, CpalDevice, ReadOptions, SourceError},
    config::AppConfig,
};

#[derive(Parser, Debug)]
#[command(name = "capture-meter", version, about = "Timestamped microphone capture meter")]
struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Capture length in seconds (defaults to meter.default_seconds)
    #[arg(short, long)]
    seconds: Option<u64>,
}

/// Drain the source until it stops, logging one line per `report_every`
/// buffers.  Returns the number of buffers consumed.
fn consume<D: CaptureDevice>(source: &CaptureSource<D>, report_every: u64) -> u64 {
    let report_every = report_every.max(1);
    let options = ReadOptions::default();
    let mut count = 0_u64;

    // The first query switches amplitude tracking on.
    source.max_amplitude();

    loop {
        let buffer = match source.read(&options) {
            Ok(Some(buffer)) => buffer,
            Ok(None) => break,
            Err(SourceError::DeviceReadError(e)) => {
                log::warn!("read failed ({e}); retrying");
                thread::sleep(Duration::from_millis(10));
                continue;
            }
            Err(e) => {
                log::error!("capture failed: {e}");
                break;
            }
        };

        count += 1;
        let meta = *buffer.meta();
        let len = buffer.len();
        buffer.release();

        if let Some(anchor) = meta.anchor_time_us {
            log::info!("session anchored at {anchor} us");
        }
        if count % report_every == 0 {
            log::info!(
                "buffer {count}: {len} bytes @ {} us, drift {} us, peak {}",
                meta.time_us,
                meta.drift_time_us,
                source.max_amplitude()
            );
        }
    }
    count
}

fn main() -> Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    // 2. Config
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => AppConfig::load().unwrap_or_else(|e| {
            log::warn!("Failed to load config ({e}); using defaults");
            AppConfig::default()
        }),
    };
    let seconds = cli.seconds.unwrap_or(config.meter.default_seconds);

    // 3. Device + source
    let device = CpalDevice::new(&config.device).context("failed to open input device")?;
    let source = Arc::new(
        CaptureSource::new(device, &config.capture).context("failed to bind capture source")?,
    );
    let format = source.format();
    log::info!(
        "capturing {seconds}s at {} Hz, {} ch ({:?} mode, {} byte buffers)",
        format.sample_rate,
        format.channels,
        source.mode(),
        format.max_buffer_size
    );

    source
        .start(&config.capture.start_options())
        .context("failed to start capture")?;

    // 4. Consumer
    let consumer = {
        let source = Arc::clone(&source);
        let report_every = config.meter.report_every;
        thread::Builder::new()
            .name("capture-consumer".into())
            .spawn(move || consume(&source, report_every))
            .context("failed to spawn consumer thread")?
    };

    // 5. Run, stop, report
    thread::sleep(Duration::from_secs(seconds));
    source.stop().context("failed to stop capture")?;

    let buffers = consumer
        .join()
        .map_err(|_| anyhow::anyhow!("consumer thread panicked"))?;
    let stats = source.stats();
    log::info!(
        "captured {buffers} buffers, {} frames ({} lost, {} dropped buffers)",
        stats.frames_received,
        stats.total_lost_frames,
        stats.buffers_dropped
    );
    Ok(())
}
