//! stream_view - headless source-timed stream viewer
//!
//! This binary:
//! 1. Loads configuration (file + env), then applies CLI overrides
//! 2. Starts an acquisition session against the configured stream
//! 3. Drains presented images on a separate presentation thread
//! 4. Logs throughput periodically
//! 5. Stops on Ctrl-C, on stream end, or after `--seconds`

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use stream_pacer::{AcquisitionLoop, ChannelSink, ColorSpace, ExitReason, ViewerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Stream uri (overrides config and STREAM_PACER_URI).
    #[arg(long)]
    uri: Option<String>,
    /// Display color space: gray, bgr or bgra.
    #[arg(long)]
    color_space: Option<ColorSpace>,
    /// Stop after this many seconds.
    #[arg(long)]
    seconds: Option<u64>,
    /// End synthetic streams after this many frames.
    #[arg(long)]
    frame_limit: Option<u64>,
}

enum Control {
    Interrupted,
    SessionEnded(ExitReason),
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = ViewerConfig::load()?;
    if let Some(uri) = args.uri {
        config.source.uri = uri;
    }
    if let Some(space) = args.color_space {
        config.display_space = space;
    }
    if args.frame_limit.is_some() {
        config.source.frame_limit = args.frame_limit;
    }
    config.validate()?;

    let (sink, images) = ChannelSink::new(config.queue_depth);
    let sink = Arc::new(sink);
    let presenter = std::thread::Builder::new()
        .name("stream-view-present".to_string())
        .spawn(move || {
            let mut shown = 0u64;
            for image in images {
                if shown == 0 {
                    log::info!(
                        "first image: {}x{} {}",
                        image.width(),
                        image.height(),
                        image.space()
                    );
                }
                shown += 1;
            }
            shown
        })?;

    let (tx, rx) = mpsc::channel();
    let interrupt_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(Control::Interrupted);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let mut acquisition = AcquisitionLoop::from_config(&config, sink.clone());
    acquisition.on_session_end(move |exit| {
        let _ = tx.send(Control::SessionEnded(exit.reason.clone()));
    });
    acquisition.start()?;
    log::info!(
        "stream_view running: {} -> {}",
        config.source.uri,
        config.display_space
    );

    let deadline = args
        .seconds
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut next_health_log = Instant::now() + config.health_log_interval;
    loop {
        let now = Instant::now();
        let Some(wait) = wait_budget(next_health_log, deadline, now) else {
            log::info!("run time elapsed, stopping acquisition...");
            break;
        };
        match rx.recv_timeout(wait) {
            Ok(Control::Interrupted) => {
                log::info!("shutdown signal received, stopping acquisition...");
                break;
            }
            Ok(Control::SessionEnded(reason)) => {
                if let ExitReason::Failed(err) = reason {
                    log::warn!("session ended: {}", err);
                }
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                if Instant::now() < next_health_log {
                    continue;
                }
                let snapshot = acquisition.rate_snapshot();
                log::info!(
                    "rate {:.2} fps (expected {:.2}), presented {}, dropped by sink {}",
                    snapshot.fps,
                    snapshot.expected_fps.unwrap_or_default(),
                    snapshot.total_ticks,
                    sink.dropped()
                );
                next_health_log = Instant::now() + config.health_log_interval;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    acquisition.stop();
    let report = acquisition.last_exit().map(|exit| exit.report);
    drop(acquisition);
    drop(sink);

    let shown = presenter
        .join()
        .map_err(|_| anyhow!("presentation thread panicked"))?;
    if let Some(report) = report {
        log::info!(
            "done: presented={} skipped={} shown={}",
            report.frames_presented,
            report.frames_skipped,
            shown
        );
    }
    Ok(())
}

/// How long to block before the next health line or the run deadline,
/// whichever comes first. `None` once the deadline has passed.
fn wait_budget(
    next_health_log: Instant,
    deadline: Option<Instant>,
    now: Instant,
) -> Option<Duration> {
    let until = match deadline {
        Some(deadline) if now >= deadline => return None,
        Some(deadline) => deadline.min(next_health_log),
        None => next_health_log,
    };
    Some(until.saturating_duration_since(now))
}
