//! sinkwatch_client - capture endpoint
//!
//! Captures frames, ships them to sinkwatchd one at a time, and turns the
//! results into a debounced attended/unattended state with spoken-style alerts
//! written to the log.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sinkwatch::capture::{DirectoryConfig, DirectorySource, FrameSource, SyntheticConfig, SyntheticSource};
use sinkwatch::config::ClientSettings;
use sinkwatch::detect::classes;
use sinkwatch::tracker::LogAlertSink;
use sinkwatch::ui::{Ui, UiMode};
use sinkwatch::{
    spawn_capture, ConnectionError, ConnectionManager, StateTracker, TcpConnector, TransportError,
};

const REPORT_EVERY: u64 = 30;
const CAPTURE_WAIT: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON or TOML config file.
    #[arg(long, env = "SINKWATCH_CLIENT_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
    /// Server IP or host name (required unless set in config or environment).
    #[arg(long)]
    server: Option<String>,
    /// Server port (default 8888).
    #[arg(long)]
    port: Option<u16>,
    /// Camera index.
    #[arg(long)]
    camera: Option<u32>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    /// Replay image files from this directory instead of the camera.
    #[arg(long, value_name = "DIR")]
    image_dir: Option<PathBuf>,
    /// Classification policy: presence or proximity.
    #[arg(long)]
    policy: Option<String>,
    /// Stop after this many answered frames.
    #[arg(long)]
    frames: Option<u64>,
    #[arg(long, value_enum, default_value = "auto")]
    ui: UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::detect(args.ui);

    let settings = {
        let _stage = ui.step(1, 4, "Loading configuration");
        load_settings(&args)?
    };

    let capture = {
        let _stage = ui.step(2, 4, "Opening camera");
        let source: Box<dyn FrameSource> = match &settings.image_dir {
            Some(dir) => {
                let (width, height) = settings.frame_size();
                Box::new(DirectorySource::new(DirectoryConfig {
                    path: dir.clone(),
                    width,
                    height,
                    interval: frame_interval(settings.target_fps),
                }))
            }
            None => {
                let (width, height) = settings.frame_size();
                Box::new(SyntheticSource::new(SyntheticConfig {
                    camera: settings.camera,
                    width,
                    height,
                    target_fps: settings.target_fps,
                }))
            }
        };
        spawn_capture(source, 1)?
    };

    let mut tracker = {
        let _stage = ui.step(3, 4, "Building state tracker");
        StateTracker::new(settings.tracker.clone(), settings.policy(), LogAlertSink)?
    };

    let target = settings.target();
    let manager = Arc::new(
        ConnectionManager::new(
            TcpConnector::new(target.clone(), settings.connect_timeout, settings.io_timeout),
            settings.backoff.clone(),
        )
        .with_max_payload(settings.max_payload),
    );
    {
        let stage = ui.step(4, 4, &format!("Connecting to {}", target));
        if let Err(err) = manager.connect() {
            stage.fail();
            log::warn!("server not reachable yet ({}); will keep retrying", err);
        }
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        let manager = Arc::clone(&manager);
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
            manager.close();
        })
        .expect("error setting Ctrl-C handler");
    }

    log::info!("sinkwatch_client running; press Ctrl-C to stop");
    let mut answered = 0u64;
    let mut capture_failed = false;
    while running.load(Ordering::SeqCst) {
        let frame = match capture.next_frame(CAPTURE_WAIT) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(err) => {
                log::error!("{:#}", err);
                capture_failed = true;
                break;
            }
        };

        let result = match manager.send_frame(&frame) {
            Ok(result) => result,
            Err(TransportError::Closed) => break,
            Err(TransportError::Connection(ConnectionError::RetriesExhausted { attempts, .. })) => {
                log::warn!(
                    "server unreachable after {} attempts ({}); retrying with the next frame",
                    attempts,
                    manager.state()
                );
                continue;
            }
            Err(err) => {
                log::warn!("frame {} dropped: {}", frame.seq(), err);
                continue;
            }
        };

        answered += 1;
        let update = tracker.update(&result, Instant::now());
        if answered % REPORT_EVERY == 0 {
            let utensils = result.detections.iter().filter(|d| classes::is_utensil(d.class_id)).count();
            let hands = result.detections.iter().filter(|d| classes::is_hand(d.class_id)).count();
            log::info!(
                "FPS {:.1} | round trip {}ms | state {} | utensils {} | hands {} | dropped {}",
                manager.fps(),
                result.latency.as_millis(),
                update.state,
                utensils,
                hands,
                capture.dropped()
            );
        }
        if args.frames.is_some_and(|limit| answered >= limit) {
            break;
        }
    }

    log::info!("shutting down after {} frames", answered);
    manager.close();
    capture.stop()?;
    if capture_failed {
        return Err(anyhow!("capture device stopped delivering frames"));
    }
    Ok(())
}

fn load_settings(args: &Args) -> Result<ClientSettings> {
    let mut settings = ClientSettings::from_sources(args.config.as_deref())?;
    if let Some(server) = &args.server {
        settings.server = server.clone();
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(camera) = args.camera {
        settings.camera = camera;
    }
    if let Some(width) = args.width {
        settings.width = width;
    }
    if let Some(height) = args.height {
        settings.height = height;
    }
    if let Some(dir) = &args.image_dir {
        settings.image_dir = Some(dir.clone());
    }
    if let Some(policy) = &args.policy {
        settings.policy.kind = policy.parse()?;
    }
    settings.validate()?;
    Ok(settings)
}

fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(1.0 / f64::from(target_fps))
    }
}
