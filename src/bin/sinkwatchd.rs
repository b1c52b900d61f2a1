//! sinkwatchd - detection server
//!
//! Listens for capture clients, runs the configured detector on every FRAME
//! and answers with a RESULT carrying the same sequence number.

use anyhow::Result;
use clap::Parser;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use sinkwatch::config::ServerSettings;
use sinkwatch::error::ResourceError;
use sinkwatch::ui::{Ui, UiMode};
use sinkwatch::{BackendRegistry, DetectionServer};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON or TOML config file.
    #[arg(long, env = "SINKWATCH_SERVER_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
    /// Interface to bind (default 0.0.0.0, all interfaces).
    #[arg(long)]
    host: Option<String>,
    /// TCP port (default 8888).
    #[arg(long)]
    port: Option<u16>,
    /// Detector backend name.
    #[arg(long)]
    backend: Option<String>,
    /// ONNX model for the tract backend.
    #[arg(long, value_name = "PATH")]
    model: Option<PathBuf>,
    /// Seconds between aggregate throughput log lines.
    #[arg(long, default_value_t = 10)]
    stats_secs: u64,
    #[arg(long, value_enum, default_value = "auto")]
    ui: UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::detect(args.ui);

    let settings = {
        let _stage = ui.step(1, 3, "Loading configuration");
        load_settings(&args)?
    };

    let registry = {
        let _stage = ui.step(2, 3, "Preparing detector backend");
        build_registry(&settings)?
    };

    let handle = {
        let _stage = ui.step(3, 3, "Starting detection server");
        DetectionServer::new(settings.server_config(), registry).spawn()?
    };

    log::info!(
        "sinkwatchd listening on {} (backend '{}')",
        handle.addr,
        settings.backend
    );
    if let Some(ip) = local_ip_hint() {
        log::info!("clients on this network can connect to {}:{}", ip, handle.addr.port());
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("sinkwatchd waiting for shutdown signal (Ctrl-C)...");
    let interval = Duration::from_secs(args.stats_secs.max(1));
    loop {
        match rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                let stats = handle.stats();
                if stats.frames > 0 || stats.active_connections > 0 {
                    log::info!(
                        "clients {} | frames {} | FPS {:.1} | latency {:.1}ms (mean {:.1}ms) | detector failures {}",
                        stats.active_connections,
                        stats.frames,
                        stats.fps,
                        stats.rolling_latency.as_secs_f64() * 1000.0,
                        stats.mean_latency.as_secs_f64() * 1000.0,
                        stats.detector_failures
                    );
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    log::info!("shutdown signal received, stopping server...");
    let stats = handle.stats();
    handle.stop()?;
    log::info!(
        "served {} frames over {} connections",
        stats.frames,
        stats.total_connections
    );
    Ok(())
}

fn load_settings(args: &Args) -> Result<ServerSettings> {
    let mut settings = ServerSettings::from_sources(args.config.as_deref())?;
    if let Some(host) = &args.host {
        settings.host = host.clone();
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(backend) = &args.backend {
        settings.backend = backend.clone();
    }
    if let Some(path) = &args.model {
        let (width, height) = settings
            .model
            .as_ref()
            .map(|m| (m.width, m.height))
            .unwrap_or((640, 640));
        settings.model = Some(sinkwatch::config::ModelSettings {
            path: path.clone(),
            width,
            height,
        });
    }
    settings.validate()?;
    Ok(settings)
}

fn build_registry(settings: &ServerSettings) -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::with_builtin();
    register_model_backend(&mut registry, settings);
    if !registry.contains(&settings.backend) {
        return Err(ResourceError::Detector {
            backend: settings.backend.clone(),
            reason: format!("not available (available: {})", registry.list().join(", ")),
        }
        .into());
    }
    Ok(registry)
}

#[cfg(feature = "backend-tract")]
fn register_model_backend(registry: &mut BackendRegistry, settings: &ServerSettings) {
    use sinkwatch::detect::backends::TractBackend;
    use sinkwatch::detect::{classes, DetectorBackend};

    let Some(model) = settings.model.clone() else {
        return;
    };
    let mut keep = vec![classes::PERSON];
    keep.extend_from_slice(classes::UTENSILS);
    registry.register("tract", move || {
        let backend = TractBackend::new(&model.path, model.width, model.height)?.with_classes(&keep);
        Ok(Box::new(backend) as Box<dyn DetectorBackend>)
    });
}

#[cfg(not(feature = "backend-tract"))]
fn register_model_backend(_registry: &mut BackendRegistry, settings: &ServerSettings) {
    if let Some(model) = &settings.model {
        log::warn!(
            "model {} ignored: built without the backend-tract feature",
            model.path.display()
        );
    }
}

/// Address of the interface that routes outward. No packet is sent.
fn local_ip_hint() -> Option<std::net::IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}
