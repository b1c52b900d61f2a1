use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::client::BackoffPolicy;
use crate::server::ServerConfig;
use crate::tracker::{Policy, PolicyKind, TrackerConfig, DEFAULT_MIN_CONFIDENCE, DEFAULT_PROXIMITY_MARGIN};
use crate::wire::DEFAULT_MAX_PAYLOAD;
use crate::DEFAULT_PORT;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SERVER_IO_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_STATS_EVERY: u64 = 30;
const DEFAULT_MODEL_SIZE: u32 = 640;

const DEFAULT_CAMERA: u32 = 0;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_TARGET_FPS: u32 = 30;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_IO_TIMEOUT_MS: u64 = 5_000;

pub const SERVER_CONFIG_ENV: &str = "SINKWATCH_SERVER_CONFIG";
pub const CLIENT_CONFIG_ENV: &str = "SINKWATCH_CLIENT_CONFIG";

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    host: Option<String>,
    port: Option<u16>,
    backend: Option<String>,
    max_payload: Option<u32>,
    poll_interval_ms: Option<u64>,
    idle_timeout_secs: Option<u64>,
    io_timeout_ms: Option<u64>,
    stats_every: Option<u64>,
    model: Option<ModelConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    path: Option<PathBuf>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ClientConfigFile {
    server: Option<String>,
    port: Option<u16>,
    camera: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    image_dir: Option<PathBuf>,
    target_fps: Option<u32>,
    connect_timeout_ms: Option<u64>,
    io_timeout_ms: Option<u64>,
    max_payload: Option<u32>,
    backoff: Option<BackoffConfigFile>,
    tracker: Option<TrackerConfigFile>,
    policy: Option<PolicyConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct BackoffConfigFile {
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    multiplier: Option<f64>,
    max_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    window: Option<usize>,
    majority: Option<usize>,
    cooldown_ms: Option<u64>,
    repeat_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PolicyConfigFile {
    kind: Option<PolicyKind>,
    min_confidence: Option<f32>,
    margin: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub backend: String,
    pub max_payload: u32,
    pub poll_interval: Duration,
    pub idle_timeout: Duration,
    /// Stall limit inside a message and socket write timeout.
    pub io_timeout: Duration,
    pub stats_every: u64,
    pub model: Option<ModelSettings>,
}

/// ONNX model for the `tract` backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

impl ServerSettings {
    /// Defaults, then the file named by `SINKWATCH_SERVER_CONFIG`, then
    /// `SINKWATCH_*` environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var(SERVER_CONFIG_ENV).ok().map(PathBuf::from);
        let mut cfg = Self::from_sources(path.as_deref())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults, then `path` if given, then environment overrides. Not
    /// validated, so callers can layer CLI flags on top first.
    pub fn from_sources(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        Ok(cfg)
    }

    fn from_file(file: ServerConfigFile) -> Self {
        let model = file.model.and_then(|model| {
            model.path.map(|path| ModelSettings {
                path,
                width: model.width.unwrap_or(DEFAULT_MODEL_SIZE),
                height: model.height.unwrap_or(DEFAULT_MODEL_SIZE),
            })
        });
        Self {
            host: file.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: file.port.unwrap_or(DEFAULT_PORT),
            backend: file.backend.unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
            max_payload: file.max_payload.unwrap_or(DEFAULT_MAX_PAYLOAD),
            poll_interval: Duration::from_millis(
                file.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            idle_timeout: Duration::from_secs(
                file.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
            ),
            io_timeout: Duration::from_millis(
                file.io_timeout_ms.unwrap_or(DEFAULT_SERVER_IO_TIMEOUT_MS),
            ),
            stats_every: file.stats_every.unwrap_or(DEFAULT_STATS_EVERY),
            model,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(host) = env_string("SINKWATCH_HOST") {
            self.host = host;
        }
        if let Some(port) = env_parse("SINKWATCH_PORT", "a port number")? {
            self.port = port;
        }
        if let Some(backend) = env_string("SINKWATCH_BACKEND") {
            self.backend = backend;
        }
        if let Some(max) = env_parse("SINKWATCH_MAX_PAYLOAD", "a byte count")? {
            self.max_payload = max;
        }
        if let Some(secs) = env_parse("SINKWATCH_IDLE_TIMEOUT_SECS", "an integer number of seconds")? {
            self.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(every) = env_parse("SINKWATCH_STATS_EVERY", "an integer frame count")? {
            self.stats_every = every;
        }
        if let Some(path) = env_string("SINKWATCH_MODEL_PATH") {
            let (width, height) = self
                .model
                .as_ref()
                .map(|m| (m.width, m.height))
                .unwrap_or((DEFAULT_MODEL_SIZE, DEFAULT_MODEL_SIZE));
            self.model = Some(ModelSettings {
                path: PathBuf::from(path),
                width,
                height,
            });
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        self.host = self.host.trim().to_string();
        self.backend = self.backend.trim().to_lowercase();
        if self.host.is_empty() {
            return Err(anyhow!("bind host must not be empty"));
        }
        if self.backend.is_empty() {
            return Err(anyhow!("detector backend name must not be empty"));
        }
        if self.max_payload == 0 {
            return Err(anyhow!("max_payload must be greater than zero"));
        }
        if self.poll_interval.is_zero() || self.io_timeout.is_zero() {
            return Err(anyhow!("server poll interval and io timeout must be non-zero"));
        }
        if self.idle_timeout < self.poll_interval {
            return Err(anyhow!("idle timeout must be at least the poll interval"));
        }
        if let Some(model) = &self.model {
            if model.width == 0 || model.height == 0 {
                return Err(anyhow!("model input dimensions must be non-zero"));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            addr: self.bind_addr(),
            backend: self.backend.clone(),
            max_payload: self.max_payload,
            poll_interval: self.poll_interval,
            idle_timeout: self.idle_timeout,
            io_timeout: self.io_timeout,
            stats_every: self.stats_every,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Server host name or IP; may carry its own `:port`.
    pub server: String,
    pub port: u16,
    pub camera: u32,
    pub width: u32,
    pub height: u32,
    /// Replay images from this directory instead of generating frames.
    pub image_dir: Option<PathBuf>,
    pub target_fps: u32,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub max_payload: u32,
    pub backoff: BackoffPolicy,
    pub tracker: TrackerConfig,
    pub policy: PolicySettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicySettings {
    pub kind: PolicyKind,
    pub min_confidence: f32,
    pub margin: f32,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            kind: PolicyKind::Presence,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            margin: DEFAULT_PROXIMITY_MARGIN,
        }
    }
}

impl ClientSettings {
    /// Defaults, then the file named by `SINKWATCH_CLIENT_CONFIG`, then
    /// `SINKWATCH_*` environment overrides. The server address has no default.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CLIENT_CONFIG_ENV).ok().map(PathBuf::from);
        let mut cfg = Self::from_sources(path.as_deref())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults, then `path` if given, then environment overrides. Not
    /// validated, so callers can layer CLI flags on top first.
    pub fn from_sources(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        Ok(cfg)
    }

    fn from_file(file: ClientConfigFile) -> Self {
        let backoff_file = file.backoff.unwrap_or_default();
        let defaults = BackoffPolicy::default();
        let backoff = BackoffPolicy {
            max_attempts: backoff_file.max_attempts.unwrap_or(defaults.max_attempts),
            base_delay: backoff_file
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            multiplier: backoff_file.multiplier.unwrap_or(defaults.multiplier),
            max_delay: backoff_file
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
        };

        let tracker_file = file.tracker.unwrap_or_default();
        let tracker_defaults = TrackerConfig::default();
        let tracker = TrackerConfig {
            window: tracker_file.window.unwrap_or(tracker_defaults.window),
            majority: tracker_file.majority.unwrap_or(tracker_defaults.majority),
            cooldown: tracker_file
                .cooldown_ms
                .map(Duration::from_millis)
                .unwrap_or(tracker_defaults.cooldown),
            repeat_interval: tracker_file.repeat_interval_ms.map(Duration::from_millis),
        };

        let policy_file = file.policy.unwrap_or_default();
        let policy_defaults = PolicySettings::default();
        let policy = PolicySettings {
            kind: policy_file.kind.unwrap_or(policy_defaults.kind),
            min_confidence: policy_file
                .min_confidence
                .unwrap_or(policy_defaults.min_confidence),
            margin: policy_file.margin.unwrap_or(policy_defaults.margin),
        };

        Self {
            server: file.server.unwrap_or_default(),
            port: file.port.unwrap_or(DEFAULT_PORT),
            camera: file.camera.unwrap_or(DEFAULT_CAMERA),
            width: file.width.unwrap_or(DEFAULT_WIDTH),
            height: file.height.unwrap_or(DEFAULT_HEIGHT),
            image_dir: file.image_dir,
            target_fps: file.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
            connect_timeout: Duration::from_millis(
                file.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            ),
            io_timeout: Duration::from_millis(file.io_timeout_ms.unwrap_or(DEFAULT_IO_TIMEOUT_MS)),
            max_payload: file.max_payload.unwrap_or(DEFAULT_MAX_PAYLOAD),
            backoff,
            tracker,
            policy,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(server) = env_string("SINKWATCH_SERVER") {
            self.server = server;
        }
        if let Some(port) = env_parse("SINKWATCH_PORT", "a port number")? {
            self.port = port;
        }
        if let Some(camera) = env_parse("SINKWATCH_CAMERA", "a camera index")? {
            self.camera = camera;
        }
        if let Some(width) = env_parse("SINKWATCH_WIDTH", "a pixel count")? {
            self.width = width;
        }
        if let Some(height) = env_parse("SINKWATCH_HEIGHT", "a pixel count")? {
            self.height = height;
        }
        if let Some(dir) = env_string("SINKWATCH_IMAGE_DIR") {
            self.image_dir = Some(PathBuf::from(dir));
        }
        if let Some(kind) = env_string("SINKWATCH_POLICY") {
            self.policy.kind = kind.parse()?;
        }
        if let Some(attempts) = env_parse("SINKWATCH_MAX_ATTEMPTS", "an integer attempt count")? {
            self.backoff.max_attempts = attempts;
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        self.server = self.server.trim().to_string();
        if self.server.is_empty() {
            return Err(anyhow!(
                "server address is required (set it in the config file, SINKWATCH_SERVER or --server)"
            ));
        }
        if self.port == 0 {
            return Err(anyhow!("port must be non-zero"));
        }
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if value == 0 || value > u32::from(u16::MAX) {
                return Err(anyhow!(
                    "capture {} must be between 1 and {}, got {}",
                    name,
                    u16::MAX,
                    value
                ));
            }
        }
        if self.connect_timeout.is_zero() || self.io_timeout.is_zero() {
            return Err(anyhow!("connect and io timeouts must be non-zero"));
        }
        if self.max_payload == 0 {
            return Err(anyhow!("max_payload must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.policy.min_confidence) {
            return Err(anyhow!(
                "policy min_confidence must be within 0.0..=1.0, got {}",
                self.policy.min_confidence
            ));
        }
        if !self.policy.margin.is_finite() || self.policy.margin < 0.0 {
            return Err(anyhow!("policy margin must be a non-negative number"));
        }
        self.backoff.validate()?;
        self.tracker.validate()?;
        Ok(())
    }

    /// `host:port` to connect to. An address that already names a port wins.
    pub fn target(&self) -> String {
        if self.server.parse::<SocketAddr>().is_ok() {
            return self.server.clone();
        }
        if let Some((host, port)) = self.server.rsplit_once(':') {
            if !host.contains(':') && port.parse::<u16>().is_ok() {
                return self.server.clone();
            }
        }
        if self.server.contains(':') && !self.server.starts_with('[') {
            return format!("[{}]:{}", self.server, self.port);
        }
        format!("{}:{}", self.server, self.port)
    }

    /// Capture dimensions; only meaningful after `validate`.
    pub fn frame_size(&self) -> (u16, u16) {
        (
            u16::try_from(self.width).unwrap_or(u16::MAX),
            u16::try_from(self.height).unwrap_or(u16::MAX),
        )
    }

    pub fn policy(&self) -> Policy {
        Policy::new(self.policy.kind, self.policy.min_confidence, self.policy.margin)
    }
}

/// `.toml` files are parsed as TOML, anything else as JSON.
fn read_config_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(name: &str, what: &str) -> Result<Option<T>> {
    match env_string(name) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be {}", name, what)),
        None => Ok(None),
    }
}
