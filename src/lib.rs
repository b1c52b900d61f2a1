//! Sinkwatch
//!
//! Real-time utensil detection split across two machines: a capture endpoint
//! that ships frames over TCP, and a compute endpoint that runs the detector
//! and answers with structured results.
//!
//! # Module Structure
//!
//! - `wire`: message framing and payload codecs (the only code touching raw bytes)
//! - `server`: `DetectionServer`, one worker thread per connection
//! - `client`: `ConnectionManager`, lockstep send/receive with reconnect backoff
//! - `tracker`: `StateTracker`, hysteresis and rate-limited alerts
//! - `capture`: frame producers feeding the client through a bounded handoff
//! - `detect`: detector seam, backend registry and the detection data model
//! - `config`, `error`, `ui`: ambient plumbing for the binaries

pub mod capture;
pub mod client;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod server;
pub mod tracker;
pub mod ui;
pub mod wire;

/// TCP port used by both ends unless configured otherwise.
pub const DEFAULT_PORT: u16 = 8888;

pub use capture::{spawn_capture, CaptureHandle, CapturedImage, FrameSource};
pub use client::{BackoffPolicy, ConnectionManager, ConnectionState, Connector, TcpConnector};
pub use config::{ClientSettings, ServerSettings};
pub use detect::{BackendRegistry, BoundingBox, Detection, DetectionResult, DetectorBackend};
pub use error::{ConnectionError, ProtocolError, ResourceError, TransportError};
pub use frame::Frame;
pub use server::{DetectionServer, ServerConfig, ServerHandle, StatsSnapshot};
pub use tracker::{AlertEvent, AlertSink, AttendanceState, Classification, StateTracker, TrackerConfig};
