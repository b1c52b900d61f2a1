//! Error taxonomy for the frame/result exchange.
//!
//! Each class of failure is handled at the boundary that detects it:
//! - `ProtocolError` ends the single connection it occurred on.
//! - `ConnectionError` feeds the client's reconnect/backoff loop.
//! - `ResourceError` is raised only at start-up and ends the process.
//!
//! Detector failures stay inside the server (`anyhow::Error` from the backend)
//! and are answered on the wire with an error-flagged result.

use std::io;

use thiserror::Error;

use crate::wire::{ErrorCode, MessageType};

/// Malformed or unexpected bytes on a connection. Fatal to that connection only.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("payload length {length} exceeds maximum {max}")]
    PayloadTooLarge { length: u64, max: u32 },

    #[error("unknown message type tag {0:#04x}")]
    UnknownType(u8),

    #[error("stream closed mid-message ({received} of {expected} bytes)")]
    Truncated { expected: usize, received: usize },

    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: &'static str, reason: String },

    #[error("unexpected {0:?} message")]
    UnexpectedMessage(MessageType),

    #[error("result for seq {got} does not match outstanding frame {expected}")]
    SeqMismatch { expected: u32, got: u32 },

    #[error("peer rejected the session ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },
}

impl ProtocolError {
    pub(crate) fn malformed(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            kind,
            reason: reason.into(),
        }
    }
}

/// Failure to establish or keep a session. Always recoverable.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("could not resolve {addr}: {source}")]
    Address {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("{0} resolved to no addresses")]
    NoAddress(String),

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("gave up after {attempts} connect attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<ConnectionError>,
    },

    #[error("connection closed by peer")]
    PeerClosed,

    #[error("stream i/o failed: {0}")]
    Io(#[source] io::Error),
}

/// Outcome of a failed `send_frame` call.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("request for frame {seq} timed out")]
    Timeout { seq: u32 },

    #[error("connection manager closed")]
    Closed,

    #[error("frame seq {seq} does not follow last sent seq {last}")]
    OutOfOrder { seq: u32, last: u32 },
}

impl TransportError {
    /// True when the next `send_frame` may succeed without caller intervention.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, TransportError::Closed | TransportError::OutOfOrder { .. })
    }
}

/// A capture device or detector that cannot be used at start-up.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("capture device {device} unavailable: {reason}")]
    Capture { device: String, reason: String },

    #[error("detector backend '{backend}' unavailable: {reason}")]
    Detector { backend: String, reason: String },
}

pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_and_out_of_order_are_not_recoverable() {
        assert!(!TransportError::Closed.is_recoverable());
        assert!(!TransportError::OutOfOrder { seq: 1, last: 2 }.is_recoverable());
        assert!(TransportError::Timeout { seq: 3 }.is_recoverable());
        assert!(TransportError::from(ConnectionError::PeerClosed).is_recoverable());
    }

    #[test]
    fn timeouts_cover_both_platform_kinds() {
        assert!(is_timeout(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_timeout(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_timeout(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }
}
