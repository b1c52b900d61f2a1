//! Message envelope: `type: u8 | length: u32 BE | payload`.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::error::{is_timeout, ProtocolError};

/// Bytes in the envelope header (type tag + length).
pub const HEADER_LEN: usize = 1 + 4;

/// Default payload ceiling; large enough for an uncompressed 1080p RGB frame.
pub const DEFAULT_MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Frame,
    Result,
    Error,
}

impl MessageType {
    pub fn tag(self) -> u8 {
        match self {
            MessageType::Frame => 1,
            MessageType::Result => 2,
            MessageType::Error => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            1 => Ok(MessageType::Frame),
            2 => Ok(MessageType::Result),
            3 => Ok(MessageType::Error),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

/// Why reading or writing an envelope failed.
#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The read timeout expired before any byte of the next header arrived.
    /// The stream is still aligned on a message boundary.
    #[error("no message arrived before the read timeout")]
    Idle,

    #[error("stream i/o failed: {0}")]
    Io(#[from] io::Error),
}

/// Envelope with an undecoded payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    pub kind: MessageType,
    pub payload: Vec<u8>,
}

/// Read one envelope.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between messages.
pub fn read_raw<R: Read>(reader: &mut R, max_payload: u32) -> Result<Option<RawMessage>, WireError> {
    let mut header = [0u8; HEADER_LEN];
    match fill(reader, &mut header) {
        Ok(0) => return Ok(None),
        Ok(n) if n < HEADER_LEN => {
            return Err(ProtocolError::Truncated {
                expected: HEADER_LEN,
                received: n,
            }
            .into())
        }
        Ok(_) => {}
        Err((0, err)) if is_timeout(&err) => return Err(WireError::Idle),
        Err((_, err)) => return Err(err.into()),
    }

    let kind = MessageType::from_tag(header[0])?;
    let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if length > max_payload {
        return Err(ProtocolError::PayloadTooLarge {
            length: length as u64,
            max: max_payload,
        }
        .into());
    }

    let mut payload = vec![0u8; length as usize];
    let received = fill(reader, &mut payload).map_err(|(_, err)| WireError::Io(err))?;
    if received < payload.len() {
        return Err(ProtocolError::Truncated {
            expected: HEADER_LEN + payload.len(),
            received: HEADER_LEN + received,
        }
        .into());
    }

    Ok(Some(RawMessage { kind, payload }))
}

/// Write one envelope as a single buffer.
///
/// `write_all` keeps retrying short writes; if it fails part-way the caller must
/// discard the stream, since the peer may hold half a message.
pub fn write_raw<W: Write>(
    writer: &mut W,
    kind: MessageType,
    payload: &[u8],
    max_payload: u32,
) -> Result<(), WireError> {
    if payload.len() as u64 > max_payload as u64 {
        return Err(ProtocolError::PayloadTooLarge {
            length: payload.len() as u64,
            max: max_payload,
        }
        .into());
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(kind.tag());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Read until `buf` is full or the stream ends. On error, reports how many
/// bytes had already been consumed.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, (usize, io::Error)> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err((filled, err)),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn envelope(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![tag];
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn header_is_tag_then_big_endian_length() {
        let mut out = Vec::new();
        write_raw(&mut out, MessageType::Result, &[0xAA, 0xBB], 1024).unwrap();
        assert_eq!(out, vec![2, 0, 0, 0, 2, 0xAA, 0xBB]);
    }

    #[test]
    fn clean_eof_before_header_is_none() {
        let mut empty = Cursor::new(Vec::new());
        assert!(read_raw(&mut empty, 1024).unwrap().is_none());
    }

    #[test]
    fn rejects_oversized_length_before_allocating() {
        let mut bytes = vec![1u8];
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        let err = read_raw(&mut Cursor::new(bytes), 1024).unwrap_err();
        assert!(matches!(
            err,
            WireError::Protocol(ProtocolError::PayloadTooLarge { max: 1024, .. })
        ));
    }

    #[test]
    fn rejects_unknown_tag() {
        let err = read_raw(&mut Cursor::new(envelope(9, b"x")), 1024).unwrap_err();
        assert!(matches!(
            err,
            WireError::Protocol(ProtocolError::UnknownType(9))
        ));
    }

    #[test]
    fn truncated_payload_is_protocol_error() {
        let mut bytes = envelope(2, b"abcdef");
        bytes.truncate(bytes.len() - 2);
        let err = read_raw(&mut Cursor::new(bytes), 1024).unwrap_err();
        assert!(matches!(
            err,
            WireError::Protocol(ProtocolError::Truncated {
                expected: 11,
                received: 9
            })
        ));
    }

    #[test]
    fn truncated_header_is_protocol_error() {
        let err = read_raw(&mut Cursor::new(vec![1u8, 0, 0]), 1024).unwrap_err();
        assert!(matches!(
            err,
            WireError::Protocol(ProtocolError::Truncated { received: 3, .. })
        ));
    }

    #[test]
    fn write_refuses_payload_over_limit() {
        let mut out = Vec::new();
        let err = write_raw(&mut out, MessageType::Frame, &[0u8; 32], 16).unwrap_err();
        assert!(matches!(
            err,
            WireError::Protocol(ProtocolError::PayloadTooLarge { length: 32, .. })
        ));
        assert!(out.is_empty());
    }
}
