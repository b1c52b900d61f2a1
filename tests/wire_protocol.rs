use std::io::{self, Cursor, Read};

use sinkwatch::detect::{BoundingBox, Detection, DetectionResult};
use sinkwatch::error::ProtocolError;
use sinkwatch::frame::Frame;
use sinkwatch::wire::{self, ErrorCode, ErrorMessage, Message, WireError, DEFAULT_MAX_PAYLOAD};

/// Delivers the underlying bytes in fixed-size chunks.
struct Chunked {
    inner: Cursor<Vec<u8>>,
    chunk: usize,
}

impl Read for Chunked {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.chunk);
        self.inner.read(&mut buf[..n])
    }
}

fn sample_frame(seq: u32) -> Frame {
    let image: Vec<u8> = (0..100 * 100 * 3).map(|i| (i % 251) as u8).collect();
    Frame::new(seq, 1_700_000_000_123, 100, 100, image)
}

fn encode(messages: &[Message]) -> Vec<u8> {
    let mut out = Vec::new();
    for message in messages {
        wire::write_message(&mut out, message, DEFAULT_MAX_PAYLOAD).unwrap();
    }
    out
}

#[test]
fn frame_round_trip_preserves_every_field() {
    let frame = sample_frame(7);
    let mut bytes = Vec::new();
    wire::write_frame(&mut bytes, &frame, DEFAULT_MAX_PAYLOAD).unwrap();
    assert_eq!(bytes[0], 1);
    assert_eq!(&bytes[1..5], &((frame.wire_len()) as u32).to_be_bytes());

    let decoded = wire::read_message(&mut Cursor::new(bytes), DEFAULT_MAX_PAYLOAD)
        .unwrap()
        .unwrap();
    match decoded {
        Message::Frame(got) => {
            assert_eq!(got.seq(), 7);
            assert_eq!(got.timestamp_ms(), 1_700_000_000_123);
            assert_eq!((got.width(), got.height()), (100, 100));
            assert_eq!(got.image(), frame.image());
        }
        other => panic!("expected frame, got {:?}", other),
    }
}

#[test]
fn messages_survive_any_chunking() {
    let det = Detection::new(42, 0.75, BoundingBox::new(1.5, 2.5, 30.0, 40.0));
    let messages = vec![
        Message::Frame(sample_frame(1)),
        Message::Result(DetectionResult::new(1, vec![det.clone(), det])),
        Message::Error(ErrorMessage {
            seq: 2,
            code: ErrorCode::DetectorFailed,
            message: "inference failed".to_string(),
        }),
    ];
    let bytes = encode(&messages);

    for chunk in [1, 2, 3, 5, 7, 64, 4096] {
        let mut reader = Chunked {
            inner: Cursor::new(bytes.clone()),
            chunk,
        };
        let mut decoded = Vec::new();
        while let Some(message) = wire::read_message(&mut reader, DEFAULT_MAX_PAYLOAD).unwrap() {
            decoded.push(message);
        }
        assert_eq!(decoded, messages, "chunk size {}", chunk);
    }
}

#[test]
fn clean_close_between_messages_is_not_an_error() {
    let mut empty = Cursor::new(Vec::new());
    assert!(wire::read_message(&mut empty, DEFAULT_MAX_PAYLOAD).unwrap().is_none());
}

#[test]
fn close_mid_message_is_truncation() {
    let mut bytes = encode(&[Message::Frame(sample_frame(3))]);
    bytes.truncate(bytes.len() - 10);
    let err = wire::read_message(&mut Cursor::new(bytes), DEFAULT_MAX_PAYLOAD).unwrap_err();
    assert!(matches!(
        err,
        WireError::Protocol(ProtocolError::Truncated { .. })
    ));

    let err = wire::read_message(&mut Cursor::new(vec![1u8, 0, 0]), DEFAULT_MAX_PAYLOAD).unwrap_err();
    assert!(matches!(
        err,
        WireError::Protocol(ProtocolError::Truncated {
            expected: 5,
            received: 3
        })
    ));
}

#[test]
fn oversized_length_is_rejected_before_reading_payload() {
    let mut bytes = vec![1u8];
    bytes.extend_from_slice(&1_000u32.to_be_bytes());
    let err = wire::read_message(&mut Cursor::new(bytes), 512).unwrap_err();
    assert!(matches!(
        err,
        WireError::Protocol(ProtocolError::PayloadTooLarge { length: 1000, max: 512 })
    ));
}

#[test]
fn unknown_type_tag_is_rejected() {
    let bytes = vec![9u8, 0, 0, 0, 0];
    let err = wire::read_message(&mut Cursor::new(bytes), DEFAULT_MAX_PAYLOAD).unwrap_err();
    assert!(matches!(err, WireError::Protocol(ProtocolError::UnknownType(9))));
}

#[test]
fn writer_refuses_payloads_over_the_limit() {
    let frame = Frame::new(1, 0, 10, 10, vec![0; 300]);
    let mut out = Vec::new();
    let err = wire::write_frame(&mut out, &frame, 100).unwrap_err();
    assert!(matches!(
        err,
        WireError::Protocol(ProtocolError::PayloadTooLarge { .. })
    ));
    assert!(out.is_empty());
}
