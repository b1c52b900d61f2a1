//! Typed payloads carried by the envelope.
//!
//! ```text
//! FRAME   seq:u32 timestamp_ms:u64 width:u16 height:u16 image:[..]
//! RESULT  seq:u32 count:u16 { class_id:u16 confidence:f32 x:f32 y:f32 w:f32 h:f32 } * count
//! ERROR   seq:u32 code:u16 message_len:u16 message:[message_len]
//! ```
//!
//! All integers and floats are big-endian.

use crate::detect::{BoundingBox, Detection, DetectionResult};
use crate::error::ProtocolError;
use crate::frame::{Frame, FRAME_FIELDS_LEN};

use super::codec::{MessageType, RawMessage};

const RESULT_FIELDS_LEN: usize = 4 + 2;
const DETECTION_LEN: usize = 2 + 4 * 5;
const ERROR_FIELDS_LEN: usize = 4 + 2 + 2;

/// Error codes carried by ERROR messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The detector failed on this frame; the session continues.
    DetectorFailed,
    /// The peer sent bytes the server could not parse; the session ends.
    ProtocolViolation,
    /// The server could not provide a detector for this session.
    Unavailable,
    Other(u16),
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::DetectorFailed => 1,
            ErrorCode::ProtocolViolation => 2,
            ErrorCode::Unavailable => 3,
            ErrorCode::Other(code) => code,
        }
    }

    pub fn from_u16(code: u16) -> Self {
        match code {
            1 => ErrorCode::DetectorFailed,
            2 => ErrorCode::ProtocolViolation,
            3 => ErrorCode::Unavailable,
            other => ErrorCode::Other(other),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorMessage {
    /// Seq of the frame this error answers; 0 when not tied to a frame.
    pub seq: u32,
    pub code: ErrorCode,
    pub message: String,
}

/// A decoded message.
///
/// `Result` carries only `seq` and `detections` on the wire; latency and the
/// error flag are local. An error-flagged result travels as `Error`.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Frame(Frame),
    Result(DetectionResult),
    Error(ErrorMessage),
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::Frame(_) => MessageType::Frame,
            Message::Result(_) => MessageType::Result,
            Message::Error(_) => MessageType::Error,
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Message::Frame(frame) => Ok(encode_frame(frame)),
            Message::Result(result) => encode_result(result.seq, &result.detections),
            Message::Error(error) => Ok(encode_error(error)),
        }
    }

    pub fn decode(raw: RawMessage) -> Result<Self, ProtocolError> {
        match raw.kind {
            MessageType::Frame => decode_frame(raw.payload).map(Message::Frame),
            MessageType::Result => decode_result(&raw.payload).map(Message::Result),
            MessageType::Error => decode_error(&raw.payload).map(Message::Error),
        }
    }
}

impl From<DetectionResult> for Message {
    fn from(result: DetectionResult) -> Self {
        match result.error {
            Some(error) => Message::Error(ErrorMessage {
                seq: result.seq,
                code: error.code,
                message: error.message,
            }),
            None => Message::Result(result),
        }
    }
}

pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.wire_len());
    out.extend_from_slice(&frame.seq().to_be_bytes());
    out.extend_from_slice(&frame.timestamp_ms().to_be_bytes());
    out.extend_from_slice(&frame.width().to_be_bytes());
    out.extend_from_slice(&frame.height().to_be_bytes());
    out.extend_from_slice(frame.image());
    out
}

pub fn encode_result(seq: u32, detections: &[Detection]) -> Result<Vec<u8>, ProtocolError> {
    let count = u16::try_from(detections.len()).map_err(|_| {
        ProtocolError::malformed(
            "RESULT",
            format!("{} detections exceed the u16 count field", detections.len()),
        )
    })?;
    let mut out = Vec::with_capacity(RESULT_FIELDS_LEN + detections.len() * DETECTION_LEN);
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&count.to_be_bytes());
    for det in detections {
        out.extend_from_slice(&det.class_id.to_be_bytes());
        for value in [
            det.confidence,
            det.bbox.x,
            det.bbox.y,
            det.bbox.w,
            det.bbox.h,
        ] {
            out.extend_from_slice(&value.to_be_bytes());
        }
    }
    Ok(out)
}

/// Messages longer than the u16 length field are cut at a char boundary.
pub fn encode_error(error: &ErrorMessage) -> Vec<u8> {
    let mut end = error.message.len().min(u16::MAX as usize);
    while !error.message.is_char_boundary(end) {
        end -= 1;
    }
    let text = &error.message.as_bytes()[..end];

    let mut out = Vec::with_capacity(ERROR_FIELDS_LEN + text.len());
    out.extend_from_slice(&error.seq.to_be_bytes());
    out.extend_from_slice(&error.code.as_u16().to_be_bytes());
    out.extend_from_slice(&(text.len() as u16).to_be_bytes());
    out.extend_from_slice(text);
    out
}

fn decode_frame(payload: Vec<u8>) -> Result<Frame, ProtocolError> {
    if payload.len() < FRAME_FIELDS_LEN {
        return Err(ProtocolError::malformed(
            "FRAME",
            format!(
                "{} bytes is shorter than the {} byte frame header",
                payload.len(),
                FRAME_FIELDS_LEN
            ),
        ));
    }
    let mut fields = PayloadReader::new("FRAME", &payload[..FRAME_FIELDS_LEN]);
    let seq = fields.u32()?;
    let timestamp_ms = fields.u64()?;
    let width = fields.u16()?;
    let height = fields.u16()?;

    let mut image = payload;
    image.drain(..FRAME_FIELDS_LEN);
    Ok(Frame::new(seq, timestamp_ms, width, height, image))
}

fn decode_result(payload: &[u8]) -> Result<DetectionResult, ProtocolError> {
    let mut reader = PayloadReader::new("RESULT", payload);
    let seq = reader.u32()?;
    let count = reader.u16()? as usize;
    let expected = RESULT_FIELDS_LEN + count * DETECTION_LEN;
    if payload.len() != expected {
        return Err(ProtocolError::malformed(
            "RESULT",
            format!(
                "{} detections need {} bytes, payload has {}",
                count,
                expected,
                payload.len()
            ),
        ));
    }

    let mut detections = Vec::with_capacity(count);
    for _ in 0..count {
        let class_id = reader.u16()?;
        let confidence = reader.f32()?;
        let bbox = BoundingBox::new(reader.f32()?, reader.f32()?, reader.f32()?, reader.f32()?);
        detections.push(Detection::new(class_id, confidence, bbox));
    }
    Ok(DetectionResult::new(seq, detections))
}

fn decode_error(payload: &[u8]) -> Result<ErrorMessage, ProtocolError> {
    let mut reader = PayloadReader::new("ERROR", payload);
    let seq = reader.u32()?;
    let code = ErrorCode::from_u16(reader.u16()?);
    let len = reader.u16()? as usize;
    let text = reader.bytes(len)?;
    reader.finish()?;
    Ok(ErrorMessage {
        seq,
        code,
        message: String::from_utf8_lossy(text).into_owned(),
    })
}

/// Big-endian field reader over a payload slice.
struct PayloadReader<'a> {
    kind: &'static str,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(kind: &'static str, buf: &'a [u8]) -> Self {
        Self { kind, buf, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(ProtocolError::malformed(
                self.kind,
                format!(
                    "needs {} bytes at offset {}, only {} remain",
                    len,
                    self.pos,
                    self.buf.len() - self.pos
                ),
            ));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(f32::from_be_bytes(self.array()?))
    }

    fn finish(&self) -> Result<(), ProtocolError> {
        if self.pos != self.buf.len() {
            return Err(ProtocolError::malformed(
                self.kind,
                format!("{} trailing bytes", self.buf.len() - self.pos),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_layout_is_bit_exact() {
        let det = Detection::new(0, 0.9, BoundingBox::new(10.0, 10.0, 5.0, 5.0));
        let payload = encode_result(1, &[det]).unwrap();
        assert_eq!(payload.len(), 6 + 22);
        assert_eq!(&payload[..6], &[0, 0, 0, 1, 0, 1]);
        assert_eq!(&payload[6..8], &[0, 0]);
        assert_eq!(&payload[8..12], &0.9f32.to_be_bytes());
        assert_eq!(&payload[12..16], &10.0f32.to_be_bytes());
    }

    #[test]
    fn frame_layout_is_bit_exact() {
        let frame = Frame::new(0x01020304, 5, 100, 50, vec![7, 8]);
        let payload = encode_frame(&frame);
        assert_eq!(
            payload,
            vec![1, 2, 3, 4, 0, 0, 0, 0, 0, 0, 0, 5, 0, 100, 0, 50, 7, 8]
        );
    }

    #[test]
    fn result_count_must_match_payload() {
        let mut payload = encode_result(3, &[]).unwrap();
        payload[5] = 2;
        let err = decode_result(&payload).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { kind: "RESULT", .. }));
    }

    #[test]
    fn short_frame_payload_is_malformed() {
        let err = decode_frame(vec![0u8; 10]).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { kind: "FRAME", .. }));
    }

    #[test]
    fn error_message_round_trips_with_code() {
        let error = ErrorMessage {
            seq: 12,
            code: ErrorCode::DetectorFailed,
            message: "inference failed".to_string(),
        };
        let decoded = decode_error(&encode_error(&error)).unwrap();
        assert_eq!(decoded, error);
    }

    #[test]
    fn unknown_error_codes_are_preserved() {
        assert_eq!(ErrorCode::from_u16(77), ErrorCode::Other(77));
        assert_eq!(ErrorCode::Other(77).as_u16(), 77);
    }

    #[test]
    fn oversized_error_text_is_cut_on_char_boundary() {
        let error = ErrorMessage {
            seq: 1,
            code: ErrorCode::Other(9),
            message: "é".repeat(40_000),
        };
        let decoded = decode_error(&encode_error(&error)).unwrap();
        assert!(decoded.message.len() <= u16::MAX as usize);
        assert!(decoded.message.chars().all(|c| c == 'é'));
    }

    #[test]
    fn flagged_result_becomes_error_message() {
        let result = DetectionResult::failed(4, ErrorCode::DetectorFailed, "boom");
        let message = Message::from(result);
        assert_eq!(message.kind(), MessageType::Error);
    }
}
