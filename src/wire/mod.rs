//! Wire protocol.
//!
//! Discrete messages over a byte stream that has no message boundaries:
//!
//! ```text
//! +----------+---------------------+-------------------+
//! | type: u8 | length: u32 (BE)    | payload: length   |
//! +----------+---------------------+-------------------+
//! ```
//!
//! Type tags: 1 = FRAME, 2 = RESULT, 3 = ERROR. Readers loop until the full
//! header and then the full payload have arrived, whatever chunk sizes the
//! stream delivers. Writers emit header and payload as one buffer.
//!
//! This module is the only place that touches raw protocol bytes.

mod codec;
mod message;

use std::io::{Read, Write};

use crate::frame::Frame;

pub use codec::{read_raw, write_raw, MessageType, RawMessage, WireError, DEFAULT_MAX_PAYLOAD, HEADER_LEN};
pub use message::{encode_error, encode_frame, encode_result, ErrorCode, ErrorMessage, Message};

/// Read and decode one message. `Ok(None)` means the peer closed cleanly.
pub fn read_message<R: Read>(reader: &mut R, max_payload: u32) -> Result<Option<Message>, WireError> {
    match read_raw(reader, max_payload)? {
        Some(raw) => Ok(Some(Message::decode(raw)?)),
        None => Ok(None),
    }
}

pub fn write_message<W: Write>(writer: &mut W, message: &Message, max_payload: u32) -> Result<(), WireError> {
    let payload = message.encode_payload()?;
    write_raw(writer, message.kind(), &payload, max_payload)
}

/// Write a FRAME without taking ownership of the frame.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame, max_payload: u32) -> Result<(), WireError> {
    write_raw(writer, MessageType::Frame, &encode_frame(frame), max_payload)
}
