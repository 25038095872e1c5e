//! Codec for encoding and decoding HTSP messages.
//!
//! Frame format:
//! ```text
//! +----------+---------------------------------------------+
//! | Length   | Body: field entries, back to back           |
//! | u32 BE   |                                             |
//! +----------+---------------------------------------------+
//! ```
//!
//! Field entry:
//! ```text
//! +------+----------+------------+-------------------------+
//! | Type | Name len | Name       | Value (shape per type)  |
//! | u8   | u8       | name bytes |                         |
//! +------+----------+------------+-------------------------+
//! ```
//!
//! Values:
//! - integer: `u8` byte count, then minimal big-endian two's complement
//! - text / binary: `u32 BE` length, then raw bytes
//! - map: `u32 BE` length, then a body
//! - list: `u32 BE` length, then map entries until the length is used up

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::message::{Field, Message, MessageBuilder};
use crate::types::*;

/// Maximum nesting of maps and lists accepted by the decoder.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Encode a message into a length-prefixed frame.
pub fn encode_message(msg: &Message) -> Result<Bytes, ProtocolError> {
    let mut body = BytesMut::new();
    encode_body(&mut body, msg)?;

    let body_len = u32::try_from(body.len())
        .map_err(|_| ProtocolError::FrameTooLarge(u32::MAX, MAX_FRAME_SIZE))?;
    if body_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body_len, MAX_FRAME_SIZE));
    }

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.put_u32(body_len);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Encode the field entries of a message without the frame prefix.
pub fn encode_body(buf: &mut BytesMut, msg: &Message) -> Result<(), ProtocolError> {
    for (name, field) in msg.iter() {
        let type_tag = match field {
            Field::Int(_) => TYPE_S64,
            Field::Bytes(_) => TYPE_BIN,
            Field::Map(_) => TYPE_MAP,
            Field::List(_) => TYPE_LIST,
        };
        encode_entry_header(buf, type_tag, name)?;

        match field {
            Field::Int(v) => encode_int(buf, *v),
            Field::Bytes(b) => {
                put_len(buf, b.len())?;
                buf.put_slice(b);
            }
            Field::Map(m) => encode_nested(buf, m)?,
            Field::List(items) => {
                let mut list = BytesMut::new();
                for item in items {
                    encode_entry_header(&mut list, TYPE_MAP, "")?;
                    encode_nested(&mut list, item)?;
                }
                put_len(buf, list.len())?;
                buf.put_slice(&list);
            }
        }
    }
    Ok(())
}

fn encode_entry_header(buf: &mut BytesMut, type_tag: u8, name: &str) -> Result<(), ProtocolError> {
    let name_len = u8::try_from(name.len()).map_err(|_| ProtocolError::NameTooLong(name.len()))?;
    buf.put_u8(type_tag);
    buf.put_u8(name_len);
    buf.put_slice(name.as_bytes());
    Ok(())
}

fn encode_nested(buf: &mut BytesMut, msg: &Message) -> Result<(), ProtocolError> {
    let mut nested = BytesMut::new();
    encode_body(&mut nested, msg)?;
    put_len(buf, nested.len())?;
    buf.put_slice(&nested);
    Ok(())
}

fn put_len(buf: &mut BytesMut, len: usize) -> Result<(), ProtocolError> {
    let len = u32::try_from(len).map_err(|_| ProtocolError::FrameTooLarge(u32::MAX, MAX_FRAME_SIZE))?;
    buf.put_u32(len);
    Ok(())
}

/// Minimal big-endian two's complement; zero has an empty payload.
fn encode_int(buf: &mut BytesMut, value: i64) {
    if value == 0 {
        buf.put_u8(0);
        return;
    }

    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let sign_bit = bytes[start + 1] & 0x80;
        let redundant = (bytes[start] == 0x00 && sign_bit == 0) || (bytes[start] == 0xFF && sign_bit != 0);
        if !redundant {
            break;
        }
        start += 1;
    }

    buf.put_u8((bytes.len() - start) as u8);
    buf.put_slice(&bytes[start..]);
}

fn decode_int(bytes: &[u8]) -> Result<i64, ProtocolError> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() > 8 {
        return Err(ProtocolError::InvalidInteger(bytes.len()));
    }

    let fill = if bytes[0] & 0x80 != 0 { 0xFF } else { 0x00 };
    let mut full = [fill; 8];
    full[8 - bytes.len()..].copy_from_slice(bytes);
    Ok(i64::from_be_bytes(full))
}

/// Read the body length from the front of a buffer.
/// Returns None if fewer than four bytes are available.
pub fn decode_frame_length(buf: &[u8]) -> Result<Option<u32>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len, MAX_FRAME_SIZE));
    }
    Ok(Some(len))
}

/// Decode one complete frame (length prefix included).
pub fn decode_message(frame: &[u8]) -> Result<Message, ProtocolError> {
    let declared = match decode_frame_length(frame)? {
        Some(len) => len as usize,
        None => {
            return Err(ProtocolError::Truncated {
                expected: LENGTH_PREFIX_SIZE,
                actual: frame.len(),
            })
        }
    };

    let actual = frame.len() - LENGTH_PREFIX_SIZE;
    if declared != actual {
        return Err(ProtocolError::FrameLengthMismatch { declared, actual });
    }

    decode_body(Bytes::copy_from_slice(&frame[LENGTH_PREFIX_SIZE..]))
}

/// Decode a frame body (no length prefix).
pub fn decode_body(body: Bytes) -> Result<Message, ProtocolError> {
    decode_entries(body, 0)
}

fn decode_entries(mut buf: Bytes, depth: usize) -> Result<Message, ProtocolError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(ProtocolError::NestingTooDeep(depth));
    }

    let mut builder = MessageBuilder::new();
    while buf.has_remaining() {
        let (type_tag, name) = decode_entry_header(&mut buf)?;
        let field = match type_tag {
            TYPE_S64 => {
                let count = take(&mut buf, 1)?[0] as usize;
                Field::Int(decode_int(&take(&mut buf, count)?)?)
            }
            TYPE_STR | TYPE_BIN => Field::Bytes(take_prefixed(&mut buf)?),
            TYPE_MAP => Field::Map(decode_entries(take_prefixed(&mut buf)?, depth + 1)?),
            TYPE_LIST => Field::List(decode_list(take_prefixed(&mut buf)?, depth + 1)?),
            other => return Err(ProtocolError::UnknownFieldType(other)),
        };
        builder.set(&name, field);
    }
    Ok(builder.build())
}

fn decode_list(mut buf: Bytes, depth: usize) -> Result<Vec<Message>, ProtocolError> {
    let mut items = Vec::new();
    while buf.has_remaining() {
        let (type_tag, _name) = decode_entry_header(&mut buf)?;
        if type_tag != TYPE_MAP {
            return Err(ProtocolError::UnexpectedListEntry(type_tag));
        }
        items.push(decode_entries(take_prefixed(&mut buf)?, depth + 1)?);
    }
    Ok(items)
}

fn decode_entry_header(buf: &mut Bytes) -> Result<(u8, String), ProtocolError> {
    let header = take(buf, 2)?;
    let type_tag = header[0];
    let name_bytes = take(buf, header[1] as usize)?;
    let name = String::from_utf8(name_bytes.to_vec())
        .map_err(|e| ProtocolError::InvalidUtf8(String::from_utf8_lossy(e.as_bytes()).into_owned()))?;
    Ok((type_tag, name))
}

fn take_prefixed(buf: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let len = take(buf, 4)?.get_u32() as usize;
    take(buf, len)
}

fn take(buf: &mut Bytes, len: usize) -> Result<Bytes, ProtocolError> {
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated {
            expected: len,
            actual: buf.remaining(),
        });
    }
    Ok(buf.split_to(len))
}
