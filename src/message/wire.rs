//! Broker-to-broker wire frame
//!
//! Transport-agnostic binary layout, all integers little-endian:
//! command (1 byte), source-fed (i32), dest-fed (i32), source-handle (i32),
//! dest-handle (i32), route (i32), time (i64, nanoseconds), flags (u32),
//! string payload (u32 length + bytes), binary payload (u64 length + bytes).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::ids::{FederateId, HandleId, RouteId};
use crate::time::Time;

use super::{Action, ActionMessage};

/// Frame decode failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown command code {0}")]
    UnknownCommand(u8),

    #[error("frame truncated: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("string payload is not valid utf-8")]
    InvalidUtf8,
}

/// Encode a message into a standalone frame.
pub fn encode(msg: &ActionMessage) -> Bytes {
    let mut buf = BytesMut::with_capacity(41 + msg.payload.len() + msg.data.len());
    encode_into(msg, &mut buf);
    buf.freeze()
}

/// Append a message frame to `buf`.
pub fn encode_into(msg: &ActionMessage, buf: &mut BytesMut) {
    buf.put_u8(msg.action.code());
    buf.put_i32_le(msg.source_fed.as_i32());
    buf.put_i32_le(msg.dest_fed.as_i32());
    buf.put_i32_le(msg.source_handle.as_i32());
    buf.put_i32_le(msg.dest_handle.as_i32());
    buf.put_i32_le(msg.route.as_i32());
    buf.put_i64_le(msg.time.as_ns());
    buf.put_u32_le(msg.flags);
    buf.put_u32_le(msg.payload.len() as u32);
    buf.put_slice(msg.payload.as_bytes());
    buf.put_u64_le(msg.data.len() as u64);
    buf.put_slice(&msg.data);
}

fn need(buf: &impl Buf, len: usize) -> Result<(), WireError> {
    if buf.remaining() < len {
        Err(WireError::Truncated {
            needed: len - buf.remaining(),
        })
    } else {
        Ok(())
    }
}

/// Decode one frame from `buf`, consuming exactly the frame's bytes.
pub fn decode(buf: &mut impl Buf) -> Result<ActionMessage, WireError> {
    need(buf, 37)?;
    let code = buf.get_u8();
    let action = Action::from_code(code).ok_or(WireError::UnknownCommand(code))?;
    let source_fed = FederateId::new(buf.get_i32_le());
    let dest_fed = FederateId::new(buf.get_i32_le());
    let source_handle = HandleId::new(buf.get_i32_le());
    let dest_handle = HandleId::new(buf.get_i32_le());
    let route = RouteId::new(buf.get_i32_le());
    let time = Time::from_ns(buf.get_i64_le());
    let flags = buf.get_u32_le();

    need(buf, 4)?;
    let payload_len = buf.get_u32_le() as usize;
    need(buf, payload_len)?;
    let mut payload_bytes = vec![0u8; payload_len];
    buf.copy_to_slice(&mut payload_bytes);
    let payload = String::from_utf8(payload_bytes).map_err(|_| WireError::InvalidUtf8)?;

    need(buf, 8)?;
    let data_len = buf.get_u64_le() as usize;
    need(buf, data_len)?;
    let mut data = vec![0u8; data_len];
    buf.copy_to_slice(&mut data);

    Ok(ActionMessage {
        action,
        source_fed,
        dest_fed,
        source_handle,
        dest_handle,
        route,
        time,
        flags,
        payload,
        data,
    })
}
