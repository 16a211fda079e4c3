//! Segment header framing: 24 bytes, little-endian, bincode fixed-int layout.
//!
//! `conv:u32 cmd:u8 frg:u8 wnd:u16 ts:u32 sn:u32 una:u32 len:u32`, then `len` payload bytes.
//! Several segments may be concatenated in one datagram.

use serde::{Deserialize, Serialize};

use crate::protocol::OVERHEAD;

/// On-wire segment header. Field order is the wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SegmentHeader {
    pub conv: u32,
    pub cmd: u8,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub len: u32,
}

/// Append the encoded header to `out`.
pub fn encode_header(header: &SegmentHeader, out: &mut Vec<u8>) -> Result<(), WireError> {
    bincode::serialize_into(out, header).map_err(WireError::Encode)
}

/// Error encoding a segment header.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("encode error: {0}")]
    Encode(#[source] bincode::Error),
}

/// Decode one segment from the front of `bytes`. Returns the header, its payload and the
/// number of bytes consumed.
pub fn decode_segment(bytes: &[u8]) -> Result<(SegmentHeader, &[u8], usize), DecodeError> {
    if bytes.len() < OVERHEAD {
        return Err(DecodeError::Short(bytes.len()));
    }
    let header: SegmentHeader =
        bincode::deserialize(&bytes[..OVERHEAD]).map_err(DecodeError::Decode)?;
    let len = header.len as usize;
    let end = OVERHEAD
        .checked_add(len)
        .ok_or(DecodeError::Truncated { declared: len, available: bytes.len() - OVERHEAD })?;
    if bytes.len() < end {
        return Err(DecodeError::Truncated {
            declared: len,
            available: bytes.len() - OVERHEAD,
        });
    }
    Ok((header, &bytes[OVERHEAD..end], end))
}

/// Read the conv field of the first segment without decoding the rest.
pub fn peek_conv(bytes: &[u8]) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(raw))
}

/// Error decoding a segment (short header, length beyond the buffer, bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("short header: {0} bytes")]
    Short(usize),
    #[error("payload truncated: declared {declared}, available {available}")]
    Truncated { declared: usize, available: usize },
    #[error("decode error: {0}")]
    Decode(#[source] bincode::Error),
}
