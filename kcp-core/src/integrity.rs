//! CRC32 datagram framing: 4-byte little-endian checksum of the rest, first in the datagram.

/// Bytes added by [`seal`].
pub const CHECKSUM_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("datagram shorter than checksum: {0} bytes")]
    Short(usize),
    #[error("checksum mismatch: carried {carried:#010x}, computed {computed:#010x}")]
    Mismatch { carried: u32, computed: u32 },
}

/// Write checksum then payload into `out`.
pub fn seal(payload: &[u8], out: &mut Vec<u8>) {
    out.reserve(CHECKSUM_LEN + payload.len());
    out.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    out.extend_from_slice(payload);
}

/// Verify the checksum and return the payload behind it.
pub fn open(datagram: &[u8]) -> Result<&[u8], IntegrityError> {
    if datagram.len() < CHECKSUM_LEN {
        return Err(IntegrityError::Short(datagram.len()));
    }
    let (head, payload) = datagram.split_at(CHECKSUM_LEN);
    let carried = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
    let computed = crc32fast::hash(payload);
    if carried != computed {
        return Err(IntegrityError::Mismatch { carried, computed });
    }
    Ok(payload)
}
