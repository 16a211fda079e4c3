//! In-memory segment plus a per-engine free list of payload buffers.

use crate::wire::{self, SegmentHeader, WireError};

/// One protocol segment. `resendts`, `rto`, `fastack` and `xmit` never go on the wire.
#[derive(Debug, Clone, Default)]
pub struct Segment {
    pub conv: u32,
    pub cmd: u8,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub resendts: u32,
    pub rto: u32,
    pub fastack: u32,
    pub xmit: u32,
    pub data: Vec<u8>,
}

impl Segment {
    /// Segment with a payload buffer taken from the pool.
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn header(&self) -> SegmentHeader {
        SegmentHeader {
            conv: self.conv,
            cmd: self.cmd,
            frg: self.frg,
            wnd: self.wnd,
            ts: self.ts,
            sn: self.sn,
            una: self.una,
            len: self.data.len() as u32,
        }
    }

    /// Append header and payload to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        wire::encode_header(&self.header(), out)?;
        out.extend_from_slice(&self.data);
        Ok(())
    }
}

/// Default number of idle buffers kept for reuse.
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// Free list of payload buffers. Buffers come back cleared; capacity is kept.
#[derive(Debug)]
pub struct SegmentPool {
    free: Vec<Vec<u8>>,
    capacity: usize,
}

impl SegmentPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Vec::new(),
            capacity,
        }
    }

    /// Take an empty buffer able to hold at least `size` bytes.
    pub fn take(&mut self, size: usize) -> Vec<u8> {
        match self.free.pop() {
            Some(mut buf) => {
                buf.reserve(size);
                buf
            }
            None => Vec::with_capacity(size),
        }
    }

    /// Return a segment's payload buffer. Dropped when the pool is full.
    pub fn give(&mut self, mut buf: Vec<u8>) {
        if self.free.len() < self.capacity {
            buf.clear();
            self.free.push(buf);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

impl Default for SegmentPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, OVERHEAD};

    #[test]
    fn encode_writes_header_then_payload() {
        let seg = Segment {
            conv: 9,
            cmd: Command::Push.as_u8(),
            sn: 3,
            data: b"hello".to_vec(),
            xmit: 4,
            ..Segment::default()
        };
        let mut out = Vec::new();
        seg.encode(&mut out).unwrap();
        assert_eq!(out.len(), OVERHEAD + 5);
        assert_eq!(&out[OVERHEAD..], b"hello");
        let (header, payload, used) = wire::decode_segment(&out).unwrap();
        assert_eq!(header.sn, 3);
        assert_eq!(header.len, 5);
        assert_eq!(payload, b"hello");
        assert_eq!(used, out.len());
    }

    #[test]
    fn pool_recycles_cleared_buffers() {
        let mut pool = SegmentPool::new(2);
        let mut a = pool.take(16);
        a.extend_from_slice(b"xyz");
        pool.give(a);
        assert_eq!(pool.idle(), 1);
        let b = pool.take(4);
        assert!(b.is_empty());
        assert!(b.capacity() >= 16);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn pool_is_bounded() {
        let mut pool = SegmentPool::new(1);
        pool.give(Vec::with_capacity(8));
        pool.give(Vec::with_capacity(8));
        assert_eq!(pool.idle(), 1);
    }
}
