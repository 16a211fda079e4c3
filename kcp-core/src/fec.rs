//! Forward error correction between flush output and the socket.
//!
//! [`ParityFec`] sends every datagram at once as a data shard and, after each group of
//! `data_shards`, one XOR parity shard. Any single missing data shard of a group is rebuilt.
//!
//! Shard layout: `seqid:u32 LE | flag:u16 LE | body`. A data body is `size:u16 LE | datagram`;
//! a parity body is the XOR of the group's data bodies, zero-padded to the longest.

use std::collections::VecDeque;

use tracing::{trace, warn};

/// Transform inserted between segment assembly and the socket.
pub trait FecCodec: Send {
    /// Framing bytes added ahead of each datagram.
    fn header_len(&self) -> usize;

    /// Append the shards to send for `datagram` to `out`.
    fn encode(&mut self, datagram: &[u8], out: &mut Vec<Vec<u8>>);

    /// Feed one received shard. Returns the datagrams it completes; empty means
    /// more shards are needed or the shard carried nothing new.
    fn decode(&mut self, shard: &[u8]) -> Result<Vec<Vec<u8>>, FecError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FecError {
    #[error("shard too short: {0} bytes")]
    Short(usize),
    #[error("unknown shard flag {0:#06x}")]
    Flag(u16),
    #[error("shard flag does not match its position in the group")]
    Position,
    #[error("recovered size {size} exceeds shard body {body}")]
    BadSize { size: usize, body: usize },
}

/// Pass-through codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFec;

impl FecCodec for NoFec {
    fn header_len(&self) -> usize {
        0
    }

    fn encode(&mut self, datagram: &[u8], out: &mut Vec<Vec<u8>>) {
        out.push(datagram.to_vec());
    }

    fn decode(&mut self, shard: &[u8]) -> Result<Vec<Vec<u8>>, FecError> {
        Ok(vec![shard.to_vec()])
    }
}

pub const FLAG_DATA: u16 = 0xF1;
pub const FLAG_PARITY: u16 = 0xF2;
/// seqid + flag + size.
pub const PARITY_HEADER_LEN: usize = 8;
const SHARD_PREFIX: usize = 6;
/// Groups tracked by the decoder at once.
pub const GROUP_WINDOW: usize = 3;

/// Codec for `data_shards`; 0 gives [`NoFec`].
pub fn codec(data_shards: usize) -> Box<dyn FecCodec> {
    if data_shards == 0 {
        Box::new(NoFec)
    } else {
        Box::new(ParityFec::new(data_shards))
    }
}

/// True for a parity shard. Parity shards carry no readable segment header.
pub fn is_parity_shard(shard: &[u8]) -> bool {
    shard.len() >= SHARD_PREFIX && u16::from_le_bytes([shard[4], shard[5]]) == FLAG_PARITY
}

struct Group {
    id: u32,
    bodies: Vec<Option<Vec<u8>>>,
    recovered: bool,
}

/// Single-parity XOR group codec.
pub struct ParityFec {
    data_shards: usize,
    next_seq: u32,
    seq_limit: u32,
    parity: Vec<u8>,
    pending: usize,
    groups: VecDeque<Group>,
}

impl ParityFec {
    pub fn new(data_shards: usize) -> Self {
        let data_shards = data_shards.max(1);
        let width = data_shards as u32 + 1;
        Self {
            data_shards,
            next_seq: 0,
            seq_limit: (u32::MAX / width) * width,
            parity: Vec::new(),
            pending: 0,
            groups: VecDeque::with_capacity(GROUP_WINDOW),
        }
    }

    fn width(&self) -> u32 {
        self.data_shards as u32 + 1
    }

    fn take_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.next_seq >= self.seq_limit {
            self.next_seq = 0;
        }
        seq
    }

    fn group_mut(&mut self, id: u32) -> &mut Group {
        let pos = match self.groups.iter().position(|g| g.id == id) {
            Some(pos) => pos,
            None => {
                if self.groups.len() >= GROUP_WINDOW {
                    self.groups.pop_front();
                }
                self.groups.push_back(Group {
                    id,
                    bodies: vec![None; self.data_shards + 1],
                    recovered: false,
                });
                self.groups.len() - 1
            }
        };
        &mut self.groups[pos]
    }
}

fn xor_into(acc: &mut Vec<u8>, body: &[u8]) {
    if acc.len() < body.len() {
        acc.resize(body.len(), 0);
    }
    for (a, b) in acc.iter_mut().zip(body) {
        *a ^= b;
    }
}

fn datagram_of(body: &[u8]) -> Result<Vec<u8>, FecError> {
    if body.len() < 2 {
        return Err(FecError::Short(body.len()));
    }
    let size = u16::from_le_bytes([body[0], body[1]]) as usize;
    if size > body.len() - 2 {
        return Err(FecError::BadSize {
            size,
            body: body.len() - 2,
        });
    }
    Ok(body[2..2 + size].to_vec())
}

impl FecCodec for ParityFec {
    fn header_len(&self) -> usize {
        PARITY_HEADER_LEN
    }

    fn encode(&mut self, datagram: &[u8], out: &mut Vec<Vec<u8>>) {
        let Ok(size) = u16::try_from(datagram.len()) else {
            warn!(len = datagram.len(), "datagram too large for a shard, dropped");
            return;
        };
        let seq = self.take_seq();
        let mut shard = Vec::with_capacity(PARITY_HEADER_LEN + datagram.len());
        shard.extend_from_slice(&seq.to_le_bytes());
        shard.extend_from_slice(&FLAG_DATA.to_le_bytes());
        shard.extend_from_slice(&size.to_le_bytes());
        shard.extend_from_slice(datagram);
        xor_into(&mut self.parity, &shard[SHARD_PREFIX..]);
        out.push(shard);

        self.pending += 1;
        if self.pending == self.data_shards {
            let seq = self.take_seq();
            let mut parity = Vec::with_capacity(SHARD_PREFIX + self.parity.len());
            parity.extend_from_slice(&seq.to_le_bytes());
            parity.extend_from_slice(&FLAG_PARITY.to_le_bytes());
            parity.append(&mut self.parity);
            out.push(parity);
            self.pending = 0;
        }
    }

    fn decode(&mut self, shard: &[u8]) -> Result<Vec<Vec<u8>>, FecError> {
        if shard.len() < SHARD_PREFIX + 2 {
            return Err(FecError::Short(shard.len()));
        }
        let seq = u32::from_le_bytes([shard[0], shard[1], shard[2], shard[3]]);
        let flag = u16::from_le_bytes([shard[4], shard[5]]);
        let width = self.width();
        let (id, index) = (seq / width, (seq % width) as usize);
        let is_parity = match flag {
            FLAG_DATA => false,
            FLAG_PARITY => true,
            other => return Err(FecError::Flag(other)),
        };
        if is_parity != (index == self.data_shards) {
            return Err(FecError::Position);
        }

        let body = &shard[SHARD_PREFIX..];
        let mut delivered = Vec::new();
        if !is_parity {
            delivered.push(datagram_of(body)?);
        }

        let data_shards = self.data_shards;
        let group = self.group_mut(id);
        if group.bodies[index].is_some() {
            // duplicate shard
            return Ok(Vec::new());
        }
        group.bodies[index] = Some(body.to_vec());

        let present = group.bodies.iter().filter(|b| b.is_some()).count();
        if group.recovered || present != data_shards {
            return Ok(delivered);
        }
        let missing = group.bodies.iter().position(|b| b.is_none());
        let Some(missing) = missing.filter(|&m| m < data_shards) else {
            return Ok(delivered);
        };

        let mut acc = Vec::new();
        for body in group.bodies.iter().flatten() {
            xor_into(&mut acc, body);
        }
        group.recovered = true;
        let rebuilt = datagram_of(&acc)?;
        trace!(group = id, index = missing, len = rebuilt.len(), "fec recovered shard");
        group.bodies[missing] = Some(acc);
        delivered.push(rebuilt);
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all(codec: &mut ParityFec, datagrams: &[&[u8]]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for d in datagrams {
            codec.encode(d, &mut out);
        }
        out
    }

    #[test]
    fn parity_follows_each_group() {
        let mut enc = ParityFec::new(3);
        let shards = encode_all(&mut enc, &[b"a", b"bb", b"ccc", b"d"]);
        assert_eq!(shards.len(), 5);
        assert!(is_parity_shard(&shards[3]));
        assert!(!is_parity_shard(&shards[4]));
        assert_eq!(&shards[0][..4], &0u32.to_le_bytes());
        assert_eq!(&shards[4][..4], &4u32.to_le_bytes());
        assert_eq!(shards[0].len(), PARITY_HEADER_LEN + 1);
    }

    #[test]
    fn oversized_datagram_is_not_encoded() {
        let mut enc = ParityFec::new(2);
        let mut out = Vec::new();
        enc.encode(&vec![0u8; u16::MAX as usize + 1], &mut out);
        assert!(out.is_empty());
        enc.encode(b"a", &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(u32::from_le_bytes([out[0][0], out[0][1], out[0][2], out[0][3]]), 0);
    }

    #[test]
    fn data_shards_pass_through_in_order() {
        let mut enc = ParityFec::new(2);
        let mut dec = ParityFec::new(2);
        let shards = encode_all(&mut enc, &[b"one", b"two"]);
        let got: Vec<Vec<u8>> = shards
            .iter()
            .flat_map(|s| dec.decode(s).unwrap())
            .collect();
        assert_eq!(got, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn any_single_missing_data_shard_is_rebuilt() {
        let datagrams: [&[u8]; 3] = [b"first", b"second segment", b"x"];
        for lost in 0..3 {
            let mut enc = ParityFec::new(3);
            let mut dec = ParityFec::new(3);
            let shards = encode_all(&mut enc, &datagrams);
            let mut got = Vec::new();
            for (i, s) in shards.iter().enumerate() {
                if i != lost {
                    got.extend(dec.decode(s).unwrap());
                }
            }
            let mut want: Vec<Vec<u8>> = datagrams.iter().map(|d| d.to_vec()).collect();
            let rebuilt = want.remove(lost);
            want.push(rebuilt);
            assert_eq!(got, want, "lost shard {lost}");
        }
    }

    #[test]
    fn duplicates_and_two_losses_yield_nothing_extra() {
        let mut enc = ParityFec::new(3);
        let mut dec = ParityFec::new(3);
        let shards = encode_all(&mut enc, &[b"a", b"b", b"c"]);
        assert_eq!(dec.decode(&shards[0]).unwrap().len(), 1);
        assert!(dec.decode(&shards[0]).unwrap().is_empty());
        // shards 1 and 2 lost
        assert!(dec.decode(&shards[3]).unwrap().is_empty());
    }

    #[test]
    fn malformed_shards_rejected() {
        let mut dec = ParityFec::new(2);
        assert_eq!(dec.decode(&[0; 4]), Err(FecError::Short(4)));
        let mut bad = vec![0u8; 10];
        bad[4..6].copy_from_slice(&0x1234u16.to_le_bytes());
        assert_eq!(dec.decode(&bad), Err(FecError::Flag(0x1234)));
        // seq 0 is a data slot
        bad[4..6].copy_from_slice(&FLAG_PARITY.to_le_bytes());
        assert_eq!(dec.decode(&bad), Err(FecError::Position));
    }

    #[test]
    fn decoder_state_is_bounded() {
        let mut enc = ParityFec::new(2);
        let mut dec = ParityFec::new(2);
        let mut shards = Vec::new();
        for i in 0..20u8 {
            enc.encode(&[i], &mut shards);
        }
        for s in &shards {
            dec.decode(s).unwrap();
        }
        assert!(dec.groups.len() <= GROUP_WINDOW);
    }

    #[test]
    fn no_fec_is_identity() {
        let mut codec = NoFec;
        let mut out = Vec::new();
        codec.encode(b"raw", &mut out);
        assert_eq!(out, vec![b"raw".to_vec()]);
        assert_eq!(codec.decode(b"raw").unwrap(), vec![b"raw".to_vec()]);
        assert_eq!(codec.header_len(), 0);
    }
}
