//! KCP wire protocol: command codes and protocol constants.

/// Header bytes carried by every segment.
pub const OVERHEAD: usize = 24;

/// Minimum RTO in no-delay mode (ms).
pub const RTO_NDL: u32 = 30;
/// Minimum RTO in normal mode (ms).
pub const RTO_MIN: u32 = 100;
/// RTO before the first sample (ms).
pub const RTO_DEF: u32 = 200;
/// Upper RTO bound (ms).
pub const RTO_MAX: u32 = 60_000;

/// Ask the peer for its window.
pub const ASK_SEND: u32 = 1;
/// Tell the peer our window.
pub const ASK_TELL: u32 = 2;

pub const WND_SND: u32 = 32;
pub const WND_RCV: u32 = 128;
pub const MTU_DEF: usize = 1400;
/// Smallest MTU accepted by `set_mtu`.
pub const MTU_MIN: usize = 50;
/// Largest UDP payload over IPv4; also bounds the 16-bit FEC size field.
pub const MTU_MAX: usize = 65_507;

pub const INTERVAL: u32 = 100;
pub const INTERVAL_MIN: u32 = 10;
pub const INTERVAL_MAX: u32 = 5000;

pub const DEADLINK: u32 = 20;
pub const THRESH_INIT: u32 = 2;
pub const THRESH_MIN: u32 = 2;
/// Initial window-probe wait (ms).
pub const PROBE_INIT: u32 = 7000;
/// Upper bound on the window-probe wait (ms).
pub const PROBE_LIMIT: u32 = 120_000;
/// Max transmissions of one segment that may still be triggered by fast retransmit.
pub const FASTACK_LIMIT: u32 = 5;

/// A message may not be split into this many fragments or more.
pub const MAX_FRAGMENTS: usize = WND_RCV as usize;

/// Segment command carried in the `cmd` header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Data.
    Push = 81,
    Ack = 82,
    /// Window probe (ask).
    WindowProbe = 83,
    /// Window size (tell).
    WindowTell = 84,
}

impl Command {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            81 => Some(Command::Push),
            82 => Some(Command::Ack),
            83 => Some(Command::WindowProbe),
            84 => Some(Command::WindowTell),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes_match_wire_values() {
        for cmd in [
            Command::Push,
            Command::Ack,
            Command::WindowProbe,
            Command::WindowTell,
        ] {
            assert_eq!(Command::from_u8(cmd.as_u8()), Some(cmd));
        }
        assert_eq!(Command::Push.as_u8(), 81);
        assert_eq!(Command::from_u8(80), None);
        assert_eq!(Command::from_u8(85), None);
    }
}
