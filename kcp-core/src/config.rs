//! Per-channel configuration. Applied when a connection is created.

use serde::Deserialize;

use crate::engine::Kcp;
use crate::protocol::{INTERVAL_MAX, INTERVAL_MIN, MTU_MAX, MTU_MIN, OVERHEAD};

/// Transmission mode: bundles nodelay, interval, fast resend and congestion control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Normal,
    Fast,
    Fastest,
}

impl Mode {
    /// `(nodelay, interval, resend, nc)`.
    pub fn params(self) -> (bool, u32, u32, bool) {
        match self {
            Mode::Normal => (false, 40, 0, false),
            Mode::Fast => (true, 20, 2, true),
            Mode::Fastest => (true, 10, 2, true),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(Mode::Normal),
            "fast" => Ok(Mode::Fast),
            "fastest" => Ok(Mode::Fastest),
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("mtu {0} below minimum {}", MTU_MIN)]
    MtuTooSmall(usize),
    #[error("mtu {0} above maximum {}", MTU_MAX)]
    MtuTooLarge(usize),
    #[error("window sizes must be non-zero")]
    ZeroWindow,
    #[error("interval {0} outside {}..={} ms", INTERVAL_MIN, INTERVAL_MAX)]
    Interval(u32),
    #[error("fec needs at least 2 data shards, got {0}")]
    FecShards(usize),
    #[error("unknown mode {0:?}")]
    UnknownMode(String),
}

/// Channel options. Every field has a default; `mode` supplies the timing bundle
/// unless `nodelay`/`interval`/`fast_resend`/`no_cwnd` override it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ChannelConfig {
    pub mode: Mode,
    pub nodelay: Option<bool>,
    pub interval: Option<u32>,
    pub fast_resend: Option<u32>,
    pub no_cwnd: Option<bool>,
    /// Floor for the computed RTO (ms). Defaults to the nodelay-dependent minimum.
    pub min_rto: Option<u32>,
    /// Transmissions after which a segment is no longer fast-retransmitted. 0 removes the limit.
    pub fast_limit: Option<u32>,
    pub snd_wnd: u32,
    pub rcv_wnd: u32,
    pub mtu: usize,
    /// Close after this long without inbound data (ms). 0 disables.
    pub timeout_ms: u64,
    pub stream: bool,
    /// Flush acks right after input instead of on the next tick.
    pub ack_no_delay: bool,
    /// Flush right after queuing writes.
    pub fast_flush: bool,
    pub crc32_check: bool,
    /// Data shards per parity group. 0 disables FEC.
    pub fec_data_shards: usize,
    /// Key sessions by conv instead of peer address.
    pub use_conv_channel: bool,
    /// Staged writes per connection. 0 means the default bound.
    pub write_buffer_size: usize,
    /// Staged inbound datagrams per connection. 0 means the default bound.
    pub read_buffer_size: usize,
    /// Client conv. 0 picks a random one.
    pub conv: u32,
}

pub const DEFAULT_STAGING: usize = 1024;

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Normal,
            nodelay: None,
            interval: None,
            fast_resend: None,
            no_cwnd: None,
            min_rto: None,
            fast_limit: None,
            snd_wnd: 32,
            rcv_wnd: 128,
            mtu: 1400,
            timeout_ms: 0,
            stream: false,
            ack_no_delay: false,
            fast_flush: true,
            crc32_check: false,
            fec_data_shards: 0,
            use_conv_channel: false,
            write_buffer_size: 0,
            read_buffer_size: 0,
            conv: 0,
        }
    }
}

impl ChannelConfig {
    pub fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu < MTU_MIN || self.mtu < OVERHEAD {
            return Err(ConfigError::MtuTooSmall(self.mtu));
        }
        if self.mtu > MTU_MAX {
            return Err(ConfigError::MtuTooLarge(self.mtu));
        }
        if self.snd_wnd == 0 || self.rcv_wnd == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if let Some(interval) = self.interval {
            if !(INTERVAL_MIN..=INTERVAL_MAX).contains(&interval) {
                return Err(ConfigError::Interval(interval));
            }
        }
        if self.fec_data_shards == 1 {
            return Err(ConfigError::FecShards(1));
        }
        Ok(())
    }

    /// Effective `(nodelay, interval, resend, nc)` after overrides.
    pub fn timing(&self) -> (bool, u32, u32, bool) {
        let (nodelay, interval, resend, nc) = self.mode.params();
        (
            self.nodelay.unwrap_or(nodelay),
            self.interval.unwrap_or(interval),
            self.fast_resend.unwrap_or(resend),
            self.no_cwnd.unwrap_or(nc),
        )
    }

    pub fn write_bound(&self) -> usize {
        if self.write_buffer_size == 0 {
            DEFAULT_STAGING
        } else {
            self.write_buffer_size
        }
    }

    pub fn read_bound(&self) -> usize {
        if self.read_buffer_size == 0 {
            DEFAULT_STAGING
        } else {
            self.read_buffer_size
        }
    }

    /// Bytes of framing ahead of the first segment; also where the conv field sits.
    pub fn conv_offset(&self) -> usize {
        let mut offset = 0;
        if self.crc32_check {
            offset += crate::integrity::CHECKSUM_LEN;
        }
        offset + crate::fec::codec(self.fec_data_shards).header_len()
    }

    /// Build an engine with these options applied.
    pub fn build_engine(&self, conv: u32) -> Result<Kcp, ConfigError> {
        self.validate()?;
        let mut kcp = Kcp::new(conv);
        let (nodelay, interval, resend, nc) = self.timing();
        kcp.nodelay(nodelay, interval, resend, nc);
        if let Some(min_rto) = self.min_rto {
            kcp.set_min_rto(min_rto);
        }
        if let Some(limit) = self.fast_limit {
            kcp.set_fast_limit(limit);
        }
        kcp.set_wndsize(self.snd_wnd, self.rcv_wnd);
        kcp.set_stream(self.stream);
        kcp.set_mtu(self.mtu - self.conv_offset())?;
        Ok(kcp)
    }
}
