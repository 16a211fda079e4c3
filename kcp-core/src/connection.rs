//! Per-connection state machine driven by one worker.
//!
//! A [`Connection`] owns the engine and the FEC codecs and is touched only by its worker.
//! The [`Mailbox`] is the part shared with other threads: bounded staging for outbound
//! payloads and inbound datagrams, plus single-flight wake flags.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::{ChannelConfig, ConfigError};
use crate::engine::{Kcp, Output, SendError};
use crate::fec::{self, FecCodec};
use crate::integrity;
use crate::seq::{after, diff};
use crate::stats::Stats;

/// Set-once-until-cleared flag. Only the caller that raises it schedules the drain.
#[derive(Debug, Default)]
pub struct WakeFlag(AtomicBool);

impl WakeFlag {
    /// True when this call moved the flag from clear to raised.
    pub fn raise(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    #[error("connection inactive")]
    Inactive,
    /// Staging is full; the unit was dropped.
    #[error("staging buffer full")]
    Backpressure,
}

/// Shared side of a connection.
#[derive(Debug)]
pub struct Mailbox {
    conv: u32,
    writes: Mutex<VecDeque<Vec<u8>>>,
    reads: Mutex<VecDeque<Vec<u8>>>,
    write_bound: usize,
    read_bound: usize,
    write_wake: WakeFlag,
    read_wake: WakeFlag,
    active: AtomicBool,
}

impl Mailbox {
    pub fn new(conv: u32, write_bound: usize, read_bound: usize) -> Self {
        Self {
            conv,
            writes: Mutex::new(VecDeque::new()),
            reads: Mutex::new(VecDeque::new()),
            write_bound,
            read_bound,
            write_wake: WakeFlag::default(),
            read_wake: WakeFlag::default(),
            active: AtomicBool::new(true),
        }
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stage an outbound payload. `Ok(true)` means the caller must schedule a write drain.
    pub fn push_write(&self, payload: Vec<u8>) -> Result<bool, WriteError> {
        if !self.is_active() {
            return Err(WriteError::Inactive);
        }
        {
            let mut writes = self.writes.lock();
            if writes.len() >= self.write_bound {
                return Err(WriteError::Backpressure);
            }
            writes.push_back(payload);
        }
        Ok(self.write_wake.raise())
    }

    /// Stage an inbound datagram. `Ok(true)` means the caller must schedule a read drain.
    pub fn push_read(&self, datagram: Vec<u8>) -> Result<bool, WriteError> {
        if !self.is_active() {
            return Err(WriteError::Inactive);
        }
        {
            let mut reads = self.reads.lock();
            if reads.len() >= self.read_bound {
                return Err(WriteError::Backpressure);
            }
            reads.push_back(datagram);
        }
        Ok(self.read_wake.raise())
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.lock().len()
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        self.writes.lock().clear();
        self.reads.lock().clear();
    }
}

/// Why a connection stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Nothing received within the configured timeout.
    Timeout,
    /// A segment reached the dead-link transmit count.
    DeadLink,
    /// Closed locally.
    Local,
}

/// Result of a scheduled tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Run the next tick after this many ms.
    Rearm(u32),
    Closed(CloseReason),
}

/// FEC-encodes and optionally checksums each flushed datagram before the real sink.
struct FramedOutput<'a> {
    fec: &'a mut dyn FecCodec,
    crc32: bool,
    inner: &'a mut dyn Output,
    shards: Vec<Vec<u8>>,
    sealed: Vec<u8>,
}

impl Output for FramedOutput<'_> {
    fn output(&mut self, data: &[u8]) {
        self.shards.clear();
        self.fec.encode(data, &mut self.shards);
        for shard in &self.shards {
            if self.crc32 {
                self.sealed.clear();
                integrity::seal(shard, &mut self.sealed);
                self.inner.output(&self.sealed);
            } else {
                self.inner.output(shard);
            }
        }
    }
}

/// Random non-zero conv for a new client connection.
pub fn random_conv() -> u32 {
    loop {
        let conv = rand::random::<u32>();
        if conv != 0 {
            return conv;
        }
    }
}

/// Worker-owned connection: engine plus framing, staging drains and tick logic.
pub struct Connection {
    kcp: Kcp,
    mailbox: Arc<Mailbox>,
    fec_encoder: Box<dyn FecCodec>,
    fec_decoder: Box<dyn FecCodec>,
    crc32: bool,
    ack_no_delay: bool,
    fast_flush: bool,
    stream: bool,
    timeout_ms: u64,
    last_recv: u32,
    ts_update: Option<u32>,
    active: bool,
}

impl Connection {
    /// Build from `config`. `now` (ms) starts the inactivity clock.
    pub fn new(conv: u32, config: &ChannelConfig, now: u32) -> Result<Self, ConfigError> {
        let kcp = config.build_engine(conv)?;
        let mailbox = Arc::new(Mailbox::new(
            conv,
            config.write_bound(),
            config.read_bound(),
        ));
        Ok(Self {
            kcp,
            mailbox,
            fec_encoder: fec::codec(config.fec_data_shards),
            fec_decoder: fec::codec(config.fec_data_shards),
            crc32: config.crc32_check,
            ack_no_delay: config.ack_no_delay,
            fast_flush: config.fast_flush,
            stream: config.stream,
            timeout_ms: config.timeout_ms,
            last_recv: now,
            ts_update: None,
            active: true,
        })
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    pub fn conv(&self) -> u32 {
        self.kcp.conv()
    }

    pub fn engine(&self) -> &Kcp {
        &self.kcp
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn stats(&self) -> &Stats {
        self.kcp.stats()
    }

    /// The engine can take more payloads.
    pub fn can_send(&self) -> bool {
        self.kcp.wait_snd() < 2 * self.kcp.snd_wnd() as usize
    }

    /// Unwrap checksum and FEC framing, then feed the engine.
    fn ingest(&mut self, raw: &[u8], now: u32) -> bool {
        let body = if self.crc32 {
            match integrity::open(raw) {
                Ok(body) => body,
                Err(e) => {
                    trace!(conv = self.conv(), error = %e, "dropping datagram");
                    self.kcp.stats_mut().in_csum_errors += 1;
                    return false;
                }
            }
        } else {
            raw
        };
        let datagrams = match self.fec_decoder.decode(body) {
            Ok(d) => d,
            Err(e) => {
                debug!(conv = self.conv(), error = %e, "dropping fec shard");
                self.kcp.stats_mut().in_errs += 1;
                return false;
            }
        };
        let mut accepted = false;
        for datagram in datagrams {
            match self.kcp.input(&datagram, now) {
                Ok(()) => accepted = true,
                Err(e) => debug!(conv = self.conv(), error = %e, "input rejected"),
            }
        }
        accepted
    }

    fn framed<'a>(
        fec: &'a mut Box<dyn FecCodec>,
        crc32: bool,
        inner: &'a mut dyn Output,
    ) -> FramedOutput<'a> {
        FramedOutput {
            fec: fec.as_mut(),
            crc32,
            inner,
            shards: Vec::new(),
            sealed: Vec::new(),
        }
    }

    /// Flush through the framing layers. Returns the engine's next-flush delay.
    pub fn flush(&mut self, ack_only: bool, now: u32, out: &mut dyn Output) -> u32 {
        let mut framed = Self::framed(&mut self.fec_encoder, self.crc32, out);
        self.kcp.flush(ack_only, now, &mut framed)
    }

    /// Input every staged datagram, then return the messages now complete
    /// (one coalesced buffer in stream mode).
    pub fn drain_reads(&mut self, now: u32, out: &mut dyn Output) -> Vec<Vec<u8>> {
        self.mailbox.read_wake.clear();
        if !self.active {
            return Vec::new();
        }
        let staged: Vec<Vec<u8>> = self.mailbox.reads.lock().drain(..).collect();
        let mut any = false;
        for raw in &staged {
            any |= self.ingest(raw, now);
        }
        if any {
            self.last_recv = now;
        }
        if self.ack_no_delay && self.kcp.has_pending_acks() {
            self.flush(true, now, out);
        }

        let mut messages = Vec::new();
        if self.stream {
            let mut buf = Vec::new();
            if self.kcp.recv_stream(&mut buf).is_ok() {
                messages.push(buf);
            }
        } else {
            while self.kcp.can_recv() {
                let mut buf = Vec::new();
                if self.kcp.recv(&mut buf).is_err() {
                    break;
                }
                messages.push(buf);
            }
        }
        messages
    }

    /// Move staged payloads into the engine while it has room; flush when it filled up
    /// or fast flush is on and there is something to send.
    pub fn drain_writes(&mut self, now: u32, out: &mut dyn Output) -> Result<(), SendError> {
        self.mailbox.write_wake.clear();
        if !self.active {
            return Ok(());
        }
        let mut result = Ok(());
        while self.can_send() {
            let next = self.mailbox.writes.lock().pop_front();
            let Some(payload) = next else {
                break;
            };
            if let Err(e) = self.kcp.send(&payload) {
                result = Err(e);
                break;
            }
        }
        if !self.can_send() || (self.fast_flush && self.kcp.check_flush()) {
            let next = self.flush(false, now, out);
            self.ts_update = Some(now.wrapping_add(next));
        }
        result
    }

    /// Scheduled tick: timeout and dead-link checks, deferred-update handling,
    /// `update`, then the next wake from `check`.
    pub fn tick(&mut self, now: u32, out: &mut dyn Output) -> Tick {
        if !self.active {
            return Tick::Closed(CloseReason::Local);
        }
        if self.timeout_ms > 0 && diff(now, self.last_recv) as i64 > self.timeout_ms as i64 {
            debug!(conv = self.conv(), "connection timed out");
            self.close();
            return Tick::Closed(CloseReason::Timeout);
        }
        if self.kcp.is_dead() {
            warn!(conv = self.conv(), "closing dead link");
            self.close();
            return Tick::Closed(CloseReason::DeadLink);
        }
        if let Some(at) = self.ts_update {
            if after(at, now) {
                return Tick::Rearm(diff(at, now) as u32);
            }
            self.ts_update = None;
        }

        {
            let mut framed = Self::framed(&mut self.fec_encoder, self.crc32, out);
            self.kcp.update(now, &mut framed);
        }
        let delay = delay_until(self.kcp.check(now), now);

        if self.mailbox.pending_writes() > 0 && self.can_send() {
            if let Err(e) = self.drain_writes(now, out) {
                warn!(conv = self.conv(), error = %e, "staged payload rejected");
            }
        }
        Tick::Rearm(delay)
    }

    /// Stop the connection and release queued data. Idempotent.
    pub fn close(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.mailbox.deactivate();
        self.kcp.clear();
    }
}

fn delay_until(at: u32, now: u32) -> u32 {
    std::cmp::max(diff(at, now), 1) as u32
}
