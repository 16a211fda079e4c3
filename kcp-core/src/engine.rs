//! Per-connection ARQ engine: windows, acks, RTO estimation, fast retransmit, congestion window.
//! Host-driven: no I/O and no clock. The host passes timestamps (ms) and an [`Output`] sink.

use std::cmp;
use std::collections::VecDeque;

use tracing::{trace, warn};

use crate::config::ConfigError;
use crate::protocol::*;
use crate::segment::{Segment, SegmentPool};
use crate::seq::{after, after_eq, before, diff, in_window};
use crate::stats::Stats;
use crate::wire::{self, DecodeError, SegmentHeader};

/// Receives each assembled datagram produced by [`Kcp::flush`].
pub trait Output {
    fn output(&mut self, data: &[u8]);
}

impl<F: FnMut(&[u8])> Output for F {
    fn output(&mut self, data: &[u8]) {
        self(data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("empty message")]
    Empty,
    #[error("message needs {0} fragments (limit {})", MAX_FRAGMENTS)]
    TooManyFragments(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    #[error("receive queue empty")]
    Empty,
    /// Fragments of the head message are still missing.
    #[error("message incomplete")]
    Incomplete,
}

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("conv mismatch: expected {expected}, got {got}")]
    ConvMismatch { expected: u32, got: u32 },
    #[error("malformed segment: {0}")]
    Malformed(#[from] DecodeError),
    #[error("unknown command {0}")]
    UnknownCommand(u8),
}

/// Protocol engine for one connection.
pub struct Kcp {
    conv: u32,
    mtu: usize,
    mss: usize,
    state: i32,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    ssthresh: u32,
    rx_rttval: u32,
    rx_srtt: u32,
    rx_rto: u32,
    rx_minrto: u32,

    snd_wnd: u32,
    rcv_wnd: u32,
    rmt_wnd: u32,
    cwnd: u32,
    incr: u32,
    probe: u32,

    current: u32,
    interval: u32,
    ts_flush: u32,
    updated: bool,
    flush_requested: bool,

    ts_probe: u32,
    probe_wait: u32,
    dead_link: u32,

    nodelay: bool,
    fastresend: u32,
    fastlimit: u32,
    nocwnd: bool,
    stream: bool,

    snd_queue: VecDeque<Segment>,
    snd_buf: VecDeque<Segment>,
    rcv_queue: VecDeque<Segment>,
    rcv_buf: VecDeque<Segment>,
    acklist: Vec<(u32, u32)>,

    buffer: Vec<u8>,
    pool: SegmentPool,
    stats: Stats,
}

impl Kcp {
    pub fn new(conv: u32) -> Self {
        Self {
            conv,
            mtu: MTU_DEF,
            mss: MTU_DEF - OVERHEAD,
            state: 0,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            ssthresh: THRESH_INIT,
            rx_rttval: 0,
            rx_srtt: 0,
            rx_rto: RTO_DEF,
            rx_minrto: RTO_MIN,
            snd_wnd: WND_SND,
            rcv_wnd: WND_RCV,
            rmt_wnd: WND_RCV,
            cwnd: 1,
            incr: (MTU_DEF - OVERHEAD) as u32,
            probe: 0,
            current: 0,
            interval: INTERVAL,
            ts_flush: INTERVAL,
            updated: false,
            flush_requested: false,
            ts_probe: 0,
            probe_wait: 0,
            dead_link: DEADLINK,
            nodelay: false,
            fastresend: 0,
            fastlimit: FASTACK_LIMIT,
            nocwnd: false,
            stream: false,
            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            acklist: Vec::new(),
            buffer: Vec::with_capacity(MTU_DEF + OVERHEAD * 3),
            pool: SegmentPool::default(),
            stats: Stats::default(),
        }
    }

    /// Engine whose sequence counters start at `sn` on both sides. Both peers must agree.
    pub fn with_initial_sn(conv: u32, sn: u32) -> Self {
        let mut kcp = Self::new(conv);
        kcp.snd_una = sn;
        kcp.snd_nxt = sn;
        kcp.rcv_nxt = sn;
        kcp
    }

    // ---- application side ----

    /// Queue `buf` for transmission. Returns the number of bytes accepted.
    pub fn send(&mut self, mut buf: &[u8]) -> Result<usize, SendError> {
        let total = buf.len();

        if self.stream {
            if let Some(last) = self.snd_queue.back_mut() {
                if last.data.len() < self.mss {
                    let extend = cmp::min(self.mss - last.data.len(), buf.len());
                    last.data.extend_from_slice(&buf[..extend]);
                    last.frg = 0;
                    buf = &buf[extend..];
                }
            }
            if buf.is_empty() {
                self.stats.bytes_sent += total as u64;
                return Ok(total);
            }
        } else if buf.is_empty() {
            return Err(SendError::Empty);
        }

        let count = if buf.len() <= self.mss {
            1
        } else {
            (buf.len() + self.mss - 1) / self.mss
        };
        if !self.stream && count >= MAX_FRAGMENTS {
            return Err(SendError::TooManyFragments(count));
        }

        for i in 0..count {
            let size = cmp::min(self.mss, buf.len());
            let mut data = self.pool.take(size);
            data.extend_from_slice(&buf[..size]);
            buf = &buf[size..];
            let mut seg = Segment::with_data(data);
            seg.frg = if self.stream { 0 } else { (count - i - 1) as u8 };
            self.snd_queue.push_back(seg);
        }
        self.stats.bytes_sent += total as u64;
        Ok(total)
    }

    /// Size of the next complete message, `None` when nothing complete is queued.
    pub fn peek_size(&self) -> Option<usize> {
        let head = self.rcv_queue.front()?;
        if head.frg == 0 {
            return Some(head.data.len());
        }
        if self.rcv_queue.len() < head.frg as usize + 1 {
            return None;
        }
        let mut size = 0;
        for seg in &self.rcv_queue {
            size += seg.data.len();
            if seg.frg == 0 {
                break;
            }
        }
        Some(size)
    }

    pub fn can_recv(&self) -> bool {
        self.peek_size().is_some()
    }

    /// Append the next complete message to `out`. Returns its length.
    pub fn recv(&mut self, out: &mut Vec<u8>) -> Result<usize, RecvError> {
        if self.rcv_queue.is_empty() {
            return Err(RecvError::Empty);
        }
        let size = self.peek_size().ok_or(RecvError::Incomplete)?;
        let recover = self.rcv_queue.len() >= self.rcv_wnd as usize;

        out.reserve(size);
        while let Some(seg) = self.rcv_queue.pop_front() {
            out.extend_from_slice(&seg.data);
            let last = seg.frg == 0;
            self.pool.give(seg.data);
            if last {
                break;
            }
        }

        self.move_to_rcv_queue();

        // tell the peer the window reopened
        if recover && self.rcv_queue.len() < self.rcv_wnd as usize {
            self.probe |= ASK_TELL;
        }
        self.stats.bytes_received += size as u64;
        Ok(size)
    }

    /// Append every complete message currently queued to `out`, ignoring boundaries.
    pub fn recv_stream(&mut self, out: &mut Vec<u8>) -> Result<usize, RecvError> {
        let mut total = 0;
        loop {
            match self.recv(out) {
                Ok(n) => total += n,
                Err(e) if total == 0 => return Err(e),
                Err(_) => return Ok(total),
            }
        }
    }

    // ---- network side ----

    /// Feed one received datagram. Segments parsed before an error stay applied.
    pub fn input(&mut self, data: &[u8], current: u32) -> Result<(), InputError> {
        self.current = current;
        self.stats.in_pkts += 1;
        self.stats.in_bytes += data.len() as u64;

        let prev_una = self.snd_una;
        let mut max_ack: Option<u32> = None;
        let mut result = Ok(());
        let mut rest = data;

        if rest.len() < OVERHEAD {
            self.stats.in_errs += 1;
            return Err(DecodeError::Short(rest.len()).into());
        }

        while rest.len() >= OVERHEAD {
            let (header, payload, used) = match wire::decode_segment(rest) {
                Ok(v) => v,
                Err(e) => {
                    result = Err(e.into());
                    break;
                }
            };
            if header.conv != self.conv {
                result = Err(InputError::ConvMismatch {
                    expected: self.conv,
                    got: header.conv,
                });
                break;
            }
            let Some(cmd) = Command::from_u8(header.cmd) else {
                result = Err(InputError::UnknownCommand(header.cmd));
                break;
            };
            rest = &rest[used..];
            self.stats.in_segs += 1;

            self.rmt_wnd = header.wnd as u32;
            self.parse_una(header.una);
            self.shrink_buf();

            match cmd {
                Command::Ack => {
                    let rtt = diff(current, header.ts);
                    if rtt >= 0 {
                        self.update_ack(rtt);
                    }
                    self.parse_ack(header.sn);
                    self.shrink_buf();
                    max_ack = match max_ack {
                        Some(m) if !after(header.sn, m) => Some(m),
                        _ => Some(header.sn),
                    };
                }
                Command::Push => {
                    if before(header.sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) {
                        self.acklist.push((header.sn, header.ts));
                        if after_eq(header.sn, self.rcv_nxt) {
                            let mut data = self.pool.take(payload.len());
                            data.extend_from_slice(payload);
                            let seg = Segment {
                                conv: header.conv,
                                cmd: header.cmd,
                                frg: header.frg,
                                wnd: header.wnd,
                                ts: header.ts,
                                sn: header.sn,
                                una: header.una,
                                data,
                                ..Segment::default()
                            };
                            self.parse_data(seg);
                        } else {
                            self.stats.repeat_segs += 1;
                        }
                    } else {
                        self.stats.repeat_segs += 1;
                    }
                }
                Command::WindowProbe => {
                    self.probe |= ASK_TELL;
                }
                Command::WindowTell => {}
            }
        }

        if result.is_err() {
            self.stats.in_errs += 1;
        }

        if let Some(sn) = max_ack {
            self.parse_fastack(sn);
        }

        if after(self.snd_una, prev_una) && self.cwnd < self.rmt_wnd {
            self.grow_cwnd();
        }

        result
    }

    fn grow_cwnd(&mut self) {
        let mss = self.mss as u64;
        let mut incr = self.incr as u64;
        if self.cwnd < self.ssthresh {
            self.cwnd += 1;
            incr += mss;
        } else {
            incr = incr.max(mss);
            incr += (mss * mss) / incr + (mss / 16);
            if (self.cwnd as u64 + 1) * mss <= incr {
                self.cwnd = ((incr + mss - 1) / mss.max(1)).min(u32::MAX as u64) as u32;
            }
        }
        if self.cwnd > self.rmt_wnd {
            self.cwnd = self.rmt_wnd;
            incr = self.rmt_wnd as u64 * mss;
        }
        self.incr = incr.min(u32::MAX as u64) as u32;
    }

    fn update_ack(&mut self, rtt: i32) {
        let rtt = rtt as i64;
        if self.rx_srtt == 0 {
            self.rx_srtt = rtt as u32;
            self.rx_rttval = (rtt / 2) as u32;
        } else {
            let srtt = self.rx_srtt as i64;
            let delta = (rtt - srtt).abs();
            self.rx_rttval = ((3 * self.rx_rttval as i64 + delta) / 4) as u32;
            self.rx_srtt = cmp::max(1, (7 * srtt + rtt) / 8) as u32;
        }
        let rto = self.rx_srtt as u64 + cmp::max(self.interval as u64, 4 * self.rx_rttval as u64);
        self.rx_rto = rto.clamp(self.rx_minrto as u64, RTO_MAX as u64) as u32;
    }

    fn shrink_buf(&mut self) {
        self.snd_una = match self.snd_buf.front() {
            Some(seg) => seg.sn,
            None => self.snd_nxt,
        };
    }

    fn parse_ack(&mut self, sn: u32) {
        if before(sn, self.snd_una) || after_eq(sn, self.snd_nxt) {
            return;
        }
        let mut found = None;
        for (i, seg) in self.snd_buf.iter().enumerate() {
            if seg.sn == sn {
                found = Some(i);
                break;
            }
            if before(sn, seg.sn) {
                break;
            }
        }
        if let Some(seg) = found.and_then(|i| self.snd_buf.remove(i)) {
            self.pool.give(seg.data);
        }
    }

    fn parse_una(&mut self, una: u32) {
        while let Some(seg) = self.snd_buf.front() {
            if !before(seg.sn, una) {
                break;
            }
            if let Some(seg) = self.snd_buf.pop_front() {
                self.pool.give(seg.data);
            }
        }
    }

    fn parse_fastack(&mut self, sn: u32) {
        if before(sn, self.snd_una) || after_eq(sn, self.snd_nxt) {
            return;
        }
        for seg in self.snd_buf.iter_mut() {
            if before(sn, seg.sn) {
                break;
            }
            if seg.sn != sn {
                seg.fastack += 1;
            }
        }
    }

    fn parse_data(&mut self, seg: Segment) {
        let sn = seg.sn;
        if !in_window(sn, self.rcv_nxt, self.rcv_nxt.wrapping_add(self.rcv_wnd)) {
            self.stats.repeat_segs += 1;
            self.pool.give(seg.data);
            return;
        }

        let mut repeat = false;
        let mut at = 0;
        for i in (0..self.rcv_buf.len()).rev() {
            let other = self.rcv_buf[i].sn;
            if other == sn {
                repeat = true;
                break;
            }
            if after(sn, other) {
                at = i + 1;
                break;
            }
        }

        if repeat {
            self.stats.repeat_segs += 1;
            self.pool.give(seg.data);
        } else {
            self.rcv_buf.insert(at, seg);
        }

        self.move_to_rcv_queue();
    }

    fn move_to_rcv_queue(&mut self) {
        while let Some(seg) = self.rcv_buf.front() {
            if seg.sn != self.rcv_nxt || self.rcv_queue.len() >= self.rcv_wnd as usize {
                break;
            }
            if let Some(seg) = self.rcv_buf.pop_front() {
                self.rcv_queue.push_back(seg);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            }
        }
    }

    fn wnd_unused(&self) -> u16 {
        let used = self.rcv_queue.len() as u32;
        if used < self.rcv_wnd {
            cmp::min(self.rcv_wnd - used, u16::MAX as u32) as u16
        } else {
            0
        }
    }

    // ---- timers ----

    /// Emit pending acks, probes, new data and due retransmissions.
    /// Returns the delay (ms) until the earliest retransmit deadline, at most `interval`.
    pub fn flush(&mut self, ack_only: bool, current: u32, output: &mut dyn Output) -> u32 {
        self.current = current;
        let wnd = self.wnd_unused();
        let mut header = SegmentHeader {
            conv: self.conv,
            cmd: Command::Ack.as_u8(),
            wnd,
            una: self.rcv_nxt,
            ..SegmentHeader::default()
        };

        self.buffer.clear();
        for &(sn, ts) in &self.acklist {
            if self.buffer.len() + OVERHEAD > self.mtu {
                emit(&mut self.buffer, output, &mut self.stats);
            }
            header.sn = sn;
            header.ts = ts;
            push_header(&mut self.buffer, &header);
        }
        self.acklist.clear();

        if ack_only {
            emit(&mut self.buffer, output, &mut self.stats);
            return self.interval;
        }

        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = PROBE_INIT;
                self.ts_probe = current.wrapping_add(self.probe_wait);
            } else if after_eq(current, self.ts_probe) {
                if self.probe_wait < PROBE_INIT {
                    self.probe_wait = PROBE_INIT;
                }
                self.probe_wait += self.probe_wait / 2;
                if self.probe_wait > PROBE_LIMIT {
                    self.probe_wait = PROBE_LIMIT;
                }
                self.ts_probe = current.wrapping_add(self.probe_wait);
                self.probe |= ASK_SEND;
            }
        } else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }

        header.sn = 0;
        header.ts = 0;
        if self.probe & ASK_SEND != 0 {
            header.cmd = Command::WindowProbe.as_u8();
            if self.buffer.len() + OVERHEAD > self.mtu {
                emit(&mut self.buffer, output, &mut self.stats);
            }
            push_header(&mut self.buffer, &header);
        }
        if self.probe & ASK_TELL != 0 {
            header.cmd = Command::WindowTell.as_u8();
            if self.buffer.len() + OVERHEAD > self.mtu {
                emit(&mut self.buffer, output, &mut self.stats);
            }
            push_header(&mut self.buffer, &header);
        }
        self.probe = 0;

        let cwnd = self.send_window();
        while before(self.snd_nxt, self.snd_una.wrapping_add(cwnd)) {
            let Some(mut seg) = self.snd_queue.pop_front() else {
                break;
            };
            seg.conv = self.conv;
            seg.cmd = Command::Push.as_u8();
            seg.wnd = wnd;
            seg.ts = current;
            seg.sn = self.snd_nxt;
            seg.una = self.rcv_nxt;
            seg.resendts = current;
            seg.rto = self.rx_rto;
            seg.fastack = 0;
            seg.xmit = 0;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.snd_buf.push_back(seg);
        }

        let resent = if self.fastresend > 0 {
            self.fastresend
        } else {
            u32::MAX
        };
        let rtomin = if self.nodelay { 0 } else { self.rx_rto >> 3 };

        let mut change = 0u32;
        let mut lost = false;
        let mut min_delay = self.interval;

        for seg in self.snd_buf.iter_mut() {
            let mut needsend = false;
            if seg.xmit == 0 {
                needsend = true;
                seg.xmit = 1;
                seg.rto = self.rx_rto;
                seg.resendts = current.wrapping_add(seg.rto).wrapping_add(rtomin);
            } else if after_eq(current, seg.resendts) {
                needsend = true;
                seg.xmit += 1;
                let step = if self.nodelay {
                    seg.rto / 2
                } else {
                    cmp::max(seg.rto, self.rx_rto)
                };
                seg.rto = seg.rto.saturating_add(step).min(RTO_MAX);
                seg.resendts = current.wrapping_add(seg.rto);
                lost = true;
                self.stats.lost_segs += 1;
                self.stats.retrans_segs += 1;
            } else if seg.fastack >= resent && (seg.xmit <= self.fastlimit || self.fastlimit == 0)
            {
                needsend = true;
                seg.xmit += 1;
                seg.fastack = 0;
                seg.resendts = current.wrapping_add(seg.rto);
                change += 1;
                self.stats.fast_retrans_segs += 1;
                self.stats.retrans_segs += 1;
            }

            if needsend {
                seg.ts = current;
                seg.wnd = wnd;
                seg.una = self.rcv_nxt;
                if self.buffer.len() + OVERHEAD + seg.data.len() > self.mtu {
                    emit(&mut self.buffer, output, &mut self.stats);
                }
                if let Err(e) = seg.encode(&mut self.buffer) {
                    warn!(conv = self.conv, sn = seg.sn, error = %e, "segment encode failed");
                }
                self.stats.out_segs += 1;
                if seg.xmit >= self.dead_link && self.state == 0 {
                    warn!(conv = self.conv, sn = seg.sn, xmit = seg.xmit, "dead link");
                    self.state = -1;
                }
            }

            let due = diff(seg.resendts, current);
            if due > 0 && (due as u32) < min_delay {
                min_delay = due as u32;
            }
        }

        emit(&mut self.buffer, output, &mut self.stats);

        if change > 0 {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.ssthresh = cmp::max(inflight / 2, THRESH_MIN);
            self.cwnd = self.ssthresh.saturating_add(resent);
            self.incr = self.cwnd.saturating_mul(self.mss as u32);
        }
        if lost {
            self.ssthresh = cmp::max(self.cwnd / 2, THRESH_MIN);
            self.cwnd = 1;
            self.incr = self.mss as u32;
        }
        if self.cwnd < 1 {
            self.cwnd = 1;
            self.incr = self.mss as u32;
        }

        self.flush_requested = false;
        if lost || change > 0 {
            trace!(conv = self.conv, cwnd = self.cwnd, ssthresh = self.ssthresh, "window cut");
        }
        min_delay
    }

    /// Effective send window: min(snd_wnd, rmt_wnd), and cwnd unless disabled.
    pub fn send_window(&self) -> u32 {
        let mut wnd = cmp::min(self.snd_wnd, self.rmt_wnd);
        if !self.nocwnd {
            wnd = cmp::min(self.cwnd, wnd);
        }
        wnd
    }

    /// Periodic driver. Flushes when the flush clock is due, a flush was requested,
    /// or a retransmit deadline has passed.
    pub fn update(&mut self, current: u32, output: &mut dyn Output) {
        self.current = current;
        if !self.updated {
            self.updated = true;
            self.ts_flush = current;
        }

        let mut slap = diff(current, self.ts_flush);
        if !(-10_000..10_000).contains(&slap) {
            self.ts_flush = current;
            slap = 0;
        }

        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if after_eq(current, self.ts_flush) {
                self.ts_flush = current.wrapping_add(self.interval);
            }
            self.flush(false, current, output);
        } else if self.flush_requested || self.retransmit_due(current) {
            self.flush(false, current, output);
        }
    }

    fn retransmit_due(&self, current: u32) -> bool {
        self.snd_buf
            .iter()
            .any(|seg| seg.xmit == 0 || after_eq(current, seg.resendts))
    }

    /// When `update` must run next. Never earlier than `current`.
    pub fn check(&self, current: u32) -> u32 {
        if !self.updated || self.flush_requested {
            return current;
        }

        let mut ts_flush = self.ts_flush;
        let slap = diff(current, ts_flush);
        if !(-10_000..10_000).contains(&slap) {
            ts_flush = current;
        }
        if after_eq(current, ts_flush) {
            return current;
        }

        let tm_flush = diff(ts_flush, current);
        let mut tm_packet = i32::MAX;
        for seg in &self.snd_buf {
            let d = diff(seg.resendts, current);
            if d <= 0 || seg.xmit == 0 {
                return current;
            }
            tm_packet = cmp::min(tm_packet, d);
        }

        let minimal = cmp::min(cmp::min(tm_packet, tm_flush) as u32, self.interval);
        current.wrapping_add(minimal)
    }

    /// Whether a flush would emit anything.
    pub fn check_flush(&self) -> bool {
        !self.acklist.is_empty()
            || self.probe != 0
            || !self.snd_buf.is_empty()
            || !self.snd_queue.is_empty()
    }

    /// Make the next `check` return immediately and the next `update` flush.
    pub fn request_flush(&mut self) {
        self.flush_requested = true;
    }

    pub fn has_pending_acks(&self) -> bool {
        !self.acklist.is_empty()
    }

    // ---- configuration ----

    pub fn set_mtu(&mut self, mtu: usize) -> Result<(), ConfigError> {
        if mtu < MTU_MIN || mtu < OVERHEAD {
            return Err(ConfigError::MtuTooSmall(mtu));
        }
        if mtu > MTU_MAX {
            return Err(ConfigError::MtuTooLarge(mtu));
        }
        self.mtu = mtu;
        self.mss = mtu - OVERHEAD;
        self.buffer = Vec::with_capacity(mtu + OVERHEAD * 3);
        Ok(())
    }

    /// `nodelay` lowers the minimum RTO and slows RTO backoff; `resend` is the fast
    /// retransmit threshold (0 = off); `nc` disables the congestion window.
    pub fn nodelay(&mut self, nodelay: bool, interval: u32, resend: u32, nc: bool) {
        self.nodelay = nodelay;
        self.rx_minrto = if nodelay { RTO_NDL } else { RTO_MIN };
        self.set_interval(interval);
        self.fastresend = resend;
        self.nocwnd = nc;
    }

    pub fn set_interval(&mut self, interval: u32) {
        self.interval = interval.clamp(INTERVAL_MIN, INTERVAL_MAX);
    }

    /// Zero leaves a side unchanged. The receive window never goes below the fragment limit.
    pub fn set_wndsize(&mut self, snd_wnd: u32, rcv_wnd: u32) {
        if snd_wnd > 0 {
            self.snd_wnd = snd_wnd;
        }
        if rcv_wnd > 0 {
            self.rcv_wnd = cmp::max(rcv_wnd, WND_RCV);
        }
    }

    pub fn set_stream(&mut self, stream: bool) {
        self.stream = stream;
    }

    pub fn set_min_rto(&mut self, min_rto: u32) {
        self.rx_minrto = min_rto;
    }

    /// 0 removes the limit.
    pub fn set_fast_limit(&mut self, limit: u32) {
        self.fastlimit = limit;
    }

    pub fn set_dead_link(&mut self, xmit: u32) {
        self.dead_link = xmit;
    }

    // ---- queries ----

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn min_rto(&self) -> u32 {
        self.rx_minrto
    }

    pub fn fast_limit(&self) -> u32 {
        self.fastlimit
    }

    /// 0 while alive, -1 once a segment hit the dead-link transmit count.
    pub fn state(&self) -> i32 {
        self.state
    }

    pub fn is_dead(&self) -> bool {
        self.state < 0
    }

    /// Segments queued or in flight.
    pub fn wait_snd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    pub fn snd_buf_len(&self) -> usize {
        self.snd_buf.len()
    }

    pub fn rcv_queue_len(&self) -> usize {
        self.rcv_queue.len()
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn mss(&self) -> usize {
        self.mss
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    pub fn snd_wnd(&self) -> u32 {
        self.snd_wnd
    }

    pub fn rcv_wnd(&self) -> u32 {
        self.rcv_wnd
    }

    pub fn rmt_wnd(&self) -> u32 {
        self.rmt_wnd
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn rto(&self) -> u32 {
        self.rx_rto
    }

    pub fn srtt(&self) -> u32 {
        self.rx_srtt
    }

    pub fn snd_una(&self) -> u32 {
        self.snd_una
    }

    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }

    pub fn rcv_nxt(&self) -> u32 {
        self.rcv_nxt
    }

    pub fn is_stream(&self) -> bool {
        self.stream
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut Stats {
        &mut self.stats
    }

    /// Drop every queued segment, returning payload buffers to the pool.
    pub fn clear(&mut self) {
        for queue in [
            &mut self.snd_queue,
            &mut self.snd_buf,
            &mut self.rcv_queue,
            &mut self.rcv_buf,
        ] {
            for seg in queue.drain(..) {
                self.pool.give(seg.data);
            }
        }
        self.acklist.clear();
    }
}

fn push_header(buffer: &mut Vec<u8>, header: &SegmentHeader) {
    if let Err(e) = wire::encode_header(header, buffer) {
        warn!(conv = header.conv, cmd = header.cmd, error = %e, "header encode failed");
    }
}

fn emit(buffer: &mut Vec<u8>, output: &mut dyn Output, stats: &mut Stats) {
    if buffer.is_empty() {
        return;
    }
    output.output(buffer);
    stats.out_pkts += 1;
    stats.out_bytes += buffer.len() as u64;
    buffer.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(out: &mut Vec<Vec<u8>>) -> impl FnMut(&[u8]) + '_ {
        move |d: &[u8]| out.push(d.to_vec())
    }

    fn segments(datagram: &[u8]) -> Vec<SegmentHeader> {
        let mut rest = datagram;
        let mut headers = Vec::new();
        while !rest.is_empty() {
            let (h, _, used) = wire::decode_segment(rest).unwrap();
            headers.push(h);
            rest = &rest[used..];
        }
        headers
    }

    #[test]
    fn send_fragments_with_descending_frg() {
        let mut kcp = Kcp::new(1);
        kcp.set_mtu(100).unwrap();
        let payload = vec![7u8; 76 * 3 + 10];
        assert_eq!(kcp.send(&payload), Ok(payload.len()));
        let frgs: Vec<u8> = kcp.snd_queue.iter().map(|s| s.frg).collect();
        assert_eq!(frgs, vec![3, 2, 1, 0]);
        assert_eq!(kcp.wait_snd(), 4);
    }

    #[test]
    fn send_rejects_empty_and_oversized_messages() {
        let mut kcp = Kcp::new(1);
        assert_eq!(kcp.send(b""), Err(SendError::Empty));
        let too_big = vec![0u8; kcp.mss() * MAX_FRAGMENTS];
        assert_eq!(
            kcp.send(&too_big),
            Err(SendError::TooManyFragments(MAX_FRAGMENTS))
        );
        assert_eq!(kcp.wait_snd(), 0);
    }

    #[test]
    fn stream_mode_tops_up_tail_segment() {
        let mut kcp = Kcp::new(1);
        kcp.set_stream(true);
        kcp.send(b"abc").unwrap();
        kcp.send(b"def").unwrap();
        assert_eq!(kcp.snd_queue.len(), 1);
        assert_eq!(kcp.snd_queue[0].data, b"abcdef");
        assert_eq!(kcp.snd_queue[0].frg, 0);
        assert_eq!(kcp.send(b""), Ok(0));
    }

    #[test]
    fn set_mtu_rejects_tiny_values() {
        let mut kcp = Kcp::new(1);
        assert!(matches!(kcp.set_mtu(20), Err(ConfigError::MtuTooSmall(20))));
        assert!(matches!(kcp.set_mtu(49), Err(ConfigError::MtuTooSmall(49))));
        kcp.set_mtu(50).unwrap();
        assert_eq!(kcp.mss(), 26);
    }

    #[test]
    fn set_mtu_rejects_oversized_values() {
        let mut kcp = Kcp::new(1);
        assert!(matches!(
            kcp.set_mtu(70_000),
            Err(ConfigError::MtuTooLarge(70_000))
        ));
        assert_eq!(kcp.mtu(), MTU_DEF);
        kcp.set_mtu(MTU_MAX).unwrap();
        assert_eq!(kcp.mss(), MTU_MAX - OVERHEAD);
    }

    #[test]
    fn congestion_window_growth_at_largest_mss_does_not_overflow() {
        let mut kcp = Kcp::new(1);
        kcp.set_mtu(MTU_MAX).unwrap();
        kcp.rmt_wnd = u16::MAX as u32;
        kcp.ssthresh = 2;
        kcp.cwnd = 1_000;
        kcp.incr = u32::MAX - 1;
        kcp.grow_cwnd();
        assert_eq!(kcp.cwnd, u16::MAX as u32);
        assert_eq!(
            kcp.incr as u64,
            u16::MAX as u64 * (MTU_MAX - OVERHEAD) as u64
        );
    }

    #[test]
    fn input_rejects_foreign_conv_and_short_data() {
        let mut a = Kcp::new(1);
        let mut b = Kcp::new(2);
        a.send(b"x").unwrap();
        let mut wire = Vec::new();
        a.flush(false, 0, &mut collect(&mut wire));
        assert!(matches!(
            b.input(&wire[0], 0),
            Err(InputError::ConvMismatch { expected: 2, got: 1 })
        ));
        assert!(matches!(
            b.input(&[1, 2, 3], 0),
            Err(InputError::Malformed(DecodeError::Short(3)))
        ));
        assert_eq!(b.stats().in_errs, 2);
        assert!(!b.can_recv());
    }

    #[test]
    fn unknown_command_keeps_earlier_segments() {
        let mut a = Kcp::new(1);
        a.send(b"ok").unwrap();
        let mut wire = Vec::new();
        a.flush(false, 0, &mut collect(&mut wire));
        let mut datagram = wire[0].clone();
        let bogus = SegmentHeader {
            conv: 1,
            cmd: 99,
            ..SegmentHeader::default()
        };
        wire::encode_header(&bogus, &mut datagram).unwrap();

        let mut b = Kcp::new(1);
        assert!(matches!(
            b.input(&datagram, 0),
            Err(InputError::UnknownCommand(99))
        ));
        let mut out = Vec::new();
        assert_eq!(b.recv(&mut out), Ok(2));
        assert_eq!(out, b"ok");
    }

    #[test]
    fn acks_are_batched_by_mtu() {
        let mut kcp = Kcp::new(1);
        kcp.set_mtu(OVERHEAD * 2 + 10).unwrap();
        for sn in 0..5 {
            kcp.acklist.push((sn, 0));
        }
        let mut wire = Vec::new();
        kcp.flush(true, 0, &mut collect(&mut wire));
        assert_eq!(wire.len(), 3);
        let acks: usize = wire.iter().map(|d| segments(d).len()).sum();
        assert_eq!(acks, 5);
        assert!(wire.iter().all(|d| d.len() <= kcp.mtu()));
        assert!(!kcp.has_pending_acks());
    }

    #[test]
    fn ack_only_flush_sends_no_data() {
        let mut kcp = Kcp::new(1);
        kcp.send(b"data").unwrap();
        let mut wire = Vec::new();
        kcp.flush(true, 0, &mut collect(&mut wire));
        assert!(wire.is_empty());
        assert_eq!(kcp.snd_buf_len(), 0);
    }

    #[test]
    fn rtt_sample_sets_srtt_and_rto() {
        let mut kcp = Kcp::new(1);
        kcp.update_ack(100);
        assert_eq!(kcp.srtt(), 100);
        assert_eq!(kcp.rx_rttval, 50);
        assert_eq!(kcp.rto(), 300);
        kcp.update_ack(100);
        // rttval = (3*50 + 0)/4 = 37, srtt stays 100
        assert_eq!(kcp.rx_rttval, 37);
        assert_eq!(kcp.rto(), 248);
    }

    #[test]
    fn rto_is_clamped() {
        let mut kcp = Kcp::new(1);
        kcp.nodelay(false, 10, 0, false);
        kcp.update_ack(1);
        assert_eq!(kcp.rto(), RTO_MIN);
        kcp.nodelay(true, 10, 2, true);
        kcp.update_ack(1);
        assert_eq!(kcp.rto(), RTO_NDL);
        kcp.update_ack(200_000);
        assert_eq!(kcp.rto(), RTO_MAX);
    }

    #[test]
    fn nodelay_clamps_interval() {
        let mut kcp = Kcp::new(1);
        kcp.nodelay(true, 1, 2, true);
        assert_eq!(kcp.interval(), INTERVAL_MIN);
        kcp.set_interval(100_000);
        assert_eq!(kcp.interval(), INTERVAL_MAX);
    }

    #[test]
    fn rto_timeout_retransmits_and_cuts_cwnd() {
        let mut kcp = Kcp::new(1);
        kcp.nodelay(false, 10, 0, false);
        kcp.send(b"a").unwrap();
        let mut wire = Vec::new();
        kcp.update(0, &mut collect(&mut wire));
        assert_eq!(wire.len(), 1);
        // default rto 200 plus rto/8
        let deadline = kcp.snd_buf[0].resendts;
        assert_eq!(deadline, 225);
        wire.clear();
        kcp.flush(false, deadline, &mut collect(&mut wire));
        assert_eq!(wire.len(), 1);
        assert_eq!(kcp.snd_buf[0].xmit, 2);
        assert_eq!(kcp.snd_buf[0].rto, 400);
        assert_eq!(kcp.cwnd(), 1);
        assert_eq!(kcp.stats().lost_segs, 1);
    }

    #[test]
    fn repeated_timeouts_back_off_to_rto_max() {
        let mut kcp = Kcp::new(1);
        kcp.set_dead_link(100);
        kcp.send(b"a").unwrap();
        let mut sink = |_: &[u8]| {};
        kcp.flush(false, 0, &mut sink);
        let mut sent_at = 0u32;
        let mut gaps = Vec::new();
        for _ in 0..16 {
            let due = kcp.snd_buf[0].resendts;
            gaps.push(due.wrapping_sub(sent_at));
            sent_at = due;
            kcp.flush(false, due, &mut sink);
            assert!(kcp.snd_buf[0].rto <= RTO_MAX);
        }
        assert_eq!(&gaps[..3], &[225, 400, 800]);
        assert!(gaps.iter().all(|&gap| gap <= RTO_MAX), "{gaps:?}");
        assert_eq!(gaps[gaps.len() - 1], RTO_MAX);
        assert_eq!(gaps[gaps.len() - 2], RTO_MAX);
    }

    #[test]
    fn dead_link_marks_state() {
        let mut kcp = Kcp::new(1);
        kcp.set_dead_link(3);
        kcp.send(b"a").unwrap();
        let mut sink = |_: &[u8]| {};
        let mut now = 0u32;
        for _ in 0..4 {
            kcp.flush(false, now, &mut sink);
            now = kcp.snd_buf[0].resendts;
        }
        assert!(kcp.is_dead());
        assert_eq!(kcp.state(), -1);
    }

    #[test]
    fn zero_remote_window_triggers_probe() {
        let mut kcp = Kcp::new(1);
        kcp.rmt_wnd = 0;
        let mut wire = Vec::new();
        kcp.flush(false, 0, &mut collect(&mut wire));
        assert!(wire.is_empty());
        assert_eq!(kcp.probe_wait, PROBE_INIT);
        kcp.flush(false, PROBE_INIT, &mut collect(&mut wire));
        assert_eq!(wire.len(), 1);
        let headers = segments(&wire[0]);
        assert_eq!(headers[0].cmd, Command::WindowProbe.as_u8());
        assert_eq!(kcp.probe_wait, PROBE_INIT + PROBE_INIT / 2);
    }

    #[test]
    fn window_probe_is_answered_with_tell() {
        let mut asker = Kcp::new(1);
        asker.probe |= ASK_SEND;
        let mut wire = Vec::new();
        asker.flush(false, 0, &mut collect(&mut wire));

        let mut peer = Kcp::new(1);
        peer.input(&wire[0], 0).unwrap();
        let mut reply = Vec::new();
        peer.flush(false, 0, &mut collect(&mut reply));
        let headers = segments(&reply[0]);
        assert_eq!(headers[0].cmd, Command::WindowTell.as_u8());
        assert_eq!(headers[0].wnd as u32, WND_RCV);
    }

    #[test]
    fn check_is_immediate_before_first_update_and_after_request() {
        let mut kcp = Kcp::new(1);
        assert_eq!(kcp.check(500), 500);
        let mut sink = |_: &[u8]| {};
        kcp.update(500, &mut sink);
        assert_eq!(kcp.check(500), 500 + kcp.interval());
        kcp.request_flush();
        assert_eq!(kcp.check(510), 510);
        kcp.update(510, &mut sink);
        assert!(kcp.check(510) > 510);
    }

    #[test]
    fn check_tracks_earliest_resend() {
        let mut kcp = Kcp::new(1);
        kcp.nodelay(true, 100, 0, true);
        kcp.rx_rto = 50;
        kcp.send(b"a").unwrap();
        let mut sink = |_: &[u8]| {};
        kcp.update(1000, &mut sink);
        let resend = kcp.snd_buf[0].resendts;
        assert_eq!(resend, 1050);
        assert_eq!(kcp.check(1000), resend);
    }

    #[test]
    fn recv_reports_incomplete_message() {
        let mut a = Kcp::new(1);
        a.set_mtu(60).unwrap();
        a.nodelay(true, 10, 0, true);
        a.send(&[1u8; 80]).unwrap();
        let mut wire = Vec::new();
        a.flush(false, 0, &mut collect(&mut wire));
        let all: Vec<u8> = wire.concat();
        let mut rest = &all[..];
        let mut datagrams = Vec::new();
        while !rest.is_empty() {
            let (_, _, used) = wire::decode_segment(rest).unwrap();
            datagrams.push(rest[..used].to_vec());
            rest = &rest[used..];
        }
        assert_eq!(datagrams.len(), 3);

        let mut b = Kcp::new(1);
        let mut out = Vec::new();
        assert_eq!(b.recv(&mut out), Err(RecvError::Empty));
        b.input(&datagrams[0], 0).unwrap();
        assert_eq!(b.peek_size(), None);
        assert_eq!(b.recv(&mut out), Err(RecvError::Incomplete));
        b.input(&datagrams[2], 0).unwrap();
        b.input(&datagrams[1], 0).unwrap();
        assert_eq!(b.peek_size(), Some(80));
        assert_eq!(b.recv(&mut out), Ok(80));
        assert_eq!(out, vec![1u8; 80]);
    }

    #[test]
    fn clear_returns_buffers_to_pool() {
        let mut kcp = Kcp::new(1);
        kcp.send(b"one").unwrap();
        kcp.send(b"two").unwrap();
        kcp.clear();
        assert_eq!(kcp.wait_snd(), 0);
        assert_eq!(kcp.pool.idle(), 2);
    }
}
