//! Simulated duplex link between two engines.

#![allow(dead_code)]

use kcp_core::wire;
use kcp_core::Kcp;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two engines wired back to back. Datagrams are delivered within the same step.
pub struct Duplex {
    pub a: Kcp,
    pub b: Kcp,
    pub now: u32,
    /// Datagrams A has emitted so far, dropped ones included.
    pub sent_ab: usize,
    pub sent_ba: usize,
}

impl Duplex {
    pub fn new(a: Kcp, b: Kcp) -> Self {
        Self {
            a,
            b,
            now: 0,
            sent_ab: 0,
            sent_ba: 0,
        }
    }

    /// Advance the clock by `dt`, update A then B, delivering what survives the filters.
    /// The filters get the running datagram index for their direction.
    pub fn step(
        &mut self,
        dt: u32,
        mut drop_ab: impl FnMut(usize) -> bool,
        mut drop_ba: impl FnMut(usize) -> bool,
    ) {
        self.now = self.now.wrapping_add(dt);
        let now = self.now;

        let mut ab = Vec::new();
        self.a.update(now, &mut |d: &[u8]| ab.push(d.to_vec()));
        for d in ab {
            let index = self.sent_ab;
            self.sent_ab += 1;
            if !drop_ab(index) {
                let _ = self.b.input(&d, now);
            }
        }

        let mut ba = Vec::new();
        self.b.update(now, &mut |d: &[u8]| ba.push(d.to_vec()));
        for d in ba {
            let index = self.sent_ba;
            self.sent_ba += 1;
            if !drop_ba(index) {
                let _ = self.a.input(&d, now);
            }
        }
    }

    pub fn step_lossless(&mut self, dt: u32) {
        self.step(dt, |_| false, |_| false);
    }
}

/// Every complete message queued on `kcp`.
pub fn drain(kcp: &mut Kcp) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let mut buf = Vec::new();
        match kcp.recv(&mut buf) {
            Ok(_) => out.push(buf),
            Err(_) => return out,
        }
    }
}

/// Split concatenated datagrams into one datagram per segment.
pub fn split_segments(datagrams: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    for d in datagrams {
        let mut rest = &d[..];
        while !rest.is_empty() {
            let (_, _, used) = wire::decode_segment(rest).expect("well-formed datagram");
            out.push(rest[..used].to_vec());
            rest = &rest[used..];
        }
    }
    out
}

/// Flush `kcp` once and return what it emitted.
pub fn flush_collect(kcp: &mut Kcp, now: u32) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    kcp.flush(false, now, &mut |d: &[u8]| out.push(d.to_vec()));
    out
}
