//! Per-connection counters. The node sums them with [`Stats::merge`].

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Datagrams handed to the output sink.
    pub out_pkts: u64,
    pub out_bytes: u64,
    /// Datagrams fed to `input`.
    pub in_pkts: u64,
    pub in_bytes: u64,
    pub in_segs: u64,
    pub out_segs: u64,
    /// Every retransmission, whatever the trigger.
    pub retrans_segs: u64,
    pub fast_retrans_segs: u64,
    /// RTO-triggered retransmissions.
    pub lost_segs: u64,
    /// Data segments received more than once or outside the window.
    pub repeat_segs: u64,
    pub in_csum_errors: u64,
    /// Malformed or foreign datagrams.
    pub in_errs: u64,
    /// Application bytes accepted by `send`.
    pub bytes_sent: u64,
    /// Application bytes handed out by `recv`.
    pub bytes_received: u64,
}

impl Stats {
    pub fn merge(&mut self, other: &Stats) {
        self.out_pkts += other.out_pkts;
        self.out_bytes += other.out_bytes;
        self.in_pkts += other.in_pkts;
        self.in_bytes += other.in_bytes;
        self.in_segs += other.in_segs;
        self.out_segs += other.out_segs;
        self.retrans_segs += other.retrans_segs;
        self.fast_retrans_segs += other.fast_retrans_segs;
        self.lost_segs += other.lost_segs;
        self.repeat_segs += other.repeat_segs;
        self.in_csum_errors += other.in_csum_errors;
        self.in_errs += other.in_errs;
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_adds_fieldwise() {
        let mut total = Stats {
            out_pkts: 1,
            lost_segs: 2,
            ..Stats::default()
        };
        let other = Stats {
            out_pkts: 3,
            in_csum_errors: 1,
            ..Stats::default()
        };
        total.merge(&other);
        assert_eq!(total.out_pkts, 4);
        assert_eq!(total.lost_segs, 2);
        assert_eq!(total.in_csum_errors, 1);
    }
}
