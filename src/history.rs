//! Timing histories feeding the estimators: the ACK window pairs outgoing
//!  ACKs with their ACK² to measure RTT without clock synchronisation, and
//!  the arrival window derives receive rate and link capacity from packet
//!  inter-arrival times and probe pairs.

use std::collections::VecDeque;

use crate::seq::SeqNo;

const ACK_WINDOW_CAPACITY: usize = 64;

#[derive(Debug)]
struct AckRecord {
    ack_id: u32,
    ack_seq: SeqNo,
    sent_us: u64,
}

/// Bounded history of ACKs sent but not yet confirmed by an ACK².
#[derive(Debug, Default)]
pub struct AckWindow {
    records: VecDeque<AckRecord>,
}

impl AckWindow {
    pub fn new() -> AckWindow {
        AckWindow::default()
    }

    pub fn store(&mut self, ack_id: u32, ack_seq: SeqNo, now_us: u64) {
        if self.records.len() == ACK_WINDOW_CAPACITY {
            self.records.pop_front();
        }
        self.records.push_back(AckRecord { ack_id, ack_seq, sent_us: now_us });
    }

    /// match an incoming ACK² against the stored ACK: returns the
    ///  acknowledged sequence and the RTT sample, and discards this record
    ///  along with all older ones
    pub fn acknowledge(&mut self, ack_id: u32, now_us: u64) -> Option<(SeqNo, u32)> {
        let idx = self.records.iter().position(|r| r.ack_id == ack_id)?;
        let record = self.records.drain(..=idx).next_back().expect("drained range is non-empty");
        let rtt = now_us.saturating_sub(record.sent_us).min(u32::MAX as u64) as u32;
        Some((record.ack_seq, rtt))
    }
}

const ARRIVAL_WINDOW: usize = 16;
const PROBE_WINDOW: usize = 64;

/// Packet arrival history. Plain arrivals estimate the delivery rate; probe
///  pairs (two packets sent back-to-back) estimate link capacity from their
///  inter-arrival spacing.
#[derive(Debug)]
pub struct ArrivalWindow {
    intervals: [u64; ARRIVAL_WINDOW],
    next_interval: usize,
    last_arrival_us: u64,

    probe_intervals: [u64; PROBE_WINDOW],
    next_probe: usize,
    probe_start_us: Option<u64>,
}

impl ArrivalWindow {
    pub fn new(now_us: u64) -> ArrivalWindow {
        ArrivalWindow {
            // seeded with 1s intervals so the rate reads as 'unknown' until
            //  real samples displace them
            intervals: [1_000_000; ARRIVAL_WINDOW],
            next_interval: 0,
            last_arrival_us: now_us,
            probe_intervals: [1_000; PROBE_WINDOW],
            next_probe: 0,
            probe_start_us: None,
        }
    }

    pub fn on_arrival(&mut self, now_us: u64) {
        let interval = now_us.saturating_sub(self.last_arrival_us);
        self.last_arrival_us = now_us;

        self.intervals[self.next_interval] = interval;
        self.next_interval = (self.next_interval + 1) % ARRIVAL_WINDOW;
    }

    /// first packet of a probe pair arrived
    pub fn on_probe_first(&mut self, now_us: u64) {
        self.probe_start_us = Some(now_us);
    }

    /// second packet of a probe pair arrived; the spacing is one capacity sample
    pub fn on_probe_second(&mut self, now_us: u64) {
        let Some(start) = self.probe_start_us.take() else {
            return;
        };
        self.probe_intervals[self.next_probe] = now_us.saturating_sub(start).max(1);
        self.next_probe = (self.next_probe + 1) % PROBE_WINDOW;
    }

    /// median-filtered receive rate in packets per second, or 0 while there
    ///  are not enough plausible samples
    pub fn recv_rate_pps(&self) -> u32 {
        let mut sorted = self.intervals;
        sorted.sort_unstable();
        let median = sorted[ARRIVAL_WINDOW / 2].max(1);

        let mut count = 0u64;
        let mut sum = 0u64;
        for &interval in &self.intervals {
            if interval < median * 8 && interval > median / 8 {
                count += 1;
                sum += interval;
            }
        }

        if count > (ARRIVAL_WINDOW / 2) as u64 && sum > 0 {
            (count * 1_000_000 / sum) as u32
        }
        else {
            0
        }
    }

    /// median-filtered link capacity estimate in packets per second
    pub fn bandwidth_pps(&self) -> u32 {
        let mut sorted = self.probe_intervals;
        sorted.sort_unstable();
        let median = sorted[PROBE_WINDOW / 2].max(1);

        let mut count = 1u64;
        let mut sum = median;
        for &interval in &self.probe_intervals {
            if interval < median * 8 && interval > median / 8 {
                count += 1;
                sum += interval;
            }
        }

        (count * 1_000_000 / sum.max(1)) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_ack_window_roundtrip() {
        let mut window = AckWindow::new();
        window.store(1, SeqNo::from_raw(100), 1_000);
        window.store(2, SeqNo::from_raw(200), 2_000);

        let (seq, rtt) = window.acknowledge(2, 22_000).unwrap();
        assert_eq!(seq, SeqNo::from_raw(200));
        assert_eq!(rtt, 20_000);

        // acknowledging id 2 discarded the older record too
        assert!(window.acknowledge(1, 30_000).is_none());
    }

    #[test]
    fn test_ack_window_unknown_id() {
        let mut window = AckWindow::new();
        window.store(1, SeqNo::from_raw(100), 1_000);
        assert!(window.acknowledge(99, 2_000).is_none());
        // the unmatched record is retained
        assert!(window.acknowledge(1, 3_000).is_some());
    }

    #[test]
    fn test_ack_window_bounded() {
        let mut window = AckWindow::new();
        for id in 0..100u32 {
            window.store(id, SeqNo::from_raw(id), id as u64);
        }
        // oldest records were evicted
        assert!(window.acknowledge(0, 1_000).is_none());
        assert!(window.acknowledge(99, 1_000).is_some());
    }

    #[test]
    fn test_recv_rate_unknown_without_samples() {
        let window = ArrivalWindow::new(0);
        assert_eq!(window.recv_rate_pps(), 0);
    }

    #[rstest]
    #[case::steady_10k_pps(100, 10_000)]
    #[case::steady_1k_pps(1_000, 1_000)]
    fn test_recv_rate_steady_arrivals(#[case] spacing_us: u64, #[case] expected_pps: u32) {
        let mut window = ArrivalWindow::new(0);
        let mut now = 0;
        for _ in 0..ARRIVAL_WINDOW {
            now += spacing_us;
            window.on_arrival(now);
        }
        assert_eq!(window.recv_rate_pps(), expected_pps);
    }

    #[test]
    fn test_recv_rate_filters_outliers() {
        let mut window = ArrivalWindow::new(0);
        let mut now = 0;
        for i in 0..ARRIVAL_WINDOW {
            // one huge gap (an application pause) must not skew the estimate
            now += if i == 7 { 500_000 } else { 100 };
            window.on_arrival(now);
        }
        let rate = window.recv_rate_pps();
        assert!((9_000..=11_000).contains(&rate), "rate {} should be close to 10000", rate);
    }

    #[test]
    fn test_bandwidth_from_probe_pairs() {
        let mut window = ArrivalWindow::new(0);
        let mut now = 0;
        for _ in 0..PROBE_WINDOW {
            window.on_probe_first(now);
            now += 10;
            window.on_probe_second(now);
            now += 5_000;
        }
        let bw = window.bandwidth_pps();
        assert!((90_000..=110_000).contains(&bw), "bandwidth {} should be close to 100000", bw);
    }

    #[test]
    fn test_probe_second_without_first_is_ignored() {
        let mut window = ArrivalWindow::new(0);
        let before = window.bandwidth_pps();
        window.on_probe_second(1_000);
        assert_eq!(window.bandwidth_pps(), before);
    }
}
