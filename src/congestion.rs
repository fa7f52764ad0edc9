//! Pluggable congestion control. The engine drives a controller through the
//!  callbacks below and reads back its two primary outputs, the packet send
//!  interval and the congestion window. Controllers run under the flow lock
//!  and must never block.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::seq::SeqNo;

/// values handed to a controller when its flow is established
#[derive(Copy, Clone, Debug)]
pub struct CongestionInit {
    pub mss: u32,
    pub init_seq: SeqNo,
    /// upper bound for the congestion window, from the flow-control window
    pub max_cwnd_packets: u32,
}

pub trait CongestionController: Send + Sync + 'static {
    fn init(&mut self, init: CongestionInit);

    fn on_ack(&mut self, ack_seq: SeqNo, now_us: u64);
    fn on_loss(&mut self, losses: &[(SeqNo, SeqNo)], now_us: u64);
    fn on_timeout(&mut self);
    fn on_pkt_sent(&mut self, seq: SeqNo);
    fn on_pkt_received(&mut self, seq: SeqNo);
    /// a congestion-warning control packet arrived
    fn on_congestion_warning(&mut self) {}

    fn set_rtt(&mut self, rtt_us: u32);
    fn set_bandwidth(&mut self, bandwidth_pps: u32);
    fn set_recv_rate(&mut self, recv_rate_pps: u32);

    /// pacing interval between data packets, microseconds
    fn send_interval_us(&self) -> f64;
    fn cwnd_packets(&self) -> f64;
    /// 0 = use the engine default
    fn ack_interval_us(&self) -> u32 {
        0
    }
    /// 0 = use the engine default
    fn rto_us(&self) -> u32 {
        0
    }
}

/// how a flow obtains its controller instance
pub type CongestionFactory = Arc<dyn Fn() -> Box<dyn CongestionController> + Send + Sync>;

pub fn native_congestion_factory() -> CongestionFactory {
    Arc::new(|| Box::new(NativeCongestion::new()))
}

/// rate-control evaluation period, microseconds
const RC_INTERVAL_US: u64 = 10_000;
const INITIAL_CWND: f64 = 16.0;

/// The default algorithm: window-based slow start, then rate-based AIMD.
///
/// The additive increase probes spare bandwidth in decimal steps; the
///  multiplicative decrease cuts the rate by ~11% per reaction instead of
///  TCP's halving, repeating at most four more times within one congestion
///  epoch (a cumulative cut of about 0.51) - halving leaves high
///  bandwidth-delay paths badly underutilized.
pub struct NativeCongestion {
    mss: f64,
    max_cwnd: f64,
    cwnd: f64,
    send_interval_us: f64,

    slow_start: bool,
    last_ack: SeqNo,
    last_rc_time_us: u64,
    /// a loss was seen since the last rate-control tick
    loss_since_tick: bool,

    /// seq marking the current congestion epoch: losses at or below it belong
    ///  to a rate cut already taken
    last_dec_seq: SeqNo,
    last_dec_interval_us: f64,
    nak_count: u32,
    dec_count: u32,
    avg_nak_num: u32,
    dec_random: u32,
    /// seeded from the initial sequence so runs are reproducible per flow
    rng: SmallRng,

    curr_seq: SeqNo,
    rtt_us: u32,
    bandwidth_pps: u32,
    recv_rate_pps: u32,
}

impl NativeCongestion {
    pub fn new() -> NativeCongestion {
        NativeCongestion {
            mss: 1500.0,
            max_cwnd: f64::MAX,
            cwnd: INITIAL_CWND,
            send_interval_us: 1.0,
            slow_start: true,
            last_ack: SeqNo::from_raw(0),
            last_rc_time_us: 0,
            loss_since_tick: false,
            last_dec_seq: SeqNo::from_raw(SeqNo::MAX),
            last_dec_interval_us: 1.0,
            nak_count: 0,
            dec_count: 0,
            avg_nak_num: 0,
            dec_random: 1,
            rng: SmallRng::seed_from_u64(0),
            curr_seq: SeqNo::from_raw(0),
            rtt_us: 0,
            bandwidth_pps: 0,
            recv_rate_pps: 0,
        }
    }

    fn exit_slow_start(&mut self) {
        self.slow_start = false;
        if self.recv_rate_pps > 0 {
            self.send_interval_us = 1_000_000.0 / self.recv_rate_pps as f64;
        }
        else {
            self.send_interval_us = (self.rtt_us as f64 + RC_INTERVAL_US as f64) / self.cwnd;
        }
        trace!("leaving slow start with send interval {:.1}us", self.send_interval_us);
    }
}

impl Default for NativeCongestion {
    fn default() -> Self {
        Self::new()
    }
}

impl CongestionController for NativeCongestion {
    fn init(&mut self, init: CongestionInit) {
        self.mss = init.mss as f64;
        self.max_cwnd = init.max_cwnd_packets as f64;
        self.last_ack = init.init_seq;
        self.last_dec_seq = init.init_seq.dec();
        self.curr_seq = init.init_seq.dec();
        self.rng = SmallRng::seed_from_u64(init.init_seq.to_raw() as u64);
    }

    fn on_ack(&mut self, ack_seq: SeqNo, now_us: u64) {
        if now_us.saturating_sub(self.last_rc_time_us) < RC_INTERVAL_US {
            return;
        }
        self.last_rc_time_us = now_us;

        if self.slow_start {
            self.cwnd += (self.last_ack.span_to(ack_seq) - 1) as f64;
            self.last_ack = ack_seq;
            if self.cwnd > self.max_cwnd {
                self.exit_slow_start();
            }
        }
        else {
            self.cwnd = self.recv_rate_pps as f64 / 1_000_000.0
                * (self.rtt_us as f64 + RC_INTERVAL_US as f64)
                + INITIAL_CWND;
        }

        if self.slow_start {
            return;
        }

        if self.loss_since_tick {
            self.loss_since_tick = false;
            return;
        }

        let mut spare_pps = self.bandwidth_pps as f64 - 1_000_000.0 / self.send_interval_us;
        if self.send_interval_us > self.last_dec_interval_us
            && (self.bandwidth_pps as f64 / 9.0) < spare_pps
        {
            spare_pps = self.bandwidth_pps as f64 / 9.0;
        }

        let inc = if spare_pps <= 0.0 {
            1.0 / self.mss
        }
        else {
            let steps = 10f64.powf((spare_pps * self.mss * 8.0).log10().ceil());
            (steps * 0.000_0015 / self.mss).max(1.0 / self.mss)
        };

        self.send_interval_us = (self.send_interval_us * RC_INTERVAL_US as f64)
            / (self.send_interval_us * inc + RC_INTERVAL_US as f64);
    }

    fn on_loss(&mut self, losses: &[(SeqNo, SeqNo)], _now_us: u64) {
        let Some(&(first_lost, _)) = losses.first() else {
            return;
        };

        if self.slow_start {
            self.exit_slow_start();
            return;
        }

        self.loss_since_tick = true;

        if first_lost.cmp_to(self.last_dec_seq) > 0 {
            // a fresh congestion event: take one rate cut and set up the
            //  randomized schedule for further cuts within this epoch
            self.last_dec_interval_us = self.send_interval_us;
            self.send_interval_us = (self.send_interval_us * 1.125).ceil();

            self.avg_nak_num = (self.avg_nak_num as f64 * 0.875 + self.nak_count as f64 * 0.125)
                .ceil() as u32;
            self.nak_count = 1;
            self.dec_count = 1;
            self.last_dec_seq = self.curr_seq;
            self.dec_random = self.rng.gen_range(1..=self.avg_nak_num.max(1));
        }
        else {
            self.dec_count += 1;
            self.nak_count += 1;
            if self.dec_count <= 5 && self.nak_count % self.dec_random.max(1) == 0 {
                // at most 4 further cuts in the same epoch, ~0.51 cumulative
                self.send_interval_us = (self.send_interval_us * 1.125).ceil();
                self.last_dec_seq = self.curr_seq;
            }
        }
    }

    fn on_timeout(&mut self) {
        if self.slow_start {
            self.exit_slow_start();
        }
    }

    fn on_pkt_sent(&mut self, seq: SeqNo) {
        self.curr_seq = seq;
    }

    fn on_pkt_received(&mut self, _seq: SeqNo) {}

    fn on_congestion_warning(&mut self) {
        self.send_interval_us = (self.send_interval_us * 1.125).ceil();
    }

    fn set_rtt(&mut self, rtt_us: u32) {
        self.rtt_us = rtt_us;
    }

    fn set_bandwidth(&mut self, bandwidth_pps: u32) {
        self.bandwidth_pps = bandwidth_pps;
    }

    fn set_recv_rate(&mut self, recv_rate_pps: u32) {
        self.recv_rate_pps = recv_rate_pps;
    }

    fn send_interval_us(&self) -> f64 {
        self.send_interval_us
    }

    fn cwnd_packets(&self) -> f64 {
        self.cwnd
    }
}

/// Constant-rate blaster: no reaction to loss or RTT. For fixed-rate media
///  sources and as a baseline in tests.
pub struct FixedRateCongestion {
    send_interval_us: f64,
}

impl FixedRateCongestion {
    pub fn new(packets_per_second: u32) -> FixedRateCongestion {
        assert!(packets_per_second > 0);
        FixedRateCongestion {
            send_interval_us: 1_000_000.0 / packets_per_second as f64,
        }
    }

    pub fn factory(packets_per_second: u32) -> CongestionFactory {
        Arc::new(move || Box::new(FixedRateCongestion::new(packets_per_second)))
    }
}

impl CongestionController for FixedRateCongestion {
    fn init(&mut self, _init: CongestionInit) {}
    fn on_ack(&mut self, _ack_seq: SeqNo, _now_us: u64) {}
    fn on_loss(&mut self, _losses: &[(SeqNo, SeqNo)], _now_us: u64) {}
    fn on_timeout(&mut self) {}
    fn on_pkt_sent(&mut self, _seq: SeqNo) {}
    fn on_pkt_received(&mut self, _seq: SeqNo) {}
    fn set_rtt(&mut self, _rtt_us: u32) {}
    fn set_bandwidth(&mut self, _bandwidth_pps: u32) {}
    fn set_recv_rate(&mut self, _recv_rate_pps: u32) {}

    fn send_interval_us(&self) -> f64 {
        self.send_interval_us
    }

    fn cwnd_packets(&self) -> f64 {
        f64::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn initialized(max_cwnd: u32) -> NativeCongestion {
        let mut cc = NativeCongestion::new();
        cc.init(CongestionInit {
            mss: 1500,
            init_seq: SeqNo::from_raw(1000),
            max_cwnd_packets: max_cwnd,
        });
        cc
    }

    #[test]
    fn test_starts_in_slow_start() {
        let cc = initialized(100);
        assert_eq!(cc.cwnd_packets(), 16.0);
        assert_eq!(cc.send_interval_us(), 1.0);
    }

    #[test]
    fn test_slow_start_grows_by_acked_packets() {
        let mut cc = initialized(10_000);
        cc.on_ack(SeqNo::from_raw(1040), 20_000);
        assert_eq!(cc.cwnd_packets(), 16.0 + 40.0);
    }

    #[test]
    fn test_rate_control_runs_at_most_every_10ms() {
        let mut cc = initialized(10_000);
        cc.on_ack(SeqNo::from_raw(1040), 20_000);
        // a second ACK inside the same tick must not grow the window again
        cc.on_ack(SeqNo::from_raw(1080), 25_000);
        assert_eq!(cc.cwnd_packets(), 16.0 + 40.0);
    }

    #[test]
    fn test_slow_start_exits_at_max_cwnd() {
        let mut cc = initialized(32);
        cc.set_recv_rate(50_000);
        cc.on_ack(SeqNo::from_raw(1100), 20_000);

        assert!(!cc.slow_start);
        // 1e6 / recv_rate, minus the additive-increase nudge of the same tick
        let interval = cc.send_interval_us();
        assert!((19.9..=20.0).contains(&interval), "interval {} should be ~20us", interval);
    }

    #[test]
    fn test_slow_start_exit_fallback_without_recv_rate() {
        let mut cc = initialized(32);
        cc.set_rtt(100_000);
        cc.on_ack(SeqNo::from_raw(1100), 20_000);

        assert!(!cc.slow_start);
        // (rtt + 10ms) / cwnd, modulo the same-tick increase step
        let expected = 110_000.0 / cc.cwnd_packets();
        let interval = cc.send_interval_us();
        assert!((expected - 1.0..=expected).contains(&interval),
            "interval {} should be close to {}", interval, expected);
    }

    #[test]
    fn test_loss_exits_slow_start() {
        let mut cc = initialized(10_000);
        cc.set_recv_rate(50_000);
        cc.on_loss(&[(SeqNo::from_raw(1005), SeqNo::from_raw(1007))], 5_000);

        assert!(!cc.slow_start);
        assert_eq!(cc.send_interval_us(), 20.0);
    }

    #[test]
    fn test_fresh_loss_cuts_rate_by_one_eighth() {
        let mut cc = initialized(32);
        cc.set_recv_rate(10_000);
        cc.on_ack(SeqNo::from_raw(1100), 20_000);
        let interval = cc.send_interval_us();

        cc.on_pkt_sent(SeqNo::from_raw(1200));
        cc.on_loss(&[(SeqNo::from_raw(1150), SeqNo::from_raw(1150))], 30_000);

        assert_eq!(cc.send_interval_us(), (interval * 1.125).ceil());
        assert_eq!(cc.last_dec_seq, SeqNo::from_raw(1200));
    }

    #[test]
    fn test_interval_non_decreasing_within_epoch() {
        let mut cc = initialized(32);
        cc.set_recv_rate(10_000);
        cc.on_ack(SeqNo::from_raw(1100), 20_000);
        cc.on_pkt_sent(SeqNo::from_raw(1500));

        cc.on_loss(&[(SeqNo::from_raw(1200), SeqNo::from_raw(1210))], 30_000);
        let mut last = cc.send_interval_us();

        // all further losses report sequences from the same epoch
        for seq in [1210u32, 1220, 1230, 1240, 1250, 1260, 1270] {
            cc.on_loss(&[(SeqNo::from_raw(seq), SeqNo::from_raw(seq))], 31_000);
            assert!(cc.send_interval_us() >= last);
            last = cc.send_interval_us();
        }

        // cumulative cut within one epoch stays well above half rate
        let first_cut = cc.last_dec_interval_us;
        assert!(cc.send_interval_us() <= first_cut * 2.0);
    }

    #[test]
    fn test_decrease_schedule_is_deterministic_per_flow() {
        let run = || {
            let mut cc = initialized(32);
            cc.set_recv_rate(10_000);
            cc.on_ack(SeqNo::from_raw(1100), 20_000);
            let mut intervals = Vec::new();
            for round in 0..10u32 {
                cc.on_pkt_sent(SeqNo::from_raw(2000 + round * 100));
                cc.on_loss(&[(SeqNo::from_raw(1900 + round * 100), SeqNo::from_raw(1901 + round * 100))], 30_000);
                intervals.push(cc.send_interval_us());
            }
            intervals
        };

        assert_eq!(run(), run());
    }

    #[rstest]
    #[case::spare_bandwidth(100_000, 10_000)]
    #[case::saturated(0, 10_000)]
    fn test_additive_increase_shrinks_interval(#[case] bandwidth: u32, #[case] recv_rate: u32) {
        let mut cc = initialized(32);
        cc.set_recv_rate(recv_rate);
        cc.set_bandwidth(bandwidth);
        cc.set_rtt(20_000);
        cc.on_ack(SeqNo::from_raw(1100), 20_000);

        let before = cc.send_interval_us();
        cc.on_ack(SeqNo::from_raw(1200), 40_000);
        assert!(cc.send_interval_us() < before);
    }

    #[test]
    fn test_post_slow_start_window_follows_delivery_rate() {
        let mut cc = initialized(32);
        cc.set_recv_rate(50_000);
        cc.set_rtt(90_000);
        cc.on_ack(SeqNo::from_raw(1100), 20_000);

        cc.on_ack(SeqNo::from_raw(1200), 40_000);
        let expected = 50_000.0 / 1_000_000.0 * (90_000.0 + 10_000.0) + 16.0;
        assert_eq!(cc.cwnd_packets(), expected);
    }

    #[test]
    fn test_fixed_rate() {
        let mut cc = FixedRateCongestion::new(1_000);
        cc.init(CongestionInit { mss: 1500, init_seq: SeqNo::from_raw(0), max_cwnd_packets: 10 });

        cc.on_loss(&[(SeqNo::from_raw(5), SeqNo::from_raw(9))], 100);
        assert_eq!(cc.send_interval_us(), 1_000.0);
        assert!(cc.cwnd_packets() > 1e9);
    }
}
