use std::time::Duration;

use anyhow::bail;

use crate::congestion::{native_congestion_factory, CongestionFactory};

pub struct FdtConfig {
    /// Maximum payload bytes per data packet. The full datagram is this plus
    ///  the 16-byte header (20 bytes on a frame-aware flow), and it must pass
    ///  every link between the endpoints without IP fragmentation. With full
    ///  Ethernet frames the usual ceiling is `1500 - 20 - 8 - 16 = 1456` for
    ///  IPV4; jumbo frames allow far more. The protocol does not attempt MTU
    ///  discovery - the value is the application's responsibility, and both
    ///  sides negotiate down to the smaller of the two configured values
    ///  during the handshake.
    pub mss: u32,

    /// Carry the frame-metadata header word on every data packet of this
    ///  flow, and repurpose the timestamp word as the frame deadline. Both
    ///  sides must agree; the handshake's socket type carries the choice.
    pub frame_aware: bool,

    /// Advertised to the peer during the handshake: the maximum number of
    ///  unacknowledged packets this side is prepared to hold. The peer's
    ///  sender never exceeds it regardless of its congestion window.
    pub flow_window: u32,

    /// send buffer capacity in packets; `send` blocks when it is full
    pub send_buffer_packets: u32,

    /// receive buffer capacity in packets; must be at least `flow_window`
    pub recv_buffer_packets: u32,

    /// hard cap on the outgoing rate in bytes per second, 0 = unlimited.
    ///  Applied as a floor on the pacing interval after congestion control.
    pub max_bandwidth: u64,

    /// how long `close` waits for unsent data to drain before shutting down
    pub linger: Duration,

    /// the protocol's fixed internal tick; also the default ACK period
    pub syn_interval: Duration,

    /// lower bound for the NAK timer period
    pub min_nak_interval: Duration,

    /// lower bound for the peer-silence (EXP) timer period
    pub min_exp_interval: Duration,

    /// EXP firings after which (together with `exp_max_silence`) the flow is broken
    pub exp_max_count: u32,

    /// peer silence after which (together with `exp_max_count`) the flow is broken
    pub exp_max_silence: Duration,

    /// give up on `connect` after this long
    pub connect_timeout: Duration,

    /// initial retry interval for the handshake exchange (doubles per retry)
    pub connect_retry_interval: Duration,

    /// congestion controller for flows under this config
    pub congestion: CongestionFactory,
}

impl FdtConfig {
    /// bulk-stream defaults
    pub fn default_stream() -> FdtConfig {
        FdtConfig {
            mss: 1456,
            frame_aware: false,
            flow_window: 25600,
            send_buffer_packets: 8192,
            recv_buffer_packets: 8192,
            max_bandwidth: 0,
            linger: Duration::from_secs(3),
            syn_interval: Duration::from_millis(10),
            min_nak_interval: Duration::from_millis(20),
            min_exp_interval: Duration::from_millis(300),
            exp_max_count: 16,
            exp_max_silence: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(8),
            connect_retry_interval: Duration::from_millis(250),
            congestion: native_congestion_factory(),
        }
    }

    /// defaults for deadline-tagged media chunks: metadata on every packet,
    ///  a shallower receive window, no linger on close
    pub fn default_frame_aware() -> FdtConfig {
        FdtConfig {
            frame_aware: true,
            recv_buffer_packets: 4096,
            linger: Duration::ZERO,
            ..FdtConfig::default_stream()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mss < 76 {
            bail!("mss of {} leaves no usable payload", self.mss);
        }
        if self.flow_window == 0 {
            bail!("flow window must allow at least one packet in flight");
        }
        if self.flow_window > SEQ_RANGE_QUARTER {
            bail!("flow window of {} is too large for 31-bit sequence arithmetic", self.flow_window);
        }
        if self.send_buffer_packets == 0 || self.recv_buffer_packets == 0 {
            bail!("buffer sizes must be non-zero");
        }
        if self.recv_buffer_packets < self.flow_window {
            bail!("receive buffer of {} packets cannot back a flow window of {}",
                self.recv_buffer_packets, self.flow_window);
        }
        if self.syn_interval.is_zero() {
            bail!("syn interval must be non-zero");
        }
        Ok(())
    }
}

/// comparisons are only defined across half the sequence space; capping
///  windows at a quarter keeps everything comfortably inside
const SEQ_RANGE_QUARTER: u32 = 0x2000_0000;
