//! The per-flow engine: connection state, the sending path (`pack_next`),
//!  the receiving path (`process_data`), control dispatch (`process_ctrl`)
//!  and the timer tick that binds them.
//!
//! `ConnectionInner` is a pure state machine - it consumes parsed packets and
//!  clock readings and produces datagrams to send, never touching the socket
//!  itself. The async shell around it owns the I/O: a sender task paced by
//!  the congestion controller's interval, a 10ms timer task, and the inbound
//!  path fed by the endpoint's demultiplexer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use bytes::BytesMut;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout_at;
use tracing::{debug, info, trace, warn};

use crate::cache::CachedPeerInfo;
use crate::clock::Clock;
use crate::config::FdtConfig;
use crate::congestion::{CongestionController, CongestionInit};
use crate::history::{AckWindow, ArrivalWindow};
use crate::loss_list::LossList;
use crate::packet::{
    self, AckDetails, AckRates, ControlMessage, ControlPacket, DataHeader, FrameMeta, Handshake,
    HS_REQUEST,
};
use crate::recv_buffer::{InsertOutcome, ReceiveBuffer, RecvSlot};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::send_buffer::{FrameTag, RetransRead, SendBuffer, SendOptions};
use crate::send_pipeline::SendPipeline;
use crate::seq::SeqNo;

/// why a flow stopped operating
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BrokenReason {
    /// the peer announced shutdown; remaining buffered data is readable,
    ///  then reads report end-of-stream
    PeerShutdown,
    /// the peer fell silent past the expiration limits
    Timeout,
    /// the peer sent something a correct implementation never sends
    Protocol,
    /// closed by the local application
    Closed,
}

/// Counters and live estimates, as returned by [Connection::stats].
#[derive(Clone, Debug, Default)]
pub struct ConnectionStats {
    pub pkts_sent: u64,
    pub bytes_sent: u64,
    pub pkts_received: u64,
    pub bytes_received: u64,
    pub retransmitted: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub naks_sent: u64,
    pub naks_received: u64,
    /// messages dropped locally because their TTL passed
    pub ttl_drops: u64,
    /// sequences the receiver saw go missing (before recovery)
    pub recv_loss: u64,
    pub duplicates: u64,
    /// data packets below or beyond the receive window
    pub discarded: u64,
    pub malformed_ctrl: u64,

    pub rtt_us: u32,
    pub rtt_var_us: u32,
    pub bandwidth_pps: u32,
    pub delivery_rate_pps: u32,
    pub cwnd_packets: f64,
    pub send_interval_us: f64,
}

/// everything a freshly handshaken flow starts from
pub(crate) struct ConnectionSeed {
    pub config: Arc<FdtConfig>,
    pub peer_addr: SocketAddr,
    pub local_id: u32,
    pub peer_id: u32,
    pub own_init_seq: SeqNo,
    pub peer_init_seq: SeqNo,
    /// negotiated: min of both sides' configured values
    pub mss: u32,
    pub frame_aware: bool,
    /// the peer's advertised flow window
    pub flow_window: u32,
    pub cache_hint: Option<CachedPeerInfo>,
    /// listener side: the response to replay if the peer repeats its request
    pub hs_response: Option<Handshake>,
}

pub(crate) struct ConnectionInner {
    config: Arc<FdtConfig>,
    clock: Clock,
    peer_id: u32,
    mss: u32,
    frame_aware: bool,
    flow_window: u32,

    // sending side
    send_buffer: SendBuffer,
    snd_loss: LossList,
    snd_last_acked: SeqNo,
    snd_last_sent: SeqNo,
    cc: Box<dyn CongestionController>,
    send_interval_us: f64,
    cwnd: f64,
    pending_frame: Option<FrameTag>,

    // receiving side
    recv_buffer: ReceiveBuffer,
    rcv_loss: LossList,
    rcv_last_seq: SeqNo,
    rcv_last_acked: SeqNo,
    rcv_last_ack2_seq: SeqNo,
    next_ack_id: u32,
    ack_window: AckWindow,
    arrival: ArrivalWindow,

    // estimates
    rtt_us: u32,
    rtt_var_us: u32,
    bandwidth_pps: u32,
    delivery_rate_pps: u32,

    // timers, in clock microseconds
    next_ack_us: u64,
    next_nak_us: u64,
    last_heard_us: u64,
    exp_count: u32,

    broken: Option<BrokenReason>,
    hs_response: Option<Handshake>,

    stats: ConnectionStats,
}

impl ConnectionInner {
    fn new(seed: ConnectionSeed, clock: Clock) -> ConnectionInner {
        let hint = seed.cache_hint;
        let rtt_us = hint.map(|h| h.rtt_us).unwrap_or(100_000);
        let rtt_var_us = hint.map(|h| h.rtt_var_us).unwrap_or(rtt_us / 2);

        let mut cc = (seed.config.congestion)();
        cc.init(CongestionInit {
            mss: seed.mss,
            init_seq: seed.own_init_seq,
            max_cwnd_packets: seed.flow_window,
        });
        cc.set_rtt(rtt_us);
        if let Some(h) = hint {
            cc.set_bandwidth(h.bandwidth_pps);
        }

        let now_us = clock.elapsed_us();
        let mut inner = ConnectionInner {
            clock,
            peer_id: seed.peer_id,
            mss: seed.mss,
            frame_aware: seed.frame_aware,
            flow_window: seed.flow_window,
            send_buffer: SendBuffer::new(seed.config.send_buffer_packets.safe_cast(), seed.mss.safe_cast()),
            snd_loss: LossList::new(),
            snd_last_acked: seed.own_init_seq,
            snd_last_sent: seed.own_init_seq.dec(),
            cc,
            send_interval_us: 1.0,
            cwnd: 16.0,
            pending_frame: None,
            recv_buffer: ReceiveBuffer::new(seed.config.recv_buffer_packets.safe_cast()),
            rcv_loss: LossList::new(),
            rcv_last_seq: seed.peer_init_seq.dec(),
            rcv_last_acked: seed.peer_init_seq,
            rcv_last_ack2_seq: seed.peer_init_seq,
            next_ack_id: 1,
            ack_window: AckWindow::new(),
            arrival: ArrivalWindow::new(now_us),
            rtt_us,
            rtt_var_us,
            bandwidth_pps: hint.map(|h| h.bandwidth_pps).unwrap_or(1),
            delivery_rate_pps: 16,
            next_ack_us: now_us,
            next_nak_us: now_us,
            last_heard_us: now_us,
            exp_count: 1,
            broken: None,
            hs_response: seed.hs_response,
            stats: ConnectionStats::default(),
            config: seed.config,
        };
        inner.refresh_cc_outputs();
        inner
    }

    fn refresh_cc_outputs(&mut self) {
        self.send_interval_us = self.cc.send_interval_us();
        if self.config.max_bandwidth > 0 {
            let floor = 1_000_000.0 * self.mss as f64 / self.config.max_bandwidth as f64;
            if self.send_interval_us < floor {
                self.send_interval_us = floor;
            }
        }
        self.cwnd = self.cc.cwnd_packets();
    }

    fn mark_broken(&mut self, reason: BrokenReason) {
        if self.broken.is_none() {
            info!("flow to peer {} broken: {:?}", self.peer_id, reason);
            self.broken = Some(reason);
        }
    }

    fn update_rtt(&mut self, sample_us: u32) {
        self.rtt_var_us = (3 * self.rtt_var_us + self.rtt_us.abs_diff(sample_us)) / 4;
        self.rtt_us = (7 * self.rtt_us + sample_us) / 8;
    }

    fn ctrl(&self, message: ControlMessage) -> ControlPacket {
        ControlPacket {
            timestamp: self.clock.timestamp(),
            dest_id: self.peer_id,
            message,
        }
    }

    fn ser_ctrl(&self, message: ControlMessage) -> BytesMut {
        let packet = self.ctrl(message);
        let mut buf = BytesMut::with_capacity(64);
        packet.ser(&mut buf);
        buf
    }

    /// Select and serialize the next datagram to transmit. Returns the
    ///  datagram (or `None` when idle or window-limited) and the time the
    ///  sender should next call back.
    fn pack_next(&mut self, now_us: u64) -> (Option<BytesMut>, u64) {
        let syn_us = self.config.syn_interval.as_micros() as u64;

        // a queued retransmission takes priority over any new data
        while let Some(seq) = self.snd_loss.pop_first(self.snd_last_acked) {
            let offset = self.snd_last_acked.offset_to(seq);
            if offset < 0 {
                continue;
            }

            match self.send_buffer.read_retrans(offset.prechecked_cast(), now_us) {
                None => continue, // acknowledged in the meantime
                Some(RetransRead::Expired { msg_no, first_offset, last_offset }) => {
                    let first = self.snd_last_acked.add(first_offset as i32);
                    let last = self.snd_last_acked.add(last_offset as i32);
                    debug!("message {} expired before delivery, dropping {}..{}", msg_no, first, last);

                    self.send_buffer.mark_dropped(first_offset, last_offset);
                    self.snd_loss.remove_range(first, last);
                    self.stats.ttl_drops += 1;

                    let buf = self.ser_ctrl(ControlMessage::MsgDrop { msg_no, first, last });
                    return (Some(buf), now_us + self.send_interval_us as u64);
                }
                Some(RetransRead::Data { data, msg_no, boundary, in_order, frame }) => {
                    let header = DataHeader {
                        seq,
                        boundary,
                        in_order,
                        msg_no,
                        timestamp: data_timestamp(self.frame_aware, frame, &self.clock),
                        dest_id: self.peer_id,
                        frame: frame_word(self.frame_aware, frame),
                    };
                    let mut buf = BytesMut::with_capacity(header.serialized_len() + data.len());
                    header.ser(&mut buf);
                    buf.extend_from_slice(&data);

                    self.stats.retransmitted += 1;
                    self.stats.pkts_sent += 1;
                    self.stats.bytes_sent += data.len() as u64;
                    self.cc.on_pkt_sent(seq);

                    return (Some(buf), self.next_send_time(seq, now_us));
                }
            }
        }

        // window check against both the peer's flow window and cwnd
        let window = (self.flow_window as f64).min(self.cwnd) as i32;
        if self.snd_last_acked.span_to(self.snd_last_sent.inc()) > window {
            return (None, now_us + syn_us);
        }

        // a message whose TTL passed while still queued is skipped entirely
        if let Some((msg_no, first_offset, last_offset)) = self.send_buffer.drop_expired(now_us) {
            let first = self.snd_last_acked.add(first_offset as i32);
            let last = self.snd_last_acked.add(last_offset as i32);
            debug!("message {} expired before first transmission, dropping {}..{}", msg_no, first, last);

            // the skipped blocks still consume their sequence numbers
            self.snd_last_sent = last;
            self.stats.ttl_drops += 1;

            let buf = self.ser_ctrl(ControlMessage::MsgDrop { msg_no, first, last });
            return (Some(buf), now_us + self.send_interval_us as u64);
        }

        let Some(block) = self.send_buffer.read_next() else {
            return (None, now_us + syn_us);
        };

        self.snd_last_sent = self.snd_last_sent.inc();
        let seq = self.snd_last_sent;

        let header = DataHeader {
            seq,
            boundary: block.boundary,
            in_order: block.in_order,
            msg_no: block.msg_no,
            timestamp: data_timestamp(self.frame_aware, block.frame, &self.clock),
            dest_id: self.peer_id,
            frame: frame_word(self.frame_aware, block.frame),
        };
        let mut buf = BytesMut::with_capacity(header.serialized_len() + block.data.len());
        header.ser(&mut buf);
        buf.extend_from_slice(&block.data);

        self.stats.pkts_sent += 1;
        self.stats.bytes_sent += block.data.len() as u64;
        self.cc.on_pkt_sent(seq);

        (Some(buf), self.next_send_time(seq, now_us))
    }

    /// probe pairs go out back-to-back: a sequence with a zero low nibble is
    ///  followed by its successor with no pacing gap
    fn next_send_time(&self, just_sent: SeqNo, now_us: u64) -> u64 {
        if just_sent.to_raw() & 0xF == 0 {
            now_us
        }
        else {
            now_us + self.send_interval_us as u64
        }
    }

    /// Inbound data packet. Returns an immediate NAK when a fresh gap is
    ///  detected.
    fn process_data(&mut self, header: DataHeader, payload: &[u8], now_us: u64) -> Option<BytesMut> {
        self.last_heard_us = now_us;
        self.exp_count = 1;

        self.cc.on_pkt_received(header.seq);
        self.arrival.on_arrival(now_us);
        match header.seq.to_raw() & 0xF {
            0 => self.arrival.on_probe_first(now_us),
            1 => self.arrival.on_probe_second(now_us),
            _ => {}
        }

        self.stats.pkts_received += 1;
        self.stats.bytes_received += payload.len() as u64;

        let offset = self.rcv_last_acked.offset_to(header.seq);
        if offset < 0 {
            trace!("data packet {} below the receive window", header.seq);
            self.stats.discarded += 1;
            return None;
        }

        let slot = RecvSlot {
            data: payload.to_vec(),
            msg_no: header.msg_no,
            boundary: header.boundary,
            in_order: header.in_order,
            frame: header.frame.filter(|f| f.is_present()),
            timestamp: header.timestamp,
        };
        match self.recv_buffer.insert(offset.prechecked_cast(), slot) {
            InsertOutcome::OutOfWindow => {
                trace!("data packet {} beyond the receive window", header.seq);
                self.stats.discarded += 1;
                return None;
            }
            InsertOutcome::Duplicate => {
                self.stats.duplicates += 1;
                return None;
            }
            InsertOutcome::Stored => {}
        }

        let mut nak = None;
        if header.seq.cmp_to(self.rcv_last_seq.inc()) > 0 {
            // a gap opened up: record it and request the retransmit right away
            let gap_first = self.rcv_last_seq.inc();
            let gap_last = header.seq.dec();
            self.rcv_loss.insert(gap_first, gap_last);
            self.stats.recv_loss += gap_first.span_to(gap_last) as u64;
            self.stats.naks_sent += 1;
            trace!("gap {}..{} detected, sending NAK", gap_first, gap_last);

            nak = Some(self.ser_ctrl(ControlMessage::Nak {
                losses: packet::encode_loss_list(&[(gap_first, gap_last)]),
            }));
        }

        if header.seq.cmp_to(self.rcv_last_seq) > 0 {
            self.rcv_last_seq = header.seq;
        }
        else {
            // a retransmission filled (part of) a known gap
            self.rcv_loss.remove(header.seq);
        }

        nak
    }

    /// Inbound control packet. Returns any responses to transmit.
    fn process_ctrl(&mut self, ctrl: ControlPacket, now_us: u64) -> Vec<BytesMut> {
        self.last_heard_us = now_us;
        self.exp_count = 1;

        let mut responses = Vec::new();
        match ctrl.message {
            ControlMessage::Ack { ack_id, ack_seq, details } => {
                self.stats.acks_received += 1;

                if details.is_some() {
                    // confirm receipt so the peer gets its RTT sample
                    responses.push(self.ser_ctrl(ControlMessage::Ack2 { ack_id }));
                }

                if ack_seq.cmp_to(self.snd_last_sent.inc()) > 0 {
                    warn!("peer acknowledged {} which was never sent - breaking the flow", ack_seq);
                    self.mark_broken(BrokenReason::Protocol);
                    return responses;
                }

                if ack_seq.cmp_to(self.snd_last_acked) > 0 {
                    let released = self.snd_last_acked.offset_to(ack_seq);
                    self.send_buffer.ack_through(released.prechecked_cast());
                    self.snd_loss.remove_before(self.snd_last_acked, ack_seq);
                    self.snd_last_acked = ack_seq;
                }

                if let Some(details) = details {
                    self.flow_window = details.avail_buffer;
                    if details.rtt_us > 0 {
                        self.update_rtt(details.rtt_us);
                        self.cc.set_rtt(self.rtt_us);
                    }
                    if let Some(rates) = details.rates {
                        if rates.recv_rate_pps > 0 {
                            self.delivery_rate_pps =
                                ((self.delivery_rate_pps as u64 * 7 + rates.recv_rate_pps as u64) / 8) as u32;
                            self.cc.set_recv_rate(self.delivery_rate_pps);
                        }
                        if rates.link_capacity_pps > 0 {
                            self.bandwidth_pps =
                                ((self.bandwidth_pps as u64 * 7 + rates.link_capacity_pps as u64) / 8) as u32;
                            self.cc.set_bandwidth(self.bandwidth_pps);
                        }
                    }
                }

                self.cc.on_ack(ack_seq, now_us);
                self.refresh_cc_outputs();
            }

            ControlMessage::Ack2 { ack_id } => {
                if let Some((ack_seq, rtt_sample)) = self.ack_window.acknowledge(ack_id, now_us) {
                    self.update_rtt(rtt_sample);
                    self.rcv_last_ack2_seq = ack_seq;
                    self.cc.set_rtt(self.rtt_us);
                }
            }

            ControlMessage::Nak { losses } => {
                self.stats.naks_received += 1;
                match packet::decode_loss_list(&losses) {
                    Err(e) => {
                        // conservatively keep the flow alive - this peer may
                        //  merely be buggy, and data is still moving
                        warn!("discarding malformed NAK: {}", e);
                        self.stats.malformed_ctrl += 1;
                    }
                    Ok(ranges) => self.process_nak_ranges(&ranges, now_us),
                }
            }

            ControlMessage::KeepAlive => {}

            ControlMessage::CongestionWarning => {
                debug!("received congestion warning");
                self.cc.on_congestion_warning();
                self.refresh_cc_outputs();
            }

            ControlMessage::Shutdown => {
                debug!("peer shut the flow down");
                self.mark_broken(BrokenReason::PeerShutdown);
            }

            ControlMessage::MsgDrop { msg_no, first, last } => {
                debug!("peer dropped message {} covering {}..{}", msg_no, first, last);
                self.recv_buffer.drop_message(msg_no);
                self.rcv_loss.remove_range(first, last);
                // the dropped range counts as delivered for ACK purposes
                if first.cmp_to(self.rcv_last_seq) <= 0 && last.cmp_to(self.rcv_last_seq) > 0 {
                    self.rcv_last_seq = last;
                }
            }

            ControlMessage::PeerError { code } => {
                warn!("peer signalled error {}", code);
                self.stats.malformed_ctrl += 1;
            }

            ControlMessage::Handshake(hs) => {
                // the peer retries its request when our response got lost
                if hs.req_type == HS_REQUEST {
                    if let Some(response) = &self.hs_response {
                        debug!("re-sending handshake response");
                        responses.push(self.ser_ctrl(ControlMessage::Handshake(response.clone())));
                    }
                }
            }
        }
        responses
    }

    fn process_nak_ranges(&mut self, ranges: &[(SeqNo, SeqNo)], now_us: u64) {
        // ranges the ACK cursor already passed are stale, not malformed
        let mut effective = Vec::with_capacity(ranges.len());
        for &(first, last) in ranges {
            if last.cmp_to(self.snd_last_sent) > 0 {
                warn!("discarding NAK naming {} beyond the last sent sequence {}", last, self.snd_last_sent);
                self.stats.malformed_ctrl += 1;
                return;
            }
            if last.cmp_to(self.snd_last_acked) < 0 {
                continue;
            }
            let first = if first.cmp_to(self.snd_last_acked) < 0 { self.snd_last_acked } else { first };
            effective.push((first, last));
        }

        if effective.is_empty() {
            return;
        }

        // adjust pacing before queueing the retransmits
        self.cc.on_loss(&effective, now_us);
        self.refresh_cc_outputs();

        for &(first, last) in &effective {
            self.snd_loss.insert(first, last);
        }
    }

    /// the 10ms tick: ACK, NAK and EXP deadlines
    fn on_tick(&mut self, now_us: u64) -> Vec<BytesMut> {
        let mut out = Vec::new();
        if self.broken.is_some() {
            return out;
        }

        let syn_us = self.config.syn_interval.as_micros() as u64;

        // ACK timer
        let ack_period_us = match self.cc.ack_interval_us() {
            0 => syn_us,
            custom => custom as u64,
        };
        if now_us >= self.next_ack_us {
            if let Some(buf) = self.make_ack(now_us) {
                out.push(buf);
            }
            self.next_ack_us = now_us + ack_period_us;
        }

        // NAK timer: re-issue the full loss list if gaps linger
        if !self.rcv_loss.is_empty() && now_us >= self.next_nak_us {
            let nak_period_us = (self.rtt_us as u64 + 4 * self.rtt_var_us as u64)
                .max(self.config.min_nak_interval.as_micros() as u64);
            out.push(self.make_full_nak());
            self.next_nak_us = now_us + nak_period_us;
        }

        // EXP timer: peer-silence handling
        let exp_period_us = (self.exp_count as u64 * (self.rtt_us as u64 + 4 * self.rtt_var_us as u64)
            + syn_us)
            .max(self.config.min_exp_interval.as_micros() as u64 * self.exp_count as u64);
        let silence_us = now_us.saturating_sub(self.last_heard_us);
        if silence_us >= exp_period_us {
            if self.exp_count > self.config.exp_max_count
                && silence_us >= self.config.exp_max_silence.as_micros() as u64
            {
                warn!("peer silent for {}us after {} expirations - breaking the flow",
                    silence_us, self.exp_count);
                self.mark_broken(BrokenReason::Timeout);
                return out;
            }

            if self.snd_last_acked.cmp_to(self.snd_last_sent.inc()) < 0 {
                // resend the entire unacknowledged window
                debug!("expiration {}: re-queueing {}..{} for retransmission",
                    self.exp_count, self.snd_last_acked, self.snd_last_sent);
                self.snd_loss.insert(self.snd_last_acked, self.snd_last_sent);
            }
            else {
                out.push(self.ser_ctrl(ControlMessage::KeepAlive));
            }

            self.cc.on_timeout();
            self.refresh_cc_outputs();
            self.exp_count += 1;
        }

        out
    }

    fn make_ack(&mut self, now_us: u64) -> Option<BytesMut> {
        let ack_seq = match self.rcv_loss.first(self.rcv_last_acked) {
            Some(first_missing) => first_missing,
            None => self.rcv_last_seq.inc(),
        };

        // everything up to here is already confirmed via ACK2 - nothing to say
        if ack_seq == self.rcv_last_ack2_seq {
            return None;
        }

        if ack_seq.cmp_to(self.rcv_last_acked) > 0 {
            let n = self.rcv_last_acked.offset_to(ack_seq);
            self.recv_buffer.ack_through(n.prechecked_cast());
            self.rcv_last_acked = ack_seq;
        }

        let ack_id = self.next_ack_id;
        self.next_ack_id = self.next_ack_id.wrapping_add(1);
        self.ack_window.store(ack_id, ack_seq, now_us);
        self.stats.acks_sent += 1;

        Some(self.ser_ctrl(ControlMessage::Ack {
            ack_id,
            ack_seq,
            details: Some(AckDetails {
                rtt_us: self.rtt_us,
                rtt_var_us: self.rtt_var_us,
                avail_buffer: self.recv_buffer.available().prechecked_cast(),
                rates: Some(AckRates {
                    recv_rate_pps: self.arrival.recv_rate_pps(),
                    link_capacity_pps: self.arrival.bandwidth_pps(),
                }),
            }),
        }))
    }

    fn make_full_nak(&mut self) -> BytesMut {
        // cap the list to what fits one datagram
        let mss: usize = self.mss.safe_cast();
        let max_ranges = (mss - packet::HEADER_LEN) / 8;
        let ranges = self.rcv_loss.snapshot(self.rcv_last_acked, max_ranges);
        self.stats.naks_sent += 1;
        self.ser_ctrl(ControlMessage::Nak { losses: packet::encode_loss_list(&ranges) })
    }

    fn stats_snapshot(&self) -> ConnectionStats {
        let mut stats = self.stats.clone();
        stats.rtt_us = self.rtt_us;
        stats.rtt_var_us = self.rtt_var_us;
        stats.bandwidth_pps = self.bandwidth_pps;
        stats.delivery_rate_pps = self.delivery_rate_pps;
        stats.cwnd_packets = self.cwnd;
        stats.send_interval_us = self.send_interval_us;
        stats
    }

    fn cache_entry(&self) -> CachedPeerInfo {
        CachedPeerInfo {
            rtt_us: self.rtt_us,
            rtt_var_us: self.rtt_var_us,
            bandwidth_pps: self.bandwidth_pps,
            loss_rate: self.stats.retransmitted as f64 / self.stats.pkts_sent.max(1) as f64,
            cwnd_packets: self.cwnd,
        }
    }
}

fn data_timestamp(frame_aware: bool, frame: Option<FrameTag>, clock: &Clock) -> u32 {
    match (frame_aware, frame) {
        // the deadline rides in the timestamp word on frame-aware flows
        (true, Some(tag)) => tag.deadline_us,
        _ => clock.timestamp(),
    }
}

fn frame_word(frame_aware: bool, frame: Option<FrameTag>) -> Option<FrameMeta> {
    if frame_aware {
        Some(frame.map(|tag| tag.meta)
            .unwrap_or(FrameMeta { frame_id: 0, chunk_id: 0, total_chunks: 0 }))
    }
    else {
        None
    }
}

/// One reliable flow. Created by the endpoint's `connect`/`accept`; all
///  application I/O happens through this handle.
pub struct Connection {
    inner: Arc<RwLock<ConnectionInner>>,
    pipeline: Arc<SendPipeline>,
    peer_addr: SocketAddr,
    local_id: u32,
    frame_aware: bool,
    clock: Clock,
    send_wake: Arc<Notify>,
    space_wake: Arc<Notify>,
    recv_wake: Arc<Notify>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Connection {
    pub(crate) fn new(seed: ConnectionSeed, pipeline: Arc<SendPipeline>) -> Arc<Connection> {
        let clock = Clock::now();
        let peer_addr = seed.peer_addr;
        let local_id = seed.local_id;
        let frame_aware = seed.frame_aware;

        let connection = Arc::new(Connection {
            inner: Arc::new(RwLock::new(ConnectionInner::new(seed, clock))),
            pipeline,
            peer_addr,
            local_id,
            frame_aware,
            clock,
            send_wake: Arc::new(Notify::new()),
            space_wake: Arc::new(Notify::new()),
            recv_wake: Arc::new(Notify::new()),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let sender = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.sender_loop().await })
        };
        let timer = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.timer_loop().await })
        };
        connection.tasks.lock().unwrap().extend([sender, timer]);

        connection
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn is_broken(&self) -> bool {
        self.inner.read().await.broken.is_some()
    }

    pub async fn stats(&self) -> ConnectionStats {
        self.inner.read().await.stats_snapshot()
    }

    pub(crate) async fn cache_entry(&self) -> CachedPeerInfo {
        self.inner.read().await.cache_entry()
    }

    /// queue bytes for reliable in-order delivery, waiting while the send
    ///  buffer is full
    pub async fn send(&self, data: &[u8]) -> anyhow::Result<()> {
        self.send_ex(data, None, false).await
    }

    /// `send` with a delivery deadline (packets of the message are dropped
    ///  once it passes) and/or relaxed ordering
    pub async fn send_ex(&self, data: &[u8], ttl: Option<Duration>, in_order: bool) -> anyhow::Result<()> {
        loop {
            let wait = self.space_wake.notified();
            {
                let mut inner = self.inner.write().await;
                if let Some(reason) = inner.broken {
                    bail!("cannot send on a {:?} flow", reason);
                }

                let needed = inner.send_buffer.blocks_needed(data.len());
                if needed > inner.send_buffer.free_blocks() {
                    if needed > inner.send_buffer.free_blocks() + inner.send_buffer.len_blocks() {
                        bail!("message of {} bytes exceeds the send buffer", data.len());
                    }
                }
                else {
                    let frame = inner.pending_frame.take();
                    let now_us = inner.clock.elapsed_us();
                    inner.send_buffer.append(data, now_us, SendOptions { ttl, in_order, frame })?;
                    self.send_wake.notify_one();
                    return Ok(());
                }
            }
            wait.await;
        }
    }

    /// non-blocking `send`: fails fast when the buffer has no room
    pub async fn try_send(&self, data: &[u8]) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(reason) = inner.broken {
            bail!("cannot send on a {:?} flow", reason);
        }
        let frame = inner.pending_frame.take();
        let now_us = inner.clock.elapsed_us();
        inner.send_buffer.append(data, now_us, SendOptions { ttl: None, in_order: false, frame })?;
        self.send_wake.notify_one();
        Ok(())
    }

    /// Attach frame metadata to the immediately following `send`. The
    ///  metadata travels with the buffered blocks, so interleaving further
    ///  sends before packetization cannot clobber it.
    pub async fn set_next_frame_metadata(
        &self,
        frame_id: u16,
        chunk_id: u8,
        total_chunks: u8,
        deadline_us: u32,
    ) -> anyhow::Result<()> {
        if !self.frame_aware {
            bail!("flow was not opened in frame-aware mode");
        }
        let mut inner = self.inner.write().await;
        inner.pending_frame = Some(FrameTag {
            meta: FrameMeta { frame_id, chunk_id, total_chunks },
            deadline_us,
        });
        Ok(())
    }

    /// read in-order bytes; 0 means clean end-of-stream
    pub async fn recv(&self, out: &mut [u8]) -> anyhow::Result<usize> {
        loop {
            let wait = self.recv_wake.notified();
            {
                let mut inner = self.inner.write().await;
                let n = inner.recv_buffer.read(out);
                if n > 0 {
                    return Ok(n);
                }
                match inner.broken {
                    Some(BrokenReason::PeerShutdown) | Some(BrokenReason::Closed) => return Ok(0),
                    Some(reason) => bail!("flow failed: {:?}", reason),
                    None => {}
                }
            }
            wait.await;
        }
    }

    /// read one packet's payload with its frame metadata - the frame-aware
    ///  receive path
    pub async fn recv_chunk(&self) -> anyhow::Result<Option<(Vec<u8>, Option<FrameMeta>, u32)>> {
        loop {
            let wait = self.recv_wake.notified();
            {
                let mut inner = self.inner.write().await;
                if let Some(slot) = inner.recv_buffer.read_chunk() {
                    return Ok(Some((slot.data, slot.frame, slot.timestamp)));
                }
                match inner.broken {
                    Some(BrokenReason::PeerShutdown) | Some(BrokenReason::Closed) => return Ok(None),
                    Some(reason) => bail!("flow failed: {:?}", reason),
                    None => {}
                }
            }
            wait.await;
        }
    }

    /// Drain within the linger allowance, announce shutdown, stop the tasks.
    pub(crate) async fn shutdown(&self) {
        let linger_deadline = tokio::time::Instant::now() + {
            let inner = self.inner.read().await;
            inner.config.linger
        };

        loop {
            {
                let inner = self.inner.read().await;
                if inner.broken.is_some() || inner.send_buffer.len_blocks() == 0 {
                    break;
                }
            }
            if timeout_at(linger_deadline, self.space_wake.notified()).await.is_err() {
                debug!("linger expired with unsent data");
                break;
            }
        }

        let shutdown_buf = {
            let mut inner = self.inner.write().await;
            let was_alive = inner.broken.is_none();
            inner.mark_broken(BrokenReason::Closed);
            was_alive.then(|| inner.ser_ctrl(ControlMessage::Shutdown))
        };
        if let Some(buf) = shutdown_buf {
            self.pipeline.send_packet(self.peer_addr, &buf).await;
        }

        self.send_wake.notify_waiters();
        self.recv_wake.notify_waiters();
        self.space_wake.notify_waiters();

        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// inbound datagram for this flow, handed over by the endpoint
    pub(crate) async fn on_datagram(&self, datagram: &[u8]) {
        let now_us = self.clock.elapsed_us();

        let responses = if packet::is_control(datagram) {
            let ctrl = match ControlPacket::deser(&mut &datagram[..]) {
                Ok(ctrl) => ctrl,
                Err(e) => {
                    debug!("dropping unparseable control packet: {}", e);
                    return;
                }
            };
            let mut inner = self.inner.write().await;
            inner.process_ctrl(ctrl, now_us)
        }
        else {
            let mut buf = &datagram[..];
            let header = match DataHeader::deser(&mut buf, self.frame_aware) {
                Ok(header) => header,
                Err(e) => {
                    debug!("dropping unparseable data packet: {}", e);
                    return;
                }
            };
            let mut inner = self.inner.write().await;
            inner.process_data(header, buf, now_us).into_iter().collect()
        };

        for buf in responses {
            self.pipeline.send_packet(self.peer_addr, &buf).await;
        }

        // window movement, freed buffer space or new readable data may have
        //  unblocked any of the waiters
        self.send_wake.notify_one();
        self.space_wake.notify_one();
        self.recv_wake.notify_one();
    }

    async fn sender_loop(&self) {
        debug!("starting sender loop for flow {}", self.local_id);
        let mut next_allowed_us = 0u64;
        loop {
            let now_us = self.clock.elapsed_us();
            if now_us < next_allowed_us {
                // pacing: the timer wheel cannot express sub-millisecond
                //  gaps, so short waits just yield and re-check
                if next_allowed_us > now_us + 1_000 {
                    tokio::time::sleep_until(self.clock.instant_at_us(next_allowed_us)).await;
                }
                else {
                    tokio::task::yield_now().await;
                }
                continue;
            }

            let (buf, next_us) = {
                let mut inner = self.inner.write().await;
                if inner.broken.is_some() {
                    break;
                }
                inner.pack_next(now_us)
            };

            match buf {
                Some(buf) => {
                    self.pipeline.send_packet(self.peer_addr, &buf).await;
                    next_allowed_us = next_us;
                }
                None => {
                    // idle or window-limited: wait for news, or re-check at
                    //  the deadline (TTL expiry does not announce itself)
                    next_allowed_us = 0;
                    let _ = timeout_at(self.clock.instant_at_us(next_us), self.send_wake.notified()).await;
                }
            }
        }
        debug!("sender loop for flow {} done", self.local_id);
    }

    async fn timer_loop(&self) {
        let syn = {
            let inner = self.inner.read().await;
            inner.config.syn_interval
        };
        let mut ticks = tokio::time::interval(syn);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticks.tick().await;

            let now_us = self.clock.elapsed_us();
            let (packets, broken, readable) = {
                let mut inner = self.inner.write().await;
                let packets = inner.on_tick(now_us);
                (packets, inner.broken.is_some(), inner.recv_buffer.has_readable())
            };

            for buf in &packets {
                self.pipeline.send_packet(self.peer_addr, buf).await;
            }
            if readable {
                self.recv_wake.notify_one();
            }
            if !packets.is_empty() {
                self.send_wake.notify_one();
            }
            if broken {
                self.send_wake.notify_waiters();
                self.recv_wake.notify_waiters();
                self.space_wake.notify_waiters();
                break;
            }
        }
        debug!("timer loop for flow {} done", self.local_id);
    }
}
