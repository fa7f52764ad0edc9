//! Wire codec for data and control packets.
//!
//! All multi-byte fields are network byte order. The most significant bit of
//!  the first header word discriminates data packets (0) from control
//!  packets (1). No I/O happens here.

use anyhow::bail;
use bytes::{Buf, BufMut};

use crate::seq::{MsgNo, SeqNo};

/// base data/control header: four 32-bit words
pub const HEADER_LEN: usize = 16;
/// data header with the trailing frame-metadata word
pub const HEADER_LEN_FRAME: usize = 20;

const FLAG_CONTROL: u32 = 0x8000_0000;

/// Position of one data packet's payload within its message.
///
/// Encoded in the top two bits of the second header word: `11` solo, `10`
///  first, `00` middle, `01` last.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MsgBoundary {
    Solo,
    First,
    Middle,
    Last,
}

impl MsgBoundary {
    fn to_bits(self) -> u32 {
        match self {
            MsgBoundary::Solo => 0b11,
            MsgBoundary::First => 0b10,
            MsgBoundary::Middle => 0b00,
            MsgBoundary::Last => 0b01,
        }
    }

    fn from_bits(bits: u32) -> MsgBoundary {
        match bits & 0b11 {
            0b11 => MsgBoundary::Solo,
            0b10 => MsgBoundary::First,
            0b01 => MsgBoundary::Last,
            _ => MsgBoundary::Middle,
        }
    }
}

/// Per-packet frame metadata for deadline-aware media delivery.
///
/// Field widths follow the wire word: 16 bits frame id, 8 bits chunk id,
///  8 bits total chunks. A frame always has `total_chunks >= 1`, so an
///  all-zero word doubles as 'no metadata attached'.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct FrameMeta {
    pub frame_id: u16,
    pub chunk_id: u8,
    pub total_chunks: u8,
}

impl FrameMeta {
    fn to_word(self) -> u32 {
        (self.frame_id as u32)
            | ((self.chunk_id as u32) << 16)
            | ((self.total_chunks as u32) << 24)
    }

    fn from_word(word: u32) -> FrameMeta {
        FrameMeta {
            frame_id: (word & 0xFFFF) as u16,
            chunk_id: ((word >> 16) & 0xFF) as u8,
            total_chunks: ((word >> 24) & 0xFF) as u8,
        }
    }

    pub fn is_present(&self) -> bool {
        self.total_chunks != 0
    }
}

/// Header of a data packet.
///
/// `timestamp` is microseconds since connection start - except on a
///  frame-aware flow, where the word is repurposed as the frame deadline
///  (also absolute microseconds since connection start). The receiver never
///  reads the sender's clock for RTT purposes, so the repurposing is safe;
///  it is an observable wire difference between the two modes.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct DataHeader {
    pub seq: SeqNo,
    pub boundary: MsgBoundary,
    pub in_order: bool,
    pub msg_no: MsgNo,
    pub timestamp: u32,
    pub dest_id: u32,
    /// `Some` exactly when the flow runs in frame-aware wire mode
    pub frame: Option<FrameMeta>,
}

impl DataHeader {
    pub fn serialized_len(&self) -> usize {
        if self.frame.is_some() { HEADER_LEN_FRAME } else { HEADER_LEN }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.seq.to_raw());

        let mut word1 = self.msg_no.to_raw();
        word1 |= self.boundary.to_bits() << 30;
        if self.in_order {
            word1 |= 1 << 29;
        }
        buf.put_u32(word1);

        buf.put_u32(self.timestamp);
        buf.put_u32(self.dest_id);

        if let Some(frame) = self.frame {
            buf.put_u32(frame.to_word());
        }
    }

    pub fn deser(buf: &mut impl Buf, frame_aware: bool) -> anyhow::Result<DataHeader> {
        let word0 = buf.try_get_u32()?;
        if word0 & FLAG_CONTROL != 0 {
            bail!("not a data packet");
        }

        let word1 = buf.try_get_u32()?;
        let timestamp = buf.try_get_u32()?;
        let dest_id = buf.try_get_u32()?;

        let frame = if frame_aware {
            Some(FrameMeta::from_word(buf.try_get_u32()?))
        }
        else {
            None
        };

        Ok(DataHeader {
            seq: SeqNo::from_raw(word0),
            boundary: MsgBoundary::from_bits(word1 >> 30),
            in_order: word1 & (1 << 29) != 0,
            msg_no: MsgNo::from_raw(word1 & MsgNo::MAX),
            timestamp,
            dest_id,
            frame,
        })
    }
}

const CTRL_HANDSHAKE: u16 = 0;
const CTRL_KEEP_ALIVE: u16 = 1;
const CTRL_ACK: u16 = 2;
const CTRL_NAK: u16 = 3;
const CTRL_CONGESTION_WARNING: u16 = 4;
const CTRL_SHUTDOWN: u16 = 5;
const CTRL_ACK2: u16 = 6;
const CTRL_MSG_DROP: u16 = 7;
const CTRL_PEER_ERROR: u16 = 8;

/// Rate estimates optionally appended to a full ACK.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct AckRates {
    pub recv_rate_pps: u32,
    pub link_capacity_pps: u32,
}

/// A full ACK: everything the sender needs to advance its window and tune
///  pacing. A 'light' ACK carries only the sequence number.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct AckDetails {
    pub rtt_us: u32,
    pub rtt_var_us: u32,
    pub avail_buffer: u32,
    pub rates: Option<AckRates>,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ControlMessage {
    Handshake(Handshake),
    KeepAlive,
    Ack {
        /// sub-sequence identifying this ACK for the ACK² exchange
        ack_id: u32,
        ack_seq: SeqNo,
        details: Option<AckDetails>,
    },
    Nak {
        /// encoded loss list, see [encode_loss_list]
        losses: Vec<u32>,
    },
    CongestionWarning,
    Shutdown,
    Ack2 {
        ack_id: u32,
    },
    MsgDrop {
        msg_no: MsgNo,
        first: SeqNo,
        last: SeqNo,
    },
    PeerError {
        code: u32,
    },
}

/// A complete control packet. Control packets carry no sequence number; the
///  'additional info' word is type-specific.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ControlPacket {
    pub timestamp: u32,
    pub dest_id: u32,
    pub message: ControlMessage,
}

impl ControlPacket {
    pub fn ser(&self, buf: &mut impl BufMut) {
        let (type_code, info) = match &self.message {
            ControlMessage::Handshake(_) => (CTRL_HANDSHAKE, 0),
            ControlMessage::KeepAlive => (CTRL_KEEP_ALIVE, 0),
            ControlMessage::Ack { ack_id, .. } => (CTRL_ACK, *ack_id),
            ControlMessage::Nak { .. } => (CTRL_NAK, 0),
            ControlMessage::CongestionWarning => (CTRL_CONGESTION_WARNING, 0),
            ControlMessage::Shutdown => (CTRL_SHUTDOWN, 0),
            ControlMessage::Ack2 { ack_id } => (CTRL_ACK2, *ack_id),
            ControlMessage::MsgDrop { msg_no, .. } => (CTRL_MSG_DROP, msg_no.to_raw()),
            ControlMessage::PeerError { code } => (CTRL_PEER_ERROR, *code),
        };

        buf.put_u32(FLAG_CONTROL | ((type_code as u32) << 16));
        buf.put_u32(info);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.dest_id);

        match &self.message {
            ControlMessage::Handshake(hs) => hs.ser(buf),
            ControlMessage::Ack { ack_seq, details, .. } => {
                buf.put_u32(ack_seq.to_raw());
                if let Some(details) = details {
                    buf.put_u32(details.rtt_us);
                    buf.put_u32(details.rtt_var_us);
                    buf.put_u32(details.avail_buffer);
                    if let Some(rates) = &details.rates {
                        buf.put_u32(rates.recv_rate_pps);
                        buf.put_u32(rates.link_capacity_pps);
                    }
                }
            }
            ControlMessage::Nak { losses } => {
                for word in losses {
                    buf.put_u32(*word);
                }
            }
            ControlMessage::MsgDrop { first, last, .. } => {
                buf.put_u32(first.to_raw());
                buf.put_u32(last.to_raw());
            }
            _ => {}
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ControlPacket> {
        let word0 = buf.try_get_u32()?;
        if word0 & FLAG_CONTROL == 0 {
            bail!("not a control packet");
        }
        let type_code = ((word0 >> 16) & 0x7FFF) as u16;

        let info = buf.try_get_u32()?;
        let timestamp = buf.try_get_u32()?;
        let dest_id = buf.try_get_u32()?;

        let message = match type_code {
            CTRL_HANDSHAKE => ControlMessage::Handshake(Handshake::deser(buf)?),
            CTRL_KEEP_ALIVE => ControlMessage::KeepAlive,
            CTRL_ACK => {
                let ack_seq = SeqNo::from_raw(buf.try_get_u32()? & SeqNo::MAX);
                let details = if buf.has_remaining() {
                    let rtt_us = buf.try_get_u32()?;
                    let rtt_var_us = buf.try_get_u32()?;
                    let avail_buffer = buf.try_get_u32()?;
                    let rates = if buf.has_remaining() {
                        Some(AckRates {
                            recv_rate_pps: buf.try_get_u32()?,
                            link_capacity_pps: buf.try_get_u32()?,
                        })
                    }
                    else {
                        None
                    };
                    Some(AckDetails { rtt_us, rtt_var_us, avail_buffer, rates })
                }
                else {
                    None
                };
                ControlMessage::Ack { ack_id: info, ack_seq, details }
            }
            CTRL_NAK => {
                if buf.remaining() % 4 != 0 {
                    bail!("loss list is not an array of 32-bit words");
                }
                let mut losses = Vec::with_capacity(buf.remaining() / 4);
                while buf.has_remaining() {
                    losses.push(buf.try_get_u32()?);
                }
                ControlMessage::Nak { losses }
            }
            CTRL_CONGESTION_WARNING => ControlMessage::CongestionWarning,
            CTRL_SHUTDOWN => ControlMessage::Shutdown,
            CTRL_ACK2 => ControlMessage::Ack2 { ack_id: info },
            CTRL_MSG_DROP => ControlMessage::MsgDrop {
                msg_no: MsgNo::from_raw(info & MsgNo::MAX),
                first: SeqNo::from_raw(buf.try_get_u32()? & SeqNo::MAX),
                last: SeqNo::from_raw(buf.try_get_u32()? & SeqNo::MAX),
            },
            CTRL_PEER_ERROR => ControlMessage::PeerError { code: info },
            _ => bail!("unknown control packet type {}", type_code),
        };

        Ok(ControlPacket { timestamp, dest_id, message })
    }
}

/// Encode loss ranges into NAK payload words: a single lost sequence is one
///  word with the MSB clear; a run of two or more is the start with the MSB
///  set followed by the inclusive end.
pub fn encode_loss_list(ranges: &[(SeqNo, SeqNo)]) -> Vec<u32> {
    let mut words = Vec::with_capacity(ranges.len() * 2);
    for &(first, last) in ranges {
        if first == last {
            words.push(first.to_raw());
        }
        else {
            words.push(first.to_raw() | FLAG_CONTROL);
            words.push(last.to_raw());
        }
    }
    words
}

/// Decode a NAK payload back into ranges. Fails on a dangling range start or
///  inverted range endpoints.
pub fn decode_loss_list(words: &[u32]) -> anyhow::Result<Vec<(SeqNo, SeqNo)>> {
    let mut ranges = Vec::new();
    let mut iter = words.iter();
    while let Some(&word) = iter.next() {
        if word & FLAG_CONTROL != 0 {
            let first = SeqNo::from_raw(word & SeqNo::MAX);
            let &end_word = match iter.next() {
                Some(w) => w,
                None => bail!("loss range start {} without an end", first),
            };
            if end_word & FLAG_CONTROL != 0 {
                bail!("loss range start {} followed by another range start", first);
            }
            let last = SeqNo::from_raw(end_word);
            if first.cmp_to(last) > 0 {
                bail!("inverted loss range {}..{}", first, last);
            }
            ranges.push((first, last));
        }
        else {
            let seq = SeqNo::from_raw(word);
            ranges.push((seq, seq));
        }
    }
    Ok(ranges)
}

pub const HANDSHAKE_VERSION: u32 = 4;
/// plain in-sequence byte stream
pub const SOCK_TYPE_STREAM: u32 = 1;
/// byte stream with the frame-metadata header word on every data packet
pub const SOCK_TYPE_FRAME: u32 = 2;

pub const HS_REQUEST: i32 = 1;
pub const HS_RENDEZVOUS: i32 = 0;
pub const HS_RESPONSE: i32 = -1;
pub const HS_RESPONSE_FINAL: i32 = -2;

/// Handshake payload, 48 bytes on the wire.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Handshake {
    pub version: u32,
    pub sock_type: u32,
    pub init_seq: SeqNo,
    pub mss: u32,
    pub flow_window: u32,
    pub req_type: i32,
    pub socket_id: u32,
    pub cookie: u32,
    /// the IP address the peer's datagrams arrive from, zero-padded for V4
    pub peer_addr: [u8; 16],
}

impl Handshake {
    pub const SERIALIZED_LEN: usize = 48;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.version);
        buf.put_u32(self.sock_type);
        buf.put_u32(self.init_seq.to_raw());
        buf.put_u32(self.mss);
        buf.put_u32(self.flow_window);
        buf.put_i32(self.req_type);
        buf.put_u32(self.socket_id);
        buf.put_u32(self.cookie);
        buf.put_slice(&self.peer_addr);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Handshake> {
        let version = buf.try_get_u32()?;
        let sock_type = buf.try_get_u32()?;
        let init_seq = SeqNo::from_raw(buf.try_get_u32()? & SeqNo::MAX);
        let mss = buf.try_get_u32()?;
        let flow_window = buf.try_get_u32()?;
        let req_type = buf.try_get_i32()?;
        let socket_id = buf.try_get_u32()?;
        let cookie = buf.try_get_u32()?;

        if buf.remaining() < 16 {
            bail!("handshake truncated before the peer address");
        }
        let mut peer_addr = [0u8; 16];
        buf.copy_to_slice(&mut peer_addr);

        Ok(Handshake {
            version,
            sock_type,
            init_seq,
            mss,
            flow_window,
            req_type,
            socket_id,
            cookie,
            peer_addr,
        })
    }

    pub fn addr_bytes(addr: std::net::IpAddr) -> [u8; 16] {
        match addr {
            std::net::IpAddr::V4(v4) => {
                let mut bytes = [0u8; 16];
                bytes[..4].copy_from_slice(&v4.octets());
                bytes
            }
            std::net::IpAddr::V6(v6) => v6.octets(),
        }
    }
}

/// first-word peek: is this datagram a control packet?
pub fn is_control(datagram: &[u8]) -> bool {
    datagram.len() >= 4 && datagram[0] & 0x80 != 0
}

/// destination id (word 3) without full parsing, for demultiplexing
pub fn peek_dest_id(datagram: &[u8]) -> Option<u32> {
    if datagram.len() < HEADER_LEN {
        return None;
    }
    Some(u32::from_be_bytes(datagram[12..16].try_into().expect("sliced to 4 bytes")))
}

/// payload length implied by a datagram of `len` bytes
pub fn payload_len(len: usize, frame_aware: bool) -> usize {
    let header = if frame_aware { HEADER_LEN_FRAME } else { HEADER_LEN };
    len.saturating_sub(header)
}
