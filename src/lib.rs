//! FDT is a reliable, connection-oriented transport protocol layered on UDP,
//!  built for two workloads that plain TCP handles poorly:
//!
//! * bulk byte streams over high bandwidth-delay paths, where per-packet TCP
//!   round trips leave most of the link idle
//! * time-sensitive media (VR frames chunked into packets), where every
//!   packet carries frame metadata and a delivery deadline end-to-end
//!
//! ## Design goals
//!
//! * Ordered byte-stream delivery between exactly two endpoints over one UDP
//!   socket pair; multiple flows demultiplex on a socket id carried in every
//!   header
//! * Reliability via selective ACK and negative acknowledgement: the receiver
//!   NAKs gaps the moment it sees them rather than waiting out a TCP-style
//!   retransmission timeout
//! * Rate-based congestion control decoupled from the window: a pluggable
//!   controller outputs a packet send interval and a congestion window; the
//!   default combines slow start with a gentle ~11% multiplicative rate cut
//!   (TCP's halving badly underutilizes long fat pipes)
//! * RTT measured without clock synchronisation through an ACK / ACK-of-ACK
//!   exchange; link capacity probed with back-to-back packet pairs every 16
//!   packets
//! * Per-message time-to-live: a message whose deadline passes is dropped on
//!   the sender and announced to the receiver, which treats its range as
//!   delivered - late data never stalls fresh data
//! * Frame-aware mode: every data packet carries frame id / chunk id / total
//!   chunks and a frame deadline, attached per send call and preserved
//!   through buffering and retransmission
//!
//! ## Wire format
//!
//! All integers are network byte order. The top bit of the first word
//!  discriminates data from control packets.
//!
//! Data packet (16-byte header, 20 with frame metadata):
//! ```ascii
//! 0:  bit 31 = 0; bits 0-30: sequence number (31 bits, wraps)
//! 4:  bits 30-31: message boundary (11 solo, 10 first, 00 middle, 01 last)
//!     bit 29: in-order delivery flag
//!     bits 0-28: message number
//! 8:  timestamp: microseconds since connection start
//!     NB: on a frame-aware flow this word carries the frame deadline
//!      instead (absolute microseconds since connection start) - the
//!      receiver does not use the sender's clock, RTT comes from the
//!      ACK/ACK2 exchange
//! 12: destination socket id
//! 16: (frame-aware flows only) bits 0-15: frame id, bits 16-23: chunk id,
//!      bits 24-31: total chunks. All-zero = no metadata attached.
//! *:  payload, at most MSS bytes
//! ```
//!
//! Control packet:
//! ```ascii
//! 0:  bit 31 = 1; bits 16-30: type; bits 0-15: reserved (0)
//! 4:  additional info - type-specific, see below
//! 8:  timestamp
//! 12: destination socket id
//! *:  payload of 32-bit words, by type:
//!     0 handshake - 48 bytes: version, socket type (1 stream / 2 frame),
//!        initial sequence, MSS, flow window, request type (1 request,
//!        0 rendezvous, -1 cookie challenge, -2 final response), socket id,
//!        cookie, 16-byte peer address
//!     1 keepalive - empty
//!     2 ACK - info = ACK sub-sequence id; payload: ack sequence, then
//!        optionally RTT, RTT variance, available receive buffer, and
//!        optionally receive rate (pkts/s) and link capacity (pkts/s)
//!     3 NAK - compressed loss list: a word with the MSB set opens an
//!        inclusive range (closed by the next word), MSB clear is a single
//!        lost sequence
//!     4 congestion warning - empty
//!     5 shutdown - empty
//!     6 ACK2 - info = the ACK sub-sequence id being confirmed
//!     7 message drop - info = message number; payload: first and last
//!        sequence of the dropped message
//!     8 peer error - info = error code
//! ```
//!
//! ## Architecture
//!
//! * [endpoint::Endpoint] - one per process and UDP port: socket ownership,
//!   inbound demultiplexing, handshakes with stateless cookies, the
//!   per-destination path cache
//! * [connection::Connection] - one per flow: the sender and receiver data
//!   paths, loss lists, pacing, the ACK/NAK/EXP timers, and the application
//!   API (`send`, `recv`, `recv_chunk`, `set_next_frame_metadata`, `stats`)
//! * [congestion::CongestionController] - pluggable rate control; see
//!   [congestion::NativeCongestion] and [congestion::FixedRateCongestion]
//!
//! Related systems: UDT (the architectural template for the ACK2/NAK
//!  machinery), QUIC (stream multiplexing and TLS, neither of which is a
//!  goal here), SRT (deadline-driven media delivery).

pub mod cache;
mod clock;
pub mod config;
pub mod congestion;
pub mod connection;
pub mod endpoint;
mod history;
mod loss_list;
pub mod packet;
mod recv_buffer;
mod safe_converter;
mod send_buffer;
mod send_pipeline;
pub mod seq;

pub use config::FdtConfig;
pub use connection::{BrokenReason, Connection, ConnectionStats};
pub use endpoint::Endpoint;
pub use packet::FrameMeta;
