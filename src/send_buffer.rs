//! Send-side buffering: application data is split into blocks of at most MSS
//!  payload bytes at `append` time, and every block carries its own message
//!  number, boundary flags, origin timestamp, optional time-to-live and
//!  optional frame metadata.
//!
//! Metadata lives on the block, not in any flow-global register: application
//!  sends and the pacing loop's packetization are decoupled in time, so both
//!  the fresh-send and the retransmit read path must find the metadata next
//!  to the data they are about to ship.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;

use crate::packet::{FrameMeta, MsgBoundary};
use crate::seq::MsgNo;

/// frame metadata plus its delivery deadline, as attached to one `send` call
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct FrameTag {
    pub meta: FrameMeta,
    /// absolute microseconds since connection start
    pub deadline_us: u32,
}

/// per-send options; `Default` is an unordered, non-expiring plain send
#[derive(Copy, Clone, Debug, Default)]
pub struct SendOptions {
    pub ttl: Option<Duration>,
    pub in_order: bool,
    pub frame: Option<FrameTag>,
}

#[derive(Debug)]
pub struct SendBlock {
    pub data: Bytes,
    pub msg_no: MsgNo,
    pub boundary: MsgBoundary,
    pub in_order: bool,
    pub origin_us: u64,
    pub ttl: Option<Duration>,
    pub frame: Option<FrameTag>,
    /// payload released after a TTL drop; the block stays to keep offsets stable
    pub dropped: bool,
}

/// Result of reading previously sent data for retransmission. Owned (the
///  payload is a cheap `Bytes` clone) so the caller can mutate the buffer in
///  the expired case.
pub enum RetransRead {
    Data {
        data: Bytes,
        msg_no: MsgNo,
        boundary: MsgBoundary,
        in_order: bool,
        frame: Option<FrameTag>,
    },
    /// the block's TTL has passed; the whole message spanning block offsets
    ///  `first_offset ..= last_offset` must be dropped
    Expired {
        msg_no: MsgNo,
        first_offset: usize,
        last_offset: usize,
    },
}

pub struct SendBuffer {
    capacity_blocks: usize,
    mss: usize,
    /// front of the queue is the oldest unacknowledged block
    blocks: VecDeque<SendBlock>,
    /// index into `blocks` of the next block that has never been sent
    next_unsent: usize,
    next_msg_no: MsgNo,
}

impl SendBuffer {
    pub fn new(capacity_blocks: usize, mss: usize) -> SendBuffer {
        assert!(mss > 0);
        SendBuffer {
            capacity_blocks,
            mss,
            blocks: VecDeque::new(),
            next_unsent: 0,
            next_msg_no: MsgNo::FIRST,
        }
    }

    pub fn len_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn free_blocks(&self) -> usize {
        self.capacity_blocks - self.blocks.len()
    }

    pub fn blocks_needed(&self, data_len: usize) -> usize {
        data_len.div_ceil(self.mss).max(1)
    }

    pub fn has_unsent(&self) -> bool {
        self.next_unsent < self.blocks.len()
    }

    /// Split one application message into blocks and enqueue them. Fails if
    ///  the buffer does not currently have room for the whole message - the
    ///  caller is expected to apply backpressure and retry.
    pub fn append(&mut self, data: &[u8], now_us: u64, options: SendOptions) -> anyhow::Result<MsgNo> {
        let needed = self.blocks_needed(data.len());
        if needed > self.capacity_blocks {
            bail!("message of {} bytes can never fit a send buffer of {} blocks x {} bytes",
                data.len(), self.capacity_blocks, self.mss);
        }
        if needed > self.free_blocks() {
            bail!("send buffer full");
        }

        let msg_no = self.next_msg_no;
        self.next_msg_no = self.next_msg_no.inc();

        let data = Bytes::copy_from_slice(data);
        let mut chunks = (0..needed)
            .map(|i| data.slice(i * self.mss..data.len().min((i + 1) * self.mss)))
            .collect::<VecDeque<_>>();

        for i in 0..needed {
            let boundary = match (i == 0, i == needed - 1) {
                (true, true) => MsgBoundary::Solo,
                (true, false) => MsgBoundary::First,
                (false, false) => MsgBoundary::Middle,
                (false, true) => MsgBoundary::Last,
            };
            self.blocks.push_back(SendBlock {
                data: chunks.pop_front().expect("one chunk per block"),
                msg_no,
                boundary,
                in_order: options.in_order,
                origin_us: now_us,
                ttl: options.ttl,
                frame: options.frame,
                dropped: false,
            });
        }

        Ok(msg_no)
    }

    /// next never-sent block, advancing the send cursor past it
    pub fn read_next(&mut self) -> Option<&SendBlock> {
        while let Some(block) = self.blocks.get(self.next_unsent) {
            if block.dropped {
                self.next_unsent += 1;
                continue;
            }
            self.next_unsent += 1;
            return self.blocks.get(self.next_unsent - 1);
        }
        None
    }

    /// previously sent block at `offset` from the oldest unacknowledged one
    pub fn read_retrans(&self, offset: usize, now_us: u64) -> Option<RetransRead> {
        let block = self.blocks.get(offset)?;
        if offset >= self.next_unsent {
            return None;
        }

        let expired = block.dropped || match block.ttl {
            Some(ttl) => now_us.saturating_sub(block.origin_us) > ttl.as_micros() as u64,
            None => false,
        };
        if expired {
            let (first, last) = self.message_extent(offset);
            return Some(RetransRead::Expired {
                msg_no: block.msg_no,
                first_offset: first,
                last_offset: last,
            });
        }

        Some(RetransRead::Data {
            data: block.data.clone(),
            msg_no: block.msg_no,
            boundary: block.boundary,
            in_order: block.in_order,
            frame: block.frame,
        })
    }

    /// Check whether the next unsent message expired before its first
    ///  transmission. If so, release its payload, move the send cursor past
    ///  it, and report the affected block offsets so the caller can assign
    ///  sequence numbers to the skipped range and announce the drop.
    pub fn drop_expired(&mut self, now_us: u64) -> Option<(MsgNo, usize, usize)> {
        let block = self.blocks.get(self.next_unsent)?;
        let ttl = block.ttl?;
        if now_us.saturating_sub(block.origin_us) <= ttl.as_micros() as u64 {
            return None;
        }

        let msg_no = block.msg_no;
        let (first, last) = self.message_extent(self.next_unsent);
        for offset in first..=last {
            let block = &mut self.blocks[offset];
            block.dropped = true;
            block.data = Bytes::new();
        }
        self.next_unsent = last + 1;
        Some((msg_no, first, last))
    }

    /// mark an already-sent message as dropped (after a TTL-expired
    ///  retransmission read), releasing its payload
    pub fn mark_dropped(&mut self, first_offset: usize, last_offset: usize) {
        for offset in first_offset..=last_offset.min(self.blocks.len().saturating_sub(1)) {
            let block = &mut self.blocks[offset];
            block.dropped = true;
            block.data = Bytes::new();
        }
    }

    /// release the `count` oldest blocks - they are acknowledged
    pub fn ack_through(&mut self, count: usize) {
        let count = count.min(self.blocks.len());
        self.blocks.drain(..count);
        self.next_unsent = self.next_unsent.saturating_sub(count);
    }

    fn message_extent(&self, offset: usize) -> (usize, usize) {
        let msg_no = self.blocks[offset].msg_no;
        let mut first = offset;
        while first > 0 && self.blocks[first - 1].msg_no == msg_no {
            first -= 1;
        }
        let mut last = offset;
        while last + 1 < self.blocks.len() && self.blocks[last + 1].msg_no == msg_no {
            last += 1;
        }
        (first, last)
    }
}
