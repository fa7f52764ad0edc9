//! Receive-side ring buffer. Slots are addressed by their offset from the
//!  ACK cursor; data becomes readable for the application only once the ACK
//!  cursor has moved past it, and reads always return bytes in sequence
//!  order.

use crate::packet::{FrameMeta, MsgBoundary};
use crate::seq::MsgNo;

/// one received payload plus the header metadata the application may care about
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct RecvSlot {
    pub data: Vec<u8>,
    pub msg_no: MsgNo,
    pub boundary: MsgBoundary,
    pub in_order: bool,
    pub frame: Option<FrameMeta>,
    /// the header's timestamp word - the frame deadline on frame-aware flows
    pub timestamp: u32,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum InsertOutcome {
    Stored,
    /// slot already occupied - retransmit overlap, silently ignored
    Duplicate,
    /// offset does not fit the free window
    OutOfWindow,
}

pub struct ReceiveBuffer {
    slots: Vec<Option<RecvSlot>>,
    /// ring index of the next slot the application reads
    read_pos: usize,
    /// ring index the ACK cursor points at; inserts are relative to this
    ack_pos: usize,
    /// slots between read_pos and ack_pos (acknowledged, not yet read)
    pending: usize,
    /// bytes already consumed from the slot at read_pos
    partial_read: usize,
}

impl ReceiveBuffer {
    pub fn new(capacity_packets: usize) -> ReceiveBuffer {
        assert!(capacity_packets > 0);
        ReceiveBuffer {
            slots: (0..capacity_packets).map(|_| None).collect(),
            read_pos: 0,
            ack_pos: 0,
            pending: 0,
            partial_read: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// free slots for new data, as advertised in outgoing ACKs
    pub fn available(&self) -> usize {
        self.capacity() - self.pending
    }

    pub fn insert(&mut self, offset: usize, slot: RecvSlot) -> InsertOutcome {
        if offset >= self.available() {
            return InsertOutcome::OutOfWindow;
        }

        let idx = (self.ack_pos + offset) % self.capacity();
        if self.slots[idx].is_some() {
            return InsertOutcome::Duplicate;
        }

        self.slots[idx] = Some(slot);
        InsertOutcome::Stored
    }

    /// Move the ACK cursor forward over `count` slots, making them readable.
    ///  Slots cleared by a message drop pass through as holes and are skipped
    ///  on read.
    pub fn ack_through(&mut self, count: usize) {
        let count = count.min(self.available());
        self.ack_pos = (self.ack_pos + count) % self.capacity();
        self.pending += count;
    }

    pub fn has_readable(&self) -> bool {
        (0..self.pending)
            .any(|i| self.slots[(self.read_pos + i) % self.capacity()].is_some())
    }

    /// copy contiguous acknowledged bytes into `out`, freeing fully consumed
    ///  slots; returns the number of bytes copied
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let mut copied = 0;

        while self.pending > 0 && copied < out.len() {
            let idx = self.read_pos;
            let Some(slot) = &self.slots[idx] else {
                // hole left by a dropped message
                self.advance_read_pos();
                continue;
            };

            let remaining = &slot.data[self.partial_read..];
            let n = remaining.len().min(out.len() - copied);
            out[copied..copied + n].copy_from_slice(&remaining[..n]);
            copied += n;
            self.partial_read += n;

            if self.partial_read >= slot.data.len() {
                self.slots[idx] = None;
                self.advance_read_pos();
            }
        }

        copied
    }

    /// take the next acknowledged packet whole, with its metadata - the
    ///  frame-aware read path. A partially `read` slot yields its remaining
    ///  bytes.
    pub fn read_chunk(&mut self) -> Option<RecvSlot> {
        while self.pending > 0 {
            let idx = self.read_pos;
            match self.slots[idx].take() {
                None => {
                    self.advance_read_pos();
                }
                Some(mut slot) => {
                    if self.partial_read > 0 {
                        slot.data.drain(..self.partial_read);
                    }
                    self.advance_read_pos();
                    return Some(slot);
                }
            }
        }
        None
    }

    /// clear all not-yet-acknowledged slots belonging to `msg_no`; returns the
    ///  number of slots cleared
    pub fn drop_message(&mut self, msg_no: MsgNo) -> usize {
        let mut cleared = 0;
        for offset in 0..self.available() {
            let idx = (self.ack_pos + offset) % self.capacity();
            if self.slots[idx].as_ref().is_some_and(|slot| slot.msg_no == msg_no) {
                self.slots[idx] = None;
                cleared += 1;
            }
        }
        cleared
    }

    fn advance_read_pos(&mut self) {
        self.read_pos = (self.read_pos + 1) % self.capacity();
        self.pending -= 1;
        self.partial_read = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn slot(data: &[u8], msg_no: u32) -> RecvSlot {
        RecvSlot {
            data: data.to_vec(),
            msg_no: MsgNo::from_raw(msg_no),
            boundary: MsgBoundary::Solo,
            in_order: false,
            frame: None,
            timestamp: 0,
        }
    }

    #[test]
    fn test_in_order_read() {
        let mut buf = ReceiveBuffer::new(8);
        assert_eq!(buf.insert(0, slot(b"abc", 1)), InsertOutcome::Stored);
        assert_eq!(buf.insert(1, slot(b"def", 2)), InsertOutcome::Stored);

        // nothing readable before the ACK cursor moves
        let mut out = [0u8; 16];
        assert!(!buf.has_readable());
        assert_eq!(buf.read(&mut out), 0);

        buf.ack_through(2);
        assert!(buf.has_readable());
        let n = buf.read(&mut out);
        assert_eq!(&out[..n], b"abcdef");
        assert_eq!(buf.available(), 8);
    }

    #[test]
    fn test_partial_reads_resume_mid_slot() {
        let mut buf = ReceiveBuffer::new(4);
        buf.insert(0, slot(b"abcdef", 1));
        buf.ack_through(1);

        let mut out = [0u8; 4];
        assert_eq!(buf.read(&mut out), 4);
        assert_eq!(&out, b"abcd");

        assert_eq!(buf.read(&mut out), 2);
        assert_eq!(&out[..2], b"ef");

        assert_eq!(buf.read(&mut out), 0);
    }

    #[test]
    fn test_duplicate_insert_is_ignored() {
        let mut buf = ReceiveBuffer::new(4);
        assert_eq!(buf.insert(2, slot(b"xx", 1)), InsertOutcome::Stored);
        assert_eq!(buf.insert(2, slot(b"yy", 1)), InsertOutcome::Duplicate);

        buf.insert(0, slot(b"a", 2));
        buf.insert(1, slot(b"b", 3));
        buf.ack_through(3);

        let mut out = [0u8; 8];
        let n = buf.read(&mut out);
        assert_eq!(&out[..n], b"abxx");
    }

    #[rstest]
    #[case::just_outside(4, 4)]
    #[case::far_outside(4, 100)]
    fn test_out_of_window_insert_rejected(#[case] capacity: usize, #[case] offset: usize) {
        let mut buf = ReceiveBuffer::new(capacity);
        assert_eq!(buf.insert(offset, slot(b"x", 1)), InsertOutcome::OutOfWindow);
    }

    #[test]
    fn test_window_shrinks_with_unread_data() {
        let mut buf = ReceiveBuffer::new(4);
        buf.insert(0, slot(b"a", 1));
        buf.insert(1, slot(b"b", 2));
        buf.ack_through(2);

        assert_eq!(buf.available(), 2);
        assert_eq!(buf.insert(2, slot(b"x", 3)), InsertOutcome::OutOfWindow);
        assert_eq!(buf.insert(1, slot(b"c", 3)), InsertOutcome::Stored);

        // reading frees the window again
        let mut out = [0u8; 8];
        buf.read(&mut out);
        assert_eq!(buf.available(), 4);
    }

    #[test]
    fn test_drop_message_leaves_hole_that_reads_skip() {
        let mut buf = ReceiveBuffer::new(8);
        buf.insert(0, slot(b"a", 1));
        buf.insert(1, slot(b"b1", 2));
        buf.insert(2, slot(b"b2", 2));
        buf.insert(3, slot(b"c", 3));

        assert_eq!(buf.drop_message(MsgNo::from_raw(2)), 2);

        buf.ack_through(4);
        let mut out = [0u8; 8];
        let n = buf.read(&mut out);
        assert_eq!(&out[..n], b"ac");
    }

    #[test]
    fn test_read_chunk_returns_metadata() {
        let mut buf = ReceiveBuffer::new(4);
        let mut s = slot(b"chunk", 1);
        s.frame = Some(FrameMeta { frame_id: 9, chunk_id: 2, total_chunks: 10 });
        s.timestamp = 16_000;
        buf.insert(0, s.clone());
        buf.ack_through(1);

        let chunk = buf.read_chunk().unwrap();
        assert_eq!(chunk, s);
        assert!(buf.read_chunk().is_none());
        assert_eq!(buf.available(), 4);
    }

    #[test]
    fn test_ring_wraps_around() {
        let mut buf = ReceiveBuffer::new(3);
        let mut out = [0u8; 8];

        for round in 0..7u8 {
            buf.insert(0, slot(&[round], 1));
            buf.insert(1, slot(&[round + 100], 1));
            buf.ack_through(2);
            let n = buf.read(&mut out);
            assert_eq!(&out[..n], &[round, round + 100]);
        }
    }
}
