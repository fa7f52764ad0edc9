use std::fmt::{Display, Formatter};

/// Sequence numbers are 31 bits wide and wrap around, so they have no total
///  order. All comparisons go through the modular functions below, which are
///  valid as long as the compared numbers are less than half the sequence
///  space apart - the flow-control window enforces that.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SeqNo(u32);

impl Display for SeqNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl SeqNo {
    pub const MAX: u32 = 0x7FFF_FFFF;
    const THRESHOLD: i32 = 0x4000_0000;

    pub fn from_raw(value: u32) -> SeqNo {
        debug_assert!(value <= Self::MAX);
        SeqNo(value & Self::MAX)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    /// modular comparison: positive if self is 'newer' than other, negative if
    ///  older, zero if equal
    pub fn cmp_to(self, other: SeqNo) -> i32 {
        let diff = self.0 as i32 - other.0 as i32;
        if diff.abs() < Self::THRESHOLD {
            diff
        }
        else {
            other.0 as i32 - self.0 as i32
        }
    }

    /// signed distance from self to other, adjusted for wrap-around
    pub fn offset_to(self, other: SeqNo) -> i32 {
        let diff = other.0 as i32 - self.0 as i32;
        if diff.abs() < Self::THRESHOLD {
            diff
        }
        else if self.0 < other.0 {
            diff - Self::MAX as i32 - 1
        }
        else {
            diff + Self::MAX as i32 + 1
        }
    }

    /// number of sequence numbers in the inclusive span from self to other
    pub fn span_to(self, other: SeqNo) -> i32 {
        let span = if self.0 <= other.0 {
            other.0 as i64 - self.0 as i64 + 1
        }
        else {
            other.0 as i64 - self.0 as i64 + Self::MAX as i64 + 2
        };
        span as i32
    }

    pub fn inc(self) -> SeqNo {
        if self.0 == Self::MAX {
            SeqNo(0)
        }
        else {
            SeqNo(self.0 + 1)
        }
    }

    pub fn dec(self) -> SeqNo {
        if self.0 == 0 {
            SeqNo(Self::MAX)
        }
        else {
            SeqNo(self.0 - 1)
        }
    }

    pub fn add(self, n: i32) -> SeqNo {
        SeqNo((self.0 as i64 + n as i64).rem_euclid(Self::MAX as i64 + 1) as u32)
    }
}

/// Message numbers are 29 bits wide, sharing a header word with the boundary
///  and ordering flags.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct MsgNo(u32);

impl Display for MsgNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "msg:{}", self.0)
    }
}

impl MsgNo {
    pub const MAX: u32 = 0x1FFF_FFFF;
    pub const FIRST: MsgNo = MsgNo(1);

    pub fn from_raw(value: u32) -> MsgNo {
        debug_assert!(value <= Self::MAX);
        MsgNo(value & Self::MAX)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn inc(self) -> MsgNo {
        if self.0 == Self::MAX {
            MsgNo(1)
        }
        else {
            MsgNo(self.0 + 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::equal(5, 5, 0)]
    #[case::adjacent(6, 5, 1)]
    #[case::adjacent_rev(5, 6, -1)]
    #[case::apart(1000, 200, 800)]
    #[case::wrap(0, SeqNo::MAX, 1)]
    #[case::wrap_rev(SeqNo::MAX, 0, -1)]
    #[case::wrap_far(100, SeqNo::MAX - 100, 201)]
    fn test_cmp_to(#[case] a: u32, #[case] b: u32, #[case] expected: i32) {
        assert_eq!(SeqNo::from_raw(a).cmp_to(SeqNo::from_raw(b)), expected);
    }

    #[rstest]
    #[case::equal(5, 5, 0)]
    #[case::forward(5, 9, 4)]
    #[case::backward(9, 5, -4)]
    #[case::wrap_forward(SeqNo::MAX, 2, 3)]
    #[case::wrap_backward(2, SeqNo::MAX, -3)]
    fn test_offset_to(#[case] a: u32, #[case] b: u32, #[case] expected: i32) {
        assert_eq!(SeqNo::from_raw(a).offset_to(SeqNo::from_raw(b)), expected);
    }

    #[rstest]
    #[case::single(7, 7, 1)]
    #[case::two(7, 8, 2)]
    #[case::wrap(SeqNo::MAX, 0, 2)]
    #[case::wrap_longer(SeqNo::MAX - 1, 2, 5)]
    fn test_span_to(#[case] a: u32, #[case] b: u32, #[case] expected: i32) {
        assert_eq!(SeqNo::from_raw(a).span_to(SeqNo::from_raw(b)), expected);
    }

    #[rstest]
    #[case::simple(4, 5)]
    #[case::wrap(SeqNo::MAX, 0)]
    fn test_inc(#[case] a: u32, #[case] expected: u32) {
        assert_eq!(SeqNo::from_raw(a).inc(), SeqNo::from_raw(expected));
    }

    #[rstest]
    #[case::simple(5, 4)]
    #[case::wrap(0, SeqNo::MAX)]
    fn test_dec(#[case] a: u32, #[case] expected: u32) {
        assert_eq!(SeqNo::from_raw(a).dec(), SeqNo::from_raw(expected));
    }

    #[rstest]
    #[case::zero(9, 0, 9)]
    #[case::positive(9, 5, 14)]
    #[case::negative(9, -5, 4)]
    #[case::wrap_up(SeqNo::MAX, 3, 2)]
    #[case::wrap_down(1, -3, SeqNo::MAX - 1)]
    fn test_add(#[case] a: u32, #[case] n: i32, #[case] expected: u32) {
        assert_eq!(SeqNo::from_raw(a).add(n), SeqNo::from_raw(expected));
    }

    #[test]
    fn test_inc_dec_roundtrip() {
        for raw in [0u32, 1, 12345, SeqNo::MAX - 1, SeqNo::MAX] {
            let s = SeqNo::from_raw(raw);
            assert_eq!(s.inc().dec(), s);
            assert_eq!(s.dec().inc(), s);
        }
    }

    #[rstest]
    #[case::simple(7, 8)]
    #[case::wrap(MsgNo::MAX, 1)]
    fn test_msg_inc(#[case] a: u32, #[case] expected: u32) {
        assert_eq!(MsgNo::from_raw(a).inc(), MsgNo::from_raw(expected));
    }
}
