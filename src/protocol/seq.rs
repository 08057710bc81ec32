//! Sequence number arithmetic modulo 2^32.
//!
//! Sequence numbers deliberately do not implement `PartialOrd`; every
//! comparison goes through the wraparound-aware helpers below.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// A TCP sequence or acknowledgment number.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeqNumber(u32);

impl SeqNumber {
    /// Wraps a raw 32-bit sequence number.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw 32-bit value.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns `true` if `self` comes strictly before `other`.
    #[inline]
    pub fn lt(self, other: SeqNumber) -> bool {
        wrapping_lt(self.0, other.0)
    }

    /// Returns `true` if `self` comes before or is equal to `other`.
    #[inline]
    pub fn le(self, other: SeqNumber) -> bool {
        self == other || self.lt(other)
    }

    /// Returns `true` if `self` comes strictly after `other`.
    #[inline]
    pub fn gt(self, other: SeqNumber) -> bool {
        other.lt(self)
    }

    /// Returns `true` if `self` comes after or is equal to `other`.
    #[inline]
    pub fn ge(self, other: SeqNumber) -> bool {
        other.le(self)
    }

    /// Returns the number of sequence numbers from `earlier` up to `self`.
    ///
    /// Only meaningful when `earlier.le(self)`.
    #[inline]
    pub fn distance(self, earlier: SeqNumber) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// Returns `true` if `self` lies in `[start, start + len)`.
    #[inline]
    pub fn in_window(self, start: SeqNumber, len: u32) -> bool {
        self.distance(start) < len
    }

    /// Returns the later of the two sequence numbers.
    #[inline]
    pub fn max_wrapped(self, other: SeqNumber) -> SeqNumber {
        if self.lt(other) { other } else { self }
    }
}

impl From<u32> for SeqNumber {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<SeqNumber> for u32 {
    fn from(seq: SeqNumber) -> Self {
        seq.0
    }
}

impl Add<u32> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: u32) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u32> for SeqNumber {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u32> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: u32) -> SeqNumber {
        SeqNumber(self.0.wrapping_sub(rhs))
    }
}

impl SubAssign<u32> for SeqNumber {
    fn sub_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_sub(rhs);
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[inline]
fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    // RFC 1323 (2.3)
    //
    // TCP determines if a data segment is "old" or "new" by testing whether
    // its sequence number is within 2**31 bytes of the left edge of the window,
    // and if it is not, discarding the data as "old". To insure that new data
    // is never mistakenly considered old and vice-versa, the left edge of the
    // sender's window has to be at most 2**31 away from the right edge of the
    // receiver's window.
    lhs.wrapping_sub(rhs) > (1 << 31)
}

/// Returns `true` is the value `x` is in between the values `start` and `end`,
/// using wrapping arithmetic.
#[inline]
pub fn is_between_wrapped(start: SeqNumber, x: SeqNumber, end: SeqNumber) -> bool {
    start.lt(x) && x.lt(end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_ordering_plain() {
        let a = SeqNumber::new(100);
        let b = SeqNumber::new(101);

        assert!(a.lt(b));
        assert!(a.le(b));
        assert!(b.gt(a));
        assert!(!b.lt(a));
        assert!(a.le(a));
        assert!(!a.lt(a));
    }

    #[test]
    fn seq_ordering_at_wraparound() {
        let max = SeqNumber::new(u32::MAX);
        let zero = SeqNumber::new(0);

        // 2^32 - 1 is "before" 0 once the counter wraps.
        assert!(max.lt(zero));
        assert!(zero.gt(max));
        assert_eq!(max + 1, zero);
        assert_eq!(zero - 1, max);
        assert_eq!(zero.distance(max), 1);

        // Old duplicate just behind 0 versus future data just ahead of it.
        let expected = zero;
        let old = SeqNumber::new(u32::MAX - 9);
        let future = SeqNumber::new(10);

        assert!(old.lt(expected));
        assert!(future.gt(expected));
        assert!(old.in_window(old, 20));
        assert!(expected.in_window(old, 20));
        assert!(!future.in_window(old, 20));
    }

    #[test]
    fn seq_window_membership() {
        let start = SeqNumber::new(u32::MAX - 4);

        assert!(start.in_window(start, 10));
        assert!(SeqNumber::new(4).in_window(start, 10));
        assert!(!SeqNumber::new(5).in_window(start, 10));
        assert!(!SeqNumber::new(u32::MAX - 5).in_window(start, 10));
        assert!(!start.in_window(start, 0));
    }

    #[test]
    fn seq_between_wrapped() {
        let start = SeqNumber::new(u32::MAX - 1);
        let end = SeqNumber::new(3);

        assert!(is_between_wrapped(start, SeqNumber::new(0), end));
        assert!(is_between_wrapped(start, SeqNumber::new(u32::MAX), end));
        assert!(!is_between_wrapped(start, start, end));
        assert!(!is_between_wrapped(start, end, end));
    }

    #[test]
    fn seq_max_wrapped() {
        let a = SeqNumber::new(u32::MAX);
        let b = SeqNumber::new(2);

        assert_eq!(a.max_wrapped(b), b);
        assert_eq!(b.max_wrapped(a), b);
    }
}
