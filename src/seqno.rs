use std::fmt::{Display, Formatter};
use std::ops::{Add, AddAssign, Sub};

/// The sequence number of the first message on every new connection.
pub const FIRST_SEQNO: Seqno = Seqno(1);

/// Per-connection message sequence number, strictly increasing from
/// [`FIRST_SEQNO`]. Seqno 0 never travels in a DATA header; it is the
/// "nothing delivered yet" baseline of a fresh window.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Seqno(u64);

impl Display for Seqno {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl Seqno {
    pub const ZERO: Seqno = Seqno(0);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Seqno {
        Seqno(self.0 + 1)
    }

    pub fn checked_minus(&self, other: u64) -> Option<Seqno> {
        self.0.checked_sub(other).map(Seqno)
    }
}

impl Add<u64> for Seqno {
    type Output = Seqno;

    fn add(self, rhs: u64) -> Seqno {
        Seqno(self.0 + rhs)
    }
}

impl AddAssign<u64> for Seqno {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

/// Distance between two seqnos. Saturates at 0 rather than underflowing, so
/// `a - b` with `b > a` is safe in watermark arithmetic.
impl Sub<Seqno> for Seqno {
    type Output = u64;

    fn sub(self, rhs: Seqno) -> u64 {
        self.0.saturating_sub(rhs.0)
    }
}
