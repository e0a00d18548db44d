use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{TypeError, TypeResult};

const FRACTION_BITS: u32 = 32;
const FRACTION_MASK: u64 = (1 << FRACTION_BITS) - 1;

/// Record timestamp used for ordering.
///
/// Stored as a 32.32 fixed-point value: the upper 32 bits are whole seconds
/// since the UNIX epoch, the lower 32 bits are the fraction of a second in
/// units of 2^-32 s. Comparing the raw value compares the instants, so the
/// derived ordering is the time ordering.
///
/// The merger never generates timestamps; it only compares the ones carried
/// by records.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The zero timestamp (the epoch).
    pub const ZERO: Self = Self(0);

    /// Wrap a raw 32.32 fixed-point value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Build a timestamp from whole seconds and milliseconds.
    ///
    /// Milliseconds above 999 carry into the seconds component; a carry
    /// past the 32-bit seconds range is an error.
    pub fn from_secs_millis(secs: u32, millis: u32) -> TypeResult<Self> {
        let secs = u32::try_from(secs as u64 + (millis / 1000) as u64)
            .map_err(|_| TypeError::TimestampOutOfRange { secs, millis })?;
        let millis = (millis % 1000) as u64;
        // Round to the nearest fraction unit so that `subsec_millis()` is exact.
        let fraction = ((millis << FRACTION_BITS) + 500) / 1000;
        Ok(Self(((secs as u64) << FRACTION_BITS) | fraction))
    }

    /// The raw 32.32 fixed-point value.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Whole seconds since the epoch.
    pub const fn secs(&self) -> u32 {
        (self.0 >> FRACTION_BITS) as u32
    }

    /// Millisecond part of the fraction, rounded to the nearest millisecond.
    pub fn subsec_millis(&self) -> u32 {
        let fraction = self.0 & FRACTION_MASK;
        let millis = ((fraction * 1000) + (1 << (FRACTION_BITS - 1))) >> FRACTION_BITS;
        millis.min(999) as u32
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}.{:03}s, raw={})", self.secs(), self.subsec_millis(), self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}", self.secs(), self.subsec_millis())
    }
}

impl From<u64> for Timestamp {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn seconds_dominate_fraction() {
        let a = Timestamp::from_secs_millis(10, 999).unwrap();
        let b = Timestamp::from_secs_millis(11, 0).unwrap();
        assert!(a < b);
    }

    #[test]
    fn millis_carry_into_seconds() {
        let ts = Timestamp::from_secs_millis(1, 2500).unwrap();
        assert_eq!(ts.secs(), 3);
        assert_eq!(ts.subsec_millis(), 500);
    }

    #[test]
    fn carry_past_seconds_range_is_rejected() {
        assert!(Timestamp::from_secs_millis(u32::MAX, 999).is_ok());
        assert_eq!(
            Timestamp::from_secs_millis(u32::MAX, 1000),
            Err(TypeError::TimestampOutOfRange {
                secs: u32::MAX,
                millis: 1000
            })
        );
    }

    #[test]
    fn zero_is_smallest() {
        assert!(Timestamp::ZERO < Timestamp::from_raw(1));
        assert_eq!(Timestamp::default(), Timestamp::ZERO);
    }

    #[test]
    fn display_format() {
        let ts = Timestamp::from_secs_millis(1_400_000_000, 42).unwrap();
        assert_eq!(format!("{ts}"), "1400000000.042");
    }

    #[test]
    fn serde_is_raw_integer() {
        let ts = Timestamp::from_raw(1234);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "1234");
        let parsed: Timestamp = serde_json::from_str("1234").unwrap();
        assert_eq!(parsed, ts);
    }

    proptest! {
        #[test]
        fn millis_survive_conversion(secs in any::<u32>(), ms in 0u32..1000) {
            let ts = Timestamp::from_secs_millis(secs, ms).unwrap();
            prop_assert_eq!((ts.secs(), ts.subsec_millis()), (secs, ms));
        }

        #[test]
        fn ordering_follows_wall_time(
            a in (any::<u32>(), 0u32..1000),
            b in (any::<u32>(), 0u32..1000),
        ) {
            let ta = Timestamp::from_secs_millis(a.0, a.1).unwrap();
            let tb = Timestamp::from_secs_millis(b.0, b.1).unwrap();
            prop_assert_eq!(a.cmp(&b), ta.cmp(&tb));
        }
    }
}
