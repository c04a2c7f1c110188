// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of kernel time.

/// In-kernel timestamp representation: nanoseconds since boot.
///
/// Signed so that interval arithmetic near zero behaves, like the rest of
/// the kernel's nanosecond quantities. 2^63 nanoseconds is roughly 292
/// years, so overflow is not a practical concern.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    /// Sentinel meaning "no deadline" -- sorts after every reachable time.
    pub const NEVER: Self = Self(i64::MAX);

    pub const fn from_ns(ns: i64) -> Self {
        Self(ns)
    }

    pub const fn as_ns(self) -> i64 {
        self.0
    }

    /// This timestamp advanced by `ns` nanoseconds, saturating rather than
    /// wrapping into the past.
    pub const fn offset(self, ns: i64) -> Self {
        Self(self.0.saturating_add(ns))
    }

    pub fn min(self, other: Self) -> Self {
        if self.0 <= other.0 {
            self
        } else {
            other
        }
    }
}

impl From<i64> for Timestamp {
    fn from(v: i64) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for i64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

/// Possible outcomes of a timed wait.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimedWaitResult {
    NoTimeout,
    Timeout,
}

/// Conversion between hardware timer ticks and nanoseconds.
///
/// Both directions are precomputed as 32.32 fixed-point factors, so a
/// conversion is one widening multiply and a shift. Because the factor is a
/// pure function of the timer frequency, repeated conversions do not
/// accumulate drift the way an incremental "add N ns per tick" scheme would.
#[derive(Copy, Clone, Debug)]
pub struct TimeConversion {
    /// ns per tick, as a 32.32 fixed-point number.
    to_ns: u64,
    /// ticks per ns, as a 32.32 fixed-point number.
    to_ticks: u64,
}

impl TimeConversion {
    /// Builds the conversion factors for a timer running at `freq_hz`.
    ///
    /// Frequencies above 1 GHz would make the ticks-per-ns factor exceed
    /// 32.32 range; no supported part comes anywhere close.
    pub fn new(freq_hz: u32) -> Self {
        let freq = freq_hz as u128;
        // Round-to-nearest in both directions; truncation here would bias
        // every conversion the same way.
        let to_ns = (((1_000_000_000u128 << 32) + freq / 2) / freq) as u64;
        let to_ticks = (((freq << 32) + 500_000_000) / 1_000_000_000) as u64;
        Self { to_ns, to_ticks }
    }

    /// The raw fixed-point words, for stashing the conversion in statics.
    pub fn raw_factors(&self) -> (u64, u64) {
        (self.to_ns, self.to_ticks)
    }

    /// Rebuilds a conversion from [`TimeConversion::raw_factors`] output.
    pub fn from_raw_factors(to_ns: u64, to_ticks: u64) -> Self {
        Self { to_ns, to_ticks }
    }

    pub fn ticks_to_ns(&self, ticks: u64) -> i64 {
        mul_64x32d32(ticks, self.to_ns)
    }

    pub fn ns_to_ticks(&self, ns: i64) -> u64 {
        if ns <= 0 {
            return 0;
        }
        mul_64x32d32(ns as u64, self.to_ticks) as u64
    }
}

/// Multiplies a 64-bit value by a 32.32 fixed-point factor, truncating the
/// fractional part of the result.
fn mul_64x32d32(a: u64, factor: u64) -> i64 {
    (((a as u128) * (factor as u128)) >> 32) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_sorts_last() {
        assert!(Timestamp::from_ns(i64::MAX - 1) < Timestamp::NEVER);
        assert!(Timestamp::ZERO < Timestamp::NEVER);
    }

    #[test]
    fn offset_saturates() {
        assert_eq!(Timestamp::NEVER.offset(1), Timestamp::NEVER);
        assert_eq!(
            Timestamp::from_ns(5).offset(10),
            Timestamp::from_ns(15)
        );
    }

    #[test]
    fn one_second_of_ticks_is_one_billion_ns() {
        for freq in [32_768u32, 1_000_000, 8_000_000, 84_000_000, 216_000_000]
        {
            let tc = TimeConversion::new(freq);
            let ns = tc.ticks_to_ns(freq as u64);
            // The fixed-point rounding can lose a handful of ns over a full
            // second; it must never *drift* with repeated conversion, which
            // is what this checks by converting the large value directly.
            assert!(
                (ns - 1_000_000_000).abs() < 16,
                "freq {freq}: 1s converted to {ns} ns"
            );
        }
    }

    #[test]
    fn round_trip_error_is_bounded() {
        let tc = TimeConversion::new(84_000_000);
        for ns in [0i64, 1_000, 1_000_000, 123_456_789, 3_600_000_000_000] {
            let back = tc.ticks_to_ns(tc.ns_to_ticks(ns));
            // One tick at 84 MHz is ~12 ns.
            assert!((back - ns).abs() <= 12, "{ns} ns round-tripped to {back}");
        }
    }

    #[test]
    fn negative_intervals_convert_to_zero_ticks() {
        let tc = TimeConversion::new(1_000_000);
        assert_eq!(tc.ns_to_ticks(-5), 0);
    }
}
