use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// A point in time on the NTP timescale, in 32.32 fixed point seconds.
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Default, Hash, Serialize, Deserialize)]
pub struct NtpTimestamp {
    timestamp: u64,
}

/// Unix uses an epoch located at 1/1/1970-00:00h (UTC) and NTP uses 1/1/1900-00:00h.
/// This leads to an offset equivalent to 70 years in seconds
/// there are 17 leap years between the two dates so the offset is
const EPOCH_OFFSET: u64 = (70 * 365 + 17) * 86400;

impl NtpTimestamp {
    pub fn from_seconds_nanos_since_ntp_era(seconds: u32, nanos: u32) -> Self {
        // NTP uses 1/2^32 sec as its unit of fractional time.
        // our time is in nanoseconds, so 1/1e9 seconds
        let fraction = ((nanos as u64) << 32) / 1_000_000_000;

        let timestamp = ((seconds as u64) << 32) + fraction;
        NtpTimestamp { timestamp }
    }

    /// Convert unix seconds and nanoseconds to the NTP timescale. Times past
    /// the end of the first NTP era wrap into the next one.
    pub fn from_unix(seconds: i64, nanos: u32) -> Self {
        let ntp_seconds = (seconds as u64).wrapping_add(EPOCH_OFFSET) as u32;
        Self::from_seconds_nanos_since_ntp_era(ntp_seconds, nanos)
    }

    pub fn from_unix_seconds(seconds: f64) -> Self {
        let whole = seconds.floor();
        let nanos = ((seconds - whole) * 1e9) as u32;
        Self::from_unix(whole as i64, nanos.min(999_999_999))
    }

    /// Whole unix seconds of this timestamp. Era 0 timestamps before the unix
    /// epoch are assumed to belong to era 1 (2036 and later).
    pub fn unix_seconds(self) -> i64 {
        let ntp_seconds = self.timestamp >> 32;
        if ntp_seconds >= EPOCH_OFFSET {
            (ntp_seconds - EPOCH_OFFSET) as i64
        } else {
            (ntp_seconds + (1u64 << 32) - EPOCH_OFFSET) as i64
        }
    }

    pub fn to_unix_seconds(self) -> f64 {
        self.unix_seconds() as f64 + self.fraction_seconds()
    }

    /// The sub-second part of the timestamp, in seconds.
    pub fn fraction_seconds(self) -> f64 {
        (self.timestamp & 0xFFFF_FFFF) as f64 / (1u64 << 32) as f64
    }

    pub fn add_seconds(self, seconds: f64) -> Self {
        self + NtpDuration::from_seconds(seconds)
    }

    /// Signed difference `self - earlier` in seconds.
    pub fn seconds_since(self, earlier: NtpTimestamp) -> f64 {
        (self - earlier).to_seconds()
    }

    #[cfg(test)]
    pub(crate) const fn from_fixed_int(timestamp: u64) -> NtpTimestamp {
        NtpTimestamp { timestamp }
    }
}

impl Add<NtpDuration> for NtpTimestamp {
    type Output = NtpTimestamp;

    fn add(self, rhs: NtpDuration) -> Self::Output {
        // In order to properly deal with ntp era changes, timestamps
        // need to roll over. Converting the duration to u64 here
        // still gives desired effects because of how two's complement
        // arithmetic works.
        NtpTimestamp {
            timestamp: self.timestamp.wrapping_add(rhs.duration as u64),
        }
    }
}

impl AddAssign<NtpDuration> for NtpTimestamp {
    fn add_assign(&mut self, rhs: NtpDuration) {
        self.timestamp = self.timestamp.wrapping_add(rhs.duration as u64);
    }
}

impl Sub for NtpTimestamp {
    type Output = NtpDuration;

    fn sub(self, rhs: Self) -> Self::Output {
        // Doing a wrapping substract to a signed integer type always
        // gives us the result as if the eras of the timestamps were
        // chosen to minimize the norm of the difference
        NtpDuration {
            duration: self.timestamp.wrapping_sub(rhs.timestamp) as i64,
        }
    }
}

impl Sub<NtpDuration> for NtpTimestamp {
    type Output = NtpTimestamp;

    fn sub(self, rhs: NtpDuration) -> Self::Output {
        NtpTimestamp {
            timestamp: self.timestamp.wrapping_sub(rhs.duration as u64),
        }
    }
}

impl SubAssign<NtpDuration> for NtpTimestamp {
    fn sub_assign(&mut self, rhs: NtpDuration) {
        self.timestamp = self.timestamp.wrapping_sub(rhs.duration as u64);
    }
}

/// A signed span of time in 32.32 fixed point seconds.
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Default, Hash, Serialize, Deserialize)]
pub struct NtpDuration {
    duration: i64,
}

impl NtpDuration {
    pub const ZERO: Self = Self { duration: 0 };

    pub fn to_seconds(self) -> f64 {
        self.duration as f64 / (1u64 << 32) as f64
    }

    pub fn from_seconds(seconds: f64) -> Self {
        debug_assert!(!(seconds.is_nan() || seconds.is_infinite()));

        let i = seconds.floor();
        let f = seconds - i;

        let duration = match i as i64 {
            i if i >= i32::MIN as i64 && i <= i32::MAX as i64 => {
                (i << 32) | (f * (1u64 << 32) as f64) as i64
            }
            i if i < i32::MIN as i64 => i64::MIN,
            _ => i64::MAX,
        };

        Self { duration }
    }

    pub const fn abs(self) -> Self {
        Self {
            duration: self.duration.saturating_abs(),
        }
    }

    /// Split into whole seconds (rounded towards negative infinity) and
    /// nanoseconds, as expected by OS clock interfaces.
    pub const fn as_seconds_nanos(self) -> (i32, u32) {
        (
            (self.duration >> 32) as i32,
            (((self.duration & 0xFFFFFFFF) * 1_000_000_000) >> 32) as u32,
        )
    }

    #[cfg(test)]
    pub(crate) const fn from_fixed_int(duration: i64) -> NtpDuration {
        NtpDuration { duration }
    }
}

impl Add for NtpDuration {
    type Output = NtpDuration;

    fn add(self, rhs: Self) -> Self::Output {
        // For duration, saturation is safer as that ensures
        // addition or substraction of two big durations never
        // unintentionally cancel.
        NtpDuration {
            duration: self.duration.saturating_add(rhs.duration),
        }
    }
}

impl AddAssign for NtpDuration {
    fn add_assign(&mut self, rhs: Self) {
        self.duration = self.duration.saturating_add(rhs.duration);
    }
}

impl Sub for NtpDuration {
    type Output = NtpDuration;

    fn sub(self, rhs: Self) -> Self::Output {
        NtpDuration {
            duration: self.duration.saturating_sub(rhs.duration),
        }
    }
}

impl SubAssign for NtpDuration {
    fn sub_assign(&mut self, rhs: Self) {
        self.duration = self.duration.saturating_sub(rhs.duration);
    }
}

impl Neg for NtpDuration {
    type Output = NtpDuration;

    fn neg(self) -> Self::Output {
        NtpDuration {
            duration: self.duration.saturating_neg(),
        }
    }
}
