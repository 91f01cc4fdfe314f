use std::{fmt, path::Path};

use chrono::{DateTime, Datelike};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Seconds between the NTP epoch (1900) and the unix epoch (1970).
const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

const SECONDS_PER_DAY: i64 = 86400;

/// Samples taken this many seconds around a leap second are suspect.
pub const LEAP_SECOND_CLOSE: i64 = 5;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NtpLeap {
    #[default]
    Normal,
    InsertSecond,
    DeleteSecond,
    Unsynchronised,
}

impl NtpLeap {
    /// Seconds added to UTC at the end of the day
    pub fn as_seconds(self) -> i32 {
        match self {
            NtpLeap::InsertSecond => 1,
            NtpLeap::DeleteSecond => -1,
            NtpLeap::Normal | NtpLeap::Unsynchronised => 0,
        }
    }

    pub fn from_seconds(leap_sec: i32) -> NtpLeap {
        match leap_sec.signum() {
            1 => NtpLeap::InsertSecond,
            -1 => NtpLeap::DeleteSecond,
            _ => NtpLeap::Normal,
        }
    }

    /// Code used in the tracking log
    pub(crate) fn as_char(self) -> char {
        match self {
            NtpLeap::Normal => 'N',
            NtpLeap::InsertSecond => '+',
            NtpLeap::DeleteSecond => '-',
            NtpLeap::Unsynchronised => '?',
        }
    }
}

/// Source of leap second announcements independent of the time sources.
pub trait LeapDatabase {
    /// Leap second at the end of the UTC day containing `unix_time`, and the
    /// TAI-UTC offset in effect at `unix_time`.
    fn get_leap(&self, unix_time: i64) -> (NtpLeap, i32);
}

/// Leap seconds are only scheduled at the end of June and December.
pub fn is_leap_second_day(unix_time: i64) -> bool {
    match DateTime::from_timestamp(unix_time, 0) {
        Some(date) => {
            let date = date.date_naive();
            (date.month() == 6 && date.day() == 30) || (date.month() == 12 && date.day() == 31)
        }
        None => false,
    }
}

/// Unix time of the midnight following `unix_time`.
pub fn next_midnight(unix_time: i64) -> i64 {
    (unix_time.div_euclid(SECONDS_PER_DAY) + 1) * SECONDS_PER_DAY
}

#[derive(Debug)]
pub enum LeapListError {
    Io(std::io::Error),
    Parse { line: usize },
    Empty,
}

impl fmt::Display for LeapListError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error while reading leap second list: {e}"),
            Self::Parse { line } => write!(f, "invalid leap second list entry on line {line}"),
            Self::Empty => f.write_str("leap second list has no entries"),
        }
    }
}

impl std::error::Error for LeapListError {}

impl From<std::io::Error> for LeapListError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Leap second table in the format of the IERS/NIST `leap-seconds.list`
/// files: lines of NTP seconds and TAI-UTC offset, `#` comments, and a
/// `#@` line holding the expiry time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeapSecondsList {
    /// (unix time, TAI-UTC from then on), sorted by time
    entries: Vec<(i64, i32)>,
    expires: Option<i64>,
}

impl LeapSecondsList {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LeapListError> {
        let contents = std::fs::read_to_string(path)?;
        contents.parse()
    }

    pub fn expires(&self) -> Option<i64> {
        self.expires
    }

    fn tai_offset_at(&self, unix_time: i64) -> Option<i32> {
        self.entries
            .iter()
            .take_while(|(when, _)| *when <= unix_time)
            .last()
            .map(|(_, tai)| *tai)
    }
}

impl std::str::FromStr for LeapSecondsList {
    type Err = LeapListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut entries = vec![];
        let mut expires = None;

        for (index, line) in s.lines().enumerate() {
            let line_number = index + 1;
            if let Some(expiry) = line.strip_prefix("#@") {
                let ntp: i64 = expiry
                    .trim()
                    .parse()
                    .map_err(|_| LeapListError::Parse { line: line_number })?;
                expires = Some(ntp - NTP_UNIX_OFFSET);
                continue;
            }

            let data = match line.split_once('#') {
                Some((data, _comment)) => data,
                None => line,
            };
            let mut fields = data.split_whitespace();
            let (Some(when), Some(tai)) = (fields.next(), fields.next()) else {
                continue;
            };

            let when: i64 = when
                .parse()
                .map_err(|_| LeapListError::Parse { line: line_number })?;
            let tai: i32 = tai
                .parse()
                .map_err(|_| LeapListError::Parse { line: line_number })?;
            entries.push((when - NTP_UNIX_OFFSET, tai));
        }

        if entries.is_empty() {
            return Err(LeapListError::Empty);
        }

        entries.sort_by_key(|(when, _)| *when);

        Ok(LeapSecondsList { entries, expires })
    }
}

impl LeapDatabase for LeapSecondsList {
    fn get_leap(&self, unix_time: i64) -> (NtpLeap, i32) {
        let tai_offset = self.tai_offset_at(unix_time).unwrap_or(0);

        if let Some(expires) = self.expires {
            if unix_time > expires {
                warn!("Leap second list expired");
                return (NtpLeap::Normal, tai_offset);
            }
        }

        let midnight = next_midnight(unix_time);
        let leap = self
            .entries
            .iter()
            .find(|(when, _)| *when == midnight)
            .map(|(_, tai)| NtpLeap::from_seconds(tai - tai_offset))
            .unwrap_or(NtpLeap::Normal);

        (leap, tai_offset)
    }
}
