use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::{NtpLeap, NtpTimestamp, ReferenceId};

/// Number of polls remembered in the reachability register
pub const REACH_BITS: u8 = 8;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    Ntp,
    RefClock,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOptions {
    /// Never select this source
    pub noselect: bool,
    /// Prefer this source over other admissible sources
    pub prefer: bool,
}

/// Shift register of the outcome of the last polls of a source.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reach {
    register: u8,
    size: u8,
}

impl Reach {
    pub fn update(&mut self, reachable: bool) {
        self.register = (self.register << 1) | reachable as u8;
        if self.size < REACH_BITS {
            self.size += 1;
        }
    }

    pub fn reset(&mut self) {
        *self = Reach::default();
    }

    pub fn is_reachable(&self) -> bool {
        self.register != 0
    }

    pub fn register(&self) -> u8 {
        self.register
    }

    /// Number of valid bits in the register
    pub fn size(&self) -> u8 {
        self.size
    }

    pub fn is_full(&self) -> bool {
        self.size >= REACH_BITS
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceStatus {
    /// Configured with `noselect`
    Unselectable,
    /// Not enough samples for a usable estimate
    BadStats,
    /// Waiting for other sources polled at the same rate
    WaitsStats,
    /// Unreachable with only samples older than those of reachable sources
    Stale,
    /// Serving our own orphan time back to us
    Orphan,
    /// Interval does not overlap the majority
    Falseticker,
    /// Not enough admissible sources
    WaitsSources,
    /// Admissible, but another source has the `prefer` option
    NonPreferred,
    /// Best source, but has no new sample yet
    WaitsUpdate,
    /// Too far from the selected source to be combined with it
    Distant,
    /// Combined with the selected source
    Unselected,
    Selected,
}

/// Snapshot of the statistics of a source used for one selection round.
#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionData {
    pub stratum: u8,
    /// Lower end of the interval expected to contain the true offset
    pub lo_limit: f64,
    pub hi_limit: f64,
    pub root_distance: f64,
    pub variance: f64,
    /// Age of the oldest sample
    pub first_sample_ago: f64,
    /// Age of the newest sample
    pub last_sample_ago: f64,
    /// Enough samples to be selectable
    pub select_ok: bool,
}

/// Estimate of a source used to steer the clock. The offset is valid at
/// `ref_time`; positive offsets mean the local clock is ahead.
#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingData {
    pub ref_time: NtpTimestamp,
    pub offset: f64,
    pub offset_sd: f64,
    pub frequency: f64,
    pub skew: f64,
    pub root_delay: f64,
    pub root_dispersion: f64,
}

/// A single measurement of a source.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Sample {
    pub time: NtpTimestamp,
    pub offset: f64,
    pub peer_delay: f64,
    pub peer_dispersion: f64,
    pub root_delay: f64,
    pub root_dispersion: f64,
    pub stratum: u8,
    pub leap: NtpLeap,
}

/// Per-source bookkeeping of samples, turning them into the estimates the
/// selection needs.
pub trait SourceStatistics {
    fn selection_data(&self, now: NtpTimestamp) -> SelectionData;

    fn tracking_data(&self) -> TrackingData;

    fn accumulate_sample(&mut self, sample: &Sample);

    /// Number of samples currently held
    fn sample_count(&self) -> usize;

    /// Forget all samples
    fn reset(&mut self);

    /// Correct the stored samples for a change of the local clock
    fn slew_samples(&mut self, when: NtpTimestamp, dfreq: f64, doffset: f64);

    fn add_dispersion(&mut self, dispersion: f64);
}

#[derive(Debug)]
pub struct Source<S> {
    pub(crate) ref_id: ReferenceId,
    pub(crate) ip: Option<IpAddr>,
    pub(crate) kind: SourceKind,
    pub(crate) options: SelectOptions,
    pub(crate) reach: Reach,
    pub(crate) status: SourceStatus,
    /// Still a candidate in the running selection round
    pub(crate) ok: bool,
    pub(crate) score: f64,
    /// Rounds left before the source may be combined again
    pub(crate) distant: u32,
    /// Samples since the last reference update
    pub(crate) updates: u32,
    pub(crate) leap: NtpLeap,
    pub(crate) sel_info: SelectionData,
    pub(crate) stats: S,
}

impl<S: SourceStatistics> Source<S> {
    pub fn new(
        ref_id: ReferenceId,
        ip: Option<IpAddr>,
        kind: SourceKind,
        options: SelectOptions,
        stats: S,
    ) -> Self {
        Source {
            ref_id,
            ip,
            kind,
            options,
            reach: Reach::default(),
            status: SourceStatus::BadStats,
            ok: false,
            score: 1.0,
            distant: 0,
            updates: 0,
            leap: NtpLeap::Normal,
            sel_info: SelectionData::default(),
            stats,
        }
    }

    pub fn ref_id(&self) -> ReferenceId {
        self.ref_id
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn options(&self) -> SelectOptions {
        self.options
    }

    pub fn set_options(&mut self, options: SelectOptions) {
        self.options = options;
    }

    pub fn status(&self) -> SourceStatus {
        self.status
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn reach(&self) -> Reach {
        self.reach
    }

    pub fn leap(&self) -> NtpLeap {
        self.leap
    }

    pub fn stats(&self) -> &S {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut S {
        &mut self.stats
    }

    pub(crate) fn mark(&mut self, status: SourceStatus) {
        self.status = status;
        self.ok = false;
    }

    pub fn report(&self) -> SourceReport {
        SourceReport {
            ref_id: self.ref_id,
            ip: self.ip,
            kind: self.kind,
            options: self.options,
            status: self.status,
            reach: self.reach.register(),
            reach_size: self.reach.size(),
            score: self.score,
            distant: self.distant,
            leap: self.leap,
            stratum: self.sel_info.stratum,
            lo_limit: self.sel_info.lo_limit,
            hi_limit: self.sel_info.hi_limit,
            root_distance: self.sel_info.root_distance,
        }
    }
}

/// Externally visible state of a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub ref_id: ReferenceId,
    pub ip: Option<IpAddr>,
    pub kind: SourceKind,
    pub options: SelectOptions,
    pub status: SourceStatus,
    pub reach: u8,
    pub reach_size: u8,
    pub score: f64,
    pub distant: u32,
    pub leap: NtpLeap,
    pub stratum: u8,
    pub lo_limit: f64,
    pub hi_limit: f64,
    pub root_distance: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reach_register() {
        let mut reach = Reach::default();
        assert!(!reach.is_reachable());

        reach.update(true);
        reach.update(false);
        assert_eq!(reach.register(), 0b10);
        assert_eq!(reach.size(), 2);
        assert!(reach.is_reachable());

        for _ in 0..8 {
            reach.update(false);
        }
        assert!(!reach.is_reachable());
        assert!(reach.is_full());
        assert_eq!(reach.size(), REACH_BITS);

        for _ in 0..10 {
            reach.update(true);
        }
        assert_eq!(reach.register(), 0xFF);

        reach.reset();
        assert_eq!(reach, Reach::default());
    }
}
