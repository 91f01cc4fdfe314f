//! Source selection and clock steering for network time daemons.
//!
//! The [`SyncEngine`] owns the [`SourceSelector`], which decides which
//! sources agree on the time, and the [`ReferenceSteerer`], which turns
//! their combined estimate into adjustments of a [`LocalClock`].

#![forbid(unsafe_code)]

mod clock;
mod config;
mod drift;
mod engine;
mod fallback;
mod identifiers;
mod leap;
mod reference;
pub mod regression;
mod scheduler;
mod selection;
mod source;
mod time_types;
mod tracking_log;

pub use clock::{ClockChange, ClockChangeKind, ClockDriver, ClockEvent, LocalClock};
pub use config::{
    ClockConfig, FallbackDriftConfig, LeapMode, LocalReferenceConfig, MakeStepConfig,
    MaxChangeConfig, ReferenceConfig, SelectionConfig, UpdateLimit,
};
pub use drift::{read_drift_file, write_drift_file, DriftEstimate, DriftFileError};
pub use engine::{ClockChangeListener, EngineSnapshot, ListenerId, SyncEngine};
pub use fallback::FallbackDrifts;
pub use identifiers::ReferenceId;
pub use leap::{
    is_leap_second_day, next_midnight, LeapDatabase, LeapListError, LeapSecondsList, NtpLeap,
};
pub use reference::{
    ReferenceMode, ReferenceParams, ReferenceReport, ReferenceSteerer, ReferenceUpdateResult,
    MAX_STRATUM,
};
pub use scheduler::{Scheduler, TimeoutId, TimerEvent, TimerQueue};
#[cfg(feature = "fuzz")]
pub use selection::fuzz_find_interval;
pub use selection::{
    find_best_interval, BestInterval, Endpoint, EndpointTag, ReferenceUpdate, SelectionContext,
    SelectionOutcome, SourceSelector, DISTANT_PENALTY, SCORE_LIMIT,
};
pub use source::{
    Reach, Sample, SelectOptions, SelectionData, Source, SourceKind, SourceReport,
    SourceStatistics, SourceStatus, TrackingData, REACH_BITS,
};
pub use time_types::{NtpDuration, NtpTimestamp};
pub use tracking_log::{format_entry, TrackingEntry, TrackingLog};
