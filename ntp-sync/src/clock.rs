use std::collections::VecDeque;

use tracing::{debug, error, warn};

use crate::{config::ClockConfig, NtpTimestamp};

/// Interface to the clock the daemon steers. Implemented per platform and
/// handed to the [`LocalClock`] at startup.
///
/// Offsets passed to the driver follow the convention that a positive offset
/// means the local clock is ahead of true time, and frequencies are absolute
/// corrections in ppm where a positive value slows the clock down.
pub trait ClockDriver {
    type Error: std::error::Error;

    /// Current raw time, without the correction still being slewed in.
    fn now(&self) -> NtpTimestamp;

    fn read_frequency(&self) -> Result<f64, Self::Error>;

    /// Set the absolute frequency correction. Returns the value actually
    /// applied, which may be rounded by the driver.
    fn set_frequency(&self, freq_ppm: f64) -> Result<f64, Self::Error>;

    /// Start slewing out `offset` at roughly `offset / correction_rate`.
    fn accrue_offset(&self, offset: f64, correction_rate: f64) -> Result<(), Self::Error>;

    fn apply_step_offset(&self, offset: f64) -> Result<(), Self::Error>;

    /// Correction that should be added to a raw timestamp to get the cooked
    /// time, and its error bound.
    fn offset_convert(&self, _raw: NtpTimestamp) -> (f64, f64) {
        (0.0, 0.0)
    }

    /// Whether the driver can insert or delete leap seconds itself.
    fn can_system_leap(&self) -> bool {
        false
    }

    fn set_leap(&self, _leap: i32, _tai_offset: i32) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_sync_status(&self, _synchronised: bool, _est_error: f64, _max_error: f64) {}

    /// Next moment the driver needs [`ClockDriver::maintain`] to be called,
    /// for drivers that slew by temporarily adjusting the frequency.
    fn maintenance_deadline(&self) -> Option<NtpTimestamp> {
        None
    }

    fn maintain(&self) {}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClockChangeKind {
    Adjust,
    Step,
    /// The clock was changed by something outside our control
    UnknownStep,
}

/// A change in the parameters of the local clock. `dfreq` is the relative
/// frequency change, `doffset` the offset that was corrected.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ClockChange {
    pub raw: NtpTimestamp,
    pub cooked: NtpTimestamp,
    pub dfreq: f64,
    pub doffset: f64,
    pub kind: ClockChangeKind,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ClockEvent {
    Change(ClockChange),
    /// Extra dispersion to add to every sample
    Dispersion(f64),
}

/// Frequency bookkeeping on top of a [`ClockDriver`]. Every change to the
/// clock is queued as a [`ClockEvent`], which the owner drains and forwards to
/// whoever keeps timestamps relative to the clock.
#[derive(Debug)]
pub struct LocalClock<C: ClockDriver> {
    driver: C,
    current_freq_ppm: f64,
    max_freq_ppm: f64,
    max_clock_error: f64,
    events: VecDeque<ClockEvent>,
}

impl<C: ClockDriver> LocalClock<C> {
    pub fn new(driver: C, config: &ClockConfig) -> Self {
        let current_freq_ppm = match driver.read_frequency() {
            Ok(freq) => freq,
            Err(e) => {
                error!(error = %e, "Could not read clock frequency");
                0.0
            }
        };

        let mut clock = LocalClock {
            driver,
            current_freq_ppm,
            max_freq_ppm: config.max_drift,
            max_clock_error: config.max_clock_error * 1e-6,
            events: VecDeque::new(),
        };

        let clamped = clock.clamp_freq(current_freq_ppm);
        if clamped != current_freq_ppm {
            clock.set_absolute_frequency(clamped);
        }

        clock
    }

    pub fn driver(&self) -> &C {
        &self.driver
    }

    pub fn read_raw_time(&self) -> NtpTimestamp {
        self.driver.now()
    }

    /// Correction and its error for a raw timestamp.
    pub fn get_offset_correction(&self, raw: NtpTimestamp) -> (f64, f64) {
        self.driver.offset_convert(raw)
    }

    pub fn cook_time(&self, raw: NtpTimestamp) -> (NtpTimestamp, f64) {
        let (correction, err) = self.get_offset_correction(raw);
        (raw.add_seconds(correction), err)
    }

    pub fn read_cooked_time(&self) -> (NtpTimestamp, f64) {
        self.cook_time(self.read_raw_time())
    }

    /// Maximum error of the clock frequency, as a fraction.
    pub fn max_clock_error(&self) -> f64 {
        self.max_clock_error
    }

    pub fn read_absolute_frequency(&self) -> f64 {
        self.current_freq_ppm
    }

    fn clamp_freq(&self, freq_ppm: f64) -> f64 {
        if freq_ppm > self.max_freq_ppm {
            self.max_freq_ppm
        } else if freq_ppm < -self.max_freq_ppm {
            -self.max_freq_ppm
        } else {
            freq_ppm
        }
    }

    fn check_offset(&self, offset: f64) -> bool {
        if !offset.is_finite() || offset.abs() >= i32::MAX as f64 {
            error!(offset, "Adjustment of clock is invalid");
            return false;
        }
        true
    }

    fn drive_frequency(&mut self, freq_ppm: f64) -> f64 {
        match self.driver.set_frequency(freq_ppm) {
            Ok(applied) => applied,
            Err(e) => {
                error!(error = %e, "Could not set clock frequency");
                self.current_freq_ppm
            }
        }
    }

    fn push_change(&mut self, raw: NtpTimestamp, dfreq: f64, doffset: f64, kind: ClockChangeKind) {
        let (cooked, _) = self.cook_time(raw);
        self.events.push_back(ClockEvent::Change(ClockChange {
            raw,
            cooked,
            dfreq,
            doffset,
            kind,
        }));
    }

    pub fn set_absolute_frequency(&mut self, afreq_ppm: f64) {
        let afreq_ppm = self.clamp_freq(afreq_ppm);
        let raw = self.read_raw_time();

        let applied = self.drive_frequency(afreq_ppm);
        let dfreq = (applied - self.current_freq_ppm) / (1.0e6 - self.current_freq_ppm);
        self.current_freq_ppm = applied;

        debug!(freq_ppm = applied, "Set absolute frequency");
        self.push_change(raw, dfreq, 0.0, ClockChangeKind::Adjust);
    }

    /// Change the frequency by a relative amount. Positive `dfreq` means the
    /// clock was found to be running fast.
    pub fn accumulate_delta_frequency(&mut self, dfreq: f64) {
        let raw = self.read_raw_time();
        let old_freq_ppm = self.current_freq_ppm;

        let target = self.clamp_freq(old_freq_ppm + dfreq * (1.0e6 - old_freq_ppm));
        self.current_freq_ppm = self.drive_frequency(target);

        let dfreq = (self.current_freq_ppm - old_freq_ppm) / (1.0e6 - old_freq_ppm);
        self.push_change(raw, dfreq, 0.0, ClockChangeKind::Adjust);
    }

    /// Slew out `offset` seconds at the given correction rate.
    pub fn accumulate_offset(&mut self, offset: f64, corr_rate: f64) {
        if !self.check_offset(offset) {
            return;
        }

        let raw = self.read_raw_time();
        if let Err(e) = self.driver.accrue_offset(offset, corr_rate) {
            error!(error = %e, "Could not slew clock");
            return;
        }
        self.push_change(raw, 0.0, offset, ClockChangeKind::Adjust);
    }

    /// Step the clock back by `offset` seconds. Returns whether the step was
    /// applied.
    pub fn apply_step_offset(&mut self, offset: f64) -> bool {
        if !self.check_offset(offset) {
            return false;
        }

        if let Err(e) = self.driver.apply_step_offset(offset) {
            error!(error = %e, "Could not step clock");
            return false;
        }

        let raw = self.read_raw_time();
        self.push_change(raw, 0.0, offset, ClockChangeKind::Step);
        true
    }

    pub fn accumulate_frequency_and_offset(&mut self, dfreq: f64, doffset: f64, corr_rate: f64) {
        let raw = self.read_raw_time();

        if !self.check_offset(doffset) {
            return;
        }

        let old_freq_ppm = self.current_freq_ppm;
        let target = self.clamp_freq(old_freq_ppm + dfreq * (1.0e6 - old_freq_ppm));
        self.current_freq_ppm = self.drive_frequency(target);
        let dfreq = (self.current_freq_ppm - old_freq_ppm) / (1.0e6 - old_freq_ppm);

        if let Err(e) = self.driver.accrue_offset(doffset, corr_rate) {
            error!(error = %e, "Could not slew clock");
        }

        self.push_change(raw, dfreq, doffset, ClockChangeKind::Adjust);
    }

    /// Record a step of the clock made by someone else.
    pub fn notify_external_time_step(
        &mut self,
        raw: NtpTimestamp,
        cooked: NtpTimestamp,
        offset: f64,
        dispersion: f64,
    ) {
        warn!(offset, "Clock was stepped externally");
        self.events.push_back(ClockEvent::Change(ClockChange {
            raw,
            cooked,
            dfreq: 0.0,
            doffset: offset,
            kind: ClockChangeKind::UnknownStep,
        }));
        self.events.push_back(ClockEvent::Dispersion(dispersion));
    }

    /// Record an inserted (`leap == 1`) or deleted leap second applied to
    /// the clock.
    pub fn notify_leap(&mut self, leap: i32) {
        let raw = self.read_raw_time();
        self.push_change(raw, 0.0, -(leap as f64), ClockChangeKind::Step);
    }

    pub fn can_system_leap(&self) -> bool {
        self.driver.can_system_leap()
    }

    pub fn set_system_leap(&mut self, leap: i32, tai_offset: i32) {
        if let Err(e) = self.driver.set_leap(leap, tai_offset) {
            error!(error = %e, "Could not set leap second status of clock");
        }
    }

    pub fn set_sync_status(&mut self, synchronised: bool, est_error: f64, max_error: f64) {
        self.driver
            .set_sync_status(synchronised, est_error, max_error)
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn pop_event(&mut self) -> Option<ClockEvent> {
        self.events.pop_front()
    }
}
