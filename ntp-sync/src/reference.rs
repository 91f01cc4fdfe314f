use std::net::IpAddr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    clock::{ClockChange, ClockChangeKind, ClockDriver, LocalClock},
    config::{LeapMode, LocalReferenceConfig, MaxChangeConfig, ReferenceConfig, UpdateLimit},
    drift::{read_drift_file, write_drift_file, DriftEstimate},
    fallback::FallbackDrifts,
    leap::{is_leap_second_day, next_midnight, LeapDatabase, LEAP_SECOND_CLOSE},
    scheduler::{Scheduler, TimeoutId, TimerEvent},
    selection::ReferenceUpdate,
    tracking_log::{TrackingEntry, TrackingLog},
    NtpLeap, NtpTimestamp, ReferenceId,
};

/// Smallest skew we ever believe in
const MIN_SKEW: f64 = 1.0e-12;

/// Maximum age of the reference time of the local reference
const LOCAL_REF_UPDATE_INTERVAL: f64 = 64.0;

/// Stratum advertised when unsynchronised
pub const MAX_STRATUM: u8 = 16;

/// Seconds the leap second takes to settle before the leap state is cleared
const LEAP_SETTLE_TIME: f64 = 2.0;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceMode {
    Normal,
    /// Correct the initial offset once, by a step when above a threshold
    InitStepSlew,
    /// Step the clock once and finish
    UpdateOnce,
    /// Only report the offset once and finish
    PrintOnce,
    /// Ignore all updates
    Ignore,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReferenceUpdateResult {
    Ignore,
    Slew,
    Step,
    /// The current mode of operation has finished
    ModeEnd { success: bool },
}

/// What we tell clients about our time.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceParams {
    pub synchronised: bool,
    pub leap: NtpLeap,
    pub stratum: u8,
    pub ref_id: ReferenceId,
    pub ref_time: NtpTimestamp,
    pub root_delay: f64,
    pub root_dispersion: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceReport {
    pub mode: ReferenceMode,
    pub synchronised: bool,
    pub stratum: u8,
    pub ref_id: ReferenceId,
    pub ref_ip: Option<IpAddr>,
    pub ref_time: NtpTimestamp,
    pub leap_status: NtpLeap,
    pub leap_sec: i32,
    pub tai_offset: i32,
    pub frequency_ppm: f64,
    pub residual_freq_ppm: f64,
    pub skew_ppm: f64,
    pub root_delay: f64,
    pub root_dispersion: f64,
    pub offset_sd: f64,
    pub last_offset: f64,
    pub rms_offset: f64,
    pub last_update_interval: f64,
}

enum OffsetCheck {
    Ok,
    Ignore,
    EndMode,
}

/// Move a timestamp taken before a clock change to the new timescale.
fn adjust_timestamp(old: NtpTimestamp, when: NtpTimestamp, dfreq: f64, doffset: f64) -> NtpTimestamp {
    let elapsed = when.seconds_since(old);
    old.add_seconds(elapsed * dfreq - doffset)
}

/// Our belief of what time it is and how wrong the local clock is. Turns
/// reference updates into adjustments of the [`LocalClock`].
pub struct ReferenceSteerer<C: ClockDriver> {
    clock: LocalClock<C>,
    config: ReferenceConfig,
    mode: ReferenceMode,

    synchronised: bool,
    stratum: u8,
    ref_id: ReferenceId,
    ref_ip: Option<IpAddr>,
    ref_time: Option<NtpTimestamp>,
    skew: f64,
    residual_freq: f64,
    root_delay: f64,
    root_dispersion: f64,
    offset_sd: f64,
    last_offset: f64,
    avg2_offset: f64,
    avg2_moving: bool,

    last_update: Option<NtpTimestamp>,
    last_update_interval: f64,

    make_step_limit: UpdateLimit,
    make_step_threshold: f64,
    max_update_skew: f64,
    max_change: Option<MaxChangeConfig>,

    leap_mode: LeapMode,
    leap_database: Option<Box<dyn LeapDatabase>>,
    leap_status: NtpLeap,
    leap_sec: i32,
    tai_offset: i32,
    leap_when: i64,
    leap_in_progress: bool,
    leap_timeout: Option<TimeoutId>,

    drift_file_age: f64,
    fallback: Option<FallbackDrifts>,
    tracking_log: Option<TrackingLog>,

    local: Option<LocalReferenceConfig>,
    local_activate_ok: bool,
    local_distance_since: Option<NtpTimestamp>,
    local_ref_time: Option<NtpTimestamp>,
    unsynchronised_since: NtpTimestamp,
}

impl<C: ClockDriver> ReferenceSteerer<C> {
    pub fn new(
        mut clock: LocalClock<C>,
        config: ReferenceConfig,
        leap_database: Option<Box<dyn LeapDatabase>>,
    ) -> Self {
        let mut skew = 1.0;

        if let Some(path) = &config.drift_file {
            match read_drift_file(path) {
                Ok(estimate) => {
                    info!(
                        frequency = estimate.frequency_ppm,
                        skew = estimate.skew_ppm,
                        path = %path.display(),
                        "Frequency read from drift file"
                    );
                    skew = (estimate.skew_ppm * 1e-6).max(MIN_SKEW);
                    clock.set_absolute_frequency(estimate.frequency_ppm);
                }
                Err(e) => warn!(error = %e, path = %path.display(), "Could not read drift file"),
            }
        }

        let leap_mode = match config.leap_mode {
            LeapMode::System if !clock.can_system_leap() => {
                info!("Clock cannot apply leap seconds, stepping instead");
                LeapMode::Step
            }
            mode => mode,
        };

        let tracking_log = config.tracking_log.as_ref().and_then(|path| {
            TrackingLog::open(path)
                .map_err(|e| warn!(error = %e, path = %path.display(), "Could not open tracking log"))
                .ok()
        });

        let now = clock.read_cooked_time().0;

        let mut steerer = ReferenceSteerer {
            mode: ReferenceMode::Normal,
            synchronised: false,
            stratum: 0,
            ref_id: ReferenceId::NONE,
            ref_ip: None,
            ref_time: None,
            skew,
            residual_freq: 0.0,
            root_delay: 1.0,
            root_dispersion: 1.0,
            offset_sd: 0.0,
            last_offset: 0.0,
            avg2_offset: 0.0,
            avg2_moving: false,
            last_update: None,
            last_update_interval: 0.0,
            make_step_limit: config.make_step.limit,
            make_step_threshold: config.make_step.threshold,
            max_update_skew: config.max_update_skew * 1e-6,
            max_change: config.max_change,
            leap_mode,
            leap_database,
            leap_status: NtpLeap::Unsynchronised,
            leap_sec: 0,
            tai_offset: 0,
            leap_when: 0,
            leap_in_progress: false,
            leap_timeout: None,
            drift_file_age: 0.0,
            fallback: config.fallback_drift.as_ref().map(FallbackDrifts::new),
            tracking_log,
            local: config.local,
            local_activate_ok: false,
            local_distance_since: None,
            local_ref_time: None,
            unsynchronised_since: now,
            clock,
            config,
        };

        steerer.clock.set_sync_status(false, 0.0, 0.0);
        steerer.write_log(now, "0.0.0.0".into(), 0.0, 0, 0.0, 0.0, 0.0);

        steerer
    }

    pub fn clock(&self) -> &LocalClock<C> {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut LocalClock<C> {
        &mut self.clock
    }

    pub fn mode(&self) -> ReferenceMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ReferenceMode) {
        self.mode = mode;
    }

    pub fn is_synchronised(&self) -> bool {
        self.synchronised
    }

    pub fn leap_sec(&self) -> i32 {
        self.leap_sec
    }

    pub fn tai_offset(&self) -> i32 {
        self.tai_offset
    }

    pub fn skew(&self) -> f64 {
        self.skew
    }

    pub fn leap_timeout(&self) -> Option<TimeoutId> {
        self.leap_timeout
    }

    fn now(&self) -> (NtpTimestamp, f64) {
        let raw = self.clock.read_raw_time();
        let (correction, _) = self.clock.get_offset_correction(raw);
        (raw.add_seconds(correction), correction)
    }

    fn root_dispersion_at(&self, now: NtpTimestamp) -> f64 {
        let Some(ref_time) = self.ref_time else {
            return 1.0;
        };

        self.root_dispersion
            + now.seconds_since(ref_time).abs()
                * (self.skew + self.residual_freq.abs() + self.clock.max_clock_error())
    }

    fn check_offset(&mut self, offset: f64) -> OffsetCheck {
        let Some(max_change) = self.max_change.as_mut() else {
            return OffsetCheck::Ok;
        };

        if max_change.delay > 0 {
            max_change.delay -= 1;
            return OffsetCheck::Ok;
        }

        if offset.abs() <= max_change.offset {
            return OffsetCheck::Ok;
        }

        if max_change.ignore.is_exhausted() {
            warn!(
                offset = -offset,
                max = max_change.offset,
                "Adjustment exceeds the allowed maximum, giving up"
            );
            OffsetCheck::EndMode
        } else {
            warn!(
                offset = -offset,
                max = max_change.offset,
                "Adjustment exceeds the allowed maximum, ignored"
            );
            max_change.ignore.consume();
            OffsetCheck::Ignore
        }
    }

    fn step_limit_reached(&mut self, offset: f64, uncorrected_offset: f64) -> bool {
        if !self.make_step_limit.consume() {
            return false;
        }
        (offset - uncorrected_offset).abs() > self.make_step_threshold
    }

    fn end_mode(&mut self, success: bool) -> ReferenceUpdateResult {
        self.mode = ReferenceMode::Ignore;
        ReferenceUpdateResult::ModeEnd { success }
    }

    fn special_mode_sync(&mut self, valid: bool, offset: f64) -> ReferenceUpdateResult {
        match self.mode {
            ReferenceMode::InitStepSlew => {
                if !valid {
                    warn!("No suitable source for initial correction");
                    return self.end_mode(false);
                }

                let threshold = self
                    .config
                    .init_step_threshold
                    .unwrap_or(self.config.make_step.threshold);
                let step = offset.abs() >= threshold;
                info!(
                    offset = offset.abs(),
                    direction = if offset >= 0.0 { "fast" } else { "slow" },
                    action = if step { "step" } else { "slew" },
                    "Initial offset of the clock"
                );

                if step {
                    self.clock.apply_step_offset(offset);
                } else {
                    self.clock.accumulate_offset(offset, 0.0);
                }
                self.end_mode(true)
            }
            ReferenceMode::UpdateOnce | ReferenceMode::PrintOnce => {
                if !valid {
                    warn!("No suitable source for synchronisation");
                    return self.end_mode(false);
                }

                let step = self.mode == ReferenceMode::UpdateOnce;
                info!(
                    offset = -offset,
                    action = if step { "step" } else { "ignored" },
                    "Clock wrong"
                );
                if step {
                    self.clock.apply_step_offset(offset);
                }
                self.end_mode(true)
            }
            ReferenceMode::Ignore => ReferenceUpdateResult::Ignore,
            ReferenceMode::Normal => unreachable!("normal mode has no special handling"),
        }
    }

    /// Give up on a special mode that never got a usable source.
    pub fn abort_special_mode(&mut self) -> Option<ReferenceUpdateResult> {
        match self.mode {
            ReferenceMode::Normal | ReferenceMode::Ignore => None,
            _ => Some(self.special_mode_sync(false, 0.0)),
        }
    }

    /// Steer the clock with a new estimate from the selected sources.
    #[instrument(level = "debug", skip(self, timers))]
    pub fn set_reference(
        &mut self,
        update: &ReferenceUpdate,
        timers: &mut impl Scheduler,
    ) -> ReferenceUpdateResult {
        if self.mode != ReferenceMode::Normal {
            return self.special_mode_sync(true, update.offset);
        }

        if !update.offset.is_finite()
            || !update.frequency.is_finite()
            || !update.skew.is_finite()
            || !update.offset_sd.is_finite()
        {
            warn!("Ignoring reference update with invalid values");
            return ReferenceUpdateResult::Ignore;
        }

        let manual = update.leap == NtpLeap::Unsynchronised;
        let skew = update.skew.max(MIN_SKEW);

        let (now, uncorrected_offset) = self.now();

        let elapsed = now.seconds_since(update.ref_time);
        let offset = update.offset + elapsed * update.frequency;

        match self.check_offset(offset) {
            OffsetCheck::Ok => {}
            OffsetCheck::Ignore => return ReferenceUpdateResult::Ignore,
            OffsetCheck::EndMode => {
                self.mark_unsynchronised(now);
                return self.end_mode(false);
            }
        }

        let update_interval = match self.last_update {
            Some(last_update) => now.seconds_since(last_update).max(0.0),
            None => 0.0,
        };
        self.last_update = Some(now);

        // An offset equal to the current standard deviation is corrected in
        // the update interval multiplied by the correction time ratio.
        let correction_rate =
            self.config.correction_time_ratio * 0.5 * update.offset_sd * update_interval;

        let (accumulate_offset, step_offset) =
            if self.step_limit_reached(offset, uncorrected_offset) {
                (uncorrected_offset, offset - uncorrected_offset)
            } else {
                (offset, 0.0)
            };

        let orig_root_distance = self.root_delay / 2.0 + self.root_dispersion_at(now);

        let gain = if manual {
            1.0
        } else if skew > self.max_update_skew {
            warn!(skew = skew * 1e6, "Skew too large to track");
            0.0
        } else {
            let old_variance = 3.0 * self.skew * self.skew;
            (old_variance / (old_variance + skew * skew)).clamp(0.0, 1.0)
        };

        let frequency = gain * update.frequency;
        let residual_freq = update.frequency - frequency;
        let extra_skew =
            (frequency * frequency * (1.0 - gain) + residual_freq * residual_freq * gain).sqrt();

        self.skew = (self.skew + gain * (skew - self.skew) + extra_skew).max(MIN_SKEW);
        self.residual_freq = residual_freq;

        self.synchronised = !manual;
        self.stratum = update.stratum.saturating_add(1);
        self.ref_id = update.ref_id;
        self.ref_ip = update.ip;
        self.root_delay = update.root_delay;
        self.root_dispersion = update.root_dispersion;
        self.offset_sd = update.offset_sd;
        self.last_offset = offset;

        debug!(
            offset,
            frequency,
            gain,
            skew = self.skew,
            correction_rate,
            "Adjusting clock"
        );

        self.clock
            .accumulate_frequency_and_offset(frequency, accumulate_offset, correction_rate);

        self.update_leap_status(update.leap, now.unix_seconds(), false, timers);

        if offset.abs() > self.config.log_change_threshold {
            warn!(offset = -offset, "System clock wrong");
        }

        if step_offset != 0.0 {
            if self.clock.apply_step_offset(step_offset) {
                warn!(offset = -step_offset, "System clock was stepped");
            } else {
                self.clock.accumulate_offset(step_offset, 0.0);
            }
        }

        // Quickly on start, then a moving average of squared offsets
        if self.avg2_moving {
            self.avg2_offset += 0.1 * (offset * offset - self.avg2_offset);
        } else {
            if self.avg2_offset > 0.0 && self.avg2_offset < offset * offset {
                self.avg2_moving = true;
            }
            self.avg2_offset = offset * offset;
        }

        let (now, _) = self.now();
        self.clock.set_sync_status(
            self.synchronised,
            update.offset_sd,
            self.root_delay / 2.0 + self.root_dispersion_at(now),
        );

        // Hide the sub-second part of the reference time
        let fuzz: f64 = rand::thread_rng().gen_range(0.0..1.0);
        self.ref_time = Some(update.ref_time.add_seconds(-fuzz));

        let local_abs_frequency = self.clock.read_absolute_frequency();
        let ident = match update.ip {
            Some(ip) => ip.to_string(),
            None => update.ref_id.to_string(),
        };
        self.write_log(
            now,
            ident,
            offset,
            update.combined_sources,
            update.offset_sd,
            uncorrected_offset,
            orig_root_distance,
        );

        if self.config.drift_file.is_some() {
            self.drift_file_age += update_interval;
            if self.drift_file_age >= self.config.drift_file_interval || self.drift_file_age < 0.0 {
                self.update_drift_file(local_abs_frequency);
                self.drift_file_age = 0.0;
            }
        }

        if self.synchronised {
            if let Some(fallback) = self.fallback.as_mut() {
                fallback.update(
                    local_abs_frequency,
                    update_interval,
                    self.last_update_interval,
                    timers,
                );
            }
            self.unsynchronised_since = now;
        }

        self.last_update_interval = update_interval;

        if step_offset != 0.0 {
            ReferenceUpdateResult::Step
        } else {
            ReferenceUpdateResult::Slew
        }
    }

    /// Set the reference from a time given by hand.
    pub fn set_manual_reference(
        &mut self,
        ref_time: NtpTimestamp,
        offset: f64,
        frequency: f64,
        skew: f64,
        timers: &mut impl Scheduler,
    ) -> ReferenceUpdateResult {
        self.set_reference(
            &ReferenceUpdate {
                stratum: 0,
                leap: NtpLeap::Unsynchronised,
                combined_sources: 1,
                ref_id: ReferenceId::MANUAL,
                ip: None,
                ref_time,
                offset,
                offset_sd: 0.0,
                frequency,
                skew,
                root_delay: 0.0,
                root_dispersion: 0.0,
            },
            timers,
        )
    }

    fn mark_unsynchronised(&mut self, now: NtpTimestamp) {
        if self.synchronised {
            self.unsynchronised_since = now;
        }
        self.ref_ip = None;
        self.stratum = 0;
        self.synchronised = false;
        self.leap_status = NtpLeap::Unsynchronised;
        self.clock.set_sync_status(false, 0.0, 0.0);
    }

    /// No source is usable anymore.
    pub fn set_unsynchronised(&mut self, timers: &mut impl Scheduler) -> ReferenceUpdateResult {
        if self.mode != ReferenceMode::Normal {
            return self.special_mode_sync(false, 0.0);
        }

        let (now, _) = self.now();

        if let (Some(fallback), Some(last_update)) = (self.fallback.as_mut(), self.last_update) {
            if let Some(freq) = fallback.schedule(now, last_update, timers) {
                self.clock.set_absolute_frequency(freq);
            }
        }

        self.update_leap_status(NtpLeap::Unsynchronised, 0, false, timers);
        self.mark_unsynchronised(now);

        self.write_log(now, "0.0.0.0".into(), 0.0, 0, 0.0, 0.0, 0.0);

        ReferenceUpdateResult::Ignore
    }

    fn update_leap_status(
        &mut self,
        mut leap: NtpLeap,
        now_unix: i64,
        reset: bool,
        timers: &mut impl Scheduler,
    ) {
        let mut leap_sec = 0;
        let mut tai_offset = 0;

        if now_unix != 0 {
            if let Some(database) = &self.leap_database {
                let (db_leap, db_tai_offset) = database.get_leap(now_unix);
                tai_offset = db_tai_offset;
                if leap == NtpLeap::Normal {
                    leap = db_leap;
                }
            }
        }

        if matches!(leap, NtpLeap::InsertSecond | NtpLeap::DeleteSecond) {
            if is_leap_second_day(now_unix) {
                leap_sec = leap.as_seconds();
            } else {
                leap = NtpLeap::Normal;
            }
        }

        let (now, _) = self.now();
        if (leap_sec != self.leap_sec || tai_offset != self.tai_offset)
            && !self.is_leap_second_close(now, 0.0)
        {
            self.leap_sec = leap_sec;
            self.tai_offset = tai_offset;

            if self.leap_mode == LeapMode::System {
                self.clock.set_system_leap(leap_sec, tai_offset);
            }
            self.set_leap_timeout(now_unix, timers);
        } else if reset {
            self.set_leap_timeout(now_unix, timers);
        }

        self.leap_status = leap;
    }

    fn set_leap_timeout(&mut self, now_unix: i64, timers: &mut impl Scheduler) {
        if let Some(timeout) = self.leap_timeout.take() {
            timers.remove_timeout(timeout);
        }
        self.leap_in_progress = false;

        if self.leap_sec == 0 {
            return;
        }

        self.leap_when = next_midnight(now_unix);

        // Inserted seconds start at midnight, deleted ones a second earlier.
        // Give the kernel half a second of room when it applies the leap.
        let mut when = self.leap_when as f64;
        if self.leap_sec < 0 {
            when -= 1.0;
        }
        if self.leap_mode == LeapMode::System {
            when -= 0.5;
        }

        debug!(leap_sec = self.leap_sec, when, "Scheduled leap second");
        self.leap_timeout = Some(timers.add_timeout(
            NtpTimestamp::from_unix_seconds(when),
            TimerEvent::LeapStart,
        ));
    }

    fn leap_start(&mut self, timers: &mut impl Scheduler) {
        self.leap_timeout = None;
        self.leap_in_progress = true;

        match self.leap_mode {
            LeapMode::System => debug!("Waiting for leap second correction by the system clock"),
            LeapMode::Slew => {
                self.clock.notify_leap(self.leap_sec);
                self.clock.accumulate_offset(self.leap_sec as f64, 0.0);
                warn!("Adjusting system clock for leap second");
            }
            LeapMode::Step => {
                self.clock.notify_leap(self.leap_sec);
                self.clock.apply_step_offset(self.leap_sec as f64);
                warn!("System clock was stepped for leap second");
            }
            LeapMode::Ignore => warn!("Ignoring leap second"),
        }

        let (now, _) = self.now();
        self.leap_timeout =
            Some(timers.add_timeout_by_delay(now, LEAP_SETTLE_TIME, TimerEvent::LeapEnd));
    }

    fn leap_end(&mut self) {
        self.leap_timeout = None;
        self.leap_in_progress = false;

        if self.tai_offset != 0 {
            self.tai_offset += self.leap_sec;
        }
        self.leap_sec = 0;

        if self.leap_mode == LeapMode::System {
            self.clock.set_system_leap(self.leap_sec, self.tai_offset);
        }

        if matches!(
            self.leap_status,
            NtpLeap::InsertSecond | NtpLeap::DeleteSecond
        ) {
            self.leap_status = NtpLeap::Normal;
        }
    }

    /// Whether `when`, or `when` corrected by `offset`, is within a few
    /// seconds of a scheduled leap second.
    pub fn is_leap_second_close(&self, when: NtpTimestamp, offset: f64) -> bool {
        if self.leap_sec == 0 {
            return false;
        }

        let close = |t: i64| t > self.leap_when - LEAP_SECOND_CLOSE && t < self.leap_when + LEAP_SECOND_CLOSE;
        close(when.unix_seconds()) || close(when.add_seconds(-offset).unix_seconds())
    }

    /// Run the timer event the steerer scheduled earlier.
    pub fn handle_timeout(
        &mut self,
        event: TimerEvent,
        timers: &mut impl Scheduler,
    ) -> ReferenceUpdateResult {
        match event {
            TimerEvent::LeapStart => {
                self.leap_start(timers);
                ReferenceUpdateResult::Ignore
            }
            TimerEvent::LeapEnd => {
                self.leap_end();
                ReferenceUpdateResult::Ignore
            }
            TimerEvent::FallbackDrift => {
                if let Some(freq) = self.fallback.as_mut().and_then(FallbackDrifts::timeout) {
                    self.clock.set_absolute_frequency(freq);
                }
                self.set_unsynchronised(timers)
            }
        }
    }

    /// Keep our timestamps on the timescale of the local clock.
    pub fn handle_clock_change(&mut self, change: &ClockChange, timers: &mut impl Scheduler) {
        if let Some(ref_time) = self.ref_time {
            self.ref_time = Some(adjust_timestamp(
                ref_time,
                change.cooked,
                change.dfreq,
                change.doffset,
            ));
        }

        match change.kind {
            ClockChangeKind::UnknownStep => self.last_update = None,
            ClockChangeKind::Adjust | ClockChangeKind::Step => {
                if let Some(last_update) = self.last_update {
                    self.last_update = Some(adjust_timestamp(
                        last_update,
                        change.cooked,
                        change.dfreq,
                        change.doffset,
                    ));
                }
            }
        }

        // A step may move us to another day
        if change.kind != ClockChangeKind::Adjust && self.leap_sec != 0 && !self.leap_in_progress {
            let (now, _) = self.now();
            self.update_leap_status(self.leap_status, now.unix_seconds(), true, timers);
        }
    }

    /// Stratum we serve as an orphan, when configured to do so.
    pub fn orphan_stratum(&self) -> Option<u8> {
        match (self.mode, &self.local) {
            (ReferenceMode::Normal, Some(local)) if local.orphan => Some(local.stratum),
            _ => None,
        }
    }

    pub fn enable_local(&mut self, local: LocalReferenceConfig) {
        self.local = Some(local);
        self.local_activate_ok = false;
        self.local_distance_since = None;
    }

    pub fn disable_local(&mut self) {
        self.local = None;
    }

    pub fn modify_max_update_skew(&mut self, skew_ppm: f64) {
        self.max_update_skew = skew_ppm * 1e-6;
        info!(skew = skew_ppm, "New max update skew");
    }

    pub fn modify_make_step(&mut self, limit: UpdateLimit, threshold: f64) {
        self.make_step_limit = limit;
        self.make_step_threshold = threshold;
    }

    fn local_reference_active(&mut self, now: NtpTimestamp, distance: f64) -> bool {
        let Some(local) = self.local else {
            return false;
        };

        if local.activate == 0.0 || (self.synchronised && distance < local.activate) {
            self.local_activate_ok = true;
        }
        if !self.local_activate_ok {
            return false;
        }

        if self.synchronised {
            if distance <= local.distance {
                self.local_distance_since = None;
                return false;
            }
            let since = *self.local_distance_since.get_or_insert(now);
            now.seconds_since(since) >= local.wait_synced
        } else {
            now.seconds_since(self.unsynchronised_since) >= local.wait_unsynced()
        }
    }

    /// The parameters of our time as served to clients.
    pub fn reference_params(&mut self, now: NtpTimestamp) -> ReferenceParams {
        let dispersion = if self.synchronised {
            self.root_dispersion_at(now)
        } else {
            0.0
        };
        let distance = self.root_delay / 2.0 + dispersion;

        let leap = if self.leap_in_progress {
            NtpLeap::Unsynchronised
        } else {
            self.leap_status
        };

        let local_active = self.local_reference_active(now, distance);

        if self.synchronised && !local_active {
            ReferenceParams {
                synchronised: true,
                leap,
                stratum: self.stratum,
                ref_id: self.ref_id,
                ref_time: self.ref_time.unwrap_or_default(),
                root_delay: self.root_delay,
                root_dispersion: dispersion,
            }
        } else if let (true, Some(local)) = (local_active, self.local) {
            let ref_time = match self.local_ref_time {
                Some(ref_time) if now.seconds_since(ref_time).abs() <= LOCAL_REF_UPDATE_INTERVAL => {
                    ref_time
                }
                _ => {
                    self.local_ref_time = Some(now);
                    now
                }
            };

            ReferenceParams {
                synchronised: true,
                leap: if self.synchronised || self.leap_in_progress {
                    leap
                } else {
                    NtpLeap::Normal
                },
                stratum: local.stratum,
                ref_id: ReferenceId::LOCAL,
                ref_time,
                root_delay: 0.0,
                root_dispersion: 0.0,
            }
        } else {
            ReferenceParams {
                synchronised: false,
                leap: NtpLeap::Unsynchronised,
                stratum: MAX_STRATUM,
                ref_id: ReferenceId::NONE,
                ref_time: NtpTimestamp::default(),
                root_delay: 0.0,
                root_dispersion: 0.0,
            }
        }
    }

    pub fn report(&self) -> ReferenceReport {
        let (now, _) = self.now();
        ReferenceReport {
            mode: self.mode,
            synchronised: self.synchronised,
            stratum: self.stratum,
            ref_id: self.ref_id,
            ref_ip: self.ref_ip,
            ref_time: self.ref_time.unwrap_or_default(),
            leap_status: self.leap_status,
            leap_sec: self.leap_sec,
            tai_offset: self.tai_offset,
            frequency_ppm: self.clock.read_absolute_frequency(),
            residual_freq_ppm: self.residual_freq * 1e6,
            skew_ppm: self.skew * 1e6,
            root_delay: self.root_delay,
            root_dispersion: self.root_dispersion_at(now),
            offset_sd: self.offset_sd,
            last_offset: self.last_offset,
            rms_offset: self.avg2_offset.sqrt(),
            last_update_interval: self.last_update_interval,
        }
    }

    fn update_drift_file(&self, frequency_ppm: f64) {
        let Some(path) = &self.config.drift_file else {
            return;
        };

        let estimate = DriftEstimate {
            frequency_ppm,
            skew_ppm: self.skew * 1e6,
        };
        if let Err(e) = write_drift_file(path, estimate) {
            warn!(error = %e, path = %path.display(), "Could not update drift file");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write_log(
        &mut self,
        now: NtpTimestamp,
        ident: String,
        offset: f64,
        combined_sources: usize,
        offset_sd: f64,
        uncorrected_offset: f64,
        max_error: f64,
    ) {
        let Some(log) = self.tracking_log.as_mut() else {
            return;
        };

        let entry = TrackingEntry {
            time: now,
            ident,
            stratum: self.stratum,
            freq_ppm: self.clock.read_absolute_frequency(),
            skew_ppm: self.skew * 1e6,
            offset,
            leap: self.leap_status,
            combined_sources,
            offset_sd,
            uncorrected_offset,
            root_delay: self.root_delay,
            root_dispersion: self.root_dispersion,
            max_error,
        };

        if let Err(e) = log.write(&entry) {
            warn!(error = %e, "Could not write tracking log");
        }
    }

    /// Persist the frequency and forget any pending leap second.
    pub fn finalise(&mut self, timers: &mut impl Scheduler) {
        self.update_leap_status(NtpLeap::Unsynchronised, 0, false, timers);
        self.update_drift_file(self.clock.read_absolute_frequency());
    }
}
