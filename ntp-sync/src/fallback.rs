use tracing::debug;

use crate::{
    config::FallbackDriftConfig,
    scheduler::{Scheduler, TimeoutId, TimerEvent},
    NtpTimestamp,
};

#[derive(Debug, Copy, Clone, Default, PartialEq)]
struct FallbackDrift {
    freq: f64,
    /// Length of history averaged so far
    secs: f64,
}

/// Long term averages of the clock frequency, used to choose the frequency
/// of the clock during a long loss of synchronisation. Bucket `i` averages
/// over roughly `2^i` seconds.
#[derive(Debug)]
pub struct FallbackDrifts {
    min: i32,
    max: i32,
    drifts: Vec<FallbackDrift>,
    /// Bucket that is active or scheduled next
    next: Option<i32>,
    timeout: Option<TimeoutId>,
}

impl FallbackDrifts {
    pub fn new(config: &FallbackDriftConfig) -> Self {
        let min = config.min.clamp(0, 30);
        let max = config.max.clamp(min, 30);

        FallbackDrifts {
            min,
            max,
            drifts: vec![FallbackDrift::default(); (max - min + 1) as usize],
            next: None,
            timeout: None,
        }
    }

    fn drift(&self, i: i32) -> &FallbackDrift {
        &self.drifts[(i - self.min) as usize]
    }

    /// Averaged frequency of a bucket, if it has enough history
    pub fn frequency(&self, i: i32) -> Option<f64> {
        if i < self.min || i > self.max {
            return None;
        }
        let drift = self.drift(i);
        (drift.secs >= (1u64 << i) as f64).then_some(drift.freq)
    }

    /// Bucket currently in use while unsynchronised
    pub fn active(&self) -> Option<i32> {
        self.next
    }

    /// Feed a new frequency estimate obtained while synchronised.
    pub fn update(
        &mut self,
        freq_ppm: f64,
        update_interval: f64,
        last_update_interval: f64,
        timers: &mut impl Scheduler,
    ) {
        if let Some(next) = self.next.take() {
            // forget drifts that were used while unsynchronised
            for i in self.min..next {
                self.drifts[(i - self.min) as usize].secs = 0.0;
            }
        }

        if let Some(timeout) = self.timeout.take() {
            timers.remove_timeout(timeout);
        }

        if update_interval < 1.0 || update_interval > last_update_interval * 4.0 {
            return;
        }

        for (offset, drift) in self.drifts.iter_mut().enumerate() {
            let i = self.min + offset as i32;
            let secs = (1u64 << i) as f64;

            if drift.secs < secs {
                // average over twice the bucket length before switching
                // to an exponential moving average
                drift.freq = (drift.freq * drift.secs + update_interval * 0.5 * freq_ppm)
                    / (update_interval * 0.5 + drift.secs);
                drift.secs += update_interval * 0.5;
            } else {
                drift.freq += (1.0 - (-update_interval / secs).exp()) * (freq_ppm - drift.freq);
            }

            debug!(bucket = i, freq = drift.freq, secs = drift.secs, "Fallback drift updated");
        }
    }

    /// Choose the frequency for an outage that started at `last_update`.
    /// Returns a frequency the clock should switch to now, and arms a timer
    /// for the next longer bucket.
    pub fn schedule(
        &mut self,
        now: NtpTimestamp,
        last_update: NtpTimestamp,
        timers: &mut impl Scheduler,
    ) -> Option<f64> {
        if self.timeout.is_some() {
            return None;
        }

        let unsynchronised = now.seconds_since(last_update);

        let mut current = None;
        let mut upcoming = None;
        for i in self.min..=self.max {
            let secs = (1u64 << i) as f64;
            if self.drift(i).secs < secs {
                continue;
            }
            if unsynchronised < secs && self.next.map_or(true, |next| i > next) {
                upcoming = Some((i, secs));
                break;
            }
            current = Some(i);
        }

        let mut frequency = None;
        if let Some(current) = current {
            if self.next.map_or(true, |next| current > next) {
                frequency = Some(self.drift(current).freq);
                self.next = Some(current);
                debug!(bucket = current, "Fallback drift set");
            }
        }

        if let Some((i, secs)) = upcoming {
            self.next = Some(i);
            self.timeout = Some(timers.add_timeout_by_delay(
                now,
                secs - unsynchronised,
                TimerEvent::FallbackDrift,
            ));
            debug!(bucket = i, "Fallback drift scheduled");
        }

        frequency
    }

    /// The scheduled switch is due. Returns the frequency to use from now on.
    pub fn timeout(&mut self) -> Option<f64> {
        self.timeout = None;
        let next = self.next?;
        let freq = self.drift(next).freq;
        debug!(bucket = next, freq, "Fallback drift active");
        Some(freq)
    }
}
