use std::collections::VecDeque;

use ntp_sync::{
    regression::{find_best_regression, find_median, t_coef, MAX_POINTS, MIN_SAMPLES_FOR_REGRESS},
    NtpTimestamp, Sample, SelectionData, SourceStatistics, TrackingData,
};
use tracing::debug;

/// Skew below which an estimate is not trusted to be any better.
const MIN_SKEW: f64 = 1e-12;

/// Skew reported for a source nothing is known about yet.
const MAX_SKEW: f64 = 1.0;

#[derive(Debug, Clone, Copy)]
struct StatSample {
    time: NtpTimestamp,
    offset: f64,
    peer_delay: f64,
    peer_dispersion: f64,
}

impl StatSample {
    fn distance(&self) -> f64 {
        self.peer_delay / 2.0 + self.peer_dispersion
    }
}

/// Line fitted through the samples, anchored at the newest one.
#[derive(Debug, Clone, Copy)]
struct Estimate {
    ref_time: NtpTimestamp,
    offset: f64,
    offset_sd: f64,
    variance: f64,
    frequency: f64,
    skew: f64,
}

/// Regression over the recent samples of a source, dropping older samples
/// when they no longer fit a straight line.
#[derive(Debug, Default)]
pub struct SourceStats {
    samples: VecDeque<StatSample>,
    estimate: Option<Estimate>,
    root_delay: f64,
    root_dispersion: f64,
    stratum: u8,
}

impl SourceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn refit(&mut self) {
        self.estimate = None;

        let Some(last) = self.samples.back().copied() else {
            return;
        };
        if self.samples.len() < MIN_SAMPLES_FOR_REGRESS {
            return;
        }

        let x: Vec<f64> = self
            .samples
            .iter()
            .map(|sample| sample.time.seconds_since(last.time))
            .collect();
        let y: Vec<f64> = self.samples.iter().map(|sample| sample.offset).collect();

        // points are weighted by how much worse their distance is than the
        // median distance
        let mut distances: Vec<f64> = self.samples.iter().map(StatSample::distance).collect();
        let median = find_median(&mut distances);
        let w: Vec<f64> = self
            .samples
            .iter()
            .map(|sample| {
                if median > 0.0 {
                    (sample.distance() / median).max(1.0).powi(2)
                } else {
                    1.0
                }
            })
            .collect();

        let best = match find_best_regression(&x, &y, &w, 0, MIN_SAMPLES_FOR_REGRESS) {
            Ok(best) => best,
            Err(e) => {
                debug!(error = %e, "Could not fit source samples");
                return;
            }
        };

        if best.new_start > 0 {
            debug!(dropped = best.new_start, "Dropping samples that no longer fit");
            self.samples.drain(..best.new_start);
        }

        let line = best.line;
        self.estimate = Some(Estimate {
            ref_time: last.time,
            offset: line.b0,
            offset_sd: line.s2.sqrt(),
            variance: line.s2,
            frequency: line.b1,
            skew: (line.sb1 * t_coef(best.dof)).max(MIN_SKEW),
        });
    }
}

impl SourceStatistics for SourceStats {
    fn selection_data(&self, now: NtpTimestamp) -> SelectionData {
        let (Some(estimate), Some(first), Some(last)) =
            (self.estimate, self.samples.front(), self.samples.back())
        else {
            return SelectionData {
                stratum: self.stratum,
                ..Default::default()
            };
        };

        let elapsed = now.seconds_since(estimate.ref_time);
        let offset = estimate.offset + estimate.frequency * elapsed;
        let root_distance = self.root_delay / 2.0
            + self.root_dispersion
            + last.distance()
            + elapsed.abs() * estimate.skew;
        let width = estimate.offset_sd + root_distance;

        SelectionData {
            stratum: self.stratum,
            lo_limit: offset - width,
            hi_limit: offset + width,
            root_distance,
            variance: estimate.variance,
            first_sample_ago: now.seconds_since(first.time),
            last_sample_ago: now.seconds_since(last.time),
            select_ok: true,
        }
    }

    fn tracking_data(&self) -> TrackingData {
        match self.estimate {
            Some(estimate) => TrackingData {
                ref_time: estimate.ref_time,
                offset: estimate.offset,
                offset_sd: estimate.offset_sd,
                frequency: estimate.frequency,
                skew: estimate.skew,
                root_delay: self.root_delay,
                root_dispersion: self.root_dispersion,
            },
            None => TrackingData {
                ref_time: self.samples.back().map(|s| s.time).unwrap_or_default(),
                skew: MAX_SKEW,
                root_delay: self.root_delay,
                root_dispersion: self.root_dispersion,
                ..Default::default()
            },
        }
    }

    fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn accumulate_sample(&mut self, sample: &Sample) {
        if self.samples.len() == MAX_POINTS {
            self.samples.pop_front();
        }
        self.samples.push_back(StatSample {
            time: sample.time,
            offset: sample.offset,
            peer_delay: sample.peer_delay,
            peer_dispersion: sample.peer_dispersion,
        });
        self.root_delay = sample.root_delay;
        self.root_dispersion = sample.root_dispersion;
        self.stratum = sample.stratum;

        self.refit();
    }

    fn reset(&mut self) {
        self.samples.clear();
        self.estimate = None;
    }

    fn slew_samples(&mut self, when: NtpTimestamp, dfreq: f64, doffset: f64) {
        for sample in &mut self.samples {
            let delta = when.seconds_since(sample.time) * dfreq - doffset;
            sample.time = sample.time.add_seconds(delta);
            sample.offset += delta;
        }
        self.refit();
    }

    fn add_dispersion(&mut self, dispersion: f64) {
        self.root_dispersion += dispersion;
    }
}

#[cfg(test)]
mod tests {
    use ntp_sync::NtpLeap;

    use super::*;

    fn sample(time: NtpTimestamp, offset: f64) -> Sample {
        Sample {
            time,
            offset,
            peer_delay: 2e-3,
            peer_dispersion: 1e-4,
            root_delay: 1e-2,
            root_dispersion: 1e-3,
            stratum: 1,
            leap: NtpLeap::Normal,
        }
    }

    #[test]
    fn needs_three_samples() {
        let mut stats = SourceStats::new();
        let start = NtpTimestamp::from_unix(1_700_000_000, 0);

        stats.accumulate_sample(&sample(start, 0.1));
        stats.accumulate_sample(&sample(start.add_seconds(16.0), 0.1));
        assert!(!stats.selection_data(start.add_seconds(16.0)).select_ok);
        assert_eq!(stats.tracking_data().skew, MAX_SKEW);

        stats.accumulate_sample(&sample(start.add_seconds(32.0), 0.1));
        assert!(stats.selection_data(start.add_seconds(32.0)).select_ok);
    }

    #[test]
    fn follows_drifting_offset() {
        let mut stats = SourceStats::new();
        let start = NtpTimestamp::from_unix(1_700_000_000, 0);

        // 10 ppm drift with alternating noise
        for i in 0..16 {
            let t = 16.0 * i as f64;
            let noise = if i % 2 == 0 { 1e-6 } else { -1e-6 };
            stats.accumulate_sample(&sample(start.add_seconds(t), 0.01 + 1e-5 * t + noise));
        }

        let tracking = stats.tracking_data();
        assert!((tracking.frequency - 1e-5).abs() < 1e-7);
        assert!((tracking.offset - (0.01 + 1e-5 * 240.0)).abs() < 1e-5);
        assert!(tracking.skew < 1e-6);
        assert_eq!(tracking.ref_time, start.add_seconds(240.0));

        let later = start.add_seconds(256.0);
        let data = stats.selection_data(later);
        let expected = 0.01 + 1e-5 * 256.0;
        assert!(data.lo_limit < expected && expected < data.hi_limit);
        assert!((data.last_sample_ago - 16.0).abs() < 1e-6);
        assert!((data.first_sample_ago - 256.0).abs() < 1e-6);
    }

    #[test]
    fn slewing_moves_offsets() {
        let mut stats = SourceStats::new();
        let start = NtpTimestamp::from_unix(1_700_000_000, 0);
        for i in 0..4 {
            stats.accumulate_sample(&sample(start.add_seconds(16.0 * i as f64), 0.5));
        }

        stats.slew_samples(start.add_seconds(48.0), 0.0, 0.5);
        assert!(stats.tracking_data().offset.abs() < 1e-9);

        stats.reset();
        assert!(stats.is_empty());
        assert!(!stats.selection_data(start).select_ok);
    }

    #[test]
    fn dispersion_accumulates() {
        let mut stats = SourceStats::new();
        let start = NtpTimestamp::from_unix(1_700_000_000, 0);
        stats.accumulate_sample(&sample(start, 0.0));
        stats.add_dispersion(0.5);
        assert!((stats.tracking_data().root_dispersion - 0.501).abs() < 1e-12);
    }
}
