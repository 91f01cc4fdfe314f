#![allow(dead_code)]

use std::cell::{Cell, RefCell};

use ntp_sync::{
    regression::weighted_regression, ClockDriver, NtpTimestamp, Sample, SelectionData,
    SourceStatistics, TrackingData,
};

/// A clock that is `error` seconds ahead of true time. Slews take effect
/// immediately.
#[derive(Debug)]
pub struct FakeClock {
    pub now: Cell<NtpTimestamp>,
    pub error: Cell<f64>,
    pub freq: Cell<f64>,
    pub steps: RefCell<Vec<f64>>,
    pub slews: RefCell<Vec<(f64, f64)>>,
}

impl FakeClock {
    pub fn at_unix(seconds: i64, error: f64) -> Self {
        FakeClock {
            now: Cell::new(NtpTimestamp::from_unix(seconds, 0)),
            error: Cell::new(error),
            freq: Cell::new(0.0),
            steps: RefCell::default(),
            slews: RefCell::default(),
        }
    }

    pub fn advance(&self, seconds: f64) {
        self.now.set(self.now.get().add_seconds(seconds));
    }
}

impl ClockDriver for FakeClock {
    type Error = std::io::Error;

    fn now(&self) -> NtpTimestamp {
        self.now.get()
    }

    fn read_frequency(&self) -> Result<f64, Self::Error> {
        Ok(self.freq.get())
    }

    fn set_frequency(&self, freq_ppm: f64) -> Result<f64, Self::Error> {
        self.freq.set(freq_ppm);
        Ok(freq_ppm)
    }

    fn accrue_offset(&self, offset: f64, correction_rate: f64) -> Result<(), Self::Error> {
        self.error.set(self.error.get() - offset);
        self.slews.borrow_mut().push((offset, correction_rate));
        Ok(())
    }

    fn apply_step_offset(&self, offset: f64) -> Result<(), Self::Error> {
        self.error.set(self.error.get() - offset);
        self.advance(-offset);
        self.steps.borrow_mut().push(offset);
        Ok(())
    }
}

/// Straight line fit through the offsets of the last samples of a source.
#[derive(Debug, Default)]
pub struct RegressionStats {
    samples: Vec<(NtpTimestamp, f64)>,
    root_delay: f64,
    root_dispersion: f64,
    stratum: u8,
}

impl RegressionStats {
    const MAX_SAMPLES: usize = 16;

    pub fn new() -> Self {
        Self::default()
    }

    fn fit(&self) -> Option<(f64, f64, f64, f64)> {
        let (first, _) = *self.samples.first()?;
        let x: Vec<f64> = self
            .samples
            .iter()
            .map(|(time, _)| time.seconds_since(first))
            .collect();
        let y: Vec<f64> = self.samples.iter().map(|(_, offset)| *offset).collect();
        let w = vec![1.0; x.len()];

        if x.len() < 3 {
            return None;
        }

        let line = weighted_regression(&x, &y, &w);
        let last = *x.last()?;
        Some((
            line.b0 + line.b1 * last,
            line.s2.sqrt(),
            line.b1,
            line.sb1.max(1e-9),
        ))
    }

    fn root_distance(&self) -> f64 {
        self.root_delay / 2.0 + self.root_dispersion
    }
}

impl SourceStatistics for RegressionStats {
    fn selection_data(&self, now: NtpTimestamp) -> SelectionData {
        let Some((offset, offset_sd, _, _)) = self.fit() else {
            return SelectionData::default();
        };
        let (first, _) = self.samples[0];
        let (last, _) = self.samples[self.samples.len() - 1];
        let root_distance = self.root_distance();
        let width = offset_sd.max(1e-4) + root_distance;

        SelectionData {
            stratum: self.stratum,
            lo_limit: offset - width,
            hi_limit: offset + width,
            root_distance,
            variance: offset_sd * offset_sd,
            first_sample_ago: now.seconds_since(first),
            last_sample_ago: now.seconds_since(last),
            select_ok: true,
        }
    }

    fn tracking_data(&self) -> TrackingData {
        let (offset, offset_sd, frequency, skew) = self.fit().unwrap_or((0.0, 0.0, 0.0, 1.0));
        TrackingData {
            ref_time: self.samples.last().map(|(time, _)| *time).unwrap_or_default(),
            offset,
            offset_sd,
            frequency,
            skew,
            root_delay: self.root_delay,
            root_dispersion: self.root_dispersion,
        }
    }

    fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn accumulate_sample(&mut self, sample: &Sample) {
        if self.samples.len() == Self::MAX_SAMPLES {
            self.samples.remove(0);
        }
        self.samples.push((sample.time, sample.offset));
        self.root_delay = sample.root_delay;
        self.root_dispersion = sample.root_dispersion;
        self.stratum = sample.stratum;
    }

    fn reset(&mut self) {
        self.samples.clear();
    }

    fn slew_samples(&mut self, when: NtpTimestamp, dfreq: f64, doffset: f64) {
        for (time, offset) in &mut self.samples {
            let delta = when.seconds_since(*time) * dfreq - doffset;
            *time = time.add_seconds(delta);
            *offset += delta;
        }
    }

    fn add_dispersion(&mut self, dispersion: f64) {
        self.root_dispersion += dispersion;
    }
}
