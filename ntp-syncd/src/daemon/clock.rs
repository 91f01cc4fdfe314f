use std::cell::Cell;
use std::time::Duration;

use clock_steering::{unix::UnixClock, Clock, LeapIndicator, TimeOffset};
use ntp_sync::{ClockDriver, NtpTimestamp};
use tracing::{error, warn};

use super::exitcode;

/// Largest frequency adjustment the kernel accepts, in ppm.
const MAX_KERNEL_FREQ: f64 = 500.0;

/// Shortest time an offset is slewed over, in seconds.
const MIN_SLEW_DURATION: f64 = 1.0;

/// Kernel reports the clock as unsynchronised once the maximum error reaches
/// this value.
const UNSYNC_MAX_ERROR: Duration = Duration::from_secs(16);

#[allow(clippy::useless_conversion)]
pub(crate) fn convert_clock_timestamp(ts: clock_steering::Timestamp) -> NtpTimestamp {
    NtpTimestamp::from_unix(i64::from(ts.seconds), ts.nanos)
}

/// Split a number of seconds into the whole seconds below it and the
/// nanoseconds above those.
fn time_offset(seconds: f64) -> TimeOffset {
    let mut whole = seconds.floor();
    let mut nanos = ((seconds - whole) * 1e9).round();
    if nanos >= 1e9 {
        whole += 1.0;
        nanos -= 1e9;
    }

    TimeOffset {
        seconds: whole as _,
        nanos: nanos as u32,
    }
}

/// Drives the system clock. Offsets are slewed out by running the clock at a
/// temporarily adjusted frequency, which is ended again at
/// [`ClockDriver::maintenance_deadline`].
#[derive(Debug)]
pub struct SystemClockDriver {
    clock: UnixClock,
    /// Frequency correction requested by the reference, positive slows
    base_freq: Cell<f64>,
    /// Offset still to be slewed out when the current slew started
    offset_register: Cell<f64>,
    /// Fractional slowing of the clock for the current slew
    slew_freq: Cell<f64>,
    slew_start: Cell<NtpTimestamp>,
    slew_end: Cell<Option<NtpTimestamp>>,
    correction_rate: Cell<f64>,
}

impl SystemClockDriver {
    pub fn new(clock: UnixClock) -> Result<Self, <UnixClock as Clock>::Error> {
        clock.disable_kernel_ntp_algorithm()?;
        let base_freq = -clock.get_frequency()?;
        let now = convert_clock_timestamp(clock.now()?);

        Ok(SystemClockDriver {
            clock,
            base_freq: Cell::new(base_freq),
            offset_register: Cell::new(0.0),
            slew_freq: Cell::new(0.0),
            slew_start: Cell::new(now),
            slew_end: Cell::new(None),
            correction_rate: Cell::new(1.0),
        })
    }

    /// Offset that remains to be corrected at `time`.
    fn remaining_offset(&self, time: NtpTimestamp) -> f64 {
        let elapsed = time.seconds_since(self.slew_start.get()).max(0.0);
        match self.slew_end.get() {
            Some(end) if time < end => self.offset_register.get() - self.slew_freq.get() * elapsed,
            Some(_) => 0.0,
            None => self.offset_register.get(),
        }
    }

    /// Account for the slewing done so far and start a new slew for what
    /// remains.
    fn update_slew(&self) -> Result<(), <UnixClock as Clock>::Error> {
        let now = self.now();
        let register = self.remaining_offset(now);
        let base = self.base_freq.get();

        let wanted = if register == 0.0 {
            0.0
        } else {
            let duration = (self.correction_rate.get() / register.abs()).max(MIN_SLEW_DURATION);
            register / duration
        };
        let total = (base + wanted * 1e6).clamp(-MAX_KERNEL_FREQ, MAX_KERNEL_FREQ);
        let slew = (total - base) * 1e-6;

        self.clock.set_frequency(-total)?;

        self.offset_register.set(register);
        self.slew_freq.set(slew);
        self.slew_start.set(now);
        self.slew_end.set(if slew != 0.0 && register != 0.0 {
            Some(now.add_seconds(register / slew))
        } else {
            None
        });

        Ok(())
    }
}

impl ClockDriver for SystemClockDriver {
    type Error = <UnixClock as Clock>::Error;

    fn now(&self) -> NtpTimestamp {
        match self.clock.now() {
            Ok(time) => convert_clock_timestamp(time),
            Err(e) => {
                error!(error = ?e, "There was an error retrieving the current time");
                std::process::exit(exitcode::NOPERM);
            }
        }
    }

    fn read_frequency(&self) -> Result<f64, Self::Error> {
        Ok(self.base_freq.get())
    }

    fn set_frequency(&self, freq_ppm: f64) -> Result<f64, Self::Error> {
        let freq_ppm = freq_ppm.clamp(-MAX_KERNEL_FREQ, MAX_KERNEL_FREQ);
        self.base_freq.set(freq_ppm);
        self.update_slew()?;
        Ok(freq_ppm)
    }

    fn accrue_offset(&self, offset: f64, correction_rate: f64) -> Result<(), Self::Error> {
        let now = self.now();
        self.offset_register.set(self.remaining_offset(now) + offset);
        self.slew_start.set(now);
        self.slew_end.set(None);
        self.correction_rate.set(correction_rate);
        self.update_slew()
    }

    fn apply_step_offset(&self, offset: f64) -> Result<(), Self::Error> {
        self.clock.step_clock(time_offset(-offset))?;

        // the raw timescale moved along with the clock
        self.slew_start.set(self.slew_start.get().add_seconds(-offset));
        self.slew_end
            .set(self.slew_end.get().map(|end| end.add_seconds(-offset)));
        Ok(())
    }

    fn offset_convert(&self, raw: NtpTimestamp) -> (f64, f64) {
        (-self.remaining_offset(raw), 0.0)
    }

    fn can_system_leap(&self) -> bool {
        true
    }

    fn set_leap(&self, leap: i32, tai_offset: i32) -> Result<(), Self::Error> {
        let indicator = match leap.signum() {
            1 => LeapIndicator::Leap61,
            -1 => LeapIndicator::Leap59,
            _ => LeapIndicator::NoWarning,
        };
        self.clock.set_leap_seconds(indicator)?;

        if tai_offset != 0 {
            self.clock.set_tai(tai_offset)?;
        }
        Ok(())
    }

    fn set_sync_status(&self, synchronised: bool, est_error: f64, max_error: f64) {
        let (est_error, max_error) = if synchronised {
            (
                Duration::from_secs_f64(est_error.clamp(0.0, 16.0)),
                Duration::from_secs_f64(max_error.clamp(0.0, 16.0)),
            )
        } else {
            (UNSYNC_MAX_ERROR, UNSYNC_MAX_ERROR)
        };

        if let Err(e) = self.clock.error_estimate_update(est_error, max_error) {
            warn!(error = ?e, "Could not update the error estimate of the system clock");
        }
    }

    fn maintenance_deadline(&self) -> Option<NtpTimestamp> {
        self.slew_end.get()
    }

    fn maintain(&self) {
        if let Err(e) = self.update_slew() {
            error!(error = ?e, "Could not adjust the frequency of the system clock");
        }
    }
}
