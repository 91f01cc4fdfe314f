use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
};

use chrono::DateTime;

use crate::{NtpLeap, NtpTimestamp};

const HEADER: &str = "   Date (UTC) Time     IP Address   St   Freq ppm   Skew ppm     Offset L Co  Offset sd Rem. corr. Root delay Root disp. Max. error";

/// One line of the tracking log, written on every reference update.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingEntry {
    pub time: NtpTimestamp,
    /// Address or reference id of the selected source
    pub ident: String,
    pub stratum: u8,
    pub freq_ppm: f64,
    pub skew_ppm: f64,
    pub offset: f64,
    pub leap: NtpLeap,
    pub combined_sources: usize,
    pub offset_sd: f64,
    pub uncorrected_offset: f64,
    pub root_delay: f64,
    pub root_dispersion: f64,
    pub max_error: f64,
}

pub fn format_entry(entry: &TrackingEntry) -> String {
    let time = DateTime::from_timestamp(entry.time.unix_seconds(), 0)
        .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "????-??-?? ??:??:??".to_owned());

    format!(
        "{} {:<15} {:2} {:10.3} {:10.3} {:10.3e} {} {:2} {:10.3e} {:10.3e} {:10.3e} {:10.3e} {:10.3e}",
        time,
        entry.ident,
        entry.stratum,
        entry.freq_ppm,
        entry.skew_ppm,
        entry.offset,
        entry.leap.as_char(),
        entry.combined_sources,
        entry.offset_sd,
        entry.uncorrected_offset,
        entry.root_delay,
        entry.root_dispersion,
        entry.max_error,
    )
}

/// Append-only log of the reference updates.
#[derive(Debug)]
pub struct TrackingLog {
    file: File,
}

impl TrackingLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() == 0 {
            writeln!(file, "{HEADER}")?;
        }
        Ok(TrackingLog { file })
    }

    pub fn write(&mut self, entry: &TrackingEntry) -> std::io::Result<()> {
        writeln!(self.file, "{}", format_entry(entry))
    }
}
