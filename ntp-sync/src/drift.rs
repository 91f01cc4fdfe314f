use std::{
    fmt,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

/// Frequency estimate persisted across restarts.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct DriftEstimate {
    /// Absolute frequency correction in ppm
    pub frequency_ppm: f64,
    /// Uncertainty of the frequency in ppm
    pub skew_ppm: f64,
}

#[derive(Debug)]
pub enum DriftFileError {
    Io(std::io::Error),
    Format,
}

impl fmt::Display for DriftFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error on drift file: {e}"),
            Self::Format => f.write_str("drift file does not contain a frequency and skew"),
        }
    }
}

impl std::error::Error for DriftFileError {}

impl From<std::io::Error> for DriftFileError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

pub fn read_drift_file(path: &Path) -> Result<DriftEstimate, DriftFileError> {
    let contents = std::fs::read_to_string(path)?;
    let mut fields = contents.split_whitespace().map(str::parse::<f64>);

    match (fields.next(), fields.next()) {
        (Some(Ok(frequency_ppm)), Some(Ok(skew_ppm)))
            if frequency_ppm.is_finite() && skew_ppm.is_finite() =>
        {
            Ok(DriftEstimate {
                frequency_ppm,
                skew_ppm,
            })
        }
        _ => Err(DriftFileError::Format),
    }
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Replace the drift file. The new contents are written to a temporary file
/// next to it, which is then renamed over the old file.
pub fn write_drift_file(path: &Path, estimate: DriftEstimate) -> Result<(), DriftFileError> {
    let temp_path = temporary_path(path);

    let result = write_temporary(&temp_path, path, estimate)
        .and_then(|()| std::fs::rename(&temp_path, path));

    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }

    Ok(result?)
}

fn write_temporary(temp_path: &Path, path: &Path, estimate: DriftEstimate) -> std::io::Result<()> {
    let mut file = File::create(temp_path)?;
    writeln!(
        file,
        "{:20.6} {:20.6}",
        estimate.frequency_ppm, estimate.skew_ppm
    )?;
    file.sync_all()?;

    // keep the permissions of the file being replaced
    if let Ok(metadata) = std::fs::metadata(path) {
        file.set_permissions(metadata.permissions())?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ntp-sync-drift-{}-{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_round_trip() {
        let dir = test_dir("round-trip");
        let path = dir.join("drift");

        let estimate = DriftEstimate {
            frequency_ppm: 12.345,
            skew_ppm: 0.0678,
        };
        write_drift_file(&path, estimate).unwrap();
        assert_eq!(read_drift_file(&path).unwrap(), estimate);

        let estimate = DriftEstimate {
            frequency_ppm: -3.25,
            skew_ppm: 1.5,
        };
        write_drift_file(&path, estimate).unwrap();
        assert_eq!(read_drift_file(&path).unwrap(), estimate);
        assert!(!temporary_path(&path).exists());

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_format() {
        let dir = test_dir("format");
        let path = dir.join("drift");

        write_drift_file(
            &path,
            DriftEstimate {
                frequency_ppm: 1.0,
                skew_ppm: 0.5,
            },
        )
        .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, format!("{:>20} {:>20}\n", "1.000000", "0.500000"));

        std::fs::write(&path, "12.5\n").unwrap();
        assert!(matches!(read_drift_file(&path), Err(DriftFileError::Format)));

        std::fs::write(&path, "abc 1.0\n").unwrap();
        assert!(matches!(read_drift_file(&path), Err(DriftFileError::Format)));

        assert!(matches!(
            read_drift_file(&dir.join("missing")),
            Err(DriftFileError::Io(_))
        ));

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_unwritable_directory() {
        let path = Path::new("/nonexistent-ntp-sync-dir/drift");
        assert!(matches!(
            write_drift_file(
                path,
                DriftEstimate {
                    frequency_ppm: 0.0,
                    skew_ppm: 0.0
                }
            ),
            Err(DriftFileError::Io(_))
        ));
    }
}
