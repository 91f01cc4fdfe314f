use std::{fmt, path::PathBuf};

use serde::{
    de::{self, Unexpected, Visitor},
    Deserialize, Deserializer,
};

/// A number of updates, or no limit at all.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpdateLimit {
    Count(u32),
    Unlimited,
}

impl UpdateLimit {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, UpdateLimit::Count(0))
    }

    /// Use up one update. Returns false when nothing was left.
    pub fn consume(&mut self) -> bool {
        match self {
            UpdateLimit::Count(0) => false,
            UpdateLimit::Count(n) => {
                *n -= 1;
                true
            }
            UpdateLimit::Unlimited => true,
        }
    }
}

// We have a custom deserializer for UpdateLimit because we
// want to deserialize it from either a number or "inf"
impl<'de> Deserialize<'de> for UpdateLimit {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct UpdateLimitVisitor;

        impl Visitor<'_> for UpdateLimitVisitor {
            type Value = UpdateLimit;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("non-negative integer or \"inf\"")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let count = u32::try_from(v).map_err(|_| {
                    de::Error::invalid_value(Unexpected::Unsigned(v), &"a 32 bit count")
                })?;
                Ok(UpdateLimit::Count(count))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if v < 0 {
                    return Err(de::Error::invalid_value(
                        Unexpected::Signed(v),
                        &"non-negative integer or \"inf\"",
                    ));
                }
                self.visit_u64(v as u64)
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if v != "inf" {
                    return Err(de::Error::invalid_value(
                        Unexpected::Str(v),
                        &"non-negative integer or \"inf\"",
                    ));
                }
                Ok(UpdateLimit::Unlimited)
            }
        }

        deserializer.deserialize_any(UpdateLimitVisitor)
    }
}

fn deserialize_positive_seconds<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let v: f64 = Deserialize::deserialize(deserializer)?;
    if v.is_nan() || v.is_infinite() || v < 0.0 {
        return Err(de::Error::invalid_value(
            Unexpected::Float(v),
            &"a positive number",
        ));
    }
    Ok(v)
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SelectionConfig {
    /// Minimum number of sources that need to agree before the clock is
    /// synchronized to them.
    #[serde(default = "default_min_sources")]
    pub min_sources: usize,

    /// Root distance added per stratum when comparing sources.
    #[serde(default = "default_stratum_weight")]
    pub stratum_weight: f64,

    /// Extra distance applied to network sources, making the daemon stick
    /// with its current source for longer.
    #[serde(default = "default_reselect_distance")]
    pub reselect_distance: f64,

    /// Sources whose distance or frequency is within this factor of the
    /// selected source are combined with it.
    #[serde(default = "default_combine_limit")]
    pub combine_limit: f64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_sources: default_min_sources(),
            stratum_weight: default_stratum_weight(),
            reselect_distance: default_reselect_distance(),
            combine_limit: default_combine_limit(),
        }
    }
}

fn default_min_sources() -> usize {
    1
}

fn default_stratum_weight() -> f64 {
    1e-3
}

fn default_reselect_distance() -> f64 {
    1e-4
}

fn default_combine_limit() -> f64 {
    3.0
}

/// What to do with the clock when a leap second occurs.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LeapMode {
    /// The kernel inserts or deletes the second
    #[default]
    System,
    /// Slew the second out over time
    Slew,
    /// Step the clock at midnight
    Step,
    /// Leave the clock alone, the error is corrected like any other offset
    Ignore,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MakeStepConfig {
    /// Offsets larger than this (in seconds) are stepped instead of slewed
    #[serde(
        default = "default_make_step_threshold",
        deserialize_with = "deserialize_positive_seconds"
    )]
    pub threshold: f64,

    /// Number of clock updates during which stepping is allowed
    #[serde(default = "default_make_step_limit")]
    pub limit: UpdateLimit,
}

impl Default for MakeStepConfig {
    fn default() -> Self {
        Self {
            threshold: default_make_step_threshold(),
            limit: default_make_step_limit(),
        }
    }
}

fn default_make_step_threshold() -> f64 {
    1.0
}

fn default_make_step_limit() -> UpdateLimit {
    UpdateLimit::Count(3)
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MaxChangeConfig {
    /// Largest acceptable offset in seconds
    #[serde(deserialize_with = "deserialize_positive_seconds")]
    pub offset: f64,

    /// Number of updates before the check becomes active
    #[serde(default)]
    pub delay: u32,

    /// Number of too large offsets to ignore before giving up
    #[serde(default = "default_max_change_ignore")]
    pub ignore: UpdateLimit,
}

fn default_max_change_ignore() -> UpdateLimit {
    UpdateLimit::Count(0)
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FallbackDriftConfig {
    /// Shortest averaging interval, as log2 seconds
    pub min: i32,
    /// Longest averaging interval, as log2 seconds
    pub max: i32,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LocalReferenceConfig {
    #[serde(default = "default_local_stratum")]
    pub stratum: u8,

    /// Use orphan mode: servers sharing the local stratum elect the one
    /// with the smallest reference id
    #[serde(default)]
    pub orphan: bool,

    /// Root distance above which the local reference takes over from a
    /// synchronized source
    #[serde(default = "default_local_distance")]
    pub distance: f64,

    /// Root distance that has to be reached at least once before the local
    /// reference is activated. Zero disables the requirement.
    #[serde(default)]
    pub activate: f64,

    /// Seconds the root distance has to exceed `distance` before activating
    #[serde(default)]
    pub wait_synced: f64,

    /// Seconds without synchronization before activating. Defaults to 300
    /// in orphan mode and 0 otherwise.
    #[serde(default)]
    pub wait_unsynced: Option<f64>,
}

impl LocalReferenceConfig {
    pub fn wait_unsynced(&self) -> f64 {
        match self.wait_unsynced {
            Some(wait) => wait,
            None if self.orphan => 300.0,
            None => 0.0,
        }
    }
}

impl Default for LocalReferenceConfig {
    fn default() -> Self {
        Self {
            stratum: default_local_stratum(),
            orphan: false,
            distance: default_local_distance(),
            activate: 0.0,
            wait_synced: 0.0,
            wait_unsynced: None,
        }
    }
}

fn default_local_stratum() -> u8 {
    10
}

fn default_local_distance() -> f64 {
    1.0
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ReferenceConfig {
    /// Skew (in ppm) above which frequency estimates are not used
    #[serde(default = "default_max_update_skew")]
    pub max_update_skew: f64,

    /// Ratio between the time taken to correct an offset by slewing and the
    /// interval between clock updates
    #[serde(default = "default_correction_time_ratio")]
    pub correction_time_ratio: f64,

    #[serde(default)]
    pub make_step: MakeStepConfig,

    #[serde(default)]
    pub max_change: Option<MaxChangeConfig>,

    #[serde(default)]
    pub leap_mode: LeapMode,

    /// Offset of the first update above which the clock is stepped instead
    /// of slewed. Enables the initial step/slew mode.
    #[serde(default)]
    pub init_step_threshold: Option<f64>,

    /// Clock changes larger than this many seconds are logged as warnings
    #[serde(default = "default_log_change_threshold")]
    pub log_change_threshold: f64,

    /// File holding the frequency and skew across restarts
    #[serde(default)]
    pub drift_file: Option<PathBuf>,

    /// Seconds of clock updates between drift file writes
    #[serde(default = "default_drift_file_interval")]
    pub drift_file_interval: f64,

    #[serde(default)]
    pub fallback_drift: Option<FallbackDriftConfig>,

    #[serde(default)]
    pub local: Option<LocalReferenceConfig>,

    /// Append a line per clock update to this file
    #[serde(default)]
    pub tracking_log: Option<PathBuf>,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            max_update_skew: default_max_update_skew(),
            correction_time_ratio: default_correction_time_ratio(),
            make_step: MakeStepConfig::default(),
            max_change: None,
            leap_mode: LeapMode::default(),
            init_step_threshold: None,
            log_change_threshold: default_log_change_threshold(),
            drift_file: None,
            drift_file_interval: default_drift_file_interval(),
            fallback_drift: None,
            local: None,
            tracking_log: None,
        }
    }
}

fn default_max_update_skew() -> f64 {
    1000.0
}

fn default_correction_time_ratio() -> f64 {
    3.0
}

fn default_log_change_threshold() -> f64 {
    1.0
}

fn default_drift_file_interval() -> f64 {
    3600.0
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ClockConfig {
    /// Assumed worst case frequency error of the local clock, in ppm
    #[serde(default = "default_max_clock_error")]
    pub max_clock_error: f64,

    /// Largest absolute frequency correction, in ppm
    #[serde(default = "default_max_drift")]
    pub max_drift: f64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            max_clock_error: default_max_clock_error(),
            max_drift: default_max_drift(),
        }
    }
}

fn default_max_clock_error() -> f64 {
    1.0
}

fn default_max_drift() -> f64 {
    500000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Helper {
        limit: UpdateLimit,
    }

    #[test]
    fn update_limit_parsing() {
        let h: Helper = toml::from_str("limit = 3").unwrap();
        assert_eq!(h.limit, UpdateLimit::Count(3));

        let h: Helper = toml::from_str("limit = \"inf\"").unwrap();
        assert_eq!(h.limit, UpdateLimit::Unlimited);

        assert!(toml::from_str::<Helper>("limit = -1").is_err());
        assert!(toml::from_str::<Helper>("limit = \"many\"").is_err());
    }

    #[test]
    fn update_limit_consume() {
        let mut limit = UpdateLimit::Count(2);
        assert!(limit.consume());
        assert!(limit.consume());
        assert!(limit.is_exhausted());
        assert!(!limit.consume());

        let mut limit = UpdateLimit::Unlimited;
        assert!(limit.consume());
        assert!(!limit.is_exhausted());
    }

    #[test]
    fn reference_config_defaults() {
        let config: ReferenceConfig = toml::from_str("").unwrap();
        assert_eq!(config, ReferenceConfig::default());
        assert_eq!(config.make_step.limit, UpdateLimit::Count(3));
        assert_eq!(config.leap_mode, LeapMode::System);
    }

    #[test]
    fn reference_config_sections() {
        let config: ReferenceConfig = toml::from_str(
            r#"
            leap-mode = "slew"
            make-step = { threshold = 0.1, limit = "inf" }
            max-change = { offset = 1000, delay = 1, ignore = 2 }
            fallback-drift = { min = 16, max = 19 }
            [local]
            stratum = 8
            orphan = true
            "#,
        )
        .unwrap();

        assert_eq!(config.leap_mode, LeapMode::Slew);
        assert_eq!(config.make_step.threshold, 0.1);
        assert_eq!(config.make_step.limit, UpdateLimit::Unlimited);
        let max_change = config.max_change.unwrap();
        assert_eq!(max_change.offset, 1000.0);
        assert_eq!(max_change.delay, 1);
        assert_eq!(max_change.ignore, UpdateLimit::Count(2));
        assert_eq!(
            config.fallback_drift,
            Some(FallbackDriftConfig { min: 16, max: 19 })
        );
        let local = config.local.unwrap();
        assert_eq!(local.stratum, 8);
        assert_eq!(local.wait_unsynced(), 300.0);
    }

    #[test]
    fn make_step_threshold_not_negative() {
        let result: Result<MakeStepConfig, _> = toml::from_str("threshold = -1.0");
        let error = result.unwrap_err();
        assert!(error.to_string().contains("expected a positive number"));
    }

    #[test]
    fn deny_unknown_fields() {
        let config: Result<SelectionConfig, _> = toml::from_str("unknown-field = 42");
        let error = config.unwrap_err();
        assert!(error.to_string().contains("unknown field"));
    }
}
