use std::{
    fmt::Display,
    io::ErrorKind,
    net::IpAddr,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    str::FromStr,
};

use ntp_sync::{ReferenceConfig, ReferenceId, ReferenceMode, SelectOptions, SelectionConfig};
use serde::{
    de::{self, Unexpected},
    Deserialize, Deserializer,
};
use tokio::{fs::read_to_string, io};
use tracing::{info, warn};

use super::tracing::LogLevel;

const USAGE_MSG: &str = "\
usage: ntp-syncd [-c PATH] [-l LOG_LEVEL] [-q | -Q]
       ntp-syncd -h
       ntp-syncd -v";

const DESCRIPTOR: &str = "ntp-syncd - select time sources and steer the system clock";

const HELP_MSG: &str = "Options:
  -c, --config=PATH             change the config .toml file
  -l, --log-level=LOG_LEVEL     change the log level
  -q, --once                    set the clock once and exit
  -Q, --print-once              print the offset once and exit without changing the clock
  -h, --help                    display this help text
  -v, --version                 display version information";

pub fn long_help_message() -> String {
    format!("{DESCRIPTOR}\n\n{USAGE_MSG}\n\n{HELP_MSG}")
}

const DEFAULT_CONFIG_PATH: &str = "/etc/ntp-syncd/ntp-syncd.toml";

#[derive(Debug, Default)]
pub(crate) struct SyncDaemonOptions {
    /// Path of the configuration file
    pub config: Option<PathBuf>,
    /// Level for messages to display in logs
    pub log_level: Option<LogLevel>,
    /// Mode the reference starts in when not running normally
    pub mode: Option<ReferenceMode>,
    help: bool,
    version: bool,
    pub action: SyncDaemonAction,
}

pub enum CliArg {
    Flag(String),
    Argument(String, String),
    Rest(Vec<String>),
}

impl CliArg {
    pub fn normalize_arguments<I>(
        takes_argument: &[&str],
        takes_argument_short: &[char],
        iter: I,
    ) -> Result<Vec<Self>, String>
    where
        I: IntoIterator<Item = String>,
    {
        // the first argument is the program name
        let mut arg_iter = iter.into_iter().skip(1);
        let mut processed = vec![];
        let mut rest = vec![];

        while let Some(arg) = arg_iter.next() {
            match arg.as_str() {
                "--" => {
                    rest.extend(arg_iter);
                    break;
                }
                long_arg if long_arg.starts_with("--") => {
                    // --config=/path/to/config.toml
                    let invalid = Err(format!("invalid option: '{long_arg}'"));

                    if let Some((key, value)) = long_arg.split_once('=') {
                        if takes_argument.contains(&key) {
                            processed.push(CliArg::Argument(key.to_string(), value.to_string()))
                        } else {
                            invalid?
                        }
                    } else if takes_argument.contains(&long_arg) {
                        if let Some(next) = arg_iter.next() {
                            processed.push(CliArg::Argument(long_arg.to_string(), next))
                        } else {
                            Err(format!("'{}' expects an argument", &long_arg))?;
                        }
                    } else {
                        processed.push(CliArg::Flag(arg));
                    }
                }
                short_arg if short_arg.starts_with('-') => {
                    // split combined shorthand options
                    for (n, char) in short_arg.trim_start_matches('-').chars().enumerate() {
                        let flag = format!("-{char}");
                        if takes_argument_short.contains(&char) {
                            let rest = short_arg[(n + 2)..].trim().to_string();
                            // assignment syntax is not accepted for shorthand arguments
                            if rest.starts_with('=') {
                                Err("invalid option '='")?;
                            }
                            if !rest.is_empty() {
                                processed.push(CliArg::Argument(flag, rest));
                            } else if let Some(next) = arg_iter.next() {
                                processed.push(CliArg::Argument(flag, next));
                            } else {
                                Err(format!("'-{}' expects an argument", char))?;
                            }
                            break;
                        } else {
                            processed.push(CliArg::Flag(flag));
                        }
                    }
                }
                _argument => rest.push(arg),
            }
        }

        if !rest.is_empty() {
            processed.push(CliArg::Rest(rest));
        }

        Ok(processed)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub enum SyncDaemonAction {
    #[default]
    Help,
    Version,
    Run,
}

impl SyncDaemonOptions {
    const TAKES_ARGUMENT: &'static [&'static str] = &["--config", "--log-level"];
    const TAKES_ARGUMENT_SHORT: &'static [char] = &['c', 'l'];

    /// parse an iterator over command line arguments
    pub fn try_parse_from<I, T>(iter: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str> + Clone,
    {
        let mut options = SyncDaemonOptions::default();
        let arg_iter = CliArg::normalize_arguments(
            Self::TAKES_ARGUMENT,
            Self::TAKES_ARGUMENT_SHORT,
            iter.into_iter().map(|x| x.as_ref().to_string()),
        )?;

        for arg in arg_iter {
            match arg {
                CliArg::Flag(flag) => match flag.as_str() {
                    "-h" | "--help" => {
                        options.help = true;
                    }
                    "-v" | "--version" => {
                        options.version = true;
                    }
                    "-q" | "--once" => options.set_mode(ReferenceMode::UpdateOnce)?,
                    "-Q" | "--print-once" => options.set_mode(ReferenceMode::PrintOnce)?,
                    option => {
                        Err(format!("invalid option provided: {option}"))?;
                    }
                },
                CliArg::Argument(option, value) => match option.as_str() {
                    "-c" | "--config" => {
                        options.config = Some(PathBuf::from(value));
                    }
                    "-l" | "--log-level" => match LogLevel::from_str(&value) {
                        Ok(level) => options.log_level = Some(level),
                        Err(_) => return Err("invalid log level".into()),
                    },
                    option => {
                        Err(format!("invalid option provided: {option}"))?;
                    }
                },
                CliArg::Rest(_rest) => { /* do nothing, drop remaining arguments */ }
            }
        }

        options.resolve_action();

        Ok(options)
    }

    fn set_mode(&mut self, mode: ReferenceMode) -> Result<(), String> {
        match self.mode {
            Some(current) if current != mode => Err("-q and -Q cannot be combined".into()),
            _ => {
                self.mode = Some(mode);
                Ok(())
            }
        }
    }

    /// from the arguments resolve which action should be performed
    fn resolve_action(&mut self) {
        if self.help {
            self.action = SyncDaemonAction::Help;
        } else if self.version {
            self.action = SyncDaemonAction::Version;
        } else {
            self.action = SyncDaemonAction::Run;
        }
    }
}

fn deserialize_ref_id<'de, D>(deserializer: D) -> Result<Option<ReferenceId>, D::Error>
where
    D: Deserializer<'de>,
{
    let name: Option<String> = Deserialize::deserialize(deserializer)?;
    let Some(name) = name else {
        return Ok(None);
    };

    if name.is_empty() || name.len() > 4 || !name.is_ascii() {
        return Err(de::Error::invalid_value(
            Unexpected::Str(&name),
            &"one to four ascii characters",
        ));
    }

    let mut bytes = [0u8; 4];
    bytes[..name.len()].copy_from_slice(name.as_bytes());
    Ok(Some(ReferenceId::from_bytes(bytes)))
}

fn deserialize_poll_interval<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let v: f64 = Deserialize::deserialize(deserializer)?;
    if !v.is_finite() || v < 1.0 {
        return Err(de::Error::invalid_value(
            Unexpected::Float(v),
            &"a number of seconds of at least 1",
        ));
    }
    Ok(v)
}

/// A source whose measurements are delivered by another process on a unix
/// datagram socket.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SourceConfig {
    /// Socket the measurements arrive on
    pub path: PathBuf,
    /// Address of the server measured, for network sources
    #[serde(default)]
    pub address: Option<IpAddr>,
    /// Reference id of a reference clock
    #[serde(default, deserialize_with = "deserialize_ref_id")]
    pub ref_id: Option<ReferenceId>,
    /// Expected number of seconds between measurements
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "deserialize_poll_interval"
    )]
    pub poll_interval: f64,
    #[serde(default)]
    pub prefer: bool,
    #[serde(default)]
    pub noselect: bool,
    #[serde(default = "default_source_permissions")]
    pub permissions: u32,
}

impl SourceConfig {
    pub fn reference_id(&self) -> ReferenceId {
        match (self.ref_id, self.address) {
            (Some(ref_id), _) => ref_id,
            (None, Some(address)) => ReferenceId::from_ip(address),
            (None, None) => ReferenceId::from_bytes(*b"SOCK"),
        }
    }

    pub fn select_options(&self) -> SelectOptions {
        SelectOptions {
            noselect: self.noselect,
            prefer: self.prefer,
        }
    }
}

fn default_poll_interval() -> f64 {
    16.0
}

const fn default_source_permissions() -> u32 {
    0o600
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub log_level: Option<LogLevel>,
    #[serde(default = "default_ansi_colors")]
    pub ansi_colors: bool,
    #[serde(default)]
    pub observation_path: Option<PathBuf>,
    #[serde(default = "default_observation_permissions")]
    pub observation_permissions: u32,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: Default::default(),
            ansi_colors: default_ansi_colors(),
            observation_path: Default::default(),
            observation_permissions: default_observation_permissions(),
        }
    }
}

const fn default_ansi_colors() -> bool {
    true
}

const fn default_observation_permissions() -> u32 {
    0o666
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// File holding the frequency of the clock across restarts
    #[serde(default)]
    pub drift_file: Option<PathBuf>,
    /// IERS/NIST `leap-seconds.list` announcing leap seconds
    #[serde(default)]
    pub leap_seconds_file: Option<PathBuf>,
    /// File every reference update is logged to
    #[serde(default)]
    pub tracking_log: Option<PathBuf>,
    #[serde(rename = "source", default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub synchronization: SelectionConfig,
    #[serde(default)]
    pub reference: ReferenceConfig,
    #[serde(default)]
    pub clock: ntp_sync::ClockConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    async fn from_file(file: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let meta = std::fs::metadata(&file)?;
        let perm = meta.permissions();

        if perm.mode() as libc::mode_t & libc::S_IWOTH != 0 {
            warn!("Unrestricted config file permissions: Others can write.");
        }

        let contents = read_to_string(file).await?;
        Ok(toml::de::from_str(&contents)?)
    }

    async fn from_first_file(file: Option<impl AsRef<Path>>) -> Result<Config, ConfigError> {
        // if an explicit file is given, always use that one
        if let Some(f) = file {
            let path: &Path = f.as_ref();
            info!(?path, "using config file");
            return Config::from_file(f).await;
        }

        // for the global file we also ignore it when there are permission errors
        let global_path = Path::new(DEFAULT_CONFIG_PATH);
        if global_path.exists() {
            info!("using config file at default location `{:?}`", global_path);
            match Config::from_file(global_path).await {
                Err(ConfigError::Io(e)) if e.kind() == ErrorKind::PermissionDenied => {
                    info!("permission denied on global config file! using default config ...");
                }
                other => {
                    return other;
                }
            }
        }

        Ok(Config::default())
    }

    pub async fn from_args(file: Option<impl AsRef<Path>>) -> Result<Config, ConfigError> {
        let mut config = Config::from_first_file(file.as_ref()).await?;
        config.merge_file_paths();
        Ok(config)
    }

    /// The file paths at the top level take precedence over the ones in the
    /// reference section.
    fn merge_file_paths(&mut self) {
        if let Some(path) = self.drift_file.take() {
            if self.reference.drift_file.is_some() {
                info!("overriding reference drift-file with top level setting");
            }
            self.reference.drift_file = Some(path);
        }

        if let Some(path) = self.tracking_log.take() {
            if self.reference.tracking_log.is_some() {
                info!("overriding reference tracking-log with top level setting");
            }
            self.reference.tracking_log = Some(path);
        }
    }

    /// Check that the config is reasonable. Returns false when the daemon
    /// will not be able to synchronise with the configured sources.
    pub fn check(&self) -> bool {
        let mut ok = true;

        let selectable = self.sources.iter().filter(|source| !source.noselect).count();
        if self.sources.is_empty() {
            info!("No sources configured. Daemon will not change system time.");
        } else if selectable < self.synchronization.min_sources {
            warn!("Fewer selectable sources configured than are required to agree on the current time. Daemon will not change system time.");
            ok = false;
        }

        let mut paths: Vec<&Path> = self.sources.iter().map(|source| source.path.as_path()).collect();
        paths.sort();
        if paths.windows(2).any(|pair| pair[0] == pair[1]) {
            warn!("Multiple sources share a socket path.");
            ok = false;
        }

        if let Some(fallback) = self.reference.fallback_drift {
            if fallback.min > fallback.max {
                warn!("Fallback drift minimum exceeds its maximum, only the minimum is used.");
            }
        }

        ok
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Toml(toml::de::Error),
}

impl std::error::Error for ConfigError {}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error while reading config: {e}"),
            Self::Toml(e) => write!(f, "config toml parsing error: {e}"),
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        Self::Toml(value)
    }
}

#[cfg(test)]
mod tests {
    use ntp_sync::{LeapMode, UpdateLimit};

    use super::*;

    #[test]
    fn test_config() {
        let config: Config =
            toml::from_str("[[source]]\npath = \"/run/ntp-syncd/gps.sock\"\nref-id = \"GPS\"")
                .unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(
            config.sources[0].path,
            PathBuf::from("/run/ntp-syncd/gps.sock")
        );
        assert_eq!(
            config.sources[0].reference_id(),
            ReferenceId::from_bytes(*b"GPS\0")
        );
        assert_eq!(config.sources[0].poll_interval, 16.0);
        assert!(config.observability.log_level.is_none());

        let config: Config = toml::from_str(
            r#"
            drift-file = "/var/lib/ntp-syncd/drift"
            leap-seconds-file = "/usr/share/zoneinfo/leap-seconds.list"

            [[source]]
            path = "/run/ntp-syncd/a.sock"
            address = "192.0.2.1"
            prefer = true

            [[source]]
            path = "/run/ntp-syncd/b.sock"
            noselect = true
            poll-interval = 64

            [synchronization]
            min-sources = 2

            [reference]
            max-update-skew = 100.0
            leap-mode = "slew"
            make-step = { threshold = 0.1, limit = "inf" }
            max-change = { offset = 1000, delay = 1, ignore = 2 }
            fallback-drift = { min = 16, max = 19 }

            [observability]
            log-level = "info"
            observation-path = "/foo/bar/observe"
            observation-permissions = 0o567
            "#,
        )
        .unwrap();

        assert_eq!(config.observability.log_level, Some(LogLevel::Info));
        assert_eq!(
            config.observability.observation_path,
            Some(PathBuf::from("/foo/bar/observe"))
        );
        assert_eq!(config.observability.observation_permissions, 0o567);

        assert_eq!(
            config.sources[0].reference_id(),
            ReferenceId::from_ip("192.0.2.1".parse().unwrap())
        );
        assert!(config.sources[0].select_options().prefer);
        assert!(config.sources[1].select_options().noselect);
        assert_eq!(config.sources[1].poll_interval, 64.0);

        assert_eq!(config.synchronization.min_sources, 2);
        assert_eq!(config.reference.max_update_skew, 100.0);
        assert_eq!(config.reference.leap_mode, LeapMode::Slew);
        assert_eq!(config.reference.make_step.limit, UpdateLimit::Unlimited);
        assert_eq!(config.reference.make_step.threshold, 0.1);

        let max_change = config.reference.max_change.unwrap();
        assert_eq!(max_change.offset, 1000.0);
        assert_eq!(max_change.delay, 1);
        assert_eq!(max_change.ignore, UpdateLimit::Count(2));

        let fallback = config.reference.fallback_drift.unwrap();
        assert_eq!((fallback.min, fallback.max), (16, 19));

        assert!(!config.check());
    }

    #[test]
    fn top_level_paths_override_reference() {
        let mut config: Config = toml::from_str(
            r#"
            drift-file = "/var/lib/ntp-syncd/drift"
            tracking-log = "/var/log/ntp-syncd/tracking.log"

            [reference]
            drift-file = "/tmp/drift"
            "#,
        )
        .unwrap();
        config.merge_file_paths();

        assert_eq!(
            config.reference.drift_file,
            Some(PathBuf::from("/var/lib/ntp-syncd/drift"))
        );
        assert_eq!(
            config.reference.tracking_log,
            Some(PathBuf::from("/var/log/ntp-syncd/tracking.log"))
        );
    }

    #[test]
    fn cli_no_arguments() {
        let arguments: [String; 0] = [];
        let parsed_empty = SyncDaemonOptions::try_parse_from(arguments).unwrap();

        assert!(parsed_empty.config.is_none());
        assert!(parsed_empty.log_level.is_none());
        assert!(parsed_empty.mode.is_none());
        assert_eq!(parsed_empty.action, SyncDaemonAction::Run);
    }

    #[test]
    fn cli_external_config() {
        let arguments = &["/usr/bin/ntp-syncd", "--config", "other.toml"];
        let parsed = SyncDaemonOptions::try_parse_from(arguments).unwrap();

        assert_eq!(parsed.config, Some("other.toml".into()));
        assert!(parsed.log_level.is_none());
        assert_eq!(parsed.action, SyncDaemonAction::Run);

        let arguments = &["/usr/bin/ntp-syncd", "-c", "other.toml"];
        let parsed = SyncDaemonOptions::try_parse_from(arguments).unwrap();

        assert_eq!(parsed.config, Some("other.toml".into()));
        assert_eq!(parsed.action, SyncDaemonAction::Run);

        let arguments = &["/usr/bin/ntp-syncd", "--config=other.toml"];
        let parsed = SyncDaemonOptions::try_parse_from(arguments).unwrap();

        assert_eq!(parsed.config, Some("other.toml".into()));
    }

    #[test]
    fn cli_log_level() {
        let arguments = &["/usr/bin/ntp-syncd", "--log-level", "debug"];
        let parsed = SyncDaemonOptions::try_parse_from(arguments).unwrap();

        assert!(parsed.config.is_none());
        assert_eq!(parsed.log_level.unwrap(), LogLevel::Debug);

        let arguments = &["/usr/bin/ntp-syncd", "-ldebug"];
        let parsed = SyncDaemonOptions::try_parse_from(arguments).unwrap();

        assert_eq!(parsed.log_level.unwrap(), LogLevel::Debug);

        let arguments = &["/usr/bin/ntp-syncd", "-l", "loud"];
        assert!(SyncDaemonOptions::try_parse_from(arguments).is_err());
    }

    #[test]
    fn cli_run_once() {
        let arguments = &["/usr/bin/ntp-syncd", "-q"];
        let parsed = SyncDaemonOptions::try_parse_from(arguments).unwrap();
        assert_eq!(parsed.mode, Some(ReferenceMode::UpdateOnce));

        let arguments = &["/usr/bin/ntp-syncd", "-Q", "-c", "other.toml"];
        let parsed = SyncDaemonOptions::try_parse_from(arguments).unwrap();
        assert_eq!(parsed.mode, Some(ReferenceMode::PrintOnce));
        assert_eq!(parsed.config, Some("other.toml".into()));

        let arguments = &["/usr/bin/ntp-syncd", "-qQ"];
        assert!(SyncDaemonOptions::try_parse_from(arguments).is_err());
    }

    #[test]
    fn cli_help_wins() {
        let arguments = &["/usr/bin/ntp-syncd", "-v", "-h"];
        let parsed = SyncDaemonOptions::try_parse_from(arguments).unwrap();
        assert_eq!(parsed.action, SyncDaemonAction::Help);

        let arguments = &["/usr/bin/ntp-syncd", "--version"];
        let parsed = SyncDaemonOptions::try_parse_from(arguments).unwrap();
        assert_eq!(parsed.action, SyncDaemonAction::Version);

        let arguments = &["/usr/bin/ntp-syncd", "--frobnicate"];
        assert!(SyncDaemonOptions::try_parse_from(arguments).is_err());
    }

    #[test]
    fn invalid_ref_id() {
        let config: Result<Config, _> =
            toml::from_str("[[source]]\npath = \"/run/a.sock\"\nref-id = \"TOOLONG\"");
        assert!(config.is_err());
    }

    #[test]
    fn invalid_poll_interval() {
        let config: Result<Config, _> =
            toml::from_str("[[source]]\npath = \"/run/a.sock\"\npoll-interval = 0.5");
        assert!(config.is_err());
    }

    #[test]
    fn duplicate_socket_paths() {
        let config: Config = toml::from_str(
            "[[source]]\npath = \"/run/a.sock\"\n[[source]]\npath = \"/run/a.sock\"",
        )
        .unwrap();
        assert!(!config.check());
    }

    #[test]
    fn deny_unknown_fields() {
        let config: Result<Config, _> = toml::from_str(
            r#"
            [reference]
            unknown-field = 42
            "#,
        );

        let error = config.unwrap_err();
        assert!(error.to_string().contains("unknown field"));
    }

    #[test]
    fn allow_no_sources() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.sources.is_empty());
        assert!(config.check());
    }
}
