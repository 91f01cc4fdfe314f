mod clock;
pub mod config;
pub mod observer;
mod sample_source;
pub mod sockets;
mod stats;
mod system;
pub mod tracing;

use std::{error::Error, path::PathBuf};

use ::tracing::info;
pub use config::Config;
use tokio::runtime::{Builder, Runtime};
use tracing_subscriber::util::SubscriberInitExt;

use config::SyncDaemonOptions;

use self::tracing::LogLevel;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn main() -> Result<i32, Box<dyn Error>> {
    let options = SyncDaemonOptions::try_parse_from(std::env::args())?;

    match options.action {
        config::SyncDaemonAction::Help => {
            println!("{}", config::long_help_message());
            Ok(0)
        }
        config::SyncDaemonAction::Version => {
            eprintln!("ntp-syncd {VERSION}");
            Ok(0)
        }
        config::SyncDaemonAction::Run => run(options),
    }
}

// initializes the logger so that logs during config parsing are reported. Then it overrides the
// log level based on the config if required.
pub(crate) fn initialize_logging_parse_config(
    runtime: &Runtime,
    initial_log_level: Option<LogLevel>,
    config_path: Option<PathBuf>,
) -> Config {
    let mut log_level = initial_log_level.unwrap_or_default();

    let config_tracing = crate::daemon::tracing::tracing_init(log_level, true);
    let config = ::tracing::subscriber::with_default(config_tracing, || {
        match runtime.block_on(Config::from_args(config_path)) {
            Ok(c) => c,
            Err(e) => {
                // print to stderr because tracing is not yet setup
                eprintln!("There was an error loading the config: {e}");
                std::process::exit(exitcode::CONFIG);
            }
        }
    });

    if let Some(config_log_level) = config.observability.log_level {
        if initial_log_level.is_none() {
            log_level = config_log_level;
        }
    }

    // set a default global subscriber from now on
    let tracing_inst = self::tracing::tracing_init(log_level, config.observability.ansi_colors);
    tracing_inst.init();

    config
}

fn run(options: SyncDaemonOptions) -> Result<i32, Box<dyn Error>> {
    // the engine is not thread safe, everything runs on this one thread
    let runtime = Builder::new_current_thread().enable_all().build()?;

    let config = initialize_logging_parse_config(&runtime, options.log_level, options.config);

    runtime.block_on(async {
        // give the user a warning that we use the command line option
        if config.observability.log_level.is_some() && options.log_level.is_some() {
            info!("Log level override from command line arguments is active");
        }

        // Warn/error if the config is unreasonable. We do this after finishing
        // tracing setup to ensure logging is fully configured.
        config.check();

        ::tracing::debug!("Configuration loaded, starting synchronization");
        Ok(system::run(config, options.mode).await?)
    })
}

pub(crate) mod exitcode {
    /// An internal software error has been detected.  This
    /// should be limited to non-operating system related
    /// errors as possible.
    pub const SOFTWARE: i32 = 70;

    /// You did not have sufficient permission to perform
    /// the operation.  This is not intended for file system
    /// problems, which should use `NOINPUT` or `CANTCREAT`,
    /// but rather for higher level permissions.
    pub const NOPERM: i32 = 77;

    /// Something was found in an unconfigured or misconfigured state.
    pub const CONFIG: i32 = 78;
}
