//! Daemon around the `ntp-sync` engine: configuration, logging, the system
//! clock driver, sample sockets and the observation socket.

mod daemon;

pub use daemon::main as daemon_main;
pub use daemon::{config, observer, tracing};
