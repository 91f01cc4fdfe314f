#![forbid(unsafe_code)]

use std::process;

fn main() {
    let result = ntp_syncd::daemon_main();
    process::exit(match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ntp-syncd: {e}");
            1
        }
    });
}
