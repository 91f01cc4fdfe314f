#![no_main]
use libfuzzer_sys::fuzz_target;
use ntp_sync::fuzz_find_interval;

fuzz_target!(|intervals: Vec<(f64, f64)>| {
    fuzz_find_interval(&intervals);
});
