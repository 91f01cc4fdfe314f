#![no_main]
use libfuzzer_sys::fuzz_target;
use ntp_sync::regression::fuzz_find_median;

fuzz_target!(|values: Vec<f64>| {
    fuzz_find_median(&values);
});
