#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = tlscript_core::record::parse_record(data, false, 0);
    let _ = tlscript_core::record::parse_record(data, true, 0);
    let _ = tlscript_core::record::parse_inner_plaintext(data);
});
