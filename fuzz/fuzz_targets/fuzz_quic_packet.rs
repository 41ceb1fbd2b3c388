#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = tlscript_core::quic::packet::parse_packet(data, 8);
    let _ = tlscript_core::quic::frame::parse_frames(data);
});
