#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok((header, body, _)) = tlscript_core::handshake::fragment::parse_dtls_handshake_header(data) {
        assert_eq!(body.len(), header.fragment_length as usize);
    }
});
