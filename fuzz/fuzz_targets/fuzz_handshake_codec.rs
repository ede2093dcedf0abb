#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let _ = latch_tls::handshake::codec::parse_handshake_header(data);
    if data.len() >= 4 {
        let body = &data[4..];
        let _ = latch_tls::handshake::codec::decode_client_hello(body, false);
        let _ = latch_tls::handshake::codec::decode_client_hello(body, true);
        let _ = latch_tls::handshake::codec::decode_server_hello(body);
        let _ = latch_tls::handshake::codec::decode_certificate(body);
        let _ = latch_tls::handshake::codec::decode_new_session_ticket(body);
        let _ = latch_tls::handshake::codec12::decode_certificate12(body);
        let _ = latch_tls::handshake::codec12::decode_certificate_request12(body);
    }
});
