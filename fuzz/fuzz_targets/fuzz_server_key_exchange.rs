#![no_main]
use libfuzzer_sys::fuzz_target;

use latch_tls::crypt::KeyExchangeAlg;
use latch_tls::handshake::codec12::{decode_client_key_exchange, decode_server_key_exchange};

const ALGS: &[KeyExchangeAlg] = &[
    KeyExchangeAlg::Ecdhe,
    KeyExchangeAlg::Dhe,
    KeyExchangeAlg::Rsa,
    KeyExchangeAlg::Psk,
    KeyExchangeAlg::DhePsk,
    KeyExchangeAlg::RsaPsk,
    KeyExchangeAlg::EcdhePsk,
];

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let alg = ALGS[data[0] as usize % ALGS.len()];
    let body = &data[1..];
    let _ = decode_server_key_exchange(body, alg);
    let _ = decode_client_key_exchange(body, alg);
});
