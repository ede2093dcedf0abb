#![no_main]
use libfuzzer_sys::fuzz_target;

use latch_tls::handshake::extensions_codec as ext;

fuzz_target!(|data: &[u8]| {
    let _ = latch_tls::handshake::codec::parse_extension_block(data);
    let _ = ext::parse_supported_versions_ch(data);
    let _ = ext::parse_supported_groups(data);
    let _ = ext::parse_signature_algorithms(data);
    let _ = ext::parse_key_share_ch(data);
    let _ = ext::parse_key_share_sh(data);
    let _ = ext::parse_pre_shared_key_ch(data);
    let _ = ext::parse_psk_key_exchange_modes(data);
    let _ = ext::parse_server_name(data);
    let _ = ext::parse_alpn(data);
    let _ = ext::parse_renegotiation_info(data);
    let _ = ext::parse_cookie(data);
});
