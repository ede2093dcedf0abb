//! Extension negotiation policy.
//!
//! Tabular accept/select rules consulted by the state machines. Pure
//! functions over parsed messages and the local configuration; wire
//! shape lives in the codecs.

use latch_types::{KeyType, TlsError};

use crate::config::{AlpnAction, TlsConfig};
use crate::crypt::{AuthAlg, NamedGroup, SignatureScheme, Tls12CipherSuiteParams};
use crate::extensions::ExtensionType;
use crate::provider::CryptoProvider;
use crate::{CipherSuite, TlsVersion};

use super::codec::ClientHello;
use super::extensions_codec::{
    parse_supported_versions_ch, PSK_DHE_KE, PSK_KE,
};

/// TLS 1.3 PSK key-exchange mode set, as negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PskModes {
    pub psk_ke: bool,
    pub psk_dhe_ke: bool,
}

impl PskModes {
    pub fn none() -> Self {
        Self {
            psk_ke: false,
            psk_dhe_ke: false,
        }
    }

    pub fn any(&self) -> bool {
        self.psk_ke || self.psk_dhe_ke
    }
}

// ---------------------------------------------------------------------------
// Version selection
// ---------------------------------------------------------------------------

/// The versions a client advertises in `supported_versions`, newest
/// first (TLS 1.3-capable configs only).
pub fn client_offered_versions(config: &TlsConfig) -> Vec<u16> {
    let mut out = Vec::new();
    if config.version_allowed(TlsVersion::Tls13) {
        out.push(TlsVersion::Tls13.wire());
    }
    if config.version_allowed(TlsVersion::Tls12) {
        out.push(TlsVersion::Tls12.wire());
    }
    out
}

/// Server-side version selection (RFC 8446 §4.2.1 plus the legacy
/// path).
///
/// With `supported_versions` present the record-layer legacy_version is
/// ignored for selection but must equal 0x0303; the server walks its
/// own preference from max to min over the client list, skipping
/// TLS 1.3 when it has no usable PSK or certificate key material.
/// Without the extension the legacy version is clamped and range
/// checked.
pub fn select_version(config: &TlsConfig, ch: &ClientHello) -> Result<TlsVersion, TlsError> {
    if let Some(sv) = ch.find_extension(ExtensionType::SUPPORTED_VERSIONS) {
        if ch.legacy_version != TlsVersion::Tls12.wire() {
            return Err(TlsError::ProtocolVersion(format!(
                "legacy_version {:#06x} with supported_versions",
                ch.legacy_version
            )));
        }
        let offered = parse_supported_versions_ch(sv)?;
        let mut skipped_tls13 = false;
        for version in [TlsVersion::Tls13, TlsVersion::Tls12] {
            if !config.version_allowed(version) || !offered.contains(&version.wire()) {
                continue;
            }
            if version == TlsVersion::Tls13 && !config.tls13_key_material_available() {
                skipped_tls13 = true;
                continue;
            }
            return Ok(version);
        }
        // A 1.3-only offer that failed purely for lack of usable key
        // material is a handshake failure, not a version mismatch.
        if skipped_tls13 {
            return Err(TlsError::HandshakeFailure(
                "TLS 1.3 offered but no usable PSK or certificate".into(),
            ));
        }
        return Err(TlsError::ProtocolVersion(
            "no mutually supported version".into(),
        ));
    }

    // Legacy negotiation.
    let mut legacy = ch.legacy_version;
    if config.max_version == TlsVersion::Dtls12 {
        if legacy != TlsVersion::Dtls12.wire() {
            return Err(TlsError::ProtocolVersion(format!(
                "unsupported dtls version {legacy:#06x}"
            )));
        }
        return Ok(TlsVersion::Dtls12);
    }
    #[cfg(feature = "tlcp")]
    if legacy == TlsVersion::Tlcp11.wire() {
        if config.version_allowed(TlsVersion::Tlcp11) {
            return Ok(TlsVersion::Tlcp11);
        }
        return Err(TlsError::ProtocolVersion("tlcp not enabled".into()));
    }
    if legacy > TlsVersion::Tls12.wire() {
        legacy = TlsVersion::Tls12.wire();
    }
    match TlsVersion::from_wire(legacy) {
        Some(v) if config.version_allowed(v) && v != TlsVersion::Tls13 => Ok(v),
        Some(TlsVersion::Tls13) if config.version_allowed(TlsVersion::Tls12) => {
            Ok(TlsVersion::Tls12)
        }
        _ => Err(TlsError::ProtocolVersion(format!(
            "client version {legacy:#06x} outside configured window"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Cipher suite selection
// ---------------------------------------------------------------------------

/// TLS 1.3 suite selection: server preference order intersected with
/// the offer.
pub fn select_tls13_cipher_suite(
    config: &TlsConfig,
    offered: &[CipherSuite],
) -> Result<CipherSuite, TlsError> {
    for suite in &config.tls13_cipher_suites {
        if offered.contains(suite) {
            return Ok(*suite);
        }
    }
    Err(TlsError::HandshakeFailure(
        "no shared TLS 1.3 cipher suite".into(),
    ))
}

fn key_type_for_auth(auth: AuthAlg) -> Option<KeyType> {
    match auth {
        AuthAlg::Rsa => Some(KeyType::Rsa),
        AuthAlg::Ecdsa => Some(KeyType::Ecdsa),
        AuthAlg::Psk => None,
        #[cfg(feature = "tlcp")]
        AuthAlg::Sm2 => Some(KeyType::Sm2),
    }
}

fn psk_source_configured(config: &TlsConfig) -> bool {
    config.psk_server_find.is_some()
        || config.psk_client_use.is_some()
        || !config.external_psks.is_empty()
}

/// ≤1.2 / TLCP suite selection: walk the server preference list,
/// keeping only suites whose key-exchange prerequisites (credential,
/// PSK source, common curve) the server can actually satisfy.
pub fn select_tls12_cipher_suite(
    config: &TlsConfig,
    version: TlsVersion,
    offered: &[CipherSuite],
    peer_groups: Option<&[NamedGroup]>,
) -> Result<Tls12CipherSuiteParams, TlsError> {
    for suite in &config.cipher_suites {
        if !offered.contains(suite) {
            continue;
        }
        let params = match Tls12CipherSuiteParams::from_suite(*suite) {
            Ok(p) => p,
            Err(_) => continue,
        };
        #[cfg(feature = "tlcp")]
        {
            let is_sm = params.auth_alg == AuthAlg::Sm2;
            if (version == TlsVersion::Tlcp11) != is_sm {
                continue;
            }
        }
        #[cfg(not(feature = "tlcp"))]
        let _ = version;
        if params.kx_alg.is_psk() && !psk_source_configured(config) {
            continue;
        }
        if let Some(key_type) = key_type_for_auth(params.auth_alg) {
            if params.kx_alg.requires_certificate() && config.credential_for(key_type).is_none() {
                continue;
            }
        }
        if params.kx_alg == crate::crypt::KeyExchangeAlg::Ecdhe
            || params.kx_alg == crate::crypt::KeyExchangeAlg::EcdhePsk
        {
            // An ECDHE suite needs a common curve.
            let groups = peer_groups.unwrap_or(&[NamedGroup::SECP256R1, NamedGroup::X25519]);
            if select_group(config, groups).is_none() {
                continue;
            }
        }
        return Ok(params);
    }
    Err(TlsError::HandshakeFailure("no shared cipher suite".into()))
}

// ---------------------------------------------------------------------------
// Groups / signature schemes
// ---------------------------------------------------------------------------

/// First group in local preference order the peer also supports.
pub fn select_group(config: &TlsConfig, peer_groups: &[NamedGroup]) -> Option<NamedGroup> {
    config
        .groups
        .iter()
        .copied()
        .find(|g| peer_groups.contains(g))
}

/// Whether a signature scheme is usable with a private key type.
pub fn scheme_matches_key(scheme: SignatureScheme, key_type: KeyType) -> bool {
    match key_type {
        KeyType::Rsa => matches!(
            scheme,
            SignatureScheme::RSA_PKCS1_SHA256
                | SignatureScheme::RSA_PKCS1_SHA384
                | SignatureScheme::RSA_PSS_RSAE_SHA256
                | SignatureScheme::RSA_PSS_RSAE_SHA384
                | SignatureScheme::RSA_PSS_RSAE_SHA512
        ),
        KeyType::Ecdsa => matches!(
            scheme,
            SignatureScheme::ECDSA_SECP256R1_SHA256 | SignatureScheme::ECDSA_SECP384R1_SHA384
        ),
        KeyType::Ed25519 => scheme == SignatureScheme::ED25519,
        KeyType::Sm2 => scheme == SignatureScheme::SM2_SM3,
        KeyType::Dh => false,
    }
}

/// Select a signature scheme: local preference intersected with the
/// peer list, filtered by key type and (for 1.3) scheme eligibility.
pub fn select_signature_scheme(
    config: &TlsConfig,
    peer_schemes: &[SignatureScheme],
    key_type: KeyType,
    tls13: bool,
) -> Result<SignatureScheme, TlsError> {
    for scheme in &config.signature_algorithms {
        if !peer_schemes.contains(scheme) {
            continue;
        }
        if !scheme_matches_key(*scheme, key_type) {
            continue;
        }
        if tls13 && !scheme.tls13_allowed() {
            continue;
        }
        return Ok(*scheme);
    }
    Err(TlsError::HandshakeFailure(
        "no shared signature scheme".into(),
    ))
}

/// Only the uncompressed point format is acceptable.
pub fn check_point_formats(formats: &[u8]) -> Result<(), TlsError> {
    if formats.contains(&0) {
        Ok(())
    } else {
        Err(TlsError::IllegalParameter(
            "peer does not accept uncompressed points".into(),
        ))
    }
}

// ---------------------------------------------------------------------------
// key_share processing (TLS 1.3 server)
// ---------------------------------------------------------------------------

/// Outcome of processing the client's key_share offer.
#[derive(Debug)]
pub enum KeyShareOutcome {
    /// A share for the selected group was present.
    Accept {
        group: NamedGroup,
        peer_public: Vec<u8>,
    },
    /// No usable share; issue a HelloRetryRequest for this group.
    NeedHelloRetry(NamedGroup),
}

/// Process the client's key_share against supported_groups
/// (RFC 8446 §4.2.8).
///
/// Offered shares must be a subset of supported_groups. After an HRR
/// for `hrr_group`, the retried ClientHello must carry exactly one
/// entry for that group.
pub fn process_key_share(
    config: &TlsConfig,
    supported_groups: &[NamedGroup],
    key_shares: &[(NamedGroup, Vec<u8>)],
    hrr_group: Option<NamedGroup>,
) -> Result<KeyShareOutcome, TlsError> {
    let selected = select_group(config, supported_groups).ok_or_else(|| {
        TlsError::HandshakeFailure("no mutually supported group".into())
    })?;

    if let Some(expected) = hrr_group {
        // Second ClientHello: exactly one KeyShareEntry for the group
        // named in the HelloRetryRequest.
        if key_shares.len() != 1 || key_shares[0].0 != expected {
            return Err(TlsError::IllegalParameter(
                "retried ClientHello key_share does not match selected_group".into(),
            ));
        }
    }

    for (group, public) in key_shares {
        if !supported_groups.contains(group) {
            return Err(TlsError::IllegalParameter(
                "key_share group not in supported_groups".into(),
            ));
        }
        if *group != selected {
            continue;
        }
        if let Some(expected_len) = group.public_len() {
            if public.len() != expected_len {
                return Err(TlsError::IllegalParameter(
                    "key_share public value length".into(),
                ));
            }
        }
        return Ok(KeyShareOutcome::Accept {
            group: selected,
            peer_public: public.clone(),
        });
    }

    // supported_groups contains a usable group but no share for it.
    Ok(KeyShareOutcome::NeedHelloRetry(selected))
}

// ---------------------------------------------------------------------------
// psk_key_exchange_modes
// ---------------------------------------------------------------------------

/// Intersect the client's offered modes with what the server permits.
pub fn negotiate_psk_modes(client_modes: &[u8]) -> PskModes {
    PskModes {
        psk_ke: client_modes.contains(&PSK_KE),
        psk_dhe_ke: client_modes.contains(&PSK_DHE_KE),
    }
}

// ---------------------------------------------------------------------------
// Extended master secret / encrypt-then-MAC stickiness
// ---------------------------------------------------------------------------

/// RFC 7627 §5.3 resumption matrix. Returns whether the candidate
/// session survives; the session is dropped (full handshake) when the
/// offer gained EMS that the session lacks.
pub fn resume_ems_check(
    session_has_ems: bool,
    offer_has_ems: bool,
    locally_enabled: bool,
) -> Result<bool, TlsError> {
    if session_has_ems {
        if !offer_has_ems {
            return Err(TlsError::HandshakeFailure(
                "resumption dropped extended master secret".into(),
            ));
        }
        Ok(true)
    } else if offer_has_ems {
        Ok(false)
    } else if locally_enabled {
        Err(TlsError::HandshakeFailure(
            "peer never negotiated extended master secret".into(),
        ))
    } else {
        Ok(true)
    }
}

/// Encrypt-then-MAC selection (RFC 7366): CBC suites in ≤1.2 only, and
/// renegotiation must not downgrade EtM to MtE.
pub fn negotiate_encrypt_then_mac(
    is_renegotiation: bool,
    previously_etm: bool,
    offered: bool,
    locally_enabled: bool,
    suite_is_cbc: bool,
) -> Result<bool, TlsError> {
    if is_renegotiation && previously_etm && !offered {
        return Err(TlsError::HandshakeFailure(
            "renegotiation downgraded encrypt-then-mac".into(),
        ));
    }
    Ok(locally_enabled && offered && suite_is_cbc)
}

// ---------------------------------------------------------------------------
// Secure renegotiation (RFC 5746)
// ---------------------------------------------------------------------------

/// Initial-handshake check: renegotiation_info, when present, must be
/// empty. Returns whether the peer supports secure renegotiation.
pub fn check_renegotiation_initial(
    has_scsv: bool,
    renegotiation_info: Option<&[u8]>,
) -> Result<bool, TlsError> {
    match renegotiation_info {
        Some(data) if !data.is_empty() => Err(TlsError::HandshakeFailure(
            "non-empty renegotiation_info in initial handshake".into(),
        )),
        Some(_) => Ok(true),
        None => Ok(has_scsv),
    }
}

/// Renegotiation check: the SCSV is forbidden and renegotiation_info
/// must equal the stored verify_data, compared in constant time.
pub fn check_renegotiation_info(
    provider: &dyn CryptoProvider,
    has_scsv: bool,
    renegotiation_info: Option<&[u8]>,
    expected_verify_data: &[u8],
) -> Result<(), TlsError> {
    if has_scsv {
        return Err(TlsError::HandshakeFailure(
            "SCSV offered during renegotiation".into(),
        ));
    }
    let info = renegotiation_info.ok_or_else(|| {
        TlsError::HandshakeFailure("renegotiation without renegotiation_info".into())
    })?;
    if !provider.ct_eq(info, expected_verify_data) {
        return Err(TlsError::HandshakeFailure(
            "renegotiation_info does not match stored verify_data".into(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SNI / ALPN
// ---------------------------------------------------------------------------

/// Case-insensitive ASCII hostname equality, used for the resumption
/// SNI check.
pub fn hostname_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes()
            .zip(b.bytes())
            .all(|(x, y)| x.to_ascii_lowercase() == y.to_ascii_lowercase())
}

/// ALPN selection. Callback-driven when configured (`NoAck` leaves the
/// negotiation unchanged, any other non-select result is fatal);
/// otherwise first local protocol present in the offer.
pub fn select_alpn(
    config: &TlsConfig,
    offered: &[Vec<u8>],
) -> Result<Option<Vec<u8>>, TlsError> {
    if let Some(cb) = &config.alpn_select {
        return match cb(offered) {
            AlpnAction::Select(proto) => {
                if offered.contains(&proto) {
                    Ok(Some(proto))
                } else {
                    Err(TlsError::NoApplicationProtocol)
                }
            }
            AlpnAction::NoAck => Ok(None),
            AlpnAction::Fatal => Err(TlsError::NoApplicationProtocol),
        };
    }
    Ok(config
        .alpn_protocols
        .iter()
        .find(|p| offered.contains(p))
        .cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrivateKey;
    use crate::handshake::extensions_codec::build_supported_versions_ch;
    use crate::testing::{mock_cert_der, MockCertProvider, MockProvider};
    use std::sync::Arc;

    fn base_config() -> TlsConfig {
        TlsConfig::builder(Arc::new(MockProvider::new()), Arc::new(MockCertProvider))
            .credential(
                vec![mock_cert_der(KeyType::Ecdsa, 1)],
                PrivateKey {
                    key_type: KeyType::Ecdsa,
                    der: mock_cert_der(KeyType::Ecdsa, 1),
                },
            )
            .build()
    }

    fn hello_with_versions(versions: &[u16]) -> ClientHello {
        ClientHello {
            legacy_version: 0x0303,
            random: [0; 32],
            session_id: vec![],
            #[cfg(feature = "dtls12")]
            cookie: vec![],
            cipher_suites: vec![CipherSuite::TLS_AES_128_GCM_SHA256],
            compression_methods: vec![0],
            extensions: vec![build_supported_versions_ch(versions)],
            binders_offset: None,
        }
    }

    #[test]
    fn test_select_version_prefers_tls13() {
        let config = base_config();
        let ch = hello_with_versions(&[0x0304, 0x0303]);
        assert_eq!(select_version(&config, &ch).unwrap(), TlsVersion::Tls13);
    }

    #[test]
    fn test_selected_version_is_in_both_lists() {
        // The selected version must sit in both lists.
        let config = base_config();
        for offered in [vec![0x0304], vec![0x0303], vec![0x0304, 0x0303]] {
            let ch = hello_with_versions(&offered);
            let selected = select_version(&config, &ch).unwrap();
            assert!(offered.contains(&selected.wire()));
            assert!(config.version_allowed(selected));
        }
    }

    #[test]
    fn test_select_version_without_key_material_falls_back() {
        // No credential and no PSK source: TLS 1.3 is unusable.
        let config =
            TlsConfig::builder(Arc::new(MockProvider::new()), Arc::new(MockCertProvider)).build();
        let ch = hello_with_versions(&[0x0304, 0x0303]);
        assert_eq!(select_version(&config, &ch).unwrap(), TlsVersion::Tls12);

        // Offering only 1.3 then fails as a handshake failure, since
        // the version itself was acceptable.
        let ch = hello_with_versions(&[0x0304]);
        let e = select_version(&config, &ch).unwrap_err();
        assert!(matches!(e, TlsError::HandshakeFailure(_)));
    }

    #[test]
    fn test_select_version_rejects_bad_legacy_with_extension() {
        let config = base_config();
        let mut ch = hello_with_versions(&[0x0304]);
        ch.legacy_version = 0x0302;
        assert!(matches!(
            select_version(&config, &ch).unwrap_err(),
            TlsError::ProtocolVersion(_)
        ));
    }

    #[test]
    fn test_select_version_legacy_clamping() {
        let config = base_config();
        let mut ch = hello_with_versions(&[]);
        ch.extensions.clear();
        // legacy_version above TLS 1.2 clamps down to TLS 1.2
        ch.legacy_version = 0x0305;
        assert_eq!(select_version(&config, &ch).unwrap(), TlsVersion::Tls12);
        // an old version below min fails
        ch.legacy_version = 0x0301;
        assert!(select_version(&config, &ch).is_err());
    }

    #[test]
    fn test_select_tls13_suite_uses_server_preference() {
        let config = base_config();
        let offered = vec![
            CipherSuite::TLS_AES_128_GCM_SHA256,
            CipherSuite::TLS_AES_256_GCM_SHA384,
        ];
        // Server default preference puts AES-256 first.
        assert_eq!(
            select_tls13_cipher_suite(&config, &offered).unwrap(),
            CipherSuite::TLS_AES_256_GCM_SHA384
        );
        assert!(select_tls13_cipher_suite(
            &config,
            &[CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256]
        )
        .is_err());
    }

    #[test]
    fn test_select_tls12_suite_requires_credential() {
        // Only an ECDSA credential: RSA suites are skipped.
        let config = base_config();
        let offered = vec![
            CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        ];
        let params =
            select_tls12_cipher_suite(&config, TlsVersion::Tls12, &offered, None).unwrap();
        assert_eq!(
            params.suite,
            CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
        );

        let rsa_only = vec![CipherSuite::TLS_RSA_WITH_AES_128_GCM_SHA256];
        assert!(select_tls12_cipher_suite(&config, TlsVersion::Tls12, &rsa_only, None).is_err());
    }

    #[test]
    fn test_select_tls12_psk_suite_needs_psk_source() {
        let offered = vec![CipherSuite::TLS_PSK_WITH_AES_128_GCM_SHA256];
        let no_psk = TlsConfig::builder(Arc::new(MockProvider::new()), Arc::new(MockCertProvider))
            .cipher_suites(offered.clone())
            .build();
        assert!(select_tls12_cipher_suite(&no_psk, TlsVersion::Tls12, &offered, None).is_err());

        let with_psk =
            TlsConfig::builder(Arc::new(MockProvider::new()), Arc::new(MockCertProvider))
                .cipher_suites(offered.clone())
                .psk_server_find(Arc::new(|_| Some(vec![1; 16])))
                .build();
        let params =
            select_tls12_cipher_suite(&with_psk, TlsVersion::Tls12, &offered, None).unwrap();
        assert!(params.kx_alg.is_psk());
    }

    #[test]
    fn test_select_group_preference() {
        let config = base_config();
        assert_eq!(
            select_group(&config, &[NamedGroup::SECP256R1, NamedGroup::X25519]),
            Some(NamedGroup::X25519)
        );
        assert_eq!(select_group(&config, &[NamedGroup::SM2P256]), None);
    }

    #[test]
    fn test_signature_scheme_selection() {
        let config = base_config();
        let peer = [
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_SECP256R1_SHA256,
        ];
        assert_eq!(
            select_signature_scheme(&config, &peer, KeyType::Ecdsa, true).unwrap(),
            SignatureScheme::ECDSA_SECP256R1_SHA256
        );
        // RSA key against ECDSA-only peer list fails
        assert!(select_signature_scheme(
            &config,
            &[SignatureScheme::ECDSA_SECP256R1_SHA256],
            KeyType::Rsa,
            true
        )
        .is_err());
        // PKCS#1 acceptable in 1.2 but not 1.3
        assert_eq!(
            select_signature_scheme(
                &config,
                &[SignatureScheme::RSA_PKCS1_SHA256],
                KeyType::Rsa,
                false
            )
            .unwrap(),
            SignatureScheme::RSA_PKCS1_SHA256
        );
        assert!(select_signature_scheme(
            &config,
            &[SignatureScheme::RSA_PKCS1_SHA256],
            KeyType::Rsa,
            true
        )
        .is_err());
    }

    #[test]
    fn test_point_formats() {
        check_point_formats(&[0]).unwrap();
        check_point_formats(&[1, 0, 2]).unwrap();
        assert!(check_point_formats(&[1, 2]).is_err());
    }

    #[test]
    fn test_key_share_accept() {
        let config = base_config();
        let groups = [NamedGroup::X25519, NamedGroup::SECP256R1];
        let shares = vec![(NamedGroup::X25519, vec![0x11; 32])];
        match process_key_share(&config, &groups, &shares, None).unwrap() {
            KeyShareOutcome::Accept { group, peer_public } => {
                assert_eq!(group, NamedGroup::X25519);
                assert_eq!(peer_public, vec![0x11; 32]);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_key_share_triggers_hrr() {
        let config = base_config();
        // Client supports x25519 but only shared a p256 key.
        let groups = [NamedGroup::SECP256R1, NamedGroup::X25519];
        let shares = vec![(NamedGroup::SECP256R1, vec![0x04; 65])];
        // Server preference is x25519 first → HRR for x25519.
        match process_key_share(&config, &groups, &shares, None).unwrap() {
            KeyShareOutcome::NeedHelloRetry(group) => assert_eq!(group, NamedGroup::X25519),
            _ => unreachable!("expected HRR"),
        }
    }

    #[test]
    fn test_key_share_not_subset_is_illegal() {
        let config = base_config();
        let groups = [NamedGroup::X25519];
        let shares = vec![(NamedGroup::SECP384R1, vec![0x04; 97])];
        assert!(matches!(
            process_key_share(&config, &groups, &shares, None).unwrap_err(),
            TlsError::IllegalParameter(_)
        ));
    }

    #[test]
    fn test_key_share_after_hrr_must_be_exact() {
        let config = base_config();
        let groups = [NamedGroup::X25519, NamedGroup::SECP256R1];
        // Correct: exactly one share for the HRR group.
        let good = vec![(NamedGroup::X25519, vec![0x22; 32])];
        assert!(matches!(
            process_key_share(&config, &groups, &good, Some(NamedGroup::X25519)).unwrap(),
            KeyShareOutcome::Accept { .. }
        ));
        // Wrong group
        let wrong = vec![(NamedGroup::SECP256R1, vec![0x04; 65])];
        assert!(process_key_share(&config, &groups, &wrong, Some(NamedGroup::X25519)).is_err());
        // Two entries
        let two = vec![
            (NamedGroup::X25519, vec![0x22; 32]),
            (NamedGroup::SECP256R1, vec![0x04; 65]),
        ];
        assert!(process_key_share(&config, &groups, &two, Some(NamedGroup::X25519)).is_err());
    }

    #[test]
    fn test_key_share_bad_public_len() {
        let config = base_config();
        let groups = [NamedGroup::X25519];
        let shares = vec![(NamedGroup::X25519, vec![0x11; 31])];
        assert!(process_key_share(&config, &groups, &shares, None).is_err());
    }

    #[test]
    fn test_psk_modes() {
        let modes = negotiate_psk_modes(&[PSK_KE, PSK_DHE_KE]);
        assert!(modes.psk_ke && modes.psk_dhe_ke);
        let modes = negotiate_psk_modes(&[PSK_DHE_KE, 7]);
        assert!(!modes.psk_ke && modes.psk_dhe_ke);
        assert!(!negotiate_psk_modes(&[9]).any());
    }

    #[test]
    fn test_ems_resumption_matrix() {
        // session EMS + offer EMS → resume
        assert!(resume_ems_check(true, true, true).unwrap());
        // session EMS + no offer → abort
        assert!(resume_ems_check(true, false, true).is_err());
        // no session EMS + offer EMS → drop session, full handshake
        assert!(!resume_ems_check(false, true, true).unwrap());
        // neither, EMS locally enabled → abort
        assert!(resume_ems_check(false, false, true).is_err());
        // neither, EMS disabled → legacy resume
        assert!(resume_ems_check(false, false, false).unwrap());
    }

    #[test]
    fn test_etm_negotiation() {
        // Plain selection on a CBC suite
        assert!(negotiate_encrypt_then_mac(false, false, true, true, true).unwrap());
        // AEAD suite never negotiates EtM
        assert!(!negotiate_encrypt_then_mac(false, false, true, true, false).unwrap());
        // Downgrade during renegotiation is fatal
        assert!(negotiate_encrypt_then_mac(true, true, false, true, true).is_err());
        // Keeping EtM on renegotiation is fine
        assert!(negotiate_encrypt_then_mac(true, true, true, true, true).unwrap());
    }

    #[test]
    fn test_secure_renegotiation_initial() {
        assert!(check_renegotiation_initial(false, Some(&[])).unwrap());
        assert!(check_renegotiation_initial(true, None).unwrap());
        assert!(!check_renegotiation_initial(false, None).unwrap());
        assert!(check_renegotiation_initial(false, Some(&[1])).is_err());
    }

    #[test]
    fn test_secure_renegotiation_verify_data() {
        let p = MockProvider::new();
        let stored = [0x12u8; 12];
        check_renegotiation_info(&p, false, Some(&stored), &stored).unwrap();
        // SCSV during renegotiation is fatal
        assert!(check_renegotiation_info(&p, true, Some(&stored), &stored).is_err());
        // Mismatch is fatal
        assert!(check_renegotiation_info(&p, false, Some(&[0; 12]), &stored).is_err());
        // Missing extension is fatal
        assert!(check_renegotiation_info(&p, false, None, &stored).is_err());
    }

    #[test]
    fn test_hostname_compare() {
        assert!(hostname_eq("Example.COM", "example.com"));
        assert!(!hostname_eq("example.com", "example.org"));
        assert!(!hostname_eq("example.com", "example.com."));
    }

    #[test]
    fn test_alpn_selection() {
        let offered = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        // List-driven
        let config = TlsConfig::builder(Arc::new(MockProvider::new()), Arc::new(MockCertProvider))
            .alpn_protocols(vec![b"http/1.1".to_vec(), b"h2".to_vec()])
            .build();
        assert_eq!(
            select_alpn(&config, &offered).unwrap(),
            Some(b"http/1.1".to_vec())
        );

        // Callback NoAck leaves negotiation unchanged
        let config = TlsConfig::builder(Arc::new(MockProvider::new()), Arc::new(MockCertProvider))
            .alpn_select(Arc::new(|_| AlpnAction::NoAck))
            .build();
        assert_eq!(select_alpn(&config, &offered).unwrap(), None);

        // Callback fatal
        let config = TlsConfig::builder(Arc::new(MockProvider::new()), Arc::new(MockCertProvider))
            .alpn_select(Arc::new(|_| AlpnAction::Fatal))
            .build();
        assert!(matches!(
            select_alpn(&config, &offered).unwrap_err(),
            TlsError::NoApplicationProtocol
        ));

        // Callback selecting something the peer never offered is fatal
        let config = TlsConfig::builder(Arc::new(MockProvider::new()), Arc::new(MockCertProvider))
            .alpn_select(Arc::new(|_| AlpnAction::Select(b"h3".to_vec())))
            .build();
        assert!(select_alpn(&config, &offered).is_err());
    }
}
