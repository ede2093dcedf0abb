//! TLS 1.3 client handshake state machine.
//!
//! Drives the 1-RTT flow (with HelloRetryRequest, PSK offers, and the
//! middlebox-compatibility CCS) and the post-handshake messages:
//! NewSessionTicket, KeyUpdate, and server-initiated reauthentication.
//! A ServerHello that selects ≤1.2 is handed back to the connection as
//! a downgrade for the legacy machine.

use std::sync::Arc;

use latch_types::{KeyUsage, TlsError};
use zeroize::Zeroize;

use crate::config::TlsConfig;
use crate::crypt::key_schedule::{update_traffic_secret, KeySchedule};
use crate::crypt::transcript::TranscriptHash;
use crate::crypt::CipherSuiteParams;
use crate::extensions::{Extension, ExtensionType};
use crate::provider::{CertHandle, KeyDirection, RecordCommand};
use crate::session::{unix_now, Session};
use crate::{CipherSuite, TlsVersion};

use super::codec::{
    decode_certificate, decode_certificate_request, decode_certificate_verify,
    decode_encrypted_extensions, decode_finished, decode_key_update, decode_new_session_ticket,
    decode_server_hello, encode_certificate, encode_certificate_verify, encode_client_hello,
    encode_finished, encode_key_update, parse_handshake_header, CertificateEntry, CertificateMsg,
    CertificateRequestMsg, CertificateVerifyMsg, ClientHello, KeyUpdateMsg, ServerHello,
    DOWNGRADE_TLS12_SENTINEL,
};
use super::extensions_codec::{
    build_alpn, build_cookie, build_ec_point_formats, build_encrypt_then_mac,
    build_extended_master_secret, build_key_share_ch, build_post_handshake_auth,
    build_pre_shared_key_ch, build_psk_key_exchange_modes, build_server_name,
    build_session_ticket, build_signature_algorithms, build_supported_groups,
    build_supported_versions_ch, parse_alpn_selected, parse_cookie, parse_key_share_hrr,
    parse_key_share_sh, parse_pre_shared_key_sh, parse_supported_versions_sh, PskIdentity, PSK_KE,
};
use super::key_exchange::KeyExchange;
use super::negotiate::{client_offered_versions, scheme_matches_key, select_signature_scheme};
use super::verify::{
    check_finished13, compute_binder, compute_finished13, tls13_certificate_verify_payload,
};
use super::{DowngradeContext, Flight, FlightStatus, HandshakeState, HandshakeType};

const EPOCH_HANDSHAKE: u16 = 2;
const EPOCH_APP: u16 = 3;

/// The PSK the client put on the wire.
struct OfferedPsk {
    identity: Vec<u8>,
    psk: Vec<u8>,
    external: bool,
    obfuscated_age: u32,
}

impl Drop for OfferedPsk {
    fn drop(&mut self) {
        self.psk.zeroize();
    }
}

pub struct ClientHandshake13 {
    config: Arc<TlsConfig>,
    state: HandshakeState,
    transcript: TranscriptHash,
    schedule: Option<KeySchedule>,
    params: Option<CipherSuiteParams>,
    kx: Option<KeyExchange>,
    client_random: [u8; 32],
    session_id: Vec<u8>,
    offered_suites: Vec<CipherSuite>,
    offered_psk: Option<OfferedPsk>,
    hrr_received: bool,
    ccs_sent: bool,
    psk_accepted: bool,
    server_cert_chain: Vec<CertHandle>,
    cert_request: Option<CertificateRequestMsg>,
    client_hs_secret: Vec<u8>,
    server_hs_secret: Vec<u8>,
    client_app_secret: Vec<u8>,
    server_app_secret: Vec<u8>,
    exporter_secret: Vec<u8>,
    resumption_master_secret: Vec<u8>,
    negotiated_alpn: Option<Vec<u8>>,
    read_epoch: u16,
    write_epoch: u16,
}

impl Drop for ClientHandshake13 {
    fn drop(&mut self) {
        self.client_hs_secret.zeroize();
        self.server_hs_secret.zeroize();
        self.client_app_secret.zeroize();
        self.server_app_secret.zeroize();
        self.exporter_secret.zeroize();
        self.resumption_master_secret.zeroize();
    }
}

impl ClientHandshake13 {
    pub fn new(config: Arc<TlsConfig>) -> Self {
        Self {
            config,
            state: HandshakeState::Idle,
            transcript: TranscriptHash::new(),
            schedule: None,
            params: None,
            kx: None,
            client_random: [0; 32],
            session_id: Vec::new(),
            offered_suites: Vec::new(),
            offered_psk: None,
            hrr_received: false,
            ccs_sent: false,
            psk_accepted: false,
            server_cert_chain: Vec::new(),
            cert_request: None,
            client_hs_secret: Vec::new(),
            server_hs_secret: Vec::new(),
            client_app_secret: Vec::new(),
            server_app_secret: Vec::new(),
            exporter_secret: Vec::new(),
            resumption_master_secret: Vec::new(),
            negotiated_alpn: None,
            read_epoch: EPOCH_HANDSHAKE,
            write_epoch: EPOCH_HANDSHAKE,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn negotiated_suite(&self) -> Option<CipherSuite> {
        self.params.as_ref().map(|p| p.suite)
    }

    pub fn negotiated_alpn(&self) -> Option<&[u8]> {
        self.negotiated_alpn.as_deref()
    }

    pub fn exporter_secret(&self) -> &[u8] {
        &self.exporter_secret
    }

    /// Build and send the first ClientHello.
    pub fn start(&mut self) -> Result<Flight, TlsError> {
        if self.state != HandshakeState::Idle {
            return Err(TlsError::Internal("client handshake already started".into()));
        }
        let provider = Arc::clone(&self.config.crypto);
        provider.drbg_random(&mut self.client_random)?;
        // Non-empty legacy session id for middlebox compatibility.
        let mut sid = vec![0u8; 32];
        provider.drbg_random(&mut sid)?;
        self.session_id = sid;

        self.select_offered_psk();
        if self.offers_key_share() {
            let group = *self
                .config
                .groups
                .first()
                .ok_or_else(|| TlsError::Internal("no groups configured".into()))?;
            self.kx = Some(KeyExchange::generate(provider.as_ref(), group)?);
        }

        let ch = self.build_client_hello(None)?;
        self.transcript.update(&ch)?;
        self.state = HandshakeState::WaitServerHello;
        let mut flight = Flight::in_progress();
        flight.push_command(RecordCommand::EnableCcsReception);
        flight.push_message(ch);
        flight.push_command(RecordCommand::Flush);
        Ok(flight)
    }

    /// A psk_ke-only offer with a PSK in hand skips key_share.
    fn offers_key_share(&self) -> bool {
        let psk_ke_only = self.config.tls13_psk_modes == [PSK_KE];
        !(psk_ke_only && self.offered_psk.is_some())
    }

    fn select_offered_psk(&mut self) {
        let now = unix_now();
        if let Some(session) = &self.config.resumption_session {
            if session.version == TlsVersion::Tls13 && session.is_live(now) {
                if let Some(ticket) = &session.ticket {
                    let age_ms = (now.saturating_sub(session.created_at) * 1000) as u32;
                    self.offered_psk = Some(OfferedPsk {
                        identity: ticket.clone(),
                        psk: session.master_secret.clone(),
                        external: false,
                        obfuscated_age: age_ms.wrapping_add(session.ticket_age_add),
                    });
                    return;
                }
            }
        }
        if let Some(psk) = self.config.external_psks.first() {
            self.offered_psk = Some(OfferedPsk {
                identity: psk.identity.clone(),
                psk: psk.key.clone(),
                external: true,
                obfuscated_age: 0,
            });
        }
    }

    /// Assemble a ClientHello; `cookie` echoes a HelloRetryRequest
    /// cookie on the second hello.
    fn build_client_hello(&mut self, cookie: Option<Vec<u8>>) -> Result<Vec<u8>, TlsError> {
        let config = Arc::clone(&self.config);
        let offers_tls12 = config.version_allowed(TlsVersion::Tls12);

        let mut suites: Vec<CipherSuite> = config.tls13_cipher_suites.clone();
        if offers_tls12 {
            suites.extend(config.cipher_suites.iter().copied());
        }
        suites.push(CipherSuite::TLS_EMPTY_RENEGOTIATION_INFO_SCSV);
        self.offered_suites = suites.clone();

        let mut extensions: Vec<Extension> = Vec::new();
        if let Some(name) = &config.server_name {
            extensions.push(build_server_name(name));
        }
        extensions.push(build_supported_versions_ch(&client_offered_versions(
            &config,
        )));
        extensions.push(build_supported_groups(&config.groups));
        extensions.push(build_signature_algorithms(&config.signature_algorithms));
        if offers_tls12 {
            extensions.push(build_ec_point_formats());
            if config.extended_master_secret {
                extensions.push(build_extended_master_secret());
            }
            if config.encrypt_then_mac {
                extensions.push(build_encrypt_then_mac());
            }
            if config.ticket_support {
                extensions.push(build_session_ticket(&[]));
            }
        }
        if !config.alpn_protocols.is_empty() {
            extensions.push(build_alpn(&config.alpn_protocols));
        }
        if config.post_handshake_auth {
            extensions.push(build_post_handshake_auth());
        }
        if let Some(kx) = &self.kx {
            extensions.push(build_key_share_ch(&[(
                kx.group(),
                kx.public_bytes().to_vec(),
            )]));
        }
        if let Some(cookie) = cookie {
            extensions.push(build_cookie(&cookie));
        }
        // Advertised even without a PSK offer so the server can issue
        // resumption tickets.
        if !config.tls13_psk_modes.is_empty() {
            extensions.push(build_psk_key_exchange_modes(&config.tls13_psk_modes));
        }

        // pre_shared_key goes last; the binder is computed over the
        // serialised hello truncated at the binders vector and patched
        // in afterwards.
        let binder_len = self
            .offered_psk
            .as_ref()
            .map(|_| self.psk_hash_len())
            .unwrap_or(0);
        if let Some(psk) = &self.offered_psk {
            extensions.push(build_pre_shared_key_ch(
                &[PskIdentity {
                    identity: psk.identity.clone(),
                    obfuscated_ticket_age: psk.obfuscated_age,
                }],
                &[vec![0u8; binder_len]],
            ));
        }

        let hello = ClientHello {
            legacy_version: TlsVersion::Tls12.wire(),
            random: self.client_random,
            session_id: self.session_id.clone(),
            #[cfg(feature = "dtls12")]
            cookie: Vec::new(),
            cipher_suites: suites,
            compression_methods: vec![0],
            extensions,
            binders_offset: None,
        };
        let mut msg = encode_client_hello(&hello)?;

        if let Some(psk) = &self.offered_psk {
            // binders vector: u16 length || u8 binder length || binder
            let binders_block = 2 + 1 + binder_len;
            let truncated_len = msg.len() - binders_block;
            let truncated_hash = if self.transcript.is_selected() {
                self.transcript.digest_with(&msg[..truncated_len])?
            } else {
                let params = self.psk_params()?;
                let mut h = self.config.crypto.hash_new(params.hash)?;
                h.update(&msg[..truncated_len])?;
                let mut out = vec![0u8; params.hash_len()];
                h.finish(&mut out)?;
                out
            };
            let params = self.psk_params()?;
            let binder = compute_binder(
                self.config.crypto.as_ref(),
                &params,
                &psk.psk,
                psk.external,
                &truncated_hash,
            )?;
            let tail = msg.len() - binder_len;
            msg[tail..].copy_from_slice(&binder);
        }
        Ok(msg)
    }

    fn psk_hash_len(&self) -> usize {
        self.psk_params().map(|p| p.hash_len()).unwrap_or(32)
    }

    /// Suite parameters governing the offered PSK's hash: the
    /// negotiated suite once known, the first configured suite before.
    fn psk_params(&self) -> Result<CipherSuiteParams, TlsError> {
        if let Some(p) = &self.params {
            return Ok(p.clone());
        }
        let suite = *self
            .config
            .tls13_cipher_suites
            .first()
            .ok_or_else(|| TlsError::Internal("no TLS 1.3 suites configured".into()))?;
        CipherSuiteParams::from_suite(suite)
    }

    /// Feed one complete handshake message.
    pub fn on_message(&mut self, raw: &[u8]) -> Result<Flight, TlsError> {
        let (msg_type, body, consumed) = parse_handshake_header(raw)?;
        if consumed != raw.len() {
            return Err(TlsError::Decode("trailing bytes after handshake".into()));
        }
        match (self.state, msg_type) {
            (HandshakeState::WaitServerHello, HandshakeType::ServerHello) => {
                let sh = decode_server_hello(body)?;
                if sh.is_hello_retry_request() {
                    self.on_hello_retry_request(&sh, raw)
                } else {
                    self.on_server_hello(&sh, raw)
                }
            }
            (HandshakeState::WaitEncryptedExtensions, HandshakeType::EncryptedExtensions) => {
                self.on_encrypted_extensions(body, raw)
            }
            (HandshakeState::WaitCertCertReq, HandshakeType::CertificateRequest) => {
                if self.cert_request.is_some() {
                    return Err(TlsError::UnexpectedMessage(
                        "duplicate CertificateRequest".into(),
                    ));
                }
                let cr = decode_certificate_request(body)?;
                if !cr
                    .extensions
                    .iter()
                    .any(|e| e.extension_type == ExtensionType::SIGNATURE_ALGORITHMS)
                {
                    return Err(TlsError::MissingExtension(
                        "CertificateRequest without signature_algorithms".into(),
                    ));
                }
                self.cert_request = Some(cr);
                self.transcript.update(raw)?;
                Ok(Flight::in_progress())
            }
            (HandshakeState::WaitCertCertReq, HandshakeType::Certificate) => {
                self.on_certificate(body, raw)
            }
            (HandshakeState::WaitCertVerify, HandshakeType::CertificateVerify) => {
                self.on_certificate_verify(body, raw)
            }
            (HandshakeState::WaitFinished, HandshakeType::Finished) => {
                self.on_server_finished(body, raw)
            }
            (HandshakeState::Connected, HandshakeType::NewSessionTicket) => {
                self.on_new_session_ticket(body)
            }
            (HandshakeState::Connected, HandshakeType::KeyUpdate) => self.on_key_update(body),
            (HandshakeState::Connected, HandshakeType::CertificateRequest) => {
                self.on_post_handshake_cert_request(body, raw)
            }
            (state, ty) => Err(TlsError::UnexpectedMessage(format!(
                "{ty:?} in state {state:?}"
            ))),
        }
    }

    fn on_hello_retry_request(&mut self, sh: &ServerHello, raw: &[u8]) -> Result<Flight, TlsError> {
        if self.hrr_received {
            return Err(TlsError::UnexpectedMessage("second HelloRetryRequest".into()));
        }
        self.hrr_received = true;
        if !self.offered_suites.contains(&sh.cipher_suite) || !sh.cipher_suite.is_tls13() {
            return Err(TlsError::IllegalParameter(
                "HelloRetryRequest selected an unoffered suite".into(),
            ));
        }
        let params = CipherSuiteParams::from_suite(sh.cipher_suite)?;

        let key_share = sh
            .find_extension(ExtensionType::KEY_SHARE)
            .ok_or_else(|| TlsError::MissingExtension("HelloRetryRequest key_share".into()))?;
        let selected_group = parse_key_share_hrr(key_share)?;
        if !self.config.groups.contains(&selected_group) {
            return Err(TlsError::IllegalParameter(
                "HelloRetryRequest group not offered".into(),
            ));
        }
        if let Some(kx) = &self.kx {
            if kx.group() == selected_group {
                // The server must not retry for a group we already
                // shared (RFC 8446 §4.1.4).
                return Err(TlsError::IllegalParameter(
                    "HelloRetryRequest repeats the shared group".into(),
                ));
            }
        }
        let cookie = match sh.find_extension(ExtensionType::COOKIE) {
            Some(data) => Some(parse_cookie(data)?),
            None => None,
        };

        // Transcript becomes message_hash(CH1) || HRR || CH2 ...
        self.transcript
            .hrr_reset(self.config.crypto.as_ref(), params.hash)?;
        self.transcript.update(raw)?;
        self.params = Some(params);

        self.kx = Some(KeyExchange::generate(
            self.config.crypto.as_ref(),
            selected_group,
        )?);
        let ch2 = self.build_client_hello(cookie)?;
        self.transcript.update(&ch2)?;

        let mut flight = Flight::in_progress();
        if !self.ccs_sent {
            self.ccs_sent = true;
            flight.push_command(RecordCommand::WriteCcs);
        }
        flight.push_message(ch2);
        flight.push_command(RecordCommand::Flush);
        Ok(flight)
    }

    fn on_server_hello(&mut self, sh: &ServerHello, raw: &[u8]) -> Result<Flight, TlsError> {
        let provider = Arc::clone(&self.config.crypto);
        let selected_13 = match sh.find_extension(ExtensionType::SUPPORTED_VERSIONS) {
            Some(data) => {
                let v = parse_supported_versions_sh(data)?;
                if v != TlsVersion::Tls13.wire() {
                    return Err(TlsError::ProtocolVersion(format!(
                        "server selected {v:#06x} via supported_versions"
                    )));
                }
                true
            }
            None => false,
        };
        if !selected_13 {
            return self.downgrade_to_tls12(sh, raw);
        }
        if self.hrr_received {
            if let Some(p) = &self.params {
                if p.suite != sh.cipher_suite {
                    return Err(TlsError::IllegalParameter(
                        "ServerHello suite differs from HelloRetryRequest".into(),
                    ));
                }
            }
        }
        if !self.offered_suites.contains(&sh.cipher_suite) || !sh.cipher_suite.is_tls13() {
            return Err(TlsError::IllegalParameter(
                "server selected an unoffered suite".into(),
            ));
        }
        if sh.session_id != self.session_id {
            return Err(TlsError::IllegalParameter("session_id echo mismatch".into()));
        }
        if sh.compression_method != 0 {
            return Err(TlsError::IllegalParameter("non-null compression".into()));
        }
        let params = CipherSuiteParams::from_suite(sh.cipher_suite)?;
        self.transcript.select_hash(provider.as_ref(), params.hash)?;
        self.transcript.update(raw)?;

        // PSK acceptance
        let mut psk: Option<Vec<u8>> = None;
        if let Some(data) = sh.find_extension(ExtensionType::PRE_SHARED_KEY) {
            let index = parse_pre_shared_key_sh(data)?;
            let offered = self.offered_psk.as_ref().ok_or_else(|| {
                TlsError::IllegalParameter("pre_shared_key accepted but never offered".into())
            })?;
            if index != 0 {
                return Err(TlsError::IllegalParameter(
                    "selected_identity out of range".into(),
                ));
            }
            if offered.psk.len() != params.hash_len() && !offered.external {
                return Err(TlsError::IllegalParameter("psk length mismatch".into()));
            }
            self.psk_accepted = true;
            psk = Some(offered.psk.clone());
        }

        // Key share
        let mut shared = Vec::new();
        match sh.find_extension(ExtensionType::KEY_SHARE) {
            Some(data) => {
                let (group, peer_public) = parse_key_share_sh(data)?;
                let kx = self.kx.as_ref().ok_or_else(|| {
                    TlsError::IllegalParameter("key_share answered but never offered".into())
                })?;
                if group != kx.group() {
                    return Err(TlsError::IllegalParameter(
                        "ServerHello key_share group was not shared".into(),
                    ));
                }
                shared = kx.derive(&peer_public)?.0.clone();
            }
            None => {
                if !self.psk_accepted {
                    return Err(TlsError::IllegalParameter(
                        "ServerHello with neither key_share nor pre_shared_key".into(),
                    ));
                }
            }
        }

        let mut schedule = KeySchedule::new(&params);
        schedule.derive_early_secret(provider.as_ref(), psk.as_deref())?;
        schedule.derive_handshake_secret(provider.as_ref(), &shared)?;
        shared.zeroize();
        if let Some(mut p) = psk {
            p.zeroize();
        }
        let th = self.transcript.digest()?;
        let (client_hs, server_hs) =
            schedule.derive_handshake_traffic_secrets(provider.as_ref(), &th)?;
        self.key_log("CLIENT_HANDSHAKE_TRAFFIC_SECRET", &client_hs);
        self.key_log("SERVER_HANDSHAKE_TRAFFIC_SECRET", &server_hs);

        let mut flight = Flight::in_progress();
        if !self.ccs_sent {
            self.ccs_sent = true;
            flight.push_command(RecordCommand::WriteCcs);
        }
        flight.push_command(RecordCommand::SetKey {
            direction: KeyDirection::Read,
            epoch: EPOCH_HANDSHAKE,
            suite: params.suite,
            secret: server_hs.clone(),
        });
        flight.push_command(RecordCommand::SetKey {
            direction: KeyDirection::Write,
            epoch: EPOCH_HANDSHAKE,
            suite: params.suite,
            secret: client_hs.clone(),
        });

        self.client_hs_secret = client_hs;
        self.server_hs_secret = server_hs;
        self.schedule = Some(schedule);
        self.params = Some(params);
        self.state = HandshakeState::WaitEncryptedExtensions;
        Ok(flight)
    }

    fn downgrade_to_tls12(&mut self, sh: &ServerHello, raw: &[u8]) -> Result<Flight, TlsError> {
        if !self.config.version_allowed(TlsVersion::Tls12) {
            return Err(TlsError::ProtocolVersion(
                "server selected TLS 1.2 but only 1.3 is enabled".into(),
            ));
        }
        if sh.random[24..] == DOWNGRADE_TLS12_SENTINEL {
            // The sentinel means a 1.3-capable server was downgraded.
            return Err(TlsError::IllegalParameter(
                "downgrade sentinel in ServerHello.random".into(),
            ));
        }
        let ctx = DowngradeContext {
            version: TlsVersion::Tls12,
            trigger_raw: raw.to_vec(),
            client: Some(super::ClientDowngrade {
                client_random: self.client_random,
                offered_session_id: self.session_id.clone(),
                offered_suites: self.offered_suites.clone(),
                offered_ems: self.config.extended_master_secret,
                transcript: self.transcript.fork(),
            }),
        };
        Ok(Flight {
            items: Vec::new(),
            status: FlightStatus::Downgrade(Box::new(ctx)),
            session: None,
        })
    }

    fn on_encrypted_extensions(&mut self, body: &[u8], raw: &[u8]) -> Result<Flight, TlsError> {
        let ee = decode_encrypted_extensions(body)?;
        for ext in &ee.extensions {
            match ext.extension_type {
                ExtensionType::APPLICATION_LAYER_PROTOCOL_NEGOTIATION => {
                    let proto = parse_alpn_selected(&ext.data)?;
                    if !self.config.alpn_protocols.contains(&proto) {
                        return Err(TlsError::NoApplicationProtocol);
                    }
                    self.negotiated_alpn = Some(proto);
                }
                ExtensionType::SERVER_NAME | ExtensionType::SUPPORTED_GROUPS => {}
                other => {
                    return Err(TlsError::UnsupportedExtension(format!(
                        "unexpected EncryptedExtensions extension {}",
                        other.0
                    )));
                }
            }
        }
        self.transcript.update(raw)?;
        self.state = if self.psk_accepted {
            HandshakeState::WaitFinished
        } else {
            HandshakeState::WaitCertCertReq
        };
        Ok(Flight::in_progress())
    }

    fn on_certificate(&mut self, body: &[u8], raw: &[u8]) -> Result<Flight, TlsError> {
        let msg = decode_certificate(body)?;
        if !msg.certificate_request_context.is_empty() {
            return Err(TlsError::IllegalParameter(
                "server Certificate with non-empty context".into(),
            ));
        }
        if msg.certificate_list.is_empty() {
            return Err(TlsError::HandshakeFailure("empty server certificate".into()));
        }
        let mut chain = Vec::with_capacity(msg.certificate_list.len());
        for entry in &msg.certificate_list {
            chain.push(self.config.certs.parse(&entry.cert_data)?);
        }
        if self.config.verify_peer {
            let result = self.config.certs.verify_chain(
                &chain,
                self.config.server_name.as_deref(),
                KeyUsage::DigitalSignature,
                unix_now(),
            );
            let default_ok = result.is_ok();
            let accepted = match &self.config.cert_verify_override {
                Some(cb) => {
                    let ders: Vec<Vec<u8>> =
                        chain.iter().map(|c| c.der().to_vec()).collect();
                    cb(&ders, default_ok)
                }
                None => default_ok,
            };
            if !accepted {
                return match result {
                    Err(e) => Err(e.into()),
                    Ok(()) => Err(TlsError::BadCertificate(
                        "rejected by verification override".into(),
                    )),
                };
            }
        }
        self.server_cert_chain = chain;
        self.transcript.update(raw)?;
        self.state = HandshakeState::WaitCertVerify;
        Ok(Flight::in_progress())
    }

    fn on_certificate_verify(&mut self, body: &[u8], raw: &[u8]) -> Result<Flight, TlsError> {
        let msg = decode_certificate_verify(body)?;
        let leaf = self
            .server_cert_chain
            .first()
            .ok_or_else(|| TlsError::Internal("CertificateVerify without certificate".into()))?;
        if !self.config.signature_algorithms.contains(&msg.algorithm)
            || !msg.algorithm.tls13_allowed()
            || !scheme_matches_key(msg.algorithm, leaf.key_type())
        {
            return Err(TlsError::IllegalParameter(
                "CertificateVerify signature scheme".into(),
            ));
        }
        let th = self.transcript.digest()?;
        let payload = tls13_certificate_verify_payload(true, &th);
        self.config
            .crypto
            .verify(&leaf.public_key(), msg.algorithm.0, &payload, &msg.signature)
            .map_err(|_| TlsError::DecryptError("CertificateVerify signature".into()))?;
        self.transcript.update(raw)?;
        self.state = HandshakeState::WaitFinished;
        Ok(Flight::in_progress())
    }

    fn on_server_finished(&mut self, body: &[u8], raw: &[u8]) -> Result<Flight, TlsError> {
        let provider = Arc::clone(&self.config.crypto);
        let params = self
            .params
            .clone()
            .ok_or_else(|| TlsError::Internal("no negotiated suite".into()))?;
        let fin = decode_finished(body, params.hash_len())?;
        let th = self.transcript.digest()?;
        {
            let schedule = self
                .schedule
                .as_ref()
                .ok_or_else(|| TlsError::Internal("no key schedule".into()))?;
            check_finished13(
                provider.as_ref(),
                schedule,
                &self.server_hs_secret,
                &th,
                &fin.verify_data,
            )?;
        }
        self.transcript.update(raw)?;

        let schedule = self
            .schedule
            .as_mut()
            .ok_or_else(|| TlsError::Internal("no key schedule".into()))?;
        schedule.derive_master_secret(provider.as_ref())?;
        let th_sf = self.transcript.digest()?;
        let (client_app, server_app) =
            schedule.derive_app_traffic_secrets(provider.as_ref(), &th_sf)?;
        self.exporter_secret =
            schedule.derive_exporter_master_secret(provider.as_ref(), &th_sf)?;

        let mut flight = Flight::in_progress();
        flight.push_command(RecordCommand::SetKey {
            direction: KeyDirection::Read,
            epoch: EPOCH_APP,
            suite: params.suite,
            secret: server_app.clone(),
        });

        // Client authentication flight, when requested.
        if let Some(cr) = self.cert_request.take() {
            for msg in self.build_client_auth_flight(&cr.certificate_request_context, &cr)? {
                flight.push_message(msg);
            }
        }

        // Client Finished over the transcript including our auth
        // flight.
        let schedule = self
            .schedule
            .as_ref()
            .ok_or_else(|| TlsError::Internal("no key schedule".into()))?;
        let th_now = self.transcript.digest()?;
        let vd = compute_finished13(provider.as_ref(), schedule, &self.client_hs_secret, &th_now)?;
        let fin_msg = encode_finished(&vd);
        self.transcript.update(&fin_msg)?;
        flight.push_message(fin_msg);

        flight.push_command(RecordCommand::SetKey {
            direction: KeyDirection::Write,
            epoch: EPOCH_APP,
            suite: params.suite,
            secret: client_app.clone(),
        });
        flight.push_command(RecordCommand::DisableCcsReception);
        flight.push_command(RecordCommand::Flush);

        let th_full = self.transcript.digest()?;
        self.resumption_master_secret =
            schedule.derive_resumption_master_secret(provider.as_ref(), &th_full)?;
        self.key_log("CLIENT_TRAFFIC_SECRET_0", &client_app);
        self.key_log("SERVER_TRAFFIC_SECRET_0", &server_app);
        self.client_app_secret = client_app;
        self.server_app_secret = server_app;
        self.state = HandshakeState::Connected;
        flight.status = FlightStatus::Complete;
        Ok(flight)
    }

    fn build_client_auth_flight(
        &mut self,
        context: &[u8],
        cr: &CertificateRequestMsg,
    ) -> Result<Vec<Vec<u8>>, TlsError> {
        let provider = Arc::clone(&self.config.crypto);
        let mut out = Vec::new();
        let credential = self.config.credentials.first().cloned();
        let entries = credential
            .as_ref()
            .map(|c| {
                c.chain
                    .iter()
                    .map(|der| CertificateEntry {
                        cert_data: der.clone(),
                        extensions: Vec::new(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let cert_msg = encode_certificate(&CertificateMsg {
            certificate_request_context: context.to_vec(),
            certificate_list: entries,
        })?;
        self.transcript.update(&cert_msg)?;
        out.push(cert_msg);

        if let Some(cred) = credential {
            let peer_schemes = cr
                .extensions
                .iter()
                .find(|e| e.extension_type == ExtensionType::SIGNATURE_ALGORITHMS)
                .map(|e| super::extensions_codec::parse_signature_algorithms(&e.data))
                .transpose()?
                .unwrap_or_default();
            let scheme = select_signature_scheme(
                &self.config,
                &peer_schemes,
                cred.private_key.key_type,
                true,
            )?;
            let th = self.transcript.digest()?;
            let payload = tls13_certificate_verify_payload(false, &th);
            let signature = provider.sign(
                cred.private_key.key_type,
                &cred.private_key.der,
                scheme.0,
                &payload,
            )?;
            let cv = encode_certificate_verify(&CertificateVerifyMsg {
                algorithm: scheme,
                signature,
            });
            self.transcript.update(&cv)?;
            out.push(cv);
        }
        Ok(out)
    }

    fn on_new_session_ticket(&mut self, body: &[u8]) -> Result<Flight, TlsError> {
        let msg = decode_new_session_ticket(body)?;
        let params = self
            .params
            .clone()
            .ok_or_else(|| TlsError::Internal("no negotiated suite".into()))?;
        let schedule = self
            .schedule
            .as_ref()
            .ok_or_else(|| TlsError::Internal("no key schedule".into()))?;
        let psk = schedule.derive_resumption_psk(
            self.config.crypto.as_ref(),
            &self.resumption_master_secret,
            &msg.ticket_nonce,
        )?;
        let session = Arc::new(Session {
            version: TlsVersion::Tls13,
            cipher_suite: params.suite,
            master_secret: psk,
            session_id: Vec::new(),
            ticket: Some(msg.ticket),
            session_id_context: self.config.session_id_context.clone(),
            extended_master_secret: false,
            server_name: self.config.server_name.clone(),
            peer_certs: self.server_cert_chain.clone(),
            auth_id_hash: self.peer_auth_hash()?,
            lifetime: (msg.ticket_lifetime as u64).min(604800),
            created_at: unix_now(),
            ticket_age_add: msg.ticket_age_add,
        });
        Ok(Flight {
            items: Vec::new(),
            status: FlightStatus::Complete,
            session: Some(session),
        })
    }

    fn peer_auth_hash(&self) -> Result<Vec<u8>, TlsError> {
        let params = self
            .params
            .as_ref()
            .ok_or_else(|| TlsError::Internal("no negotiated suite".into()))?;
        let mut h = self.config.crypto.hash_new(params.hash)?;
        if let Some(leaf) = self.server_cert_chain.first() {
            h.update(leaf.der())?;
        } else if let Some(psk) = &self.offered_psk {
            h.update(&psk.identity)?;
        }
        let mut out = vec![0u8; params.hash_len()];
        h.finish(&mut out)?;
        Ok(out)
    }

    fn on_key_update(&mut self, body: &[u8]) -> Result<Flight, TlsError> {
        let msg = decode_key_update(body)?;
        let provider = Arc::clone(&self.config.crypto);
        let params = self
            .params
            .clone()
            .ok_or_else(|| TlsError::Internal("no negotiated suite".into()))?;

        let new_read = update_traffic_secret(provider.as_ref(), params.hash, &self.server_app_secret)?;
        self.server_app_secret.zeroize();
        self.server_app_secret = new_read.clone();
        self.read_epoch += 1;
        let mut flight = Flight::in_progress();
        flight.status = FlightStatus::Complete;
        flight.push_command(RecordCommand::SetKey {
            direction: KeyDirection::Read,
            epoch: EPOCH_APP + (self.read_epoch - EPOCH_HANDSHAKE),
            suite: params.suite,
            secret: new_read,
        });

        if msg.update_requested {
            // Our answering KeyUpdate still travels under the old
            // write keys; they rotate right after it.
            flight.push_message(encode_key_update(&KeyUpdateMsg {
                update_requested: false,
            }));
            let new_write =
                update_traffic_secret(provider.as_ref(), params.hash, &self.client_app_secret)?;
            self.client_app_secret.zeroize();
            self.client_app_secret = new_write.clone();
            self.write_epoch += 1;
            flight.push_command(RecordCommand::SetKey {
                direction: KeyDirection::Write,
                epoch: EPOCH_APP + (self.write_epoch - EPOCH_HANDSHAKE),
                suite: params.suite,
                secret: new_write,
            });
            flight.push_command(RecordCommand::Flush);
        }
        Ok(flight)
    }

    /// Application-initiated KeyUpdate.
    pub fn initiate_key_update(&mut self, update_requested: bool) -> Result<Flight, TlsError> {
        if self.state != HandshakeState::Connected {
            return Err(TlsError::Internal("key update before connection".into()));
        }
        let provider = Arc::clone(&self.config.crypto);
        let params = self
            .params
            .clone()
            .ok_or_else(|| TlsError::Internal("no negotiated suite".into()))?;
        let msg = encode_key_update(&KeyUpdateMsg { update_requested });
        let new_write =
            update_traffic_secret(provider.as_ref(), params.hash, &self.client_app_secret)?;
        self.client_app_secret.zeroize();
        self.client_app_secret = new_write.clone();
        self.write_epoch += 1;
        let mut flight = Flight::in_progress();
        flight.status = FlightStatus::Complete;
        flight.push_message(msg);
        flight.push_command(RecordCommand::SetKey {
            direction: KeyDirection::Write,
            epoch: EPOCH_APP + (self.write_epoch - EPOCH_HANDSHAKE),
            suite: params.suite,
            secret: new_write,
        });
        flight.push_command(RecordCommand::Flush);
        Ok(flight)
    }

    fn on_post_handshake_cert_request(
        &mut self,
        body: &[u8],
        raw: &[u8],
    ) -> Result<Flight, TlsError> {
        if !self.config.post_handshake_auth {
            return Err(TlsError::UnexpectedMessage(
                "post-handshake CertificateRequest without post_handshake_auth".into(),
            ));
        }
        let cr = decode_certificate_request(body)?;
        if cr.certificate_request_context.is_empty() {
            return Err(TlsError::IllegalParameter(
                "post-handshake CertificateRequest needs a non-empty context".into(),
            ));
        }
        let provider = Arc::clone(&self.config.crypto);

        // Reauthentication runs over a fork of the connection
        // transcript extended with the request; the main transcript is
        // left untouched.
        let mut fork = self.transcript.fork();
        fork.update(raw)?;

        let saved = std::mem::replace(&mut self.transcript, fork);
        let flight = self.build_client_auth_flight(&cr.certificate_request_context, &cr);
        let mut fork = std::mem::replace(&mut self.transcript, saved);
        let mut messages = flight?;

        let schedule = self
            .schedule
            .as_ref()
            .ok_or_else(|| TlsError::Internal("no key schedule".into()))?;
        let th = fork.digest()?;
        let vd = compute_finished13(
            provider.as_ref(),
            schedule,
            &self.client_app_secret,
            &th,
        )?;
        let fin = encode_finished(&vd);
        fork.update(&fin)?;
        messages.push(fin);
        let mut flight = Flight::in_progress();
        flight.status = FlightStatus::Complete;
        for msg in messages {
            flight.push_message(msg);
        }
        flight.push_command(RecordCommand::Flush);
        Ok(flight)
    }

    fn key_log(&self, label: &str, secret: &[u8]) {
        if let Some(cb) = &self.config.key_log {
            let hex = |b: &[u8]| -> String {
                b.iter().map(|x| format!("{x:02x}")).collect()
            };
            cb(&format!(
                "{label} {} {}",
                hex(&self.client_random),
                hex(secret)
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::codec::decode_client_hello;
    use crate::testing::{MockCertProvider, MockProvider};

    fn config() -> Arc<TlsConfig> {
        Arc::new(
            TlsConfig::builder(Arc::new(MockProvider::new()), Arc::new(MockCertProvider))
                .server_name("test.example")
                .alpn_protocols(vec![b"h2".to_vec()])
                .build(),
        )
    }

    #[test]
    fn test_start_builds_well_formed_client_hello() {
        let mut client = ClientHandshake13::new(config());
        let flight = client.start().unwrap();
        let messages: Vec<&[u8]> = flight.messages().collect();
        assert_eq!(messages.len(), 1);
        assert_eq!(client.state(), HandshakeState::WaitServerHello);

        let (ty, body, _) = parse_handshake_header(messages[0]).unwrap();
        assert_eq!(ty, HandshakeType::ClientHello);
        let ch = decode_client_hello(body, false).unwrap();
        assert!(ch.has_extension(ExtensionType::SUPPORTED_VERSIONS));
        assert!(ch.has_extension(ExtensionType::KEY_SHARE));
        assert!(ch.has_extension(ExtensionType::SUPPORTED_GROUPS));
        assert!(ch.has_extension(ExtensionType::SIGNATURE_ALGORITHMS));
        assert!(ch.has_extension(ExtensionType::SERVER_NAME));
        assert!(ch.offers_scsv());
        assert_eq!(ch.session_id.len(), 32);
        // CCS tolerance is enabled with the first hello.
        assert!(flight
            .commands()
            .any(|c| matches!(c, RecordCommand::EnableCcsReception)));
    }

    #[test]
    fn test_external_psk_offer_is_last_and_bound() {
        let cfg = Arc::new(
            TlsConfig::builder(Arc::new(MockProvider::new()), Arc::new(MockCertProvider))
                .external_psk(b"demo".to_vec(), vec![0x11; 32])
                .build(),
        );
        let mut client = ClientHandshake13::new(cfg);
        let flight = client.start().unwrap();
        let messages: Vec<&[u8]> = flight.messages().collect();
        let (_, body, _) = parse_handshake_header(messages[0]).unwrap();
        let ch = decode_client_hello(body, false).unwrap();
        assert_eq!(
            ch.extensions.last().unwrap().extension_type,
            ExtensionType::PRE_SHARED_KEY
        );
        assert!(ch.has_extension(ExtensionType::PSK_KEY_EXCHANGE_MODES));
        // Binder offset points inside the message.
        let off = ch.binders_offset.unwrap();
        assert!(off < messages[0].len());
        // The binder bytes are non-zero (placeholder was patched).
        assert_ne!(&messages[0][off + 3..], vec![0u8; 32].as_slice());
    }

    #[test]
    fn test_unexpected_message_is_fatal() {
        let mut client = ClientHandshake13::new(config());
        client.start().unwrap();
        let fin = encode_finished(&[0; 32]);
        let err = client.on_message(&fin).unwrap_err();
        assert!(matches!(err, TlsError::UnexpectedMessage(_)));
    }

    #[test]
    fn test_key_update_before_connected_fails() {
        let mut client = ClientHandshake13::new(config());
        assert!(client.initiate_key_update(false).is_err());
    }
}
