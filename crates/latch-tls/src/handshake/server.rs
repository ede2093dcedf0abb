//! TLS 1.3 server handshake state machine.
//!
//! ClientHello → ServerHello + {EncryptedExtensions} + {Certificate} +
//! {CertificateVerify} + {Finished} → client {Finished}, with
//! HelloRetryRequest, PSK selection (first resolvable identity, binder
//! checked in constant time), client authentication, NewSessionTicket
//! issuance, KeyUpdate, and post-handshake client reauthentication.

use std::sync::Arc;

use latch_types::{KeyUsage, TlsError};
use zeroize::Zeroize;

use crate::alert::AlertDescription;
use crate::config::{InspectAction, SniAction, TlsConfig};
use crate::crypt::key_schedule::{update_traffic_secret, KeySchedule};
use crate::crypt::transcript::TranscriptHash;
use crate::crypt::{CipherSuiteParams, NamedGroup};
use crate::extensions::{Extension, ExtensionType};
use crate::provider::{CertHandle, KeyDirection, RecordCommand};
use crate::session::{unix_now, Session};
use crate::{CipherSuite, LibContext, TlsVersion};

use super::codec::{
    decode_certificate, decode_certificate_verify, decode_client_hello, decode_finished,
    decode_key_update, encode_certificate, encode_certificate_request, encode_certificate_verify,
    encode_encrypted_extensions, encode_finished, encode_key_update, encode_new_session_ticket,
    encode_server_hello, parse_handshake_header, CertificateEntry, CertificateMsg,
    CertificateRequestMsg, CertificateVerifyMsg, ClientHello, EncryptedExtensions, KeyUpdateMsg,
    NewSessionTicketMsg, ServerHello, HELLO_RETRY_REQUEST_RANDOM,
};
use super::extensions_codec::{
    build_alpn_selected, build_key_share_hrr, build_key_share_sh, build_pre_shared_key_sh,
    build_signature_algorithms, build_supported_versions_sh, parse_alpn, parse_key_share_ch,
    parse_pre_shared_key_ch, parse_psk_key_exchange_modes, parse_server_name,
    parse_signature_algorithms, parse_supported_groups, PskIdentity,
};
use super::key_exchange::KeyExchange;
use super::negotiate::{
    negotiate_psk_modes, process_key_share, select_alpn, select_signature_scheme,
    select_tls13_cipher_suite, select_version, KeyShareOutcome, PskModes,
};
use super::verify::{check_binder, check_finished13, compute_finished13, tls13_certificate_verify_payload};
use super::{DowngradeContext, Flight, FlightStatus, HandshakeState, HandshakeType};

const EPOCH_HANDSHAKE: u16 = 2;
const EPOCH_APP: u16 = 3;

/// The PSK the server accepted.
struct SelectedPsk {
    psk: Vec<u8>,
    index: u16,
    external: bool,
    resumed: Option<Arc<Session>>,
}

impl Drop for SelectedPsk {
    fn drop(&mut self) {
        self.psk.zeroize();
    }
}

/// Post-handshake reauthentication in flight.
struct PendingReauth {
    transcript: TranscriptHash,
    context: Vec<u8>,
    cert_chain: Vec<CertHandle>,
}

pub struct ServerHandshake13 {
    config: Arc<TlsConfig>,
    lib_ctx: LibContext,
    state: HandshakeState,
    transcript: TranscriptHash,
    schedule: Option<KeySchedule>,
    params: Option<CipherSuiteParams>,
    client_random: [u8; 32],
    session_id_echo: Vec<u8>,
    hrr_group: Option<NamedGroup>,
    psk: Option<SelectedPsk>,
    client_hs_secret: Vec<u8>,
    server_hs_secret: Vec<u8>,
    client_app_secret: Vec<u8>,
    server_app_secret: Vec<u8>,
    exporter_secret: Vec<u8>,
    resumption_master_secret: Vec<u8>,
    negotiated_alpn: Option<Vec<u8>>,
    sni_hostname: Option<String>,
    client_cert_chain: Vec<CertHandle>,
    client_cert_requested: bool,
    client_offered_psk_modes: bool,
    /// ClientHello parked while the inspection callback decides.
    pending_hello: Option<Vec<u8>>,
    pending_reauth: Option<PendingReauth>,
    reauth_counter: u8,
    ticket_counter: u8,
    read_epoch: u16,
    write_epoch: u16,
}

impl Drop for ServerHandshake13 {
    fn drop(&mut self) {
        self.client_hs_secret.zeroize();
        self.server_hs_secret.zeroize();
        self.client_app_secret.zeroize();
        self.server_app_secret.zeroize();
        self.exporter_secret.zeroize();
        self.resumption_master_secret.zeroize();
    }
}

impl ServerHandshake13 {
    pub fn new(config: Arc<TlsConfig>, lib_ctx: LibContext) -> Self {
        Self {
            config,
            lib_ctx,
            state: HandshakeState::WaitClientHello,
            transcript: TranscriptHash::new(),
            schedule: None,
            params: None,
            client_random: [0; 32],
            session_id_echo: Vec::new(),
            hrr_group: None,
            psk: None,
            client_hs_secret: Vec::new(),
            server_hs_secret: Vec::new(),
            client_app_secret: Vec::new(),
            server_app_secret: Vec::new(),
            exporter_secret: Vec::new(),
            resumption_master_secret: Vec::new(),
            negotiated_alpn: None,
            sni_hostname: None,
            client_cert_chain: Vec::new(),
            client_cert_requested: false,
            client_offered_psk_modes: false,
            pending_hello: None,
            pending_reauth: None,
            reauth_counter: 0,
            ticket_counter: 0,
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

    pub fn sni_hostname(&self) -> Option<&str> {
        self.sni_hostname.as_deref()
    }

    pub fn exporter_secret(&self) -> &[u8] {
        &self.exporter_secret
    }

    pub fn resumed(&self) -> bool {
        self.psk.as_ref().map(|p| !p.external).unwrap_or(false)
    }

    /// Feed one complete handshake message.
    pub fn on_message(&mut self, raw: &[u8]) -> Result<Flight, TlsError> {
        let (msg_type, body, consumed) = parse_handshake_header(raw)?;
        if consumed != raw.len() {
            return Err(TlsError::Decode("trailing bytes after handshake".into()));
        }
        match (self.state, msg_type) {
            (
                HandshakeState::WaitClientHello | HandshakeState::WaitClientHelloRetry,
                HandshakeType::ClientHello,
            ) => self.on_client_hello(raw),
            (HandshakeState::WaitClientCert, HandshakeType::Certificate) => {
                self.on_client_certificate(body, raw)
            }
            (HandshakeState::WaitClientCertVerify, HandshakeType::CertificateVerify) => {
                self.on_client_cert_verify(body, raw)
            }
            (HandshakeState::WaitClientFinished, HandshakeType::Finished) => {
                self.on_client_finished(body, raw)
            }
            (HandshakeState::Connected, HandshakeType::KeyUpdate) => self.on_key_update(body),
            (HandshakeState::Connected, HandshakeType::Certificate) => {
                self.on_reauth_certificate(body, raw)
            }
            (HandshakeState::Connected, HandshakeType::CertificateVerify) => {
                self.on_reauth_cert_verify(body, raw)
            }
            (HandshakeState::Connected, HandshakeType::Finished) => {
                self.on_reauth_finished(body, raw)
            }
            (state, ty) => Err(TlsError::UnexpectedMessage(format!(
                "{ty:?} in state {state:?}"
            ))),
        }
    }

    /// Re-enter after the ClientHello inspection callback resolved.
    pub fn resume_client_hello(&mut self) -> Result<Flight, TlsError> {
        let raw = self.pending_hello.take().ok_or_else(|| {
            TlsError::Internal("no suspended ClientHello to resume".into())
        })?;
        self.process_client_hello(&raw, true)
    }

    fn on_client_hello(&mut self, raw: &[u8]) -> Result<Flight, TlsError> {
        self.process_client_hello(raw, false)
    }

    fn process_client_hello(&mut self, raw: &[u8], resumed_callback: bool) -> Result<Flight, TlsError> {
        let (_, body, _) = parse_handshake_header(raw)?;
        let ch = decode_client_hello(body, false)?;

        if !resumed_callback {
            match self.inspect_action(&ch) {
                InspectAction::Proceed => {}
                InspectAction::Suspend => {
                    self.pending_hello = Some(raw.to_vec());
                    return Ok(Flight {
                        items: Vec::new(),
                        status: FlightStatus::NeedsCertCallback,
                        session: None,
                    });
                }
                InspectAction::Fatal(alert) => return Err(alert_to_error(alert)),
            }
        }

        let version = select_version(&self.config, &ch)?;
        if version != TlsVersion::Tls13 {
            return Ok(Flight {
                items: Vec::new(),
                status: FlightStatus::Downgrade(Box::new(DowngradeContext {
                    version,
                    trigger_raw: raw.to_vec(),
                    client: None,
                })),
                session: None,
            });
        }

        // TLS 1.3 requires the compression list to be exactly [0].
        if ch.compression_methods != [0] {
            return Err(TlsError::IllegalParameter(
                "TLS 1.3 ClientHello compression must be [0]".into(),
            ));
        }

        self.client_random = ch.random;
        self.session_id_echo = ch.session_id.clone();

        let suite = select_tls13_cipher_suite(&self.config, &ch.cipher_suites)?;
        let params = CipherSuiteParams::from_suite(suite)?;
        if let Some(prev) = &self.params {
            if prev.suite != suite {
                return Err(TlsError::IllegalParameter(
                    "cipher suite changed between hellos".into(),
                ));
            }
        }
        self.transcript
            .select_hash(self.config.crypto.as_ref(), params.hash)?;
        self.params = Some(params.clone());

        // SNI
        if let Some(data) = ch.find_extension(ExtensionType::SERVER_NAME) {
            let name = parse_server_name(data)?;
            match &self.config.sni_select {
                Some(cb) => match cb(&name) {
                    SniAction::Ok => self.sni_hostname = Some(name),
                    SniAction::NoAck => {}
                    SniAction::Fatal(alert) => return Err(alert_to_error(alert)),
                },
                None => self.sni_hostname = Some(name),
            }
        }

        // ALPN
        if let Some(data) = ch.find_extension(ExtensionType::APPLICATION_LAYER_PROTOCOL_NEGOTIATION)
        {
            let offered = parse_alpn(data)?;
            self.negotiated_alpn = select_alpn(&self.config, &offered)?;
        }

        // supported_groups / key_share prerequisites
        let groups = match ch.find_extension(ExtensionType::SUPPORTED_GROUPS) {
            Some(data) => parse_supported_groups(data)?,
            None => Vec::new(),
        };
        let key_shares = match ch.find_extension(ExtensionType::KEY_SHARE) {
            Some(data) => {
                if groups.is_empty() {
                    return Err(TlsError::MissingExtension(
                        "key_share without supported_groups".into(),
                    ));
                }
                Some(parse_key_share_ch(data)?)
            }
            None => None,
        };

        // PSK selection (identities resolved in order; binder of the
        // first resolvable identity verified before anything else).
        let psk_modes = match ch.find_extension(ExtensionType::PSK_KEY_EXCHANGE_MODES) {
            Some(data) => {
                self.client_offered_psk_modes = true;
                let client = negotiate_psk_modes(&parse_psk_key_exchange_modes(data)?);
                let local = negotiate_psk_modes(&self.config.tls13_psk_modes);
                PskModes {
                    psk_ke: client.psk_ke && local.psk_ke,
                    psk_dhe_ke: client.psk_dhe_ke && local.psk_dhe_ke,
                }
            }
            None => PskModes::none(),
        };
        if let Some(data) = ch.find_extension(ExtensionType::PRE_SHARED_KEY) {
            if !self.client_offered_psk_modes {
                return Err(TlsError::MissingExtension(
                    "pre_shared_key without psk_key_exchange_modes".into(),
                ));
            }
            let (identities, binders) = parse_pre_shared_key_ch(data)?;
            let binders_offset = ch
                .binders_offset
                .ok_or_else(|| TlsError::Internal("binders offset not recorded".into()))?;
            self.select_psk(&params, &identities, &binders, &raw[..binders_offset])?;
        }

        // Key share: PSK-only short-circuits the DHE requirement.
        let mut shared = Vec::new();
        let mut server_share: Option<(NamedGroup, Vec<u8>)> = None;
        let psk_only_ok = self.psk.is_some() && psk_modes.psk_ke && !psk_modes.psk_dhe_ke;
        let want_dhe = !psk_only_ok;
        if want_dhe {
            let key_shares = match &key_shares {
                Some(ks) => ks.as_slice(),
                None if self.psk.is_some() && psk_modes.psk_ke => &[],
                None => {
                    return Err(TlsError::HandshakeFailure(
                        "no key_share and no usable PSK mode".into(),
                    ))
                }
            };
            if key_shares.is_empty() && self.psk.is_some() && psk_modes.psk_ke {
                // Fall back to PSK-only.
            } else {
                match process_key_share(&self.config, &groups, key_shares, self.hrr_group)? {
                    KeyShareOutcome::Accept { group, peer_public } => {
                        let kx = KeyExchange::generate(self.config.crypto.as_ref(), group)?;
                        shared = kx.derive(&peer_public)?.0.clone();
                        server_share = Some((group, kx.public_bytes().to_vec()));
                    }
                    KeyShareOutcome::NeedHelloRetry(group) => {
                        if self.psk.is_some() && psk_modes.psk_ke {
                            // PSK-only is still viable; avoid the round trip.
                        } else {
                            return self.send_hello_retry_request(raw, group, &params);
                        }
                    }
                }
            }
        }

        if self.psk.is_none() && server_share.is_none() {
            return Err(TlsError::HandshakeFailure(
                "neither PSK nor key_share usable".into(),
            ));
        }

        // Certificate-authenticated handshakes require
        // signature_algorithms.
        let peer_sig_schemes = match ch.find_extension(ExtensionType::SIGNATURE_ALGORITHMS) {
            Some(data) => parse_signature_algorithms(data)?,
            None if self.psk.is_none() => {
                return Err(TlsError::MissingExtension(
                    "signature_algorithms required for certificate authentication".into(),
                ))
            }
            None => Vec::new(),
        };

        self.transcript.update(raw)?;
        self.build_server_flight(&params, shared, server_share, &peer_sig_schemes)
    }

    fn inspect_action(&self, ch: &ClientHello) -> InspectAction {
        match &self.config.client_hello_inspect {
            Some(cb) => cb(ch),
            None => InspectAction::Proceed,
        }
    }

    /// Resolve PSK identities in offer order: the find-session hook,
    /// then the external store, then ticket decryption. The first hit
    /// wins and later identities are never examined.
    fn select_psk(
        &mut self,
        params: &CipherSuiteParams,
        identities: &[PskIdentity],
        binders: &[Vec<u8>],
        truncated_hello: &[u8],
    ) -> Result<(), TlsError> {
        let now = unix_now();
        for (index, identity) in identities.iter().enumerate() {
            let mut resolved: Option<(Vec<u8>, bool, Option<Arc<Session>>)> = None;

            if let Some(cb) = &self.config.psk_find_session {
                if let Some(session) = cb(&identity.identity) {
                    if session.is_resumable(
                        now,
                        Some(params.hash),
                        &self.config.session_id_context,
                        None,
                    ) {
                        resolved = Some((session.master_secret.clone(), false, Some(session)));
                    }
                }
            }
            if resolved.is_none() {
                if let Some(psk) = self
                    .config
                    .external_psks
                    .iter()
                    .find(|p| p.identity == identity.identity)
                {
                    resolved = Some((psk.key.clone(), true, None));
                } else if let Some(cb) = &self.config.psk_server_find {
                    if let Some(key) = cb(&identity.identity) {
                        resolved = Some((key, true, None));
                    }
                }
            }
            if resolved.is_none() {
                let (session, _needs_renew) = self.lib_ctx.ticket_keys().decrypt_ticket(
                    self.config.crypto.as_ref(),
                    &identity.identity,
                    now,
                )?;
                if let Some(session) = session {
                    let session = Arc::new(session);
                    if session.is_resumable(
                        now,
                        Some(params.hash),
                        &self.config.session_id_context,
                        None,
                    ) && session.check_obfuscated_age(now, identity.obfuscated_ticket_age)
                    {
                        resolved = Some((session.master_secret.clone(), false, Some(session)));
                    }
                }
            }

            let (psk, external, resumed) = match resolved {
                Some(r) => r,
                None => continue,
            };
            let truncated_hash = self.transcript.digest_with(truncated_hello)?;
            check_binder(
                self.config.crypto.as_ref(),
                params,
                &psk,
                external,
                &truncated_hash,
                &binders[index],
            )?;
            self.psk = Some(SelectedPsk {
                psk,
                index: index as u16,
                external,
                resumed,
            });
            return Ok(());
        }
        // No identity resolved: continue with a full handshake.
        Ok(())
    }

    fn send_hello_retry_request(
        &mut self,
        ch_raw: &[u8],
        group: NamedGroup,
        params: &CipherSuiteParams,
    ) -> Result<Flight, TlsError> {
        if self.hrr_group.is_some() {
            return Err(TlsError::IllegalParameter(
                "client ignored HelloRetryRequest".into(),
            ));
        }
        // The first hello enters the transcript as message_hash(CH1).
        self.transcript.update(ch_raw)?;
        self.transcript
            .hrr_reset(self.config.crypto.as_ref(), params.hash)?;

        let hrr = ServerHello {
            legacy_version: TlsVersion::Tls12.wire(),
            random: HELLO_RETRY_REQUEST_RANDOM,
            session_id: self.session_id_echo.clone(),
            cipher_suite: params.suite,
            compression_method: 0,
            extensions: vec![
                build_supported_versions_sh(TlsVersion::Tls13.wire()),
                build_key_share_hrr(group),
            ],
        };
        let msg = encode_server_hello(&hrr)?;
        self.transcript.update(&msg)?;
        self.hrr_group = Some(group);
        self.psk = None; // re-selected against the second hello
        self.state = HandshakeState::WaitClientHelloRetry;
        let mut flight = Flight::in_progress();
        flight.push_command(RecordCommand::EnableCcsReception);
        flight.push_message(msg);
        flight.push_command(RecordCommand::WriteCcs);
        flight.push_command(RecordCommand::Flush);
        Ok(flight)
    }

    fn build_server_flight(
        &mut self,
        params: &CipherSuiteParams,
        mut shared: Vec<u8>,
        server_share: Option<(NamedGroup, Vec<u8>)>,
        peer_sig_schemes: &[crate::crypt::SignatureScheme],
    ) -> Result<Flight, TlsError> {
        let provider = Arc::clone(&self.config.crypto);
        let mut flight = Flight::in_progress();
        flight.push_command(RecordCommand::EnableCcsReception);

        let mut server_random = [0u8; 32];
        provider.drbg_random(&mut server_random)?;

        let mut sh_extensions = vec![build_supported_versions_sh(TlsVersion::Tls13.wire())];
        if let Some((group, public)) = &server_share {
            sh_extensions.push(build_key_share_sh(*group, public));
        }
        if let Some(psk) = &self.psk {
            sh_extensions.push(build_pre_shared_key_sh(psk.index));
        }
        let sh = ServerHello {
            legacy_version: TlsVersion::Tls12.wire(),
            random: server_random,
            session_id: self.session_id_echo.clone(),
            cipher_suite: params.suite,
            compression_method: 0,
            extensions: sh_extensions,
        };
        let sh_msg = encode_server_hello(&sh)?;
        self.transcript.update(&sh_msg)?;
        flight.push_message(sh_msg);
        if self.hrr_group.is_none() {
            flight.push_command(RecordCommand::WriteCcs);
        }

        // Key schedule through the handshake secrets.
        let mut schedule = KeySchedule::new(params);
        schedule.derive_early_secret(
            provider.as_ref(),
            self.psk.as_ref().map(|p| p.psk.as_slice()),
        )?;
        schedule.derive_handshake_secret(provider.as_ref(), &shared)?;
        shared.zeroize();
        let th = self.transcript.digest()?;
        let (client_hs, server_hs) =
            schedule.derive_handshake_traffic_secrets(provider.as_ref(), &th)?;
        flight.push_command(RecordCommand::SetKey {
            direction: KeyDirection::Write,
            epoch: EPOCH_HANDSHAKE,
            suite: params.suite,
            secret: server_hs.clone(),
        });
        flight.push_command(RecordCommand::SetKey {
            direction: KeyDirection::Read,
            epoch: EPOCH_HANDSHAKE,
            suite: params.suite,
            secret: client_hs.clone(),
        });
        self.key_log("CLIENT_HANDSHAKE_TRAFFIC_SECRET", &client_hs);
        self.key_log("SERVER_HANDSHAKE_TRAFFIC_SECRET", &server_hs);

        // EncryptedExtensions
        let mut ee_extensions: Vec<Extension> = Vec::new();
        if self.sni_hostname.is_some() {
            ee_extensions.push(Extension::new(ExtensionType::SERVER_NAME, Vec::new()));
        }
        if let Some(proto) = &self.negotiated_alpn {
            ee_extensions.push(build_alpn_selected(proto));
        }
        let ee_msg = encode_encrypted_extensions(&EncryptedExtensions {
            extensions: ee_extensions,
        })?;
        self.transcript.update(&ee_msg)?;
        flight.push_message(ee_msg);

        // Certificate path unless a PSK authenticated the peer.
        if self.psk.is_none() {
            if self.config.client_auth != crate::config::ClientAuth::None {
                self.client_cert_requested = true;
                let cr = encode_certificate_request(&CertificateRequestMsg {
                    certificate_request_context: Vec::new(),
                    extensions: vec![build_signature_algorithms(
                        &self.config.signature_algorithms,
                    )],
                })?;
                self.transcript.update(&cr)?;
                flight.push_message(cr);
            }

            let credential = self
                .config
                .credentials
                .first()
                .cloned()
                .ok_or_else(|| TlsError::HandshakeFailure("no server credential".into()))?;
            let scheme = select_signature_scheme(
                &self.config,
                peer_sig_schemes,
                credential.private_key.key_type,
                true,
            )?;
            let entries = credential
                .chain
                .iter()
                .map(|der| CertificateEntry {
                    cert_data: der.clone(),
                    extensions: Vec::new(),
                })
                .collect();
            let cert_msg = encode_certificate(&CertificateMsg {
                certificate_request_context: Vec::new(),
                certificate_list: entries,
            })?;
            self.transcript.update(&cert_msg)?;
            flight.push_message(cert_msg);

            let th = self.transcript.digest()?;
            let payload = tls13_certificate_verify_payload(true, &th);
            let signature = provider.sign(
                credential.private_key.key_type,
                &credential.private_key.der,
                scheme.0,
                &payload,
            )?;
            let cv = encode_certificate_verify(&CertificateVerifyMsg {
                algorithm: scheme,
                signature,
            });
            self.transcript.update(&cv)?;
            flight.push_message(cv);
        }

        // Server Finished
        let th = self.transcript.digest()?;
        let vd = compute_finished13(provider.as_ref(), &schedule, &server_hs, &th)?;
        let fin = encode_finished(&vd);
        self.transcript.update(&fin)?;
        flight.push_message(fin);

        // Application secrets become available at the server Finished.
        schedule.derive_master_secret(provider.as_ref())?;
        let th_sf = self.transcript.digest()?;
        let (client_app, server_app) =
            schedule.derive_app_traffic_secrets(provider.as_ref(), &th_sf)?;
        self.exporter_secret =
            schedule.derive_exporter_master_secret(provider.as_ref(), &th_sf)?;
        flight.push_command(RecordCommand::SetKey {
            direction: KeyDirection::Write,
            epoch: EPOCH_APP,
            suite: params.suite,
            secret: server_app.clone(),
        });
        flight.push_command(RecordCommand::Flush);
        self.key_log("CLIENT_TRAFFIC_SECRET_0", &client_app);
        self.key_log("SERVER_TRAFFIC_SECRET_0", &server_app);

        self.client_hs_secret = client_hs;
        self.server_hs_secret = server_hs;
        self.client_app_secret = client_app;
        self.server_app_secret = server_app;
        self.schedule = Some(schedule);
        self.state = if self.client_cert_requested {
            HandshakeState::WaitClientCert
        } else {
            HandshakeState::WaitClientFinished
        };
        Ok(flight)
    }

    fn verify_client_chain(&self, msg: &CertificateMsg) -> Result<Vec<CertHandle>, TlsError> {
        let mut chain = Vec::with_capacity(msg.certificate_list.len());
        for entry in &msg.certificate_list {
            chain.push(self.config.certs.parse(&entry.cert_data)?);
        }
        let result =
            self.config
                .certs
                .verify_chain(&chain, None, KeyUsage::DigitalSignature, unix_now());
        let default_ok = result.is_ok();
        let accepted = match &self.config.cert_verify_override {
            Some(cb) => {
                let ders: Vec<Vec<u8>> = chain.iter().map(|c| c.der().to_vec()).collect();
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
        Ok(chain)
    }

    fn on_client_certificate(&mut self, body: &[u8], raw: &[u8]) -> Result<Flight, TlsError> {
        let msg = decode_certificate(body)?;
        if !msg.certificate_request_context.is_empty() {
            return Err(TlsError::IllegalParameter(
                "client Certificate context must be empty in-handshake".into(),
            ));
        }
        if msg.certificate_list.is_empty() {
            if self.config.client_auth == crate::config::ClientAuth::Required {
                return Err(TlsError::CertificateRequired);
            }
            self.transcript.update(raw)?;
            self.state = HandshakeState::WaitClientFinished;
            return Ok(Flight::in_progress());
        }
        self.client_cert_chain = self.verify_client_chain(&msg)?;
        self.transcript.update(raw)?;
        self.state = HandshakeState::WaitClientCertVerify;
        Ok(Flight::in_progress())
    }

    fn on_client_cert_verify(&mut self, body: &[u8], raw: &[u8]) -> Result<Flight, TlsError> {
        let msg = decode_certificate_verify(body)?;
        let leaf = self
            .client_cert_chain
            .first()
            .ok_or_else(|| TlsError::Internal("CertificateVerify without certificate".into()))?;
        if !msg.algorithm.tls13_allowed() {
            return Err(TlsError::IllegalParameter(
                "CertificateVerify signature scheme".into(),
            ));
        }
        let th = self.transcript.digest()?;
        let payload = tls13_certificate_verify_payload(false, &th);
        self.config
            .crypto
            .verify(&leaf.public_key(), msg.algorithm.0, &payload, &msg.signature)
            .map_err(|_| TlsError::DecryptError("CertificateVerify signature".into()))?;
        self.transcript.update(raw)?;
        self.state = HandshakeState::WaitClientFinished;
        Ok(Flight::in_progress())
    }

    fn on_client_finished(&mut self, body: &[u8], raw: &[u8]) -> Result<Flight, TlsError> {
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
                &self.client_hs_secret,
                &th,
                &fin.verify_data,
            )?;
        }
        self.transcript.update(raw)?;

        let schedule = self
            .schedule
            .as_ref()
            .ok_or_else(|| TlsError::Internal("no key schedule".into()))?;
        let th_full = self.transcript.digest()?;
        self.resumption_master_secret =
            schedule.derive_resumption_master_secret(provider.as_ref(), &th_full)?;

        let mut flight = Flight::in_progress();
        flight.status = FlightStatus::Complete;
        flight.push_command(RecordCommand::SetKey {
            direction: KeyDirection::Read,
            epoch: EPOCH_APP,
            suite: params.suite,
            secret: self.client_app_secret.clone(),
        });
        flight.push_command(RecordCommand::DisableCcsReception);

        // Ticket issuance: only useful to clients that can do PSK.
        if self.config.ticket_support
            && self.client_offered_psk_modes
            && self.lib_ctx.ticket_keys().has_key()
        {
            let (nst, session) = self.build_new_session_ticket(&params)?;
            flight.push_message(nst);
            flight.push_command(RecordCommand::Flush);
            flight.session = Some(session);
        }

        self.state = HandshakeState::Connected;
        Ok(flight)
    }

    fn build_new_session_ticket(
        &mut self,
        params: &CipherSuiteParams,
    ) -> Result<(Vec<u8>, Arc<Session>), TlsError> {
        let provider = Arc::clone(&self.config.crypto);
        let schedule = self
            .schedule
            .as_ref()
            .ok_or_else(|| TlsError::Internal("no key schedule".into()))?;
        let nonce = vec![self.ticket_counter];
        self.ticket_counter = self.ticket_counter.wrapping_add(1);
        let psk = schedule.derive_resumption_psk(
            provider.as_ref(),
            &self.resumption_master_secret,
            &nonce,
        )?;
        let mut age_add = [0u8; 4];
        provider.drbg_random(&mut age_add)?;
        let age_add = u32::from_be_bytes(age_add);

        let mut session = Session {
            version: TlsVersion::Tls13,
            cipher_suite: params.suite,
            master_secret: psk,
            session_id: Vec::new(),
            ticket: None,
            session_id_context: self.config.session_id_context.clone(),
            extended_master_secret: false,
            server_name: self.sni_hostname.clone(),
            peer_certs: self.client_cert_chain.clone(),
            auth_id_hash: Vec::new(),
            lifetime: 7200,
            created_at: unix_now(),
            ticket_age_add: age_add,
        };
        let ticket = self
            .lib_ctx
            .ticket_keys()
            .encrypt_ticket(provider.as_ref(), &session)?;
        session.ticket = Some(ticket.clone());

        let msg = encode_new_session_ticket(&NewSessionTicketMsg {
            ticket_lifetime: session.lifetime as u32,
            ticket_age_add: age_add,
            ticket_nonce: nonce,
            ticket,
            extensions: Vec::new(),
        })?;
        Ok((msg, Arc::new(session)))
    }

    fn on_key_update(&mut self, body: &[u8]) -> Result<Flight, TlsError> {
        let msg = decode_key_update(body)?;
        let provider = Arc::clone(&self.config.crypto);
        let params = self
            .params
            .clone()
            .ok_or_else(|| TlsError::Internal("no negotiated suite".into()))?;

        let new_read = update_traffic_secret(provider.as_ref(), params.hash, &self.client_app_secret)?;
        self.client_app_secret.zeroize();
        self.client_app_secret = new_read.clone();
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
            // The answering KeyUpdate travels under the old write
            // keys; they rotate right after it.
            flight.push_message(encode_key_update(&KeyUpdateMsg {
                update_requested: false,
            }));
            let new_write =
                update_traffic_secret(provider.as_ref(), params.hash, &self.server_app_secret)?;
            self.server_app_secret.zeroize();
            self.server_app_secret = new_write.clone();
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
            update_traffic_secret(provider.as_ref(), params.hash, &self.server_app_secret)?;
        self.server_app_secret.zeroize();
        self.server_app_secret = new_write.clone();
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

    /// Server-initiated post-handshake client authentication
    /// (RFC 8446 §4.6.2); only valid when the client advertised
    /// post_handshake_auth.
    pub fn request_post_handshake_auth(&mut self) -> Result<Flight, TlsError> {
        if self.state != HandshakeState::Connected {
            return Err(TlsError::Internal(
                "post-handshake auth before connection".into(),
            ));
        }
        if self.pending_reauth.is_some() {
            return Err(TlsError::Internal("reauthentication already pending".into()));
        }
        self.reauth_counter = self.reauth_counter.wrapping_add(1);
        let context = vec![0x50, self.reauth_counter];
        let cr = encode_certificate_request(&CertificateRequestMsg {
            certificate_request_context: context.clone(),
            extensions: vec![build_signature_algorithms(&self.config.signature_algorithms)],
        })?;
        let mut fork = self.transcript.fork();
        fork.update(&cr)?;
        self.pending_reauth = Some(PendingReauth {
            transcript: fork,
            context,
            cert_chain: Vec::new(),
        });
        let mut flight = Flight::in_progress();
        flight.status = FlightStatus::Complete;
        flight.push_message(cr);
        flight.push_command(RecordCommand::Flush);
        Ok(flight)
    }

    fn on_reauth_certificate(&mut self, body: &[u8], raw: &[u8]) -> Result<Flight, TlsError> {
        let msg = decode_certificate(body)?;
        let pending = self
            .pending_reauth
            .as_mut()
            .ok_or_else(|| TlsError::UnexpectedMessage("Certificate without reauth".into()))?;
        if msg.certificate_request_context != pending.context {
            return Err(TlsError::IllegalParameter(
                "reauthentication context mismatch".into(),
            ));
        }
        pending.transcript.update(raw)?;
        if !msg.certificate_list.is_empty() {
            let chain = self.verify_client_chain(&msg)?;
            if let Some(pending) = self.pending_reauth.as_mut() {
                pending.cert_chain = chain;
            }
        }
        Ok(Flight {
            items: Vec::new(),
            status: FlightStatus::Complete,
            session: None,
        })
    }

    fn on_reauth_cert_verify(&mut self, body: &[u8], raw: &[u8]) -> Result<Flight, TlsError> {
        let msg = decode_certificate_verify(body)?;
        let pending = self
            .pending_reauth
            .as_mut()
            .ok_or_else(|| TlsError::UnexpectedMessage("CertificateVerify without reauth".into()))?;
        let leaf = pending
            .cert_chain
            .first()
            .cloned()
            .ok_or_else(|| TlsError::UnexpectedMessage("CertificateVerify without cert".into()))?;
        let th = pending.transcript.digest()?;
        let payload = tls13_certificate_verify_payload(false, &th);
        self.config
            .crypto
            .verify(&leaf.public_key(), msg.algorithm.0, &payload, &msg.signature)
            .map_err(|_| TlsError::DecryptError("CertificateVerify signature".into()))?;
        if let Some(pending) = self.pending_reauth.as_mut() {
            pending.transcript.update(raw)?;
        }
        Ok(Flight {
            items: Vec::new(),
            status: FlightStatus::Complete,
            session: None,
        })
    }

    fn on_reauth_finished(&mut self, body: &[u8], _raw: &[u8]) -> Result<Flight, TlsError> {
        let provider = Arc::clone(&self.config.crypto);
        let params = self
            .params
            .clone()
            .ok_or_else(|| TlsError::Internal("no negotiated suite".into()))?;
        let fin = decode_finished(body, params.hash_len())?;
        let pending = self
            .pending_reauth
            .take()
            .ok_or_else(|| TlsError::UnexpectedMessage("Finished without reauth".into()))?;
        let schedule = self
            .schedule
            .as_ref()
            .ok_or_else(|| TlsError::Internal("no key schedule".into()))?;
        let th = pending.transcript.digest()?;
        check_finished13(
            provider.as_ref(),
            schedule,
            &self.client_app_secret,
            &th,
            &fin.verify_data,
        )?;
        if !pending.cert_chain.is_empty() {
            self.client_cert_chain = pending.cert_chain;
        }
        Ok(Flight {
            items: Vec::new(),
            status: FlightStatus::Complete,
            session: None,
        })
    }

    fn key_log(&self, label: &str, secret: &[u8]) {
        if let Some(cb) = &self.config.key_log {
            let hex = |b: &[u8]| -> String { b.iter().map(|x| format!("{x:02x}")).collect() };
            cb(&format!(
                "{label} {} {}",
                hex(&self.client_random),
                hex(secret)
            ));
        }
    }
}

fn alert_to_error(alert: AlertDescription) -> TlsError {
    match alert {
        AlertDescription::UnrecognizedName => TlsError::UnrecognizedName,
        AlertDescription::AccessDenied => TlsError::AccessDenied("callback refused".into()),
        AlertDescription::NoApplicationProtocol => TlsError::NoApplicationProtocol,
        other => TlsError::HandshakeFailure(format!("callback alert {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockCertProvider, MockProvider};

    fn server() -> ServerHandshake13 {
        let config = Arc::new(
            TlsConfig::builder(Arc::new(MockProvider::new()), Arc::new(MockCertProvider))
                .role(crate::TlsRole::Server)
                .build(),
        );
        ServerHandshake13::new(config, LibContext::new())
    }

    #[test]
    fn test_initial_state() {
        let s = server();
        assert_eq!(s.state(), HandshakeState::WaitClientHello);
        assert!(s.negotiated_suite().is_none());
        assert!(!s.resumed());
    }

    #[test]
    fn test_rejects_non_hello_first() {
        let mut s = server();
        let fin = encode_finished(&[0; 32]);
        assert!(matches!(
            s.on_message(&fin).unwrap_err(),
            TlsError::UnexpectedMessage(_)
        ));
    }

    #[test]
    fn test_resume_without_suspension_fails() {
        let mut s = server();
        assert!(s.resume_client_hello().is_err());
    }

    #[test]
    fn test_post_handshake_auth_requires_connection() {
        let mut s = server();
        assert!(s.request_post_handshake_auth().is_err());
        assert!(s.initiate_key_update(false).is_err());
    }

    #[test]
    fn test_first_resolvable_psk_identity_wins() {
        use crate::handshake::verify::compute_binder;
        use std::sync::atomic::{AtomicUsize, Ordering};

        // The lookup resolves every identity, and counts its calls.
        let lookups = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&lookups);
        let config = Arc::new(
            TlsConfig::builder(Arc::new(MockProvider::new()), Arc::new(MockCertProvider))
                .role(crate::TlsRole::Server)
                .psk_server_find(Arc::new(move |identity| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Some(vec![identity[0]; 32])
                }))
                .build(),
        );
        let mut s = ServerHandshake13::new(Arc::clone(&config), LibContext::new());
        let params =
            CipherSuiteParams::from_suite(CipherSuite::TLS_AES_128_GCM_SHA256).unwrap();
        s.transcript
            .select_hash(config.crypto.as_ref(), params.hash)
            .unwrap();

        let truncated = b"truncated client hello bytes";
        let th = s.transcript.digest_with(truncated).unwrap();
        let binder0 =
            compute_binder(config.crypto.as_ref(), &params, &[0xA1; 32], true, &th).unwrap();
        let identities = vec![
            PskIdentity {
                identity: vec![0xA1],
                obfuscated_ticket_age: 0,
            },
            PskIdentity {
                identity: vec![0xB2],
                obfuscated_ticket_age: 0,
            },
        ];
        let binders = vec![binder0, vec![0u8; 32]];
        s.select_psk(&params, &identities, &binders, truncated)
            .unwrap();

        let selected = s.psk.as_ref().expect("psk selected");
        assert_eq!(selected.index, 0);
        assert!(selected.external);
        // The second identity was never examined.
        assert_eq!(lookups.load(Ordering::SeqCst), 1);
    }
}
