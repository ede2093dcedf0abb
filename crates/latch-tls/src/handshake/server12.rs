//! TLS 1.2 / DTLS 1.2 / TLCP 1.1 server handshake state machine.
//!
//! Full handshakes across every key-exchange mode, abbreviated
//! resumption from the session cache or a decrypted ticket, the DTLS
//! cookie exchange, client authentication, ticket issuance, and the
//! secure-renegotiation checks.

use std::sync::Arc;

use latch_types::{KeyType, KeyUsage, TlsError};
use zeroize::Zeroize;

use crate::config::{ClientAuth, Credential, InspectAction, SniAction, TlsConfig};
use crate::crypt::prf::{self, VERIFY_DATA_LEN};
use crate::crypt::transcript::TranscriptHash;
use crate::crypt::{
    AuthAlg, KeyExchangeAlg, NamedGroup, SignatureScheme, Tls12CipherSuiteParams, FFDHE2048_P,
};
use crate::extensions::{Extension, ExtensionType};
use crate::provider::{CertHandle, KeyDirection, RecordCommand};
use crate::session::{unix_now, Session, DEFAULT_SESSION_LIFETIME};
use crate::{CipherSuite, LibContext, TlsVersion};

use super::codec::{
    decode_certificate_verify, decode_client_hello, decode_finished, encode_finished,
    encode_server_hello, ClientHello, ServerHello,
};
use super::codec12::{
    decode_certificate12, decode_client_key_exchange, encode_certificate12,
    encode_certificate_request12, encode_new_session_ticket12, encode_server_hello_done,
    encode_server_key_exchange, Certificate12Msg, CertificateRequest12Msg,
    ClientKeyExchangePayload, DheParams, EcdheParams, NewSessionTicket12Msg,
    ServerKeyExchangeParams, SignedParams,
};
use super::extensions_codec::{
    build_alpn_selected, build_ec_point_formats, build_encrypt_then_mac,
    build_extended_master_secret, build_renegotiation_info, build_session_ticket, parse_alpn,
    parse_ec_point_formats, parse_empty, parse_renegotiation_info, parse_server_name,
    parse_session_ticket, parse_signature_algorithms, parse_supported_groups,
};
use super::key_exchange::{
    psk_pre_master, rsa_server_pre_master, KeyExchange, PreMaster,
};
use super::negotiate::{
    check_point_formats, check_renegotiation_info, check_renegotiation_initial, hostname_eq,
    negotiate_encrypt_then_mac, resume_ems_check, select_alpn, select_group,
    select_signature_scheme, select_tls12_cipher_suite, select_version,
};
use super::verify::{check_finished12, signed_params_payload};
use super::{
    Flight, FlightStatus, HandshakeMessage, HandshakeState, HandshakeType, MessageFramer,
};

use super::client12::RenegotiationState;

const EPOCH_TRAFFIC: u16 = 1;

#[cfg(feature = "dtls12")]
const COOKIE_LEN: usize = 20;

/// What the ClientHello offered, kept for the rest of the handshake.
struct HelloOffer {
    ems: bool,
    etm: bool,
    ticket: Option<Vec<u8>>,
    suites: Vec<CipherSuite>,
    sig_schemes: Vec<SignatureScheme>,
    groups: Vec<NamedGroup>,
}

pub struct ServerHandshake12 {
    config: Arc<TlsConfig>,
    lib_ctx: LibContext,
    version: TlsVersion,
    state: HandshakeState,
    transcript: TranscriptHash,
    framer: MessageFramer,
    params: Option<Tls12CipherSuiteParams>,
    client_random: [u8; 32],
    server_random: [u8; 32],
    session_id: Vec<u8>,
    renegotiation: Option<RenegotiationState>,
    negotiated_ems: bool,
    negotiated_etm: bool,
    negotiated_alpn: Option<Vec<u8>>,
    sni_hostname: Option<String>,
    resumed: bool,
    resumed_session: Option<Arc<Session>>,
    issue_ticket: bool,
    client_cert_chain: Vec<CertHandle>,
    cert_requested: bool,
    kx: Option<KeyExchange>,
    psk_identity: Option<Vec<u8>>,
    master_secret: Vec<u8>,
    client_verify_data: Vec<u8>,
    server_verify_data: Vec<u8>,
    secure_renegotiation: bool,
    pending_hello: Option<Vec<u8>>,
    #[cfg(feature = "dtls12")]
    cookie_secret: [u8; 32],
    #[cfg(feature = "dtls12")]
    cookie_verified: bool,
}

impl Drop for ServerHandshake12 {
    fn drop(&mut self) {
        self.master_secret.zeroize();
    }
}

impl ServerHandshake12 {
    pub fn new(config: Arc<TlsConfig>, lib_ctx: LibContext, version: TlsVersion) -> Self {
        #[cfg(feature = "dtls12")]
        let framer = if version.is_datagram() {
            MessageFramer::Dtls { next_seq: 0 }
        } else {
            MessageFramer::Stream
        };
        #[cfg(not(feature = "dtls12"))]
        let framer = MessageFramer::Stream;
        Self {
            config,
            lib_ctx,
            version,
            state: HandshakeState::WaitClientHello,
            transcript: TranscriptHash::new(),
            framer,
            params: None,
            client_random: [0; 32],
            server_random: [0; 32],
            session_id: Vec::new(),
            renegotiation: None,
            negotiated_ems: false,
            negotiated_etm: false,
            negotiated_alpn: None,
            sni_hostname: None,
            resumed: false,
            resumed_session: None,
            issue_ticket: false,
            client_cert_chain: Vec::new(),
            cert_requested: false,
            kx: None,
            psk_identity: None,
            master_secret: Vec::new(),
            client_verify_data: Vec::new(),
            server_verify_data: Vec::new(),
            secure_renegotiation: false,
            pending_hello: None,
            #[cfg(feature = "dtls12")]
            cookie_secret: [0; 32],
            #[cfg(feature = "dtls12")]
            cookie_verified: false,
        }
    }

    /// A renegotiating handshake on an established connection.
    pub fn renegotiate(
        config: Arc<TlsConfig>,
        lib_ctx: LibContext,
        version: TlsVersion,
        previous: RenegotiationState,
    ) -> Self {
        let mut hs = Self::new(config, lib_ctx, version);
        hs.renegotiation = Some(previous);
        hs
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

    pub fn resumed(&self) -> bool {
        self.resumed
    }

    pub fn verify_data(&self) -> RenegotiationState {
        RenegotiationState {
            client_verify_data: self.client_verify_data.clone(),
            server_verify_data: self.server_verify_data.clone(),
        }
    }

    /// Whether the peer negotiated RFC 5746 secure renegotiation.
    pub fn secure_renegotiation(&self) -> bool {
        self.secure_renegotiation || self.renegotiation.is_some()
    }

    /// Feed one complete handshake message.
    pub fn on_message(&mut self, msg: &HandshakeMessage) -> Result<Flight, TlsError> {
        match (self.state, msg.msg_type) {
            (HandshakeState::WaitClientHello, HandshakeType::ClientHello) => {
                self.process_client_hello(&msg.raw, &msg.body, false)
            }
            (HandshakeState::WaitClientCert, HandshakeType::Certificate) => {
                self.on_client_certificate(&msg.body, &msg.raw)
            }
            (
                HandshakeState::WaitClientCert | HandshakeState::WaitClientKeyExchange,
                HandshakeType::ClientKeyExchange,
            ) => {
                if self.state == HandshakeState::WaitClientCert
                    && self.config.client_auth == ClientAuth::Required
                {
                    return Err(TlsError::CertificateRequired);
                }
                self.on_client_key_exchange(&msg.body, &msg.raw)
            }
            (HandshakeState::WaitClientCertVerify, HandshakeType::CertificateVerify) => {
                self.on_client_cert_verify(&msg.body, &msg.raw)
            }
            (HandshakeState::WaitClientFinished, HandshakeType::Finished) => {
                self.on_client_finished(&msg.body, &msg.raw)
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
        let (_, body) = self.framer.unframe(&raw)?;
        let body = body.to_vec();
        self.process_client_hello(&raw, &body, true)
    }

    fn process_client_hello(
        &mut self,
        raw: &[u8],
        body: &[u8],
        resumed_callback: bool,
    ) -> Result<Flight, TlsError> {
        let ch = decode_client_hello(body, self.version.is_datagram())?;

        if !resumed_callback {
            match &self.config.client_hello_inspect {
                Some(cb) => match cb(&ch) {
                    InspectAction::Proceed => {}
                    InspectAction::Suspend => {
                        self.pending_hello = Some(raw.to_vec());
                        return Ok(Flight {
                            items: Vec::new(),
                            status: FlightStatus::NeedsCertCallback,
                            session: None,
                        });
                    }
                    InspectAction::Fatal(alert) => {
                        return Err(TlsError::HandshakeFailure(format!(
                            "client hello rejected: {alert:?}"
                        )))
                    }
                },
                None => {}
            }
        }

        // DTLS cookie exchange precedes everything else; the verified
        // hello is the one the transcript sees.
        #[cfg(feature = "dtls12")]
        if self.version.is_datagram() && !self.cookie_verified {
            let expected = self.compute_cookie(&ch)?;
            if ch.cookie.is_empty() {
                // HelloVerifyRequest stays out of the transcript but
                // still consumes a message sequence number.
                let mut hvr_body = Vec::with_capacity(3 + expected.len());
                hvr_body.extend_from_slice(&self.version.wire().to_be_bytes());
                hvr_body.push(expected.len() as u8);
                hvr_body.extend_from_slice(&expected);
                let hvr = self.framer.reframe(super::codec::wrap_handshake(
                    HandshakeType::HelloVerifyRequest,
                    &hvr_body,
                ));
                let mut flight = Flight::in_progress();
                flight.push_message(hvr);
                flight.push_command(RecordCommand::Flush);
                return Ok(flight);
            }
            if !self.config.crypto.ct_eq(&ch.cookie, &expected) {
                return Err(TlsError::IllegalParameter("stale dtls cookie".into()));
            }
            self.cookie_verified = true;
        }

        // Version selection (the 1.3 front end routed us here with the
        // version pinned; a direct ≤1.2 config re-checks).
        let selected = select_version(&self.config, &ch)?;
        if selected != self.version {
            if self.renegotiation.is_some() {
                return Err(TlsError::ProtocolVersion(
                    "version changed across renegotiation".into(),
                ));
            }
            self.version = selected;
        }

        if !ch.compression_methods.contains(&0) {
            return Err(TlsError::IllegalParameter(
                "no null compression offered".into(),
            ));
        }

        // Secure renegotiation (RFC 5746).
        let renego_info = match ch.find_extension(ExtensionType::RENEGOTIATION_INFO) {
            Some(data) => Some(parse_renegotiation_info(data)?),
            None => None,
        };
        match &self.renegotiation {
            None => {
                self.secure_renegotiation =
                    check_renegotiation_initial(ch.offers_scsv(), renego_info.as_deref())?;
            }
            Some(prev) => {
                check_renegotiation_info(
                    self.config.crypto.as_ref(),
                    ch.offers_scsv(),
                    renego_info.as_deref(),
                    &prev.client_verify_data,
                )?;
            }
        }

        let offer = self.collect_offer(&ch)?;
        self.client_random = ch.random;

        // SNI callback.
        if let Some(data) = ch.find_extension(ExtensionType::SERVER_NAME) {
            let name = parse_server_name(data)?;
            match &self.config.sni_select {
                Some(cb) => match cb(&name) {
                    SniAction::Ok => self.sni_hostname = Some(name),
                    SniAction::NoAck => {}
                    SniAction::Fatal(_) => return Err(TlsError::UnrecognizedName),
                },
                None => self.sni_hostname = Some(name),
            }
        }

        // ALPN.
        if let Some(data) = ch.find_extension(ExtensionType::APPLICATION_LAYER_PROTOCOL_NEGOTIATION)
        {
            let offered = parse_alpn(data)?;
            self.negotiated_alpn = select_alpn(&self.config, &offered)?;
        }

        // Resumption, unless renegotiating with resumption disabled.
        let try_resume = self.renegotiation.is_none() || self.config.resume_on_renego;
        if try_resume {
            if let Some(session) = self.try_resume(&ch, &offer)? {
                return self.build_abbreviated_flight(raw, &ch, &offer, session);
            }
        }

        self.build_full_flight(raw, &ch, &offer)
    }

    fn collect_offer(&self, ch: &ClientHello) -> Result<HelloOffer, TlsError> {
        let mut offer = HelloOffer {
            ems: false,
            etm: false,
            ticket: None,
            suites: ch.cipher_suites.clone(),
            sig_schemes: vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::ECDSA_SECP256R1_SHA256,
            ],
            groups: vec![NamedGroup::X25519, NamedGroup::SECP256R1],
        };
        for ext in &ch.extensions {
            match ext.extension_type {
                ExtensionType::EXTENDED_MASTER_SECRET => {
                    parse_empty(&ext.data, "extended_master_secret")?;
                    offer.ems = true;
                }
                ExtensionType::ENCRYPT_THEN_MAC => {
                    parse_empty(&ext.data, "encrypt_then_mac")?;
                    offer.etm = true;
                }
                ExtensionType::SESSION_TICKET => {
                    offer.ticket = Some(parse_session_ticket(&ext.data)?);
                }
                ExtensionType::SIGNATURE_ALGORITHMS => {
                    offer.sig_schemes = parse_signature_algorithms(&ext.data)?;
                }
                ExtensionType::SUPPORTED_GROUPS => {
                    offer.groups = parse_supported_groups(&ext.data)?;
                }
                ExtensionType::EC_POINT_FORMATS => {
                    check_point_formats(&parse_ec_point_formats(&ext.data)?)?;
                }
                _ => {}
            }
        }
        Ok(offer)
    }

    #[cfg(feature = "dtls12")]
    fn compute_cookie(&mut self, ch: &ClientHello) -> Result<Vec<u8>, TlsError> {
        if self.cookie_secret == [0; 32] {
            self.config.crypto.drbg_random(&mut self.cookie_secret)?;
        }
        let mac = self.config.crypto.hmac(
            latch_types::HashAlg::Sha256,
            &self.cookie_secret,
            &ch.random,
        )?;
        Ok(mac[..COOKIE_LEN].to_vec())
    }

    /// Ticket resumption first, stateful session-id lookup second.
    fn try_resume(
        &mut self,
        ch: &ClientHello,
        offer: &HelloOffer,
    ) -> Result<Option<Arc<Session>>, TlsError> {
        let now = unix_now();

        if self.config.ticket_support {
            if let Some(ticket) = offer.ticket.as_ref().filter(|t| !t.is_empty()) {
                let (session, needs_renew) = self.lib_ctx.ticket_keys().decrypt_ticket(
                    self.config.crypto.as_ref(),
                    ticket,
                    now,
                )?;
                self.issue_ticket = needs_renew;
                if let Some(session) = session {
                    let session = Arc::new(session);
                    if let Some(session) = self.check_resume_candidate(ch, offer, session)? {
                        return Ok(Some(session));
                    }
                }
                // Undecryptable or stale ticket: full handshake with a
                // fresh ticket.
                return Ok(None);
            }
        }

        if self.config.session_cache_mode.caches_server() && !ch.session_id.is_empty() {
            if let Some(session) = self
                .lib_ctx
                .session_cache()
                .lookup(&ch.session_id, now)
            {
                if let Some(session) = self.check_resume_candidate(ch, offer, session)? {
                    return Ok(Some(session));
                }
            }
        }
        Ok(None)
    }

    /// The resumption equivalence checks: suite still offered, EMS
    /// matrix, stored SNI match, session-id context.
    fn check_resume_candidate(
        &mut self,
        ch: &ClientHello,
        offer: &HelloOffer,
        session: Arc<Session>,
    ) -> Result<Option<Arc<Session>>, TlsError> {
        if session.version != self.version
            || !session.is_resumable(
                unix_now(),
                None,
                &self.config.session_id_context,
                None,
            )
        {
            return Ok(None);
        }
        if !ch.cipher_suites.contains(&session.cipher_suite) {
            return Ok(None);
        }
        // RFC 7627 §5.3 resumption matrix; an offer that gained EMS
        // demotes to a full handshake.
        if !resume_ems_check(
            session.extended_master_secret,
            offer.ems,
            self.config.extended_master_secret,
        )? {
            return Ok(None);
        }
        // The offered SNI must match the stored one.
        if let Some(stored) = &session.server_name {
            match &self.sni_hostname {
                Some(offered) if hostname_eq(offered, stored) => {}
                _ => return Ok(None),
            }
        }
        Ok(Some(session))
    }

    fn server_hello_extensions(&self, offer: &HelloOffer, acking_ticket: bool) -> Vec<Extension> {
        let mut extensions = Vec::new();
        match &self.renegotiation {
            None => extensions.push(super::extensions_codec::build_renegotiation_info_initial()),
            Some(prev) => {
                let mut vd = prev.client_verify_data.clone();
                vd.extend_from_slice(&prev.server_verify_data);
                extensions.push(build_renegotiation_info(&vd));
            }
        }
        if self.negotiated_ems {
            extensions.push(build_extended_master_secret());
        }
        if self.negotiated_etm {
            extensions.push(build_encrypt_then_mac());
        }
        if acking_ticket {
            extensions.push(build_session_ticket(&[]));
        }
        if let Some(proto) = &self.negotiated_alpn {
            extensions.push(build_alpn_selected(proto));
        }
        if offer.groups.iter().any(|g| !g.is_ffdhe()) {
            extensions.push(build_ec_point_formats());
        }
        extensions
    }

    fn push_server_hello(
        &mut self,
        flight: &mut Flight,
        suite: CipherSuite,
        extensions: Vec<Extension>,
    ) -> Result<(), TlsError> {
        self.config.crypto.drbg_random(&mut self.server_random)?;
        let sh = ServerHello {
            legacy_version: self.version.wire(),
            random: self.server_random,
            session_id: self.session_id.clone(),
            cipher_suite: suite,
            compression_method: 0,
            extensions,
        };
        let msg = self.framer.reframe(encode_server_hello(&sh)?);
        self.transcript.update(&msg)?;
        flight.push_message(msg);
        Ok(())
    }

    fn build_abbreviated_flight(
        &mut self,
        ch_raw: &[u8],
        ch: &ClientHello,
        offer: &HelloOffer,
        session: Arc<Session>,
    ) -> Result<Flight, TlsError> {
        let provider = Arc::clone(&self.config.crypto);
        let params = Tls12CipherSuiteParams::from_suite(session.cipher_suite)?;
        self.negotiated_ems = session.extended_master_secret;
        self.negotiated_etm = negotiate_encrypt_then_mac(
            self.renegotiation.is_some(),
            false,
            offer.etm,
            self.config.encrypt_then_mac,
            params.is_cbc,
        )?;
        self.master_secret = session.master_secret.clone();
        self.resumed = true;
        self.session_id = ch.session_id.clone();
        self.transcript
            .select_hash(provider.as_ref(), params.hash)?;
        self.transcript.update(ch_raw)?;

        let acking_ticket =
            self.config.ticket_support && offer.ticket.is_some() && self.issue_ticket;
        let extensions = self.server_hello_extensions(offer, acking_ticket);
        let mut flight = Flight::in_progress();
        self.push_server_hello(&mut flight, session.cipher_suite, extensions)?;

        if acking_ticket {
            let (nst, _refreshed) = self.issue_new_ticket(&session)?;
            flight.push_message(nst);
        }

        // Server CCS + Finished straight away.
        flight.push_command(RecordCommand::WriteCcs);
        flight.push_command(self.traffic_key_command(&params, KeyDirection::Write)?);
        let digest = self.transcript.digest()?;
        self.server_verify_data =
            prf::verify_data(provider.as_ref(), params.hash, &self.master_secret, false, &digest)?;
        let fin = self.framer.reframe(encode_finished(&self.server_verify_data));
        self.transcript.update(&fin)?;
        flight.push_message(fin);
        flight.push_command(RecordCommand::Flush);

        self.resumed_session = Some(session);
        self.params = Some(params);
        self.state = HandshakeState::WaitClientCcs;
        Ok(flight)
    }

    fn signing_credential(&self, params: &Tls12CipherSuiteParams) -> Result<Credential, TlsError> {
        let key_type = match params.auth_alg {
            AuthAlg::Rsa => KeyType::Rsa,
            AuthAlg::Ecdsa => KeyType::Ecdsa,
            AuthAlg::Psk => {
                return Err(TlsError::Internal("psk suites have no credential".into()))
            }
            #[cfg(feature = "tlcp")]
            AuthAlg::Sm2 => KeyType::Sm2,
        };
        self.config
            .credential_for(key_type)
            .cloned()
            .ok_or_else(|| TlsError::HandshakeFailure("no matching server credential".into()))
    }

    fn build_full_flight(
        &mut self,
        ch_raw: &[u8],
        ch: &ClientHello,
        offer: &HelloOffer,
    ) -> Result<Flight, TlsError> {
        let provider = Arc::clone(&self.config.crypto);
        let params =
            select_tls12_cipher_suite(&self.config, self.version, &ch.cipher_suites, Some(&offer.groups))?;
        self.negotiated_ems = offer.ems && self.config.extended_master_secret && !self.is_tlcp();
        self.negotiated_etm = negotiate_encrypt_then_mac(
            self.renegotiation.is_some(),
            false,
            offer.etm,
            self.config.encrypt_then_mac,
            params.is_cbc,
        )?;
        self.issue_ticket = self.config.ticket_support
            && offer.ticket.is_some()
            && self.lib_ctx.ticket_keys().has_key()
            && !self.is_tlcp();

        // A fresh session id makes the session cacheable.
        if self.config.session_cache_mode.caches_server() && self.renegotiation.is_none() {
            let mut sid = vec![0u8; 32];
            provider.drbg_random(&mut sid)?;
            self.session_id = sid;
        } else {
            self.session_id = Vec::new();
        }

        self.transcript
            .select_hash(provider.as_ref(), params.hash)?;
        self.transcript.update(ch_raw)?;

        let extensions = self.server_hello_extensions(offer, self.issue_ticket);
        let mut flight = Flight::in_progress();
        self.push_server_hello(&mut flight, params.suite, extensions)?;

        // Certificate.
        if params.kx_alg.requires_certificate() {
            let credential = self.signing_credential(&params)?;
            let mut chain = credential.chain.clone();
            #[cfg(feature = "tlcp")]
            if self.is_tlcp() {
                // Double certificates: signing first, encryption second.
                let enc = self.config.tlcp_enc_credential.as_ref().ok_or_else(|| {
                    TlsError::HandshakeFailure("TLCP needs an encryption credential".into())
                })?;
                chain.extend(enc.chain.iter().cloned());
            }
            let cert_msg = self.framer.reframe(encode_certificate12(&Certificate12Msg {
                certificate_list: chain,
            }));
            self.transcript.update(&cert_msg)?;
            flight.push_message(cert_msg);
        }

        // ServerKeyExchange.
        let hint = self.config.psk_identity_hint.clone().unwrap_or_default();
        let has_hint = self.config.psk_identity_hint.is_some();
        if params.kx_alg.sends_server_key_exchange(has_hint) {
            let ske = self.build_server_key_exchange(&params, offer, hint)?;
            let ske_msg = self.framer.reframe(encode_server_key_exchange(&ske));
            self.transcript.update(&ske_msg)?;
            flight.push_message(ske_msg);
        }

        // CertificateRequest.
        if self.config.client_auth != ClientAuth::None
            && params.kx_alg.requires_certificate()
            && !params.kx_alg.is_psk()
        {
            self.cert_requested = true;
            let cr = CertificateRequest12Msg {
                certificate_types: vec![1, 64], // rsa_sign, ecdsa_sign
                signature_algorithms: self.config.signature_algorithms.clone(),
                ca_names: Vec::new(),
            };
            let cr_msg = self.framer.reframe(encode_certificate_request12(&cr));
            self.transcript.update(&cr_msg)?;
            flight.push_message(cr_msg);
        }

        let done = self.framer.reframe(encode_server_hello_done());
        self.transcript.update(&done)?;
        flight.push_message(done);
        flight.push_command(RecordCommand::Flush);

        self.params = Some(params);
        self.state = if self.cert_requested {
            HandshakeState::WaitClientCert
        } else {
            HandshakeState::WaitClientKeyExchange
        };
        Ok(flight)
    }

    fn is_tlcp(&self) -> bool {
        self.version == TlsVersion::Tlcp11
    }

    fn build_server_key_exchange(
        &mut self,
        params: &Tls12CipherSuiteParams,
        offer: &HelloOffer,
        hint: Vec<u8>,
    ) -> Result<ServerKeyExchangeParams, TlsError> {
        let provider = Arc::clone(&self.config.crypto);
        match params.kx_alg {
            KeyExchangeAlg::Ecdhe => {
                let curve = select_group(&self.config, &offer.groups).ok_or_else(|| {
                    TlsError::HandshakeFailure("no common curve".into())
                })?;
                let kx = KeyExchange::generate(provider.as_ref(), curve)?;
                let mut raw_params = vec![3u8];
                raw_params.extend_from_slice(&curve.0.to_be_bytes());
                raw_params.push(kx.public_bytes().len() as u8);
                raw_params.extend_from_slice(kx.public_bytes());
                let signed = self.sign_params(params, offer, &raw_params)?;
                let out = ServerKeyExchangeParams::Ecdhe(EcdheParams {
                    curve,
                    public: kx.public_bytes().to_vec(),
                    signature: Some(signed),
                });
                self.kx = Some(kx);
                Ok(out)
            }
            KeyExchangeAlg::Dhe => {
                let kx = KeyExchange::generate(provider.as_ref(), NamedGroup::FFDHE2048)?;
                let p = FFDHE2048_P.to_vec();
                let g = vec![2u8];
                let mut raw_params = Vec::new();
                for field in [&p, &g, &kx.public_bytes().to_vec()] {
                    raw_params.extend_from_slice(&(field.len() as u16).to_be_bytes());
                    raw_params.extend_from_slice(field);
                }
                let signed = self.sign_params(params, offer, &raw_params)?;
                let out = ServerKeyExchangeParams::Dhe(DheParams {
                    p,
                    g,
                    public: kx.public_bytes().to_vec(),
                    signature: Some(signed),
                });
                self.kx = Some(kx);
                Ok(out)
            }
            KeyExchangeAlg::Psk | KeyExchangeAlg::RsaPsk => {
                Ok(ServerKeyExchangeParams::PskHint { hint })
            }
            KeyExchangeAlg::EcdhePsk => {
                let curve = select_group(&self.config, &offer.groups).ok_or_else(|| {
                    TlsError::HandshakeFailure("no common curve".into())
                })?;
                let kx = KeyExchange::generate(provider.as_ref(), curve)?;
                let out = ServerKeyExchangeParams::EcdhePsk {
                    hint,
                    params: EcdheParams {
                        curve,
                        public: kx.public_bytes().to_vec(),
                        signature: None,
                    },
                };
                self.kx = Some(kx);
                Ok(out)
            }
            KeyExchangeAlg::DhePsk => {
                let kx = KeyExchange::generate(provider.as_ref(), NamedGroup::FFDHE2048)?;
                let out = ServerKeyExchangeParams::DhePsk {
                    hint,
                    params: DheParams {
                        p: FFDHE2048_P.to_vec(),
                        g: vec![2],
                        public: kx.public_bytes().to_vec(),
                        signature: None,
                    },
                };
                self.kx = Some(kx);
                Ok(out)
            }
            KeyExchangeAlg::Rsa => Err(TlsError::Internal(
                "RSA key transport sends no ServerKeyExchange".into(),
            )),
            #[cfg(feature = "tlcp")]
            KeyExchangeAlg::Ecc => {
                // Signature over randoms || encryption certificate.
                let credential = self.signing_credential(params)?;
                let enc = self.config.tlcp_enc_credential.as_ref().ok_or_else(|| {
                    TlsError::HandshakeFailure("TLCP needs an encryption credential".into())
                })?;
                let enc_der = enc.chain.first().ok_or_else(|| {
                    TlsError::HandshakeFailure("empty TLCP encryption chain".into())
                })?;
                let payload =
                    signed_params_payload(&self.client_random, &self.server_random, enc_der);
                let signature = provider.sign(
                    credential.private_key.key_type,
                    &credential.private_key.der,
                    SignatureScheme::SM2_SM3.0,
                    &payload,
                )?;
                Ok(ServerKeyExchangeParams::TlcpEcc { signature })
            }
        }
    }

    fn sign_params(
        &self,
        params: &Tls12CipherSuiteParams,
        offer: &HelloOffer,
        raw_params: &[u8],
    ) -> Result<SignedParams, TlsError> {
        let credential = self.signing_credential(params)?;
        let scheme = select_signature_scheme(
            &self.config,
            &offer.sig_schemes,
            credential.private_key.key_type,
            false,
        )?;
        let payload = signed_params_payload(&self.client_random, &self.server_random, raw_params);
        let signature = self.config.crypto.sign(
            credential.private_key.key_type,
            &credential.private_key.der,
            scheme.0,
            &payload,
        )?;
        Ok(SignedParams { scheme, signature })
    }

    fn on_client_certificate(&mut self, body: &[u8], raw: &[u8]) -> Result<Flight, TlsError> {
        let msg = decode_certificate12(body)?;
        if msg.certificate_list.is_empty() {
            if self.config.client_auth == ClientAuth::Required {
                return Err(TlsError::CertificateRequired);
            }
            self.transcript.update(raw)?;
            self.state = HandshakeState::WaitClientKeyExchange;
            return Ok(Flight::in_progress());
        }
        let mut chain = Vec::with_capacity(msg.certificate_list.len());
        for der in &msg.certificate_list {
            chain.push(self.config.certs.parse(der)?);
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
        self.client_cert_chain = chain;
        self.transcript.update(raw)?;
        self.state = HandshakeState::WaitClientKeyExchange;
        Ok(Flight::in_progress())
    }

    fn server_psk(&self, identity: &[u8]) -> Result<Vec<u8>, TlsError> {
        if let Some(psk) = self
            .config
            .external_psks
            .iter()
            .find(|p| p.identity == identity)
        {
            return Ok(psk.key.clone());
        }
        if let Some(cb) = &self.config.psk_server_find {
            if let Some(key) = cb(identity) {
                return Ok(key);
            }
        }
        Err(TlsError::UnknownPskIdentity)
    }

    fn on_client_key_exchange(&mut self, body: &[u8], raw: &[u8]) -> Result<Flight, TlsError> {
        let provider = Arc::clone(&self.config.crypto);
        let params = self
            .params
            .clone()
            .ok_or_else(|| TlsError::Internal("no negotiated suite".into()))?;
        let payload = decode_client_key_exchange(body, params.kx_alg)?;

        let pre_master: PreMaster = match payload {
            ClientKeyExchangePayload::Rsa {
                encrypted_pre_master,
            } => {
                let credential = self.signing_credential(&params)?;
                rsa_server_pre_master(
                    provider.as_ref(),
                    credential.private_key.key_type,
                    &credential.private_key.der,
                    &encrypted_pre_master,
                    self.client_offered_version(),
                )?
            }
            ClientKeyExchangePayload::Ecdhe { public }
            | ClientKeyExchangePayload::Dhe { public } => {
                let kx = self
                    .kx
                    .as_ref()
                    .ok_or_else(|| TlsError::Internal("no server keypair".into()))?;
                kx.derive(&public)?
            }
            ClientKeyExchangePayload::Psk { identity } => {
                let psk = self.server_psk(&identity)?;
                self.psk_identity = Some(identity);
                psk_pre_master(None, &psk)
            }
            ClientKeyExchangePayload::EcdhePsk { identity, public }
            | ClientKeyExchangePayload::DhePsk { identity, public } => {
                let psk = self.server_psk(&identity)?;
                self.psk_identity = Some(identity);
                let kx = self
                    .kx
                    .as_ref()
                    .ok_or_else(|| TlsError::Internal("no server keypair".into()))?;
                let shared = kx.derive(&public)?;
                psk_pre_master(Some(&shared.0), &psk)
            }
            ClientKeyExchangePayload::RsaPsk {
                identity,
                encrypted_pre_master,
            } => {
                let psk = self.server_psk(&identity)?;
                self.psk_identity = Some(identity);
                let credential = self.signing_credential(&params)?;
                let rsa_pm = rsa_server_pre_master(
                    provider.as_ref(),
                    credential.private_key.key_type,
                    &credential.private_key.der,
                    &encrypted_pre_master,
                    self.client_offered_version(),
                )?;
                psk_pre_master(Some(&rsa_pm.0), &psk)
            }
            #[cfg(feature = "tlcp")]
            ClientKeyExchangePayload::TlcpEcc {
                encrypted_pre_master,
            } => {
                let enc = self.config.tlcp_enc_credential.as_ref().ok_or_else(|| {
                    TlsError::Internal("TLCP encryption credential missing".into())
                })?;
                super::key_exchange::tlcp_server_pre_master(
                    provider.as_ref(),
                    &enc.private_key.der,
                    &encrypted_pre_master,
                )?
            }
        };

        self.transcript.update(raw)?;
        self.master_secret = if self.negotiated_ems {
            let session_hash = self.transcript.digest()?;
            prf::extended_master_secret(provider.as_ref(), params.hash, &pre_master.0, &session_hash)?
        } else {
            prf::master_secret(
                provider.as_ref(),
                params.hash,
                &pre_master.0,
                &self.client_random,
                &self.server_random,
            )?
        };

        self.state = if !self.client_cert_chain.is_empty() {
            HandshakeState::WaitClientCertVerify
        } else {
            HandshakeState::WaitClientCcs
        };
        Ok(Flight::in_progress())
    }

    /// The protocol version the client first offered, embedded in RSA
    /// pre-masters.
    fn client_offered_version(&self) -> TlsVersion {
        self.version
    }

    fn on_client_cert_verify(&mut self, body: &[u8], raw: &[u8]) -> Result<Flight, TlsError> {
        let msg = decode_certificate_verify(body)?;
        let leaf = self
            .client_cert_chain
            .first()
            .ok_or_else(|| TlsError::Internal("CertificateVerify without certificate".into()))?;
        let digest = self.transcript.digest()?;
        self.config
            .crypto
            .verify(&leaf.public_key(), msg.algorithm.0, &digest, &msg.signature)
            .map_err(|_| TlsError::DecryptError("CertificateVerify signature".into()))?;
        self.transcript.update(raw)?;
        self.state = HandshakeState::WaitClientCcs;
        Ok(Flight::in_progress())
    }

    /// The record layer saw the client's ChangeCipherSpec.
    pub fn on_ccs_received(&mut self) -> Result<Flight, TlsError> {
        if self.state != HandshakeState::WaitClientCcs {
            return Err(TlsError::UnexpectedMessage("change_cipher_spec".into()));
        }
        let params = self
            .params
            .clone()
            .ok_or_else(|| TlsError::Internal("no negotiated suite".into()))?;
        let command = self.traffic_key_command(&params, KeyDirection::Read)?;
        self.state = HandshakeState::WaitClientFinished;
        let mut flight = Flight::in_progress();
        flight.push_command(command);
        Ok(flight)
    }

    fn traffic_key_command(
        &self,
        params: &Tls12CipherSuiteParams,
        direction: KeyDirection,
    ) -> Result<RecordCommand, TlsError> {
        let block_len = 2 * params.key_material_len();
        let block = prf::key_block(
            self.config.crypto.as_ref(),
            params.hash,
            &self.master_secret,
            &self.client_random,
            &self.server_random,
            block_len,
        )?;
        // The server writes with the server-side slice and reads with
        // the client-side slice.
        let client_side = direction == KeyDirection::Read;
        let (mac, key, iv) = prf::partition_key_block(
            &block,
            params.mac_key_len,
            params.key_len,
            params.fixed_iv_len,
            client_side,
        )?;
        let mut secret = mac;
        secret.extend_from_slice(&key);
        secret.extend_from_slice(&iv);
        Ok(RecordCommand::SetKey {
            direction,
            epoch: EPOCH_TRAFFIC,
            suite: params.suite,
            secret,
        })
    }

    fn on_client_finished(&mut self, body: &[u8], raw: &[u8]) -> Result<Flight, TlsError> {
        let provider = Arc::clone(&self.config.crypto);
        let params = self
            .params
            .clone()
            .ok_or_else(|| TlsError::Internal("no negotiated suite".into()))?;
        let fin = decode_finished(body, VERIFY_DATA_LEN)?;
        let digest = self.transcript.digest()?;
        check_finished12(
            provider.as_ref(),
            params.hash,
            &self.master_secret,
            true,
            &digest,
            &fin.verify_data,
        )?;
        self.client_verify_data = fin.verify_data.clone();
        self.transcript.update(raw)?;

        let mut flight = Flight::in_progress();
        flight.status = FlightStatus::Complete;

        if self.resumed {
            // Abbreviated: the client Finished ends the handshake.
            self.state = HandshakeState::Connected;
            flight.session = self.resumed_session.clone();
            return Ok(flight);
        }

        // Full handshake: session, optional ticket, then CCS+Finished.
        let session = self.build_session()?;
        if self.issue_ticket {
            let (nst, _) = self.issue_new_ticket(&session)?;
            flight.push_message(nst);
        }
        flight.push_command(RecordCommand::WriteCcs);
        flight.push_command(self.traffic_key_command(&params, KeyDirection::Write)?);
        let digest = self.transcript.digest()?;
        self.server_verify_data =
            prf::verify_data(provider.as_ref(), params.hash, &self.master_secret, false, &digest)?;
        let fin_msg = self.framer.reframe(encode_finished(&self.server_verify_data));
        self.transcript.update(&fin_msg)?;
        flight.push_message(fin_msg);
        flight.push_command(RecordCommand::Flush);

        // The verified session becomes visible to other connections.
        if self.config.session_cache_mode.caches_server() && !session.session_id.is_empty() {
            self.lib_ctx.session_cache().insert(Arc::clone(&session))?;
        }
        flight.session = Some(session);
        self.state = HandshakeState::Connected;
        Ok(flight)
    }

    fn build_session(&self) -> Result<Arc<Session>, TlsError> {
        let params = self
            .params
            .as_ref()
            .ok_or_else(|| TlsError::Internal("no negotiated suite".into()))?;
        let mut auth_hash = Vec::new();
        if let Some(leaf) = self.client_cert_chain.first() {
            let mut h = self.config.crypto.hash_new(params.hash)?;
            h.update(leaf.der())?;
            auth_hash = vec![0u8; params.hash_len()];
            h.finish(&mut auth_hash)?;
        }
        Ok(Arc::new(Session {
            version: self.version,
            cipher_suite: params.suite,
            master_secret: self.master_secret.clone(),
            session_id: self.session_id.clone(),
            ticket: None,
            session_id_context: self.config.session_id_context.clone(),
            extended_master_secret: self.negotiated_ems,
            server_name: self.sni_hostname.clone(),
            peer_certs: self.client_cert_chain.clone(),
            auth_id_hash: auth_hash,
            lifetime: DEFAULT_SESSION_LIFETIME,
            created_at: unix_now(),
            ticket_age_add: 0,
        }))
    }

    /// Encrypt a ticket for the session and wrap it in a
    /// NewSessionTicket message.
    fn issue_new_ticket(&mut self, session: &Session) -> Result<(Vec<u8>, Vec<u8>), TlsError> {
        let ticket = self
            .lib_ctx
            .ticket_keys()
            .encrypt_ticket(self.config.crypto.as_ref(), session)?;
        let msg = self.framer.reframe(encode_new_session_ticket12(
            &NewSessionTicket12Msg {
                lifetime_hint: session.lifetime as u32,
                ticket: ticket.clone(),
            },
        ));
        self.transcript.update(&msg)?;
        Ok((msg, ticket))
    }
}
