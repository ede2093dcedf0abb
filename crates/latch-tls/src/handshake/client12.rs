//! TLS 1.2 / DTLS 1.2 / TLCP 1.1 client handshake state machine.
//!
//! Covers the full handshake across every key-exchange mode, the
//! abbreviated session-id and ticket resumption paths, secure
//! renegotiation, client authentication, and the DTLS cookie exchange
//! (whose first ClientHello and HelloVerifyRequest stay out of the
//! transcript).

use std::sync::Arc;

use latch_types::{KeyUsage, TlsError};
use zeroize::Zeroize;

use crate::config::TlsConfig;
use crate::crypt::prf::{self, VERIFY_DATA_LEN};
use crate::crypt::transcript::TranscriptHash;
use crate::crypt::{KeyExchangeAlg, NamedGroup, Tls12CipherSuiteParams};
use crate::extensions::ExtensionType;
use crate::provider::{CertHandle, KeyDirection, RecordCommand};
use crate::session::{unix_now, Session, DEFAULT_SESSION_LIFETIME};
use crate::{CipherSuite, TlsVersion};

use super::codec::{encode_client_hello, encode_finished, ClientHello, ServerHello};
use super::codec12::{
    decode_certificate12, decode_certificate_request12, decode_new_session_ticket12,
    decode_server_hello_done, decode_server_key_exchange, encode_certificate12,
    encode_client_key_exchange, Certificate12Msg, CertificateRequest12Msg,
    ClientKeyExchangePayload, ServerKeyExchangeParams,
};
use super::extensions_codec::{
    build_alpn, build_ec_point_formats, build_encrypt_then_mac, build_extended_master_secret,
    build_renegotiation_info, build_server_name, build_session_ticket,
    build_signature_algorithms, build_supported_groups, parse_alpn_selected, parse_empty,
    parse_renegotiation_info,
};
use super::key_exchange::{
    psk_pre_master, rsa_client_pre_master, KeyExchange, PreMaster,
};
use super::negotiate::{check_renegotiation_initial, select_signature_scheme};
use super::verify::{check_finished12, signed_params_payload};
use super::{
    Flight, FlightStatus, HandshakeMessage, HandshakeState, HandshakeType, MessageFramer,
};

/// Record-layer epoch once the CCS fires.
const EPOCH_TRAFFIC: u16 = 1;

/// Verify data of the previous handshake, carried into renegotiation.
#[derive(Clone)]
pub struct RenegotiationState {
    pub client_verify_data: Vec<u8>,
    pub server_verify_data: Vec<u8>,
}

pub struct ClientHandshake12 {
    config: Arc<TlsConfig>,
    version: TlsVersion,
    state: HandshakeState,
    transcript: TranscriptHash,
    framer: MessageFramer,
    params: Option<Tls12CipherSuiteParams>,
    client_random: [u8; 32],
    server_random: [u8; 32],
    offered_session_id: Vec<u8>,
    /// Session id the server assigned (its ServerHello echo).
    server_session_id: Vec<u8>,
    offered_session: Option<Arc<Session>>,
    offered_suites: Vec<CipherSuite>,
    offered_ems: bool,
    renegotiation: Option<RenegotiationState>,
    /// DTLS: first hello retained until we know whether a cookie
    /// exchange excludes it from the transcript.
    unconfirmed_hello: Option<Vec<u8>>,
    #[cfg(feature = "dtls12")]
    cookie: Vec<u8>,
    negotiated_ems: bool,
    negotiated_etm: bool,
    negotiated_alpn: Option<Vec<u8>>,
    resumed: bool,
    ticket_expected: bool,
    received_ticket: Option<Vec<u8>>,
    server_cert_chain: Vec<CertHandle>,
    server_kx: Option<ServerKeyExchangeParams>,
    cert_request: Option<CertificateRequest12Msg>,
    provided_psk: Option<(Vec<u8>, Vec<u8>)>,
    pending_hello_done: bool,
    master_secret: Vec<u8>,
    client_verify_data: Vec<u8>,
    server_verify_data: Vec<u8>,
    secure_renegotiation: bool,
}

impl Drop for ClientHandshake12 {
    fn drop(&mut self) {
        self.master_secret.zeroize();
        if let Some((_, psk)) = &mut self.provided_psk {
            psk.zeroize();
        }
    }
}

impl ClientHandshake12 {
    pub fn new(config: Arc<TlsConfig>, version: TlsVersion) -> Self {
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
            version,
            state: HandshakeState::Idle,
            transcript: TranscriptHash::new(),
            framer,
            params: None,
            client_random: [0; 32],
            server_random: [0; 32],
            offered_session_id: Vec::new(),
            server_session_id: Vec::new(),
            offered_session: None,
            offered_suites: Vec::new(),
            offered_ems: false,
            renegotiation: None,
            unconfirmed_hello: None,
            #[cfg(feature = "dtls12")]
            cookie: Vec::new(),
            negotiated_ems: false,
            negotiated_etm: false,
            negotiated_alpn: None,
            resumed: false,
            ticket_expected: false,
            received_ticket: None,
            server_cert_chain: Vec::new(),
            server_kx: None,
            cert_request: None,
            provided_psk: None,
            pending_hello_done: false,
            master_secret: Vec::new(),
            client_verify_data: Vec::new(),
            server_verify_data: Vec::new(),
            secure_renegotiation: false,
        }
    }

    /// A renegotiating handshake on an established connection.
    pub fn renegotiate(
        config: Arc<TlsConfig>,
        version: TlsVersion,
        previous: RenegotiationState,
    ) -> Self {
        let mut hs = Self::new(config, version);
        hs.renegotiation = Some(previous);
        hs
    }

    /// Continue a handshake whose ServerHello downgraded a 1.3 offer.
    pub fn from_downgrade(
        config: Arc<TlsConfig>,
        ctx: super::DowngradeContext,
    ) -> Result<(Self, Flight), TlsError> {
        let client = ctx
            .client
            .ok_or_else(|| TlsError::Internal("downgrade context missing client state".into()))?;
        let mut hs = Self::new(config, ctx.version);
        hs.client_random = client.client_random;
        hs.offered_session_id = client.offered_session_id;
        hs.offered_suites = client.offered_suites;
        hs.offered_ems = client.offered_ems;
        hs.transcript = client.transcript;
        hs.state = HandshakeState::WaitServerHello;
        let msg = HandshakeMessage {
            msg_type: HandshakeType::ServerHello,
            body: ctx.trigger_raw[4..].to_vec(),
            raw: ctx.trigger_raw,
        };
        let flight = hs.on_message(&msg)?;
        Ok((hs, flight))
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

    /// Build and send the ClientHello.
    pub fn start(&mut self) -> Result<Flight, TlsError> {
        if self.state != HandshakeState::Idle {
            return Err(TlsError::Internal("client handshake already started".into()));
        }
        self.config.crypto.drbg_random(&mut self.client_random)?;
        self.pick_resumption_offer()?;

        let ch = self.build_client_hello()?;
        if self.version.is_datagram() {
            // Excluded from the transcript until we know whether the
            // server runs a cookie exchange.
            self.unconfirmed_hello = Some(ch.clone());
        } else {
            self.transcript.update(&ch)?;
        }
        self.state = HandshakeState::WaitServerHello;
        let mut flight = Flight::in_progress();
        flight.push_message(ch);
        flight.push_command(RecordCommand::Flush);
        Ok(flight)
    }

    fn pick_resumption_offer(&mut self) -> Result<(), TlsError> {
        if self.renegotiation.is_some() && !self.config.resume_on_renego {
            return Ok(());
        }
        let now = unix_now();
        if let Some(session) = &self.config.resumption_session {
            if session.version == self.version && session.is_live(now) {
                self.offered_session = Some(Arc::clone(session));
                if session.ticket.is_some() && self.config.ticket_support {
                    // RFC 5077 §3.4: pair the ticket with a fresh
                    // session id so acceptance is visible in the echo.
                    let mut sid = vec![0u8; 32];
                    self.config.crypto.drbg_random(&mut sid)?;
                    self.offered_session_id = sid;
                } else {
                    self.offered_session_id = session.session_id.clone();
                }
            }
        }
        Ok(())
    }

    fn is_tlcp(&self) -> bool {
        self.version == TlsVersion::Tlcp11
    }

    fn build_client_hello(&mut self) -> Result<Vec<u8>, TlsError> {
        let config = Arc::clone(&self.config);
        let mut suites = config.cipher_suites.clone();
        let mut extensions = Vec::new();

        match &self.renegotiation {
            Some(prev) => {
                extensions.push(build_renegotiation_info(&prev.client_verify_data));
            }
            None => {
                suites.push(CipherSuite::TLS_EMPTY_RENEGOTIATION_INFO_SCSV);
            }
        }
        if !self.is_tlcp() {
            if let Some(name) = &config.server_name {
                extensions.push(build_server_name(name));
            }
            extensions.push(build_supported_groups(&config.groups));
            extensions.push(build_signature_algorithms(&config.signature_algorithms));
            extensions.push(build_ec_point_formats());
            if config.extended_master_secret {
                self.offered_ems = true;
                extensions.push(build_extended_master_secret());
            }
            if config.encrypt_then_mac {
                extensions.push(build_encrypt_then_mac());
            }
            if config.ticket_support {
                let ticket = self
                    .offered_session
                    .as_ref()
                    .and_then(|s| s.ticket.clone())
                    .unwrap_or_default();
                extensions.push(build_session_ticket(&ticket));
            }
            if !config.alpn_protocols.is_empty() {
                extensions.push(build_alpn(&config.alpn_protocols));
            }
        }
        self.offered_suites = suites.clone();

        let hello = ClientHello {
            legacy_version: self.version.wire(),
            random: self.client_random,
            session_id: self.offered_session_id.clone(),
            #[cfg(feature = "dtls12")]
            cookie: self.cookie.clone(),
            cipher_suites: suites,
            compression_methods: vec![0],
            extensions,
            binders_offset: None,
        };
        let msg = encode_client_hello(&hello)?;
        Ok(self.framer.reframe(msg))
    }

    /// Provide PSK material after a `NeedsPskCallback` suspension.
    pub fn provide_psk(&mut self, identity: Vec<u8>, psk: Vec<u8>) {
        self.provided_psk = Some((identity, psk));
    }

    /// Re-enter after a suspension at ServerHelloDone.
    pub fn resume(&mut self) -> Result<Flight, TlsError> {
        if !self.pending_hello_done {
            return Err(TlsError::Internal("nothing suspended".into()));
        }
        self.pending_hello_done = false;
        self.build_client_flight()
    }

    /// Feed one complete handshake message.
    pub fn on_message(&mut self, msg: &HandshakeMessage) -> Result<Flight, TlsError> {
        match (self.state, msg.msg_type) {
            (HandshakeState::WaitServerHello, HandshakeType::ServerHello) => {
                let sh = super::codec::decode_server_hello(&msg.body)?;
                self.on_server_hello(&sh, &msg.raw)
            }
            #[cfg(feature = "dtls12")]
            (HandshakeState::WaitServerHello, HandshakeType::HelloVerifyRequest) => {
                self.on_hello_verify_request(&msg.body)
            }
            (HandshakeState::WaitCertCertReq, HandshakeType::Certificate) => {
                self.on_certificate(&msg.body, &msg.raw)
            }
            (
                HandshakeState::WaitCertCertReq | HandshakeState::WaitServerKeyExchange,
                HandshakeType::ServerKeyExchange,
            ) => self.on_server_key_exchange(&msg.body, &msg.raw),
            (
                HandshakeState::WaitServerKeyExchange | HandshakeState::WaitServerHelloDone,
                HandshakeType::CertificateRequest,
            ) => {
                self.cert_request = Some(decode_certificate_request12(&msg.body)?);
                self.transcript.update(&msg.raw)?;
                self.state = HandshakeState::WaitServerHelloDone;
                Ok(Flight::in_progress())
            }
            (
                HandshakeState::WaitCertCertReq
                | HandshakeState::WaitServerKeyExchange
                | HandshakeState::WaitServerHelloDone,
                HandshakeType::ServerHelloDone,
            ) => {
                decode_server_hello_done(&msg.body)?;
                self.transcript.update(&msg.raw)?;
                self.build_client_flight()
            }
            (HandshakeState::WaitServerCcs, HandshakeType::NewSessionTicket) => {
                if !self.ticket_expected {
                    return Err(TlsError::UnexpectedMessage(
                        "NewSessionTicket was not announced".into(),
                    ));
                }
                let nst = decode_new_session_ticket12(&msg.body)?;
                self.received_ticket = Some(nst.ticket);
                self.transcript.update(&msg.raw)?;
                Ok(Flight::in_progress())
            }
            (HandshakeState::WaitFinished, HandshakeType::Finished) => {
                self.on_server_finished(&msg.body, &msg.raw)
            }
            // A HelloRequest mid-handshake is ignored (RFC 5246 §7.4.1.1);
            // the established-connection case is intercepted upstream.
            (_, HandshakeType::HelloRequest) => Ok(Flight::in_progress()),
            (state, ty) => Err(TlsError::UnexpectedMessage(format!(
                "{ty:?} in state {state:?}"
            ))),
        }
    }

    #[cfg(feature = "dtls12")]
    fn on_hello_verify_request(&mut self, body: &[u8]) -> Result<Flight, TlsError> {
        let hvr = super::codec_dtls::decode_hello_verify_request(body)?;
        if !self.cookie.is_empty() {
            return Err(TlsError::UnexpectedMessage(
                "second HelloVerifyRequest".into(),
            ));
        }
        if hvr.cookie.is_empty() {
            return Err(TlsError::IllegalParameter("empty cookie".into()));
        }
        self.cookie = hvr.cookie;
        // Cookie exchange: neither the first hello nor the request
        // enters the transcript or verify_data.
        self.unconfirmed_hello = None;
        let ch = self.build_client_hello()?;
        self.transcript.update(&ch)?;
        let mut flight = Flight::in_progress();
        flight.push_message(ch);
        flight.push_command(RecordCommand::Flush);
        Ok(flight)
    }

    fn on_server_hello(&mut self, sh: &ServerHello, raw: &[u8]) -> Result<Flight, TlsError> {
        if sh.legacy_version != self.version.wire() {
            return Err(TlsError::ProtocolVersion(format!(
                "server selected {:#06x}",
                sh.legacy_version
            )));
        }
        if !self.offered_suites.contains(&sh.cipher_suite) {
            return Err(TlsError::IllegalParameter(
                "server selected an unoffered suite".into(),
            ));
        }
        if sh.compression_method != 0 {
            return Err(TlsError::IllegalParameter("non-null compression".into()));
        }
        let params = Tls12CipherSuiteParams::from_suite(sh.cipher_suite)?;
        self.server_random = sh.random;
        self.server_session_id = sh.session_id.clone();

        // A DTLS hello that skipped the cookie exchange keeps CH1.
        if let Some(ch1) = self.unconfirmed_hello.take() {
            self.transcript.update(&ch1)?;
        }
        self.transcript
            .select_hash(self.config.crypto.as_ref(), params.hash)?;
        self.transcript.update(raw)?;

        // Extension acceptance
        let mut saw_ems = false;
        let mut saw_etm = false;
        let mut renego_info: Option<Vec<u8>> = None;
        for ext in &sh.extensions {
            match ext.extension_type {
                ExtensionType::EXTENDED_MASTER_SECRET => {
                    parse_empty(&ext.data, "extended_master_secret")?;
                    saw_ems = true;
                }
                ExtensionType::ENCRYPT_THEN_MAC => {
                    parse_empty(&ext.data, "encrypt_then_mac")?;
                    saw_etm = true;
                }
                ExtensionType::RENEGOTIATION_INFO => {
                    renego_info = Some(parse_renegotiation_info(&ext.data)?);
                }
                ExtensionType::SESSION_TICKET => {
                    parse_empty(&ext.data, "session_ticket")?;
                    self.ticket_expected = true;
                }
                ExtensionType::APPLICATION_LAYER_PROTOCOL_NEGOTIATION => {
                    let proto = parse_alpn_selected(&ext.data)?;
                    if !self.config.alpn_protocols.contains(&proto) {
                        return Err(TlsError::NoApplicationProtocol);
                    }
                    self.negotiated_alpn = Some(proto);
                }
                ExtensionType::EC_POINT_FORMATS | ExtensionType::SERVER_NAME => {}
                other => {
                    return Err(TlsError::UnsupportedExtension(format!(
                        "unrequested ServerHello extension {}",
                        other.0
                    )))
                }
            }
        }

        if !saw_ems && self.offered_ems {
            if let Some(session) = &self.offered_session {
                if session.extended_master_secret {
                    return Err(TlsError::HandshakeFailure(
                        "server dropped extended master secret on resumption".into(),
                    ));
                }
            }
        }
        self.negotiated_ems = saw_ems && self.offered_ems;
        self.negotiated_etm = saw_etm && self.config.encrypt_then_mac && params.is_cbc;

        match &self.renegotiation {
            None => {
                self.secure_renegotiation =
                    check_renegotiation_initial(false, renego_info.as_deref())?;
            }
            Some(prev) => {
                let mut expected = prev.client_verify_data.clone();
                expected.extend_from_slice(&prev.server_verify_data);
                let info = renego_info.ok_or_else(|| {
                    TlsError::HandshakeFailure("renegotiation without renegotiation_info".into())
                })?;
                if !self.config.crypto.ct_eq(&info, &expected) {
                    return Err(TlsError::HandshakeFailure(
                        "renegotiation_info mismatch".into(),
                    ));
                }
            }
        }

        // Abbreviated handshake when the echo matches our offer.
        if !sh.session_id.is_empty() && sh.session_id == self.offered_session_id {
            let session = self.offered_session.clone().ok_or_else(|| {
                TlsError::IllegalParameter("server resumed a session we never offered".into())
            })?;
            if session.cipher_suite != sh.cipher_suite {
                return Err(TlsError::IllegalParameter(
                    "resumed session under a different suite".into(),
                ));
            }
            if session.extended_master_secret && !self.negotiated_ems {
                return Err(TlsError::HandshakeFailure(
                    "resumption dropped extended master secret".into(),
                ));
            }
            self.resumed = true;
            self.master_secret = session.master_secret.clone();
            self.server_cert_chain = session.peer_certs.clone();
            self.params = Some(params);
            self.state = HandshakeState::WaitServerCcs;
            return Ok(Flight::in_progress());
        }

        self.params = Some(params);
        self.state = HandshakeState::WaitCertCertReq;
        Ok(Flight::in_progress())
    }

    fn on_certificate(&mut self, body: &[u8], raw: &[u8]) -> Result<Flight, TlsError> {
        let params = self
            .params
            .clone()
            .ok_or_else(|| TlsError::Internal("no negotiated suite".into()))?;
        let msg = decode_certificate12(body)?;
        if msg.certificate_list.is_empty() {
            return Err(TlsError::HandshakeFailure("empty server certificate".into()));
        }
        let mut chain = Vec::with_capacity(msg.certificate_list.len());
        for der in &msg.certificate_list {
            chain.push(self.config.certs.parse(der)?);
        }
        if self.config.verify_peer {
            let usage = match params.kx_alg {
                KeyExchangeAlg::Rsa | KeyExchangeAlg::RsaPsk => KeyUsage::KeyEncipherment,
                _ => KeyUsage::DigitalSignature,
            };
            let result = self.config.certs.verify_chain(
                &chain,
                self.config.server_name.as_deref(),
                usage,
                unix_now(),
            );
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
        }
        self.server_cert_chain = chain;
        self.transcript.update(raw)?;
        self.state = if params.kx_alg.sends_server_key_exchange(true) {
            // A hint-less PSK/RSA server may still skip SKE; both are
            // accepted from WaitServerKeyExchange.
            HandshakeState::WaitServerKeyExchange
        } else {
            HandshakeState::WaitServerHelloDone
        };
        Ok(Flight::in_progress())
    }

    fn on_server_key_exchange(&mut self, body: &[u8], raw: &[u8]) -> Result<Flight, TlsError> {
        let params = self
            .params
            .clone()
            .ok_or_else(|| TlsError::Internal("no negotiated suite".into()))?;
        let ske = decode_server_key_exchange(body, params.kx_alg)?;

        // Signed parameter validation for the certificate-backed modes.
        match &ske {
            ServerKeyExchangeParams::Ecdhe(p) => {
                if !self.config.groups.contains(&p.curve) {
                    return Err(TlsError::IllegalParameter(
                        "server chose an unoffered curve".into(),
                    ));
                }
                let signed = p.signature.as_ref().ok_or_else(|| {
                    TlsError::Decode("unsigned ECDHE parameters".into())
                })?;
                let mut raw_params = vec![3u8];
                raw_params.extend_from_slice(&p.curve.0.to_be_bytes());
                raw_params.push(p.public.len() as u8);
                raw_params.extend_from_slice(&p.public);
                self.verify_signed_params(&raw_params, signed.scheme.0, &signed.signature)?;
            }
            ServerKeyExchangeParams::Dhe(p) => {
                let signed = p.signature.as_ref().ok_or_else(|| {
                    TlsError::Decode("unsigned DHE parameters".into())
                })?;
                let mut raw_params = Vec::new();
                for field in [&p.p, &p.g, &p.public] {
                    raw_params.extend_from_slice(&(field.len() as u16).to_be_bytes());
                    raw_params.extend_from_slice(field);
                }
                self.verify_signed_params(&raw_params, signed.scheme.0, &signed.signature)?;
            }
            #[cfg(feature = "tlcp")]
            ServerKeyExchangeParams::TlcpEcc { signature } => {
                // Signature over randoms || encryption certificate.
                let enc_cert = self.tlcp_enc_cert()?;
                self.verify_signed_params(
                    enc_cert.der(),
                    crate::crypt::SignatureScheme::SM2_SM3.0,
                    signature,
                )?;
            }
            _ => {}
        }

        self.server_kx = Some(ske);
        self.transcript.update(raw)?;
        self.state = HandshakeState::WaitServerHelloDone;
        Ok(Flight::in_progress())
    }

    fn verify_signed_params(
        &self,
        params_bytes: &[u8],
        scheme: u16,
        signature: &[u8],
    ) -> Result<(), TlsError> {
        let leaf = self
            .server_cert_chain
            .first()
            .ok_or_else(|| TlsError::UnexpectedMessage("ServerKeyExchange before Certificate".into()))?;
        let payload = signed_params_payload(&self.client_random, &self.server_random, params_bytes);
        self.config
            .crypto
            .verify(&leaf.public_key(), scheme, &payload, signature)
            .map_err(|_| TlsError::DecryptError("ServerKeyExchange signature".into()))
    }

    /// The TLCP encryption certificate is the second entry of the
    /// server chain.
    #[cfg(feature = "tlcp")]
    fn tlcp_enc_cert(&self) -> Result<&CertHandle, TlsError> {
        self.server_cert_chain.get(1).ok_or_else(|| {
            TlsError::BadCertificate("TLCP requires signing and encryption certificates".into())
        })
    }

    fn client_psk(&self, hint: Option<&[u8]>) -> Result<Option<(Vec<u8>, Vec<u8>)>, TlsError> {
        if let Some(p) = &self.provided_psk {
            return Ok(Some(p.clone()));
        }
        if let Some(cb) = &self.config.psk_client_use {
            return Ok(cb(hint));
        }
        if let Some(p) = self.config.external_psks.first() {
            return Ok(Some((p.identity.clone(), p.key.clone())));
        }
        Ok(None)
    }

    fn psk_hint(&self) -> Option<Vec<u8>> {
        match &self.server_kx {
            Some(ServerKeyExchangeParams::PskHint { hint }) => Some(hint.clone()),
            Some(ServerKeyExchangeParams::EcdhePsk { hint, .. }) => Some(hint.clone()),
            Some(ServerKeyExchangeParams::DhePsk { hint, .. }) => Some(hint.clone()),
            _ => None,
        }
    }

    /// Build the ClientKeyExchange payload plus the pre-master secret.
    fn build_key_exchange(
        &mut self,
        params: &Tls12CipherSuiteParams,
    ) -> Result<Option<(ClientKeyExchangePayload, PreMaster)>, TlsError> {
        let provider = Arc::clone(&self.config.crypto);
        let hint = self.psk_hint();
        let mut psk_material = if params.kx_alg.is_psk() {
            match self.client_psk(hint.as_deref())? {
                Some(m) => Some(m),
                None => return Ok(None), // suspend for the application
            }
        } else {
            None
        };
        let mut take_psk = || {
            psk_material
                .take()
                .ok_or_else(|| TlsError::Internal("psk material missing".into()))
        };

        let out = match params.kx_alg {
            KeyExchangeAlg::Rsa => {
                let leaf = self.server_cert_chain.first().ok_or_else(|| {
                    TlsError::Internal("RSA key exchange without certificate".into())
                })?;
                let (pm, encrypted) = rsa_client_pre_master(
                    provider.as_ref(),
                    self.version,
                    &leaf.public_key(),
                )?;
                (
                    ClientKeyExchangePayload::Rsa {
                        encrypted_pre_master: encrypted,
                    },
                    pm,
                )
            }
            KeyExchangeAlg::Ecdhe => {
                let (curve, peer_public) = match &self.server_kx {
                    Some(ServerKeyExchangeParams::Ecdhe(p)) => (p.curve, p.public.clone()),
                    _ => {
                        return Err(TlsError::UnexpectedMessage(
                            "missing ECDHE ServerKeyExchange".into(),
                        ))
                    }
                };
                let kx = KeyExchange::generate(provider.as_ref(), curve)?;
                let pm = kx.derive(&peer_public)?;
                (
                    ClientKeyExchangePayload::Ecdhe {
                        public: kx.public_bytes().to_vec(),
                    },
                    pm,
                )
            }
            KeyExchangeAlg::Dhe => {
                let (p_len, peer_public) = match &self.server_kx {
                    Some(ServerKeyExchangeParams::Dhe(p)) => (p.p.len(), p.public.clone()),
                    _ => {
                        return Err(TlsError::UnexpectedMessage(
                            "missing DHE ServerKeyExchange".into(),
                        ))
                    }
                };
                let group = ffdhe_group_for(p_len)?;
                let kx = KeyExchange::generate(provider.as_ref(), group)?;
                let pm = kx.derive(&peer_public)?;
                (
                    ClientKeyExchangePayload::Dhe {
                        public: kx.public_bytes().to_vec(),
                    },
                    pm,
                )
            }
            KeyExchangeAlg::Psk => {
                let (identity, psk) = take_psk()?;
                let pm = psk_pre_master(None, &psk);
                (ClientKeyExchangePayload::Psk { identity }, pm)
            }
            KeyExchangeAlg::EcdhePsk => {
                let (identity, psk) = take_psk()?;
                let (curve, peer_public) = match &self.server_kx {
                    Some(ServerKeyExchangeParams::EcdhePsk { params, .. }) => {
                        (params.curve, params.public.clone())
                    }
                    _ => {
                        return Err(TlsError::UnexpectedMessage(
                            "missing ECDHE_PSK ServerKeyExchange".into(),
                        ))
                    }
                };
                let kx = KeyExchange::generate(provider.as_ref(), curve)?;
                let shared = kx.derive(&peer_public)?;
                let pm = psk_pre_master(Some(&shared.0), &psk);
                (
                    ClientKeyExchangePayload::EcdhePsk {
                        identity,
                        public: kx.public_bytes().to_vec(),
                    },
                    pm,
                )
            }
            KeyExchangeAlg::DhePsk => {
                let (identity, psk) = take_psk()?;
                let (p_len, peer_public) = match &self.server_kx {
                    Some(ServerKeyExchangeParams::DhePsk { params, .. }) => {
                        (params.p.len(), params.public.clone())
                    }
                    _ => {
                        return Err(TlsError::UnexpectedMessage(
                            "missing DHE_PSK ServerKeyExchange".into(),
                        ))
                    }
                };
                let group = ffdhe_group_for(p_len)?;
                let kx = KeyExchange::generate(provider.as_ref(), group)?;
                let shared = kx.derive(&peer_public)?;
                let pm = psk_pre_master(Some(&shared.0), &psk);
                (
                    ClientKeyExchangePayload::DhePsk {
                        identity,
                        public: kx.public_bytes().to_vec(),
                    },
                    pm,
                )
            }
            KeyExchangeAlg::RsaPsk => {
                let (identity, psk) = take_psk()?;
                let leaf = self.server_cert_chain.first().ok_or_else(|| {
                    TlsError::Internal("RSA_PSK key exchange without certificate".into())
                })?;
                let (rsa_pm, encrypted) = rsa_client_pre_master(
                    provider.as_ref(),
                    self.version,
                    &leaf.public_key(),
                )?;
                let pm = psk_pre_master(Some(&rsa_pm.0), &psk);
                (
                    ClientKeyExchangePayload::RsaPsk {
                        identity,
                        encrypted_pre_master: encrypted,
                    },
                    pm,
                )
            }
            #[cfg(feature = "tlcp")]
            KeyExchangeAlg::Ecc => {
                let enc_cert = self.tlcp_enc_cert()?;
                let (pm, encrypted) = super::key_exchange::tlcp_client_pre_master(
                    provider.as_ref(),
                    &enc_cert.public_key(),
                )?;
                (
                    ClientKeyExchangePayload::TlcpEcc {
                        encrypted_pre_master: encrypted,
                    },
                    pm,
                )
            }
        };
        Ok(Some(out))
    }

    fn build_client_flight(&mut self) -> Result<Flight, TlsError> {
        let provider = Arc::clone(&self.config.crypto);
        let params = self
            .params
            .clone()
            .ok_or_else(|| TlsError::Internal("no negotiated suite".into()))?;

        // ClientKeyExchange material first: a missing PSK suspends the
        // flight before anything is emitted or hashed.
        let (payload, pre_master) = match self.build_key_exchange(&params)? {
            Some(v) => v,
            None => {
                self.pending_hello_done = true;
                return Ok(Flight {
                    items: Vec::new(),
                    status: FlightStatus::NeedsPskCallback,
                    session: None,
                });
            }
        };

        let mut flight = Flight::in_progress();

        // Client certificate first, when requested.
        let client_cred = if self.cert_request.is_some() {
            let cred = self.config.credentials.first().cloned();
            let chain = cred
                .as_ref()
                .map(|c| c.chain.clone())
                .unwrap_or_default();
            let cert_msg = self.framer.reframe(encode_certificate12(&Certificate12Msg {
                certificate_list: chain,
            }));
            self.transcript.update(&cert_msg)?;
            flight.push_message(cert_msg);
            cred
        } else {
            None
        };

        let cke = self.framer.reframe(encode_client_key_exchange(&payload));
        self.transcript.update(&cke)?;
        flight.push_message(cke);

        // Master secret: EMS binds the session hash through the CKE.
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
        drop(pre_master);

        // CertificateVerify when we actually sent a certificate.
        if let Some(cred) = client_cred {
            if !cred.chain.is_empty() {
                let peer_schemes = self
                    .cert_request
                    .as_ref()
                    .map(|cr| cr.signature_algorithms.clone())
                    .unwrap_or_default();
                let scheme = select_signature_scheme(
                    &self.config,
                    &peer_schemes,
                    cred.private_key.key_type,
                    false,
                )?;
                let digest = self.transcript.digest()?;
                let signature = provider.sign(
                    cred.private_key.key_type,
                    &cred.private_key.der,
                    scheme.0,
                    &digest,
                )?;
                let cv = self.framer.reframe(super::codec::encode_certificate_verify(
                    &super::codec::CertificateVerifyMsg {
                        algorithm: scheme,
                        signature,
                    },
                ));
                self.transcript.update(&cv)?;
                flight.push_message(cv);
            }
        }

        // Change cipher spec, then Finished under the new keys.
        flight.push_command(RecordCommand::WriteCcs);
        flight.push_command(self.traffic_key_command(&params, KeyDirection::Write)?);

        let digest = self.transcript.digest()?;
        self.client_verify_data =
            prf::verify_data(provider.as_ref(), params.hash, &self.master_secret, true, &digest)?;
        let fin = self
            .framer
            .reframe(encode_finished(&self.client_verify_data));
        self.transcript.update(&fin)?;
        flight.push_message(fin);
        flight.push_command(RecordCommand::Flush);

        self.state = HandshakeState::WaitServerCcs;
        Ok(flight)
    }

    /// Key material for one direction:
    /// mac_key || key || iv slice of the key block.
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
        // The client writes with the client-side slice and reads with
        // the server-side slice.
        let client_side = direction == KeyDirection::Write;
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

    /// The record layer saw the server's ChangeCipherSpec.
    pub fn on_ccs_received(&mut self) -> Result<Flight, TlsError> {
        if self.state != HandshakeState::WaitServerCcs {
            return Err(TlsError::UnexpectedMessage("change_cipher_spec".into()));
        }
        let params = self
            .params
            .clone()
            .ok_or_else(|| TlsError::Internal("no negotiated suite".into()))?;
        let command = self.traffic_key_command(&params, KeyDirection::Read)?;
        self.state = HandshakeState::WaitFinished;
        let mut flight = Flight::in_progress();
        flight.push_command(command);
        Ok(flight)
    }

    fn on_server_finished(&mut self, body: &[u8], raw: &[u8]) -> Result<Flight, TlsError> {
        let provider = Arc::clone(&self.config.crypto);
        let params = self
            .params
            .clone()
            .ok_or_else(|| TlsError::Internal("no negotiated suite".into()))?;
        let fin = super::codec::decode_finished(body, VERIFY_DATA_LEN)?;
        let digest = self.transcript.digest()?;
        check_finished12(
            provider.as_ref(),
            params.hash,
            &self.master_secret,
            false,
            &digest,
            &fin.verify_data,
        )?;
        self.server_verify_data = fin.verify_data.clone();
        self.transcript.update(raw)?;

        let mut flight = Flight::in_progress();
        flight.status = FlightStatus::Complete;
        if self.resumed {
            // Abbreviated handshake: our CCS + Finished answer the
            // server's.
            flight.push_command(RecordCommand::WriteCcs);
            flight.push_command(self.traffic_key_command(&params, KeyDirection::Write)?);
            let digest = self.transcript.digest()?;
            self.client_verify_data = prf::verify_data(
                provider.as_ref(),
                params.hash,
                &self.master_secret,
                true,
                &digest,
            )?;
            let fin_msg = self
                .framer
                .reframe(encode_finished(&self.client_verify_data));
            self.transcript.update(&fin_msg)?;
            flight.push_message(fin_msg);
            flight.push_command(RecordCommand::Flush);
        }

        flight.session = self.build_session()?;
        self.state = HandshakeState::Connected;
        Ok(flight)
    }

    fn build_session(&self) -> Result<Option<Arc<Session>>, TlsError> {
        if !self.config.session_cache_mode.caches_client() && self.received_ticket.is_none() {
            return Ok(None);
        }
        let params = self
            .params
            .as_ref()
            .ok_or_else(|| TlsError::Internal("no negotiated suite".into()))?;
        let session_id = if self.resumed {
            self.offered_session
                .as_ref()
                .map(|s| s.session_id.clone())
                .unwrap_or_default()
        } else {
            // The server's assigned id names the cacheable session.
            self.server_session_id.clone()
        };
        let mut auth_hash = Vec::new();
        if let Some(leaf) = self.server_cert_chain.first() {
            let mut h = self.config.crypto.hash_new(params.hash)?;
            h.update(leaf.der())?;
            auth_hash = vec![0u8; params.hash_len()];
            h.finish(&mut auth_hash)?;
        }
        Ok(Some(Arc::new(Session {
            version: self.version,
            cipher_suite: params.suite,
            master_secret: self.master_secret.clone(),
            session_id,
            ticket: self
                .received_ticket
                .clone()
                .or_else(|| self.offered_session.as_ref().and_then(|s| s.ticket.clone())),
            session_id_context: self.config.session_id_context.clone(),
            extended_master_secret: self.negotiated_ems,
            server_name: self.config.server_name.clone(),
            peer_certs: self.server_cert_chain.clone(),
            auth_id_hash: auth_hash,
            lifetime: DEFAULT_SESSION_LIFETIME,
            created_at: unix_now(),
            ticket_age_add: 0,
        })))
    }
}

/// Map an explicit DHE modulus length onto the provider's FFDHE groups.
fn ffdhe_group_for(p_len: usize) -> Result<NamedGroup, TlsError> {
    match p_len {
        256 => Ok(NamedGroup::FFDHE2048),
        384 => Ok(NamedGroup::FFDHE3072),
        other => Err(TlsError::IllegalParameter(format!(
            "unsupported DHE modulus length {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::codec::{decode_client_hello, parse_handshake_header};
    use crate::testing::{MockCertProvider, MockProvider};

    fn config() -> Arc<TlsConfig> {
        Arc::new(
            TlsConfig::builder(Arc::new(MockProvider::new()), Arc::new(MockCertProvider))
                .versions(TlsVersion::Tls12, TlsVersion::Tls12)
                .server_name("legacy.example")
                .build(),
        )
    }

    #[test]
    fn test_start_offers_scsv_and_legacy_extensions() {
        let mut client = ClientHandshake12::new(config(), TlsVersion::Tls12);
        let flight = client.start().unwrap();
        let messages: Vec<&[u8]> = flight.messages().collect();
        let (ty, body, _) = parse_handshake_header(messages[0]).unwrap();
        assert_eq!(ty, HandshakeType::ClientHello);
        let ch = decode_client_hello(body, false).unwrap();
        assert_eq!(ch.legacy_version, 0x0303);
        assert!(ch.offers_scsv());
        assert!(ch.has_extension(ExtensionType::EXTENDED_MASTER_SECRET));
        assert!(ch.has_extension(ExtensionType::ENCRYPT_THEN_MAC));
        assert!(ch.has_extension(ExtensionType::SESSION_TICKET));
        assert!(!ch.has_extension(ExtensionType::SUPPORTED_VERSIONS));
        assert_eq!(client.state(), HandshakeState::WaitServerHello);
    }

    #[test]
    fn test_renegotiation_hello_carries_verify_data_not_scsv() {
        let prev = RenegotiationState {
            client_verify_data: vec![0xAB; 12],
            server_verify_data: vec![0xCD; 12],
        };
        let mut client = ClientHandshake12::renegotiate(config(), TlsVersion::Tls12, prev);
        let flight = client.start().unwrap();
        let messages: Vec<&[u8]> = flight.messages().collect();
        let (_, body, _) = parse_handshake_header(messages[0]).unwrap();
        let ch = decode_client_hello(body, false).unwrap();
        assert!(!ch.offers_scsv());
        let info = ch
            .find_extension(ExtensionType::RENEGOTIATION_INFO)
            .unwrap();
        assert_eq!(parse_renegotiation_info(info).unwrap(), vec![0xAB; 12]);
    }

    #[cfg(feature = "tlcp")]
    #[test]
    fn test_tlcp_hello_is_extension_light() {
        let cfg = Arc::new(
            TlsConfig::builder(Arc::new(MockProvider::new()), Arc::new(MockCertProvider))
                .versions(TlsVersion::Tlcp11, TlsVersion::Tlcp11)
                .cipher_suites(vec![CipherSuite::TLCP_ECC_SM4_CBC_SM3])
                .server_name("sm.example")
                .build(),
        );
        let mut client = ClientHandshake12::new(cfg, TlsVersion::Tlcp11);
        let flight = client.start().unwrap();
        let messages: Vec<&[u8]> = flight.messages().collect();
        let (_, body, _) = parse_handshake_header(messages[0]).unwrap();
        let ch = decode_client_hello(body, false).unwrap();
        assert_eq!(ch.legacy_version, 0x0101);
        assert!(!ch.has_extension(ExtensionType::SIGNATURE_ALGORITHMS));
        assert!(!ch.has_extension(ExtensionType::SERVER_NAME));
    }

    #[test]
    fn test_unexpected_message() {
        let mut client = ClientHandshake12::new(config(), TlsVersion::Tls12);
        client.start().unwrap();
        let fin = encode_finished(&[0; 12]);
        let msg = HandshakeMessage {
            msg_type: HandshakeType::Finished,
            body: fin[4..].to_vec(),
            raw: fin,
        };
        assert!(matches!(
            client.on_message(&msg).unwrap_err(),
            TlsError::UnexpectedMessage(_)
        ));
    }

    #[test]
    fn test_ccs_out_of_order() {
        let mut client = ClientHandshake12::new(config(), TlsVersion::Tls12);
        client.start().unwrap();
        assert!(matches!(
            client.on_ccs_received().unwrap_err(),
            TlsError::UnexpectedMessage(_)
        ));
    }
}
