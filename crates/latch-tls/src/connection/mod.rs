//! The handshake coordinator: owns one connection's configuration and
//! handshake workspace, drives the per-version state machines, and
//! exposes the sans-I/O lifecycle API.
//!
//! `step` is synchronous and idempotent from the caller's viewpoint:
//! the record layer feeds reassembled handshake messages, CCS signals,
//! alerts, and decrypted application data; the coordinator returns the
//! ordered outgoing items plus a status. A `needs_*` suspension is
//! resumed exactly where it paused.


use std::sync::Arc;

use latch_types::TlsError;

use crate::alert::{Alert, AlertDescription, AlertLevel};
use crate::config::TlsConfig;
use crate::handshake::client::ClientHandshake13;
use crate::handshake::client12::{ClientHandshake12, RenegotiationState};
use crate::handshake::codec::parse_handshake_header;
use crate::handshake::server::ServerHandshake13;
use crate::handshake::server12::ServerHandshake12;
use crate::handshake::{
    Flight, FlightStatus, HandshakeMessage, HandshakeState, HandshakeType, Output,
};
use crate::provider::RecordCommand;
use crate::session::Session;
use crate::{CipherSuite, LibContext, TlsRole, TlsVersion};

/// Input events handed to [`Connection::step`] by the record layer.
pub enum StepInput<'a> {
    /// One complete (reassembled) handshake message.
    Handshake(&'a [u8]),
    /// A change_cipher_spec record arrived.
    Ccs,
    /// An alert record arrived.
    Alert(&'a [u8]),
    /// Decrypted application data arrived.
    AppData(&'a [u8]),
}

/// Caller-visible disposition after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Feed more peer input.
    WantRead,
    HandshakeComplete,
    AppDataReady,
    /// Suspended on the certificate/config decision callback.
    NeedsCertCallback,
    /// Suspended until PSK material is provided.
    NeedsPskCallback,
    Closed,
}

/// The outgoing items of one step plus its status.
#[derive(Debug)]
pub struct StepOutput {
    pub items: Vec<Output>,
    pub status: StepStatus,
}

impl StepOutput {
    fn want_read() -> Self {
        StepOutput {
            items: Vec::new(),
            status: StepStatus::WantRead,
        }
    }

    /// The handshake messages of this step, in order.
    pub fn messages(&self) -> impl Iterator<Item = &[u8]> {
        self.items.iter().filter_map(|i| match i {
            Output::Message(m) => Some(m.as_slice()),
            _ => None,
        })
    }

    /// The record-layer commands of this step, in order.
    pub fn commands(&self) -> impl Iterator<Item = &RecordCommand> {
        self.items.iter().filter_map(|i| match i {
            Output::Command(c) => Some(c),
            _ => None,
        })
    }
}

/// Where a fatal error originated.
#[derive(Debug, Clone, Copy)]
pub struct ErrorOrigin {
    pub state: HandshakeState,
    pub msg_type: Option<HandshakeType>,
}

enum Machine {
    Client13(Box<ClientHandshake13>),
    Client12(Box<ClientHandshake12>),
    Server13(Box<ServerHandshake13>),
    Server12(Box<ServerHandshake12>),
    /// Fatal-alert sink; refuses all further handshake input.
    Errored,
}

/// A TLS connection: configuration, the active handshake machine, and
/// the post-handshake bookkeeping.
pub struct Connection {
    config: Arc<TlsConfig>,
    lib_ctx: LibContext,
    machine: Machine,
    negotiated_version: Option<TlsVersion>,
    /// Session established by the last completed handshake (or ticket).
    session: Option<Arc<Session>>,
    /// Verify data of the last completed ≤1.2 handshake.
    renego_state: Option<RenegotiationState>,
    secure_renegotiation: bool,
    handshake_complete: bool,
    closed: bool,
    last_sent_alert: Option<Alert>,
    last_received_alert: Option<Alert>,
    error_origin: Option<ErrorOrigin>,
    read_buffer: Vec<u8>,
    #[cfg(feature = "dtls12")]
    flight_tracker: crate::handshake::retransmit::FlightTracker,
    #[cfg(feature = "dtls12")]
    reassembler: Option<crate::handshake::codec_dtls::FragmentReassembler>,
}

impl Connection {
    /// Create a connection; the role comes from the configuration.
    pub fn new(config: TlsConfig, lib_ctx: LibContext) -> Result<Self, TlsError> {
        let config = Arc::new(config);
        let machine = Self::initial_machine(&config, &lib_ctx)?;
        Ok(Self {
            config,
            lib_ctx,
            machine,
            negotiated_version: None,
            session: None,
            renego_state: None,
            secure_renegotiation: false,
            handshake_complete: false,
            closed: false,
            last_sent_alert: None,
            last_received_alert: None,
            error_origin: None,
            read_buffer: Vec::new(),
            #[cfg(feature = "dtls12")]
            flight_tracker: crate::handshake::retransmit::FlightTracker::new(),
            #[cfg(feature = "dtls12")]
            reassembler: None,
        })
    }

    /// A connection using the process-wide default [`LibContext`].
    pub fn with_global_context(config: TlsConfig) -> Result<Self, TlsError> {
        Self::new(config, LibContext::global().clone())
    }

    fn initial_machine(config: &Arc<TlsConfig>, lib_ctx: &LibContext) -> Result<Machine, TlsError> {
        let tls13_capable =
            config.max_version == TlsVersion::Tls13 && !config.max_version.is_datagram();
        Ok(match (config.role, tls13_capable) {
            (TlsRole::Client, true) => {
                Machine::Client13(Box::new(ClientHandshake13::new(Arc::clone(config))))
            }
            (TlsRole::Client, false) => Machine::Client12(Box::new(ClientHandshake12::new(
                Arc::clone(config),
                config.max_version,
            ))),
            (TlsRole::Server, true) => Machine::Server13(Box::new(ServerHandshake13::new(
                Arc::clone(config),
                lib_ctx.clone(),
            ))),
            (TlsRole::Server, false) => Machine::Server12(Box::new(ServerHandshake12::new(
                Arc::clone(config),
                lib_ctx.clone(),
                config.max_version,
            ))),
        })
    }

    /// Begin a client handshake: produces the first ClientHello.
    /// Servers have nothing to send and get `WantRead`.
    pub fn start(&mut self) -> Result<StepOutput, TlsError> {
        let result = match &mut self.machine {
            Machine::Client13(hs) => hs.start(),
            Machine::Client12(hs) => hs.start(),
            Machine::Server13(_) | Machine::Server12(_) => return Ok(StepOutput::want_read()),
            Machine::Errored => return Err(TlsError::ConnectionClosed),
        };
        self.absorb(result, None)
    }

    /// Drive the connection with one record-layer event.
    pub fn step(&mut self, input: StepInput<'_>) -> Result<StepOutput, TlsError> {
        if self.closed {
            return Err(TlsError::ConnectionClosed);
        }
        match input {
            StepInput::Handshake(raw) => self.step_handshake(raw),
            StepInput::Ccs => self.step_ccs(),
            StepInput::Alert(data) => self.step_alert(data),
            StepInput::AppData(data) => {
                if !self.handshake_complete {
                    let err = TlsError::UnexpectedMessage(
                        "application data during handshake".into(),
                    );
                    return self.fatal(err, None);
                }
                self.read_buffer.extend_from_slice(data);
                Ok(StepOutput {
                    items: Vec::new(),
                    status: StepStatus::AppDataReady,
                })
            }
        }
    }

    fn step_handshake(&mut self, raw: &[u8]) -> Result<StepOutput, TlsError> {
        let msg_type = raw.first().copied().and_then(HandshakeType::from_u8);

        // Renegotiation entry points live above the machines: a
        // HelloRequest on an established client, a ClientHello on an
        // established server.
        if self.handshake_complete {
            match (&self.machine, msg_type) {
                (Machine::Client12(_), Some(HandshakeType::HelloRequest)) => {
                    return self.on_hello_request();
                }
                (Machine::Server12(_), Some(HandshakeType::ClientHello)) => {
                    return self.on_renegotiation_client_hello(raw);
                }
                _ => {}
            }
        }

        let parsed = if self.config.max_version.is_datagram() {
            match self.datagram_message(raw) {
                Ok(Some(msg)) => Ok(msg),
                Ok(None) => return Ok(StepOutput::want_read()),
                Err(e) => Err(e),
            }
        } else {
            Self::to_handshake_message(raw)
        };

        let result = match (&mut self.machine, parsed) {
            (Machine::Errored, _) => Err(TlsError::UnexpectedMessage(
                "handshake message after fatal alert".into(),
            )),
            (_, Err(e)) => Err(e),
            (Machine::Client13(hs), Ok(msg)) => hs.on_message(&msg.raw),
            (Machine::Server13(hs), Ok(msg)) => hs.on_message(&msg.raw),
            (Machine::Client12(hs), Ok(msg)) => hs.on_message(&msg),
            (Machine::Server12(hs), Ok(msg)) => hs.on_message(&msg),
        };
        self.absorb(result, msg_type)
    }

    #[cfg(not(feature = "dtls12"))]
    fn datagram_message(&mut self, _raw: &[u8]) -> Result<Option<HandshakeMessage>, TlsError> {
        Err(TlsError::Internal("dtls support disabled".into()))
    }

    /// Reassemble a DTLS handshake fragment; returns the canonical
    /// unfragmented message once complete.
    #[cfg(feature = "dtls12")]
    fn datagram_message(&mut self, raw: &[u8]) -> Result<Option<HandshakeMessage>, TlsError> {
        use crate::handshake::codec_dtls::{parse_dtls_fragment, FragmentReassembler};

        let (header, fragment) = parse_dtls_fragment(raw)?;
        let complete = if header.fragment_offset == 0 && header.fragment_length == header.length {
            self.reassembler = None;
            raw[..crate::handshake::codec_dtls::DTLS_HEADER_LEN + header.fragment_length].to_vec()
        } else {
            let stale = !matches!(&self.reassembler,
                Some(r) if r.message_seq() == header.message_seq);
            if stale {
                self.reassembler = Some(FragmentReassembler::new(&header));
            }
            let reassembler = self.reassembler.as_mut().expect("just ensured");
            match reassembler.add(&header, fragment)? {
                Some(msg) => {
                    self.reassembler = None;
                    msg
                }
                None => return Ok(None),
            }
        };
        Ok(Some(HandshakeMessage {
            msg_type: header.msg_type,
            body: complete[crate::handshake::codec_dtls::DTLS_HEADER_LEN..].to_vec(),
            raw: complete,
        }))
    }

    fn to_handshake_message(raw: &[u8]) -> Result<HandshakeMessage, TlsError> {
        let (msg_type, body, consumed) = parse_handshake_header(raw)?;
        if consumed != raw.len() {
            return Err(TlsError::Decode("trailing bytes after handshake".into()));
        }
        Ok(HandshakeMessage {
            msg_type,
            body: body.to_vec(),
            raw: raw.to_vec(),
        })
    }

    fn step_ccs(&mut self) -> Result<StepOutput, TlsError> {
        let result = match &mut self.machine {
            Machine::Client12(hs) => hs.on_ccs_received(),
            Machine::Server12(hs) => hs.on_ccs_received(),
            // The 1.3 machines tolerate middlebox CCS during the
            // handshake; the record layer drops it once told to.
            Machine::Client13(_) | Machine::Server13(_) => {
                if self.handshake_complete {
                    Err(TlsError::UnexpectedMessage(
                        "change_cipher_spec after handshake".into(),
                    ))
                } else {
                    Ok(Flight::in_progress())
                }
            }
            Machine::Errored => Err(TlsError::UnexpectedMessage(
                "change_cipher_spec after fatal alert".into(),
            )),
        };
        self.absorb(result, None)
    }

    fn step_alert(&mut self, data: &[u8]) -> Result<StepOutput, TlsError> {
        let alert = Alert::decode(data)?;
        self.last_received_alert = Some(alert);
        if alert.description == AlertDescription::CloseNotify {
            self.closed = true;
            let mut items = Vec::new();
            if !self.handshake_complete || self.last_sent_alert.is_none() {
                let reply = Alert::close_notify();
                self.last_sent_alert = Some(reply);
                items.push(Output::Alert(reply));
            }
            items.push(Output::Command(RecordCommand::Close));
            return Ok(StepOutput {
                items,
                status: StepStatus::Closed,
            });
        }
        if alert.is_ignorable_warning() {
            // user_canceled / no_renegotiation warnings surface
            // without tearing the connection down.
            return Ok(StepOutput::want_read());
        }
        if alert.level == AlertLevel::Fatal {
            self.machine = Machine::Errored;
            self.closed = true;
            return Err(TlsError::AlertReceived {
                level: alert.level as u8,
                description: alert.description as u8,
            });
        }
        Ok(StepOutput::want_read())
    }

    fn on_hello_request(&mut self) -> Result<StepOutput, TlsError> {
        if !self.config.renegotiation_allowed || !self.secure_renegotiation {
            // Decline politely; the connection stays up.
            let alert = Alert {
                level: AlertLevel::Warning,
                description: AlertDescription::NoRenegotiation,
            };
            self.last_sent_alert = Some(alert);
            return Ok(StepOutput {
                items: vec![Output::Alert(alert)],
                status: StepStatus::WantRead,
            });
        }
        let previous = self
            .renego_state
            .clone()
            .ok_or_else(|| TlsError::Internal("renegotiation without verify data".into()))?;
        let version = self
            .negotiated_version
            .ok_or_else(|| TlsError::Internal("renegotiation before negotiation".into()))?;
        let mut hs =
            ClientHandshake12::renegotiate(Arc::clone(&self.config), version, previous);
        let result = hs.start();
        self.machine = Machine::Client12(Box::new(hs));
        self.handshake_complete = false;
        self.absorb(result, Some(HandshakeType::HelloRequest))
    }

    fn on_renegotiation_client_hello(&mut self, raw: &[u8]) -> Result<StepOutput, TlsError> {
        if !self.config.renegotiation_allowed || !self.secure_renegotiation {
            let alert = Alert {
                level: AlertLevel::Warning,
                description: AlertDescription::NoRenegotiation,
            };
            self.last_sent_alert = Some(alert);
            return Ok(StepOutput {
                items: vec![Output::Alert(alert)],
                status: StepStatus::WantRead,
            });
        }
        let previous = self
            .renego_state
            .clone()
            .ok_or_else(|| TlsError::Internal("renegotiation without verify data".into()))?;
        let version = self
            .negotiated_version
            .ok_or_else(|| TlsError::Internal("renegotiation before negotiation".into()))?;
        let mut hs = ServerHandshake12::renegotiate(
            Arc::clone(&self.config),
            self.lib_ctx.clone(),
            version,
            previous,
        );
        let result = match Self::to_handshake_message(raw) {
            Ok(msg) => hs.on_message(&msg),
            Err(e) => Err(e),
        };
        self.machine = Machine::Server12(Box::new(hs));
        self.handshake_complete = false;
        self.absorb(result, Some(HandshakeType::ClientHello))
    }

    /// Fold a machine step into connection state, translating errors
    /// into the fatal-alert-and-sink behaviour.
    fn absorb(
        &mut self,
        result: Result<Flight, TlsError>,
        msg_type: Option<HandshakeType>,
    ) -> Result<StepOutput, TlsError> {
        let flight = match result {
            Ok(f) => f,
            Err(e) => return self.fatal(e, msg_type),
        };

        if let Some(session) = &flight.session {
            if self.config.session_cache_mode.caches_client()
                && self.config.role == TlsRole::Client
                && !session.session_id.is_empty()
            {
                self.lib_ctx
                    .session_cache()
                    .insert(Arc::clone(session))
                    .ok();
            }
            self.session = Some(Arc::clone(session));
        }

        #[cfg(feature = "dtls12")]
        if self
            .negotiated_version
            .unwrap_or(self.config.max_version)
            .is_datagram()
        {
            let messages: Vec<Vec<u8>> = flight.messages().map(|m| m.to_vec()).collect();
            if messages.is_empty() {
                // The peer answered our flight; backoff resets.
                self.flight_tracker.flight_completed();
            } else {
                self.flight_tracker
                    .flight_sent(messages, std::time::Instant::now());
            }
        }

        let status = match flight.status {
            FlightStatus::InProgress => StepStatus::WantRead,
            FlightStatus::Complete => {
                self.on_handshake_complete();
                StepStatus::HandshakeComplete
            }
            FlightStatus::NeedsCertCallback => StepStatus::NeedsCertCallback,
            FlightStatus::NeedsPskCallback => StepStatus::NeedsPskCallback,
            FlightStatus::Downgrade(ctx) => {
                return self.handle_downgrade(*ctx);
            }
        };
        Ok(StepOutput {
            items: flight.items,
            status,
        })
    }

    fn on_handshake_complete(&mut self) {
        self.handshake_complete = true;
        match &self.machine {
            Machine::Client13(_) | Machine::Server13(_) => {
                self.negotiated_version = Some(TlsVersion::Tls13);
            }
            Machine::Client12(hs) => {
                self.negotiated_version = self.negotiated_version.or(Some(self.config.max_version));
                self.renego_state = Some(hs.verify_data());
                self.secure_renegotiation = hs.secure_renegotiation();
            }
            Machine::Server12(hs) => {
                self.negotiated_version = self.negotiated_version.or(Some(self.config.max_version));
                self.renego_state = Some(hs.verify_data());
                self.secure_renegotiation = hs.secure_renegotiation();
            }
            Machine::Errored => {}
        }
    }

    fn handle_downgrade(
        &mut self,
        ctx: crate::handshake::DowngradeContext,
    ) -> Result<StepOutput, TlsError> {
        let version = ctx.version;
        self.negotiated_version = Some(version);
        match self.config.role {
            TlsRole::Client => {
                let result = ClientHandshake12::from_downgrade(Arc::clone(&self.config), ctx);
                match result {
                    Ok((hs, flight)) => {
                        self.machine = Machine::Client12(Box::new(hs));
                        self.absorb(Ok(flight), Some(HandshakeType::ServerHello))
                    }
                    Err(e) => self.fatal(e, Some(HandshakeType::ServerHello)),
                }
            }
            TlsRole::Server => {
                let mut hs = ServerHandshake12::new(
                    Arc::clone(&self.config),
                    self.lib_ctx.clone(),
                    version,
                );
                let result = match Self::to_handshake_message(&ctx.trigger_raw) {
                    Ok(msg) => hs.on_message(&msg),
                    Err(e) => Err(e),
                };
                self.machine = Machine::Server12(Box::new(hs));
                self.absorb(result, Some(HandshakeType::ClientHello))
            }
        }
    }

    /// Fatal error: emit the mapped alert, move to the sink state, and
    /// tell the record layer to close the write side after flushing.
    fn fatal(
        &mut self,
        err: TlsError,
        msg_type: Option<HandshakeType>,
    ) -> Result<StepOutput, TlsError> {
        let state = self.handshake_state();
        self.error_origin = Some(ErrorOrigin { state, msg_type });
        let alert = Alert::from_error(&err);
        self.last_sent_alert = Some(alert);
        self.machine = Machine::Errored;
        Err(err)
    }

    /// The alert the last fatal error produced, for the record layer
    /// to flush before closing.
    pub fn pending_fatal_alert(&self) -> Option<[u8; 2]> {
        self.last_sent_alert
            .filter(|a| a.level == AlertLevel::Fatal)
            .map(|a| a.encode())
    }

    // -----------------------------------------------------------------
    // Suspension re-entry
    // -----------------------------------------------------------------

    /// Resume after the ClientHello inspection callback decided.
    pub fn resume_callback(&mut self) -> Result<StepOutput, TlsError> {
        let result = match &mut self.machine {
            Machine::Server13(hs) => hs.resume_client_hello(),
            Machine::Server12(hs) => hs.resume_client_hello(),
            Machine::Client12(hs) => hs.resume(),
            _ => Err(TlsError::Internal("nothing suspended".into())),
        };
        self.absorb(result, Some(HandshakeType::ClientHello))
    }

    /// Provide PSK material after `NeedsPskCallback`, then resume.
    pub fn provide_psk(&mut self, identity: Vec<u8>, psk: Vec<u8>) -> Result<StepOutput, TlsError> {
        match &mut self.machine {
            Machine::Client12(hs) => {
                hs.provide_psk(identity, psk);
                let result = hs.resume();
                self.absorb(result, None)
            }
            _ => Err(TlsError::Internal("no PSK suspension pending".into())),
        }
    }

    // -----------------------------------------------------------------
    // Post-handshake operations
    // -----------------------------------------------------------------

    /// Initiate renegotiation (≤1.2). Servers send HelloRequest;
    /// clients open a new handshake directly.
    pub fn renegotiate(&mut self) -> Result<StepOutput, TlsError> {
        if !self.handshake_complete {
            return Err(TlsError::Internal("renegotiation before handshake".into()));
        }
        if !self.config.renegotiation_allowed || !self.secure_renegotiation {
            return Err(TlsError::HandshakeFailure(
                "renegotiation not permitted".into(),
            ));
        }
        match self.config.role {
            TlsRole::Server => {
                if !matches!(self.machine, Machine::Server12(_)) {
                    return Err(TlsError::HandshakeFailure(
                        "renegotiation is a ≤1.2 mechanism".into(),
                    ));
                }
                Ok(StepOutput {
                    items: vec![Output::Message(
                        crate::handshake::codec::encode_hello_request(),
                    )],
                    status: StepStatus::WantRead,
                })
            }
            TlsRole::Client => {
                if !matches!(self.machine, Machine::Client12(_)) {
                    return Err(TlsError::HandshakeFailure(
                        "renegotiation is a ≤1.2 mechanism".into(),
                    ));
                }
                self.on_hello_request()
            }
        }
    }

    /// TLS 1.3 KeyUpdate.
    pub fn key_update(&mut self, update_requested: bool) -> Result<StepOutput, TlsError> {
        let result = match &mut self.machine {
            Machine::Client13(hs) => hs.initiate_key_update(update_requested),
            Machine::Server13(hs) => hs.initiate_key_update(update_requested),
            _ => Err(TlsError::HandshakeFailure(
                "KeyUpdate is a TLS 1.3 mechanism".into(),
            )),
        };
        self.absorb(result, None)
    }

    /// TLS 1.3 server-initiated post-handshake client authentication.
    pub fn request_post_handshake_auth(&mut self) -> Result<StepOutput, TlsError> {
        let result = match &mut self.machine {
            Machine::Server13(hs) => hs.request_post_handshake_auth(),
            _ => Err(TlsError::HandshakeFailure(
                "post-handshake auth is a TLS 1.3 server mechanism".into(),
            )),
        };
        self.absorb(result, None)
    }

    /// Queue application data for sending. The record layer encrypts;
    /// this gate only enforces the handshake ordering contract.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, TlsError> {
        if self.closed {
            return Err(TlsError::ConnectionClosed);
        }
        if !self.handshake_complete {
            return Err(TlsError::Internal("write before handshake completion".into()));
        }
        Ok(data.len())
    }

    /// Drain received application data into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, TlsError> {
        if self.read_buffer.is_empty() {
            if self.closed {
                return Err(TlsError::ConnectionClosed);
            }
            return Ok(0);
        }
        let n = buf.len().min(self.read_buffer.len());
        buf[..n].copy_from_slice(&self.read_buffer[..n]);
        self.read_buffer.drain(..n);
        Ok(n)
    }

    /// Close the write side with close_notify.
    pub fn close(&mut self) -> Result<StepOutput, TlsError> {
        if self.closed {
            return Err(TlsError::ConnectionClosed);
        }
        self.closed = true;
        let alert = Alert::close_notify();
        self.last_sent_alert = Some(alert);
        Ok(StepOutput {
            items: vec![
                Output::Alert(alert),
                Output::Command(RecordCommand::Flush),
                Output::Command(RecordCommand::Close),
            ],
            status: StepStatus::Closed,
        })
    }

    // -----------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------

    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn negotiated_version(&self) -> Option<TlsVersion> {
        self.negotiated_version
    }

    pub fn negotiated_cipher_suite(&self) -> Option<CipherSuite> {
        match &self.machine {
            Machine::Client13(hs) => hs.negotiated_suite(),
            Machine::Client12(hs) => hs.negotiated_suite(),
            Machine::Server13(hs) => hs.negotiated_suite(),
            Machine::Server12(hs) => hs.negotiated_suite(),
            Machine::Errored => None,
        }
    }

    pub fn negotiated_alpn(&self) -> Option<&[u8]> {
        match &self.machine {
            Machine::Client13(hs) => hs.negotiated_alpn(),
            Machine::Client12(hs) => hs.negotiated_alpn(),
            Machine::Server13(hs) => hs.negotiated_alpn(),
            Machine::Server12(hs) => hs.negotiated_alpn(),
            Machine::Errored => None,
        }
    }

    pub fn handshake_state(&self) -> HandshakeState {
        match &self.machine {
            Machine::Client13(hs) => hs.state(),
            Machine::Client12(hs) => hs.state(),
            Machine::Server13(hs) => hs.state(),
            Machine::Server12(hs) => hs.state(),
            Machine::Errored => HandshakeState::Error,
        }
    }

    pub fn resumed(&self) -> bool {
        match &self.machine {
            Machine::Client12(hs) => hs.resumed(),
            Machine::Server12(hs) => hs.resumed(),
            Machine::Server13(hs) => hs.resumed(),
            _ => false,
        }
    }

    /// Exporter secret (TLS 1.3).
    pub fn exporter_secret(&self) -> Option<&[u8]> {
        match &self.machine {
            Machine::Client13(hs) => Some(hs.exporter_secret()),
            Machine::Server13(hs) => Some(hs.exporter_secret()),
            _ => None,
        }
    }

    /// The session established by the last completed handshake, or the
    /// most recent ticket-derived session.
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    /// DTLS: whether the retransmission timer has expired.
    #[cfg(feature = "dtls12")]
    pub fn retransmit_due(&self, now: std::time::Instant) -> bool {
        self.flight_tracker.is_expired(now)
    }

    /// DTLS: retransmit the current outgoing flight with backoff.
    /// Returns `None` once the retry budget is exhausted.
    #[cfg(feature = "dtls12")]
    pub fn retransmit_flight(&mut self, now: std::time::Instant) -> Option<StepOutput> {
        let messages = self.flight_tracker.retransmit(now)?.to_vec();
        let mut items: Vec<Output> = messages.into_iter().map(Output::Message).collect();
        items.push(Output::Command(RecordCommand::Flush));
        Some(StepOutput {
            items,
            status: StepStatus::WantRead,
        })
    }

    pub fn last_sent_alert(&self) -> Option<Alert> {
        self.last_sent_alert
    }

    pub fn last_received_alert(&self) -> Option<Alert> {
        self.last_received_alert
    }

    pub fn error_origin(&self) -> Option<ErrorOrigin> {
        self.error_origin
    }
}
