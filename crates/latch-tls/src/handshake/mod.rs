//! Handshake message flow and per-version state machines.

pub mod client;
pub mod client12;
pub mod codec;
pub mod codec12;
#[cfg(feature = "dtls12")]
pub mod codec_dtls;
pub mod extensions_codec;
pub mod key_exchange;
pub mod negotiate;
#[cfg(feature = "dtls12")]
pub mod retransmit;
pub mod server;
pub mod server12;
pub mod verify;

/// Handshake message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeType {
    HelloRequest = 0,
    ClientHello = 1,
    ServerHello = 2,
    HelloVerifyRequest = 3,
    NewSessionTicket = 4,
    EncryptedExtensions = 8,
    Certificate = 11,
    ServerKeyExchange = 12,
    CertificateRequest = 13,
    ServerHelloDone = 14,
    CertificateVerify = 15,
    ClientKeyExchange = 16,
    Finished = 20,
    KeyUpdate = 24,
    MessageHash = 254,
}

impl HandshakeType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(HandshakeType::HelloRequest),
            1 => Some(HandshakeType::ClientHello),
            2 => Some(HandshakeType::ServerHello),
            3 => Some(HandshakeType::HelloVerifyRequest),
            4 => Some(HandshakeType::NewSessionTicket),
            8 => Some(HandshakeType::EncryptedExtensions),
            11 => Some(HandshakeType::Certificate),
            12 => Some(HandshakeType::ServerKeyExchange),
            13 => Some(HandshakeType::CertificateRequest),
            14 => Some(HandshakeType::ServerHelloDone),
            15 => Some(HandshakeType::CertificateVerify),
            16 => Some(HandshakeType::ClientKeyExchange),
            20 => Some(HandshakeType::Finished),
            24 => Some(HandshakeType::KeyUpdate),
            254 => Some(HandshakeType::MessageHash),
            _ => None,
        }
    }
}

/// Per-connection handshake state. Client and server walks share the
/// enum; each machine only visits its own role's states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,

    // Client
    WaitServerHello,
    WaitHelloVerifyRequest,
    WaitEncryptedExtensions,
    WaitCertCertReq,
    WaitServerKeyExchange,
    WaitServerHelloDone,
    WaitCertVerify,
    WaitFinished,
    WaitNewSessionTicket,
    WaitServerCcs,

    // Server
    WaitClientHello,
    WaitClientHelloRetry,
    WaitClientCert,
    WaitClientKeyExchange,
    WaitClientCertVerify,
    WaitClientCcs,
    WaitClientFinished,

    /// Handshake complete; application traffic flows.
    Connected,
    /// Closed by close_notify or owner.
    Closed,
    /// Fatal-alert sink: refuses all further handshake messages.
    Error,
}

/// A parsed handshake message: type plus raw body, with the complete
/// wire bytes retained for the transcript.
#[derive(Debug, Clone)]
pub struct HandshakeMessage {
    pub msg_type: HandshakeType,
    pub body: Vec<u8>,
    pub raw: Vec<u8>,
}

/// How a processing step left the handshake.
#[derive(Debug)]
pub enum FlightStatus {
    /// More peer input is needed.
    InProgress,
    /// Handshake complete; application traffic may flow.
    Complete,
    /// The ServerHello selected ≤1.2; the connection re-homes the
    /// handshake onto the legacy machine.
    Downgrade(Box<DowngradeContext>),
    /// Suspended waiting for a certificate/config decision
    /// (ClientHello inspection).
    NeedsCertCallback,
    /// Suspended waiting for PSK material from the application.
    NeedsPskCallback,
}

/// One element of a flight, in emission order. Interleaving matters:
/// a ClientKeyExchange goes out under the old keys, the following
/// Finished under the keys a `SetKey` command installed between them.
#[derive(Debug)]
pub enum Output {
    /// A complete handshake message to send.
    Message(Vec<u8>),
    /// A record-layer command taking effect at this position.
    Command(crate::provider::RecordCommand),
    /// An alert to send (emitted by the coordinator only).
    Alert(crate::alert::Alert),
}

/// Output of one state-machine step: the ordered outgoing items, the
/// step disposition, and any session established.
#[derive(Debug)]
pub struct Flight {
    pub items: Vec<Output>,
    pub status: FlightStatus,
    pub session: Option<std::sync::Arc<crate::session::Session>>,
}

impl Flight {
    pub fn in_progress() -> Self {
        Flight {
            items: Vec::new(),
            status: FlightStatus::InProgress,
            session: None,
        }
    }

    pub fn push_message(&mut self, msg: Vec<u8>) {
        self.items.push(Output::Message(msg));
    }

    pub fn push_command(&mut self, cmd: crate::provider::RecordCommand) {
        self.items.push(Output::Command(cmd));
    }

    /// The handshake messages of this flight, in order.
    pub fn messages(&self) -> impl Iterator<Item = &[u8]> {
        self.items.iter().filter_map(|i| match i {
            Output::Message(m) => Some(m.as_slice()),
            _ => None,
        })
    }

    /// The record-layer commands of this flight, in order.
    pub fn commands(&self) -> impl Iterator<Item = &crate::provider::RecordCommand> {
        self.items.iter().filter_map(|i| match i {
            Output::Command(c) => Some(c),
            _ => None,
        })
    }
}

/// Context handed to the ≤1.2 machine when version negotiation lands
/// on a legacy version: the triggering message (ServerHello on the
/// client, ClientHello on the server) plus client-side carry-over.
#[derive(Debug)]
pub struct DowngradeContext {
    pub version: crate::TlsVersion,
    pub trigger_raw: Vec<u8>,
    pub client: Option<ClientDowngrade>,
}

/// Client state carried from the 1.3 hello into the legacy machine.
pub struct ClientDowngrade {
    pub client_random: [u8; 32],
    pub offered_session_id: Vec<u8>,
    pub offered_suites: Vec<crate::CipherSuite>,
    pub offered_ems: bool,
    pub transcript: crate::crypt::transcript::TranscriptHash,
}

impl std::fmt::Debug for ClientDowngrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientDowngrade")
            .field("client_random", &self.client_random)
            .field("offered_session_id", &self.offered_session_id)
            .field("offered_suites", &self.offered_suites)
            .field("offered_ems", &self.offered_ems)
            .field("transcript", &"<transcript>")
            .finish()
    }
}

/// Frames outgoing handshake bodies for the transport in use. The
/// transcript always covers exactly the framed bytes, so stream and
/// datagram transports stay bit-consistent.
pub enum MessageFramer {
    Stream,
    #[cfg(feature = "dtls12")]
    Dtls { next_seq: u16 },
}

impl MessageFramer {
    /// Re-frame a stream-framed handshake message for this transport.
    pub fn reframe(&mut self, stream_msg: Vec<u8>) -> Vec<u8> {
        match self {
            MessageFramer::Stream => stream_msg,
            #[cfg(feature = "dtls12")]
            MessageFramer::Dtls { next_seq } => {
                // type(1) || length(3) || body
                let msg_type = HandshakeType::from_u8(stream_msg[0]).expect("self-framed message");
                let body = &stream_msg[4..];
                let out = codec_dtls::wrap_dtls_handshake(msg_type, *next_seq, body);
                *next_seq += 1;
                out
            }
        }
    }

    /// Strip transport framing down to (type, body) for parsing.
    pub fn unframe<'a>(
        &self,
        raw: &'a [u8],
    ) -> Result<(HandshakeType, &'a [u8]), latch_types::TlsError> {
        match self {
            MessageFramer::Stream => {
                let (ty, body, consumed) = codec::parse_handshake_header(raw)?;
                if consumed != raw.len() {
                    return Err(latch_types::TlsError::Decode(
                        "trailing bytes after handshake".into(),
                    ));
                }
                Ok((ty, body))
            }
            #[cfg(feature = "dtls12")]
            MessageFramer::Dtls { .. } => {
                let (header, body) = codec_dtls::parse_dtls_fragment(raw)?;
                if header.fragment_offset != 0 || header.fragment_length != header.length {
                    return Err(latch_types::TlsError::Decode(
                        "fragmented message reached the state machine".into(),
                    ));
                }
                Ok((header.msg_type, body))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_type_wire_values() {
        // RFC 8446 §4 / RFC 5246 §7.4 / RFC 6347 §4.3.2
        assert_eq!(HandshakeType::HelloRequest as u8, 0);
        assert_eq!(HandshakeType::ClientHello as u8, 1);
        assert_eq!(HandshakeType::ServerHello as u8, 2);
        assert_eq!(HandshakeType::HelloVerifyRequest as u8, 3);
        assert_eq!(HandshakeType::NewSessionTicket as u8, 4);
        assert_eq!(HandshakeType::EncryptedExtensions as u8, 8);
        assert_eq!(HandshakeType::Certificate as u8, 11);
        assert_eq!(HandshakeType::ServerKeyExchange as u8, 12);
        assert_eq!(HandshakeType::CertificateRequest as u8, 13);
        assert_eq!(HandshakeType::ServerHelloDone as u8, 14);
        assert_eq!(HandshakeType::CertificateVerify as u8, 15);
        assert_eq!(HandshakeType::ClientKeyExchange as u8, 16);
        assert_eq!(HandshakeType::Finished as u8, 20);
        assert_eq!(HandshakeType::KeyUpdate as u8, 24);
        assert_eq!(HandshakeType::MessageHash as u8, 254);
    }

    #[test]
    fn test_handshake_type_from_u8_roundtrip() {
        for v in [0u8, 1, 2, 3, 4, 8, 11, 12, 13, 14, 15, 16, 20, 24, 254] {
            assert_eq!(HandshakeType::from_u8(v).unwrap() as u8, v);
        }
        assert!(HandshakeType::from_u8(5).is_none());
        assert!(HandshakeType::from_u8(99).is_none());
    }

    #[test]
    fn test_states_distinct() {
        let states = [
            HandshakeState::Idle,
            HandshakeState::WaitServerHello,
            HandshakeState::WaitHelloVerifyRequest,
            HandshakeState::WaitEncryptedExtensions,
            HandshakeState::WaitCertCertReq,
            HandshakeState::WaitServerKeyExchange,
            HandshakeState::WaitServerHelloDone,
            HandshakeState::WaitCertVerify,
            HandshakeState::WaitFinished,
            HandshakeState::WaitNewSessionTicket,
            HandshakeState::WaitServerCcs,
            HandshakeState::WaitClientHello,
            HandshakeState::WaitClientHelloRetry,
            HandshakeState::WaitClientCert,
            HandshakeState::WaitClientKeyExchange,
            HandshakeState::WaitClientCertVerify,
            HandshakeState::WaitClientCcs,
            HandshakeState::WaitClientFinished,
            HandshakeState::Connected,
            HandshakeState::Closed,
            HandshakeState::Error,
        ];
        for i in 0..states.len() {
            for j in (i + 1)..states.len() {
                assert_ne!(states[i], states[j]);
            }
        }
    }
}
