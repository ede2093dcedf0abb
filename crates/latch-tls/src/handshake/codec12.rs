//! TLS 1.2 / TLCP handshake message encoding/decoding (RFC 5246 §7.4,
//! RFC 4492, RFC 4279, GB/T 38636).

use latch_types::TlsError;

use crate::crypt::{KeyExchangeAlg, NamedGroup, SignatureScheme};

use super::codec::{push_u24, read_u24, wrap_handshake};
use super::HandshakeType;

/// named_curve ECCurveType value (RFC 4492 §5.4).
const CURVE_TYPE_NAMED: u8 = 3;

/// TLS 1.2 Certificate message: a bare chain, leaf first.
#[derive(Debug, Clone)]
pub struct Certificate12Msg {
    pub certificate_list: Vec<Vec<u8>>,
}

/// Signature over ServerKeyExchange params.
#[derive(Debug, Clone)]
pub struct SignedParams {
    pub scheme: SignatureScheme,
    pub signature: Vec<u8>,
}

/// Ephemeral ECDH parameters.
#[derive(Debug, Clone)]
pub struct EcdheParams {
    pub curve: NamedGroup,
    pub public: Vec<u8>,
    pub signature: Option<SignedParams>,
}

/// Ephemeral finite-field DH parameters.
#[derive(Debug, Clone)]
pub struct DheParams {
    pub p: Vec<u8>,
    pub g: Vec<u8>,
    pub public: Vec<u8>,
    pub signature: Option<SignedParams>,
}

/// ServerKeyExchange payload, by key-exchange algorithm.
#[derive(Debug, Clone)]
pub enum ServerKeyExchangeParams {
    Ecdhe(EcdheParams),
    Dhe(DheParams),
    /// Plain PSK / RSA_PSK: identity hint only.
    PskHint { hint: Vec<u8> },
    EcdhePsk { hint: Vec<u8>, params: EcdheParams },
    DhePsk { hint: Vec<u8>, params: DheParams },
    /// TLCP ECC: signature over randoms + encryption certificate.
    #[cfg(feature = "tlcp")]
    TlcpEcc { signature: Vec<u8> },
}

/// ClientKeyExchange payload, by key-exchange algorithm.
#[derive(Debug, Clone)]
pub enum ClientKeyExchangePayload {
    Rsa { encrypted_pre_master: Vec<u8> },
    Ecdhe { public: Vec<u8> },
    Dhe { public: Vec<u8> },
    Psk { identity: Vec<u8> },
    EcdhePsk { identity: Vec<u8>, public: Vec<u8> },
    DhePsk { identity: Vec<u8>, public: Vec<u8> },
    RsaPsk {
        identity: Vec<u8>,
        encrypted_pre_master: Vec<u8>,
    },
    /// TLCP ECC: named-curve header plus SM2-encrypted pre-master.
    #[cfg(feature = "tlcp")]
    TlcpEcc { encrypted_pre_master: Vec<u8> },
}

/// TLS 1.2 CertificateRequest message.
#[derive(Debug, Clone)]
pub struct CertificateRequest12Msg {
    pub certificate_types: Vec<u8>,
    pub signature_algorithms: Vec<SignatureScheme>,
    pub ca_names: Vec<Vec<u8>>,
}

/// TLS 1.2 NewSessionTicket message (RFC 5077 §3.3).
#[derive(Debug, Clone)]
pub struct NewSessionTicket12Msg {
    pub lifetime_hint: u32,
    pub ticket: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Certificate
// ---------------------------------------------------------------------------

pub fn encode_certificate12(msg: &Certificate12Msg) -> Vec<u8> {
    let mut list = Vec::new();
    for cert in &msg.certificate_list {
        push_u24(&mut list, cert.len());
        list.extend_from_slice(cert);
    }
    let mut body = Vec::with_capacity(3 + list.len());
    push_u24(&mut body, list.len());
    body.extend_from_slice(&list);
    wrap_handshake(HandshakeType::Certificate, &body)
}

pub fn decode_certificate12(data: &[u8]) -> Result<Certificate12Msg, TlsError> {
    let err = |msg: &str| TlsError::Decode(format!("Certificate: {msg}"));
    if data.len() < 3 {
        return Err(err("truncated list length"));
    }
    let list_len = read_u24(data) as usize;
    if data.len() - 3 != list_len {
        return Err(err("list length mismatch"));
    }
    let mut pos = 3;
    let mut certificate_list = Vec::new();
    while pos < data.len() {
        if data.len() - pos < 3 {
            return Err(err("truncated entry length"));
        }
        let cert_len = read_u24(&data[pos..]) as usize;
        pos += 3;
        if data.len() - pos < cert_len {
            return Err(err("truncated cert data"));
        }
        certificate_list.push(data[pos..pos + cert_len].to_vec());
        pos += cert_len;
    }
    Ok(Certificate12Msg { certificate_list })
}

// ---------------------------------------------------------------------------
// ServerKeyExchange
// ---------------------------------------------------------------------------

fn encode_ecdhe_params(out: &mut Vec<u8>, params: &EcdheParams) {
    out.push(CURVE_TYPE_NAMED);
    out.extend_from_slice(&params.curve.0.to_be_bytes());
    out.push(params.public.len() as u8);
    out.extend_from_slice(&params.public);
    if let Some(sig) = &params.signature {
        out.extend_from_slice(&sig.scheme.0.to_be_bytes());
        out.extend_from_slice(&(sig.signature.len() as u16).to_be_bytes());
        out.extend_from_slice(&sig.signature);
    }
}

fn encode_dhe_params(out: &mut Vec<u8>, params: &DheParams) {
    for field in [&params.p, &params.g, &params.public] {
        out.extend_from_slice(&(field.len() as u16).to_be_bytes());
        out.extend_from_slice(field);
    }
    if let Some(sig) = &params.signature {
        out.extend_from_slice(&sig.scheme.0.to_be_bytes());
        out.extend_from_slice(&(sig.signature.len() as u16).to_be_bytes());
        out.extend_from_slice(&sig.signature);
    }
}

fn push_opaque16(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
}

pub fn encode_server_key_exchange(params: &ServerKeyExchangeParams) -> Vec<u8> {
    let mut body = Vec::new();
    match params {
        ServerKeyExchangeParams::Ecdhe(p) => encode_ecdhe_params(&mut body, p),
        ServerKeyExchangeParams::Dhe(p) => encode_dhe_params(&mut body, p),
        ServerKeyExchangeParams::PskHint { hint } => push_opaque16(&mut body, hint),
        ServerKeyExchangeParams::EcdhePsk { hint, params } => {
            push_opaque16(&mut body, hint);
            encode_ecdhe_params(&mut body, params);
        }
        ServerKeyExchangeParams::DhePsk { hint, params } => {
            push_opaque16(&mut body, hint);
            encode_dhe_params(&mut body, params);
        }
        #[cfg(feature = "tlcp")]
        ServerKeyExchangeParams::TlcpEcc { signature } => push_opaque16(&mut body, signature),
    }
    wrap_handshake(HandshakeType::ServerKeyExchange, &body)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], TlsError> {
        if self.data.len() - self.pos < n {
            return Err(TlsError::Decode(format!(
                "ServerKeyExchange: truncated {what}"
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self, what: &str) -> Result<u8, TlsError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> Result<u16, TlsError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn opaque8(&mut self, what: &str) -> Result<&'a [u8], TlsError> {
        let len = self.u8(what)? as usize;
        self.take(len, what)
    }

    fn opaque16(&mut self, what: &str) -> Result<&'a [u8], TlsError> {
        let len = self.u16(what)? as usize;
        self.take(len, what)
    }

    fn done(&self) -> bool {
        self.pos == self.data.len()
    }
}

fn decode_ecdhe_params(cur: &mut Cursor<'_>, signed: bool) -> Result<EcdheParams, TlsError> {
    let curve_type = cur.u8("curve type")?;
    if curve_type != CURVE_TYPE_NAMED {
        return Err(TlsError::IllegalParameter(format!(
            "unsupported curve type {curve_type}"
        )));
    }
    let curve = NamedGroup(cur.u16("curve id")?);
    let public = cur.opaque8("ec point")?.to_vec();
    let signature = if signed {
        let scheme = SignatureScheme(cur.u16("signature scheme")?);
        let signature = cur.opaque16("signature")?.to_vec();
        Some(SignedParams { scheme, signature })
    } else {
        None
    };
    Ok(EcdheParams {
        curve,
        public,
        signature,
    })
}

fn decode_dhe_params(cur: &mut Cursor<'_>, signed: bool) -> Result<DheParams, TlsError> {
    let p = cur.opaque16("dh p")?.to_vec();
    let g = cur.opaque16("dh g")?.to_vec();
    let public = cur.opaque16("dh Ys")?.to_vec();
    let signature = if signed {
        let scheme = SignatureScheme(cur.u16("signature scheme")?);
        let signature = cur.opaque16("signature")?.to_vec();
        Some(SignedParams { scheme, signature })
    } else {
        None
    };
    Ok(DheParams {
        p,
        g,
        public,
        signature,
    })
}

/// Decode a ServerKeyExchange body under the negotiated key-exchange
/// algorithm.
pub fn decode_server_key_exchange(
    data: &[u8],
    kx_alg: KeyExchangeAlg,
) -> Result<ServerKeyExchangeParams, TlsError> {
    let mut cur = Cursor::new(data);
    let out = match kx_alg {
        KeyExchangeAlg::Ecdhe => {
            ServerKeyExchangeParams::Ecdhe(decode_ecdhe_params(&mut cur, true)?)
        }
        KeyExchangeAlg::Dhe => ServerKeyExchangeParams::Dhe(decode_dhe_params(&mut cur, true)?),
        KeyExchangeAlg::Psk | KeyExchangeAlg::RsaPsk => ServerKeyExchangeParams::PskHint {
            hint: cur.opaque16("psk hint")?.to_vec(),
        },
        KeyExchangeAlg::EcdhePsk => {
            let hint = cur.opaque16("psk hint")?.to_vec();
            ServerKeyExchangeParams::EcdhePsk {
                hint,
                params: decode_ecdhe_params(&mut cur, false)?,
            }
        }
        KeyExchangeAlg::DhePsk => {
            let hint = cur.opaque16("psk hint")?.to_vec();
            ServerKeyExchangeParams::DhePsk {
                hint,
                params: decode_dhe_params(&mut cur, false)?,
            }
        }
        KeyExchangeAlg::Rsa => {
            return Err(TlsError::UnexpectedMessage(
                "ServerKeyExchange with RSA key transport".into(),
            ))
        }
        #[cfg(feature = "tlcp")]
        KeyExchangeAlg::Ecc => ServerKeyExchangeParams::TlcpEcc {
            signature: cur.opaque16("sm2 signature")?.to_vec(),
        },
    };
    if !cur.done() {
        return Err(TlsError::Decode(
            "ServerKeyExchange: trailing bytes".into(),
        ));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// ClientKeyExchange
// ---------------------------------------------------------------------------

pub fn encode_client_key_exchange(payload: &ClientKeyExchangePayload) -> Vec<u8> {
    let mut body = Vec::new();
    match payload {
        ClientKeyExchangePayload::Rsa {
            encrypted_pre_master,
        } => push_opaque16(&mut body, encrypted_pre_master),
        ClientKeyExchangePayload::Ecdhe { public } => {
            body.push(public.len() as u8);
            body.extend_from_slice(public);
        }
        ClientKeyExchangePayload::Dhe { public } => push_opaque16(&mut body, public),
        ClientKeyExchangePayload::Psk { identity } => push_opaque16(&mut body, identity),
        ClientKeyExchangePayload::EcdhePsk { identity, public } => {
            push_opaque16(&mut body, identity);
            body.push(public.len() as u8);
            body.extend_from_slice(public);
        }
        ClientKeyExchangePayload::DhePsk { identity, public } => {
            push_opaque16(&mut body, identity);
            push_opaque16(&mut body, public);
        }
        ClientKeyExchangePayload::RsaPsk {
            identity,
            encrypted_pre_master,
        } => {
            push_opaque16(&mut body, identity);
            push_opaque16(&mut body, encrypted_pre_master);
        }
        #[cfg(feature = "tlcp")]
        ClientKeyExchangePayload::TlcpEcc {
            encrypted_pre_master,
        } => {
            // curve-type(named) || curve(sm2) || length || SM2 envelope
            body.push(CURVE_TYPE_NAMED);
            body.extend_from_slice(&NamedGroup::SM2P256.0.to_be_bytes());
            push_opaque16(&mut body, encrypted_pre_master);
        }
    }
    wrap_handshake(HandshakeType::ClientKeyExchange, &body)
}

/// Decode a ClientKeyExchange body under the negotiated key-exchange
/// algorithm.
pub fn decode_client_key_exchange(
    data: &[u8],
    kx_alg: KeyExchangeAlg,
) -> Result<ClientKeyExchangePayload, TlsError> {
    let mut cur = Cursor::new(data);
    let out = match kx_alg {
        KeyExchangeAlg::Rsa => ClientKeyExchangePayload::Rsa {
            encrypted_pre_master: cur.opaque16("encrypted pre-master")?.to_vec(),
        },
        KeyExchangeAlg::Ecdhe => ClientKeyExchangePayload::Ecdhe {
            public: cur.opaque8("ec point")?.to_vec(),
        },
        KeyExchangeAlg::Dhe => ClientKeyExchangePayload::Dhe {
            public: cur.opaque16("dh Yc")?.to_vec(),
        },
        KeyExchangeAlg::Psk => ClientKeyExchangePayload::Psk {
            identity: cur.opaque16("psk identity")?.to_vec(),
        },
        KeyExchangeAlg::EcdhePsk => {
            let identity = cur.opaque16("psk identity")?.to_vec();
            ClientKeyExchangePayload::EcdhePsk {
                identity,
                public: cur.opaque8("ec point")?.to_vec(),
            }
        }
        KeyExchangeAlg::DhePsk => {
            let identity = cur.opaque16("psk identity")?.to_vec();
            ClientKeyExchangePayload::DhePsk {
                identity,
                public: cur.opaque16("dh Yc")?.to_vec(),
            }
        }
        KeyExchangeAlg::RsaPsk => {
            let identity = cur.opaque16("psk identity")?.to_vec();
            ClientKeyExchangePayload::RsaPsk {
                identity,
                encrypted_pre_master: cur.opaque16("encrypted pre-master")?.to_vec(),
            }
        }
        #[cfg(feature = "tlcp")]
        KeyExchangeAlg::Ecc => {
            let curve_type = cur.u8("curve type")?;
            let curve = NamedGroup(cur.u16("curve id")?);
            if curve_type != CURVE_TYPE_NAMED || curve != NamedGroup::SM2P256 {
                return Err(TlsError::IllegalParameter(
                    "ClientKeyExchange: not the SM2 named curve".into(),
                ));
            }
            ClientKeyExchangePayload::TlcpEcc {
                encrypted_pre_master: cur.opaque16("sm2 envelope")?.to_vec(),
            }
        }
    };
    if !cur.done() {
        return Err(TlsError::Decode(
            "ClientKeyExchange: trailing bytes".into(),
        ));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// CertificateRequest / ServerHelloDone / NewSessionTicket
// ---------------------------------------------------------------------------

pub fn encode_certificate_request12(msg: &CertificateRequest12Msg) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(msg.certificate_types.len() as u8);
    body.extend_from_slice(&msg.certificate_types);
    body.extend_from_slice(&((msg.signature_algorithms.len() * 2) as u16).to_be_bytes());
    for s in &msg.signature_algorithms {
        body.extend_from_slice(&s.0.to_be_bytes());
    }
    let mut names = Vec::new();
    for name in &msg.ca_names {
        push_opaque16(&mut names, name);
    }
    push_opaque16(&mut body, &names);
    wrap_handshake(HandshakeType::CertificateRequest, &body)
}

pub fn decode_certificate_request12(data: &[u8]) -> Result<CertificateRequest12Msg, TlsError> {
    let mut cur = Cursor::new(data);
    let certificate_types = cur.opaque8("certificate types")?.to_vec();
    let sig_algs_raw = cur.opaque16("signature algorithms")?;
    if sig_algs_raw.len() % 2 != 0 {
        return Err(TlsError::Decode(
            "CertificateRequest: odd signature algorithm list".into(),
        ));
    }
    let signature_algorithms = sig_algs_raw
        .chunks_exact(2)
        .map(|c| SignatureScheme(u16::from_be_bytes([c[0], c[1]])))
        .collect();
    let names_raw = cur.opaque16("ca names")?;
    let mut names_cur = Cursor::new(names_raw);
    let mut ca_names = Vec::new();
    while !names_cur.done() {
        ca_names.push(names_cur.opaque16("ca name")?.to_vec());
    }
    if !cur.done() {
        return Err(TlsError::Decode(
            "CertificateRequest: trailing bytes".into(),
        ));
    }
    Ok(CertificateRequest12Msg {
        certificate_types,
        signature_algorithms,
        ca_names,
    })
}

pub fn encode_server_hello_done() -> Vec<u8> {
    wrap_handshake(HandshakeType::ServerHelloDone, &[])
}

pub fn decode_server_hello_done(data: &[u8]) -> Result<(), TlsError> {
    if !data.is_empty() {
        return Err(TlsError::Decode("ServerHelloDone: non-empty body".into()));
    }
    Ok(())
}

pub fn encode_new_session_ticket12(msg: &NewSessionTicket12Msg) -> Vec<u8> {
    let mut body = Vec::with_capacity(6 + msg.ticket.len());
    body.extend_from_slice(&msg.lifetime_hint.to_be_bytes());
    push_opaque16(&mut body, &msg.ticket);
    wrap_handshake(HandshakeType::NewSessionTicket, &body)
}

pub fn decode_new_session_ticket12(data: &[u8]) -> Result<NewSessionTicket12Msg, TlsError> {
    let mut cur = Cursor::new(data);
    let lifetime_raw = cur.take(4, "lifetime hint")?;
    let lifetime_hint =
        u32::from_be_bytes([lifetime_raw[0], lifetime_raw[1], lifetime_raw[2], lifetime_raw[3]]);
    let ticket = cur.opaque16("ticket")?.to_vec();
    if !cur.done() {
        return Err(TlsError::Decode("NewSessionTicket: trailing bytes".into()));
    }
    Ok(NewSessionTicket12Msg {
        lifetime_hint,
        ticket,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::codec::parse_handshake_header;

    #[test]
    fn test_certificate12_roundtrip() {
        let msg = Certificate12Msg {
            certificate_list: vec![vec![0x30, 0x82, 0x01, 0x00], vec![0x30, 0x05]],
        };
        let encoded = encode_certificate12(&msg);
        let (ty, body, _) = parse_handshake_header(&encoded).unwrap();
        assert_eq!(ty, HandshakeType::Certificate);
        let decoded = decode_certificate12(body).unwrap();
        assert_eq!(decoded.certificate_list, msg.certificate_list);
    }

    #[test]
    fn test_server_key_exchange_ecdhe_roundtrip() {
        let params = ServerKeyExchangeParams::Ecdhe(EcdheParams {
            curve: NamedGroup::X25519,
            public: vec![0x11; 32],
            signature: Some(SignedParams {
                scheme: SignatureScheme::RSA_PSS_RSAE_SHA256,
                signature: vec![0x22; 64],
            }),
        });
        let encoded = encode_server_key_exchange(&params);
        let (_, body, _) = parse_handshake_header(&encoded).unwrap();
        match decode_server_key_exchange(body, KeyExchangeAlg::Ecdhe).unwrap() {
            ServerKeyExchangeParams::Ecdhe(p) => {
                assert_eq!(p.curve, NamedGroup::X25519);
                assert_eq!(p.public, vec![0x11; 32]);
                let sig = p.signature.unwrap();
                assert_eq!(sig.scheme, SignatureScheme::RSA_PSS_RSAE_SHA256);
                assert_eq!(sig.signature, vec![0x22; 64]);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_server_key_exchange_dhe_roundtrip() {
        let params = ServerKeyExchangeParams::Dhe(DheParams {
            p: vec![0xFF; 256],
            g: vec![2],
            public: vec![0x33; 256],
            signature: Some(SignedParams {
                scheme: SignatureScheme::RSA_PKCS1_SHA256,
                signature: vec![0x44; 128],
            }),
        });
        let encoded = encode_server_key_exchange(&params);
        let (_, body, _) = parse_handshake_header(&encoded).unwrap();
        match decode_server_key_exchange(body, KeyExchangeAlg::Dhe).unwrap() {
            ServerKeyExchangeParams::Dhe(p) => {
                assert_eq!(p.p.len(), 256);
                assert_eq!(p.g, vec![2]);
                assert!(p.signature.is_some());
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_server_key_exchange_psk_hint() {
        let params = ServerKeyExchangeParams::PskHint {
            hint: b"hint".to_vec(),
        };
        let encoded = encode_server_key_exchange(&params);
        let (_, body, _) = parse_handshake_header(&encoded).unwrap();
        match decode_server_key_exchange(body, KeyExchangeAlg::Psk).unwrap() {
            ServerKeyExchangeParams::PskHint { hint } => assert_eq!(hint, b"hint".to_vec()),
            _ => unreachable!(),
        }
        // ECDHE_PSK carries the hint plus unsigned curve params
        let params = ServerKeyExchangeParams::EcdhePsk {
            hint: vec![],
            params: EcdheParams {
                curve: NamedGroup::SECP256R1,
                public: vec![0x04; 65],
                signature: None,
            },
        };
        let encoded = encode_server_key_exchange(&params);
        let (_, body, _) = parse_handshake_header(&encoded).unwrap();
        match decode_server_key_exchange(body, KeyExchangeAlg::EcdhePsk).unwrap() {
            ServerKeyExchangeParams::EcdhePsk { hint, params } => {
                assert!(hint.is_empty());
                assert_eq!(params.curve, NamedGroup::SECP256R1);
                assert!(params.signature.is_none());
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_server_key_exchange_rsa_is_unexpected() {
        let e = decode_server_key_exchange(&[], KeyExchangeAlg::Rsa).unwrap_err();
        assert!(matches!(e, TlsError::UnexpectedMessage(_)));
    }

    #[test]
    fn test_client_key_exchange_forms() {
        let cases: Vec<(ClientKeyExchangePayload, KeyExchangeAlg)> = vec![
            (
                ClientKeyExchangePayload::Rsa {
                    encrypted_pre_master: vec![0x55; 256],
                },
                KeyExchangeAlg::Rsa,
            ),
            (
                ClientKeyExchangePayload::Ecdhe {
                    public: vec![0x66; 32],
                },
                KeyExchangeAlg::Ecdhe,
            ),
            (
                ClientKeyExchangePayload::Dhe {
                    public: vec![0x77; 256],
                },
                KeyExchangeAlg::Dhe,
            ),
            (
                ClientKeyExchangePayload::Psk {
                    identity: b"alice".to_vec(),
                },
                KeyExchangeAlg::Psk,
            ),
            (
                ClientKeyExchangePayload::EcdhePsk {
                    identity: b"bob".to_vec(),
                    public: vec![0x88; 32],
                },
                KeyExchangeAlg::EcdhePsk,
            ),
            (
                ClientKeyExchangePayload::DhePsk {
                    identity: b"carol".to_vec(),
                    public: vec![0x99; 128],
                },
                KeyExchangeAlg::DhePsk,
            ),
            (
                ClientKeyExchangePayload::RsaPsk {
                    identity: b"dave".to_vec(),
                    encrypted_pre_master: vec![0xAA; 256],
                },
                KeyExchangeAlg::RsaPsk,
            ),
        ];
        for (payload, alg) in cases {
            let encoded = encode_client_key_exchange(&payload);
            let (ty, body, _) = parse_handshake_header(&encoded).unwrap();
            assert_eq!(ty, HandshakeType::ClientKeyExchange);
            let decoded = decode_client_key_exchange(body, alg).unwrap();
            // Compare via re-encode
            assert_eq!(encode_client_key_exchange(&decoded), encoded);
        }
    }

    #[cfg(feature = "tlcp")]
    #[test]
    fn test_tlcp_client_key_exchange() {
        let payload = ClientKeyExchangePayload::TlcpEcc {
            encrypted_pre_master: vec![0xBB; 150],
        };
        let encoded = encode_client_key_exchange(&payload);
        let (_, body, _) = parse_handshake_header(&encoded).unwrap();
        // Wire: curve-type=named(3), curve=sm2
        assert_eq!(body[0], 3);
        assert_eq!(
            u16::from_be_bytes([body[1], body[2]]),
            NamedGroup::SM2P256.0
        );
        match decode_client_key_exchange(body, KeyExchangeAlg::Ecc).unwrap() {
            ClientKeyExchangePayload::TlcpEcc {
                encrypted_pre_master,
            } => assert_eq!(encrypted_pre_master, vec![0xBB; 150]),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_client_key_exchange_trailing_bytes_rejected() {
        let payload = ClientKeyExchangePayload::Psk {
            identity: b"alice".to_vec(),
        };
        let encoded = encode_client_key_exchange(&payload);
        let (_, body, _) = parse_handshake_header(&encoded).unwrap();
        let mut bad = body.to_vec();
        bad.push(0);
        assert!(decode_client_key_exchange(&bad, KeyExchangeAlg::Psk).is_err());
    }

    #[test]
    fn test_certificate_request12_roundtrip() {
        let msg = CertificateRequest12Msg {
            certificate_types: vec![1, 64],
            signature_algorithms: vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::ECDSA_SECP256R1_SHA256,
            ],
            ca_names: vec![vec![0x30, 0x10], vec![0x30, 0x20]],
        };
        let encoded = encode_certificate_request12(&msg);
        let (_, body, _) = parse_handshake_header(&encoded).unwrap();
        let decoded = decode_certificate_request12(body).unwrap();
        assert_eq!(decoded.certificate_types, vec![1, 64]);
        assert_eq!(decoded.signature_algorithms.len(), 2);
        assert_eq!(decoded.ca_names.len(), 2);
    }

    #[test]
    fn test_server_hello_done() {
        let encoded = encode_server_hello_done();
        let (ty, body, _) = parse_handshake_header(&encoded).unwrap();
        assert_eq!(ty, HandshakeType::ServerHelloDone);
        decode_server_hello_done(body).unwrap();
        assert!(decode_server_hello_done(&[0]).is_err());
    }

    #[test]
    fn test_new_session_ticket12_roundtrip() {
        let msg = NewSessionTicket12Msg {
            lifetime_hint: 3600,
            ticket: vec![0xCC; 96],
        };
        let encoded = encode_new_session_ticket12(&msg);
        let (_, body, _) = parse_handshake_header(&encoded).unwrap();
        let decoded = decode_new_session_ticket12(body).unwrap();
        assert_eq!(decoded.lifetime_hint, 3600);
        assert_eq!(decoded.ticket, vec![0xCC; 96]);
    }
}
