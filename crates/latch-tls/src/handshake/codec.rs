//! Handshake message encoding/decoding (RFC 8446 §4, shared hello
//! formats also used by ≤1.2).
//!
//! Wire format only; negotiation policy lives in `negotiate`. Every
//! vector's declared length must equal the bytes consumed, duplicate
//! extension types are rejected, and a ClientHello parse records where
//! the `pre_shared_key` binders begin so the truncated transcript can
//! be reconstructed.

use latch_types::TlsError;

use crate::crypt::SignatureScheme;
use crate::extensions::{Extension, ExtensionType};
use crate::CipherSuite;

use super::HandshakeType;

/// The fixed ServerHello.random of a HelloRetryRequest (RFC 8446 §4.1.3).
pub const HELLO_RETRY_REQUEST_RANDOM: [u8; 32] = [
    0xCF, 0x21, 0xAD, 0x74, 0xE5, 0x9A, 0x61, 0x11, 0xBE, 0x1D, 0x8C, 0x02, 0x1E, 0x65, 0xB8,
    0x91, 0xC2, 0xA2, 0x11, 0x16, 0x7A, 0xBB, 0x8C, 0x5E, 0x07, 0x9E, 0x09, 0xE2, 0xC8, 0xA8,
    0x33, 0x9C,
];

/// The TLS 1.2 downgrade sentinel in ServerHello.random[24..]
/// (RFC 8446 §4.1.3).
pub const DOWNGRADE_TLS12_SENTINEL: [u8; 8] = [0x44, 0x4F, 0x57, 0x4E, 0x47, 0x52, 0x44, 0x01];

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// ClientHello message.
#[derive(Debug, Clone)]
pub struct ClientHello {
    pub legacy_version: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    #[cfg(feature = "dtls12")]
    pub cookie: Vec<u8>,
    pub cipher_suites: Vec<CipherSuite>,
    pub compression_methods: Vec<u8>,
    pub extensions: Vec<Extension>,
    /// Offset of the PSK binders vector within the complete handshake
    /// message (header included), when `pre_shared_key` was offered.
    pub binders_offset: Option<usize>,
}

impl ClientHello {
    pub fn find_extension(&self, ty: ExtensionType) -> Option<&[u8]> {
        self.extensions
            .iter()
            .find(|e| e.extension_type == ty)
            .map(|e| e.data.as_slice())
    }

    pub fn has_extension(&self, ty: ExtensionType) -> bool {
        self.find_extension(ty).is_some()
    }

    pub fn offers_scsv(&self) -> bool {
        self.cipher_suites
            .contains(&CipherSuite::TLS_EMPTY_RENEGOTIATION_INFO_SCSV)
    }
}

/// ServerHello message (also carries HelloRetryRequest).
#[derive(Debug, Clone)]
pub struct ServerHello {
    pub legacy_version: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suite: CipherSuite,
    pub compression_method: u8,
    pub extensions: Vec<Extension>,
}

impl ServerHello {
    pub fn is_hello_retry_request(&self) -> bool {
        self.random == HELLO_RETRY_REQUEST_RANDOM
    }

    pub fn find_extension(&self, ty: ExtensionType) -> Option<&[u8]> {
        self.extensions
            .iter()
            .find(|e| e.extension_type == ty)
            .map(|e| e.data.as_slice())
    }
}

/// EncryptedExtensions message.
#[derive(Debug, Clone)]
pub struct EncryptedExtensions {
    pub extensions: Vec<Extension>,
}

/// One entry of a TLS 1.3 Certificate message.
#[derive(Debug, Clone)]
pub struct CertificateEntry {
    pub cert_data: Vec<u8>,
    pub extensions: Vec<Extension>,
}

/// TLS 1.3 Certificate message.
#[derive(Debug, Clone)]
pub struct CertificateMsg {
    pub certificate_request_context: Vec<u8>,
    pub certificate_list: Vec<CertificateEntry>,
}

/// TLS 1.3 CertificateRequest message.
#[derive(Debug, Clone)]
pub struct CertificateRequestMsg {
    pub certificate_request_context: Vec<u8>,
    pub extensions: Vec<Extension>,
}

/// CertificateVerify message.
#[derive(Debug, Clone)]
pub struct CertificateVerifyMsg {
    pub algorithm: SignatureScheme,
    pub signature: Vec<u8>,
}

/// Finished message.
#[derive(Debug, Clone)]
pub struct FinishedMsg {
    pub verify_data: Vec<u8>,
}

/// TLS 1.3 NewSessionTicket message.
#[derive(Debug, Clone)]
pub struct NewSessionTicketMsg {
    pub ticket_lifetime: u32,
    pub ticket_age_add: u32,
    pub ticket_nonce: Vec<u8>,
    pub ticket: Vec<u8>,
    pub extensions: Vec<Extension>,
}

/// KeyUpdate message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyUpdateMsg {
    pub update_requested: bool,
}

// ---------------------------------------------------------------------------
// Handshake header
// ---------------------------------------------------------------------------

/// Parse a handshake header: msg_type(1) || length(3).
/// Returns (type, body, total bytes consumed).
pub fn parse_handshake_header(data: &[u8]) -> Result<(HandshakeType, &[u8], usize), TlsError> {
    if data.len() < 4 {
        return Err(TlsError::Decode("handshake header too short".into()));
    }
    let msg_type = HandshakeType::from_u8(data[0])
        .ok_or_else(|| TlsError::Decode(format!("unknown handshake type {}", data[0])))?;
    let length = read_u24(&data[1..]) as usize;
    let total = 4 + length;
    if data.len() < total {
        return Err(TlsError::Decode("handshake body truncated".into()));
    }
    Ok((msg_type, &data[4..total], total))
}

/// Wrap a handshake body with the 4-byte header.
pub fn wrap_handshake(msg_type: HandshakeType, body: &[u8]) -> Vec<u8> {
    let len = body.len();
    let mut out = Vec::with_capacity(4 + len);
    out.push(msg_type as u8);
    out.push((len >> 16) as u8);
    out.push((len >> 8) as u8);
    out.push(len as u8);
    out.extend_from_slice(body);
    out
}

// ---------------------------------------------------------------------------
// Extension block
// ---------------------------------------------------------------------------

/// Iterate `(type, body)` pairs of a raw extension list (no length
/// prefix), rejecting duplicate type codes and length mismatches.
pub struct ExtensionIter<'a> {
    data: &'a [u8],
    pos: usize,
    seen: Vec<u16>,
}

impl<'a> ExtensionIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            seen: Vec::new(),
        }
    }

    /// Byte offset of the next unread extension.
    pub fn offset(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for ExtensionIter<'a> {
    type Item = Result<(ExtensionType, &'a [u8]), TlsError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos == self.data.len() {
            return None;
        }
        if self.data.len() - self.pos < 4 {
            self.pos = self.data.len();
            return Some(Err(TlsError::Decode("extension header truncated".into())));
        }
        let ty = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        let len = u16::from_be_bytes([self.data[self.pos + 2], self.data[self.pos + 3]]) as usize;
        self.pos += 4;
        if self.data.len() - self.pos < len {
            self.pos = self.data.len();
            return Some(Err(TlsError::Decode("extension body truncated".into())));
        }
        if self.seen.contains(&ty) {
            self.pos = self.data.len();
            return Some(Err(TlsError::Decode(format!(
                "duplicate extension type {ty}"
            ))));
        }
        self.seen.push(ty);
        let body = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(Ok((ExtensionType(ty), body)))
    }
}

/// Parse an extension block that starts with its 2-byte length prefix.
/// Returns the extensions and the total bytes consumed.
pub fn parse_extension_block(data: &[u8]) -> Result<(Vec<Extension>, usize), TlsError> {
    if data.len() < 2 {
        return Err(TlsError::Decode("extension block length truncated".into()));
    }
    let block_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() < 2 + block_len {
        return Err(TlsError::Decode("extension block truncated".into()));
    }
    let mut exts = Vec::new();
    for item in ExtensionIter::new(&data[2..2 + block_len]) {
        let (ty, body) = item?;
        exts.push(Extension::new(ty, body.to_vec()));
    }
    Ok((exts, 2 + block_len))
}

/// Encode an extension list with its 2-byte length prefix.
pub fn encode_extension_block(exts: &[Extension]) -> Result<Vec<u8>, TlsError> {
    let mut body = Vec::new();
    for ext in exts {
        if ext.data.len() > u16::MAX as usize {
            return Err(TlsError::Internal("extension body too long".into()));
        }
        body.extend_from_slice(&ext.extension_type.0.to_be_bytes());
        body.extend_from_slice(&(ext.data.len() as u16).to_be_bytes());
        body.extend_from_slice(&ext.data);
    }
    if body.len() > u16::MAX as usize {
        return Err(TlsError::Internal("extension block too long".into()));
    }
    let mut out = Vec::with_capacity(2 + body.len());
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

// ---------------------------------------------------------------------------
// ClientHello
// ---------------------------------------------------------------------------

/// Encode a ClientHello as a complete handshake message.
pub fn encode_client_hello(ch: &ClientHello) -> Result<Vec<u8>, TlsError> {
    let mut body = Vec::with_capacity(256);
    body.extend_from_slice(&ch.legacy_version.to_be_bytes());
    body.extend_from_slice(&ch.random);

    if ch.session_id.len() > 32 {
        return Err(TlsError::Internal("session id longer than 32 bytes".into()));
    }
    body.push(ch.session_id.len() as u8);
    body.extend_from_slice(&ch.session_id);

    #[cfg(feature = "dtls12")]
    if ch.legacy_version == crate::TlsVersion::Dtls12.wire() {
        body.push(ch.cookie.len() as u8);
        body.extend_from_slice(&ch.cookie);
    }

    let suites_len = (ch.cipher_suites.len() * 2) as u16;
    body.extend_from_slice(&suites_len.to_be_bytes());
    for s in &ch.cipher_suites {
        body.extend_from_slice(&s.0.to_be_bytes());
    }

    body.push(ch.compression_methods.len() as u8);
    body.extend_from_slice(&ch.compression_methods);

    body.extend_from_slice(&encode_extension_block(&ch.extensions)?);
    Ok(wrap_handshake(HandshakeType::ClientHello, &body))
}

/// Decode a ClientHello from handshake body bytes.
///
/// `is_dtls` selects the cookie field. The binders offset is recorded
/// relative to the complete handshake message (4-byte header included).
pub fn decode_client_hello(data: &[u8], is_dtls: bool) -> Result<ClientHello, TlsError> {
    let err = |msg: &str| TlsError::Decode(format!("ClientHello: {msg}"));
    let mut pos = 0;

    if data.len() < pos + 2 {
        return Err(err("too short for version"));
    }
    let legacy_version = u16::from_be_bytes([data[pos], data[pos + 1]]);
    pos += 2;

    if data.len() < pos + 32 {
        return Err(err("too short for random"));
    }
    let mut random = [0u8; 32];
    random.copy_from_slice(&data[pos..pos + 32]);
    pos += 32;

    if data.len() < pos + 1 {
        return Err(err("too short for session_id length"));
    }
    let sid_len = data[pos] as usize;
    pos += 1;
    if sid_len > 32 {
        return Err(err("session_id longer than 32 bytes"));
    }
    if data.len() < pos + sid_len {
        return Err(err("too short for session_id"));
    }
    let session_id = data[pos..pos + sid_len].to_vec();
    pos += sid_len;

    #[cfg(feature = "dtls12")]
    let mut cookie = Vec::new();
    if is_dtls {
        if data.len() < pos + 1 {
            return Err(err("too short for cookie length"));
        }
        let cookie_len = data[pos] as usize;
        pos += 1;
        if data.len() < pos + cookie_len {
            return Err(err("too short for cookie"));
        }
        #[cfg(feature = "dtls12")]
        {
            cookie = data[pos..pos + cookie_len].to_vec();
        }
        pos += cookie_len;
    }

    if data.len() < pos + 2 {
        return Err(err("too short for cipher_suites length"));
    }
    let suites_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
    pos += 2;
    if suites_len == 0 || suites_len % 2 != 0 {
        return Err(err("invalid cipher_suites length"));
    }
    if data.len() < pos + suites_len {
        return Err(err("too short for cipher_suites"));
    }
    let mut cipher_suites = Vec::with_capacity(suites_len / 2);
    for i in (0..suites_len).step_by(2) {
        cipher_suites.push(CipherSuite(u16::from_be_bytes([
            data[pos + i],
            data[pos + i + 1],
        ])));
    }
    pos += suites_len;

    if data.len() < pos + 1 {
        return Err(err("too short for compression_methods length"));
    }
    let comp_len = data[pos] as usize;
    pos += 1;
    if comp_len == 0 {
        return Err(err("empty compression_methods"));
    }
    if data.len() < pos + comp_len {
        return Err(err("too short for compression_methods"));
    }
    let compression_methods = data[pos..pos + comp_len].to_vec();
    pos += comp_len;

    // Extension block (may be absent entirely in minimal ≤1.2 hellos).
    let mut extensions = Vec::new();
    let mut binders_offset = None;
    if pos < data.len() {
        if data.len() - pos < 2 {
            return Err(err("extension block length truncated"));
        }
        let block_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
        let block_start = pos + 2;
        if data.len() - block_start != block_len {
            return Err(err("extension block length mismatch"));
        }
        let block = &data[block_start..block_start + block_len];
        let mut iter = ExtensionIter::new(block);
        loop {
            let ext_start = iter.offset();
            let Some(item) = iter.next() else { break };
            let (ty, ext_body) = item.map_err(|e| match e {
                TlsError::Decode(m) => err(&m),
                other => other,
            })?;
            if ty == ExtensionType::PRE_SHARED_KEY {
                // pre_shared_key MUST be the last extension
                // (RFC 8446 §4.2.11).
                if iter.offset() != block.len() {
                    return Err(TlsError::IllegalParameter(
                        "pre_shared_key is not the last ClientHello extension".into(),
                    ));
                }
                // Locate the binders vector: identities<7..2^16-1>
                // then binders<33..2^16-1>.
                if ext_body.len() < 2 {
                    return Err(err("pre_shared_key too short"));
                }
                let identities_len = u16::from_be_bytes([ext_body[0], ext_body[1]]) as usize;
                if ext_body.len() < 2 + identities_len {
                    return Err(err("pre_shared_key identities truncated"));
                }
                // offset within the complete message: header(4) + body
                // position of this extension's data + identities.
                let ext_data_pos = block_start + ext_start + 4;
                binders_offset = Some(4 + ext_data_pos + 2 + identities_len);
            }
            extensions.push(Extension::new(ty, ext_body.to_vec()));
        }
    }

    Ok(ClientHello {
        legacy_version,
        random,
        session_id,
        #[cfg(feature = "dtls12")]
        cookie,
        cipher_suites,
        compression_methods,
        extensions,
        binders_offset,
    })
}

// ---------------------------------------------------------------------------
// ServerHello
// ---------------------------------------------------------------------------

/// Encode a ServerHello (or HelloRetryRequest) as a complete handshake
/// message.
pub fn encode_server_hello(sh: &ServerHello) -> Result<Vec<u8>, TlsError> {
    let mut body = Vec::with_capacity(128);
    body.extend_from_slice(&sh.legacy_version.to_be_bytes());
    body.extend_from_slice(&sh.random);
    if sh.session_id.len() > 32 {
        return Err(TlsError::Internal("session id longer than 32 bytes".into()));
    }
    body.push(sh.session_id.len() as u8);
    body.extend_from_slice(&sh.session_id);
    body.extend_from_slice(&sh.cipher_suite.0.to_be_bytes());
    body.push(sh.compression_method);
    body.extend_from_slice(&encode_extension_block(&sh.extensions)?);
    Ok(wrap_handshake(HandshakeType::ServerHello, &body))
}

/// Decode a ServerHello from handshake body bytes.
pub fn decode_server_hello(data: &[u8]) -> Result<ServerHello, TlsError> {
    let err = |msg: &str| TlsError::Decode(format!("ServerHello: {msg}"));
    let mut pos = 0;

    if data.len() < pos + 2 {
        return Err(err("too short for version"));
    }
    let legacy_version = u16::from_be_bytes([data[pos], data[pos + 1]]);
    pos += 2;

    if data.len() < pos + 32 {
        return Err(err("too short for random"));
    }
    let mut random = [0u8; 32];
    random.copy_from_slice(&data[pos..pos + 32]);
    pos += 32;

    if data.len() < pos + 1 {
        return Err(err("too short for session_id length"));
    }
    let sid_len = data[pos] as usize;
    pos += 1;
    if sid_len > 32 {
        return Err(err("session_id longer than 32 bytes"));
    }
    if data.len() < pos + sid_len {
        return Err(err("too short for session_id"));
    }
    let session_id = data[pos..pos + sid_len].to_vec();
    pos += sid_len;

    if data.len() < pos + 3 {
        return Err(err("too short for cipher_suite"));
    }
    let cipher_suite = CipherSuite(u16::from_be_bytes([data[pos], data[pos + 1]]));
    let compression_method = data[pos + 2];
    pos += 3;

    let extensions = if pos < data.len() {
        let (exts, consumed) = parse_extension_block(&data[pos..])?;
        if pos + consumed != data.len() {
            return Err(err("trailing bytes after extensions"));
        }
        exts
    } else {
        Vec::new()
    };

    Ok(ServerHello {
        legacy_version,
        random,
        session_id,
        cipher_suite,
        compression_method,
        extensions,
    })
}

// ---------------------------------------------------------------------------
// EncryptedExtensions
// ---------------------------------------------------------------------------

pub fn encode_encrypted_extensions(ee: &EncryptedExtensions) -> Result<Vec<u8>, TlsError> {
    let body = encode_extension_block(&ee.extensions)?;
    Ok(wrap_handshake(HandshakeType::EncryptedExtensions, &body))
}

pub fn decode_encrypted_extensions(data: &[u8]) -> Result<EncryptedExtensions, TlsError> {
    let (extensions, consumed) = parse_extension_block(data)?;
    if consumed != data.len() {
        return Err(TlsError::Decode(
            "EncryptedExtensions: trailing bytes".into(),
        ));
    }
    Ok(EncryptedExtensions { extensions })
}

// ---------------------------------------------------------------------------
// Certificate (TLS 1.3)
// ---------------------------------------------------------------------------

pub fn encode_certificate(msg: &CertificateMsg) -> Result<Vec<u8>, TlsError> {
    let mut body = Vec::new();
    body.push(msg.certificate_request_context.len() as u8);
    body.extend_from_slice(&msg.certificate_request_context);

    let mut list = Vec::new();
    for entry in &msg.certificate_list {
        push_u24(&mut list, entry.cert_data.len());
        list.extend_from_slice(&entry.cert_data);
        list.extend_from_slice(&encode_extension_block(&entry.extensions)?);
    }
    push_u24(&mut body, list.len());
    body.extend_from_slice(&list);
    Ok(wrap_handshake(HandshakeType::Certificate, &body))
}

pub fn decode_certificate(data: &[u8]) -> Result<CertificateMsg, TlsError> {
    let err = |msg: &str| TlsError::Decode(format!("Certificate: {msg}"));
    let mut pos = 0;

    if data.is_empty() {
        return Err(err("empty"));
    }
    let ctx_len = data[pos] as usize;
    pos += 1;
    if data.len() < pos + ctx_len {
        return Err(err("truncated context"));
    }
    let certificate_request_context = data[pos..pos + ctx_len].to_vec();
    pos += ctx_len;

    if data.len() < pos + 3 {
        return Err(err("truncated list length"));
    }
    let list_len = read_u24(&data[pos..]) as usize;
    pos += 3;
    if data.len() - pos != list_len {
        return Err(err("list length mismatch"));
    }
    let list_end = pos + list_len;

    let mut certificate_list = Vec::new();
    while pos < list_end {
        if list_end - pos < 3 {
            return Err(err("truncated entry length"));
        }
        let cert_len = read_u24(&data[pos..]) as usize;
        pos += 3;
        if list_end - pos < cert_len {
            return Err(err("truncated cert data"));
        }
        let cert_data = data[pos..pos + cert_len].to_vec();
        pos += cert_len;

        let (extensions, consumed) = parse_extension_block(&data[pos..list_end])?;
        pos += consumed;

        certificate_list.push(CertificateEntry {
            cert_data,
            extensions,
        });
    }

    Ok(CertificateMsg {
        certificate_request_context,
        certificate_list,
    })
}

// ---------------------------------------------------------------------------
// CertificateRequest (TLS 1.3)
// ---------------------------------------------------------------------------

pub fn encode_certificate_request(msg: &CertificateRequestMsg) -> Result<Vec<u8>, TlsError> {
    let mut body = Vec::new();
    body.push(msg.certificate_request_context.len() as u8);
    body.extend_from_slice(&msg.certificate_request_context);
    body.extend_from_slice(&encode_extension_block(&msg.extensions)?);
    Ok(wrap_handshake(HandshakeType::CertificateRequest, &body))
}

pub fn decode_certificate_request(data: &[u8]) -> Result<CertificateRequestMsg, TlsError> {
    let err = |msg: &str| TlsError::Decode(format!("CertificateRequest: {msg}"));
    if data.is_empty() {
        return Err(err("empty"));
    }
    let ctx_len = data[0] as usize;
    if data.len() < 1 + ctx_len {
        return Err(err("truncated context"));
    }
    let certificate_request_context = data[1..1 + ctx_len].to_vec();
    let (extensions, consumed) = parse_extension_block(&data[1 + ctx_len..])?;
    if 1 + ctx_len + consumed != data.len() {
        return Err(err("trailing bytes"));
    }
    Ok(CertificateRequestMsg {
        certificate_request_context,
        extensions,
    })
}

// ---------------------------------------------------------------------------
// CertificateVerify
// ---------------------------------------------------------------------------

pub fn encode_certificate_verify(msg: &CertificateVerifyMsg) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + msg.signature.len());
    body.extend_from_slice(&msg.algorithm.0.to_be_bytes());
    body.extend_from_slice(&(msg.signature.len() as u16).to_be_bytes());
    body.extend_from_slice(&msg.signature);
    wrap_handshake(HandshakeType::CertificateVerify, &body)
}

pub fn decode_certificate_verify(data: &[u8]) -> Result<CertificateVerifyMsg, TlsError> {
    let err = |msg: &str| TlsError::Decode(format!("CertificateVerify: {msg}"));
    if data.len() < 4 {
        return Err(err("too short"));
    }
    let algorithm = SignatureScheme(u16::from_be_bytes([data[0], data[1]]));
    let sig_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if data.len() != 4 + sig_len {
        return Err(err("signature length mismatch"));
    }
    Ok(CertificateVerifyMsg {
        algorithm,
        signature: data[4..].to_vec(),
    })
}

// ---------------------------------------------------------------------------
// Finished
// ---------------------------------------------------------------------------

pub fn encode_finished(verify_data: &[u8]) -> Vec<u8> {
    wrap_handshake(HandshakeType::Finished, verify_data)
}

pub fn decode_finished(data: &[u8], expected_len: usize) -> Result<FinishedMsg, TlsError> {
    if data.len() != expected_len {
        return Err(TlsError::Decode("Finished: verify_data length".into()));
    }
    Ok(FinishedMsg {
        verify_data: data.to_vec(),
    })
}

// ---------------------------------------------------------------------------
// NewSessionTicket (TLS 1.3)
// ---------------------------------------------------------------------------

pub fn encode_new_session_ticket(msg: &NewSessionTicketMsg) -> Result<Vec<u8>, TlsError> {
    let mut body = Vec::new();
    body.extend_from_slice(&msg.ticket_lifetime.to_be_bytes());
    body.extend_from_slice(&msg.ticket_age_add.to_be_bytes());
    body.push(msg.ticket_nonce.len() as u8);
    body.extend_from_slice(&msg.ticket_nonce);
    if msg.ticket.len() > u16::MAX as usize {
        return Err(TlsError::Internal("ticket too long".into()));
    }
    body.extend_from_slice(&(msg.ticket.len() as u16).to_be_bytes());
    body.extend_from_slice(&msg.ticket);
    body.extend_from_slice(&encode_extension_block(&msg.extensions)?);
    Ok(wrap_handshake(HandshakeType::NewSessionTicket, &body))
}

pub fn decode_new_session_ticket(data: &[u8]) -> Result<NewSessionTicketMsg, TlsError> {
    let err = |msg: &str| TlsError::Decode(format!("NewSessionTicket: {msg}"));
    let mut pos = 0;
    if data.len() < 9 {
        return Err(err("too short"));
    }
    let ticket_lifetime = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let ticket_age_add = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    pos += 8;
    let nonce_len = data[pos] as usize;
    pos += 1;
    if data.len() < pos + nonce_len {
        return Err(err("truncated nonce"));
    }
    let ticket_nonce = data[pos..pos + nonce_len].to_vec();
    pos += nonce_len;
    if data.len() < pos + 2 {
        return Err(err("truncated ticket length"));
    }
    let ticket_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
    pos += 2;
    if ticket_len == 0 {
        return Err(err("empty ticket"));
    }
    if data.len() < pos + ticket_len {
        return Err(err("truncated ticket"));
    }
    let ticket = data[pos..pos + ticket_len].to_vec();
    pos += ticket_len;
    let (extensions, consumed) = parse_extension_block(&data[pos..])?;
    if pos + consumed != data.len() {
        return Err(err("trailing bytes"));
    }
    Ok(NewSessionTicketMsg {
        ticket_lifetime,
        ticket_age_add,
        ticket_nonce,
        ticket,
        extensions,
    })
}

// ---------------------------------------------------------------------------
// KeyUpdate / HelloRequest
// ---------------------------------------------------------------------------

pub fn encode_key_update(msg: &KeyUpdateMsg) -> Vec<u8> {
    wrap_handshake(
        HandshakeType::KeyUpdate,
        &[if msg.update_requested { 1 } else { 0 }],
    )
}

pub fn decode_key_update(data: &[u8]) -> Result<KeyUpdateMsg, TlsError> {
    if data.len() != 1 {
        return Err(TlsError::Decode("KeyUpdate: body must be 1 byte".into()));
    }
    match data[0] {
        0 => Ok(KeyUpdateMsg {
            update_requested: false,
        }),
        1 => Ok(KeyUpdateMsg {
            update_requested: true,
        }),
        v => Err(TlsError::IllegalParameter(format!(
            "KeyUpdate: unknown request_update {v}"
        ))),
    }
}

pub fn encode_hello_request() -> Vec<u8> {
    wrap_handshake(HandshakeType::HelloRequest, &[])
}

// ---------------------------------------------------------------------------
// Numeric helpers
// ---------------------------------------------------------------------------

pub(crate) fn read_u24(data: &[u8]) -> u32 {
    ((data[0] as u32) << 16) | ((data[1] as u32) << 8) | (data[2] as u32)
}

pub(crate) fn push_u24(out: &mut Vec<u8>, v: usize) {
    out.push((v >> 16) as u8);
    out.push((v >> 8) as u8);
    out.push(v as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::ExtensionType;

    fn sample_client_hello() -> ClientHello {
        ClientHello {
            legacy_version: 0x0303,
            random: [0xAA; 32],
            session_id: vec![1, 2, 3],
            #[cfg(feature = "dtls12")]
            cookie: Vec::new(),
            cipher_suites: vec![
                CipherSuite::TLS_AES_128_GCM_SHA256,
                CipherSuite::TLS_CHACHA20_POLY1305_SHA256,
            ],
            compression_methods: vec![0],
            extensions: vec![
                Extension::new(ExtensionType::SUPPORTED_VERSIONS, vec![0x02, 0x03, 0x04]),
                Extension::new(ExtensionType::SUPPORTED_GROUPS, vec![0x00, 0x02, 0x00, 0x1D]),
            ],
            binders_offset: None,
        }
    }

    #[test]
    fn test_client_hello_roundtrip() {
        let ch = sample_client_hello();
        let encoded = encode_client_hello(&ch).unwrap();
        let (ty, body, total) = parse_handshake_header(&encoded).unwrap();
        assert_eq!(ty, HandshakeType::ClientHello);
        assert_eq!(total, encoded.len());

        let decoded = decode_client_hello(body, false).unwrap();
        assert_eq!(decoded.legacy_version, 0x0303);
        assert_eq!(decoded.random, [0xAA; 32]);
        assert_eq!(decoded.session_id, vec![1, 2, 3]);
        assert_eq!(decoded.cipher_suites, ch.cipher_suites);
        assert_eq!(decoded.compression_methods, vec![0]);
        assert_eq!(decoded.extensions, ch.extensions);
        assert!(decoded.binders_offset.is_none());
    }

    #[test]
    fn test_client_hello_session_id_boundaries() {
        // 32-byte session id is fine
        let mut ch = sample_client_hello();
        ch.session_id = vec![7; 32];
        let encoded = encode_client_hello(&ch).unwrap();
        let (_, body, _) = parse_handshake_header(&encoded).unwrap();
        assert_eq!(decode_client_hello(body, false).unwrap().session_id.len(), 32);

        // Empty session id is fine
        ch.session_id = Vec::new();
        let encoded = encode_client_hello(&ch).unwrap();
        let (_, body, _) = parse_handshake_header(&encoded).unwrap();
        assert!(decode_client_hello(body, false).unwrap().session_id.is_empty());

        // >32 on the wire is a decode error
        let mut body = Vec::new();
        body.extend_from_slice(&0x0303u16.to_be_bytes());
        body.extend_from_slice(&[0; 32]);
        body.push(33);
        body.extend_from_slice(&[0; 33]);
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01, 0x01, 0x00]);
        let e = decode_client_hello(&body, false).unwrap_err();
        assert!(matches!(e, TlsError::Decode(_)));
    }

    #[test]
    fn test_client_hello_empty_extension_block() {
        let mut ch = sample_client_hello();
        ch.extensions.clear();
        let encoded = encode_client_hello(&ch).unwrap();
        let (_, body, _) = parse_handshake_header(&encoded).unwrap();
        let decoded = decode_client_hello(body, false).unwrap();
        assert!(decoded.extensions.is_empty());
    }

    #[test]
    fn test_duplicate_extension_rejected() {
        let mut ch = sample_client_hello();
        ch.extensions.push(Extension::new(
            ExtensionType::SUPPORTED_VERSIONS,
            vec![0x02, 0x03, 0x04],
        ));
        let encoded = encode_client_hello(&ch).unwrap();
        let (_, body, _) = parse_handshake_header(&encoded).unwrap();
        let e = decode_client_hello(body, false).unwrap_err();
        assert!(matches!(e, TlsError::Decode(m) if m.contains("duplicate")));
    }

    #[test]
    fn test_psk_must_be_last_extension() {
        let mut ch = sample_client_hello();
        // identities: one 2-byte identity + age; binders: one 32-byte binder
        let mut psk = Vec::new();
        let mut ids = Vec::new();
        ids.extend_from_slice(&2u16.to_be_bytes());
        ids.extend_from_slice(b"id");
        ids.extend_from_slice(&0u32.to_be_bytes());
        psk.extend_from_slice(&(ids.len() as u16).to_be_bytes());
        psk.extend_from_slice(&ids);
        let mut binders = Vec::new();
        binders.push(32u8);
        binders.extend_from_slice(&[0; 32]);
        psk.extend_from_slice(&(binders.len() as u16).to_be_bytes());
        psk.extend_from_slice(&binders);

        // PSK not last → illegal_parameter
        let mut ch_bad = ch.clone();
        ch_bad.extensions.insert(
            0,
            Extension::new(ExtensionType::PRE_SHARED_KEY, psk.clone()),
        );
        let encoded = encode_client_hello(&ch_bad).unwrap();
        let (_, body, _) = parse_handshake_header(&encoded).unwrap();
        let e = decode_client_hello(body, false).unwrap_err();
        assert!(matches!(e, TlsError::IllegalParameter(_)));

        // PSK last → accepted, binders offset recorded
        ch.extensions
            .push(Extension::new(ExtensionType::PRE_SHARED_KEY, psk));
        let encoded = encode_client_hello(&ch).unwrap();
        let (_, body, _) = parse_handshake_header(&encoded).unwrap();
        let decoded = decode_client_hello(body, false).unwrap();
        let off = decoded.binders_offset.unwrap();
        // The bytes at the offset are the binders vector we built:
        // 2-byte list length (1 + 32), then the 32-byte binder entry.
        assert_eq!(&encoded[off..off + 2], &33u16.to_be_bytes());
        assert_eq!(encoded[off + 2], 32);
    }

    #[test]
    fn test_server_hello_roundtrip_and_hrr() {
        let sh = ServerHello {
            legacy_version: 0x0303,
            random: [0xBB; 32],
            session_id: vec![9; 8],
            cipher_suite: CipherSuite::TLS_AES_128_GCM_SHA256,
            compression_method: 0,
            extensions: vec![Extension::new(
                ExtensionType::SUPPORTED_VERSIONS,
                vec![0x03, 0x04],
            )],
        };
        assert!(!sh.is_hello_retry_request());
        let encoded = encode_server_hello(&sh).unwrap();
        let (ty, body, _) = parse_handshake_header(&encoded).unwrap();
        assert_eq!(ty, HandshakeType::ServerHello);
        let decoded = decode_server_hello(body).unwrap();
        assert_eq!(decoded.random, [0xBB; 32]);
        assert_eq!(decoded.session_id, vec![9; 8]);
        assert_eq!(decoded.cipher_suite, CipherSuite::TLS_AES_128_GCM_SHA256);
        assert_eq!(decoded.extensions, sh.extensions);

        let hrr = ServerHello {
            random: HELLO_RETRY_REQUEST_RANDOM,
            ..sh
        };
        assert!(hrr.is_hello_retry_request());
    }

    #[test]
    fn test_encrypted_extensions_roundtrip() {
        let ee = EncryptedExtensions {
            extensions: vec![Extension::new(ExtensionType::SERVER_NAME, vec![])],
        };
        let encoded = encode_encrypted_extensions(&ee).unwrap();
        let (_, body, _) = parse_handshake_header(&encoded).unwrap();
        let decoded = decode_encrypted_extensions(body).unwrap();
        assert_eq!(decoded.extensions, ee.extensions);

        // Empty block
        let ee = EncryptedExtensions { extensions: vec![] };
        let encoded = encode_encrypted_extensions(&ee).unwrap();
        let (_, body, _) = parse_handshake_header(&encoded).unwrap();
        assert!(decode_encrypted_extensions(body).unwrap().extensions.is_empty());
    }

    #[test]
    fn test_certificate_roundtrip() {
        let msg = CertificateMsg {
            certificate_request_context: vec![0xCC; 4],
            certificate_list: vec![
                CertificateEntry {
                    cert_data: vec![0x30, 0x82, 0x01, 0x00],
                    extensions: vec![],
                },
                CertificateEntry {
                    cert_data: vec![0x30, 0x03],
                    extensions: vec![],
                },
            ],
        };
        let encoded = encode_certificate(&msg).unwrap();
        let (ty, body, _) = parse_handshake_header(&encoded).unwrap();
        assert_eq!(ty, HandshakeType::Certificate);
        let decoded = decode_certificate(body).unwrap();
        assert_eq!(decoded.certificate_request_context, vec![0xCC; 4]);
        assert_eq!(decoded.certificate_list.len(), 2);
        assert_eq!(
            decoded.certificate_list[0].cert_data,
            vec![0x30, 0x82, 0x01, 0x00]
        );
    }

    #[test]
    fn test_certificate_request_roundtrip() {
        let msg = CertificateRequestMsg {
            certificate_request_context: vec![1, 2, 3, 4],
            extensions: vec![Extension::new(
                ExtensionType::SIGNATURE_ALGORITHMS,
                vec![0x00, 0x02, 0x04, 0x03],
            )],
        };
        let encoded = encode_certificate_request(&msg).unwrap();
        let (_, body, _) = parse_handshake_header(&encoded).unwrap();
        let decoded = decode_certificate_request(body).unwrap();
        assert_eq!(decoded.certificate_request_context, vec![1, 2, 3, 4]);
        assert_eq!(decoded.extensions, msg.extensions);
    }

    #[test]
    fn test_certificate_verify_roundtrip() {
        let msg = CertificateVerifyMsg {
            algorithm: SignatureScheme::ECDSA_SECP256R1_SHA256,
            signature: vec![0x5A; 70],
        };
        let encoded = encode_certificate_verify(&msg);
        let (_, body, _) = parse_handshake_header(&encoded).unwrap();
        let decoded = decode_certificate_verify(body).unwrap();
        assert_eq!(decoded.algorithm, SignatureScheme::ECDSA_SECP256R1_SHA256);
        assert_eq!(decoded.signature, vec![0x5A; 70]);

        // Length mismatch rejected
        let mut bad = body.to_vec();
        bad.push(0);
        assert!(decode_certificate_verify(&bad).is_err());
    }

    #[test]
    fn test_finished_roundtrip() {
        let encoded = encode_finished(&[0xAB; 32]);
        let (_, body, _) = parse_handshake_header(&encoded).unwrap();
        let decoded = decode_finished(body, 32).unwrap();
        assert_eq!(decoded.verify_data, vec![0xAB; 32]);
        assert!(decode_finished(body, 48).is_err());
    }

    #[test]
    fn test_new_session_ticket_roundtrip() {
        let msg = NewSessionTicketMsg {
            ticket_lifetime: 7200,
            ticket_age_add: 0xDEADBEEF,
            ticket_nonce: vec![0, 1],
            ticket: vec![0x77; 40],
            extensions: vec![],
        };
        let encoded = encode_new_session_ticket(&msg).unwrap();
        let (_, body, _) = parse_handshake_header(&encoded).unwrap();
        let decoded = decode_new_session_ticket(body).unwrap();
        assert_eq!(decoded.ticket_lifetime, 7200);
        assert_eq!(decoded.ticket_age_add, 0xDEADBEEF);
        assert_eq!(decoded.ticket_nonce, vec![0, 1]);
        assert_eq!(decoded.ticket, vec![0x77; 40]);

        // Empty ticket rejected
        let empty = NewSessionTicketMsg {
            ticket: vec![],
            ..msg
        };
        let encoded = encode_new_session_ticket(&empty).unwrap();
        let (_, body, _) = parse_handshake_header(&encoded).unwrap();
        assert!(decode_new_session_ticket(body).is_err());
    }

    #[test]
    fn test_key_update_roundtrip() {
        for requested in [false, true] {
            let msg = KeyUpdateMsg {
                update_requested: requested,
            };
            let encoded = encode_key_update(&msg);
            let (_, body, _) = parse_handshake_header(&encoded).unwrap();
            assert_eq!(decode_key_update(body).unwrap(), msg);
        }
        assert!(matches!(
            decode_key_update(&[2]),
            Err(TlsError::IllegalParameter(_))
        ));
        assert!(decode_key_update(&[]).is_err());
    }

    #[test]
    fn test_header_truncation() {
        assert!(parse_handshake_header(&[1, 0, 0]).is_err());
        // Declared length exceeds available bytes
        assert!(parse_handshake_header(&[20, 0, 0, 5, 1, 2]).is_err());
        // Unknown type
        assert!(parse_handshake_header(&[99, 0, 0, 0]).is_err());
    }

    #[cfg(feature = "dtls12")]
    #[test]
    fn test_dtls_client_hello_cookie() {
        let ch = ClientHello {
            legacy_version: crate::TlsVersion::Dtls12.wire(),
            random: [1; 32],
            session_id: vec![],
            cookie: vec![0xC0, 0x0C, 0x1E],
            cipher_suites: vec![CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256],
            compression_methods: vec![0],
            extensions: vec![],
            binders_offset: None,
        };
        let encoded = encode_client_hello(&ch).unwrap();
        let (_, body, _) = parse_handshake_header(&encoded).unwrap();
        let decoded = decode_client_hello(body, true).unwrap();
        assert_eq!(decoded.cookie, vec![0xC0, 0x0C, 0x1E]);
    }
}
