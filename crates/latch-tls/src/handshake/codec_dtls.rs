//! DTLS 1.2 handshake framing (RFC 6347 §4.2): the 12-byte fragment
//! header, HelloVerifyRequest, and fragment reassembly.
//!
//! The transcript covers the canonical unfragmented header (message_seq
//! plus fragment fields describing the whole message), so reassembly
//! reconstructs that form.

use latch_types::TlsError;

use super::codec::read_u24;
use super::HandshakeType;

/// DTLS handshake fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtlsFragmentHeader {
    pub msg_type: HandshakeType,
    pub length: usize,
    pub message_seq: u16,
    pub fragment_offset: usize,
    pub fragment_length: usize,
}

pub const DTLS_HEADER_LEN: usize = 12;

/// HelloVerifyRequest message (RFC 6347 §4.2.1).
#[derive(Debug, Clone)]
pub struct HelloVerifyRequest {
    pub server_version: u16,
    pub cookie: Vec<u8>,
}

/// Parse a DTLS fragment header; returns the header and fragment body.
pub fn parse_dtls_fragment(data: &[u8]) -> Result<(DtlsFragmentHeader, &[u8]), TlsError> {
    if data.len() < DTLS_HEADER_LEN {
        return Err(TlsError::Decode("dtls handshake header too short".into()));
    }
    let msg_type = HandshakeType::from_u8(data[0])
        .ok_or_else(|| TlsError::Decode(format!("unknown handshake type {}", data[0])))?;
    let length = read_u24(&data[1..]) as usize;
    let message_seq = u16::from_be_bytes([data[4], data[5]]);
    let fragment_offset = read_u24(&data[6..]) as usize;
    let fragment_length = read_u24(&data[9..]) as usize;
    if fragment_offset + fragment_length > length {
        return Err(TlsError::Decode("dtls fragment exceeds message".into()));
    }
    if data.len() - DTLS_HEADER_LEN < fragment_length {
        return Err(TlsError::Decode("dtls fragment body truncated".into()));
    }
    Ok((
        DtlsFragmentHeader {
            msg_type,
            length,
            message_seq,
            fragment_offset,
            fragment_length,
        },
        &data[DTLS_HEADER_LEN..DTLS_HEADER_LEN + fragment_length],
    ))
}

/// Wrap a complete handshake body in an unfragmented DTLS header.
pub fn wrap_dtls_handshake(msg_type: HandshakeType, message_seq: u16, body: &[u8]) -> Vec<u8> {
    let len = body.len();
    let mut out = Vec::with_capacity(DTLS_HEADER_LEN + len);
    out.push(msg_type as u8);
    out.push((len >> 16) as u8);
    out.push((len >> 8) as u8);
    out.push(len as u8);
    out.extend_from_slice(&message_seq.to_be_bytes());
    out.extend_from_slice(&[0, 0, 0]); // fragment_offset
    out.push((len >> 16) as u8); // fragment_length == length
    out.push((len >> 8) as u8);
    out.push(len as u8);
    out.extend_from_slice(body);
    out
}

/// Split a complete DTLS handshake message into fragments that fit
/// `max_fragment` body bytes each.
pub fn fragment_dtls_message(
    msg_type: HandshakeType,
    message_seq: u16,
    body: &[u8],
    max_fragment: usize,
) -> Vec<Vec<u8>> {
    if max_fragment == 0 || body.len() <= max_fragment {
        return vec![wrap_dtls_handshake(msg_type, message_seq, body)];
    }
    let total = body.len();
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < total {
        let frag_len = max_fragment.min(total - offset);
        let mut frag = Vec::with_capacity(DTLS_HEADER_LEN + frag_len);
        frag.push(msg_type as u8);
        frag.push((total >> 16) as u8);
        frag.push((total >> 8) as u8);
        frag.push(total as u8);
        frag.extend_from_slice(&message_seq.to_be_bytes());
        frag.push((offset >> 16) as u8);
        frag.push((offset >> 8) as u8);
        frag.push(offset as u8);
        frag.push((frag_len >> 16) as u8);
        frag.push((frag_len >> 8) as u8);
        frag.push(frag_len as u8);
        frag.extend_from_slice(&body[offset..offset + frag_len]);
        out.push(frag);
        offset += frag_len;
    }
    out
}

/// Reassembles one in-flight handshake message from fragments.
pub struct FragmentReassembler {
    msg_type: HandshakeType,
    message_seq: u16,
    body: Vec<u8>,
    received: Vec<bool>,
}

impl FragmentReassembler {
    pub fn new(header: &DtlsFragmentHeader) -> Self {
        Self {
            msg_type: header.msg_type,
            message_seq: header.message_seq,
            body: vec![0; header.length],
            received: vec![false; header.length],
        }
    }

    /// Add a fragment; returns the reassembled canonical message
    /// (unfragmented DTLS framing) once every byte has arrived.
    pub fn add(
        &mut self,
        header: &DtlsFragmentHeader,
        fragment: &[u8],
    ) -> Result<Option<Vec<u8>>, TlsError> {
        if header.msg_type != self.msg_type
            || header.message_seq != self.message_seq
            || header.length != self.body.len()
        {
            return Err(TlsError::Decode(
                "dtls fragment does not match message in progress".into(),
            ));
        }
        let start = header.fragment_offset;
        let end = start + header.fragment_length;
        self.body[start..end].copy_from_slice(fragment);
        for flag in &mut self.received[start..end] {
            *flag = true;
        }
        if self.received.iter().all(|&r| r) {
            Ok(Some(wrap_dtls_handshake(
                self.msg_type,
                self.message_seq,
                &self.body,
            )))
        } else {
            Ok(None)
        }
    }

    pub fn message_seq(&self) -> u16 {
        self.message_seq
    }
}

// ---------------------------------------------------------------------------
// HelloVerifyRequest
// ---------------------------------------------------------------------------

pub fn encode_hello_verify_request(hvr: &HelloVerifyRequest, message_seq: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(3 + hvr.cookie.len());
    body.extend_from_slice(&hvr.server_version.to_be_bytes());
    body.push(hvr.cookie.len() as u8);
    body.extend_from_slice(&hvr.cookie);
    wrap_dtls_handshake(HandshakeType::HelloVerifyRequest, message_seq, &body)
}

pub fn decode_hello_verify_request(data: &[u8]) -> Result<HelloVerifyRequest, TlsError> {
    let err = |msg: &str| TlsError::Decode(format!("HelloVerifyRequest: {msg}"));
    if data.len() < 3 {
        return Err(err("too short"));
    }
    let server_version = u16::from_be_bytes([data[0], data[1]]);
    let cookie_len = data[2] as usize;
    if data.len() != 3 + cookie_len {
        return Err(err("cookie length mismatch"));
    }
    Ok(HelloVerifyRequest {
        server_version,
        cookie: data[3..].to_vec(),
    })
}
