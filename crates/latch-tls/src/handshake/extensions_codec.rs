//! Per-extension wire encoding/decoding.
//!
//! One `build_*`/`parse_*` pair per extension and direction. Wire shape
//! only; acceptance policy lives in `negotiate`.

use latch_types::TlsError;

use crate::crypt::{NamedGroup, SignatureScheme};
use crate::extensions::{Extension, ExtensionType};

/// psk_key_exchange_modes values (RFC 8446 §4.2.9).
pub const PSK_KE: u8 = 0;
pub const PSK_DHE_KE: u8 = 1;

/// One offered PSK identity.
#[derive(Debug, Clone)]
pub struct PskIdentity {
    pub identity: Vec<u8>,
    pub obfuscated_ticket_age: u32,
}

// ---------------------------------------------------------------------------
// supported_versions
// ---------------------------------------------------------------------------

/// ClientHello form: version list with 1-byte length prefix.
pub fn build_supported_versions_ch(versions: &[u16]) -> Extension {
    let mut data = Vec::with_capacity(1 + versions.len() * 2);
    data.push((versions.len() * 2) as u8);
    for v in versions {
        data.extend_from_slice(&v.to_be_bytes());
    }
    Extension::new(ExtensionType::SUPPORTED_VERSIONS, data)
}

pub fn parse_supported_versions_ch(data: &[u8]) -> Result<Vec<u16>, TlsError> {
    let err = |msg: &str| TlsError::Decode(format!("supported_versions: {msg}"));
    if data.is_empty() {
        return Err(err("empty"));
    }
    let list_len = data[0] as usize;
    if list_len == 0 || list_len % 2 != 0 || data.len() != 1 + list_len {
        return Err(err("invalid list length"));
    }
    Ok(data[1..]
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}

/// ServerHello form: exactly one selected version, no list prefix.
pub fn build_supported_versions_sh(version: u16) -> Extension {
    Extension::new(
        ExtensionType::SUPPORTED_VERSIONS,
        version.to_be_bytes().to_vec(),
    )
}

pub fn parse_supported_versions_sh(data: &[u8]) -> Result<u16, TlsError> {
    if data.len() != 2 {
        return Err(TlsError::Decode(
            "supported_versions: server form must be 2 bytes".into(),
        ));
    }
    Ok(u16::from_be_bytes([data[0], data[1]]))
}

// ---------------------------------------------------------------------------
// supported_groups / signature_algorithms
// ---------------------------------------------------------------------------

pub fn build_supported_groups(groups: &[NamedGroup]) -> Extension {
    let mut data = Vec::with_capacity(2 + groups.len() * 2);
    data.extend_from_slice(&((groups.len() * 2) as u16).to_be_bytes());
    for g in groups {
        data.extend_from_slice(&g.0.to_be_bytes());
    }
    Extension::new(ExtensionType::SUPPORTED_GROUPS, data)
}

pub fn parse_supported_groups(data: &[u8]) -> Result<Vec<NamedGroup>, TlsError> {
    let list = parse_u16_list(data, "supported_groups")?;
    Ok(list.into_iter().map(NamedGroup).collect())
}

pub fn build_signature_algorithms(schemes: &[SignatureScheme]) -> Extension {
    let mut data = Vec::with_capacity(2 + schemes.len() * 2);
    data.extend_from_slice(&((schemes.len() * 2) as u16).to_be_bytes());
    for s in schemes {
        data.extend_from_slice(&s.0.to_be_bytes());
    }
    Extension::new(ExtensionType::SIGNATURE_ALGORITHMS, data)
}

pub fn parse_signature_algorithms(data: &[u8]) -> Result<Vec<SignatureScheme>, TlsError> {
    let list = parse_u16_list(data, "signature_algorithms")?;
    Ok(list.into_iter().map(SignatureScheme).collect())
}

fn parse_u16_list(data: &[u8], what: &str) -> Result<Vec<u16>, TlsError> {
    let err = |msg: &str| TlsError::Decode(format!("{what}: {msg}"));
    if data.len() < 2 {
        return Err(err("too short"));
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if list_len == 0 || list_len % 2 != 0 || data.len() != 2 + list_len {
        return Err(err("invalid list length"));
    }
    Ok(data[2..]
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}

// ---------------------------------------------------------------------------
// key_share
// ---------------------------------------------------------------------------

/// ClientHello form: list of KeyShareEntry.
pub fn build_key_share_ch(entries: &[(NamedGroup, Vec<u8>)]) -> Extension {
    let mut list = Vec::new();
    for (group, public) in entries {
        list.extend_from_slice(&group.0.to_be_bytes());
        list.extend_from_slice(&(public.len() as u16).to_be_bytes());
        list.extend_from_slice(public);
    }
    let mut data = Vec::with_capacity(2 + list.len());
    data.extend_from_slice(&(list.len() as u16).to_be_bytes());
    data.extend_from_slice(&list);
    Extension::new(ExtensionType::KEY_SHARE, data)
}

pub fn parse_key_share_ch(data: &[u8]) -> Result<Vec<(NamedGroup, Vec<u8>)>, TlsError> {
    let err = |msg: &str| TlsError::Decode(format!("key_share: {msg}"));
    if data.len() < 2 {
        return Err(err("too short"));
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() != 2 + list_len {
        return Err(err("list length mismatch"));
    }
    let mut entries = Vec::new();
    let mut pos = 2;
    while pos < data.len() {
        if data.len() - pos < 4 {
            return Err(err("truncated entry"));
        }
        let group = NamedGroup(u16::from_be_bytes([data[pos], data[pos + 1]]));
        let key_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;
        if data.len() - pos < key_len {
            return Err(err("truncated key_exchange"));
        }
        entries.push((group, data[pos..pos + key_len].to_vec()));
        pos += key_len;
    }
    Ok(entries)
}

/// ServerHello form: a single entry, no list prefix.
pub fn build_key_share_sh(group: NamedGroup, public: &[u8]) -> Extension {
    let mut data = Vec::with_capacity(4 + public.len());
    data.extend_from_slice(&group.0.to_be_bytes());
    data.extend_from_slice(&(public.len() as u16).to_be_bytes());
    data.extend_from_slice(public);
    Extension::new(ExtensionType::KEY_SHARE, data)
}

pub fn parse_key_share_sh(data: &[u8]) -> Result<(NamedGroup, Vec<u8>), TlsError> {
    let err = |msg: &str| TlsError::Decode(format!("key_share: {msg}"));
    if data.len() < 4 {
        return Err(err("too short"));
    }
    let group = NamedGroup(u16::from_be_bytes([data[0], data[1]]));
    let key_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if data.len() != 4 + key_len {
        return Err(err("key_exchange length mismatch"));
    }
    Ok((group, data[4..].to_vec()))
}

/// HelloRetryRequest form: the selected group only.
pub fn build_key_share_hrr(group: NamedGroup) -> Extension {
    Extension::new(ExtensionType::KEY_SHARE, group.0.to_be_bytes().to_vec())
}

pub fn parse_key_share_hrr(data: &[u8]) -> Result<NamedGroup, TlsError> {
    if data.len() != 2 {
        return Err(TlsError::Decode(
            "key_share: hrr form must be 2 bytes".into(),
        ));
    }
    Ok(NamedGroup(u16::from_be_bytes([data[0], data[1]])))
}

// ---------------------------------------------------------------------------
// server_name
// ---------------------------------------------------------------------------

pub fn build_server_name(hostname: &str) -> Extension {
    let name = hostname.as_bytes();
    let entry_len = 1 + 2 + name.len();
    let mut data = Vec::with_capacity(2 + entry_len);
    data.extend_from_slice(&(entry_len as u16).to_be_bytes());
    data.push(0); // host_name
    data.extend_from_slice(&(name.len() as u16).to_be_bytes());
    data.extend_from_slice(name);
    Extension::new(ExtensionType::SERVER_NAME, data)
}

pub fn parse_server_name(data: &[u8]) -> Result<String, TlsError> {
    let err = |msg: &str| TlsError::Decode(format!("server_name: {msg}"));
    if data.len() < 2 {
        return Err(err("too short"));
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() != 2 + list_len {
        return Err(err("list length mismatch"));
    }
    let mut pos = 2;
    while pos < data.len() {
        if data.len() - pos < 3 {
            return Err(err("truncated entry"));
        }
        let name_type = data[pos];
        let name_len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
        pos += 3;
        if data.len() - pos < name_len {
            return Err(err("truncated name"));
        }
        if name_type == 0 {
            let name = &data[pos..pos + name_len];
            return String::from_utf8(name.to_vec()).map_err(|_| err("non-utf8 host name"));
        }
        pos += name_len;
    }
    Err(err("no host_name entry"))
}

// ---------------------------------------------------------------------------
// ALPN
// ---------------------------------------------------------------------------

pub fn build_alpn(protocols: &[Vec<u8>]) -> Extension {
    let mut list = Vec::new();
    for proto in protocols {
        list.push(proto.len() as u8);
        list.extend_from_slice(proto);
    }
    let mut data = Vec::with_capacity(2 + list.len());
    data.extend_from_slice(&(list.len() as u16).to_be_bytes());
    data.extend_from_slice(&list);
    Extension::new(ExtensionType::APPLICATION_LAYER_PROTOCOL_NEGOTIATION, data)
}

pub fn parse_alpn(data: &[u8]) -> Result<Vec<Vec<u8>>, TlsError> {
    let err = |msg: &str| TlsError::Decode(format!("alpn: {msg}"));
    if data.len() < 2 {
        return Err(err("too short"));
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if list_len == 0 || data.len() != 2 + list_len {
        return Err(err("invalid list length"));
    }
    let mut protocols = Vec::new();
    let mut pos = 2;
    while pos < data.len() {
        let proto_len = data[pos] as usize;
        pos += 1;
        if proto_len == 0 || data.len() - pos < proto_len {
            return Err(err("invalid protocol length"));
        }
        protocols.push(data[pos..pos + proto_len].to_vec());
        pos += proto_len;
    }
    Ok(protocols)
}

/// Server response: exactly one selected protocol.
pub fn build_alpn_selected(protocol: &[u8]) -> Extension {
    build_alpn(&[protocol.to_vec()])
}

pub fn parse_alpn_selected(data: &[u8]) -> Result<Vec<u8>, TlsError> {
    let mut protocols = parse_alpn(data)?;
    if protocols.len() != 1 {
        return Err(TlsError::Decode(
            "alpn: server must select exactly one protocol".into(),
        ));
    }
    Ok(protocols.remove(0))
}

// ---------------------------------------------------------------------------
// pre_shared_key / psk_key_exchange_modes
// ---------------------------------------------------------------------------

pub fn build_psk_key_exchange_modes(modes: &[u8]) -> Extension {
    let mut data = Vec::with_capacity(1 + modes.len());
    data.push(modes.len() as u8);
    data.extend_from_slice(modes);
    Extension::new(ExtensionType::PSK_KEY_EXCHANGE_MODES, data)
}

pub fn parse_psk_key_exchange_modes(data: &[u8]) -> Result<Vec<u8>, TlsError> {
    let err = |msg: &str| TlsError::Decode(format!("psk_key_exchange_modes: {msg}"));
    if data.is_empty() {
        return Err(err("empty"));
    }
    let len = data[0] as usize;
    if len == 0 || data.len() != 1 + len {
        return Err(err("invalid list length"));
    }
    Ok(data[1..].to_vec())
}

/// ClientHello form: identities plus binders.
pub fn build_pre_shared_key_ch(identities: &[PskIdentity], binders: &[Vec<u8>]) -> Extension {
    let mut ids = Vec::new();
    for id in identities {
        ids.extend_from_slice(&(id.identity.len() as u16).to_be_bytes());
        ids.extend_from_slice(&id.identity);
        ids.extend_from_slice(&id.obfuscated_ticket_age.to_be_bytes());
    }
    let mut bnd = Vec::new();
    for binder in binders {
        bnd.push(binder.len() as u8);
        bnd.extend_from_slice(binder);
    }
    let mut data = Vec::with_capacity(4 + ids.len() + bnd.len());
    data.extend_from_slice(&(ids.len() as u16).to_be_bytes());
    data.extend_from_slice(&ids);
    data.extend_from_slice(&(bnd.len() as u16).to_be_bytes());
    data.extend_from_slice(&bnd);
    Extension::new(ExtensionType::PRE_SHARED_KEY, data)
}

pub fn parse_pre_shared_key_ch(
    data: &[u8],
) -> Result<(Vec<PskIdentity>, Vec<Vec<u8>>), TlsError> {
    let err = |msg: &str| TlsError::Decode(format!("pre_shared_key: {msg}"));
    if data.len() < 2 {
        return Err(err("too short"));
    }
    let ids_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() < 2 + ids_len + 2 {
        return Err(err("identities truncated"));
    }
    let mut identities = Vec::new();
    let mut pos = 2;
    let ids_end = 2 + ids_len;
    while pos < ids_end {
        if ids_end - pos < 2 {
            return Err(err("truncated identity length"));
        }
        let id_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
        pos += 2;
        if id_len == 0 || ids_end - pos < id_len + 4 {
            return Err(err("truncated identity"));
        }
        let identity = data[pos..pos + id_len].to_vec();
        pos += id_len;
        let obfuscated_ticket_age = u32::from_be_bytes([
            data[pos],
            data[pos + 1],
            data[pos + 2],
            data[pos + 3],
        ]);
        pos += 4;
        identities.push(PskIdentity {
            identity,
            obfuscated_ticket_age,
        });
    }
    if identities.is_empty() {
        return Err(err("no identities"));
    }

    let binders_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
    pos += 2;
    if data.len() != pos + binders_len {
        return Err(err("binders length mismatch"));
    }
    let mut binders = Vec::new();
    while pos < data.len() {
        let b_len = data[pos] as usize;
        pos += 1;
        if b_len < 32 || data.len() - pos < b_len {
            return Err(err("invalid binder length"));
        }
        binders.push(data[pos..pos + b_len].to_vec());
        pos += b_len;
    }
    if binders.len() != identities.len() {
        return Err(err("binder count does not match identities"));
    }
    Ok((identities, binders))
}

/// ServerHello form: index of the accepted identity.
pub fn build_pre_shared_key_sh(selected_identity: u16) -> Extension {
    Extension::new(
        ExtensionType::PRE_SHARED_KEY,
        selected_identity.to_be_bytes().to_vec(),
    )
}

pub fn parse_pre_shared_key_sh(data: &[u8]) -> Result<u16, TlsError> {
    if data.len() != 2 {
        return Err(TlsError::Decode(
            "pre_shared_key: server form must be 2 bytes".into(),
        ));
    }
    Ok(u16::from_be_bytes([data[0], data[1]]))
}

// ---------------------------------------------------------------------------
// cookie (TLS 1.3 HRR)
// ---------------------------------------------------------------------------

pub fn build_cookie(cookie: &[u8]) -> Extension {
    let mut data = Vec::with_capacity(2 + cookie.len());
    data.extend_from_slice(&(cookie.len() as u16).to_be_bytes());
    data.extend_from_slice(cookie);
    Extension::new(ExtensionType::COOKIE, data)
}

pub fn parse_cookie(data: &[u8]) -> Result<Vec<u8>, TlsError> {
    let err = |msg: &str| TlsError::Decode(format!("cookie: {msg}"));
    if data.len() < 2 {
        return Err(err("too short"));
    }
    let len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if len == 0 || data.len() != 2 + len {
        return Err(err("invalid length"));
    }
    Ok(data[2..].to_vec())
}

// ---------------------------------------------------------------------------
// Flag extensions (empty bodies)
// ---------------------------------------------------------------------------

pub fn build_post_handshake_auth() -> Extension {
    Extension::new(ExtensionType::POST_HANDSHAKE_AUTH, Vec::new())
}

pub fn build_extended_master_secret() -> Extension {
    Extension::new(ExtensionType::EXTENDED_MASTER_SECRET, Vec::new())
}

pub fn build_encrypt_then_mac() -> Extension {
    Extension::new(ExtensionType::ENCRYPT_THEN_MAC, Vec::new())
}

pub fn parse_empty(data: &[u8], what: &str) -> Result<(), TlsError> {
    if !data.is_empty() {
        return Err(TlsError::Decode(format!("{what}: body must be empty")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ec_point_formats
// ---------------------------------------------------------------------------

/// Only the uncompressed format (0) is ever offered or accepted.
pub fn build_ec_point_formats() -> Extension {
    Extension::new(ExtensionType::EC_POINT_FORMATS, vec![1, 0])
}

pub fn parse_ec_point_formats(data: &[u8]) -> Result<Vec<u8>, TlsError> {
    let err = |msg: &str| TlsError::Decode(format!("ec_point_formats: {msg}"));
    if data.is_empty() {
        return Err(err("empty"));
    }
    let len = data[0] as usize;
    if len == 0 || data.len() != 1 + len {
        return Err(err("invalid list length"));
    }
    Ok(data[1..].to_vec())
}

// ---------------------------------------------------------------------------
// renegotiation_info
// ---------------------------------------------------------------------------

/// Initial handshake form: empty renegotiated_connection.
pub fn build_renegotiation_info_initial() -> Extension {
    Extension::new(ExtensionType::RENEGOTIATION_INFO, vec![0])
}

/// Renegotiation form: the concatenated stored verify_data.
pub fn build_renegotiation_info(verify_data: &[u8]) -> Extension {
    let mut data = Vec::with_capacity(1 + verify_data.len());
    data.push(verify_data.len() as u8);
    data.extend_from_slice(verify_data);
    Extension::new(ExtensionType::RENEGOTIATION_INFO, data)
}

pub fn parse_renegotiation_info(data: &[u8]) -> Result<Vec<u8>, TlsError> {
    let err = |msg: &str| TlsError::Decode(format!("renegotiation_info: {msg}"));
    if data.is_empty() {
        return Err(err("empty"));
    }
    let len = data[0] as usize;
    if data.len() != 1 + len {
        return Err(err("length mismatch"));
    }
    Ok(data[1..].to_vec())
}

// ---------------------------------------------------------------------------
// session_ticket (RFC 5077)
// ---------------------------------------------------------------------------

/// ClientHello form: empty to request a ticket, or the stored ticket.
pub fn build_session_ticket(ticket: &[u8]) -> Extension {
    Extension::new(ExtensionType::SESSION_TICKET, ticket.to_vec())
}

pub fn parse_session_ticket(data: &[u8]) -> Result<Vec<u8>, TlsError> {
    Ok(data.to_vec())
}
