//! Stateless session tickets: named rotating keys and the
//! self-authenticating blob codec.
//!
//! Blob layout: `[key_name:16][iv:16][ciphertext][hmac:32]`. Integrity
//! is verified before decryption; the ciphertext is the serialised
//! session under an HKDF keystream. A ticket that authenticates but
//! carries a stale session yields `(None, needs_renew = true)` so the
//! server completes a full handshake and issues a fresh ticket.

use std::sync::RwLock;

use latch_types::{HashAlg, TlsError};
use zeroize::Zeroize;

use super::Session;
use crate::provider::CryptoProvider;
use crate::{CipherSuite, TlsVersion};

pub const KEY_NAME_LEN: usize = 16;
pub const TICKET_IV_LEN: usize = 16;
pub const TICKET_MAC_LEN: usize = 32;

/// Decrypt-only predecessors retained after a rotation.
const MAX_DECRYPT_KEYS: usize = 4;

/// One named ticket-protection key.
pub struct TicketKey {
    pub name: [u8; KEY_NAME_LEN],
    enc_key: Vec<u8>,
    mac_key: Vec<u8>,
}

impl Drop for TicketKey {
    fn drop(&mut self) {
        self.enc_key.zeroize();
        self.mac_key.zeroize();
    }
}

impl TicketKey {
    pub fn new(name: [u8; KEY_NAME_LEN], enc_key: Vec<u8>, mac_key: Vec<u8>) -> Self {
        Self {
            name,
            enc_key,
            mac_key,
        }
    }

    /// Generate a fresh random key from the provider DRBG.
    pub fn generate(provider: &dyn CryptoProvider) -> Result<Self, TlsError> {
        let mut name = [0u8; KEY_NAME_LEN];
        let mut enc_key = vec![0u8; 32];
        let mut mac_key = vec![0u8; 32];
        provider.drbg_random(&mut name)?;
        provider.drbg_random(&mut enc_key)?;
        provider.drbg_random(&mut mac_key)?;
        Ok(Self {
            name,
            enc_key,
            mac_key,
        })
    }
}

struct RingInner {
    /// Key used for new tickets; None until provisioned.
    encrypt: Option<TicketKey>,
    /// Still-accepted older keys, newest first.
    decrypt: Vec<TicketKey>,
}

/// The rotating ticket key set, swapped atomically under a lock.
pub struct TicketKeyRing {
    inner: RwLock<RingInner>,
}

impl TicketKeyRing {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RingInner {
                encrypt: None,
                decrypt: Vec::new(),
            }),
        }
    }

    /// Install a new encryption key; the previous one remains usable
    /// for decryption until `MAX_DECRYPT_KEYS` further rotations.
    pub fn rotate(&self, new_key: TicketKey) {
        let mut inner = self.inner.write().expect("ticket key ring poisoned");
        if let Some(old) = inner.encrypt.take() {
            inner.decrypt.insert(0, old);
            inner.decrypt.truncate(MAX_DECRYPT_KEYS);
        }
        inner.encrypt = Some(new_key);
    }

    pub fn has_key(&self) -> bool {
        self.inner
            .read()
            .expect("ticket key ring poisoned")
            .encrypt
            .is_some()
    }

    /// Encrypt a session into a ticket blob under the current key.
    pub fn encrypt_ticket(
        &self,
        provider: &dyn CryptoProvider,
        session: &Session,
    ) -> Result<Vec<u8>, TlsError> {
        let inner = self.inner.read().expect("ticket key ring poisoned");
        let key = inner
            .encrypt
            .as_ref()
            .ok_or_else(|| TlsError::Internal("no ticket encryption key installed".into()))?;

        let mut plaintext = serialize_session(session);
        let mut iv = [0u8; TICKET_IV_LEN];
        provider.drbg_random(&mut iv)?;

        let keystream = provider.hkdf_expand(HashAlg::Sha256, &key.enc_key, &iv, plaintext.len())?;
        let ciphertext: Vec<u8> = plaintext
            .iter()
            .zip(keystream.iter())
            .map(|(p, k)| p ^ k)
            .collect();
        plaintext.zeroize();

        let mut blob = Vec::with_capacity(
            KEY_NAME_LEN + TICKET_IV_LEN + ciphertext.len() + TICKET_MAC_LEN,
        );
        blob.extend_from_slice(&key.name);
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ciphertext);
        let mac = provider.hmac(HashAlg::Sha256, &key.mac_key, &blob)?;
        blob.extend_from_slice(&mac[..TICKET_MAC_LEN]);
        Ok(blob)
    }

    /// Decrypt and validate a ticket blob.
    ///
    /// Returns `(session, needs_renew)`. Unknown key name, failed MAC,
    /// or a stale inner session all yield `(None, true)`: the handshake
    /// proceeds in full and a fresh ticket is issued.
    pub fn decrypt_ticket(
        &self,
        provider: &dyn CryptoProvider,
        blob: &[u8],
        now: u64,
    ) -> Result<(Option<Session>, bool), TlsError> {
        if blob.len() < KEY_NAME_LEN + TICKET_IV_LEN + TICKET_MAC_LEN {
            return Ok((None, true));
        }
        let (name, rest) = blob.split_at(KEY_NAME_LEN);
        let ct_end = rest.len() - TICKET_MAC_LEN;
        let iv = &rest[..TICKET_IV_LEN];
        let ciphertext = &rest[TICKET_IV_LEN..ct_end];
        let mac = &rest[ct_end..];

        let inner = self.inner.read().expect("ticket key ring poisoned");
        let key = inner
            .encrypt
            .iter()
            .chain(inner.decrypt.iter())
            .find(|k| k.name == name);
        let key = match key {
            Some(k) => k,
            None => return Ok((None, true)),
        };
        // Ticket under a retired encryption key still resumes, but the
        // client should get a re-keyed replacement.
        let under_current_key = inner
            .encrypt
            .as_ref()
            .map(|k| k.name == name)
            .unwrap_or(false);

        // Integrity first.
        let expected = provider.hmac(HashAlg::Sha256, &key.mac_key, &blob[..blob.len() - TICKET_MAC_LEN])?;
        if !provider.ct_eq(&expected[..TICKET_MAC_LEN], mac) {
            return Ok((None, true));
        }

        let keystream = provider.hkdf_expand(HashAlg::Sha256, &key.enc_key, iv, ciphertext.len())?;
        let plaintext: Vec<u8> = ciphertext
            .iter()
            .zip(keystream.iter())
            .map(|(c, k)| c ^ k)
            .collect();

        let session = match deserialize_session(&plaintext) {
            Ok(s) => s,
            Err(_) => return Ok((None, true)),
        };
        if !session.is_live(now) {
            return Ok((None, true));
        }
        Ok((Some(session), !under_current_key))
    }
}

impl Default for TicketKeyRing {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Session (de)serialisation — the stable inner ticket format
// ---------------------------------------------------------------------------

fn push_opaque16(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
}

fn serialize_session(s: &Session) -> Vec<u8> {
    let mut out = Vec::with_capacity(96 + s.master_secret.len());
    out.extend_from_slice(&s.version.wire().to_be_bytes());
    out.extend_from_slice(&s.cipher_suite.0.to_be_bytes());
    push_opaque16(&mut out, &s.master_secret);
    let sni = s.server_name.as_deref().unwrap_or("");
    push_opaque16(&mut out, sni.as_bytes());
    push_opaque16(&mut out, &s.auth_id_hash);
    out.extend_from_slice(&s.created_at.to_be_bytes());
    out.extend_from_slice(&(s.lifetime as u32).to_be_bytes());
    out.extend_from_slice(&s.ticket_age_add.to_be_bytes());
    out.push(s.extended_master_secret as u8);
    out.push(s.session_id_context.len() as u8);
    out.extend_from_slice(&s.session_id_context);
    out
}

fn deserialize_session(data: &[u8]) -> Result<Session, TlsError> {
    let err = || TlsError::Decode("ticket session malformed".into());
    let mut pos = 0;
    let take = |pos: &mut usize, n: usize| -> Result<&[u8], TlsError> {
        if data.len() - *pos < n {
            return Err(err());
        }
        let out = &data[*pos..*pos + n];
        *pos += n;
        Ok(out)
    };
    let take16 = |pos: &mut usize| -> Result<&[u8], TlsError> {
        let len_raw = take(pos, 2)?;
        let len = u16::from_be_bytes([len_raw[0], len_raw[1]]) as usize;
        take(pos, len)
    };

    let version_raw = take(&mut pos, 2)?;
    let version = TlsVersion::from_wire(u16::from_be_bytes([version_raw[0], version_raw[1]]))
        .ok_or_else(err)?;
    let suite_raw = take(&mut pos, 2)?;
    let cipher_suite = CipherSuite(u16::from_be_bytes([suite_raw[0], suite_raw[1]]));
    let master_secret = take16(&mut pos)?.to_vec();
    let sni = take16(&mut pos)?;
    let server_name = if sni.is_empty() {
        None
    } else {
        Some(String::from_utf8(sni.to_vec()).map_err(|_| err())?)
    };
    let auth_id_hash = take16(&mut pos)?.to_vec();
    let created_raw = take(&mut pos, 8)?;
    let created_at = u64::from_be_bytes(created_raw.try_into().expect("fixed width"));
    let lifetime_raw = take(&mut pos, 4)?;
    let lifetime = u32::from_be_bytes(lifetime_raw.try_into().expect("fixed width")) as u64;
    let age_raw = take(&mut pos, 4)?;
    let ticket_age_add = u32::from_be_bytes(age_raw.try_into().expect("fixed width"));
    let ems = take(&mut pos, 1)?[0] != 0;
    let ctx_len = take(&mut pos, 1)?[0] as usize;
    let session_id_context = take(&mut pos, ctx_len)?.to_vec();
    if pos != data.len() {
        return Err(err());
    }

    Ok(Session {
        version,
        cipher_suite,
        master_secret,
        session_id: Vec::new(),
        ticket: None,
        session_id_context,
        extended_master_secret: ems,
        server_name,
        peer_certs: Vec::new(),
        auth_id_hash,
        lifetime,
        created_at,
        ticket_age_add,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;

    fn sample_session(created_at: u64) -> Session {
        Session {
            version: TlsVersion::Tls12,
            cipher_suite: CipherSuite::TLS_RSA_WITH_AES_128_GCM_SHA256,
            master_secret: vec![0x5A; 48],
            session_id: vec![],
            ticket: None,
            session_id_context: vec![0xC1, 0xC2],
            extended_master_secret: true,
            server_name: Some("resume.example".into()),
            peer_certs: vec![],
            auth_id_hash: vec![0xAB; 32],
            lifetime: 3600,
            created_at,
            ticket_age_add: 0x11223344,
        }
    }

    fn ring_with_key(provider: &MockProvider) -> TicketKeyRing {
        let ring = TicketKeyRing::new();
        ring.rotate(TicketKey::generate(provider).unwrap());
        ring
    }

    #[test]
    fn test_ticket_roundtrip() {
        let p = MockProvider::new();
        let ring = ring_with_key(&p);
        let session = sample_session(1000);

        let blob = ring.encrypt_ticket(&p, &session).unwrap();
        let (restored, needs_renew) = ring.decrypt_ticket(&p, &blob, 1500).unwrap();
        assert!(!needs_renew);
        let restored = restored.unwrap();
        assert_eq!(restored.version, TlsVersion::Tls12);
        assert_eq!(restored.cipher_suite, session.cipher_suite);
        assert_eq!(restored.master_secret, session.master_secret);
        assert_eq!(restored.server_name.as_deref(), Some("resume.example"));
        assert_eq!(restored.session_id_context, vec![0xC1, 0xC2]);
        assert!(restored.extended_master_secret);
        assert_eq!(restored.created_at, 1000);
        assert_eq!(restored.lifetime, 3600);
        assert_eq!(restored.ticket_age_add, 0x11223344);
    }

    #[test]
    fn test_expired_session_needs_renew() {
        let p = MockProvider::new();
        let ring = ring_with_key(&p);
        let blob = ring.encrypt_ticket(&p, &sample_session(1000)).unwrap();
        let (session, needs_renew) = ring.decrypt_ticket(&p, &blob, 1000 + 3601).unwrap();
        assert!(session.is_none());
        assert!(needs_renew);
    }

    #[test]
    fn test_tampered_mac_rejected() {
        let p = MockProvider::new();
        let ring = ring_with_key(&p);
        let mut blob = ring.encrypt_ticket(&p, &sample_session(1000)).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        let (session, needs_renew) = ring.decrypt_ticket(&p, &blob, 1500).unwrap();
        assert!(session.is_none());
        assert!(needs_renew);
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let p = MockProvider::new();
        let ring = ring_with_key(&p);
        let mut blob = ring.encrypt_ticket(&p, &sample_session(1000)).unwrap();
        blob[KEY_NAME_LEN + TICKET_IV_LEN] ^= 0x01;
        let (session, _) = ring.decrypt_ticket(&p, &blob, 1500).unwrap();
        assert!(session.is_none());
    }

    #[test]
    fn test_rotation_keeps_old_keys_decryptable() {
        let p = MockProvider::new();
        let ring = ring_with_key(&p);
        let blob = ring.encrypt_ticket(&p, &sample_session(1000)).unwrap();

        ring.rotate(TicketKey::generate(&p).unwrap());
        let (session, needs_renew) = ring.decrypt_ticket(&p, &blob, 1500).unwrap();
        // Old-key ticket still resumes but asks for a re-keyed ticket.
        assert!(session.is_some());
        assert!(needs_renew);
    }

    #[test]
    fn test_rotation_eventually_retires_keys() {
        let p = MockProvider::new();
        let ring = ring_with_key(&p);
        let blob = ring.encrypt_ticket(&p, &sample_session(1000)).unwrap();
        // Push the original key out of the decrypt window.
        for _ in 0..5 {
            ring.rotate(TicketKey::generate(&p).unwrap());
        }
        let (session, needs_renew) = ring.decrypt_ticket(&p, &blob, 1500).unwrap();
        assert!(session.is_none());
        assert!(needs_renew);
    }

    #[test]
    fn test_garbage_blob_is_not_an_error() {
        let p = MockProvider::new();
        let ring = ring_with_key(&p);
        let (session, needs_renew) = ring.decrypt_ticket(&p, &[0; 10], 1500).unwrap();
        assert!(session.is_none());
        assert!(needs_renew);

        let (session, needs_renew) = ring.decrypt_ticket(&p, &[7; 200], 1500).unwrap();
        assert!(session.is_none());
        assert!(needs_renew);
    }

    #[test]
    fn test_encrypt_without_key_is_internal_error() {
        let p = MockProvider::new();
        let ring = TicketKeyRing::new();
        assert!(!ring.has_key());
        assert!(ring.encrypt_ticket(&p, &sample_session(0)).is_err());
    }
}
