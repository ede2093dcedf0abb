//! Per-mode key-exchange material management.
//!
//! Ephemeral (EC)DHE keypairs wrap the provider's `kx_generate`; RSA
//! key transport, TLCP SM2 envelopes, and the RFC 4279 PSK pre-master
//! compositions are assembled here. All randomness comes from the
//! provider DRBG and every secret buffer zeroizes on drop.

use latch_types::{KeyType, TlsError};
use zeroize::Zeroize;

use crate::crypt::NamedGroup;
use crate::provider::{CryptoProvider, KxKeyPair};
use crate::TlsVersion;

/// A pre-master secret that zeroizes on drop.
pub struct PreMaster(pub Vec<u8>);

impl Drop for PreMaster {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for PreMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PreMaster").field(&"<redacted>").finish()
    }
}

/// Ephemeral key-exchange state for one handshake.
pub struct KeyExchange {
    group: NamedGroup,
    keypair: Box<dyn KxKeyPair>,
}

impl KeyExchange {
    /// Generate a fresh ephemeral keypair on the given group.
    pub fn generate(provider: &dyn CryptoProvider, group: NamedGroup) -> Result<Self, TlsError> {
        let keypair = provider.kx_generate(group.0)?;
        Ok(Self { group, keypair })
    }

    pub fn group(&self) -> NamedGroup {
        self.group
    }

    pub fn public_bytes(&self) -> &[u8] {
        self.keypair.public_bytes()
    }

    /// Derive the shared secret from the peer's public value.
    pub fn derive(&self, peer_public: &[u8]) -> Result<PreMaster, TlsError> {
        if let Some(expected) = self.group.public_len() {
            if peer_public.len() != expected {
                return Err(TlsError::IllegalParameter(
                    "peer public value length".into(),
                ));
            }
        }
        Ok(PreMaster(self.keypair.derive(peer_public)?))
    }
}

// ---------------------------------------------------------------------------
// RSA key transport (TLS ≤1.2)
// ---------------------------------------------------------------------------

/// Client side: build the 48-byte pre-master (client_version || 46
/// random bytes) and encrypt it under the server's certificate key.
pub fn rsa_client_pre_master(
    provider: &dyn CryptoProvider,
    offered_version: TlsVersion,
    server_public_key: &[u8],
) -> Result<(PreMaster, Vec<u8>), TlsError> {
    let mut pre_master = vec![0u8; 48];
    pre_master[..2].copy_from_slice(&offered_version.wire().to_be_bytes());
    provider.drbg_random(&mut pre_master[2..])?;
    let encrypted = provider.kx_encapsulate(server_public_key, &pre_master)?;
    Ok((PreMaster(pre_master), encrypted))
}

/// Server side: decrypt the pre-master and validate its embedded
/// version. A malformed result is replaced by random bytes so padding
/// failures are indistinguishable from version failures downstream.
pub fn rsa_server_pre_master(
    provider: &dyn CryptoProvider,
    key_type: KeyType,
    private_key: &[u8],
    encrypted: &[u8],
    offered_version: TlsVersion,
) -> Result<PreMaster, TlsError> {
    let mut fallback = vec![0u8; 48];
    provider.drbg_random(&mut fallback)?;
    let decrypted = provider
        .kx_decapsulate(key_type, private_key, encrypted)
        .unwrap_or_default();

    let version_ok = decrypted.len() == 48
        && provider.ct_eq(&decrypted[..2], &offered_version.wire().to_be_bytes());
    if version_ok {
        fallback.zeroize();
        Ok(PreMaster(decrypted))
    } else {
        Ok(PreMaster(fallback))
    }
}

// ---------------------------------------------------------------------------
// TLCP ECC key transport
// ---------------------------------------------------------------------------

/// Client side: SM2-encrypt the pre-master under the server's
/// encryption certificate (double-certificate profile).
#[cfg(feature = "tlcp")]
pub fn tlcp_client_pre_master(
    provider: &dyn CryptoProvider,
    enc_cert_public_key: &[u8],
) -> Result<(PreMaster, Vec<u8>), TlsError> {
    let mut pre_master = vec![0u8; 48];
    pre_master[..2].copy_from_slice(&TlsVersion::Tlcp11.wire().to_be_bytes());
    provider.drbg_random(&mut pre_master[2..])?;
    let encrypted = provider.kx_encapsulate(enc_cert_public_key, &pre_master)?;
    Ok((PreMaster(pre_master), encrypted))
}

/// Server side: decrypt the SM2 envelope with the encryption key.
#[cfg(feature = "tlcp")]
pub fn tlcp_server_pre_master(
    provider: &dyn CryptoProvider,
    enc_private_key: &[u8],
    encrypted: &[u8],
) -> Result<PreMaster, TlsError> {
    let decrypted = provider.kx_decapsulate(KeyType::Sm2, enc_private_key, encrypted)?;
    if decrypted.len() != 48 {
        return Err(TlsError::DecryptError("sm2 pre-master length".into()));
    }
    Ok(PreMaster(decrypted))
}

// ---------------------------------------------------------------------------
// PSK pre-master composition (RFC 4279 §2 / RFC 5489)
// ---------------------------------------------------------------------------

/// `other_secret<2^16> || psk<2^16>`.
///
/// Plain PSK uses `psk.len()` zero bytes as `other_secret`; the DHE,
/// ECDHE, and RSA variants splice in their respective shared secret.
pub fn psk_pre_master(other_secret: Option<&[u8]>, psk: &[u8]) -> PreMaster {
    let zeros;
    let other = match other_secret {
        Some(o) => o,
        None => {
            zeros = vec![0u8; psk.len()];
            &zeros
        }
    };
    let mut out = Vec::with_capacity(4 + other.len() + psk.len());
    out.extend_from_slice(&(other.len() as u16).to_be_bytes());
    out.extend_from_slice(other);
    out.extend_from_slice(&(psk.len() as u16).to_be_bytes());
    out.extend_from_slice(psk);
    PreMaster(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mock_cert_der, MockProvider};

    #[test]
    fn test_ecdhe_agreement() {
        let p = MockProvider::new();
        let a = KeyExchange::generate(&p, NamedGroup::X25519).unwrap();
        let b = KeyExchange::generate(&p, NamedGroup::X25519).unwrap();
        assert_eq!(a.group(), NamedGroup::X25519);
        assert_eq!(a.public_bytes().len(), 32);

        let sa = a.derive(b.public_bytes()).unwrap();
        let sb = b.derive(a.public_bytes()).unwrap();
        assert_eq!(sa.0, sb.0);
    }

    #[test]
    fn test_ecdhe_rejects_bad_public_len() {
        let p = MockProvider::new();
        let kx = KeyExchange::generate(&p, NamedGroup::X25519).unwrap();
        assert!(matches!(
            kx.derive(&[0; 16]).unwrap_err(),
            TlsError::IllegalParameter(_)
        ));
    }

    #[test]
    fn test_rsa_key_transport_roundtrip() {
        let p = MockProvider::new();
        let key = mock_cert_der(KeyType::Rsa, 3);
        let (pm, encrypted) =
            rsa_client_pre_master(&p, TlsVersion::Tls12, &key).unwrap();
        assert_eq!(pm.0.len(), 48);
        assert_eq!(&pm.0[..2], &TlsVersion::Tls12.wire().to_be_bytes());

        let server_pm =
            rsa_server_pre_master(&p, KeyType::Rsa, &key, &encrypted, TlsVersion::Tls12).unwrap();
        assert_eq!(server_pm.0, pm.0);
    }

    #[test]
    fn test_rsa_bad_version_yields_random_pre_master() {
        let p = MockProvider::new();
        let key = mock_cert_der(KeyType::Rsa, 3);
        let (pm, encrypted) =
            rsa_client_pre_master(&p, TlsVersion::Tls12, &key).unwrap();
        // Server expects a different embedded version → silently
        // substitutes randomness, never errors.
        let server_pm =
            rsa_server_pre_master(&p, KeyType::Rsa, &key, &encrypted, TlsVersion::Dtls12).unwrap();
        assert_eq!(server_pm.0.len(), 48);
        assert_ne!(server_pm.0, pm.0);
    }

    #[test]
    fn test_rsa_garbage_ciphertext_yields_random_pre_master() {
        let p = MockProvider::new();
        let key = mock_cert_der(KeyType::Rsa, 3);
        let server_pm =
            rsa_server_pre_master(&p, KeyType::Rsa, &key, &[1, 2, 3], TlsVersion::Tls12).unwrap();
        assert_eq!(server_pm.0.len(), 48);
    }

    #[test]
    fn test_psk_pre_master_plain() {
        let pm = psk_pre_master(None, &[0xAA; 16]);
        // 2 + 16 zeros + 2 + 16 psk
        assert_eq!(pm.0.len(), 36);
        assert_eq!(&pm.0[..2], &16u16.to_be_bytes());
        assert!(pm.0[2..18].iter().all(|&b| b == 0));
        assert_eq!(&pm.0[18..20], &16u16.to_be_bytes());
        assert_eq!(&pm.0[20..], &[0xAA; 16]);
    }

    #[test]
    fn test_psk_pre_master_with_other_secret() {
        let shared = vec![0x11; 32];
        let pm = psk_pre_master(Some(&shared), &[0xBB; 8]);
        assert_eq!(&pm.0[..2], &32u16.to_be_bytes());
        assert_eq!(&pm.0[2..34], &shared[..]);
        assert_eq!(&pm.0[34..36], &8u16.to_be_bytes());
    }

    #[cfg(feature = "tlcp")]
    #[test]
    fn test_tlcp_envelope_roundtrip() {
        let p = MockProvider::new();
        let enc_key = mock_cert_der(KeyType::Sm2, 5);
        let (pm, encrypted) = tlcp_client_pre_master(&p, &enc_key).unwrap();
        assert_eq!(&pm.0[..2], &TlsVersion::Tlcp11.wire().to_be_bytes());
        let server_pm = tlcp_server_pre_master(&p, &enc_key, &encrypted).unwrap();
        assert_eq!(server_pm.0, pm.0);
    }
}
