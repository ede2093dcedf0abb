//! Cryptographic coordination for the handshake.
//!
//! Suite parameter tables plus the transcript hash, the TLS 1.3 key
//! schedule, and the TLS 1.2 PRF. Primitives come from the provider.

pub mod key_schedule;
pub mod prf;
pub mod transcript;

use latch_types::{HashAlg, TlsError};

use crate::CipherSuite;

/// TLS named group identifiers (for key exchange).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NamedGroup(pub u16);

impl NamedGroup {
    // Elliptic curves
    pub const SECP256R1: Self = Self(0x0017);
    pub const SECP384R1: Self = Self(0x0018);
    pub const SECP521R1: Self = Self(0x0019);
    pub const X25519: Self = Self(0x001D);
    // Finite field DH (RFC 7919)
    pub const FFDHE2048: Self = Self(0x0100);
    pub const FFDHE3072: Self = Self(0x0101);
    // TLCP SM2 curve
    pub const SM2P256: Self = Self(0x0029);

    /// Expected public-value length on the wire, where fixed.
    pub fn public_len(&self) -> Option<usize> {
        match *self {
            NamedGroup::X25519 => Some(32),
            NamedGroup::SECP256R1 | NamedGroup::SM2P256 => Some(65),
            NamedGroup::SECP384R1 => Some(97),
            NamedGroup::SECP521R1 => Some(133),
            NamedGroup::FFDHE2048 => Some(256),
            NamedGroup::FFDHE3072 => Some(384),
            _ => None,
        }
    }

    pub fn is_ffdhe(&self) -> bool {
        matches!(*self, NamedGroup::FFDHE2048 | NamedGroup::FFDHE3072)
    }
}

/// The RFC 7919 ffdhe2048 prime, served in DHE ServerKeyExchange
/// parameters.
pub const FFDHE2048_P: [u8; 256] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xAD, 0xF8, 0x54, 0x58, 0xA2, 0xBB, 0x4A,
    0x9A, 0xAF, 0xDC, 0x56, 0x20, 0x27, 0x3D, 0x3C, 0xF1, 0xD8, 0xB9, 0xC5, 0x83, 0xCE, 0x2D,
    0x36, 0x95, 0xA9, 0xE1, 0x36, 0x41, 0x14, 0x64, 0x33, 0xFB, 0xCC, 0x93, 0x9D, 0xCE, 0x24,
    0x9B, 0x3E, 0xF9, 0x7D, 0x2F, 0xE3, 0x63, 0x63, 0x0C, 0x75, 0xD8, 0xF6, 0x81, 0xB2, 0x02,
    0xAE, 0xC4, 0x61, 0x7A, 0xD3, 0xDF, 0x1E, 0xD5, 0xD5, 0xFD, 0x65, 0x61, 0x24, 0x33, 0xF5,
    0x1F, 0x5F, 0x06, 0x6E, 0xD0, 0x85, 0x63, 0x65, 0x55, 0x3D, 0xED, 0x1A, 0xF3, 0xB5, 0x57,
    0x13, 0x5E, 0x7F, 0x57, 0xC9, 0x35, 0x98, 0x4F, 0x0C, 0x70, 0xE0, 0xE6, 0x8B, 0x77, 0xE2,
    0xA6, 0x89, 0xDA, 0xF3, 0xEF, 0xE8, 0x72, 0x1D, 0xF1, 0x58, 0xA1, 0x36, 0xAD, 0xE7, 0x35,
    0x30, 0xAC, 0xCA, 0x4F, 0x48, 0x3A, 0x79, 0x7A, 0xBC, 0x0A, 0xB1, 0x82, 0xB3, 0x24, 0xFB,
    0x61, 0xD1, 0x08, 0xA9, 0x4B, 0xB2, 0xC8, 0xE3, 0xFB, 0xB9, 0x6A, 0xDA, 0xB7, 0x60, 0xD7,
    0xF4, 0x68, 0x1D, 0x4F, 0x42, 0xA3, 0xDE, 0x39, 0x4D, 0xF4, 0xAE, 0x56, 0xED, 0xE7, 0x63,
    0x72, 0xBB, 0x19, 0x0B, 0x07, 0xA7, 0xC8, 0xEE, 0x0A, 0x6D, 0x70, 0x9E, 0x02, 0xFC, 0xE1,
    0xCD, 0xF7, 0xE2, 0xEC, 0xC0, 0x34, 0x04, 0xCD, 0x28, 0x34, 0x2F, 0x61, 0x91, 0x72, 0xFE,
    0x9C, 0xE9, 0x85, 0x83, 0xFF, 0x8E, 0x4F, 0x12, 0x32, 0xEE, 0xF2, 0x81, 0x83, 0xC3, 0xFE,
    0x3B, 0x1B, 0x4C, 0x6F, 0xAD, 0x73, 0x3B, 0xB5, 0xFC, 0xBC, 0x2E, 0xC2, 0x20, 0x05, 0xC5,
    0x8E, 0xF1, 0x83, 0x7D, 0x16, 0x83, 0xB2, 0xC6, 0xF3, 0x4A, 0x26, 0xC1, 0xB2, 0xEF, 0xFA,
    0x88, 0x6B, 0x42, 0x38, 0x61, 0x28, 0x5C, 0x97, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF,
];

/// TLS signature scheme identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignatureScheme(pub u16);

impl SignatureScheme {
    pub const RSA_PKCS1_SHA256: Self = Self(0x0401);
    pub const RSA_PKCS1_SHA384: Self = Self(0x0501);
    pub const ECDSA_SECP256R1_SHA256: Self = Self(0x0403);
    pub const ECDSA_SECP384R1_SHA384: Self = Self(0x0503);
    pub const RSA_PSS_RSAE_SHA256: Self = Self(0x0804);
    pub const RSA_PSS_RSAE_SHA384: Self = Self(0x0805);
    pub const RSA_PSS_RSAE_SHA512: Self = Self(0x0806);
    pub const ED25519: Self = Self(0x0807);
    pub const SM2_SM3: Self = Self(0x0708);

    /// True when the scheme is usable in TLS 1.3 CertificateVerify.
    pub fn tls13_allowed(&self) -> bool {
        // PKCS#1 v1.5 is offered for 1.2 compatibility only.
        !matches!(
            *self,
            SignatureScheme::RSA_PKCS1_SHA256 | SignatureScheme::RSA_PKCS1_SHA384
        )
    }
}

/// Key exchange algorithm of a ≤1.2 / TLCP cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExchangeAlg {
    /// Ephemeral ECDH, server signs params in ServerKeyExchange.
    Ecdhe,
    /// Static RSA key transport (client encrypts the pre-master).
    Rsa,
    /// Ephemeral finite-field DH.
    Dhe,
    /// Plain PSK (RFC 4279).
    Psk,
    /// DHE + PSK (RFC 4279).
    DhePsk,
    /// RSA key transport + PSK (RFC 4279).
    RsaPsk,
    /// ECDHE + PSK (RFC 5489).
    EcdhePsk,
    /// TLCP static ECC: SM2 encryption of the pre-master under the
    /// server's encryption certificate.
    #[cfg(feature = "tlcp")]
    Ecc,
}

impl KeyExchangeAlg {
    pub fn is_psk(&self) -> bool {
        matches!(
            self,
            Self::Psk | Self::DhePsk | Self::RsaPsk | Self::EcdhePsk
        )
    }

    /// Whether the server sends a Certificate message for this suite.
    pub fn requires_certificate(&self) -> bool {
        !matches!(self, Self::Psk | Self::DhePsk | Self::EcdhePsk)
    }

    /// Whether the server sends a ServerKeyExchange message.
    pub fn sends_server_key_exchange(&self, has_identity_hint: bool) -> bool {
        match self {
            Self::Ecdhe | Self::Dhe | Self::DhePsk | Self::EcdhePsk => true,
            #[cfg(feature = "tlcp")]
            Self::Ecc => true,
            Self::Psk | Self::RsaPsk => has_identity_hint,
            Self::Rsa => false,
        }
    }
}

/// Authentication algorithm of a ≤1.2 / TLCP cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAlg {
    Rsa,
    Ecdsa,
    Psk,
    #[cfg(feature = "tlcp")]
    Sm2,
}

/// Parameters of a TLS 1.3 cipher suite.
#[derive(Debug, Clone)]
pub struct CipherSuiteParams {
    pub suite: CipherSuite,
    pub hash: HashAlg,
    pub key_len: usize,
    pub iv_len: usize,
    pub tag_len: usize,
}

impl CipherSuiteParams {
    pub fn from_suite(suite: CipherSuite) -> Result<Self, TlsError> {
        match suite {
            CipherSuite::TLS_AES_128_GCM_SHA256 => Ok(Self {
                suite,
                hash: HashAlg::Sha256,
                key_len: 16,
                iv_len: 12,
                tag_len: 16,
            }),
            CipherSuite::TLS_AES_256_GCM_SHA384 => Ok(Self {
                suite,
                hash: HashAlg::Sha384,
                key_len: 32,
                iv_len: 12,
                tag_len: 16,
            }),
            CipherSuite::TLS_CHACHA20_POLY1305_SHA256 => Ok(Self {
                suite,
                hash: HashAlg::Sha256,
                key_len: 32,
                iv_len: 12,
                tag_len: 16,
            }),
            _ => Err(TlsError::HandshakeFailure(format!(
                "not a TLS 1.3 suite: {:#06x}",
                suite.0
            ))),
        }
    }

    pub fn hash_len(&self) -> usize {
        self.hash.output_size()
    }
}

/// Parameters of a TLS 1.2 / TLCP cipher suite.
#[derive(Debug, Clone)]
pub struct Tls12CipherSuiteParams {
    pub suite: CipherSuite,
    pub kx_alg: KeyExchangeAlg,
    pub auth_alg: AuthAlg,
    /// PRF hash.
    pub hash: HashAlg,
    pub key_len: usize,
    /// Fixed IV length from the key block (4 for GCM, 16 for CBC).
    pub fixed_iv_len: usize,
    /// MAC key length (0 for AEAD).
    pub mac_key_len: usize,
    /// true = CBC suite (EtM-eligible), false = AEAD.
    pub is_cbc: bool,
}

impl Tls12CipherSuiteParams {
    pub fn from_suite(suite: CipherSuite) -> Result<Self, TlsError> {
        let p = |kx_alg, auth_alg, hash, key_len, fixed_iv_len, mac_key_len, is_cbc| {
            Ok(Self {
                suite,
                kx_alg,
                auth_alg,
                hash,
                key_len,
                fixed_iv_len,
                mac_key_len,
                is_cbc,
            })
        };
        use AuthAlg as A;
        use HashAlg as H;
        use KeyExchangeAlg as K;
        match suite {
            CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256 => {
                p(K::Ecdhe, A::Rsa, H::Sha256, 16, 4, 0, false)
            }
            CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384 => {
                p(K::Ecdhe, A::Rsa, H::Sha384, 32, 4, 0, false)
            }
            CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256 => {
                p(K::Ecdhe, A::Ecdsa, H::Sha256, 16, 4, 0, false)
            }
            CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384 => {
                p(K::Ecdhe, A::Ecdsa, H::Sha384, 32, 4, 0, false)
            }
            CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256 => {
                p(K::Ecdhe, A::Rsa, H::Sha256, 16, 16, 32, true)
            }
            CipherSuite::TLS_DHE_RSA_WITH_AES_128_GCM_SHA256 => {
                p(K::Dhe, A::Rsa, H::Sha256, 16, 4, 0, false)
            }
            CipherSuite::TLS_DHE_RSA_WITH_AES_256_GCM_SHA384 => {
                p(K::Dhe, A::Rsa, H::Sha384, 32, 4, 0, false)
            }
            CipherSuite::TLS_RSA_WITH_AES_128_GCM_SHA256 => {
                p(K::Rsa, A::Rsa, H::Sha256, 16, 4, 0, false)
            }
            CipherSuite::TLS_RSA_WITH_AES_256_GCM_SHA384 => {
                p(K::Rsa, A::Rsa, H::Sha384, 32, 4, 0, false)
            }
            CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA256 => {
                p(K::Rsa, A::Rsa, H::Sha256, 16, 16, 32, true)
            }
            CipherSuite::TLS_PSK_WITH_AES_128_GCM_SHA256 => {
                p(K::Psk, A::Psk, H::Sha256, 16, 4, 0, false)
            }
            CipherSuite::TLS_PSK_WITH_AES_256_GCM_SHA384 => {
                p(K::Psk, A::Psk, H::Sha384, 32, 4, 0, false)
            }
            CipherSuite::TLS_DHE_PSK_WITH_AES_128_GCM_SHA256 => {
                p(K::DhePsk, A::Psk, H::Sha256, 16, 4, 0, false)
            }
            CipherSuite::TLS_RSA_PSK_WITH_AES_128_GCM_SHA256 => {
                p(K::RsaPsk, A::Rsa, H::Sha256, 16, 4, 0, false)
            }
            CipherSuite::TLS_ECDHE_PSK_WITH_AES_128_CBC_SHA256 => {
                p(K::EcdhePsk, A::Psk, H::Sha256, 16, 16, 32, true)
            }
            #[cfg(feature = "tlcp")]
            CipherSuite::TLCP_ECDHE_SM4_CBC_SM3 => {
                p(K::Ecdhe, A::Sm2, H::Sm3, 16, 16, 32, true)
            }
            #[cfg(feature = "tlcp")]
            CipherSuite::TLCP_ECC_SM4_CBC_SM3 => p(K::Ecc, A::Sm2, H::Sm3, 16, 16, 32, true),
            _ => Err(TlsError::HandshakeFailure(format!(
                "unknown cipher suite: {:#06x}",
                suite.0
            ))),
        }
    }

    pub fn hash_len(&self) -> usize {
        self.hash.output_size()
    }

    /// Key-block bytes consumed by one direction.
    pub fn key_material_len(&self) -> usize {
        self.mac_key_len + self.key_len + self.fixed_iv_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls13_suite_params() {
        let p = CipherSuiteParams::from_suite(CipherSuite::TLS_AES_128_GCM_SHA256).unwrap();
        assert_eq!(p.hash, HashAlg::Sha256);
        assert_eq!(p.key_len, 16);
        assert_eq!(p.hash_len(), 32);

        let p = CipherSuiteParams::from_suite(CipherSuite::TLS_AES_256_GCM_SHA384).unwrap();
        assert_eq!(p.hash, HashAlg::Sha384);
        assert_eq!(p.key_len, 32);

        assert!(
            CipherSuiteParams::from_suite(CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256)
                .is_err()
        );
    }

    #[test]
    fn test_tls12_suite_params_ecdhe() {
        let p =
            Tls12CipherSuiteParams::from_suite(CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256)
                .unwrap();
        assert_eq!(p.kx_alg, KeyExchangeAlg::Ecdhe);
        assert_eq!(p.auth_alg, AuthAlg::Rsa);
        assert!(!p.is_cbc);
        assert_eq!(p.key_material_len(), 16 + 4);
    }

    #[test]
    fn test_tls12_suite_params_cbc() {
        let p =
            Tls12CipherSuiteParams::from_suite(CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA256)
                .unwrap();
        assert!(p.is_cbc);
        assert_eq!(p.mac_key_len, 32);
        assert_eq!(p.key_material_len(), 32 + 16 + 16);
    }

    #[test]
    fn test_psk_family_flags() {
        for suite in [
            CipherSuite::TLS_PSK_WITH_AES_128_GCM_SHA256,
            CipherSuite::TLS_DHE_PSK_WITH_AES_128_GCM_SHA256,
            CipherSuite::TLS_ECDHE_PSK_WITH_AES_128_CBC_SHA256,
        ] {
            let p = Tls12CipherSuiteParams::from_suite(suite).unwrap();
            assert!(p.kx_alg.is_psk());
            assert!(!p.kx_alg.requires_certificate());
        }
        let rsa_psk =
            Tls12CipherSuiteParams::from_suite(CipherSuite::TLS_RSA_PSK_WITH_AES_128_GCM_SHA256)
                .unwrap();
        assert!(rsa_psk.kx_alg.is_psk());
        assert!(rsa_psk.kx_alg.requires_certificate());
    }

    #[test]
    fn test_server_key_exchange_presence() {
        assert!(KeyExchangeAlg::Ecdhe.sends_server_key_exchange(false));
        assert!(KeyExchangeAlg::DhePsk.sends_server_key_exchange(false));
        assert!(!KeyExchangeAlg::Rsa.sends_server_key_exchange(false));
        // Plain PSK sends SKE only to carry an identity hint.
        assert!(!KeyExchangeAlg::Psk.sends_server_key_exchange(false));
        assert!(KeyExchangeAlg::Psk.sends_server_key_exchange(true));
    }

    #[cfg(feature = "tlcp")]
    #[test]
    fn test_tlcp_suite_params() {
        let p = Tls12CipherSuiteParams::from_suite(CipherSuite::TLCP_ECC_SM4_CBC_SM3).unwrap();
        assert_eq!(p.kx_alg, KeyExchangeAlg::Ecc);
        assert_eq!(p.hash, HashAlg::Sm3);
        assert!(p.is_cbc);
        assert!(p.kx_alg.sends_server_key_exchange(false));
    }

    #[test]
    fn test_group_public_lens() {
        assert_eq!(NamedGroup::X25519.public_len(), Some(32));
        assert_eq!(NamedGroup::SECP256R1.public_len(), Some(65));
        assert_eq!(NamedGroup::FFDHE2048.public_len(), Some(256));
        assert!(NamedGroup::FFDHE2048.is_ffdhe());
        assert!(!NamedGroup::X25519.is_ffdhe());
    }

    #[test]
    fn test_tls13_signature_scheme_filter() {
        assert!(!SignatureScheme::RSA_PKCS1_SHA256.tls13_allowed());
        assert!(SignatureScheme::RSA_PSS_RSAE_SHA256.tls13_allowed());
        assert!(SignatureScheme::ECDSA_SECP256R1_SHA256.tls13_allowed());
        assert!(SignatureScheme::ED25519.tls13_allowed());
    }
}
