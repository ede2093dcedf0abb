//! Collaborator contracts: crypto provider, certificate provider, and
//! the record-layer command surface.
//!
//! The handshake engine performs no primitive cryptography itself.
//! Every hash, MAC, KDF, AEAD, key-exchange, signature, and random byte
//! goes through [`CryptoProvider`]; certificate parsing and chain
//! verification go through [`CertProvider`]. Errors cross these
//! boundaries only as enumerated codes.

use std::sync::Arc;

use latch_types::{CertError, CryptoError, HashAlg, KeyType, KeyUsage};
use subtle::ConstantTimeEq;

use crate::CipherSuite;

/// A streaming digest instance.
pub trait Digest: Send {
    fn update(&mut self, data: &[u8]) -> Result<(), CryptoError>;
    /// Finalize into `out`; `out.len()` must equal `output_size()`.
    fn finish(&mut self, out: &mut [u8]) -> Result<(), CryptoError>;
    /// Clone the running state (needed for transcript forks).
    fn clone_state(&self) -> Box<dyn Digest>;
    fn output_size(&self) -> usize;
}

/// An ephemeral key-exchange keypair ((EC)DHE or FFDHE).
pub trait KxKeyPair: Send {
    /// Public value in wire encoding for the group.
    fn public_bytes(&self) -> &[u8];
    /// Derive the shared secret from the peer's public value.
    fn derive(&self, peer_public: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// The primitive-cryptography contract. Enumerated operations only;
/// no exceptions cross this interface.
pub trait CryptoProvider: Send + Sync {
    // Hashing
    fn hash_new(&self, alg: HashAlg) -> Result<Box<dyn Digest>, CryptoError>;

    // MAC / KDF
    fn hmac(&self, alg: HashAlg, key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn hkdf_extract(&self, alg: HashAlg, salt: &[u8], ikm: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn hkdf_expand(
        &self,
        alg: HashAlg,
        prk: &[u8],
        info: &[u8],
        len: usize,
    ) -> Result<Vec<u8>, CryptoError>;

    // AEAD (used by the ticket codec; record protection lives outside
    // the core)
    fn aead_seal(
        &self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
    fn aead_open(
        &self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    // Key exchange
    fn kx_generate(&self, group: u16) -> Result<Box<dyn KxKeyPair>, CryptoError>;
    /// Public-key encryption of key material (RSA key transport, TLCP
    /// SM2 envelope).
    fn kx_encapsulate(&self, public_key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;
    /// Private-key decryption of key material.
    fn kx_decapsulate(
        &self,
        key_type: KeyType,
        private_key: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    // Signatures
    fn sign(
        &self,
        key_type: KeyType,
        private_key: &[u8],
        scheme: u16,
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
    fn verify(
        &self,
        public_key: &[u8],
        scheme: u16,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError>;

    // Randomness; must be internally thread-safe.
    fn drbg_random(&self, out: &mut [u8]) -> Result<(), CryptoError>;

    /// Constant-time equality for secret-dependent comparisons.
    fn ct_eq(&self, a: &[u8], b: &[u8]) -> bool {
        a.len() == b.len() && bool::from(a.ct_eq(b))
    }
}

/// A parsed certificate handle. The core never allocates or inspects
/// certificate bytes beyond this interface; chains are shared by
/// reference counting.
pub trait Certificate: Send + Sync {
    fn der(&self) -> &[u8];
    fn public_key(&self) -> Vec<u8>;
    fn key_type(&self) -> KeyType;
    fn key_usage_allows(&self, usage: KeyUsage) -> bool;
}

/// Shared certificate reference.
pub type CertHandle = Arc<dyn Certificate>;

/// The certificate-provider contract.
pub trait CertProvider: Send + Sync {
    fn parse(&self, der: &[u8]) -> Result<CertHandle, CertError>;
    fn verify_chain(
        &self,
        chain: &[CertHandle],
        hostname: Option<&str>,
        usage: KeyUsage,
        now: u64,
    ) -> Result<(), CertError>;
}

/// Direction of a traffic-key installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDirection {
    Read,
    Write,
}

/// Commands the state machine issues to the record layer.
///
/// The coordinator returns these alongside outgoing handshake bytes;
/// the embedding record layer applies them in order. Key installation
/// is expressed as (epoch, suite, traffic secret): the record layer
/// derives its own key/IV schedule from the secret.
#[derive(Debug, Clone)]
pub enum RecordCommand {
    SetKey {
        direction: KeyDirection,
        epoch: u16,
        suite: CipherSuite,
        secret: Vec<u8>,
    },
    /// Emit a change_cipher_spec record (real in ≤1.2, compatibility
    /// in 1.3).
    WriteCcs,
    /// Tolerate exactly one incoming plaintext CCS from now on.
    EnableCcsReception,
    /// Stop tolerating plaintext CCS (after HRR handling completes).
    DisableCcsReception,
    /// Flush buffered records to the transport.
    Flush,
    /// Close the write side after the final alert flushes.
    Close,
}
