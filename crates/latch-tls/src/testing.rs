//! Deterministic mock collaborators for tests.
//!
//! The mock provider is not cryptography: digests are a keyed mixing
//! function, key exchange is XOR-commutative, and mock private keys
//! equal their public keys. That is exactly enough to drive both ends
//! of a handshake in-process and check transcript/secret agreement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use latch_types::{CertError, CryptoError, HashAlg, KeyType, KeyUsage};

use crate::provider::{CertHandle, CertProvider, Certificate, CryptoProvider, Digest, KxKeyPair};

const LANES: usize = 4;

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D049BB133111EB);
    x ^ (x >> 31)
}

/// Streaming mock digest: four mixing lanes squeezed to the requested
/// output width.
#[derive(Clone)]
pub struct MockDigest {
    lanes: [u64; LANES],
    fed: u64,
    out_len: usize,
}

impl MockDigest {
    fn new(out_len: usize) -> Self {
        Self {
            lanes: [
                0x6A09E667F3BCC908,
                0xBB67AE8584CAA73B,
                0x3C6EF372FE94F82B,
                0xA54FF53A5F1D36F1,
            ],
            fed: 0,
            out_len,
        }
    }
}

impl Digest for MockDigest {
    fn update(&mut self, data: &[u8]) -> Result<(), CryptoError> {
        for &b in data {
            let lane = (self.fed as usize) % LANES;
            self.lanes[lane] = splitmix64(self.lanes[lane] ^ (b as u64) ^ (self.fed << 8));
            self.fed = self.fed.wrapping_add(1);
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut [u8]) -> Result<(), CryptoError> {
        if out.len() != self.out_len {
            return Err(CryptoError::InvalidArg);
        }
        let mut state = self.lanes;
        state[0] ^= splitmix64(self.fed);
        for (i, byte) in out.iter_mut().enumerate() {
            let lane = i % LANES;
            state[lane] = splitmix64(state[lane].wrapping_add(i as u64));
            *byte = (state[lane] >> ((i % 8) * 8)) as u8;
        }
        Ok(())
    }

    fn clone_state(&self) -> Box<dyn Digest> {
        Box::new(self.clone())
    }

    fn output_size(&self) -> usize {
        self.out_len
    }
}

/// Deterministic mock crypto provider.
pub struct MockProvider {
    drbg_counter: AtomicU64,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            drbg_counter: AtomicU64::new(0x5EED),
        }
    }

    fn digest_once(&self, alg: HashAlg, parts: &[&[u8]]) -> Result<Vec<u8>, CryptoError> {
        let mut d = MockDigest::new(alg.output_size());
        for p in parts {
            d.update(p)?;
        }
        let mut out = vec![0u8; alg.output_size()];
        d.finish(&mut out)?;
        Ok(out)
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

struct MockKxKeyPair {
    private: Vec<u8>,
    public: Vec<u8>,
}

impl KxKeyPair for MockKxKeyPair {
    fn public_bytes(&self) -> &[u8] {
        &self.public
    }

    fn derive(&self, peer_public: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if peer_public.len() != self.private.len() {
            return Err(CryptoError::InvalidPublicKey);
        }
        // XOR is commutative, so both sides agree.
        Ok(self
            .private
            .iter()
            .zip(peer_public.iter())
            .map(|(a, b)| a ^ b)
            .collect())
    }
}

impl CryptoProvider for MockProvider {
    fn hash_new(&self, alg: HashAlg) -> Result<Box<dyn Digest>, CryptoError> {
        Ok(Box::new(MockDigest::new(alg.output_size())))
    }

    fn hmac(&self, alg: HashAlg, key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.digest_once(alg, &[key, &[0x36], data, &[0x5C], key])
    }

    fn hkdf_extract(&self, alg: HashAlg, salt: &[u8], ikm: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.hmac(alg, salt, ikm)
    }

    fn hkdf_expand(
        &self,
        alg: HashAlg,
        prk: &[u8],
        info: &[u8],
        len: usize,
    ) -> Result<Vec<u8>, CryptoError> {
        if len > 255 * alg.output_size() {
            return Err(CryptoError::KdfDkLenOverflow);
        }
        let mut out = Vec::with_capacity(len);
        let mut t: Vec<u8> = Vec::new();
        let mut counter = 1u8;
        while out.len() < len {
            let mut input = t.clone();
            input.extend_from_slice(info);
            input.push(counter);
            t = self.hmac(alg, prk, &input)?;
            out.extend_from_slice(&t);
            counter = counter.wrapping_add(1);
        }
        out.truncate(len);
        Ok(out)
    }

    fn aead_seal(
        &self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let stream = self.hkdf_expand(HashAlg::Sha256, key, nonce, plaintext.len())?;
        let mut out: Vec<u8> = plaintext
            .iter()
            .zip(stream.iter())
            .map(|(p, k)| p ^ k)
            .collect();
        let mut mac_input = nonce.to_vec();
        mac_input.extend_from_slice(aad);
        mac_input.extend_from_slice(&out);
        let tag = self.hmac(HashAlg::Sha256, key, &mac_input)?;
        out.extend_from_slice(&tag[..16]);
        Ok(out)
    }

    fn aead_open(
        &self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < 16 {
            return Err(CryptoError::AeadTagVerifyFail);
        }
        let (ct, tag) = ciphertext.split_at(ciphertext.len() - 16);
        let mut mac_input = nonce.to_vec();
        mac_input.extend_from_slice(aad);
        mac_input.extend_from_slice(ct);
        let expected = self.hmac(HashAlg::Sha256, key, &mac_input)?;
        if !self.ct_eq(&expected[..16], tag) {
            return Err(CryptoError::AeadTagVerifyFail);
        }
        let stream = self.hkdf_expand(HashAlg::Sha256, key, nonce, ct.len())?;
        Ok(ct.iter().zip(stream.iter()).map(|(c, k)| c ^ k).collect())
    }

    fn kx_generate(&self, group: u16) -> Result<Box<dyn KxKeyPair>, CryptoError> {
        let len = crate::crypt::NamedGroup(group).public_len().unwrap_or(32);
        let mut private = vec![0u8; len];
        self.drbg_random(&mut private)?;
        let public = private.clone();
        Ok(Box::new(MockKxKeyPair { private, public }))
    }

    fn kx_encapsulate(&self, public_key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        // Mock private keys equal their public keys, so a keyed stream
        // under the public key decrypts on the private side.
        let stream = self.hkdf_expand(HashAlg::Sha256, public_key, b"encap", plaintext.len())?;
        Ok(plaintext
            .iter()
            .zip(stream.iter())
            .map(|(p, k)| p ^ k)
            .collect())
    }

    fn kx_decapsulate(
        &self,
        _key_type: KeyType,
        private_key: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let stream = self.hkdf_expand(HashAlg::Sha256, private_key, b"encap", ciphertext.len())?;
        Ok(ciphertext
            .iter()
            .zip(stream.iter())
            .map(|(c, k)| c ^ k)
            .collect())
    }

    fn sign(
        &self,
        _key_type: KeyType,
        private_key: &[u8],
        scheme: u16,
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.digest_once(
            HashAlg::Sha512,
            &[private_key, &scheme.to_be_bytes(), data],
        )
    }

    fn verify(
        &self,
        public_key: &[u8],
        scheme: u16,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let expected =
            self.digest_once(HashAlg::Sha512, &[public_key, &scheme.to_be_bytes(), data])?;
        if self.ct_eq(&expected, signature) {
            Ok(())
        } else {
            Err(CryptoError::VerifyFail)
        }
    }

    fn drbg_random(&self, out: &mut [u8]) -> Result<(), CryptoError> {
        for byte in out.iter_mut() {
            let c = self.drbg_counter.fetch_add(1, Ordering::Relaxed);
            *byte = splitmix64(c) as u8;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock certificates
// ---------------------------------------------------------------------------

pub struct MockCertificate {
    der: Vec<u8>,
    key_type: KeyType,
}

impl Certificate for MockCertificate {
    fn der(&self) -> &[u8] {
        &self.der
    }

    fn public_key(&self) -> Vec<u8> {
        self.der.clone()
    }

    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn key_usage_allows(&self, _usage: KeyUsage) -> bool {
        true
    }
}

/// Mock certificate provider: the DER bytes double as the public key,
/// key type is encoded in the first byte, and any chain whose leaf
/// starts with 0xBD fails verification.
pub struct MockCertProvider;

impl CertProvider for MockCertProvider {
    fn parse(&self, der: &[u8]) -> Result<CertHandle, CertError> {
        if der.is_empty() {
            return Err(CertError::InvalidCert("empty".into()));
        }
        let key_type = match der[0] {
            0x01 => KeyType::Rsa,
            0x03 => KeyType::Sm2,
            _ => KeyType::Ecdsa,
        };
        Ok(Arc::new(MockCertificate {
            der: der.to_vec(),
            key_type,
        }))
    }

    fn verify_chain(
        &self,
        chain: &[CertHandle],
        _hostname: Option<&str>,
        _usage: KeyUsage,
        _now: u64,
    ) -> Result<(), CertError> {
        let leaf = chain
            .first()
            .ok_or_else(|| CertError::InvalidCert("empty chain".into()))?;
        if leaf.der().first() == Some(&0xBD) {
            return Err(CertError::ChainVerifyFailed("mock bad cert".into()));
        }
        Ok(())
    }
}

/// A mock cert whose DER bytes also serve as its private key.
pub fn mock_cert_der(key_type: KeyType, seed: u8) -> Vec<u8> {
    let tag = match key_type {
        KeyType::Rsa => 0x01,
        KeyType::Sm2 => 0x03,
        _ => 0x02,
    };
    let mut der = vec![tag];
    der.extend((0..63).map(|i| seed.wrapping_add(i)));
    der
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_digest_deterministic_and_stream_invariant() {
        let p = MockProvider::new();
        let mut a = p.hash_new(HashAlg::Sha256).unwrap();
        a.update(b"hello world").unwrap();
        let mut out_a = vec![0u8; 32];
        a.finish(&mut out_a).unwrap();

        let mut b = p.hash_new(HashAlg::Sha256).unwrap();
        b.update(b"hello ").unwrap();
        b.update(b"world").unwrap();
        let mut out_b = vec![0u8; 32];
        b.finish(&mut out_b).unwrap();

        assert_eq!(out_a, out_b);

        let mut c = p.hash_new(HashAlg::Sha256).unwrap();
        c.update(b"hello worle").unwrap();
        let mut out_c = vec![0u8; 32];
        c.finish(&mut out_c).unwrap();
        assert_ne!(out_a, out_c);
    }

    #[test]
    fn test_mock_digest_clone_state() {
        let p = MockProvider::new();
        let mut a = p.hash_new(HashAlg::Sha384).unwrap();
        a.update(b"prefix").unwrap();
        let mut b = a.clone_state();
        a.update(b"-left").unwrap();
        b.update(b"-left").unwrap();
        let mut out_a = vec![0u8; 48];
        let mut out_b = vec![0u8; 48];
        a.finish(&mut out_a).unwrap();
        b.finish(&mut out_b).unwrap();
        assert_eq!(out_a, out_b);
    }

    #[test]
    fn test_mock_kx_agreement() {
        let p = MockProvider::new();
        let a = p.kx_generate(0x001D).unwrap();
        let b = p.kx_generate(0x001D).unwrap();
        let sa = a.derive(b.public_bytes()).unwrap();
        let sb = b.derive(a.public_bytes()).unwrap();
        assert_eq!(sa, sb);
        assert_eq!(sa.len(), 32);
        // Mismatched lengths rejected
        assert!(a.derive(&[0; 16]).is_err());
    }

    #[test]
    fn test_mock_encapsulation_roundtrip() {
        let p = MockProvider::new();
        let key = mock_cert_der(KeyType::Rsa, 7);
        let ct = p.kx_encapsulate(&key, b"pre-master-secret-bytes").unwrap();
        assert_ne!(ct, b"pre-master-secret-bytes");
        let pt = p.kx_decapsulate(KeyType::Rsa, &key, &ct).unwrap();
        assert_eq!(pt, b"pre-master-secret-bytes");
    }

    #[test]
    fn test_mock_sign_verify() {
        let p = MockProvider::new();
        let key = mock_cert_der(KeyType::Ecdsa, 9);
        let sig = p.sign(KeyType::Ecdsa, &key, 0x0403, b"payload").unwrap();
        p.verify(&key, 0x0403, b"payload", &sig).unwrap();
        assert!(p.verify(&key, 0x0403, b"payloae", &sig).is_err());
        assert!(p.verify(&key, 0x0404, b"payload", &sig).is_err());
    }

    #[test]
    fn test_mock_aead_roundtrip_and_tamper() {
        let p = MockProvider::new();
        let sealed = p
            .aead_seal(&[1; 16], &[2; 12], b"aad", b"plaintext")
            .unwrap();
        let opened = p.aead_open(&[1; 16], &[2; 12], b"aad", &sealed).unwrap();
        assert_eq!(opened, b"plaintext");

        let mut bad = sealed.clone();
        bad[0] ^= 1;
        assert!(p.aead_open(&[1; 16], &[2; 12], b"aad", &bad).is_err());
        assert!(p.aead_open(&[1; 16], &[2; 12], b"xad", &sealed).is_err());
    }

    #[test]
    fn test_mock_drbg_progresses() {
        let p = MockProvider::new();
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        p.drbg_random(&mut a).unwrap();
        p.drbg_random(&mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_mock_cert_provider() {
        let provider = MockCertProvider;
        let cert = provider.parse(&mock_cert_der(KeyType::Rsa, 1)).unwrap();
        assert_eq!(cert.key_type(), KeyType::Rsa);
        provider
            .verify_chain(&[cert], Some("example.com"), KeyUsage::DigitalSignature, 0)
            .unwrap();

        let bad = provider.parse(&[0xBD, 1, 2, 3]).unwrap();
        assert!(provider
            .verify_chain(&[bad], None, KeyUsage::DigitalSignature, 0)
            .is_err());
    }
}
