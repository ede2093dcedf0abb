/// Hash algorithm identifiers used across the provider boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlg {
    Sha256,
    Sha384,
    Sha512,
    Sm3,
    Sha1,
}

impl HashAlg {
    /// Digest output size in bytes.
    pub fn output_size(&self) -> usize {
        match self {
            HashAlg::Sha256 | HashAlg::Sm3 => 32,
            HashAlg::Sha384 => 48,
            HashAlg::Sha512 => 64,
            HashAlg::Sha1 => 20,
        }
    }
}

/// Private-key type, used to index the per-type key slots in a
/// certificate configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Rsa,
    Ecdsa,
    Ed25519,
    Sm2,
    Dh,
}

/// X.509 key-usage bits the handshake cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    DigitalSignature,
    KeyEncipherment,
    KeyAgreement,
}
