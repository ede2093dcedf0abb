/// Errors returned by a crypto provider.
///
/// Providers report failures through these enumerated codes; no panics
/// cross the provider boundary.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid argument")]
    InvalidArg,
    #[error("operation not supported")]
    NotSupported,
    #[error("invalid key")]
    InvalidKey,
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("aead: tag verification failed")]
    AeadTagVerifyFail,
    #[error("signature verification failed")]
    VerifyFail,
    #[error("signing failed")]
    SignFail,
    #[error("asymmetric decryption failed")]
    DecryptFail,
    #[error("drbg: random generation failed")]
    DrbgFail,
    #[error("kdf: derived key length overflow")]
    KdfDkLenOverflow,
}

/// Errors returned by a certificate provider.
#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("invalid certificate: {0}")]
    InvalidCert(String),
    #[error("certificate expired")]
    CertExpired,
    #[error("certificate revoked")]
    CertRevoked,
    #[error("issuer certificate not found")]
    UnknownCa,
    #[error("certificate chain verification failed: {0}")]
    ChainVerifyFailed(String),
    #[error("key usage violation: {0}")]
    KeyUsageViolation(String),
    #[error("hostname mismatch: {0}")]
    HostnameMismatch(String),
    #[error("unsupported certificate: {0}")]
    Unsupported(String),
}

/// TLS protocol errors.
///
/// Each kind maps onto the fatal alert the state machine emits for it;
/// `alert()` returns the RFC alert description code.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("decode error: {0}")]
    Decode(String),
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
    #[error("unsupported protocol version: {0}")]
    ProtocolVersion(String),
    #[error("unsupported extension: {0}")]
    UnsupportedExtension(String),
    #[error("missing extension: {0}")]
    MissingExtension(String),
    #[error("illegal parameter: {0}")]
    IllegalParameter(String),
    #[error("handshake failure: {0}")]
    HandshakeFailure(String),
    #[error("bad record mac")]
    BadRecordMac,
    #[error("decrypt error: {0}")]
    DecryptError(String),
    #[error("bad certificate: {0}")]
    BadCertificate(String),
    #[error("certificate expired")]
    CertificateExpired,
    #[error("certificate revoked")]
    CertificateRevoked,
    #[error("certificate unknown: {0}")]
    CertificateUnknown(String),
    #[error("certificate required")]
    CertificateRequired,
    #[error("unknown ca")]
    UnknownCa,
    #[error("unknown psk identity")]
    UnknownPskIdentity,
    #[error("insufficient security: {0}")]
    InsufficientSecurity(String),
    #[error("unrecognized name")]
    UnrecognizedName,
    #[error("no application protocol")]
    NoApplicationProtocol,
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("alert received: level {level}, description {description}")]
    AlertReceived { level: u8, description: u8 },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("certificate error: {0}")]
    Cert(#[from] CertError),
}

impl TlsError {
    /// The fatal alert description code this error maps to
    /// (RFC 8446 §6 / RFC 5246 §7.2 numeric values).
    pub fn alert(&self) -> u8 {
        match self {
            TlsError::Decode(_) => 50,
            TlsError::UnexpectedMessage(_) => 10,
            TlsError::ProtocolVersion(_) => 70,
            TlsError::UnsupportedExtension(_) => 110,
            TlsError::MissingExtension(_) => 109,
            TlsError::IllegalParameter(_) => 47,
            TlsError::HandshakeFailure(_) => 40,
            TlsError::BadRecordMac => 20,
            TlsError::DecryptError(_) => 51,
            TlsError::BadCertificate(_) => 42,
            TlsError::CertificateExpired => 45,
            TlsError::CertificateRevoked => 44,
            TlsError::CertificateUnknown(_) => 46,
            TlsError::CertificateRequired => 116,
            TlsError::UnknownCa => 48,
            TlsError::UnknownPskIdentity => 115,
            TlsError::InsufficientSecurity(_) => 71,
            TlsError::UnrecognizedName => 112,
            TlsError::NoApplicationProtocol => 120,
            TlsError::AccessDenied(_) => 49,
            TlsError::Cert(e) => match e {
                CertError::CertExpired => 45,
                CertError::CertRevoked => 44,
                CertError::UnknownCa => 48,
                CertError::KeyUsageViolation(_) => 43,
                CertError::HostnameMismatch(_) => 42,
                CertError::Unsupported(_) => 43,
                _ => 42,
            },
            // Everything else is a collaborator failure: internal_error.
            _ => 80,
        }
    }

    /// Whether this error tears down the connection with a fatal alert.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TlsError::ConnectionClosed)
    }
}
