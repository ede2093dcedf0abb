#![forbid(unsafe_code)]
#![doc = "Shared types for the latch TLS stack."]

mod algorithm;
mod error;

pub use algorithm::{HashAlg, KeyType, KeyUsage};
pub use error::{CertError, CryptoError, TlsError};
