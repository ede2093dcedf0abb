#![forbid(unsafe_code)]
#![doc = "TLS/DTLS/TLCP handshake protocol engine."]

pub mod alert;
pub mod config;
pub mod connection;
pub mod crypt;
pub mod extensions;
pub mod handshake;
pub mod provider;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::{Arc, OnceLock};

use crate::session::ticket::TicketKeyRing;
use crate::session::SessionCache;

/// TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TlsVersion {
    /// TLCP 1.1 (GB/T 38636, SM cipher profile).
    Tlcp11,
    Tls12,
    Tls13,
    Dtls12,
}

impl TlsVersion {
    /// The wire version value (e.g. 0x0303 for TLS 1.2).
    pub fn wire(&self) -> u16 {
        match self {
            TlsVersion::Tlcp11 => 0x0101,
            TlsVersion::Tls12 => 0x0303,
            TlsVersion::Tls13 => 0x0304,
            TlsVersion::Dtls12 => 0xFEFD,
        }
    }

    /// Map a wire version value back to a version.
    pub fn from_wire(v: u16) -> Option<Self> {
        match v {
            0x0101 => Some(TlsVersion::Tlcp11),
            0x0303 => Some(TlsVersion::Tls12),
            0x0304 => Some(TlsVersion::Tls13),
            0xFEFD => Some(TlsVersion::Dtls12),
            _ => None,
        }
    }

    /// True for datagram transports.
    pub fn is_datagram(&self) -> bool {
        matches!(self, TlsVersion::Dtls12)
    }
}

/// TLS cipher suite identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CipherSuite(pub u16);

impl CipherSuite {
    // TLS 1.3 cipher suites
    pub const TLS_AES_128_GCM_SHA256: Self = Self(0x1301);
    pub const TLS_AES_256_GCM_SHA384: Self = Self(0x1302);
    pub const TLS_CHACHA20_POLY1305_SHA256: Self = Self(0x1303);

    // TLS 1.2 certificate-authenticated suites
    pub const TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256: Self = Self(0xC02F);
    pub const TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384: Self = Self(0xC030);
    pub const TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256: Self = Self(0xC02B);
    pub const TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384: Self = Self(0xC02C);
    pub const TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256: Self = Self(0xC027);
    pub const TLS_DHE_RSA_WITH_AES_128_GCM_SHA256: Self = Self(0x009E);
    pub const TLS_DHE_RSA_WITH_AES_256_GCM_SHA384: Self = Self(0x009F);
    pub const TLS_RSA_WITH_AES_128_GCM_SHA256: Self = Self(0x009C);
    pub const TLS_RSA_WITH_AES_256_GCM_SHA384: Self = Self(0x009D);
    pub const TLS_RSA_WITH_AES_128_CBC_SHA256: Self = Self(0x003C);

    // TLS 1.2 PSK suites (RFC 4279 / RFC 5487 / RFC 5489)
    pub const TLS_PSK_WITH_AES_128_GCM_SHA256: Self = Self(0x00A8);
    pub const TLS_PSK_WITH_AES_256_GCM_SHA384: Self = Self(0x00A9);
    pub const TLS_DHE_PSK_WITH_AES_128_GCM_SHA256: Self = Self(0x00AA);
    pub const TLS_RSA_PSK_WITH_AES_128_GCM_SHA256: Self = Self(0x00AC);
    pub const TLS_ECDHE_PSK_WITH_AES_128_CBC_SHA256: Self = Self(0xC037);

    // TLCP 1.1 suites (GB/T 38636)
    pub const TLCP_ECDHE_SM4_CBC_SM3: Self = Self(0xE011);
    pub const TLCP_ECC_SM4_CBC_SM3: Self = Self(0xE013);

    /// Signalling value, never a real suite (RFC 5746).
    pub const TLS_EMPTY_RENEGOTIATION_INFO_SCSV: Self = Self(0x00FF);

    /// True for the TLS 1.3 suite space.
    pub fn is_tls13(&self) -> bool {
        (self.0 >> 8) == 0x13
    }
}

/// The role of a TLS endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    Client,
    Server,
}

/// Shared library-wide state: the session cache and the ticket key ring.
///
/// Passed explicitly to every connection instead of living in hidden
/// globals; `LibContext::global()` offers a process-wide default.
#[derive(Clone)]
pub struct LibContext {
    session_cache: Arc<SessionCache>,
    ticket_keys: Arc<TicketKeyRing>,
}

impl LibContext {
    /// Create a context with its own cache and key ring.
    pub fn new() -> Self {
        Self {
            session_cache: Arc::new(SessionCache::new()),
            ticket_keys: Arc::new(TicketKeyRing::new()),
        }
    }

    /// The process-wide default context.
    pub fn global() -> &'static LibContext {
        static GLOBAL: OnceLock<LibContext> = OnceLock::new();
        GLOBAL.get_or_init(LibContext::new)
    }

    /// The shared session cache.
    pub fn session_cache(&self) -> &Arc<SessionCache> {
        &self.session_cache
    }

    /// The shared ticket key ring.
    pub fn ticket_keys(&self) -> &Arc<TicketKeyRing> {
        &self.ticket_keys
    }
}

impl Default for LibContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_wire_values() {
        assert_eq!(TlsVersion::Tls12.wire(), 0x0303);
        assert_eq!(TlsVersion::Tls13.wire(), 0x0304);
        assert_eq!(TlsVersion::Dtls12.wire(), 0xFEFD);
        assert_eq!(TlsVersion::Tlcp11.wire(), 0x0101);
    }

    #[test]
    fn test_version_wire_roundtrip() {
        for v in [
            TlsVersion::Tlcp11,
            TlsVersion::Tls12,
            TlsVersion::Tls13,
            TlsVersion::Dtls12,
        ] {
            assert_eq!(TlsVersion::from_wire(v.wire()), Some(v));
        }
        assert_eq!(TlsVersion::from_wire(0x0301), None);
    }

    #[test]
    fn test_suite_space_split() {
        assert!(CipherSuite::TLS_AES_128_GCM_SHA256.is_tls13());
        assert!(CipherSuite::TLS_CHACHA20_POLY1305_SHA256.is_tls13());
        assert!(!CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256.is_tls13());
        assert!(!CipherSuite::TLCP_ECC_SM4_CBC_SM3.is_tls13());
    }

    #[test]
    fn test_lib_context_shares_cache() {
        let ctx = LibContext::new();
        let other = ctx.clone();
        assert!(Arc::ptr_eq(ctx.session_cache(), other.session_cache()));
        assert!(Arc::ptr_eq(ctx.ticket_keys(), other.ticket_keys()));
    }

    #[test]
    fn test_global_context_is_singleton() {
        let a = LibContext::global();
        let b = LibContext::global();
        assert!(Arc::ptr_eq(a.session_cache(), b.session_cache()));
    }
}
