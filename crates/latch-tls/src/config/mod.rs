//! TLS configuration with builder pattern.

use std::fmt;
use std::sync::Arc;

use latch_types::KeyType;
use zeroize::Zeroize;

use crate::alert::AlertDescription;
use crate::crypt::{NamedGroup, SignatureScheme};
use crate::handshake::codec::ClientHello;
use crate::provider::{CertProvider, CryptoProvider};
use crate::session::{Session, SessionCacheMode};
use crate::{CipherSuite, TlsRole, TlsVersion};

/// Client-certificate policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuth {
    None,
    Optional,
    Required,
}

/// A private key handle: raw key material tagged with its type.
/// Zeroized on drop; only the crypto provider interprets the bytes.
#[derive(Clone)]
pub struct PrivateKey {
    pub key_type: KeyType,
    pub der: Vec<u8>,
}

impl Drop for PrivateKey {
    fn drop(&mut self) {
        self.der.zeroize();
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("key_type", &self.key_type)
            .field("der", &format!("[{} bytes]", self.der.len()))
            .finish()
    }
}

/// A certificate chain (DER, leaf first) with its signing key.
#[derive(Debug, Clone)]
pub struct Credential {
    pub chain: Vec<Vec<u8>>,
    pub private_key: PrivateKey,
}

/// An externally provisioned TLS 1.3 PSK.
#[derive(Clone)]
pub struct ExternalPsk {
    pub identity: Vec<u8>,
    pub key: Vec<u8>,
}

impl Drop for ExternalPsk {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Result of the SNI selection callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniAction {
    /// Accept the name.
    Ok,
    /// Proceed without acknowledging the name.
    NoAck,
    /// Abort with the given alert.
    Fatal(AlertDescription),
}

/// Result of the ALPN selection callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlpnAction {
    Select(Vec<u8>),
    /// Leave negotiation unchanged.
    NoAck,
    /// Abort with no_application_protocol.
    Fatal,
}

/// Result of the ClientHello inspection callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectAction {
    Proceed,
    /// Suspend the handshake; `step` reports a pending callback and
    /// re-entry resumes at the same point.
    Suspend,
    Fatal(AlertDescription),
}

pub type SniCallback = Arc<dyn Fn(&str) -> SniAction + Send + Sync>;
pub type AlpnCallback = Arc<dyn Fn(&[Vec<u8>]) -> AlpnAction + Send + Sync>;
pub type ClientHelloCallback = Arc<dyn Fn(&ClientHello) -> InspectAction + Send + Sync>;
/// Server PSK lookup: identity → key material.
pub type PskServerCallback = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;
/// Client PSK selection: optional server hint → (identity, key).
pub type PskClientCallback = Arc<dyn Fn(Option<&[u8]>) -> Option<(Vec<u8>, Vec<u8>)> + Send + Sync>;
/// TLS 1.3 find-session hook: identity → resumable session.
pub type PskFindSessionCallback = Arc<dyn Fn(&[u8]) -> Option<Arc<Session>> + Send + Sync>;
/// Override of the default chain verification outcome.
pub type CertVerifyCallback = Arc<dyn Fn(&[Vec<u8>], bool) -> bool + Send + Sync>;
/// NSS key-log line sink (SSLKEYLOGFILE format).
pub type KeyLogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// TLS configuration.
#[derive(Clone)]
pub struct TlsConfig {
    pub role: TlsRole,
    pub min_version: TlsVersion,
    pub max_version: TlsVersion,
    /// Cipher suites for ≤1.2 / TLCP, in preference order.
    pub cipher_suites: Vec<CipherSuite>,
    /// TLS 1.3 cipher suites, in preference order (disjoint list).
    pub tls13_cipher_suites: Vec<CipherSuite>,
    pub groups: Vec<NamedGroup>,
    pub signature_algorithms: Vec<SignatureScheme>,
    pub alpn_protocols: Vec<Vec<u8>>,
    /// Hostname for the client's SNI offer and certificate check.
    pub server_name: Option<String>,
    /// Signing credentials by key type; the negotiator picks one.
    pub credentials: Vec<Credential>,
    /// TLCP encryption credential (double-certificate profile).
    #[cfg(feature = "tlcp")]
    pub tlcp_enc_credential: Option<Credential>,
    pub verify_peer: bool,
    pub client_auth: ClientAuth,
    pub session_cache_mode: SessionCacheMode,
    pub session_id_context: Vec<u8>,
    pub ticket_support: bool,
    /// Pre-built session for client-side resumption.
    pub resumption_session: Option<Arc<Session>>,
    pub renegotiation_allowed: bool,
    pub resume_on_renego: bool,
    pub post_handshake_auth: bool,
    pub extended_master_secret: bool,
    pub encrypt_then_mac: bool,
    /// External PSKs offered/accepted in TLS 1.3.
    pub external_psks: Vec<ExternalPsk>,
    /// TLS 1.3 psk_key_exchange_modes offered/permitted
    /// (`PSK_KE` and/or `PSK_DHE_KE` values).
    pub tls13_psk_modes: Vec<u8>,
    /// ≤1.2 PSK identity hint the server sends.
    pub psk_identity_hint: Option<Vec<u8>>,
    pub psk_server_find: Option<PskServerCallback>,
    pub psk_client_use: Option<PskClientCallback>,
    pub psk_find_session: Option<PskFindSessionCallback>,
    pub sni_select: Option<SniCallback>,
    pub alpn_select: Option<AlpnCallback>,
    pub client_hello_inspect: Option<ClientHelloCallback>,
    pub cert_verify_override: Option<CertVerifyCallback>,
    pub key_log: Option<KeyLogCallback>,
    pub crypto: Arc<dyn CryptoProvider>,
    pub certs: Arc<dyn CertProvider>,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("role", &self.role)
            .field("min_version", &self.min_version)
            .field("max_version", &self.max_version)
            .field("cipher_suites", &self.cipher_suites)
            .field("tls13_cipher_suites", &self.tls13_cipher_suites)
            .field("groups", &self.groups)
            .field("client_auth", &self.client_auth)
            .field("session_cache_mode", &self.session_cache_mode)
            .field("ticket_support", &self.ticket_support)
            .field("renegotiation_allowed", &self.renegotiation_allowed)
            .field(
                "external_psks",
                &format!("[{} psks]", self.external_psks.len()),
            )
            .finish_non_exhaustive()
    }
}

impl TlsConfig {
    pub fn builder(
        crypto: Arc<dyn CryptoProvider>,
        certs: Arc<dyn CertProvider>,
    ) -> TlsConfigBuilder {
        TlsConfigBuilder::new(crypto, certs)
    }

    /// Whether the configured version window admits `version`.
    pub fn version_allowed(&self, version: TlsVersion) -> bool {
        version >= self.min_version && version <= self.max_version
    }

    /// The credential whose key type matches, if any.
    pub fn credential_for(&self, key_type: KeyType) -> Option<&Credential> {
        self.credentials
            .iter()
            .find(|c| c.private_key.key_type == key_type)
    }

    /// TLS 1.3 needs either a PSK source or a usable certificate+key.
    pub fn tls13_key_material_available(&self) -> bool {
        !self.external_psks.is_empty()
            || self.psk_server_find.is_some()
            || self.psk_find_session.is_some()
            || self.resumption_session.is_some()
            || !self.credentials.is_empty()
    }
}

/// Builder for [`TlsConfig`].
pub struct TlsConfigBuilder {
    config: TlsConfig,
}

impl TlsConfigBuilder {
    fn new(crypto: Arc<dyn CryptoProvider>, certs: Arc<dyn CertProvider>) -> Self {
        Self {
            config: TlsConfig {
                role: TlsRole::Client,
                min_version: TlsVersion::Tls12,
                max_version: TlsVersion::Tls13,
                cipher_suites: vec![
                    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
                    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                    CipherSuite::TLS_DHE_RSA_WITH_AES_128_GCM_SHA256,
                ],
                tls13_cipher_suites: vec![
                    CipherSuite::TLS_AES_256_GCM_SHA384,
                    CipherSuite::TLS_AES_128_GCM_SHA256,
                    CipherSuite::TLS_CHACHA20_POLY1305_SHA256,
                ],
                groups: vec![
                    NamedGroup::X25519,
                    NamedGroup::SECP256R1,
                    NamedGroup::SECP384R1,
                    NamedGroup::FFDHE2048,
                ],
                signature_algorithms: vec![
                    SignatureScheme::ECDSA_SECP256R1_SHA256,
                    SignatureScheme::RSA_PSS_RSAE_SHA256,
                    SignatureScheme::ED25519,
                    SignatureScheme::RSA_PKCS1_SHA256,
                ],
                alpn_protocols: Vec::new(),
                server_name: None,
                credentials: Vec::new(),
                #[cfg(feature = "tlcp")]
                tlcp_enc_credential: None,
                verify_peer: true,
                client_auth: ClientAuth::None,
                session_cache_mode: SessionCacheMode::Both,
                session_id_context: Vec::new(),
                ticket_support: true,
                resumption_session: None,
                renegotiation_allowed: false,
                resume_on_renego: false,
                post_handshake_auth: false,
                extended_master_secret: true,
                encrypt_then_mac: true,
                external_psks: Vec::new(),
                tls13_psk_modes: vec![
                    crate::handshake::extensions_codec::PSK_DHE_KE,
                    crate::handshake::extensions_codec::PSK_KE,
                ],
                psk_identity_hint: None,
                psk_server_find: None,
                psk_client_use: None,
                psk_find_session: None,
                sni_select: None,
                alpn_select: None,
                client_hello_inspect: None,
                cert_verify_override: None,
                key_log: None,
                crypto,
                certs,
            },
        }
    }

    pub fn role(mut self, role: TlsRole) -> Self {
        self.config.role = role;
        self
    }

    pub fn versions(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.config.min_version = min;
        self.config.max_version = max;
        self
    }

    pub fn cipher_suites(mut self, suites: Vec<CipherSuite>) -> Self {
        self.config.cipher_suites = suites;
        self
    }

    pub fn tls13_cipher_suites(mut self, suites: Vec<CipherSuite>) -> Self {
        self.config.tls13_cipher_suites = suites;
        self
    }

    pub fn groups(mut self, groups: Vec<NamedGroup>) -> Self {
        self.config.groups = groups;
        self
    }

    pub fn signature_algorithms(mut self, schemes: Vec<SignatureScheme>) -> Self {
        self.config.signature_algorithms = schemes;
        self
    }

    pub fn alpn_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.config.alpn_protocols = protocols;
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = Some(name.into());
        self
    }

    pub fn credential(mut self, chain: Vec<Vec<u8>>, private_key: PrivateKey) -> Self {
        self.config.credentials.push(Credential { chain, private_key });
        self
    }

    #[cfg(feature = "tlcp")]
    pub fn tlcp_enc_credential(mut self, chain: Vec<Vec<u8>>, private_key: PrivateKey) -> Self {
        self.config.tlcp_enc_credential = Some(Credential { chain, private_key });
        self
    }

    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.config.verify_peer = verify;
        self
    }

    pub fn client_auth(mut self, mode: ClientAuth) -> Self {
        self.config.client_auth = mode;
        self
    }

    pub fn session_cache_mode(mut self, mode: SessionCacheMode) -> Self {
        self.config.session_cache_mode = mode;
        self
    }

    pub fn session_id_context(mut self, ctx: Vec<u8>) -> Self {
        self.config.session_id_context = ctx;
        self
    }

    pub fn ticket_support(mut self, enabled: bool) -> Self {
        self.config.ticket_support = enabled;
        self
    }

    pub fn resumption_session(mut self, session: Arc<Session>) -> Self {
        self.config.resumption_session = Some(session);
        self
    }

    pub fn renegotiation_allowed(mut self, allowed: bool) -> Self {
        self.config.renegotiation_allowed = allowed;
        self
    }

    pub fn resume_on_renego(mut self, allowed: bool) -> Self {
        self.config.resume_on_renego = allowed;
        self
    }

    pub fn post_handshake_auth(mut self, enabled: bool) -> Self {
        self.config.post_handshake_auth = enabled;
        self
    }

    pub fn extended_master_secret(mut self, enabled: bool) -> Self {
        self.config.extended_master_secret = enabled;
        self
    }

    pub fn encrypt_then_mac(mut self, enabled: bool) -> Self {
        self.config.encrypt_then_mac = enabled;
        self
    }

    pub fn external_psk(mut self, identity: Vec<u8>, key: Vec<u8>) -> Self {
        self.config.external_psks.push(ExternalPsk { identity, key });
        self
    }

    pub fn tls13_psk_modes(mut self, modes: Vec<u8>) -> Self {
        self.config.tls13_psk_modes = modes;
        self
    }

    pub fn psk_identity_hint(mut self, hint: Vec<u8>) -> Self {
        self.config.psk_identity_hint = Some(hint);
        self
    }

    pub fn psk_server_find(mut self, cb: PskServerCallback) -> Self {
        self.config.psk_server_find = Some(cb);
        self
    }

    pub fn psk_client_use(mut self, cb: PskClientCallback) -> Self {
        self.config.psk_client_use = Some(cb);
        self
    }

    pub fn psk_find_session(mut self, cb: PskFindSessionCallback) -> Self {
        self.config.psk_find_session = Some(cb);
        self
    }

    pub fn sni_select(mut self, cb: SniCallback) -> Self {
        self.config.sni_select = Some(cb);
        self
    }

    pub fn alpn_select(mut self, cb: AlpnCallback) -> Self {
        self.config.alpn_select = Some(cb);
        self
    }

    pub fn client_hello_inspect(mut self, cb: ClientHelloCallback) -> Self {
        self.config.client_hello_inspect = Some(cb);
        self
    }

    pub fn cert_verify_override(mut self, cb: CertVerifyCallback) -> Self {
        self.config.cert_verify_override = Some(cb);
        self
    }

    pub fn key_log(mut self, cb: KeyLogCallback) -> Self {
        self.config.key_log = Some(cb);
        self
    }

    pub fn build(self) -> TlsConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockCertProvider, MockProvider};

    fn builder() -> TlsConfigBuilder {
        TlsConfig::builder(Arc::new(MockProvider::new()), Arc::new(MockCertProvider))
    }

    #[test]
    fn test_default_config() {
        let config = builder().build();
        assert_eq!(config.role, TlsRole::Client);
        assert_eq!(config.min_version, TlsVersion::Tls12);
        assert_eq!(config.max_version, TlsVersion::Tls13);
        assert!(!config.tls13_cipher_suites.is_empty());
        assert!(config.extended_master_secret);
        assert!(config.encrypt_then_mac);
        assert!(!config.renegotiation_allowed);
        assert!(!config.resume_on_renego);
        assert_eq!(config.client_auth, ClientAuth::None);
    }

    #[test]
    fn test_version_window() {
        let config = builder()
            .versions(TlsVersion::Tls12, TlsVersion::Tls12)
            .build();
        assert!(config.version_allowed(TlsVersion::Tls12));
        assert!(!config.version_allowed(TlsVersion::Tls13));
        assert!(!config.version_allowed(TlsVersion::Tlcp11));
    }

    #[test]
    fn test_credential_lookup_by_key_type() {
        let config = builder()
            .credential(
                vec![vec![0x02; 8]],
                PrivateKey {
                    key_type: KeyType::Ecdsa,
                    der: vec![0x02; 8],
                },
            )
            .credential(
                vec![vec![0x01; 8]],
                PrivateKey {
                    key_type: KeyType::Rsa,
                    der: vec![0x01; 8],
                },
            )
            .build();
        assert!(config.credential_for(KeyType::Ecdsa).is_some());
        assert!(config.credential_for(KeyType::Rsa).is_some());
        assert!(config.credential_for(KeyType::Ed25519).is_none());
    }

    #[test]
    fn test_tls13_key_material_gate() {
        // Nothing configured: no 1.3 material
        assert!(!builder().build().tls13_key_material_available());
        // A certificate credential suffices
        assert!(builder()
            .credential(
                vec![vec![2; 4]],
                PrivateKey {
                    key_type: KeyType::Ecdsa,
                    der: vec![2; 4],
                },
            )
            .build()
            .tls13_key_material_available());
        // An external PSK suffices
        assert!(builder()
            .external_psk(b"demo".to_vec(), vec![0x11; 32])
            .build()
            .tls13_key_material_available());
        // A server PSK callback suffices
        assert!(builder()
            .psk_server_find(Arc::new(|_| None))
            .build()
            .tls13_key_material_available());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let config = builder()
            .external_psk(b"demo".to_vec(), vec![0xAA; 32])
            .build();
        let dbg = format!("{config:?}");
        assert!(dbg.contains("[1 psks]"));
        assert!(!dbg.contains("170, 170"));

        let key = PrivateKey {
            key_type: KeyType::Rsa,
            der: vec![0x55; 64],
        };
        let dbg = format!("{key:?}");
        assert!(dbg.contains("[64 bytes]"));
        assert!(!dbg.contains("85, 85"));
    }
}
