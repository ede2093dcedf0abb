//! Resumable TLS sessions and the shared session cache.

pub mod ticket;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use latch_types::{HashAlg, TlsError};
use zeroize::Zeroize;

use crate::provider::CertHandle;
use crate::{CipherSuite, TlsVersion};

/// Default session lifetime when the peer gives no hint (seconds).
pub const DEFAULT_SESSION_LIFETIME: u64 = 7200;

/// Maximum sessions held by the cache before LRU eviction.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024 * 20;

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A resumable session, shared by reference between the cache and
/// connections.
#[derive(Clone)]
pub struct Session {
    pub version: TlsVersion,
    pub cipher_suite: CipherSuite,
    /// Master secret (≤1.2) or resumption master secret (1.3).
    pub master_secret: Vec<u8>,
    pub session_id: Vec<u8>,
    pub ticket: Option<Vec<u8>>,
    pub session_id_context: Vec<u8>,
    pub extended_master_secret: bool,
    pub server_name: Option<String>,
    pub peer_certs: Vec<CertHandle>,
    /// Hash of the peer's authentication identity (leaf cert or PSK
    /// identity), for resumption equivalence checks.
    pub auth_id_hash: Vec<u8>,
    pub lifetime: u64,
    pub created_at: u64,
    pub ticket_age_add: u32,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.master_secret.zeroize();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("version", &self.version)
            .field("cipher_suite", &self.cipher_suite)
            .field("master_secret", &"<redacted>")
            .field("session_id", &self.session_id)
            .field("ticket", &self.ticket.as_ref().map(|_| "<redacted>"))
            .field("session_id_context", &self.session_id_context)
            .field("extended_master_secret", &self.extended_master_secret)
            .field("server_name", &self.server_name)
            .field("peer_certs_len", &self.peer_certs.len())
            .field("auth_id_hash", &"<redacted>")
            .field("lifetime", &self.lifetime)
            .field("created_at", &self.created_at)
            .field("ticket_age_add", &self.ticket_age_add)
            .finish()
    }
}

impl Session {
    /// Whether the session may still be resumed at `now`.
    pub fn is_live(&self, now: u64) -> bool {
        now >= self.created_at && now - self.created_at < self.lifetime
    }

    /// The resumption-validity invariant: not expired, hash
    /// compatibility for 1.3, matching session-id context, unchanged
    /// peer auth material.
    pub fn is_resumable(
        &self,
        now: u64,
        suite_hash: Option<HashAlg>,
        session_id_context: &[u8],
        auth_id_hash: Option<&[u8]>,
    ) -> bool {
        if !self.is_live(now) {
            return false;
        }
        if self.session_id_context != session_id_context {
            return false;
        }
        if self.version == TlsVersion::Tls13 {
            // 1.3 resumption only under suites with the same hash.
            match (suite_hash, hash_of_suite(self.cipher_suite)) {
                (Some(want), Some(have)) if want == have => {}
                _ => return false,
            }
        }
        if let Some(expected) = auth_id_hash {
            if self.auth_id_hash != expected {
                return false;
            }
        }
        true
    }

    /// Obfuscated ticket age check for TLS 1.3 PSK offers: the
    /// client-reported age (minus age_add) must fall inside the ticket
    /// lifetime with a modest allowance for clock skew.
    pub fn check_obfuscated_age(&self, now: u64, obfuscated_age: u32) -> bool {
        let age_ms = obfuscated_age.wrapping_sub(self.ticket_age_add) as u64;
        let age_secs = age_ms / 1000;
        if age_secs > self.lifetime {
            return false;
        }
        let real_age = now.saturating_sub(self.created_at);
        // 10 s skew allowance either way.
        age_secs <= real_age + 10
    }
}

fn hash_of_suite(suite: CipherSuite) -> Option<HashAlg> {
    crate::crypt::CipherSuiteParams::from_suite(suite)
        .map(|p| p.hash)
        .ok()
}

/// Which roles feed and consult the session cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCacheMode {
    Off,
    Client,
    Server,
    Both,
}

impl SessionCacheMode {
    pub fn caches_server(&self) -> bool {
        matches!(self, SessionCacheMode::Server | SessionCacheMode::Both)
    }

    pub fn caches_client(&self) -> bool {
        matches!(self, SessionCacheMode::Client | SessionCacheMode::Both)
    }
}

struct CacheInner {
    map: HashMap<Vec<u8>, (Arc<Session>, u64)>,
    tick: u64,
    capacity: usize,
}

/// Shared, internally synchronised session cache with LRU eviction and
/// expiry enforcement.
pub struct SessionCache {
    inner: RwLock<CacheInner>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                map: HashMap::new(),
                tick: 0,
                capacity: capacity.max(1),
            }),
        }
    }

    /// Insert a session under its session id; returns the id. Evicts
    /// the least recently used entry when over capacity.
    pub fn insert(&self, session: Arc<Session>) -> Result<Vec<u8>, TlsError> {
        let id = session.session_id.clone();
        if id.is_empty() || id.len() > 32 {
            return Err(TlsError::Internal("invalid session id for cache".into()));
        }
        let mut inner = self.inner.write().expect("session cache poisoned");
        inner.tick += 1;
        let tick = inner.tick;
        inner.map.insert(id.clone(), (session, tick));
        if inner.map.len() > inner.capacity {
            if let Some(oldest) = inner
                .map
                .iter()
                .min_by_key(|(_, (_, used))| *used)
                .map(|(k, _)| k.clone())
            {
                inner.map.remove(&oldest);
            }
        }
        Ok(id)
    }

    /// Look up a session by id, refreshing its LRU position. Expired
    /// sessions are dropped on access.
    pub fn lookup(&self, id: &[u8], now: u64) -> Option<Arc<Session>> {
        let mut inner = self.inner.write().expect("session cache poisoned");
        inner.tick += 1;
        let tick = inner.tick;
        match inner.map.get_mut(id) {
            Some((session, used)) => {
                if !session.is_live(now) {
                    inner.map.remove(id);
                    return None;
                }
                *used = tick;
                Some(Arc::clone(session))
            }
            None => None,
        }
    }

    pub fn delete(&self, id: &[u8]) {
        let mut inner = self.inner.write().expect("session cache poisoned");
        inner.map.remove(id);
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("session cache poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}
