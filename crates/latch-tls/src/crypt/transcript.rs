//! Running transcript hash over handshake messages.
//!
//! Every accepted handshake message (header + body) is fed exactly once,
//! in emission/reception order. Until the cipher suite — and with it the
//! hash — is negotiated, bytes are buffered; suite selection initialises
//! the hash and replays the buffer once.

use latch_types::{HashAlg, TlsError};

use crate::provider::{CryptoProvider, Digest};

/// Handshake type code of the synthetic message_hash wrapper
/// (RFC 8446 §4.4.1).
const MESSAGE_HASH: u8 = 254;

enum State {
    /// Hash not yet known; raw message bytes retained.
    Buffering(Vec<u8>),
    Hashing { hash: Box<dyn Digest>, alg: HashAlg },
}

pub struct TranscriptHash {
    state: State,
}

impl TranscriptHash {
    /// Start a transcript in buffering mode.
    pub fn new() -> Self {
        Self {
            state: State::Buffering(Vec::new()),
        }
    }

    /// Feed one handshake message (header included).
    pub fn update(&mut self, data: &[u8]) -> Result<(), TlsError> {
        match &mut self.state {
            State::Buffering(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            State::Hashing { hash, .. } => hash.update(data).map_err(TlsError::from),
        }
    }

    /// Switch to the negotiated hash, replaying buffered bytes once.
    pub fn select_hash(
        &mut self,
        provider: &dyn CryptoProvider,
        alg: HashAlg,
    ) -> Result<(), TlsError> {
        match &self.state {
            State::Buffering(buf) => {
                let mut hash = provider.hash_new(alg)?;
                hash.update(buf)?;
                self.state = State::Hashing { hash, alg };
                Ok(())
            }
            State::Hashing { alg: current, .. } if *current == alg => Ok(()),
            State::Hashing { .. } => Err(TlsError::Internal(
                "transcript hash already selected with a different algorithm".into(),
            )),
        }
    }

    /// Replace the transcript with `message_hash(H(transcript so far))`,
    /// as required when a HelloRetryRequest enters the flow. The hash
    /// becomes selected if it was not already.
    pub fn hrr_reset(
        &mut self,
        provider: &dyn CryptoProvider,
        alg: HashAlg,
    ) -> Result<(), TlsError> {
        let ch1_hash = match &mut self.state {
            State::Buffering(buf) => {
                let mut h = provider.hash_new(alg)?;
                h.update(buf)?;
                let mut out = vec![0u8; alg.output_size()];
                h.finish(&mut out)?;
                out
            }
            State::Hashing { hash, alg: cur } => {
                if *cur != alg {
                    return Err(TlsError::Internal(
                        "hrr reset with mismatched hash algorithm".into(),
                    ));
                }
                let mut h = hash.clone_state();
                let mut out = vec![0u8; alg.output_size()];
                h.finish(&mut out)?;
                out
            }
        };

        // MessageHash(ClientHello1): type(254) || length(3) || H(CH1)
        let mut hash = provider.hash_new(alg)?;
        let len = ch1_hash.len();
        hash.update(&[
            MESSAGE_HASH,
            (len >> 16) as u8,
            (len >> 8) as u8,
            len as u8,
        ])?;
        hash.update(&ch1_hash)?;
        self.state = State::Hashing { hash, alg };
        Ok(())
    }

    /// Current transcript hash. Requires the hash to be selected.
    pub fn digest(&self) -> Result<Vec<u8>, TlsError> {
        self.digest_with(&[])
    }

    /// Transcript hash as if `extra` had been fed, without disturbing
    /// the running state. Used for PSK binders over the truncated
    /// ClientHello.
    pub fn digest_with(&self, extra: &[u8]) -> Result<Vec<u8>, TlsError> {
        match &self.state {
            State::Buffering(_) => Err(TlsError::Internal(
                "transcript digest requested before hash selection".into(),
            )),
            State::Hashing { hash, alg } => {
                let mut h = hash.clone_state();
                h.update(extra)?;
                let mut out = vec![0u8; alg.output_size()];
                h.finish(&mut out)?;
                Ok(out)
            }
        }
    }

    /// Clone the transcript state (binder calculation, post-handshake
    /// auth).
    pub fn fork(&self) -> TranscriptHash {
        let state = match &self.state {
            State::Buffering(buf) => State::Buffering(buf.clone()),
            State::Hashing { hash, alg } => State::Hashing {
                hash: hash.clone_state(),
                alg: *alg,
            },
        };
        TranscriptHash { state }
    }

    /// Whether the hash has been selected yet.
    pub fn is_selected(&self) -> bool {
        matches!(self.state, State::Hashing { .. })
    }
}

impl Default for TranscriptHash {
    fn default() -> Self {
        Self::new()
    }
}
