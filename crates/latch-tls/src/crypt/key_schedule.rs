//! TLS 1.3 key schedule (RFC 8446 §7.1).
//!
//! Staged derivation chain: Early Secret → Handshake Secret → Master
//! Secret, with the traffic/exporter/resumption secrets branching off
//! at the defined transcript points.

use latch_types::{HashAlg, TlsError};
use zeroize::Zeroize;

use super::CipherSuiteParams;
use crate::provider::CryptoProvider;

/// `HKDF-Expand-Label(secret, label, context, length)`.
pub fn hkdf_expand_label(
    provider: &dyn CryptoProvider,
    alg: HashAlg,
    secret: &[u8],
    label: &[u8],
    context: &[u8],
    len: usize,
) -> Result<Vec<u8>, TlsError> {
    // struct HkdfLabel { uint16 length; opaque label<7..255>; opaque context<0..255>; }
    let mut info = Vec::with_capacity(4 + 6 + label.len() + 1 + context.len());
    info.extend_from_slice(&(len as u16).to_be_bytes());
    info.push((6 + label.len()) as u8);
    info.extend_from_slice(b"tls13 ");
    info.extend_from_slice(label);
    info.push(context.len() as u8);
    info.extend_from_slice(context);
    provider
        .hkdf_expand(alg, secret, &info, len)
        .map_err(TlsError::from)
}

/// `Derive-Secret(secret, label, messages)` where `context` is already
/// the transcript hash of `messages`.
pub fn derive_secret(
    provider: &dyn CryptoProvider,
    alg: HashAlg,
    secret: &[u8],
    label: &[u8],
    context: &[u8],
) -> Result<Vec<u8>, TlsError> {
    hkdf_expand_label(provider, alg, secret, label, context, alg.output_size())
}

/// Current stage of the derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScheduleStage {
    Initial,
    EarlySecret,
    HandshakeSecret,
    MasterSecret,
}

/// TLS 1.3 key schedule state. Secret material is zeroized on drop.
pub struct KeySchedule {
    alg: HashAlg,
    stage: KeyScheduleStage,
    current_secret: Vec<u8>,
}

impl Drop for KeySchedule {
    fn drop(&mut self) {
        self.current_secret.zeroize();
    }
}

impl KeySchedule {
    pub fn new(params: &CipherSuiteParams) -> Self {
        Self {
            alg: params.hash,
            stage: KeyScheduleStage::Initial,
            current_secret: Vec::new(),
        }
    }

    pub fn stage(&self) -> KeyScheduleStage {
        self.stage
    }

    pub fn hash_len(&self) -> usize {
        self.alg.output_size()
    }

    fn require_stage(&self, want: KeyScheduleStage, op: &str) -> Result<(), TlsError> {
        if self.stage != want {
            return Err(TlsError::Internal(format!("{op}: wrong key schedule stage")));
        }
        Ok(())
    }

    fn empty_hash(&self, provider: &dyn CryptoProvider) -> Result<Vec<u8>, TlsError> {
        let mut h = provider.hash_new(self.alg)?;
        let mut out = vec![0u8; self.alg.output_size()];
        h.finish(&mut out)?;
        Ok(out)
    }

    /// Early Secret = HKDF-Extract(0, PSK or zeros).
    pub fn derive_early_secret(
        &mut self,
        provider: &dyn CryptoProvider,
        psk: Option<&[u8]>,
    ) -> Result<(), TlsError> {
        self.require_stage(KeyScheduleStage::Initial, "derive_early_secret")?;
        let zero_psk = vec![0u8; self.alg.output_size()];
        let ikm = psk.unwrap_or(&zero_psk);
        self.current_secret = provider.hkdf_extract(self.alg, &[], ikm)?;
        self.stage = KeyScheduleStage::EarlySecret;
        Ok(())
    }

    /// Binder key: "ext binder" for external PSKs, "res binder" for
    /// resumption PSKs.
    pub fn derive_binder_key(
        &self,
        provider: &dyn CryptoProvider,
        external: bool,
    ) -> Result<Vec<u8>, TlsError> {
        self.require_stage(KeyScheduleStage::EarlySecret, "derive_binder_key")?;
        let label: &[u8] = if external { b"ext binder" } else { b"res binder" };
        let empty = self.empty_hash(provider)?;
        derive_secret(provider, self.alg, &self.current_secret, label, &empty)
    }

    /// Handshake Secret = HKDF-Extract(Derive-Secret(ES, "derived", ""), DHE).
    ///
    /// `dhe` is empty for PSK-only handshakes.
    pub fn derive_handshake_secret(
        &mut self,
        provider: &dyn CryptoProvider,
        dhe: &[u8],
    ) -> Result<(), TlsError> {
        self.require_stage(KeyScheduleStage::EarlySecret, "derive_handshake_secret")?;
        let empty = self.empty_hash(provider)?;
        let mut salt = derive_secret(provider, self.alg, &self.current_secret, b"derived", &empty)?;
        let zero_ikm = vec![0u8; self.alg.output_size()];
        let ikm = if dhe.is_empty() { &zero_ikm[..] } else { dhe };
        self.current_secret.zeroize();
        self.current_secret = provider.hkdf_extract(self.alg, &salt, ikm)?;
        salt.zeroize();
        self.stage = KeyScheduleStage::HandshakeSecret;
        Ok(())
    }

    /// `(client_hs_traffic_secret, server_hs_traffic_secret)` at
    /// Hash(CH..SH).
    pub fn derive_handshake_traffic_secrets(
        &self,
        provider: &dyn CryptoProvider,
        transcript_hash: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), TlsError> {
        self.require_stage(
            KeyScheduleStage::HandshakeSecret,
            "derive_handshake_traffic_secrets",
        )?;
        let client = derive_secret(
            provider,
            self.alg,
            &self.current_secret,
            b"c hs traffic",
            transcript_hash,
        )?;
        let server = derive_secret(
            provider,
            self.alg,
            &self.current_secret,
            b"s hs traffic",
            transcript_hash,
        )?;
        Ok((client, server))
    }

    /// Master Secret = HKDF-Extract(Derive-Secret(HS, "derived", ""), 0).
    pub fn derive_master_secret(&mut self, provider: &dyn CryptoProvider) -> Result<(), TlsError> {
        self.require_stage(KeyScheduleStage::HandshakeSecret, "derive_master_secret")?;
        let empty = self.empty_hash(provider)?;
        let mut salt = derive_secret(provider, self.alg, &self.current_secret, b"derived", &empty)?;
        let zero_ikm = vec![0u8; self.alg.output_size()];
        self.current_secret.zeroize();
        self.current_secret = provider.hkdf_extract(self.alg, &salt, &zero_ikm)?;
        salt.zeroize();
        self.stage = KeyScheduleStage::MasterSecret;
        Ok(())
    }

    /// `(client_ap_traffic_secret, server_ap_traffic_secret)` at
    /// Hash(CH..server Finished).
    pub fn derive_app_traffic_secrets(
        &self,
        provider: &dyn CryptoProvider,
        transcript_hash: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), TlsError> {
        self.require_stage(KeyScheduleStage::MasterSecret, "derive_app_traffic_secrets")?;
        let client = derive_secret(
            provider,
            self.alg,
            &self.current_secret,
            b"c ap traffic",
            transcript_hash,
        )?;
        let server = derive_secret(
            provider,
            self.alg,
            &self.current_secret,
            b"s ap traffic",
            transcript_hash,
        )?;
        Ok((client, server))
    }

    /// Exporter master secret at Hash(CH..server Finished).
    pub fn derive_exporter_master_secret(
        &self,
        provider: &dyn CryptoProvider,
        transcript_hash: &[u8],
    ) -> Result<Vec<u8>, TlsError> {
        self.require_stage(
            KeyScheduleStage::MasterSecret,
            "derive_exporter_master_secret",
        )?;
        derive_secret(
            provider,
            self.alg,
            &self.current_secret,
            b"exp master",
            transcript_hash,
        )
    }

    /// Resumption master secret at Hash(CH..client Finished).
    pub fn derive_resumption_master_secret(
        &self,
        provider: &dyn CryptoProvider,
        transcript_hash: &[u8],
    ) -> Result<Vec<u8>, TlsError> {
        self.require_stage(
            KeyScheduleStage::MasterSecret,
            "derive_resumption_master_secret",
        )?;
        derive_secret(
            provider,
            self.alg,
            &self.current_secret,
            b"res master",
            transcript_hash,
        )
    }

    /// `finished_key = HKDF-Expand-Label(base_key, "finished", "", Hash.length)`.
    pub fn derive_finished_key(
        &self,
        provider: &dyn CryptoProvider,
        base_key: &[u8],
    ) -> Result<Vec<u8>, TlsError> {
        hkdf_expand_label(
            provider,
            self.alg,
            base_key,
            b"finished",
            b"",
            self.alg.output_size(),
        )
    }

    /// `verify_data = HMAC(finished_key, transcript_hash)`.
    pub fn compute_finished_verify_data(
        &self,
        provider: &dyn CryptoProvider,
        finished_key: &[u8],
        transcript_hash: &[u8],
    ) -> Result<Vec<u8>, TlsError> {
        provider
            .hmac(self.alg, finished_key, transcript_hash)
            .map_err(TlsError::from)
    }

    /// Resumption PSK for a NewSessionTicket nonce.
    pub fn derive_resumption_psk(
        &self,
        provider: &dyn CryptoProvider,
        rms: &[u8],
        nonce: &[u8],
    ) -> Result<Vec<u8>, TlsError> {
        hkdf_expand_label(
            provider,
            self.alg,
            rms,
            b"resumption",
            nonce,
            self.alg.output_size(),
        )
    }
}

/// `new_secret = HKDF-Expand-Label(secret, "traffic upd", "", Hash.length)`
/// for post-handshake KeyUpdate; stateless so rekey never reopens a
/// handshake workspace.
pub fn update_traffic_secret(
    provider: &dyn CryptoProvider,
    alg: HashAlg,
    current: &[u8],
) -> Result<Vec<u8>, TlsError> {
    hkdf_expand_label(
        provider,
        alg,
        current,
        b"traffic upd",
        b"",
        alg.output_size(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;
    use crate::CipherSuite;

    fn schedule() -> (MockProvider, KeySchedule) {
        let params = CipherSuiteParams::from_suite(CipherSuite::TLS_AES_128_GCM_SHA256).unwrap();
        (MockProvider::new(), KeySchedule::new(&params))
    }

    #[test]
    fn test_stage_enforcement() {
        let (p, mut ks) = schedule();
        assert!(ks.derive_handshake_secret(&p, b"dhe").is_err());
        assert!(ks.derive_master_secret(&p).is_err());
        assert!(ks.derive_handshake_traffic_secrets(&p, &[0; 32]).is_err());
        assert!(ks.derive_app_traffic_secrets(&p, &[0; 32]).is_err());

        ks.derive_early_secret(&p, None).unwrap();
        assert_eq!(ks.stage(), KeyScheduleStage::EarlySecret);
        ks.derive_handshake_secret(&p, b"shared").unwrap();
        assert_eq!(ks.stage(), KeyScheduleStage::HandshakeSecret);
        ks.derive_master_secret(&p).unwrap();
        assert_eq!(ks.stage(), KeyScheduleStage::MasterSecret);
    }

    #[test]
    fn test_schedule_is_deterministic() {
        let run = || {
            let (p, mut ks) = schedule();
            ks.derive_early_secret(&p, Some(b"psk-bytes")).unwrap();
            ks.derive_handshake_secret(&p, b"dhe-shared").unwrap();
            let hs = ks
                .derive_handshake_traffic_secrets(&p, &[0xAB; 32])
                .unwrap();
            ks.derive_master_secret(&p).unwrap();
            let ap = ks.derive_app_traffic_secrets(&p, &[0xCD; 32]).unwrap();
            (hs, ap)
        };
        assert_eq!(run().0, run().0);
        assert_eq!(run().1, run().1);
    }

    #[test]
    fn test_client_server_secrets_differ() {
        let (p, mut ks) = schedule();
        ks.derive_early_secret(&p, None).unwrap();
        ks.derive_handshake_secret(&p, b"dhe").unwrap();
        let (c, s) = ks.derive_handshake_traffic_secrets(&p, &[1; 32]).unwrap();
        assert_ne!(c, s);
        assert_eq!(c.len(), 32);
        assert_eq!(s.len(), 32);
    }

    #[test]
    fn test_psk_changes_early_secret_chain() {
        let (p, mut a) = schedule();
        let (_, mut b) = schedule();
        a.derive_early_secret(&p, None).unwrap();
        b.derive_early_secret(&p, Some(b"external-psk")).unwrap();
        a.derive_handshake_secret(&p, b"").unwrap();
        b.derive_handshake_secret(&p, b"").unwrap();
        let sa = a.derive_handshake_traffic_secrets(&p, &[9; 32]).unwrap();
        let sb = b.derive_handshake_traffic_secrets(&p, &[9; 32]).unwrap();
        assert_ne!(sa.0, sb.0);
    }

    #[test]
    fn test_binder_key_labels_differ() {
        let (p, mut ks) = schedule();
        ks.derive_early_secret(&p, Some(b"psk")).unwrap();
        let ext = ks.derive_binder_key(&p, true).unwrap();
        let res = ks.derive_binder_key(&p, false).unwrap();
        assert_ne!(ext, res);
    }

    #[test]
    fn test_finished_key_and_verify_data() {
        let (p, ks) = schedule();
        let fk = ks.derive_finished_key(&p, &[0x11; 32]).unwrap();
        assert_eq!(fk.len(), 32);
        let vd = ks
            .compute_finished_verify_data(&p, &fk, &[0x22; 32])
            .unwrap();
        assert_eq!(vd.len(), 32);
        // Deterministic
        assert_eq!(
            vd,
            ks.compute_finished_verify_data(&p, &fk, &[0x22; 32])
                .unwrap()
        );
    }

    #[test]
    fn test_update_traffic_secret_changes_value() {
        let p = MockProvider::new();
        let cur = vec![0x33; 32];
        let next = update_traffic_secret(&p, HashAlg::Sha256, &cur).unwrap();
        assert_eq!(next.len(), 32);
        assert_ne!(next, cur);
        // Chain twice — still moving forward.
        let next2 = update_traffic_secret(&p, HashAlg::Sha256, &next).unwrap();
        assert_ne!(next2, next);
    }

    #[test]
    fn test_resumption_psk_depends_on_nonce() {
        let (p, ks) = schedule();
        let rms = vec![0x44; 32];
        let a = ks.derive_resumption_psk(&p, &rms, &[0]).unwrap();
        let b = ks.derive_resumption_psk(&p, &rms, &[1]).unwrap();
        assert_ne!(a, b);
    }
}
