//! Finished, CertificateVerify, and PSK binder computation/checks.
//!
//! Every secret-dependent comparison goes through the provider's
//! constant-time equality; a mismatch surfaces as `decrypt_error`.

use latch_types::{HashAlg, TlsError};
use zeroize::Zeroize;

use crate::crypt::key_schedule::{hkdf_expand_label, KeySchedule};
use crate::crypt::prf;
use crate::crypt::CipherSuiteParams;
use crate::provider::CryptoProvider;

/// Context strings for TLS 1.3 CertificateVerify (RFC 8446 §4.4.3).
const CV_SERVER_CONTEXT: &[u8] = b"TLS 1.3, server CertificateVerify";
const CV_CLIENT_CONTEXT: &[u8] = b"TLS 1.3, client CertificateVerify";

/// Build the TLS 1.3 CertificateVerify signature payload:
/// 64 spaces || context string || 0x00 || transcript_hash.
pub fn tls13_certificate_verify_payload(server: bool, transcript_hash: &[u8]) -> Vec<u8> {
    let context = if server {
        CV_SERVER_CONTEXT
    } else {
        CV_CLIENT_CONTEXT
    };
    let mut out = Vec::with_capacity(64 + context.len() + 1 + transcript_hash.len());
    out.extend_from_slice(&[0x20; 64]);
    out.extend_from_slice(context);
    out.push(0);
    out.extend_from_slice(transcript_hash);
    out
}

/// The payload a ≤1.2 ServerKeyExchange signature covers:
/// client_random || server_random || params.
pub fn signed_params_payload(
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    params: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + params.len());
    out.extend_from_slice(client_random);
    out.extend_from_slice(server_random);
    out.extend_from_slice(params);
    out
}

// ---------------------------------------------------------------------------
// TLS 1.3 Finished
// ---------------------------------------------------------------------------

/// Compute TLS 1.3 Finished verify_data from a traffic secret.
pub fn compute_finished13(
    provider: &dyn CryptoProvider,
    schedule: &KeySchedule,
    base_secret: &[u8],
    transcript_hash: &[u8],
) -> Result<Vec<u8>, TlsError> {
    let mut finished_key = schedule.derive_finished_key(provider, base_secret)?;
    let out = schedule.compute_finished_verify_data(provider, &finished_key, transcript_hash);
    finished_key.zeroize();
    out
}

/// Check a received TLS 1.3 Finished in constant time.
pub fn check_finished13(
    provider: &dyn CryptoProvider,
    schedule: &KeySchedule,
    base_secret: &[u8],
    transcript_hash: &[u8],
    received: &[u8],
) -> Result<(), TlsError> {
    let expected = compute_finished13(provider, schedule, base_secret, transcript_hash)?;
    if !provider.ct_eq(&expected, received) {
        return Err(TlsError::DecryptError("Finished verify_data".into()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// TLS ≤1.2 Finished
// ---------------------------------------------------------------------------

/// Check a received ≤1.2 Finished in constant time.
pub fn check_finished12(
    provider: &dyn CryptoProvider,
    alg: HashAlg,
    master_secret: &[u8],
    client_side: bool,
    transcript_hash: &[u8],
    received: &[u8],
) -> Result<(), TlsError> {
    let expected = prf::verify_data(provider, alg, master_secret, client_side, transcript_hash)?;
    if !provider.ct_eq(&expected, received) {
        return Err(TlsError::DecryptError("Finished verify_data".into()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// PSK binders
// ---------------------------------------------------------------------------

/// Compute the binder for one PSK over the truncated-ClientHello
/// transcript hash. External and resumption PSKs use different labels
/// in the key schedule.
pub fn compute_binder(
    provider: &dyn CryptoProvider,
    params: &CipherSuiteParams,
    psk: &[u8],
    external: bool,
    truncated_transcript_hash: &[u8],
) -> Result<Vec<u8>, TlsError> {
    let mut schedule = KeySchedule::new(params);
    schedule.derive_early_secret(provider, Some(psk))?;
    let mut binder_key = schedule.derive_binder_key(provider, external)?;
    let mut finished_key = hkdf_expand_label(
        provider,
        params.hash,
        &binder_key,
        b"finished",
        b"",
        params.hash_len(),
    )?;
    let out = provider
        .hmac(params.hash, &finished_key, truncated_transcript_hash)
        .map_err(TlsError::from);
    binder_key.zeroize();
    finished_key.zeroize();
    out
}

/// Verify a received binder in constant time; mismatch is a fatal
/// `decrypt_error`.
pub fn check_binder(
    provider: &dyn CryptoProvider,
    params: &CipherSuiteParams,
    psk: &[u8],
    external: bool,
    truncated_transcript_hash: &[u8],
    received: &[u8],
) -> Result<(), TlsError> {
    let expected = compute_binder(provider, params, psk, external, truncated_transcript_hash)?;
    if !provider.ct_eq(&expected, received) {
        return Err(TlsError::DecryptError("psk binder".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;
    use crate::CipherSuite;

    fn params() -> CipherSuiteParams {
        CipherSuiteParams::from_suite(CipherSuite::TLS_AES_128_GCM_SHA256).unwrap()
    }

    #[test]
    fn test_cv_payload_layout() {
        let hash = [0x7E; 32];
        let payload = tls13_certificate_verify_payload(true, &hash);
        assert_eq!(&payload[..64], &[0x20; 64]);
        assert!(payload.windows(CV_SERVER_CONTEXT.len()).any(|w| w == CV_SERVER_CONTEXT));
        assert_eq!(payload[64 + CV_SERVER_CONTEXT.len()], 0);
        assert_eq!(&payload[payload.len() - 32..], &hash);

        let client = tls13_certificate_verify_payload(false, &hash);
        assert_ne!(payload, client);
    }

    #[test]
    fn test_signed_params_payload() {
        let payload = signed_params_payload(&[1; 32], &[2; 32], &[3, 4, 5]);
        assert_eq!(payload.len(), 67);
        assert_eq!(&payload[..32], &[1; 32]);
        assert_eq!(&payload[32..64], &[2; 32]);
        assert_eq!(&payload[64..], &[3, 4, 5]);
    }

    #[test]
    fn test_finished13_roundtrip() {
        let p = MockProvider::new();
        let schedule = KeySchedule::new(&params());
        let secret = [0x31; 32];
        let th = [0x42; 32];
        let vd = compute_finished13(&p, &schedule, &secret, &th).unwrap();
        check_finished13(&p, &schedule, &secret, &th, &vd).unwrap();

        let mut bad = vd.clone();
        bad[0] ^= 1;
        assert!(matches!(
            check_finished13(&p, &schedule, &secret, &th, &bad).unwrap_err(),
            TlsError::DecryptError(_)
        ));
    }

    #[test]
    fn test_finished12_roundtrip() {
        let p = MockProvider::new();
        let master = [0x99; 48];
        let th = [0x13; 32];
        let vd = prf::verify_data(&p, HashAlg::Sha256, &master, true, &th).unwrap();
        check_finished12(&p, HashAlg::Sha256, &master, true, &th, &vd).unwrap();
        // Wrong side fails
        assert!(check_finished12(&p, HashAlg::Sha256, &master, false, &th, &vd).is_err());
    }

    #[test]
    fn test_binder_labels_and_check() {
        let p = MockProvider::new();
        let psk = [0xAB; 32];
        let th = [0x11; 32];
        let ext = compute_binder(&p, &params(), &psk, true, &th).unwrap();
        let res = compute_binder(&p, &params(), &psk, false, &th).unwrap();
        assert_ne!(ext, res);
        assert_eq!(ext.len(), 32);

        check_binder(&p, &params(), &psk, true, &th, &ext).unwrap();
        assert!(matches!(
            check_binder(&p, &params(), &psk, true, &th, &res).unwrap_err(),
            TlsError::DecryptError(_)
        ));
        // Binder fails closed on truncated input
        assert!(check_binder(&p, &params(), &psk, true, &th, &ext[..16]).is_err());
    }
}
