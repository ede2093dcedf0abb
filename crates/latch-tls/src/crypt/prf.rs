//! TLS 1.2 / TLCP pseudo-random function (RFC 5246 §5) and the
//! derivations built on it: master secret, extended master secret,
//! key block, and Finished verify_data.

use latch_types::{HashAlg, TlsError};
use zeroize::Zeroize;

use crate::provider::CryptoProvider;

/// Finished verify_data length (RFC 5246 §7.4.9).
pub const VERIFY_DATA_LEN: usize = 12;

/// Master secret length (RFC 5246 §8.1).
pub const MASTER_SECRET_LEN: usize = 48;

/// `PRF(secret, label, seed)` = P_hash(secret, label || seed).
pub fn prf(
    provider: &dyn CryptoProvider,
    alg: HashAlg,
    secret: &[u8],
    label: &[u8],
    seed: &[u8],
    out_len: usize,
) -> Result<Vec<u8>, TlsError> {
    let mut label_seed = Vec::with_capacity(label.len() + seed.len());
    label_seed.extend_from_slice(label);
    label_seed.extend_from_slice(seed);

    // P_hash: A(0) = label_seed; A(i) = HMAC(secret, A(i-1));
    // output += HMAC(secret, A(i) || label_seed)
    let mut out = Vec::with_capacity(out_len);
    let mut a = provider.hmac(alg, secret, &label_seed)?;
    while out.len() < out_len {
        let mut block_input = Vec::with_capacity(a.len() + label_seed.len());
        block_input.extend_from_slice(&a);
        block_input.extend_from_slice(&label_seed);
        let block = provider.hmac(alg, secret, &block_input)?;
        out.extend_from_slice(&block);
        a = provider.hmac(alg, secret, &a)?;
    }
    out.truncate(out_len);
    Ok(out)
}

/// `master_secret = PRF(pre_master, "master secret", client_random || server_random)`.
pub fn master_secret(
    provider: &dyn CryptoProvider,
    alg: HashAlg,
    pre_master: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> Result<Vec<u8>, TlsError> {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(client_random);
    seed.extend_from_slice(server_random);
    prf(
        provider,
        alg,
        pre_master,
        b"master secret",
        &seed,
        MASTER_SECRET_LEN,
    )
}

/// RFC 7627 extended master secret, bound to the session transcript
/// hash instead of the randoms.
pub fn extended_master_secret(
    provider: &dyn CryptoProvider,
    alg: HashAlg,
    pre_master: &[u8],
    session_hash: &[u8],
) -> Result<Vec<u8>, TlsError> {
    prf(
        provider,
        alg,
        pre_master,
        b"extended master secret",
        session_hash,
        MASTER_SECRET_LEN,
    )
}

/// `key_block = PRF(master, "key expansion", server_random || client_random)`.
pub fn key_block(
    provider: &dyn CryptoProvider,
    alg: HashAlg,
    master: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    out_len: usize,
) -> Result<Vec<u8>, TlsError> {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(server_random);
    seed.extend_from_slice(client_random);
    prf(provider, alg, master, b"key expansion", &seed, out_len)
}

/// One direction's slice of the key block:
/// `(mac_key, key, fixed_iv)` for client-write or server-write.
pub fn partition_key_block(
    block: &[u8],
    mac_key_len: usize,
    key_len: usize,
    iv_len: usize,
    client_side: bool,
) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), TlsError> {
    let need = 2 * (mac_key_len + key_len + iv_len);
    if block.len() < need {
        return Err(TlsError::Internal("key block too short".into()));
    }
    let pick = |offset_client: usize, offset_server: usize, len: usize| {
        let off = if client_side {
            offset_client
        } else {
            offset_server
        };
        block[off..off + len].to_vec()
    };
    let mac = pick(0, mac_key_len, mac_key_len);
    let key = pick(2 * mac_key_len, 2 * mac_key_len + key_len, key_len);
    let iv_base = 2 * (mac_key_len + key_len);
    let iv = pick(iv_base, iv_base + iv_len, iv_len);
    Ok((mac, key, iv))
}

/// Finished verify_data: `PRF(master, label, Hash(transcript))[..12]`.
pub fn verify_data(
    provider: &dyn CryptoProvider,
    alg: HashAlg,
    master: &[u8],
    client_side: bool,
    transcript_hash: &[u8],
) -> Result<Vec<u8>, TlsError> {
    let label: &[u8] = if client_side {
        b"client finished"
    } else {
        b"server finished"
    };
    prf(
        provider,
        alg,
        master,
        label,
        transcript_hash,
        VERIFY_DATA_LEN,
    )
}

/// A master secret holder that zeroizes on drop.
pub struct MasterSecret(pub Vec<u8>);

impl Drop for MasterSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}
