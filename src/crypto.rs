use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use sha2::Sha256;

use crate::{GatewayError, Result};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT: &[u8] = b"openfive-v1";

fn derive_key(master_key: &str) -> Result<[u8; KEY_LEN]> {
    if master_key.len() < 32 {
        return Err(GatewayError::UnsealFailed(
            "master key must be at least 32 characters".to_string(),
        ));
    }
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        master_key[..32].as_bytes(),
        SALT,
        PBKDF2_ITERATIONS,
        &mut key,
    );
    Ok(key)
}

/// Decrypts a base64-encoded `nonce(12) || ciphertext` blob produced by the
/// admin plane's encrypt step. The AES-256 key is derived from the first 32
/// characters of the master key via PBKDF2-HMAC-SHA256.
pub fn unseal(encoded: &str, master_key: &str) -> Result<String> {
    let key = derive_key(master_key)?;

    let combined = BASE64
        .decode(encoded)
        .map_err(|_| GatewayError::UnsealFailed("invalid base64 encoding".to_string()))?;
    if combined.len() < NONCE_LEN {
        return Err(GatewayError::UnsealFailed(
            "ciphertext too short".to_string(),
        ));
    }
    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new(&key.into());
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| {
            GatewayError::UnsealFailed("decryption failed, wrong key or corrupted data".to_string())
        })?;

    String::from_utf8(plaintext)
        .map_err(|_| GatewayError::UnsealFailed("plaintext is not valid UTF-8".to_string()))
}

/// Counterpart of [`unseal`], used by the admin plane when storing provider
/// credentials.
pub fn seal(plaintext: &str, master_key: &str) -> Result<String> {
    let key = derive_key(master_key)?;
    let cipher = Aes256Gcm::new(&key.into());

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
        .map_err(|_| GatewayError::UnsealFailed("encryption failed".to_string()))?;

    let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    packed.extend_from_slice(&nonce_bytes);
    packed.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(packed))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn seal_unseal_round_trip() -> Result<()> {
        let sealed = seal("sk-or-v1-secret", MASTER)?;
        let opened = unseal(&sealed, MASTER)?;
        assert_eq!(opened, "sk-or-v1-secret");
        Ok(())
    }

    #[test]
    fn short_master_key_is_rejected() {
        let err = unseal("AAAA", "too-short").unwrap_err();
        assert!(matches!(err, GatewayError::UnsealFailed(_)));
    }

    #[test]
    fn wrong_key_fails_to_unseal() -> Result<()> {
        let sealed = seal("secret", MASTER)?;
        let other = "ffffffffffffffffffffffffffffffff";
        let err = unseal(&sealed, other).unwrap_err();
        assert!(matches!(err, GatewayError::UnsealFailed(_)));
        Ok(())
    }

    #[test]
    fn garbage_inputs_fail_cleanly() {
        assert!(matches!(
            unseal("not base64!!!", MASTER).unwrap_err(),
            GatewayError::UnsealFailed(_)
        ));
        assert!(matches!(
            unseal("AAAA", MASTER).unwrap_err(),
            GatewayError::UnsealFailed(_)
        ));
    }
}
