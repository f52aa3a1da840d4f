// Token cryptography: PBKDF2-SHA256 key derivation -> AES-256-GCM sealing
// Nonce: 96-bit random per seal, prepended to the ciphertext

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::config::CryptoConfig;
use crate::error::{AuthError, Result};

const NONCE_LEN: usize = 12;

/// AEAD cipher bound to a key derived once from the application secret
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    /// Validate the config and derive the 256-bit key.
    ///
    /// Derivation happens once here, not per call; the intermediate key
    /// buffer is scrubbed after the cipher takes it.
    pub fn new(config: &CryptoConfig) -> Result<Self> {
        config.validate()?;

        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(
            config.secret.as_bytes(),
            config.salt.as_bytes(),
            config.pbkdf2_iterations,
            &mut key,
        );

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        key.zeroize();

        Ok(Self { cipher })
    }

    /// Encrypt a token, returning base64(nonce || ciphertext)
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| AuthError::EncryptionUnavailable(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    /// Decrypt base64(nonce || ciphertext) back to the token.
    /// Any malformed input or tag mismatch is a `DecryptionFailure`.
    pub fn open(&self, encoded: &str) -> Result<String> {
        let sealed = BASE64
            .decode(encoded)
            .map_err(|e| AuthError::DecryptionFailure(format!("invalid encoding: {e}")))?;

        if sealed.len() <= NONCE_LEN {
            return Err(AuthError::DecryptionFailure(
                "sealed value too short".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| AuthError::DecryptionFailure("authentication tag mismatch".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| AuthError::DecryptionFailure("plaintext is not valid UTF-8".to_string()))
    }
}

/// Hex SHA-256 over a token's plaintext bytes.
/// Used both as the integrity digest and as the refresh-token existence marker.
pub fn digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}
