// CredentialVault: encrypted persistence of the access credential
// Ciphertext, expiry and integrity digest are one atomic logical unit;
// any inconsistency reads as "no credential"

use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::CryptoConfig;
use crate::crypto::{digest, TokenCipher};
use crate::error::Result;
use crate::storage::{
    StoreChange, TokenStore, ALL_KEYS, KEY_ACCESS_TOKEN, KEY_REFRESH_MARKER, KEY_TOKEN_DIGEST,
    KEY_TOKEN_EXPIRY,
};

/// Encrypts, persists and integrity-checks the access credential.
///
/// Read paths never raise crypto or storage errors; they degrade to
/// "credential absent" and log. Write paths propagate persistence failures.
pub struct CredentialVault {
    store: Arc<dyn TokenStore>,
    cipher: Option<TokenCipher>,

    /// Latched when sealing fails and plaintext fallback is allowed;
    /// stays set for the rest of the session
    encryption_disabled: AtomicBool,
    allow_plaintext_fallback: bool,
}

impl CredentialVault {
    /// Build the vault, deriving the encryption key eagerly.
    ///
    /// If key derivation fails and `allow_plaintext_fallback` is set, the
    /// vault starts with encryption disabled and logs an audit event;
    /// otherwise construction fails.
    pub fn new(store: Arc<dyn TokenStore>, crypto: &CryptoConfig) -> Result<Self> {
        let (cipher, disabled) = match TokenCipher::new(crypto) {
            Ok(cipher) => (Some(cipher), false),
            Err(e) if crypto.allow_plaintext_fallback => {
                tracing::warn!(
                    error = %e,
                    "AUDIT: token encryption unavailable, falling back to plaintext storage for this session"
                );
                (None, true)
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            store,
            cipher,
            encryption_disabled: AtomicBool::new(disabled),
            allow_plaintext_fallback: crypto.allow_plaintext_fallback,
        })
    }

    /// Whether tokens are currently being encrypted at rest
    pub fn encryption_active(&self) -> bool {
        !self.encryption_disabled.load(Ordering::Relaxed)
    }

    /// Persist the access token with an absolute expiry and an integrity
    /// digest computed over the plaintext.
    pub fn store_access_token(&self, token: &str, expires_in_secs: i64) -> Result<()> {
        let expiry_ms = Utc::now().timestamp_millis() + expires_in_secs * 1000;

        let stored_value = match self.active_cipher() {
            Some(cipher) => match cipher.seal(token) {
                Ok(sealed) => sealed,
                Err(e) if self.allow_plaintext_fallback => {
                    self.encryption_disabled.store(true, Ordering::Relaxed);
                    tracing::warn!(
                        error = %e,
                        "AUDIT: token encryption failed, storing plaintext for the rest of this session"
                    );
                    token.to_string()
                }
                Err(e) => return Err(e),
            },
            None => token.to_string(),
        };

        self.store.set(KEY_TOKEN_DIGEST, &digest(token))?;
        self.store.set(KEY_TOKEN_EXPIRY, &expiry_ms.to_string())?;
        self.store.set(KEY_ACCESS_TOKEN, &stored_value)?;

        tracing::debug!(expires_in_secs, "access token stored");
        Ok(())
    }

    /// Retrieve the access token, or `None` if it is missing, expired or
    /// fails integrity checks.
    ///
    /// Expiry is enforced passively here: a read past the expiry purges the
    /// credential entries. Decrypt failure or digest mismatch is treated as
    /// tampering and purges everything.
    pub fn get_access_token(&self) -> Option<String> {
        let ciphertext = self.read_entry(KEY_ACCESS_TOKEN)?;
        let expiry_raw = self.read_entry(KEY_TOKEN_EXPIRY)?;

        let expired = match expiry_raw.parse::<i64>() {
            Ok(expiry_ms) => Utc::now().timestamp_millis() > expiry_ms,
            // Unparseable expiry is conservatively expired
            Err(_) => true,
        };
        if expired {
            tracing::debug!("access token expired, purging credential entries");
            self.purge_access_entries();
            return None;
        }

        let plaintext = match self.active_cipher() {
            Some(cipher) => match cipher.open(&ciphertext) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    tracing::warn!(error = %e, "AUDIT: stored token failed to decrypt, treating as tampered");
                    self.clear_tokens();
                    return None;
                }
            },
            None => ciphertext,
        };

        match self.read_entry(KEY_TOKEN_DIGEST) {
            Some(stored_digest) if stored_digest == digest(&plaintext) => Some(plaintext),
            _ => {
                tracing::warn!("AUDIT: token integrity digest mismatch, treating as tampered");
                self.clear_tokens();
                None
            }
        }
    }

    /// Persist only an existence marker (a hash) for the refresh token.
    /// The raw value never touches client-readable storage.
    pub fn store_refresh_token_reference(&self, token: &str) -> Result<()> {
        self.store.set(KEY_REFRESH_MARKER, &digest(token))
    }

    /// Do we believe a refresh token exists?
    pub fn has_refresh_token(&self) -> bool {
        matches!(self.store.get(KEY_REFRESH_MARKER), Ok(Some(_)))
    }

    /// Delete every namespaced entry. Idempotent; storage errors are logged,
    /// not raised.
    pub fn clear_tokens(&self) {
        for key in ALL_KEYS {
            if let Err(e) = self.store.remove(key) {
                tracing::warn!(key, error = %e, "failed to remove credential entry");
            }
        }
    }

    /// Whether the stored expiry has passed. Missing or unparseable expiry
    /// reads as expired.
    pub fn is_access_token_expired(&self) -> bool {
        match self.read_entry(KEY_TOKEN_EXPIRY).map(|s| s.parse::<i64>()) {
            Some(Ok(expiry_ms)) => Utc::now().timestamp_millis() >= expiry_ms,
            _ => true,
        }
    }

    /// Time remaining until expiry; zero when absent, unparseable or passed
    pub fn time_until_expiry(&self) -> Duration {
        match self.read_entry(KEY_TOKEN_EXPIRY).map(|s| s.parse::<i64>()) {
            Some(Ok(expiry_ms)) => {
                let remaining = expiry_ms - Utc::now().timestamp_millis();
                Duration::milliseconds(remaining.max(0))
            }
            _ => Duration::zero(),
        }
    }

    /// Change events from the backing store, for cross-context freshness hints
    pub fn watch_store(&self) -> broadcast::Receiver<StoreChange> {
        self.store.watch()
    }

    fn active_cipher(&self) -> Option<&TokenCipher> {
        if self.encryption_disabled.load(Ordering::Relaxed) {
            None
        } else {
            self.cipher.as_ref()
        }
    }

    /// Read path helper: storage errors degrade to absent
    fn read_entry(&self, key: &str) -> Option<String> {
        match self.store.get(key) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, error = %e, "storage read failed, treating entry as absent");
                None
            }
        }
    }

    /// Remove the access credential unit (token, expiry, digest), leaving the
    /// refresh marker alone
    fn purge_access_entries(&self) {
        for key in [KEY_ACCESS_TOKEN, KEY_TOKEN_EXPIRY, KEY_TOKEN_DIGEST] {
            if let Err(e) = self.store.remove(key) {
                tracing::warn!(key, error = %e, "failed to remove credential entry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn crypto_config() -> CryptoConfig {
        CryptoConfig {
            secret: "vault-test-secret".to_string(),
            salt: "vault-test-salt".to_string(),
            pbkdf2_iterations: crate::config::MIN_PBKDF2_ITERATIONS,
            allow_plaintext_fallback: false,
        }
    }

    fn vault() -> (CredentialVault, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let vault = CredentialVault::new(store.clone(), &crypto_config()).unwrap();
        (vault, store)
    }

    #[test]
    fn test_store_then_get_roundtrip() {
        let (vault, _) = vault();
        vault.store_access_token("bearer-token-xyz", 3600).unwrap();
        assert_eq!(
            vault.get_access_token(),
            Some("bearer-token-xyz".to_string())
        );
    }

    #[test]
    fn test_token_is_encrypted_at_rest() {
        let (vault, store) = vault();
        vault.store_access_token("bearer-token-xyz", 3600).unwrap();

        let at_rest = store.get(KEY_ACCESS_TOKEN).unwrap().unwrap();
        assert_ne!(at_rest, "bearer-token-xyz");
        assert!(!at_rest.contains("bearer-token-xyz"));
    }

    #[test]
    fn test_absent_when_nothing_stored() {
        let (vault, _) = vault();
        assert_eq!(vault.get_access_token(), None);
        assert!(vault.is_access_token_expired());
        assert_eq!(vault.time_until_expiry(), Duration::zero());
    }

    #[test]
    fn test_tampered_ciphertext_purges_everything() {
        let (vault, store) = vault();
        vault.store_access_token("bearer-token-xyz", 3600).unwrap();
        vault.store_refresh_token_reference("refresh-abc").unwrap();

        // Flip one byte of the persisted ciphertext
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;
        let sealed = store.get(KEY_ACCESS_TOKEN).unwrap().unwrap();
        let mut bytes = BASE64.decode(sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        store.set(KEY_ACCESS_TOKEN, &BASE64.encode(bytes)).unwrap();

        assert_eq!(vault.get_access_token(), None);

        // No residual entries
        for key in ALL_KEYS {
            assert_eq!(store.get(key).unwrap(), None, "residual entry: {key}");
        }
    }

    #[test]
    fn test_digest_mismatch_purges_everything() {
        let (vault, store) = vault();
        vault.store_access_token("bearer-token-xyz", 3600).unwrap();

        store
            .set(KEY_TOKEN_DIGEST, &crate::crypto::digest("other-token"))
            .unwrap();

        assert_eq!(vault.get_access_token(), None);
        assert_eq!(store.get(KEY_ACCESS_TOKEN).unwrap(), None);
    }

    #[test]
    fn test_passive_expiry_purges_on_read() {
        let (vault, store) = vault();
        vault.store_access_token("bearer-token-xyz", 3600).unwrap();

        // Rewind the stored expiry into the past
        let past = Utc::now().timestamp_millis() - 1_000;
        store.set(KEY_TOKEN_EXPIRY, &past.to_string()).unwrap();

        assert!(vault.is_access_token_expired());
        assert_eq!(vault.get_access_token(), None);
        assert_eq!(store.get(KEY_ACCESS_TOKEN).unwrap(), None);
        assert_eq!(store.get(KEY_TOKEN_EXPIRY).unwrap(), None);
        assert_eq!(store.get(KEY_TOKEN_DIGEST).unwrap(), None);
    }

    #[test]
    fn test_unparseable_expiry_is_expired() {
        let (vault, store) = vault();
        vault.store_access_token("bearer-token-xyz", 3600).unwrap();
        store.set(KEY_TOKEN_EXPIRY, "not-a-number").unwrap();

        assert!(vault.is_access_token_expired());
        assert_eq!(vault.time_until_expiry(), Duration::zero());
        assert_eq!(vault.get_access_token(), None);
    }

    #[test]
    fn test_time_until_expiry_tracks_stored_value() {
        let (vault, _) = vault();
        vault.store_access_token("bearer-token-xyz", 600).unwrap();

        let remaining = vault.time_until_expiry();
        assert!(remaining > Duration::seconds(590));
        assert!(remaining <= Duration::seconds(600));
        assert!(!vault.is_access_token_expired());
    }

    #[test]
    fn test_refresh_marker_is_hash_only() {
        let (vault, store) = vault();
        assert!(!vault.has_refresh_token());

        vault
            .store_refresh_token_reference("raw-refresh-token")
            .unwrap();
        assert!(vault.has_refresh_token());

        let marker = store.get(KEY_REFRESH_MARKER).unwrap().unwrap();
        assert_ne!(marker, "raw-refresh-token");
        assert_eq!(marker, crate::crypto::digest("raw-refresh-token"));
    }

    #[test]
    fn test_clear_tokens_removes_everything() {
        let (vault, _) = vault();
        vault.store_access_token("bearer-token-xyz", 3600).unwrap();
        vault.store_refresh_token_reference("refresh-abc").unwrap();

        vault.clear_tokens();

        assert_eq!(vault.get_access_token(), None);
        assert!(!vault.has_refresh_token());
        assert!(vault.is_access_token_expired());

        // Idempotent
        vault.clear_tokens();
    }

    #[test]
    fn test_plaintext_fallback_latches_when_allowed() {
        // An unusable crypto config with fallback enabled degrades to
        // plaintext storage instead of failing construction
        let config = CryptoConfig {
            secret: String::new(),
            salt: "salt".to_string(),
            pbkdf2_iterations: crate::config::MIN_PBKDF2_ITERATIONS,
            allow_plaintext_fallback: true,
        };
        let store = Arc::new(MemoryStore::new());
        let vault = CredentialVault::new(store.clone(), &config).unwrap();
        assert!(!vault.encryption_active());

        vault.store_access_token("bearer-token-xyz", 3600).unwrap();
        assert_eq!(
            store.get(KEY_ACCESS_TOKEN).unwrap(),
            Some("bearer-token-xyz".to_string())
        );
        assert_eq!(
            vault.get_access_token(),
            Some("bearer-token-xyz".to_string())
        );
    }

    #[test]
    fn test_unusable_crypto_without_fallback_fails_construction() {
        let config = CryptoConfig {
            secret: String::new(),
            salt: "salt".to_string(),
            pbkdf2_iterations: crate::config::MIN_PBKDF2_ITERATIONS,
            allow_plaintext_fallback: false,
        };
        let store = Arc::new(MemoryStore::new());
        assert!(CredentialVault::new(store, &config).is_err());
    }
}
