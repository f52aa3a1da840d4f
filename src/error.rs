// Error handling module
// Defines the credential lifecycle error taxonomy

use thiserror::Error;

/// Errors that can occur across the credential lifecycle.
///
/// The enum is `Clone` so a single refresh outcome can be handed to every
/// caller awaiting the same in-flight operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    /// Invalid or incomplete configuration, rejected at construction
    #[error("configuration error: {0}")]
    Config(String),

    /// The cipher could not be built or used and plaintext fallback is disabled
    #[error("encryption unavailable: {0}")]
    EncryptionUnavailable(String),

    /// Stored ciphertext could not be decrypted (treated as tampering)
    #[error("decryption failed: {0}")]
    DecryptionFailure(String),

    /// Digest over the decrypted token does not match the stored digest
    #[error("stored token failed integrity check")]
    IntegrityMismatch,

    /// The refresh endpoint rejected the refresh token (401-class).
    /// Terminal: credentials are purged and the user must re-authenticate.
    #[error("refresh token expired or revoked")]
    RefreshTokenExpired,

    /// Refresh failed for a retryable reason (network, 5xx).
    /// Credentials are left intact; callers should try again later.
    #[error("token refresh failed: {0}")]
    RefreshTransient(String),

    /// The verification endpoint rejected the access token
    #[error("token verification failed: {0}")]
    VerificationFailure(String),

    /// Persistent store I/O failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl AuthError {
    /// Whether the caller may retry the failed operation without
    /// re-authenticating.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::RefreshTransient(_) | AuthError::Storage(_))
    }
}

impl From<rusqlite::Error> for AuthError {
    fn from(err: rusqlite::Error) -> Self {
        AuthError::Storage(err.to_string())
    }
}

/// Result type alias for credential lifecycle operations
pub type Result<T> = std::result::Result<T, AuthError>;
