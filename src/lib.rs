// credlock - client-side credential lifecycle manager
//
// Three components, leaves first: CredentialVault encrypts and persists the
// access credential; RefreshCoordinator keeps it fresh with a recurring
// expiry check and single-flight refresh; AuthBroadcaster derives the single
// authoritative "authenticated" boolean and fans out state changes.

pub mod config;
pub mod crypto;
pub mod error;
pub mod refresher;
pub mod state;
pub mod storage;
pub mod vault;

use std::sync::Arc;

pub use config::{AuthConfig, CryptoConfig};
pub use error::{AuthError, Result};
pub use refresher::RefreshCoordinator;
pub use state::{AuthBroadcaster, Subscription};
pub use storage::{MemoryStore, SqliteStore, StoreChange, TokenStore};
pub use vault::CredentialVault;

/// The wired-up subsystem, constructed once at application start and handed
/// to consumers by reference.
pub struct AuthStack {
    pub vault: Arc<CredentialVault>,
    pub refresher: Arc<RefreshCoordinator>,
    pub broadcaster: Arc<AuthBroadcaster>,
}

impl AuthStack {
    /// Start background work and establish the initial auth state
    pub async fn init(&self) {
        self.broadcaster.init().await;
    }

    /// Stop background work; an in-flight refresh still completes
    pub fn shutdown(&self) {
        self.broadcaster.shutdown();
    }
}

/// Construct the three components in dependency order over the given store.
pub fn bootstrap(config: &AuthConfig, store: Arc<dyn TokenStore>) -> Result<AuthStack> {
    config.validate()?;

    let vault = Arc::new(CredentialVault::new(store, &config.crypto)?);
    let refresher = Arc::new(RefreshCoordinator::new(Arc::clone(&vault), config)?);
    let broadcaster = Arc::new(AuthBroadcaster::new(
        Arc::clone(&vault),
        Arc::clone(&refresher),
        config,
    )?);

    Ok(AuthStack {
        vault,
        refresher,
        broadcaster,
    })
}

/// Convenience: bootstrap over the SQLite store at the configured path.
pub fn bootstrap_default(config: &AuthConfig) -> Result<AuthStack> {
    let store = Arc::new(SqliteStore::open(&config.resolved_store_path())?);
    bootstrap(config, store)
}
