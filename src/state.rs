// Authentication state: a single cached boolean with subscriber fan-out
// Tri-state: Unknown until the first check, then Authenticated/Unauthenticated

use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::refresher::RefreshCoordinator;
use crate::storage::ALL_KEYS;
use crate::vault::CredentialVault;

type SubscriberList = Vec<(u64, Arc<dyn Fn(bool) + Send + Sync>)>;

/// Removes one subscriber registration when invoked. Safe to call more than
/// once; later calls are no-ops.
pub struct Subscription {
    id: u64,
    subscribers: Weak<Mutex<SubscriberList>>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(list) = self.subscribers.upgrade() {
            list.lock()
                .expect("subscriber mutex poisoned")
                .retain(|(id, _)| *id != self.id);
        }
    }
}

/// Derives the single authoritative "authenticated" boolean, notifies
/// subscribers on change, and re-evaluates on passive signals (store changes
/// from other contexts, the host's foreground hook).
pub struct AuthBroadcaster {
    inner: Arc<StateInner>,
    refresher: Arc<RefreshCoordinator>,

    /// Store change listener task
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// State shared with the store-change listener task
struct StateInner {
    vault: Arc<CredentialVault>,
    client: Client,
    verify_url: String,

    /// None = Unknown (process start, before the first check)
    authenticated: Mutex<Option<bool>>,
    subscribers: Arc<Mutex<SubscriberList>>,
    next_id: AtomicU64,
}

impl AuthBroadcaster {
    pub fn new(
        vault: Arc<CredentialVault>,
        refresher: Arc<RefreshCoordinator>,
        config: &AuthConfig,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| AuthError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            inner: Arc::new(StateInner {
                vault,
                client,
                verify_url: config.verify_url.clone(),
                authenticated: Mutex::new(None),
                subscribers: Arc::new(Mutex::new(Vec::new())),
                next_id: AtomicU64::new(0),
            }),
            refresher,
            listener: Mutex::new(None),
        })
    }

    /// Run once at startup: start auto refresh, establish the initial state,
    /// and attach the passive store-change listener.
    pub async fn init(&self) {
        self.refresher.start_auto_refresh();
        self.inner.check_authentication().await;
        self.spawn_store_listener();
    }

    /// Stop background work. An in-flight refresh still completes.
    pub fn shutdown(&self) {
        self.refresher.stop_auto_refresh();
        if let Some(handle) = self
            .listener
            .lock()
            .expect("listener mutex poisoned")
            .take()
        {
            handle.abort();
        }
    }

    /// Establish whether the stored credential is currently valid.
    ///
    /// Absent credential: state false, no network. Present: the verification
    /// collaborator decides; any non-2xx or transport error purges the
    /// credentials and reads as unauthenticated.
    pub async fn check_authentication(&self) -> bool {
        self.inner.check_authentication().await
    }

    /// Update the cached state, notifying subscribers only on an actual
    /// transition. Callbacks run synchronously, in subscription order, with
    /// the new value.
    pub fn set_authenticated(&self, value: bool) {
        self.inner.set_authenticated(value);
    }

    /// Register a state-change callback; the returned handle removes exactly
    /// this registration.
    pub fn subscribe(&self, callback: impl Fn(bool) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .expect("subscriber mutex poisoned")
            .push((id, Arc::new(callback)));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.inner.subscribers),
        }
    }

    /// Cached state; never triggers verification. Unknown reads as false.
    pub fn is_authenticated(&self) -> bool {
        self.inner
            .authenticated
            .lock()
            .expect("state mutex poisoned")
            .unwrap_or(false)
    }

    /// Host hook for the visibility signal: re-validate when the app regains
    /// the foreground.
    pub async fn on_foreground(&self) -> bool {
        self.inner.check_authentication().await
    }

    /// React to credential-key changes from other contexts by re-checking.
    /// A hint only: dropped or lagged events are recovered by the next
    /// explicit check.
    fn spawn_store_listener(&self) {
        let mut listener = self.listener.lock().expect("listener mutex poisoned");
        if let Some(existing) = listener.take() {
            existing.abort();
        }

        let inner = Arc::clone(&self.inner);
        let mut rx = inner.vault.watch_store();
        *listener = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => {
                        if !ALL_KEYS.contains(&change.key.as_str()) {
                            continue;
                        }
                        // A credential write lands as several key events;
                        // coalesce the burst into one re-check
                        while rx.try_recv().is_ok() {}
                        tracing::debug!(key = %change.key, "credential entry changed, re-checking auth");
                        inner.check_authentication().await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "store change listener lagged, re-checking auth");
                        inner.check_authentication().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }
}

impl StateInner {
    async fn check_authentication(&self) -> bool {
        let Some(token) = self.vault.get_access_token() else {
            self.set_authenticated(false);
            return false;
        };

        let valid = match self.verify_token(&token).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "AUDIT: token verification failed, purging credentials");
                self.vault.clear_tokens();
                false
            }
        };
        self.set_authenticated(valid);
        valid
    }

    fn set_authenticated(&self, value: bool) {
        {
            let mut state = self.authenticated.lock().expect("state mutex poisoned");
            if *state == Some(value) {
                return;
            }
            *state = Some(value);
        }
        tracing::debug!(authenticated = value, "auth state transition");

        // Snapshot outside the state lock so a callback may subscribe,
        // unsubscribe or read state without deadlocking
        let snapshot: Vec<_> = self
            .subscribers
            .lock()
            .expect("subscriber mutex poisoned")
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in snapshot {
            callback(value);
        }
    }

    async fn verify_token(&self, token: &str) -> Result<()> {
        let response = self
            .client
            .get(&self.verify_url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| {
                AuthError::VerificationFailure(format!("verification request failed: {e}"))
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(AuthError::VerificationFailure(format!(
                "verification endpoint returned {status}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CryptoConfig;
    use crate::storage::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> AuthConfig {
        AuthConfig {
            refresh_url: "http://127.0.0.1:1/refresh".to_string(),
            verify_url: "http://127.0.0.1:1/verify".to_string(),
            check_interval_secs: 60,
            refresh_threshold_secs: 300,
            http_timeout_secs: 5,
            store_path: None,
            crypto: CryptoConfig {
                secret: "state-test-secret".to_string(),
                salt: "state-test-salt".to_string(),
                pbkdf2_iterations: crate::config::MIN_PBKDF2_ITERATIONS,
                allow_plaintext_fallback: false,
            },
        }
    }

    fn broadcaster() -> AuthBroadcaster {
        let config = test_config();
        let store = Arc::new(MemoryStore::new());
        let vault = Arc::new(CredentialVault::new(store, &config.crypto).unwrap());
        let refresher = Arc::new(RefreshCoordinator::new(vault.clone(), &config).unwrap());
        AuthBroadcaster::new(vault, refresher, &config).unwrap()
    }

    #[tokio::test]
    async fn test_repeated_set_notifies_once() {
        let broadcaster = broadcaster();
        let notifications = Arc::new(AtomicUsize::new(0));

        let counter = notifications.clone();
        let _sub = broadcaster.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        broadcaster.set_authenticated(true);
        broadcaster.set_authenticated(true);
        assert_eq!(notifications.load(Ordering::SeqCst), 1);

        broadcaster.set_authenticated(false);
        assert_eq!(notifications.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_to_unauthenticated_is_a_transition() {
        let broadcaster = broadcaster();
        assert!(!broadcaster.is_authenticated());

        let notifications = Arc::new(AtomicUsize::new(0));
        let counter = notifications.clone();
        let _sub = broadcaster.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Unknown -> Unauthenticated notifies even though the cached read
        // already said false
        broadcaster.set_authenticated(false);
        assert_eq!(notifications.load(Ordering::SeqCst), 1);

        broadcaster.set_authenticated(false);
        assert_eq!(notifications.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribers_notified_in_subscription_order() {
        let broadcaster = broadcaster();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3 {
            let order = order.clone();
            let _ = broadcaster.subscribe(move |value| {
                order.lock().unwrap().push((tag, value));
            });
        }

        broadcaster.set_authenticated(true);
        assert_eq!(
            *order.lock().unwrap(),
            vec![(0, true), (1, true), (2, true)]
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_is_exact_and_idempotent() {
        let broadcaster = broadcaster();
        let hits_a = Arc::new(AtomicUsize::new(0));
        let hits_b = Arc::new(AtomicUsize::new(0));

        let counter = hits_a.clone();
        let sub_a = broadcaster.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = hits_b.clone();
        let _sub_b = broadcaster.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sub_a.unsubscribe();
        sub_a.unsubscribe();

        broadcaster.set_authenticated(true);
        assert_eq!(hits_a.load(Ordering::SeqCst), 0);
        assert_eq!(hits_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_check_without_credential_needs_no_network() {
        // verify_url points nowhere; an absent credential must short-circuit
        let broadcaster = broadcaster();
        assert!(!broadcaster.check_authentication().await);
        assert!(!broadcaster.is_authenticated());
    }
}
