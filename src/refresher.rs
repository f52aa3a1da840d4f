// Token refresh logic
// Periodic expiry polling plus single-flight deduplication of refresh calls

use chrono::Duration;
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::vault::CredentialVault;

/// The shared in-flight refresh outcome every concurrent caller awaits
type PendingRefresh = Shared<BoxFuture<'static, Result<String>>>;

/// Refresh endpoint response: `{ success, data: { accessToken, expiresIn } }`
/// with `expiresIn` in milliseconds
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    #[serde(default)]
    success: bool,
    data: Option<RefreshData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshData {
    access_token: String,
    expires_in: i64,
}

/// Keeps the access token fresh: a recurring expiry check triggers a refresh
/// once time-to-expiry drops under the threshold, and concurrent refresh
/// demand collapses into a single network round trip.
pub struct RefreshCoordinator {
    inner: Arc<RefreshInner>,
    check_interval: std::time::Duration,

    /// Recurring expiry-check task
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// State shared between callers and the background timer task
struct RefreshInner {
    vault: Arc<CredentialVault>,
    client: Client,
    refresh_url: String,
    refresh_threshold: Duration,

    /// At most one refresh is in flight; checked and set synchronously
    /// before any async work begins
    pending: Mutex<Option<PendingRefresh>>,
}

impl RefreshCoordinator {
    pub fn new(vault: Arc<CredentialVault>, config: &AuthConfig) -> Result<Self> {
        // cookie_store carries the server-set HttpOnly refresh cookie on the
        // refresh request automatically
        let client = Client::builder()
            .cookie_store(true)
            .timeout(std::time::Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| AuthError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            inner: Arc::new(RefreshInner {
                vault,
                client,
                refresh_url: config.refresh_url.clone(),
                refresh_threshold: Duration::seconds(config.refresh_threshold_secs),
                pending: Mutex::new(None),
            }),
            check_interval: std::time::Duration::from_secs(config.check_interval_secs),
            timer: Mutex::new(None),
        })
    }

    /// Install the recurring expiry check, replacing (never stacking) any
    /// existing timer.
    pub fn start_auto_refresh(&self) {
        let mut timer = self.timer.lock().expect("timer mutex poisoned");
        if let Some(existing) = timer.take() {
            existing.abort();
        }

        let inner = Arc::clone(&self.inner);
        let interval = self.check_interval;
        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval fires immediately; the first real check is one period out
            ticker.tick().await;
            loop {
                ticker.tick().await;
                scheduled_check(&inner).await;
            }
        }));
        tracing::debug!(interval_secs = self.check_interval.as_secs(), "auto refresh started");
    }

    /// Cancel the recurring check. Idempotent; an already-in-flight refresh
    /// runs to completion and persists its result.
    pub fn stop_auto_refresh(&self) {
        if let Some(handle) = self.timer.lock().expect("timer mutex poisoned").take() {
            handle.abort();
            tracing::debug!("auto refresh stopped");
        }
    }

    /// One iteration of the scheduled check: refresh when the token is close
    /// to expiring but not already gone. Failures are logged and swallowed so
    /// the schedule itself never dies.
    pub async fn check_and_refresh(&self) {
        scheduled_check(&self.inner).await;
    }

    /// Refresh the access token, deduplicating concurrent calls.
    ///
    /// If a refresh is already pending, the caller awaits that same
    /// operation instead of issuing a second round trip. On a 401-class
    /// response all credentials are purged and `RefreshTokenExpired` is
    /// raised to every waiter; other failures leave credentials intact and
    /// surface as `RefreshTransient`.
    pub async fn refresh_access_token(&self) -> Result<String> {
        single_flight_refresh(&self.inner).await
    }
}

/// One timer iteration: refresh when due, log and swallow failures
async fn scheduled_check(inner: &Arc<RefreshInner>) {
    let remaining = inner.vault.time_until_expiry();
    if !needs_refresh(remaining, inner.refresh_threshold) {
        return;
    }
    tracing::info!(
        remaining_secs = remaining.num_seconds(),
        "access token close to expiry, refreshing"
    );
    if let Err(e) = single_flight_refresh(inner).await {
        tracing::warn!(error = %e, "scheduled token refresh failed");
    }
}

/// Join the pending refresh if one exists, otherwise start one
async fn single_flight_refresh(inner: &Arc<RefreshInner>) -> Result<String> {
    let shared = {
        let mut pending = inner.pending.lock().expect("pending mutex poisoned");
        if let Some(inflight) = pending.as_ref() {
            tracing::debug!("refresh already in flight, joining it");
            inflight.clone()
        } else {
            let shared = spawn_refresh(inner);
            *pending = Some(shared.clone());
            shared
        }
    };
    shared.await
}

/// Spawn the actual refresh on its own task so that neither caller
/// cancellation nor `stop_auto_refresh()` can abandon it mid-write.
/// The task clears the pending slot once the operation settles.
fn spawn_refresh(inner: &Arc<RefreshInner>) -> PendingRefresh {
    let task_inner = Arc::clone(inner);
    let handle = tokio::spawn(async move {
        let result = perform_refresh(
            &task_inner.client,
            &task_inner.refresh_url,
            &task_inner.vault,
        )
        .await;
        *task_inner.pending.lock().expect("pending mutex poisoned") = None;
        result
    });

    let join_inner = Arc::clone(inner);
    async move {
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                // Task never settled, so it never cleared the slot
                *join_inner.pending.lock().expect("pending mutex poisoned") = None;
                Err(AuthError::RefreshTransient(format!(
                    "refresh task failed: {e}"
                )))
            }
        }
    }
    .boxed()
    .shared()
}

/// Refresh is due when time-to-expiry is positive but at or under the
/// threshold; an already-expired token is not worth a scheduled attempt.
fn needs_refresh(remaining: Duration, threshold: Duration) -> bool {
    remaining > Duration::zero() && remaining <= threshold
}

async fn perform_refresh(client: &Client, url: &str, vault: &CredentialVault) -> Result<String> {
    tracing::debug!("sending token refresh request");

    let response = client
        .post(url)
        .send()
        .await
        .map_err(|e| AuthError::RefreshTransient(format!("refresh request failed: {e}")))?;

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        tracing::warn!(status = %status, "AUDIT: refresh token rejected, purging credentials");
        vault.clear_tokens();
        return Err(AuthError::RefreshTokenExpired);
    }
    if !status.is_success() {
        return Err(AuthError::RefreshTransient(format!(
            "refresh endpoint returned {status}"
        )));
    }

    let body: RefreshResponse = response
        .json()
        .await
        .map_err(|e| AuthError::RefreshTransient(format!("invalid refresh response: {e}")))?;

    if !body.success {
        return Err(AuthError::RefreshTransient(
            "refresh endpoint reported failure".to_string(),
        ));
    }
    let data = body
        .data
        .ok_or_else(|| AuthError::RefreshTransient("refresh response missing data".to_string()))?;
    if data.access_token.is_empty() {
        return Err(AuthError::RefreshTransient(
            "refresh response missing accessToken".to_string(),
        ));
    }

    // expiresIn arrives in milliseconds on the wire
    let expires_in_secs = data.expires_in / 1000;
    vault.store_access_token(&data.access_token, expires_in_secs)?;

    tracing::info!(expires_in_secs, "access token refreshed");
    Ok(data.access_token)
}
