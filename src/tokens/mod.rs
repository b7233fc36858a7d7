//! Token lifecycle management.
//!
//! Guarantees callers a valid, non-expired access token per account. Refresh
//! is proactive (a periodic sweep ahead of expiry) and reactive (a 401 from
//! a downstream call triggers one refresh and one retry). Concurrent callers
//! for the same account share a single in-flight provider refresh through a
//! per-`(account, provider)` lock owned by the manager instance, so tests
//! can construct isolated managers.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::credentials::{Provider, SecretStore, TokenSet};
use crate::error::{Error, ProviderStage, Result};
use crate::oauth::{exchange, ProviderRegistry};

/// Default margin before expiry at which a token counts as stale.
const DEFAULT_SAFETY_MARGIN_MINUTES: i64 = 5;

/// Default look-ahead window of the proactive sweep.
const DEFAULT_SWEEP_HORIZON_MINUTES: i64 = 30;

/// Outcome of one proactive sweep over a provider's accounts.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Accounts whose expiry fell inside the horizon and were run through
    /// `get_valid_access_token`.
    pub checked: usize,
    /// Accounts whose token was comfortably far from expiry.
    pub skipped: usize,
    /// Per-account failures; they never abort the sweep.
    pub failures: Vec<(String, String)>,
}

/// Hands out currently valid access tokens, refreshing on demand.
pub struct TokenManager {
    store: Arc<SecretStore>,
    providers: Arc<ProviderRegistry>,
    http: reqwest::Client,
    locks: DashMap<(String, Provider), Arc<Mutex<()>>>,
    safety_margin: Duration,
    sweep_horizon: Duration,
}

impl TokenManager {
    pub fn new(store: Arc<SecretStore>, providers: Arc<ProviderRegistry>) -> Self {
        Self {
            store,
            providers,
            http: reqwest::Client::new(),
            locks: DashMap::new(),
            safety_margin: Duration::minutes(DEFAULT_SAFETY_MARGIN_MINUTES),
            sweep_horizon: Duration::minutes(DEFAULT_SWEEP_HORIZON_MINUTES),
        }
    }

    /// Overrides the staleness margin (tests tighten or widen it).
    pub fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = margin;
        self
    }

    pub fn with_sweep_horizon(mut self, horizon: Duration) -> Self {
        self.sweep_horizon = horizon;
        self
    }

    /// Returns a valid token set for the account, refreshing it first when
    /// the stored expiry is inside the safety margin.
    ///
    /// Concurrent callers on a stale account serialize on the per-account
    /// lock; whoever acquires it after the first refresh sees a fresh expiry
    /// and returns the just-persisted token instead of issuing a second
    /// provider call.
    pub async fn get_valid_access_token(&self, account_id: &str) -> Result<TokenSet> {
        let account = self.store.get_account(account_id)?;
        let provider = account.provider;

        if self.is_fresh(self.store.get_expiry(account_id, provider)?) {
            return self.store.get_active_tokens(account_id, provider);
        }

        let lock = self.refresh_lock(account_id, provider);
        let _guard = lock.lock().await;

        if self.is_fresh(self.store.get_expiry(account_id, provider)?) {
            debug!(account_id, "refresh already completed by concurrent caller");
            return self.store.get_active_tokens(account_id, provider);
        }

        self.refresh_locked(account_id, provider).await
    }

    /// Unconditionally refreshes the account's token (still single-flight).
    pub async fn force_refresh(&self, account_id: &str) -> Result<TokenSet> {
        let account = self.store.get_account(account_id)?;
        let provider = account.provider;

        let lock = self.refresh_lock(account_id, provider);
        let _guard = lock.lock().await;
        self.refresh_locked(account_id, provider).await
    }

    /// Iterates a provider's active accounts and runs every account whose
    /// expiry falls inside the sweep horizon through
    /// [`get_valid_access_token`]. Failures are recorded per account and do
    /// not abort the sweep.
    pub async fn proactive_sweep(&self, provider: Provider) -> Result<SweepReport> {
        let accounts = self.store.list_active_accounts(provider)?;
        let mut report = SweepReport::default();

        for account in accounts {
            let expiry = match self.store.get_expiry(&account.id, provider) {
                Ok(expiry) => expiry,
                Err(Error::NotFound(_)) => {
                    // Linked but never received tokens; nothing to refresh.
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(account_id = %account.id, error = %e, "sweep could not read expiry");
                    report.failures.push((account.id, e.to_string()));
                    continue;
                }
            };

            let due = matches!(expiry, Some(t) if t - Utc::now() <= self.sweep_horizon);
            if !due {
                report.skipped += 1;
                continue;
            }

            report.checked += 1;
            if let Err(e) = self.get_valid_access_token(&account.id).await {
                warn!(account_id = %account.id, error = %e, "sweep refresh failed");
                report.failures.push((account.id, e.to_string()));
            }
        }

        Ok(report)
    }

    fn is_fresh(&self, expiry: Option<DateTime<Utc>>) -> bool {
        match expiry {
            // No recorded expiry: the provider issued a non-expiring token.
            None => true,
            Some(expires_at) => expires_at - Utc::now() > self.safety_margin,
        }
    }

    fn refresh_lock(&self, account_id: &str, provider: Provider) -> Arc<Mutex<()>> {
        self.locks
            .entry((account_id.to_string(), provider))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// The actual provider refresh. Caller holds the per-account lock.
    ///
    /// On failure the stored secret is left untouched: the last-known-good
    /// token stays authoritative until a refresh succeeds.
    async fn refresh_locked(&self, account_id: &str, provider: Provider) -> Result<TokenSet> {
        let config = self.providers.get(provider)?;
        let current = self.store.get_active_tokens(account_id, provider)?;

        let refresh = current.refresh_token.as_deref().ok_or_else(|| Error::Provider {
            stage: ProviderStage::Refresh,
            status: Some(400),
            message: "no refresh token stored; account must re-link".to_string(),
        })?;

        let refreshed = exchange::refresh_token(&self.http, config, refresh).await?;

        // Keep the previous refresh token when the provider did not rotate it.
        let merged = TokenSet {
            access_token: refreshed.access_token,
            refresh_token: refreshed.refresh_token.or_else(|| current.refresh_token.clone()),
            expires_at: refreshed.expires_at,
            token_type: refreshed.token_type.or(current.token_type),
        };

        self.store.put_tokens(account_id, provider, &merged)?;

        info!(
            account_id,
            %provider,
            expires_at = ?merged.expires_at,
            "access token refreshed"
        );
        Ok(merged)
    }
}

/// Reactive path for downstream marketplace calls: run `op` with a valid
/// access token; on a 401 refresh once and retry once. A second consecutive
/// 401 is terminal.
pub async fn with_auth_retry<T, F, Fut>(
    manager: &TokenManager,
    account_id: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let tokens = manager.get_valid_access_token(account_id).await?;
    match op(tokens.access_token).await {
        Err(e) if e.is_unauthorized() => {
            debug!(account_id, "downstream 401, refreshing and retrying once");
            let tokens = manager.force_refresh(account_id).await?;
            op(tokens.access_token).await
        }
        other => other,
    }
}

/// Background task running the proactive sweep on an interval.
pub async fn run_sweep_task(manager: Arc<TokenManager>, provider: Provider, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));
    loop {
        interval.tick().await;
        match manager.proactive_sweep(provider).await {
            Ok(report) => {
                if report.checked > 0 || !report.failures.is_empty() {
                    info!(
                        %provider,
                        checked = report.checked,
                        skipped = report.skipped,
                        failures = report.failures.len(),
                        "proactive sweep complete"
                    );
                }
            }
            Err(e) => warn!(%provider, error = %e, "proactive sweep aborted"),
        }
    }
}
