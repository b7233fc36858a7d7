//! PKCE-based OAuth 2.0 authorization flow for linking marketplace accounts.
//!
//! The flow in order:
//! 1. `begin_authorization` mints a PKCE verifier and a single-use state
//!    ticket, persists the ticket, and returns the provider authorization URL
//! 2. User authorizes on the provider's site
//! 3. Provider redirects to the callback with `code` + `state`
//! 4. `complete_authorization` atomically claims the state ticket (closing
//!    the replay window before any network call), exchanges the code with
//!    the stored verifier, fetches the provider identity, upserts the
//!    account, and persists the encrypted token set

pub mod exchange;
pub mod pkce;
pub mod provider;

pub use exchange::ProviderIdentity;
pub use provider::{ProviderConfig, ProviderRegistry};

use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::credentials::{IntegrationAccount, OAuthState, Provider, SecretStore};
use crate::error::{Error, Result};

/// Default lifetime of a state ticket.
const DEFAULT_STATE_TTL_MINUTES: i64 = 15;

/// Result of starting an authorization, handed back to the UI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginAuthorization {
    pub authorization_url: String,
    pub state: String,
}

/// Drives the authorization-code exchange against one secret store.
#[derive(Clone)]
pub struct OAuthFlow {
    store: Arc<SecretStore>,
    providers: Arc<ProviderRegistry>,
    http: reqwest::Client,
    state_ttl: Duration,
}

impl OAuthFlow {
    pub fn new(store: Arc<SecretStore>, providers: Arc<ProviderRegistry>) -> Self {
        Self {
            store,
            providers,
            http: reqwest::Client::new(),
            state_ttl: Duration::minutes(DEFAULT_STATE_TTL_MINUTES),
        }
    }

    /// Overrides the state-ticket lifetime (tests shorten it).
    pub fn with_state_ttl(mut self, ttl: Duration) -> Self {
        self.state_ttl = ttl;
        self
    }

    /// Starts an authorization: mints verifier + state, persists the ticket,
    /// returns the provider URL to redirect the user to.
    ///
    /// The verifier never leaves the server; only its S256 challenge is put
    /// in the URL.
    pub fn begin_authorization(
        &self,
        user_id: &str,
        org_id: &str,
        provider: Provider,
    ) -> Result<BeginAuthorization> {
        let config = self.providers.get(provider)?;

        let verifier = pkce::generate_verifier();
        let code_challenge = pkce::challenge(&verifier);
        let state = pkce::generate_state();

        self.store.create_state(&OAuthState {
            state: state.clone(),
            code_verifier: verifier,
            user_id: user_id.to_string(),
            org_id: org_id.to_string(),
            provider,
            expires_at: Utc::now() + self.state_ttl,
            used: false,
        })?;

        let authorization_url = config.build_auth_url(&state, &code_challenge);

        debug!(%provider, user_id, org_id, "authorization started");
        Ok(BeginAuthorization {
            authorization_url,
            state,
        })
    }

    /// Completes an authorization callback.
    ///
    /// The state ticket is claimed before any network call: a replayed
    /// callback fails on the used flag without side effects, regardless of
    /// how the exchange went the first time.
    pub async fn complete_authorization(
        &self,
        code: &str,
        state: &str,
        provider_error: Option<&str>,
    ) -> Result<IntegrationAccount> {
        if let Some(provider_error) = provider_error {
            warn!(error = provider_error, "provider denied authorization");
            return Err(Error::ProviderDenied(provider_error.to_string()));
        }

        let ticket = self.store.claim_state(state)?;
        let provider = ticket.provider;
        let config = self.providers.get(provider)?;
        debug!(%provider, user_id = %ticket.user_id, "state validated, exchanging code");

        let tokens = exchange::exchange_code(&self.http, config, code, &ticket.code_verifier).await?;

        let identity = exchange::fetch_identity(&self.http, config, &tokens.access_token).await?;

        let account = self.store.upsert_account(
            provider,
            &identity.id,
            &ticket.org_id,
            &identity.display_name,
            &identity.profile,
        )?;

        self.store.put_tokens(&account.id, provider, &tokens)?;

        info!(
            %provider,
            account_id = %account.id,
            org_id = %account.org_id,
            has_refresh_token = tokens.refresh_token.is_some(),
            "account linked"
        );
        Ok(account)
    }
}

/// Background task deleting expired state tickets.
pub async fn run_state_cleanup(store: Arc<SecretStore>, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));
    loop {
        interval.tick().await;
        match store.purge_expired_states() {
            Ok(purged) if purged > 0 => debug!(purged, "expired oauth states purged"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "oauth state cleanup failed"),
        }
    }
}
