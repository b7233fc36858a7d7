use anyhow::{Context, Result};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use marketlink::api::{
    create_oauth_router, create_token_router, OAuthAppState, TokenAppState,
};
use marketlink::config::{self, MarketlinkConfig};
use marketlink::credentials::SecretStore;
use marketlink::oauth::{run_state_cleanup, OAuthFlow, ProviderRegistry};
use marketlink::tokens::{run_sweep_task, TokenManager};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marketlink=info".into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "marketlink.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        config::load_config(&config_path)?
    } else {
        info!(%config_path, "no config file found, using defaults");
        MarketlinkConfig::default()
    };

    let encryption_key = config::encryption_key_from_env()?;
    let store = Arc::new(
        SecretStore::new(&config.server.db_path, &encryption_key)
            .context("failed to open secret store")?,
    );

    let providers = Arc::new(ProviderRegistry::from_env(&config.oauth.callback_base_url));
    let configured: Vec<_> = providers.configured().collect();
    info!(?configured, "provider credentials loaded");

    let flow = OAuthFlow::new(Arc::clone(&store), Arc::clone(&providers))
        .with_state_ttl(chrono::Duration::minutes(config.oauth.state_ttl_minutes));
    let manager = Arc::new(
        TokenManager::new(Arc::clone(&store), Arc::clone(&providers))
            .with_safety_margin(chrono::Duration::minutes(config.tokens.safety_margin_minutes))
            .with_sweep_horizon(chrono::Duration::minutes(config.tokens.sweep_horizon_minutes)),
    );

    tokio::spawn(run_state_cleanup(
        Arc::clone(&store),
        config.oauth.state_cleanup_interval_seconds,
    ));
    for provider in configured {
        tokio::spawn(run_sweep_task(
            Arc::clone(&manager),
            provider,
            config.tokens.sweep_interval_seconds,
        ));
    }

    let app = create_oauth_router(OAuthAppState { flow })
        .merge(create_token_router(TokenAppState {
            manager: Arc::clone(&manager),
        }))
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;
    info!(bind_addr = %config.server.bind_addr, "marketlink listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
