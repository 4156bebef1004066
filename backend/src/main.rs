use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use riftgate_backend::{
    app::build_router,
    config::Config,
    db::connect_store,
    services::{
        identity::{DevIdentityProvider, DisabledIdentityProvider},
        ActivitySweeper, IdentityProvider,
    },
    state::AppState,
    utils::security::mask_secret,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "riftgate_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;
    tracing::info!(
        app_env = %config.app_env,
        bind_addr = %config.bind_addr,
        redis_url = %config.redis_url.as_deref().map(mask_secret).unwrap_or_else(|| "<unset>".into()),
        jwt_secret = %mask_secret(&config.jwt_secret),
        session_expiration_days = config.session_expiration_days,
        rate_limit_fail_closed = config.rate_limit_fail_closed,
        dev_login_enabled = config.dev_login_enabled,
        "Loaded configuration from environment/.env"
    );

    let store = connect_store(&config).await?;
    let identity: Arc<dyn IdentityProvider> = if config.dev_login_enabled {
        tracing::warn!("Development login is enabled; any code is accepted");
        Arc::new(DevIdentityProvider)
    } else {
        Arc::new(DisabledIdentityProvider)
    };

    let addr = config.bind_addr;
    let state = AppState::new(config, store, identity);
    let sweeper = ActivitySweeper::spawn(state.activity.clone());
    let app = build_router(state);

    tracing::info!("Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
    }
}
