use riftgate_backend::{
    config::Config,
    db::connect_store,
    services::ActivityTracker,
};

/// One-shot presence cleanup for deployments that run the sweep from cron
/// instead of inside the server.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "riftgate_backend=info,activity_sweep=info".into()),
        )
        .init();

    let config = Config::load()?;
    let store = connect_store(&config).await?;
    let tracker = ActivityTracker::new(store, config.activity_config());

    let removed = tracker.sweep().await?;
    if removed > 0 {
        tracing::info!("Removed {} offline subjects from the online set", removed);
    }

    Ok(())
}
