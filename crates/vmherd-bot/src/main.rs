use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use vmherd_bot::config::BotConfig;
use vmherd_bot::gateway::LoggingGateway;
use vmherd_bot::shutdown::AutoShutdownScheduler;
use vmherd_bot::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vmherd=info".parse()?))
        .init();

    vmherd_common::id::init(1, 1);

    let args: Vec<String> = std::env::args().collect();
    let config_path = args
        .get(1)
        .map(|s| s.as_str())
        .unwrap_or("config/vmherd.toml");
    let config = BotConfig::load(config_path)?;

    tracing::info!(
        project = %config.gcp.project_id,
        zone = %config.gcp.default_zone,
        db = %config.database.url,
        "vmherd starting"
    );

    let state = AppState::build(config).await?;

    // The chat adapter attaches to state.handler; until one is wired in,
    // the logging gateway keeps the scheduler able to notify.
    let gateway = Arc::new(LoggingGateway);

    let sweep_handle = if state.config.auto_shutdown.enabled {
        let scheduler = AutoShutdownScheduler::new(
            state.store.clone(),
            state.orchestrator.clone(),
            gateway,
            &state.config.auto_shutdown,
        );
        Some(tokio::spawn(async move {
            scheduler.run().await;
        }))
    } else {
        tracing::info!("Auto-shutdown scheduler disabled");
        None
    };

    signal::ctrl_c().await?;
    tracing::info!("Shutting down gracefully");

    if let Some(handle) = sweep_handle {
        handle.abort();
    }
    tracing::info!("vmherd stopped");
    Ok(())
}
