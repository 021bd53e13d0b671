//! Constructor-time wiring of every component. Nothing resolves a
//! collaborator at call time; dependencies are passed in here, once.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use vmherd_cloud::gcp::{GcpComputeApi, TokenSource};
use vmherd_cloud::ComputeOrchestrator;
use vmherd_storage::VmStore;

use crate::commands::CommandHandler;
use crate::config::BotConfig;
use crate::control::ControlService;
use crate::guards::RateLimiter;
use crate::provision::ProvisioningWorkflow;
use crate::templates::TemplateStore;

pub struct AppState {
    pub config: Arc<BotConfig>,
    pub store: Arc<VmStore>,
    pub orchestrator: Arc<ComputeOrchestrator>,
    pub handler: Arc<CommandHandler>,
}

impl AppState {
    pub async fn build(config: BotConfig) -> anyhow::Result<Self> {
        let store = Arc::new(
            VmStore::connect(&config.database.url)
                .await
                .context("Failed to open the bot database")?,
        );

        let token_source = match &config.gcp.access_token {
            Some(token) => TokenSource::Static(token.clone()),
            None => TokenSource::MetadataServer,
        };
        let api = Arc::new(
            GcpComputeApi::new(&config.gcp.project_id, token_source)
                .context("Failed to build the GCE client")?,
        );
        let orchestrator = Arc::new(ComputeOrchestrator::new(api));

        let templates = Arc::new(
            TemplateStore::load(Path::new(&config.templates.path))
                .context("Failed to load game templates")?,
        );
        if templates.is_empty() {
            tracing::warn!(path = %config.templates.path, "No game templates loaded");
        }

        let workflow = ProvisioningWorkflow::new(
            store.clone(),
            orchestrator.clone(),
            templates.clone(),
            config.limits.clone(),
            config.gcp.default_zone.clone(),
        );
        let control = ControlService::new(store.clone(), orchestrator.clone());
        let rate_limiter = RateLimiter::new(store.clone(), &config.limits);
        let handler = Arc::new(CommandHandler::new(
            store.clone(),
            orchestrator.clone(),
            templates,
            workflow,
            control,
            rate_limiter,
            config.gcp.default_zone.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            store,
            orchestrator,
            handler,
        })
    }
}
