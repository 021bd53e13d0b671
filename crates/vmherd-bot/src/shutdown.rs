//! Periodic sweep that stops instances past their configured auto-shutdown
//! age. Runs outside the rate limiter, on the same store/orchestrator
//! primitives as user commands.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use vmherd_cloud::{ComputeError, ComputeOrchestrator, ControlAction};
use vmherd_common::types::InstanceStatus;
use vmherd_storage::{InstanceRecord, InstanceUpdate, VmStore};

use crate::config::AutoShutdownConfig;
use crate::error::{CommandError, Result};
use crate::gateway::ChatGateway;

pub struct AutoShutdownScheduler {
    store: Arc<VmStore>,
    orchestrator: Arc<ComputeOrchestrator>,
    gateway: Arc<dyn ChatGateway>,
    tick: Duration,
    stop_timeout: Duration,
}

impl AutoShutdownScheduler {
    pub fn new(
        store: Arc<VmStore>,
        orchestrator: Arc<ComputeOrchestrator>,
        gateway: Arc<dyn ChatGateway>,
        config: &AutoShutdownConfig,
    ) -> Self {
        Self {
            store,
            orchestrator,
            gateway,
            tick: Duration::from_secs(config.tick_secs),
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
        }
    }

    pub async fn run(&self) {
        tracing::info!(
            tick_secs = self.tick.as_secs(),
            stop_timeout_secs = self.stop_timeout.as_secs(),
            "Auto-shutdown scheduler started"
        );
        let mut tick = tokio::time::interval(self.tick);
        loop {
            tick.tick().await;
            if let Err(e) = self.sweep().await {
                tracing::error!(error = %e, "Auto-shutdown sweep failed");
            }
        }
    }

    pub async fn sweep(&self) -> anyhow::Result<()> {
        self.sweep_at(Utc::now()).await
    }

    /// One pass over the auto-shutdown candidates, with `now` injected so
    /// the elapsed-time policy is testable.
    ///
    /// Elapsed time is measured from `last_status_update`, which any status
    /// write refreshes; a manual action on the instance therefore restarts
    /// the countdown.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let candidates = self.store.list_with_auto_shutdown().await?;
        if candidates.is_empty() {
            tracing::debug!("Auto-shutdown sweep: nothing to check");
            return Ok(());
        }

        for server in candidates {
            let Some(hours) = server.auto_shutdown_hours else {
                continue;
            };
            let elapsed = now - server.last_status_update;
            if elapsed <= chrono::Duration::hours(hours) {
                tracing::debug!(
                    instance = %server.instance_name,
                    elapsed_mins = elapsed.num_minutes(),
                    limit_hours = hours,
                    "Within auto-shutdown budget"
                );
                continue;
            }

            tracing::info!(
                instance = %server.instance_name,
                limit_hours = hours,
                "Auto-shutting down server past its age limit"
            );
            if let Err(e) = self.stop_server(&server).await {
                tracing::error!(
                    instance = %server.instance_name,
                    error = %e,
                    "Auto-stop failed"
                );
                // Failure parks the record in ERROR_AUTO_STOP, outside the
                // candidate set, until a start puts it back in play.
                if let Err(mark_err) = self
                    .store
                    .update_instance_status(
                        &server.instance_name,
                        InstanceStatus::ErrorAutoStop,
                        InstanceUpdate::default(),
                    )
                    .await
                {
                    tracing::error!(
                        instance = %server.instance_name,
                        error = %mark_err,
                        "Could not mark auto-stop failure"
                    );
                }
            }
        }
        Ok(())
    }

    async fn stop_server(&self, server: &InstanceRecord) -> Result<()> {
        self.store
            .update_instance_status(
                &server.instance_name,
                InstanceStatus::StoppingAuto,
                InstanceUpdate::default(),
            )
            .await?;

        let stop = self
            .orchestrator
            .control(ControlAction::Stop, &server.instance_name, &server.zone);
        match tokio::time::timeout(self.stop_timeout, stop).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(CommandError::OperationTimeout(
                    ComputeError::OperationTimeout {
                        operation: format!("auto-stop {}", server.instance_name),
                        waited_secs: self.stop_timeout.as_secs(),
                    },
                ));
            }
        }

        self.store
            .update_instance_status(
                &server.instance_name,
                InstanceStatus::Terminated,
                InstanceUpdate {
                    ip_address: Some(String::new()),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(instance = %server.instance_name, "Server auto-stopped");

        let hours = server.auto_shutdown_hours.unwrap_or_default();
        self.gateway
            .notify_user(
                &server.owner_user_id,
                &format!(
                    "Your game server `{}` was stopped automatically after exceeding \
                     its configured limit of {hours} hour(s).",
                    server.instance_name
                ),
            )
            .await;
        Ok(())
    }
}
