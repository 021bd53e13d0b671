//! Start/stop/delete on registered instances, with the delete-side
//! firewall cleanup and inventory removal.

use std::sync::Arc;

use vmherd_cloud::{naming, ComputeOrchestrator, ControlAction};
use vmherd_common::types::{Capability, InstanceStatus};
use vmherd_storage::{InstanceRecord, InstanceUpdate, VmStore};

use crate::error::{CommandError, Result};
use crate::gateway::{ChatGateway, CommandContext, Confirmation};

/// Result of a start or stop.
#[derive(Debug, Clone)]
pub struct ActionReport {
    pub instance_name: String,
    pub ip_address: Option<String>,
}

/// Rule-by-rule account of the delete-side firewall cleanup.
#[derive(Debug, Clone, Default)]
pub struct DeleteReport {
    pub deleted_rules: Vec<String>,
    pub failed_rules: Vec<String>,
    /// Set when the rules could not even be listed; cleanup was skipped.
    pub rule_listing_error: Option<String>,
}

/// Outcome of a delete request, including the two non-approval paths of
/// the confirmation dialog.
#[derive(Debug, Clone)]
pub enum DeleteOutcome {
    Deleted(DeleteReport),
    Cancelled,
    ConfirmationTimedOut,
}

pub struct ControlService {
    store: Arc<VmStore>,
    orchestrator: Arc<ComputeOrchestrator>,
}

impl ControlService {
    pub fn new(store: Arc<VmStore>, orchestrator: Arc<ComputeOrchestrator>) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    pub async fn start(
        &self,
        ctx: &CommandContext,
        instance_name: &str,
        gateway: &dyn ChatGateway,
    ) -> Result<ActionReport> {
        let record = self.authorized_record(ctx, instance_name, "start").await?;
        self.store
            .update_instance_status(instance_name, InstanceStatus::Starting, InstanceUpdate::default())
            .await?;
        gateway
            .progress(ctx, &format!("Starting `{instance_name}`, waiting for completion..."))
            .await;

        if let Err(e) = self
            .orchestrator
            .control(ControlAction::Start, instance_name, &record.zone)
            .await
        {
            self.mark_error(instance_name).await;
            return Err(e.into());
        }

        // A freshly started VM may have a new ephemeral IP.
        let ip = match self
            .orchestrator
            .instance_details(instance_name, &record.zone)
            .await
        {
            Ok(info) => info.external_ip,
            Err(e) => {
                tracing::warn!(instance = instance_name, error = %e, "Could not re-fetch IP after start");
                None
            }
        };
        self.store
            .update_instance_status(
                instance_name,
                InstanceStatus::Running,
                InstanceUpdate {
                    ip_address: ip.clone(),
                    ..Default::default()
                },
            )
            .await?;
        Ok(ActionReport {
            instance_name: instance_name.to_string(),
            ip_address: ip,
        })
    }

    pub async fn stop(
        &self,
        ctx: &CommandContext,
        instance_name: &str,
        gateway: &dyn ChatGateway,
    ) -> Result<ActionReport> {
        let record = self.authorized_record(ctx, instance_name, "stop").await?;
        self.store
            .update_instance_status(instance_name, InstanceStatus::Stopping, InstanceUpdate::default())
            .await?;
        gateway
            .progress(ctx, &format!("Stopping `{instance_name}`, waiting for completion..."))
            .await;

        if let Err(e) = self
            .orchestrator
            .control(ControlAction::Stop, instance_name, &record.zone)
            .await
        {
            self.mark_error(instance_name).await;
            return Err(e.into());
        }

        self.store
            .update_instance_status(
                instance_name,
                InstanceStatus::Terminated,
                InstanceUpdate {
                    ip_address: Some(String::new()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(ActionReport {
            instance_name: instance_name.to_string(),
            ip_address: None,
        })
    }

    /// Deletes the VM after explicit confirmation, then removes the
    /// firewall rules scoped to its tag, then the inventory record.
    ///
    /// The record is removed only when the VM delete itself succeeded; rule
    /// failures are collected, never fatal.
    pub async fn delete(
        &self,
        ctx: &CommandContext,
        instance_name: &str,
        gateway: &dyn ChatGateway,
    ) -> Result<DeleteOutcome> {
        let record = self.authorized_record(ctx, instance_name, "delete").await?;

        let prompt = format!(
            "Delete the game server `{instance_name}`? This is irreversible and removes \
             the VM, its disk, and its firewall rules."
        );
        match gateway.confirm(ctx, &prompt).await {
            Confirmation::Confirmed => {}
            Confirmation::Cancelled => {
                tracing::info!(instance = instance_name, user = %ctx.user_id, "Delete cancelled");
                return Ok(DeleteOutcome::Cancelled);
            }
            Confirmation::TimedOut => {
                tracing::info!(instance = instance_name, user = %ctx.user_id, "Delete confirmation timed out");
                return Ok(DeleteOutcome::ConfirmationTimedOut);
            }
        }

        self.store
            .update_instance_status(instance_name, InstanceStatus::Deleting, InstanceUpdate::default())
            .await?;
        gateway
            .progress(ctx, &format!("Deleting `{instance_name}`, waiting for completion..."))
            .await;

        if let Err(e) = self
            .orchestrator
            .control(ControlAction::Delete, instance_name, &record.zone)
            .await
        {
            // VM delete failed: keep the record, flag it for manual
            // follow-up.
            self.mark_error(instance_name).await;
            return Err(e.into());
        }

        let report = self.cleanup_firewall_rules(instance_name).await;
        self.store.remove_instance(instance_name).await?;
        tracing::info!(instance = instance_name, "Game server deleted and deregistered");
        Ok(DeleteOutcome::Deleted(report))
    }

    /// Resolves the rules belonging to the instance by its tag and attempts
    /// every deletion, collecting failures.
    async fn cleanup_firewall_rules(&self, instance_name: &str) -> DeleteReport {
        let tag = naming::instance_tag(instance_name);
        let mut report = DeleteReport::default();

        let rules = match self.orchestrator.find_rules_by_tag(&tag).await {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!(tag = %tag, error = %e, "Could not list firewall rules for cleanup");
                report.rule_listing_error = Some(e.to_string());
                return report;
            }
        };
        if rules.is_empty() {
            tracing::info!(tag = %tag, "No firewall rules to clean up");
            return report;
        }

        for rule in rules {
            match self.orchestrator.delete_firewall_rule(&rule.name).await {
                Ok(()) => report.deleted_rules.push(rule.name),
                Err(e) => {
                    tracing::error!(rule = %rule.name, error = %e, "Failed to delete firewall rule");
                    report.failed_rules.push(rule.name);
                }
            }
        }
        report
    }

    async fn authorized_record(
        &self,
        ctx: &CommandContext,
        instance_name: &str,
        action: &str,
    ) -> Result<InstanceRecord> {
        let record = self
            .store
            .get_instance(instance_name)
            .await?
            .ok_or_else(|| CommandError::NotFound(instance_name.to_string()))?;
        if ctx.capability.at_least(Capability::Admin) || ctx.user_id == record.owner_user_id {
            Ok(record)
        } else {
            Err(CommandError::PermissionDenied(format!(
                "you do not own `{instance_name}` and cannot {action} it"
            )))
        }
    }

    async fn mark_error(&self, instance_name: &str) {
        if let Err(e) = self
            .store
            .update_instance_status(instance_name, InstanceStatus::Error, InstanceUpdate::default())
            .await
        {
            tracing::error!(instance = instance_name, error = %e, "Could not mark instance as ERROR");
        }
    }
}
