//! The create saga: parameter resolution, abuse checks, VM creation, port
//! opening, inventory registration.
//!
//! Port opening and registration are best-effort once the VM exists: the
//! workflow never rolls a created VM back, it reports what succeeded and
//! what did not.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use vmherd_cloud::{naming, ComputeOrchestrator, CreateInstanceRequest};
use vmherd_common::types::{Capability, InstanceStatus, PortSpec};
use vmherd_storage::{NewInstance, VmStore};

use crate::config::LimitsConfig;
use crate::error::{CommandError, Result};
use crate::gateway::{ChatGateway, CommandContext};
use crate::templates::{self, TemplateError, TemplateStore};

/// Command name recorded in the ledger for creates; the cooldown check
/// reads it back.
pub const CREATE_COMMAND: &str = "create";

#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub template_name: String,
    pub instance_name: String,
    pub zone: Option<String>,
    pub custom_params_json: Option<String>,
    pub auto_shutdown_hours: Option<i64>,
}

/// What the caller gets back after a create reaches its terminal state.
#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub instance_name: String,
    pub zone: String,
    pub machine_type: String,
    pub ip_address: Option<String>,
    pub opened_ports: Vec<PortSpec>,
    pub failed_ports: Vec<PortSpec>,
    /// Set when the VM exists but the inventory write failed: the server is
    /// up and untracked, which needs operator attention.
    pub registration_error: Option<String>,
    pub auto_shutdown_hours: Option<i64>,
}

pub struct ProvisioningWorkflow {
    store: Arc<VmStore>,
    orchestrator: Arc<ComputeOrchestrator>,
    templates: Arc<TemplateStore>,
    limits: LimitsConfig,
    default_zone: String,
}

impl ProvisioningWorkflow {
    pub fn new(
        store: Arc<VmStore>,
        orchestrator: Arc<ComputeOrchestrator>,
        templates: Arc<TemplateStore>,
        limits: LimitsConfig,
        default_zone: String,
    ) -> Self {
        Self {
            store,
            orchestrator,
            templates,
            limits,
            default_zone,
        }
    }

    pub async fn run(
        &self,
        ctx: &CommandContext,
        req: CreateRequest,
        gateway: &dyn ChatGateway,
    ) -> Result<ProvisionReport> {
        // Step 1: resolve parameters. Everything here fails locally, before
        // any cloud call.
        naming::validate_instance_name(&req.instance_name)
            .map_err(|e| CommandError::Validation(e.to_string()))?;

        let template = self
            .templates
            .get(&req.template_name)
            .ok_or_else(|| {
                CommandError::Validation(
                    TemplateError::UnknownTemplate(req.template_name.clone()).to_string(),
                )
            })?
            .clone();

        let params = templates::merge_params(&template, req.custom_params_json.as_deref())
            .map_err(|e| CommandError::Validation(e.to_string()))?;
        let startup_script = match &template.startup_script_template {
            Some(script) => Some(
                templates::render_startup_script(script, &params)
                    .map_err(|e| CommandError::Validation(e.to_string()))?,
            ),
            None => None,
        };

        // Step 2: abuse checks. Resource ownership never bypasses these;
        // only an elevated capability does.
        if !ctx.capability.at_least(Capability::Admin) {
            self.enforce_quotas(ctx).await?;
        }

        let zone = req.zone.unwrap_or_else(|| self.default_zone.clone());
        gateway
            .progress(
                ctx,
                &format!(
                    "Step 1/4: creating VM `{}` from template `{}` in zone `{zone}`...",
                    req.instance_name, req.template_name
                ),
            )
            .await;

        // Step 3: create the VM. From here on the cloud resource exists
        // even if the invoking session goes away.
        let vm = self
            .orchestrator
            .create_instance(CreateInstanceRequest {
                name: req.instance_name.clone(),
                zone: zone.clone(),
                machine_type: template.machine_type.clone(),
                image_project: template.image_project.clone(),
                image_family: template.image_family.clone(),
                disk_size_gb: template.disk_size_gb,
                owner_user_id: ctx.user_id.clone(),
                startup_script,
                extra_tags: template.additional_tags.clone(),
                extra_labels: {
                    let mut labels = template.labels.clone();
                    labels.insert("game-template".to_string(), req.template_name.clone());
                    labels
                },
            })
            .await?;

        gateway
            .progress(
                ctx,
                &format!(
                    "Step 2/4: VM `{}` created (IP: {}). Configuring firewall...",
                    vm.name,
                    vm.external_ip.as_deref().unwrap_or("none")
                ),
            )
            .await;

        // Step 4: open template ports against the per-instance tag.
        // Individual failures are reported, not fatal.
        let tag = naming::instance_tag(&req.instance_name);
        let mut opened_ports = Vec::new();
        let mut failed_ports = Vec::new();
        for port in &template.default_ports {
            let rule_name =
                naming::firewall_rule_name(&req.instance_name, port.port, port.protocol);
            match self
                .orchestrator
                .open_port(
                    &rule_name,
                    &tag,
                    port.port,
                    port.protocol,
                    port.description.as_deref(),
                )
                .await
            {
                Ok(()) => opened_ports.push(port.spec()),
                Err(e) => {
                    tracing::error!(
                        instance = %req.instance_name,
                        rule = %rule_name,
                        error = %e,
                        "Failed to open port"
                    );
                    failed_ports.push(port.spec());
                }
            }
        }

        gateway
            .progress(ctx, "Step 3/4: registering the server...")
            .await;

        // Step 5: register. A failure here leaves a running, untracked VM;
        // that inconsistency is reported rather than rolled back.
        let status = if vm.external_ip.is_some() {
            InstanceStatus::Running
        } else {
            InstanceStatus::ProvisioningNoIp
        };
        let registration_error = match self
            .store
            .register_instance(NewInstance {
                owner_user_id: ctx.user_id.clone(),
                instance_name: req.instance_name.clone(),
                cloud_instance_id: vm.cloud_id.clone(),
                zone: zone.clone(),
                template_name: req.template_name.clone(),
                status,
                ip_address: vm.external_ip.clone(),
                ports: opened_ports.clone(),
                extra_config: Some(Value::Object(params.into_iter().collect())),
                auto_shutdown_hours: req.auto_shutdown_hours,
            })
            .await
        {
            Ok(_) => None,
            Err(e) => {
                tracing::error!(
                    instance = %req.instance_name,
                    error = %e,
                    "VM created but inventory registration failed"
                );
                Some(e.to_string())
            }
        };

        gateway.progress(ctx, "Step 4/4: done.").await;
        tracing::info!(
            instance = %req.instance_name,
            template = %req.template_name,
            ip = vm.external_ip.as_deref().unwrap_or("none"),
            opened = opened_ports.len(),
            failed = failed_ports.len(),
            "Game server provisioned"
        );

        Ok(ProvisionReport {
            instance_name: req.instance_name,
            zone,
            machine_type: template.machine_type,
            ip_address: vm.external_ip,
            opened_ports,
            failed_ports,
            registration_error,
            auto_shutdown_hours: req.auto_shutdown_hours,
        })
    }

    async fn enforce_quotas(&self, ctx: &CommandContext) -> Result<()> {
        let max_active = self.limits.max_active_instances_per_user;
        if max_active > 0 {
            let active = self.store.list_active_for_owner(&ctx.user_id).await?;
            if active.len() >= max_active {
                return Err(CommandError::QuotaExceeded {
                    reason: format!(
                        "you already have {} active server(s), the limit is {max_active}; \
                         delete one before creating another",
                        active.len()
                    ),
                    retry_after_secs: None,
                });
            }
        }

        let cooldown = self.limits.create_cooldown_secs;
        if cooldown > 0 {
            // Ledger read failures fail open, consistent with the rate
            // limiter.
            let last = match self
                .store
                .last_usage_timestamp(&ctx.user_id, CREATE_COMMAND)
                .await
            {
                Ok(last) => last,
                Err(e) => {
                    tracing::warn!(user = %ctx.user_id, error = %e, "Cooldown lookup failed, allowing");
                    None
                }
            };
            if let Some(last) = last {
                let elapsed = (Utc::now() - last).num_seconds().max(0) as u64;
                if elapsed < cooldown {
                    let remaining = cooldown - elapsed;
                    return Err(CommandError::QuotaExceeded {
                        reason: format!(
                            "you must wait {remaining}s before creating another server"
                        ),
                        retry_after_secs: Some(remaining),
                    });
                }
            }
        }
        Ok(())
    }
}
