//! Typed command surface and dispatch. A validated, capability-resolved
//! invocation comes in from the chat adapter; guards run in order, the
//! invocation is recorded in the ledger, and the matching handler runs.

use std::sync::Arc;

use vmherd_cloud::{
    ComputeOrchestrator, ControlAction, CreateInstanceRequest, FirewallRule, InstanceInfo,
};

pub use vmherd_cloud::naming::validate_instance_name;
use vmherd_common::types::{Capability, Protocol};
use vmherd_storage::{InstanceRecord, VmStore};

use crate::control::{ActionReport, ControlService, DeleteOutcome, DeleteReport};
use crate::error::{CommandError, Result};
use crate::gateway::{ChatGateway, CommandContext, Confirmation};
use crate::guards::{Admission, RateLimiter};
use crate::provision::{CreateRequest, ProvisionReport, ProvisioningWorkflow, CREATE_COMMAND};
use crate::templates::TemplateStore;

/// Longest serial-log tail returned to the chat layer.
const SERIAL_LOG_TAIL_CHARS: usize = 1980;

const MAX_AUTO_SHUTDOWN_HOURS: i64 = 720;

/// Every operation the bot exposes. Game-server commands work on the
/// inventory abstraction; the `Vm`/firewall variants are the operator-tier
/// raw compute surface.
#[derive(Debug, Clone)]
pub enum CommandRequest {
    Create {
        template_name: String,
        instance_name: String,
        zone: Option<String>,
        custom_params_json: Option<String>,
        auto_shutdown_hours: Option<i64>,
    },
    ListTemplates,
    ListMine,
    Status {
        instance_name: String,
    },
    Start {
        instance_name: String,
    },
    Stop {
        instance_name: String,
    },
    Delete {
        instance_name: String,
    },
    GetLog {
        instance_name: String,
        serial_port: Option<u8>,
    },

    CreateVm {
        instance_name: String,
        machine_type: Option<String>,
        image_project: Option<String>,
        image_family: Option<String>,
        disk_size_gb: Option<i64>,
        zone: Option<String>,
        startup_script: Option<String>,
        tags: Vec<String>,
    },
    StartVm {
        instance_name: String,
        zone: Option<String>,
    },
    StopVm {
        instance_name: String,
        zone: Option<String>,
    },
    DeleteVm {
        instance_name: String,
        zone: Option<String>,
    },
    OpenPort {
        rule_name: String,
        target_tag: String,
        port: u16,
        protocol: Protocol,
        description: Option<String>,
    },
    ListVms {
        zone: Option<String>,
    },
    DescribeVm {
        instance_name: String,
        zone: Option<String>,
    },
    ListFirewallRules,
    DeleteFirewallRule {
        rule_name: String,
    },
}

impl CommandRequest {
    /// Name recorded in the usage ledger.
    pub fn name(&self) -> &'static str {
        match self {
            CommandRequest::Create { .. } => CREATE_COMMAND,
            CommandRequest::ListTemplates => "list_templates",
            CommandRequest::ListMine => "list_mine",
            CommandRequest::Status { .. } => "server_status",
            CommandRequest::Start { .. } => "start",
            CommandRequest::Stop { .. } => "stop",
            CommandRequest::Delete { .. } => "delete",
            CommandRequest::GetLog { .. } => "get_log",
            CommandRequest::CreateVm { .. } => "create_vm",
            CommandRequest::StartVm { .. } => "start_vm",
            CommandRequest::StopVm { .. } => "stop_vm",
            CommandRequest::DeleteVm { .. } => "delete_vm",
            CommandRequest::OpenPort { .. } => "open_port",
            CommandRequest::ListVms { .. } => "list_vms",
            CommandRequest::DescribeVm { .. } => "describe_vm",
            CommandRequest::ListFirewallRules => "list_firewall_rules",
            CommandRequest::DeleteFirewallRule { .. } => "delete_firewall_rule",
        }
    }

    /// Whether the sliding-window rate limiter applies. Read-only listing
    /// commands are exempt.
    pub fn rate_limited(&self) -> bool {
        !matches!(
            self,
            CommandRequest::ListTemplates
                | CommandRequest::ListMine
                | CommandRequest::Status { .. }
                | CommandRequest::ListVms { .. }
                | CommandRequest::DescribeVm { .. }
                | CommandRequest::ListFirewallRules
        )
    }

    /// Minimum capability tier. Ownership-based access for control actions
    /// is checked by the handler on top of this.
    pub fn required_capability(&self) -> Capability {
        match self {
            CommandRequest::Create { .. } => Capability::Operator,
            CommandRequest::CreateVm { .. }
            | CommandRequest::StartVm { .. }
            | CommandRequest::StopVm { .. }
            | CommandRequest::DeleteVm { .. }
            | CommandRequest::OpenPort { .. }
            | CommandRequest::ListVms { .. }
            | CommandRequest::DescribeVm { .. }
            | CommandRequest::ListFirewallRules
            | CommandRequest::DeleteFirewallRule { .. } => Capability::Operator,
            _ => Capability::User,
        }
    }
}

/// Structured result handed back to the chat adapter for rendering.
#[derive(Debug)]
pub enum CommandOutcome {
    Created(ProvisionReport),
    Templates(Vec<(String, String)>),
    Instances(Vec<InstanceRecord>),
    InstanceStatus(InstanceRecord),
    Started(ActionReport),
    Stopped(ActionReport),
    Deleted {
        instance_name: String,
        report: DeleteReport,
    },
    Cancelled {
        subject: String,
    },
    ConfirmationTimedOut {
        subject: String,
    },
    SerialLog {
        instance_name: String,
        serial_port: u8,
        content: String,
    },
    Vms(Vec<InstanceInfo>),
    VmDescribed(InstanceInfo),
    VmCreated {
        instance_name: String,
        ip_address: Option<String>,
    },
    VmActionCompleted {
        action: String,
        instance_name: String,
    },
    PortOpened {
        rule_name: String,
    },
    FirewallRules(Vec<FirewallRule>),
    FirewallRuleDeleted {
        rule_name: String,
    },
}

/// Ordered guard list; the first deny short-circuits dispatch. A
/// rate-limit deny also suppresses the ledger write; any other deny does
/// not.
#[derive(Debug, Clone, Copy)]
enum Guard {
    RateLimit,
    Capability,
}

const GUARDS: [Guard; 2] = [Guard::RateLimit, Guard::Capability];

pub struct CommandHandler {
    store: Arc<VmStore>,
    orchestrator: Arc<ComputeOrchestrator>,
    templates: Arc<TemplateStore>,
    workflow: ProvisioningWorkflow,
    control: ControlService,
    rate_limiter: RateLimiter,
    default_zone: String,
}

impl CommandHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<VmStore>,
        orchestrator: Arc<ComputeOrchestrator>,
        templates: Arc<TemplateStore>,
        workflow: ProvisioningWorkflow,
        control: ControlService,
        rate_limiter: RateLimiter,
        default_zone: String,
    ) -> Self {
        Self {
            store,
            orchestrator,
            templates,
            workflow,
            control,
            rate_limiter,
            default_zone,
        }
    }

    pub async fn dispatch(
        &self,
        ctx: &CommandContext,
        req: CommandRequest,
        gateway: &dyn ChatGateway,
    ) -> Result<CommandOutcome> {
        let denial = self.run_guards(ctx, &req).await;
        let rate_denied = matches!(&denial, Some(CommandError::RateLimited(_)));
        let command_name = req.name();

        let result = match denial {
            Some(err) => Err(err),
            None => self.handle(ctx, req, gateway).await,
        };

        // Every dispatched invocation lands in the ledger — including ones
        // the handler rejected — except rate-limit denials. The write is
        // best-effort and runs after the handler, so a create's cooldown
        // check never sees the invocation it belongs to.
        if !rate_denied {
            if let Err(e) = self.store.record_usage(&ctx.user_id, command_name).await {
                tracing::warn!(user = %ctx.user_id, command = command_name, error = %e, "Usage logging failed");
            }
        }

        result
    }

    async fn run_guards(&self, ctx: &CommandContext, req: &CommandRequest) -> Option<CommandError> {
        for guard in GUARDS {
            match guard {
                Guard::RateLimit => {
                    if !req.rate_limited() {
                        continue;
                    }
                    let is_owner = ctx.capability == Capability::Owner;
                    if self
                        .rate_limiter
                        .admit(&ctx.user_id, req.name(), is_owner)
                        .await
                        == Admission::Denied
                    {
                        return Some(CommandError::RateLimited(
                            "you are sending commands too quickly; try again in a moment"
                                .to_string(),
                        ));
                    }
                }
                Guard::Capability => {
                    let required = req.required_capability();
                    if !ctx.capability.at_least(required) {
                        return Some(CommandError::PermissionDenied(format!(
                            "the {} command requires the {required:?} tier",
                            req.name()
                        )));
                    }
                }
            }
        }
        None
    }

    async fn handle(
        &self,
        ctx: &CommandContext,
        req: CommandRequest,
        gateway: &dyn ChatGateway,
    ) -> Result<CommandOutcome> {
        match req {
            CommandRequest::Create {
                template_name,
                instance_name,
                zone,
                custom_params_json,
                auto_shutdown_hours,
            } => {
                if let Some(hours) = auto_shutdown_hours {
                    if !(1..=MAX_AUTO_SHUTDOWN_HOURS).contains(&hours) {
                        return Err(CommandError::Validation(format!(
                            "auto_shutdown_hours must be between 1 and {MAX_AUTO_SHUTDOWN_HOURS}"
                        )));
                    }
                }
                let report = self
                    .workflow
                    .run(
                        ctx,
                        CreateRequest {
                            template_name,
                            instance_name,
                            zone,
                            custom_params_json,
                            auto_shutdown_hours,
                        },
                        gateway,
                    )
                    .await?;
                Ok(CommandOutcome::Created(report))
            }

            CommandRequest::ListTemplates => {
                Ok(CommandOutcome::Templates(self.templates.summaries()))
            }

            CommandRequest::ListMine => {
                let instances = self.store.list_active_for_owner(&ctx.user_id).await?;
                Ok(CommandOutcome::Instances(instances))
            }

            CommandRequest::Status { instance_name } => {
                // Last-known inventory record, not a live provider query.
                let record = self
                    .store
                    .get_instance(&instance_name)
                    .await?
                    .ok_or_else(|| CommandError::NotFound(instance_name.clone()))?;
                Ok(CommandOutcome::InstanceStatus(record))
            }

            CommandRequest::Start { instance_name } => {
                let report = self.control.start(ctx, &instance_name, gateway).await?;
                Ok(CommandOutcome::Started(report))
            }

            CommandRequest::Stop { instance_name } => {
                let report = self.control.stop(ctx, &instance_name, gateway).await?;
                Ok(CommandOutcome::Stopped(report))
            }

            CommandRequest::Delete { instance_name } => {
                match self.control.delete(ctx, &instance_name, gateway).await? {
                    DeleteOutcome::Deleted(report) => Ok(CommandOutcome::Deleted {
                        instance_name,
                        report,
                    }),
                    DeleteOutcome::Cancelled => Ok(CommandOutcome::Cancelled {
                        subject: instance_name,
                    }),
                    DeleteOutcome::ConfirmationTimedOut => {
                        Ok(CommandOutcome::ConfirmationTimedOut {
                            subject: instance_name,
                        })
                    }
                }
            }

            CommandRequest::GetLog {
                instance_name,
                serial_port,
            } => {
                let port = serial_port.unwrap_or(2);
                if !(2..=4).contains(&port) {
                    return Err(CommandError::Validation(
                        "serial port must be 2, 3, or 4".to_string(),
                    ));
                }
                let record = self
                    .store
                    .get_instance(&instance_name)
                    .await?
                    .ok_or_else(|| CommandError::NotFound(instance_name.clone()))?;
                if !ctx.capability.at_least(Capability::Admin)
                    && ctx.user_id != record.owner_user_id
                {
                    return Err(CommandError::PermissionDenied(format!(
                        "you do not own `{instance_name}` and cannot read its logs"
                    )));
                }
                let content = self
                    .orchestrator
                    .serial_port_output(&instance_name, &record.zone, port)
                    .await?;
                Ok(CommandOutcome::SerialLog {
                    instance_name,
                    serial_port: port,
                    content: tail_chars(&content, SERIAL_LOG_TAIL_CHARS),
                })
            }

            CommandRequest::CreateVm {
                instance_name,
                machine_type,
                image_project,
                image_family,
                disk_size_gb,
                zone,
                startup_script,
                tags,
            } => {
                let zone = zone.unwrap_or_else(|| self.default_zone.clone());
                let vm = self
                    .orchestrator
                    .create_instance(CreateInstanceRequest {
                        name: instance_name,
                        zone,
                        machine_type: machine_type.unwrap_or_else(|| "e2-medium".to_string()),
                        image_project: image_project
                            .unwrap_or_else(|| "debian-cloud".to_string()),
                        image_family: image_family.unwrap_or_else(|| "debian-12".to_string()),
                        disk_size_gb: disk_size_gb.unwrap_or(20),
                        owner_user_id: ctx.user_id.clone(),
                        startup_script,
                        extra_tags: tags,
                        extra_labels: Default::default(),
                    })
                    .await?;
                Ok(CommandOutcome::VmCreated {
                    instance_name: vm.name,
                    ip_address: vm.external_ip,
                })
            }

            CommandRequest::StartVm {
                instance_name,
                zone,
            } => {
                let zone = zone.unwrap_or_else(|| self.default_zone.clone());
                self.orchestrator
                    .control(ControlAction::Start, &instance_name, &zone)
                    .await?;
                Ok(CommandOutcome::VmActionCompleted {
                    action: "start".to_string(),
                    instance_name,
                })
            }

            CommandRequest::StopVm {
                instance_name,
                zone,
            } => {
                let zone = zone.unwrap_or_else(|| self.default_zone.clone());
                self.orchestrator
                    .control(ControlAction::Stop, &instance_name, &zone)
                    .await?;
                Ok(CommandOutcome::VmActionCompleted {
                    action: "stop".to_string(),
                    instance_name,
                })
            }

            CommandRequest::DeleteVm {
                instance_name,
                zone,
            } => {
                let zone = zone.unwrap_or_else(|| self.default_zone.clone());
                let prompt = format!(
                    "Delete the VM `{instance_name}` in zone `{zone}`? This is irreversible."
                );
                match gateway.confirm(ctx, &prompt).await {
                    Confirmation::Confirmed => {}
                    Confirmation::Cancelled => {
                        return Ok(CommandOutcome::Cancelled {
                            subject: instance_name,
                        });
                    }
                    Confirmation::TimedOut => {
                        return Ok(CommandOutcome::ConfirmationTimedOut {
                            subject: instance_name,
                        });
                    }
                }
                self.orchestrator
                    .control(ControlAction::Delete, &instance_name, &zone)
                    .await?;
                Ok(CommandOutcome::VmActionCompleted {
                    action: "delete".to_string(),
                    instance_name,
                })
            }

            CommandRequest::OpenPort {
                rule_name,
                target_tag,
                port,
                protocol,
                description,
            } => {
                self.orchestrator
                    .open_port(&rule_name, &target_tag, port, protocol, description.as_deref())
                    .await?;
                Ok(CommandOutcome::PortOpened { rule_name })
            }

            CommandRequest::ListVms { zone } => {
                let zone = zone.unwrap_or_else(|| self.default_zone.clone());
                let vms = self.orchestrator.list_instances(&zone).await?;
                Ok(CommandOutcome::Vms(vms))
            }

            CommandRequest::DescribeVm {
                instance_name,
                zone,
            } => {
                let zone = zone.unwrap_or_else(|| self.default_zone.clone());
                let info = self
                    .orchestrator
                    .instance_details(&instance_name, &zone)
                    .await?;
                Ok(CommandOutcome::VmDescribed(info))
            }

            CommandRequest::ListFirewallRules => {
                let rules = self.orchestrator.list_firewall_rules().await?;
                Ok(CommandOutcome::FirewallRules(rules))
            }

            CommandRequest::DeleteFirewallRule { rule_name } => {
                let prompt = format!(
                    "Delete the firewall rule `{rule_name}`? This is irreversible."
                );
                match gateway.confirm(ctx, &prompt).await {
                    Confirmation::Confirmed => {}
                    Confirmation::Cancelled => {
                        return Ok(CommandOutcome::Cancelled { subject: rule_name });
                    }
                    Confirmation::TimedOut => {
                        return Ok(CommandOutcome::ConfirmationTimedOut { subject: rule_name });
                    }
                }
                self.orchestrator.delete_firewall_rule(&rule_name).await?;
                Ok(CommandOutcome::FirewallRuleDeleted { rule_name })
            }
        }
    }
}

/// Last `max` characters of a string, on char boundaries.
fn tail_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    s.chars().skip(count - max).collect()
}
