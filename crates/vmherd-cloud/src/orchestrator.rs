//! Drives provider operations to completion and computes the derived
//! tag/label sets for new VMs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ComputeError, Result};
use crate::naming;
use crate::{
    ComputeApi, FirewallRule, FirewallSpec, InstanceInfo, InstanceSpec, MetadataItem,
    OperationRef,
};
use vmherd_common::types::Protocol;

/// Fixed-interval polling bounds for one class of operation. There is no
/// backoff: the interval stays constant until the timeout trips.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollPolicy {
    /// Instance create/start/stop/delete: 300s bound, 5s interval.
    pub fn zonal() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            interval: Duration::from_secs(5),
        }
    }

    /// Firewall create/delete (global operations): 180s bound, 3s interval.
    pub fn global() -> Self {
        Self {
            timeout: Duration::from_secs(180),
            interval: Duration::from_secs(3),
        }
    }
}

/// Lifecycle action on an existing instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Start,
    Stop,
    Delete,
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ControlAction::Start => "start",
            ControlAction::Stop => "stop",
            ControlAction::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Inputs for a new VM, before tag/label/image resolution.
#[derive(Debug, Clone)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub zone: String,
    pub machine_type: String,
    pub image_project: String,
    pub image_family: String,
    pub disk_size_gb: i64,
    pub owner_user_id: String,
    pub startup_script: Option<String>,
    pub extra_tags: Vec<String>,
    pub extra_labels: BTreeMap<String, String>,
}

/// What a successful create yields.
#[derive(Debug, Clone)]
pub struct ProvisionedVm {
    pub name: String,
    pub cloud_id: Option<String>,
    pub external_ip: Option<String>,
    pub zone: String,
}

pub struct ComputeOrchestrator {
    api: Arc<dyn ComputeApi>,
    zonal_poll: PollPolicy,
    global_poll: PollPolicy,
}

impl ComputeOrchestrator {
    pub fn new(api: Arc<dyn ComputeApi>) -> Self {
        Self::with_poll_policies(api, PollPolicy::zonal(), PollPolicy::global())
    }

    pub fn with_poll_policies(
        api: Arc<dyn ComputeApi>,
        zonal_poll: PollPolicy,
        global_poll: PollPolicy,
    ) -> Self {
        Self {
            api,
            zonal_poll,
            global_poll,
        }
    }

    /// Creates a VM and waits for it to exist: validate the name, resolve
    /// the image family, submit the insert, poll the operation, then
    /// re-fetch the instance for its external IP.
    pub async fn create_instance(&self, req: CreateInstanceRequest) -> Result<ProvisionedVm> {
        naming::validate_instance_name(&req.name)?;

        let source_image = self
            .api
            .latest_image(&req.image_project, &req.image_family)
            .await?;
        tracing::debug!(instance = %req.name, image = %source_image, "Resolved source image");

        let mut labels = naming::base_labels(&req.owner_user_id);
        labels.extend(req.extra_labels);
        let tags = naming::merged_tags(&req.name, &req.extra_tags);
        let mut metadata = Vec::new();
        if let Some(script) = req.startup_script {
            metadata.push(MetadataItem {
                key: "startup-script".to_string(),
                value: script,
            });
        }

        let spec = InstanceSpec {
            name: req.name.clone(),
            machine_type: req.machine_type,
            source_image,
            disk_size_gb: req.disk_size_gb,
            metadata,
            tags,
            labels,
        };

        let op = self.api.insert_instance(&req.zone, &spec).await?;
        tracing::info!(instance = %req.name, operation = %op.name, "VM create submitted");
        self.wait_zone_operation(&req.zone, &op).await?;

        let info = self.api.get_instance(&req.zone, &req.name).await?;
        tracing::info!(
            instance = %info.name,
            ip = info.external_ip.as_deref().unwrap_or("none"),
            "VM created"
        );
        Ok(ProvisionedVm {
            name: info.name,
            cloud_id: info.id,
            external_ip: info.external_ip,
            zone: req.zone,
        })
    }

    /// Submits a start/stop/delete and waits for the operation.
    pub async fn control(&self, action: ControlAction, name: &str, zone: &str) -> Result<()> {
        let op = match action {
            ControlAction::Start => self.api.start_instance(zone, name).await?,
            ControlAction::Stop => self.api.stop_instance(zone, name).await?,
            ControlAction::Delete => self.api.delete_instance(zone, name).await?,
        };
        tracing::info!(instance = name, %action, operation = %op.name, "Control action submitted");
        self.wait_zone_operation(zone, &op).await
    }

    /// Opens one ingress port for a tag, world-reachable, and waits for the
    /// global operation.
    pub async fn open_port(
        &self,
        rule_name: &str,
        target_tag: &str,
        port: u16,
        protocol: Protocol,
        description: Option<&str>,
    ) -> Result<()> {
        let spec = FirewallSpec {
            name: rule_name.to_string(),
            target_tag: target_tag.to_string(),
            port,
            protocol,
            description: description.map(|s| s.to_string()),
        };
        let op = self.api.insert_firewall(&spec).await?;
        tracing::info!(rule = rule_name, tag = target_tag, port, operation = %op.name, "Firewall rule submitted");
        self.wait_global_operation(&op).await
    }

    pub async fn delete_firewall_rule(&self, rule_name: &str) -> Result<()> {
        let op = self.api.delete_firewall(rule_name).await?;
        tracing::info!(rule = rule_name, operation = %op.name, "Firewall delete submitted");
        self.wait_global_operation(&op).await
    }

    /// All project rules whose target tags include `tag`. Lists the whole
    /// project and filters client-side; called only on the delete path.
    pub async fn find_rules_by_tag(&self, tag: &str) -> Result<Vec<FirewallRule>> {
        let rules = self.api.list_firewalls().await?;
        Ok(rules
            .into_iter()
            .filter(|rule| rule.target_tags.iter().any(|t| t == tag))
            .collect())
    }

    pub async fn list_firewall_rules(&self) -> Result<Vec<FirewallRule>> {
        self.api.list_firewalls().await
    }

    pub async fn instance_details(&self, name: &str, zone: &str) -> Result<InstanceInfo> {
        self.api.get_instance(zone, name).await
    }

    pub async fn list_instances(&self, zone: &str) -> Result<Vec<InstanceInfo>> {
        self.api.list_instances(zone).await
    }

    pub async fn serial_port_output(&self, name: &str, zone: &str, port: u8) -> Result<String> {
        if !(1..=4).contains(&port) {
            return Err(ComputeError::InvalidSerialPort(port));
        }
        self.api.get_serial_output(zone, name, port).await
    }

    async fn wait_zone_operation(&self, zone: &str, op: &OperationRef) -> Result<()> {
        self.wait_operation(op, self.zonal_poll, Some(zone)).await
    }

    async fn wait_global_operation(&self, op: &OperationRef) -> Result<()> {
        self.wait_operation(op, self.global_poll, None).await
    }

    /// Polls `op` at a fixed interval until DONE or the bound trips. Errors
    /// from a poll itself are not retried; they propagate as-is.
    async fn wait_operation(
        &self,
        op: &OperationRef,
        policy: PollPolicy,
        zone: Option<&str>,
    ) -> Result<()> {
        let start = tokio::time::Instant::now();
        loop {
            let status = match zone {
                Some(zone) => self.api.get_zone_operation(zone, &op.name).await?,
                None => self.api.get_global_operation(&op.name).await?,
            };
            if status.done {
                if !status.errors.is_empty() {
                    let message = status
                        .errors
                        .iter()
                        .map(|e| format!("code={}, message={}", e.code, e.message))
                        .collect::<Vec<_>>()
                        .join("; ");
                    tracing::error!(operation = %op.name, %message, "Operation failed");
                    return Err(ComputeError::OperationFailed {
                        operation: op.name.clone(),
                        message,
                    });
                }
                tracing::debug!(operation = %op.name, "Operation completed");
                return Ok(());
            }
            if start.elapsed() >= policy.timeout {
                tracing::error!(operation = %op.name, "Operation timed out");
                return Err(ComputeError::OperationTimeout {
                    operation: op.name.clone(),
                    waited_secs: policy.timeout.as_secs(),
                });
            }
            tokio::time::sleep(policy.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AllowedEntry, OperationError, OperationStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted provider: operations complete after a configurable number
    /// of polls, and every submitted spec is recorded for inspection.
    #[derive(Default)]
    struct MockApi {
        polls_until_done: usize,
        poll_count: AtomicUsize,
        operation_errors: Vec<OperationError>,
        never_completes: bool,
        instance_ip: Option<String>,
        recorded_spec: Mutex<Option<InstanceSpec>>,
        firewall_rules: Vec<FirewallRule>,
        api_calls: AtomicUsize,
    }

    impl MockApi {
        fn status(&self) -> OperationStatus {
            if self.never_completes {
                return OperationStatus {
                    done: false,
                    errors: vec![],
                };
            }
            let polled = self.poll_count.fetch_add(1, Ordering::SeqCst);
            if polled >= self.polls_until_done {
                OperationStatus {
                    done: true,
                    errors: self.operation_errors.clone(),
                }
            } else {
                OperationStatus {
                    done: false,
                    errors: vec![],
                }
            }
        }

        fn op(&self, zone: Option<&str>) -> OperationRef {
            OperationRef {
                name: "operation-test".to_string(),
                zone: zone.map(|z| z.to_string()),
            }
        }
    }

    #[async_trait::async_trait]
    impl ComputeApi for MockApi {
        async fn latest_image(&self, image_project: &str, family: &str) -> crate::Result<String> {
            self.api_calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!(
                "projects/{image_project}/global/images/{family}-v20250801"
            ))
        }

        async fn insert_instance(
            &self,
            zone: &str,
            spec: &InstanceSpec,
        ) -> crate::Result<OperationRef> {
            self.api_calls.fetch_add(1, Ordering::SeqCst);
            *self.recorded_spec.lock().unwrap() = Some(spec.clone());
            Ok(self.op(Some(zone)))
        }

        async fn get_instance(&self, _zone: &str, name: &str) -> crate::Result<InstanceInfo> {
            self.api_calls.fetch_add(1, Ordering::SeqCst);
            Ok(InstanceInfo {
                id: Some("12345".to_string()),
                name: name.to_string(),
                status: "RUNNING".to_string(),
                external_ip: self.instance_ip.clone(),
                ..Default::default()
            })
        }

        async fn list_instances(&self, _zone: &str) -> crate::Result<Vec<InstanceInfo>> {
            Ok(vec![])
        }

        async fn start_instance(&self, zone: &str, _name: &str) -> crate::Result<OperationRef> {
            self.api_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.op(Some(zone)))
        }

        async fn stop_instance(&self, zone: &str, _name: &str) -> crate::Result<OperationRef> {
            self.api_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.op(Some(zone)))
        }

        async fn delete_instance(&self, zone: &str, _name: &str) -> crate::Result<OperationRef> {
            self.api_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.op(Some(zone)))
        }

        async fn get_zone_operation(
            &self,
            _zone: &str,
            _name: &str,
        ) -> crate::Result<OperationStatus> {
            Ok(self.status())
        }

        async fn get_global_operation(&self, _name: &str) -> crate::Result<OperationStatus> {
            Ok(self.status())
        }

        async fn insert_firewall(&self, _spec: &FirewallSpec) -> crate::Result<OperationRef> {
            self.api_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.op(None))
        }

        async fn delete_firewall(&self, _name: &str) -> crate::Result<OperationRef> {
            self.api_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.op(None))
        }

        async fn list_firewalls(&self) -> crate::Result<Vec<FirewallRule>> {
            Ok(self.firewall_rules.clone())
        }

        async fn get_serial_output(
            &self,
            _zone: &str,
            _name: &str,
            _port: u8,
        ) -> crate::Result<String> {
            Ok("boot log".to_string())
        }
    }

    fn fast_policies() -> (PollPolicy, PollPolicy) {
        let policy = PollPolicy {
            timeout: Duration::from_secs(1),
            interval: Duration::from_millis(50),
        };
        (policy, policy)
    }

    fn make_request(name: &str) -> CreateInstanceRequest {
        CreateInstanceRequest {
            name: name.to_string(),
            zone: "europe-west1-b".to_string(),
            machine_type: "e2-medium".to_string(),
            image_project: "debian-cloud".to_string(),
            image_family: "debian-12".to_string(),
            disk_size_gb: 20,
            owner_user_id: "42".to_string(),
            startup_script: Some("#!/bin/bash\necho up".to_string()),
            extra_tags: vec!["game-server".to_string()],
            extra_labels: BTreeMap::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn create_polls_until_done_and_refetches_ip() {
        let api = Arc::new(MockApi {
            polls_until_done: 3,
            instance_ip: Some("203.0.113.9".to_string()),
            ..Default::default()
        });
        let (zonal, global) = fast_policies();
        let orch = ComputeOrchestrator::with_poll_policies(api.clone(), zonal, global);

        let vm = orch.create_instance(make_request("my-server1")).await.unwrap();
        assert_eq!(vm.external_ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(vm.cloud_id.as_deref(), Some("12345"));

        let spec = api.recorded_spec.lock().unwrap().clone().unwrap();
        assert!(spec.tags.contains(&naming::BASE_TAG.to_string()));
        assert!(spec.tags.contains(&"gameserv-my-server1".to_string()));
        assert!(spec.tags.contains(&"game-server".to_string()));
        assert_eq!(spec.labels.get("managed-by").unwrap(), "vmherd");
        assert_eq!(spec.labels.get("created-by").unwrap(), "42");
        assert_eq!(spec.metadata[0].key, "startup-script");
    }

    #[tokio::test(start_paused = true)]
    async fn create_times_out_when_operation_never_completes() {
        let api = Arc::new(MockApi {
            never_completes: true,
            ..Default::default()
        });
        let (zonal, global) = fast_policies();
        let orch = ComputeOrchestrator::with_poll_policies(api, zonal, global);

        let err = orch
            .create_instance(make_request("my-server1"))
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got: {err}");
    }

    #[tokio::test(start_paused = true)]
    async fn operation_error_surfaces_as_failure_not_timeout() {
        let api = Arc::new(MockApi {
            operation_errors: vec![OperationError {
                code: "QUOTA_EXCEEDED".to_string(),
                message: "Quota 'CPUS' exceeded".to_string(),
            }],
            ..Default::default()
        });
        let (zonal, global) = fast_policies();
        let orch = ComputeOrchestrator::with_poll_policies(api, zonal, global);

        let err = orch
            .create_instance(make_request("my-server1"))
            .await
            .unwrap_err();
        match err {
            ComputeError::OperationFailed { message, .. } => {
                assert!(message.contains("QUOTA_EXCEEDED"));
            }
            other => panic!("expected OperationFailed, got: {other}"),
        }
    }

    #[tokio::test]
    async fn invalid_name_is_rejected_before_any_api_call() {
        let api = Arc::new(MockApi::default());
        let orch = ComputeOrchestrator::new(api.clone());

        let err = orch
            .create_instance(make_request("My_Server"))
            .await
            .unwrap_err();
        assert!(matches!(err, ComputeError::InvalidName(_)));
        assert_eq!(api.api_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn control_actions_poll_to_completion() {
        let api = Arc::new(MockApi {
            polls_until_done: 2,
            ..Default::default()
        });
        let (zonal, global) = fast_policies();
        let orch = ComputeOrchestrator::with_poll_policies(api, zonal, global);

        orch.control(ControlAction::Stop, "my-server1", "europe-west1-b")
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn open_port_uses_global_operation_polling() {
        let api = Arc::new(MockApi {
            polls_until_done: 1,
            ..Default::default()
        });
        let (zonal, global) = fast_policies();
        let orch = ComputeOrchestrator::with_poll_policies(api, zonal, global);

        orch.open_port(
            "allow-srv-25565-tcp",
            "gameserv-srv",
            25565,
            Protocol::Tcp,
            None,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn find_rules_by_tag_filters_client_side() {
        let mine = FirewallRule {
            name: "allow-srv-25565-tcp".to_string(),
            target_tags: vec!["gameserv-srv".to_string()],
            allowed: vec![AllowedEntry {
                ip_protocol: "tcp".to_string(),
                ports: vec!["25565".to_string()],
            }],
            ..Default::default()
        };
        let other = FirewallRule {
            name: "allow-web".to_string(),
            target_tags: vec!["web".to_string()],
            ..Default::default()
        };
        let api = Arc::new(MockApi {
            firewall_rules: vec![mine, other],
            ..Default::default()
        });
        let orch = ComputeOrchestrator::new(api);

        let rules = orch.find_rules_by_tag("gameserv-srv").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "allow-srv-25565-tcp");
    }

    #[tokio::test]
    async fn serial_port_range_is_enforced() {
        let api = Arc::new(MockApi::default());
        let orch = ComputeOrchestrator::new(api);

        assert!(matches!(
            orch.serial_port_output("srv", "z", 5).await.unwrap_err(),
            ComputeError::InvalidSerialPort(5)
        ));
        assert_eq!(
            orch.serial_port_output("srv", "z", 2).await.unwrap(),
            "boot log"
        );
    }
}
