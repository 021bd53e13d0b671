//! Shared fixtures: a scripted compute provider, a recording chat gateway,
//! and a fully wired handler over an in-memory database.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vmherd_bot::commands::CommandHandler;
use vmherd_bot::config::LimitsConfig;
use vmherd_bot::control::ControlService;
use vmherd_bot::gateway::{ChatGateway, CommandContext, Confirmation};
use vmherd_bot::guards::RateLimiter;
use vmherd_bot::provision::ProvisioningWorkflow;
use vmherd_bot::templates::{GameTemplate, TemplateStore};
use vmherd_cloud::{
    ComputeApi, ComputeError, ComputeOrchestrator, FirewallRule, FirewallSpec, InstanceInfo,
    InstanceSpec, OperationRef, OperationStatus,
};
use vmherd_storage::VmStore;

pub const DEFAULT_ZONE: &str = "europe-west1-b";

fn api_error(message: &str) -> ComputeError {
    ComputeError::Api {
        code: "test".to_string(),
        message: message.to_string(),
    }
}

/// Provider double. Operations complete on the first poll; failures are
/// raised at submit time for the calls the individual test scripts.
#[derive(Default)]
pub struct MockComputeApi {
    pub instance_ip: Option<String>,
    pub serial_content: String,
    pub fail_insert_instance: bool,
    pub fail_stop_instance: bool,
    pub fail_delete_instance: bool,
    pub fail_port_inserts: HashSet<u16>,
    pub fail_rule_deletes: HashSet<String>,
    pub firewall_rules: Mutex<Vec<FirewallRule>>,
    pub deleted_rules: Mutex<Vec<String>>,
    pub created_specs: Mutex<Vec<InstanceSpec>>,
    pub create_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
}

impl MockComputeApi {
    fn op(&self, zone: Option<&str>) -> OperationRef {
        OperationRef {
            name: "operation-test".to_string(),
            zone: zone.map(|z| z.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl ComputeApi for MockComputeApi {
    async fn latest_image(
        &self,
        image_project: &str,
        family: &str,
    ) -> vmherd_cloud::Result<String> {
        Ok(format!(
            "projects/{image_project}/global/images/{family}-v20250801"
        ))
    }

    async fn insert_instance(
        &self,
        zone: &str,
        spec: &InstanceSpec,
    ) -> vmherd_cloud::Result<OperationRef> {
        if self.fail_insert_instance {
            return Err(api_error("insert rejected"));
        }
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.created_specs.lock().unwrap().push(spec.clone());
        Ok(self.op(Some(zone)))
    }

    async fn get_instance(&self, _zone: &str, name: &str) -> vmherd_cloud::Result<InstanceInfo> {
        Ok(InstanceInfo {
            id: Some("12345".to_string()),
            name: name.to_string(),
            status: "RUNNING".to_string(),
            external_ip: self.instance_ip.clone(),
            ..Default::default()
        })
    }

    async fn list_instances(&self, _zone: &str) -> vmherd_cloud::Result<Vec<InstanceInfo>> {
        Ok(vec![])
    }

    async fn start_instance(&self, zone: &str, _name: &str) -> vmherd_cloud::Result<OperationRef> {
        Ok(self.op(Some(zone)))
    }

    async fn stop_instance(&self, zone: &str, _name: &str) -> vmherd_cloud::Result<OperationRef> {
        if self.fail_stop_instance {
            return Err(api_error("stop rejected"));
        }
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.op(Some(zone)))
    }

    async fn delete_instance(&self, zone: &str, _name: &str) -> vmherd_cloud::Result<OperationRef> {
        if self.fail_delete_instance {
            return Err(api_error("delete rejected"));
        }
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.op(Some(zone)))
    }

    async fn get_zone_operation(
        &self,
        _zone: &str,
        _name: &str,
    ) -> vmherd_cloud::Result<OperationStatus> {
        Ok(OperationStatus {
            done: true,
            errors: vec![],
        })
    }

    async fn get_global_operation(&self, _name: &str) -> vmherd_cloud::Result<OperationStatus> {
        Ok(OperationStatus {
            done: true,
            errors: vec![],
        })
    }

    async fn insert_firewall(&self, spec: &FirewallSpec) -> vmherd_cloud::Result<OperationRef> {
        if self.fail_port_inserts.contains(&spec.port) {
            return Err(api_error("firewall insert rejected"));
        }
        self.firewall_rules.lock().unwrap().push(FirewallRule {
            name: spec.name.clone(),
            target_tags: vec![spec.target_tag.clone()],
            ..Default::default()
        });
        Ok(self.op(None))
    }

    async fn delete_firewall(&self, name: &str) -> vmherd_cloud::Result<OperationRef> {
        if self.fail_rule_deletes.contains(name) {
            return Err(api_error("firewall delete rejected"));
        }
        self.deleted_rules.lock().unwrap().push(name.to_string());
        Ok(self.op(None))
    }

    async fn list_firewalls(&self) -> vmherd_cloud::Result<Vec<FirewallRule>> {
        Ok(self.firewall_rules.lock().unwrap().clone())
    }

    async fn get_serial_output(
        &self,
        _zone: &str,
        _name: &str,
        _port: u8,
    ) -> vmherd_cloud::Result<String> {
        Ok(self.serial_content.clone())
    }
}

/// Gateway double: records everything, answers confirmations from a script.
pub struct RecordingGateway {
    pub confirm_response: Confirmation,
    pub confirms: Mutex<Vec<String>>,
    pub progress: Mutex<Vec<String>>,
    pub replies: Mutex<Vec<String>>,
    pub notifications: Mutex<Vec<(String, String)>>,
}

impl RecordingGateway {
    pub fn new(confirm_response: Confirmation) -> Self {
        Self {
            confirm_response,
            confirms: Mutex::new(vec![]),
            progress: Mutex::new(vec![]),
            replies: Mutex::new(vec![]),
            notifications: Mutex::new(vec![]),
        }
    }
}

impl Default for RecordingGateway {
    fn default() -> Self {
        Self::new(Confirmation::Confirmed)
    }
}

#[async_trait::async_trait]
impl ChatGateway for RecordingGateway {
    async fn reply(&self, _ctx: &CommandContext, text: &str) {
        self.replies.lock().unwrap().push(text.to_string());
    }

    async fn progress(&self, _ctx: &CommandContext, text: &str) {
        self.progress.lock().unwrap().push(text.to_string());
    }

    async fn confirm(&self, _ctx: &CommandContext, prompt: &str) -> Confirmation {
        self.confirms.lock().unwrap().push(prompt.to_string());
        self.confirm_response
    }

    async fn notify_user(&self, user_id: &str, text: &str) {
        self.notifications
            .lock()
            .unwrap()
            .push((user_id.to_string(), text.to_string()));
    }
}

/// Template catalog used across the tests: one game with two default ports
/// and a parameterized startup script.
pub fn test_templates() -> TemplateStore {
    let template: GameTemplate = serde_json::from_value(serde_json::json!({
        "display_name": "Minecraft (Vanilla Java)",
        "description": "Plain Java edition server",
        "machine_type": "e2-medium",
        "disk_size_gb": 20,
        "default_ports": [
            { "port": 25565, "protocol": "TCP", "description": "Game port" },
            { "port": 25566, "protocol": "UDP", "description": "Query port" },
        ],
        "additional_tags": ["game-server"],
        "startup_script_template": "#!/bin/bash\necho \"motd={server_name}\" > /srv/motd\n",
        "config_params": [
            { "name": "server_name", "description": "MOTD", "default": "A Minecraft Server" },
        ],
    }))
    .unwrap();
    let mut map = BTreeMap::new();
    map.insert("minecraft_vanilla".to_string(), template);
    TemplateStore::from_map(map)
}

pub struct TestEnv {
    pub store: Arc<VmStore>,
    pub api: Arc<MockComputeApi>,
    pub orchestrator: Arc<ComputeOrchestrator>,
    pub handler: CommandHandler,
}

pub async fn test_env(api: MockComputeApi, limits: LimitsConfig) -> TestEnv {
    vmherd_common::id::init(1, 1);
    let store = Arc::new(VmStore::connect("sqlite::memory:").await.unwrap());
    let api = Arc::new(api);
    let orchestrator = Arc::new(ComputeOrchestrator::new(api.clone()));
    let templates = Arc::new(test_templates());

    let workflow = ProvisioningWorkflow::new(
        store.clone(),
        orchestrator.clone(),
        templates.clone(),
        limits.clone(),
        DEFAULT_ZONE.to_string(),
    );
    let control = ControlService::new(store.clone(), orchestrator.clone());
    let rate_limiter = RateLimiter::new(store.clone(), &limits);
    let handler = CommandHandler::new(
        store.clone(),
        orchestrator.clone(),
        templates,
        workflow,
        control,
        rate_limiter,
        DEFAULT_ZONE.to_string(),
    );

    TestEnv {
        store,
        api,
        orchestrator,
        handler,
    }
}

pub fn default_api() -> MockComputeApi {
    MockComputeApi {
        instance_ip: Some("203.0.113.9".to_string()),
        ..Default::default()
    }
}
