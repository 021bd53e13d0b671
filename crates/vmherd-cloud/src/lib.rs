//! Compute side of the bot: a thin typed client over the GCE REST API and
//! the orchestrator that drives long-running operations to completion.
//!
//! The raw provider surface is the [`ComputeApi`] trait so the workflow and
//! scheduler crates can run against a scripted implementation in tests;
//! [`gcp::GcpComputeApi`] is the production implementation.

pub mod error;
pub mod gcp;
pub mod naming;
pub mod orchestrator;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use vmherd_common::types::Protocol;

pub use error::{ComputeError, Result};
pub use orchestrator::{ComputeOrchestrator, ControlAction, CreateInstanceRequest, PollPolicy, ProvisionedVm};

/// Reference to a long-running provider operation, as returned by every
/// mutating call. Zonal operations carry their zone; firewall operations are
/// global.
#[derive(Debug, Clone)]
pub struct OperationRef {
    pub name: String,
    pub zone: Option<String>,
}

/// Snapshot of a polled operation.
#[derive(Debug, Clone, Default)]
pub struct OperationStatus {
    pub done: bool,
    pub errors: Vec<OperationError>,
}

#[derive(Debug, Clone)]
pub struct OperationError {
    pub code: String,
    pub message: String,
}

/// One metadata key/value attached to an instance (e.g. `startup-script`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataItem {
    pub key: String,
    pub value: String,
}

/// Everything the provider needs to create one VM. The orchestrator builds
/// this from a template plus the computed tag/label sets.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub name: String,
    /// Short machine type name, e.g. `e2-medium`.
    pub machine_type: String,
    /// Fully-qualified source image self link.
    pub source_image: String,
    pub disk_size_gb: i64,
    pub metadata: Vec<MetadataItem>,
    pub tags: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// Ingress allow rule scoped to one network tag, open to all sources.
#[derive(Debug, Clone)]
pub struct FirewallSpec {
    pub name: String,
    pub target_tag: String,
    pub port: u16,
    pub protocol: Protocol,
    pub description: Option<String>,
}

/// A firewall rule as read back from the provider.
#[derive(Debug, Clone, Default)]
pub struct FirewallRule {
    pub name: String,
    pub target_tags: Vec<String>,
    pub allowed: Vec<AllowedEntry>,
    pub source_ranges: Vec<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AllowedEntry {
    pub ip_protocol: String,
    pub ports: Vec<String>,
}

/// Instance state as read back from the provider.
#[derive(Debug, Clone, Default)]
pub struct InstanceInfo {
    pub id: Option<String>,
    pub name: String,
    /// Provider status string (`RUNNING`, `TERMINATED`, ...).
    pub status: String,
    pub machine_type: Option<String>,
    pub external_ip: Option<String>,
    pub internal_ip: Option<String>,
    pub tags: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub creation_timestamp: Option<String>,
}

/// Raw provider calls, one method per REST endpoint the bot touches. No
/// polling or retry lives here; that is the orchestrator's job.
#[async_trait::async_trait]
pub trait ComputeApi: Send + Sync {
    /// Resolves the newest image of a family to its self link.
    async fn latest_image(&self, image_project: &str, family: &str) -> Result<String>;

    async fn insert_instance(&self, zone: &str, spec: &InstanceSpec) -> Result<OperationRef>;
    async fn get_instance(&self, zone: &str, name: &str) -> Result<InstanceInfo>;
    async fn list_instances(&self, zone: &str) -> Result<Vec<InstanceInfo>>;
    async fn start_instance(&self, zone: &str, name: &str) -> Result<OperationRef>;
    async fn stop_instance(&self, zone: &str, name: &str) -> Result<OperationRef>;
    async fn delete_instance(&self, zone: &str, name: &str) -> Result<OperationRef>;

    async fn get_zone_operation(&self, zone: &str, name: &str) -> Result<OperationStatus>;
    async fn get_global_operation(&self, name: &str) -> Result<OperationStatus>;

    async fn insert_firewall(&self, spec: &FirewallSpec) -> Result<OperationRef>;
    async fn delete_firewall(&self, name: &str) -> Result<OperationRef>;
    async fn list_firewalls(&self) -> Result<Vec<FirewallRule>>;

    /// Raw serial console buffer for ports 1-4.
    async fn get_serial_output(&self, zone: &str, name: &str, port: u8) -> Result<String>;
}
