use serde::{Deserialize, Serialize};

/// Lifecycle state of a managed instance, as stored in the inventory.
///
/// The string forms round-trip through the database unchanged.
///
/// # Examples
///
/// ```
/// use vmherd_common::types::InstanceStatus;
///
/// let st: InstanceStatus = "RUNNING".parse().unwrap();
/// assert_eq!(st, InstanceStatus::Running);
/// assert_eq!(st.to_string(), "RUNNING");
/// assert!(st.is_active());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// VM create accepted, not yet registered as running.
    Provisioning,
    /// VM came up but no external IP could be determined.
    ProvisioningNoIp,
    Starting,
    Running,
    Stopping,
    /// Stop initiated by the auto-shutdown sweep.
    StoppingAuto,
    /// GCE's stopped state.
    Terminated,
    Deleting,
    /// A control action failed; manual follow-up implied.
    Error,
    /// The auto-shutdown sweep failed to stop the instance.
    ErrorAutoStop,
}

impl InstanceStatus {
    /// Statuses that count against the per-user active-instance quota.
    pub const ACTIVE: &'static [InstanceStatus] = &[
        InstanceStatus::Provisioning,
        InstanceStatus::Running,
        InstanceStatus::Stopping,
        InstanceStatus::Starting,
    ];

    /// Statuses eligible for the auto-shutdown sweep.
    pub const AUTO_SHUTDOWN_CANDIDATES: &'static [InstanceStatus] = &[
        InstanceStatus::Running,
        InstanceStatus::Provisioning,
        InstanceStatus::Starting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Provisioning => "PROVISIONING",
            InstanceStatus::ProvisioningNoIp => "PROVISIONING_FAILED_IP",
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Stopping => "STOPPING",
            InstanceStatus::StoppingAuto => "STOPPING_AUTO",
            InstanceStatus::Terminated => "TERMINATED",
            InstanceStatus::Deleting => "DELETING",
            InstanceStatus::Error => "ERROR",
            InstanceStatus::ErrorAutoStop => "ERROR_AUTO_STOP",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROVISIONING" => Ok(InstanceStatus::Provisioning),
            "PROVISIONING_FAILED_IP" => Ok(InstanceStatus::ProvisioningNoIp),
            "STARTING" => Ok(InstanceStatus::Starting),
            "RUNNING" => Ok(InstanceStatus::Running),
            "STOPPING" => Ok(InstanceStatus::Stopping),
            "STOPPING_AUTO" => Ok(InstanceStatus::StoppingAuto),
            "TERMINATED" => Ok(InstanceStatus::Terminated),
            "DELETING" => Ok(InstanceStatus::Deleting),
            "ERROR" => Ok(InstanceStatus::Error),
            "ERROR_AUTO_STOP" => Ok(InstanceStatus::ErrorAutoStop),
            _ => Err(format!("unknown instance status: {s}")),
        }
    }
}

/// Transport protocol for an opened port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            _ => Err(format!("unknown protocol: {s}")),
        }
    }
}

/// One port opened for an instance, stored as JSON in the inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub port: u16,
    pub protocol: Protocol,
}

impl std::fmt::Display for PortSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

/// Authorization tier resolved by the chat gateway before a command reaches
/// the core. Ordering matters: each tier implies everything below it.
///
/// # Examples
///
/// ```
/// use vmherd_common::types::Capability;
///
/// assert!(Capability::Owner.at_least(Capability::Operator));
/// assert!(!Capability::User.at_least(Capability::Admin));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    User,
    Operator,
    Admin,
    Owner,
}

impl Capability {
    pub fn at_least(&self, required: Capability) -> bool {
        *self >= required
    }
}
