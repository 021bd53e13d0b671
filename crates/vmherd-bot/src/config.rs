use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub gcp: GcpConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub auto_shutdown: AutoShutdownConfig,
    #[serde(default)]
    pub templates: TemplatesConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Identities the chat adapter uses to resolve capability tiers. The core
/// never reads these directly; it only sees the resolved tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub owner_user_ids: Vec<String>,
    #[serde(default)]
    pub admin_role_id: Option<String>,
    #[serde(default)]
    pub operator_role_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcpConfig {
    pub project_id: String,
    #[serde(default = "default_zone")]
    pub default_zone: String,
    /// Pre-issued OAuth access token. When unset, tokens are fetched from
    /// the GCE metadata server.
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_commands_per_minute")]
    pub max_commands_per_minute: u64,
    #[serde(default = "default_excluded_commands")]
    pub rate_limit_excluded_commands: Vec<String>,
    /// 0 disables the active-instance check.
    #[serde(default = "default_max_active_instances")]
    pub max_active_instances_per_user: usize,
    /// 0 disables the creation cooldown.
    #[serde(default = "default_create_cooldown_secs")]
    pub create_cooldown_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_commands_per_minute: default_max_commands_per_minute(),
            rate_limit_excluded_commands: default_excluded_commands(),
            max_active_instances_per_user: default_max_active_instances(),
            create_cooldown_secs: default_create_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoShutdownConfig {
    #[serde(default = "default_auto_shutdown_enabled")]
    pub enabled: bool,
    #[serde(default = "default_auto_shutdown_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

impl Default for AutoShutdownConfig {
    fn default() -> Self {
        Self {
            enabled: default_auto_shutdown_enabled(),
            tick_secs: default_auto_shutdown_tick_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplatesConfig {
    #[serde(default = "default_templates_path")]
    pub path: String,
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            path: default_templates_path(),
        }
    }
}

fn default_zone() -> String {
    "europe-west1-b".to_string()
}

fn default_db_url() -> String {
    "sqlite://data/vmherd.db?mode=rwc".to_string()
}

fn default_max_commands_per_minute() -> u64 {
    20
}

fn default_excluded_commands() -> Vec<String> {
    ["help", "ping", "status"].map(String::from).to_vec()
}

fn default_max_active_instances() -> usize {
    2
}

fn default_create_cooldown_secs() -> u64 {
    300
}

fn default_auto_shutdown_enabled() -> bool {
    true
}

fn default_auto_shutdown_tick_secs() -> u64 {
    600
}

fn default_stop_timeout_secs() -> u64 {
    180
}

fn default_templates_path() -> String {
    "config/game_templates.json".to_string()
}

impl BotConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: BotConfig = toml::from_str(
            r#"
            [gcp]
            project_id = "my-project"
            "#,
        )
        .unwrap();
        assert_eq!(config.gcp.default_zone, "europe-west1-b");
        assert_eq!(config.limits.max_commands_per_minute, 20);
        assert_eq!(config.limits.max_active_instances_per_user, 2);
        assert_eq!(config.limits.create_cooldown_secs, 300);
        assert!(config.auto_shutdown.enabled);
        assert_eq!(config.auto_shutdown.tick_secs, 600);
        assert!(config
            .limits
            .rate_limit_excluded_commands
            .contains(&"ping".to_string()));
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config: BotConfig = toml::from_str(
            r#"
            [gcp]
            project_id = "my-project"
            default_zone = "us-central1-a"

            [limits]
            max_commands_per_minute = 5
            create_cooldown_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.gcp.default_zone, "us-central1-a");
        assert_eq!(config.limits.max_commands_per_minute, 5);
        assert_eq!(config.limits.create_cooldown_secs, 0);
    }
}
