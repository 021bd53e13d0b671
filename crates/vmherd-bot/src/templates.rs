//! Game-server template catalog and startup-script rendering.
//!
//! Templates are a JSON file keyed by template name. A startup script is a
//! shell script with `{name}` placeholders; parameters come from the
//! template's declared defaults with user-supplied overrides on top.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vmherd_common::types::{PortSpec, Protocol};

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("unknown template '{0}'")]
    UnknownTemplate(String),

    #[error("malformed custom parameter JSON: {0}")]
    BadOverrides(String),

    #[error("startup script references undefined parameter '{0}'")]
    MissingParam(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigParam {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplatePort {
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default)]
    pub description: Option<String>,
}

impl TemplatePort {
    pub fn spec(&self) -> PortSpec {
        PortSpec {
            port: self.port,
            protocol: self.protocol,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameTemplate {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_image_project")]
    pub image_project: String,
    #[serde(default = "default_image_family")]
    pub image_family: String,
    #[serde(default = "default_machine_type")]
    pub machine_type: String,
    #[serde(default = "default_disk_size_gb")]
    pub disk_size_gb: i64,
    #[serde(default)]
    pub default_ports: Vec<TemplatePort>,
    #[serde(default)]
    pub additional_tags: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub startup_script_template: Option<String>,
    #[serde(default)]
    pub config_params: Vec<ConfigParam>,
}

fn default_protocol() -> Protocol {
    Protocol::Tcp
}

fn default_image_project() -> String {
    "debian-cloud".to_string()
}

fn default_image_family() -> String {
    "debian-12".to_string()
}

fn default_machine_type() -> String {
    "e2-medium".to_string()
}

fn default_disk_size_gb() -> i64 {
    20
}

pub struct TemplateStore {
    templates: BTreeMap<String, GameTemplate>,
}

impl TemplateStore {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let templates: BTreeMap<String, GameTemplate> = serde_json::from_str(&content)?;
        tracing::info!(count = templates.len(), path = %path.display(), "Game templates loaded");
        Ok(Self { templates })
    }

    pub fn from_map(templates: BTreeMap<String, GameTemplate>) -> Self {
        Self { templates }
    }

    pub fn get(&self, name: &str) -> Option<&GameTemplate> {
        self.templates.get(name)
    }

    /// (key, display name) pairs for the listing command.
    pub fn summaries(&self) -> Vec<(String, String)> {
        self.templates
            .iter()
            .map(|(key, t)| {
                let display = if t.display_name.is_empty() {
                    key.clone()
                } else {
                    t.display_name.clone()
                };
                (key.clone(), display)
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Declared defaults overlaid with the user's JSON overrides. Overrides
/// must be a JSON object; user values win.
pub fn merge_params(
    template: &GameTemplate,
    overrides_json: Option<&str>,
) -> Result<BTreeMap<String, Value>, TemplateError> {
    let mut params = BTreeMap::new();
    for param in &template.config_params {
        params.insert(
            param.name.clone(),
            param.default.clone().unwrap_or(Value::Null),
        );
    }
    if let Some(json) = overrides_json {
        let overrides: Value =
            serde_json::from_str(json).map_err(|e| TemplateError::BadOverrides(e.to_string()))?;
        let Value::Object(map) = overrides else {
            return Err(TemplateError::BadOverrides(
                "custom parameters must be a JSON object".to_string(),
            ));
        };
        for (key, value) in map {
            params.insert(key, value);
        }
    }
    Ok(params)
}

/// Substitutes `{name}` placeholders in a startup script.
///
/// `{{` and `}}` render as literal braces, and `${...}` is left alone so
/// shell parameter expansion keeps working inside the scripts. Any other
/// `{name}` placeholder must be present in `params`.
pub fn render_startup_script(
    script: &str,
    params: &BTreeMap<String, Value>,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(script.len());
    let mut chars = script.chars().peekable();
    let mut prev: Option<char> = None;

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
                prev = Some('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
                prev = Some('}');
            }
            '{' if prev != Some('$') => {
                let mut name = String::new();
                for inner in chars.by_ref() {
                    if inner == '}' {
                        break;
                    }
                    name.push(inner);
                }
                let value = params
                    .get(&name)
                    .ok_or_else(|| TemplateError::MissingParam(name.clone()))?;
                out.push_str(&stringify(value));
                prev = Some('}');
            }
            other => {
                out.push(other);
                prev = Some(other);
            }
        }
    }
    Ok(out)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
