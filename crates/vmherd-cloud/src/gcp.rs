//! GCE REST v1 implementation of [`ComputeApi`].

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::error::{ComputeError, Result};
use crate::{
    AllowedEntry, ComputeApi, FirewallRule, FirewallSpec, InstanceInfo, InstanceSpec,
    OperationError, OperationRef, OperationStatus,
};

const COMPUTE_ENDPOINT: &str = "https://compute.googleapis.com/compute/v1";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Where the bearer token comes from.
///
/// `Static` carries a pre-issued access token supplied by the credential
/// loader; `MetadataServer` fetches and caches tokens from the GCE metadata
/// endpoint, which is the normal mode when the bot itself runs on GCP.
pub enum TokenSource {
    Static(String),
    MetadataServer,
}

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

pub struct GcpComputeApi {
    project_id: String,
    client: Client,
    token_source: TokenSource,
    cached_token: Mutex<Option<CachedToken>>,
}

impl GcpComputeApi {
    pub fn new(project_id: &str, token_source: TokenSource) -> Result<Self> {
        let client = Client::builder()
            .use_rustls_tls()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            project_id: project_id.to_string(),
            client,
            token_source,
            cached_token: Mutex::new(None),
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    async fn access_token(&self) -> Result<String> {
        match &self.token_source {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::MetadataServer => {
                let mut cached = self.cached_token.lock().await;
                if let Some(token) = cached.as_ref() {
                    // Refresh one minute before expiry
                    if token.expires_at - Duration::seconds(60) > Utc::now() {
                        return Ok(token.value.clone());
                    }
                }
                let response = self
                    .client
                    .get(METADATA_TOKEN_URL)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await?;
                let status = response.status();
                let body = response.text().await?;
                if !status.is_success() {
                    return Err(ComputeError::Auth(format!(
                        "metadata server returned status={status}, body={body}"
                    )));
                }
                let payload: Value = serde_json::from_str(&body)?;
                let value = payload
                    .get("access_token")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        ComputeError::Auth("metadata token response missing access_token".into())
                    })?
                    .to_string();
                let expires_in = payload
                    .get("expires_in")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                *cached = Some(CachedToken {
                    value: value.clone(),
                    expires_at: Utc::now() + Duration::seconds(expires_in),
                });
                Ok(value)
            }
        }
    }

    /// Sends one request. Non-2xx statuses become typed errors before any
    /// field extraction; a 2xx payload is returned as-is, because Operation
    /// resources legitimately carry an `error` object that the polling
    /// layer interprets.
    async fn call(&self, method: reqwest::Method, url: &str, body: Option<Value>) -> Result<Value> {
        let token = self.access_token().await?;
        let mut request = self.client.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ComputeError::HttpStatus {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn get(&self, url: &str) -> Result<Value> {
        self.call(reqwest::Method::GET, url, None).await
    }

    async fn post(&self, url: &str, body: Option<Value>) -> Result<Value> {
        self.call(reqwest::Method::POST, url, body).await
    }

    async fn delete(&self, url: &str) -> Result<Value> {
        self.call(reqwest::Method::DELETE, url, None).await
    }

    fn zone_url(&self, zone: &str, suffix: &str) -> String {
        format!(
            "{COMPUTE_ENDPOINT}/projects/{}/zones/{zone}/{suffix}",
            self.project_id
        )
    }

    fn global_url(&self, suffix: &str) -> String {
        format!(
            "{COMPUTE_ENDPOINT}/projects/{}/global/{suffix}",
            self.project_id
        )
    }

    /// Follows `nextPageToken` until the listing is exhausted.
    async fn list_paged(&self, base_url: &str) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let url = match &page_token {
                Some(token) => format!("{base_url}?pageToken={token}"),
                None => base_url.to_string(),
            };
            let page = self.get(&url).await?;
            if let Some(page_items) = page.get("items").and_then(|v| v.as_array()) {
                items.extend(page_items.iter().cloned());
            }
            match page.get("nextPageToken").and_then(|v| v.as_str()) {
                Some(token) if !token.is_empty() => page_token = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(items)
    }

    fn instance_body(&self, zone: &str, spec: &InstanceSpec) -> Value {
        let machine_type_uri = format!(
            "projects/{}/zones/{zone}/machineTypes/{}",
            self.project_id, spec.machine_type
        );
        let metadata_items: Vec<Value> = spec
            .metadata
            .iter()
            .map(|item| json!({ "key": &item.key, "value": &item.value }))
            .collect();
        json!({
            "name": &spec.name,
            "machineType": machine_type_uri,
            "disks": [{
                "boot": true,
                "autoDelete": true,
                "initializeParams": {
                    "sourceImage": &spec.source_image,
                    "diskSizeGb": spec.disk_size_gb.to_string(),
                },
            }],
            "networkInterfaces": [{
                "network": format!("projects/{}/global/networks/default", self.project_id),
                "accessConfigs": [{ "type": "ONE_TO_ONE_NAT", "name": "External NAT" }],
            }],
            "labels": &spec.labels,
            "tags": { "items": &spec.tags },
            "metadata": { "items": metadata_items },
        })
    }
}

fn parse_operation(json: &Value, zone: Option<&str>) -> Result<OperationRef> {
    let name = json
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ComputeError::Api {
            code: "missing-field".to_string(),
            message: "operation response has no name".to_string(),
        })?;
    Ok(OperationRef {
        name: name.to_string(),
        zone: zone.map(|z| z.to_string()),
    })
}

fn parse_operation_status(json: &Value) -> OperationStatus {
    let done = json
        .get("status")
        .and_then(|v| v.as_str())
        .map(|s| s == "DONE")
        .unwrap_or(false);
    let errors = json
        .pointer("/error/errors")
        .and_then(|v| v.as_array())
        .map(|entries| {
            entries
                .iter()
                .map(|e| OperationError {
                    code: e
                        .get("code")
                        .and_then(|v| v.as_str())
                        .unwrap_or("UNKNOWN")
                        .to_string(),
                    message: e
                        .get("message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    OperationStatus { done, errors }
}

fn parse_instance(json: &Value) -> InstanceInfo {
    let external_ip = json
        .pointer("/networkInterfaces/0/accessConfigs/0/natIP")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let internal_ip = json
        .pointer("/networkInterfaces/0/networkIP")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let machine_type = json
        .get("machineType")
        .and_then(|v| v.as_str())
        .and_then(|uri| uri.rsplit('/').next())
        .map(|s| s.to_string());
    let tags = json
        .pointer("/tags/items")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|t| t.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    let labels = json
        .get("labels")
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    InstanceInfo {
        // Instance ids are uint64 and may arrive as numbers or strings
        id: json.get("id").map(|v| match v.as_str() {
            Some(s) => s.to_string(),
            None => v.to_string(),
        }),
        name: json
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        status: json
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        machine_type,
        external_ip,
        internal_ip,
        tags,
        labels,
        creation_timestamp: json
            .get("creationTimestamp")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    }
}

fn parse_firewall(json: &Value) -> FirewallRule {
    let target_tags = json
        .get("targetTags")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|t| t.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    let allowed = json
        .get("allowed")
        .and_then(|v| v.as_array())
        .map(|entries| {
            entries
                .iter()
                .map(|e| AllowedEntry {
                    ip_protocol: e
                        .get("IPProtocol")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    ports: e
                        .get("ports")
                        .and_then(|v| v.as_array())
                        .map(|ports| {
                            ports
                                .iter()
                                .filter_map(|p| p.as_str().map(|s| s.to_string()))
                                .collect()
                        })
                        .unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();
    let source_ranges = json
        .get("sourceRanges")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|r| r.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    FirewallRule {
        name: json
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        target_tags,
        allowed,
        source_ranges,
        description: json
            .get("description")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    }
}

#[async_trait::async_trait]
impl ComputeApi for GcpComputeApi {
    async fn latest_image(&self, image_project: &str, family: &str) -> Result<String> {
        let url = format!(
            "{COMPUTE_ENDPOINT}/projects/{image_project}/global/images/family/{family}"
        );
        let json = self.get(&url).await?;
        json.get("selfLink")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ComputeError::Api {
                code: "missing-field".to_string(),
                message: format!("image family {family} has no selfLink"),
            })
    }

    async fn insert_instance(&self, zone: &str, spec: &InstanceSpec) -> Result<OperationRef> {
        let body = self.instance_body(zone, spec);
        let json = self.post(&self.zone_url(zone, "instances"), Some(body)).await?;
        parse_operation(&json, Some(zone))
    }

    async fn get_instance(&self, zone: &str, name: &str) -> Result<InstanceInfo> {
        let json = self
            .get(&self.zone_url(zone, &format!("instances/{name}")))
            .await?;
        Ok(parse_instance(&json))
    }

    async fn list_instances(&self, zone: &str) -> Result<Vec<InstanceInfo>> {
        let items = self.list_paged(&self.zone_url(zone, "instances")).await?;
        Ok(items.iter().map(parse_instance).collect())
    }

    async fn start_instance(&self, zone: &str, name: &str) -> Result<OperationRef> {
        let json = self
            .post(&self.zone_url(zone, &format!("instances/{name}/start")), None)
            .await?;
        parse_operation(&json, Some(zone))
    }

    async fn stop_instance(&self, zone: &str, name: &str) -> Result<OperationRef> {
        let json = self
            .post(&self.zone_url(zone, &format!("instances/{name}/stop")), None)
            .await?;
        parse_operation(&json, Some(zone))
    }

    async fn delete_instance(&self, zone: &str, name: &str) -> Result<OperationRef> {
        let json = self
            .delete(&self.zone_url(zone, &format!("instances/{name}")))
            .await?;
        parse_operation(&json, Some(zone))
    }

    async fn get_zone_operation(&self, zone: &str, name: &str) -> Result<OperationStatus> {
        let json = self
            .get(&self.zone_url(zone, &format!("operations/{name}")))
            .await?;
        Ok(parse_operation_status(&json))
    }

    async fn get_global_operation(&self, name: &str) -> Result<OperationStatus> {
        let json = self.get(&self.global_url(&format!("operations/{name}"))).await?;
        Ok(parse_operation_status(&json))
    }

    async fn insert_firewall(&self, spec: &FirewallSpec) -> Result<OperationRef> {
        let description = spec.description.clone().unwrap_or_else(|| {
            format!(
                "Allow {} traffic on port {} for tag {}",
                spec.protocol, spec.port, spec.target_tag
            )
        });
        let body = json!({
            "name": &spec.name,
            "description": description,
            "network": format!("projects/{}/global/networks/default", self.project_id),
            "priority": 1000,
            "direction": "INGRESS",
            "allowed": [{
                "IPProtocol": spec.protocol.as_str().to_lowercase(),
                "ports": [spec.port.to_string()],
            }],
            "targetTags": [&spec.target_tag],
            "sourceRanges": ["0.0.0.0/0"],
        });
        let json = self.post(&self.global_url("firewalls"), Some(body)).await?;
        parse_operation(&json, None)
    }

    async fn delete_firewall(&self, name: &str) -> Result<OperationRef> {
        let json = self
            .delete(&self.global_url(&format!("firewalls/{name}")))
            .await?;
        parse_operation(&json, None)
    }

    async fn list_firewalls(&self) -> Result<Vec<FirewallRule>> {
        let items = self.list_paged(&self.global_url("firewalls")).await?;
        Ok(items.iter().map(parse_firewall).collect())
    }

    async fn get_serial_output(&self, zone: &str, name: &str, port: u8) -> Result<String> {
        let url = format!(
            "{}?port={port}",
            self.zone_url(zone, &format!("instances/{name}/serialPort"))
        );
        let json = self.get(&url).await?;
        Ok(json
            .get("contents")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }
}
