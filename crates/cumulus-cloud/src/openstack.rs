//! OpenStack adapter over the Nova and Glance REST APIs.
//!
//! Authentication happens before construction: the connector hands over a
//! project-scoped Keystone token and its service catalog, from which the
//! compute and image endpoints are picked.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use cumulus_core::{CloudDescriptor, Limits};

use crate::error::{CloudError, CloudResult};
use crate::resource::*;
use crate::token::ScopedToken;

/// A connected OpenStack project.
pub struct OpenStack {
    http: reqwest::Client,
    token: String,
    compute_url: String,
    image_url: Option<String>,
    cloud: String,
}

impl OpenStack {
    pub fn new(http: reqwest::Client, descriptor: &CloudDescriptor, scoped: ScopedToken) -> CloudResult<Self> {
        let region = (!descriptor.region.is_empty()).then_some(descriptor.region.as_str());
        let compute_url = catalog_endpoint(&scoped.catalog, "compute", region).ok_or_else(|| {
            CloudError::InvalidResponse(format!("no compute endpoint in catalog for {}", descriptor.name))
        })?;
        let image_url = catalog_endpoint(&scoped.catalog, "image", region);
        Ok(Self {
            http,
            token: scoped.token,
            compute_url,
            image_url,
            cloud: descriptor.name.clone(),
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.http.get(url).header("X-Auth-Token", &self.token)
    }

    async fn get_json(&self, url: &str) -> CloudResult<Value> {
        let response = self.get(url).send().await?;
        checked(response).await?.json().await.map_err(CloudError::from)
    }
}

/// Public endpoint URL of a service type, preferring `region` when given.
pub fn catalog_endpoint(catalog: &Value, service_type: &str, region: Option<&str>) -> Option<String> {
    let service = catalog
        .as_array()?
        .iter()
        .find(|s| s["type"].as_str() == Some(service_type))?;
    let public: Vec<&Value> = service["endpoints"]
        .as_array()?
        .iter()
        .filter(|e| e["interface"].as_str() == Some("public"))
        .collect();
    let in_region = region.and_then(|r| {
        public.iter().find(|e| {
            e["region"].as_str() == Some(r) || e["region_id"].as_str() == Some(r)
        })
    });
    in_region
        .or_else(|| public.first())
        .and_then(|e| e["url"].as_str())
        .map(|u| u.trim_end_matches('/').to_string())
}

/// Collapse a Nova server status into the common vocabulary.
pub fn translate_status(status: &str) -> InstanceStatus {
    match status {
        "ACTIVE" => InstanceStatus::Running,
        "BUILD" | "REBUILD" | "REBOOT" | "HARD_REBOOT" | "RESIZE" | "VERIFY_RESIZE" | "MIGRATING" => {
            InstanceStatus::Pending
        }
        "SHUTOFF" | "STOPPED" | "PAUSED" | "SUSPENDED" | "SHELVED" | "SHELVED_OFFLOADED" => {
            InstanceStatus::Stopped
        }
        "DELETED" | "SOFT_DELETED" => InstanceStatus::Terminated,
        "ERROR" => InstanceStatus::Error,
        _ => InstanceStatus::Unknown,
    }
}

/// Nova reports unlimited as -1.
fn limit(value: &Value) -> Option<i64> {
    value.as_i64().filter(|v| *v >= 0)
}

/// Absolute limits to static limits and remaining capacity (MiB to GiB).
pub fn parse_limits(body: &Value) -> Quotas {
    let absolute = &body["limits"]["absolute"];
    let cores = limit(&absolute["maxTotalCores"]);
    let ram_mb = limit(&absolute["maxTotalRAMSize"]);
    let instances = limit(&absolute["maxTotalInstances"]);
    let limits = Limits {
        cpus: cores.map(|v| v as u64),
        memory: ram_mb.map(|v| v as f64 / 1024.0),
        instances: instances.map(|v| v as u64),
    };

    let used_cores = absolute["totalCoresUsed"].as_i64();
    let used_ram = absolute["totalRAMUsed"].as_i64();
    let used_instances = absolute["totalInstancesUsed"].as_i64();
    let remaining = (used_cores.is_some() || used_ram.is_some() || used_instances.is_some()).then(|| Limits {
        cpus: cores.map(|max| (max - used_cores.unwrap_or(0)).max(0) as u64),
        memory: ram_mb.map(|max| (max - used_ram.unwrap_or(0)).max(0) as f64 / 1024.0),
        instances: instances.map(|max| (max - used_instances.unwrap_or(0)).max(0) as u64),
    });

    Quotas {
        limits: Some(limits),
        remaining,
    }
}

async fn checked(response: reqwest::Response) -> CloudResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CloudError::Api {
        status: status.as_u16(),
        body,
    })
}

/// Best-effort extraction of Nova's fault message.
fn fault_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.as_object()?
                .values()
                .find_map(|inner| inner["message"].as_str().map(str::to_string))
        })
        .unwrap_or_else(|| body.to_string())
}

#[derive(Debug, Deserialize)]
struct Server {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    fault: Option<Value>,
}

#[async_trait]
impl Resource for OpenStack {
    async fn create_instance(&self, spec: &InstanceSpec) -> CloudResult<String> {
        let flavor = self.find_flavor_id(&spec.flavor).await?;
        let networks = match &spec.network {
            Some(net) => json!([{"uuid": net}]),
            None => json!("auto"),
        };
        let security_groups: Vec<Value> = spec
            .security_groups
            .iter()
            .map(|name| json!({"name": name}))
            .collect();
        let mut server = json!({
            "name": spec.name,
            "imageRef": spec.image,
            "flavorRef": flavor,
            "networks": networks,
            "user_data": STANDARD.encode(spec.userdata.as_bytes()),
            "metadata": spec.metadata(),
        });
        if !security_groups.is_empty() {
            server["security_groups"] = Value::Array(security_groups);
        }
        if spec.disk_gb > 0 {
            server["block_device_mapping_v2"] = json!([{
                "boot_index": 0,
                "uuid": spec.image,
                "source_type": "image",
                "destination_type": "volume",
                "volume_size": spec.disk_gb,
                "delete_on_termination": true,
            }]);
        }

        let response = self
            .http
            .post(format!("{}/servers", self.compute_url))
            .header("X-Auth-Token", &self.token)
            .json(&json!({"server": server}))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::creation(fault_message(&body)));
        }
        let body: Value = response.json().await?;
        let id = body["server"]["id"]
            .as_str()
            .ok_or_else(|| CloudError::InvalidResponse("server id missing from create response".to_string()))?;
        debug!(cloud = %self.cloud, name = %spec.name, handle = id, "server created");
        Ok(id.to_string())
    }

    async fn delete_instance(&self, handle: &str) -> CloudResult<()> {
        let response = self
            .http
            .delete(format!("{}/servers/{handle}", self.compute_url))
            .header("X-Auth-Token", &self.token)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(cloud = %self.cloud, handle, "server already gone");
            return Ok(());
        }
        checked(response).await?;
        Ok(())
    }

    async fn list_instances(&self) -> CloudResult<Vec<InstanceInfo>> {
        let body = self
            .get_json(&format!("{}/servers/detail", self.compute_url))
            .await?;
        let servers: Vec<Server> = serde_json::from_value(body["servers"].clone())
            .map_err(|e| CloudError::InvalidResponse(e.to_string()))?;
        Ok(servers
            .into_iter()
            .map(|s| InstanceInfo {
                status: translate_status(&s.status),
                id: s.id,
                name: s.name,
                metadata: s.metadata,
            })
            .filter(InstanceInfo::is_ours)
            .collect())
    }

    async fn get_instance(&self, _name: &str, handle: &str) -> CloudResult<InstanceStatus> {
        let response = self
            .get(&format!("{}/servers/{handle}", self.compute_url))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(InstanceStatus::NotFound);
        }
        let body: Value = checked(response).await?.json().await?;
        let server: Server = serde_json::from_value(body["server"].clone())
            .map_err(|e| CloudError::InvalidResponse(e.to_string()))?;
        if let Some(fault) = &server.fault {
            warn!(cloud = %self.cloud, handle, fault = %fault, "server reports a fault");
        }
        Ok(translate_status(&server.status))
    }

    async fn list_flavors(&self) -> CloudResult<Vec<FlavorInfo>> {
        let body = self
            .get_json(&format!("{}/flavors/detail", self.compute_url))
            .await?;
        let flavors = body["flavors"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|f| {
                        let disk = f["disk"].as_f64().unwrap_or(0.0);
                        Some(FlavorInfo {
                            id: f["id"].as_str()?.to_string(),
                            name: f["name"].as_str()?.to_string(),
                            cpus: f["vcpus"].as_u64()? as u32,
                            memory_gb: f["ram"].as_f64()? / 1024.0,
                            disk_gb: (disk > 0.0).then_some(disk),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(flavors)
    }

    async fn list_images(&self) -> CloudResult<Vec<ImageInfo>> {
        let Some(image_url) = &self.image_url else {
            return Ok(Vec::new());
        };
        let body = self.get_json(&format!("{image_url}/v2/images")).await?;
        let text = |v: &Value| v.as_str().map(str::to_string);
        let images = body["images"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|i| {
                        Some(ImageInfo {
                            id: i["id"].as_str()?.to_string(),
                            name: i["name"].as_str()?.to_string(),
                            os_type: text(&i["os_type"]),
                            architecture: text(&i["architecture"]),
                            distribution: text(&i["os_distro"]),
                            version: text(&i["os_version"]),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(images)
    }

    async fn get_quotas(&self) -> CloudResult<Quotas> {
        let body = self.get_json(&format!("{}/limits", self.compute_url)).await?;
        Ok(parse_limits(&body))
    }
}

impl OpenStack {
    async fn find_flavor_id(&self, name: &str) -> CloudResult<String> {
        self.list_flavors()
            .await?
            .into_iter()
            .find(|f| f.name == name || f.id == name)
            .map(|f| f.id)
            .ok_or_else(|| CloudError::Creation {
                kind: Some(crate::classify::FailureKind::FlavorError),
                message: format!("flavor {name} not found"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Value {
        json!([
            {"type": "identity", "endpoints": [{"interface": "public", "region": "r1", "url": "https://ks/v3"}]},
            {"type": "compute", "endpoints": [
                {"interface": "internal", "region": "r1", "url": "http://nova.internal/v2.1"},
                {"interface": "public", "region": "r1", "url": "https://nova.r1/v2.1/"},
                {"interface": "public", "region": "r2", "url": "https://nova.r2/v2.1"}
            ]}
        ])
    }

    #[test]
    fn catalog_prefers_region() {
        assert_eq!(
            catalog_endpoint(&catalog(), "compute", Some("r2")).as_deref(),
            Some("https://nova.r2/v2.1")
        );
        assert_eq!(
            catalog_endpoint(&catalog(), "compute", None).as_deref(),
            Some("https://nova.r1/v2.1")
        );
        assert!(catalog_endpoint(&catalog(), "image", None).is_none());
    }

    #[test]
    fn nova_statuses_collapse() {
        assert_eq!(translate_status("ACTIVE"), InstanceStatus::Running);
        assert_eq!(translate_status("BUILD"), InstanceStatus::Pending);
        assert_eq!(translate_status("SHUTOFF"), InstanceStatus::Stopped);
        assert_eq!(translate_status("ERROR"), InstanceStatus::Error);
        assert_eq!(translate_status("WEIRD"), InstanceStatus::Unknown);
    }

    #[test]
    fn limits_are_converted_to_gib() {
        let body = json!({"limits": {"absolute": {
            "maxTotalCores": 64, "maxTotalRAMSize": 131072, "maxTotalInstances": -1,
            "totalCoresUsed": 16, "totalRAMUsed": 32768, "totalInstancesUsed": 4
        }}});
        let q = parse_limits(&body);
        let limits = q.limits.unwrap();
        assert_eq!(limits.cpus, Some(64));
        assert_eq!(limits.memory, Some(128.0));
        assert_eq!(limits.instances, None);
        let remaining = q.remaining.unwrap();
        assert_eq!(remaining.cpus, Some(48));
        assert_eq!(remaining.memory, Some(96.0));
        assert_eq!(remaining.instances, None);
    }

    #[test]
    fn limits_without_usage_have_no_remaining() {
        let body = json!({"limits": {"absolute": {"maxTotalCores": 8}}});
        let q = parse_limits(&body);
        assert_eq!(q.limits.unwrap().cpus, Some(8));
        assert!(q.remaining.is_none());
    }

    #[test]
    fn fault_message_is_extracted() {
        let body = r#"{"forbidden": {"code": 403, "message": "Quota exceeded for cores"}}"#;
        assert_eq!(fault_message(body), "Quota exceeded for cores");
        assert_eq!(fault_message("plain text"), "plain text");
    }
}
