//! Cloud descriptors: admin-defined (static JSON) or built from EGI discovery.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::STATIC_IDENTITY;

/// A named cloud back-end: site + region + credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudDescriptor {
    pub name: String,
    /// Always `cloud` for this provisioner.
    #[serde(rename = "type", default = "cloud_type")]
    pub kind: String,
    /// Site name used by site whitelists/preferences; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(default)]
    pub region: String,
    pub credentials: CloudCredentials,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    /// Groups allowed to use this cloud; empty means unconstrained.
    #[serde(default)]
    pub supported_groups: Vec<String>,
    /// Identities allowed to use this cloud; empty means everyone.
    #[serde(default)]
    pub supported_identities: Vec<String>,
    #[serde(default)]
    pub image_templates: Vec<ImageTemplate>,
    #[serde(default)]
    pub default_images: Vec<ImageEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavour_filters: Option<FlavourFilters>,
    /// Extra metadata added to every instance.
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// Admin-imposed limits; override anything the adapter reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quotas: Option<Limits>,
}

fn cloud_type() -> String {
    "cloud".to_string()
}

/// How to reach a cloud's API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CloudCredentials {
    /// Adapter tag, e.g. `openstack`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub auth_url: String,
    #[serde(default)]
    pub project_id: String,
    /// Keystone federation protocol (`openid`).
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_identity_provider")]
    pub identity_provider: String,
    /// Whose token is used: the cloud's service account or the request identity.
    #[serde(default)]
    pub token_scope: TokenScope,
    /// Service-account OIDC client; required for `TokenScope::Cloud`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc: Option<OidcRefresh>,
}

fn default_protocol() -> String {
    "openid".to_string()
}

fn default_identity_provider() -> String {
    "egi.eu".to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenScope {
    #[default]
    Cloud,
    Identity,
}

/// Refresh-token grant parameters for a service account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OidcRefresh {
    pub url: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default)]
    pub scope: String,
}

/// A logical image resolved by cloud-side image name during refresh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageTemplate {
    pub name: String,
    /// Cloud-side image name to look up; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    #[serde(rename = "type")]
    pub os_type: String,
    pub architecture: String,
    pub distribution: String,
    pub version: String,
}

/// A logical image with a fixed cloud-side id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageEntry {
    pub name: String,
    pub id: String,
    #[serde(rename = "type")]
    pub os_type: String,
    pub architecture: String,
    pub distribution: String,
    pub version: String,
}

/// Bounds applied to flavors before they are stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FlavourFilters {
    #[serde(default)]
    pub cpus_min: Option<u32>,
    #[serde(default)]
    pub cpus_max: Option<u32>,
    #[serde(default)]
    pub memory_min: Option<f64>,
    #[serde(default)]
    pub memory_max: Option<f64>,
    /// Only flavors whose name starts with this prefix.
    #[serde(default)]
    pub name_prefix: Option<String>,
}

impl FlavourFilters {
    pub fn accepts(&self, name: &str, cpus: u32, memory_gb: f64) -> bool {
        self.cpus_min.is_none_or(|m| cpus >= m)
            && self.cpus_max.is_none_or(|m| cpus <= m)
            && self.memory_min.is_none_or(|m| memory_gb >= m)
            && self.memory_max.is_none_or(|m| memory_gb <= m)
            && self
                .name_prefix
                .as_deref()
                .is_none_or(|p| name.starts_with(p))
    }
}

/// Static resource limits. `None` means unknown / unconstrained.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Limits {
    #[serde(default)]
    pub cpus: Option<u64>,
    /// GiB.
    #[serde(default)]
    pub memory: Option<f64>,
    #[serde(default)]
    pub instances: Option<u64>,
}

impl Limits {
    /// Field-wise `self`, falling back to `other` where unknown.
    pub fn or(self, other: Limits) -> Limits {
        Limits {
            cpus: self.cpus.or(other.cpus),
            memory: self.memory.or(other.memory),
            instances: self.instances.or(other.instances),
        }
    }

    /// Whether these limits leave room for the given totals.
    pub fn allows(&self, cpus: u64, memory: f64, instances: u64) -> bool {
        self.cpus.is_none_or(|l| cpus <= l)
            && self.memory.is_none_or(|l| memory <= l)
            && self.instances.is_none_or(|l| instances <= l)
    }
}

impl CloudDescriptor {
    /// Identity under which this cloud's facts are stored: service-account
    /// clouds are shared by everyone, identity-scoped ones are per user.
    pub fn facts_identity<'a>(&self, identity: &'a str) -> &'a str {
        match self.credentials.token_scope {
            TokenScope::Cloud => STATIC_IDENTITY,
            TokenScope::Identity => identity,
        }
    }

    /// Site name used for whitelists and preferences.
    pub fn site(&self) -> &str {
        self.site.as_deref().unwrap_or(&self.name)
    }

    /// Whether `identity` may see this cloud.
    pub fn visible_to(&self, identity: &str) -> bool {
        identity == STATIC_IDENTITY
            || self.supported_identities.is_empty()
            || self.supported_identities.iter().any(|i| i == identity)
    }
}

/// Load the admin-defined cloud list from a JSON file.
pub fn load_cloud_file(path: &Path) -> anyhow::Result<Vec<CloudDescriptor>> {
    let content = std::fs::read_to_string(path)?;
    let clouds: Vec<CloudDescriptor> = serde_json::from_str(&content)?;
    Ok(clouds)
}
