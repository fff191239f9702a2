//! The capability set every cloud adapter implements.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use cumulus_core::Limits;

use crate::error::CloudResult;

/// Tag identifying instances created by this provisioner.
pub const CREATOR_KEY: &str = "creator";
pub const CREATOR_VALUE: &str = "prominence";
/// Deployment id carried on every instance.
pub const INFRA_ID_KEY: &str = "prominence-infra-id";
/// Per-attempt id carried on every instance.
pub const UNIQUE_INFRA_ID_KEY: &str = "prominence-unique-infra-id";

/// Cloud-side instance name for an attempt.
pub fn instance_name(unique_infra_id: &str) -> String {
    format!("prominence-{unique_infra_id}")
}

/// What to create.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSpec {
    pub name: String,
    /// Cloud-side image handle.
    pub image: String,
    /// Cloud-side flavor name.
    pub flavor: String,
    /// `None` lets the adapter pick its default network.
    pub network: Option<String>,
    pub security_groups: Vec<String>,
    /// Rendered user-data (plain text; adapters encode as required).
    pub userdata: String,
    /// Root disk in GiB; 0 keeps the flavor's disk.
    pub disk_gb: u32,
    pub infra_id: String,
    pub unique_infra_id: String,
    /// Extra tags from the cloud descriptor.
    pub tags: HashMap<String, String>,
}

impl InstanceSpec {
    /// Metadata written on the instance: the descriptor tags plus the
    /// ownership keys, which always win.
    pub fn metadata(&self) -> HashMap<String, String> {
        let mut metadata = self.tags.clone();
        metadata.insert(CREATOR_KEY.to_string(), CREATOR_VALUE.to_string());
        metadata.insert(INFRA_ID_KEY.to_string(), self.infra_id.clone());
        metadata.insert(UNIQUE_INFRA_ID_KEY.to_string(), self.unique_infra_id.clone());
        metadata
    }
}

/// Common instance status vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Pending,
    Stopped,
    Terminated,
    Error,
    Unknown,
    NotFound,
}

/// An instance as listed by an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: String,
    pub name: String,
    pub status: InstanceStatus,
    pub metadata: HashMap<String, String>,
}

impl InstanceInfo {
    pub fn infra_id(&self) -> Option<&str> {
        self.metadata.get(INFRA_ID_KEY).map(String::as_str)
    }

    pub fn unique_infra_id(&self) -> Option<&str> {
        self.metadata.get(UNIQUE_INFRA_ID_KEY).map(String::as_str)
    }

    pub fn is_ours(&self) -> bool {
        self.metadata.get(CREATOR_KEY).map(String::as_str) == Some(CREATOR_VALUE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlavorInfo {
    pub id: String,
    pub name: String,
    pub cpus: u32,
    pub memory_gb: f64,
    pub disk_gb: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    pub name: String,
    pub os_type: Option<String>,
    pub architecture: Option<String>,
    pub distribution: Option<String>,
    pub version: Option<String>,
}

/// Quota information; either part may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Quotas {
    pub limits: Option<Limits>,
    /// Remaining capacity, when the cloud reports usage.
    pub remaining: Option<Limits>,
}

/// Cloud back-end capabilities.
///
/// Memory is GiB everywhere. `delete_instance` treats an already missing
/// instance as deleted. `list_instances` returns only instances carrying
/// the `creator=prominence` tag.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Create an instance and return its cloud-side handle.
    async fn create_instance(&self, spec: &InstanceSpec) -> CloudResult<String>;

    async fn delete_instance(&self, handle: &str) -> CloudResult<()>;

    async fn list_instances(&self) -> CloudResult<Vec<InstanceInfo>>;

    async fn get_instance(&self, name: &str, handle: &str) -> CloudResult<InstanceStatus>;

    async fn list_flavors(&self) -> CloudResult<Vec<FlavorInfo>>;

    async fn list_images(&self) -> CloudResult<Vec<ImageInfo>>;

    async fn get_quotas(&self) -> CloudResult<Quotas>;
}
