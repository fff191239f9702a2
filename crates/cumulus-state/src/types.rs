//! Row types for the cumulus state store.
//!
//! Every type is JSON-serialized into a redb value column. Timestamps are
//! Unix epoch seconds; memory and disk are GiB.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use cumulus_core::{Description, Limits};

/// Opaque deployment identifier (a UUID string or a client idempotency key).
pub type DeploymentId = String;

// ── Deployment ─────────────────────────────────────────────────────

/// The unit of work: N instances on one cloud.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub description: Description,
    pub status: DeploymentStatus,
    /// Short machine-readable tag, e.g. `NoMatchingResources`.
    pub status_reason: Option<String>,
    pub identity: String,
    /// Job correlation id.
    pub identifier: Option<String>,
    /// Chosen cloud; `None` until bound.
    pub cloud: Option<String>,
    /// Cloud-side handles, one per instance.
    pub cloud_infra_ids: Vec<String>,
    pub resource_type: String,
    pub used_instances: u32,
    pub used_cpus: u32,
    pub used_memory: f64,
    pub created: u64,
    pub updated: u64,
}

impl Deployment {
    /// A fresh `accepted` deployment.
    pub fn new(id: impl Into<String>, identity: impl Into<String>, description: Description, now: u64) -> Self {
        Self {
            id: id.into(),
            description,
            status: DeploymentStatus::Accepted,
            status_reason: None,
            identity: identity.into(),
            identifier: None,
            cloud: None,
            cloud_infra_ids: Vec::new(),
            resource_type: "cloud".to_string(),
            used_instances: 0,
            used_cpus: 0,
            used_memory: 0.0,
            created: now,
            updated: now,
        }
    }
}

/// Deployment lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStatus {
    Accepted,
    Creating,
    Configured,
    Waiting,
    Running,
    Visible,
    Left,
    DeletionRequested,
    Deleting,
    DeletionFailed,
    Deleted,
    Unable,
}

impl DeploymentStatus {
    pub const ALL: [DeploymentStatus; 12] = [
        Self::Accepted,
        Self::Creating,
        Self::Configured,
        Self::Waiting,
        Self::Running,
        Self::Visible,
        Self::Left,
        Self::DeletionRequested,
        Self::Deleting,
        Self::DeletionFailed,
        Self::Deleted,
        Self::Unable,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Creating => "creating",
            Self::Configured => "configured",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Visible => "visible",
            Self::Left => "left",
            Self::DeletionRequested => "deletion-requested",
            Self::Deleting => "deleting",
            Self::DeletionFailed => "deletion-failed",
            Self::Deleted => "deleted",
            Self::Unable => "unable",
        }
    }

    /// `deleted` and `unable` never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Deleted | Self::Unable)
    }

    /// States in which a deletion is pending or done.
    pub fn is_deletion(self) -> bool {
        matches!(
            self,
            Self::DeletionRequested | Self::Deleting | Self::DeletionFailed | Self::Deleted
        )
    }

    /// Targets that must not overwrite a deletion state.
    pub fn is_guarded_target(self) -> bool {
        matches!(
            self,
            Self::Configured | Self::Waiting | Self::Unable | Self::Creating
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown deployment status: {s}"))
    }
}

// ── Deployment log ────────────────────────────────────────────────

/// One cloud-side instance attempt made for a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentLogEntry {
    pub unique_infra_id: String,
    pub id: DeploymentId,
    pub cloud: String,
    /// Set once the cloud has issued a handle.
    pub cloud_infra_id: Option<String>,
    pub created: u64,
}

impl DeploymentLogEntry {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.id, self.unique_infra_id)
    }
}

// ── Cloud facts ───────────────────────────────────────────────────

/// Reachability as seen by the updater or an external monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CloudStatus {
    Up,
    Down,
    #[default]
    Unknown,
}

/// Per-(cloud, identity) facts consumed by the policy engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CloudInfo {
    pub cloud: String,
    pub identity: String,
    pub status: CloudStatus,
    pub mon_status: CloudStatus,
    pub static_limits: Limits,
    /// Dynamic remaining capacity.
    pub remaining: Limits,
    pub updated_quotas: u64,
    pub updated_images: u64,
    pub updated_status: u64,
}

impl CloudInfo {
    pub fn new(cloud: &str, identity: &str) -> Self {
        Self {
            cloud: cloud.to_string(),
            identity: identity.to_string(),
            ..Self::default()
        }
    }

    pub fn table_key(&self) -> String {
        format!("{}/{}", self.cloud, self.identity)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flavor {
    pub cloud: String,
    pub identity: String,
    pub name: String,
    pub cpus: u32,
    pub memory_gb: f64,
    /// `None` when the cloud does not report a root disk size.
    pub disk_gb: Option<f64>,
}

impl Flavor {
    pub fn table_key(&self) -> String {
        format!("{}/{}/{}", self.cloud, self.identity, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Image {
    pub cloud: String,
    pub identity: String,
    /// Logical name.
    pub name: String,
    /// Cloud-side handle.
    pub id: String,
    pub os_type: String,
    pub os_arch: String,
    pub os_dist: String,
    pub os_vers: String,
}

impl Image {
    pub fn table_key(&self) -> String {
        format!("{}/{}/{}", self.cloud, self.identity, self.name)
    }
}

/// An OpenStack endpoint discovered for an identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EgiCloud {
    pub identity: String,
    pub site: String,
    pub auth_url: String,
    pub project_id: String,
    pub project_domain: Option<String>,
    pub region: String,
    pub enabled: bool,
    pub updated: u64,
}

impl EgiCloud {
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.identity, self.site)
    }
}

// ── Tokens ────────────────────────────────────────────────────────

/// Cached access token of a cloud's service account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub cloud: String,
    pub token: String,
    pub creation: u64,
    pub expiry: u64,
}

/// Refresh token and cached access token of an identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserCredential {
    pub identity: String,
    pub refresh_token: String,
    pub access_token: Option<String>,
    pub creation: u64,
    pub expiry: u64,
}

/// Timestamps of the last full refresh for an identity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ResourceUpdate {
    pub start: u64,
    pub time: u64,
}

// ── Stats ─────────────────────────────────────────────────────────

/// Outcome recorded for a deployment attempt on a cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatReason {
    Success,
    VMsFailed,
    WaitingTooLong,
    TotalTooLong,
    QuotaExceeded,
    ImageError,
    FlavorError,
    InsufficientCapacity,
}

impl StatReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::VMsFailed => "VMsFailed",
            Self::WaitingTooLong => "WaitingTooLong",
            Self::TotalTooLong => "TotalTooLong",
            Self::QuotaExceeded => "QuotaExceeded",
            Self::ImageError => "ImageError",
            Self::FlavorError => "FlavorError",
            Self::InsufficientCapacity => "InsufficientCapacity",
        }
    }
}

impl fmt::Display for StatReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentStat {
    pub cloud: String,
    pub identity: String,
    pub reason: StatReason,
    pub time: u64,
    /// Seconds spent before the outcome was known.
    pub duration: u64,
}
