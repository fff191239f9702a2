//! Failure classification for instance creation errors.
//!
//! Adapters that know why a create failed set [`FailureKind`] directly.
//! Everything else goes through [`classify_failure`], which is the only
//! place that inspects error text.

use serde::{Deserialize, Serialize};

use cumulus_state::StatReason;

/// Why a cloud refused to create an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    QuotaExceeded,
    ImageError,
    FlavorError,
    InsufficientCapacity,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QuotaExceeded => "QuotaExceeded",
            Self::ImageError => "ImageError",
            Self::FlavorError => "FlavorError",
            Self::InsufficientCapacity => "InsufficientCapacity",
        }
    }

    /// Capacity shortages clear up; retry on the same cloud.
    /// Everything else abandons the cloud for this invocation.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::InsufficientCapacity)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<FailureKind> for StatReason {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::QuotaExceeded => StatReason::QuotaExceeded,
            FailureKind::ImageError => StatReason::ImageError,
            FailureKind::FlavorError => StatReason::FlavorError,
            FailureKind::InsufficientCapacity => StatReason::InsufficientCapacity,
        }
    }
}

const CAPACITY_MARKERS: &[&str] = &[
    "InsufficientInstanceCapacity",
    "insufficient capacity",
    "No valid host",
    "ZONE_RESOURCE_POOL_EXHAUSTED",
    "Out of host capacity",
];
const QUOTA_MARKERS: &[&str] = &["quota", "QuotaExceeded", "LimitExceeded", "exceeded"];
const FLAVOR_MARKERS: &[&str] = &["flavor", "flavour", "InstanceType"];
const IMAGE_MARKERS: &[&str] = &["image"];

/// Map adapter error text to a failure kind (case-insensitive).
///
/// Checked in order: capacity, quota, flavor, image. A message mentioning
/// both a flavor and an image is a flavor problem.
pub fn classify_failure(message: &str) -> Option<FailureKind> {
    let lower = message.to_lowercase();
    let hit = |markers: &[&str]| markers.iter().any(|m| lower.contains(&m.to_lowercase()));

    if hit(CAPACITY_MARKERS) {
        Some(FailureKind::InsufficientCapacity)
    } else if hit(QUOTA_MARKERS) {
        Some(FailureKind::QuotaExceeded)
    } else if hit(FLAVOR_MARKERS) {
        Some(FailureKind::FlavorError)
    } else if hit(IMAGE_MARKERS) {
        Some(FailureKind::ImageError)
    } else {
        None
    }
}
