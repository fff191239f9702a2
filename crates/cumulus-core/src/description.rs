//! Deployment descriptions: what a request asks for.
//!
//! A description is stored verbatim with its deployment row and parsed by
//! the provisioner. Memory and disk are GiB throughout.

use serde::{Deserialize, Serialize};

/// Structured job requirements, preferences, and the node template.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Description {
    pub requirements: Requirements,
    #[serde(default)]
    pub preferences: Preferences,
    /// Base64-encoded user-data template; falls back to the configured one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radl: Option<String>,
}

/// Hard constraints a cloud must satisfy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Requirements {
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub image: ImageRequirements,
    /// Site whitelist; empty means any site.
    #[serde(default)]
    pub sites: Vec<String>,
    /// Region whitelist; empty means any region.
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Per-instance resources and instance count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRequirements {
    pub cores: u32,
    /// GiB.
    pub memory: f64,
    /// GiB.
    #[serde(default)]
    pub disk: f64,
    #[serde(default = "one")]
    pub instances: u32,
    #[serde(default, rename = "coresMax", skip_serializing_if = "Option::is_none")]
    pub cores_max: Option<u32>,
    #[serde(default, rename = "memoryMax", skip_serializing_if = "Option::is_none")]
    pub memory_max: Option<f64>,
    #[serde(default, rename = "diskMax", skip_serializing_if = "Option::is_none")]
    pub disk_max: Option<f64>,
}

fn one() -> u32 {
    1
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cores: 1,
            memory: 1.0,
            disk: 0.0,
            instances: 1,
            cores_max: None,
            memory_max: None,
            disk_max: None,
        }
    }
}

impl ResourceRequirements {
    /// True when any of the `*Max` fields is set.
    pub fn has_max(&self) -> bool {
        self.cores_max.is_some() || self.memory_max.is_some() || self.disk_max.is_some()
    }

    pub fn total_cores(&self) -> u64 {
        u64::from(self.cores) * u64::from(self.instances)
    }

    pub fn total_memory(&self) -> f64 {
        self.memory * f64::from(self.instances)
    }
}

/// Operating-system image constraints. Unset fields match anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ImageRequirements {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub os_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Soft ordering hints; the first entry is the most preferred.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Preferences {
    #[serde(default)]
    pub sites: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_description() {
        let json = r#"{
            "requirements": {
                "resources": {"cores": 4, "memory": 8, "disk": 20, "instances": 3, "coresMax": 16},
                "image": {"type": "linux", "architecture": "x86_64", "distribution": "rocky", "version": "9"},
                "sites": ["alpha"],
                "regions": ["eu"],
                "groups": ["physics"]
            },
            "preferences": {"sites": ["beta", "alpha"]},
            "radl": "aGVsbG8="
        }"#;
        let d: Description = serde_json::from_str(json).unwrap();
        assert_eq!(d.requirements.resources.cores, 4);
        assert_eq!(d.requirements.resources.cores_max, Some(16));
        assert!(d.requirements.resources.has_max());
        assert_eq!(d.requirements.resources.total_cores(), 12);
        assert_eq!(d.requirements.image.os_type.as_deref(), Some("linux"));
        assert_eq!(d.preferences.sites, vec!["beta", "alpha"]);
        assert!(d.preferences.regions.is_empty());
        assert_eq!(d.radl.as_deref(), Some("aGVsbG8="));
    }

    #[test]
    fn minimal_description_defaults() {
        let json = r#"{"requirements": {"resources": {"cores": 1, "memory": 2}}}"#;
        let d: Description = serde_json::from_str(json).unwrap();
        assert_eq!(d.requirements.resources.instances, 1);
        assert_eq!(d.requirements.resources.disk, 0.0);
        assert!(!d.requirements.resources.has_max());
        assert!(d.requirements.sites.is_empty());
        assert_eq!(d.requirements.image, ImageRequirements::default());
    }

    #[test]
    fn max_fields_use_camel_case_on_the_wire() {
        let mut r = ResourceRequirements::default();
        r.memory_max = Some(32.0);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["memoryMax"], 32.0);
        assert!(v.get("coresMax").is_none());
    }
}
