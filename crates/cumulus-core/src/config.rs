//! cumulus.toml configuration parser.
//!
//! Each table mirrors one `section.key` group of the daemon settings. Every
//! key has a default, so an empty file yields a usable configuration.
//! All durations are in seconds.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub polling: PollingConfig,
    pub pool: PoolConfig,
    pub timeouts: TimeoutsConfig,
    pub deployment: DeploymentConfig,
    pub deletion: DeletionConfig,
    pub updates: UpdatesConfig,
    pub cleanup: CleanupConfig,
    pub workers: WorkersConfig,
    pub egi: EgiConfig,
    pub im: ImConfig,
    pub server: ServerConfig,
    pub infrastructure: InfrastructureConfig,
    pub clouds: CloudsConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub scaler: ScalerConfig,
}

/// Loop cadences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub deployer: u64,
    pub destroyer: u64,
    pub cleaning: u64,
    pub workers: u64,
    pub updater: u64,
    pub scaler: u64,
    /// Sleep between instance status polls and between creation retries.
    pub duration: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            deployer: 10,
            destroyer: 10,
            cleaning: 600,
            workers: 60,
            updater: 60,
            scaler: 60,
            duration: 10,
        }
    }
}

/// Worker pool sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub deployers: usize,
    pub deleters: usize,
    pub updaters: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            deployers: 10,
            deleters: 4,
            updaters: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Whole-deployment deadline across all attempts.
    pub total: u64,
    /// Deadline for a single instance to go from pending to running.
    pub notrunning: u64,
    pub configured: u64,
    pub status: u64,
    pub creation: u64,
    pub deletion: u64,
    pub reconfigure: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            total: 1200,
            notrunning: 600,
            configured: 600,
            status: 60,
            creation: 120,
            deletion: 60,
            reconfigure: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Creation attempts per instance per cloud per flavor.
    pub retries: u32,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self { retries: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeletionConfig {
    pub retries: u32,
    pub factor: f64,
}

impl Default for DeletionConfig {
    fn default() -> Self {
        Self {
            retries: 8,
            factor: 1.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatesConfig {
    /// Cooldown before a `waiting` deployment is retried.
    pub waiting: u64,
    /// Minimum age of the last full refresh before another one starts.
    pub discover: u64,
    /// Minimum age of the last full-refresh start (guards overlapping runs).
    pub deadline: u64,
    /// Quota staleness threshold for the provisioner's lazy refresh.
    pub quotas: u64,
    /// Cadence of the fast reachability pass.
    pub fast: u64,
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            waiting: 600,
            discover: 3600,
            deadline: 1800,
            quotas: 600,
            fast: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub retry_failed_deletes_after: u64,
    pub remove_after: u64,
    pub delete_stuck_infras_after: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            retry_failed_deletes_after: 600,
            remove_after: 7 * 86400,
            delete_stuck_infras_after: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub time_after_left: u64,
    pub max_time_since_creation: u64,
    pub shared_worker_cpu_threshold: u32,
    pub shared_worker_cpus: u32,
    pub shared_worker_memory: f64,
    pub shared_worker_disk: f64,
    /// URL of the external worker directory (JSON list of workers).
    pub directory_url: Option<String>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            time_after_left: 600,
            max_time_since_creation: 3600,
            shared_worker_cpu_threshold: 1,
            shared_worker_cpus: 4,
            shared_worker_memory: 8.0,
            shared_worker_disk: 20.0,
            directory_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EgiConfig {
    pub enabled: bool,
    /// Site names never turned into clouds.
    pub blacklist: Vec<String>,
    /// Restrict discovery to sites in this region.
    pub region: Option<String>,
    pub goc_url: String,
    pub credentials: OidcClientConfig,
}

/// OIDC client used to refresh per-identity tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
    /// Issuer base URL; `/token` and `/userinfo` are appended.
    pub url: String,
}

impl Default for OidcClientConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            scope: "openid email profile eduperson_entitlement".to_string(),
            url: String::new(),
        }
    }
}

/// Infrastructure Manager endpoint, consumed by IM-backed adapters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImConfig {
    pub url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address workers call back to; substituted into user data.
    pub ip: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InfrastructureConfig {
    /// Path of the default user-data template.
    pub userdata: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudsConfig {
    /// JSON list of admin-defined cloud descriptors.
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/cumulus/cumulus.redb"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    /// URL of the batch scheduler's idle-job feed (JSON list of jobs).
    pub jobs_url: Option<String>,
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Sleep between instance polls and between creation retries.
    pub fn poll_duration(&self) -> Duration {
        Duration::from_secs(self.polling.duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.pool.deployers, 10);
        assert_eq!(config.deployment.retries, 2);
        assert_eq!(config.updates.waiting, 600);
        assert!(!config.egi.enabled);
        assert!(config.clouds.file.is_none());
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
[polling]
deployer = 5
duration = 1

[pool]
deployers = 2

[deletion]
retries = 3
factor = 2.0

[egi]
enabled = true
blacklist = ["BAD-SITE"]
goc_url = "https://sites.example.org/list.json"

[egi.credentials]
client_id = "abc"
client_secret = "xyz"
url = "https://aai.example.org/oidc"
"#;
        let config = Config::from_toml_str(toml_str).unwrap();
        assert_eq!(config.polling.deployer, 5);
        // Untouched keys keep their defaults.
        assert_eq!(config.polling.destroyer, 10);
        assert_eq!(config.poll_duration(), Duration::from_secs(1));
        assert_eq!(config.pool.deployers, 2);
        assert_eq!(config.pool.deleters, 4);
        assert_eq!(config.deletion.retries, 3);
        assert!(config.egi.enabled);
        assert_eq!(config.egi.blacklist, vec!["BAD-SITE".to_string()]);
        assert_eq!(config.egi.credentials.client_id, "abc");
        assert!(config.egi.credentials.scope.contains("openid"));
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = Config::default();
        config.workers.directory_url = Some("http://pool/workers".to_string());
        let text = config.to_toml_string().unwrap();
        let back = Config::from_toml_str(&text).unwrap();
        assert_eq!(back.workers.directory_url.as_deref(), Some("http://pool/workers"));
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cumulus.toml");
        std::fs::write(&path, "[server]\nip = \"10.1.2.3\"\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.server.ip, "10.1.2.3");
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(Config::from_toml_str("[polling\n").is_err());
    }
}
