//! Where idle jobs come from.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AutoscaleResult;

/// A queued job that no worker has picked up yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdleJob {
    pub id: String,
    pub identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub cpus: u32,
    /// GiB.
    #[serde(default)]
    pub memory: f64,
    /// GiB.
    #[serde(default)]
    pub disk: f64,
}

#[async_trait]
pub trait JobSource: Send + Sync {
    async fn idle_jobs(&self) -> AutoscaleResult<Vec<IdleJob>>;
}

/// Fetches idle jobs as a JSON list from the batch system.
pub struct HttpJobSource {
    client: reqwest::Client,
    url: String,
}

impl HttpJobSource {
    pub fn new(url: impl Into<String>) -> AutoscaleResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl JobSource for HttpJobSource {
    async fn idle_jobs(&self) -> AutoscaleResult<Vec<IdleJob>> {
        let jobs: Vec<IdleJob> = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(url = %self.url, jobs = jobs.len(), "idle jobs fetched");
        Ok(jobs)
    }
}

#[derive(Debug, Default)]
pub struct StaticJobSource {
    jobs: Mutex<Vec<IdleJob>>,
}

impl StaticJobSource {
    pub fn new(jobs: Vec<IdleJob>) -> Self {
        Self {
            jobs: Mutex::new(jobs),
        }
    }

    pub fn set(&self, jobs: Vec<IdleJob>) {
        *self.jobs.lock().unwrap_or_else(|p| p.into_inner()) = jobs;
    }
}

#[async_trait]
impl JobSource for StaticJobSource {
    async fn idle_jobs(&self) -> AutoscaleResult<Vec<IdleJob>> {
        Ok(self.jobs.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }
}
