//! The external worker directory.
//!
//! The batch system publishes a snapshot of its pool as a JSON list. Each
//! entry names the deployment (`id`) and the per-attempt instance
//! (`unique_id`) it runs on.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::WorkersResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Deployment id (`prominence-infra-id`).
    pub id: String,
    /// Instance id (`prominence-unique-infra-id`).
    pub unique_id: String,
    #[serde(default)]
    pub site: String,
    #[serde(default)]
    pub slots_in_use: u32,
}

#[async_trait]
pub trait WorkerDirectory: Send + Sync {
    async fn workers(&self) -> WorkersResult<Vec<Worker>>;

    /// `unique_id`s of every live worker.
    async fn unique_ids(&self) -> WorkersResult<HashSet<String>> {
        Ok(self.workers().await?.into_iter().map(|w| w.unique_id).collect())
    }
}

/// Reads the worker list from an HTTP endpoint.
pub struct HttpWorkerDirectory {
    client: reqwest::Client,
    url: String,
}

impl HttpWorkerDirectory {
    pub fn new(url: impl Into<String>) -> WorkersResult<Self> {
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
impl WorkerDirectory for HttpWorkerDirectory {
    async fn workers(&self) -> WorkersResult<Vec<Worker>> {
        let workers: Vec<Worker> = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(url = %self.url, workers = workers.len(), "worker directory fetched");
        Ok(workers)
    }
}

/// A fixed, replaceable worker list. Used when no directory is configured
/// and in tests.
#[derive(Debug, Default)]
pub struct StaticWorkerDirectory {
    workers: Mutex<Vec<Worker>>,
}

impl StaticWorkerDirectory {
    pub fn new(workers: Vec<Worker>) -> Self {
        Self {
            workers: Mutex::new(workers),
        }
    }

    pub fn set(&self, workers: Vec<Worker>) {
        *self.workers.lock().unwrap_or_else(|p| p.into_inner()) = workers;
    }
}

#[async_trait]
impl WorkerDirectory for StaticWorkerDirectory {
    async fn workers(&self) -> WorkersResult<Vec<Worker>> {
        Ok(self.workers.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }
}
