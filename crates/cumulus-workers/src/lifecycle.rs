//! Worker-lifecycle loop.
//!
//! Moves running deployments through `visible` and `left` as their workers
//! join and leave the pool, and asks for deletion of deployments whose
//! workers never joined or left for too long. A failed directory fetch
//! changes nothing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use cumulus_core::{Config, epoch_secs};
use cumulus_state::DeploymentStatus::{self, DeletionRequested, Left, Running, Visible};
use cumulus_state::Store;

use crate::directory::WorkerDirectory;
use crate::error::WorkersResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleReport {
    pub joined: u32,
    pub left: u32,
    pub rejoined: u32,
    pub expired: u32,
    pub never_joined: u32,
}

pub struct WorkerLifecycle {
    store: Store,
    directory: Arc<dyn WorkerDirectory>,
    config: Arc<Config>,
}

impl WorkerLifecycle {
    pub fn new(store: Store, directory: Arc<dyn WorkerDirectory>, config: Arc<Config>) -> Self {
        Self {
            store,
            directory,
            config,
        }
    }

    pub async fn run_once(&self, now: u64) -> WorkersResult<LifecycleReport> {
        let workers = self.directory.workers().await?;
        let present: HashSet<&str> = workers.iter().map(|w| w.id.as_str()).collect();
        let limits = &self.config.workers;
        let mut report = LifecycleReport::default();

        for d in self.store.list_deployments_by_status(&[Running, Visible, Left])? {
            let joined = present.contains(d.id.as_str());
            let (to, counter) = match d.status {
                Running if joined => (Visible, &mut report.joined),
                Running if now.saturating_sub(d.created) > limits.max_time_since_creation => {
                    (DeletionRequested, &mut report.never_joined)
                }
                Visible if !joined => (Left, &mut report.left),
                Left if joined => (Visible, &mut report.rejoined),
                Left if now.saturating_sub(d.updated) > limits.time_after_left => {
                    (DeletionRequested, &mut report.expired)
                }
                _ => continue,
            };
            if self.store.transition(&d.id, &[d.status], to, None)? {
                info!(deployment_id = %d.id, from = %d.status, %to, "worker lifecycle transition");
                *counter += 1;
            }
        }
        Ok(report)
    }

    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "worker lifecycle started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.run_once(epoch_secs()).await {
                        Ok(report) => debug!(?report, "worker lifecycle tick"),
                        Err(e) => error!(error = %e, "worker lifecycle tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("worker lifecycle shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{StaticWorkerDirectory, Worker};
    use crate::error::WorkersError;
    use async_trait::async_trait;
    use cumulus_core::Description;
    use cumulus_state::Deployment;

    fn worker(id: &str) -> Worker {
        Worker {
            id: id.into(),
            unique_id: format!("{id}-u"),
            site: "alpha".into(),
            slots_in_use: 1,
        }
    }

    fn put(store: &Store, id: &str, status: DeploymentStatus, created: u64, updated: u64) {
        let mut d = Deployment::new(id, "alice", Description::default(), created);
        d.status = status;
        d.updated = updated;
        store.put_deployment(&d).unwrap();
    }

    fn status(store: &Store, id: &str) -> DeploymentStatus {
        store.get_deployment(id).unwrap().unwrap().status
    }

    fn lifecycle(store: &Store, directory: Arc<dyn WorkerDirectory>) -> WorkerLifecycle {
        let mut config = Config::default();
        config.workers.time_after_left = 600;
        config.workers.max_time_since_creation = 3600;
        WorkerLifecycle::new(store.clone(), directory, Arc::new(config))
    }

    #[tokio::test]
    async fn transitions_follow_the_worker_list() {
        let store = Store::open_in_memory().unwrap();
        let now = 100_000;
        put(&store, "joins", Running, now - 60, now - 60);
        put(&store, "slow", Running, now - 60, now - 60);
        put(&store, "never", Running, now - 4000, now - 4000);
        put(&store, "leaves", Visible, now - 500, now - 500);
        put(&store, "back", Left, now - 500, now - 100);
        put(&store, "gone", Left, now - 5000, now - 700);
        put(&store, "recent", Left, now - 5000, now - 100);

        let directory = Arc::new(StaticWorkerDirectory::new(vec![worker("joins"), worker("back")]));
        let report = lifecycle(&store, directory).run_once(now).await.unwrap();

        assert_eq!(
            report,
            LifecycleReport {
                joined: 1,
                left: 1,
                rejoined: 1,
                expired: 1,
                never_joined: 1,
            }
        );
        assert_eq!(status(&store, "joins"), Visible);
        assert_eq!(status(&store, "slow"), Running);
        assert_eq!(status(&store, "never"), DeletionRequested);
        assert_eq!(status(&store, "leaves"), Left);
        assert_eq!(status(&store, "back"), Visible);
        assert_eq!(status(&store, "gone"), DeletionRequested);
        assert_eq!(status(&store, "recent"), Left);
    }

    struct Broken;

    #[async_trait]
    impl WorkerDirectory for Broken {
        async fn workers(&self) -> WorkersResult<Vec<Worker>> {
            Err(WorkersError::Directory("unavailable".into()))
        }
    }

    #[tokio::test]
    async fn failed_fetch_changes_nothing() {
        let store = Store::open_in_memory().unwrap();
        put(&store, "d1", Visible, 0, 0);
        assert!(lifecycle(&store, Arc::new(Broken)).run_once(100_000).await.is_err());
        assert_eq!(status(&store, "d1"), Visible);
    }
}
