//! Deployer and destroyer dispatch loops.
//!
//! Each tick scans the store for eligible rows, claims each one with a
//! compare-and-set transition and hands it to a [`Handler`] on a bounded
//! pool. There is no queue: when the pool is full the rest of the scan is
//! skipped and the next tick finds those rows again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use cumulus_core::{Config, epoch_secs};
use cumulus_state::{Deployment, DeploymentStatus, Store};

use crate::destroyer::Destroyer;
use crate::error::SchedulerResult;
use crate::provisioner::{ProvisionOutcome, Provisioner};

/// Re-picks of `waiting` rows are spread by up to this many seconds.
pub const WAITING_JITTER_SECS: i64 = 200;

/// The unit of work a dispatcher runs for one claimed deployment.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, id: &str);
}

#[async_trait]
impl Handler for Provisioner {
    async fn handle(&self, id: &str) {
        match self.provision(id).await {
            Ok(ProvisionOutcome::Running { cloud }) => info!(deployment_id = id, %cloud, "provisioned"),
            Ok(outcome) => info!(deployment_id = id, ?outcome, "provisioning finished"),
            Err(e) => {
                error!(deployment_id = id, error = %e, "provisioning failed");
                // Leave the row retryable rather than stuck in `creating`.
                if let Err(e) = self
                    .store()
                    .set_status(id, DeploymentStatus::Waiting, Some(crate::provisioner::DEPLOYMENT_FAILED))
                {
                    error!(deployment_id = id, error = %e, "failed to reset status");
                }
            }
        }
    }
}

#[async_trait]
impl Handler for Destroyer {
    async fn handle(&self, id: &str) {
        match self.destroy(id).await {
            Ok(status) => debug!(deployment_id = id, %status, "destroy finished"),
            Err(e) => {
                error!(deployment_id = id, error = %e, "destroy failed");
                if let Err(e) = self.store().transition(
                    id,
                    &[DeploymentStatus::Deleting],
                    DeploymentStatus::DeletionFailed,
                    None,
                ) {
                    error!(deployment_id = id, error = %e, "failed to mark deletion failed");
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Pick {
    /// `accepted`, plus `waiting` rows older than the cooldown.
    Deploy { waiting_after: u64 },
    /// `deletion-requested`.
    Destroy,
}

pub struct Dispatcher {
    name: &'static str,
    store: Store,
    handler: Arc<dyn Handler>,
    pool: Arc<Semaphore>,
    pick: Pick,
}

impl Dispatcher {
    pub fn deployer(store: Store, handler: Arc<dyn Handler>, config: &Config) -> Self {
        Self {
            name: "deployer",
            store,
            handler,
            pool: Arc::new(Semaphore::new(config.pool.deployers.max(1))),
            pick: Pick::Deploy {
                waiting_after: config.updates.waiting,
            },
        }
    }

    pub fn destroyer(store: Store, handler: Arc<dyn Handler>, config: &Config) -> Self {
        Self {
            name: "destroyer",
            store,
            handler,
            pool: Arc::new(Semaphore::new(config.pool.deleters.max(1))),
            pick: Pick::Destroy,
        }
    }

    fn claim(&self) -> (&'static [DeploymentStatus], DeploymentStatus) {
        match self.pick {
            Pick::Deploy { .. } => (
                &[DeploymentStatus::Accepted, DeploymentStatus::Waiting],
                DeploymentStatus::Creating,
            ),
            Pick::Destroy => (&[DeploymentStatus::DeletionRequested], DeploymentStatus::Deleting),
        }
    }

    /// Eligible rows, oldest first.
    fn candidates(&self, now: u64) -> SchedulerResult<Vec<Deployment>> {
        match self.pick {
            Pick::Deploy { waiting_after } => {
                let mut rows = self.store.list_deployments_by_status(&[DeploymentStatus::Accepted])?;
                let mut rng = rand::thread_rng();
                let waiting = self
                    .store
                    .list_deployments_by_status(&[DeploymentStatus::Waiting])?
                    .into_iter()
                    .filter(|d| {
                        let jitter = rng.gen_range(-WAITING_JITTER_SECS..=WAITING_JITTER_SECS);
                        let age = now.saturating_sub(d.updated) as i64;
                        age > waiting_after as i64 + jitter
                    });
                rows.extend(waiting);
                Ok(rows)
            }
            Pick::Destroy => Ok(self
                .store
                .list_deployments_by_status(&[DeploymentStatus::DeletionRequested])?),
        }
    }

    /// Claim and spawn as many eligible rows as the pool allows.
    /// Returns how many were dispatched.
    pub fn tick(&self, tasks: &mut JoinSet<()>) -> SchedulerResult<usize> {
        let (from, to) = self.claim();
        let mut dispatched = 0;
        for deployment in self.candidates(epoch_secs())? {
            let Ok(permit) = Arc::clone(&self.pool).try_acquire_owned() else {
                debug!(dispatcher = self.name, "pool full, deferring remaining rows");
                break;
            };
            if !self.store.transition(&deployment.id, from, to, None)? {
                continue;
            }
            let handler = Arc::clone(&self.handler);
            let id = deployment.id;
            debug!(dispatcher = self.name, deployment_id = %id, "dispatching");
            tasks.spawn(async move {
                handler.handle(&id).await;
                drop(permit);
            });
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Run the dispatch loop until shutdown, then wait for in-flight work.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(dispatcher = self.name, interval_secs = interval.as_secs(), "dispatcher started");
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    while let Some(joined) = tasks.try_join_next() {
                        if let Err(e) = joined {
                            warn!(dispatcher = self.name, error = %e, "task panicked");
                        }
                    }
                    match self.tick(&mut tasks) {
                        Ok(0) => {}
                        Ok(n) => debug!(dispatcher = self.name, dispatched = n, "dispatcher tick"),
                        Err(e) => error!(dispatcher = self.name, error = %e, "dispatcher tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!(dispatcher = self.name, in_flight = tasks.len(), "dispatcher shutting down");
                    break;
                }
            }
        }
        while tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use cumulus_core::Description;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn handle(&self, id: &str) {
            self.seen.lock().unwrap().push(id.to_string());
        }
    }

    fn insert(store: &Store, id: &str, created: u64) {
        store
            .insert_deployment(&Deployment::new(id, "alice", Description::default(), created))
            .unwrap();
    }

    #[tokio::test]
    async fn two_dispatchers_claim_each_row_once() {
        let store = Store::open_in_memory().unwrap();
        let now = epoch_secs();
        for i in 0..10 {
            insert(&store, &format!("d{i}"), now - 100 + i);
        }
        let mut config = Config::default();
        config.pool.deployers = 16;
        let recorder = Arc::new(Recorder::default());
        let a = Dispatcher::deployer(store.clone(), recorder.clone(), &config);
        let b = Dispatcher::deployer(store.clone(), recorder.clone(), &config);

        let mut tasks = JoinSet::new();
        let (na, nb) = (a.tick(&mut tasks).unwrap(), b.tick(&mut tasks).unwrap());
        while tasks.join_next().await.is_some() {}

        assert_eq!(na + nb, 10);
        let mut seen = recorder.seen.lock().unwrap().clone();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 10);
        assert!(store
            .list_deployments()
            .unwrap()
            .iter()
            .all(|d| d.status == DeploymentStatus::Creating));
    }

    #[tokio::test]
    async fn full_pool_defers_to_next_tick() {
        let store = Store::open_in_memory().unwrap();
        let now = epoch_secs();
        for i in 0..3 {
            insert(&store, &format!("d{i}"), now - 10 + i);
        }
        let mut config = Config::default();
        config.pool.deployers = 2;
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::deployer(store.clone(), recorder.clone(), &config);

        let mut tasks = JoinSet::new();
        assert_eq!(dispatcher.tick(&mut tasks).unwrap(), 2);
        while tasks.join_next().await.is_some() {}
        // Oldest first.
        let mut seen = recorder.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["d0".to_string(), "d1".to_string()]);

        assert_eq!(dispatcher.tick(&mut tasks).unwrap(), 1);
        while tasks.join_next().await.is_some() {}
        assert_eq!(recorder.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn waiting_rows_respect_cooldown() {
        let store = Store::open_in_memory().unwrap();
        let now = epoch_secs();
        let mut fresh = Deployment::new("fresh", "alice", Description::default(), now);
        fresh.status = DeploymentStatus::Waiting;
        store.put_deployment(&fresh).unwrap();
        let mut stale = Deployment::new("stale", "alice", Description::default(), now - 10_000);
        stale.status = DeploymentStatus::Waiting;
        stale.updated = now - 10_000;
        store.put_deployment(&stale).unwrap();

        let mut config = Config::default();
        config.updates.waiting = 600;
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::deployer(store.clone(), recorder.clone(), &config);
        let mut tasks = JoinSet::new();
        assert_eq!(dispatcher.tick(&mut tasks).unwrap(), 1);
        while tasks.join_next().await.is_some() {}
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["stale".to_string()]);
    }

    #[tokio::test]
    async fn destroyer_claims_deletion_requests_only() {
        let store = Store::open_in_memory().unwrap();
        insert(&store, "keep", epoch_secs());
        insert(&store, "gone", epoch_secs());
        store
            .set_status("gone", DeploymentStatus::DeletionRequested, None)
            .unwrap();

        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::destroyer(store.clone(), recorder.clone(), &Config::default());
        let mut tasks = JoinSet::new();
        assert_eq!(dispatcher.tick(&mut tasks).unwrap(), 1);
        while tasks.join_next().await.is_some() {}
        assert_eq!(store.get_deployment("gone").unwrap().unwrap().status, DeploymentStatus::Deleting);
        assert_eq!(store.get_deployment("keep").unwrap().unwrap().status, DeploymentStatus::Accepted);
    }
}
