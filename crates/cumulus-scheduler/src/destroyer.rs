//! Destroyer: removes every cloud instance a deployment ever owned.
//!
//! The handle set is the union of the row's `cloud_infra_ids` and every
//! handle recorded in the deployment log, so instances from abandoned
//! attempts are swept too. Deletes retry with a growing delay.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use cumulus_cloud::{CloudCatalog, Connector, Resource};
use cumulus_core::Config;
use cumulus_state::{Deployment, DeploymentStatus, Store};

use crate::error::{SchedulerError, SchedulerResult};

const DELETION_STATES: [DeploymentStatus; 3] = [
    DeploymentStatus::DeletionRequested,
    DeploymentStatus::Deleting,
    DeploymentStatus::DeletionFailed,
];

#[derive(Clone)]
pub struct Destroyer {
    store: Store,
    connector: Connector,
    catalog: CloudCatalog,
    config: Arc<Config>,
    backoff_unit: Duration,
}

/// Cloud name → handles to delete there.
pub fn handles_by_cloud(deployment: &Deployment, store: &Store) -> SchedulerResult<BTreeMap<String, BTreeSet<String>>> {
    let mut by_cloud: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    if let Some(cloud) = &deployment.cloud {
        by_cloud
            .entry(cloud.clone())
            .or_default()
            .extend(deployment.cloud_infra_ids.iter().cloned());
    }
    for entry in store.list_log_entries(&deployment.id)? {
        if let Some(handle) = entry.cloud_infra_id {
            by_cloud.entry(entry.cloud).or_default().insert(handle);
        }
    }
    by_cloud.retain(|_, handles| !handles.is_empty());
    Ok(by_cloud)
}

impl Destroyer {
    pub fn new(store: Store, connector: Connector, catalog: CloudCatalog, config: Arc<Config>) -> Self {
        Self {
            store,
            connector,
            catalog,
            config,
            backoff_unit: Duration::from_secs(1),
        }
    }

    /// Scale of the back-off sleeps; one second in production.
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Delete everything `id` owns and move it to `deleted` or
    /// `deletion-failed`. Returns the status written.
    pub async fn destroy(&self, id: &str) -> SchedulerResult<DeploymentStatus> {
        let deployment = self
            .store
            .get_deployment(id)?
            .ok_or_else(|| SchedulerError::DeploymentNotFound(id.to_string()))?;
        if deployment.status.is_terminal() {
            return Ok(deployment.status);
        }

        let by_cloud = handles_by_cloud(&deployment, &self.store)?;
        let mut failed = 0usize;
        for (cloud_name, handles) in &by_cloud {
            let resource = match self.resource(&deployment, cloud_name).await {
                Ok(resource) => resource,
                Err(e) => {
                    warn!(deployment_id = id, cloud = %cloud_name, error = %e, "cannot reach cloud for deletion");
                    failed += handles.len();
                    continue;
                }
            };
            for handle in handles {
                if !self.delete_with_backoff(resource.as_ref(), id, handle).await {
                    failed += 1;
                }
            }
        }

        let status = if failed == 0 {
            DeploymentStatus::Deleted
        } else {
            DeploymentStatus::DeletionFailed
        };
        if self.store.transition(id, &DELETION_STATES, status, None)? {
            if status == DeploymentStatus::Deleted {
                self.store.set_usage(id, 0, 0, 0.0)?;
            }
            info!(deployment_id = id, %status, instances = by_cloud.values().map(BTreeSet::len).sum::<usize>(), failed, "deployment destroyed");
        } else {
            debug!(deployment_id = id, %status, "status changed during deletion");
        }
        Ok(status)
    }

    async fn resource(&self, deployment: &Deployment, cloud: &str) -> SchedulerResult<Arc<dyn Resource>> {
        let descriptor = self
            .catalog
            .find(&self.store, &deployment.identity, cloud)?
            .ok_or_else(|| cumulus_cloud::CloudError::Unsupported(format!("unknown cloud {cloud}")))?;
        Ok(self.connector.connect(&descriptor, &deployment.identity).await?)
    }

    /// `deletion.retries` attempts; after failure `n` the delay grows by
    /// `deletion.factor` and the task sleeps `n + delay` units.
    async fn delete_with_backoff(&self, resource: &dyn Resource, id: &str, handle: &str) -> bool {
        let per_call = Duration::from_secs(self.config.timeouts.deletion);
        let mut delay = 1.0_f64;
        let retries = self.config.deletion.retries.max(1);
        for count in 0..retries {
            match timeout(per_call, resource.delete_instance(handle)).await {
                Ok(Ok(())) => {
                    debug!(deployment_id = id, handle, "instance deleted");
                    return true;
                }
                Ok(Err(e)) => warn!(deployment_id = id, handle, attempt = count + 1, error = %e, "instance delete failed"),
                Err(_) => warn!(deployment_id = id, handle, attempt = count + 1, "instance delete timed out"),
            }
            if count + 1 < retries {
                delay *= self.config.deletion.factor;
                tokio::time::sleep(self.backoff_unit.mul_f64(f64::from(count) + delay)).await;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_cloud::{FakeCloud, TokenManager};
    use cumulus_core::config::OidcClientConfig;
    use cumulus_core::{CloudDescriptor, Description, epoch_secs};
    use cumulus_state::DeploymentLogEntry;

    fn setup(fake: Arc<FakeCloud>, config: Config) -> (Store, Destroyer) {
        let store = Store::open_in_memory().unwrap();
        let tokens = TokenManager::new(store.clone()).unwrap();
        let connector = Connector::new(tokens, OidcClientConfig::default()).with_fake("alpha", fake);
        let alpha: CloudDescriptor = serde_json::from_value(serde_json::json!({
            "name": "alpha",
            "credentials": {"type": "fake"}
        }))
        .unwrap();
        let destroyer = Destroyer::new(store.clone(), connector, CloudCatalog::new(vec![alpha]), Arc::new(config))
            .with_backoff_unit(Duration::from_millis(1));
        (store, destroyer)
    }

    fn deleting(store: &Store, id: &str) {
        let mut d = Deployment::new(id, "alice", Description::default(), epoch_secs());
        d.status = DeploymentStatus::Deleting;
        store.put_deployment(&d).unwrap();
    }

    fn log(store: &Store, id: &str, unique: &str, handle: &str) {
        store
            .put_log_entry(&DeploymentLogEntry {
                unique_infra_id: unique.into(),
                id: id.into(),
                cloud: "alpha".into(),
                cloud_infra_id: Some(handle.into()),
                created: epoch_secs(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn nothing_to_delete_goes_straight_to_deleted() {
        let (store, destroyer) = setup(Arc::new(FakeCloud::new()), Config::default());
        deleting(&store, "d1");
        assert_eq!(destroyer.destroy("d1").await.unwrap(), DeploymentStatus::Deleted);
        assert_eq!(store.get_deployment("d1").unwrap().unwrap().status, DeploymentStatus::Deleted);
    }

    #[tokio::test]
    async fn deletes_row_and_log_handles() {
        let fake = Arc::new(FakeCloud::new());
        fake.insert_instance("h1", "prominence-u1", Default::default());
        fake.insert_instance("h2", "prominence-u2", Default::default());
        let (store, destroyer) = setup(fake.clone(), Config::default());
        deleting(&store, "d1");
        store.set_cloud("d1", "alpha", &["h1".to_string()]).unwrap();
        log(&store, "d1", "u1", "h1");
        log(&store, "d1", "u2", "h2");

        assert_eq!(destroyer.destroy("d1").await.unwrap(), DeploymentStatus::Deleted);
        assert!(fake.instance_handles().is_empty());
        let mut deleted = fake.deleted_handles();
        deleted.sort();
        assert_eq!(deleted, vec!["h1".to_string(), "h2".to_string()]);
    }

    #[tokio::test]
    async fn unreachable_cloud_marks_deletion_failed() {
        let fake = Arc::new(FakeCloud::new());
        fake.insert_instance("h1", "prominence-u1", Default::default());
        fake.set_unreachable(true);
        let mut config = Config::default();
        config.deletion.retries = 2;
        let (store, destroyer) = setup(fake.clone(), config);
        deleting(&store, "d1");
        log(&store, "d1", "u1", "h1");

        assert_eq!(destroyer.destroy("d1").await.unwrap(), DeploymentStatus::DeletionFailed);
        assert_eq!(
            store.get_deployment("d1").unwrap().unwrap().status,
            DeploymentStatus::DeletionFailed
        );

        fake.set_unreachable(false);
        assert!(store
            .transition("d1", &[DeploymentStatus::DeletionFailed], DeploymentStatus::Deleting, None)
            .unwrap());
        assert_eq!(destroyer.destroy("d1").await.unwrap(), DeploymentStatus::Deleted);
        assert!(fake.instance_handles().is_empty());
    }
}
