//! Cleaner loop.
//!
//! Every pass, in order:
//! 1. drop terminal rows older than `cleanup.remove_after` (with their log)
//! 2. send `creating` rows stuck longer than `cleanup.delete_stuck_infras_after`
//!    to `deletion-requested`
//! 3. re-run the destroyer for deletions older than
//!    `cleanup.retry_failed_deletes_after`
//! 4. sweep every cloud for phantom instances
//!
//! Phantom handling: an instance whose owner is terminal is deleted
//! directly; an owner outside [`PHANTOM_SAFE_STATES`] whose instance is not
//! a live worker is flipped to `deletion-requested`; an instance without an
//! owner row is only logged.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use cumulus_cloud::{CloudCatalog, Connector, InstanceInfo, Resource};
use cumulus_core::{CloudDescriptor, Config, STATIC_IDENTITY, epoch_secs};
use cumulus_scheduler::Destroyer;
use cumulus_scheduler::provisioner::DEPLOYMENT_FAILED;
use cumulus_state::{DeploymentStatus, Store};
use cumulus_workers::WorkerDirectory;

use crate::error::CleanerResult;

/// Owner states in which a tagged instance is expected to exist.
pub const PHANTOM_SAFE_STATES: [DeploymentStatus; 6] = [
    DeploymentStatus::Creating,
    DeploymentStatus::Running,
    DeploymentStatus::Visible,
    DeploymentStatus::Left,
    DeploymentStatus::DeletionRequested,
    DeploymentStatus::Deleting,
];

const RETRY_STATES: [DeploymentStatus; 3] = [
    DeploymentStatus::DeletionFailed,
    DeploymentStatus::Deleting,
    DeploymentStatus::DeletionRequested,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub removed: u32,
    pub pruned_logs: u32,
    pub stuck: u32,
    pub redriven: u32,
    pub phantoms_flagged: u32,
    pub phantoms_deleted: u32,
    pub unknown_instances: u32,
}

pub struct Cleaner {
    store: Store,
    connector: Connector,
    catalog: CloudCatalog,
    destroyer: Destroyer,
    directory: Arc<dyn WorkerDirectory>,
    config: Arc<Config>,
}

impl Cleaner {
    pub fn new(
        store: Store,
        connector: Connector,
        catalog: CloudCatalog,
        destroyer: Destroyer,
        directory: Arc<dyn WorkerDirectory>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            connector,
            catalog,
            destroyer,
            directory,
            config,
        }
    }

    pub async fn run_once(&self, now: u64) -> CleanerResult<CleanReport> {
        let mut report = CleanReport::default();
        self.remove_expired(now, &mut report)?;
        self.fail_stuck(now, &mut report)?;
        self.redrive_deletions(now, &mut report).await?;

        match self.directory.unique_ids().await {
            Ok(live) => self.sweep_phantoms(&live, &mut report).await?,
            Err(e) => warn!(error = %e, "worker directory unavailable, skipping phantom sweep"),
        }
        Ok(report)
    }

    fn remove_expired(&self, now: u64, report: &mut CleanReport) -> CleanerResult<()> {
        let terminal = [DeploymentStatus::Deleted, DeploymentStatus::Unable];
        for d in self.store.list_deployments_by_status(&terminal)? {
            if now.saturating_sub(d.updated) > self.config.cleanup.remove_after
                && self.store.remove_deployment(&d.id)?
            {
                debug!(deployment_id = %d.id, status = %d.status, "expired deployment removed");
                report.removed += 1;
            }
        }
        report.pruned_logs = self.store.prune_orphan_log_entries()?;
        Ok(())
    }

    fn fail_stuck(&self, now: u64, report: &mut CleanReport) -> CleanerResult<()> {
        for d in self.store.list_deployments_by_status(&[DeploymentStatus::Creating])? {
            if now.saturating_sub(d.updated) <= self.config.cleanup.delete_stuck_infras_after {
                continue;
            }
            if self.store.transition(
                &d.id,
                &[DeploymentStatus::Creating],
                DeploymentStatus::DeletionRequested,
                Some(DEPLOYMENT_FAILED),
            )? {
                warn!(deployment_id = %d.id, "deployment stuck in creating, deleting");
                report.stuck += 1;
            }
        }
        Ok(())
    }

    async fn redrive_deletions(&self, now: u64, report: &mut CleanReport) -> CleanerResult<()> {
        for d in self.store.list_deployments_by_status(&RETRY_STATES)? {
            if now.saturating_sub(d.updated) <= self.config.cleanup.retry_failed_deletes_after {
                continue;
            }
            if !self
                .store
                .transition(&d.id, &RETRY_STATES, DeploymentStatus::Deleting, None)?
            {
                continue;
            }
            info!(deployment_id = %d.id, from = %d.status, "retrying deletion");
            report.redriven += 1;
            match self.destroyer.destroy(&d.id).await {
                Ok(status) => debug!(deployment_id = %d.id, %status, "deletion retried"),
                Err(e) => error!(deployment_id = %d.id, error = %e, "deletion retry failed"),
            }
        }
        Ok(())
    }

    /// Every identity with deployments plus the static identity, each paired
    /// with the clouds whose instances it owns, so no cloud is listed twice.
    fn sweep_targets(&self) -> CleanerResult<Vec<(String, CloudDescriptor)>> {
        let mut identities: BTreeSet<String> = self.store.identities_since(0)?;
        identities.insert(STATIC_IDENTITY.to_string());
        let mut targets = Vec::new();
        for identity in identities {
            for cloud in self.catalog.for_identity(&self.store, &identity)? {
                if cloud.facts_identity(&identity) == identity {
                    targets.push((identity.clone(), cloud));
                }
            }
        }
        Ok(targets)
    }

    async fn sweep_phantoms(&self, live: &HashSet<String>, report: &mut CleanReport) -> CleanerResult<()> {
        for (identity, cloud) in self.sweep_targets()? {
            let resource = match self.connector.connect(&cloud, &identity).await {
                Ok(resource) => resource,
                Err(e) => {
                    warn!(cloud = %cloud.name, identity = %identity, error = %e, "cannot connect for phantom sweep");
                    continue;
                }
            };
            let instances = match resource.list_instances().await {
                Ok(instances) => instances,
                Err(e) => {
                    warn!(cloud = %cloud.name, identity = %identity, error = %e, "cannot list instances");
                    continue;
                }
            };
            for instance in instances {
                self.check_instance(resource.as_ref(), &cloud, &instance, live, report)
                    .await?;
            }
        }
        Ok(())
    }

    async fn check_instance(
        &self,
        resource: &dyn Resource,
        cloud: &CloudDescriptor,
        instance: &InstanceInfo,
        live: &HashSet<String>,
        report: &mut CleanReport,
    ) -> CleanerResult<()> {
        let Some(infra_id) = instance.infra_id() else {
            return Ok(());
        };
        let Some(owner) = self.store.get_deployment(infra_id)? else {
            warn!(cloud = %cloud.name, instance = %instance.id, infra_id, "unknown instance, leaving it alone");
            report.unknown_instances += 1;
            return Ok(());
        };

        let is_worker = instance.unique_infra_id().is_some_and(|u| live.contains(u));
        if is_worker {
            debug!(cloud = %cloud.name, instance = %instance.id, deployment_id = infra_id, "instance is a live worker");
            return Ok(());
        }

        if owner.status.is_terminal() {
            match resource.delete_instance(&instance.id).await {
                Ok(()) => {
                    info!(cloud = %cloud.name, instance = %instance.id, deployment_id = infra_id, "phantom instance deleted");
                    report.phantoms_deleted += 1;
                }
                Err(e) => warn!(cloud = %cloud.name, instance = %instance.id, error = %e, "phantom delete failed"),
            }
            return Ok(());
        }

        if !PHANTOM_SAFE_STATES.contains(&owner.status)
            && self
                .store
                .set_status(infra_id, DeploymentStatus::DeletionRequested, None)?
        {
            warn!(
                cloud = %cloud.name,
                instance = %instance.id,
                deployment_id = infra_id,
                status = %owner.status,
                "phantom instance, deployment sent for deletion"
            );
            report.phantoms_flagged += 1;
        }
        Ok(())
    }

    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "cleaner started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.run_once(epoch_secs()).await {
                        Ok(report) => debug!(?report, "cleaner tick"),
                        Err(e) => error!(error = %e, "cleaner tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("cleaner shutting down");
                    break;
                }
            }
        }
    }
}
