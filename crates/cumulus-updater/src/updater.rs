//! Updater loop: keeps the facts the policy engine reads current.
//!
//! For every identity with recent deployments plus the static identity:
//! - a **full** pass (discovery, flavors, images, quotas, reachability) when
//!   the last one finished more than `updates.discover` ago and the last one
//!   started more than `updates.deadline` ago;
//! - otherwise a **fast** reachability pass for clouds whose status is older
//!   than `updates.fast`;
//! - an immediate full refresh of any cloud that has no facts row yet.
//!
//! Cloud refreshes run concurrently, bounded by `pool.updaters`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use cumulus_cloud::CloudCatalog;
use cumulus_cloud::egi::{EgiDiscovery, sync_egi_clouds};
use cumulus_core::{CloudDescriptor, Config, STATIC_IDENTITY, epoch_secs};
use cumulus_state::ResourceUpdate;

use crate::error::UpdaterResult;
use crate::refresh::Refresher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Full,
    Fast,
}

/// Outcome of one updater tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub full_identities: Vec<String>,
    pub refreshed_clouds: u32,
}

pub struct Updater {
    refresher: Refresher,
    catalog: CloudCatalog,
    discovery: Option<Arc<EgiDiscovery>>,
    config: Arc<Config>,
    pool: Arc<Semaphore>,
}

impl Updater {
    pub fn new(refresher: Refresher, catalog: CloudCatalog, config: Arc<Config>) -> Self {
        let pool = Arc::new(Semaphore::new(config.pool.updaters.max(1)));
        Self {
            refresher,
            catalog,
            discovery: None,
            config,
            pool,
        }
    }

    pub fn with_discovery(mut self, discovery: EgiDiscovery) -> Self {
        if discovery.enabled() {
            self.discovery = Some(Arc::new(discovery));
        }
        self
    }

    /// Identities to refresh: owners of deployments within the retention
    /// window, plus the static identity.
    fn identities(&self, now: u64) -> UpdaterResult<BTreeSet<String>> {
        let since = now.saturating_sub(self.config.cleanup.remove_after);
        let mut identities = self.refresher.store().identities_since(since)?;
        identities.insert(STATIC_IDENTITY.to_string());
        Ok(identities)
    }

    /// Whether a full pass is due for `identity`.
    pub fn full_due(&self, update: ResourceUpdate, now: u64) -> bool {
        now.saturating_sub(update.time) > self.config.updates.discover
            && now.saturating_sub(update.start) > self.config.updates.deadline
    }

    /// Clouds whose facts are stored under `identity` for this pass.
    fn owned_clouds(&self, identity: &str) -> UpdaterResult<Vec<CloudDescriptor>> {
        Ok(self
            .catalog
            .for_identity(self.refresher.store(), identity)?
            .into_iter()
            .filter(|c| c.facts_identity(identity) == identity)
            .collect())
    }

    pub async fn run_once(&self) -> UpdaterResult<UpdateReport> {
        let now = epoch_secs();
        let mut report = UpdateReport::default();
        let store = self.refresher.store();

        for identity in self.identities(now)? {
            let update = store.get_resource_update(&identity)?;
            let full = self.full_due(update, now);

            if full {
                store.put_resource_update(&identity, ResourceUpdate { start: now, ..update })?;
                if let Some(discovery) = self.discovery.as_ref().filter(|_| identity != STATIC_IDENTITY) {
                    match discovery.discover(&identity, now).await {
                        Ok(found) => sync_egi_clouds(store, &identity, &found, now)?,
                        Err(e) => warn!(identity = %identity, error = %e, "egi discovery failed"),
                    }
                }
            }

            let mut work = Vec::new();
            for cloud in self.owned_clouds(&identity)? {
                let info = store.get_cloud_info(&cloud.name, &identity)?;
                let pass = match info {
                    None => Some(Pass::Full),
                    Some(_) if full => Some(Pass::Full),
                    Some(info) if now.saturating_sub(info.updated_status) >= self.config.updates.fast => {
                        Some(Pass::Fast)
                    }
                    Some(_) => None,
                };
                if let Some(pass) = pass {
                    work.push((cloud, pass));
                }
            }
            report.refreshed_clouds += self.refresh_all(&identity, work, now).await;

            if full {
                store.put_resource_update(&identity, ResourceUpdate { start: now, time: epoch_secs() })?;
                report.full_identities.push(identity);
            }
        }
        Ok(report)
    }

    async fn refresh_all(&self, identity: &str, work: Vec<(CloudDescriptor, Pass)>, now: u64) -> u32 {
        let mut tasks = JoinSet::new();
        for (cloud, pass) in work {
            let refresher = self.refresher.clone();
            let pool = Arc::clone(&self.pool);
            let identity = identity.to_string();
            tasks.spawn(async move {
                let _permit = pool.acquire_owned().await;
                let result = match pass {
                    Pass::Full => refresher.full(&cloud, &identity, now).await,
                    Pass::Fast => refresher.fast(&cloud, &identity, now).await,
                };
                if let Err(e) = &result {
                    error!(cloud = %cloud.name, identity = %identity, ?pass, error = %e, "cloud refresh failed");
                }
                result.is_ok()
            });
        }
        let mut refreshed = 0;
        while let Some(joined) = tasks.join_next().await {
            if matches!(joined, Ok(true)) {
                refreshed += 1;
            }
        }
        refreshed
    }

    /// Run the updater loop until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "updater started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.run_once().await {
                        Ok(report) => debug!(
                            full = report.full_identities.len(),
                            refreshed = report.refreshed_clouds,
                            "updater tick"
                        ),
                        Err(e) => error!(error = %e, "updater tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("updater shutting down");
                    break;
                }
            }
        }
    }
}
