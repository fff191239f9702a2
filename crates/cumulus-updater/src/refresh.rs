//! Per-cloud fact refresh: reachability, flavors, images, quotas.
//!
//! Facts are written under the cloud's facts identity (the static identity
//! for service-account clouds, the caller for identity-scoped ones), which
//! is where the policy engine reads them.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use cumulus_cloud::{CloudCatalog, Connector, FlavorInfo, ImageInfo, Quotas, Resource};
use cumulus_core::{CloudDescriptor, Limits};
use cumulus_state::{CloudStatus, DeploymentStatus, Flavor, Image, Store};

use crate::error::UpdaterResult;

/// Deployments whose usage counts against remaining capacity.
pub const QUOTA_STATUSES: [DeploymentStatus; 2] = [DeploymentStatus::Configured, DeploymentStatus::Creating];

/// Refreshes cached facts for one cloud at a time.
#[derive(Clone)]
pub struct Refresher {
    store: Store,
    connector: Connector,
}

impl Refresher {
    pub fn new(store: Store, connector: Connector) -> Self {
        Self { store, connector }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Connect, recording the cloud as down when that fails.
    async fn connect(&self, cloud: &CloudDescriptor, identity: &str, now: u64) -> UpdaterResult<Option<Arc<dyn Resource>>> {
        match self.connector.connect(cloud, identity).await {
            Ok(resource) => Ok(Some(resource)),
            Err(e) => {
                warn!(cloud = %cloud.name, identity, error = %e, "cannot connect to cloud");
                self.set_status(cloud, identity, CloudStatus::Down, now)?;
                Ok(None)
            }
        }
    }

    fn set_status(&self, cloud: &CloudDescriptor, identity: &str, status: CloudStatus, now: u64) -> UpdaterResult<()> {
        self.store
            .update_cloud_info(&cloud.name, cloud.facts_identity(identity), |info| {
                info.status = status;
                info.updated_status = now;
            })?;
        Ok(())
    }

    /// Fast pass: reachability only, checked by listing flavors.
    pub async fn fast(&self, cloud: &CloudDescriptor, identity: &str, now: u64) -> UpdaterResult<CloudStatus> {
        let Some(resource) = self.connect(cloud, identity, now).await? else {
            return Ok(CloudStatus::Down);
        };
        let status = match resource.list_flavors().await {
            Ok(_) => CloudStatus::Up,
            Err(e) => {
                warn!(cloud = %cloud.name, identity, error = %e, "cloud unreachable");
                CloudStatus::Down
            }
        };
        self.set_status(cloud, identity, status, now)?;
        Ok(status)
    }

    /// Full pass: flavors, images, quotas and reachability.
    pub async fn full(&self, cloud: &CloudDescriptor, identity: &str, now: u64) -> UpdaterResult<CloudStatus> {
        let Some(resource) = self.connect(cloud, identity, now).await? else {
            return Ok(CloudStatus::Down);
        };
        let facts_identity = cloud.facts_identity(identity);

        let listed = match resource.list_flavors().await {
            Ok(listed) => listed,
            Err(e) => {
                warn!(cloud = %cloud.name, identity, error = %e, "flavor listing failed");
                self.set_status(cloud, identity, CloudStatus::Down, now)?;
                return Ok(CloudStatus::Down);
            }
        };
        let flavors = filter_flavors(cloud, facts_identity, listed);
        self.store.replace_flavors(&cloud.name, facts_identity, &flavors)?;

        match resource.list_images().await {
            Ok(listed) => {
                let images = resolve_images(cloud, facts_identity, listed);
                self.store.replace_images(&cloud.name, facts_identity, &images)?;
                self.store
                    .update_cloud_info(&cloud.name, facts_identity, |info| info.updated_images = now)?;
            }
            Err(e) => warn!(cloud = %cloud.name, identity, error = %e, "image listing failed"),
        }

        self.quotas_with(resource.as_ref(), cloud, identity, now).await?;
        self.set_status(cloud, identity, CloudStatus::Up, now)?;
        info!(cloud = %cloud.name, identity = facts_identity, flavors = flavors.len(), "cloud refreshed");
        Ok(CloudStatus::Up)
    }

    /// Refresh quotas only.
    pub async fn quotas(&self, cloud: &CloudDescriptor, identity: &str, now: u64) -> UpdaterResult<()> {
        if let Some(resource) = self.connect(cloud, identity, now).await? {
            self.quotas_with(resource.as_ref(), cloud, identity, now).await?;
        }
        Ok(())
    }

    /// Refresh quotas when the cached ones are older than `max_age` seconds.
    /// Returns whether a refresh ran.
    pub async fn quotas_if_stale(&self, cloud: &CloudDescriptor, identity: &str, max_age: u64, now: u64) -> UpdaterResult<bool> {
        let updated = self
            .store
            .get_cloud_info(&cloud.name, cloud.facts_identity(identity))?
            .map(|info| info.updated_quotas)
            .unwrap_or(0);
        if now.saturating_sub(updated) <= max_age {
            return Ok(false);
        }
        self.quotas(cloud, identity, now).await?;
        Ok(true)
    }

    async fn quotas_with(&self, resource: &dyn Resource, cloud: &CloudDescriptor, identity: &str, now: u64) -> UpdaterResult<()> {
        let facts_identity = cloud.facts_identity(identity);
        let quotas = match resource.get_quotas().await {
            Ok(q) => q,
            Err(e) => {
                warn!(cloud = %cloud.name, identity, error = %e, "quota query failed");
                Quotas::default()
            }
        };
        let used = self
            .store
            .used_resources(&cloud.name, facts_identity, &QUOTA_STATUSES)?;
        let (static_limits, remaining) = compute_limits(cloud.quotas, quotas, used);
        self.store
            .update_cloud_info(&cloud.name, facts_identity, |info| {
                info.static_limits = static_limits;
                info.remaining = remaining;
                info.updated_quotas = now;
            })?;
        debug!(cloud = %cloud.name, identity = facts_identity, ?static_limits, ?remaining, "quotas refreshed");
        Ok(())
    }
}

/// Apply the descriptor's flavour filters and convert to rows.
pub fn filter_flavors(cloud: &CloudDescriptor, identity: &str, listed: Vec<FlavorInfo>) -> Vec<Flavor> {
    listed
        .into_iter()
        .filter(|f| {
            cloud
                .flavour_filters
                .as_ref()
                .is_none_or(|filters| filters.accepts(&f.name, f.cpus, f.memory_gb))
        })
        .map(|f| Flavor {
            cloud: cloud.name.clone(),
            identity: identity.to_string(),
            name: f.name,
            cpus: f.cpus,
            memory_gb: f.memory_gb,
            disk_gb: f.disk_gb,
        })
        .collect()
}

/// Logical images for a cloud.
///
/// Templates are resolved by cloud-side image name, default images are
/// taken as-is, and any listed image carrying all four OS properties is
/// included under its own name. Earlier sources win on name clashes.
pub fn resolve_images(cloud: &CloudDescriptor, identity: &str, listed: Vec<ImageInfo>) -> Vec<Image> {
    let mut seen = HashSet::new();
    let mut images = Vec::new();
    let row = |name: &str, id: &str, t: &str, a: &str, d: &str, v: &str| Image {
        cloud: cloud.name.clone(),
        identity: identity.to_string(),
        name: name.to_string(),
        id: id.to_string(),
        os_type: t.to_string(),
        os_arch: a.to_string(),
        os_dist: d.to_string(),
        os_vers: v.to_string(),
    };

    for template in &cloud.image_templates {
        let wanted = template.image_name.as_deref().unwrap_or(&template.name);
        if let Some(found) = listed.iter().find(|i| i.name == wanted) {
            if seen.insert(template.name.clone()) {
                images.push(row(
                    &template.name,
                    &found.id,
                    &template.os_type,
                    &template.architecture,
                    &template.distribution,
                    &template.version,
                ));
            }
        }
    }
    for entry in &cloud.default_images {
        if seen.insert(entry.name.clone()) {
            images.push(row(
                &entry.name,
                &entry.id,
                &entry.os_type,
                &entry.architecture,
                &entry.distribution,
                &entry.version,
            ));
        }
    }
    for image in &listed {
        if let (Some(t), Some(a), Some(d), Some(v)) =
            (&image.os_type, &image.architecture, &image.distribution, &image.version)
        {
            if seen.insert(image.name.clone()) {
                images.push(row(&image.name, &image.id, t, a, d, v));
            }
        }
    }
    images
}

/// `(static_limits, remaining)` from admin quotas, adapter quotas and our
/// own accounted usage `(instances, cpus, memory)`.
///
/// Admin quotas override reported limits. Remaining is the adapter's figure
/// when it has one, capped by `limit - used`.
pub fn compute_limits(admin: Option<Limits>, reported: Quotas, used: (u64, u64, f64)) -> (Limits, Limits) {
    let static_limits = admin
        .unwrap_or_default()
        .or(reported.limits.unwrap_or_default());
    let (used_instances, used_cpus, used_memory) = used;
    let derived = Limits {
        cpus: static_limits.cpus.map(|l| l.saturating_sub(used_cpus)),
        memory: static_limits.memory.map(|l| (l - used_memory).max(0.0)),
        instances: static_limits.instances.map(|l| l.saturating_sub(used_instances)),
    };
    let remaining = match reported.remaining {
        Some(r) => Limits {
            cpus: min_known(r.cpus, derived.cpus),
            memory: min_known_f64(r.memory, derived.memory),
            instances: min_known(r.instances, derived.instances),
        },
        None => derived,
    };
    (static_limits, remaining)
}

fn min_known(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn min_known_f64(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Resolve a cloud by name for an identity and refresh its quotas if stale.
pub async fn refresh_quotas_for(
    refresher: &Refresher,
    catalog: &CloudCatalog,
    identity: &str,
    max_age: u64,
    now: u64,
) -> UpdaterResult<u32> {
    let mut refreshed = 0;
    for cloud in catalog.for_identity(refresher.store(), identity)? {
        if refresher.quotas_if_stale(&cloud, identity, max_age, now).await? {
            refreshed += 1;
        }
    }
    Ok(refreshed)
}
