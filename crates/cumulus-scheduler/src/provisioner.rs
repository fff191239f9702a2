//! Provisioner: drives one deployment from `creating` to `running`, or
//! leaves it `waiting` / `unable` with a reason tag.
//!
//! Status writes go through the store's guarded operations, so a delete
//! that lands mid-flight always wins: the provisioner notices a refused
//! write (or a deletion status while polling) and returns `Cancelled`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use cumulus_cloud::{CloudCatalog, Connector};
use cumulus_core::{CloudDescriptor, Config, epoch_secs};
use cumulus_policy::{PolicyEngine, distinct_flavor_classes};
use cumulus_state::{Deployment, DeploymentStatus, Flavor, StatReason, Store};
use cumulus_updater::Refresher;

use crate::error::{SchedulerError, SchedulerResult};
use crate::instance::{InstanceContext, InstanceOutcome};
use crate::userdata::UserDataTemplate;

pub const NO_MATCHING_RESOURCES: &str = "NoMatchingResources";
pub const NO_MATCHING_RESOURCES_AVAILABLE: &str = "NoMatchingResourcesAvailable";
pub const DEPLOYMENT_FAILED: &str = "DeploymentFailed";

/// Where a provisioning run left the deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Running { cloud: String },
    Waiting(String),
    Unable(String),
    /// A deletion was observed; status left to the destroyer.
    Cancelled,
}

/// Result of trying one cloud with every candidate flavor.
enum CloudAttempt {
    Running,
    Cancelled,
    Permanent(StatReason),
    Retryable,
}

#[derive(Clone)]
pub struct Provisioner {
    store: Store,
    connector: Connector,
    catalog: CloudCatalog,
    refresher: Refresher,
    config: Arc<Config>,
    userdata: UserDataTemplate,
    poll_interval: Duration,
}

impl Provisioner {
    pub fn new(
        store: Store,
        connector: Connector,
        catalog: CloudCatalog,
        config: Arc<Config>,
        userdata: UserDataTemplate,
    ) -> Self {
        let refresher = Refresher::new(store.clone(), connector.clone());
        let poll_interval = config.poll_duration();
        Self {
            store,
            connector,
            catalog,
            refresher,
            config,
            userdata,
            poll_interval,
        }
    }

    /// Override the watchdog poll interval (`polling.duration`).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Set a terminal-ish outcome; a refused write means a delete got there first.
    fn finish(&self, id: &str, status: DeploymentStatus, reason: &str) -> SchedulerResult<ProvisionOutcome> {
        self.store.set_usage(id, 0, 0, 0.0)?;
        if !self.store.set_status(id, status, Some(reason))? {
            debug!(deployment_id = id, %status, "status write refused, deletion in progress");
            return Ok(ProvisionOutcome::Cancelled);
        }
        info!(deployment_id = id, %status, reason, "deployment not placed");
        Ok(match status {
            DeploymentStatus::Unable => ProvisionOutcome::Unable(reason.to_string()),
            _ => ProvisionOutcome::Waiting(reason.to_string()),
        })
    }

    pub async fn provision(&self, id: &str) -> SchedulerResult<ProvisionOutcome> {
        let deployment = self
            .store
            .get_deployment(id)?
            .ok_or_else(|| SchedulerError::DeploymentNotFound(id.to_string()))?;
        if deployment.status.is_deletion() || deployment.status.is_terminal() {
            return Ok(ProvisionOutcome::Cancelled);
        }

        // A template that cannot be decoded or compiled never will be.
        let template = match self.userdata.resolve(deployment.description.radl.as_deref()) {
            Ok(template) => template,
            Err(SchedulerError::Template(e)) => {
                warn!(deployment_id = id, error = %e, "unusable user data template");
                return self.finish(id, DeploymentStatus::Unable, DEPLOYMENT_FAILED);
            }
            Err(e) => return Err(e),
        };

        let now = epoch_secs();
        let deadline = Instant::now() + Duration::from_secs(self.config.timeouts.total);
        let identity = deployment.identity.as_str();
        let description = &deployment.description;
        let clouds = self.catalog.for_identity(&self.store, identity)?;
        let engine = PolicyEngine::new(&self.store, identity, description, &clouds);

        let candidates = engine.satisfies(true)?;
        if candidates.is_empty() {
            return self.finish(id, DeploymentStatus::Unable, NO_MATCHING_RESOURCES);
        }

        for cloud in &candidates {
            if let Err(e) = self
                .refresher
                .quotas_if_stale(cloud, identity, self.config.updates.quotas, now)
                .await
            {
                warn!(deployment_id = id, cloud = %cloud.name, error = %e, "quota refresh failed");
            }
        }
        let available = engine.satisfies(false)?;
        if available.is_empty() {
            return self.finish(id, DeploymentStatus::Waiting, NO_MATCHING_RESOURCES_AVAILABLE);
        }

        let ranked = engine.rank(available, now)?;
        debug!(
            deployment_id = id,
            clouds = ?ranked.iter().map(|s| (&s.cloud.name, s.weight)).collect::<Vec<_>>(),
            "clouds ranked"
        );

        let mut permanent = None;
        let mut retryable = false;
        for score in ranked {
            let cloud = score.cloud;
            match self.try_cloud(&deployment, &cloud, &engine, &template, deadline).await? {
                CloudAttempt::Running => {
                    return Ok(ProvisionOutcome::Running { cloud: cloud.name });
                }
                CloudAttempt::Cancelled => return Ok(ProvisionOutcome::Cancelled),
                CloudAttempt::Permanent(reason) => {
                    permanent.get_or_insert(reason);
                }
                CloudAttempt::Retryable => retryable = true,
            }
            if Instant::now() >= deadline {
                retryable = true;
                break;
            }
        }

        match permanent {
            Some(reason) if !retryable => {
                self.finish(id, DeploymentStatus::Unable, &format!("{DEPLOYMENT_FAILED}_{reason}"))
            }
            _ => self.finish(id, DeploymentStatus::Waiting, DEPLOYMENT_FAILED),
        }
    }

    async fn try_cloud(
        &self,
        deployment: &Deployment,
        cloud: &CloudDescriptor,
        engine: &PolicyEngine<'_>,
        template: &str,
        deadline: Instant,
    ) -> SchedulerResult<CloudAttempt> {
        let id = deployment.id.as_str();
        let resources = &deployment.description.requirements.resources;

        let Some((image_name, image_id)) = engine.image(cloud)? else {
            return Ok(CloudAttempt::Retryable);
        };
        let flavors = engine.flavors(cloud)?;
        let flavors = if resources.has_max() {
            flavors
        } else {
            distinct_flavor_classes(flavors)
        };

        let resource = match self.connector.connect(cloud, &deployment.identity).await {
            Ok(resource) => resource,
            Err(e) => {
                warn!(deployment_id = id, cloud = %cloud.name, error = %e, "cannot connect to cloud");
                return Ok(CloudAttempt::Retryable);
            }
        };
        self.store.set_cloud(id, &cloud.name, &[])?;

        let instances = resources.instances.max(1);
        for flavor in flavors {
            info!(
                deployment_id = id,
                cloud = %cloud.name,
                flavor = %flavor.name,
                image = %image_name,
                instances,
                "deploying"
            );
            self.store.set_usage(
                id,
                instances,
                flavor.cpus * instances,
                flavor.memory_gb * f64::from(instances),
            )?;

            let started = epoch_secs();
            let ctx = Arc::new(self.context(deployment, cloud, &resource, &image_id, &flavor, template, deadline));
            let mut tasks = JoinSet::new();
            for _ in 0..instances {
                tasks.spawn(Arc::clone(&ctx).run());
            }

            let mut handles = Vec::new();
            let mut cancelled = false;
            let mut permanent = None;
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(InstanceOutcome::Created(handle)) => handles.push(handle),
                    Ok(InstanceOutcome::Cancelled) => cancelled = true,
                    Ok(InstanceOutcome::Failed { reason, permanent: true }) => permanent = Some(reason),
                    Ok(InstanceOutcome::Failed { .. }) => {}
                    Err(e) => warn!(deployment_id = id, error = %e, "instance task panicked"),
                }
            }

            if cancelled {
                for handle in &handles {
                    ctx.delete(handle).await;
                }
                info!(deployment_id = id, "deletion observed, provisioning aborted");
                return Ok(CloudAttempt::Cancelled);
            }

            if handles.len() == instances as usize {
                let bound = ctx
                    .record_or_release(&handles, || self.store.set_cloud(id, &cloud.name, &handles))
                    .await?;
                if !bound {
                    // Row removed: nothing would ever destroy these.
                    for handle in &handles {
                        ctx.delete(handle).await;
                    }
                    return Ok(CloudAttempt::Cancelled);
                }
                ctx.record(StatReason::Success, started);
                if self
                    .store
                    .transition(id, &[DeploymentStatus::Creating], DeploymentStatus::Running, None)?
                {
                    info!(deployment_id = id, cloud = %cloud.name, "deployment running");
                    return Ok(CloudAttempt::Running);
                }
                // Deleted while the last instance came up; the destroyer
                // finds the handles on the row.
                return Ok(CloudAttempt::Cancelled);
            }

            for handle in &handles {
                ctx.delete(handle).await;
            }
            if let Some(reason) = permanent {
                warn!(deployment_id = id, cloud = %cloud.name, %reason, "cloud refused deployment");
                return Ok(CloudAttempt::Permanent(reason));
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        Ok(CloudAttempt::Retryable)
    }

    #[allow(clippy::too_many_arguments)]
    fn context(
        &self,
        deployment: &Deployment,
        cloud: &CloudDescriptor,
        resource: &Arc<dyn cumulus_cloud::Resource>,
        image_id: &str,
        flavor: &Flavor,
        template: &str,
        deadline: Instant,
    ) -> InstanceContext {
        let disk = deployment.description.requirements.resources.disk;
        // Only ask for a volume when the flavor's root disk cannot hold it.
        let disk_gb = if disk > 0.0 && flavor.disk_gb.is_none_or(|d| d < disk) {
            disk.ceil() as u32
        } else {
            0
        };
        let timeouts = &self.config.timeouts;
        InstanceContext {
            store: self.store.clone(),
            resource: Arc::clone(resource),
            cloud: cloud.clone(),
            deployment_id: deployment.id.clone(),
            identity: deployment.identity.clone(),
            image_id: image_id.to_string(),
            flavor: flavor.name.clone(),
            disk_gb,
            template: template.to_string(),
            server: self.config.server.ip.clone(),
            attempts: self.config.deployment.retries,
            poll_interval: self.poll_interval,
            deadline,
            notrunning: Duration::from_secs(timeouts.notrunning),
            creation_timeout: Duration::from_secs(timeouts.creation),
            status_timeout: Duration::from_secs(timeouts.status),
            deletion_timeout: Duration::from_secs(timeouts.deletion),
        }
    }
}
