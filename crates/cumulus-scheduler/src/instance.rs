//! Per-instance creation with retries and a watchdog.
//!
//! Each task logs a fresh `unique_infra_id` before touching the cloud, so
//! every remote object a deployment ever owned is enumerable afterwards.
//! The watchdog polls the instance until it runs, fails or times out, and
//! re-reads the deployment row on every iteration: a deletion state is a
//! cancellation signal, and the task removes what it created.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, info, warn};

use cumulus_cloud::{CloudError, InstanceSpec, InstanceStatus, Resource, instance_name};
use cumulus_core::{CloudDescriptor, epoch_secs};
use cumulus_state::{DeploymentLogEntry, DeploymentStat, StatReason, StateResult, Store};

use crate::error::SchedulerResult;
use crate::userdata::{UserDataVars, render};

/// Fixed inputs shared by every instance task of one attempt.
pub struct InstanceContext {
    pub store: Store,
    pub resource: Arc<dyn Resource>,
    pub cloud: CloudDescriptor,
    pub deployment_id: String,
    pub identity: String,
    pub image_id: String,
    pub flavor: String,
    pub disk_gb: u32,
    pub template: String,
    pub server: String,
    pub attempts: u32,
    pub poll_interval: Duration,
    /// Deployment-wide deadline (`timeouts.total`).
    pub deadline: Instant,
    pub notrunning: Duration,
    pub creation_timeout: Duration,
    pub status_timeout: Duration,
    pub deletion_timeout: Duration,
}

/// How one instance task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceOutcome {
    /// Running; carries the cloud handle.
    Created(String),
    /// Gave up. `permanent` means the cloud itself refused for good.
    Failed { reason: StatReason, permanent: bool },
    /// A deletion was observed; nothing of ours is left running.
    Cancelled,
}

enum Watch {
    Running,
    Retry(StatReason),
    Fatal(StatReason),
    Cancelled,
}

impl InstanceContext {
    fn cancelled(&self) -> SchedulerResult<bool> {
        Ok(self
            .store
            .get_deployment(&self.deployment_id)?
            .is_none_or(|d| d.status.is_deletion()))
    }

    pub(crate) fn record(&self, reason: StatReason, started: u64) {
        let now = epoch_secs();
        let stat = DeploymentStat {
            cloud: self.cloud.name.clone(),
            identity: self.identity.clone(),
            reason,
            time: now,
            duration: now.saturating_sub(started),
        };
        if let Err(e) = self.store.add_stat(&stat) {
            warn!(deployment_id = %self.deployment_id, error = %e, "failed to record deployment stat");
        }
    }

    pub(crate) async fn delete(&self, handle: &str) {
        match timeout(self.deletion_timeout, self.resource.delete_instance(handle)).await {
            Ok(Ok(())) => debug!(deployment_id = %self.deployment_id, handle, "instance deleted"),
            Ok(Err(e)) => warn!(deployment_id = %self.deployment_id, handle, error = %e, "instance delete failed"),
            Err(_) => warn!(deployment_id = %self.deployment_id, handle, "instance delete timed out"),
        }
    }

    /// Run a store write that records `handles`. If it fails the instances
    /// are deleted before the error propagates, so no running instance is
    /// left without a row pointing at it.
    pub(crate) async fn record_or_release<T>(
        &self,
        handles: &[String],
        write: impl FnOnce() -> StateResult<T>,
    ) -> SchedulerResult<T> {
        match write() {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(
                    deployment_id = %self.deployment_id,
                    cloud = %self.cloud.name,
                    instances = handles.len(),
                    error = %e,
                    "cannot record instances, deleting them"
                );
                for handle in handles {
                    self.delete(handle).await;
                }
                Err(e.into())
            }
        }
    }

    fn spec(&self, unique_infra_id: &str) -> SchedulerResult<InstanceSpec> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let userdata = render(
            &self.template,
            &UserDataVars {
                cloud: &self.cloud.name,
                region: &self.cloud.region,
                token: &token,
                uid_infra: &self.deployment_id,
                unique_uid_infra: unique_infra_id,
                server: &self.server,
            },
        )?;
        let network = {
            use rand::seq::SliceRandom;
            self.cloud.networks.choose(&mut rand::thread_rng()).cloned()
        };
        Ok(InstanceSpec {
            name: instance_name(unique_infra_id),
            image: self.image_id.clone(),
            flavor: self.flavor.clone(),
            network,
            security_groups: self.cloud.security_groups.clone(),
            userdata,
            disk_gb: self.disk_gb,
            infra_id: self.deployment_id.clone(),
            unique_infra_id: unique_infra_id.to_string(),
            tags: self.cloud.tags.clone(),
        })
    }

    /// Create one instance, retrying up to `attempts` times.
    pub async fn run(self: Arc<Self>) -> InstanceOutcome {
        match self.run_inner().await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(deployment_id = %self.deployment_id, cloud = %self.cloud.name, error = %e, "instance task failed");
                InstanceOutcome::Failed {
                    reason: StatReason::VMsFailed,
                    permanent: false,
                }
            }
        }
    }

    async fn run_inner(&self) -> SchedulerResult<InstanceOutcome> {
        let mut last = StatReason::VMsFailed;
        for attempt in 0..self.attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.poll_interval).await;
            }
            if self.cancelled()? {
                return Ok(InstanceOutcome::Cancelled);
            }
            if Instant::now() >= self.deadline {
                self.record(StatReason::TotalTooLong, epoch_secs());
                return Ok(InstanceOutcome::Failed {
                    reason: StatReason::TotalTooLong,
                    permanent: false,
                });
            }

            let started = epoch_secs();
            let unique_infra_id = uuid::Uuid::new_v4().to_string();
            self.store.put_log_entry(&DeploymentLogEntry {
                unique_infra_id: unique_infra_id.clone(),
                id: self.deployment_id.clone(),
                cloud: self.cloud.name.clone(),
                cloud_infra_id: None,
                created: started,
            })?;
            let spec = self.spec(&unique_infra_id)?;

            let created = match timeout(self.creation_timeout, self.resource.create_instance(&spec)).await {
                Ok(result) => result,
                Err(_) => Err(CloudError::creation("instance creation timed out")),
            };
            let handle = match created {
                Ok(handle) => handle,
                Err(e) => {
                    let kind = e.failure_kind();
                    let reason = kind.map(StatReason::from).unwrap_or(StatReason::VMsFailed);
                    warn!(
                        deployment_id = %self.deployment_id,
                        cloud = %self.cloud.name,
                        attempt = attempt + 1,
                        %reason,
                        error = %e,
                        "instance creation failed"
                    );
                    self.record(reason, started);
                    if kind.is_some_and(|k| !k.is_retryable()) {
                        return Ok(InstanceOutcome::Failed { reason, permanent: true });
                    }
                    last = reason;
                    continue;
                }
            };
            let owned = std::slice::from_ref(&handle);
            let logged = self
                .record_or_release(owned, || {
                    self.store
                        .set_log_handle(&self.deployment_id, &unique_infra_id, &handle)
                })
                .await?;
            if !logged {
                // The log row went with the deployment.
                self.delete(&handle).await;
                return Ok(InstanceOutcome::Cancelled);
            }

            let watched = match self.watch(&spec.name, &handle).await {
                Ok(watched) => watched,
                Err(e) => {
                    self.delete(&handle).await;
                    return Err(e);
                }
            };
            match watched {
                Watch::Running => {
                    info!(deployment_id = %self.deployment_id, cloud = %self.cloud.name, handle = %handle, "instance running");
                    return Ok(InstanceOutcome::Created(handle));
                }
                Watch::Cancelled => {
                    self.delete(&handle).await;
                    return Ok(InstanceOutcome::Cancelled);
                }
                Watch::Fatal(reason) => {
                    self.delete(&handle).await;
                    self.record(reason, started);
                    return Ok(InstanceOutcome::Failed { reason, permanent: false });
                }
                Watch::Retry(reason) => {
                    self.delete(&handle).await;
                    self.record(reason, started);
                    if reason == StatReason::TotalTooLong {
                        return Ok(InstanceOutcome::Failed { reason, permanent: false });
                    }
                    last = reason;
                }
            }
        }
        Ok(InstanceOutcome::Failed {
            reason: last,
            permanent: false,
        })
    }

    async fn watch(&self, name: &str, handle: &str) -> SchedulerResult<Watch> {
        let created = Instant::now();
        loop {
            if self.cancelled()? {
                return Ok(Watch::Cancelled);
            }
            if Instant::now() >= self.deadline {
                return Ok(Watch::Retry(StatReason::TotalTooLong));
            }

            let status = match timeout(self.status_timeout, self.resource.get_instance(name, handle)).await {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    debug!(handle, error = %e, "instance status query failed");
                    InstanceStatus::Unknown
                }
                Err(_) => InstanceStatus::Unknown,
            };
            match status {
                InstanceStatus::Running => return Ok(Watch::Running),
                InstanceStatus::Error | InstanceStatus::Terminated => {
                    return Ok(Watch::Fatal(StatReason::VMsFailed));
                }
                _ if created.elapsed() >= self.notrunning => {
                    return Ok(Watch::Retry(StatReason::WaitingTooLong));
                }
                _ => {}
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
