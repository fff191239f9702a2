//! Autoscaler: idle-job driven worker deployments.
//!
//! Jobs needing at most `workers.shared_worker_cpu_threshold` cpus are packed
//! onto shared workers of `workers.shared_worker_cpus` each, per
//! `(identity, group)`. Bigger jobs get a dedicated deployment whose
//! identifier is the job id. Deployments already in flight count against
//! the demand, so a steady queue creates nothing new.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use cumulus_core::config::WorkersConfig;
use cumulus_core::{Config, Description, epoch_secs};
use cumulus_state::{Deployment, DeploymentStatus, Store};

use crate::error::AutoscaleResult;
use crate::source::{IdleJob, JobSource};

/// Identifier carried by shared-worker deployments.
pub const SHARED_IDENTIFIER: &str = "shared-worker";

const IN_FLIGHT: [DeploymentStatus; 5] = [
    DeploymentStatus::Accepted,
    DeploymentStatus::Creating,
    DeploymentStatus::Waiting,
    DeploymentStatus::Configured,
    DeploymentStatus::Running,
];

/// One deployment the autoscaler wants created.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerRequest {
    pub identity: String,
    pub group: Option<String>,
    pub identifier: String,
    pub cores: u32,
    pub memory: f64,
    pub disk: f64,
}

impl WorkerRequest {
    fn description(&self) -> Description {
        let mut description = Description::default();
        let resources = &mut description.requirements.resources;
        resources.cores = self.cores;
        resources.memory = self.memory;
        resources.disk = self.disk;
        resources.instances = 1;
        description.requirements.groups = self.group.iter().cloned().collect();
        description
    }
}

fn group_of(deployment: &Deployment) -> Option<String> {
    deployment.description.requirements.groups.first().cloned()
}

/// Deployments to create for `jobs`, given what is already `in_flight`.
pub fn plan(jobs: &[IdleJob], in_flight: &[Deployment], workers: &WorkersConfig) -> Vec<WorkerRequest> {
    let shared_cpus = workers.shared_worker_cpus.max(1);
    let mut demand: BTreeMap<(String, Option<String>), u32> = BTreeMap::new();
    let mut requests = Vec::new();

    let dedicated: HashSet<&str> = in_flight
        .iter()
        .filter_map(|d| d.identifier.as_deref())
        .filter(|i| *i != SHARED_IDENTIFIER)
        .collect();

    for job in jobs {
        if job.cpus <= workers.shared_worker_cpu_threshold {
            *demand.entry((job.identity.clone(), job.group.clone())).or_default() += job.cpus;
        } else if !dedicated.contains(job.id.as_str()) {
            requests.push(WorkerRequest {
                identity: job.identity.clone(),
                group: job.group.clone(),
                identifier: job.id.clone(),
                cores: job.cpus,
                memory: job.memory,
                disk: job.disk,
            });
        }
    }

    for ((identity, group), cpus) in demand {
        let wanted = cpus.div_ceil(shared_cpus);
        let existing = in_flight
            .iter()
            .filter(|d| {
                d.identifier.as_deref() == Some(SHARED_IDENTIFIER)
                    && d.identity == identity
                    && group_of(d) == group
            })
            .count() as u32;
        for _ in existing..wanted {
            requests.push(WorkerRequest {
                identity: identity.clone(),
                group: group.clone(),
                identifier: SHARED_IDENTIFIER.to_string(),
                cores: shared_cpus,
                memory: workers.shared_worker_memory,
                disk: workers.shared_worker_disk,
            });
        }
    }
    requests
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScaleReport {
    pub shared: u32,
    pub dedicated: u32,
}

pub struct Autoscaler {
    store: Store,
    source: Arc<dyn JobSource>,
    config: Arc<Config>,
}

impl Autoscaler {
    pub fn new(store: Store, source: Arc<dyn JobSource>, config: Arc<Config>) -> Self {
        Self { store, source, config }
    }

    pub async fn run_once(&self, now: u64) -> AutoscaleResult<ScaleReport> {
        let jobs = self.source.idle_jobs().await?;
        let in_flight = self.store.list_deployments_by_status(&IN_FLIGHT)?;
        let mut report = ScaleReport::default();

        for request in plan(&jobs, &in_flight, &self.config.workers) {
            let id = uuid::Uuid::new_v4().to_string();
            let mut deployment = Deployment::new(&id, &request.identity, request.description(), now);
            deployment.identifier = Some(request.identifier.clone());
            if !self.store.insert_deployment(&deployment)? {
                continue;
            }
            if request.identifier == SHARED_IDENTIFIER {
                report.shared += 1;
            } else {
                report.dedicated += 1;
            }
            info!(
                deployment_id = %id,
                identity = %request.identity,
                group = ?request.group,
                identifier = %request.identifier,
                cores = request.cores,
                "worker deployment requested"
            );
        }
        Ok(report)
    }

    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "autoscaler started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.run_once(epoch_secs()).await {
                        Ok(report) => debug!(?report, "autoscaler tick"),
                        Err(e) => error!(error = %e, "autoscaler tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticJobSource;

    fn job(id: &str, identity: &str, cpus: u32) -> IdleJob {
        IdleJob {
            id: id.into(),
            identity: identity.into(),
            group: Some("physics".into()),
            cpus,
            memory: 2.0,
            disk: 10.0,
        }
    }

    fn workers() -> WorkersConfig {
        WorkersConfig {
            shared_worker_cpu_threshold: 4,
            shared_worker_cpus: 4,
            shared_worker_memory: 8.0,
            shared_worker_disk: 20.0,
            ..WorkersConfig::default()
        }
    }

    fn autoscaler(jobs: Vec<IdleJob>) -> (Store, Autoscaler) {
        let store = Store::open_in_memory().unwrap();
        let mut config = Config::default();
        config.workers = workers();
        let scaler = Autoscaler::new(
            store.clone(),
            Arc::new(StaticJobSource::new(jobs)),
            Arc::new(config),
        );
        (store, scaler)
    }

    #[test]
    fn small_jobs_share_workers() {
        let jobs: Vec<_> = (0..5).map(|i| job(&format!("j{i}"), "u", 1)).collect();
        let requests = plan(&jobs, &[], &workers());
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.identifier == SHARED_IDENTIFIER && r.cores == 4));
    }

    #[test]
    fn large_jobs_get_dedicated_workers() {
        let jobs = vec![job("big", "u", 16), job("small", "u", 2)];
        let requests = plan(&jobs, &[], &workers());
        let big = requests.iter().find(|r| r.identifier == "big").unwrap();
        assert_eq!((big.cores, big.memory, big.disk), (16, 2.0, 10.0));
        assert_eq!(requests.len(), 2);
    }

    #[test]
    fn demand_is_per_identity_and_group() {
        let mut other_group = job("c", "u", 1);
        other_group.group = None;
        let jobs = vec![job("a", "u", 1), job("b", "v", 1), other_group];
        assert_eq!(plan(&jobs, &[], &workers()).len(), 3);
    }

    #[tokio::test]
    async fn five_one_cpu_jobs_make_two_shared_workers_once() {
        let jobs: Vec<_> = (0..5).map(|i| job(&format!("j{i}"), "u", 1)).collect();
        let (store, scaler) = autoscaler(jobs);

        let report = scaler.run_once(epoch_secs()).await.unwrap();
        assert_eq!(report, ScaleReport { shared: 2, dedicated: 0 });

        let rows = store.list_deployments().unwrap();
        assert_eq!(rows.len(), 2);
        for d in &rows {
            let res = &d.description.requirements.resources;
            assert_eq!((res.cores, res.instances), (4, 1));
            assert_eq!(d.identity, "u");
            assert_eq!(d.description.requirements.groups, vec!["physics".to_string()]);
            assert_eq!(d.identifier.as_deref(), Some(SHARED_IDENTIFIER));
        }

        // One creating, one running: still covers the demand.
        store
            .transition(&rows[0].id, &[DeploymentStatus::Accepted], DeploymentStatus::Creating, None)
            .unwrap();
        let mut running = rows[1].clone();
        running.status = DeploymentStatus::Running;
        store.put_deployment(&running).unwrap();

        let report = scaler.run_once(epoch_secs()).await.unwrap();
        assert_eq!(report, ScaleReport::default());
        assert_eq!(store.list_deployments().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn dedicated_job_is_not_duplicated() {
        let (store, scaler) = autoscaler(vec![job("big", "u", 8)]);
        assert_eq!(scaler.run_once(epoch_secs()).await.unwrap().dedicated, 1);
        assert_eq!(scaler.run_once(epoch_secs()).await.unwrap().dedicated, 0);
        assert_eq!(store.list_deployments().unwrap().len(), 1);
    }
}
