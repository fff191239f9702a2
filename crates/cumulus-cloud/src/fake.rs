//! In-memory cloud for tests and dry runs.
//!
//! `FakeCloud` keeps its instances in a map and can be scripted to fail
//! the next creates with given error messages, or to leave new instances in
//! a chosen status until the test flips them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use cumulus_core::Limits;

use crate::error::{CloudError, CloudResult};
use crate::resource::*;

#[derive(Debug, Clone)]
struct FakeInstance {
    name: String,
    status: InstanceStatus,
    metadata: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct FakeState {
    instances: BTreeMap<String, FakeInstance>,
    create_failures: VecDeque<String>,
    initial_status: Option<InstanceStatus>,
    next_id: u64,
    creates: u32,
    deleted: Vec<String>,
    created_specs: Vec<InstanceSpec>,
    unreachable: bool,
}

#[derive(Debug, Default)]
pub struct FakeCloud {
    state: Mutex<FakeState>,
    flavors: Vec<FlavorInfo>,
    images: Vec<ImageInfo>,
    quotas: Quotas,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flavor(mut self, name: &str, cpus: u32, memory_gb: f64, disk_gb: Option<f64>) -> Self {
        self.flavors.push(FlavorInfo {
            id: format!("flavor-{name}"),
            name: name.to_string(),
            cpus,
            memory_gb,
            disk_gb,
        });
        self
    }

    pub fn with_image(mut self, name: &str, os_type: &str, arch: &str, dist: &str, version: &str) -> Self {
        self.images.push(ImageInfo {
            id: format!("image-{name}"),
            name: name.to_string(),
            os_type: Some(os_type.to_string()),
            architecture: Some(arch.to_string()),
            distribution: Some(dist.to_string()),
            version: Some(version.to_string()),
        });
        self
    }

    pub fn with_quotas(mut self, limits: Limits, remaining: Option<Limits>) -> Self {
        self.quotas = Quotas {
            limits: Some(limits),
            remaining,
        };
        self
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next creates, one message per create.
    pub fn fail_next_creates<I, S>(&self, messages: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock()
            .create_failures
            .extend(messages.into_iter().map(Into::into));
    }

    /// Status given to newly created instances (default `Running`).
    pub fn set_initial_status(&self, status: InstanceStatus) {
        self.lock().initial_status = Some(status);
    }

    /// Flip every existing instance to `status`.
    pub fn set_all_status(&self, status: InstanceStatus) {
        for instance in self.lock().instances.values_mut() {
            instance.status = status;
        }
    }

    /// Make every API call fail as if the endpoint were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Plant an instance directly, bypassing `create_instance`.
    pub fn insert_instance(&self, handle: &str, name: &str, metadata: HashMap<String, String>) {
        self.lock().instances.insert(
            handle.to_string(),
            FakeInstance {
                name: name.to_string(),
                status: InstanceStatus::Running,
                metadata,
            },
        );
    }

    pub fn instance_handles(&self) -> Vec<String> {
        self.lock().instances.keys().cloned().collect()
    }

    /// Number of `create_instance` calls, including failed ones.
    pub fn create_calls(&self) -> u32 {
        self.lock().creates
    }

    pub fn deleted_handles(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    pub fn created_specs(&self) -> Vec<InstanceSpec> {
        self.lock().created_specs.clone()
    }

    fn check_reachable(&self) -> CloudResult<()> {
        if self.lock().unreachable {
            return Err(CloudError::Api {
                status: 503,
                body: "service unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Resource for FakeCloud {
    async fn create_instance(&self, spec: &InstanceSpec) -> CloudResult<String> {
        self.check_reachable()?;
        let mut state = self.lock();
        state.creates += 1;
        if let Some(message) = state.create_failures.pop_front() {
            return Err(CloudError::creation(message));
        }
        state.next_id += 1;
        let handle = format!("fake-{}", state.next_id);
        let status = state.initial_status.unwrap_or(InstanceStatus::Running);
        state.instances.insert(
            handle.clone(),
            FakeInstance {
                name: spec.name.clone(),
                status,
                metadata: spec.metadata(),
            },
        );
        state.created_specs.push(spec.clone());
        Ok(handle)
    }

    async fn delete_instance(&self, handle: &str) -> CloudResult<()> {
        self.check_reachable()?;
        let mut state = self.lock();
        state.instances.remove(handle);
        state.deleted.push(handle.to_string());
        Ok(())
    }

    async fn list_instances(&self) -> CloudResult<Vec<InstanceInfo>> {
        self.check_reachable()?;
        Ok(self
            .lock()
            .instances
            .iter()
            .map(|(id, i)| InstanceInfo {
                id: id.clone(),
                name: i.name.clone(),
                status: i.status,
                metadata: i.metadata.clone(),
            })
            .filter(InstanceInfo::is_ours)
            .collect())
    }

    async fn get_instance(&self, _name: &str, handle: &str) -> CloudResult<InstanceStatus> {
        self.check_reachable()?;
        Ok(self
            .lock()
            .instances
            .get(handle)
            .map(|i| i.status)
            .unwrap_or(InstanceStatus::NotFound))
    }

    async fn list_flavors(&self) -> CloudResult<Vec<FlavorInfo>> {
        self.check_reachable()?;
        Ok(self.flavors.clone())
    }

    async fn list_images(&self) -> CloudResult<Vec<ImageInfo>> {
        self.check_reachable()?;
        Ok(self.images.clone())
    }

    async fn get_quotas(&self) -> CloudResult<Quotas> {
        self.check_reachable()?;
        Ok(self.quotas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::FailureKind;

    fn spec(unique: &str) -> InstanceSpec {
        InstanceSpec {
            name: instance_name(unique),
            image: "image-rocky".to_string(),
            flavor: "m1.small".to_string(),
            network: None,
            security_groups: vec![],
            userdata: String::new(),
            disk_gb: 0,
            infra_id: "d1".to_string(),
            unique_infra_id: unique.to_string(),
            tags: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn scripted_failures_then_success() {
        let cloud = FakeCloud::new();
        cloud.fail_next_creates(["InsufficientInstanceCapacity"]);

        let err = cloud.create_instance(&spec("u1")).await.unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::InsufficientCapacity));

        let handle = cloud.create_instance(&spec("u2")).await.unwrap();
        assert_eq!(cloud.get_instance("", &handle).await.unwrap(), InstanceStatus::Running);
        assert_eq!(cloud.create_calls(), 2);
    }

    #[tokio::test]
    async fn listing_only_returns_tagged_instances() {
        let cloud = FakeCloud::new();
        cloud.create_instance(&spec("u1")).await.unwrap();
        cloud.insert_instance("foreign", "someone-elses-vm", HashMap::new());

        let listed = cloud.list_instances().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].infra_id(), Some("d1"));
        assert_eq!(listed[0].unique_infra_id(), Some("u1"));
    }

    #[tokio::test]
    async fn delete_and_lookup() {
        let cloud = FakeCloud::new();
        cloud.set_initial_status(InstanceStatus::Pending);
        let handle = cloud.create_instance(&spec("u1")).await.unwrap();
        assert_eq!(cloud.get_instance("", &handle).await.unwrap(), InstanceStatus::Pending);

        cloud.delete_instance(&handle).await.unwrap();
        assert_eq!(cloud.get_instance("", &handle).await.unwrap(), InstanceStatus::NotFound);
        assert_eq!(cloud.deleted_handles(), vec![handle]);
    }

    #[tokio::test]
    async fn unreachable_cloud_errors() {
        let cloud = FakeCloud::new().with_flavor("small", 2, 4.0, None);
        cloud.set_unreachable(true);
        assert!(cloud.list_flavors().await.is_err());
        cloud.set_unreachable(false);
        assert_eq!(cloud.list_flavors().await.unwrap().len(), 1);
    }
}
