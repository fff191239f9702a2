//! Store: redb-backed state persistence for cumulus.
//!
//! Typed operations over deployments, the deployment log, cloud facts,
//! flavors, images, discovered endpoints, tokens and stats. redb runs one
//! write transaction at a time, so a read-check-write inside a single write
//! transaction behaves like a conditional row update: this is what gives the
//! dispatchers at-most-once promotion and lets deletions win over late
//! provisioner writes.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use cumulus_core::{STATIC_IDENTITY, epoch_secs};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        self.write(|txn| {
            // Opening a table in a write transaction creates it if absent.
            for table in ALL {
                txn.open_table(table).map_err(map_err!(Table))?;
            }
            Ok(())
        })
    }

    /// Reachability check used by health checks.
    pub fn ping(&self) -> StateResult<()> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn write<R>(&self, f: impl FnOnce(&WriteTransaction) -> StateResult<R>) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = f(&txn)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let row = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, row: &T) -> StateResult<()> {
        let value = serde_json::to_vec(row).map_err(map_err!(Serialize))?;
        self.write(|txn| {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
            Ok(())
        })
    }

    /// All rows whose key starts with `prefix` (empty prefix = whole table).
    fn scan_json<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let row = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(row);
            }
        }
        Ok(results)
    }

    /// Replace every row under `prefix` with `rows`, atomically.
    fn replace_prefix(&self, table: JsonTable, prefix: &str, rows: Vec<(String, Vec<u8>)>) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            let stale: Vec<String> = table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(prefix).then_some(k)
                })
                .collect();
            for key in &stale {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            for (key, value) in &rows {
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            Ok(())
        })
    }

    /// Read-modify-write a deployment inside one write transaction.
    ///
    /// `f` returns `false` to leave the row untouched. Returns whether the
    /// row was written; a missing row is `Ok(false)`.
    fn modify_deployment(&self, id: &str, f: impl FnOnce(&mut Deployment) -> bool) -> StateResult<bool> {
        self.write(|txn| {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let current = table
                .get(id)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            let Some(bytes) = current else {
                return Ok(false);
            };
            let mut deployment: Deployment =
                serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
            if !f(&mut deployment) {
                return Ok(false);
            }
            deployment.updated = epoch_secs();
            let value = serde_json::to_vec(&deployment).map_err(map_err!(Serialize))?;
            table.insert(id, value.as_slice()).map_err(map_err!(Write))?;
            Ok(true)
        })
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert a deployment unless its id already exists.
    ///
    /// Returns `false` for a duplicate id (idempotent replay).
    pub fn insert_deployment(&self, deployment: &Deployment) -> StateResult<bool> {
        let value = serde_json::to_vec(deployment).map_err(map_err!(Serialize))?;
        let inserted = self.write(|txn| {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            if table.get(deployment.id.as_str()).map_err(map_err!(Read))?.is_some() {
                return Ok(false);
            }
            table
                .insert(deployment.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            Ok(true)
        })?;
        debug!(deployment_id = %deployment.id, inserted, "deployment insert");
        Ok(inserted)
    }

    /// Overwrite a deployment row unconditionally (timestamps as given).
    pub fn put_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        self.put_json(DEPLOYMENTS, &deployment.id, deployment)
    }

    pub fn get_deployment(&self, id: &str) -> StateResult<Option<Deployment>> {
        self.get_json(DEPLOYMENTS, id)
    }

    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        self.scan_json(DEPLOYMENTS, "")
    }

    /// Deployments in any of `statuses`, oldest first.
    pub fn list_deployments_by_status(&self, statuses: &[DeploymentStatus]) -> StateResult<Vec<Deployment>> {
        let mut rows: Vec<Deployment> = self
            .list_deployments()?
            .into_iter()
            .filter(|d| statuses.contains(&d.status))
            .collect();
        rows.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(rows)
    }

    /// Write a new status, honouring the transition guards.
    ///
    /// A terminal row (`deleted`, `unable`) is never changed, and
    /// `configured`/`waiting`/`unable`/`creating` never overwrite a deletion
    /// state. Returns whether the write happened.
    pub fn set_status(&self, id: &str, status: DeploymentStatus, reason: Option<&str>) -> StateResult<bool> {
        let written = self.modify_deployment(id, |d| {
            if d.status.is_terminal() {
                return false;
            }
            if status.is_guarded_target() && d.status.is_deletion() {
                return false;
            }
            d.status = status;
            d.status_reason = reason.map(str::to_string);
            true
        })?;
        debug!(deployment_id = %id, %status, written, "status update");
        Ok(written)
    }

    /// Compare-and-set: move to `to` only if the current status is in `from`.
    pub fn transition(
        &self,
        id: &str,
        from: &[DeploymentStatus],
        to: DeploymentStatus,
        reason: Option<&str>,
    ) -> StateResult<bool> {
        let written = self.modify_deployment(id, |d| {
            if !from.contains(&d.status) || d.status.is_terminal() {
                return false;
            }
            d.status = to;
            d.status_reason = reason.map(str::to_string);
            true
        })?;
        debug!(deployment_id = %id, %to, written, "status transition");
        Ok(written)
    }

    /// Record resources accounted to a deployment.
    pub fn set_usage(&self, id: &str, instances: u32, cpus: u32, memory: f64) -> StateResult<bool> {
        self.modify_deployment(id, |d| {
            d.used_instances = instances;
            d.used_cpus = cpus;
            d.used_memory = memory;
            true
        })
    }

    /// Bind a deployment to a cloud and its instance handles.
    pub fn set_cloud(&self, id: &str, cloud: &str, infra_ids: &[String]) -> StateResult<bool> {
        self.modify_deployment(id, |d| {
            d.cloud = Some(cloud.to_string());
            d.cloud_infra_ids = infra_ids.to_vec();
            true
        })
    }

    /// Remove a deployment and its log rows. Returns true if it existed.
    pub fn remove_deployment(&self, id: &str) -> StateResult<bool> {
        let prefix = format!("{id}:");
        let existed = self.write(|txn| {
            let existed = {
                let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
                table.remove(id).map_err(map_err!(Write))?.is_some()
            };
            let mut log = txn.open_table(DEPLOYMENT_LOG).map_err(map_err!(Table))?;
            let keys: Vec<String> = log
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect();
            for key in &keys {
                log.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            Ok(existed)
        })?;
        debug!(deployment_id = %id, existed, "deployment removed");
        Ok(existed)
    }

    /// Identities that own deployments created at or after `since`.
    pub fn identities_since(&self, since: u64) -> StateResult<BTreeSet<String>> {
        Ok(self
            .list_deployments()?
            .into_iter()
            .filter(|d| d.created >= since)
            .map(|d| d.identity)
            .collect())
    }

    /// Sum of `(instances, cpus, memory)` accounted on a cloud for an identity.
    ///
    /// The static identity stands for shared clouds and sums every owner.
    pub fn used_resources(
        &self,
        cloud: &str,
        identity: &str,
        statuses: &[DeploymentStatus],
    ) -> StateResult<(u64, u64, f64)> {
        let mut totals = (0u64, 0u64, 0.0f64);
        for d in self.list_deployments()? {
            if (identity == STATIC_IDENTITY || d.identity == identity)
                && d.cloud.as_deref() == Some(cloud)
                && statuses.contains(&d.status)
            {
                totals.0 += u64::from(d.used_instances);
                totals.1 += u64::from(d.used_cpus);
                totals.2 += d.used_memory;
            }
        }
        Ok(totals)
    }

    // ── Deployment log ─────────────────────────────────────────────

    pub fn put_log_entry(&self, entry: &DeploymentLogEntry) -> StateResult<()> {
        self.put_json(DEPLOYMENT_LOG, &entry.table_key(), entry)
    }

    /// Attach the cloud-issued handle to an existing log row.
    pub fn set_log_handle(&self, id: &str, unique_infra_id: &str, handle: &str) -> StateResult<bool> {
        let key = format!("{id}:{unique_infra_id}");
        match self.get_json::<DeploymentLogEntry>(DEPLOYMENT_LOG, &key)? {
            Some(mut entry) => {
                entry.cloud_infra_id = Some(handle.to_string());
                self.put_json(DEPLOYMENT_LOG, &key, &entry)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn list_log_entries(&self, id: &str) -> StateResult<Vec<DeploymentLogEntry>> {
        self.scan_json(DEPLOYMENT_LOG, &format!("{id}:"))
    }

    pub fn list_all_log_entries(&self) -> StateResult<Vec<DeploymentLogEntry>> {
        self.scan_json(DEPLOYMENT_LOG, "")
    }

    /// Delete log rows whose parent deployment no longer exists.
    pub fn prune_orphan_log_entries(&self) -> StateResult<u32> {
        let orphans: Vec<String> = self
            .list_all_log_entries()?
            .into_iter()
            .filter(|e| matches!(self.get_deployment(&e.id), Ok(None)))
            .map(|e| e.table_key())
            .collect();
        let count = orphans.len() as u32;
        if count > 0 {
            self.write(|txn| {
                let mut table = txn.open_table(DEPLOYMENT_LOG).map_err(map_err!(Table))?;
                for key in &orphans {
                    table.remove(key.as_str()).map_err(map_err!(Write))?;
                }
                Ok(())
            })?;
        }
        Ok(count)
    }

    // ── Cloud facts ────────────────────────────────────────────────

    pub fn get_cloud_info(&self, cloud: &str, identity: &str) -> StateResult<Option<CloudInfo>> {
        self.get_json(CLOUD_INFO, &format!("{cloud}/{identity}"))
    }

    pub fn put_cloud_info(&self, info: &CloudInfo) -> StateResult<()> {
        self.put_json(CLOUD_INFO, &info.table_key(), info)
    }

    /// Upsert a cloud-info row through a closure, inside one transaction.
    pub fn update_cloud_info(&self, cloud: &str, identity: &str, f: impl FnOnce(&mut CloudInfo)) -> StateResult<CloudInfo> {
        let key = format!("{cloud}/{identity}");
        self.write(|txn| {
            let mut table = txn.open_table(CLOUD_INFO).map_err(map_err!(Table))?;
            let current = table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            let mut info = match current {
                Some(bytes) => serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?,
                None => CloudInfo::new(cloud, identity),
            };
            f(&mut info);
            let value = serde_json::to_vec(&info).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            Ok(info)
        })
    }

    pub fn list_cloud_info(&self) -> StateResult<Vec<CloudInfo>> {
        self.scan_json(CLOUD_INFO, "")
    }

    pub fn replace_flavors(&self, cloud: &str, identity: &str, flavors: &[Flavor]) -> StateResult<()> {
        let rows = flavors
            .iter()
            .map(|f| Ok((f.table_key(), serde_json::to_vec(f).map_err(map_err!(Serialize))?)))
            .collect::<StateResult<Vec<_>>>()?;
        self.replace_prefix(FLAVORS, &format!("{cloud}/{identity}/"), rows)
    }

    pub fn list_flavors(&self, cloud: &str, identity: &str) -> StateResult<Vec<Flavor>> {
        self.scan_json(FLAVORS, &format!("{cloud}/{identity}/"))
    }

    pub fn replace_images(&self, cloud: &str, identity: &str, images: &[Image]) -> StateResult<()> {
        let rows = images
            .iter()
            .map(|i| Ok((i.table_key(), serde_json::to_vec(i).map_err(map_err!(Serialize))?)))
            .collect::<StateResult<Vec<_>>>()?;
        self.replace_prefix(IMAGES, &format!("{cloud}/{identity}/"), rows)
    }

    pub fn list_images(&self, cloud: &str, identity: &str) -> StateResult<Vec<Image>> {
        self.scan_json(IMAGES, &format!("{cloud}/{identity}/"))
    }

    // ── Discovered endpoints ───────────────────────────────────────

    pub fn put_egi_cloud(&self, cloud: &EgiCloud) -> StateResult<()> {
        self.put_json(EGI_CLOUDS, &cloud.table_key(), cloud)
    }

    pub fn list_egi_clouds(&self, identity: &str) -> StateResult<Vec<EgiCloud>> {
        self.scan_json(EGI_CLOUDS, &format!("{identity}/"))
    }

    // ── Tokens ─────────────────────────────────────────────────────

    pub fn get_credential(&self, cloud: &str) -> StateResult<Option<Credential>> {
        self.get_json(CREDENTIALS, cloud)
    }

    pub fn put_credential(&self, credential: &Credential) -> StateResult<()> {
        self.put_json(CREDENTIALS, &credential.cloud, credential)
    }

    pub fn get_user_credential(&self, identity: &str) -> StateResult<Option<UserCredential>> {
        self.get_json(USER_CREDENTIALS, identity)
    }

    pub fn put_user_credential(&self, credential: &UserCredential) -> StateResult<()> {
        self.put_json(USER_CREDENTIALS, &credential.identity, credential)
    }

    // ── Refresh bookkeeping ────────────────────────────────────────

    pub fn get_resource_update(&self, identity: &str) -> StateResult<ResourceUpdate> {
        Ok(self
            .get_json(RESOURCE_UPDATES, identity)?
            .unwrap_or_default())
    }

    pub fn put_resource_update(&self, identity: &str, update: ResourceUpdate) -> StateResult<()> {
        self.put_json(RESOURCE_UPDATES, identity, &update)
    }

    // ── Stats ──────────────────────────────────────────────────────

    pub fn add_stat(&self, stat: &DeploymentStat) -> StateResult<()> {
        let key = format!(
            "{}/{}/{:020}/{}",
            stat.cloud,
            stat.identity,
            stat.time,
            uuid::Uuid::new_v4()
        );
        self.put_json(DEPLOYMENT_STATS, &key, stat)
    }

    /// Stats for a cloud and identity recorded at or after `since`.
    pub fn list_stats(&self, cloud: &str, identity: &str, since: u64) -> StateResult<Vec<DeploymentStat>> {
        Ok(self
            .scan_json::<DeploymentStat>(DEPLOYMENT_STATS, &format!("{cloud}/{identity}/"))?
            .into_iter()
            .filter(|s| s.time >= since)
            .collect())
    }

    pub fn list_all_stats(&self) -> StateResult<Vec<DeploymentStat>> {
        self.scan_json(DEPLOYMENT_STATS, "")
    }
}
