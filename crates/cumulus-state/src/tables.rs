//! redb table definitions for the cumulus state store.
//!
//! Every table uses `&str` keys and `&[u8]` values (JSON-serialized rows).
//! Composite keys put the parent first so related rows share a prefix.

use redb::TableDefinition;

pub(crate) type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Deployments keyed by `{id}`.
pub const DEPLOYMENTS: JsonTable = TableDefinition::new("deployments");

/// Per-instance creation attempts keyed by `{deployment_id}:{unique_infra_id}`.
pub const DEPLOYMENT_LOG: JsonTable = TableDefinition::new("deployment_log");

/// Cloud facts keyed by `{cloud}/{identity}`.
pub const CLOUD_INFO: JsonTable = TableDefinition::new("cloud_info");

/// Flavors keyed by `{cloud}/{identity}/{name}`.
pub const FLAVORS: JsonTable = TableDefinition::new("flavors");

/// Images keyed by `{cloud}/{identity}/{name}`.
pub const IMAGES: JsonTable = TableDefinition::new("images");

/// Discovered EGI endpoints keyed by `{identity}/{site}`.
pub const EGI_CLOUDS: JsonTable = TableDefinition::new("egi_clouds");

/// Service-account tokens keyed by `{cloud}`.
pub const CREDENTIALS: JsonTable = TableDefinition::new("credentials");

/// User tokens keyed by `{identity}`.
pub const USER_CREDENTIALS: JsonTable = TableDefinition::new("user_credentials");

/// Full-refresh bookkeeping keyed by `{identity}`.
pub const RESOURCE_UPDATES: JsonTable = TableDefinition::new("resource_updates");

/// Deployment outcomes keyed by `{cloud}/{identity}/{time:020}/{uuid}`.
pub const DEPLOYMENT_STATS: JsonTable = TableDefinition::new("deployment_stats");

pub(crate) const ALL: [JsonTable; 10] = [
    DEPLOYMENTS,
    DEPLOYMENT_LOG,
    CLOUD_INFO,
    FLAVORS,
    IMAGES,
    EGI_CLOUDS,
    CREDENTIALS,
    USER_CREDENTIALS,
    RESOURCE_UPDATES,
    DEPLOYMENT_STATS,
];
