//! cumulus-state: embedded state store for cumulus.
//!
//! Backed by [redb](https://docs.rs/redb), holds the deployment table (the
//! desired state), the per-instance deployment log, cached cloud facts,
//! tokens, and deployment outcome stats.
//!
//! # Architecture
//!
//! All rows are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{cloud}/{identity}`, `{deployment_id}:{unique_infra_id}`)
//! keep related rows under a shared prefix for scans.
//!
//! [`Store`] is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`) and is
//! shared by every control loop in the daemon.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::Store;
pub use types::*;
