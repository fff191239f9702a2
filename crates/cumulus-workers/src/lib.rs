//! cumulus-workers: tracks whether deployed instances joined the batch pool.
//!
//! - [`directory`]: the external worker list ([`WorkerDirectory`])
//! - [`lifecycle`]: the `running → visible ⇄ left → deletion-requested` loop

pub mod directory;
pub mod error;
pub mod lifecycle;

pub use directory::{HttpWorkerDirectory, StaticWorkerDirectory, Worker, WorkerDirectory};
pub use error::{WorkersError, WorkersResult};
pub use lifecycle::{LifecycleReport, WorkerLifecycle};
