//! cumulus-scheduler: turning deployment rows into running instances and back.
//!
//! - [`provisioner`]: policy-driven placement with per-instance watchdogs
//! - [`destroyer`]: deletion of every instance a deployment owned
//! - [`dispatcher`]: the deployer and destroyer polling loops
//! - [`userdata`]: user-data template rendering

pub mod destroyer;
pub mod dispatcher;
pub mod error;
pub mod instance;
pub mod provisioner;
pub mod userdata;

pub use destroyer::Destroyer;
pub use dispatcher::{Dispatcher, Handler};
pub use error::{SchedulerError, SchedulerResult};
pub use provisioner::{ProvisionOutcome, Provisioner};
pub use userdata::UserDataTemplate;
