//! cumulus-updater: cached cloud facts.
//!
//! [`Refresher`] refreshes one cloud's reachability, flavors, images and
//! quotas; the provisioner reuses its lazy quota refresh. [`Updater`] is
//! the periodic loop that decides which clouds need which pass.

pub mod error;
pub mod refresh;
pub mod updater;

pub use error::{UpdaterError, UpdaterResult};
pub use refresh::{Refresher, compute_limits, refresh_quotas_for};
pub use updater::{Pass, UpdateReport, Updater};
