//! cumulus-cleaner: periodic housekeeping of deployments and cloud instances.

pub mod cleaner;
pub mod error;

pub use cleaner::{CleanReport, Cleaner, PHANTOM_SAFE_STATES};
pub use error::{CleanerError, CleanerResult};
