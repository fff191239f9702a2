//! cumulus-core: shared types for the cumulus provisioner.
//!
//! - [`config`]: the daemon configuration file
//! - [`description`]: what a deployment asks for (requirements, preferences)
//! - [`cloud`]: static and discovered cloud descriptors
//! - [`retry`]: linear back-off combinator for fallible operations

pub mod cloud;
pub mod config;
pub mod description;
pub mod retry;

pub use cloud::*;
pub use config::Config;
pub use description::*;

use std::time::{SystemTime, UNIX_EPOCH};

/// Identity that owns admin-defined clouds visible to everyone.
pub const STATIC_IDENTITY: &str = "static";

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_secs_returns_reasonable_value() {
        // Should be after 2024-01-01.
        assert!(epoch_secs() > 1_704_067_200);
    }
}
