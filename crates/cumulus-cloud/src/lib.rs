//! cumulus-cloud: everything that talks to a cloud.
//!
//! - [`resource`]: the [`Resource`] capability set every adapter implements
//! - [`classify`]: [`FailureKind`] and the creation-error classifier
//! - [`token`]: refresh-token to access-token cache, Keystone exchange
//! - [`connector`]: cloud descriptor to connected adapter
//! - [`catalog`]: the clouds an identity may use
//! - [`openstack`]: Nova/Glance adapter
//! - [`egi`]: EGI FedCloud endpoint discovery
//! - [`fake`]: in-memory adapter for tests

pub mod catalog;
pub mod classify;
pub mod connector;
pub mod egi;
pub mod error;
pub mod fake;
pub mod openstack;
pub mod resource;
pub mod token;

pub use catalog::CloudCatalog;
pub use classify::{FailureKind, classify_failure};
pub use connector::Connector;
pub use error::{CloudError, CloudResult};
pub use fake::FakeCloud;
pub use resource::*;
pub use token::TokenManager;
