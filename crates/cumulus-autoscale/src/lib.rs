//! cumulus-autoscale: sizes worker deployments to the idle job queue.
//!
//! Small jobs share pooled workers of a fixed size; large jobs get a
//! dedicated deployment each.

pub mod error;
pub mod scaler;
pub mod source;

pub use error::{AutoscaleError, AutoscaleResult};
pub use scaler::{Autoscaler, ScaleReport, WorkerRequest, plan};
pub use source::{HttpJobSource, IdleJob, JobSource, StaticJobSource};
