//! cumulus-policy: which clouds can take a request, and in what order.
//!
//! [`PolicyEngine`] filters a caller's clouds by the request's hard
//! constraints and picks flavors and images; [`scorer`] ranks the survivors
//! by preference and recent deployment success.

pub mod engine;
pub mod scorer;

pub use engine::{PolicyEngine, Rejection, distinct_flavor_classes};
pub use scorer::{CloudScore, ScoreBreakdown, rank_clouds, score_cloud};
