//! cumulus-api: admission API for deployment requests.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/infrastructures` | Request a deployment (honours `Idempotency-Key`) |
//! | GET | `/infrastructures/{id}` | Deployment status |
//! | DELETE | `/infrastructures/{id}` | Request deletion |
//! | GET | `/health` | Store reachability |

pub mod handlers;

use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use cumulus_state::Store;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    /// Attempts for the insert of a new deployment row.
    pub insert_attempts: u32,
    /// Linear back-off step between insert attempts.
    pub insert_backoff: Duration,
}

impl ApiState {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            insert_attempts: 4,
            insert_backoff: Duration::from_millis(500),
        }
    }
}

/// Build the admission router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/infrastructures", post(handlers::create_infrastructure))
        .route(
            "/infrastructures/{id}",
            get(handlers::get_infrastructure).delete(handlers::delete_infrastructure),
        )
        .route("/health", get(handlers::health))
        .with_state(state)
}
