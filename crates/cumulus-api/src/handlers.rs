//! Admission API handlers.
//!
//! Each handler reads/writes via `Store` and returns JSON responses.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cumulus_core::retry::retry_linear;
use cumulus_core::{Description, Preferences, Requirements, epoch_secs};
use cumulus_state::{Deployment, DeploymentStatus};

use crate::ApiState;

/// Header carrying a client-chosen deployment id.
pub const IDEMPOTENCY_KEY: &str = "idempotency-key";

/// Identity recorded when the request names none.
pub const DEFAULT_IDENTITY: &str = "anonymous";

/// States a delete request may move out of.
const DELETABLE: [DeploymentStatus; 8] = [
    DeploymentStatus::Accepted,
    DeploymentStatus::Creating,
    DeploymentStatus::Configured,
    DeploymentStatus::Waiting,
    DeploymentStatus::Running,
    DeploymentStatus::Visible,
    DeploymentStatus::Left,
    DeploymentStatus::DeletionFailed,
];

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub dryrun: bool,
    pub requirements: Requirements,
    #[serde(default)]
    pub preferences: Preferences,
    #[serde(default)]
    pub radl: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedResponse {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: DeploymentStatus,
    pub status_reason: Option<String>,
    pub cloud: Option<String>,
    pub infra_id: Vec<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ErrorBody {
            error: msg.to_string(),
        }),
    )
}

/// Reject requests no cloud could ever satisfy.
fn validate(request: &CreateRequest) -> Result<(), String> {
    if let Some(radl) = request.radl.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
        let bytes = STANDARD
            .decode(radl)
            .map_err(|e| format!("radl is not valid base64: {e}"))?;
        String::from_utf8(bytes).map_err(|_| "radl is not valid UTF-8".to_string())?;
    }

    let res = &request.requirements.resources;
    if res.cores == 0 {
        return Err("cores must be at least 1".into());
    }
    if res.instances == 0 {
        return Err("instances must be at least 1".into());
    }
    if res.memory <= 0.0 {
        return Err("memory must be positive".into());
    }
    if res.disk < 0.0 {
        return Err("disk must not be negative".into());
    }
    if res.cores_max.is_some_and(|max| max < res.cores) {
        return Err("coresMax is below cores".into());
    }
    if res.memory_max.is_some_and(|max| max < res.memory) {
        return Err("memoryMax is below memory".into());
    }
    Ok(())
}

// ── Infrastructures ────────────────────────────────────────────

/// POST /infrastructures
pub async fn create_infrastructure(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<CreateRequest>,
) -> impl IntoResponse {
    if let Err(msg) = validate(&request) {
        return error_response(&msg, StatusCode::BAD_REQUEST).into_response();
    }

    let id = headers
        .get(IDEMPOTENCY_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    if request.dryrun {
        debug!(deployment_id = %id, "dry run accepted");
        return (StatusCode::OK, Json(CreatedResponse { id })).into_response();
    }

    let description = Description {
        requirements: request.requirements,
        preferences: request.preferences,
        radl: request.radl,
    };
    let identity = request.identity.unwrap_or_else(|| DEFAULT_IDENTITY.to_string());
    let mut deployment = Deployment::new(&id, identity, description, epoch_secs());
    deployment.identifier = request.identifier;

    let store = &state.store;
    let row = &deployment;
    let inserted = retry_linear(state.insert_attempts, state.insert_backoff, move || async move {
        store.insert_deployment(row)
    })
    .await;

    match inserted {
        Ok(true) => {
            info!(deployment_id = %id, identity = %deployment.identity, "deployment accepted");
            (StatusCode::CREATED, Json(CreatedResponse { id })).into_response()
        }
        Ok(false) => {
            debug!(deployment_id = %id, "duplicate idempotency key");
            (StatusCode::OK, Json(CreatedResponse { id })).into_response()
        }
        Err(e) => {
            warn!(deployment_id = %id, error = %e, "deployment insert failed");
            error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response()
        }
    }
}

/// GET /infrastructures/{id}
pub async fn get_infrastructure(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.store.get_deployment(&id) {
        Ok(Some(d)) => Json(StatusResponse {
            status: d.status,
            status_reason: d.status_reason,
            cloud: d.cloud,
            infra_id: d.cloud_infra_ids,
        })
        .into_response(),
        Ok(None) => error_response("deployment not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// DELETE /infrastructures/{id}
///
/// Repeating the request, or deleting a row already on its way out, is a
/// no-op that still answers 200.
pub async fn delete_infrastructure(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.store.get_deployment(&id) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response("deployment not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
    match state
        .store
        .transition(&id, &DELETABLE, DeploymentStatus::DeletionRequested, None)
    {
        Ok(written) => {
            if written {
                info!(deployment_id = %id, "deletion requested");
            }
            StatusCode::OK.into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Health ─────────────────────────────────────────────────────

/// GET /health
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.ping() {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => {
            warn!(error = %e, "store unreachable");
            StatusCode::CONFLICT
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(requirements: Requirements, radl: Option<&str>) -> CreateRequest {
        CreateRequest {
            identity: None,
            identifier: None,
            dryrun: false,
            requirements,
            preferences: Preferences::default(),
            radl: radl.map(str::to_string),
        }
    }

    #[test]
    fn validation_rejects_empty_requests() {
        let mut r = Requirements::default();
        assert!(validate(&request(r.clone(), None)).is_ok());
        r.resources.cores = 0;
        assert!(validate(&request(r.clone(), None)).is_err());
        r.resources.cores = 2;
        r.resources.instances = 0;
        assert!(validate(&request(r.clone(), None)).is_err());
        r.resources.instances = 1;
        r.resources.cores_max = Some(1);
        assert_eq!(validate(&request(r, None)).unwrap_err(), "coresMax is below cores");
    }

    #[test]
    fn validation_decodes_radl() {
        let r = Requirements::default();
        assert!(validate(&request(r.clone(), Some("  "))).is_ok());
        assert!(validate(&request(r.clone(), Some("aGVsbG8="))).is_ok());
        assert!(validate(&request(r.clone(), Some("***"))).is_err());
        // Decodes, but not to text.
        assert_eq!(validate(&request(r, Some("/w=="))).unwrap_err(), "radl is not valid UTF-8");
    }

    #[test]
    fn create_request_defaults() {
        let r: CreateRequest =
            serde_json::from_str(r#"{"requirements": {"resources": {"cores": 1, "memory": 2}}}"#).unwrap();
        assert!(!r.dryrun);
        assert!(r.identity.is_none());
        assert!(r.preferences.sites.is_empty());
    }
}
