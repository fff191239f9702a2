//! Token manager: refresh-token to access-token cache.
//!
//! Service-account tokens are cached per cloud in the `credentials` table;
//! user-scoped tokens are cached per identity in `user_credentials`. A
//! cached token is reused while it is more than [`EXPIRY_MARGIN_SECS`] from
//! expiry and either younger than [`VERIFY_AFTER_SECS`] or accepted by the
//! provider's `/userinfo` endpoint.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use cumulus_core::{OidcRefresh, config::OidcClientConfig, epoch_secs};
use cumulus_state::{Credential, Store, UserCredential};

use crate::error::{CloudError, CloudResult};

/// Refresh when a token is this close to expiry.
pub const EXPIRY_MARGIN_SECS: u64 = 600;
/// Tokens older than this are checked against `/userinfo` before reuse.
pub const VERIFY_AFTER_SECS: u64 = 600;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// What to do with a cached token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCheck {
    /// Use as-is.
    Valid,
    /// Old enough to need a userinfo check.
    Verify,
    /// Expired or about to.
    Refresh,
}

/// Decide how to treat a cached token created at `creation` expiring at `expiry`.
pub fn check_token(creation: u64, expiry: u64, now: u64) -> TokenCheck {
    if now + EXPIRY_MARGIN_SECS >= expiry {
        TokenCheck::Refresh
    } else if now.saturating_sub(creation) < VERIFY_AFTER_SECS {
        TokenCheck::Valid
    } else {
        TokenCheck::Verify
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

/// A project-scoped Keystone token and the service catalog issued with it.
#[derive(Debug, Clone)]
pub struct ScopedToken {
    pub token: String,
    pub catalog: serde_json::Value,
}

/// Token cache backed by the state store.
#[derive(Clone)]
pub struct TokenManager {
    store: Store,
    http: reqwest::Client,
}

impl TokenManager {
    pub fn new(store: Store) -> CloudResult<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { store, http })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Access token of a cloud's service account.
    pub async fn cloud_token(&self, cloud: &str, oidc: &OidcRefresh) -> CloudResult<String> {
        let now = epoch_secs();
        if let Some(cached) = self.store.get_credential(cloud)? {
            if self.reusable(&oidc.url, &cached.token, cached.creation, cached.expiry, now).await {
                return Ok(cached.token);
            }
        }

        let fresh = self
            .refresh(&oidc.url, &oidc.client_id, &oidc.client_secret, &oidc.refresh_token, &oidc.scope)
            .await?;
        self.store.put_credential(&Credential {
            cloud: cloud.to_string(),
            token: fresh.access_token.clone(),
            creation: now,
            expiry: now + fresh.expires_in,
        })?;
        info!(cloud, "refreshed service-account token");
        Ok(fresh.access_token)
    }

    /// Access token of an identity, from its stored refresh token.
    pub async fn identity_token(&self, identity: &str, client: &OidcClientConfig) -> CloudResult<String> {
        let now = epoch_secs();
        let mut credential = self
            .store
            .get_user_credential(identity)?
            .ok_or_else(|| CloudError::Auth(format!("no refresh token stored for identity {identity}")))?;

        if let Some(token) = credential.access_token.clone() {
            if self
                .reusable(&client.url, &token, credential.creation, credential.expiry, now)
                .await
            {
                return Ok(token);
            }
        }

        let fresh = self
            .refresh(
                &client.url,
                &client.client_id,
                &client.client_secret,
                &credential.refresh_token,
                &client.scope,
            )
            .await?;
        credential.access_token = Some(fresh.access_token.clone());
        credential.creation = now;
        credential.expiry = now + fresh.expires_in;
        self.store.put_user_credential(&credential)?;
        info!(identity, "refreshed user token");
        Ok(fresh.access_token)
    }

    /// Store a user's refresh token, dropping any cached access token.
    pub fn set_refresh_token(&self, identity: &str, refresh_token: &str) -> CloudResult<()> {
        self.store.put_user_credential(&UserCredential {
            identity: identity.to_string(),
            refresh_token: refresh_token.to_string(),
            access_token: None,
            creation: 0,
            expiry: 0,
        })?;
        Ok(())
    }

    async fn reusable(&self, issuer: &str, token: &str, creation: u64, expiry: u64, now: u64) -> bool {
        match check_token(creation, expiry, now) {
            TokenCheck::Valid => true,
            TokenCheck::Refresh => false,
            TokenCheck::Verify => self.userinfo_accepts(issuer, token).await,
        }
    }

    /// `GET {issuer}/userinfo` with the token; any failure means "not valid".
    async fn userinfo_accepts(&self, issuer: &str, token: &str) -> bool {
        let url = format!("{}/userinfo", issuer.trim_end_matches('/'));
        match self.http.get(&url).bearer_auth(token).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!(issuer, error = %e, "userinfo request failed");
                false
            }
        }
    }

    async fn refresh(
        &self,
        issuer: &str,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
        scope: &str,
    ) -> CloudResult<TokenResponse> {
        let url = format!("{}/token", issuer.trim_end_matches('/'));
        let mut form = vec![("grant_type", "refresh_token"), ("refresh_token", refresh_token)];
        if !scope.is_empty() {
            form.push(("scope", scope));
        }
        let response = self
            .http
            .post(&url)
            .basic_auth(client_id, Some(client_secret))
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::Auth(format!("token endpoint returned {status}: {body}")));
        }
        Ok(response.json().await?)
    }

    /// Exchange an OIDC access token for an unscoped Keystone token via
    /// the OS-FEDERATION endpoint.
    pub async fn federated_token(
        &self,
        auth_url: &str,
        identity_provider: &str,
        protocol: &str,
        access_token: &str,
    ) -> CloudResult<String> {
        let url = format!(
            "{}/OS-FEDERATION/identity_providers/{identity_provider}/protocols/{protocol}/auth",
            auth_url.trim_end_matches('/')
        );
        let response = self.http.post(&url).bearer_auth(access_token).send().await?;
        subject_token(response).await.map(|(token, _)| token)
    }

    /// Exchange an unscoped Keystone token for a project-scoped one.
    pub async fn scoped_token(&self, auth_url: &str, project_id: &str, unscoped: &str) -> CloudResult<ScopedToken> {
        let url = format!("{}/auth/tokens", auth_url.trim_end_matches('/'));
        let body = json!({
            "auth": {
                "identity": {"methods": ["token"], "token": {"id": unscoped}},
                "scope": {"project": {"id": project_id}}
            }
        });
        let response = self.http.post(&url).json(&body).send().await?;
        let (token, body) = subject_token(response).await?;
        debug!(auth_url, project_id, "obtained scoped token");
        Ok(ScopedToken {
            token,
            catalog: body["token"]["catalog"].clone(),
        })
    }
}

/// Pull `X-Subject-Token` and the JSON body out of a Keystone response.
async fn subject_token(response: reqwest::Response) -> CloudResult<(String, serde_json::Value)> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(CloudError::Auth(format!("keystone returned {status}: {body}")));
    }
    let token = response
        .headers()
        .get("X-Subject-Token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| CloudError::InvalidResponse("missing X-Subject-Token header".to_string()))?;
    let body = response.json().await.unwrap_or(serde_json::Value::Null);
    Ok((token, body))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    use super::*;

    /// One request seen by the local identity server.
    #[derive(Debug, Clone)]
    struct Hit {
        path: &'static str,
        authorization: Option<String>,
        body: String,
    }

    #[derive(Clone, Default)]
    struct Hits(Arc<Mutex<Vec<Hit>>>);

    impl Hits {
        fn record(&self, path: &'static str, headers: &HeaderMap, body: String) {
            let authorization = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            self.0.lock().unwrap().push(Hit {
                path,
                authorization,
                body,
            });
        }

        fn to(&self, path: &str) -> Vec<Hit> {
            self.0.lock().unwrap().iter().filter(|h| h.path == path).cloned().collect()
        }
    }

    /// An OIDC issuer answering `/token` and `/userinfo` with fixed statuses.
    fn issuer(hits: Hits, token_status: StatusCode, userinfo_status: StatusCode) -> Router {
        Router::new()
            .route(
                "/token",
                post(move |State(hits): State<Hits>, headers: HeaderMap, body: String| async move {
                    hits.record("/token", &headers, body);
                    (
                        token_status,
                        Json(json!({"access_token": "fresh", "expires_in": 1800})),
                    )
                }),
            )
            .route(
                "/userinfo",
                get(move |State(hits): State<Hits>, headers: HeaderMap| async move {
                    hits.record("/userinfo", &headers, String::new());
                    userinfo_status
                }),
            )
            .with_state(hits)
    }

    /// A Keystone answering `/v3/auth/tokens` and the federation endpoint.
    fn keystone(hits: Hits, subject_header: bool) -> Router {
        let respond = move |path: &'static str| {
            move |State(hits): State<Hits>, headers: HeaderMap, body: String| async move {
                hits.record(path, &headers, body);
                let body = Json(json!({"token": {"catalog": [{"type": "compute"}]}}));
                let mut response_headers = HeaderMap::new();
                if subject_header {
                    response_headers.insert("x-subject-token", "subject-1".parse().unwrap());
                }
                (StatusCode::CREATED, response_headers, body)
            }
        };
        Router::new()
            .route("/v3/auth/tokens", post(respond("/v3/auth/tokens")))
            .route(
                "/v3/OS-FEDERATION/identity_providers/egi.eu/protocols/openid/auth",
                post(respond("/federation")),
            )
            .with_state(hits)
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn oidc(url: &str) -> OidcRefresh {
        OidcRefresh {
            url: url.to_string(),
            client_id: "cumulus".to_string(),
            client_secret: "s3cret".to_string(),
            refresh_token: "rt-1".to_string(),
            scope: "openid".to_string(),
        }
    }

    #[test]
    fn fresh_tokens_are_used_directly() {
        assert_eq!(check_token(1000, 5000, 1100), TokenCheck::Valid);
    }

    #[test]
    fn old_tokens_are_verified() {
        assert_eq!(check_token(1000, 10_000, 1600), TokenCheck::Verify);
    }

    #[test]
    fn near_expiry_tokens_are_refreshed() {
        assert_eq!(check_token(1000, 1500, 1100), TokenCheck::Refresh);
        assert_eq!(check_token(1000, 1000, 2000), TokenCheck::Refresh);
    }

    #[tokio::test]
    async fn cached_cloud_token_is_reused() {
        let store = Store::open_in_memory().unwrap();
        let now = epoch_secs();
        store
            .put_credential(&Credential {
                cloud: "alpha".to_string(),
                token: "cached".to_string(),
                creation: now,
                expiry: now + 3600,
            })
            .unwrap();
        let tokens = TokenManager::new(store).unwrap();
        // Unreachable issuer: reaching the network would fail the test.
        let oidc = OidcRefresh {
            url: "http://127.0.0.1:9".to_string(),
            ..OidcRefresh::default()
        };
        assert_eq!(tokens.cloud_token("alpha", &oidc).await.unwrap(), "cached");
    }

    #[tokio::test]
    async fn identity_without_refresh_token_is_an_auth_error() {
        let store = Store::open_in_memory().unwrap();
        let tokens = TokenManager::new(store).unwrap();
        let err = tokens
            .identity_token("alice", &OidcClientConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Auth(_)));
    }

    #[tokio::test]
    async fn cached_identity_token_is_reused() {
        let store = Store::open_in_memory().unwrap();
        let tokens = TokenManager::new(store.clone()).unwrap();
        tokens.set_refresh_token("alice", "rt").unwrap();
        let mut cred = store.get_user_credential("alice").unwrap().unwrap();
        let now = epoch_secs();
        cred.access_token = Some("at".to_string());
        cred.creation = now;
        cred.expiry = now + 3600;
        store.put_user_credential(&cred).unwrap();

        let token = tokens
            .identity_token("alice", &OidcClientConfig::default())
            .await
            .unwrap();
        assert_eq!(token, "at");
    }

    #[tokio::test]
    async fn missing_cloud_token_is_refreshed_and_stored() {
        let hits = Hits::default();
        let url = serve(issuer(hits.clone(), StatusCode::OK, StatusCode::OK)).await;
        let store = Store::open_in_memory().unwrap();
        let tokens = TokenManager::new(store.clone()).unwrap();

        let before = epoch_secs();
        assert_eq!(tokens.cloud_token("alpha", &oidc(&url)).await.unwrap(), "fresh");
        let after = epoch_secs();

        let stored = store.get_credential("alpha").unwrap().unwrap();
        assert_eq!(stored.token, "fresh");
        assert!((before..=after).contains(&stored.creation));
        assert_eq!(stored.expiry, stored.creation + 1800);

        let sent = hits.to("/token");
        assert_eq!(sent.len(), 1);
        let basic = format!("Basic {}", STANDARD.encode("cumulus:s3cret"));
        assert_eq!(sent[0].authorization.as_deref(), Some(basic.as_str()));
        let form: Vec<&str> = sent[0].body.split('&').collect();
        assert!(form.contains(&"grant_type=refresh_token"), "{form:?}");
        assert!(form.contains(&"refresh_token=rt-1"), "{form:?}");
        assert!(form.contains(&"scope=openid"), "{form:?}");
        assert!(hits.to("/userinfo").is_empty());
    }

    #[tokio::test]
    async fn rejected_userinfo_forces_a_refresh() {
        let hits = Hits::default();
        let url = serve(issuer(hits.clone(), StatusCode::OK, StatusCode::UNAUTHORIZED)).await;
        let store = Store::open_in_memory().unwrap();
        let now = epoch_secs();
        store
            .put_credential(&Credential {
                cloud: "alpha".to_string(),
                token: "old".to_string(),
                creation: now - 1000,
                expiry: now + 3600,
            })
            .unwrap();
        let tokens = TokenManager::new(store.clone()).unwrap();

        assert_eq!(tokens.cloud_token("alpha", &oidc(&url)).await.unwrap(), "fresh");
        let checked = hits.to("/userinfo");
        assert_eq!(checked.len(), 1);
        assert_eq!(checked[0].authorization.as_deref(), Some("Bearer old"));
        assert_eq!(hits.to("/token").len(), 1);
        assert_eq!(store.get_credential("alpha").unwrap().unwrap().token, "fresh");
    }

    #[tokio::test]
    async fn accepted_userinfo_keeps_the_cached_token() {
        let hits = Hits::default();
        let url = serve(issuer(hits.clone(), StatusCode::OK, StatusCode::OK)).await;
        let store = Store::open_in_memory().unwrap();
        let now = epoch_secs();
        store
            .put_credential(&Credential {
                cloud: "alpha".to_string(),
                token: "old".to_string(),
                creation: now - 1000,
                expiry: now + 3600,
            })
            .unwrap();
        let tokens = TokenManager::new(store).unwrap();

        assert_eq!(tokens.cloud_token("alpha", &oidc(&url)).await.unwrap(), "old");
        assert_eq!(hits.to("/userinfo").len(), 1);
        assert!(hits.to("/token").is_empty());
    }

    #[tokio::test]
    async fn refused_refresh_is_an_auth_error() {
        let hits = Hits::default();
        let url = serve(issuer(hits, StatusCode::BAD_REQUEST, StatusCode::OK)).await;
        let store = Store::open_in_memory().unwrap();
        let tokens = TokenManager::new(store.clone()).unwrap();

        let err = tokens.cloud_token("alpha", &oidc(&url)).await.unwrap_err();
        assert!(matches!(err, CloudError::Auth(_)), "{err}");
        assert!(store.get_credential("alpha").unwrap().is_none());
    }

    #[tokio::test]
    async fn identity_token_refreshes_with_the_stored_refresh_token() {
        let hits = Hits::default();
        let url = serve(issuer(hits.clone(), StatusCode::OK, StatusCode::OK)).await;
        let store = Store::open_in_memory().unwrap();
        let tokens = TokenManager::new(store.clone()).unwrap();
        tokens.set_refresh_token("alice", "alice-rt").unwrap();
        let client = OidcClientConfig {
            url: url.clone(),
            client_id: "cumulus".to_string(),
            client_secret: "s3cret".to_string(),
            ..OidcClientConfig::default()
        };

        assert_eq!(tokens.identity_token("alice", &client).await.unwrap(), "fresh");
        let stored = store.get_user_credential("alice").unwrap().unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("fresh"));
        assert_eq!(stored.expiry, stored.creation + 1800);
        assert!(hits.to("/token")[0].body.contains("refresh_token=alice-rt"));
    }

    #[tokio::test]
    async fn scoped_token_comes_from_the_subject_header() {
        let hits = Hits::default();
        let url = serve(keystone(hits.clone(), true)).await;
        let tokens = TokenManager::new(Store::open_in_memory().unwrap()).unwrap();

        let scoped = tokens
            .scoped_token(&format!("{url}/v3"), "project-1", "unscoped-1")
            .await
            .unwrap();
        assert_eq!(scoped.token, "subject-1");
        assert_eq!(scoped.catalog, json!([{"type": "compute"}]));

        let sent: serde_json::Value = serde_json::from_str(&hits.to("/v3/auth/tokens")[0].body).unwrap();
        assert_eq!(sent["auth"]["identity"]["token"]["id"], "unscoped-1");
        assert_eq!(sent["auth"]["scope"]["project"]["id"], "project-1");
    }

    #[tokio::test]
    async fn federated_token_sends_the_access_token() {
        let hits = Hits::default();
        let url = serve(keystone(hits.clone(), true)).await;
        let tokens = TokenManager::new(Store::open_in_memory().unwrap()).unwrap();

        let unscoped = tokens
            .federated_token(&format!("{url}/v3"), "egi.eu", "openid", "access-1")
            .await
            .unwrap();
        assert_eq!(unscoped, "subject-1");
        assert_eq!(hits.to("/federation")[0].authorization.as_deref(), Some("Bearer access-1"));
    }

    #[tokio::test]
    async fn missing_subject_header_is_an_invalid_response() {
        let url = serve(keystone(Hits::default(), false)).await;
        let tokens = TokenManager::new(Store::open_in_memory().unwrap()).unwrap();

        let err = tokens
            .scoped_token(&format!("{url}/v3"), "project-1", "unscoped-1")
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::InvalidResponse(_)), "{err}");
    }
}
