//! Connector: cloud descriptor to connected adapter.
//!
//! Dispatch is by the descriptor's `credentials.type` tag. OpenStack clouds
//! authenticate through the token manager: an OIDC access token (the
//! cloud's service account or the request identity) is federated into an
//! unscoped Keystone token, which is exchanged for a project-scoped one.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use cumulus_core::config::OidcClientConfig;
use cumulus_core::{CloudDescriptor, TokenScope};

use crate::error::{CloudError, CloudResult};
use crate::fake::FakeCloud;
use crate::openstack::OpenStack;
use crate::resource::Resource;
use crate::token::TokenManager;

#[derive(Clone)]
pub struct Connector {
    tokens: TokenManager,
    user_client: OidcClientConfig,
    fakes: HashMap<String, Arc<FakeCloud>>,
}

impl Connector {
    /// `user_client` is the OIDC client used to refresh identity-scoped tokens.
    pub fn new(tokens: TokenManager, user_client: OidcClientConfig) -> Self {
        Self {
            tokens,
            user_client,
            fakes: HashMap::new(),
        }
    }

    /// Register an in-memory cloud served for descriptors of type `fake`.
    pub fn with_fake(mut self, name: &str, cloud: Arc<FakeCloud>) -> Self {
        self.fakes.insert(name.to_string(), cloud);
        self
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// Connect to `descriptor` on behalf of `identity`.
    pub async fn connect(&self, descriptor: &CloudDescriptor, identity: &str) -> CloudResult<Arc<dyn Resource>> {
        match descriptor.credentials.kind.as_str() {
            "openstack" => {
                let creds = &descriptor.credentials;
                let access = match creds.token_scope {
                    TokenScope::Cloud => {
                        let oidc = creds.oidc.as_ref().ok_or_else(|| {
                            CloudError::Auth(format!("cloud {} has no service-account credentials", descriptor.name))
                        })?;
                        self.tokens.cloud_token(&descriptor.name, oidc).await?
                    }
                    TokenScope::Identity => self.tokens.identity_token(identity, &self.user_client).await?,
                };
                let unscoped = self
                    .tokens
                    .federated_token(&creds.auth_url, &creds.identity_provider, &creds.protocol, &access)
                    .await?;
                let scoped = self
                    .tokens
                    .scoped_token(&creds.auth_url, &creds.project_id, &unscoped)
                    .await?;
                debug!(cloud = %descriptor.name, identity, "connected to openstack");
                let adapter = OpenStack::new(self.tokens.http().clone(), descriptor, scoped)?;
                Ok(Arc::new(adapter))
            }
            "fake" => self
                .fakes
                .get(&descriptor.name)
                .map(|cloud| Arc::clone(cloud) as Arc<dyn Resource>)
                .ok_or_else(|| CloudError::Unsupported(format!("no fake registered for {}", descriptor.name))),
            other => Err(CloudError::Unsupported(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_core::CloudCredentials;
    use cumulus_state::Store;

    fn descriptor(name: &str, kind: &str) -> CloudDescriptor {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "credentials": {"type": kind}
        }))
        .unwrap()
    }

    fn connector() -> Connector {
        let tokens = TokenManager::new(Store::open_in_memory().unwrap()).unwrap();
        Connector::new(tokens, OidcClientConfig::default())
    }

    #[tokio::test]
    async fn fake_clouds_are_served_by_name() {
        let fake = Arc::new(FakeCloud::new().with_flavor("small", 1, 2.0, None));
        let connector = connector().with_fake("alpha", fake);

        let resource = connector.connect(&descriptor("alpha", "fake"), "alice").await.unwrap();
        assert_eq!(resource.list_flavors().await.unwrap().len(), 1);
        assert!(connector.connect(&descriptor("beta", "fake"), "alice").await.is_err());
    }

    #[tokio::test]
    async fn unknown_types_are_unsupported() {
        let err = connector()
            .connect(&descriptor("gamma", "azure"), "alice")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CloudError::Unsupported(t) if t == "azure"));
    }

    #[tokio::test]
    async fn openstack_without_service_account_fails_auth() {
        let mut d = descriptor("delta", "openstack");
        d.credentials = CloudCredentials {
            kind: "openstack".to_string(),
            ..CloudCredentials::default()
        };
        let err = connector().connect(&d, "alice").await.err().unwrap();
        assert!(matches!(err, CloudError::Auth(_)));
    }
}
