//! EGI FedCloud discovery.
//!
//! Reads the site list published at `egi.goc_url`, drops blacklisted sites
//! and sites outside the configured region, federates into each site's
//! Keystone with the identity's token, and records the first enabled
//! project per site as an [`EgiCloud`] row.

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use cumulus_core::config::EgiConfig;
use cumulus_core::{CloudCredentials, CloudDescriptor, TokenScope};
use cumulus_state::{EgiCloud, Store};

use crate::error::{CloudError, CloudResult};
use crate::token::TokenManager;

/// One entry of the published site list.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GocSite {
    pub name: String,
    /// Keystone v3 URL.
    pub url: String,
    #[serde(default)]
    pub region: Option<String>,
}

const IDENTITY_PROVIDER: &str = "egi.eu";
const PROTOCOL: &str = "openid";

/// Sites that pass the blacklist and region filters.
pub fn filter_sites(sites: Vec<GocSite>, config: &EgiConfig) -> Vec<GocSite> {
    sites
        .into_iter()
        .filter(|s| !config.blacklist.contains(&s.name))
        .filter(|s| {
            config
                .region
                .as_deref()
                .is_none_or(|r| s.region.as_deref() == Some(r))
        })
        .collect()
}

pub struct EgiDiscovery {
    tokens: TokenManager,
    config: EgiConfig,
}

impl EgiDiscovery {
    pub fn new(tokens: TokenManager, config: EgiConfig) -> Self {
        Self { tokens, config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Discover the endpoints usable by `identity`.
    ///
    /// A site that fails to authenticate or lists no enabled project is
    /// skipped; only fetching the site list itself is an error.
    pub async fn discover(&self, identity: &str, now: u64) -> CloudResult<Vec<EgiCloud>> {
        let access = self
            .tokens
            .identity_token(identity, &self.config.credentials)
            .await?;
        let response = self.tokens.http().get(&self.config.goc_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::Api {
                status: status.as_u16(),
                body,
            });
        }
        let sites: Vec<GocSite> = response.json().await?;
        let sites = filter_sites(sites, &self.config);

        let mut found = Vec::new();
        for site in sites {
            match self.project_for(&site, &access).await {
                Ok(Some((project_id, project_domain))) => found.push(EgiCloud {
                    identity: identity.to_string(),
                    site: site.name.clone(),
                    auth_url: site.url.clone(),
                    project_id,
                    project_domain,
                    region: site.region.clone().unwrap_or_default(),
                    enabled: true,
                    updated: now,
                }),
                Ok(None) => debug!(site = %site.name, identity, "no enabled project"),
                Err(e) => warn!(site = %site.name, identity, error = %e, "site discovery failed"),
            }
        }
        info!(identity, sites = found.len(), "egi discovery complete");
        Ok(found)
    }

    async fn project_for(&self, site: &GocSite, access: &str) -> CloudResult<Option<(String, Option<String>)>> {
        let unscoped = self
            .tokens
            .federated_token(&site.url, IDENTITY_PROVIDER, PROTOCOL, access)
            .await?;
        let url = format!("{}/auth/projects", site.url.trim_end_matches('/'));
        let response = self
            .tokens
            .http()
            .get(&url)
            .header("X-Auth-Token", unscoped)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::Api {
                status: status.as_u16(),
                body,
            });
        }
        let body: Value = response.json().await?;
        Ok(first_enabled_project(&body))
    }
}

fn first_enabled_project(body: &Value) -> Option<(String, Option<String>)> {
    body["projects"].as_array()?.iter().find_map(|p| {
        if p["enabled"].as_bool() == Some(false) {
            return None;
        }
        let id = p["id"].as_str()?.to_string();
        Some((id, p["domain_id"].as_str().map(str::to_string)))
    })
}

/// Upsert discovered rows and disable the identity's rows no longer seen.
pub fn sync_egi_clouds(store: &Store, identity: &str, discovered: &[EgiCloud], now: u64) -> CloudResult<()> {
    let seen: HashSet<&str> = discovered.iter().map(|c| c.site.as_str()).collect();
    for existing in store.list_egi_clouds(identity)? {
        if existing.enabled && !seen.contains(existing.site.as_str()) {
            info!(identity, site = %existing.site, "site no longer discovered, disabling");
            store.put_egi_cloud(&EgiCloud {
                enabled: false,
                updated: now,
                ..existing
            })?;
        }
    }
    for cloud in discovered {
        store.put_egi_cloud(cloud)?;
    }
    Ok(())
}

/// A cloud descriptor for a discovered endpoint, scoped to its identity.
pub fn egi_descriptor(cloud: &EgiCloud) -> CloudDescriptor {
    CloudDescriptor {
        name: cloud.site.clone(),
        kind: "cloud".to_string(),
        site: Some(cloud.site.clone()),
        region: cloud.region.clone(),
        credentials: CloudCredentials {
            kind: "openstack".to_string(),
            auth_url: cloud.auth_url.clone(),
            project_id: cloud.project_id.clone(),
            protocol: PROTOCOL.to_string(),
            identity_provider: IDENTITY_PROVIDER.to_string(),
            token_scope: TokenScope::Identity,
            oidc: None,
        },
        networks: Vec::new(),
        security_groups: Vec::new(),
        supported_groups: Vec::new(),
        supported_identities: vec![cloud.identity.clone()],
        image_templates: Vec::new(),
        default_images: Vec::new(),
        flavour_filters: None,
        tags: Default::default(),
        quotas: None,
    }
}
