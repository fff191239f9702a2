//! User-data rendering for new instances.
//!
//! Templates are handlebars; the variables are `cloud`, `region`, `token`,
//! `uid_infra`, `unique_uid_infra` and `server`. A deployment may carry its
//! own base64-encoded template, otherwise the configured default is used.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use handlebars::Handlebars;
use serde::Serialize;

use cumulus_core::Config;

use crate::error::{SchedulerError, SchedulerResult};

const BUILTIN_TEMPLATE: &str = "#cloud-config
write_files:
  - path: /etc/prominence/worker.env
    permissions: '0600'
    content: |
      PROMINENCE_CLOUD={{cloud}}
      PROMINENCE_REGION={{region}}
      PROMINENCE_TOKEN={{token}}
      PROMINENCE_INFRA_ID={{uid_infra}}
      PROMINENCE_UNIQUE_INFRA_ID={{unique_uid_infra}}
      PROMINENCE_SERVER={{server}}
";

#[derive(Debug, Clone, Serialize)]
pub struct UserDataVars<'a> {
    pub cloud: &'a str,
    pub region: &'a str,
    pub token: &'a str,
    pub uid_infra: &'a str,
    pub unique_uid_infra: &'a str,
    pub server: &'a str,
}

/// The default template, loaded once at startup.
#[derive(Debug, Clone)]
pub struct UserDataTemplate {
    default: String,
}

impl UserDataTemplate {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
        }
    }

    /// `infrastructure.userdata` if set, the built-in template otherwise.
    pub fn from_config(config: &Config) -> SchedulerResult<Self> {
        match &config.infrastructure.userdata {
            Some(path) => Ok(Self::new(std::fs::read_to_string(path)?)),
            None => Ok(Self::new(BUILTIN_TEMPLATE)),
        }
    }

    /// Pick the deployment's own template (base64) or the default.
    pub fn select(&self, encoded: Option<&str>) -> SchedulerResult<String> {
        match encoded {
            Some(b64) if !b64.trim().is_empty() => {
                let bytes = STANDARD
                    .decode(b64.trim())
                    .map_err(|e| SchedulerError::Template(format!("invalid base64 template: {e}")))?;
                String::from_utf8(bytes).map_err(|e| SchedulerError::Template(e.to_string()))
            }
            _ => Ok(self.default.clone()),
        }
    }

    /// [`select`](Self::select), then render once with blank values so a
    /// template that cannot compile is rejected before any instance exists.
    pub fn resolve(&self, encoded: Option<&str>) -> SchedulerResult<String> {
        let template = self.select(encoded)?;
        let blank = UserDataVars {
            cloud: "",
            region: "",
            token: "",
            uid_infra: "",
            unique_uid_infra: "",
            server: "",
        };
        render(&template, &blank)?;
        Ok(template)
    }
}

/// Render `template` with `vars`. Values are substituted verbatim.
pub fn render(template: &str, vars: &UserDataVars<'_>) -> SchedulerResult<String> {
    let mut reg = Handlebars::new();
    reg.register_escape_fn(handlebars::no_escape);
    reg.register_template_string("userdata", template)
        .map_err(|e| SchedulerError::Template(e.to_string()))?;
    reg.render("userdata", vars)
        .map_err(|e| SchedulerError::Template(e.to_string()))
}
