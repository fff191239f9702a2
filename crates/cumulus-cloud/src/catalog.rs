//! The cloud list an identity may deploy to.

use std::collections::HashSet;

use cumulus_core::{CloudDescriptor, STATIC_IDENTITY};
use cumulus_state::Store;

use crate::egi::egi_descriptor;
use crate::error::CloudResult;

/// Admin-defined clouds plus the enabled EGI endpoints of each identity.
#[derive(Debug, Clone, Default)]
pub struct CloudCatalog {
    static_clouds: Vec<CloudDescriptor>,
}

impl CloudCatalog {
    pub fn new(static_clouds: Vec<CloudDescriptor>) -> Self {
        Self { static_clouds }
    }

    pub fn static_clouds(&self) -> &[CloudDescriptor] {
        &self.static_clouds
    }

    /// Clouds visible to `identity`. Admin clouds come first; a discovered
    /// site never shadows an admin cloud of the same name.
    pub fn for_identity(&self, store: &Store, identity: &str) -> CloudResult<Vec<CloudDescriptor>> {
        let mut clouds: Vec<CloudDescriptor> = self
            .static_clouds
            .iter()
            .filter(|c| c.visible_to(identity))
            .cloned()
            .collect();
        if identity == STATIC_IDENTITY {
            return Ok(clouds);
        }
        let names: HashSet<String> = clouds.iter().map(|c| c.name.clone()).collect();
        for egi in store.list_egi_clouds(identity)? {
            if egi.enabled && !names.contains(&egi.site) {
                clouds.push(egi_descriptor(&egi));
            }
        }
        Ok(clouds)
    }

    pub fn find(&self, store: &Store, identity: &str, name: &str) -> CloudResult<Option<CloudDescriptor>> {
        Ok(self
            .for_identity(store, identity)?
            .into_iter()
            .find(|c| c.name == name))
    }
}
