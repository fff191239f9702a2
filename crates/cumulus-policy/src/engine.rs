//! Per-request cloud filtering and selection.
//!
//! A [`PolicyEngine`] is built for one deployment request and reads the
//! cached cloud facts the updater maintains. Every query is a pure function
//! of the store contents and the request.

use std::collections::HashSet;

use tracing::debug;

use cumulus_core::{CloudDescriptor, Description, STATIC_IDENTITY};
use cumulus_state::{CloudInfo, CloudStatus, Flavor, StateResult, Store};

use crate::scorer::{CloudScore, STATS_WINDOW_SECS, rank_clouds, score_cloud};

/// Why a cloud was rejected; used for debug logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Site,
    Region,
    Image,
    Flavor,
    Group,
    StaticLimits,
    Status,
    Remaining,
}

pub struct PolicyEngine<'a> {
    store: &'a Store,
    identity: &'a str,
    description: &'a Description,
    clouds: &'a [CloudDescriptor],
}

impl<'a> PolicyEngine<'a> {
    pub fn new(
        store: &'a Store,
        identity: &'a str,
        description: &'a Description,
        clouds: &'a [CloudDescriptor],
    ) -> Self {
        Self {
            store,
            identity,
            description,
            clouds,
        }
    }

    fn cloud_info(&self, cloud: &CloudDescriptor) -> StateResult<Option<CloudInfo>> {
        self.store
            .get_cloud_info(&cloud.name, cloud.facts_identity(self.identity))
    }

    /// Clouds meeting every hard constraint, in catalog order.
    ///
    /// With `ignore_usage = false` the dynamic remaining capacity must also
    /// cover the whole request.
    pub fn satisfies(&self, ignore_usage: bool) -> StateResult<Vec<CloudDescriptor>> {
        let mut matched = Vec::new();
        for cloud in self.clouds {
            match self.check(cloud, ignore_usage)? {
                None => matched.push(cloud.clone()),
                Some(reason) => {
                    debug!(cloud = %cloud.name, identity = self.identity, ?reason, "cloud rejected")
                }
            }
        }
        Ok(matched)
    }

    /// First failing predicate for `cloud`, or `None` if it qualifies.
    pub fn check(&self, cloud: &CloudDescriptor, ignore_usage: bool) -> StateResult<Option<Rejection>> {
        let req = &self.description.requirements;
        let res = &req.resources;

        if !req.sites.is_empty() && !req.sites.iter().any(|s| s == cloud.site()) {
            return Ok(Some(Rejection::Site));
        }
        if !req.regions.is_empty() && !req.regions.contains(&cloud.region) {
            return Ok(Some(Rejection::Region));
        }
        if !cloud.supported_groups.is_empty()
            && !req.groups.iter().any(|g| cloud.supported_groups.contains(g))
        {
            return Ok(Some(Rejection::Group));
        }
        if self.image(cloud)?.is_none() {
            return Ok(Some(Rejection::Image));
        }
        if self.flavors(cloud)?.is_empty() {
            return Ok(Some(Rejection::Flavor));
        }

        let Some(info) = self.cloud_info(cloud)? else {
            return Ok(Some(Rejection::Status));
        };
        let instances = u64::from(res.instances);
        let limits = cloud.quotas.unwrap_or_default().or(info.static_limits);
        if !limits.allows(res.total_cores(), res.total_memory(), instances) {
            return Ok(Some(Rejection::StaticLimits));
        }
        if info.status != CloudStatus::Up || info.mon_status == CloudStatus::Down {
            return Ok(Some(Rejection::Status));
        }
        if !ignore_usage && !info.remaining.allows(res.total_cores(), res.total_memory(), instances) {
            return Ok(Some(Rejection::Remaining));
        }
        Ok(None)
    }

    /// Flavors big enough for one instance, smallest (`cpus * memory`) first.
    ///
    /// When any `*Max` bound is set the list is cut to the bounds and
    /// reversed so the largest flavor within bounds comes first.
    pub fn flavors(&self, cloud: &CloudDescriptor) -> StateResult<Vec<Flavor>> {
        let res = &self.description.requirements.resources;
        let mut flavors: Vec<Flavor> = self
            .store
            .list_flavors(&cloud.name, cloud.facts_identity(self.identity))?
            .into_iter()
            .filter(|f| {
                f.cpus >= res.cores
                    && f.memory_gb >= res.memory
                    && f.disk_gb.is_none_or(|d| d >= res.disk)
            })
            .collect();
        flavors.sort_by(|a, b| {
            let ka = f64::from(a.cpus) * a.memory_gb;
            let kb = f64::from(b.cpus) * b.memory_gb;
            ka.partial_cmp(&kb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });

        if res.has_max() {
            flavors.retain(|f| {
                res.cores_max.is_none_or(|m| f.cpus <= m)
                    && res.memory_max.is_none_or(|m| f.memory_gb <= m)
                    && res.disk_max.is_none_or(|m| f.disk_gb.is_none_or(|d| d <= m))
            });
            flavors.reverse();
        }
        Ok(flavors)
    }

    /// `(logical_name, cloud_image_id)` of the first matching image by name,
    /// searching the identity's images and the static fallback.
    pub fn image(&self, cloud: &CloudDescriptor) -> StateResult<Option<(String, String)>> {
        let want = &self.description.requirements.image;
        let facts_identity = cloud.facts_identity(self.identity);
        let mut images = self.store.list_images(&cloud.name, facts_identity)?;
        if facts_identity != STATIC_IDENTITY {
            images.extend(self.store.list_images(&cloud.name, STATIC_IDENTITY)?);
        }

        let matches = |wanted: &Option<String>, have: &str| wanted.as_deref().is_none_or(|w| w == have);
        let best = images
            .into_iter()
            .filter(|i| {
                matches(&want.os_type, &i.os_type)
                    && matches(&want.architecture, &i.os_arch)
                    && matches(&want.distribution, &i.os_dist)
                    && matches(&want.version, &i.os_vers)
            })
            .min_by(|a, b| a.name.cmp(&b.name));
        Ok(best.map(|i| (i.name, i.id)))
    }

    /// Rank `clouds` by preference and recent success, best first.
    pub fn rank(&self, clouds: Vec<CloudDescriptor>, now: u64) -> StateResult<Vec<CloudScore>> {
        let since = now.saturating_sub(STATS_WINDOW_SECS);
        let mut scores = Vec::with_capacity(clouds.len());
        for cloud in clouds {
            let stats = self.store.list_stats(&cloud.name, self.identity, since)?;
            scores.push(score_cloud(cloud, &self.description.preferences, &stats));
        }
        Ok(rank_clouds(scores, &mut rand::thread_rng()))
    }
}

/// Collapse flavors with identical `(cpus, memory)` to the first of each class.
pub fn distinct_flavor_classes(flavors: Vec<Flavor>) -> Vec<Flavor> {
    let mut seen = HashSet::new();
    flavors
        .into_iter()
        .filter(|f| seen.insert((f.cpus, f.memory_gb.to_bits())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_core::{Limits, Requirements, ResourceRequirements};
    use cumulus_state::{DeploymentStat, Image, StatReason};

    fn cloud(name: &str) -> CloudDescriptor {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "region": "eu",
            "credentials": {"type": "fake"}
        }))
        .unwrap()
    }

    fn flavor(cloud: &str, name: &str, cpus: u32, memory_gb: f64, disk_gb: Option<f64>) -> Flavor {
        Flavor {
            cloud: cloud.to_string(),
            identity: STATIC_IDENTITY.to_string(),
            name: name.to_string(),
            cpus,
            memory_gb,
            disk_gb,
        }
    }

    fn image(cloud: &str, name: &str, dist: &str) -> Image {
        Image {
            cloud: cloud.to_string(),
            identity: STATIC_IDENTITY.to_string(),
            name: name.to_string(),
            id: format!("id-{name}"),
            os_type: "linux".to_string(),
            os_arch: "x86_64".to_string(),
            os_dist: dist.to_string(),
            os_vers: "9".to_string(),
        }
    }

    /// A cloud that is up, with one image and three flavors.
    fn seed(store: &Store, name: &str) {
        store
            .replace_flavors(
                name,
                STATIC_IDENTITY,
                &[
                    flavor(name, "small", 2, 4.0, Some(20.0)),
                    flavor(name, "medium", 4, 8.0, None),
                    flavor(name, "large", 8, 16.0, Some(80.0)),
                ],
            )
            .unwrap();
        store
            .replace_images(name, STATIC_IDENTITY, &[image(name, "rocky9", "rocky")])
            .unwrap();
        store
            .update_cloud_info(name, STATIC_IDENTITY, |i| i.status = CloudStatus::Up)
            .unwrap();
    }

    fn request(cores: u32, memory: f64, instances: u32) -> Description {
        Description {
            requirements: Requirements {
                resources: ResourceRequirements {
                    cores,
                    memory,
                    instances,
                    ..ResourceRequirements::default()
                },
                ..Requirements::default()
            },
            ..Description::default()
        }
    }

    #[test]
    fn site_whitelist_excludes_everything() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "alpha");
        seed(&store, "beta");
        let clouds = vec![cloud("alpha"), cloud("beta")];
        let mut desc = request(1, 1.0, 1);
        desc.requirements.sites = vec!["nowhere".to_string()];

        let engine = PolicyEngine::new(&store, "alice", &desc, &clouds);
        assert!(engine.satisfies(true).unwrap().is_empty());
        assert_eq!(engine.check(&clouds[0], true).unwrap(), Some(Rejection::Site));
    }

    #[test]
    fn static_limits_filter_large_requests() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "alpha");
        seed(&store, "beta");
        store
            .update_cloud_info("alpha", STATIC_IDENTITY, |i| {
                i.static_limits = Limits { cpus: Some(8), memory: None, instances: None }
            })
            .unwrap();
        store
            .update_cloud_info("beta", STATIC_IDENTITY, |i| {
                i.remaining = Limits { cpus: Some(16), memory: None, instances: None }
            })
            .unwrap();
        let clouds = vec![cloud("alpha"), cloud("beta")];
        let desc = request(4, 8.0, 3);

        let engine = PolicyEngine::new(&store, "alice", &desc, &clouds);
        let names: Vec<_> = engine.satisfies(false).unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["beta"]);
        assert_eq!(engine.check(&clouds[0], true).unwrap(), Some(Rejection::StaticLimits));
    }

    #[test]
    fn remaining_capacity_only_counts_when_usage_matters() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "alpha");
        store
            .update_cloud_info("alpha", STATIC_IDENTITY, |i| {
                i.remaining = Limits { cpus: Some(2), memory: None, instances: None }
            })
            .unwrap();
        let clouds = vec![cloud("alpha")];
        let desc = request(4, 8.0, 1);

        let engine = PolicyEngine::new(&store, "alice", &desc, &clouds);
        assert_eq!(engine.satisfies(true).unwrap().len(), 1);
        assert!(engine.satisfies(false).unwrap().is_empty());
        // Two calls over the same snapshot agree.
        assert_eq!(engine.satisfies(false).unwrap(), engine.satisfies(false).unwrap());
    }

    #[test]
    fn down_or_unmonitored_clouds_are_rejected() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "alpha");
        let clouds = vec![cloud("alpha"), cloud("unknown")];
        let desc = request(1, 1.0, 1);
        store
            .update_cloud_info("alpha", STATIC_IDENTITY, |i| i.mon_status = CloudStatus::Down)
            .unwrap();

        let engine = PolicyEngine::new(&store, "alice", &desc, &clouds);
        assert_eq!(engine.check(&clouds[0], true).unwrap(), Some(Rejection::Status));
        // No facts at all means no image either.
        assert_eq!(engine.check(&clouds[1], true).unwrap(), Some(Rejection::Image));
    }

    #[test]
    fn groups_must_intersect() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "alpha");
        let mut c = cloud("alpha");
        c.supported_groups = vec!["physics".to_string()];
        let clouds = vec![c];
        let mut desc = request(1, 1.0, 1);

        let engine = PolicyEngine::new(&store, "alice", &desc, &clouds);
        assert_eq!(engine.check(&clouds[0], true).unwrap(), Some(Rejection::Group));
        desc.requirements.groups = vec!["physics".to_string()];
        let engine = PolicyEngine::new(&store, "alice", &desc, &clouds);
        assert_eq!(engine.check(&clouds[0], true).unwrap(), None);
    }

    #[test]
    fn flavors_smallest_first_and_reversed_with_max() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "alpha");
        let alpha = cloud("alpha");
        let clouds = vec![alpha.clone()];

        let mut desc = request(2, 4.0, 1);
        desc.requirements.resources.disk = 30.0;
        let engine = PolicyEngine::new(&store, "alice", &desc, &clouds);
        let names: Vec<_> = engine.flavors(&alpha).unwrap().into_iter().map(|f| f.name).collect();
        // small has a 20 GiB disk; medium's disk is unknown and passes.
        assert_eq!(names, vec!["medium", "large"]);

        let mut desc = request(2, 4.0, 1);
        desc.requirements.resources.cores_max = Some(4);
        let engine = PolicyEngine::new(&store, "alice", &desc, &clouds);
        let names: Vec<_> = engine.flavors(&alpha).unwrap().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["medium", "small"]);
    }

    #[test]
    fn image_matches_and_prefers_lowest_name() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "alpha");
        store
            .replace_images(
                "alpha",
                STATIC_IDENTITY,
                &[image("alpha", "zz-rocky", "rocky"), image("alpha", "aa-rocky", "rocky"), image("alpha", "ubuntu", "ubuntu")],
            )
            .unwrap();
        let alpha = cloud("alpha");
        let clouds = vec![alpha.clone()];
        let mut desc = request(1, 1.0, 1);
        desc.requirements.image.distribution = Some("rocky".to_string());

        let engine = PolicyEngine::new(&store, "alice", &desc, &clouds);
        assert_eq!(
            engine.image(&alpha).unwrap(),
            Some(("aa-rocky".to_string(), "id-aa-rocky".to_string()))
        );
        desc.requirements.image.distribution = Some("debian".to_string());
        let engine = PolicyEngine::new(&store, "alice", &desc, &clouds);
        assert_eq!(engine.image(&alpha).unwrap(), None);
    }

    #[test]
    fn rank_uses_recent_stats_only() {
        let store = Store::open_in_memory().unwrap();
        let now = 100_000;
        for (cloud, reason, time) in [
            ("alpha", StatReason::VMsFailed, now - 60),
            ("beta", StatReason::VMsFailed, now - STATS_WINDOW_SECS - 1),
        ] {
            store
                .add_stat(&DeploymentStat {
                    cloud: cloud.to_string(),
                    identity: "alice".to_string(),
                    reason,
                    time,
                    duration: 1,
                })
                .unwrap();
        }
        let desc = request(1, 1.0, 1);
        let clouds = vec![cloud("alpha"), cloud("beta")];
        let engine = PolicyEngine::new(&store, "alice", &desc, &clouds);
        let ranked = engine.rank(clouds.clone(), now).unwrap();
        assert_eq!(ranked[0].cloud.name, "beta");
        assert_eq!(ranked[1].breakdown.success_ratio, 0.0);
    }

    #[test]
    fn flavor_classes_are_deduplicated() {
        let flavors = vec![
            flavor("a", "m1.small", 2, 4.0, None),
            flavor("a", "m2.small", 2, 4.0, None),
            flavor("a", "m1.large", 8, 16.0, None),
        ];
        let names: Vec<_> = distinct_flavor_classes(flavors).into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["m1.small", "m1.large"]);
    }
}
