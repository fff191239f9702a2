//! Cloud ranking.
//!
//! Each candidate cloud gets a weight from three components:
//! - **Region preference**: position of the cloud's region in `preferences.regions`
//! - **Site preference**: position of the cloud's site in `preferences.sites`
//! - **Success ratio**: share of successful deployments over the recent window,
//!   scaled by [`SUCCESS_WEIGHT`]

use rand::Rng;
use rand::seq::SliceRandom;

use cumulus_core::{CloudDescriptor, Preferences};
use cumulus_state::{DeploymentStat, StatReason};

/// Stats older than this do not influence ranking.
pub const STATS_WINDOW_SECS: u64 = 7200;
/// Multiplier applied to the success ratio.
pub const SUCCESS_WEIGHT: f64 = 1000.0;
/// Score per step of preference position.
pub const PREFERENCE_STEP: f64 = 10.0;

/// Scored cloud, best first after [`rank_clouds`].
#[derive(Debug, Clone)]
pub struct CloudScore {
    pub cloud: CloudDescriptor,
    pub weight: f64,
    pub breakdown: ScoreBreakdown,
}

/// Individual score components for debugging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub region_rank: f64,
    pub site_rank: f64,
    pub success_ratio: f64,
}

/// Rank of `value` in an ordered preference list: the first entry scores
/// highest, absent values score 0.
pub fn preference_rank(preferences: &[String], value: &str) -> f64 {
    preferences
        .iter()
        .position(|p| p == value)
        .map(|i| (preferences.len() - i) as f64 * PREFERENCE_STEP)
        .unwrap_or(0.0)
}

/// `successes / (successes + failures)`; 1.0 when nothing was recorded.
pub fn success_ratio(stats: &[DeploymentStat]) -> f64 {
    if stats.is_empty() {
        return 1.0;
    }
    let successes = stats.iter().filter(|s| s.reason == StatReason::Success).count();
    successes as f64 / stats.len() as f64
}

pub fn score_cloud(cloud: CloudDescriptor, preferences: &Preferences, stats: &[DeploymentStat]) -> CloudScore {
    let breakdown = ScoreBreakdown {
        region_rank: preference_rank(&preferences.regions, &cloud.region),
        site_rank: preference_rank(&preferences.sites, cloud.site()),
        success_ratio: success_ratio(stats),
    };
    let weight = breakdown.region_rank + breakdown.site_rank + SUCCESS_WEIGHT * breakdown.success_ratio;
    CloudScore {
        cloud,
        weight,
        breakdown,
    }
}

/// Shuffle, then sort descending by weight.
///
/// The sort is stable, so clouds of equal weight keep their shuffled order
/// and rotate between calls.
pub fn rank_clouds<R: Rng + ?Sized>(mut scores: Vec<CloudScore>, rng: &mut R) -> Vec<CloudScore> {
    scores.shuffle(rng);
    scores.sort_by(|a, b| b.weight.partial_cmp(&a.weight).unwrap_or(std::cmp::Ordering::Equal));
    scores
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn cloud(name: &str, region: &str) -> CloudDescriptor {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "region": region,
            "credentials": {"type": "fake"}
        }))
        .unwrap()
    }

    fn stat(reason: StatReason) -> DeploymentStat {
        DeploymentStat {
            cloud: "alpha".to_string(),
            identity: "alice".to_string(),
            reason,
            time: 0,
            duration: 0,
        }
    }

    #[test]
    fn preference_position_scores() {
        let prefs = vec!["a".to_string(), "b".to_string()];
        assert_eq!(preference_rank(&prefs, "a"), 20.0);
        assert_eq!(preference_rank(&prefs, "b"), 10.0);
        assert_eq!(preference_rank(&prefs, "c"), 0.0);
        assert_eq!(preference_rank(&[], "a"), 0.0);
    }

    #[test]
    fn success_ratio_edges() {
        assert_eq!(success_ratio(&[]), 1.0);
        assert_eq!(success_ratio(&[stat(StatReason::Success)]), 1.0);
        assert_eq!(success_ratio(&[stat(StatReason::QuotaExceeded)]), 0.0);
        assert_eq!(
            success_ratio(&[stat(StatReason::Success), stat(StatReason::VMsFailed)]),
            0.5
        );
    }

    #[test]
    fn success_dominates_preferences() {
        let prefs = Preferences {
            sites: vec!["flaky".to_string()],
            regions: vec![],
        };
        let flaky = score_cloud(cloud("flaky", "r"), &prefs, &[stat(StatReason::VMsFailed)]);
        let steady = score_cloud(cloud("steady", "r"), &prefs, &[]);
        let ranked = rank_clouds(vec![flaky, steady], &mut StdRng::seed_from_u64(1));
        assert_eq!(ranked[0].cloud.name, "steady");
        assert_eq!(ranked[1].breakdown.site_rank, 10.0);
    }

    #[test]
    fn preferences_break_equal_success() {
        let prefs = Preferences {
            sites: vec!["beta".to_string(), "alpha".to_string()],
            regions: vec![],
        };
        let scores = vec![
            score_cloud(cloud("alpha", "r"), &prefs, &[]),
            score_cloud(cloud("beta", "r"), &prefs, &[]),
            score_cloud(cloud("gamma", "r"), &prefs, &[]),
        ];
        let ranked = rank_clouds(scores, &mut StdRng::seed_from_u64(7));
        let names: Vec<_> = ranked.iter().map(|s| s.cloud.name.as_str()).collect();
        assert_eq!(names, vec!["beta", "alpha", "gamma"]);
    }

    #[test]
    fn equal_weights_rotate() {
        let prefs = Preferences::default();
        let mut firsts = std::collections::HashSet::new();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let scores = ["a", "b", "c"]
                .iter()
                .map(|n| score_cloud(cloud(n, "r"), &prefs, &[]))
                .collect();
            firsts.insert(rank_clouds(scores, &mut rng)[0].cloud.name.clone());
        }
        assert!(firsts.len() > 1);
    }
}
