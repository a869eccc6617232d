use crate::{PatchError, Result};
use log::{error, info, warn};
use std::collections::BTreeMap;

/// Tier holds the definitions that changed starting with a host build.
#[derive(Clone, Debug)]
pub struct Tier<K, V> {
    pub threshold: u32,
    pub overrides: Vec<(K, V)>,
}

/// VersionCascade selects one definition per key for a host build.
///
/// The baseline gives every key a definition; each tier, taken in ascending
/// threshold order while its threshold is at most the requested version,
/// replaces the keys it names.
///
/// Example
/// ```rust
/// use mempatch::version::VersionCascade;
/// let cascade = VersionCascade::new(vec![("shift_up", "a"), ("shift_down", "a")])
///     .tier(1365, vec![("shift_up", "b")])
///     .unwrap()
///     .tier(2802, vec![("shift_down", "c")])
///     .unwrap();
/// let selected = cascade.select(2000);
/// assert_eq!(selected["shift_up"], "b");
/// assert_eq!(selected["shift_down"], "a");
/// ```
#[derive(Clone, Debug)]
pub struct VersionCascade<K, V> {
    baseline: BTreeMap<K, V>,
    tiers: Vec<Tier<K, V>>,
}
impl<K: Ord + Clone, V: Clone> VersionCascade<K, V> {
    pub fn new<I: IntoIterator<Item = (K, V)>>(baseline: I) -> Self {
        VersionCascade {
            baseline: baseline.into_iter().collect(),
            tiers: Vec::new(),
        }
    }

    /// tier appends overrides for builds starting at `threshold`. Thresholds must
    /// be strictly ascending.
    pub fn tier<I: IntoIterator<Item = (K, V)>>(mut self, threshold: u32, overrides: I) -> Result<Self> {
        if let Some(last) = self.tiers.last() {
            if threshold <= last.threshold {
                return Err(PatchError::UnorderedTier(threshold, last.threshold));
            }
        }
        self.tiers.push(Tier {
            threshold,
            overrides: overrides.into_iter().collect(),
        });
        Ok(self)
    }

    pub fn tiers(&self) -> &[Tier<K, V>] {
        &self.tiers
    }

    /// select folds every tier at or below `version` over the baseline.
    pub fn select(&self, version: u32) -> BTreeMap<K, V> {
        self.tiers
            .iter()
            .take_while(|tier| tier.threshold <= version)
            .fold(self.baseline.clone(), |mut selected, tier| {
                selected.extend(tier.overrides.iter().cloned());
                selected
            })
    }
}

/// resolve_version picks the build ordinal patterns are selected for.
///
/// `reported` comes from the host loader API, `exe_candidates` are the builds
/// matching the executable on disk. The loader value wins unless it claims a
/// build older than the executable, then the oldest matching build is used.
pub fn resolve_version(reported: u32, exe_candidates: &[u32], oldest_supported: u32) -> u32 {
    info!("Reported game version: {}", reported);
    if reported < oldest_supported {
        warn!("Outdated game version! Update your game.");
    }

    let (lowest, highest) = match (exe_candidates.iter().min(), exe_candidates.iter().max()) {
        (Some(lowest), Some(highest)) => (*lowest, *highest),
        _ => {
            error!("Failed to find a corresponding game version.");
            warn!("    Using reported version ({})", reported);
            return reported;
        }
    };

    if reported > highest {
        warn!("Game newer than last supported version");
        warn!("    You might experience instabilities or crashes");
        warn!("    Using reported version ({})", reported);
        return reported;
    }

    if reported < lowest {
        warn!("Reported version is lower than actual EXE version.");
        warn!("    EXE version      ({})", lowest);
        warn!("    Reported version ({})", reported);
        warn!("    Using EXE version ({})", lowest);
        return lowest;
    }

    info!("Using patterns for reported version ({})", reported);
    reported
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cascade() -> VersionCascade<&'static str, &'static str> {
        VersionCascade::new(vec![("a", "base"), ("b", "base"), ("c", "base")])
            .tier(1000, vec![("a", "t1"), ("b", "t1")])
            .unwrap()
            .tier(2000, vec![("a", "t2")])
            .unwrap()
    }

    #[test]
    fn test_select_below_first_tier() {
        let selected = cascade().select(999);
        assert!(selected.values().all(|v| *v == "base"));
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn test_select_between_tiers() {
        for version in [1000, 1500, 1999] {
            let selected = cascade().select(version);
            assert_eq!(selected["a"], "t1");
            assert_eq!(selected["b"], "t1");
            assert_eq!(selected["c"], "base");
        }
    }

    #[test]
    fn test_select_above_last_tier() {
        let selected = cascade().select(u32::MAX);
        assert_eq!(selected["a"], "t2");
        assert_eq!(selected["b"], "t1");
        assert_eq!(selected["c"], "base");
    }

    #[test]
    fn test_select_is_repeatable() {
        let cascade = cascade();
        assert_eq!(cascade.select(2000), cascade.select(2000));
    }

    #[test]
    fn test_tiers_must_ascend() {
        let result = VersionCascade::new(vec![("a", 0)])
            .tier(10, vec![("a", 1)])
            .unwrap()
            .tier(10, vec![("a", 2)]);
        match result {
            Err(PatchError::UnorderedTier(10, 10)) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_resolve_version() {
        assert_eq!(resolve_version(2372, &[], 877), 2372);
        assert_eq!(resolve_version(3095, &[2802, 2824], 877), 3095);
        assert_eq!(resolve_version(1604, &[2802, 2824], 877), 2802);
        assert_eq!(resolve_version(2810, &[2802, 2824], 877), 2810);
        assert_eq!(resolve_version(500, &[], 877), 500);
    }
}
