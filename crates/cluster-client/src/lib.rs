//! Control-plane access layer for the vmops controllers.
//!
//! Reads come from watch-fed reflector caches (point-in-time snapshots);
//! writes go straight to the API server. The [`ClusterClient`] trait keeps
//! reconcilers testable against [`MockClusterClient`] without a cluster.

pub mod client;
#[path = "trait.rs"]
pub mod cluster_trait;
pub mod error;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::KubeClusterClient;
pub use cluster_trait::ClusterClient;
pub use error::ClientError;
#[cfg(feature = "test-util")]
pub use mock::MockClusterClient;

use std::collections::BTreeMap;

/// Whether an object's label set satisfies an equality-based selector.
#[must_use]
pub fn selector_matches(
    labels: Option<&BTreeMap<String, String>>,
    selector: &BTreeMap<String, String>,
) -> bool {
    let Some(labels) = labels else {
        return selector.is_empty();
    };
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|have| have == v))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_selector_matches_subset() {
        let have = labels(&[("app", "vmops"), ("name", "v1"), ("role", "vm")]);
        assert!(selector_matches(Some(&have), &labels(&[("name", "v1")])));
        assert!(selector_matches(Some(&have), &have));
        assert!(!selector_matches(
            Some(&have),
            &labels(&[("name", "other")])
        ));
    }

    #[test]
    fn test_selector_against_unlabeled_object() {
        assert!(selector_matches(None, &BTreeMap::new()));
        assert!(!selector_matches(None, &labels(&[("app", "vmops")])));
    }
}
