use std::collections::BTreeMap;

/*
 * Label carried by every Service derived from a ServiceGrid, its value is the
 * owning grid's name.
 */
pub const GRID_SELECTOR_NAME: &str = "superedge.io/grid-selector";

/*
 * Annotation holding a JSON array with the grid's unique key, e.g. ["zone"],
 * read by the edge proxies for topology-aware routing.
 */
pub const TOPOLOGY_ANNOTATIONS_KEY: &str = "topologyKeys";

/* grids labeled FEDRATION_KEY=yes get resynced when their namespace shows up */
pub const FEDRATION_KEY: &str = "superedge.io/fed";
pub const FEDRATION_VALUE: &str = "yes";

/* names the namespace a federated grid is projected into */
pub const FED_TARGET_NAMESPACE: &str = "superedge.io/target-namespace";

/* stripped when a member grid is materialized from its federated template */
pub const FEDRATION_DIS_KEY: &str = "superedge.io/fed-dis";

/* namespaces created on behalf of a federated cluster carry this label */
pub const FED_CLUSTER_KEY: &str = "superedge.io/fed-cluster";

/* set on a federated grid while its member grid exists */
pub const DIS_FINALIZER: &str = "dis";

pub const SERVICE_NAME_SUFFIX: &str = "-svc";

/*
 * Equality-based selector matching: every selector pair has to be present in
 * the labels. An empty selector selects nothing.
 */
pub fn selector_matches(selector: &BTreeMap<String, String>, labels: Option<&BTreeMap<String, String>>) -> bool {
    if selector.is_empty() {
	return false;
    }

    match labels {
	Some(labels) => selector.iter().all(|(k, v)| labels.get(k) == Some(v)),
	None => false,
    }
}

/* whether the label key is present at all, value is irrelevant */
pub fn has_label(labels: Option<&BTreeMap<String, String>>, key: &str) -> bool {
    match labels {
	Some(labels) => labels.contains_key(key),
	None => false,
    }
}
