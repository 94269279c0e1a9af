use crate::labels;

use k8s_openapi::api::core::v1::ServiceSpec;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/*
 * A ServiceGrid describes one logical service that has to be present on every
 * site of the edge topology. Sites are partitioned by the node label named in
 * `gridUniqKey`; the template is the core/v1 ServiceSpec of the derived Service.
 */
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(group = "superedge.io", version = "v1", kind = "ServiceGrid", namespaced)]
#[kube(shortname = "sg")]
#[serde(rename_all = "camelCase")]
pub struct ServiceGridSpec {

    // node label key partitioning nodes into sites, must not be empty
    #[serde(default)]
    pub grid_uniq_key: String,

    // spec of the derived Service
    #[serde(default)]
    pub template: ServiceSpec,
}

impl ServiceGrid {

    /*
     * Name of the one Service this grid owns in its namespace.
     */
    pub fn service_name(&self) -> String {
	format!("{}{}", self.name_any(), labels::SERVICE_NAME_SUFFIX)
    }

    /*
     * Canonical selector of the grid's children: GRID_SELECTOR_NAME=<grid name>.
     */
    pub fn child_selector(&self) -> BTreeMap<String, String> {
	let mut selector = BTreeMap::new();
	selector.insert(labels::GRID_SELECTOR_NAME.to_string(), self.name_any());
	selector
    }

    /*
     * Value of the topology annotation, a JSON array holding exactly the
     * grid unique key.
     */
    pub fn topology_annotation(&self) -> String {
	serde_json::Value::from(vec![self.spec.grid_uniq_key.clone()]).to_string()
    }

    pub fn is_being_deleted(&self) -> bool {
	self.metadata.deletion_timestamp.is_some()
    }

    /* namespace a federated grid is projected into */
    pub fn target_namespace(&self) -> Option<String> {
	self.labels().get(labels::FED_TARGET_NAMESPACE).filter(|ns| !ns.is_empty()).cloned()
    }

    pub fn is_federated(&self) -> bool {
	self.labels().get(labels::FEDRATION_KEY).map(String::as_str) == Some(labels::FEDRATION_VALUE)
    }
}

pub fn new(name: &str, namespace: &str, spec: ServiceGridSpec) -> ServiceGrid {
    let mut metadata = ObjectMeta::default();
    metadata.name = Some(name.to_string());
    metadata.namespace = Some(namespace.to_string());

    ServiceGrid{
	metadata: metadata,
	spec: spec,
    }
}
