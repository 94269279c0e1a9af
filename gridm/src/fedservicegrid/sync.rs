use super::FedServiceGridController;
use crate::controller::split_key;
use crate::errors::Result;
use crate::events::reasons;
use crate::util::deep_contains;
use grid_api::ServiceGrid;
use grid_api::labels;

use kube::Resource;
use kube::ResourceExt;
use kube::api::ObjectMeta;
use kube::runtime::events::EventType;
use kube::runtime::reflector::ObjectRef;
use log;
use serde_json::json;

/*
 * The member grid materialised in `target` from a federated grid. Only name,
 * labels and annotations are carried over: no owner references, finalizers,
 * uid or resource version.
 */
pub fn member_from(fed: &ServiceGrid, target: &str) -> ServiceGrid {
    let mut member_labels = fed.labels().clone();
    member_labels.remove(labels::FEDRATION_DIS_KEY);

    ServiceGrid{
	metadata: ObjectMeta{
	    name: Some(fed.name_any()),
	    namespace: Some(target.to_string()),
	    labels: Some(member_labels),
	    annotations: fed.metadata.annotations.clone(),
	    ..Default::default()
	},
	spec: fed.spec.clone(),
    }
}

fn has_finalizers(grid: &ServiceGrid) -> bool {
    grid.metadata.finalizers.as_ref().map_or(false, |f| !f.is_empty())
}

fn spec_converged(member: &ServiceGrid, fed: &ServiceGrid) -> bool {
    match (serde_json::to_value(&member.spec), serde_json::to_value(&fed.spec)) {
	(Ok(actual), Ok(desired)) => deep_contains(&actual, &desired),
	_ => false,
    }
}

impl FedServiceGridController {

    pub(crate) async fn sync_fed_service_grid(&self, key: &str) -> Result<()> {
	let (namespace, name) = match split_key(key) {
	    Ok(names) => names,
	    Err(err) => {
		log::error!("{}", err);
		return Ok(());
	    }
	};

	let fed = match self.federated.get(&ObjectRef::new(&name).within(&namespace)) {
	    Some(fed) => fed,
	    None => {
		log::debug!("Federated ServiceGrid {} has been deleted", key);
		return Ok(());
	    }
	};

	if fed.is_being_deleted() {
	    return self.finalize(&fed).await;
	}

	if fed.spec.grid_uniq_key.is_empty() {
	    let note = format!("ServiceGrid {} has an empty spec.gridUniqKey, it is not federated", key);
	    log::warn!("{}", note);
	    self.recorder.publish(&fed.object_ref(&()), EventType::Warning, reasons::EMPTY_GRID_UNIQ_KEY, "Federate", note).await;
	    return Ok(());
	}

	let target = match fed.target_namespace() {
	    Some(target) => target,
	    None => {
		let note = format!("ServiceGrid {} has no {} label, it is not federated", key, labels::FED_TARGET_NAMESPACE);
		log::warn!("{}", note);
		self.recorder.publish(&fed.object_ref(&()), EventType::Warning, reasons::MISSING_TARGET_NAMESPACE, "Federate", note).await;
		return Ok(());
	    }
	};

	let member = self.sources.get(&ObjectRef::new(&name).within(&target)).map(|member| member.as_ref().clone());

	if !self.has_member_nodes(&fed.spec.grid_uniq_key) {
	    if let Some(member) = member {
		log::info!("No node carries {} anymore, removing ServiceGrid {}/{}",
			   fed.spec.grid_uniq_key, target, member.name_any());
		self.delete_member(&target, &name).await?;
	    }
	    return Ok(());
	}

	let member = match member {
	    Some(member) => Some(member),
	    None => self.create_member(&fed, &target).await?,
	};
	self.ensure_finalizer(&fed).await?;

	let member = match member {
	    Some(member) => member,
	    None => return Ok(()),
	};

	if spec_converged(&member, &fed) {
	    return Ok(());
	}

	log::info!("Updating ServiceGrid {}/{} from {}", target, name, key);
	let mut updated = member;
	updated.spec = fed.spec.clone();
	updated.labels_mut().insert(labels::FED_TARGET_NAMESPACE.to_string(), target.clone());
	self.api.update_grid(&updated).await?;
	Ok(())
    }

    /* whether any node of the cluster carries the grid unique key */
    fn has_member_nodes(&self, grid_uniq_key: &str) -> bool {
	self.nodes.state()
	    .iter()
	    .any(|node| labels::has_label(node.metadata.labels.as_ref(), grid_uniq_key))
    }

    /*
     * Creates the member. Returns the existing object when one was already
     * there without being known to the cache, so the caller can update it.
     */
    async fn create_member(&self, fed: &ServiceGrid, target: &str) -> Result<Option<ServiceGrid>> {
	let member = member_from(fed, target);
	log::info!("Creating ServiceGrid {}/{}", target, member.name_any());

	match self.api.create_grid(&member).await {
	    Ok(_) => Ok(None),
	    Err(err) if err.is_already_exists() => self.api.get_grid(target, &member.name_any()).await,
	    Err(err) => Err(err),
	}
    }

    /* a federated grid with a member holds the finalizer */
    async fn ensure_finalizer(&self, fed: &ServiceGrid) -> Result<()> {
	if has_finalizers(fed) {
	    return Ok(());
	}

	let patch = json!({ "metadata": { "finalizers": [labels::DIS_FINALIZER] } });
	self.api.patch_grid(&fed.namespace().unwrap_or_default(), &fed.name_any(), &patch).await?;
	Ok(())
    }

    async fn delete_member(&self, target: &str, name: &str) -> Result<()> {
	match self.api.delete_grid(target, name).await {
	    Err(err) if !err.is_not_found() => Err(err),
	    _ => Ok(()),
	}
    }

    /*
     * The member goes first, then the finalizer: the federated object must
     * not disappear while a member may still exist.
     */
    async fn finalize(&self, fed: &ServiceGrid) -> Result<()> {
	let name = fed.name_any();

	if let Some(target) = fed.target_namespace() {
	    log::info!("Federated ServiceGrid {} is being deleted, removing ServiceGrid {}/{}", name, target, name);
	    self.delete_member(&target, &name).await?;
	}

	if !has_finalizers(fed) {
	    return Ok(());
	}

	let patch = json!({ "metadata": { "finalizers": [] } });
	match self.api.patch_grid(&fed.namespace().unwrap_or_default(), &name, &patch).await {
	    Err(err) if !err.is_not_found() => Err(err),
	    _ => Ok(()),
	}
    }
}
