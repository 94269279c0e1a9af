use crate::client::GridApi;
use crate::errors::Error;
use crate::errors::MultiError;
use crate::errors::Result;
use grid_api::ServiceGrid;
use grid_api::labels;

use k8s_openapi::api::core::v1::Service as KubeService;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use kube::ResourceExt;
use log;
use serde_json::Value;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OnceCell;

/* the controlling owner of an object, if any */
pub fn controller_ref<K: Resource>(obj: &K) -> Option<&OwnerReference> {
    obj.meta()
	.owner_references
	.as_ref()
	.and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
}

/*
 * ServiceRefManager decides, for the Services of a grid's namespace, which
 * ones the grid owns. Matching orphans get adopted, owned Services that no
 * longer match get released. Nothing is ever deleted here.
 */
pub struct ServiceRefManager<'a> {
    api: &'a dyn GridApi,
    grid: &'a ServiceGrid,
    selector: BTreeMap<String, String>,

    // the OwnerReference we stamp on adopted children
    owner: OwnerReference,

    // the live grid is re-checked at most once per claim
    can_adopt: OnceCell<()>,
}

impl<'a> ServiceRefManager<'a> {

    pub fn new(api: &'a dyn GridApi, grid: &'a ServiceGrid) -> Result<Self> {
	let owner = match grid.controller_owner_ref(&()) {
	    Some(owner) => owner,
	    None => {
		let errmsg = format!("ServiceGrid {} has no uid yet", grid.name_any());
		return Err(Error::Adoption(errmsg));
	    }
	};

	Ok(Self{
	    api: api,
	    grid: grid,
	    selector: grid.child_selector(),
	    owner: owner,
	    can_adopt: OnceCell::new(),
	})
    }

    fn grid_uid(&self) -> &str {
	self.owner.uid.as_str()
    }

    fn matches(&self, svc: &KubeService) -> bool {
	labels::selector_matches(&self.selector, svc.metadata.labels.as_ref())
    }

    /*
     * Returns the Services owned by the grid once adoption and release have
     * been applied. Every failing adopt/release is reported, the rest of the
     * list is still processed.
     */
    pub async fn claim_services(&self, services: Vec<Arc<KubeService>>) -> Result<Vec<Arc<KubeService>>> {
	let mut claimed = Vec::new();
	let mut errors = MultiError::new();

	for svc in services {
	    match self.claim_service(svc).await {
		Ok(Some(svc)) => claimed.push(svc),
		Ok(None) => {},
		Err(err) => errors.push(err),
	    }
	}

	errors.into_result()?;
	Ok(claimed)
    }

    async fn claim_service(&self, svc: Arc<KubeService>) -> Result<Option<Arc<KubeService>>> {
	if let Some(owner) = controller_ref(svc.as_ref()) {
	    if owner.uid != self.grid_uid() {
		// somebody else's
		return Ok(None);
	    }
	    if self.matches(&svc) {
		return Ok(Some(svc));
	    }
	    if self.grid.is_being_deleted() {
		return Ok(None);
	    }

	    match self.release(&svc).await {
		Err(err) if err.is_not_found() => {},
		Err(err) => return Err(err),
		Ok(_) => {},
	    }
	    return Ok(None);
	}

	// orphan
	if self.grid.is_being_deleted() || !self.matches(&svc) {
	    return Ok(None);
	}
	if svc.metadata.deletion_timestamp.is_some() {
	    return Ok(None);
	}

	match self.adopt(&svc).await {
	    Ok(adopted) => Ok(Some(Arc::new(adopted))),
	    Err(err) if err.is_not_found() => Ok(None),
	    Err(err) => Err(err),
	}
    }

    /*
     * The grid in the cache may be stale: before stamping its uid on anything
     * make sure the live object is still the same one and is not going away.
     */
    async fn recheck_deletion_timestamp(&self) -> Result<()> {
	self.can_adopt.get_or_try_init(|| async {
	    let namespace = self.grid.namespace().unwrap_or_default();
	    let name = self.grid.name_any();

	    let fresh = match self.api.get_grid(&namespace, &name).await? {
		Some(fresh) => fresh,
		None => {
		    let errmsg = format!("original ServiceGrid {}/{} is gone", namespace, name);
		    return Err(Error::Adoption(errmsg));
		}
	    };
	    if fresh.metadata.uid.as_deref() != Some(self.grid_uid()) {
		let errmsg = format!("original ServiceGrid {}/{} is gone: got uid {:?}, wanted {}",
				     namespace, name, fresh.metadata.uid, self.grid_uid());
		return Err(Error::Adoption(errmsg));
	    }
	    if fresh.is_being_deleted() {
		let errmsg = format!("ServiceGrid {}/{} has just been deleted at {:?}",
				     namespace, name, fresh.metadata.deletion_timestamp);
		return Err(Error::Adoption(errmsg));
	    }
	    Ok(())
	}).await?;

	Ok(())
    }

    async fn adopt(&self, svc: &KubeService) -> Result<KubeService> {
	self.recheck_deletion_timestamp().await?;

	let namespace = svc.namespace().unwrap_or_default();
	let name = svc.name_any();
	log::info!("ServiceGrid {} adopting Service {}/{}", self.grid.name_any(), namespace, name);

	let mut owners: Vec<OwnerReference> = svc.owner_references().to_vec();
	owners.push(self.owner.clone());

	self.api.patch_service(&namespace, &name, &owners_patch(svc, &owners)).await
    }

    async fn release(&self, svc: &KubeService) -> Result<KubeService> {
	let namespace = svc.namespace().unwrap_or_default();
	let name = svc.name_any();
	log::info!("ServiceGrid {} releasing Service {}/{}", self.grid.name_any(), namespace, name);

	let owners: Vec<OwnerReference> = svc.owner_references()
	    .iter()
	    .filter(|r| r.uid != self.grid_uid())
	    .cloned()
	    .collect();

	self.api.patch_service(&namespace, &name, &owners_patch(svc, &owners)).await
    }
}

/*
 * Merge-patch replacing the owner references. The object's uid rides along as
 * a precondition so a recreated object with the same name is left alone.
 */
fn owners_patch(svc: &KubeService, owners: &[OwnerReference]) -> Value {
    let mut metadata = json!({ "ownerReferences": owners });
    if let Some(uid) = &svc.metadata.uid {
	metadata["uid"] = Value::from(uid.as_str());
    }

    json!({ "metadata": metadata })
}
