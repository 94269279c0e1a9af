use super::ServiceGridController;
use crate::controller::split_key;
use crate::errors::MultiError;
use crate::errors::Result;
use crate::events::reasons;
use crate::refmanager::ServiceRefManager;
use grid_api::ServiceGrid;
use grid_api::labels;

use futures::FutureExt;
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::Service as KubeService;
use k8s_openapi::api::core::v1::ServicePort;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;
use kube::ResourceExt;
use kube::api::ObjectMeta;
use kube::runtime::events::EventType;
use kube::runtime::reflector::ObjectRef;
use log;
use std::collections::BTreeMap;
use std::sync::Arc;

/*
 * What has to happen to the children of one grid.
 */
#[derive(Debug, Default)]
pub struct SyncPlan {
    pub adds: Vec<KubeService>,
    pub updates: Vec<KubeService>,
    pub deletes: Vec<KubeService>,
}

impl SyncPlan {

    pub fn is_empty(&self) -> bool {
	self.adds.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/*
 * The Service a grid derives from scratch.
 */
pub fn new_service(grid: &ServiceGrid) -> KubeService {
    let mut annotations = BTreeMap::new();
    annotations.insert(labels::TOPOLOGY_ANNOTATIONS_KEY.to_string(), grid.topology_annotation());

    KubeService{
	metadata: ObjectMeta{
	    name: Some(grid.service_name()),
	    namespace: grid.namespace(),
	    labels: Some(grid.child_selector()),
	    annotations: Some(annotations),
	    owner_references: grid.controller_owner_ref(&()).map(|owner| vec![owner]),
	    ..Default::default()
	},
	spec: Some(grid.spec.template.clone()),
	status: None,
    }
}

/*
 * Brings an existing child in line with the grid: selector and ports come
 * from the template, the topology annotation from the grid key.
 *
 * On NodePort Services a port that keeps its name and does not ask for a
 * particular node port keeps the one already allocated, otherwise every
 * template edit would shuffle node ports around.
 */
pub fn keep_consistence(grid: &ServiceGrid, svc: &KubeService) -> KubeService {
    let mut copy = svc.clone();
    let template = &grid.spec.template;
    let spec = copy.spec.get_or_insert_with(Default::default);

    let mut ports: Vec<ServicePort> = template.ports.clone().unwrap_or_default();
    if spec.type_.as_deref() == Some("NodePort") {
	let old_ports = spec.ports.clone().unwrap_or_default();
	for port in ports.iter_mut() {
	    if port.node_port.unwrap_or(0) != 0 {
		continue;
	    }
	    let old = old_ports.iter().find(|old| old.name == port.name);
	    if let Some(node_port) = old.and_then(|old| old.node_port) {
		port.node_port = Some(node_port);
	    }
	}
    }

    spec.selector = template.selector.clone();
    spec.ports = if ports.is_empty() && template.ports.is_none() { None } else { Some(ports) };

    copy.annotations_mut().insert(labels::TOPOLOGY_ANNOTATIONS_KEY.to_string(), grid.topology_annotation());
    copy.labels_mut().insert(labels::GRID_SELECTOR_NAME.to_string(), grid.name_any());
    copy
}

/*
 * A port the way the API server stores it: protocol and targetPort default
 * to TCP and the port itself.
 */
fn defaulted(port: &ServicePort) -> ServicePort {
    let mut port = port.clone();
    port.protocol.get_or_insert_with(|| String::from("TCP"));
    port.target_port.get_or_insert(IntOrString::Int(port.port));
    port
}

fn ports_differ(current: &[ServicePort], desired: &[ServicePort]) -> bool {
    if current.len() != desired.len() {
	return true;
    }

    current.iter().zip(desired.iter()).any(|(have, want)| {
	let mut have = defaulted(have);
	let want = defaulted(want);
	if want.node_port.is_none() {
	    // allocated by the server, kept across updates that leave it out
	    have.node_port = None;
	}
	have != want
    })
}

/*
 * Whether `desired` (keep_consistence of `current`) carries changes worth
 * an update. Ports must match exactly, up to what the API server defaults.
 */
pub fn needs_update(current: &KubeService, desired: &KubeService) -> bool {
    if current.metadata.labels != desired.metadata.labels || current.metadata.annotations != desired.metadata.annotations {
	return true;
    }

    let current_spec = current.spec.clone().unwrap_or_default();
    let desired_spec = desired.spec.clone().unwrap_or_default();
    if current_spec.selector != desired_spec.selector {
	return true;
    }

    ports_differ(&current_spec.ports.unwrap_or_default(), &desired_spec.ports.unwrap_or_default())
}

/*
 * Splits the owned children into what has to be created, updated and
 * deleted. Only the canonical <grid>-svc child survives.
 */
pub fn plan(grid: &ServiceGrid, owned: &[Arc<KubeService>]) -> SyncPlan {
    let mut plan = SyncPlan::default();
    let canonical = grid.service_name();
    let mut found = false;

    for svc in owned {
	if svc.name_any() != canonical {
	    plan.deletes.push(svc.as_ref().clone());
	    continue;
	}

	found = true;
	let desired = keep_consistence(grid, svc);
	if needs_update(svc, &desired) {
	    plan.updates.push(desired);
	}
    }

    if !found {
	plan.adds.push(new_service(grid));
    }
    plan
}

impl ServiceGridController {

    pub(crate) async fn sync_service_grid(&self, key: &str) -> Result<()> {
	let (namespace, name) = match split_key(key) {
	    Ok(names) => names,
	    Err(err) => {
		// not going to get any better by retrying
		log::error!("{}", err);
		return Ok(());
	    }
	};

	let grid = match self.grids.get(&ObjectRef::new(&name).within(&namespace)) {
	    Some(grid) => grid,
	    None => {
		log::debug!("ServiceGrid {} has been deleted", key);
		return Ok(());
	    }
	};

	if grid.spec.grid_uniq_key.is_empty() {
	    let note = format!("ServiceGrid {} has an empty spec.gridUniqKey, nothing will be derived from it", key);
	    log::warn!("{}", note);
	    self.recorder.publish(&grid.object_ref(&()), EventType::Warning, reasons::EMPTY_GRID_UNIQ_KEY, "Reconcile", note).await;
	    return Ok(());
	}

	let services: Vec<Arc<KubeService>> = self.services.state()
	    .into_iter()
	    .filter(|svc| svc.metadata.namespace.as_deref() == Some(namespace.as_str()))
	    .collect();

	let mgr = ServiceRefManager::new(self.api.as_ref(), &grid)?;
	let owned = mgr.claim_services(services).await?;

	if grid.is_being_deleted() {
	    // owned children are garbage collected through their owner references
	    return Ok(());
	}

	self.sync_children(&grid, &owned).await
    }

    async fn sync_children(&self, grid: &ServiceGrid, owned: &[Arc<KubeService>]) -> Result<()> {
	if owned.len() > 1 {
	    let names: Vec<String> = owned.iter().map(|svc| svc.name_any()).collect();
	    log::warn!("More than one Service is owned by ServiceGrid {}/{}: {:?}",
		       grid.namespace().unwrap_or_default(), grid.name_any(), names);
	}

	let plan = plan(grid, owned);
	if plan.is_empty() {
	    return Ok(());
	}
	log::debug!("ServiceGrid {}: {} adds, {} updates, {} deletes",
		    grid.name_any(), plan.adds.len(), plan.updates.len(), plan.deletes.len());

	let mut ops: Vec<BoxFuture<'_, Result<()>>> = Vec::new();
	for svc in plan.adds {
	    ops.push(async move {
		match self.api.create_service(&svc).await {
		    Err(err) if err.is_already_exists() => {
			let note = format!("Service {} already exists and is not controlled by ServiceGrid {}",
					   svc.name_any(), grid.name_any());
			log::warn!("{}", note);
			self.recorder.publish(&grid.object_ref(&()), EventType::Warning, reasons::SERVICE_NAME_CONFLICT, "Create", note).await;
			Err(err)
		    },
		    Err(err) => Err(err),
		    Ok(_) => Ok(()),
		}
	    }.boxed());
	}
	for svc in plan.updates {
	    ops.push(async move {
		self.api.update_service(&svc).await?;
		Ok(())
	    }.boxed());
	}
	for svc in plan.deletes {
	    ops.push(async move {
		let namespace = svc.namespace().unwrap_or_default();
		match self.api.delete_service(&namespace, &svc.name_any()).await {
		    Err(err) if !err.is_not_found() => Err(err),
		    _ => Ok(()),
		}
	    }.boxed());
	}

	futures::future::join_all(ops)
	    .await
	    .into_iter()
	    .filter_map(|result| result.err())
	    .collect::<MultiError>()
	    .into_result()
    }
}
