/*
 * ServiceGridController keeps exactly one Service, <grid>-svc, next to every
 * ServiceGrid, with the grid's template as its spec.
 */

mod sync;
pub use sync::keep_consistence;
pub use sync::new_service;

use crate::client::GridApi;
use crate::controller;
use crate::controller::RESYNC_PERIOD;
use crate::controller::Retries;
use crate::controller::Settings;
use crate::controller::key_for;
use crate::errors::Error;
use crate::errors::Result;
use crate::events::EventRecorder;
use crate::informer;
use crate::informer::Informer;
use crate::refmanager::controller_ref;
use grid_api::ServiceGrid;
use grid_api::labels;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace as KubeNamespace;
use k8s_openapi::api::core::v1::Service as KubeService;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Api as KubeApi;
use kube::Client as KubeClient;
use kube::Resource;
use kube::ResourceExt;
use kube::runtime::controller::Action as KubeAction;
use kube::runtime::controller::Config as KubeControllerConfig;
use kube::runtime::controller::Controller as KubeController;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::reflector::Store;
use kube::runtime::watcher::Config as KubeWatcherConfig;
use log;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use tokio_util::sync::CancellationToken;

pub const CONTROLLER_NAME: &str = "service-grid-controller";

/*
 * Everything a reconcile of a ServiceGrid gets to see, shared by all
 * concurrent reconciles.
 */
pub struct ServiceGridController {
    api: Arc<dyn GridApi>,
    recorder: Arc<dyn EventRecorder>,
    grids: Store<ServiceGrid>,
    services: Store<KubeService>,
    retries: Retries,

    // last controller reference seen on each Service, by namespace/name
    owners: Mutex<HashMap<String, OwnerReference>>,
}

impl ServiceGridController {

    pub fn new(
	api: Arc<dyn GridApi>,
	recorder: Arc<dyn EventRecorder>,
	grids: Store<ServiceGrid>,
	services: Store<KubeService>,
	settings: &Settings,
    ) -> Self {
	Self{
	    api: api,
	    recorder: recorder,
	    grids: grids,
	    services: services,
	    retries: Retries::new(settings.max_retries),
	    owners: Mutex::new(HashMap::new()),
	}
    }

    /*
     * Watches ServiceGrids, Services and Namespaces in all namespaces and
     * reconciles grids with up to `workers` reconciles in flight. Returns once
     * `stop` is cancelled and the running reconciles finished, or right away
     * when the caches did not fill up in time.
     */
    pub async fn run(
	kube_client: KubeClient,
	api: Arc<dyn GridApi>,
	recorder: Arc<dyn EventRecorder>,
	settings: Settings,
	workers: u16,
	stop: CancellationToken,
    ) {
	log::info!("Starting {}", CONTROLLER_NAME);

	let services = Informer::<KubeService>::new(KubeApi::all(kube_client.clone()), KubeWatcherConfig::default());
	let namespaces = Informer::<KubeNamespace>::new(KubeApi::all(kube_client.clone()), KubeWatcherConfig::default());
	let kube_controller = KubeController::new(KubeApi::<ServiceGrid>::all(kube_client), KubeWatcherConfig::default())
	    .with_config(KubeControllerConfig::default().concurrency(workers));

	let ctx = Arc::new(Self::new(api, recorder, kube_controller.store(), services.store(), &settings));
	let caches = vec![informer::ready(&ctx.services), informer::ready(&namespaces.store())];
	let (services_watch, service_events) = services.spawn();
	let (namespaces_watch, namespace_events) = namespaces.spawn();

	if !informer::wait_for_cache_sync(&stop, settings.cache_sync_timeout, caches).await {
	    log::error!("{}: timed out waiting for caches to sync", CONTROLLER_NAME);
	    services_watch.abort();
	    namespaces_watch.abort();
	    return;
	}
	log::info!("{} started with {} workers", CONTROLLER_NAME, workers);

	let on_service = ctx.clone();
	let on_namespace = ctx.clone();
	kube_controller
	    .watches_stream(service_events, move |svc| on_service.grids_for_service(&svc))
	    .watches_stream(namespace_events, move |ns| on_namespace.grids_in_namespace(&ns))
	    .graceful_shutdown_on(stop.cancelled_owned())
	    .run(reconcile, error_policy, ctx)
	    .for_each(|result| controller::log_reconciled(CONTROLLER_NAME, result))
	    .await;

	log::info!("Shutting down {}", CONTROLLER_NAME);
	services_watch.abort();
	namespaces_watch.abort();
    }

    fn owners(&self) -> MutexGuard<'_, HashMap<String, OwnerReference>> {
	self.owners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /*
     * The grids to look at after `svc` changed: its controller, the grid
     * that controlled it before, or for an orphan every grid whose selector
     * matches it, as one of them may want to adopt it.
     */
    pub fn grids_for_service(&self, svc: &KubeService) -> Vec<ObjectRef<ServiceGrid>> {
	let key = key_for(svc.namespace().as_deref(), &svc.name_any());
	let gone = svc.metadata.deletion_timestamp.is_some() || self.services.get(&ObjectRef::from_obj(svc)).is_none();
	let owner = controller_ref(svc).cloned();

	let previous = match (&owner, gone) {
	    (Some(owner), false) => self.owners().insert(key, owner.clone()),
	    _ => self.owners().remove(&key),
	};

	let mut grids = Vec::new();
	if let Some(previous) = previous {
	    if owner.as_ref().map(|o| &o.uid) != Some(&previous.uid) {
		grids.extend(self.resolve_controller_ref(svc, &previous));
	    }
	}

	match owner {
	    Some(owner) => grids.extend(self.resolve_controller_ref(svc, &owner)),
	    // nobody cares about orphans going away
	    None if gone => {},
	    None => grids.extend(self.matching_grids(svc)),
	}

	grids.iter().map(|grid| ObjectRef::from_obj(grid.as_ref())).collect()
    }

    /*
     * Federated grids need another look once their namespace is marked as
     * a federation cluster.
     */
    pub fn grids_in_namespace(&self, ns: &KubeNamespace) -> Vec<ObjectRef<ServiceGrid>> {
	if !labels::has_label(ns.metadata.labels.as_ref(), labels::FED_CLUSTER_KEY) {
	    return vec![];
	}

	let name = ns.name_any();
	log::debug!("Federated namespace {} showed up, resyncing its grids", name);
	self.grids.state()
	    .iter()
	    .filter(|grid| grid.namespace().as_deref() == Some(name.as_str()) && grid.is_federated())
	    .map(|grid| ObjectRef::from_obj(grid.as_ref()))
	    .collect()
    }

    /*
     * The grid a controller reference points to, provided it is still the
     * same object (same uid) as the one that created the reference.
     */
    fn resolve_controller_ref(&self, svc: &KubeService, owner: &OwnerReference) -> Option<Arc<ServiceGrid>> {
	if owner.kind != ServiceGrid::kind(&()) {
	    return None;
	}

	let namespace = svc.namespace().unwrap_or_default();
	let grid = self.grids.get(&ObjectRef::new(&owner.name).within(&namespace))?;
	if grid.metadata.uid.as_deref() != Some(owner.uid.as_str()) {
	    return None;
	}
	Some(grid)
    }

    fn matching_grids(&self, svc: &KubeService) -> Vec<Arc<ServiceGrid>> {
	let namespace = svc.namespace();
	let grids: Vec<Arc<ServiceGrid>> = self.grids.state()
	    .into_iter()
	    .filter(|grid| grid.namespace() == namespace)
	    .filter(|grid| labels::selector_matches(&grid.child_selector(), svc.metadata.labels.as_ref()))
	    .collect();

	if grids.len() > 1 {
	    let names: Vec<String> = grids.iter().map(|grid| grid.name_any()).collect();
	    log::warn!("user error! more than one ServiceGrid is selecting Service {}/{}: {:?}",
		       namespace.unwrap_or_default(), svc.name_any(), names);
	}
	grids
    }
}

pub async fn reconcile(grid: Arc<ServiceGrid>, ctx: Arc<ServiceGridController>) -> Result<KubeAction> {
    let key = key_for(grid.namespace().as_deref(), &grid.name_any());

    ctx.sync_service_grid(&key).await?;
    ctx.retries.forget(&key);
    Ok(KubeAction::requeue(RESYNC_PERIOD))
}

pub fn error_policy(grid: Arc<ServiceGrid>, err: &Error, ctx: Arc<ServiceGridController>) -> KubeAction {
    let key = key_for(grid.namespace().as_deref(), &grid.name_any());
    ctx.retries.on_error(CONTROLLER_NAME, &key, err)
}
