/*
 * FedServiceGridController projects the ServiceGrids of the federation
 * control namespace into their target namespaces, as long as at least one
 * node of the cluster carries the grid's unique key.
 */

mod sync;
pub use sync::member_from;

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
use grid_api::ServiceGrid;
use grid_api::labels;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node as KubeNode;
use kube::Api as KubeApi;
use kube::Client as KubeClient;
use kube::ResourceExt;
use kube::runtime::controller::Action as KubeAction;
use kube::runtime::controller::Config as KubeControllerConfig;
use kube::runtime::controller::Controller as KubeController;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::reflector::Store;
use kube::runtime::watcher::Config as KubeWatcherConfig;
use log;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use tokio_util::sync::CancellationToken;

pub const CONTROLLER_NAME: &str = "fed-service-grid-controller";

pub struct FedServiceGridController {
    api: Arc<dyn GridApi>,
    recorder: Arc<dyn EventRecorder>,
    fed_namespace: String,

    /* grids of the control namespace */
    federated: Store<ServiceGrid>,

    /* member grids, everywhere, recognised by their target namespace label */
    sources: Store<ServiceGrid>,

    nodes: Store<KubeNode>,
    retries: Retries,

    // node labels as last seen by the node watch
    node_labels: Mutex<HashMap<String, BTreeMap<String, String>>>,
}

impl FedServiceGridController {

    pub fn new(
	api: Arc<dyn GridApi>,
	recorder: Arc<dyn EventRecorder>,
	fed_namespace: &str,
	federated: Store<ServiceGrid>,
	sources: Store<ServiceGrid>,
	nodes: Store<KubeNode>,
	settings: &Settings,
    ) -> Self {
	Self{
	    api: api,
	    recorder: recorder,
	    fed_namespace: fed_namespace.to_string(),
	    federated: federated,
	    sources: sources,
	    nodes: nodes,
	    retries: Retries::new(settings.max_retries),
	    node_labels: Mutex::new(HashMap::new()),
	}
    }

    /*
     * Watches the federated grids of `fed_namespace`, their members and the
     * nodes, then reconciles federated grids until `stop` is cancelled.
     */
    pub async fn run(
	kube_client: KubeClient,
	api: Arc<dyn GridApi>,
	recorder: Arc<dyn EventRecorder>,
	fed_namespace: &str,
	settings: Settings,
	workers: u16,
	stop: CancellationToken,
    ) {
	log::info!("Starting {} on namespace {}", CONTROLLER_NAME, fed_namespace);

	let sources_config = KubeWatcherConfig::default().labels(labels::FED_TARGET_NAMESPACE);
	let sources = Informer::<ServiceGrid>::new(KubeApi::all(kube_client.clone()), sources_config);
	let nodes = Informer::<KubeNode>::new(KubeApi::all(kube_client.clone()), KubeWatcherConfig::default());
	let kube_controller = KubeController::new(KubeApi::<ServiceGrid>::namespaced(kube_client, fed_namespace), KubeWatcherConfig::default())
	    .with_config(KubeControllerConfig::default().concurrency(workers));

	let ctx = Arc::new(Self::new(api, recorder, fed_namespace, kube_controller.store(), sources.store(), nodes.store(), &settings));
	let caches = vec![informer::ready(&ctx.sources), informer::ready(&ctx.nodes)];
	let (sources_watch, source_events) = sources.spawn();
	let (nodes_watch, node_events) = nodes.spawn();

	if !informer::wait_for_cache_sync(&stop, settings.cache_sync_timeout, caches).await {
	    log::error!("{}: timed out waiting for caches to sync", CONTROLLER_NAME);
	    sources_watch.abort();
	    nodes_watch.abort();
	    return;
	}
	log::info!("{} started with {} workers", CONTROLLER_NAME, workers);

	let on_source = ctx.clone();
	let on_node = ctx.clone();
	kube_controller
	    .watches_stream(source_events, move |member| on_source.fed_grid_for_member(&member))
	    .watches_stream(node_events, move |node| on_node.grids_for_node(&node))
	    .graceful_shutdown_on(stop.cancelled_owned())
	    .run(reconcile, error_policy, ctx)
	    .for_each(|result| controller::log_reconciled(CONTROLLER_NAME, result))
	    .await;

	log::info!("Shutting down {}", CONTROLLER_NAME);
	sources_watch.abort();
	nodes_watch.abort();
    }

    fn node_labels(&self) -> MutexGuard<'_, HashMap<String, BTreeMap<String, String>>> {
	self.node_labels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /*
     * A member was touched out of band: resync the federated grid it was
     * projected from, so edits are reverted and deletes recreated.
     */
    pub fn fed_grid_for_member(&self, member: &ServiceGrid) -> Option<ObjectRef<ServiceGrid>> {
	if member.namespace().as_deref() == Some(self.fed_namespace.as_str()) {
	    return None;
	}
	if !labels::has_label(member.metadata.labels.as_ref(), labels::FED_TARGET_NAMESPACE) {
	    return None;
	}

	let fed_ref = ObjectRef::new(&member.name_any()).within(&self.fed_namespace);
	self.federated.get(&fed_ref).map(|fed| ObjectRef::from_obj(fed.as_ref()))
    }

    /*
     * Only node changes that may flip a grid's membership matter: a node
     * showing up or going away with the key, or the key being added or
     * removed. The node store tells whether the node still exists.
     */
    pub fn grids_for_node(&self, node: &KubeNode) -> Vec<ObjectRef<ServiceGrid>> {
	let name = node.name_any();
	let current = self.nodes.get(&ObjectRef::new(&name)).map(|node| node.labels().clone());
	let previous = match &current {
	    Some(labels) => self.node_labels().insert(name, labels.clone()),
	    None => self.node_labels().remove(&name),
	};

	if previous == current {
	    return vec![];
	}

	self.federated.state()
	    .iter()
	    .filter(|grid| {
		let key = grid.spec.grid_uniq_key.as_str();
		!key.is_empty() && labels::has_label(previous.as_ref(), key) != labels::has_label(current.as_ref(), key)
	    })
	    .map(|grid| ObjectRef::from_obj(grid.as_ref()))
	    .collect()
    }
}

pub async fn reconcile(fed: Arc<ServiceGrid>, ctx: Arc<FedServiceGridController>) -> Result<KubeAction> {
    let key = key_for(fed.namespace().as_deref(), &fed.name_any());

    ctx.sync_fed_service_grid(&key).await?;
    ctx.retries.forget(&key);
    Ok(KubeAction::requeue(RESYNC_PERIOD))
}

pub fn error_policy(fed: Arc<ServiceGrid>, err: &Error, ctx: Arc<FedServiceGridController>) -> KubeAction {
    let key = key_for(fed.namespace().as_deref(), &fed.name_any());
    ctx.retries.on_error(CONTROLLER_NAME, &key, err)
}
