/*
 * In-memory stand-ins for the API server and the event sink. The fake writes
 * through to reflector stores, the same stores the controllers read from, so
 * a reconcile sees its own writes on the next pass like it would once the
 * watch caught up.
 */

use crate::client::GridApi;
use crate::errors::Error;
use crate::errors::Result;
use crate::errors::api_error;
use crate::events::EventRecorder;
use grid_api::ServiceGrid;
use grid_api::ServiceGridSpec;
use grid_api::labels;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node as KubeNode;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::api::core::v1::Service as KubeService;
use k8s_openapi::api::core::v1::ServicePort;
use k8s_openapi::api::core::v1::ServiceSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use kube::api::ObjectMeta;
use kube::runtime::events::EventType;
use kube::runtime::reflector as kube_reflector;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::reflector::Store;
use kube::runtime::reflector::store::Writer;
use kube::runtime::watcher::Event as KubeEvent;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

pub fn now() -> Time {
    Time(k8s_openapi::chrono::Utc::now())
}

pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

pub fn echo_template() -> ServiceSpec {
    ServiceSpec{
	selector: Some(labels(&[("app", "echo")])),
	ports: Some(vec![ServicePort{
	    name: Some(String::from("http")),
	    port: 80,
	    ..Default::default()
	}]),
	..Default::default()
    }
}

pub fn echo_grid() -> ServiceGrid {
    grid_api::servicegrid::new("echo", "default", ServiceGridSpec{
	grid_uniq_key: String::from("zone"),
	template: echo_template(),
    })
}

/* a federated grid in `fed_ns` projected into `target` */
pub fn fed_grid(fed_ns: &str, target: &str) -> ServiceGrid {
    let mut grid = grid_api::servicegrid::new("echo", fed_ns, ServiceGridSpec{
	grid_uniq_key: String::from("zone"),
	template: echo_template(),
    });
    grid.metadata.labels = Some(labels(&[
	(labels::FED_TARGET_NAMESPACE, target),
	(labels::FEDRATION_KEY, labels::FEDRATION_VALUE),
	(labels::FEDRATION_DIS_KEY, "yes"),
    ]));
    grid
}

pub fn with_uid(mut grid: ServiceGrid, uid: &str) -> ServiceGrid {
    grid.metadata.uid = Some(uid.to_string());
    grid
}

/* a Service, labeled as a child of `grid` when given */
pub fn service(name: &str, namespace: &str, grid: Option<&str>) -> KubeService {
    KubeService{
	metadata: ObjectMeta{
	    name: Some(name.to_string()),
	    namespace: Some(namespace.to_string()),
	    labels: grid.map(|grid| labels(&[(labels::GRID_SELECTOR_NAME, grid)])),
	    ..Default::default()
	},
	spec: Some(echo_template()),
	..Default::default()
    }
}

pub fn controller_of(name: &str, uid: &str) -> OwnerReference {
    OwnerReference{
	api_version: String::from("superedge.io/v1"),
	kind: String::from("ServiceGrid"),
	name: name.to_string(),
	uid: uid.to_string(),
	controller: Some(true),
	..Default::default()
    }
}

pub fn node(name: &str, pairs: &[(&str, &str)]) -> KubeNode {
    KubeNode{
	metadata: ObjectMeta{
	    name: Some(name.to_string()),
	    labels: Some(labels(pairs)),
	    ..Default::default()
	},
	..Default::default()
    }
}

fn key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

fn obj_ref<K>(namespace: &str, name: &str) -> ObjectRef<K>
where
    K: Resource<DynamicType = ()>,
{
    ObjectRef::new(name).within(namespace)
}

/*
 * FakeCluster implements GridApi on top of reflector stores. It assigns uids
 * and resource versions, enforces resource version and uid preconditions,
 * honours finalizers on ServiceGrid deletion and records every write as
 * "<verb> <kind> <namespace>/<name>".
 */
pub struct FakeCluster {
    grids: Store<ServiceGrid>,
    grid_writer: Mutex<Writer<ServiceGrid>>,
    services: Store<KubeService>,
    service_writer: Mutex<Writer<KubeService>>,
    nodes: Store<KubeNode>,
    node_writer: Mutex<Writer<KubeNode>>,

    writes: Mutex<Vec<String>>,
    failures: Mutex<HashSet<String>>,
    counter: AtomicU64,
}

impl FakeCluster {

    pub fn new() -> Self {
	let (grids, grid_writer) = kube_reflector::store();
	let (services, service_writer) = kube_reflector::store();
	let (nodes, node_writer) = kube_reflector::store();

	Self{
	    grids: grids,
	    grid_writer: Mutex::new(grid_writer),
	    services: services,
	    service_writer: Mutex::new(service_writer),
	    nodes: nodes,
	    node_writer: Mutex::new(node_writer),
	    writes: Mutex::new(Vec::new()),
	    failures: Mutex::new(HashSet::new()),
	    counter: AtomicU64::new(1),
	}
    }

    pub fn grid_store(&self) -> Store<ServiceGrid> {
	self.grids.clone()
    }

    pub fn service_store(&self) -> Store<KubeService> {
	self.services.clone()
    }

    pub fn node_store(&self) -> Store<KubeNode> {
	self.nodes.clone()
    }

    fn next(&self) -> u64 {
	self.counter.fetch_add(1, Ordering::SeqCst)
    }

    fn stamp<K: Resource>(&self, obj: &mut K) {
	let n = self.next();
	let meta = obj.meta_mut();
	if meta.uid.is_none() {
	    meta.uid = Some(format!("uid-{}", n));
	}
	meta.resource_version = Some(n.to_string());
    }

    fn record(&self, write: String) -> Result<()> {
	if self.failures.lock().unwrap().remove(&write) {
	    return Err(api_error(500, "InternalError"));
	}
	self.writes.lock().unwrap().push(write);
	Ok(())
    }

    /* the next write matching e.g. "create service default/echo-svc" fails */
    pub fn fail_next(&self, write: &str) {
	self.failures.lock().unwrap().insert(write.to_string());
    }

    pub fn writes(&self) -> Vec<String> {
	self.writes.lock().unwrap().clone()
    }

    pub fn clear_writes(&self) {
	self.writes.lock().unwrap().clear();
    }

    fn put_grid(&self, grid: ServiceGrid) {
	self.grid_writer.lock().unwrap().apply_watcher_event(&KubeEvent::Apply(grid));
    }

    fn put_service(&self, svc: KubeService) {
	self.service_writer.lock().unwrap().apply_watcher_event(&KubeEvent::Apply(svc));
    }

    /* seeds a grid without recording a write */
    pub fn add_grid(&self, mut grid: ServiceGrid) -> ServiceGrid {
	self.stamp(&mut grid);
	self.put_grid(grid.clone());
	grid
    }

    pub fn remove_grid(&self, namespace: &str, name: &str) {
	if let Some(grid) = self.grid(namespace, name) {
	    self.grid_writer.lock().unwrap().apply_watcher_event(&KubeEvent::Delete(grid));
	}
    }

    pub fn add_service(&self, mut svc: KubeService) -> KubeService {
	self.stamp(&mut svc);
	self.put_service(svc.clone());
	svc
    }

    pub fn remove_service(&self, namespace: &str, name: &str) {
	if let Some(svc) = self.service(namespace, name) {
	    self.service_writer.lock().unwrap().apply_watcher_event(&KubeEvent::Delete(svc));
	}
    }

    pub fn add_node(&self, node: KubeNode) -> KubeNode {
	let mut node = node;
	self.stamp(&mut node);
	self.node_writer.lock().unwrap().apply_watcher_event(&KubeEvent::Apply(node.clone()));
	node
    }

    pub fn remove_node(&self, name: &str) {
	if let Some(node) = self.nodes.get(&ObjectRef::new(name)) {
	    self.node_writer.lock().unwrap().apply_watcher_event(&KubeEvent::Delete(node.as_ref().clone()));
	}
    }

    pub fn grid(&self, namespace: &str, name: &str) -> Option<ServiceGrid> {
	self.grids.get(&obj_ref(namespace, name)).map(|grid| grid.as_ref().clone())
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<KubeService> {
	self.services.get(&obj_ref(namespace, name)).map(|svc| svc.as_ref().clone())
    }

    pub fn services_in(&self, namespace: &str) -> Vec<KubeService> {
	self.services.state()
	    .iter()
	    .filter(|svc| svc.metadata.namespace.as_deref() == Some(namespace))
	    .map(|svc| svc.as_ref().clone())
	    .collect()
    }
}

fn not_found() -> Error {
    api_error(404, "NotFound")
}

fn check_version<K: Resource>(current: &K, wanted: &K) -> Result<()> {
    match &wanted.meta().resource_version {
	Some(rv) if Some(rv) != current.meta().resource_version.as_ref() => Err(api_error(409, "Conflict")),
	_ => Ok(()),
    }
}

/* applies a JSON merge-patch, honouring a metadata.uid precondition */
fn merge<K: Resource + Serialize + DeserializeOwned>(current: &K, patch: &Value) -> Result<K> {
    if let Some(uid) = patch.pointer("/metadata/uid") {
	if Some(uid) != current.meta().uid.as_ref().map(|uid| Value::from(uid.as_str())).as_ref() {
	    return Err(api_error(409, "Conflict"));
	}
    }

    let mut doc = serde_json::to_value(current)?;
    json_patch::merge(&mut doc, patch);
    Ok(serde_json::from_value(doc)?)
}

#[async_trait]
impl GridApi for FakeCluster {

    async fn get_grid(&self, namespace: &str, name: &str) -> Result<Option<ServiceGrid>> {
	Ok(self.grid(namespace, name))
    }

    async fn create_grid(&self, grid: &ServiceGrid) -> Result<ServiceGrid> {
	let namespace = grid.metadata.namespace.clone().unwrap_or_default();
	let name = grid.metadata.name.clone().unwrap_or_default();
	if self.grid(&namespace, &name).is_some() {
	    return Err(api_error(409, "AlreadyExists"));
	}
	self.record(format!("create grid {}", key(&namespace, &name)))?;

	let mut created = grid.clone();
	created.metadata.uid = None;
	self.stamp(&mut created);
	self.put_grid(created.clone());
	Ok(created)
    }

    async fn update_grid(&self, grid: &ServiceGrid) -> Result<ServiceGrid> {
	let namespace = grid.metadata.namespace.clone().unwrap_or_default();
	let name = grid.metadata.name.clone().unwrap_or_default();
	let current = self.grid(&namespace, &name).ok_or_else(not_found)?;
	check_version(&current, grid)?;
	self.record(format!("update grid {}", key(&namespace, &name)))?;

	let mut updated = grid.clone();
	self.stamp(&mut updated);
	self.put_grid(updated.clone());
	Ok(updated)
    }

    async fn delete_grid(&self, namespace: &str, name: &str) -> Result<()> {
	let current = self.grid(namespace, name).ok_or_else(not_found)?;
	self.record(format!("delete grid {}", key(namespace, name)))?;

	if current.metadata.finalizers.as_ref().map_or(true, |f| f.is_empty()) {
	    self.grid_writer.lock().unwrap().apply_watcher_event(&KubeEvent::Delete(current));
	} else if current.metadata.deletion_timestamp.is_none() {
	    let mut deleting = current;
	    deleting.metadata.deletion_timestamp = Some(now());
	    self.stamp(&mut deleting);
	    self.put_grid(deleting);
	}
	Ok(())
    }

    async fn patch_grid(&self, namespace: &str, name: &str, patch: &Value) -> Result<ServiceGrid> {
	let current = self.grid(namespace, name).ok_or_else(not_found)?;
	let mut patched = merge(&current, patch)?;
	self.record(format!("patch grid {}", key(namespace, name)))?;

	self.stamp(&mut patched);
	let finalized = patched.metadata.finalizers.as_ref().map_or(true, |f| f.is_empty());
	if patched.metadata.deletion_timestamp.is_some() && finalized {
	    self.grid_writer.lock().unwrap().apply_watcher_event(&KubeEvent::Delete(patched.clone()));
	} else {
	    self.put_grid(patched.clone());
	}
	Ok(patched)
    }

    async fn create_service(&self, svc: &KubeService) -> Result<KubeService> {
	let namespace = svc.metadata.namespace.clone().unwrap_or_default();
	let name = svc.metadata.name.clone().unwrap_or_default();
	if self.service(&namespace, &name).is_some() {
	    return Err(api_error(409, "AlreadyExists"));
	}
	self.record(format!("create service {}", key(&namespace, &name)))?;

	let mut created = svc.clone();
	self.stamp(&mut created);
	self.put_service(created.clone());
	Ok(created)
    }

    async fn update_service(&self, svc: &KubeService) -> Result<KubeService> {
	let namespace = svc.metadata.namespace.clone().unwrap_or_default();
	let name = svc.metadata.name.clone().unwrap_or_default();
	let current = self.service(&namespace, &name).ok_or_else(not_found)?;
	check_version(&current, svc)?;
	self.record(format!("update service {}", key(&namespace, &name)))?;

	let mut updated = svc.clone();
	self.stamp(&mut updated);
	self.put_service(updated.clone());
	Ok(updated)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
	let current = self.service(namespace, name).ok_or_else(not_found)?;
	self.record(format!("delete service {}", key(namespace, name)))?;

	self.service_writer.lock().unwrap().apply_watcher_event(&KubeEvent::Delete(current));
	Ok(())
    }

    async fn patch_service(&self, namespace: &str, name: &str, patch: &Value) -> Result<KubeService> {
	let current = self.service(namespace, name).ok_or_else(not_found)?;
	let mut patched = merge(&current, patch)?;
	self.record(format!("patch service {}", key(namespace, name)))?;

	self.stamp(&mut patched);
	self.put_service(patched.clone());
	Ok(patched)
    }
}

/*
 * Keeps (type, reason, object name) of every published event.
 */
#[derive(Default)]
pub struct RecordedEvents {
    events: Mutex<Vec<(EventType, String, String)>>,
}

impl RecordedEvents {

    pub fn reasons(&self) -> Vec<String> {
	self.events.lock().unwrap().iter().map(|(_, reason, _)| reason.clone()).collect()
    }

    pub fn warnings(&self) -> usize {
	self.events.lock().unwrap().iter().filter(|(type_, _, _)| *type_ == EventType::Warning).count()
    }
}

#[async_trait]
impl EventRecorder for RecordedEvents {

    async fn publish(&self, object: &ObjectReference, type_: EventType, reason: &str, _action: &str, _note: String) {
	let name = object.name.clone().unwrap_or_default();
	self.events.lock().unwrap().push((type_, reason.to_string(), name));
    }
}
