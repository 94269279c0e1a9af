use crate::errors::Error;
use crate::errors::Result;

use grid_api::servicegrid::ServiceGrid;
use kube::runtime::controller::Action as KubeAction;
use kube::runtime::controller::Error as KubeControllerError;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher as kube_watcher;
use kube::runtime::watcher::DefaultBackoff;
use log;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

/* how many times a failing key is requeued before it is dropped */
pub const DEFAULT_MAX_RETRIES: u32 = 15;

/*
 * Converged grids are looked at again after this long, which also catches
 * deletes a watch missed while it was re-listing.
 */
pub const RESYNC_PERIOD: Duration = Duration::from_secs(300);

/*
 * Knobs shared by both grid controllers.
 */
#[derive(Debug, Clone)]
pub struct Settings {
    pub max_retries: u32,
    pub cache_sync_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
	Self{
	    max_retries: DEFAULT_MAX_RETRIES,
	    cache_sync_timeout: Duration::from_secs(300),
	}
    }
}

pub type ReconcileResult = std::result::Result<(ObjectRef<ServiceGrid>, KubeAction), KubeControllerError<Error, kube_watcher::Error>>;

pub fn key_for(namespace: Option<&str>, name: &str) -> String {
    match namespace {
	Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
	_ => name.to_string(),
    }
}

pub fn split_key(key: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
	[name] if !name.is_empty() => Ok((String::new(), name.to_string())),
	[ns, name] if !name.is_empty() => Ok((ns.to_string(), name.to_string())),
	_ => Err(Error::InvalidKey(key.to_string())),
    }
}

struct Failures {
    count: u32,
    backoff: DefaultBackoff,
}

/*
 * Retries tracks the failures of every key between two successful
 * reconciles, each key with its own exponential backoff.
 */
pub struct Retries {
    max_retries: u32,
    failures: Mutex<HashMap<String, Failures>>,
}

impl Retries {

    pub fn new(max_retries: u32) -> Self {
	Self{
	    max_retries: max_retries,
	    failures: Mutex::new(HashMap::new()),
	}
    }

    fn failures(&self) -> MutexGuard<'_, HashMap<String, Failures>> {
	self.failures.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
	self.failures().get(key).map(|failures| failures.count).unwrap_or(0)
    }

    pub fn forget(&self, key: &str) {
	self.failures().remove(key);
    }

    /*
     * What to do with `key` after its reconcile failed: come back after the
     * next backoff step, or leave it alone until it changes again once it
     * has been requeued max_retries times.
     */
    pub fn on_error(&self, controller: &str, key: &str, err: &Error) -> KubeAction {
	let mut failures = self.failures();
	let entry = failures.entry(key.to_string()).or_insert_with(|| Failures{
	    count: 0,
	    backoff: DefaultBackoff::default(),
	});

	if entry.count < self.max_retries {
	    if let Some(delay) = entry.backoff.next() {
		entry.count += 1;
		log::warn!("{}: error syncing {}, requeueing in {:?}: {}", controller, key, delay, err);
		return KubeAction::requeue(delay);
	    }
	}

	failures.remove(key);
	log::error!("{}: dropping {} after {} retries: {}", controller, key, self.max_retries, err);
	KubeAction::await_change()
    }
}

/*
 * Logs what the controller stream yields. Reconcile failures were already
 * reported by the error policy.
 */
pub fn log_reconciled(controller: &'static str, result: ReconcileResult) -> futures::future::Ready<()> {
    match result {
	Ok((grid, _)) => log::debug!("{}: reconciled {}", controller, grid),
	Err(KubeControllerError::ReconcilerFailed(_, grid)) => log::debug!("{}: reconcile of {} failed", controller, grid),
	Err(err) => log::warn!("{}: {}", controller, err),
    }
    futures::future::ready(())
}
