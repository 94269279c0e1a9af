use futures::StreamExt;
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::stream::Stream;
use kube::Api as KubeApi;
use kube::Resource;
use kube::runtime::WatchStreamExt;
use kube::runtime::reflector as kube_reflector;
use kube::runtime::reflector::Store;
use kube::runtime::reflector::store::Writer;
use kube::runtime::watcher as kube_watcher;
use kube::runtime::watcher::Config as KubeWatcherConfig;
use log;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/*
 * Informer is the watch-backed object cache of one resource kind a
 * controller looks at besides its grids: a kube watcher feeding a reflector
 * store, running on its own task so the cache fills up before the controller
 * starts.
 */
pub struct Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    api: KubeApi<K>,
    config: KubeWatcherConfig,
    reader: Store<K>,
    writer: Writer<K>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default + Send + Sync,
{

    pub fn new(api: KubeApi<K>, config: KubeWatcherConfig) -> Self {
	let (reader, writer) = kube_reflector::store();

	Self{
	    api: api,
	    config: config,
	    reader: reader,
	    writer: writer,
	}
    }

    pub fn store(&self) -> Store<K> {
	self.reader.clone()
    }

    /*
     * Starts the watch. The returned stream yields every object the watch
     * touched, deleted ones included, once the store reflects it. Watch
     * errors are retried with the default backoff.
     */
    pub fn spawn(self) -> (JoinHandle<()>, impl Stream<Item = Result<K, kube_watcher::Error>> + Send + 'static) {
	let (tx, rx) = mpsc::unbounded();
	let kind = K::kind(&K::DynamicType::default()).to_string();

	let watch = kube_reflector::reflector(self.writer, kube_watcher(self.api, self.config))
	    .touched_objects()
	    .default_backoff()
	    .for_each(move |touched| {
		match touched {
		    Ok(obj) => {
			if tx.unbounded_send(obj).is_err() {
			    log::debug!("{} watch outlived its controller", kind);
			}
		    },
		    Err(err) => {
			log::warn!("Watch on {} failed, retrying: {}", kind, err);
		    },
		}

		futures::future::ready(())
	    });

	(tokio::spawn(watch), rx.map(Ok))
    }
}

/* resolves to true once the store saw its first full list */
pub fn ready<K>(store: &Store<K>) -> BoxFuture<'static, bool>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Send + Sync,
{
    let store = store.clone();
    Box::pin(async move { store.wait_until_ready().await.is_ok() })
}

/*
 * Waits for every cache to fill. Returns false when stopped, when the
 * timeout elapses first, or when a watch went away before listing.
 */
pub async fn wait_for_cache_sync(stop: &CancellationToken, timeout: Duration, caches: Vec<BoxFuture<'static, bool>>) -> bool {
    let synced = tokio::time::timeout(timeout, futures::future::join_all(caches));

    tokio::select! {
	biased;

	_ = stop.cancelled() => false,
	synced = synced => match synced {
	    Ok(ready) => ready.into_iter().all(|ok| ok),
	    Err(_) => false,
	},
    }
}
