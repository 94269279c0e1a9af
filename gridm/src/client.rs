use crate::errors::Result;
use grid_api::ServiceGrid;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service as KubeService;
use kube::Api as KubeApi;
use kube::Client as KubeClient;
use kube::ResourceExt;
use kube::api::DeleteParams as KubeDeleteParams;
use kube::api::Patch as KubePatch;
use kube::api::PatchParams as KubePatchParams;
use kube::api::PostParams as KubePostParams;
use log;
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

/*
 * GridApi is everything the controllers write to (or read live from) the
 * API server. Reads on the hot path go through the informer stores instead.
 *
 * Conflicting writes surface as plain errors: the API server resolves them
 * with resource versions and the controller retries the whole grid.
 */
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GridApi: Send + Sync {

    /* live read, bypassing the cache */
    async fn get_grid(&self, namespace: &str, name: &str) -> Result<Option<ServiceGrid>>;

    async fn create_grid(&self, grid: &ServiceGrid) -> Result<ServiceGrid>;

    async fn update_grid(&self, grid: &ServiceGrid) -> Result<ServiceGrid>;

    async fn delete_grid(&self, namespace: &str, name: &str) -> Result<()>;

    /* JSON merge-patch */
    async fn patch_grid(&self, namespace: &str, name: &str, patch: &Value) -> Result<ServiceGrid>;

    async fn create_service(&self, svc: &KubeService) -> Result<KubeService>;

    async fn update_service(&self, svc: &KubeService) -> Result<KubeService>;

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;

    /* JSON merge-patch */
    async fn patch_service(&self, namespace: &str, name: &str, patch: &Value) -> Result<KubeService>;
}

#[derive(Clone)]
pub struct KubeGridApi {
    kube_client: KubeClient,
}

impl KubeGridApi {

    pub fn new(kube_client: KubeClient) -> Self {
	Self{
	    kube_client: kube_client,
	}
    }

    fn grids(&self, namespace: &str) -> KubeApi<ServiceGrid> {
	KubeApi::namespaced(self.kube_client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> KubeApi<KubeService> {
	KubeApi::namespaced(self.kube_client.clone(), namespace)
    }
}

#[async_trait]
impl GridApi for KubeGridApi {

    async fn get_grid(&self, namespace: &str, name: &str) -> Result<Option<ServiceGrid>> {
	Ok(self.grids(namespace).get_opt(name).await?)
    }

    async fn create_grid(&self, grid: &ServiceGrid) -> Result<ServiceGrid> {
	let namespace = grid.namespace().unwrap_or_default();
	log::info!("Creating ServiceGrid {}/{}", namespace, grid.name_any());

	let opts = KubePostParams::default();
	Ok(self.grids(&namespace).create(&opts, grid).await?)
    }

    async fn update_grid(&self, grid: &ServiceGrid) -> Result<ServiceGrid> {
	let namespace = grid.namespace().unwrap_or_default();
	let name = grid.name_any();
	log::info!("Updating ServiceGrid {}/{}", namespace, name);

	let opts = KubePostParams::default();
	Ok(self.grids(&namespace).replace(&name, &opts, grid).await?)
    }

    async fn delete_grid(&self, namespace: &str, name: &str) -> Result<()> {
	log::info!("Deleting ServiceGrid {}/{}", namespace, name);

	self.grids(namespace).delete(name, &KubeDeleteParams::default()).await?;
	Ok(())
    }

    async fn patch_grid(&self, namespace: &str, name: &str, patch: &Value) -> Result<ServiceGrid> {
	log::debug!("Patching ServiceGrid {}/{} with {}", namespace, name, patch);

	let opts = KubePatchParams::default();
	Ok(self.grids(namespace).patch(name, &opts, &KubePatch::Merge(patch)).await?)
    }

    async fn create_service(&self, svc: &KubeService) -> Result<KubeService> {
	let namespace = svc.namespace().unwrap_or_default();
	log::info!("Creating Service {}/{}", namespace, svc.name_any());

	let opts = KubePostParams::default();
	Ok(self.services(&namespace).create(&opts, svc).await?)
    }

    async fn update_service(&self, svc: &KubeService) -> Result<KubeService> {
	let namespace = svc.namespace().unwrap_or_default();
	let name = svc.name_any();
	log::info!("Updating Service {}/{}", namespace, name);

	let opts = KubePostParams::default();
	Ok(self.services(&namespace).replace(&name, &opts, svc).await?)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
	log::info!("Deleting Service {}/{}", namespace, name);

	self.services(namespace).delete(name, &KubeDeleteParams::default()).await?;
	Ok(())
    }

    async fn patch_service(&self, namespace: &str, name: &str, patch: &Value) -> Result<KubeService> {
	log::debug!("Patching Service {}/{} with {}", namespace, name, patch);

	let opts = KubePatchParams::default();
	Ok(self.services(namespace).patch(name, &opts, &KubePatch::Merge(patch)).await?)
    }
}
