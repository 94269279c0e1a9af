use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client as KubeClient;
use kube::runtime::events::Event as KubeEvent;
use kube::runtime::events::EventType;
use kube::runtime::events::Recorder as KubeRecorder;
use kube::runtime::events::Reporter as KubeReporter;
use log;

pub mod reasons {
    /* spec.gridUniqKey is empty, nothing is derived until the grid is fixed */
    pub const EMPTY_GRID_UNIQ_KEY: &str = "EmptyGridUniqKey";

    /* a federated grid does not say which namespace it belongs to */
    pub const MISSING_TARGET_NAMESPACE: &str = "MissingTargetNamespace";

    /* the grid's Service name is taken by a Service the grid does not own */
    pub const SERVICE_NAME_CONFLICT: &str = "ServiceNameConflict";
}

/*
 * Sink for user facing Kubernetes Events. Publishing is fire-and-forget: a
 * failing event never fails a reconcile.
 */
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(&self, object: &ObjectReference, type_: EventType, reason: &str, action: &str, note: String);
}

pub struct KubeEventRecorder {
    recorder: KubeRecorder,
}

impl KubeEventRecorder {

    pub fn new(kube_client: KubeClient, controller: &str) -> Self {
	let reporter = KubeReporter{
	    controller: controller.to_string(),
	    instance: None,
	};

	Self{
	    recorder: KubeRecorder::new(kube_client, reporter),
	}
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {

    async fn publish(&self, object: &ObjectReference, type_: EventType, reason: &str, action: &str, note: String) {
	let event = KubeEvent{
	    type_: type_,
	    reason: reason.to_string(),
	    note: Some(note),
	    action: action.to_string(),
	    secondary: None,
	};

	if let Err(err) = self.recorder.publish(&event, object).await {
	    log::warn!("Unable to publish {} event on {:?}: {}", reason, object.name, err);
	}
    }
}
