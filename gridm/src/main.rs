use gridm::client::GridApi;
use gridm::client::KubeGridApi;
use gridm::config::Config;
use gridm::events::EventRecorder;
use gridm::events::KubeEventRecorder;
use gridm::fedservicegrid::FedServiceGridController;
use gridm::servicegrid::ServiceGridController;

use clap::Parser;
use kube::Client as KubeClient;
use log;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const REPORTER: &str = "application-grid-controller";

async fn run_federation(
    kube_client: KubeClient,
    api: Arc<dyn GridApi>,
    recorder: Arc<dyn EventRecorder>,
    config: &Config,
    stop: CancellationToken,
) {
    if config.disable_federation {
	log::info!("Federation is disabled");
	return;
    }

    FedServiceGridController::run(kube_client, api, recorder, &config.fed_namespace, config.settings(), config.fed_workers, stop).await;
}

#[tokio::main]
async fn main() -> Result<(), kube::Error> {
    env_logger::init();

    let config = Config::parse();
    let kube_client = KubeClient::try_default().await?;

    log::info!("starting gridm, federation namespace {}", config.fed_namespace);
    let api: Arc<dyn GridApi> = Arc::new(KubeGridApi::new(kube_client.clone()));
    let recorder: Arc<dyn EventRecorder> = Arc::new(KubeEventRecorder::new(kube_client.clone(), REPORTER));

    let stop = CancellationToken::new();
    let controllers = futures::future::join(
	ServiceGridController::run(kube_client.clone(), api.clone(), recorder.clone(), config.settings(), config.workers, stop.clone()),
	run_federation(kube_client, api, recorder, &config, stop.clone()),
    );
    tokio::pin!(controllers);

    let interrupted = tokio::select! {
	_ = &mut controllers => false,

	// handle CTRL^C as gracefully as we can.
	_ = tokio::signal::ctrl_c() => true,
    };

    if interrupted {
	log::info!("Interrupted, stopping controllers");
	stop.cancel();
	controllers.await;
    }
    Ok(())
}
