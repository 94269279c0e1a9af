use crate::controller::Settings;

use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[clap(name = "gridm", about = "Application grid controller for ServiceGrids")]
pub struct Config {
    /// Number of workers reconciling ServiceGrids.
    #[clap(long, env = "GRIDM_WORKERS", default_value_t = 2)]
    pub workers: u16,

    /// Number of workers reconciling federated ServiceGrids.
    #[clap(long, env = "GRIDM_FED_WORKERS", default_value_t = 2)]
    pub fed_workers: u16,

    /// Namespace holding the federated ServiceGrids.
    #[clap(long, env = "GRIDM_FED_NAMESPACE", default_value = "edge-system")]
    pub fed_namespace: String,

    /// Requeues of a failing key before it is dropped.
    #[clap(long, env = "GRIDM_MAX_RETRIES", default_value_t = crate::controller::DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// How long to wait for the caches to fill before giving up, in seconds.
    #[clap(long, env = "GRIDM_CACHE_SYNC_TIMEOUT_SECS", default_value_t = 300)]
    pub cache_sync_timeout_secs: u64,

    /// Do not run the federation controller.
    #[clap(long, env = "GRIDM_DISABLE_FEDERATION")]
    pub disable_federation: bool,
}

impl Config {

    pub fn settings(&self) -> Settings {
	Settings{
	    max_retries: self.max_retries,
	    cache_sync_timeout: Duration::from_secs(self.cache_sync_timeout_secs),
	}
    }
}
