use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cluster::{
    ClusterGateway, LifecycleSettings, ResourceAccountant, TaskLifecycleManager,
};
use crate::config::ServiceConfig;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: TaskLifecycleManager,
    pub accountant: ResourceAccountant,
    pub config: Arc<ServiceConfig>,
    /// Cancelled on server shutdown; aborts in-flight deletion waits
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(gateway: Arc<dyn ClusterGateway>, config: ServiceConfig) -> Self {
        let manager = TaskLifecycleManager::new(gateway.clone(), LifecycleSettings::from(&config));
        Self {
            manager,
            accountant: ResourceAccountant::new(gateway),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    /// Use an externally owned shutdown token
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn gateway(&self) -> &Arc<dyn ClusterGateway> {
        self.manager.gateway()
    }
}
