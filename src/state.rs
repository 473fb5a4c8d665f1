//! Shared application state handed to every handler.

use std::sync::Arc;

use crate::cache::Cache;
use crate::config::Settings;
use crate::gateway::health::HealthRegistry;
use crate::metrics::MetricsSink;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub cache: Arc<dyn Cache>,
    pub metrics: Arc<dyn MetricsSink>,
    pub health: Arc<HealthRegistry>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn Cache>,
        metrics: Arc<dyn MetricsSink>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            cache,
            metrics,
            health: Arc::new(HealthRegistry::new()),
            settings: Arc::new(settings),
        }
    }
}
