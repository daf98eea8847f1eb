use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::{resolver::Resolver, services::storage::AttachmentStorage};

/// Per-connection direct delivery queue depth.
pub const DEFAULT_CONNECTION_CAPACITY: usize = 256;

/// State shared across all routes.
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<Resolver>,
    pub storage: Arc<dyn AttachmentStorage>,
    pub metrics: PrometheusHandle,
    pub connection_capacity: usize,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("resolver", &self.resolver)
            .field("bucket", &self.storage.bucket())
            .field("connection_capacity", &self.connection_capacity)
            .finish_non_exhaustive()
    }
}

impl AppState {
    #[must_use]
    pub fn new(
        resolver: Arc<Resolver>,
        storage: Arc<dyn AttachmentStorage>,
        metrics: PrometheusHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            resolver,
            storage,
            metrics,
            connection_capacity: DEFAULT_CONNECTION_CAPACITY,
        })
    }
}
