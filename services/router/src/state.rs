use std::sync::Arc;

use crate::broker::RequestBroker;
use crate::config::RouterConfig;
use crate::metrics::Metrics;
use crate::session::SessionRegistry;

/// Process-wide singletons, created once at startup and shared with
/// every handler through axum state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RouterConfig>,
    pub metrics: Arc<Metrics>,
    pub sessions: Arc<SessionRegistry>,
    pub broker: Arc<RequestBroker>,
}

impl AppState {
    pub fn new(config: RouterConfig) -> Self {
        let config = Arc::new(config);
        let metrics = Arc::new(Metrics::default());
        let sessions = Arc::new(SessionRegistry::new(Arc::clone(&metrics)));
        let broker = Arc::new(RequestBroker::new(
            Arc::clone(&sessions),
            Arc::clone(&config),
            Arc::clone(&metrics),
        ));
        Self {
            config,
            metrics,
            sessions,
            broker,
        }
    }
}
