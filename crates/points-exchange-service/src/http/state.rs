//! 路由共享状态

use std::sync::Arc;

use crate::service::{ExchangeCoordinator, ReconciliationService};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: ExchangeCoordinator,
    pub reconciliations: Arc<ReconciliationService>,
}

impl AppState {
    pub fn new(coordinator: ExchangeCoordinator, reconciliations: Arc<ReconciliationService>) -> Self {
        Self {
            coordinator,
            reconciliations,
        }
    }
}
