use std::sync::Arc;

use session_core::{HealthMonitor, SessionManager};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) manager: Arc<SessionManager>,
    pub(crate) health: Arc<HealthMonitor>,
    pub(crate) internal_key: Option<String>,
}
