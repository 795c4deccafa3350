use std::sync::Arc;

use crate::ads::AdGate;
use crate::session::AccessSessionManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<AccessSessionManager>,
    pub gate: Arc<AdGate>,
}
