use std::sync::Arc;

use crate::runtime::WorkerRuntime;

/// Shared application state passed to all worker API handlers.
#[derive(Clone)]
pub struct WorkerState {
    pub runtime: Arc<WorkerRuntime>,
}
