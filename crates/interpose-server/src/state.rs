//! Application state for the API server.

use interpose_core::StateCoordinator;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Handle to the process-wide coordinator. Every request goes through it.
    pub coordinator: StateCoordinator,
}

impl AppState {
    pub fn new(coordinator: StateCoordinator) -> Self {
        Self { coordinator }
    }
}
