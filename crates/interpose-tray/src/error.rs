//! Quick toggle error types.

use thiserror::Error;

/// Errors returned by the quick toggle.
#[derive(Debug, Error)]
pub enum TileError {
    /// A request is already running, or the state is not known yet.
    #[error("toggle is busy")]
    Busy,

    /// The coordinator has shut down.
    #[error("coordinator is shutting down")]
    Detached,

    /// The listener thread could not be started.
    #[error("failed to start tile listener: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result type for quick toggle operations.
pub type Result<T> = std::result::Result<T, TileError>;
