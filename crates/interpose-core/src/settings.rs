//! Persisted target settings seam.

use parking_lot::Mutex;
use thiserror::Error;

use crate::state::Target;

/// Failure writing persisted settings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("settings error: {0}")]
pub struct SettingsError(pub String);

/// Durable store for the last-chosen target.
///
/// `load` never fails: missing or unreadable values come back as the defaults
/// (`192.168.1.100:8080`).
pub trait SettingsStore: Send + Sync {
    /// Returns the saved target, or the default one.
    fn load(&self) -> Target;

    /// Saves `target` as the last-chosen one.
    fn save(&self, target: &Target) -> Result<(), SettingsError>;
}

/// Non-durable store.
#[derive(Debug, Default)]
pub struct MemorySettings {
    target: Mutex<Option<Target>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already holds `target`.
    pub fn with_target(target: Target) -> Self {
        Self {
            target: Mutex::new(Some(target)),
        }
    }
}

impl SettingsStore for MemorySettings {
    fn load(&self) -> Target {
        self.target.lock().unwrap_or_default()
    }

    fn save(&self, target: &Target) -> Result<(), SettingsError> {
        *self.target.lock() = Some(*target);
        Ok(())
    }
}
