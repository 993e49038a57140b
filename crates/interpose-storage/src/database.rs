//! High-level settings database.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use directories::ProjectDirs;
use interpose_core::{SettingsError, SettingsStore, Target};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{Result, StorageError};
use crate::pool::ConnectionPool;
use crate::repository::ConfigRepo;

/// Setting key for the target address (JSON string).
pub const KEY_ADDRESS: &str = "address";

/// Setting key for the target port (JSON integer).
pub const KEY_PORT: &str = "port";

/// Settings database for Interpose.
#[derive(Clone)]
pub struct Database {
    pool: ConnectionPool,
}

impl Database {
    /// Opens the database in the default app data directory.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_db_path()?)
    }

    /// Opens the database at `path`, creating parent directories.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening database at: {:?}", path);
        let pool = ConnectionPool::new(&path)?;

        Ok(Self { pool })
    }

    /// In-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let pool = ConnectionPool::in_memory()?;
        Ok(Self { pool })
    }

    /// Default database location.
    pub fn default_db_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "interpose", "interpose")
            .ok_or_else(|| StorageError::Config("Could not determine app data directory".into()))?;

        Ok(proj_dirs.data_dir().join("interpose.db"))
    }

    /// Raw setting value.
    pub fn get_setting(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.pool.get()?;
        Ok(ConfigRepo::get(&conn, key)?.map(|entry| entry.value))
    }

    pub fn set_setting(&self, key: &str, value: &Value) -> Result<()> {
        let conn = self.pool.get()?;
        ConfigRepo::set(&conn, key, value)
    }

    pub fn delete_setting(&self, key: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        ConfigRepo::delete(&conn, key)
    }

    /// Saved target. Missing values use the defaults; malformed ones are
    /// logged and also use the defaults.
    pub fn load_target(&self) -> Target {
        let defaults = Target::default();

        let address = self
            .read_setting(KEY_ADDRESS, |value| {
                value.as_str().and_then(|s| s.trim().parse::<Ipv4Addr>().ok())
            })
            .unwrap_or(defaults.address);

        let port = self
            .read_setting(KEY_PORT, |value| {
                let port = match value {
                    Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
                    Value::String(s) => s.trim().parse::<u16>().ok(),
                    _ => None,
                };
                port.filter(|p| *p != 0)
            })
            .unwrap_or(defaults.port);

        Target::new(address, port)
    }

    /// Saves both target fields in one transaction.
    pub fn save_target(&self, target: &Target) -> Result<()> {
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        ConfigRepo::set(&tx, KEY_ADDRESS, &json!(target.address.to_string()))?;
        ConfigRepo::set(&tx, KEY_PORT, &json!(target.port))?;
        tx.commit()?;

        info!(%target, "saved target settings");
        Ok(())
    }

    fn read_setting<T>(&self, key: &str, parse: impl FnOnce(&Value) -> Option<T>) -> Option<T> {
        match self.get_setting(key) {
            Ok(Some(value)) => {
                let parsed = parse(&value);
                if parsed.is_none() {
                    warn!(key, %value, "ignoring malformed setting, using default");
                }
                parsed
            }
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "failed to read setting, using default");
                None
            }
        }
    }
}

impl SettingsStore for Database {
    fn load(&self) -> Target {
        self.load_target()
    }

    fn save(&self, target: &Target) -> std::result::Result<(), SettingsError> {
        self.save_target(target)
            .map_err(|e| SettingsError(e.to_string()))
    }
}
