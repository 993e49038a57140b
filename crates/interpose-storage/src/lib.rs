//! Interpose Storage - SQLite settings store.
//!
//! Holds the last-chosen redirect target in a small key/value `config` table.
//! [`Database`] implements [`interpose_core::SettingsStore`], so the
//! coordinator can read defaults from it and persist every successful enable.
//!
//! # Example
//!
//! ```no_run
//! use interpose_core::{SettingsStore, Target};
//! use interpose_storage::Database;
//!
//! let db = Database::in_memory().unwrap();
//! assert_eq!(db.load(), Target::default());
//!
//! db.save(&Target::parse("10.0.0.5", 8081).unwrap()).unwrap();
//! ```

mod database;
pub mod error;
mod pool;
pub mod repository;
mod schema;

pub use database::{Database, KEY_ADDRESS, KEY_PORT};
pub use error::{Result, StorageError};
pub use pool::ConnectionPool;
pub use repository::{ConfigEntry, ConfigRepo};
