//! Table repositories.

pub mod config;

pub use config::{ConfigEntry, ConfigRepo};
