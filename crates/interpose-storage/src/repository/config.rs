//! Settings repository.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::error::Result;

/// One stored setting.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigEntry {
    pub key: String,
    /// Stored JSON value. Unparseable text reads as `Null`.
    pub value: serde_json::Value,
}

/// Queries against the `config` table.
pub struct ConfigRepo;

impl ConfigRepo {
    /// Get a setting.
    pub fn get(conn: &Connection, key: &str) -> Result<Option<ConfigEntry>> {
        let raw: Option<String> = conn
            .query_row("SELECT value FROM config WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;

        Ok(raw.map(|text| {
            let value = serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(key, error = %e, "stored setting is not valid JSON");
                serde_json::Value::Null
            });
            ConfigEntry {
                key: key.to_string(),
                value,
            }
        }))
    }

    /// Insert or replace a setting.
    pub fn set(conn: &Connection, key: &str, value: &serde_json::Value) -> Result<()> {
        let value_json = serde_json::to_string(value)?;

        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
            params![key, value_json],
        )?;

        Ok(())
    }

    /// Delete a setting. Returns whether it existed.
    pub fn delete(conn: &Connection, key: &str) -> Result<bool> {
        let deleted = conn.execute("DELETE FROM config WHERE key = ?1", [key])?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::run_migrations;
    use serde_json::json;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_set_and_get() {
        let conn = setup_db();

        ConfigRepo::set(&conn, "address", &json!("10.0.0.5")).unwrap();
        let entry = ConfigRepo::get(&conn, "address").unwrap().unwrap();

        assert_eq!(entry.key, "address");
        assert_eq!(entry.value, json!("10.0.0.5"));
    }

    #[test]
    fn test_update_existing() {
        let conn = setup_db();

        ConfigRepo::set(&conn, "port", &json!(8080)).unwrap();
        ConfigRepo::set(&conn, "port", &json!(9090)).unwrap();

        let entry = ConfigRepo::get(&conn, "port").unwrap().unwrap();
        assert_eq!(entry.value, json!(9090));
    }

    #[test]
    fn test_get_nonexistent() {
        let conn = setup_db();
        assert!(ConfigRepo::get(&conn, "nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_invalid_json_reads_as_null() {
        let conn = setup_db();
        conn.execute(
            "INSERT INTO config (key, value) VALUES ('port', 'not json')",
            [],
        )
        .unwrap();

        let entry = ConfigRepo::get(&conn, "port").unwrap().unwrap();
        assert!(entry.value.is_null());
    }

    #[test]
    fn test_delete() {
        let conn = setup_db();

        ConfigRepo::set(&conn, "address", &json!("10.0.0.5")).unwrap();
        assert!(ConfigRepo::delete(&conn, "address").unwrap());
        assert!(!ConfigRepo::delete(&conn, "address").unwrap());
        assert!(ConfigRepo::get(&conn, "address").unwrap().is_none());
    }
}
