//! Stage-owner state storage
//!
//! The setup flow records which pool served a given stage before it asks
//! the driver to create an instance, so later teardown requests can be
//! routed back to the right pool. The driver core never touches this.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::Result;

/// SQLite-backed mapping of stage runtime ids to pool names.
pub struct StageOwnerStore {
    conn: Arc<Mutex<Connection>>,
}

impl StageOwnerStore {
    /// Open or create the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS stage_owners (
                stage_id TEXT PRIMARY KEY,
                pool_name TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Record which pool owns a stage.
    pub fn create(&self, stage_id: &str, pool_name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO stage_owners (stage_id, pool_name) VALUES (?1, ?2)",
            params![stage_id, pool_name],
        )?;
        Ok(())
    }

    /// Look up the pool that owns a stage.
    pub fn find(&self, stage_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let pool = conn
            .query_row(
                "SELECT pool_name FROM stage_owners WHERE stage_id = ?1",
                params![stage_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(pool)
    }

    /// Remove a stage mapping. Removing a missing stage is not an error.
    pub fn delete(&self, stage_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM stage_owners WHERE stage_id = ?1",
            params![stage_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_round_trip() {
        let store = StageOwnerStore::in_memory().unwrap();

        assert_eq!(store.find("stage-1").unwrap(), None);

        store.create("stage-1", "pool-a").unwrap();
        assert_eq!(store.find("stage-1").unwrap(), Some("pool-a".to_string()));

        store.delete("stage-1").unwrap();
        assert_eq!(store.find("stage-1").unwrap(), None);
    }

    #[test]
    fn test_store_replaces_owner() {
        let store = StageOwnerStore::in_memory().unwrap();
        store.create("stage-1", "pool-a").unwrap();
        store.create("stage-1", "pool-b").unwrap();
        assert_eq!(store.find("stage-1").unwrap(), Some("pool-b".to_string()));
    }

    #[test]
    fn test_store_delete_missing_is_ok() {
        let store = StageOwnerStore::in_memory().unwrap();
        assert!(store.delete("nope").is_ok());
    }
}
