// src/db/sqlite.rs

//! SQLite-backed object store
//!
//! Several engine processes may share one database file. Each mutating call
//! runs in an IMMEDIATE transaction and the final write is conditional on the
//! resource version read inside it, so a writer holding a stale copy gets
//! [`Error::Conflict`] rather than clobbering a concurrent update.

use super::{
    prepare_create, prepare_status_update, prepare_update, schema, LabelSelector, ObjectStore,
    Record,
};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// How long to wait on a locked database before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) a store at `path` and apply migrations
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        schema::migrate(&conn)?;

        debug!("Opened object store at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory store
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn write_with<F>(&self, kind: &str, name: &str, merge: F) -> Result<Record>
    where
        F: FnOnce(&Record) -> Result<Record>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stored = load(&tx, kind, name)?.ok_or_else(|| Error::not_found(kind, name))?;
        let next = merge(&stored)?;

        let rows = tx.execute(
            "UPDATE objects SET resource_version = ?1, record_json = ?2,
             updated_at = CURRENT_TIMESTAMP
             WHERE kind = ?3 AND name = ?4 AND resource_version = ?5",
            params![
                next.metadata.resource_version as i64,
                serde_json::to_string(&next)?,
                kind,
                name,
                stored.metadata.resource_version as i64,
            ],
        )?;
        if rows == 0 {
            return Err(Error::conflict(kind, name, "record changed during update"));
        }

        tx.commit()?;
        Ok(next)
    }
}

fn load(conn: &Connection, kind: &str, name: &str) -> Result<Option<Record>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT record_json FROM objects WHERE kind = ?1 AND name = ?2",
            params![kind, name],
            |row| row.get(0),
        )
        .optional()?;

    match json {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

impl ObjectStore for SqliteStore {
    fn get(&self, kind: &str, name: &str) -> Result<Option<Record>> {
        let conn = self.conn.lock();
        load(&conn, kind, name)
    }

    fn list(&self, kind: &str, selector: &LabelSelector) -> Result<Vec<Record>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT record_json FROM objects WHERE kind = ?1 ORDER BY name")?;
        let rows = stmt
            .query_map([kind], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for json in rows {
            let record: Record = serde_json::from_str(&json)?;
            if selector.matches(&record.metadata.labels) {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn create(&self, record: Record) -> Result<Record> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if load(&tx, &record.kind, &record.metadata.name)?.is_some() {
            return Err(Error::AlreadyExists {
                kind: record.kind,
                name: record.metadata.name,
            });
        }

        let created = prepare_create(record);
        tx.execute(
            "INSERT INTO objects (kind, name, resource_version, record_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                &created.kind,
                &created.metadata.name,
                created.metadata.resource_version as i64,
                serde_json::to_string(&created)?,
            ],
        )?;
        tx.commit()?;
        Ok(created)
    }

    fn update(&self, record: Record) -> Result<Record> {
        let kind = record.kind.clone();
        let name = record.metadata.name.clone();
        self.write_with(&kind, &name, |stored| prepare_update(stored, record))
    }

    fn update_status(&self, record: Record) -> Result<Record> {
        let kind = record.kind.clone();
        let name = record.metadata.name.clone();
        self.write_with(&kind, &name, |stored| prepare_status_update(stored, record))
    }

    fn delete(&self, kind: &str, name: &str) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM objects WHERE kind = ?1 AND name = ?2",
            params![kind, name],
        )?;
        if rows == 0 {
            return Err(Error::not_found(kind, name));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_round_trip_through_file() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("state/lockstep.db");

        {
            let store = SqliteStore::open(&db_path).unwrap();
            let mut record = Record::new("Widget", "a", json!({"size": 3}));
            record.metadata.labels.insert("team".to_string(), "core".to_string());
            store.create(record).unwrap();
        }

        let store = SqliteStore::open(&db_path).unwrap();
        let record = store.get("Widget", "a").unwrap().unwrap();
        assert_eq!(record.spec, json!({"size": 3}));
        assert_eq!(record.metadata.labels.get("team").map(String::as_str), Some("core"));
    }

    #[test]
    fn test_stale_update_conflicts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let base = store.create(Record::new("Widget", "a", json!({"n": 0}))).unwrap();

        let mut first = base.clone();
        first.spec = json!({"n": 1});
        let updated = store.update(first).unwrap();
        assert_eq!(updated.metadata.resource_version, 2);
        assert_eq!(updated.metadata.generation, 2);

        let mut stale = base;
        stale.status = json!({"seen": true});
        assert!(store.update_status(stale).unwrap_err().is_conflict());
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.update(Record::new("Widget", "ghost", json!({}))).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_list_with_selector() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (name, team) in [("a", "core"), ("b", "edge"), ("c", "core")] {
            let mut record = Record::new("Widget", name, json!({}));
            record.metadata.labels.insert("team".to_string(), team.to_string());
            store.create(record).unwrap();
        }

        let core = store
            .list("Widget", &LabelSelector::everything().with("team", "core"))
            .unwrap();
        let names: Vec<&str> = core.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["a", "c"]);

        store.delete("Widget", "a").unwrap();
        assert_eq!(store.list("Widget", &LabelSelector::everything()).unwrap().len(), 2);
    }
}
