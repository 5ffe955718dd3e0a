// src/db/memory.rs

//! In-process object store
//!
//! Used by tests and single-process deployments. Concurrency semantics match
//! [`super::SqliteStore`]: every call is atomic and updates are checked against
//! the stored resource version.

use super::{prepare_create, prepare_status_update, prepare_update, LabelSelector, ObjectStore, Record};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<(String, String), Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records of a kind
    pub fn count(&self, kind: &str) -> usize {
        self.records.lock().keys().filter(|(k, _)| k == kind).count()
    }
}

fn key(kind: &str, name: &str) -> (String, String) {
    (kind.to_string(), name.to_string())
}

impl ObjectStore for MemoryStore {
    fn get(&self, kind: &str, name: &str) -> Result<Option<Record>> {
        Ok(self.records.lock().get(&key(kind, name)).cloned())
    }

    fn list(&self, kind: &str, selector: &LabelSelector) -> Result<Vec<Record>> {
        let records = self.records.lock();
        Ok(records
            .iter()
            .filter(|((k, _), r)| k == kind && selector.matches(&r.metadata.labels))
            .map(|(_, r)| r.clone())
            .collect())
    }

    fn create(&self, record: Record) -> Result<Record> {
        let mut records = self.records.lock();
        let k = key(&record.kind, &record.metadata.name);
        if records.contains_key(&k) {
            return Err(Error::AlreadyExists {
                kind: record.kind,
                name: record.metadata.name,
            });
        }
        let created = prepare_create(record);
        records.insert(k, created.clone());
        Ok(created)
    }

    fn update(&self, record: Record) -> Result<Record> {
        let mut records = self.records.lock();
        let k = key(&record.kind, &record.metadata.name);
        let stored = records
            .get(&k)
            .ok_or_else(|| Error::not_found(&record.kind, &record.metadata.name))?;
        let next = prepare_update(stored, record)?;
        records.insert(k, next.clone());
        Ok(next)
    }

    fn update_status(&self, record: Record) -> Result<Record> {
        let mut records = self.records.lock();
        let k = key(&record.kind, &record.metadata.name);
        let stored = records
            .get(&k)
            .ok_or_else(|| Error::not_found(&record.kind, &record.metadata.name))?;
        let next = prepare_status_update(stored, record)?;
        records.insert(k, next.clone());
        Ok(next)
    }

    fn delete(&self, kind: &str, name: &str) -> Result<()> {
        match self.records.lock().remove(&key(kind, name)) {
            Some(_) => Ok(()),
            None => Err(Error::not_found(kind, name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_get_delete() {
        let store = MemoryStore::new();
        let created = store.create(Record::new("Widget", "a", json!({}))).unwrap();
        assert_eq!(created.metadata.resource_version, 1);
        assert!(!created.metadata.uid.is_empty());

        assert!(store.get("Widget", "a").unwrap().is_some());
        assert!(store.get("Other", "a").unwrap().is_none());

        store.delete("Widget", "a").unwrap();
        assert!(store.delete("Widget", "a").unwrap_err().is_not_found());
    }

    #[test]
    fn test_create_twice_fails() {
        let store = MemoryStore::new();
        store.create(Record::new("Widget", "a", json!({}))).unwrap();
        let err = store.create(Record::new("Widget", "a", json!({}))).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[test]
    fn test_concurrent_writers_one_wins() {
        let store = MemoryStore::new();
        let base = store.create(Record::new("Widget", "a", json!({"n": 0}))).unwrap();

        let mut first = base.clone();
        first.spec = json!({"n": 1});
        let mut second = base;
        second.spec = json!({"n": 2});

        store.update(first).unwrap();
        assert!(store.update(second).unwrap_err().is_conflict());
        assert_eq!(store.get("Widget", "a").unwrap().unwrap().spec, json!({"n": 1}));
    }

    #[test]
    fn test_list_filters_kind_and_labels() {
        let store = MemoryStore::new();
        let mut a = Record::new("Widget", "a", json!({}));
        a.metadata.labels.insert("group".to_string(), "x".to_string());
        store.create(a).unwrap();
        store.create(Record::new("Widget", "b", json!({}))).unwrap();
        store.create(Record::new("Gadget", "c", json!({}))).unwrap();

        assert_eq!(store.list("Widget", &LabelSelector::everything()).unwrap().len(), 2);
        let selected = store
            .list("Widget", &LabelSelector::everything().with("group", "x"))
            .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name(), "a");
        assert_eq!(store.count("Gadget"), 1);
    }
}
