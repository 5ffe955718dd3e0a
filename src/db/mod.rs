// src/db/mod.rs

//! Object store used to persist and share engine state
//!
//! Every persisted resource (the lock, transactions, packages, revisions,
//! payload objects) is a [`Record`]: a kind, metadata, and JSON spec/status.
//! Stores enforce optimistic concurrency on `metadata.resource_version`:
//! an update carrying a stale version fails with [`Error::Conflict`] instead
//! of overwriting a concurrent change.
//!
//! Update semantics:
//! - `update` replaces metadata and spec, keeps the stored status, and bumps
//!   `generation` only when the spec actually changed
//! - `update_status` replaces only the status
//! - both bump `resource_version`

pub mod memory;
pub mod models;
pub mod schema;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use uuid::Uuid;

/// Reference from an object to one of its owners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: String,
    /// At most one owner reference per object is the controller
    #[serde(default)]
    pub controller: bool,
}

/// Metadata common to every stored object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Set when deletion has been requested but the object still exists
    #[serde(default)]
    pub deletion_requested_at: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// The controlling owner, if any
    pub fn controller(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }

    /// Add or replace the owner reference with the same kind and name
    pub fn set_owner(&mut self, owner: OwnerReference) {
        if owner.controller {
            for existing in &mut self.owner_references {
                existing.controller = false;
            }
        }
        self.owner_references
            .retain(|r| !(r.kind == owner.kind && r.name == owner.name));
        self.owner_references.push(owner);
    }
}

/// An untyped stored object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub status: serde_json::Value,
}

impl Record {
    pub fn new(kind: impl Into<String>, name: impl Into<String>, spec: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            metadata: ObjectMeta::named(name),
            spec,
            status: serde_json::Value::Null,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// An owner reference pointing at this record
    pub fn owner_reference(&self, controller: bool) -> OwnerReference {
        OwnerReference {
            kind: self.kind.clone(),
            name: self.metadata.name.clone(),
            uid: self.metadata.uid.clone(),
            controller,
        }
    }
}

/// Equality label selector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Selector matching every object
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

/// Storage backend for records
///
/// Implementations must make each call atomic with respect to the others,
/// across processes if the backend is shared between them.
pub trait ObjectStore: Send + Sync {
    fn get(&self, kind: &str, name: &str) -> Result<Option<Record>>;

    fn list(&self, kind: &str, selector: &LabelSelector) -> Result<Vec<Record>>;

    /// Create a new record. Fails with `AlreadyExists` if the name is taken.
    fn create(&self, record: Record) -> Result<Record>;

    /// Update metadata and spec, checking the resource version
    fn update(&self, record: Record) -> Result<Record>;

    /// Update status only, checking the resource version
    fn update_status(&self, record: Record) -> Result<Record>;

    fn delete(&self, kind: &str, name: &str) -> Result<()>;
}

/// Fill in server-managed fields for a new record
pub(crate) fn prepare_create(mut record: Record) -> Record {
    record.metadata.uid = Uuid::new_v4().to_string();
    record.metadata.resource_version = 1;
    record.metadata.generation = 1;
    record.metadata.created_at = Some(Utc::now());
    record
}

fn check_version(stored: &Record, incoming: &Record) -> Result<()> {
    if stored.metadata.resource_version != incoming.metadata.resource_version {
        return Err(Error::conflict(
            &incoming.kind,
            &incoming.metadata.name,
            format!(
                "resource version {} is stale (current {})",
                incoming.metadata.resource_version, stored.metadata.resource_version
            ),
        ));
    }
    Ok(())
}

/// Merge an incoming spec/metadata update onto the stored record
pub(crate) fn prepare_update(stored: &Record, incoming: Record) -> Result<Record> {
    check_version(stored, &incoming)?;

    let mut next = incoming;
    next.metadata.uid = stored.metadata.uid.clone();
    next.metadata.created_at = stored.metadata.created_at;
    next.metadata.resource_version = stored.metadata.resource_version + 1;
    next.metadata.generation = if next.spec != stored.spec {
        stored.metadata.generation + 1
    } else {
        stored.metadata.generation
    };
    next.status = stored.status.clone();
    Ok(next)
}

/// Merge an incoming status update onto the stored record
pub(crate) fn prepare_status_update(stored: &Record, incoming: Record) -> Result<Record> {
    check_version(stored, &incoming)?;

    let mut next = stored.clone();
    next.status = incoming.status;
    next.metadata.resource_version = stored.metadata.resource_version + 1;
    Ok(next)
}

/// A spec type that can be stored as a kind of object
pub trait Kind: Serialize + DeserializeOwned + Clone + Debug + Default + Send + Sync {
    const KIND: &'static str;
    type Status: Serialize + DeserializeOwned + Clone + Debug + Default + Send + Sync;
}

/// A typed stored object
#[derive(Debug, Clone)]
pub struct Object<K: Kind> {
    pub metadata: ObjectMeta,
    pub spec: K,
    pub status: K::Status,
}

impl<K: Kind> Object<K> {
    pub fn new(name: impl Into<String>, spec: K) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            spec,
            status: K::Status::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn owner_reference(&self, controller: bool) -> OwnerReference {
        OwnerReference {
            kind: K::KIND.to_string(),
            name: self.metadata.name.clone(),
            uid: self.metadata.uid.clone(),
            controller,
        }
    }

    pub fn to_record(&self) -> Result<Record> {
        Ok(Record {
            kind: K::KIND.to_string(),
            metadata: self.metadata.clone(),
            spec: serde_json::to_value(&self.spec)?,
            status: serde_json::to_value(&self.status)?,
        })
    }

    pub fn from_record(record: Record) -> Result<Self> {
        if record.kind != K::KIND {
            return Err(Error::InitError(format!(
                "Expected kind {} but record {:?} is {}",
                K::KIND, record.metadata.name, record.kind
            )));
        }
        let status = if record.status.is_null() {
            K::Status::default()
        } else {
            serde_json::from_value(record.status)?
        };
        Ok(Self {
            metadata: record.metadata,
            spec: serde_json::from_value(record.spec)?,
            status,
        })
    }
}

/// Typed access to an [`ObjectStore`]
pub trait StoreExt: ObjectStore {
    /// Fetch an object, failing with `NotFound` if it does not exist
    fn get_object<K: Kind>(&self, name: &str) -> Result<Object<K>> {
        self.find_object(name)?
            .ok_or_else(|| Error::not_found(K::KIND, name))
    }

    fn find_object<K: Kind>(&self, name: &str) -> Result<Option<Object<K>>> {
        self.get(K::KIND, name)?.map(Object::from_record).transpose()
    }

    fn list_objects<K: Kind>(&self, selector: &LabelSelector) -> Result<Vec<Object<K>>> {
        self.list(K::KIND, selector)?
            .into_iter()
            .map(Object::from_record)
            .collect()
    }

    fn create_object<K: Kind>(&self, object: &Object<K>) -> Result<Object<K>> {
        Object::from_record(self.create(object.to_record()?)?)
    }

    fn update_object<K: Kind>(&self, object: &Object<K>) -> Result<Object<K>> {
        Object::from_record(self.update(object.to_record()?)?)
    }

    fn update_object_status<K: Kind>(&self, object: &Object<K>) -> Result<Object<K>> {
        Object::from_record(self.update_status(object.to_record()?)?)
    }

    fn delete_object<K: Kind>(&self, name: &str) -> Result<()> {
        self.delete(K::KIND, name)
    }
}

impl<S: ObjectStore + ?Sized> StoreExt for S {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(spec: serde_json::Value) -> Record {
        prepare_create(Record::new("Widget", "w", spec))
    }

    #[test]
    fn test_update_bumps_generation_only_on_spec_change() {
        let current = stored(json!({"size": 1}));

        let mut same = current.clone();
        same.metadata.labels.insert("a".to_string(), "b".to_string());
        let next = prepare_update(&current, same).unwrap();
        assert_eq!(next.metadata.generation, 1);
        assert_eq!(next.metadata.resource_version, 2);

        let mut changed = current.clone();
        changed.spec = json!({"size": 2});
        let next = prepare_update(&current, changed).unwrap();
        assert_eq!(next.metadata.generation, 2);
    }

    #[test]
    fn test_update_rejects_stale_version() {
        let current = stored(json!({}));
        let mut stale = current.clone();
        stale.metadata.resource_version = 0;
        let err = prepare_update(&current, stale).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_status_update_keeps_spec() {
        let current = stored(json!({"size": 1}));
        let mut incoming = current.clone();
        incoming.spec = json!({"size": 99});
        incoming.status = json!({"ready": true});
        let next = prepare_status_update(&current, incoming).unwrap();
        assert_eq!(next.spec, json!({"size": 1}));
        assert_eq!(next.status, json!({"ready": true}));
    }

    #[test]
    fn test_label_selector() {
        let mut labels = BTreeMap::new();
        labels.insert("pkg".to_string(), "a".to_string());
        assert!(LabelSelector::everything().matches(&labels));
        assert!(LabelSelector::everything().with("pkg", "a").matches(&labels));
        assert!(!LabelSelector::everything().with("pkg", "b").matches(&labels));
        assert!(!LabelSelector::everything().with("other", "a").matches(&labels));
    }

    #[test]
    fn test_set_owner_single_controller() {
        let mut meta = ObjectMeta::named("obj");
        meta.set_owner(OwnerReference {
            kind: "PackageRevision".to_string(),
            name: "r1".to_string(),
            uid: "1".to_string(),
            controller: true,
        });
        meta.set_owner(OwnerReference {
            kind: "PackageRevision".to_string(),
            name: "r2".to_string(),
            uid: "2".to_string(),
            controller: true,
        });
        assert_eq!(meta.owner_references.len(), 2);
        assert_eq!(meta.controller().map(|r| r.name.as_str()), Some("r2"));
    }
}
