// src/establish.rs

//! Establishing and releasing control of package payload objects
//!
//! Each payload object is stored under its own kind and name, with owner
//! references pointing at the revisions that ship it. At most one owner
//! reference is the controller: the active revision that last established
//! the object and whose spec it carries. Inactive revisions are recorded as
//! plain owners so the object outlives a handoff between revisions.

use crate::db::models::{LABEL_PACKAGE, ObjectRef, PackageRevision, RevisionSpec};
use crate::db::{Kind, ObjectStore, OwnerReference, Record, StoreExt};
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::packages::PayloadObject;
use std::sync::Arc;
use tracing::{debug, info};

/// Applies payload objects on behalf of a revision
pub trait Establisher: Send + Sync {
    /// Create or update `objects` as owned by `revision`
    ///
    /// With `control`, the revision becomes each object's controller and its
    /// spec is written. Without it, missing objects are created and existing
    /// ones only gain an owner reference.
    fn establish(
        &self,
        deadline: &Deadline,
        objects: &[PayloadObject],
        revision: &PackageRevision,
        control: bool,
    ) -> Result<Vec<ObjectRef>>;

    /// Give up control of every object the revision controls
    fn release_objects(&self, deadline: &Deadline, revision: &PackageRevision) -> Result<()>;
}

/// Establisher writing payload objects to the object store
pub struct StoreEstablisher {
    store: Arc<dyn ObjectStore>,
}

impl StoreEstablisher {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Whether `owner` names a revision other than `revision` that still exists
    fn is_live_other_revision(
        &self,
        owner: &OwnerReference,
        revision: &PackageRevision,
    ) -> Result<bool> {
        if owner.uid == revision.metadata.uid {
            return Ok(false);
        }
        if owner.kind != RevisionSpec::KIND {
            return Ok(true);
        }
        let existing = self.store.find_object::<RevisionSpec>(&owner.name)?;
        Ok(existing.is_some_and(|r| r.metadata.uid == owner.uid))
    }

    fn establish_one(
        &self,
        object: &PayloadObject,
        revision: &PackageRevision,
        control: bool,
    ) -> Result<Record> {
        let owner = revision.owner_reference(control);

        let Some(mut current) = self.store.get(&object.kind, &object.name)? else {
            let mut record = Record::new(&object.kind, &object.name, object.spec.clone());
            record
                .metadata
                .labels
                .insert(LABEL_PACKAGE.to_string(), revision.spec.package.clone());
            record
                .metadata
                .annotations
                .insert("lockstep.dev/api-version".to_string(), object.api_version.clone());
            record.metadata.set_owner(owner);
            debug!("Creating {} {:?}", object.kind, object.name);
            return self.store.create(record);
        };

        if let Some(controller) = current.metadata.controller()
            && self.is_live_other_revision(controller, revision)?
        {
            if control {
                return Err(Error::OwnershipConflict(format!(
                    "{} {:?} is controlled by {} {}",
                    object.kind, object.name, controller.kind, controller.name
                )));
            }
            // Inactive revisions never contend for control
            if current
                .metadata
                .owner_references
                .iter()
                .any(|r| r.uid == revision.metadata.uid)
            {
                return Ok(current);
            }
            current.metadata.owner_references.push(owner);
            return self.store.update(current);
        }

        if !control {
            let already_owner = current
                .metadata
                .owner_references
                .iter()
                .any(|r| r.uid == revision.metadata.uid);
            if already_owner {
                return Ok(current);
            }
            current.metadata.set_owner(owner);
            return self.store.update(current);
        }

        let unchanged = current.spec == object.spec
            && current
                .metadata
                .controller()
                .is_some_and(|c| c.uid == revision.metadata.uid);
        if unchanged {
            return Ok(current);
        }

        // Drop owner references to controllers that no longer exist
        let mut dangling = Vec::new();
        for r in &current.metadata.owner_references {
            if r.controller && !self.is_live_other_revision(r, revision)? {
                dangling.push(r.uid.clone());
            }
        }
        current
            .metadata
            .owner_references
            .retain(|r| r.uid == revision.metadata.uid || !dangling.contains(&r.uid));

        current.metadata.set_owner(owner);
        current
            .metadata
            .labels
            .insert(LABEL_PACKAGE.to_string(), revision.spec.package.clone());
        current.spec = object.spec.clone();
        debug!("Taking control of {} {:?}", object.kind, object.name);
        self.store.update(current)
    }
}

impl Establisher for StoreEstablisher {
    fn establish(
        &self,
        deadline: &Deadline,
        objects: &[PayloadObject],
        revision: &PackageRevision,
        control: bool,
    ) -> Result<Vec<ObjectRef>> {
        let mut refs = Vec::with_capacity(objects.len());
        for object in objects {
            deadline.check("establishing package objects")?;
            let record = self.establish_one(object, revision, control)?;
            refs.push(ObjectRef {
                kind: record.kind,
                name: record.metadata.name,
                uid: record.metadata.uid,
            });
        }
        if control {
            info!(
                "Revision {} controls {} objects",
                revision.name(),
                refs.len()
            );
        }
        Ok(refs)
    }

    fn release_objects(&self, deadline: &Deadline, revision: &PackageRevision) -> Result<()> {
        for object_ref in &revision.status.object_refs {
            deadline.check("releasing package objects")?;
            let Some(mut current) = self.store.get(&object_ref.kind, &object_ref.name)? else {
                continue;
            };

            let mut changed = false;
            for owner in &mut current.metadata.owner_references {
                if owner.uid == revision.metadata.uid && owner.controller {
                    owner.controller = false;
                    changed = true;
                }
            }
            if changed {
                debug!(
                    "Revision {} released {} {:?}",
                    revision.name(),
                    object_ref.kind,
                    object_ref.name
                );
                self.store.update(current)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::db::models::DesiredState;
    use serde_json::json;
    use std::time::Duration;

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(60))
    }

    fn revision(store: &MemoryStore, name: &str, package: &str) -> PackageRevision {
        let spec = RevisionSpec {
            package: package.to_string(),
            source: format!("acme/{package}:v1"),
            revision: 1,
            desired_state: DesiredState::Active,
            ..Default::default()
        };
        store.create_object(&PackageRevision::new(name, spec)).unwrap()
    }

    fn object(name: &str, size: u64) -> PayloadObject {
        PayloadObject {
            api_version: "apiextensions.lockstep.dev/v1".to_string(),
            kind: "CustomResourceDefinition".to_string(),
            name: name.to_string(),
            spec: json!({ "size": size }),
        }
    }

    #[test]
    fn test_establish_creates_and_controls() {
        let store = Arc::new(MemoryStore::new());
        let establisher = StoreEstablisher::new(store.clone());
        let rev = revision(&store, "a-1", "a");

        let refs = establisher
            .establish(&deadline(), &[object("widgets", 1)], &rev, true)
            .unwrap();
        assert_eq!(refs.len(), 1);

        let record = store.get("CustomResourceDefinition", "widgets").unwrap().unwrap();
        assert_eq!(record.metadata.controller().unwrap().uid, rev.metadata.uid);
        assert_eq!(record.metadata.labels[LABEL_PACKAGE], "a");
    }

    #[test]
    fn test_handoff_between_revisions() {
        let store = Arc::new(MemoryStore::new());
        let establisher = StoreEstablisher::new(store.clone());
        let old = revision(&store, "a-1", "a");
        let new = revision(&store, "a-2", "a");

        let refs = establisher
            .establish(&deadline(), &[object("widgets", 1)], &old, true)
            .unwrap();
        let mut old = old;
        old.status.object_refs = refs;

        // The new revision cannot take control while the old one holds it
        let err = establisher
            .establish(&deadline(), &[object("widgets", 2)], &new, true)
            .unwrap_err();
        assert!(matches!(err, Error::OwnershipConflict(_)));

        establisher.release_objects(&deadline(), &old).unwrap();
        establisher
            .establish(&deadline(), &[object("widgets", 2)], &new, true)
            .unwrap();

        let record = store.get("CustomResourceDefinition", "widgets").unwrap().unwrap();
        assert_eq!(record.metadata.controller().unwrap().uid, new.metadata.uid);
        assert_eq!(record.spec, json!({ "size": 2 }));
        assert_eq!(record.metadata.owner_references.len(), 2);
    }

    #[test]
    fn test_takes_over_from_deleted_revision() {
        let store = Arc::new(MemoryStore::new());
        let establisher = StoreEstablisher::new(store.clone());
        let old = revision(&store, "a-1", "a");
        let new = revision(&store, "a-2", "a");

        establisher
            .establish(&deadline(), &[object("widgets", 1)], &old, true)
            .unwrap();
        store.delete_object::<RevisionSpec>("a-1").unwrap();

        establisher
            .establish(&deadline(), &[object("widgets", 1)], &new, true)
            .unwrap();
        let record = store.get("CustomResourceDefinition", "widgets").unwrap().unwrap();
        assert_eq!(record.metadata.owner_references.len(), 1);
        assert_eq!(record.metadata.controller().unwrap().name, "a-2");
    }

    #[test]
    fn test_inactive_establish_does_not_take_control() {
        let store = Arc::new(MemoryStore::new());
        let establisher = StoreEstablisher::new(store.clone());
        let active = revision(&store, "a-1", "a");
        let inactive = revision(&store, "a-2", "a");

        establisher
            .establish(&deadline(), &[object("widgets", 1)], &active, true)
            .unwrap();
        establisher
            .establish(&deadline(), &[object("widgets", 2), object("gadgets", 1)], &inactive, false)
            .unwrap();

        let widgets = store.get("CustomResourceDefinition", "widgets").unwrap().unwrap();
        assert_eq!(widgets.metadata.controller().unwrap().name, "a-1");
        assert_eq!(widgets.spec, json!({ "size": 1 }));
        assert_eq!(widgets.metadata.owner_references.len(), 2);

        let gadgets = store.get("CustomResourceDefinition", "gadgets").unwrap().unwrap();
        assert!(gadgets.metadata.controller().is_none());
    }
}
