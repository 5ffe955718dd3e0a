// src/lock.rs

//! Cluster-wide transaction lock
//!
//! A single `Lock` object holds the committed set of installed packages.
//! Transactions serialize through it with an ownership marker: the
//! `lockstep.dev/transaction` annotation names the transaction currently
//! allowed to change the installed set.
//!
//! # Lock Strategy
//!
//! - **Acquire**: set the marker if it is unset, fail with `LockHeld` if it
//!   names somebody else, succeed without writing if it already names us
//! - **Commit**: replace the package list and clear the marker in one update
//! - **Release**: clear the marker if (and only if) it names us
//!
//! Every mutation goes through the store's optimistic concurrency check, so
//! two transactions racing to set the marker cannot both win, and a holder
//! working from a stale read cannot overwrite a newer commit. There is no
//! in-process mutex; the store is the only coordination point.
//!
//! # Example
//!
//! ```ignore
//! let manager = LockManager::new(store);
//! let guard = manager.lock("install-provider-a")?;
//! let installed = guard.packages().to_vec();
//! // ... solve, validate, install ...
//! guard.commit(proposed)?;
//! // marker released on drop even if commit was never reached
//! ```

use crate::db::models::{LOCK_NAME, LOCK_OWNER_ANNOTATION, Lock, LockPackage, LockSpec};
use crate::db::{ObjectStore, StoreExt};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct LockManager {
    store: Arc<dyn ObjectStore>,
}

impl LockManager {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// The lock object, if it has been created
    pub fn current(&self) -> Result<Option<Lock>> {
        self.store.find_object(LOCK_NAME)
    }

    /// Take the lock for `transaction` and return the installed packages
    ///
    /// Re-acquiring a lock already held by `transaction` is a read.
    pub fn acquire(&self, transaction: &str) -> Result<Vec<LockPackage>> {
        let Some(mut lock) = self.current()? else {
            let mut lock = Lock::new(LOCK_NAME, LockSpec::default());
            lock.metadata
                .annotations
                .insert(LOCK_OWNER_ANNOTATION.to_string(), transaction.to_string());
            return match self.store.create_object(&lock) {
                Ok(created) => {
                    info!("Created lock for transaction {}", transaction);
                    Ok(created.spec.packages)
                }
                // Somebody else created it first; try again from a fresh read
                Err(Error::AlreadyExists { kind, name }) => Err(Error::conflict(
                    kind,
                    name,
                    "lock was created concurrently",
                )),
                Err(e) => Err(e),
            };
        };

        match lock.holder() {
            Some(holder) if holder == transaction => {
                debug!("Transaction {} already holds the lock", transaction);
                return Ok(lock.spec.packages);
            }
            Some(holder) => {
                return Err(Error::LockHeld {
                    holder: holder.to_string(),
                });
            }
            None => {}
        }

        lock.metadata
            .annotations
            .insert(LOCK_OWNER_ANNOTATION.to_string(), transaction.to_string());
        let updated = self.store.update_object(&lock)?;
        info!("Transaction {} acquired the lock", transaction);
        Ok(updated.spec.packages)
    }

    /// Acquire the lock and return a guard that releases it on drop
    pub fn lock(&self, transaction: &str) -> Result<LockGuard<'_>> {
        let packages = self.acquire(transaction)?;
        Ok(LockGuard {
            manager: self,
            transaction: transaction.to_string(),
            packages,
        })
    }

    /// Replace the installed package set and release the lock
    ///
    /// Only the current holder may commit.
    pub fn commit(&self, transaction: &str, packages: Vec<LockPackage>) -> Result<()> {
        let mut lock = self
            .current()?
            .ok_or_else(|| Error::not_found("Lock", LOCK_NAME))?;

        if lock.holder() != Some(transaction) {
            return Err(Error::LockNotHeld(transaction.to_string()));
        }

        let count = packages.len();
        lock.spec.packages = packages;
        lock.metadata.annotations.remove(LOCK_OWNER_ANNOTATION);
        self.store.update_object(&lock)?;
        info!(
            "Transaction {} committed {} packages to the lock",
            transaction, count
        );
        Ok(())
    }

    /// Clear the ownership marker if `transaction` holds it
    ///
    /// Safe to call any number of times, whoever holds the lock.
    pub fn release(&self, transaction: &str) -> Result<()> {
        let Some(mut lock) = self.current()? else {
            return Ok(());
        };
        if lock.holder() != Some(transaction) {
            return Ok(());
        }

        lock.metadata.annotations.remove(LOCK_OWNER_ANNOTATION);
        self.store.update_object(&lock)?;
        debug!("Transaction {} released the lock", transaction);
        Ok(())
    }
}

/// Scoped lock ownership
///
/// Dropping the guard releases the lock. A release that fails is logged and
/// otherwise ignored; the marker then stays until the same transaction runs
/// again, which either re-acquires it or, on a terminal exit, releases it.
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    transaction: String,
    packages: Vec<LockPackage>,
}

impl LockGuard<'_> {
    /// Packages installed when the lock was acquired
    pub fn packages(&self) -> &[LockPackage] {
        &self.packages
    }

    pub fn transaction(&self) -> &str {
        &self.transaction
    }

    pub fn commit(&self, packages: Vec<LockPackage>) -> Result<()> {
        self.manager.commit(&self.transaction, packages)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.manager.release(&self.transaction) {
            warn!(
                "Failed to release lock for transaction {}: {}",
                self.transaction, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::db::models::PackageType;

    fn manager() -> LockManager {
        LockManager::new(Arc::new(MemoryStore::new()))
    }

    fn package(source: &str) -> LockPackage {
        LockPackage {
            name: source.to_string(),
            package_type: PackageType::Provider,
            source: source.to_string(),
            version: "v1.0.0".to_string(),
            dependencies: Vec::new(),
        }
    }

    #[test]
    fn test_acquire_creates_lock() {
        let manager = manager();
        assert!(manager.current().unwrap().is_none());

        let packages = manager.acquire("tx-1").unwrap();
        assert!(packages.is_empty());
        assert_eq!(manager.current().unwrap().unwrap().holder(), Some("tx-1"));
    }

    #[test]
    fn test_acquire_is_exclusive_and_idempotent() {
        let manager = manager();
        manager.acquire("tx-1").unwrap();
        let version = manager.current().unwrap().unwrap().metadata.resource_version;

        manager.acquire("tx-1").unwrap();
        assert_eq!(
            manager.current().unwrap().unwrap().metadata.resource_version,
            version
        );

        let err = manager.acquire("tx-2").unwrap_err();
        assert!(err.is_lock_held());
    }

    #[test]
    fn test_commit_replaces_packages_and_clears_marker() {
        let manager = manager();
        manager.acquire("tx-1").unwrap();
        manager.commit("tx-1", vec![package("acme/a")]).unwrap();

        let lock = manager.current().unwrap().unwrap();
        assert_eq!(lock.holder(), None);
        assert_eq!(lock.spec.packages.len(), 1);

        assert_eq!(manager.acquire("tx-2").unwrap().len(), 1);
    }

    #[test]
    fn test_commit_requires_holder() {
        let manager = manager();
        manager.acquire("tx-1").unwrap();
        assert!(matches!(
            manager.commit("tx-2", vec![]),
            Err(Error::LockNotHeld(_))
        ));
    }

    #[test]
    fn test_release_only_clears_own_marker() {
        let manager = manager();
        manager.release("tx-1").unwrap();

        manager.acquire("tx-1").unwrap();
        manager.release("tx-2").unwrap();
        assert_eq!(manager.current().unwrap().unwrap().holder(), Some("tx-1"));

        manager.release("tx-1").unwrap();
        manager.release("tx-1").unwrap();
        assert_eq!(manager.current().unwrap().unwrap().holder(), None);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let manager = manager();
        {
            let guard = manager.lock("tx-1").unwrap();
            assert_eq!(guard.transaction(), "tx-1");
            assert!(manager.acquire("tx-2").unwrap_err().is_lock_held());
        }
        assert_eq!(manager.current().unwrap().unwrap().holder(), None);
        manager.acquire("tx-2").unwrap();
    }

    #[test]
    fn test_stale_holder_cannot_overwrite() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let manager = LockManager::new(store.clone());
        manager.acquire("tx-1").unwrap();

        let mut stale = manager.current().unwrap().unwrap();
        manager.commit("tx-1", vec![package("acme/a")]).unwrap();

        stale.spec.packages.clear();
        let err = store.update_object(&stale).unwrap_err();
        assert!(err.is_conflict());
    }
}
