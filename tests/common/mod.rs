// tests/common/mod.rs

//! Shared fixtures for integration tests.

#![allow(dead_code)]

use lockstep::db::models::{
    Dependency, LOCK_NAME, Lock, LockPackage, LockSpec, PackageSnapshot, PackageType,
    Transaction, TransactionSpec,
};
use lockstep::db::{MemoryStore, ObjectStore, SqliteStore, StoreExt};
use lockstep::establish::StoreEstablisher;
use lockstep::installer::{InstallDefaults, InstallStep, Installer, RetryPolicy};
use lockstep::packages::MemoryFetcher;
use lockstep::validation::ValidatorChain;
use lockstep::version::Version;
use lockstep::{ReconcilerSettings, TransactionReconciler};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Platform version the test validators check against
pub const PLATFORM: (u64, u64, u64) = (1, 30, 0);

/// A store, a catalog and a reconciler wired together
pub struct Harness {
    pub store: Arc<dyn ObjectStore>,
    pub fetcher: Arc<MemoryFetcher>,
    pub reconciler: TransactionReconciler,
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        attempts: 3,
        delay: Duration::from_millis(1),
    }
}

impl Harness {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self::with_extra_step(store, None)
    }

    /// Harness whose installer runs `step` after the standard pipeline
    pub fn with_extra_step(store: Arc<dyn ObjectStore>, step: Option<Box<dyn InstallStep>>) -> Self {
        let fetcher = Arc::new(MemoryFetcher::new());
        let establisher = Arc::new(StoreEstablisher::new(store.clone()));
        let mut installer = Installer::standard(
            store.clone(),
            establisher,
            InstallDefaults::default(),
            fast_retry(),
        );
        if let Some(step) = step {
            installer = installer.with(BoxedStep(step));
        }
        let (major, minor, patch) = PLATFORM;
        let reconciler = TransactionReconciler::new(
            store.clone(),
            fetcher.clone(),
            ValidatorChain::standard(Version::new(major, minor, patch)),
            installer,
            ReconcilerSettings {
                timeout: Duration::from_secs(30),
                blocked_requeue: Duration::from_millis(10),
            },
        );
        Self {
            store,
            fetcher,
            reconciler,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Harness backed by a SQLite file; keep the TempDir alive
    pub fn sqlite() -> (TempDir, Self) {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(temp_dir.path().join("lockstep.db")).unwrap();
        (temp_dir, Self::new(Arc::new(store)))
    }

    /// Create an install transaction for `source` at `version`
    pub fn submit_install(&self, tx_name: &str, source: &str, version: &str, retry_limit: u32) {
        let mut spec = TransactionSpec::install(PackageSnapshot {
            name: short_name(source).to_string(),
            source: source.to_string(),
            version: version.to_string(),
        });
        spec.retry_limit = retry_limit;
        self.store
            .create_object(&Transaction::new(tx_name, spec))
            .unwrap();
    }

    pub fn transaction(&self, name: &str) -> Transaction {
        self.store.get_object::<TransactionSpec>(name).unwrap()
    }

    /// Write `packages` to the lock, creating it if needed
    pub fn seed_lock(&self, packages: Vec<LockPackage>) {
        match self.store.find_object::<LockSpec>(LOCK_NAME).unwrap() {
            Some(mut lock) => {
                lock.spec.packages = packages;
                self.store.update_object(&lock).unwrap();
            }
            None => {
                self.store
                    .create_object(&Lock::new(LOCK_NAME, LockSpec { packages }))
                    .unwrap();
            }
        }
    }

    pub fn locked_packages(&self) -> Vec<LockPackage> {
        self.store
            .find_object::<LockSpec>(LOCK_NAME)
            .unwrap()
            .map(|lock| lock.spec.packages)
            .unwrap_or_default()
    }
}

struct BoxedStep(Box<dyn InstallStep>);

impl InstallStep for BoxedStep {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn run(&self, ctx: &mut lockstep::installer::InstallContext<'_>) -> lockstep::Result<()> {
        self.0.run(ctx)
    }
}

pub fn short_name(source: &str) -> &str {
    source.rsplit('/').next().unwrap_or(source)
}

/// A lock entry for `source` at `version`
pub fn lock_package(source: &str, version: &str, deps: &[(&str, &str)]) -> LockPackage {
    LockPackage {
        name: short_name(source).to_string(),
        package_type: PackageType::Provider,
        source: source.to_string(),
        version: version.to_string(),
        dependencies: deps.iter().map(|(p, c)| Dependency::new(*p, *c)).collect(),
    }
}
