// src/installer/mod.rs

//! Per-package installation pipeline
//!
//! Installing a package runs an ordered list of steps. Each step is
//! idempotent: it re-reads what it needs from the store, so the whole
//! pipeline can be re-run after a failure or a crash, and a single step can
//! be retried after a transient store error.
//!
//! The standard pipeline:
//!
//! 1. [`PackageCreator`] creates or updates the Package
//! 2. [`RevisionCreator`] creates or re-activates the target revision,
//!    deactivates the others and garbage-collects old ones
//! 3. [`ObjectReleaser`] releases objects controlled by inactive revisions
//! 4. [`ObjectInstaller`] establishes the payload objects
//! 5. [`RuntimeBootstrapper`] creates runtime prerequisites
//! 6. [`RevisionStatusUpdater`] and [`PackageStatusUpdater`] record facts

mod objects;
mod package;
mod revision;
mod runtime;

pub use objects::{ObjectInstaller, ObjectReleaser};
pub use package::{PackageCreator, PackageStatusUpdater};
pub use revision::{RevisionCreator, RevisionStatusUpdater, revision_name};
pub use runtime::RuntimeBootstrapper;

use crate::db::models::{Package, PackageRevision, Transaction};
use crate::db::ObjectStore;
use crate::deadline::Deadline;
use crate::error::{Error, Result, ResultExt};
use crate::establish::Establisher;
use crate::packages::FetchedPackage;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// State shared between the steps installing one package
pub struct InstallContext<'a> {
    pub deadline: &'a Deadline,
    pub transaction: &'a Transaction,
    pub fetched: &'a FetchedPackage,
    /// Set by [`PackageCreator`]
    pub package: Option<Package>,
    /// Set by [`RevisionCreator`]
    pub revision: Option<PackageRevision>,
}

impl<'a> InstallContext<'a> {
    pub fn new(
        deadline: &'a Deadline,
        transaction: &'a Transaction,
        fetched: &'a FetchedPackage,
    ) -> Self {
        Self {
            deadline,
            transaction,
            fetched,
            package: None,
            revision: None,
        }
    }

    pub fn package(&self) -> Result<&Package> {
        self.package
            .as_ref()
            .ok_or_else(|| Error::InitError("Package step has not run".to_string()))
    }

    pub fn revision(&self) -> Result<&PackageRevision> {
        self.revision
            .as_ref()
            .ok_or_else(|| Error::InitError("Revision step has not run".to_string()))
    }
}

/// One idempotent installation step
pub trait InstallStep: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, ctx: &mut InstallContext<'_>) -> Result<()>;
}

/// Retry policy for transient store errors
///
/// The delay grows linearly with the attempt number and never runs past the
/// deadline.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn run<T>(
        &self,
        deadline: &Deadline,
        what: &str,
        mut operation: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            deadline.check(what)?;

            match operation() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    let delay = self.delay * attempt;
                    if delay >= deadline.remaining() {
                        return Err(e);
                    }
                    warn!("{} attempt {} failed: {}, retrying...", what, attempt, e);
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Result of installing one package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub package: String,
    pub revision: String,
    pub active: bool,
}

/// Ordered installation steps, fail fast
pub struct Installer {
    steps: Vec<Box<dyn InstallStep>>,
    retry: RetryPolicy,
}

/// Settings applied to packages the installer creates
#[derive(Debug, Clone, Copy)]
pub struct InstallDefaults {
    pub revision_history_limit: u32,
}

impl Default for InstallDefaults {
    fn default() -> Self {
        Self {
            revision_history_limit: 1,
        }
    }
}

impl Installer {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            steps: Vec::new(),
            retry,
        }
    }

    /// The canonical pipeline
    pub fn standard(
        store: Arc<dyn ObjectStore>,
        establisher: Arc<dyn Establisher>,
        defaults: InstallDefaults,
        retry: RetryPolicy,
    ) -> Self {
        Self::new(retry)
            .with(PackageCreator::new(store.clone(), defaults))
            .with(RevisionCreator::new(store.clone()))
            .with(ObjectReleaser::new(store.clone(), establisher.clone()))
            .with(ObjectInstaller::new(store.clone(), establisher))
            .with(RuntimeBootstrapper::new(store.clone()))
            .with(RevisionStatusUpdater::new(store.clone()))
            .with(PackageStatusUpdater::new(store))
    }

    pub fn with(mut self, step: impl InstallStep + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step for one package
    pub fn install(
        &self,
        deadline: &Deadline,
        transaction: &Transaction,
        fetched: &FetchedPackage,
    ) -> Result<InstallReport> {
        let source = fetched.package.reference();
        let mut ctx = InstallContext::new(deadline, transaction, fetched);

        for step in &self.steps {
            debug!("Running install step {} for {}", step.name(), source);
            self.retry
                .run(deadline, step.name(), || step.run(&mut ctx))
                .with_context(|| format!("installing {} ({})", source, step.name()))?;
        }

        let package = ctx.package()?.name().to_string();
        let revision = ctx.revision()?;
        let report = InstallReport {
            package,
            revision: revision.name().to_string(),
            active: revision.is_active(),
        };
        info!(
            "Installed {} as revision {} of {}",
            source, report.revision, report.package
        );
        Ok(report)
    }
}
