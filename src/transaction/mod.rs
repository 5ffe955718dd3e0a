// src/transaction/mod.rs

//! Transaction reconciliation
//!
//! A Transaction asks for one change to the installed package set. The
//! reconciler drives it to a terminal phase, one bounded pass at a time:
//!
//! ```text
//!   Pending ──> Running ──> Complete
//!                 │  ^
//!                 │  └── Blocked (lock held by another transaction)
//!                 │
//!                 └────> Failed (retry limit reached, unsupported change)
//! ```
//!
//! A pass that fails with a domain error (resolution, validation,
//! installation, commit) records a condition, bumps `status.failures` and
//! returns the error; the controller retries it later. Store conflicts are
//! returned untouched so the next pass starts from a fresh read.
//!
//! The cluster lock is held for the body of the pass through a
//! [`LockGuard`](crate::lock::LockGuard), so every exit path releases it.

use crate::config::Config;
use crate::db::models::{
    ChangeType, Condition, ConditionReason, ConditionType, LockPackage, PackageSnapshot,
    Transaction, TransactionPhase, TransactionSpec,
};
use crate::db::{ObjectStore, StoreExt};
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::establish::StoreEstablisher;
use crate::installer::{InstallDefaults, Installer, RetryPolicy};
use crate::lock::LockManager;
use crate::packages::{ArtifactFetcher, FetchedPackage, fetch_package};
use crate::resolver::{DependencySolver, install_order};
use crate::validation::ValidatorChain;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the caller should do after a successful pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Reconcile again after this delay
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerSettings {
    /// Deadline for one pass
    pub timeout: Duration,
    /// Delay before a blocked transaction is tried again
    pub blocked_requeue: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            blocked_requeue: Duration::from_secs(3),
        }
    }
}

pub struct TransactionReconciler {
    store: Arc<dyn ObjectStore>,
    fetcher: Arc<dyn ArtifactFetcher>,
    locks: LockManager,
    solver: DependencySolver,
    validators: ValidatorChain,
    installer: Installer,
    settings: ReconcilerSettings,
}

impl TransactionReconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        fetcher: Arc<dyn ArtifactFetcher>,
        validators: ValidatorChain,
        installer: Installer,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            locks: LockManager::new(store.clone()),
            solver: DependencySolver::new(store.clone(), fetcher.clone()),
            store,
            fetcher,
            validators,
            installer,
            settings,
        }
    }

    /// Wire up the standard validators and installer pipeline
    pub fn from_config(
        store: Arc<dyn ObjectStore>,
        fetcher: Arc<dyn ArtifactFetcher>,
        config: &Config,
    ) -> Result<Self> {
        let establisher = Arc::new(StoreEstablisher::new(store.clone()));
        let installer = Installer::standard(
            store.clone(),
            establisher,
            InstallDefaults {
                revision_history_limit: config.default_revision_history_limit,
            },
            RetryPolicy {
                attempts: config.step_retry_attempts,
                delay: config.step_retry_delay(),
            },
        );
        let settings = ReconcilerSettings {
            timeout: config.reconcile_timeout(),
            blocked_requeue: config.blocked_requeue(),
        };
        Ok(Self::new(
            store,
            fetcher,
            ValidatorChain::standard(config.platform_version()?),
            installer,
            settings,
        ))
    }

    /// Run one pass for the named transaction
    pub fn reconcile(&self, name: &str) -> Result<ReconcileOutcome> {
        let deadline = Deadline::after(self.settings.timeout);

        deadline.check("loading transaction")?;
        let Some(mut tx) = self.store.find_object::<TransactionSpec>(name)? else {
            debug!(transaction = name, "Transaction no longer exists");
            return Ok(ReconcileOutcome::done());
        };
        if tx.is_deleting() {
            debug!(transaction = name, "Transaction is being deleted");
            self.release_stale_lock(&deadline, name)?;
            return Ok(ReconcileOutcome::done());
        }
        if tx.status.phase.is_terminal() {
            self.release_stale_lock(&deadline, name)?;
            return Ok(ReconcileOutcome::done());
        }

        if tx.status.failures >= tx.spec.retry_limit {
            let message = format!(
                "Giving up after {} failed attempts (retry limit {})",
                tx.status.failures, tx.spec.retry_limit
            );
            warn!(transaction = name, "{}", message);
            self.release_stale_lock(&deadline, name)?;
            self.finish_failed(&deadline, &mut tx, message)?;
            return Ok(ReconcileOutcome::done());
        }

        // Written on every pass so a stale read fails here with a conflict
        tx.status.set_phase(TransactionPhase::Running, None);
        self.write_status(&deadline, &mut tx)?;

        let requested = tx.spec.install.as_ref().map(|i| i.package.clone());
        let snapshot = match (tx.spec.change, requested) {
            (ChangeType::Install, Some(package)) => package,
            (ChangeType::Install, None) => {
                self.release_stale_lock(&deadline, name)?;
                self.finish_failed(
                    &deadline,
                    &mut tx,
                    "Install transaction has no package to install".to_string(),
                )?;
                return Ok(ReconcileOutcome::done());
            }
            (change, _) => {
                let err = Error::Unsupported(format!(
                    "{} transactions are not yet implemented",
                    change.as_str()
                ));
                warn!(transaction = name, "{}", err);
                self.release_stale_lock(&deadline, name)?;
                self.finish_failed(&deadline, &mut tx, err.to_string())?;
                return Ok(ReconcileOutcome::done());
            }
        };

        deadline.check("acquiring lock")?;
        let guard = match self.locks.lock(name) {
            Ok(guard) => guard,
            Err(e) if e.is_lock_held() => {
                info!(transaction = name, "Blocked: {}", e);
                tx.status.set_phase(
                    TransactionPhase::Blocked,
                    Some(
                        Condition::new(ConditionType::Blocked)
                            .with_reason(ConditionReason::LockAcquisition)
                            .with_message(e.to_string()),
                    ),
                );
                self.write_status(&deadline, &mut tx)?;
                return Ok(ReconcileOutcome::requeue(self.settings.blocked_requeue));
            }
            Err(e) => return Err(e.context(format!("acquiring lock for {name}"))),
        };

        let proposed = match self.solver.solve(&deadline, &snapshot, guard.packages()) {
            Ok(proposed) => proposed,
            Err(e) => {
                return Err(self.record_failure(
                    &deadline,
                    &mut tx,
                    ConditionType::ResolutionError,
                    ConditionReason::DependencySolve,
                    e,
                ));
            }
        };
        info!(
            transaction = name,
            packages = proposed.len(),
            "Resolved {}",
            describe(&snapshot)
        );
        tx.status.proposed_lock_packages = proposed.clone();
        tx.status.set_condition(
            Condition::new(ConditionType::ResolutionSuccess)
                .with_reason(ConditionReason::DependencySolve),
        );
        self.write_status(&deadline, &mut tx)?;

        let fetched = match self
            .fetch_all(&deadline, &proposed)
            .and_then(|fetched| {
                self.validators.validate(&deadline, &tx, &fetched)?;
                Ok(fetched)
            }) {
            Ok(fetched) => fetched,
            Err(e) => {
                return Err(self.record_failure(
                    &deadline,
                    &mut tx,
                    ConditionType::ValidationError,
                    ConditionReason::Validation,
                    e,
                ));
            }
        };
        tx.status.set_condition(
            Condition::new(ConditionType::ValidationSuccess)
                .with_reason(ConditionReason::Validation),
        );
        self.write_status(&deadline, &mut tx)?;

        if let Err(e) = self.install_all(&deadline, &tx, &proposed, fetched) {
            return Err(self.record_failure(
                &deadline,
                &mut tx,
                ConditionType::InstallationError,
                ConditionReason::Installation,
                e,
            ));
        }

        deadline.check("committing lock")?;
        if let Err(e) = guard.commit(proposed) {
            return Err(self.record_failure(
                &deadline,
                &mut tx,
                ConditionType::InstallationError,
                ConditionReason::Installation,
                e.context("committing lock"),
            ));
        }

        tx.status.set_condition(
            Condition::new(ConditionType::InstallationSuccess)
                .with_reason(ConditionReason::Installation),
        );
        tx.status.set_phase(TransactionPhase::Complete, None);
        self.write_status(&deadline, &mut tx)?;
        info!(transaction = name, "Transaction complete");
        Ok(ReconcileOutcome::done())
    }

    fn fetch_all(&self, deadline: &Deadline, proposed: &[LockPackage]) -> Result<Vec<FetchedPackage>> {
        proposed
            .iter()
            .map(|pkg| {
                deadline.check("fetching package artifacts")?;
                fetch_package(self.store.as_ref(), self.fetcher.as_ref(), pkg)
            })
            .collect()
    }

    /// Install every proposed package, dependencies first
    fn install_all(
        &self,
        deadline: &Deadline,
        tx: &Transaction,
        proposed: &[LockPackage],
        fetched: Vec<FetchedPackage>,
    ) -> Result<()> {
        let mut by_source: BTreeMap<String, FetchedPackage> = fetched
            .into_iter()
            .map(|f| (f.package.source.clone(), f))
            .collect();

        for pkg in install_order(proposed)? {
            deadline.check("installing packages")?;
            let fetched = by_source
                .remove(&pkg.source)
                .ok_or_else(|| Error::not_found("PackageArtifact", pkg.reference()))?;
            let report = self.installer.install(deadline, tx, &fetched)?;
            debug!(
                transaction = tx.name(),
                package = %report.package,
                revision = %report.revision,
                active = report.active,
                "Package installed"
            );
        }
        Ok(())
    }

    /// Clear a lock marker this transaction may have left behind
    ///
    /// Terminal exits never reach the guard again, so a marker left by a
    /// crash or a failed release is cleared on the way out.
    fn release_stale_lock(&self, deadline: &Deadline, name: &str) -> Result<()> {
        deadline.check("releasing lock")?;
        self.locks
            .release(name)
            .map_err(|e| e.context(format!("releasing lock for {name}")))
    }

    /// Persist the status, keeping `tx` at the stored resource version
    fn write_status(&self, deadline: &Deadline, tx: &mut Transaction) -> Result<()> {
        deadline.check("writing transaction status")?;
        *tx = self.store.update_object_status(tx)?;
        Ok(())
    }

    fn finish_failed(&self, deadline: &Deadline, tx: &mut Transaction, message: String) -> Result<()> {
        tx.status.set_phase(
            TransactionPhase::Failed,
            Some(Condition::new(ConditionType::Failed).with_message(message)),
        );
        self.write_status(deadline, tx)
    }

    /// Count a failed attempt on the transaction and hand the error back
    ///
    /// Conflicts and expired deadlines are not the transaction's fault; they
    /// are returned as-is without touching the status.
    fn record_failure(
        &self,
        deadline: &Deadline,
        tx: &mut Transaction,
        condition_type: ConditionType,
        reason: ConditionReason,
        err: Error,
    ) -> Error {
        if err.is_conflict() || err.is_deadline_exceeded() {
            return err;
        }

        warn!(transaction = tx.name(), "{:?} failure: {}", reason, err);
        tx.status.failures += 1;
        tx.status.set_condition(
            Condition::new(condition_type)
                .with_reason(reason)
                .with_message(err.to_string()),
        );
        if let Err(write_err) = self.write_status(deadline, tx) {
            warn!(
                transaction = tx.name(),
                "Failed to record failure on status: {}", write_err
            );
        }
        err
    }
}

fn describe(snapshot: &PackageSnapshot) -> String {
    if snapshot.version.is_empty() {
        snapshot.source.clone()
    } else {
        format!("{}@{}", snapshot.source, snapshot.version)
    }
}
