// tests/transaction.rs

//! End-to-end transaction reconciliation tests.

mod common;

use common::{Harness, lock_package};
use lockstep::db::models::{ConditionType, RevisionSpec, TransactionPhase};
use lockstep::db::{LabelSelector, StoreExt};
use lockstep::installer::{InstallContext, InstallStep, revision_name};
use lockstep::packages::ArtifactBuilder;
use lockstep::{Error, LockManager, ReconcileOutcome};
use parking_lot::Mutex;
use std::sync::Arc;

/// Records the order packages reach the end of the pipeline
struct OrderRecorder(Arc<Mutex<Vec<String>>>);

impl InstallStep for OrderRecorder {
    fn name(&self) -> &str {
        "order-recorder"
    }

    fn run(&self, ctx: &mut InstallContext<'_>) -> lockstep::Result<()> {
        self.0.lock().push(ctx.fetched.package.source.clone());
        Ok(())
    }
}

/// Fails every run with a store conflict, noting the transaction version it saw
struct ConflictingStep(Arc<Mutex<Vec<u64>>>);

impl InstallStep for ConflictingStep {
    fn name(&self) -> &str {
        "conflicting"
    }

    fn run(&self, ctx: &mut InstallContext<'_>) -> lockstep::Result<()> {
        self.0.lock().push(ctx.transaction.metadata.resource_version);
        Err(Error::conflict("Package", ctx.fetched.package.name.clone(), "changed underneath"))
    }
}

/// Refuses to install one source, recording every source it reaches
struct RefusingStep {
    refuse: &'static str,
    reached: Arc<Mutex<Vec<String>>>,
}

impl InstallStep for RefusingStep {
    fn name(&self) -> &str {
        "refusing"
    }

    fn run(&self, ctx: &mut InstallContext<'_>) -> lockstep::Result<()> {
        let source = ctx.fetched.package.source.clone();
        self.reached.lock().push(source.clone());
        if source == self.refuse {
            return Err(Error::OwnershipConflict(format!("{source} objects are taken")));
        }
        Ok(())
    }
}

fn publish_a_and_b(h: &Harness) {
    h.fetcher.publish(
        ArtifactBuilder::new("acme/a", "a", "v1.0.0")
            .depends_on("acme/b", ">=1.0.0")
            .object("CustomResourceDefinition", "widgets.acme.io")
            .build(),
    );
    h.fetcher.publish(
        ArtifactBuilder::new("acme/b", "b", "1.2.0")
            .object("CustomResourceDefinition", "gadgets.acme.io")
            .build(),
    );
}

#[test]
fn test_install_waits_for_missing_dependency() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let h = Harness::with_extra_step(
        Arc::new(lockstep::db::MemoryStore::new()),
        Some(Box::new(OrderRecorder(order.clone()))),
    );
    publish_a_and_b(&h);
    h.submit_install("install-a", "acme/a", "v1.0.0", 5);

    // Nothing installed yet: B is missing
    let err = h.reconciler.reconcile("install-a").unwrap_err();
    assert!(matches!(err.root(), Error::MissingDependencies(deps) if deps == &["acme/b"]));
    assert!(err.to_string().to_lowercase().contains("missing dependenc"));

    let tx = h.transaction("install-a");
    assert_eq!(tx.status.failures, 1);
    assert_eq!(tx.status.phase, TransactionPhase::Running);
    assert!(tx.status.condition(ConditionType::ResolutionError).is_some());
    assert!(order.lock().is_empty());

    // With B in the lock the same transaction goes through
    h.seed_lock(vec![lock_package("acme/b", "1.2.0", &[])]);
    let outcome = h.reconciler.reconcile("install-a").unwrap();
    assert_eq!(outcome, ReconcileOutcome::done());

    let tx = h.transaction("install-a");
    assert_eq!(tx.status.phase, TransactionPhase::Complete);
    assert!(tx.status.condition(ConditionType::ResolutionSuccess).is_some());
    assert!(tx.status.condition(ConditionType::ValidationSuccess).is_some());
    assert!(tx.status.condition(ConditionType::InstallationSuccess).is_some());
    assert!(tx.status.condition(ConditionType::ResolutionError).is_none());

    let proposed: Vec<&str> = tx
        .status
        .proposed_lock_packages
        .iter()
        .map(|p| p.source.as_str())
        .collect();
    assert_eq!(proposed, vec!["acme/b", "acme/a"]);

    // Dependencies are installed first
    assert_eq!(*order.lock(), vec!["acme/b".to_string(), "acme/a".to_string()]);

    let locked = h.locked_packages();
    assert_eq!(locked.len(), 2);
    assert_eq!(locked[1].source, "acme/a");
    assert_eq!(locked[1].version, "v1.0.0");
    assert_eq!(locked[1].dependencies[0].package, "acme/b");

    let lock = LockManager::new(h.store.clone()).current().unwrap().unwrap();
    assert_eq!(lock.holder(), None);
}

#[test]
fn test_validation_failures_exhaust_retry_limit() {
    let h = Harness::in_memory();
    h.fetcher.publish(
        ArtifactBuilder::new("acme/a", "a", "v1.0.0")
            .platform(">=2.0.0")
            .build(),
    );
    h.submit_install("install-a", "acme/a", "v1.0.0", 2);

    for attempt in 1..=2 {
        let err = h.reconciler.reconcile("install-a").unwrap_err();
        assert!(err.to_string().contains("platform"));
        let tx = h.transaction("install-a");
        assert_eq!(tx.status.failures, attempt);
        assert!(tx.status.condition(ConditionType::ValidationError).is_some());
    }

    let outcome = h.reconciler.reconcile("install-a").unwrap();
    assert_eq!(outcome, ReconcileOutcome::done());
    let tx = h.transaction("install-a");
    assert_eq!(tx.status.phase, TransactionPhase::Failed);
    assert_eq!(tx.status.failures, 2);

    // Nothing was installed or committed
    assert!(h.store.list("Package", &LabelSelector::everything()).unwrap().is_empty());
    assert!(h.locked_packages().is_empty());

    // Terminal: further passes change nothing
    h.reconciler.reconcile("install-a").unwrap();
    assert_eq!(h.transaction("install-a").metadata.resource_version, tx.metadata.resource_version);
}

#[test]
fn test_unsatisfied_constraints_are_all_reported() {
    let h = Harness::in_memory();
    h.fetcher.publish(
        ArtifactBuilder::new("acme/a", "a", "v1.0.0")
            .depends_on("acme/b", ">=2.0.0")
            .depends_on("acme/c", ">=1.0.0")
            .build(),
    );
    h.seed_lock(vec![
        lock_package("acme/b", "1.2.0", &[]),
        lock_package("acme/c", "0.9.0", &[]),
    ]);
    h.submit_install("install-a", "acme/a", "v1.0.0", 5);

    let err = h.reconciler.reconcile("install-a").unwrap_err();
    match err.root() {
        Error::UnsatisfiedConstraints(conflicts) => {
            let packages: Vec<&str> = conflicts.iter().map(|c| c.package()).collect();
            assert_eq!(packages, vec!["acme/b", "acme/c"]);
        }
        other => panic!("expected unsatisfied constraints, got {other}"),
    }
    // The lock is untouched
    assert_eq!(h.locked_packages().len(), 2);
}

#[test]
fn test_blocked_transaction_completes_after_holder_releases() {
    let h = Harness::in_memory();
    h.fetcher.publish(ArtifactBuilder::new("acme/a", "a", "v1.0.0").build());
    h.submit_install("install-a", "acme/a", "v1.0.0", 5);

    let locks = LockManager::new(h.store.clone());
    locks.acquire("someone-else").unwrap();

    let outcome = h.reconciler.reconcile("install-a").unwrap();
    assert!(outcome.requeue_after.is_some());
    let tx = h.transaction("install-a");
    assert_eq!(tx.status.phase, TransactionPhase::Blocked);
    assert_eq!(tx.status.failures, 0);

    locks.release("someone-else").unwrap();
    assert_eq!(h.reconciler.reconcile("install-a").unwrap(), ReconcileOutcome::done());
    let tx = h.transaction("install-a");
    assert_eq!(tx.status.phase, TransactionPhase::Complete);
    assert!(tx.status.condition(ConditionType::Blocked).is_none());
}

#[test]
fn test_constraint_selects_highest_published_version() {
    let h = Harness::in_memory();
    for version in ["1.0.0", "1.4.0", "2.0.0"] {
        h.fetcher.publish(ArtifactBuilder::new("acme/a", "a", version).build());
    }
    h.submit_install("install-a", "acme/a", ">=1.0.0, <2.0.0", 5);

    h.reconciler.reconcile("install-a").unwrap();
    let locked = h.locked_packages();
    assert_eq!(locked.len(), 1);
    assert_eq!(locked[0].version, "1.4.0");
}

#[test]
fn test_upgrade_hands_objects_to_new_revision() {
    let h = Harness::in_memory();
    for version in ["v1.0.0", "v2.0.0"] {
        h.fetcher.publish(
            ArtifactBuilder::new("acme/a", "a", version)
                .object("CustomResourceDefinition", "widgets.acme.io")
                .build(),
        );
    }

    h.submit_install("install-a-v1", "acme/a", "v1.0.0", 5);
    h.reconciler.reconcile("install-a-v1").unwrap();
    h.submit_install("install-a-v2", "acme/a", "v2.0.0", 5);
    h.reconciler.reconcile("install-a-v2").unwrap();
    assert_eq!(h.transaction("install-a-v2").status.phase, TransactionPhase::Complete);

    let crd = h
        .store
        .get("CustomResourceDefinition", "widgets.acme.io")
        .unwrap()
        .unwrap();
    let controller = crd.metadata.controller().unwrap();
    assert_eq!(controller.name, revision_name("a", "acme/a:v2.0.0"));

    let active: Vec<_> = h
        .store
        .list_objects::<RevisionSpec>(&LabelSelector::everything())
        .unwrap()
        .into_iter()
        .filter(|r| r.is_active())
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].status.object_refs.len(), 1);
    assert_eq!(h.locked_packages()[0].version, "v2.0.0");
}

#[test]
fn test_install_on_sqlite_store() {
    let (_temp_dir, h) = Harness::sqlite();
    publish_a_and_b(&h);
    h.seed_lock(vec![lock_package("acme/b", "1.2.0", &[])]);
    h.submit_install("install-a", "acme/a", "v1.0.0", 5);

    assert_eq!(h.reconciler.reconcile("install-a").unwrap(), ReconcileOutcome::done());
    assert_eq!(h.transaction("install-a").status.phase, TransactionPhase::Complete);
    assert_eq!(h.locked_packages().len(), 2);

    // Runtime prerequisites exist for the provider packages
    assert!(h.store.get("ServiceAccount", "a").unwrap().is_some());
    assert!(h.store.get("Secret", "a-tls").unwrap().is_some());
}

#[test]
fn test_install_conflict_is_returned_without_status_write() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let h = Harness::with_extra_step(
        Arc::new(lockstep::db::MemoryStore::new()),
        Some(Box::new(ConflictingStep(seen.clone()))),
    );
    h.fetcher.publish(ArtifactBuilder::new("acme/a", "a", "v1.0.0").build());
    h.submit_install("install-a", "acme/a", "v1.0.0", 5);

    let err = h.reconciler.reconcile("install-a").unwrap_err();
    assert!(err.is_conflict(), "unexpected error: {err}");

    // The step was retried, then the pass gave up without touching the status
    let seen = seen.lock().clone();
    assert!(!seen.is_empty());
    let tx = h.transaction("install-a");
    assert_eq!(tx.metadata.resource_version, seen[seen.len() - 1]);
    assert_eq!(tx.status.failures, 0);
    assert_eq!(tx.status.phase, TransactionPhase::Running);
    assert!(tx.status.condition(ConditionType::InstallationError).is_none());

    let lock = LockManager::new(h.store.clone()).current().unwrap().unwrap();
    assert_eq!(lock.holder(), None);
    assert!(lock.spec.packages.is_empty());
}

#[test]
fn test_installation_failure_stops_and_leaves_lock_uncommitted() {
    let reached = Arc::new(Mutex::new(Vec::new()));
    let h = Harness::with_extra_step(
        Arc::new(lockstep::db::MemoryStore::new()),
        Some(Box::new(RefusingStep {
            refuse: "acme/b",
            reached: reached.clone(),
        })),
    );
    publish_a_and_b(&h);
    h.seed_lock(vec![lock_package("acme/b", "1.2.0", &[])]);
    h.submit_install("install-a", "acme/a", "v1.0.0", 5);

    let err = h.reconciler.reconcile("install-a").unwrap_err();
    assert!(matches!(err.root(), Error::OwnershipConflict(_)));

    // b is installed first and its failure stops the transaction before a
    assert_eq!(*reached.lock(), vec!["acme/b".to_string()]);

    let tx = h.transaction("install-a");
    assert_eq!(tx.status.failures, 1);
    assert_eq!(tx.status.phase, TransactionPhase::Running);
    let condition = tx.status.condition(ConditionType::InstallationError).unwrap();
    assert!(condition.message.as_deref().unwrap_or_default().contains("acme/b"));
    assert!(tx.status.condition(ConditionType::InstallationSuccess).is_none());

    let lock = LockManager::new(h.store.clone()).current().unwrap().unwrap();
    assert_eq!(lock.holder(), None);
    let locked: Vec<&str> = lock.spec.packages.iter().map(|p| p.source.as_str()).collect();
    assert_eq!(locked, vec!["acme/b"]);
}
