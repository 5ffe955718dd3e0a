// src/installer/revision.rs

//! Revision lifecycle: creation, activation, numbering and garbage collection
//!
//! Invariants maintained by [`RevisionCreator`]:
//! - at most one revision of a package is Active, and every other active
//!   revision is deactivated before the target is created or activated
//! - revision numbers only grow: a new revision gets max + 1, and so does an
//!   older revision being reinstated (a revert)
//! - at most `revision_history_limit` inactive revisions are kept, lowest
//!   numbers deleted first (a limit of 0 keeps everything)

use super::{InstallContext, InstallStep};
use crate::db::models::{
    ActivationPolicy, DesiredState, LABEL_PACKAGE, PackageRevision, RevisionSpec,
};
use crate::db::{LabelSelector, ObjectStore, StoreExt};
use crate::error::Result;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

/// Deterministic revision name for a package source
///
/// The same `repository:version` always maps to the same revision, so a
/// reinstall finds and reuses it.
pub fn revision_name(package: &str, source: &str) -> String {
    let digest = hex::encode(Sha256::digest(source.as_bytes()));
    format!("{}-{}", package, &digest[..12])
}

fn package_selector(package: &str) -> LabelSelector {
    LabelSelector::everything().with(LABEL_PACKAGE, package)
}

pub struct RevisionCreator {
    store: Arc<dyn ObjectStore>,
}

impl RevisionCreator {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Delete the oldest inactive revisions beyond the history limit
    fn collect_garbage(&self, package: &str, keep: &str, limit: u32) -> Result<()> {
        if limit == 0 {
            return Ok(());
        }

        let mut inactive: Vec<PackageRevision> = self
            .store
            .list_objects::<RevisionSpec>(&package_selector(package))?
            .into_iter()
            .filter(|r| r.name() != keep && !r.is_active())
            .collect();
        let limit = limit as usize;
        if inactive.len() <= limit {
            return Ok(());
        }

        inactive.sort_by_key(|r| r.spec.revision);
        let excess = inactive.len() - limit;
        for revision in inactive.into_iter().take(excess) {
            match self.store.delete_object::<RevisionSpec>(revision.name()) {
                Ok(()) => info!(
                    "Garbage collected revision {} ({}) of package {}",
                    revision.name(),
                    revision.spec.revision,
                    package
                ),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl InstallStep for RevisionCreator {
    fn name(&self) -> &str {
        "revision-creator"
    }

    fn run(&self, ctx: &mut InstallContext<'_>) -> Result<()> {
        let package = ctx.package()?.clone();
        let target_name = revision_name(package.name(), &package.spec.source);
        let revisions = self
            .store
            .list_objects::<RevisionSpec>(&package_selector(package.name()))?;

        let existing = revisions.iter().find(|r| r.name() == target_name).cloned();
        let others_active: Vec<&PackageRevision> = revisions
            .iter()
            .filter(|r| r.name() != target_name && r.is_active())
            .collect();

        let activate = match package.spec.activation_policy {
            ActivationPolicy::Automatic => true,
            ActivationPolicy::Manual => {
                existing.as_ref().is_some_and(|r| r.is_active()) || others_active.is_empty()
            }
        };
        let desired_state = if activate {
            DesiredState::Active
        } else {
            DesiredState::Inactive
        };

        if activate {
            for other in others_active {
                ctx.deadline.check("deactivating revisions")?;
                let mut other = other.clone();
                other.spec.desired_state = DesiredState::Inactive;
                self.store.update_object(&other)?;
                info!(
                    "Deactivated revision {} ({}) of package {}",
                    other.name(),
                    other.spec.revision,
                    package.name()
                );
            }
        }

        let max = revisions.iter().map(|r| r.spec.revision).max().unwrap_or(0);

        let target = match existing {
            Some(mut revision) => {
                let mut changed = false;
                if revision.spec.revision != max {
                    debug!(
                        "Revision {} reinstated, renumbering {} to {}",
                        revision.name(),
                        revision.spec.revision,
                        max + 1
                    );
                    revision.spec.revision = max + 1;
                    changed = true;
                }
                if revision.spec.desired_state != desired_state {
                    revision.spec.desired_state = desired_state;
                    changed = true;
                }
                if changed {
                    // Only the transaction that changed the revision owns it
                    revision
                        .metadata
                        .set_owner(ctx.transaction.owner_reference(false));
                    ctx.deadline.check("updating revision")?;
                    self.store.update_object(&revision)?
                } else {
                    revision
                }
            }
            None => {
                let spec = RevisionSpec {
                    package_type: package.spec.package_type,
                    package: package.name().to_string(),
                    source: package.spec.source.clone(),
                    revision: max + 1,
                    desired_state,
                };
                let mut revision = PackageRevision::new(&target_name, spec);
                revision
                    .metadata
                    .labels
                    .insert(LABEL_PACKAGE.to_string(), package.name().to_string());
                revision.metadata.set_owner(package.owner_reference(true));
                revision
                    .metadata
                    .set_owner(ctx.transaction.owner_reference(false));

                ctx.deadline.check("creating revision")?;
                let created = self.store.create_object(&revision)?;
                info!(
                    "Created revision {} ({}) of package {}",
                    created.name(),
                    created.spec.revision,
                    package.name()
                );
                created
            }
        };

        if !activate {
            info!(
                "Package {} uses manual activation; revision {} left inactive",
                package.name(),
                target.name()
            );
        }

        self.collect_garbage(
            package.name(),
            target.name(),
            package.spec.revision_history_limit,
        )?;

        ctx.revision = Some(target);
        Ok(())
    }
}

/// Records resolution facts on the target revision's status
pub struct RevisionStatusUpdater {
    store: Arc<dyn ObjectStore>,
}

impl RevisionStatusUpdater {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

impl InstallStep for RevisionStatusUpdater {
    fn name(&self) -> &str {
        "revision-status-updater"
    }

    fn run(&self, ctx: &mut InstallContext<'_>) -> Result<()> {
        let name = ctx.revision()?.name().to_string();
        let mut revision = self.store.get_object::<RevisionSpec>(&name)?;

        let mut status = revision.status.clone();
        status.resolved_source = Some(format!(
            "{}:{}",
            ctx.fetched.source.repository, ctx.fetched.package.version
        ));
        status.applied_image_config_refs = ctx.fetched.source.applied.clone();

        if status != revision.status {
            revision.status = status;
            revision = self.store.update_object_status(&revision)?;
        }
        ctx.revision = Some(revision);
        Ok(())
    }
}
