// src/installer/objects.rs

//! Payload object handoff between revisions

use super::{InstallContext, InstallStep};
use crate::db::models::{LABEL_PACKAGE, RevisionSpec};
use crate::db::{LabelSelector, ObjectStore, StoreExt};
use crate::error::Result;
use crate::establish::Establisher;
use std::sync::Arc;
use tracing::debug;

/// Releases control of objects held by the package's inactive revisions
pub struct ObjectReleaser {
    store: Arc<dyn ObjectStore>,
    establisher: Arc<dyn Establisher>,
}

impl ObjectReleaser {
    pub fn new(store: Arc<dyn ObjectStore>, establisher: Arc<dyn Establisher>) -> Self {
        Self { store, establisher }
    }
}

impl InstallStep for ObjectReleaser {
    fn name(&self) -> &str {
        "object-releaser"
    }

    fn run(&self, ctx: &mut InstallContext<'_>) -> Result<()> {
        let package = ctx.package()?.name().to_string();
        let selector = LabelSelector::everything().with(LABEL_PACKAGE, &package);

        for revision in self.store.list_objects::<RevisionSpec>(&selector)? {
            if revision.is_active() {
                continue;
            }
            debug!("Releasing objects of inactive revision {}", revision.name());
            self.establisher.release_objects(ctx.deadline, &revision)?;
        }
        Ok(())
    }
}

/// Establishes the target revision's payload objects
///
/// An active revision takes control; an inactive one only registers as an
/// owner. The resulting references are recorded on the revision status.
pub struct ObjectInstaller {
    store: Arc<dyn ObjectStore>,
    establisher: Arc<dyn Establisher>,
}

impl ObjectInstaller {
    pub fn new(store: Arc<dyn ObjectStore>, establisher: Arc<dyn Establisher>) -> Self {
        Self { store, establisher }
    }
}

impl InstallStep for ObjectInstaller {
    fn name(&self) -> &str {
        "object-installer"
    }

    fn run(&self, ctx: &mut InstallContext<'_>) -> Result<()> {
        let name = ctx.revision()?.name().to_string();
        let mut revision = self.store.get_object::<RevisionSpec>(&name)?;

        let refs = self.establisher.establish(
            ctx.deadline,
            &ctx.fetched.artifact.objects,
            &revision,
            revision.is_active(),
        )?;

        if revision.status.object_refs != refs {
            revision.status.object_refs = refs;
            revision = self.store.update_object_status(&revision)?;
        }
        ctx.revision = Some(revision);
        Ok(())
    }
}
