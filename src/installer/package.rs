// src/installer/package.rs

//! Package creation and status steps

use super::{InstallContext, InstallDefaults, InstallStep};
use crate::db::models::{
    ActivationPolicy, DesiredState, LABEL_PACKAGE, LABEL_TRANSACTION_GENERATION,
    LABEL_TRANSACTION_NAME, Package, PackageSpec, RevisionSpec,
};
use crate::db::{LabelSelector, ObjectStore, StoreExt};
use crate::error::Result;
use std::sync::Arc;
use tracing::{debug, info};

/// Find the Package installed from `repository`, whatever its name
pub(crate) fn find_by_repository(
    store: &dyn ObjectStore,
    repository: &str,
) -> Result<Option<Package>> {
    let packages = store.list_objects::<PackageSpec>(&LabelSelector::everything())?;
    Ok(packages.into_iter().find(|p| {
        p.spec
            .source_ref()
            .is_ok_and(|source| source.repository == repository)
    }))
}

/// Creates the Package, or points an existing one at the new source
pub struct PackageCreator {
    store: Arc<dyn ObjectStore>,
    defaults: InstallDefaults,
}

impl PackageCreator {
    pub fn new(store: Arc<dyn ObjectStore>, defaults: InstallDefaults) -> Self {
        Self { store, defaults }
    }
}

impl InstallStep for PackageCreator {
    fn name(&self) -> &str {
        "package-creator"
    }

    fn run(&self, ctx: &mut InstallContext<'_>) -> Result<()> {
        let lock_pkg = &ctx.fetched.package;
        let source = lock_pkg.reference();
        let tx = ctx.transaction;

        let existing = find_by_repository(self.store.as_ref(), &lock_pkg.source)?;
        let package = match existing {
            Some(pkg) if pkg.spec.source == source => {
                debug!("Package {} already at {}", pkg.name(), source);
                pkg
            }
            Some(mut pkg) => {
                info!(
                    "Updating package {} from {} to {}",
                    pkg.name(),
                    pkg.spec.source,
                    source
                );
                pkg.spec.source = source;
                pkg.spec.package_type = lock_pkg.package_type;
                pkg.metadata
                    .labels
                    .insert(LABEL_TRANSACTION_NAME.to_string(), tx.name().to_string());
                pkg.metadata.labels.insert(
                    LABEL_TRANSACTION_GENERATION.to_string(),
                    tx.metadata.generation.to_string(),
                );
                self.store.update_object(&pkg)?
            }
            None => {
                info!("Creating package {} from {}", lock_pkg.name, source);
                let mut pkg = Package::new(
                    &lock_pkg.name,
                    PackageSpec {
                        package_type: lock_pkg.package_type,
                        source,
                        revision_history_limit: self.defaults.revision_history_limit,
                        activation_policy: ActivationPolicy::Automatic,
                    },
                );
                pkg.metadata
                    .labels
                    .insert(LABEL_TRANSACTION_NAME.to_string(), tx.name().to_string());
                pkg.metadata.labels.insert(
                    LABEL_TRANSACTION_GENERATION.to_string(),
                    tx.metadata.generation.to_string(),
                );
                self.store.create_object(&pkg)?
            }
        };

        ctx.package = Some(package);
        Ok(())
    }
}

/// Records resolution facts on the Package status
///
/// Health is never aggregated here; only what the installation decided.
pub struct PackageStatusUpdater {
    store: Arc<dyn ObjectStore>,
}

impl PackageStatusUpdater {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

impl InstallStep for PackageStatusUpdater {
    fn name(&self) -> &str {
        "package-status-updater"
    }

    fn run(&self, ctx: &mut InstallContext<'_>) -> Result<()> {
        let name = ctx.package()?.name().to_string();
        let mut package = self.store.get_object::<PackageSpec>(&name)?;

        let selector = LabelSelector::everything().with(LABEL_PACKAGE, &name);
        let current_revision = self
            .store
            .list_objects::<RevisionSpec>(&selector)?
            .into_iter()
            .find(|r| r.spec.desired_state == DesiredState::Active)
            .map(|r| r.name().to_string());

        let mut status = package.status.clone();
        status.resolved_source = Some(format!(
            "{}:{}",
            ctx.fetched.source.repository, ctx.fetched.package.version
        ));
        status.applied_image_config_refs = ctx.fetched.source.applied.clone();
        status.current_revision = current_revision;

        if status != package.status {
            package.status = status;
            package = self.store.update_object_status(&package)?;
        }
        ctx.package = Some(package);
        Ok(())
    }
}
