// src/db/models/mod.rs

//! Persisted resource kinds
//!
//! Each kind is a spec type implementing [`crate::db::Kind`]; the full stored
//! object is `Object<Spec>`, aliased here to the resource's name.

mod image_config;
mod lock;
mod package;
mod revision;
mod transaction;

pub use image_config::{ImageConfig, ImageConfigSpec};
pub use lock::{
    Dependency, Lock, LockPackage, LockSpec, LockStatus, PackageType, LOCK_NAME,
    LOCK_OWNER_ANNOTATION,
};
pub use package::{
    ActivationPolicy, Package, PackageSpec, PackageStatus, SourceRef, LABEL_PACKAGE,
    LABEL_TRANSACTION_GENERATION, LABEL_TRANSACTION_NAME,
};
pub use revision::{DesiredState, ObjectRef, PackageRevision, RevisionSpec, RevisionStatus};
pub use transaction::{
    ChangeType, Condition, ConditionReason, ConditionType, InstallSpec, PackageSnapshot,
    Transaction, TransactionPhase, TransactionSpec, TransactionStatus, DEFAULT_RETRY_LIMIT,
};
