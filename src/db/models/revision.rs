// src/db/models/revision.rs

//! PackageRevision model - an immutable, versioned incarnation of a package

use super::lock::PackageType;
use crate::db::{Kind, Object};
use serde::{Deserialize, Serialize};

/// Whether a revision should be serving
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DesiredState {
    Active,
    #[default]
    Inactive,
}

/// Reference to an object a revision has established
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub uid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionSpec {
    #[serde(rename = "type", default)]
    pub package_type: PackageType,
    /// Name of the owning package
    pub package: String,
    /// `repository:version` this revision was built from
    pub source: String,
    /// Monotonic revision number within the package
    pub revision: u64,
    #[serde(default)]
    pub desired_state: DesiredState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionStatus {
    #[serde(default)]
    pub object_refs: Vec<ObjectRef>,
    #[serde(default)]
    pub resolved_source: Option<String>,
    #[serde(default)]
    pub applied_image_config_refs: Vec<String>,
}

impl Kind for RevisionSpec {
    const KIND: &'static str = "PackageRevision";
    type Status = RevisionStatus;
}

pub type PackageRevision = Object<RevisionSpec>;

impl PackageRevision {
    pub fn is_active(&self) -> bool {
        self.spec.desired_state == DesiredState::Active
    }
}
