// src/packages/traits.rs

//! Package artifact types and the fetcher trait

use crate::db::models::{Dependency, LockPackage, PackageType};
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Package metadata declared by the artifact itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub name: String,
    #[serde(rename = "type", default)]
    pub package_type: PackageType,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Constraint on the host platform version
    #[serde(default)]
    pub platform_constraint: Option<String>,
}

/// An object shipped in a package payload (API type definition, webhook...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadObject {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub spec: serde_json::Value,
}

/// A fetched package: metadata plus payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageArtifact {
    /// Repository the artifact was requested as (before rewriting)
    #[serde(default)]
    pub source: String,
    pub metadata: ArtifactMeta,
    #[serde(default)]
    pub objects: Vec<PayloadObject>,
}

impl PackageArtifact {
    /// The lock entry describing this artifact
    pub fn to_lock_package(&self) -> LockPackage {
        LockPackage {
            name: self.metadata.name.clone(),
            package_type: self.metadata.package_type,
            source: self.source.clone(),
            version: self.metadata.version.clone(),
            dependencies: self.metadata.dependencies.clone(),
        }
    }

    pub fn reference(&self) -> String {
        format!("{}:{}", self.source, self.metadata.version)
    }
}

/// Source of package artifacts
pub trait ArtifactFetcher: Send + Sync {
    /// Fetch the artifact published at `repository` with tag `version`
    fn fetch(&self, repository: &str, version: &str) -> Result<PackageArtifact>;

    /// All versions published for `repository`
    fn versions(&self, repository: &str) -> Result<Vec<String>>;
}
