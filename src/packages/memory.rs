// src/packages/memory.rs

//! In-memory artifact catalog

use super::traits::{ArtifactFetcher, ArtifactMeta, PackageArtifact, PayloadObject};
use crate::db::models::{Dependency, PackageType};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Artifacts keyed by repository, then version
#[derive(Default)]
pub struct MemoryFetcher {
    artifacts: RwLock<BTreeMap<String, BTreeMap<String, PackageArtifact>>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an artifact under its own source and version
    pub fn publish(&self, artifact: PackageArtifact) {
        self.artifacts
            .write()
            .entry(artifact.source.clone())
            .or_default()
            .insert(artifact.metadata.version.clone(), artifact);
    }
}

impl ArtifactFetcher for MemoryFetcher {
    fn fetch(&self, repository: &str, version: &str) -> Result<PackageArtifact> {
        self.artifacts
            .read()
            .get(repository)
            .and_then(|versions| versions.get(version))
            .cloned()
            .ok_or_else(|| Error::not_found("PackageArtifact", format!("{repository}:{version}")))
    }

    fn versions(&self, repository: &str) -> Result<Vec<String>> {
        Ok(self
            .artifacts
            .read()
            .get(repository)
            .map(|versions| versions.keys().cloned().collect())
            .unwrap_or_default())
    }
}

/// Builder for artifacts, mostly used by tests and fixtures
pub struct ArtifactBuilder {
    artifact: PackageArtifact,
}

impl ArtifactBuilder {
    pub fn new(source: &str, name: &str, version: &str) -> Self {
        Self {
            artifact: PackageArtifact {
                source: source.to_string(),
                metadata: ArtifactMeta {
                    name: name.to_string(),
                    package_type: PackageType::Provider,
                    version: version.to_string(),
                    dependencies: Vec::new(),
                    platform_constraint: None,
                },
                objects: Vec::new(),
            },
        }
    }

    pub fn package_type(mut self, package_type: PackageType) -> Self {
        self.artifact.metadata.package_type = package_type;
        self
    }

    pub fn depends_on(mut self, package: &str, constraints: &str) -> Self {
        self.artifact
            .metadata
            .dependencies
            .push(Dependency::new(package, constraints));
        self
    }

    pub fn platform(mut self, constraint: &str) -> Self {
        self.artifact.metadata.platform_constraint = Some(constraint.to_string());
        self
    }

    pub fn object(mut self, kind: &str, name: &str) -> Self {
        self.artifact.objects.push(PayloadObject {
            api_version: "apiextensions.lockstep.dev/v1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            spec: serde_json::json!({}),
        });
        self
    }

    pub fn build(self) -> PackageArtifact {
        self.artifact
    }
}
