// src/packages/directory.rs

//! Artifact catalog backed by a directory tree
//!
//! Layout: `<root>/<repository path>/<version>/package.toml`, where the
//! repository path is the repository string split on `/`. The manifest is the
//! TOML form of [`PackageArtifact`] minus `source`, which is filled in from
//! the requested repository:
//!
//! ```toml
//! [metadata]
//! name = "provider-a"
//! type = "Provider"
//! platform_constraint = ">=1.14"
//!
//! [[metadata.dependencies]]
//! package = "registry.example.io/acme/provider-b"
//! constraints = ">=1.0.0"
//!
//! [[objects]]
//! api_version = "apiextensions.lockstep.dev/v1"
//! kind = "CustomResourceDefinition"
//! name = "widgets.acme.io"
//! ```

use super::traits::{ArtifactFetcher, PackageArtifact};
use crate::error::{Error, Result, ResultExt};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Manifest file name inside a version directory
pub const MANIFEST_FILE: &str = "package.toml";

pub struct DirectoryFetcher {
    root: PathBuf,
}

impl DirectoryFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map an untrusted repository (and optional version) into the catalog
    fn catalog_path(&self, repository: &str, version: Option<&str>) -> Result<PathBuf> {
        let mut path = self.root.clone();
        let segments = repository
            .split('/')
            .chain(version)
            .filter(|segment| !segment.is_empty());

        let mut pushed = false;
        for segment in segments {
            let mut components = Path::new(segment).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(c)), None) => {
                    path.push(c);
                    pushed = true;
                }
                _ => {
                    return Err(Error::ParseError(format!(
                        "Invalid path segment {segment:?} in repository {repository:?}"
                    )));
                }
            }
        }

        if !pushed {
            return Err(Error::ParseError("Empty repository".to_string()));
        }
        Ok(path)
    }
}

impl ArtifactFetcher for DirectoryFetcher {
    fn fetch(&self, repository: &str, version: &str) -> Result<PackageArtifact> {
        let manifest = self
            .catalog_path(repository, Some(version))?
            .join(MANIFEST_FILE);
        if !manifest.is_file() {
            return Err(Error::not_found(
                "PackageArtifact",
                format!("{repository}:{version}"),
            ));
        }

        debug!("Reading package manifest {}", manifest.display());
        let content = fs::read_to_string(&manifest)?;
        let mut artifact: PackageArtifact = toml::from_str(&content)
            .with_context(|| format!("parsing {}", manifest.display()))?;

        artifact.source = repository.to_string();
        if artifact.metadata.version.is_empty() {
            artifact.metadata.version = version.to_string();
        }
        Ok(artifact)
    }

    fn versions(&self, repository: &str) -> Result<Vec<String>> {
        let dir = self.catalog_path(repository, None)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut versions = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.path().join(MANIFEST_FILE).is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                versions.push(name.to_string());
            }
        }
        versions.sort();
        Ok(versions)
    }
}
