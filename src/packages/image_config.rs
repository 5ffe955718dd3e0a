// src/packages/image_config.rs

//! Repository rewriting through ImageConfig objects

use super::traits::{ArtifactFetcher, PackageArtifact};
use crate::db::models::{ImageConfigSpec, LockPackage};
use crate::db::{LabelSelector, ObjectStore, StoreExt};
use crate::error::{Result, ResultExt};
use tracing::debug;

/// A repository after image config rewriting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub repository: String,
    /// Names of the ImageConfigs that were applied
    pub applied: Vec<String>,
}

/// Rewrite `repository` using the ImageConfig with the longest matching prefix
///
/// Ties on prefix length go to the config whose name sorts first.
pub fn resolve_source(store: &dyn ObjectStore, repository: &str) -> Result<ResolvedSource> {
    let configs = store.list_objects::<ImageConfigSpec>(&LabelSelector::everything())?;

    let best = configs
        .iter()
        .filter(|c| !c.spec.match_prefix.is_empty())
        .filter(|c| repository.starts_with(&c.spec.match_prefix))
        .min_by(|a, b| {
            b.spec
                .match_prefix
                .len()
                .cmp(&a.spec.match_prefix.len())
                .then_with(|| a.name().cmp(b.name()))
        });

    match best {
        Some(config) => {
            let rewritten = format!(
                "{}{}",
                config.spec.rewrite_prefix,
                &repository[config.spec.match_prefix.len()..]
            );
            debug!(
                "ImageConfig {} rewrote {} to {}",
                config.name(),
                repository,
                rewritten
            );
            Ok(ResolvedSource {
                repository: rewritten,
                applied: vec![config.name().to_string()],
            })
        }
        None => Ok(ResolvedSource {
            repository: repository.to_string(),
            applied: Vec::new(),
        }),
    }
}

/// Fetch `repository:version` through any applicable ImageConfig
///
/// The returned artifact keeps the original repository as its source so lock
/// entries and package specs never carry mirror addresses.
pub fn fetch_resolved(
    store: &dyn ObjectStore,
    fetcher: &dyn ArtifactFetcher,
    repository: &str,
    version: &str,
) -> Result<(PackageArtifact, ResolvedSource)> {
    let resolved = resolve_source(store, repository)?;
    let mut artifact = fetcher
        .fetch(&resolved.repository, version)
        .with_context(|| format!("fetching {}:{}", resolved.repository, version))?;
    artifact.source = repository.to_string();
    Ok((artifact, resolved))
}

/// A proposed lock entry with its artifact fetched
#[derive(Debug, Clone)]
pub struct FetchedPackage {
    pub package: LockPackage,
    pub artifact: PackageArtifact,
    pub source: ResolvedSource,
}

/// Fetch the artifact for a lock entry
pub fn fetch_package(
    store: &dyn ObjectStore,
    fetcher: &dyn ArtifactFetcher,
    package: &LockPackage,
) -> Result<FetchedPackage> {
    let (artifact, source) = fetch_resolved(store, fetcher, &package.source, &package.version)?;
    Ok(FetchedPackage {
        package: package.clone(),
        artifact,
        source,
    })
}

/// Published versions of `repository`, listed through any applicable ImageConfig
pub fn resolved_versions(
    store: &dyn ObjectStore,
    fetcher: &dyn ArtifactFetcher,
    repository: &str,
) -> Result<Vec<String>> {
    let resolved = resolve_source(store, repository)?;
    fetcher
        .versions(&resolved.repository)
        .with_context(|| format!("listing versions of {}", resolved.repository))
}
