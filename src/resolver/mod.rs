// src/resolver/mod.rs

//! Dependency resolution and conflict detection
//!
//! The solver decides the full set of packages a transaction would leave
//! installed: the current lock, with the target package added or moved to
//! its selected version. It never writes anything; the proposed set is
//! committed by the lock manager once installation succeeds.
//!
//! Resolution proceeds in three checks, each failing the solve:
//! 1. every dependency the target needs is installed (missing dependencies
//!    are reported, never installed implicitly)
//! 2. the target's direct dependencies satisfy their constraints (all
//!    violations are collected into one error)
//! 3. the result can be ordered, checked later by [`DependencyGraph::sort`]

pub mod conflict;
pub mod graph;

pub use conflict::Conflict;
pub use graph::{DependencyGraph, Node};

use crate::db::ObjectStore;
use crate::db::models::{LockPackage, PackageSnapshot, SourceRef};
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::packages::{ArtifactFetcher, fetch_resolved, resolved_versions};
use crate::version::{Constraint, Version};
use std::sync::Arc;
use tracing::{debug, info};

/// Resolves a target package against the installed set
pub struct DependencySolver {
    store: Arc<dyn ObjectStore>,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl DependencySolver {
    pub fn new(store: Arc<dyn ObjectStore>, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self { store, fetcher }
    }

    /// Produce the proposed lock contents for installing `target`
    ///
    /// Unchanged packages from `current` are included, in their original
    /// order, with the target replacing its previous entry or appended.
    pub fn solve(
        &self,
        deadline: &Deadline,
        target: &PackageSnapshot,
        current: &[LockPackage],
    ) -> Result<Vec<LockPackage>> {
        let (repository, requested) = split_target(target)?;
        let locked = current.iter().find(|p| p.source == repository);

        let version = self.select_version(deadline, &repository, &requested, locked)?;

        deadline.check("fetching package artifact")?;
        let (artifact, _) =
            fetch_resolved(self.store.as_ref(), self.fetcher.as_ref(), &repository, &version)?;
        let mut target_pkg = artifact.to_lock_package();
        target_pkg.version = version;
        if !target.name.is_empty() {
            target_pkg.name = target.name.clone();
        }

        let mut graph = DependencyGraph::new();
        graph.init(current);

        let is_new = graph
            .get_node(&repository)
            .map(|node| node.is_implied())
            .unwrap_or(true);
        graph.add_or_update_nodes([Node::from(target_pkg.clone())]);

        let missing: Vec<String> = if is_new {
            // Only direct dependencies; each one is checked again when it
            // is itself installed
            graph
                .dependencies_of(&repository)
                .into_iter()
                .filter(|dep| graph.get_node(dep).map(Node::is_implied).unwrap_or(true))
                .map(str::to_string)
                .collect()
        } else {
            graph
                .trace_node(&repository)?
                .into_iter()
                .filter(|dep| graph.get_node(dep).map(Node::is_implied).unwrap_or(true))
                .collect()
        };
        if !missing.is_empty() {
            return Err(Error::MissingDependencies(missing));
        }

        let conflicts = check_constraints(&graph, &target_pkg);
        if !conflicts.is_empty() {
            return Err(Error::UnsatisfiedConstraints(conflicts));
        }

        let mut proposed: Vec<LockPackage> = current.to_vec();
        match proposed.iter_mut().find(|p| p.source == repository) {
            Some(existing) => *existing = target_pkg,
            None => proposed.push(target_pkg),
        }

        info!(
            "Resolved {} to {} packages",
            target.name,
            proposed.len()
        );
        Ok(proposed)
    }

    /// Choose the version of `repository` to install
    ///
    /// A tag that is not a constraint is used verbatim. An exact version maps
    /// to the published tag carrying it, or to the bare version if none does.
    /// Otherwise the highest published version satisfying the constraint is
    /// chosen, refusing to cross the next breaking boundary from the locked
    /// version unless the constraint's lower bound asks for it.
    pub fn select_version(
        &self,
        deadline: &Deadline,
        repository: &str,
        requested: &str,
        locked: Option<&LockPackage>,
    ) -> Result<String> {
        let Ok(constraint) = Constraint::parse(requested) else {
            return Ok(requested.to_string());
        };

        deadline.check("listing published versions")?;
        let published = resolved_versions(self.store.as_ref(), self.fetcher.as_ref(), repository)?;

        if let Some(exact) = constraint.exact_version() {
            // `1.2.3`, `=1.2.3` and `v1.2.3` all name the same published tag
            let tag = published
                .iter()
                .find(|tag| Version::parse(tag).is_ok_and(|v| &v == exact))
                .cloned()
                .unwrap_or_else(|| requested.trim_start_matches('=').trim().to_string());
            debug!("Selected {}:{} for exact version {}", repository, tag, exact);
            return Ok(tag);
        }

        let breaking = locked
            .and_then(|p| Version::parse(&p.version).ok())
            .map(|v| v.next_breaking());

        let selected = published
            .iter()
            .filter_map(|tag| Version::parse(tag).ok().map(|v| (v, tag)))
            .filter(|(v, _)| constraint.satisfies(v))
            .filter(|(v, _)| match &breaking {
                Some(breaking) => constraint.check_with_breaking_version(v, breaking),
                None => true,
            })
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, tag)| tag.clone());

        match selected {
            Some(tag) => {
                debug!("Selected {}:{} for constraint {}", repository, tag, constraint);
                Ok(tag)
            }
            None => Err(Error::ResolutionError(format!(
                "No published version of {} satisfies {}",
                repository, constraint
            ))),
        }
    }
}

/// Repository and requested version or constraint of a snapshot
///
/// A blank version falls back to the tag in `source`, then to any version.
fn split_target(target: &PackageSnapshot) -> Result<(String, String)> {
    let source = SourceRef::parse(&target.source)?;
    let requested = if target.version.trim().is_empty() {
        source.version.clone().unwrap_or_else(|| "*".to_string())
    } else {
        target.version.trim().to_string()
    };
    Ok((source.repository, requested))
}

/// Check a package's direct dependencies against the versions in the graph
///
/// Returns every violation rather than stopping at the first.
pub fn check_constraints(graph: &DependencyGraph, pkg: &LockPackage) -> Vec<Conflict> {
    let mut conflicts = Vec::new();

    for dep in &pkg.dependencies {
        let Some(installed) = graph.get_node(&dep.package).ok().and_then(Node::package) else {
            continue;
        };

        let invalid = |reason: String| Conflict::InvalidConstraint {
            package: dep.package.clone(),
            constraint: dep.constraints.clone(),
            required_by: pkg.source.clone(),
            reason,
        };

        let constraint = match Constraint::parse(&dep.constraints) {
            Ok(c) => c,
            Err(e) => {
                conflicts.push(invalid(e.to_string()));
                continue;
            }
        };
        let version = match Version::parse(&installed.version) {
            Ok(v) => v,
            Err(e) => {
                conflicts.push(invalid(e.to_string()));
                continue;
            }
        };

        if !constraint.satisfies(&version) {
            conflicts.push(Conflict::UnsatisfiableConstraint {
                package: dep.package.clone(),
                installed_version: installed.version.clone(),
                required_constraint: dep.constraints.clone(),
                required_by: pkg.source.clone(),
            });
        }
    }

    conflicts
}

/// Order packages for installation, dependencies first
pub fn install_order(packages: &[LockPackage]) -> Result<Vec<LockPackage>> {
    let mut graph = DependencyGraph::new();
    graph.init(packages);

    let mut ordered = Vec::with_capacity(packages.len());
    for id in graph.sort()? {
        if let Some(pkg) = graph.get_node(&id)?.package() {
            ordered.push(pkg.clone());
        }
    }
    Ok(ordered)
}
