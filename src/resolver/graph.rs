// src/resolver/graph.rs

//! Dependency graph data structures and algorithms
//!
//! Nodes are keyed by package source repository. A node is either a package
//! known to the lock (or proposed for it), or an *implied* placeholder for a
//! repository that something depends on but that is not present. Implied
//! nodes are how missing dependencies are detected.
//!
//! Maps are ordered so traversal and sorting are deterministic.

use crate::db::models::{Dependency, LockPackage};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

/// A node in the dependency graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// A package present in the lock or proposed set
    Package(LockPackage),
    /// Referenced as a dependency but not present
    Implied { identifier: String },
}

impl Node {
    pub fn identifier(&self) -> &str {
        match self {
            Node::Package(pkg) => pkg.identifier(),
            Node::Implied { identifier } => identifier,
        }
    }

    pub fn dependencies(&self) -> &[Dependency] {
        match self {
            Node::Package(pkg) => &pkg.dependencies,
            Node::Implied { .. } => &[],
        }
    }

    pub fn is_implied(&self) -> bool {
        matches!(self, Node::Implied { .. })
    }

    pub fn package(&self) -> Option<&LockPackage> {
        match self {
            Node::Package(pkg) => Some(pkg),
            Node::Implied { .. } => None,
        }
    }
}

impl From<LockPackage> for Node {
    fn from(pkg: LockPackage) -> Self {
        Node::Package(pkg)
    }
}

/// Directed graph of package dependencies
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, Node>,
    /// Map from package to the packages it depends on
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from the installed packages
    ///
    /// Returns the identifiers of the implied nodes created for
    /// dependencies that are not installed.
    pub fn init(&mut self, existing: &[LockPackage]) -> Vec<String> {
        self.nodes.clear();
        self.edges.clear();
        self.add_or_update_nodes(existing.iter().cloned().map(Node::from))
    }

    pub fn node_exists(&self, identifier: &str) -> bool {
        self.nodes.contains_key(identifier)
    }

    pub fn get_node(&self, identifier: &str) -> Result<&Node> {
        self.nodes
            .get(identifier)
            .ok_or_else(|| Error::not_found("DependencyNode", identifier))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Identifiers of every implied node
    pub fn implied(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.is_implied())
            .map(|n| n.identifier().to_string())
            .collect()
    }

    /// Insert nodes, or replace existing ones with the same identifier
    ///
    /// An implied placeholder is promoted in place; edges pointing at it are
    /// untouched. Each inserted node's own edges are replaced by its declared
    /// dependencies, and any dependency not yet in the graph gets an implied
    /// node. Returns the identifiers of the implied nodes created.
    pub fn add_or_update_nodes<I>(&mut self, nodes: I) -> Vec<String>
    where
        I: IntoIterator<Item = Node>,
    {
        let mut inserted = Vec::new();
        for node in nodes {
            let id = node.identifier().to_string();
            self.nodes.insert(id.clone(), node);
            inserted.push(id);
        }

        let mut created = Vec::new();
        for id in inserted {
            let targets: BTreeSet<String> = self.nodes[&id]
                .dependencies()
                .iter()
                .map(|d| d.package.clone())
                .collect();

            for target in &targets {
                if !self.nodes.contains_key(target) {
                    self.nodes.insert(
                        target.clone(),
                        Node::Implied {
                            identifier: target.clone(),
                        },
                    );
                    created.push(target.clone());
                }
            }
            self.edges.insert(id, targets);
        }
        created
    }

    /// Direct dependencies of a node
    pub fn dependencies_of(&self, identifier: &str) -> Vec<&str> {
        self.edges
            .get(identifier)
            .map(|targets| targets.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Every node reachable from `identifier`, not including itself
    pub fn trace_node(&self, identifier: &str) -> Result<BTreeSet<String>> {
        self.get_node(identifier)?;

        let mut reached = BTreeSet::new();
        let mut stack = vec![identifier.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(targets) = self.edges.get(&current) {
                for target in targets {
                    if target != identifier && reached.insert(target.clone()) {
                        stack.push(target.clone());
                    }
                }
            }
        }
        Ok(reached)
    }

    /// Perform topological sort using Kahn's algorithm
    ///
    /// Returns identifiers in installation order (dependencies before
    /// dependents). Nodes that become ready together are ordered by
    /// identifier.
    pub fn sort(&self) -> Result<Vec<String>> {
        let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for id in self.nodes.keys() {
            pending.insert(id.as_str(), 0);
        }
        for (from, targets) in &self.edges {
            for to in targets {
                *pending.entry(from.as_str()).or_insert(0) += 1;
                dependents.entry(to.as_str()).or_default().push(from.as_str());
            }
        }

        let mut ready: BTreeSet<&str> = pending
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut result = Vec::with_capacity(self.nodes.len());

        while let Some(id) = ready.pop_first() {
            result.push(id.to_string());
            for &dependent in dependents.get(id).map(Vec::as_slice).unwrap_or_default() {
                if let Some(count) = pending.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if result.len() != self.nodes.len() {
            let cycle = self.detect_cycle().unwrap_or_default();
            return Err(Error::CircularDependency(cycle));
        }
        Ok(result)
    }

    /// Detect circular dependencies in the graph
    ///
    /// Returns the cycle as a path that starts and ends on the same node,
    /// or None if the graph is acyclic.
    pub fn detect_cycle(&self) -> Option<Vec<String>> {
        let mut visited = BTreeSet::new();
        let mut path = Vec::new();

        for id in self.nodes.keys() {
            if !visited.contains(id.as_str())
                && let Some(cycle) = self.dfs_cycle_detect(id, &mut visited, &mut path)
            {
                return Some(cycle);
            }
        }
        None
    }

    /// DFS helper for cycle detection; `path` is the current recursion stack
    fn dfs_cycle_detect<'a>(
        &'a self,
        id: &'a str,
        visited: &mut BTreeSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(id);
        path.push(id);

        if let Some(targets) = self.edges.get(id) {
            for target in targets {
                if let Some(pos) = path.iter().position(|p| *p == target.as_str()) {
                    let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
                    cycle.push(target.clone());
                    return Some(cycle);
                }
                if !visited.contains(target.as_str())
                    && let Some(cycle) = self.dfs_cycle_detect(target, visited, path)
                {
                    return Some(cycle);
                }
            }
        }

        path.pop();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::PackageType;

    fn pkg(source: &str, version: &str, deps: &[(&str, &str)]) -> LockPackage {
        LockPackage {
            name: source.rsplit('/').next().unwrap().to_string(),
            package_type: PackageType::Provider,
            source: source.to_string(),
            version: version.to_string(),
            dependencies: deps
                .iter()
                .map(|(p, c)| Dependency::new(*p, *c))
                .collect(),
        }
    }

    #[test]
    fn test_init_returns_implied() {
        let mut graph = DependencyGraph::new();
        let implied = graph.init(&[
            pkg("acme/a", "v1.0.0", &[("acme/b", ">=1.0.0"), ("acme/c", "*")]),
            pkg("acme/b", "v1.2.0", &[]),
        ]);

        assert_eq!(implied, vec!["acme/c"]);
        assert!(graph.node_exists("acme/c"));
        assert!(graph.get_node("acme/c").unwrap().is_implied());
        assert!(!graph.get_node("acme/b").unwrap().is_implied());
        assert!(graph.get_node("acme/zzz").unwrap_err().is_not_found());
    }

    #[test]
    fn test_add_or_update_promotes_implied() {
        let mut graph = DependencyGraph::new();
        graph.init(&[pkg("acme/a", "v1.0.0", &[("acme/b", "*")])]);
        assert_eq!(graph.implied(), vec!["acme/b"]);

        let created = graph.add_or_update_nodes([Node::from(pkg("acme/b", "v1.0.0", &[]))]);
        assert!(created.is_empty());
        assert!(graph.implied().is_empty());
        assert_eq!(graph.dependencies_of("acme/a"), vec!["acme/b"]);
    }

    #[test]
    fn test_trace_node() {
        let mut graph = DependencyGraph::new();
        graph.init(&[
            pkg("acme/a", "v1", &[("acme/b", "*")]),
            pkg("acme/b", "v1", &[("acme/c", "*")]),
            pkg("acme/d", "v1", &[]),
        ]);

        let traced = graph.trace_node("acme/a").unwrap();
        assert_eq!(
            traced.into_iter().collect::<Vec<_>>(),
            vec!["acme/b", "acme/c"]
        );
        assert!(graph.trace_node("acme/d").unwrap().is_empty());
        assert!(graph.trace_node("acme/x").is_err());
    }

    #[test]
    fn test_sort_dependencies_first() {
        let mut graph = DependencyGraph::new();
        graph.init(&[
            pkg("acme/app", "v1", &[("acme/db", "*"), ("acme/net", "*")]),
            pkg("acme/net", "v1", &[("acme/base", "*")]),
            pkg("acme/db", "v1", &[("acme/base", "*")]),
            pkg("acme/base", "v1", &[]),
        ]);

        let order = graph.sort().unwrap();
        assert_eq!(order, vec!["acme/base", "acme/db", "acme/net", "acme/app"]);
    }

    #[test]
    fn test_sort_detects_cycle() {
        let mut graph = DependencyGraph::new();
        graph.init(&[
            pkg("acme/a", "v1", &[("acme/b", "*")]),
            pkg("acme/b", "v1", &[("acme/c", "*")]),
            pkg("acme/c", "v1", &[("acme/a", "*")]),
        ]);

        let cycle = graph.detect_cycle().unwrap();
        assert_eq!(cycle, vec!["acme/a", "acme/b", "acme/c", "acme/a"]);
        assert!(matches!(graph.sort(), Err(Error::CircularDependency(_))));
    }
}
