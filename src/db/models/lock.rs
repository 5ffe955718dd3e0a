// src/db/models/lock.rs

//! Lock model - the committed set of installed packages

use crate::db::{Kind, Object};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of the singleton lock object
pub const LOCK_NAME: &str = "lock";

/// Annotation naming the transaction that currently holds the lock
pub const LOCK_OWNER_ANNOTATION: &str = "lockstep.dev/transaction";

/// Type of package
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackageType {
    /// Extends the API surface and runs a controller workload
    #[default]
    Provider,
    /// Bundles composition resources; no workload
    Configuration,
    /// Runs a function workload invoked by compositions
    Function,
}

impl PackageType {
    pub fn as_str(&self) -> &str {
        match self {
            PackageType::Provider => "provider",
            PackageType::Configuration => "configuration",
            PackageType::Function => "function",
        }
    }

    /// Whether packages of this type run backing workloads
    pub fn has_runtime(&self) -> bool {
        match self {
            PackageType::Provider | PackageType::Function => true,
            PackageType::Configuration => false,
        }
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "provider" => Ok(PackageType::Provider),
            "configuration" => Ok(PackageType::Configuration),
            "function" => Ok(PackageType::Function),
            _ => Err(format!("Invalid package type: {s}")),
        }
    }
}

/// A dependency on another package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Source repository of the depended-on package
    pub package: String,
    /// Version constraint expression
    #[serde(default)]
    pub constraints: String,
}

impl Dependency {
    pub fn new(package: impl Into<String>, constraints: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            constraints: constraints.into(),
        }
    }
}

/// One installed package in the lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPackage {
    pub name: String,
    #[serde(rename = "type", default)]
    pub package_type: PackageType,
    /// Source repository, without version
    pub source: String,
    /// Resolved version
    pub version: String,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

impl LockPackage {
    /// Identity of the package in the dependency graph
    pub fn identifier(&self) -> &str {
        &self.source
    }

    /// `source:version`, the reference used to fetch the artifact
    pub fn reference(&self) -> String {
        format!("{}:{}", self.source, self.version)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSpec {
    #[serde(default)]
    pub packages: Vec<LockPackage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStatus {}

impl Kind for LockSpec {
    const KIND: &'static str = "Lock";
    type Status = LockStatus;
}

pub type Lock = Object<LockSpec>;

impl Lock {
    /// Transaction currently holding the lock, if any
    pub fn holder(&self) -> Option<&str> {
        self.metadata
            .annotations
            .get(LOCK_OWNER_ANNOTATION)
            .map(String::as_str)
    }

    pub fn find_package(&self, source: &str) -> Option<&LockPackage> {
        self.spec.packages.iter().find(|p| p.source == source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_type_parse() {
        assert_eq!("Provider".parse::<PackageType>(), Ok(PackageType::Provider));
        assert_eq!("function".parse::<PackageType>(), Ok(PackageType::Function));
        assert!("plugin".parse::<PackageType>().is_err());
        assert!(!PackageType::Configuration.has_runtime());
    }

    #[test]
    fn test_lock_package_serializes_type_field() {
        let pkg = LockPackage {
            name: "provider-a".to_string(),
            package_type: PackageType::Provider,
            source: "registry.example.io/acme/provider-a".to_string(),
            version: "v1.0.0".to_string(),
            dependencies: vec![Dependency::new("registry.example.io/acme/b", ">=1.0.0")],
        };
        let json = serde_json::to_value(&pkg).unwrap();
        assert_eq!(json["type"], "Provider");
        assert_eq!(pkg.reference(), "registry.example.io/acme/provider-a:v1.0.0");
    }

    #[test]
    fn test_lock_holder() {
        let mut lock = Lock::new(LOCK_NAME, LockSpec::default());
        assert_eq!(lock.holder(), None);
        lock.metadata
            .annotations
            .insert(LOCK_OWNER_ANNOTATION.to_string(), "tx-1".to_string());
        assert_eq!(lock.holder(), Some("tx-1"));
    }
}
