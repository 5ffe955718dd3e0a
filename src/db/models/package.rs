// src/db/models/package.rs

//! Package model - the top-level installable unit

use super::lock::PackageType;
use crate::db::{Kind, Object};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Label recording the transaction that last wrote a package
pub const LABEL_TRANSACTION_NAME: &str = "lockstep.dev/transaction-name";

/// Label recording that transaction's generation
pub const LABEL_TRANSACTION_GENERATION: &str = "lockstep.dev/transaction-generation";

/// Label on revisions naming the package they belong to
pub const LABEL_PACKAGE: &str = "lockstep.dev/package";

/// A `repository:version` package reference
///
/// The version is separated by the last `:` after the last `/`, so registry
/// ports are preserved: `registry:5000/acme/pkg:v1.0.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceRef {
    pub repository: String,
    pub version: Option<String>,
}

impl SourceRef {
    pub fn new(repository: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            version: Some(version.into()),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::ParseError("Empty package reference".to_string()));
        }

        let name_start = s.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, version) = match s[name_start..].rfind(':') {
            Some(i) => {
                let split = name_start + i;
                (&s[..split], Some(s[split + 1..].to_string()))
            }
            None => (s, None),
        };

        if repository.is_empty() || version.as_deref() == Some("") {
            return Err(Error::ParseError(format!(
                "Invalid package reference '{}'",
                s
            )));
        }

        Ok(Self {
            repository: repository.to_string(),
            version,
        })
    }

    /// Last path segment of the repository, used to derive object names
    pub fn short_name(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}:{}", self.repository, version),
            None => write!(f, "{}", self.repository),
        }
    }
}

impl FromStr for SourceRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SourceRef::parse(s)
    }
}

/// Whether new revisions become active automatically
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationPolicy {
    #[default]
    Automatic,
    Manual,
}

fn default_revision_history_limit() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    #[serde(rename = "type", default)]
    pub package_type: PackageType,
    /// `repository:version`
    pub source: String,
    /// Inactive revisions to keep; 0 disables garbage collection
    #[serde(default = "default_revision_history_limit")]
    pub revision_history_limit: u32,
    #[serde(default)]
    pub activation_policy: ActivationPolicy,
}

impl Default for PackageSpec {
    fn default() -> Self {
        Self {
            package_type: PackageType::default(),
            source: String::new(),
            revision_history_limit: default_revision_history_limit(),
            activation_policy: ActivationPolicy::default(),
        }
    }
}

impl PackageSpec {
    pub fn source_ref(&self) -> Result<SourceRef> {
        SourceRef::parse(&self.source)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageStatus {
    /// Source after image config rewriting
    #[serde(default)]
    pub resolved_source: Option<String>,
    #[serde(default)]
    pub current_revision: Option<String>,
    #[serde(default)]
    pub applied_image_config_refs: Vec<String>,
}

impl Kind for PackageSpec {
    const KIND: &'static str = "Package";
    type Status = PackageStatus;
}

pub type Package = Object<PackageSpec>;
