// src/validation.rs

//! Checks run against a proposed transaction before anything is installed
//!
//! Validators run in order and the chain stops at the first failure.

use crate::db::models::Transaction;
use crate::deadline::Deadline;
use crate::error::{Error, Result, ResultExt};
use crate::packages::FetchedPackage;
use crate::version::{Constraint, Version};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// A single validation check
pub trait Validator: Send + Sync {
    /// Short name used in error context and logs
    fn name(&self) -> &str;

    fn validate(
        &self,
        deadline: &Deadline,
        transaction: &Transaction,
        proposed: &[FetchedPackage],
    ) -> Result<()>;
}

/// Ordered validators, fail fast
#[derive(Default)]
pub struct ValidatorChain {
    validators: Vec<Box<dyn Validator>>,
}

impl ValidatorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// The checks every transaction goes through
    pub fn standard(platform_version: Version) -> Self {
        Self::new()
            .with(SchemaValidator)
            .with(PlatformValidator::new(platform_version))
    }

    pub fn with(mut self, validator: impl Validator + 'static) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn validate(
        &self,
        deadline: &Deadline,
        transaction: &Transaction,
        proposed: &[FetchedPackage],
    ) -> Result<()> {
        for validator in &self.validators {
            deadline.check("validating")?;
            validator
                .validate(deadline, transaction, proposed)
                .with_context(|| format!("{} validation failed", validator.name()))?;
            debug!(
                "Validator {} passed for transaction {}",
                validator.name(),
                transaction.name()
            );
        }
        Ok(())
    }
}

/// Kinds owned by the engine itself; payloads may not ship them
pub const RESERVED_KINDS: &[&str] = &[
    "Lock",
    "Transaction",
    "Package",
    "PackageRevision",
    "ImageConfig",
];

/// Payload objects must be well formed and owned by one package
pub struct SchemaValidator;

impl Validator for SchemaValidator {
    fn name(&self) -> &str {
        "schema"
    }

    fn validate(
        &self,
        _deadline: &Deadline,
        _transaction: &Transaction,
        proposed: &[FetchedPackage],
    ) -> Result<()> {
        let mut owners: BTreeMap<(&str, &str), &str> = BTreeMap::new();

        for fetched in proposed {
            let source = fetched.package.source.as_str();
            let mut seen = BTreeSet::new();

            for object in &fetched.artifact.objects {
                if object.api_version.trim().is_empty()
                    || object.kind.trim().is_empty()
                    || object.name.trim().is_empty()
                {
                    return Err(Error::ValidationError(format!(
                        "Package {} has an object missing api_version, kind or name",
                        source
                    )));
                }

                if RESERVED_KINDS.contains(&object.kind.as_str()) {
                    return Err(Error::ValidationError(format!(
                        "Package {} ships reserved kind {}",
                        source, object.kind
                    )));
                }

                let key = (object.kind.as_str(), object.name.as_str());
                if !seen.insert(key) {
                    return Err(Error::ValidationError(format!(
                        "Package {} declares {} {:?} more than once",
                        source, object.kind, object.name
                    )));
                }
                if let Some(other) = owners.insert(key, source) {
                    return Err(Error::ValidationError(format!(
                        "{} {:?} is declared by both {} and {}",
                        object.kind, object.name, other, source
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Packages must support the host platform version
pub struct PlatformValidator {
    platform: Version,
}

impl PlatformValidator {
    pub fn new(platform: Version) -> Self {
        Self { platform }
    }
}

impl Validator for PlatformValidator {
    fn name(&self) -> &str {
        "platform"
    }

    fn validate(
        &self,
        _deadline: &Deadline,
        _transaction: &Transaction,
        proposed: &[FetchedPackage],
    ) -> Result<()> {
        for fetched in proposed {
            let Some(expr) = &fetched.artifact.metadata.platform_constraint else {
                continue;
            };
            let constraint = Constraint::parse(expr).map_err(|e| {
                Error::ValidationError(format!(
                    "Package {} has an invalid platform constraint: {}",
                    fetched.package.source, e
                ))
            })?;
            if !constraint.satisfies(&self.platform) {
                return Err(Error::ValidationError(format!(
                    "Package {} requires platform {} but this platform is {}",
                    fetched.package.source, constraint, self.platform
                )));
            }
        }
        Ok(())
    }
}
