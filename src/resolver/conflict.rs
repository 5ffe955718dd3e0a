// src/resolver/conflict.rs

//! Conflict types for dependency resolution
//!
//! A solve collects every conflict among the target's direct dependencies
//! before failing, so one error can report all of them.

/// A dependency constraint that the proposed set does not satisfy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// Resolved version falls outside the required constraint
    UnsatisfiableConstraint {
        package: String,
        installed_version: String,
        required_constraint: String,
        required_by: String,
    },
    /// Constraint or resolved version could not be parsed
    InvalidConstraint {
        package: String,
        constraint: String,
        required_by: String,
        reason: String,
    },
}

impl Conflict {
    /// The depended-on package this conflict is about
    pub fn package(&self) -> &str {
        match self {
            Conflict::UnsatisfiableConstraint { package, .. }
            | Conflict::InvalidConstraint { package, .. } => package,
        }
    }
}

impl std::fmt::Display for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Conflict::UnsatisfiableConstraint {
                package,
                installed_version,
                required_constraint,
                required_by,
            } => write!(
                f,
                "Package {} version {} does not satisfy constraint {} required by {}",
                package, installed_version, required_constraint, required_by
            ),
            Conflict::InvalidConstraint {
                package,
                constraint,
                required_by,
                reason,
            } => write!(
                f,
                "Cannot check constraint {:?} on {} required by {}: {}",
                constraint, package, required_by, reason
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let conflict = Conflict::UnsatisfiableConstraint {
            package: "acme/b".to_string(),
            installed_version: "v0.9.0".to_string(),
            required_constraint: ">=1.0.0".to_string(),
            required_by: "acme/a".to_string(),
        };
        assert_eq!(
            conflict.to_string(),
            "Package acme/b version v0.9.0 does not satisfy constraint >=1.0.0 required by acme/a"
        );
        assert_eq!(conflict.package(), "acme/b");
    }
}
