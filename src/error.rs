// src/error.rs

//! Error types shared by every layer of the transaction engine
//!
//! Errors fall into a few classes that the reconciler treats differently:
//!
//! - **Backpressure**: [`Error::LockHeld`] means another transaction owns the
//!   lock; the caller waits and retries.
//! - **Transient**: [`Error::Conflict`] (optimistic-concurrency failure) and
//!   [`Error::NotFound`] (read-after-write lag) are retried without counting
//!   as a failure.
//! - **Domain**: everything else. These are counted against the transaction's
//!   retry limit.

use crate::resolver::Conflict;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Version or constraint string could not be parsed
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Object does not exist in the store
    #[error("{kind} {name:?} not found")]
    NotFound { kind: String, name: String },

    /// Object already exists in the store
    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: String, name: String },

    /// Optimistic-concurrency check failed on update
    #[error("Conflict updating {kind} {name:?}: {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    /// The lock is owned by a different transaction
    #[error("Lock is held by another transaction ({holder})")]
    LockHeld { holder: String },

    /// The caller tried to commit a lock it does not hold
    #[error("Transaction {0:?} does not hold the lock")]
    LockNotHeld(String),

    /// Dependencies referenced by a package are not installed
    #[error("Missing dependencies: {}", .0.join(", "))]
    MissingDependencies(Vec<String>),

    /// Installed dependency versions do not satisfy declared constraints
    #[error("{}", format_conflicts(.0))]
    UnsatisfiedConstraints(Vec<Conflict>),

    /// Dependency graph contains a cycle
    #[error("Circular dependency: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    /// Dependency resolution failed for another reason
    #[error("Resolution error: {0}")]
    ResolutionError(String),

    /// A validator rejected the proposed transaction
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// An object is controlled by a different owner
    #[error("Ownership conflict: {0}")]
    OwnershipConflict(String),

    /// The requested operation is not implemented
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The reconcile deadline passed before the work finished
    #[error("Deadline exceeded while {0}")]
    DeadlineExceeded(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Initialization or internal invariant failure
    #[error("Initialization error: {0}")]
    InitError(String),

    /// Lower-level error wrapped with a description of what was being done
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

fn format_conflicts(conflicts: &[Conflict]) -> String {
    let lines: Vec<String> = conflicts.iter().map(|c| c.to_string()).collect();
    format!("Unsatisfied dependency constraints: {}", lines.join("; "))
}

impl Error {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn conflict(
        kind: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            message: message.into(),
        }
    }

    /// Wrap this error with a description of what was being done
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip context layers and return the underlying error
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for optimistic-concurrency failures, however deeply wrapped
    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Error::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound { .. })
    }

    /// True for errors caused by store lag or contention
    pub fn is_transient(&self) -> bool {
        self.is_conflict() || self.is_not_found()
    }

    pub fn is_lock_held(&self) -> bool {
        matches!(self.root(), Error::LockHeld { .. })
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self.root(), Error::DeadlineExceeded(_))
    }
}

/// Adds context to errors as they cross a layer boundary
pub trait ResultExt<T> {
    fn context<C: Into<String>>(self, context: C) -> Result<T>;

    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: context.into(),
            source: Box::new(e.into()),
        })
    }

    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: f().into(),
            source: Box::new(e.into()),
        })
    }
}
