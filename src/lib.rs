// src/lib.rs

//! Lockstep transaction engine
//!
//! Installs extension packages into a cluster object store, one transaction
//! at a time, keeping the installed set consistent with every package's
//! dependency constraints.
//!
//! # Architecture
//!
//! - Store-first: all state lives in an [`db::ObjectStore`] with optimistic
//!   concurrency; there is no in-process shared state between transactions
//! - Lock: a single `Lock` object records the installed set and serializes
//!   transactions through an ownership marker
//! - Transactions: resolve, validate, install and commit under the lock,
//!   driven to completion by the [`controller::Controller`]
//! - Revisions: each installed version is a `PackageRevision`; exactly one
//!   per package is active and controls the package's payload objects

pub mod config;
pub mod controller;
pub mod db;
pub mod deadline;
mod error;
pub mod establish;
pub mod installer;
pub mod lock;
pub mod packages;
pub mod resolver;
pub mod transaction;
pub mod validation;
pub mod version;

pub use config::Config;
pub use controller::{Controller, ControllerSettings};
pub use error::{Error, Result, ResultExt};
pub use lock::{LockGuard, LockManager};
pub use transaction::{ReconcileOutcome, ReconcilerSettings, TransactionReconciler};
