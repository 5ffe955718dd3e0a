// src/db/models/transaction.rs

//! Transaction model - a request to change the installed package set

use super::lock::LockPackage;
use crate::db::{Kind, Object};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of failed attempts before a transaction gives up
pub const DEFAULT_RETRY_LIMIT: u32 = 5;

fn default_retry_limit() -> u32 {
    DEFAULT_RETRY_LIMIT
}

/// Kind of change requested
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    #[default]
    Install,
    Delete,
    Replace,
}

impl ChangeType {
    pub fn as_str(&self) -> &str {
        match self {
            ChangeType::Install => "Install",
            ChangeType::Delete => "Delete",
            ChangeType::Replace => "Replace",
        }
    }
}

/// Snapshot of the package a transaction targets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSnapshot {
    /// Name for the Package object
    pub name: String,
    /// Source repository
    pub source: String,
    /// Exact version/tag, or a constraint to select one
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSpec {
    pub package: PackageSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSpec {
    #[serde(default)]
    pub change: ChangeType,
    #[serde(default)]
    pub install: Option<InstallSpec>,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
}

impl Default for TransactionSpec {
    fn default() -> Self {
        Self {
            change: ChangeType::default(),
            install: None,
            retry_limit: DEFAULT_RETRY_LIMIT,
        }
    }
}

impl TransactionSpec {
    pub fn install(package: PackageSnapshot) -> Self {
        Self {
            change: ChangeType::Install,
            install: Some(InstallSpec { package }),
            retry_limit: DEFAULT_RETRY_LIMIT,
        }
    }
}

/// Overall state of a transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionPhase {
    #[default]
    Pending,
    Running,
    /// Waiting for another transaction to release the lock
    Blocked,
    Failed,
    Complete,
}

impl TransactionPhase {
    /// Returns true once no further reconciles will change the outcome
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Complete)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Blocked => "Blocked",
            Self::Failed => "Failed",
            Self::Complete => "Complete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    Running,
    Blocked,
    Failed,
    Complete,
    ResolutionSuccess,
    ResolutionError,
    ValidationSuccess,
    ValidationError,
    InstallationSuccess,
    InstallationError,
}

impl ConditionType {
    /// Conditions in the same group replace each other
    fn group(&self) -> u8 {
        match self {
            Self::Running | Self::Blocked | Self::Failed | Self::Complete => 0,
            Self::ResolutionSuccess | Self::ResolutionError => 1,
            Self::ValidationSuccess | Self::ValidationError => 2,
            Self::InstallationSuccess | Self::InstallationError => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionReason {
    LockAcquisition,
    DependencySolve,
    Validation,
    Installation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    #[serde(default)]
    pub reason: Option<ConditionReason>,
    #[serde(default)]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(condition_type: ConditionType) -> Self {
        Self {
            condition_type,
            reason: None,
            message: None,
            last_transition_time: Utc::now(),
        }
    }

    pub fn with_reason(mut self, reason: ConditionReason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStatus {
    #[serde(default)]
    pub phase: TransactionPhase,
    #[serde(default)]
    pub failures: u32,
    #[serde(default)]
    pub proposed_lock_packages: Vec<LockPackage>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl TransactionStatus {
    /// Record a condition, replacing any condition of the same group
    ///
    /// The transition time is kept when the type, reason and message are
    /// unchanged so repeated reconciles do not churn it.
    pub fn set_condition(&mut self, condition: Condition) {
        let group = condition.condition_type.group();
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type.group() == group)
        {
            let unchanged = existing.condition_type == condition.condition_type
                && existing.reason == condition.reason
                && existing.message == condition.message;
            if !unchanged {
                *existing = condition;
            }
            return;
        }
        self.conditions.push(condition);
    }

    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Set the phase and its matching state condition
    pub fn set_phase(&mut self, phase: TransactionPhase, condition: Option<Condition>) {
        self.phase = phase;
        let condition_type = match phase {
            TransactionPhase::Pending => return,
            TransactionPhase::Running => ConditionType::Running,
            TransactionPhase::Blocked => ConditionType::Blocked,
            TransactionPhase::Failed => ConditionType::Failed,
            TransactionPhase::Complete => ConditionType::Complete,
        };
        self.set_condition(condition.unwrap_or_else(|| Condition::new(condition_type)));
    }
}

impl Kind for TransactionSpec {
    const KIND: &'static str = "Transaction";
    type Status = TransactionStatus;
}

pub type Transaction = Object<TransactionSpec>;

impl Transaction {
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_requested_at.is_some()
    }
}
