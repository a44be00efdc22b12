//! Migration Engine - reconciles the installed schema version with the target
//!
//! - `step`: one `(from, to)` transformation and its post-condition snapshot
//! - `verify`: live schema vs. snapshot comparison
//! - `engine`: chain planning, locked execution, fresh install and recreate

pub mod engine;
pub mod step;
pub mod verify;

pub use engine::{DatabaseCallback, MigrationEngine};
pub use step::{MigrationStep, StepProcedure};

use serde::{Deserialize, Serialize};

/// When a missing migration path may be resolved by dropping and recreating
/// every table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DestructivePolicy {
    #[default]
    Never,
    Always,
    /// Only when the installed version is one of these
    FromVersions(Vec<u32>),
}

impl DestructivePolicy {
    pub fn allows(&self, installed: u32) -> bool {
        match self {
            DestructivePolicy::Never => false,
            DestructivePolicy::Always => true,
            DestructivePolicy::FromVersions(versions) => versions.contains(&installed),
        }
    }
}

/// Engine state, logged on every transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationState {
    Unchecked,
    Validating,
    Applying { from: u32, to: u32 },
    Applied { version: u32 },
    Failed(String),
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationState::Unchecked => write!(f, "unchecked"),
            MigrationState::Validating => write!(f, "validating"),
            MigrationState::Applying { from, to } => write!(f, "applying v{from} -> v{to}"),
            MigrationState::Applied { version } => write!(f, "applied v{version}"),
            MigrationState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// What a successful run did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub from: u32,
    pub to: u32,
    /// Steps applied, in order
    pub applied: Vec<(u32, u32)>,
    /// Fresh install from the registry DDL
    pub created: bool,
    /// Destructive recreate
    pub recreated: bool,
}

impl MigrationReport {
    fn unchanged(version: u32) -> Self {
        Self {
            from: version,
            to: version,
            applied: Vec::new(),
            created: false,
            recreated: false,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.applied.is_empty() && !self.created && !self.recreated
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("No migration path from v{from} to v{to}")]
    MissingMigrationPath { from: u32, to: u32 },

    #[error("Schema after migration v{from} -> v{to} does not match: {}", .diff.join("; "))]
    MigrationVerificationFailed { from: u32, to: u32, diff: Vec<String> },

    #[error("Schema identity changed without a version bump (v{version}: stored {stored}, expected {expected})")]
    IdentityMismatch {
        version: u32,
        stored: String,
        expected: String,
    },

    #[error("Migration v{from} -> v{to} failed: {message}")]
    StepFailed { from: u32, to: u32, message: String },

    #[error("Invalid migration step: {0}")]
    InvalidStep(String),

    #[error("Target version {target} does not match the registry version {registry}")]
    TargetMismatch { target: u32, registry: u32 },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}
