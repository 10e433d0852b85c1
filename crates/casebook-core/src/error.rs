//! Core error types.

use crate::ledger::Direction;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors.
///
/// Storage and IO failures are infrastructure errors and propagate out of every
/// action. The remaining variants describe domain outcomes; the engine records
/// them in the action report instead of returning them.
#[derive(Debug, Error)]
pub enum Error {
    /// SQLite error from the ledger or the target database.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Filesystem error while scanning or rewriting case files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested target has no matching case.
    #[error("target case {timestamp} not found")]
    TargetNotFound {
        /// The requested target timestamp.
        timestamp: i64,
    },

    /// The requested target is not a valid timestamp.
    #[error("target case timestamp {timestamp} is invalid")]
    InvalidTarget {
        /// The requested target timestamp.
        timestamp: i64,
    },

    /// A ledger entry references a case the catalog no longer contains.
    #[error("the case file for timestamp {timestamp} is missing")]
    CaseFileMissing {
        /// Timestamp referenced by the ledger.
        timestamp: i64,
    },

    /// A registered case has no logic bound to it.
    #[error("no logic is registered for case {timestamp}")]
    CaseNotRegistered {
        /// Timestamp of the case.
        timestamp: i64,
    },

    /// The case's up/down logic returned false, errored, or panicked.
    #[error("{direction} of case {timestamp} failed: {reason}")]
    CaseExecutionFailure {
        /// Timestamp of the failed case.
        timestamp: i64,
        /// Direction that was being applied.
        direction: Direction,
        /// What the case reported.
        reason: String,
    },

    /// A failed or interrupted batch must be fixed before planning anything new.
    #[error(
        "blocked by prior failure: case {timestamp}, {direction}, step {step_group}, at {created_at}"
    )]
    BlockedByPriorFailure {
        /// Timestamp of the outstanding entry.
        timestamp: i64,
        /// Direction of the outstanding entry.
        direction: Direction,
        /// Step group of the outstanding entry.
        step_group: String,
        /// When the outstanding entry was planned.
        created_at: String,
    },

    /// Two cases share a timestamp.
    #[error("duplicate case timestamp {timestamp}")]
    DuplicateCase {
        /// The colliding timestamp.
        timestamp: i64,
    },

    /// The configured case prefix or extension produced an unusable pattern.
    #[error("invalid case naming pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// A case identifier does not follow the naming grammar.
    #[error("invalid case identifier: {0}")]
    InvalidIdentifier(String),

    /// A script case file could not be parsed.
    #[error("invalid case script {}: {reason}", path.display())]
    InvalidScript {
        /// Path of the script.
        path: PathBuf,
        /// Why it was rejected.
        reason: String,
    },

    /// Unknown action name.
    #[error("unknown action: {0}")]
    UnknownAction(String),
}

impl Error {
    /// Whether this error is a domain outcome rather than an infrastructure failure.
    pub fn is_domain(&self) -> bool {
        !matches!(self, Error::Storage(_) | Error::Io(_) | Error::Pattern(_))
    }
}
