//! Migration ledger.
//!
//! The ledger is the engine's only durable state: one row per planned case
//! application, recording direction, completion, and the step group that
//! planned it.

pub mod store;

pub use store::{LedgerStore, DEFAULT_LEDGER_TABLE};

use chrono::NaiveDateTime;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};

/// Direction of a case application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Forward application (`up`).
    Up,
    /// Backward application (`down`).
    Down,
}

impl Direction {
    /// Value stored in the ledger's `status` column.
    pub fn as_status(self) -> i64 {
        match self {
            Direction::Up => 1,
            Direction::Down => -1,
        }
    }

    /// Decode the `status` column. Zero is treated as forward, matching rows
    /// written before the direction was recorded.
    pub fn from_status(status: i64) -> Self {
        if status < 0 {
            Direction::Down
        } else {
            Direction::Up
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Up => write!(f, "up()"),
            Direction::Down => write!(f, "down()"),
        }
    }
}

/// Completion state of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// Planned but not yet run.
    Pending,
    /// Ran and returned true.
    Succeeded,
    /// Ran and failed; re-attempted by `retry`.
    Failed,
}

impl Completion {
    /// Value stored in the ledger's `result` column.
    pub fn as_result(self) -> i64 {
        match self {
            Completion::Pending => 0,
            Completion::Succeeded => 1,
            Completion::Failed => -1,
        }
    }

    /// Decode the `result` column.
    pub fn from_result(result: i64) -> Self {
        match result {
            0 => Completion::Pending,
            r if r > 0 => Completion::Succeeded,
            _ => Completion::Failed,
        }
    }

    /// Pending or failed entries still need an executor pass.
    pub fn is_outstanding(self) -> bool {
        !matches!(self, Completion::Succeeded)
    }
}

impl std::fmt::Display for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Pending => write!(f, "pending"),
            Completion::Succeeded => write!(f, "succeeded"),
            Completion::Failed => write!(f, "failed"),
        }
    }
}

/// Token shared by every ledger entry planned in one planning call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct StepGroup(String);

static STEP_COUNTER: AtomicU32 = AtomicU32::new(0);

impl StepGroup {
    /// Generate a fresh token.
    ///
    /// Microseconds since the epoch in hex, followed by a process-wide counter so
    /// two plans made within the same microsecond still differ.
    pub fn generate() -> Self {
        let micros = chrono::Utc::now().timestamp_micros();
        let seq = STEP_COUNTER.fetch_add(1, Ordering::Relaxed) & 0xffff;
        Self(format!("{micros:x}{seq:04x}"))
    }

    /// Wrap an existing token read from storage.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The token text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordering for ledger listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Oldest first (`created_at, id`), used for execution.
    OldestFirst,
    /// Newest first (`created_at desc, id desc`), used for display.
    NewestFirst,
}

impl SortOrder {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            SortOrder::OldestFirst => "created_at ASC, id ASC",
            SortOrder::NewestFirst => "created_at DESC, id DESC",
        }
    }
}

/// One row of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    /// Surrogate key.
    pub id: i64,
    /// Timestamp of the case this entry applies.
    pub timestamp: i64,
    /// Descriptive label of the case.
    pub name: Option<String>,
    /// Direction planned for this entry.
    pub direction: Direction,
    /// Completion state.
    pub completion: Completion,
    /// Planning call that created this entry.
    pub step_group: StepGroup,
    /// When the entry was planned.
    pub created_at: NaiveDateTime,
}

impl LedgerEntry {
    /// Whether the entry still needs an executor pass.
    pub fn is_outstanding(&self) -> bool {
        self.completion.is_outstanding()
    }
}
