//! Casebook Core - case catalog, migration ledger, planner, and executor.
//!
//! This crate tracks which schema migration cases have been applied to a
//! SQLite database, plans the cases needed to reach a target version, and runs
//! them in order with failure and retry semantics.

pub mod binding;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod log;
pub mod planner;

pub use binding::{CaseBinder, CaseContext, CaseLogic, CaseResult, FnCase, Schema, SqlScript};
pub use catalog::{
    CaseNaming, CaseProvider, CaseRef, CaseRegistry, CaseSource, Catalog, DirectoryCatalog,
    LegacyCase, MigrationCase,
};
pub use config::MigrationsConfig;
pub use engine::{Action, ActionReport, Migrations, Overview};
pub use error::{Error, Result};
pub use executor::{ExecutionOutcome, Executor};
pub use ledger::{Completion, Direction, LedgerEntry, LedgerStore, SortOrder, StepGroup};
pub use log::{BatchLog, LogMessage};
pub use planner::{Batch, NothingToDo, Plan, Planner};

pub use rusqlite;
