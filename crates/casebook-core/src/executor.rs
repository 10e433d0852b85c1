//! Batch execution.
//!
//! Runs outstanding ledger entries in planned order, stopping at the first
//! failure so a later `retry` can resume from it.

use crate::binding::{invoke, CaseBinder, CaseContext};
use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::ledger::{Direction, LedgerEntry, LedgerStore, SortOrder};
use crate::log::BatchLog;
use tracing::{debug, warn};

/// Result of one executor pass.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// No outstanding entries.
    Idle,
    /// Every outstanding entry succeeded.
    Completed {
        /// Timestamps applied, in order.
        applied: Vec<i64>,
        /// Watermark after the pass.
        watermark: i64,
    },
    /// The pass stopped at a failing entry.
    Halted {
        /// Timestamps applied before the failure.
        applied: Vec<i64>,
        /// Watermark after the pass.
        watermark: i64,
        /// Why the pass stopped.
        error: Error,
    },
}

impl ExecutionOutcome {
    /// Watermark after the pass, if anything ran.
    pub fn watermark(&self) -> Option<i64> {
        match self {
            ExecutionOutcome::Idle => None,
            ExecutionOutcome::Completed { watermark, .. }
            | ExecutionOutcome::Halted { watermark, .. } => Some(*watermark),
        }
    }

    /// Whether the pass stopped at a failure.
    pub fn is_halted(&self) -> bool {
        matches!(self, ExecutionOutcome::Halted { .. })
    }
}

/// Sequential executor over the ledger's outstanding entries.
pub struct Executor<'a, 'c> {
    catalog: &'a Catalog,
    binder: &'a CaseBinder,
    ledger: &'a LedgerStore<'c>,
    transactional: bool,
}

impl<'a, 'c> Executor<'a, 'c> {
    /// Create an executor. With `transactional`, each case and its ledger mark
    /// commit together or not at all.
    pub fn new(
        catalog: &'a Catalog,
        binder: &'a CaseBinder,
        ledger: &'a LedgerStore<'c>,
        transactional: bool,
    ) -> Self {
        Self {
            catalog,
            binder,
            ledger,
            transactional,
        }
    }

    /// Run every outstanding entry in the direction stored on the first one.
    pub fn apply_pending(&self, log: &mut BatchLog) -> Result<ExecutionOutcome> {
        let pending = self.ledger.pending_entries(None, SortOrder::OldestFirst)?;
        let Some(first) = pending.first() else {
            return Ok(ExecutionOutcome::Idle);
        };
        let direction = first.direction;
        debug!(entries = pending.len(), %direction, "applying outstanding entries");

        let mut applied = Vec::new();
        for entry in &pending {
            if let Err(error) = self.apply_entry(entry, direction, log)? {
                return Ok(ExecutionOutcome::Halted {
                    applied,
                    watermark: self.ledger.current_timestamp()?,
                    error,
                });
            }
            applied.push(entry.timestamp);
        }

        Ok(ExecutionOutcome::Completed {
            applied,
            watermark: self.ledger.current_timestamp()?,
        })
    }

    /// Apply one entry. The outer `Result` carries storage failures; the inner
    /// one the domain error that halts the batch.
    fn apply_entry(
        &self,
        entry: &LedgerEntry,
        direction: Direction,
        log: &mut BatchLog,
    ) -> Result<std::result::Result<(), Error>> {
        let timestamp = entry.timestamp;

        let Some(case) = self.catalog.find_by_timestamp(timestamp)? else {
            log.failure(format!(
                "The file associated with the migration case timestamp {timestamp} is missing!"
            ));
            return Ok(Err(Error::CaseFileMissing { timestamp }));
        };

        let logic = match self.binder.bind(&case) {
            Ok(logic) => logic,
            Err(e) if e.is_domain() => {
                log.failure(format!("Migration case {timestamp} could not be loaded: {e}"));
                return Ok(Err(e));
            }
            Err(e) => return Err(e),
        };

        if self.transactional && logic.manages_transaction() {
            let reason = "the case manages its own transaction; run it with transactional \
                          execution disabled"
                .to_string();
            return self.fail(entry, direction, log, reason).map(Err);
        }

        let conn = self.ledger.connection();
        let tx = if self.transactional {
            Some(conn.unchecked_transaction()?)
        } else {
            None
        };

        let ctx = CaseContext::new(conn, &case);
        match invoke(logic.as_ref(), direction, &ctx) {
            Ok(()) => {
                self.ledger.mark_result(entry.id, direction, true)?;
                if let Some(tx) = tx {
                    tx.commit()?;
                }
                log.info(format!("{}: done", progress_label(direction, timestamp)));
                Ok(Ok(()))
            }
            Err(reason) => {
                if let Some(tx) = tx {
                    if let Err(e) = tx.rollback() {
                        warn!(timestamp, error = %e, "case transaction rollback failed");
                    }
                }
                self.fail(entry, direction, log, reason).map(Err)
            }
        }
    }

    /// Mark an entry Failed and build the error that halts the batch.
    fn fail(
        &self,
        entry: &LedgerEntry,
        direction: Direction,
        log: &mut BatchLog,
        reason: String,
    ) -> Result<Error> {
        let timestamp = entry.timestamp;
        self.ledger.mark_result(entry.id, direction, false)?;
        warn!(timestamp, %direction, reason = %reason, "case failed");
        log.failure(format!("{}: failed", progress_label(direction, timestamp)));
        Ok(Error::CaseExecutionFailure {
            timestamp,
            direction,
            reason,
        })
    }
}

fn progress_label(direction: Direction, timestamp: i64) -> String {
    match direction {
        Direction::Up => format!("Upgrade to {timestamp}"),
        Direction::Down => format!("Downgrade from {timestamp}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{CaseLogic, FnCase, Schema, SqlScript};
    use crate::catalog::{CaseRef, CaseRegistry};
    use crate::ledger::{Completion, StepGroup, DEFAULT_LEDGER_TABLE};
    use crate::planner::Batch;
    use rusqlite::Connection;
    use std::sync::Arc;

    fn create(table: &'static str) -> impl CaseLogic {
        FnCase::new(
            move |ctx: &CaseContext<'_>| {
                ctx.schema().create_table(table, &["id INTEGER"])?;
                Ok(true)
            },
            move |ctx: &CaseContext<'_>| {
                ctx.schema().drop_table(table)?;
                Ok(true)
            },
        )
    }

    fn setup() -> (Catalog, CaseBinder) {
        let registry = Arc::new(
            CaseRegistry::new()
                .with_case("a_1", create("a"))
                .unwrap()
                .with_case("b_2", create("b"))
                .unwrap()
                .with_case(
                    "broken_3",
                    FnCase::new(
                        |ctx: &CaseContext<'_>| {
                            ctx.schema().create_table("partial", &["id INTEGER"])?;
                            Ok(false)
                        },
                        |_| Ok(true),
                    ),
                )
                .unwrap(),
        );
        let catalog = Catalog::new().with_provider(Arc::clone(&registry));
        let binder = CaseBinder::new().with_registry(registry);
        (catalog, binder)
    }

    fn record(ledger: &LedgerStore<'_>, direction: Direction, stamps: &[i64]) {
        let batch = Batch {
            step_group: StepGroup::generate(),
            direction,
            cases: stamps
                .iter()
                .map(|ts| CaseRef {
                    timestamp: *ts,
                    label: String::new(),
                })
                .collect(),
        };
        ledger.record_batch(&batch).unwrap();
    }

    #[test]
    fn test_idle_without_entries() {
        let conn = Connection::open_in_memory().unwrap();
        let ledger = LedgerStore::open(&conn, DEFAULT_LEDGER_TABLE).unwrap();
        let (catalog, binder) = setup();
        let mut log = BatchLog::new(false);

        let outcome = Executor::new(&catalog, &binder, &ledger, true)
            .apply_pending(&mut log)
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Idle));
        assert!(log.messages().is_empty());
    }

    #[test]
    fn test_applies_in_order() {
        let conn = Connection::open_in_memory().unwrap();
        let ledger = LedgerStore::open(&conn, DEFAULT_LEDGER_TABLE).unwrap();
        let (catalog, binder) = setup();
        let mut log = BatchLog::new(false);
        record(&ledger, Direction::Up, &[1, 2]);

        let outcome = Executor::new(&catalog, &binder, &ledger, true)
            .apply_pending(&mut log)
            .unwrap();
        match outcome {
            ExecutionOutcome::Completed { applied, watermark } => {
                assert_eq!(applied, vec![1, 2]);
                assert_eq!(watermark, 2);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let texts: Vec<_> = log.messages().iter().map(|m| m.text.clone()).collect();
        assert_eq!(texts, vec!["Upgrade to 1: done", "Upgrade to 2: done"]);
    }

    #[test]
    fn test_halts_and_rolls_back_failed_case() {
        let conn = Connection::open_in_memory().unwrap();
        let ledger = LedgerStore::open(&conn, DEFAULT_LEDGER_TABLE).unwrap();
        let (catalog, binder) = setup();
        let mut log = BatchLog::new(false);
        record(&ledger, Direction::Up, &[1, 3, 2]);

        let outcome = Executor::new(&catalog, &binder, &ledger, true)
            .apply_pending(&mut log)
            .unwrap();
        match outcome {
            ExecutionOutcome::Halted {
                applied,
                watermark,
                error,
            } => {
                assert_eq!(applied, vec![1]);
                assert_eq!(watermark, 1);
                assert!(matches!(
                    error,
                    Error::CaseExecutionFailure { timestamp: 3, .. }
                ));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(log.has_failure());
        assert!(!Schema::new(&conn).has_table("partial").unwrap());
        assert!(!Schema::new(&conn).has_table("b").unwrap());

        let pending = ledger.pending_entries(None, SortOrder::OldestFirst).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].timestamp, 3);
        assert_eq!(pending[0].completion, Completion::Failed);
        assert_eq!(pending[1].completion, Completion::Pending);
    }

    #[test]
    fn test_non_transactional_keeps_partial_change() {
        let conn = Connection::open_in_memory().unwrap();
        let ledger = LedgerStore::open(&conn, DEFAULT_LEDGER_TABLE).unwrap();
        let (catalog, binder) = setup();
        let mut log = BatchLog::new(false);
        record(&ledger, Direction::Up, &[3]);

        let outcome = Executor::new(&catalog, &binder, &ledger, false)
            .apply_pending(&mut log)
            .unwrap();
        assert!(outcome.is_halted());
        assert!(Schema::new(&conn).has_table("partial").unwrap());
    }

    #[test]
    fn test_missing_case_leaves_entry_untouched() {
        let conn = Connection::open_in_memory().unwrap();
        let ledger = LedgerStore::open(&conn, DEFAULT_LEDGER_TABLE).unwrap();
        let (catalog, binder) = setup();
        let mut log = BatchLog::new(false);
        record(&ledger, Direction::Up, &[99]);

        let outcome = Executor::new(&catalog, &binder, &ledger, true)
            .apply_pending(&mut log)
            .unwrap();
        assert!(matches!(
            outcome,
            ExecutionOutcome::Halted {
                error: Error::CaseFileMissing { timestamp: 99 },
                ..
            }
        ));
        let pending = ledger.failed_entry().unwrap().unwrap();
        assert_eq!(pending.completion, Completion::Pending);
    }

    fn own_transaction_setup() -> (Catalog, CaseBinder) {
        let script = SqlScript::parse(
            "-- +up\nBEGIN;\nCREATE TABLE wrapped (id INTEGER);\nCOMMIT;\n\
             -- +down\nDROP TABLE wrapped;\n",
        )
        .unwrap();
        let registry = Arc::new(CaseRegistry::new().with_case("wrapped_4", script).unwrap());
        let catalog = Catalog::new().with_provider(Arc::clone(&registry));
        let binder = CaseBinder::new().with_registry(registry);
        (catalog, binder)
    }

    #[test]
    fn test_refuses_script_with_own_transaction() {
        let conn = Connection::open_in_memory().unwrap();
        let ledger = LedgerStore::open(&conn, DEFAULT_LEDGER_TABLE).unwrap();
        let (catalog, binder) = own_transaction_setup();
        let mut log = BatchLog::new(false);
        record(&ledger, Direction::Up, &[4]);

        let outcome = Executor::new(&catalog, &binder, &ledger, true)
            .apply_pending(&mut log)
            .unwrap();
        match outcome {
            ExecutionOutcome::Halted {
                error: Error::CaseExecutionFailure { timestamp, reason, .. },
                ..
            } => {
                assert_eq!(timestamp, 4);
                assert!(reason.contains("own transaction"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!Schema::new(&conn).has_table("wrapped").unwrap());
        assert_eq!(
            ledger.failed_entry().unwrap().unwrap().completion,
            Completion::Failed
        );

        // The failed entry goes through once transactional execution is off.
        let outcome = Executor::new(&catalog, &binder, &ledger, false)
            .apply_pending(&mut log)
            .unwrap();
        assert_eq!(outcome.watermark(), Some(4));
        assert!(!outcome.is_halted());
        assert!(Schema::new(&conn).has_table("wrapped").unwrap());
    }

    #[test]
    fn test_downgrade_uses_stored_direction() {
        let conn = Connection::open_in_memory().unwrap();
        let ledger = LedgerStore::open(&conn, DEFAULT_LEDGER_TABLE).unwrap();
        let (catalog, binder) = setup();
        let mut log = BatchLog::new(false);
        record(&ledger, Direction::Up, &[1, 2]);
        let executor = Executor::new(&catalog, &binder, &ledger, true);
        executor.apply_pending(&mut log).unwrap();

        record(&ledger, Direction::Down, &[2, 1]);
        let outcome = executor.apply_pending(&mut log).unwrap();
        assert_eq!(outcome.watermark(), Some(0));
        assert!(ledger.entries(None, SortOrder::OldestFirst).unwrap().is_empty());
        assert_eq!(Schema::new(&conn).tables().unwrap(), vec!["migrations"]);
        assert_eq!(
            log.messages().last().map(|m| m.text.as_str()),
            Some("Downgrade from 1: done")
        );
    }
}
