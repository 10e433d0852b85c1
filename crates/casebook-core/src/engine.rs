//! Action surface.
//!
//! [`Migrations`] ties the catalog, ledger, planner, and executor together and
//! exposes the actions a front-end invokes. Every action produces an
//! [`ActionReport`]; domain failures end up in the report while storage and IO
//! failures propagate.

use crate::binding::CaseBinder;
use crate::catalog::{CaseRef, CaseRegistry, Catalog, DirectoryCatalog};
use crate::config::MigrationsConfig;
use crate::error::{Error, Result};
use crate::executor::{ExecutionOutcome, Executor};
use crate::ledger::{LedgerEntry, LedgerStore};
use crate::log::{BatchLog, LogMessage};
use crate::planner::{Plan, Planner};
use rusqlite::Connection;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Message logged when an outstanding entry blocks an action.
pub const BLOCKED_MESSAGE: &str = "You have a failed case! Fix it and use retry.";

/// Actions the engine performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Upgrade to a target, or to the newest case.
    Migrate,
    /// Undo the most recent step group, or downgrade to a target.
    Rollback,
    /// Downgrade to a target, or undo everything.
    Reset,
    /// Undo everything, then apply everything.
    Refresh,
    /// Drop every view and table, then apply everything.
    Fresh,
    /// Resume the outstanding batch.
    Retry,
    /// Convert legacy case files to the current naming grammar.
    UpgradeLegacy,
}

impl Action {
    /// Every action.
    pub const ALL: [Action; 7] = [
        Action::Migrate,
        Action::Rollback,
        Action::Reset,
        Action::Refresh,
        Action::Fresh,
        Action::Retry,
        Action::UpgradeLegacy,
    ];

    /// Action name.
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Migrate => "migrate",
            Action::Rollback => "rollback",
            Action::Reset => "reset",
            Action::Refresh => "refresh",
            Action::Fresh => "fresh",
            Action::Retry => "retry",
            Action::UpgradeLegacy => "upgrade-legacy",
        }
    }

    /// Whether the action runs even while an entry is outstanding.
    pub fn bypasses_guard(self) -> bool {
        matches!(self, Action::Retry | Action::Fresh)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        Action::ALL
            .into_iter()
            .find(|action| action.as_str() == name)
            .ok_or_else(|| Error::UnknownAction(s.to_string()))
    }
}

/// Outcome of one action.
#[derive(Debug, Serialize)]
pub struct ActionReport {
    /// The action that ran.
    pub action: Action,
    /// Requested target, if any.
    pub target: Option<i64>,
    /// Log messages in execution order.
    pub messages: Vec<LogMessage>,
    /// Whether anything failed.
    pub failed: bool,
    /// The domain error that stopped the action.
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<Error>,
    /// Watermark after the action.
    pub watermark: i64,
}

impl ActionReport {
    /// Whether the action finished without failure.
    pub fn is_success(&self) -> bool {
        !self.failed
    }
}

fn serialize_error<S: Serializer>(
    error: &Option<Error>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Status snapshot for display.
#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    /// Highest applied timestamp, or 0.
    pub watermark: i64,
    /// The entry defining the watermark.
    pub current: Option<LedgerEntry>,
    /// The oldest outstanding entry, which blocks new plans.
    pub blocked_by: Option<LedgerEntry>,
    /// Cases an upgrade could target.
    pub upgrade_targets: Vec<CaseRef>,
    /// Cases a downgrade could target, ending with 0.
    pub downgrade_targets: Vec<CaseRef>,
    /// Whether legacy case files are waiting for an upgrade.
    pub legacy_available: bool,
}

/// The migration engine.
pub struct Migrations {
    conn: Connection,
    config: MigrationsConfig,
    catalog: Catalog,
    binder: CaseBinder,
    directory: DirectoryCatalog,
    log: BatchLog,
}

impl Migrations {
    /// Engine over script cases found under `config.cases_path`.
    pub fn open(conn: Connection, config: MigrationsConfig) -> Result<Self> {
        let directory = DirectoryCatalog::from_config(&config)?;
        let catalog = Catalog::new().with_provider(directory.clone());
        Self::assemble(conn, config, catalog, CaseBinder::new(), directory)
    }

    /// Engine over registered cases and script cases. Registered cases win
    /// timestamp collisions.
    pub fn with_registry(
        conn: Connection,
        config: MigrationsConfig,
        registry: CaseRegistry,
    ) -> Result<Self> {
        let registry = Arc::new(registry);
        let directory = DirectoryCatalog::from_config(&config)?;
        let catalog = Catalog::new()
            .with_provider(Arc::clone(&registry))
            .with_provider(directory.clone());
        let binder = CaseBinder::new().with_registry(registry);
        Self::assemble(conn, config, catalog, binder, directory)
    }

    fn assemble(
        conn: Connection,
        config: MigrationsConfig,
        catalog: Catalog,
        binder: CaseBinder,
        directory: DirectoryCatalog,
    ) -> Result<Self> {
        LedgerStore::open(&conn, config.ledger_table.as_str())?;
        let log = BatchLog::new(config.log);
        info!(
            cases_path = %config.cases_path.display(),
            table = %config.ledger_table,
            providers = catalog.provider_count(),
            "migrations engine ready"
        );

        Ok(Self {
            conn,
            config,
            catalog,
            binder,
            directory,
            log,
        })
    }

    /// Run an action.
    pub fn run(&mut self, action: Action, target: Option<i64>) -> Result<ActionReport> {
        self.log.reset();
        info!(%action, ?target, "running action");

        let error = match self.dispatch(action, target) {
            Ok(()) => None,
            Err(e) if e.is_domain() => Some(e),
            Err(e) => return Err(e),
        };

        Ok(ActionReport {
            action,
            target,
            messages: self.log.messages().to_vec(),
            failed: self.log.has_failure() || error.is_some(),
            error,
            watermark: self.watermark()?,
        })
    }

    /// Upgrade to `target`, or to the newest case.
    pub fn migrate(&mut self, target: Option<i64>) -> Result<ActionReport> {
        self.run(Action::Migrate, target)
    }

    /// Undo the most recent step group, or downgrade to `target`.
    pub fn rollback(&mut self, target: Option<i64>) -> Result<ActionReport> {
        self.run(Action::Rollback, target)
    }

    /// Downgrade to `target`, or undo everything.
    pub fn reset(&mut self, target: Option<i64>) -> Result<ActionReport> {
        self.run(Action::Reset, target)
    }

    /// Undo everything, then apply everything.
    pub fn refresh(&mut self) -> Result<ActionReport> {
        self.run(Action::Refresh, None)
    }

    /// Drop every view and table, then apply everything.
    pub fn fresh(&mut self) -> Result<ActionReport> {
        self.run(Action::Fresh, None)
    }

    /// Resume the outstanding batch.
    pub fn retry(&mut self) -> Result<ActionReport> {
        self.run(Action::Retry, None)
    }

    /// Convert legacy case files to the current naming grammar.
    pub fn upgrade_legacy(&mut self) -> Result<ActionReport> {
        self.run(Action::UpgradeLegacy, None)
    }

    /// Status snapshot.
    pub fn overview(&self) -> Result<Overview> {
        let ledger = self.ledger();
        let planner = Planner::new(&self.catalog, &ledger);
        Ok(Overview {
            watermark: ledger.current_timestamp()?,
            current: ledger.current_entry()?,
            blocked_by: ledger.failed_entry()?,
            upgrade_targets: planner.upgrade_targets()?,
            downgrade_targets: planner.downgrade_targets()?,
            legacy_available: !self.directory.legacy_cases().is_empty(),
        })
    }

    /// Messages of the last action.
    pub fn last_log(&self) -> &[LogMessage] {
        self.log.messages()
    }

    /// Highest applied timestamp, or 0.
    pub fn watermark(&self) -> Result<i64> {
        self.ledger().current_timestamp()
    }

    /// The managed database.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// The ledger.
    pub fn ledger(&self) -> LedgerStore<'_> {
        ledger_store(&self.conn, &self.config)
    }

    /// The merged case catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The active configuration.
    pub fn config(&self) -> &MigrationsConfig {
        &self.config
    }

    fn dispatch(&mut self, action: Action, target: Option<i64>) -> Result<()> {
        if !action.bypasses_guard() {
            self.guard()?;
        }

        match action {
            Action::Migrate => {
                self.upgrade(target)?;
            }
            Action::Rollback => {
                let target = match target {
                    Some(target) => target,
                    None => Planner::new(&self.catalog, &self.ledger()).default_rollback_target()?,
                };
                self.downgrade(Some(target))?;
            }
            Action::Reset => {
                self.downgrade(target)?;
            }
            Action::Refresh => {
                self.downgrade(None)?;
                self.upgrade(None)?;
            }
            Action::Fresh => {
                self.ledger().drop_all_tables()?;
                self.upgrade(None)?;
            }
            Action::Retry => {
                if self.ledger().has_outstanding()? {
                    self.apply()?;
                } else {
                    self.log.info("There is nothing to fix!");
                }
            }
            Action::UpgradeLegacy => self.upgrade_legacy_cases()?,
        }
        Ok(())
    }

    /// Refuse to plan while any entry is outstanding.
    fn guard(&mut self) -> Result<()> {
        let blocking = self.ledger().failed_entry()?;
        let Some(entry) = blocking else {
            return Ok(());
        };

        self.log.failure(BLOCKED_MESSAGE);
        Err(Error::BlockedByPriorFailure {
            timestamp: entry.timestamp,
            direction: entry.direction,
            step_group: entry.step_group.to_string(),
            created_at: entry.created_at.to_string(),
        })
    }

    fn upgrade(&mut self, target: Option<i64>) -> Result<()> {
        let plan = Planner::new(&self.catalog, &self.ledger()).plan_upgrade(target);
        self.record_and_apply(plan)
    }

    fn downgrade(&mut self, target: Option<i64>) -> Result<()> {
        let plan = Planner::new(&self.catalog, &self.ledger()).plan_downgrade(target);
        self.record_and_apply(plan)
    }

    fn record_and_apply(&mut self, plan: Result<Plan>) -> Result<()> {
        let batch = match plan {
            Ok(Plan::Ready(batch)) => batch,
            Ok(Plan::Nothing(reason)) => {
                self.log.info(reason.to_string());
                return Ok(());
            }
            Err(e) if e.is_domain() => {
                self.log.failure(e.to_string());
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        self.ledger().record_batch(&batch)?;
        info!(
            step_group = %batch.step_group,
            direction = %batch.direction,
            cases = batch.cases.len(),
            "batch planned"
        );
        self.apply()
    }

    fn apply(&mut self) -> Result<()> {
        let ledger = ledger_store(&self.conn, &self.config);
        let executor = Executor::new(
            &self.catalog,
            &self.binder,
            &ledger,
            self.config.transactional,
        );
        match executor.apply_pending(&mut self.log)? {
            ExecutionOutcome::Halted { error, .. } => Err(error),
            ExecutionOutcome::Idle | ExecutionOutcome::Completed { .. } => Ok(()),
        }
    }

    fn upgrade_legacy_cases(&mut self) -> Result<()> {
        if self.directory.legacy_cases().is_empty() {
            self.log
                .info("There is no case matched old migration cases pattern.");
            return Ok(());
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        for case in self.directory.upgrade_legacy(now_ms)? {
            self.log.info(format!(
                "Legacy case {} is now {}",
                case.version.as_deref().unwrap_or_default(),
                case.timestamp
            ));
        }
        self.log.info("Upgrade done.");
        Ok(())
    }
}

fn ledger_store<'c>(conn: &'c Connection, config: &MigrationsConfig) -> LedgerStore<'c> {
    LedgerStore::attach(conn, config.ledger_table.as_str())
}
