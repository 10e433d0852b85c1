//! Upgrade and downgrade planning.
//!
//! The planner reads the catalog and the ledger watermark and decides which
//! cases a batch must run, in which direction and order. It never writes; the
//! resulting [`Batch`] is recorded by the caller.

use crate::catalog::{CaseRef, Catalog};
use crate::error::{Error, Result};
use crate::ledger::{Direction, LedgerStore, SortOrder, StepGroup};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// A planned batch: cases sharing one step group and one direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    /// Token shared by every entry of the batch.
    pub step_group: StepGroup,
    /// Direction every case runs in.
    pub direction: Direction,
    /// Cases in execution order.
    pub cases: Vec<CaseRef>,
}

impl Batch {
    fn new(direction: Direction, cases: Vec<CaseRef>) -> Self {
        Self {
            step_group: StepGroup::generate(),
            direction,
            cases,
        }
    }

    /// Timestamps in execution order.
    pub fn timestamps(&self) -> Vec<i64> {
        self.cases.iter().map(|case| case.timestamp).collect()
    }
}

/// Why a plan came out empty. Not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum NothingToDo {
    /// No case lies between the watermark and the target.
    NothingToDo,
    /// The watermark already equals the target.
    AlreadyAtTarget {
        /// Requested target.
        target: i64,
        /// Direction that was requested.
        direction: Direction,
    },
    /// An upgrade target lies below the watermark.
    TargetBehindWatermark {
        /// Current watermark.
        watermark: i64,
    },
    /// A downgrade target lies above the watermark.
    TargetAheadOfWatermark {
        /// Current watermark.
        watermark: i64,
    },
}

impl fmt::Display for NothingToDo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NothingToDo::NothingToDo => write!(f, "There is nothing to do!"),
            NothingToDo::AlreadyAtTarget {
                target,
                direction: Direction::Up,
            } => write!(f, "Already migrated to '{target}'!"),
            NothingToDo::AlreadyAtTarget {
                target,
                direction: Direction::Down,
            } => write!(f, "The db timestamp already is '{target}'!"),
            NothingToDo::TargetBehindWatermark { watermark } => write!(
                f,
                "Choose a case with a higher timestamp than '{watermark}' or use rollback!"
            ),
            NothingToDo::TargetAheadOfWatermark { .. } => {
                write!(f, "Choose an older migration case or use migrate!")
            }
        }
    }
}

/// Outcome of planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// A batch ready to record and run.
    Ready(Batch),
    /// Nothing to run.
    Nothing(NothingToDo),
}

/// Computes batches from the catalog and the ledger.
pub struct Planner<'a, 'c> {
    catalog: &'a Catalog,
    ledger: &'a LedgerStore<'c>,
}

impl<'a, 'c> Planner<'a, 'c> {
    /// Create a planner.
    pub fn new(catalog: &'a Catalog, ledger: &'a LedgerStore<'c>) -> Self {
        Self { catalog, ledger }
    }

    /// Highest applied timestamp, or 0.
    pub fn watermark(&self) -> Result<i64> {
        self.ledger.current_timestamp()
    }

    /// Plan an upgrade to `target`, or to the newest case.
    pub fn plan_upgrade(&self, target: Option<i64>) -> Result<Plan> {
        let watermark = self.watermark()?;

        if let Some(target) = target {
            if self.catalog.find_by_timestamp(target)?.is_none() {
                return Err(Error::TargetNotFound { timestamp: target });
            }
            if target == watermark {
                return Ok(Plan::Nothing(NothingToDo::AlreadyAtTarget {
                    target,
                    direction: Direction::Up,
                }));
            }
            if target < watermark {
                return Ok(Plan::Nothing(NothingToDo::TargetBehindWatermark { watermark }));
            }
        }

        let cases: Vec<CaseRef> = self
            .catalog
            .cases_after(watermark)?
            .iter()
            .filter(|case| target.map_or(true, |target| case.timestamp <= target))
            .map(CaseRef::from)
            .collect();

        if cases.is_empty() {
            return Ok(Plan::Nothing(NothingToDo::NothingToDo));
        }
        Ok(Plan::Ready(Batch::new(Direction::Up, cases)))
    }

    /// Plan a downgrade to `target`, or to 0. The target case itself stays
    /// applied; every applied case above it is undone, newest first.
    pub fn plan_downgrade(&self, target: Option<i64>) -> Result<Plan> {
        let target = target.unwrap_or(0);
        if target < 0 {
            return Err(Error::InvalidTarget { timestamp: target });
        }

        let watermark = self.watermark()?;
        if target > watermark {
            return Ok(Plan::Nothing(NothingToDo::TargetAheadOfWatermark { watermark }));
        }
        if target > 0 && self.ledger.find_applied(target)?.is_none() {
            return Err(Error::TargetNotFound { timestamp: target });
        }
        if target == watermark && target > 0 {
            return Ok(Plan::Nothing(NothingToDo::AlreadyAtTarget {
                target,
                direction: Direction::Down,
            }));
        }

        let cases: Vec<CaseRef> = self
            .applied_newest_first()?
            .into_iter()
            .filter(|case| case.timestamp > target && case.timestamp <= watermark)
            .collect();

        if cases.is_empty() {
            return Ok(Plan::Nothing(NothingToDo::NothingToDo));
        }
        Ok(Plan::Ready(Batch::new(Direction::Down, cases)))
    }

    /// Target of a default rollback: undo the most recent step group and keep
    /// the newest case of the group before it, or go to 0 when there is none.
    pub fn default_rollback_target(&self) -> Result<i64> {
        let entries = self.ledger.entries(None, SortOrder::NewestFirst)?;
        let Some(latest) = entries.first() else {
            return Ok(0);
        };

        Ok(entries
            .iter()
            .find(|entry| entry.step_group != latest.step_group)
            .map_or(0, |carry| carry.timestamp))
    }

    /// Cases an upgrade could target.
    pub fn upgrade_targets(&self) -> Result<Vec<CaseRef>> {
        let watermark = self.watermark()?;
        Ok(self
            .catalog
            .cases_after(watermark)?
            .iter()
            .map(CaseRef::from)
            .collect())
    }

    /// Cases a downgrade could target, newest first. The current case is left
    /// out because downgrading to it is a no-op; 0 closes the list.
    pub fn downgrade_targets(&self) -> Result<Vec<CaseRef>> {
        let mut targets = self.applied_newest_first()?;
        if targets.is_empty() {
            return Ok(targets);
        }
        targets.remove(0);
        targets.push(CaseRef {
            timestamp: 0,
            label: String::new(),
        });
        Ok(targets)
    }

    fn applied_newest_first(&self) -> Result<Vec<CaseRef>> {
        let mut entries = self.ledger.applied_entries(SortOrder::NewestFirst)?;
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let mut seen = HashSet::new();
        let mut cases = Vec::with_capacity(entries.len());
        for entry in entries {
            if !seen.insert(entry.timestamp) {
                continue;
            }
            let label = match entry.name {
                Some(name) => name,
                None => self
                    .catalog
                    .find_by_timestamp(entry.timestamp)?
                    .map(|case| case.label())
                    .unwrap_or_default(),
            };
            cases.push(CaseRef {
                timestamp: entry.timestamp,
                label,
            });
        }
        Ok(cases)
    }
}
