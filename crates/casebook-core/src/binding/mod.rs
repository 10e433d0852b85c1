//! Case runtime binding.
//!
//! Resolves a [`MigrationCase`] to something invocable and builds the context
//! its `up`/`down` logic runs against.

pub mod schema;
pub mod script;

pub use schema::Schema;
pub use script::SqlScript;

use crate::catalog::{CaseRegistry, CaseSource, MigrationCase};
use crate::error::{Error, Result};
use crate::ledger::Direction;
use rusqlite::Connection;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Error type case logic may return.
pub type CaseError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a case's `up` or `down`. `Ok(false)` and `Err(_)` are both failures.
pub type CaseResult = std::result::Result<bool, CaseError>;

/// What case logic runs against: the database handle and the schema capability.
pub struct CaseContext<'a> {
    conn: &'a Connection,
    schema: Schema<'a>,
    case: &'a MigrationCase,
}

impl<'a> CaseContext<'a> {
    /// Build a context for one case invocation.
    pub fn new(conn: &'a Connection, case: &'a MigrationCase) -> Self {
        Self {
            conn,
            schema: Schema::new(conn),
            case,
        }
    }

    /// The database connection.
    pub fn db(&self) -> &'a Connection {
        self.conn
    }

    /// The schema-definition capability.
    pub fn schema(&self) -> &Schema<'a> {
        &self.schema
    }

    /// The case being applied.
    pub fn case(&self) -> &'a MigrationCase {
        self.case
    }
}

/// The case contract: forward and backward logic.
pub trait CaseLogic {
    /// Apply the case.
    fn up(&self, ctx: &CaseContext<'_>) -> CaseResult;

    /// Undo the case.
    fn down(&self, ctx: &CaseContext<'_>) -> CaseResult;

    /// Whether the logic issues its own `BEGIN`/`COMMIT`. Such logic cannot run
    /// inside the per-case transaction.
    fn manages_transaction(&self) -> bool {
        false
    }
}

/// Case logic built from two closures.
pub struct FnCase<U, D> {
    up: U,
    down: D,
}

impl<U, D> FnCase<U, D>
where
    U: Fn(&CaseContext<'_>) -> CaseResult,
    D: Fn(&CaseContext<'_>) -> CaseResult,
{
    /// Wrap `up` and `down` closures.
    pub fn new(up: U, down: D) -> Self {
        Self { up, down }
    }
}

impl<U, D> CaseLogic for FnCase<U, D>
where
    U: Fn(&CaseContext<'_>) -> CaseResult,
    D: Fn(&CaseContext<'_>) -> CaseResult,
{
    fn up(&self, ctx: &CaseContext<'_>) -> CaseResult {
        (self.up)(ctx)
    }

    fn down(&self, ctx: &CaseContext<'_>) -> CaseResult {
        (self.down)(ctx)
    }
}

/// Resolves cases to their logic.
#[derive(Clone, Default)]
pub struct CaseBinder {
    registry: Option<Arc<CaseRegistry>>,
}

impl CaseBinder {
    /// A binder for script cases only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also resolve registered cases through `registry`.
    pub fn with_registry(mut self, registry: Arc<CaseRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Resolve a case to its logic.
    pub fn bind(&self, case: &MigrationCase) -> Result<Arc<dyn CaseLogic>> {
        match &case.source {
            CaseSource::Script(path) => Ok(Arc::new(SqlScript::load(path)?)),
            CaseSource::Registered => self
                .registry
                .as_ref()
                .and_then(|registry| registry.logic(case.timestamp))
                .ok_or(Error::CaseNotRegistered {
                    timestamp: case.timestamp,
                }),
        }
    }
}

/// Invoke one direction of a case. Returns the failure reason on `Ok(false)`,
/// `Err(_)`, or a panic.
pub fn invoke(
    logic: &dyn CaseLogic,
    direction: Direction,
    ctx: &CaseContext<'_>,
) -> std::result::Result<(), String> {
    let outcome = catch_unwind(AssertUnwindSafe(|| match direction {
        Direction::Up => logic.up(ctx),
        Direction::Down => logic.down(ctx),
    }));

    match outcome {
        Ok(Ok(true)) => Ok(()),
        Ok(Ok(false)) => Err("returned false".to_string()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("panicked: {message}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(timestamp: i64, source: CaseSource) -> MigrationCase {
        MigrationCase {
            name: "t".into(),
            version: None,
            timestamp,
            declared_name: None,
            source,
        }
    }

    #[test]
    fn test_invoke_outcomes() {
        let conn = Connection::open_in_memory().unwrap();
        let case = case(1, CaseSource::Registered);
        let ctx = CaseContext::new(&conn, &case);

        let ok = FnCase::new(|_| Ok(true), |_| Ok(false));
        assert!(invoke(&ok, Direction::Up, &ctx).is_ok());
        assert_eq!(
            invoke(&ok, Direction::Down, &ctx).unwrap_err(),
            "returned false"
        );

        let erroring = FnCase::new(|_| Err("boom".into()), |_| Ok(true));
        assert_eq!(invoke(&erroring, Direction::Up, &ctx).unwrap_err(), "boom");

        let panicking = FnCase::new(|_| panic!("kaput"), |_| Ok(true));
        assert_eq!(
            invoke(&panicking, Direction::Up, &ctx).unwrap_err(),
            "panicked: kaput"
        );
    }

    #[test]
    fn test_context_exposes_database() {
        let conn = Connection::open_in_memory().unwrap();
        let case = case(7, CaseSource::Registered);
        let ctx = CaseContext::new(&conn, &case);

        let logic = FnCase::new(
            |ctx: &CaseContext<'_>| {
                ctx.schema().create_table("t7", &["id INTEGER"])?;
                Ok(ctx.case().timestamp == 7)
            },
            |_| Ok(true),
        );
        assert!(invoke(&logic, Direction::Up, &ctx).is_ok());
        assert!(ctx.schema().has_table("t7").unwrap());
    }

    #[test]
    fn test_bind_unregistered_case() {
        let binder = CaseBinder::new();
        let err = binder
            .bind(&case(3, CaseSource::Registered))
            .err()
            .unwrap();
        assert!(matches!(err, Error::CaseNotRegistered { timestamp: 3 }));
    }

    #[test]
    fn test_bind_script_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migration_case_t_1.sql");
        std::fs::write(&path, "-- +up\nCREATE TABLE t (id INTEGER);\n").unwrap();

        let binder = CaseBinder::new();
        let logic = binder.bind(&case(1, CaseSource::Script(path))).unwrap();
        let conn = Connection::open_in_memory().unwrap();
        let case = case(1, CaseSource::Registered);
        assert!(invoke(logic.as_ref(), Direction::Up, &CaseContext::new(&conn, &case)).is_ok());
    }
}
