//! SQLite-backed ledger persistence.
//!
//! The ledger lives in the same database as the schema it tracks. Older ledger
//! layouts are upgraded in place before first use.

use super::{Completion, Direction, LedgerEntry, SortOrder, StepGroup};
use crate::binding::schema::{quote_ident, Schema};
use crate::error::Result;
use crate::planner::Batch;
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

/// Default name of the ledger table.
pub const DEFAULT_LEDGER_TABLE: &str = "migrations";

/// Millisecond-resolution `now`, so entries planned within one second still order.
const NOW_MS: &str = "strftime('%Y-%m-%d %H:%M:%f', 'now')";

const SELECT_COLUMNS: &str = "id, CAST(timestamp AS INTEGER), name, CAST(status AS INTEGER), \
     CAST(result AS INTEGER), CAST(step_id AS TEXT), CAST(created_at AS TEXT)";

/// Ledger store over a borrowed connection.
pub struct LedgerStore<'c> {
    conn: &'c Connection,
    table: String,
}

impl<'c> LedgerStore<'c> {
    /// Open the ledger, creating or upgrading its table as needed.
    pub fn open(conn: &'c Connection, table: impl Into<String>) -> Result<Self> {
        let store = Self::attach(conn, table);
        store.ensure()?;
        Ok(store)
    }

    /// Bind to the ledger table without touching its structure.
    pub fn attach(conn: &'c Connection, table: impl Into<String>) -> Self {
        Self {
            conn,
            table: table.into(),
        }
    }

    /// The underlying connection.
    pub fn connection(&self) -> &'c Connection {
        self.conn
    }

    /// The ledger table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the table if absent and upgrade older layouts.
    pub fn ensure(&self) -> Result<()> {
        self.create_table()?;
        self.upgrade_table()?;
        Ok(())
    }

    /// Create the ledger table. Returns whether it was created.
    pub fn create_table(&self) -> Result<bool> {
        let schema = Schema::new(self.conn);
        if schema.has_table(&self.table)? {
            return Ok(false);
        }

        let created_at = format!("created_at TEXT NOT NULL DEFAULT ({NOW_MS})");
        schema.create_table(
            &self.table,
            &[
                "id INTEGER PRIMARY KEY AUTOINCREMENT",
                "timestamp INTEGER NOT NULL DEFAULT 0",
                "name VARCHAR(100) NULL",
                "status SMALLINT NOT NULL DEFAULT 0",
                "result SMALLINT NOT NULL DEFAULT 0",
                "step_id VARCHAR(32) NOT NULL DEFAULT '0'",
                &created_at,
            ],
        )?;
        self.create_index()?;

        info!(table = %self.table, "migrations table has been created");
        Ok(true)
    }

    /// Upgrade the legacy layout (`version`/`stepId`, no `name`). Returns whether
    /// anything changed.
    ///
    /// The steps commit together, so a failed upgrade leaves the legacy layout
    /// in place for the next attempt.
    pub fn upgrade_table(&self) -> Result<bool> {
        let schema = Schema::new(self.conn);
        let columns = schema.columns(&self.table)?;
        if !columns.iter().any(|c| c == "version") {
            return Ok(false);
        }

        let tx = self.conn.unchecked_transaction()?;
        schema.rename_column(&self.table, "version", "timestamp")?;
        if columns.iter().any(|c| c == "stepId") {
            schema.rename_column(&self.table, "stepId", "step_id")?;
        }
        if !columns.iter().any(|c| c == "name") {
            schema.add_column(&self.table, "name VARCHAR(100) NULL")?;
        }
        self.create_index()?;
        tx.commit()?;

        info!(table = %self.table, "migrations table has been upgraded");
        Ok(true)
    }

    fn create_index(&self) -> Result<()> {
        let index = quote_ident(&format!("{}_timestamp_idx", self.table));
        self.conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS {index} ON {} (timestamp)",
            quote_ident(&self.table)
        ))?;
        Ok(())
    }

    /// Record one planned case application. Returns the new entry id.
    pub fn record_planned(
        &self,
        timestamp: i64,
        name: &str,
        direction: Direction,
        step_group: &StepGroup,
    ) -> Result<i64> {
        self.conn.execute(
            &format!(
                "INSERT INTO {} (timestamp, name, status, result, step_id, created_at) \
                 VALUES (?1, ?2, ?3, 0, ?4, {NOW_MS})",
                quote_ident(&self.table)
            ),
            params![timestamp, name, direction.as_status(), step_group.as_str()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Record every case of a planned batch atomically, in planned order.
    pub fn record_batch(&self, batch: &Batch) -> Result<Vec<i64>> {
        let tx = self.conn.unchecked_transaction()?;
        let ids = batch
            .cases
            .iter()
            .map(|case| {
                self.record_planned(case.timestamp, &case.label, batch.direction, &batch.step_group)
            })
            .collect::<Result<Vec<_>>>()?;
        tx.commit()?;
        Ok(ids)
    }

    /// Store the outcome of an entry.
    ///
    /// A successful downgrade erases every row for the entry's timestamp, undoing
    /// history instead of appending to it.
    pub fn mark_result(&self, id: i64, direction: Direction, succeeded: bool) -> Result<()> {
        let table = quote_ident(&self.table);

        if direction == Direction::Down && succeeded {
            let timestamp: Option<i64> = self
                .conn
                .query_row(
                    &format!("SELECT CAST(timestamp AS INTEGER) FROM {table} WHERE id = ?1"),
                    [id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(timestamp) = timestamp {
                self.conn.execute(
                    &format!("DELETE FROM {table} WHERE CAST(timestamp AS INTEGER) = ?1"),
                    [timestamp],
                )?;
            }
            return Ok(());
        }

        let completion = if succeeded {
            Completion::Succeeded
        } else {
            Completion::Failed
        };
        self.conn.execute(
            &format!("UPDATE {table} SET result = ?2 WHERE id = ?1"),
            params![id, completion.as_result()],
        )?;
        Ok(())
    }

    /// Outstanding entries: planned and not yet succeeded, including failed
    /// entries awaiting a retry.
    pub fn pending_entries(&self, limit: Option<usize>, order: SortOrder) -> Result<Vec<LedgerEntry>> {
        self.select("CAST(result AS INTEGER) <= 0", limit, order)
    }

    /// The oldest outstanding entry, which blocks new plans.
    pub fn failed_entry(&self) -> Result<Option<LedgerEntry>> {
        Ok(self
            .pending_entries(Some(1), SortOrder::OldestFirst)?
            .into_iter()
            .next())
    }

    /// Whether any entry is outstanding.
    pub fn has_outstanding(&self) -> Result<bool> {
        Ok(self.failed_entry()?.is_some())
    }

    /// All entries.
    pub fn entries(&self, limit: Option<usize>, order: SortOrder) -> Result<Vec<LedgerEntry>> {
        self.select("1 = 1", limit, order)
    }

    /// Succeeded forward entries.
    pub fn applied_entries(&self, order: SortOrder) -> Result<Vec<LedgerEntry>> {
        self.select(
            "CAST(result AS INTEGER) > 0 AND CAST(status AS INTEGER) >= 0",
            None,
            order,
        )
    }

    /// The succeeded forward entry for a timestamp, if any.
    pub fn find_applied(&self, timestamp: i64) -> Result<Option<LedgerEntry>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM {} \
             WHERE CAST(result AS INTEGER) > 0 AND CAST(status AS INTEGER) >= 0 \
             AND CAST(timestamp AS INTEGER) = ?1 ORDER BY id DESC LIMIT 1",
            quote_ident(&self.table)
        );
        Ok(self
            .conn
            .query_row(&sql, [timestamp], entry_from_row)
            .optional()?)
    }

    /// Step group of the most recently planned entry.
    pub fn most_recent_group(&self) -> Result<Option<StepGroup>> {
        Ok(self
            .entries(Some(1), SortOrder::NewestFirst)?
            .into_iter()
            .next()
            .map(|entry| entry.step_group))
    }

    /// The watermark: highest timestamp among succeeded forward entries, or 0.
    pub fn current_timestamp(&self) -> Result<i64> {
        let sql = format!(
            "SELECT COALESCE(MAX(CAST(timestamp AS INTEGER)), 0) FROM {} \
             WHERE CAST(result AS INTEGER) > 0 AND CAST(status AS INTEGER) >= 0",
            quote_ident(&self.table)
        );
        Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
    }

    /// The entry that defines the watermark.
    pub fn current_entry(&self) -> Result<Option<LedgerEntry>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM {} \
             WHERE CAST(result AS INTEGER) > 0 AND CAST(status AS INTEGER) >= 0 \
             ORDER BY CAST(timestamp AS INTEGER) DESC, id DESC LIMIT 1",
            quote_ident(&self.table)
        );
        Ok(self.conn.query_row(&sql, [], entry_from_row).optional()?)
    }

    /// Drop every view and table of the database, the ledger included, then
    /// recreate the ledger.
    pub fn drop_all_tables(&self) -> Result<usize> {
        let dropped = Schema::new(self.conn).drop_all()?;
        info!(dropped, "all tables dropped");
        self.ensure()?;
        Ok(dropped)
    }

    fn select(
        &self,
        filter: &str,
        limit: Option<usize>,
        order: SortOrder,
    ) -> Result<Vec<LedgerEntry>> {
        let limit = limit.map_or(-1, |l| l as i64);
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM {} WHERE {filter} ORDER BY {} LIMIT ?1",
            quote_ident(&self.table),
            order.sql()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let entries = stmt
            .query_map([limit], entry_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let created_at: Option<String> = row.get(6)?;
    Ok(LedgerEntry {
        id: row.get(0)?,
        timestamp: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
        name: row.get(2)?,
        direction: Direction::from_status(row.get::<_, Option<i64>>(3)?.unwrap_or(0)),
        completion: Completion::from_result(row.get::<_, Option<i64>>(4)?.unwrap_or(0)),
        step_group: StepGroup::from_raw(row.get::<_, Option<String>>(5)?.unwrap_or_default()),
        created_at: created_at.as_deref().map(parse_created_at).unwrap_or_default(),
    })
}

/// Parse `created_at` as written by this store or by older layouts.
fn parse_created_at(raw: &str) -> NaiveDateTime {
    const FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CaseRef;

    fn open() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    fn group(raw: &str) -> StepGroup {
        StepGroup::from_raw(raw)
    }

    #[test]
    fn test_create_table_once() {
        let conn = open();
        let store = LedgerStore::attach(&conn, DEFAULT_LEDGER_TABLE);
        assert!(store.create_table().unwrap());
        assert!(!store.create_table().unwrap());
        assert_eq!(
            Schema::new(&conn).columns("migrations").unwrap(),
            vec!["id", "timestamp", "name", "status", "result", "step_id", "created_at"]
        );
    }

    #[test]
    fn test_record_and_mark_forward() {
        let conn = open();
        let store = LedgerStore::open(&conn, DEFAULT_LEDGER_TABLE).unwrap();
        assert_eq!(store.current_timestamp().unwrap(), 0);

        let id = store
            .record_planned(100, "create_users", Direction::Up, &group("g1"))
            .unwrap();
        let pending = store.pending_entries(None, SortOrder::OldestFirst).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].completion, Completion::Pending);
        assert_eq!(pending[0].name.as_deref(), Some("create_users"));

        store.mark_result(id, Direction::Up, true).unwrap();
        assert!(store.pending_entries(None, SortOrder::OldestFirst).unwrap().is_empty());
        assert_eq!(store.current_timestamp().unwrap(), 100);

        // Forward success keeps the row.
        assert_eq!(store.entries(None, SortOrder::NewestFirst).unwrap().len(), 1);
        assert_eq!(store.current_entry().unwrap().unwrap().timestamp, 100);
    }

    #[test]
    fn test_successful_downgrade_deletes_rows() {
        let conn = open();
        let store = LedgerStore::open(&conn, DEFAULT_LEDGER_TABLE).unwrap();

        let up = store.record_planned(100, "a", Direction::Up, &group("g1")).unwrap();
        store.mark_result(up, Direction::Up, true).unwrap();
        let down = store.record_planned(100, "a", Direction::Down, &group("g2")).unwrap();
        store.mark_result(down, Direction::Down, true).unwrap();

        assert!(store.entries(None, SortOrder::OldestFirst).unwrap().is_empty());
        assert_eq!(store.current_timestamp().unwrap(), 0);
    }

    #[test]
    fn test_failed_entry_blocks() {
        let conn = open();
        let store = LedgerStore::open(&conn, DEFAULT_LEDGER_TABLE).unwrap();

        let a = store.record_planned(100, "a", Direction::Up, &group("g1")).unwrap();
        let b = store.record_planned(200, "b", Direction::Up, &group("g1")).unwrap();
        store.record_planned(300, "c", Direction::Up, &group("g1")).unwrap();
        store.mark_result(a, Direction::Up, true).unwrap();
        store.mark_result(b, Direction::Up, false).unwrap();

        let failed = store.failed_entry().unwrap().unwrap();
        assert_eq!(failed.timestamp, 200);
        assert_eq!(failed.completion, Completion::Failed);
        assert!(store.has_outstanding().unwrap());
        assert_eq!(store.pending_entries(None, SortOrder::OldestFirst).unwrap().len(), 2);
        assert_eq!(store.current_timestamp().unwrap(), 100);
    }

    #[test]
    fn test_record_batch_and_groups() {
        let conn = open();
        let store = LedgerStore::open(&conn, DEFAULT_LEDGER_TABLE).unwrap();
        assert!(store.most_recent_group().unwrap().is_none());

        let batch = Batch {
            step_group: group("g7"),
            direction: Direction::Up,
            cases: vec![
                CaseRef { timestamp: 1, label: "one".into() },
                CaseRef { timestamp: 2, label: "two".into() },
            ],
        };
        let ids = store.record_batch(&batch).unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids[0] < ids[1]);
        assert_eq!(store.most_recent_group().unwrap(), Some(group("g7")));

        let newest = store.entries(None, SortOrder::NewestFirst).unwrap();
        assert_eq!(newest[0].timestamp, 2);
        assert_eq!(newest[1].timestamp, 1);
    }

    #[test]
    fn test_legacy_layout_upgrade_preserves_rows() {
        let conn = open();
        conn.execute_batch(
            "CREATE TABLE migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                version VARCHAR(14) NOT NULL DEFAULT 0,
                status BOOLEAN NOT NULL DEFAULT 0,
                result BOOLEAN NOT NULL DEFAULT 0,
                stepId VARCHAR(14) NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
             );
             INSERT INTO migrations (version, status, result, stepId, created_at)
                VALUES ('1600000000001', 1, 1, '5f1a', '2021-01-02 03:04:05');",
        )
        .unwrap();

        let store = LedgerStore::open(&conn, DEFAULT_LEDGER_TABLE).unwrap();
        let columns = Schema::new(&conn).columns("migrations").unwrap();
        assert!(columns.contains(&"timestamp".to_string()));
        assert!(columns.contains(&"step_id".to_string()));
        assert!(columns.contains(&"name".to_string()));
        assert!(!columns.contains(&"version".to_string()));

        assert_eq!(store.current_timestamp().unwrap(), 1600000000001);
        let entry = store.find_applied(1600000000001).unwrap().unwrap();
        assert_eq!(entry.step_group, group("5f1a"));
        assert_eq!(entry.name, None);
        assert_eq!(entry.created_at.to_string(), "2021-01-02 03:04:05");

        // A second open is a no-op.
        assert!(!store.upgrade_table().unwrap());
    }

    #[test]
    fn test_failed_layout_upgrade_is_rolled_back() {
        let conn = open();
        // `step_id` already exists, so renaming `stepId` fails midway.
        conn.execute_batch(
            "CREATE TABLE migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                version VARCHAR(14) NOT NULL DEFAULT 0,
                status BOOLEAN NOT NULL DEFAULT 0,
                result BOOLEAN NOT NULL DEFAULT 0,
                stepId VARCHAR(14) NOT NULL DEFAULT 0,
                step_id VARCHAR(14) NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
             );",
        )
        .unwrap();

        assert!(LedgerStore::open(&conn, DEFAULT_LEDGER_TABLE).is_err());
        let columns = Schema::new(&conn).columns("migrations").unwrap();
        assert!(columns.contains(&"version".to_string()));
        assert!(!columns.contains(&"timestamp".to_string()));
        assert!(!columns.contains(&"name".to_string()));

        conn.execute_batch("ALTER TABLE migrations DROP COLUMN step_id").unwrap();
        let store = LedgerStore::open(&conn, DEFAULT_LEDGER_TABLE).unwrap();
        assert_eq!(store.current_timestamp().unwrap(), 0);
        assert!(Schema::new(&conn).has_column("migrations", "step_id").unwrap());
    }

    #[test]
    fn test_drop_all_tables_recreates_ledger() {
        let conn = open();
        let store = LedgerStore::open(&conn, DEFAULT_LEDGER_TABLE).unwrap();
        conn.execute_batch(
            "CREATE TABLE products (id INTEGER);
             CREATE VIEW product_ids AS SELECT id FROM products;",
        )
        .unwrap();
        let id = store.record_planned(5, "p", Direction::Up, &group("g")).unwrap();
        store.mark_result(id, Direction::Up, true).unwrap();

        assert_eq!(store.drop_all_tables().unwrap(), 3);
        let schema = Schema::new(&conn);
        assert_eq!(schema.tables().unwrap(), vec!["migrations"]);
        assert!(schema.views().unwrap().is_empty());
        assert_eq!(store.current_timestamp().unwrap(), 0);
    }

    #[test]
    fn test_parse_created_at_formats() {
        assert_eq!(
            parse_created_at("2024-05-06 07:08:09.123").to_string(),
            "2024-05-06 07:08:09.123"
        );
        assert_eq!(
            parse_created_at("2024-05-06 07:08:09").to_string(),
            "2024-05-06 07:08:09"
        );
        assert_eq!(parse_created_at("garbage"), NaiveDateTime::default());
    }
}
