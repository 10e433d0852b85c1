//! Schema-definition capability handed to case logic.
//!
//! A thin layer of SQLite DDL helpers. The ledger uses the same helpers to
//! create and upgrade its own table.

use crate::error::Result;
use rusqlite::Connection;

/// Quote an identifier for interpolation into DDL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Schema-definition capability over one connection.
#[derive(Clone, Copy)]
pub struct Schema<'c> {
    conn: &'c Connection,
}

impl<'c> Schema<'c> {
    /// Bind the capability to a connection.
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// User tables, sorted by name. SQLite's internal tables are excluded.
    pub fn tables(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// User views, sorted by name.
    pub fn views(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'view' ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Check whether a table exists.
    pub fn has_table(&self, table: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Column names of a table in declaration order. Empty if the table is absent.
    pub fn columns(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
        let names = stmt
            .query_map([table], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Check whether a table has a column.
    pub fn has_column(&self, table: &str, column: &str) -> Result<bool> {
        Ok(self.columns(table)?.iter().any(|c| c == column))
    }

    /// Create a table from raw column definitions, if it does not exist.
    pub fn create_table(&self, table: &str, columns: &[&str]) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(table),
            columns.join(", ")
        );
        self.conn.execute_batch(&sql)?;
        Ok(())
    }

    /// Drop a table if it exists.
    pub fn drop_table(&self, table: &str) -> Result<()> {
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))?;
        Ok(())
    }

    /// Drop a view if it exists.
    pub fn drop_view(&self, view: &str) -> Result<()> {
        self.conn
            .execute_batch(&format!("DROP VIEW IF EXISTS {}", quote_ident(view)))?;
        Ok(())
    }

    /// Rename a table.
    pub fn rename_table(&self, from: &str, to: &str) -> Result<()> {
        self.conn.execute_batch(&format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(from),
            quote_ident(to)
        ))?;
        Ok(())
    }

    /// Add a column from a raw column definition.
    pub fn add_column(&self, table: &str, definition: &str) -> Result<()> {
        self.conn.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {}",
            quote_ident(table),
            definition
        ))?;
        Ok(())
    }

    /// Rename a column.
    pub fn rename_column(&self, table: &str, from: &str, to: &str) -> Result<()> {
        self.conn.execute_batch(&format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            quote_ident(table),
            quote_ident(from),
            quote_ident(to)
        ))?;
        Ok(())
    }

    /// Run arbitrary SQL statements.
    pub fn execute(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Drop every user view and table. Returns the number of objects dropped.
    ///
    /// Views go first. Indexes and triggers go with their tables. Foreign key
    /// enforcement is suspended while dropping so parent tables can go before
    /// their children.
    pub fn drop_all(&self) -> Result<usize> {
        let views = self.views()?;
        for view in &views {
            self.drop_view(view)?;
        }

        let tables = self.tables()?;
        let fk_enabled: i64 = self
            .conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        if fk_enabled != 0 {
            self.conn.execute_batch("PRAGMA foreign_keys = OFF")?;
        }

        let dropped = tables
            .iter()
            .try_fold(views.len(), |n, table| self.drop_table(table).map(|()| n + 1));

        if fk_enabled != 0 {
            self.conn.execute_batch("PRAGMA foreign_keys = ON")?;
        }
        dropped
    }
}
