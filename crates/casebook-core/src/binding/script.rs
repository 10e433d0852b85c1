//! SQL script cases.
//!
//! A script case file holds plain SQL split into sections by marker lines:
//!
//! ```sql
//! -- case: create_products
//! -- +up
//! CREATE TABLE products (id INTEGER PRIMARY KEY, title TEXT);
//! -- +down
//! DROP TABLE products;
//! ```
//!
//! The `-- +up` section is required. A missing `-- +down` section makes `down`
//! a no-op that succeeds.
//!
//! Each case already runs inside its own transaction when transactional
//! execution is on (the default). A script that opens one itself with `BEGIN`
//! and `COMMIT` is refused in that mode and recorded as a failed case; it only
//! runs with transactional execution turned off.

use super::{CaseContext, CaseLogic, CaseResult};
use crate::error::{Error, Result};
use std::path::Path;

/// Marker opening the forward section.
pub const UP_MARKER: &str = "-- +up";
/// Marker opening the backward section.
pub const DOWN_MARKER: &str = "-- +down";
/// Header directive declaring the case name.
pub const NAME_DIRECTIVE: &str = "-- case:";

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Header,
    Up,
    Down,
}

/// A parsed SQL script case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlScript {
    declared_name: Option<String>,
    up: String,
    down: Option<String>,
    own_transaction: bool,
}

impl SqlScript {
    /// Parse script text.
    pub fn parse(source: &str) -> std::result::Result<Self, String> {
        let mut section = Section::Header;
        let mut declared_name = None;
        let mut up: Option<String> = None;
        let mut down: Option<String> = None;

        for (lineno, line) in source.lines().enumerate() {
            let trimmed = line.trim();

            if trimmed.eq_ignore_ascii_case(UP_MARKER) {
                if up.is_some() {
                    return Err(format!("line {}: duplicate {UP_MARKER}", lineno + 1));
                }
                up = Some(String::new());
                section = Section::Up;
                continue;
            }
            if trimmed.eq_ignore_ascii_case(DOWN_MARKER) {
                if down.is_some() {
                    return Err(format!("line {}: duplicate {DOWN_MARKER}", lineno + 1));
                }
                down = Some(String::new());
                section = Section::Down;
                continue;
            }

            let body = match section {
                Section::Header => {
                    if let Some(name) = trimmed.strip_prefix(NAME_DIRECTIVE) {
                        declared_name = Some(name.trim().to_string());
                    } else if !trimmed.is_empty() && !trimmed.starts_with("--") {
                        return Err(format!(
                            "line {}: statement outside of a {UP_MARKER} or {DOWN_MARKER} section",
                            lineno + 1
                        ));
                    }
                    continue;
                }
                Section::Up => up.as_mut(),
                Section::Down => down.as_mut(),
            };
            if let Some(body) = body {
                body.push_str(line);
                body.push('\n');
            }
        }

        let up = up.ok_or_else(|| format!("missing {UP_MARKER} section"))?;
        let own_transaction =
            controls_transaction(&up) || down.as_deref().is_some_and(controls_transaction);
        Ok(Self {
            declared_name,
            up,
            down,
            own_transaction,
        })
    }

    /// Read and parse a script file.
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::parse(&source).map_err(|reason| Error::InvalidScript {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Name declared by the `-- case:` header, if any.
    pub fn declared_name(&self) -> Option<&str> {
        self.declared_name.as_deref()
    }

    /// Forward SQL.
    pub fn up_sql(&self) -> &str {
        &self.up
    }

    /// Backward SQL, if the script has a down section.
    pub fn down_sql(&self) -> Option<&str> {
        self.down.as_deref()
    }

    /// Rewrite the `-- case:` header of script text, inserting it when absent.
    pub fn with_declared_name(source: &str, name: &str) -> String {
        let header = format!("{NAME_DIRECTIVE} {name}");
        let mut replaced = false;
        let mut lines: Vec<String> = source
            .lines()
            .map(|line| {
                if !replaced && line.trim_start().starts_with(NAME_DIRECTIVE) {
                    replaced = true;
                    header.clone()
                } else {
                    line.to_string()
                }
            })
            .collect();
        if !replaced {
            lines.insert(0, header);
        }

        let mut out = lines.join("\n");
        if source.ends_with('\n') || !replaced {
            out.push('\n');
        }
        out
    }
}

/// Whether any statement of `sql` begins or ends a transaction. Only the
/// leading keywords of each statement are inspected, so trigger bodies do not
/// count.
fn controls_transaction(sql: &str) -> bool {
    sql.split(';').any(|statement| {
        let words: Vec<String> = statement
            .lines()
            .map(|line| line.split("--").next().unwrap_or_default())
            .flat_map(str::split_whitespace)
            .take(2)
            .map(str::to_ascii_uppercase)
            .collect();
        match words.first().map(String::as_str) {
            Some("BEGIN" | "COMMIT") => true,
            Some("END") => words.get(1).is_some_and(|w| w == "TRANSACTION"),
            _ => false,
        }
    })
}

fn run_section(ctx: &CaseContext<'_>, sql: &str) -> CaseResult {
    if !sql.trim().is_empty() {
        ctx.db().execute_batch(sql)?;
    }
    Ok(true)
}

impl CaseLogic for SqlScript {
    fn up(&self, ctx: &CaseContext<'_>) -> CaseResult {
        run_section(ctx, &self.up)
    }

    fn down(&self, ctx: &CaseContext<'_>) -> CaseResult {
        match &self.down {
            Some(sql) => run_section(ctx, sql),
            None => Ok(true),
        }
    }

    fn manages_transaction(&self) -> bool {
        self.own_transaction
    }
}
