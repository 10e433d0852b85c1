//! Engine configuration.

use crate::ledger::DEFAULT_LEDGER_TABLE;
use std::path::PathBuf;
use tracing::warn;

/// Default directory scanned for case files.
pub const DEFAULT_CASES_PATH: &str = "./migrations";

/// Default case file prefix.
pub const DEFAULT_CASE_PREFIX: &str = "migration_case_";

/// Default case file extension.
pub const DEFAULT_EXTENSION: &str = "sql";

/// Environment variable overriding [`MigrationsConfig::cases_path`].
pub const ENV_PATH: &str = "CASEBOOK_PATH";
/// Environment variable overriding [`MigrationsConfig::case_prefix`].
pub const ENV_CASE_PREFIX: &str = "CASEBOOK_CASE_PREFIX";
/// Environment variable overriding [`MigrationsConfig::extension`].
pub const ENV_EXTENSION: &str = "CASEBOOK_EXTENSION";
/// Environment variable overriding [`MigrationsConfig::ledger_table`].
pub const ENV_TABLE: &str = "CASEBOOK_TABLE";
/// Environment variable overriding [`MigrationsConfig::transactional`].
pub const ENV_TRANSACTIONAL: &str = "CASEBOOK_TRANSACTIONAL";
/// Environment variable overriding [`MigrationsConfig::log`].
pub const ENV_LOG: &str = "CASEBOOK_LOG";

/// Migration engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationsConfig {
    /// Directory scanned for case files.
    pub cases_path: PathBuf,

    /// File name prefix every case file starts with.
    pub case_prefix: String,

    /// Case file extension, without the dot.
    pub extension: String,

    /// Name of the ledger table.
    pub ledger_table: String,

    /// Run each case inside its own transaction.
    pub transactional: bool,

    /// Mirror batch log messages to `tracing`.
    pub log: bool,
}

impl MigrationsConfig {
    /// Create a configuration scanning `cases_path`.
    pub fn new(cases_path: impl Into<PathBuf>) -> Self {
        Self {
            cases_path: cases_path.into(),
            case_prefix: DEFAULT_CASE_PREFIX.to_string(),
            extension: DEFAULT_EXTENSION.to_string(),
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
            transactional: true,
            log: true,
        }
    }

    /// Set the case file prefix.
    pub fn with_case_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.case_prefix = prefix.into();
        self
    }

    /// Set the case file extension.
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into().trim_start_matches('.').to_string();
        self
    }

    /// Set the ledger table name.
    pub fn with_ledger_table(mut self, table: impl Into<String>) -> Self {
        self.ledger_table = table.into();
        self
    }

    /// Enable or disable per-case transactions.
    pub fn with_transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }

    /// Enable or disable mirroring the batch log to `tracing`.
    pub fn with_log(mut self, log: bool) -> Self {
        self.log = log;
        self
    }

    /// Defaults overlaid with the `CASEBOOK_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().overlay_env(|key| std::env::var(key).ok())
    }

    /// Overlay values looked up through `lookup` onto this configuration.
    pub fn overlay_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(path) = lookup(ENV_PATH) {
            self.cases_path = PathBuf::from(path);
        }
        if let Some(prefix) = lookup(ENV_CASE_PREFIX) {
            self.case_prefix = prefix;
        }
        if let Some(extension) = lookup(ENV_EXTENSION) {
            self = self.with_extension(extension);
        }
        if let Some(table) = lookup(ENV_TABLE) {
            self.ledger_table = table;
        }
        if let Some(raw) = lookup(ENV_TRANSACTIONAL) {
            self.transactional = parse_flag(ENV_TRANSACTIONAL, &raw, self.transactional);
        }
        if let Some(raw) = lookup(ENV_LOG) {
            self.log = parse_flag(ENV_LOG, &raw, self.log);
        }
        self
    }
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CASES_PATH)
    }
}

fn parse_flag(key: &str, raw: &str, fallback: bool) -> bool {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            warn!(key, value = raw, "ignoring invalid boolean setting");
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = MigrationsConfig::default();
        assert_eq!(config.cases_path, PathBuf::from(DEFAULT_CASES_PATH));
        assert_eq!(config.case_prefix, DEFAULT_CASE_PREFIX);
        assert_eq!(config.extension, DEFAULT_EXTENSION);
        assert_eq!(config.ledger_table, DEFAULT_LEDGER_TABLE);
        assert!(config.transactional);
        assert!(config.log);
    }

    #[test]
    fn test_builder() {
        let config = MigrationsConfig::new("/srv/cases")
            .with_case_prefix("m_")
            .with_extension(".psql")
            .with_ledger_table("schema_history")
            .with_transactional(false)
            .with_log(false);
        assert_eq!(config.cases_path, PathBuf::from("/srv/cases"));
        assert_eq!(config.case_prefix, "m_");
        assert_eq!(config.extension, "psql");
        assert_eq!(config.ledger_table, "schema_history");
        assert!(!config.transactional);
        assert!(!config.log);
    }

    #[test]
    fn test_overlay_env() {
        let vars: HashMap<&str, &str> = [
            (ENV_PATH, "/tmp/cases"),
            (ENV_TABLE, "ledger"),
            (ENV_TRANSACTIONAL, "off"),
            (ENV_LOG, "maybe"),
        ]
        .into_iter()
        .collect();

        let config = MigrationsConfig::default()
            .overlay_env(|key| vars.get(key).map(|value| value.to_string()));
        assert_eq!(config.cases_path, PathBuf::from("/tmp/cases"));
        assert_eq!(config.ledger_table, "ledger");
        assert_eq!(config.case_prefix, DEFAULT_CASE_PREFIX);
        assert!(!config.transactional);
        // Invalid values keep the previous setting.
        assert!(config.log);
    }
}
