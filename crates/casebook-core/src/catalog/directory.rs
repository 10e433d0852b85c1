//! Filesystem case discovery.

use super::naming::{compare_versions, safe_version, CaseNaming};
use super::{CaseProvider, CaseSource, MigrationCase};
use crate::binding::SqlScript;
use crate::config::MigrationsConfig;
use crate::error::Result;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// A case file in the legacy, timestamp-less grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyCase {
    /// Location of the file.
    pub path: PathBuf,
    /// Dotted-numeric version taken from the file name.
    pub version: String,
}

/// Case provider backed by a directory of SQL script files.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    root: PathBuf,
    naming: CaseNaming,
}

impl DirectoryCatalog {
    /// Catalog over `root` using `naming`.
    pub fn new(root: impl Into<PathBuf>, naming: CaseNaming) -> Self {
        Self {
            root: root.into(),
            naming,
        }
    }

    /// Catalog described by a configuration.
    pub fn from_config(config: &MigrationsConfig) -> Result<Self> {
        let naming = CaseNaming::new(config.case_prefix.clone(), config.extension.clone())?;
        Ok(Self::new(config.cases_path.clone(), naming))
    }

    /// The scanned directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The naming grammar.
    pub fn naming(&self) -> &CaseNaming {
        &self.naming
    }

    /// Regular files under the root with their file names. A missing root is
    /// an empty directory.
    fn files(&self) -> Vec<(PathBuf, String)> {
        if !self.root.exists() {
            debug!(root = %self.root.display(), "case directory does not exist");
            return Vec::new();
        }

        let mut files: Vec<_> = WalkDir::new(&self.root)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let name = e.file_name().to_str()?.to_string();
                Some((e.into_path(), name))
            })
            .collect();
        files.sort();
        files
    }

    /// Cases in the legacy grammar, ascending by version.
    pub fn legacy_cases(&self) -> Vec<LegacyCase> {
        let mut cases: Vec<_> = self
            .files()
            .into_iter()
            .filter_map(|(path, name)| {
                let version = self.naming.parse_legacy_file_name(&name)?;
                Some(LegacyCase { path, version })
            })
            .collect();
        cases.sort_by(|a, b| compare_versions(&a.version, &b.version).then(a.path.cmp(&b.path)));
        cases
    }

    /// Convert every legacy case into the current grammar.
    ///
    /// Cases are taken in version order and assigned timestamps `now_ms`,
    /// `now_ms + 1`, and so on. Each script's name header is rewritten to
    /// `case_<version>` before the file is renamed in place.
    pub fn upgrade_legacy(&self, now_ms: i64) -> Result<Vec<MigrationCase>> {
        let mut upgraded = Vec::new();

        for (offset, legacy) in self.legacy_cases().into_iter().enumerate() {
            let timestamp = now_ms + offset as i64;
            let file_name = self
                .naming
                .file_name("", Some(&legacy.version), timestamp);
            let destination = legacy
                .path
                .parent()
                .map_or_else(|| PathBuf::from(&file_name), |dir| dir.join(&file_name));
            if destination.exists() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} already exists", destination.display()),
                )
                .into());
            }

            let source = std::fs::read_to_string(&legacy.path)?;
            let declared = format!("case_{}", safe_version(&legacy.version));
            std::fs::write(&legacy.path, SqlScript::with_declared_name(&source, &declared))?;
            std::fs::rename(&legacy.path, &destination)?;

            info!(
                from = %legacy.path.display(),
                to = %destination.display(),
                timestamp,
                "legacy case upgraded"
            );
            upgraded.push(MigrationCase {
                name: String::new(),
                version: Some(legacy.version),
                timestamp,
                declared_name: Some(declared),
                source: CaseSource::Script(destination),
            });
        }

        Ok(upgraded)
    }

    /// Load the case behind a file name in the current grammar. Files that do
    /// not parse as scripts are skipped.
    fn load_case(&self, path: PathBuf, file_name: &str) -> Option<MigrationCase> {
        let identity = self.naming.parse_file_name(file_name)?;
        let script = match SqlScript::load(&path) {
            Ok(script) => script,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping invalid case file");
                return None;
            }
        };

        let mut case = MigrationCase::new(identity, CaseSource::Script(path));
        case.declared_name = script
            .declared_name()
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        Some(case)
    }
}

impl CaseProvider for DirectoryCatalog {
    fn list_all(&self) -> Result<Vec<MigrationCase>> {
        let mut cases: Vec<_> = self
            .files()
            .into_iter()
            .filter_map(|(path, name)| self.load_case(path, &name))
            .collect();

        cases.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| script_path(a).cmp(&script_path(b)))
        });
        cases.dedup_by(|later, earlier| {
            let duplicate = later.timestamp == earlier.timestamp;
            if duplicate {
                warn!(
                    timestamp = later.timestamp,
                    kept = %earlier.label(),
                    ignored = %later.label(),
                    "duplicate case timestamp in directory"
                );
            }
            duplicate
        });

        warn_duplicate_declarations(&cases);
        Ok(cases)
    }

    /// Only files whose names end in `_<timestamp>.<ext>` are read.
    fn find_by_timestamp(&self, timestamp: i64) -> Result<Option<MigrationCase>> {
        let suffix = format!("_{timestamp}.{}", self.naming.extension());
        Ok(self
            .files()
            .into_iter()
            .filter(|(_, name)| name.ends_with(&suffix))
            .filter_map(|(path, name)| self.load_case(path, &name))
            .find(|case| case.timestamp == timestamp))
    }
}

fn warn_duplicate_declarations(cases: &[MigrationCase]) {
    let mut declared: HashMap<&str, i64> = HashMap::new();
    for case in cases {
        let Some(name) = case.declared_name.as_deref() else {
            continue;
        };
        if let Some(first) = declared.insert(name, case.timestamp) {
            warn!(
                declared = name,
                first,
                timestamp = case.timestamp,
                "case name declared more than once"
            );
        }
    }
}

fn script_path(case: &MigrationCase) -> Option<&Path> {
    match &case.source {
        CaseSource::Script(path) => Some(path.as_path()),
        CaseSource::Registered => None,
    }
}
