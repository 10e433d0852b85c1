//! Case catalog.
//!
//! Discovers migration cases from one or more providers and exposes them as a
//! single collection ordered by timestamp.
//!
//! # Providers
//!
//! | Provider | Source | Logic |
//! |----------|--------|-------|
//! | [`DirectoryCatalog`] | case files under a root directory | SQL scripts |
//! | [`CaseRegistry`] | cases registered in code | [`CaseLogic`](crate::binding::CaseLogic) values |

pub mod directory;
pub mod naming;
pub mod registry;

pub use directory::{DirectoryCatalog, LegacyCase};
pub use naming::{parse_identifier, CaseIdentity, CaseNaming};
pub use registry::CaseRegistry;

use crate::error::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Where a case's executable logic comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseSource {
    /// A script file on disk.
    Script(PathBuf),
    /// Logic registered ahead of time in a [`CaseRegistry`].
    Registered,
}

/// A discovered migration case. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationCase {
    /// Human name.
    pub name: String,
    /// Optional dotted-numeric version.
    pub version: Option<String>,
    /// Ordering key, and the only identity the ledger persists.
    pub timestamp: i64,
    /// Name declared by the case itself, such as a script's `-- case:` header.
    pub declared_name: Option<String>,
    /// Where the logic is loaded from.
    pub source: CaseSource,
}

impl MigrationCase {
    /// Build a case from a parsed identity.
    pub fn new(identity: CaseIdentity, source: CaseSource) -> Self {
        Self {
            name: identity.name,
            version: identity.version,
            timestamp: identity.timestamp,
            declared_name: None,
            source,
        }
    }

    /// Descriptive label stored in the ledger: the declared name when there is
    /// one, otherwise name and version.
    pub fn label(&self) -> String {
        if let Some(declared) = &self.declared_name {
            return declared.clone();
        }
        match (&self.version, self.name.is_empty()) {
            (Some(version), true) => version.clone(),
            (Some(version), false) => format!("{}_{}", self.name, version),
            (None, _) => self.name.clone(),
        }
    }
}

/// A timestamp and label pair, as planned or displayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseRef {
    /// Case timestamp; 0 stands for "nothing applied".
    pub timestamp: i64,
    /// Descriptive label.
    pub label: String,
}

impl From<&MigrationCase> for CaseRef {
    fn from(case: &MigrationCase) -> Self {
        Self {
            timestamp: case.timestamp,
            label: case.label(),
        }
    }
}

/// A source of migration cases.
pub trait CaseProvider {
    /// Every valid case, ascending by timestamp.
    fn list_all(&self) -> Result<Vec<MigrationCase>>;

    /// Look up a single case.
    fn find_by_timestamp(&self, timestamp: i64) -> Result<Option<MigrationCase>> {
        Ok(self
            .list_all()?
            .into_iter()
            .find(|case| case.timestamp == timestamp))
    }
}

impl<P: CaseProvider + ?Sized> CaseProvider for Arc<P> {
    fn list_all(&self) -> Result<Vec<MigrationCase>> {
        (**self).list_all()
    }

    fn find_by_timestamp(&self, timestamp: i64) -> Result<Option<MigrationCase>> {
        (**self).find_by_timestamp(timestamp)
    }
}

/// The merged view over all providers.
#[derive(Default)]
pub struct Catalog {
    providers: Vec<Box<dyn CaseProvider>>,
}

impl Catalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider. Earlier providers win timestamp collisions.
    pub fn with_provider(mut self, provider: impl CaseProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    /// Number of providers.
    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Every case across providers, strictly ascending by timestamp.
    pub fn list_all(&self) -> Result<Vec<MigrationCase>> {
        let mut merged: BTreeMap<i64, MigrationCase> = BTreeMap::new();
        for provider in &self.providers {
            for case in provider.list_all()? {
                if let Some(existing) = merged.get(&case.timestamp) {
                    warn!(
                        timestamp = case.timestamp,
                        kept = %existing.label(),
                        ignored = %case.label(),
                        "duplicate case timestamp"
                    );
                    continue;
                }
                merged.insert(case.timestamp, case);
            }
        }
        Ok(merged.into_values().collect())
    }

    /// Look up a case by timestamp, asking providers in order.
    pub fn find_by_timestamp(&self, timestamp: i64) -> Result<Option<MigrationCase>> {
        for provider in &self.providers {
            if let Some(case) = provider.find_by_timestamp(timestamp)? {
                return Ok(Some(case));
            }
        }
        Ok(None)
    }

    /// Cases strictly newer than `watermark`, ascending.
    pub fn cases_after(&self, watermark: i64) -> Result<Vec<MigrationCase>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|case| case.timestamp > watermark)
            .collect())
    }
}
