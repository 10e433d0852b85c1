//! Compiled-in cases.
//!
//! Cases registered ahead of time under an identifier following the naming
//! grammar without prefix or extension, e.g. `create_users1.0_1600000000000`.

use super::naming::parse_identifier;
use super::{CaseProvider, CaseSource, MigrationCase};
use crate::binding::CaseLogic;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

struct RegisteredCase {
    case: MigrationCase,
    logic: Arc<dyn CaseLogic>,
}

/// Registry mapping case timestamps to their logic.
#[derive(Default)]
pub struct CaseRegistry {
    cases: BTreeMap<i64, RegisteredCase>,
}

impl CaseRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a case under `identifier`.
    pub fn register(
        &mut self,
        identifier: &str,
        logic: impl CaseLogic + 'static,
    ) -> Result<&mut Self> {
        let identity = parse_identifier(identifier)
            .ok_or_else(|| Error::InvalidIdentifier(identifier.to_string()))?;
        if self.cases.contains_key(&identity.timestamp) {
            return Err(Error::DuplicateCase {
                timestamp: identity.timestamp,
            });
        }

        let case = MigrationCase::new(identity, CaseSource::Registered);
        self.cases.insert(
            case.timestamp,
            RegisteredCase {
                case,
                logic: Arc::new(logic),
            },
        );
        Ok(self)
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_case(mut self, identifier: &str, logic: impl CaseLogic + 'static) -> Result<Self> {
        self.register(identifier, logic)?;
        Ok(self)
    }

    /// Logic registered for a timestamp.
    pub fn logic(&self, timestamp: i64) -> Option<Arc<dyn CaseLogic>> {
        self.cases
            .get(&timestamp)
            .map(|registered| Arc::clone(&registered.logic))
    }

    /// Number of registered cases.
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

impl CaseProvider for CaseRegistry {
    fn list_all(&self) -> Result<Vec<MigrationCase>> {
        Ok(self.cases.values().map(|r| r.case.clone()).collect())
    }

    fn find_by_timestamp(&self, timestamp: i64) -> Result<Option<MigrationCase>> {
        Ok(self.cases.get(&timestamp).map(|r| r.case.clone()))
    }
}
