//! Case naming grammar.
//!
//! Current grammar: `<prefix><name><version>?_<timestamp>.<ext>`, where `name`
//! is alphanumeric/underscore, `version` is dotted-numeric, and `timestamp` is a
//! required integer (milliseconds since the epoch by convention).
//!
//! Legacy grammar: `<prefix><version>.<ext>`, with no timestamp. Legacy cases
//! are only ever surfaced for a one-time upgrade into the current grammar.

use crate::error::Result;
use regex::Regex;
use std::cmp::Ordering;
use std::sync::LazyLock;

const IDENTITY_PATTERN: &str = r"(?P<name>[A-Za-z0-9_]*?)(?P<version>\d+(?:\.\d+)*)?_(?P<ts>\d+)";
const VERSION_PATTERN: &str = r"(?P<version>\d+(?:\.\d+)*)";

static IDENTIFIER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(&format!("^{IDENTITY_PATTERN}$")).ok());

/// Identity parsed from a case identifier or file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseIdentity {
    /// Human name, trailing underscores trimmed.
    pub name: String,
    /// Optional dotted-numeric version.
    pub version: Option<String>,
    /// Ordering key.
    pub timestamp: i64,
}

impl CaseIdentity {
    fn from_captures(caps: &regex::Captures<'_>) -> Option<Self> {
        let timestamp = caps.name("ts")?.as_str().parse::<i64>().ok()?;
        let name = caps
            .name("name")
            .map(|m| m.as_str().trim_end_matches('_').to_string())
            .unwrap_or_default();
        let version = caps.name("version").map(|m| m.as_str().to_string());
        Some(Self {
            name,
            version,
            timestamp,
        })
    }
}

/// Parse a bare identifier such as `create_users1.2_1600000000000`.
pub fn parse_identifier(identifier: &str) -> Option<CaseIdentity> {
    let regex = IDENTIFIER.as_ref()?;
    let caps = regex.captures(identifier)?;
    CaseIdentity::from_captures(&caps)
}

/// File name grammar for one prefix and extension.
#[derive(Debug, Clone)]
pub struct CaseNaming {
    prefix: String,
    extension: String,
    current: Regex,
    legacy: Regex,
}

impl CaseNaming {
    /// Build the grammar for a prefix and file extension (without the dot).
    pub fn new(prefix: impl Into<String>, extension: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        let extension = extension.into().trim_start_matches('.').to_string();
        let escaped_prefix = regex::escape(&prefix);
        let escaped_ext = regex::escape(&extension);

        let current = Regex::new(&format!(
            r"^{escaped_prefix}{IDENTITY_PATTERN}\.{escaped_ext}$"
        ))?;
        let legacy = Regex::new(&format!(
            r"^{escaped_prefix}{VERSION_PATTERN}\.{escaped_ext}$"
        ))?;

        Ok(Self {
            prefix,
            extension,
            current,
            legacy,
        })
    }

    /// The case file prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The case file extension.
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Parse a file name in the current grammar.
    pub fn parse_file_name(&self, file_name: &str) -> Option<CaseIdentity> {
        let caps = self.current.captures(file_name)?;
        CaseIdentity::from_captures(&caps)
    }

    /// Parse a file name in the legacy grammar, returning its version.
    pub fn parse_legacy_file_name(&self, file_name: &str) -> Option<String> {
        self.legacy
            .captures(file_name)
            .and_then(|caps| caps.name("version"))
            .map(|m| m.as_str().to_string())
    }

    /// Render a file name in the current grammar.
    pub fn file_name(&self, name: &str, version: Option<&str>, timestamp: i64) -> String {
        format!(
            "{}{}{}_{}.{}",
            self.prefix,
            name,
            version.unwrap_or_default(),
            timestamp,
            self.extension
        )
    }
}

/// Compare dotted-numeric versions component by component. Missing components
/// count as zero, so `1.0` equals `1`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| part.parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let x = a.get(i).copied().unwrap_or(0);
            let y = b.get(i).copied().unwrap_or(0);
            x.cmp(&y)
        })
        .find(|ord| *ord != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

/// Version with dots replaced by underscores, usable inside an identifier.
pub fn safe_version(version: &str) -> String {
    version.replace('.', "_")
}
