//! Human-readable log of the last action.

use serde::Serialize;
use tracing::{info, warn};

/// One line of the batch log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogMessage {
    /// Message text.
    pub text: String,
    /// Whether the line reports a failure.
    pub failed: bool,
}

/// Messages produced while running one action, in order.
#[derive(Debug, Clone, Default)]
pub struct BatchLog {
    messages: Vec<LogMessage>,
    failed: bool,
    mirror: bool,
}

impl BatchLog {
    /// Create an empty log. With `mirror`, every message is also emitted as a
    /// `tracing` event.
    pub fn new(mirror: bool) -> Self {
        Self {
            messages: Vec::new(),
            failed: false,
            mirror,
        }
    }

    /// Forget all messages.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.failed = false;
    }

    /// Record an informational message.
    pub fn info(&mut self, text: impl Into<String>) {
        let text = text.into();
        if self.mirror {
            info!(target: "casebook", "{text}");
        }
        self.messages.push(LogMessage {
            text,
            failed: false,
        });
    }

    /// Record a failure message.
    pub fn failure(&mut self, text: impl Into<String>) {
        let text = text.into();
        if self.mirror {
            warn!(target: "casebook", "{text}");
        }
        self.failed = true;
        self.messages.push(LogMessage { text, failed: true });
    }

    /// Messages in the order they were recorded.
    pub fn messages(&self) -> &[LogMessage] {
        &self.messages
    }

    /// Whether any failure was recorded.
    pub fn has_failure(&self) -> bool {
        self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_in_order() {
        let mut log = BatchLog::new(false);
        log.info("Upgrade to 1: done");
        log.failure("Upgrade to 2: failed");
        assert!(log.has_failure());
        let texts: Vec<_> = log.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["Upgrade to 1: done", "Upgrade to 2: failed"]);
        assert!(log.messages()[1].failed);

        log.reset();
        assert!(log.messages().is_empty());
        assert!(!log.has_failure());
    }
}
