//! User-visible alerts raised when persistence fails.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::document::Document;

/// Title prefix for alert documents.
pub const ALERT_TITLE_PREFIX: &str = "alerts/sync/";
/// Tag carried by every alert document.
pub const ALERT_TAG: &str = "Alert";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    /// Unique title of the alert document itself.
    pub title: String,
    /// Title of the document the failure concerns.
    pub subject: String,
    pub message: String,
    pub attempts: u32,
    pub created: DateTime<Utc>,
}

impl Alert {
    pub fn new(subject: impl Into<String>, message: impl Into<String>, attempts: u32) -> Self {
        let created = Utc::now();
        let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self {
            title: format!(
                "{ALERT_TITLE_PREFIX}{}-{sequence}",
                created.format("%Y%m%d%H%M%S%3f")
            ),
            subject: subject.into(),
            message: message.into(),
            attempts,
            created,
        }
    }

    /// Render the alert as a document the host can add to its store.
    pub fn to_document(&self) -> Document {
        Document::new(&self.title)
            .with_tags([ALERT_TAG])
            .with_field("component", "sync")
            .with_field("subject", &self.subject)
            .with_field("attempts", self.attempts.to_string())
            .with_field("created", self.created.format("%Y%m%d%H%M%S%3f").to_string())
            .with_field("text", &self.message)
    }
}

/// Receives alerts for display to the user.
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: Alert);
}

/// Alert sink that keeps every alert in memory.
#[derive(Debug, Default)]
pub struct AlertLog {
    alerts: Mutex<Vec<Alert>>,
}

impl AlertLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    /// Remove and return all collected alerts.
    pub fn take(&self) -> Vec<Alert> {
        std::mem::take(&mut *self.alerts.lock())
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.lock().is_empty()
    }
}

impl AlertSink for AlertLog {
    fn raise(&self, alert: Alert) {
        tracing::warn!(
            "[alert] '{}' after {} attempt(s): {}",
            alert.subject,
            alert.attempts,
            alert.message
        );
        self.alerts.lock().push(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_titles_are_unique() {
        let a = Alert::new("X", "boom", 1);
        let b = Alert::new("X", "boom", 1);
        assert_ne!(a.title, b.title);
        assert!(a.title.starts_with(ALERT_TITLE_PREFIX));
    }

    #[test]
    fn test_alert_document_fields() {
        let alert = Alert::new("Entry1", "disk full", 3);
        let doc = alert.to_document();
        assert_eq!(doc.title(), alert.title);
        assert_eq!(doc.tags(), vec![ALERT_TAG]);
        assert_eq!(doc.field("subject"), Some("Entry1"));
        assert_eq!(doc.field("attempts"), Some("3"));
        assert_eq!(doc.field("text"), Some("disk full"));
    }

    #[test]
    fn test_alert_serializes_with_timestamp() {
        let alert = Alert::new("Entry1", "disk full", 2);
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["subject"], "Entry1");
        assert_eq!(json["attempts"], 2);
        let created: DateTime<Utc> = json["created"].as_str().unwrap().parse().unwrap();
        assert_eq!(created, alert.created);
    }

    #[test]
    fn test_alert_log_collects() {
        let log = AlertLog::new();
        log.raise(Alert::new("A", "x", 1));
        log.raise(Alert::new("B", "y", 2));
        assert_eq!(log.len(), 2);
        assert_eq!(log.take().len(), 2);
        assert!(log.is_empty());
    }
}
