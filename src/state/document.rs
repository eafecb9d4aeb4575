//! The shared workflow document.
//!
//! A structured record with named mutable fields, a per-agent status table,
//! and an append-only activity log. Updates patch only the named fields,
//! append exactly one log entry, and refresh the update timestamp; historical
//! log entries are never rewritten or reordered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::StateError;

/// Overall workflow status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Complete,
}

/// One append-only activity log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// The persisted workflow document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDocument {
    /// The single current phase; always a member of the configured plan
    pub current_phase: String,
    /// The phase that will follow, when one exists
    #[serde(default)]
    pub next_phase: Option<String>,
    pub status: WorkflowStatus,
    /// Progress through the current phase's duration budget, 0-100
    #[serde(default)]
    pub progress_percent: u8,
    pub updated_at: DateTime<Utc>,
    /// Per-agent status strings as last reported
    #[serde(default)]
    pub agents: BTreeMap<String, String>,
    /// Append-only, never reordered
    #[serde(default)]
    pub activity: Vec<ActivityEntry>,
}

impl WorkflowDocument {
    /// Synthesize a well-formed default document. Used for self-healing when
    /// the persisted document is missing or unreadable.
    pub fn synthesized(first_phase: &str, next_phase: Option<&str>) -> Self {
        Self {
            current_phase: first_phase.to_string(),
            next_phase: next_phase.map(str::to_string),
            status: WorkflowStatus::Pending,
            progress_percent: 0,
            updated_at: Utc::now(),
            agents: BTreeMap::new(),
            activity: vec![ActivityEntry {
                timestamp: Utc::now(),
                message: "document initialized".to_string(),
            }],
        }
    }

    /// Append one activity entry and refresh the update timestamp.
    pub fn log_activity(&mut self, message: impl Into<String>) {
        let now = Utc::now();
        self.activity.push(ActivityEntry {
            timestamp: now,
            message: message.into(),
        });
        self.updated_at = now;
    }

    /// Apply a field patch: replace only the named fields, append one log
    /// entry summarizing the change, refresh `updated_at`.
    pub fn apply(&mut self, update: StateUpdate) {
        let mut changed: Vec<String> = Vec::new();

        if let Some(phase) = update.current_phase {
            changed.push(format!("current_phase={phase}"));
            self.current_phase = phase;
        }
        if let Some(next) = update.next_phase {
            changed.push(format!(
                "next_phase={}",
                next.as_deref().unwrap_or("(none)")
            ));
            self.next_phase = next;
        }
        if let Some(status) = update.status {
            changed.push(format!("status={status:?}").to_lowercase());
            self.status = status;
        }
        if let Some(pct) = update.progress_percent {
            changed.push(format!("progress={pct}%"));
            self.progress_percent = pct.min(100);
        }
        for (agent, status) in update.agent_status {
            changed.push(format!("agent {agent}={status}"));
            self.agents.insert(agent, status);
        }

        let message = match update.note {
            Some(note) if changed.is_empty() => note,
            Some(note) => format!("{note}: {}", changed.join(", ")),
            None if changed.is_empty() => "state refreshed".to_string(),
            None => changed.join(", "),
        };
        self.log_activity(message);
    }

    /// Check that all required fields are present in a raw JSON document.
    pub fn validate_raw(raw: &serde_json::Value) -> Result<(), StateError> {
        for field in ["current_phase", "status", "updated_at", "activity"] {
            if raw.get(field).is_none() {
                return Err(StateError::MissingField {
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// A patch of named fields, applied atomically by `PersistedStateStore`.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub current_phase: Option<String>,
    /// Outer Option: whether to touch the field; inner: the new value
    pub next_phase: Option<Option<String>>,
    pub status: Option<WorkflowStatus>,
    pub progress_percent: Option<u8>,
    pub agent_status: Vec<(String, String)>,
    /// Free-form prefix for the generated log entry
    pub note: Option<String>,
}

impl StateUpdate {
    pub fn current_phase(mut self, phase: impl Into<String>) -> Self {
        self.current_phase = Some(phase.into());
        self
    }

    pub fn next_phase(mut self, next: Option<String>) -> Self {
        self.next_phase = Some(next);
        self
    }

    pub fn status(mut self, status: WorkflowStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress_percent(mut self, pct: u8) -> Self {
        self.progress_percent = Some(pct);
        self
    }

    pub fn agent_status(mut self, agent: impl Into<String>, status: impl Into<String>) -> Self {
        self.agent_status.push((agent.into(), status.into()));
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesized_document_is_valid() {
        let doc = WorkflowDocument::synthesized("discovery", Some("planning"));
        assert_eq!(doc.current_phase, "discovery");
        assert_eq!(doc.next_phase.as_deref(), Some("planning"));
        assert_eq!(doc.status, WorkflowStatus::Pending);
        assert_eq!(doc.activity.len(), 1);

        let raw = serde_json::to_value(&doc).unwrap();
        WorkflowDocument::validate_raw(&raw).unwrap();
    }

    #[test]
    fn test_apply_patches_only_named_fields() {
        let mut doc = WorkflowDocument::synthesized("a", Some("b"));
        doc.agents.insert("worker".to_string(), "healthy".to_string());
        let before_agents = doc.agents.clone();
        let before_next = doc.next_phase.clone();

        doc.apply(StateUpdate::default().status(WorkflowStatus::Running));

        assert_eq!(doc.status, WorkflowStatus::Running);
        assert_eq!(doc.current_phase, "a");
        assert_eq!(doc.next_phase, before_next);
        assert_eq!(doc.agents, before_agents);
    }

    #[test]
    fn test_apply_appends_exactly_one_log_entry() {
        let mut doc = WorkflowDocument::synthesized("a", None);
        let before = doc.activity.len();

        doc.apply(
            StateUpdate::default()
                .current_phase("b")
                .status(WorkflowStatus::Running)
                .progress_percent(40),
        );

        assert_eq!(doc.activity.len(), before + 1);
        let entry = doc.activity.last().unwrap();
        assert!(entry.message.contains("current_phase=b"));
        assert!(entry.message.contains("progress=40%"));
    }

    #[test]
    fn test_apply_preserves_historical_log_entries() {
        let mut doc = WorkflowDocument::synthesized("a", None);
        doc.log_activity("first");
        doc.log_activity("second");
        let history: Vec<String> = doc.activity.iter().map(|e| e.message.clone()).collect();

        doc.apply(StateUpdate::default().progress_percent(10));

        let after: Vec<String> = doc.activity.iter().map(|e| e.message.clone()).collect();
        assert_eq!(&after[..history.len()], &history[..]);
    }

    #[test]
    fn test_apply_refreshes_updated_at() {
        let mut doc = WorkflowDocument::synthesized("a", None);
        let before = doc.updated_at;
        doc.apply(StateUpdate::default().note("heartbeat"));
        assert!(doc.updated_at >= before);
    }

    #[test]
    fn test_progress_is_capped_at_100() {
        let mut doc = WorkflowDocument::synthesized("a", None);
        doc.apply(StateUpdate::default().progress_percent(250));
        assert_eq!(doc.progress_percent, 100);
    }

    #[test]
    fn test_agent_status_updates_table() {
        let mut doc = WorkflowDocument::synthesized("a", None);
        doc.apply(StateUpdate::default().agent_status("builder", "running"));
        doc.apply(StateUpdate::default().agent_status("builder", "healthy"));
        assert_eq!(doc.agents.get("builder").map(String::as_str), Some("healthy"));
    }

    #[test]
    fn test_validate_raw_rejects_missing_sections() {
        let raw = serde_json::json!({
            "current_phase": "a",
            "updated_at": "2026-01-01T00:00:00Z",
            "activity": []
        });
        let err = WorkflowDocument::validate_raw(&raw).unwrap_err();
        match err {
            StateError::MissingField { field } => assert_eq!(field, "status"),
            other => panic!("Expected MissingField, got {other:?}"),
        }
    }

    #[test]
    fn test_document_json_roundtrip() {
        let mut doc = WorkflowDocument::synthesized("a", Some("b"));
        doc.apply(StateUpdate::default().status(WorkflowStatus::Running));
        let json = serde_json::to_string_pretty(&doc).unwrap();
        let parsed: WorkflowDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, doc);
    }
}
