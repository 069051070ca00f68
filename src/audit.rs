use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{ActorContext, AuditAction, AuditFilter, AuditLogEntry};
use crate::store::PrescreenStore;

/// Appends immutable audit entries for sensitive reads and mutations.
#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<dyn PrescreenStore>,
}

/// Target of an audit entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditSubject {
    pub lead_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
}

impl AuditSubject {
    pub fn lead(lead_id: Uuid) -> Self {
        Self {
            lead_id: Some(lead_id),
            batch_id: None,
        }
    }

    pub fn batch(batch_id: Uuid) -> Self {
        Self {
            lead_id: None,
            batch_id: Some(batch_id),
        }
    }

    pub fn lead_in_batch(lead_id: Uuid, batch_id: Uuid) -> Self {
        Self {
            lead_id: Some(lead_id),
            batch_id: Some(batch_id),
        }
    }
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn PrescreenStore>) -> Self {
        Self { store }
    }

    /// Appends one entry. Fails with `AppError::Persistence` when the store
    /// cannot take the write.
    pub async fn record(
        &self,
        action: AuditAction,
        actor: &ActorContext,
        subject: AuditSubject,
        detail: Value,
    ) -> Result<AuditLogEntry, AppError> {
        let entry = AuditLogEntry {
            id: Uuid::new_v4(),
            action,
            actor_id: actor.actor_id.clone(),
            lead_id: subject.lead_id,
            batch_id: subject.batch_id,
            ip_address: actor.ip_address.clone(),
            detail: scrub(detail),
            created_at: Utc::now(),
        };
        self.store.append_audit(&entry).await.map_err(|e| match e {
            AppError::Persistence(_) => e,
            other => AppError::Persistence(format!("audit append failed: {}", other)),
        })?;
        Ok(entry)
    }

    /// Records an entry without failing the caller. A missed audit record is a
    /// compliance gap, so the failure is escalated at error level with an
    /// `alert` marker for log-based alerting.
    pub async fn record_or_alert(
        &self,
        action: AuditAction,
        actor: &ActorContext,
        subject: AuditSubject,
        detail: Value,
    ) -> Option<AuditLogEntry> {
        match self.record(action, actor, subject, detail).await {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::error!(
                    alert = true,
                    action = action.as_str(),
                    actor = %actor.actor_id,
                    lead_id = ?subject.lead_id,
                    batch_id = ?subject.batch_id,
                    "AUDIT WRITE FAILED: {}",
                    e
                );
                None
            }
        }
    }

    pub async fn entries(&self, filter: &AuditFilter) -> Result<Vec<AuditLogEntry>, AppError> {
        self.store.audit_entries(filter).await
    }
}

fn ssn_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b\d{3}-?\d{2}-?\d{4}\b").unwrap())
}

/// Replaces SSN-shaped substrings in every string of a detail blob.
pub fn scrub(detail: Value) -> Value {
    match detail {
        Value::String(s) => {
            let cleaned = ssn_pattern().replace_all(&s, "[REDACTED]");
            Value::String(cleaned.into_owned())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(scrub).collect()),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, scrub(v))).collect()),
        other => other,
    }
}
