//! Retry queue: flags leads for resubmission and rebuilds submission
//! records from them. Resubmission always creates a new batch; the only
//! change made to the original leads is clearing their retry flag.

use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditRecorder, AuditSubject};
use crate::coordinator::{BatchCoordinator, PreparedBatch, SubmitBatch};
use crate::errors::AppError;
use crate::models::{ActorContext, AuditAction, Lead, MatchStatus, PrescreenRecord, Tier};
use crate::store::PrescreenStore;
use crate::vault::PiiVault;

/// Which of the requested ids were changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueChange {
    pub updated: Vec<Uuid>,
    pub skipped: Vec<Uuid>,
}

/// A queued lead turned back into a submission record.
#[derive(Clone, Serialize)]
pub struct MaterializedRecord {
    pub lead_id: Uuid,
    pub batch_id: Uuid,
    pub program_id: Uuid,
    pub record: PrescreenRecord,
}

impl std::fmt::Debug for MaterializedRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaterializedRecord")
            .field("lead_id", &self.lead_id)
            .field("program_id", &self.program_id)
            .finish_non_exhaustive()
    }
}

/// Leads a retry can help: failed calls, no-hits, or never tiered.
pub fn is_retry_eligible(lead: &Lead) -> bool {
    matches!(lead.match_status, MatchStatus::ApiError | MatchStatus::NoMatch)
        || lead.tier == Tier::Pending
}

#[derive(Clone)]
pub struct RetryQueueManager {
    store: Arc<dyn PrescreenStore>,
    vault: Arc<PiiVault>,
    audit: AuditRecorder,
    coordinator: BatchCoordinator,
}

impl RetryQueueManager {
    pub fn new(
        store: Arc<dyn PrescreenStore>,
        vault: Arc<PiiVault>,
        coordinator: BatchCoordinator,
    ) -> Self {
        Self {
            audit: AuditRecorder::new(store.clone()),
            store,
            vault,
            coordinator,
        }
    }

    pub async fn list_queue(&self) -> Result<Vec<Lead>, AppError> {
        self.store.retry_queue().await
    }

    pub async fn enqueue(&self, actor: &ActorContext, lead_ids: &[Uuid]) -> Result<QueueChange, AppError> {
        self.toggle(actor, lead_ids, true).await
    }

    pub async fn dequeue(&self, actor: &ActorContext, lead_ids: &[Uuid]) -> Result<QueueChange, AppError> {
        self.toggle(actor, lead_ids, false).await
    }

    async fn toggle(
        &self,
        actor: &ActorContext,
        lead_ids: &[Uuid],
        flag: bool,
    ) -> Result<QueueChange, AppError> {
        let ids = dedup(lead_ids);
        let leads = self.store.get_leads(&ids).await?;

        let mut change = QueueChange::default();
        for id in &ids {
            let lead = leads.iter().find(|l| l.id == *id);
            let wanted = match lead {
                Some(lead) if flag => is_retry_eligible(lead) && !lead.retry_flag,
                Some(lead) => lead.retry_flag,
                None => false,
            };
            if wanted {
                change.updated.push(*id);
            } else {
                change.skipped.push(*id);
            }
        }

        if change.updated.is_empty() {
            return Ok(change);
        }
        self.store.set_retry_flag(&change.updated, flag).await?;

        let action = if flag {
            AuditAction::RetryEnqueued
        } else {
            AuditAction::RetryDequeued
        };
        for lead in leads.iter().filter(|l| change.updated.contains(&l.id)) {
            self.audit
                .record_or_alert(
                    action,
                    actor,
                    AuditSubject::lead_in_batch(lead.id, lead.batch_id),
                    json!({ "retry_flag": flag }),
                )
                .await;
        }
        tracing::info!(
            updated = change.updated.len(),
            skipped = change.skipped.len(),
            retry_flag = flag,
            "Retry queue updated"
        );
        Ok(change)
    }

    /// Decrypts queued leads into submission records and clears their flags.
    /// Every lead must currently be queued.
    pub async fn materialize(
        &self,
        actor: &ActorContext,
        lead_ids: &[Uuid],
    ) -> Result<Vec<MaterializedRecord>, AppError> {
        let leads = self.load_queued(lead_ids).await?;
        let records = self.materialize_leads(actor, &leads).await?;
        self.clear_flags(&leads).await?;
        Ok(records)
    }

    /// Materializes queued leads and prepares them as one new batch. The
    /// leads must all belong to the same program.
    pub async fn resubmit(
        &self,
        actor: &ActorContext,
        lead_ids: &[Uuid],
        name: Option<String>,
    ) -> Result<PreparedBatch, AppError> {
        let leads = self.load_queued(lead_ids).await?;
        let program_ids: HashSet<Uuid> = leads.iter().map(|l| l.program_id).collect();
        if program_ids.len() != 1 {
            return Err(AppError::Validation(
                "queued leads must belong to a single program to be resubmitted together"
                    .to_string(),
            ));
        }
        let batch_ids: HashSet<Uuid> = leads.iter().map(|l| l.batch_id).collect();
        let retry_of = (batch_ids.len() == 1)
            .then(|| batch_ids.into_iter().next())
            .flatten();

        let records = self.materialize_leads(actor, &leads).await?;
        let program_id = leads[0].program_id;
        let prepared = self
            .coordinator
            .prepare(
                actor,
                SubmitBatch {
                    program_id,
                    name,
                    records: records.into_iter().map(|m| m.record).collect(),
                    retry_of,
                },
            )
            .await?;
        self.release_if_runnable(&prepared, &leads).await?;
        Ok(prepared)
    }

    /// Resubmits the still-queued `api_error` leads of a batch as a new
    /// batch. Leads that matched, came back no-hit, were dequeued or were
    /// already resubmitted are never resent.
    pub async fn retry_batch(
        &self,
        actor: &ActorContext,
        batch_id: Uuid,
    ) -> Result<PreparedBatch, AppError> {
        let original = self.coordinator.get_batch(batch_id).await?;
        if !original.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "batch {} is still {}",
                batch_id, original.status
            )));
        }
        let failed: Vec<Lead> = self
            .store
            .leads_for_batch(batch_id)
            .await?
            .into_iter()
            .filter(|l| l.match_status == MatchStatus::ApiError && l.retry_flag)
            .collect();
        if failed.is_empty() {
            return Err(AppError::Validation(format!(
                "batch {} has no queued api_error leads to retry",
                batch_id
            )));
        }

        let records = self.materialize_leads(actor, &failed).await?;
        let name = Some(match original.name {
            Some(ref name) => format!("Retry of {}", name),
            None => format!("Retry of {}", batch_id),
        });
        let prepared = self
            .coordinator
            .prepare(
                actor,
                SubmitBatch {
                    program_id: original.program_id,
                    name,
                    records: records.into_iter().map(|m| m.record).collect(),
                    retry_of: Some(batch_id),
                },
            )
            .await?;
        if !self.release_if_runnable(&prepared, &failed).await? {
            return Ok(prepared);
        }

        self.audit
            .record_or_alert(
                AuditAction::BatchRetried,
                actor,
                AuditSubject::batch(batch_id),
                json!({
                    "new_batch_id": prepared.batch.id,
                    "records": failed.len(),
                }),
            )
            .await;
        Ok(prepared)
    }

    async fn load_queued(&self, lead_ids: &[Uuid]) -> Result<Vec<Lead>, AppError> {
        let ids = dedup(lead_ids);
        if ids.is_empty() {
            return Err(AppError::Validation("no lead ids given".to_string()));
        }
        let leads = self.store.get_leads(&ids).await?;
        for id in &ids {
            match leads.iter().find(|l| l.id == *id) {
                None => return Err(AppError::NotFound(format!("lead {}", id))),
                Some(lead) if !lead.retry_flag => {
                    return Err(AppError::Conflict(format!("lead {} is not queued", id)))
                }
                Some(_) => {}
            }
        }
        Ok(leads)
    }

    async fn materialize_leads(
        &self,
        actor: &ActorContext,
        leads: &[Lead],
    ) -> Result<Vec<MaterializedRecord>, AppError> {
        let mut out = Vec::with_capacity(leads.len());
        for lead in leads {
            let subject = AuditSubject::lead_in_batch(lead.id, lead.batch_id);
            let decrypted = self.decrypt_lead(lead);
            let outcome = if decrypted.is_ok() { "ok" } else { "failed" };
            self.audit
                .record_or_alert(
                    AuditAction::RetryMaterialized,
                    actor,
                    subject,
                    json!({
                        "fields": ["ssn", "dob"],
                        "outcome": outcome,
                    }),
                )
                .await;
            let (ssn, dob) = decrypted?;
            out.push(MaterializedRecord {
                lead_id: lead.id,
                batch_id: lead.batch_id,
                program_id: lead.program_id,
                record: PrescreenRecord {
                    first_name: lead.first_name.clone(),
                    middle_initial: lead.middle_initial.clone(),
                    last_name: lead.last_name.clone(),
                    address: lead.address.clone(),
                    city: lead.city.clone(),
                    state: lead.state.clone(),
                    zip: lead.zip.clone(),
                    ssn,
                    dob,
                },
            });
        }
        Ok(out)
    }

    fn decrypt_lead(&self, lead: &Lead) -> Result<(Option<String>, Option<String>), AppError> {
        let ssn = lead
            .ssn_encrypted
            .as_deref()
            .map(|token| self.vault.decrypt(token))
            .transpose()?;
        let dob = lead
            .dob_encrypted
            .as_deref()
            .map(|token| self.vault.decrypt(token))
            .transpose()?;
        Ok((ssn, dob))
    }

    /// Takes the leads off the queue once their records live in a runnable
    /// batch. A batch that failed pre-flight has no lead rows, so the
    /// originals stay queued.
    async fn release_if_runnable(
        &self,
        prepared: &PreparedBatch,
        leads: &[Lead],
    ) -> Result<bool, AppError> {
        if !prepared.is_runnable() {
            tracing::warn!(
                batch_id = %prepared.batch.id,
                queued = leads.len(),
                "Resubmission failed before processing; leads left queued"
            );
            return Ok(false);
        }
        self.clear_flags(leads).await?;
        Ok(true)
    }

    async fn clear_flags(&self, leads: &[Lead]) -> Result<(), AppError> {
        let ids: Vec<Uuid> = leads.iter().map(|l| l.id).collect();
        self.store.set_retry_flag(&ids, false).await?;
        Ok(())
    }
}

fn dedup(ids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}
