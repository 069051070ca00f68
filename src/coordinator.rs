/// Batch submission workflow
///
/// A submission runs in two phases:
/// 1. `prepare`: validate the records, load the program, create the batch
///    row, run the bureau pre-flight and persist every lead as `pending`
///    with its SSN/DOB already encrypted.
/// 2. `run`: fan out one call per record per enabled bureau with a bounded
///    number in flight, persist each lead outcome as it lands, then wait for
///    all of them before the batch leaves `processing`.
///
/// The HTTP layer returns after `prepare` and drives `run` on a background
/// task. A batch abandoned mid-run (process shutdown) stays `processing`
/// until `reconcile_stale_batches` fails it.
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::audit::{AuditRecorder, AuditSubject};
use crate::bureau_client::{BureauApi, BureauResponse, PrescreenRequest, ProbeStatus};
use crate::config::Config;
use crate::errors::AppError;
use crate::models::{
    ActorContext, AuditAction, Batch, BatchFilter, BatchStatus, BureauCode, BureauResult, Lead,
    LeadOutcome, MatchStatus, Paged, PrescreenRecord, Program, Tier,
};
use crate::records::validate_batch;
use crate::store::PrescreenStore;
use crate::tiering;
use crate::vault::{ssn_last_four, PiiVault};

const INTERRUPTED_MESSAGE: &str = "processing interrupted";
const MAX_BATCH_NAME_LEN: usize = 200;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Upper bound on concurrent bureau calls across all running batches.
    pub max_in_flight: usize,
    pub call_timeout: Duration,
    /// A `processing` batch untouched for this long is considered abandoned.
    pub stale_after: chrono::Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            call_timeout: Duration::from_secs(30),
            stale_after: chrono::Duration::minutes(30),
        }
    }
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_in_flight: config.batch_max_in_flight,
            call_timeout: config.bureau_timeout(),
            stale_after: config.stale_after(),
        }
    }
}

/// Caller input for a new batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitBatch {
    pub program_id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    pub records: Vec<PrescreenRecord>,
    /// Set when the batch resubmits leads of an earlier batch.
    #[serde(skip)]
    pub retry_of: Option<Uuid>,
}

/// Plaintext record kept in memory only for the duration of a run.
struct WorkItem {
    lead_id: Uuid,
    position: usize,
    record: PrescreenRecord,
}

/// Per-run data shared by every record task.
struct RunContext {
    batch_id: Uuid,
    program: Program,
    bureaus: Vec<BureauCode>,
}

/// A batch after `prepare`. If pre-flight failed the batch is already
/// terminal and there is nothing to run.
pub struct PreparedBatch {
    pub batch: Batch,
    work: Vec<WorkItem>,
}

// Plaintext work items are deliberately not printed.
impl std::fmt::Debug for PreparedBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedBatch")
            .field("batch", &self.batch)
            .field("work_items", &self.work.len())
            .finish()
    }
}

impl PreparedBatch {
    pub fn is_runnable(&self) -> bool {
        !self.work.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchDetail {
    pub batch: Batch,
    pub leads: Vec<Lead>,
}

#[derive(Clone)]
pub struct BatchCoordinator {
    store: Arc<dyn PrescreenStore>,
    bureau: Arc<dyn BureauApi>,
    vault: Arc<PiiVault>,
    audit: AuditRecorder,
    settings: CoordinatorSettings,
    permits: Arc<Semaphore>,
}

impl BatchCoordinator {
    pub fn new(
        store: Arc<dyn PrescreenStore>,
        bureau: Arc<dyn BureauApi>,
        vault: Arc<PiiVault>,
        settings: CoordinatorSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_in_flight.max(1)));
        Self {
            audit: AuditRecorder::new(store.clone()),
            store,
            bureau,
            vault,
            settings,
            permits,
        }
    }

    /// Prepares and runs a batch to completion.
    pub async fn submit(&self, actor: &ActorContext, input: SubmitBatch) -> Result<Batch, AppError> {
        let prepared = self.prepare(actor, input).await?;
        self.run(actor, prepared).await
    }

    pub async fn prepare(
        &self,
        actor: &ActorContext,
        input: SubmitBatch,
    ) -> Result<PreparedBatch, AppError> {
        let records = validate_batch(&input.records)?;
        let name = normalize_name(input.name)?;
        self.vault.ensure_configured()?;

        let program = self
            .store
            .get_program(input.program_id)
            .await?
            .ok_or_else(|| {
                AppError::Configuration(format!("program {} does not exist", input.program_id))
            })?;
        if !program.active {
            return Err(AppError::Configuration(format!(
                "program {} is inactive",
                program.id
            )));
        }

        let now = Utc::now();
        let batch = Batch {
            id: Uuid::new_v4(),
            name,
            program_id: program.id,
            program_snapshot: program.clone(),
            status: BatchStatus::Processing,
            total_records: records.len() as i32,
            qualified_count: 0,
            failed_count: 0,
            error_count: 0,
            submitted_by: actor.actor_id.clone(),
            retry_of: input.retry_of,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.store.insert_batch(&batch).await?;
        self.audit
            .record_or_alert(
                AuditAction::BatchSubmitted,
                actor,
                AuditSubject::batch(batch.id),
                json!({
                    "program_id": program.id,
                    "total_records": batch.total_records,
                    "retry_of": batch.retry_of,
                }),
            )
            .await;

        tracing::info!(
            batch_id = %batch.id,
            program_id = %program.id,
            records = batch.total_records,
            "Batch submitted"
        );

        if let Some(reason) = self.preflight(&program).await {
            let failed = self.fail_batch(actor, &batch, reason).await?;
            return Ok(PreparedBatch {
                batch: failed,
                work: Vec::new(),
            });
        }

        let (leads, work) = match self.build_leads(&batch, records) {
            Ok(built) => built,
            Err(e) => {
                self.fail_batch(actor, &batch, "records could not be encrypted".to_string())
                    .await?;
                return Err(e);
            }
        };
        if let Err(e) = self.store.insert_leads(&leads).await {
            self.fail_batch(actor, &batch, "lead rows could not be stored".to_string())
                .await?;
            return Err(e);
        }

        for lead in &leads {
            self.audit
                .record_or_alert(
                    AuditAction::LeadCreated,
                    actor,
                    AuditSubject::lead_in_batch(lead.id, batch.id),
                    json!({ "position": lead.position }),
                )
                .await;
        }

        Ok(PreparedBatch { batch, work })
    }

    /// Problems that make every per-record call pointless.
    async fn preflight(&self, program: &Program) -> Option<String> {
        if program.enabled_bureaus().is_empty() {
            return Some("program has no enabled bureaus".to_string());
        }
        let probe = self.bureau.health_probe().await;
        match probe.status {
            ProbeStatus::Connected => None,
            status => Some(format!(
                "bureau API unavailable ({}){}",
                status.as_str(),
                probe.detail.map(|d| format!(": {}", d)).unwrap_or_default()
            )),
        }
    }

    fn build_leads(
        &self,
        batch: &Batch,
        records: Vec<PrescreenRecord>,
    ) -> Result<(Vec<Lead>, Vec<WorkItem>), AppError> {
        let mut leads = Vec::with_capacity(records.len());
        let mut work = Vec::with_capacity(records.len());
        for (position, record) in records.into_iter().enumerate() {
            let ssn_encrypted = record
                .ssn
                .as_deref()
                .map(|ssn| self.vault.encrypt(ssn))
                .transpose()?;
            let dob_encrypted = record
                .dob
                .as_deref()
                .map(|dob| self.vault.encrypt(dob))
                .transpose()?;
            let ssn_fingerprint = record
                .ssn
                .as_deref()
                .map(|ssn| self.vault.ssn_fingerprint(ssn))
                .transpose()?;

            let lead = Lead {
                id: Uuid::new_v4(),
                batch_id: batch.id,
                program_id: batch.program_id,
                position: position as i32,
                first_name: record.first_name.clone(),
                middle_initial: record.middle_initial.clone(),
                last_name: record.last_name.clone(),
                address: record.address.clone(),
                city: record.city.clone(),
                state: record.state.clone(),
                zip: record.zip.clone(),
                ssn_encrypted,
                dob_encrypted,
                ssn_fingerprint,
                ssn_last_four: record.ssn.as_deref().and_then(ssn_last_four),
                match_status: MatchStatus::Pending,
                tier: Tier::Pending,
                error_message: None,
                notes: None,
                retry_flag: false,
                firm_offer: None,
                created_at: batch.created_at,
                updated_at: batch.created_at,
            };
            work.push(WorkItem {
                lead_id: lead.id,
                position,
                record,
            });
            leads.push(lead);
        }
        Ok((leads, work))
    }

    async fn fail_batch(
        &self,
        actor: &ActorContext,
        batch: &Batch,
        reason: String,
    ) -> Result<Batch, AppError> {
        tracing::warn!(batch_id = %batch.id, "Batch failed before processing: {}", reason);
        let Some(failed) = self
            .store
            .finalize_batch(batch.id, BatchStatus::Failed, Some(reason.clone()))
            .await?
        else {
            return self.get_batch(batch.id).await;
        };
        self.audit
            .record_or_alert(
                AuditAction::BatchFinalized,
                actor,
                AuditSubject::batch(batch.id),
                json!({ "status": failed.status, "error": reason }),
            )
            .await;
        Ok(failed)
    }

    /// Runs every record of a prepared batch and finalizes it.
    pub async fn run(&self, actor: &ActorContext, prepared: PreparedBatch) -> Result<Batch, AppError> {
        let PreparedBatch { batch, work } = prepared;
        if work.is_empty() {
            return Ok(batch);
        }

        let run = Arc::new(RunContext {
            batch_id: batch.id,
            bureaus: batch.program_snapshot.enabled_bureaus(),
            program: batch.program_snapshot.clone(),
        });
        let started = std::time::Instant::now();

        let mut outcomes = stream::iter(work)
            .map(|item| {
                let this = self.clone();
                let run = run.clone();
                async move { this.process_record(&run, item).await }
            })
            .buffer_unordered(self.settings.max_in_flight.max(1));

        let mut unsaved = 0usize;
        while let Some(outcome) = outcomes.next().await {
            if let Err(e) = self.store.record_lead_outcome(&outcome).await {
                tracing::error!(
                    batch_id = %batch.id,
                    lead_id = %outcome.lead_id,
                    "Failed to persist lead outcome: {}",
                    e
                );
                unsaved += 1;
            }
        }
        drop(outcomes);

        if unsaved > 0 {
            // Every lead must end with an explicit status.
            self.store
                .fail_pending_leads(batch.id, "outcome could not be stored")
                .await?;
        }

        let current = self
            .store
            .get_batch(batch.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("batch {}", batch.id)))?;
        let status = current.derived_status();
        let message = match status {
            BatchStatus::Failed => Some("every record failed with api_error".to_string()),
            BatchStatus::Partial => Some(format!(
                "{} of {} records failed with api_error",
                current.error_count, current.total_records
            )),
            _ => None,
        };
        let Some(finalized) = self
            .store
            .finalize_batch(batch.id, status, message)
            .await?
        else {
            // Reconciled while still running; the reconciler's status stands.
            let current = self.get_batch(batch.id).await?;
            tracing::warn!(
                batch_id = %current.id,
                status = %current.status,
                "Batch was finalized elsewhere before its run completed"
            );
            return Ok(current);
        };

        tracing::info!(
            batch_id = %finalized.id,
            status = %finalized.status,
            qualified = finalized.qualified_count,
            failed = finalized.failed_count,
            errors = finalized.error_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch finalized"
        );

        self.audit
            .record_or_alert(
                AuditAction::BatchFinalized,
                actor,
                AuditSubject::batch(finalized.id),
                json!({
                    "status": finalized.status,
                    "qualified_count": finalized.qualified_count,
                    "failed_count": finalized.failed_count,
                    "error_count": finalized.error_count,
                }),
            )
            .await;

        Ok(finalized)
    }

    async fn process_record(&self, run: &RunContext, item: WorkItem) -> LeadOutcome {
        let program = &run.program;
        let record = &item.record;
        let calls = run.bureaus.iter().map(|&bureau| async move {
            let request = PrescreenRequest::new(program, bureau, record);
            (bureau, self.call_bureau(&request).await)
        });
        let responses = join_all(calls).await;

        let outcome = outcome_from_responses(item.lead_id, run.batch_id, program, responses);
        tracing::debug!(
            batch_id = %run.batch_id,
            position = item.position,
            match_status = %outcome.match_status,
            tier = %outcome.tier,
            "Record processed"
        );
        outcome
    }

    async fn call_bureau(&self, request: &PrescreenRequest) -> Result<BureauResponse, AppError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AppError::InternalError("bureau call limiter closed".to_string()))?;
        match tokio::time::timeout(self.settings.call_timeout, self.bureau.prescreen(request)).await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::ExternalApiError(
                "bureau prescreen timed out".to_string(),
            )),
        }
    }

    pub async fn get_batch(&self, id: Uuid) -> Result<Batch, AppError> {
        self.store
            .get_batch(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("batch {}", id)))
    }

    pub async fn batch_detail(&self, id: Uuid) -> Result<BatchDetail, AppError> {
        let batch = self.get_batch(id).await?;
        let leads = self.store.leads_for_batch(id).await?;
        Ok(BatchDetail { batch, leads })
    }

    pub async fn list_batches(&self, filter: &BatchFilter) -> Result<Paged<Batch>, AppError> {
        self.store.list_batches(filter).await
    }

    /// Cosmetic rename; the only edit a caller may make to a batch row.
    pub async fn rename_batch(
        &self,
        actor: &ActorContext,
        id: Uuid,
        name: Option<String>,
    ) -> Result<Batch, AppError> {
        let name = normalize_name(name)?;
        if !self.store.rename_batch(id, name.clone()).await? {
            return Err(AppError::NotFound(format!("batch {}", id)));
        }
        self.audit
            .record_or_alert(
                AuditAction::BatchRenamed,
                actor,
                AuditSubject::batch(id),
                json!({ "name": name }),
            )
            .await;
        self.get_batch(id).await
    }

    /// Fails batches stuck in `processing` longer than the staleness
    /// threshold. Leads still `pending` become retry-flagged `api_error`.
    pub async fn reconcile_stale_batches(&self, now: DateTime<Utc>) -> Result<Vec<Batch>, AppError> {
        let cutoff = now - self.settings.stale_after;
        let stale = self.store.stale_processing_batches(cutoff).await?;
        let actor = ActorContext::system();
        let mut reconciled = Vec::with_capacity(stale.len());

        for batch in stale {
            let failed_leads = self
                .store
                .fail_pending_leads(batch.id, INTERRUPTED_MESSAGE)
                .await?;
            let Some(finalized) = self
                .store
                .finalize_batch(
                    batch.id,
                    BatchStatus::Failed,
                    Some(INTERRUPTED_MESSAGE.to_string()),
                )
                .await?
            else {
                tracing::debug!(batch_id = %batch.id, "Batch finished before reconciliation");
                continue;
            };
            tracing::warn!(
                batch_id = %batch.id,
                leads_failed = failed_leads,
                last_update = %batch.updated_at,
                "Reconciled stale batch"
            );
            self.audit
                .record_or_alert(
                    AuditAction::BatchReconciled,
                    &actor,
                    AuditSubject::batch(batch.id),
                    json!({
                        "leads_failed": failed_leads,
                        "last_update": batch.updated_at,
                    }),
                )
                .await;
            reconciled.push(finalized);
        }
        Ok(reconciled)
    }
}

fn normalize_name(name: Option<String>) -> Result<Option<String>, AppError> {
    let name = name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());
    if name
        .as_ref()
        .is_some_and(|n| n.chars().count() > MAX_BATCH_NAME_LEN)
    {
        return Err(AppError::Validation(format!(
            "batch name is longer than {} characters",
            MAX_BATCH_NAME_LEN
        )));
    }
    Ok(name)
}

/// Folds one record's per-bureau responses into a lead outcome.
///
/// Any hit makes the lead `matched`. Without a hit, a failed call makes it
/// `api_error` (retry flagged); only explicit no-hits from every bureau make
/// it `no_match`.
pub fn outcome_from_responses(
    lead_id: Uuid,
    batch_id: Uuid,
    program: &Program,
    responses: Vec<(BureauCode, Result<BureauResponse, AppError>)>,
) -> LeadOutcome {
    let now = Utc::now();
    let mut results = Vec::new();
    let mut hit_scores: BTreeMap<BureauCode, Option<i32>> = BTreeMap::new();
    let mut failures: Vec<String> = Vec::new();

    for (bureau, response) in responses {
        match response {
            Ok(response) => {
                if response.hit {
                    hit_scores.insert(bureau, response.credit_score);
                }
                results.push(BureauResult {
                    id: Uuid::new_v4(),
                    lead_id,
                    bureau,
                    hit: response.hit,
                    credit_score: response.credit_score,
                    attributes: response.attributes,
                    created_at: now,
                });
            }
            Err(e) => failures.push(format!("{}: {}", bureau, e.root())),
        }
    }

    let error_message = (!failures.is_empty()).then(|| failures.join("; "));
    let (match_status, tier, retry_flag) = if !hit_scores.is_empty() {
        (
            MatchStatus::Matched,
            tiering::classify(&hit_scores, &program.score_bounds),
            false,
        )
    } else if !failures.is_empty() {
        (MatchStatus::ApiError, Tier::Pending, true)
    } else {
        (MatchStatus::NoMatch, Tier::Filtered, false)
    };

    LeadOutcome {
        lead_id,
        batch_id,
        match_status,
        tier,
        error_message,
        retry_flag,
        results,
    }
}
