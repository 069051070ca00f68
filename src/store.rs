use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{
    AuditFilter, AuditLogEntry, Batch, BatchFilter, BatchStatus, BureauResult, FirmOffer,
    HardPull, Lead, LeadOutcome, LeadQuery, LeadUsageRow, Paged, Program, PullUsageRow,
};

/// Persistence collaborator for the prescreen engine.
///
/// Implementations must make `insert_leads`, `record_lead_outcome` and
/// `fail_pending_leads` atomic: batch counters are only ever changed inside
/// the same write that changes the lead rows they count.
#[async_trait]
pub trait PrescreenStore: Send + Sync {
    async fn insert_program(&self, program: &Program) -> Result<(), AppError>;
    async fn update_program(&self, program: &Program) -> Result<(), AppError>;
    async fn get_program(&self, id: Uuid) -> Result<Option<Program>, AppError>;
    async fn list_programs(&self) -> Result<Vec<Program>, AppError>;

    async fn insert_batch(&self, batch: &Batch) -> Result<(), AppError>;
    async fn get_batch(&self, id: Uuid) -> Result<Option<Batch>, AppError>;
    async fn list_batches(&self, filter: &BatchFilter) -> Result<Paged<Batch>, AppError>;
    async fn rename_batch(&self, id: Uuid, name: Option<String>) -> Result<bool, AppError>;
    /// Moves a batch out of `processing`; returns the updated row, or `None`
    /// when the batch had already left `processing`.
    async fn finalize_batch(
        &self,
        id: Uuid,
        status: BatchStatus,
        error_message: Option<String>,
    ) -> Result<Option<Batch>, AppError>;
    async fn stale_processing_batches(
        &self,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Batch>, AppError>;

    /// Inserts every lead of a batch in one write.
    async fn insert_leads(&self, leads: &[Lead]) -> Result<(), AppError>;
    /// Persists bureau rows, updates the lead, and bumps the batch counters.
    async fn record_lead_outcome(&self, outcome: &LeadOutcome) -> Result<(), AppError>;
    /// Marks every still-`pending` lead of a batch as `api_error` (retry
    /// flagged) and counts them; returns how many were changed.
    async fn fail_pending_leads(&self, batch_id: Uuid, message: &str) -> Result<u64, AppError>;
    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, AppError>;
    async fn get_leads(&self, ids: &[Uuid]) -> Result<Vec<Lead>, AppError>;
    async fn leads_for_batch(&self, batch_id: Uuid) -> Result<Vec<Lead>, AppError>;
    async fn list_leads(&self, query: &LeadQuery) -> Result<Paged<Lead>, AppError>;
    async fn bureau_results_for_lead(&self, lead_id: Uuid) -> Result<Vec<BureauResult>, AppError>;
    async fn set_retry_flag(&self, ids: &[Uuid], flag: bool) -> Result<u64, AppError>;
    async fn retry_queue(&self) -> Result<Vec<Lead>, AppError>;
    async fn update_lead_notes(&self, id: Uuid, notes: Option<String>) -> Result<bool, AppError>;
    async fn record_firm_offer(&self, id: Uuid, offer: &FirmOffer) -> Result<bool, AppError>;

    async fn insert_hard_pull(&self, pull: &HardPull) -> Result<(), AppError>;
    async fn delete_hard_pull(&self, id: Uuid) -> Result<Option<HardPull>, AppError>;
    async fn hard_pulls_for_lead(&self, lead_id: Uuid) -> Result<Vec<HardPull>, AppError>;

    /// Append-only; there is no update or delete counterpart.
    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), AppError>;
    async fn audit_entries(&self, filter: &AuditFilter) -> Result<Vec<AuditLogEntry>, AppError>;

    async fn usage_leads(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LeadUsageRow>, AppError>;
    async fn usage_pulls(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PullUsageRow>, AppError>;
}
