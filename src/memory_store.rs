//! In-process `PrescreenStore`, used by the test suite and for local runs
//! without PostgreSQL. A single mutex guards all tables, so every trait call
//! is atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{
    AuditFilter, AuditLogEntry, Batch, BatchFilter, BatchStatus, BureauResult, FirmOffer,
    HardPull, Lead, LeadFilters, LeadOutcome, LeadQuery, LeadSortField, LeadUsageRow,
    MatchStatus, Paged, Program, PullUsageRow, SortDirection, Tier,
};
use crate::store::PrescreenStore;

#[derive(Default)]
struct Tables {
    programs: HashMap<Uuid, Program>,
    batches: HashMap<Uuid, Batch>,
    leads: HashMap<Uuid, Lead>,
    bureau_results: Vec<BureauResult>,
    hard_pulls: Vec<HardPull>,
    audit: Vec<AuditLogEntry>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    audit_unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an audit-store outage: `append_audit` fails while set.
    pub fn set_audit_unavailable(&self, unavailable: bool) {
        self.audit_unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, AppError> {
        self.tables
            .lock()
            .map_err(|_| AppError::Persistence("memory store lock poisoned".to_string()))
    }
}

fn paginate<T: Clone>(items: Vec<T>, page: crate::models::PageRequest) -> Paged<T> {
    let page = page.normalized();
    let total = items.len() as u64;
    let items = items
        .into_iter()
        .skip(page.offset() as usize)
        .take(page.page_size as usize)
        .collect();
    Paged {
        items,
        total,
        page: page.page,
        page_size: page.page_size,
    }
}

fn lead_matches(lead: &Lead, filters: &LeadFilters) -> bool {
    if filters.batch_id.is_some_and(|id| lead.batch_id != id) {
        return false;
    }
    if filters.program_id.is_some_and(|id| lead.program_id != id) {
        return false;
    }
    if filters.tier.is_some_and(|tier| lead.tier != tier) {
        return false;
    }
    if filters.match_status.is_some_and(|s| lead.match_status != s) {
        return false;
    }
    if filters.retry_flag.is_some_and(|f| lead.retry_flag != f) {
        return false;
    }
    if let Some(ref name) = filters.name {
        let needle = name.to_lowercase();
        let full = format!("{} {}", lead.first_name, lead.last_name).to_lowercase();
        if !full.contains(&needle) {
            return false;
        }
    }
    if let Some(ref last) = filters.ssn_last_four {
        if lead.ssn_last_four.as_deref() != Some(last.as_str()) {
            return false;
        }
    }
    if let Some(ref fp) = filters.ssn_fingerprint {
        if lead.ssn_fingerprint.as_deref() != Some(fp.as_str()) {
            return false;
        }
    }
    true
}

#[async_trait]
impl PrescreenStore for MemoryStore {
    async fn insert_program(&self, program: &Program) -> Result<(), AppError> {
        let mut t = self.lock()?;
        if t.programs.contains_key(&program.id) {
            return Err(AppError::Conflict(format!("program {} exists", program.id)));
        }
        t.programs.insert(program.id, program.clone());
        Ok(())
    }

    async fn update_program(&self, program: &Program) -> Result<(), AppError> {
        let mut t = self.lock()?;
        match t.programs.get_mut(&program.id) {
            Some(existing) => {
                *existing = program.clone();
                Ok(())
            }
            None => Err(AppError::NotFound(format!("program {}", program.id))),
        }
    }

    async fn get_program(&self, id: Uuid) -> Result<Option<Program>, AppError> {
        Ok(self.lock()?.programs.get(&id).cloned())
    }

    async fn list_programs(&self) -> Result<Vec<Program>, AppError> {
        let mut programs: Vec<Program> = self.lock()?.programs.values().cloned().collect();
        programs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(programs)
    }

    async fn insert_batch(&self, batch: &Batch) -> Result<(), AppError> {
        self.lock()?.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<Batch>, AppError> {
        Ok(self.lock()?.batches.get(&id).cloned())
    }

    async fn list_batches(&self, filter: &BatchFilter) -> Result<Paged<Batch>, AppError> {
        let mut batches: Vec<Batch> = self
            .lock()?
            .batches
            .values()
            .filter(|b| filter.program_id.map_or(true, |id| b.program_id == id))
            .filter(|b| filter.status.map_or(true, |s| b.status == s))
            .cloned()
            .collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(paginate(batches, filter.page))
    }

    async fn rename_batch(&self, id: Uuid, name: Option<String>) -> Result<bool, AppError> {
        let mut t = self.lock()?;
        Ok(match t.batches.get_mut(&id) {
            Some(batch) => {
                batch.name = name;
                batch.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn finalize_batch(
        &self,
        id: Uuid,
        status: BatchStatus,
        error_message: Option<String>,
    ) -> Result<Option<Batch>, AppError> {
        let mut t = self.lock()?;
        let batch = t
            .batches
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("batch {}", id)))?;
        if batch.status != BatchStatus::Processing {
            return Ok(None);
        }
        let now = Utc::now();
        batch.status = status;
        batch.error_message = error_message;
        batch.updated_at = now;
        batch.completed_at = Some(now);
        Ok(Some(batch.clone()))
    }

    async fn stale_processing_batches(
        &self,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Batch>, AppError> {
        Ok(self
            .lock()?
            .batches
            .values()
            .filter(|b| b.status == BatchStatus::Processing && b.updated_at < updated_before)
            .cloned()
            .collect())
    }

    async fn insert_leads(&self, leads: &[Lead]) -> Result<(), AppError> {
        let mut t = self.lock()?;
        for lead in leads {
            t.leads.insert(lead.id, lead.clone());
        }
        Ok(())
    }

    async fn record_lead_outcome(&self, outcome: &LeadOutcome) -> Result<(), AppError> {
        let mut t = self.lock()?;
        let now = Utc::now();
        let lead = t
            .leads
            .get_mut(&outcome.lead_id)
            .ok_or_else(|| AppError::NotFound(format!("lead {}", outcome.lead_id)))?;
        if lead.match_status != MatchStatus::Pending {
            return Err(AppError::Conflict(format!(
                "lead {} already has an outcome",
                outcome.lead_id
            )));
        }
        lead.match_status = outcome.match_status;
        lead.tier = outcome.tier;
        lead.error_message = outcome.error_message.clone();
        lead.retry_flag = outcome.retry_flag;
        lead.updated_at = now;

        t.bureau_results.extend(outcome.results.iter().cloned());

        let (qualified, failed, errors) = outcome.match_status.counter_deltas();
        if let Some(batch) = t.batches.get_mut(&outcome.batch_id) {
            batch.qualified_count += qualified;
            batch.failed_count += failed;
            batch.error_count += errors;
            batch.updated_at = now;
        }
        Ok(())
    }

    async fn fail_pending_leads(&self, batch_id: Uuid, message: &str) -> Result<u64, AppError> {
        let mut t = self.lock()?;
        let now = Utc::now();
        let mut changed = 0;
        for lead in t.leads.values_mut() {
            if lead.batch_id == batch_id && lead.match_status == MatchStatus::Pending {
                lead.match_status = MatchStatus::ApiError;
                lead.tier = Tier::Pending;
                lead.error_message = Some(message.to_string());
                lead.retry_flag = true;
                lead.updated_at = now;
                changed += 1;
            }
        }
        if let Some(batch) = t.batches.get_mut(&batch_id) {
            batch.failed_count += changed as i32;
            batch.error_count += changed as i32;
            batch.updated_at = now;
        }
        Ok(changed)
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, AppError> {
        Ok(self.lock()?.leads.get(&id).cloned())
    }

    async fn get_leads(&self, ids: &[Uuid]) -> Result<Vec<Lead>, AppError> {
        let t = self.lock()?;
        Ok(ids.iter().filter_map(|id| t.leads.get(id).cloned()).collect())
    }

    async fn leads_for_batch(&self, batch_id: Uuid) -> Result<Vec<Lead>, AppError> {
        let mut leads: Vec<Lead> = self
            .lock()?
            .leads
            .values()
            .filter(|l| l.batch_id == batch_id)
            .cloned()
            .collect();
        leads.sort_by_key(|l| l.position);
        Ok(leads)
    }

    async fn list_leads(&self, query: &LeadQuery) -> Result<Paged<Lead>, AppError> {
        let mut leads: Vec<Lead> = self
            .lock()?
            .leads
            .values()
            .filter(|l| lead_matches(l, &query.filters))
            .cloned()
            .collect();
        leads.sort_by(|a, b| {
            let primary = match query.sort {
                LeadSortField::CreatedAt => a.created_at.cmp(&b.created_at),
                LeadSortField::LastName => a
                    .last_name
                    .to_lowercase()
                    .cmp(&b.last_name.to_lowercase()),
                LeadSortField::Tier => a.tier.rank().cmp(&b.tier.rank()),
                LeadSortField::Position => a.position.cmp(&b.position),
            };
            let primary = match query.direction {
                SortDirection::Asc => primary,
                SortDirection::Desc => primary.reverse(),
            };
            primary.then(a.id.cmp(&b.id))
        });
        Ok(paginate(leads, query.page))
    }

    async fn bureau_results_for_lead(&self, lead_id: Uuid) -> Result<Vec<BureauResult>, AppError> {
        Ok(self
            .lock()?
            .bureau_results
            .iter()
            .filter(|r| r.lead_id == lead_id)
            .cloned()
            .collect())
    }

    async fn set_retry_flag(&self, ids: &[Uuid], flag: bool) -> Result<u64, AppError> {
        let mut t = self.lock()?;
        let now = Utc::now();
        let mut changed = 0;
        for id in ids {
            if let Some(lead) = t.leads.get_mut(id) {
                if lead.retry_flag != flag {
                    lead.retry_flag = flag;
                    lead.updated_at = now;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn retry_queue(&self) -> Result<Vec<Lead>, AppError> {
        let mut leads: Vec<Lead> = self
            .lock()?
            .leads
            .values()
            .filter(|l| l.retry_flag)
            .cloned()
            .collect();
        leads.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.position.cmp(&b.position)));
        Ok(leads)
    }

    async fn update_lead_notes(&self, id: Uuid, notes: Option<String>) -> Result<bool, AppError> {
        let mut t = self.lock()?;
        Ok(match t.leads.get_mut(&id) {
            Some(lead) => {
                lead.notes = notes;
                lead.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn record_firm_offer(&self, id: Uuid, offer: &FirmOffer) -> Result<bool, AppError> {
        let mut t = self.lock()?;
        Ok(match t.leads.get_mut(&id) {
            Some(lead) => {
                lead.firm_offer = Some(offer.clone());
                lead.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn insert_hard_pull(&self, pull: &HardPull) -> Result<(), AppError> {
        self.lock()?.hard_pulls.push(pull.clone());
        Ok(())
    }

    async fn delete_hard_pull(&self, id: Uuid) -> Result<Option<HardPull>, AppError> {
        let mut t = self.lock()?;
        let index = t.hard_pulls.iter().position(|p| p.id == id);
        Ok(index.map(|i| t.hard_pulls.remove(i)))
    }

    async fn hard_pulls_for_lead(&self, lead_id: Uuid) -> Result<Vec<HardPull>, AppError> {
        let mut pulls: Vec<HardPull> = self
            .lock()?
            .hard_pulls
            .iter()
            .filter(|p| p.lead_id == lead_id)
            .cloned()
            .collect();
        pulls.sort_by(|a, b| b.pulled_on.cmp(&a.pulled_on));
        Ok(pulls)
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), AppError> {
        if self.audit_unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Persistence("audit store unreachable".to_string()));
        }
        self.lock()?.audit.push(entry.clone());
        Ok(())
    }

    async fn audit_entries(&self, filter: &AuditFilter) -> Result<Vec<AuditLogEntry>, AppError> {
        let limit = filter.limit.unwrap_or(500).max(0) as usize;
        let t = self.lock()?;
        Ok(t.audit
            .iter()
            .rev()
            .filter(|e| filter.lead_id.map_or(true, |id| e.lead_id == Some(id)))
            .filter(|e| filter.batch_id.map_or(true, |id| e.batch_id == Some(id)))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn usage_leads(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LeadUsageRow>, AppError> {
        Ok(self
            .lock()?
            .leads
            .values()
            .filter(|l| l.created_at >= from && l.created_at < to)
            .map(|l| LeadUsageRow {
                created_at: l.created_at,
                match_status: l.match_status,
            })
            .collect())
    }

    async fn usage_pulls(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PullUsageRow>, AppError> {
        Ok(self
            .lock()?
            .bureau_results
            .iter()
            .filter(|r| r.created_at >= from && r.created_at < to)
            .map(|r| PullUsageRow {
                created_at: r.created_at,
                bureau: r.bureau,
            })
            .collect())
    }
}
