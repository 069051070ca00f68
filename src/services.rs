use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditRecorder, AuditSubject};
use crate::catalog::{self, AttributeCategory};
use crate::errors::AppError;
use crate::models::*;
use crate::records::normalize_ssn;
use crate::store::PrescreenStore;
use crate::tiering;
use crate::vault::{mask_dob, mask_ssn, mask_ssn_last_four, PiiVault};

const MAX_NOTES_LEN: usize = 4_000;

// ============ Programs ============

#[derive(Clone)]
pub struct ProgramService {
    store: Arc<dyn PrescreenStore>,
    audit: AuditRecorder,
}

impl ProgramService {
    pub fn new(store: Arc<dyn PrescreenStore>) -> Self {
        Self {
            audit: AuditRecorder::new(store.clone()),
            store,
        }
    }

    pub async fn create(&self, actor: &ActorContext, input: ProgramInput) -> Result<Program, AppError> {
        catalog::validate_program(&input)?;
        let now = Utc::now();
        let program = Program {
            id: Uuid::new_v4(),
            name: input.name.trim().to_string(),
            description: input.description,
            active: input.active,
            score_bounds: input.score_bounds,
            bureaus: input.bureaus,
            selection_criteria: input.selection_criteria,
            output_attributes: input.output_attributes,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_program(&program).await?;
        self.audit
            .record_or_alert(
                AuditAction::ProgramCreated,
                actor,
                AuditSubject::default(),
                json!({ "program_id": program.id, "name": program.name }),
            )
            .await;
        tracing::info!(program_id = %program.id, "Program created");
        Ok(program)
    }

    /// Replaces a program's configuration. Batches already submitted keep
    /// their own snapshot.
    pub async fn update(
        &self,
        actor: &ActorContext,
        id: Uuid,
        input: ProgramInput,
    ) -> Result<Program, AppError> {
        catalog::validate_program(&input)?;
        let existing = self.get(id).await?;
        let program = Program {
            id,
            name: input.name.trim().to_string(),
            description: input.description,
            active: input.active,
            score_bounds: input.score_bounds,
            bureaus: input.bureaus,
            selection_criteria: input.selection_criteria,
            output_attributes: input.output_attributes,
            created_at: existing.created_at,
            updated_at: Utc::now(),
        };
        self.store.update_program(&program).await?;
        self.audit
            .record_or_alert(
                AuditAction::ProgramUpdated,
                actor,
                AuditSubject::default(),
                json!({
                    "program_id": id,
                    "active": program.active,
                    "enabled_bureaus": program.enabled_bureaus(),
                }),
            )
            .await;
        Ok(program)
    }

    pub async fn get(&self, id: Uuid) -> Result<Program, AppError> {
        self.store
            .get_program(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("program {}", id)))
    }

    pub async fn list(&self) -> Result<Vec<Program>, AppError> {
        self.store.list_programs().await
    }
}

// ============ Leads ============

/// Lead as returned to callers: no ciphertext, SSN masked from the stored
/// last four digits only.
#[derive(Debug, Clone, Serialize)]
pub struct LeadView {
    #[serde(flatten)]
    pub lead: Lead,
    pub ssn_masked: String,
}

impl From<Lead> for LeadView {
    fn from(lead: Lead) -> Self {
        let ssn_masked = mask_ssn_last_four(lead.ssn_last_four.as_deref());
        Self { lead, ssn_masked }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BureauResultView {
    pub bureau: BureauCode,
    pub bureau_name: &'static str,
    pub hit: bool,
    pub credit_score: Option<i32>,
    pub attributes: BTreeMap<AttributeCategory, BTreeMap<String, Value>>,
    pub created_at: DateTime<Utc>,
}

impl From<BureauResult> for BureauResultView {
    fn from(result: BureauResult) -> Self {
        Self {
            bureau: result.bureau,
            bureau_name: result.bureau.display_name(),
            hit: result.hit,
            credit_score: result.credit_score,
            attributes: catalog::categorize(&result.attributes),
            created_at: result.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LeadDetail {
    pub lead: LeadView,
    pub bureau_results: Vec<BureauResultView>,
    pub hard_pulls: Vec<HardPull>,
    pub representative_score: Option<i32>,
    /// `None` when no bureau returned a score.
    pub within_program_range: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecryptedField {
    pub lead_id: Uuid,
    pub field: PiiField,
    pub value: String,
    pub masked: String,
}

/// What a free-text lead search term was interpreted as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchTerm {
    FullSsn(String),
    LastFour(String),
    Name(String),
}

impl SearchTerm {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Some(ssn) = normalize_ssn(trimmed) {
            return Some(SearchTerm::FullSsn(ssn));
        }
        if trimmed.len() == 4 && trimmed.chars().all(|c| c.is_ascii_digit()) {
            return Some(SearchTerm::LastFour(trimmed.to_string()));
        }
        Some(SearchTerm::Name(trimmed.to_string()))
    }
}

#[derive(Clone)]
pub struct LeadService {
    store: Arc<dyn PrescreenStore>,
    vault: Arc<PiiVault>,
    audit: AuditRecorder,
}

impl LeadService {
    pub fn new(store: Arc<dyn PrescreenStore>, vault: Arc<PiiVault>) -> Self {
        Self {
            audit: AuditRecorder::new(store.clone()),
            store,
            vault,
        }
    }

    /// Applies a free-text search to the filters. A full SSN is matched
    /// through its blind index, never by decrypting stored values.
    pub fn apply_search(&self, filters: &mut LeadFilters, search: &str) -> Result<(), AppError> {
        match SearchTerm::parse(search) {
            Some(SearchTerm::FullSsn(ssn)) => {
                filters.ssn_fingerprint = Some(self.vault.ssn_fingerprint(&ssn)?);
            }
            Some(SearchTerm::LastFour(last)) => filters.ssn_last_four = Some(last),
            Some(SearchTerm::Name(name)) => filters.name = Some(name),
            None => {}
        }
        Ok(())
    }

    pub async fn list(&self, query: &LeadQuery) -> Result<Paged<LeadView>, AppError> {
        let page = self.store.list_leads(query).await?;
        Ok(Paged {
            items: page.items.into_iter().map(LeadView::from).collect(),
            total: page.total,
            page: page.page,
            page_size: page.page_size,
        })
    }

    async fn get_lead(&self, id: Uuid) -> Result<Lead, AppError> {
        self.store
            .get_lead(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("lead {}", id)))
    }

    pub async fn detail(&self, id: Uuid) -> Result<LeadDetail, AppError> {
        let lead = self.get_lead(id).await?;
        let results = self.store.bureau_results_for_lead(id).await?;
        let hard_pulls = self.store.hard_pulls_for_lead(id).await?;
        let bounds = self
            .store
            .get_batch(lead.batch_id)
            .await?
            .map(|b| b.program_snapshot.score_bounds);

        let hit_scores: BTreeMap<BureauCode, Option<i32>> = results
            .iter()
            .filter(|r| r.hit)
            .map(|r| (r.bureau, r.credit_score))
            .collect();
        let representative_score = tiering::representative_score(&hit_scores);
        let within_program_range =
            bounds.and_then(|b| tiering::within_program_range(&hit_scores, &b));

        Ok(LeadDetail {
            lead: LeadView::from(lead),
            bureau_results: results.into_iter().map(BureauResultView::from).collect(),
            hard_pulls,
            representative_score,
            within_program_range,
        })
    }

    /// Reveals one encrypted field. Exactly one `decrypt_field` audit entry is
    /// written per call, whatever the outcome, and always before a plaintext
    /// value leaves this function.
    pub async fn decrypt_field(
        &self,
        actor: &ActorContext,
        lead_id: Uuid,
        field: PiiField,
    ) -> Result<DecryptedField, AppError> {
        let result = self.try_decrypt(lead_id, field).await;
        let (outcome, batch_id) = match &result {
            Ok((_, batch_id)) => ("ok", Some(*batch_id)),
            Err(e) => (decrypt_outcome(e), None),
        };

        let subject = AuditSubject {
            lead_id: Some(lead_id),
            batch_id,
        };
        self.audit
            .record_or_alert(
                AuditAction::DecryptField,
                actor,
                subject,
                json!({ "field": field, "outcome": outcome }),
            )
            .await;

        let (value, _) = result?;
        let masked = match field {
            PiiField::Ssn => mask_ssn(&value),
            PiiField::Dob => mask_dob(&value),
        };
        Ok(DecryptedField {
            lead_id,
            field,
            value,
            masked,
        })
    }

    async fn try_decrypt(&self, lead_id: Uuid, field: PiiField) -> Result<(String, Uuid), AppError> {
        let lead = self.get_lead(lead_id).await?;
        let token = match field {
            PiiField::Ssn => lead.ssn_encrypted.as_deref(),
            PiiField::Dob => lead.dob_encrypted.as_deref(),
        }
        .ok_or_else(|| AppError::NotFound(format!("lead {} has no stored {}", lead_id, field)))?;
        let value = self.vault.decrypt(token)?;
        Ok((value, lead.batch_id))
    }

    pub async fn update_notes(
        &self,
        actor: &ActorContext,
        id: Uuid,
        notes: Option<String>,
    ) -> Result<LeadView, AppError> {
        let notes = notes.filter(|n| !n.trim().is_empty());
        if notes
            .as_ref()
            .is_some_and(|n| n.chars().count() > MAX_NOTES_LEN)
        {
            return Err(AppError::Validation(format!(
                "notes are longer than {} characters",
                MAX_NOTES_LEN
            )));
        }
        let length = notes.as_ref().map(|n| n.chars().count()).unwrap_or(0);
        if !self.store.update_lead_notes(id, notes).await? {
            return Err(AppError::NotFound(format!("lead {}", id)));
        }
        // Note text may mention PII; only its size is audited.
        self.audit
            .record_or_alert(
                AuditAction::NotesUpdated,
                actor,
                AuditSubject::lead(id),
                json!({ "length": length }),
            )
            .await;
        Ok(LeadView::from(self.get_lead(id).await?))
    }

    pub async fn record_firm_offer(
        &self,
        actor: &ActorContext,
        id: Uuid,
        offer: FirmOffer,
    ) -> Result<LeadView, AppError> {
        if offer.sent && (offer.sent_on.is_none() || offer.method.is_none()) {
            return Err(AppError::Validation(
                "a sent firm offer needs a date and a method".to_string(),
            ));
        }
        if !self.store.record_firm_offer(id, &offer).await? {
            return Err(AppError::NotFound(format!("lead {}", id)));
        }
        self.audit
            .record_or_alert(
                AuditAction::FirmOfferRecorded,
                actor,
                AuditSubject::lead(id),
                json!({
                    "sent": offer.sent,
                    "sent_on": offer.sent_on,
                    "method": offer.method,
                }),
            )
            .await;
        Ok(LeadView::from(self.get_lead(id).await?))
    }

    pub async fn add_hard_pull(
        &self,
        actor: &ActorContext,
        lead_id: Uuid,
        input: HardPullInput,
    ) -> Result<HardPull, AppError> {
        validate_hard_pull(&input)?;
        let lead = self.get_lead(lead_id).await?;
        let pull = HardPull {
            id: Uuid::new_v4(),
            lead_id,
            pulled_on: input.pulled_on,
            agency: input.agency.trim().to_string(),
            lender: input.lender.trim().to_string(),
            eq_score: input.eq_score,
            tu_score: input.tu_score,
            ex_score: input.ex_score,
            outcome: input.outcome.trim().to_string(),
            notes: input.notes.filter(|n| !n.trim().is_empty()),
            created_by: actor.actor_id.clone(),
            created_at: Utc::now(),
        };
        self.store.insert_hard_pull(&pull).await?;
        self.audit
            .record_or_alert(
                AuditAction::HardPullAdded,
                actor,
                AuditSubject::lead_in_batch(lead_id, lead.batch_id),
                json!({
                    "hard_pull_id": pull.id,
                    "pulled_on": pull.pulled_on,
                    "agency": pull.agency,
                }),
            )
            .await;
        Ok(pull)
    }

    pub async fn delete_hard_pull(&self, actor: &ActorContext, id: Uuid) -> Result<HardPull, AppError> {
        let pull = self
            .store
            .delete_hard_pull(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("hard pull {}", id)))?;
        self.audit
            .record_or_alert(
                AuditAction::HardPullDeleted,
                actor,
                AuditSubject::lead(pull.lead_id),
                json!({ "hard_pull_id": pull.id, "pulled_on": pull.pulled_on }),
            )
            .await;
        Ok(pull)
    }
}

fn decrypt_outcome(error: &AppError) -> &'static str {
    match error.root() {
        AppError::NotFound(_) => "not_found",
        AppError::Integrity(_) => "integrity_failure",
        AppError::Configuration(_) => "not_configured",
        _ => "error",
    }
}

fn validate_hard_pull(input: &HardPullInput) -> Result<(), AppError> {
    for (name, value) in [
        ("agency", &input.agency),
        ("lender", &input.lender),
        ("outcome", &input.outcome),
    ] {
        if value.trim().is_empty() {
            return Err(AppError::Validation(format!("hard pull {} is required", name)));
        }
    }
    for (bureau, score) in [
        (BureauCode::Eq, input.eq_score),
        (BureauCode::Tu, input.tu_score),
        (BureauCode::Ex, input.ex_score),
    ] {
        if let Some(score) = score {
            if !(catalog::MIN_REPORTABLE_SCORE..=catalog::MAX_REPORTABLE_SCORE).contains(&score) {
                return Err(AppError::Validation(format!(
                    "{} score must be between {} and {}",
                    bureau,
                    catalog::MIN_REPORTABLE_SCORE,
                    catalog::MAX_REPORTABLE_SCORE
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn search_terms() {
        assert_eq!(
            SearchTerm::parse("123-45-6789"),
            Some(SearchTerm::FullSsn("123456789".to_string()))
        );
        assert_eq!(
            SearchTerm::parse(" 6789 "),
            Some(SearchTerm::LastFour("6789".to_string()))
        );
        assert_eq!(
            SearchTerm::parse("hopper"),
            Some(SearchTerm::Name("hopper".to_string()))
        );
        assert_eq!(SearchTerm::parse("   "), None);
    }

    #[test]
    fn hard_pull_scores_are_bounded() {
        let mut input = HardPullInput {
            pulled_on: NaiveDate::from_ymd_opt(2026, 4, 1).unwrap(),
            agency: "Equifax".to_string(),
            lender: "First Credit Union".to_string(),
            eq_score: Some(701),
            tu_score: None,
            ex_score: None,
            outcome: "approved".to_string(),
            notes: None,
        };
        assert!(validate_hard_pull(&input).is_ok());
        input.tu_score = Some(900);
        assert!(validate_hard_pull(&input).is_err());
        input.tu_score = None;
        input.lender = " ".to_string();
        assert!(validate_hard_pull(&input).is_err());
    }

    #[test]
    fn decrypt_outcomes_are_labelled() {
        assert_eq!(decrypt_outcome(&AppError::Integrity("tag".into())), "integrity_failure");
        assert_eq!(decrypt_outcome(&AppError::NotFound("lead".into())), "not_found");
    }
}
