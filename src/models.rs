use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::AppError;

// ============ Enumerations ============

/// Generates `as_str`, `Display` and `FromStr` for a unit enum whose variants
/// are stored as text columns.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(AppError::Validation(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// One of the three US credit bureaus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BureauCode {
    Eq,
    Tu,
    Ex,
}

text_enum!(BureauCode { Eq => "eq", Tu => "tu", Ex => "ex" });

impl BureauCode {
    pub const ALL: [BureauCode; 3] = [BureauCode::Eq, BureauCode::Tu, BureauCode::Ex];

    pub fn display_name(&self) -> &'static str {
        match self {
            BureauCode::Eq => "Equifax",
            BureauCode::Tu => "TransUnion",
            BureauCode::Ex => "Experian",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Partial,
    Failed,
}

text_enum!(BatchStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Partial => "partial",
    Failed => "failed",
});

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Partial | BatchStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Pending,
    Matched,
    NoMatch,
    ApiError,
}

text_enum!(MatchStatus {
    Pending => "pending",
    Matched => "matched",
    NoMatch => "no_match",
    ApiError => "api_error",
});

impl MatchStatus {
    /// `(qualified, failed, error)` increments a lead with this terminal
    /// status contributes to its batch counters.
    pub fn counter_deltas(&self) -> (i32, i32, i32) {
        match self {
            MatchStatus::Matched => (1, 0, 0),
            MatchStatus::NoMatch => (0, 1, 0),
            MatchStatus::ApiError => (0, 1, 1),
            MatchStatus::Pending => (0, 0, 0),
        }
    }
}

/// Qualification bucket derived from the representative credit score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    #[serde(rename = "tier_1")]
    Tier1,
    #[serde(rename = "tier_2")]
    Tier2,
    #[serde(rename = "tier_3")]
    Tier3,
    #[serde(rename = "below")]
    Below,
    #[serde(rename = "filtered")]
    Filtered,
    #[serde(rename = "pending")]
    Pending,
}

text_enum!(Tier {
    Tier1 => "tier_1",
    Tier2 => "tier_2",
    Tier3 => "tier_3",
    Below => "below",
    Filtered => "filtered",
    Pending => "pending",
});

impl Tier {
    /// Sort rank, best tier first.
    pub fn rank(&self) -> u8 {
        match self {
            Tier::Tier1 => 0,
            Tier::Tier2 => 1,
            Tier::Tier3 => 2,
            Tier::Below => 3,
            Tier::Filtered => 4,
            Tier::Pending => 5,
        }
    }

    pub fn is_qualifying(&self) -> bool {
        matches!(self, Tier::Tier1 | Tier::Tier2 | Tier::Tier3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreModel {
    Fico2,
    Fico4,
    Fico5,
    Fico8,
    Fico9,
    Vantage3,
    Vantage4,
}

text_enum!(ScoreModel {
    Fico2 => "fico_2",
    Fico4 => "fico_4",
    Fico5 => "fico_5",
    Fico8 => "fico_8",
    Fico9 => "fico_9",
    Vantage3 => "vantage_3",
    Vantage4 => "vantage_4",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiField {
    Ssn,
    Dob,
}

text_enum!(PiiField { Ssn => "ssn", Dob => "dob" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmOfferMethod {
    Mail,
    Email,
    InPerson,
    Other,
}

text_enum!(FirmOfferMethod {
    Mail => "mail",
    Email => "email",
    InPerson => "in_person",
    Other => "other",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ProgramCreated,
    ProgramUpdated,
    BatchSubmitted,
    BatchFinalized,
    BatchRenamed,
    BatchRetried,
    BatchReconciled,
    LeadCreated,
    DecryptField,
    RetryEnqueued,
    RetryDequeued,
    RetryMaterialized,
    NotesUpdated,
    FirmOfferRecorded,
    HardPullAdded,
    HardPullDeleted,
}

text_enum!(AuditAction {
    ProgramCreated => "program_created",
    ProgramUpdated => "program_updated",
    BatchSubmitted => "batch_submitted",
    BatchFinalized => "batch_finalized",
    BatchRenamed => "batch_renamed",
    BatchRetried => "batch_retried",
    BatchReconciled => "batch_reconciled",
    LeadCreated => "lead_created",
    DecryptField => "decrypt_field",
    RetryEnqueued => "retry_enqueued",
    RetryDequeued => "retry_dequeued",
    RetryMaterialized => "retry_materialized",
    NotesUpdated => "notes_updated",
    FirmOfferRecorded => "firm_offer_recorded",
    HardPullAdded => "hard_pull_added",
    HardPullDeleted => "hard_pull_deleted",
});

// ============ Request context ============

/// Authenticated caller identity, passed explicitly into every core call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    pub actor_id: String,
    pub ip_address: Option<String>,
}

impl ActorContext {
    pub fn new(actor_id: impl Into<String>, ip_address: Option<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            ip_address,
        }
    }

    /// Actor used by background jobs (reconciliation, scheduled tasks).
    pub fn system() -> Self {
        Self::new("system", None)
    }
}

// ============ Program ============

/// One selection-criteria constraint on a catalog attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Criterion {
    Range { min: Option<f64>, max: Option<f64> },
    Flag { required: bool },
    ChoiceSet { values: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BureauSetting {
    pub enabled: bool,
    pub score_model: ScoreModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBounds {
    pub min_score: i32,
    pub max_score: i32,
}

impl ScoreBounds {
    pub fn contains(&self, score: i32) -> bool {
        score >= self.min_score && score <= self.max_score
    }
}

/// Named prescreen configuration referenced by every batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub active: bool,
    pub score_bounds: ScoreBounds,
    pub bureaus: BTreeMap<BureauCode, BureauSetting>,
    pub selection_criteria: BTreeMap<String, Criterion>,
    pub output_attributes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Program {
    /// Bureaus enabled on this program, in canonical `eq, tu, ex` order.
    pub fn enabled_bureaus(&self) -> Vec<BureauCode> {
        BureauCode::ALL
            .into_iter()
            .filter(|code| self.bureaus.get(code).map(|s| s.enabled).unwrap_or(false))
            .collect()
    }
}

/// Operator input for creating or editing a program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramInput {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    pub score_bounds: ScoreBounds,
    pub bureaus: BTreeMap<BureauCode, BureauSetting>,
    #[serde(default)]
    pub selection_criteria: BTreeMap<String, Criterion>,
    #[serde(default)]
    pub output_attributes: Vec<String>,
}

fn default_true() -> bool {
    true
}

// ============ Batch ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub name: Option<String>,
    pub program_id: Uuid,
    /// Program configuration as it was when this batch was submitted.
    pub program_snapshot: Program,
    pub status: BatchStatus,
    pub total_records: i32,
    pub qualified_count: i32,
    pub failed_count: i32,
    /// Leads that ended in `api_error`; subset of `failed_count`.
    pub error_count: i32,
    pub submitted_by: String,
    pub retry_of: Option<Uuid>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// Terminal status implied by the aggregate counters.
    pub fn derived_status(&self) -> BatchStatus {
        if self.total_records > 0 && self.error_count >= self.total_records {
            BatchStatus::Failed
        } else if self.error_count == 0 {
            BatchStatus::Completed
        } else {
            BatchStatus::Partial
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchFilter {
    pub program_id: Option<Uuid>,
    pub status: Option<BatchStatus>,
    #[serde(default)]
    pub page: PageRequest,
}

// ============ Lead ============

/// Submission record as provided by a caller (or reconstructed for retry).
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct PrescreenRecord {
    pub first_name: String,
    #[serde(default)]
    pub middle_initial: Option<String>,
    pub last_name: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    #[serde(default)]
    pub ssn: Option<String>,
    #[serde(default)]
    pub dob: Option<String>,
}

impl fmt::Debug for PrescreenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrescreenRecord")
            .field("state", &self.state)
            .field("zip", &self.zip)
            .field("ssn", &self.ssn.as_ref().map(|_| "[REDACTED]"))
            .field("dob", &self.dob.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmOffer {
    pub sent: bool,
    pub sent_on: Option<NaiveDate>,
    pub method: Option<FirmOfferMethod>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub program_id: Uuid,
    /// Zero-based position of the record in its submitted batch.
    pub position: i32,
    pub first_name: String,
    pub middle_initial: Option<String>,
    pub last_name: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    #[serde(skip_serializing, default)]
    pub ssn_encrypted: Option<String>,
    #[serde(skip_serializing, default)]
    pub dob_encrypted: Option<String>,
    #[serde(skip_serializing, default)]
    pub ssn_fingerprint: Option<String>,
    pub ssn_last_four: Option<String>,
    pub match_status: MatchStatus,
    pub tier: Tier,
    pub error_message: Option<String>,
    pub notes: Option<String>,
    pub retry_flag: bool,
    pub firm_offer: Option<FirmOffer>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of processing one lead against every enabled bureau.
#[derive(Debug, Clone)]
pub struct LeadOutcome {
    pub lead_id: Uuid,
    pub batch_id: Uuid,
    pub match_status: MatchStatus,
    pub tier: Tier,
    pub error_message: Option<String>,
    pub retry_flag: bool,
    pub results: Vec<BureauResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LeadSortField {
    #[default]
    CreatedAt,
    LastName,
    Tier,
    Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadFilters {
    pub batch_id: Option<Uuid>,
    pub program_id: Option<Uuid>,
    pub tier: Option<Tier>,
    pub match_status: Option<MatchStatus>,
    pub retry_flag: Option<bool>,
    /// Name substring (case-insensitive).
    pub name: Option<String>,
    pub ssn_last_four: Option<String>,
    pub ssn_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LeadQuery {
    pub filters: LeadFilters,
    pub sort: LeadSortField,
    pub direction: SortDirection,
    pub page: PageRequest,
}

// ============ Bureau results ============

/// One bureau's response for one lead. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BureauResult {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub bureau: BureauCode,
    pub hit: bool,
    pub credit_score: Option<i32>,
    pub attributes: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

// ============ Hard pulls ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardPull {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub pulled_on: NaiveDate,
    pub agency: String,
    pub lender: String,
    pub eq_score: Option<i32>,
    pub tu_score: Option<i32>,
    pub ex_score: Option<i32>,
    pub outcome: String,
    pub notes: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardPullInput {
    pub pulled_on: NaiveDate,
    pub agency: String,
    pub lender: String,
    #[serde(default)]
    pub eq_score: Option<i32>,
    #[serde(default)]
    pub tu_score: Option<i32>,
    #[serde(default)]
    pub ex_score: Option<i32>,
    pub outcome: String,
    #[serde(default)]
    pub notes: Option<String>,
}

// ============ Audit ============

/// Append-only record of a sensitive access or mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub action: AuditAction,
    pub actor_id: String,
    pub lead_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub ip_address: Option<String>,
    pub detail: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    pub lead_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub limit: Option<i64>,
}

// ============ Paging ============

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    /// Clamps page to >= 1 and page size to `1..=MAX_PAGE_SIZE`.
    pub fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            page_size: self.page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        let p = self.normalized();
        (p.page as u64 - 1) * p.page_size as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

// ============ Usage ============

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self, AppError> {
        if from > to {
            return Err(AppError::Validation(
                "date range start must not be after its end".to_string(),
            ));
        }
        Ok(Self { from, to })
    }

    /// Half-open UTC instant bounds `[from 00:00, to+1 00:00)`.
    pub fn bounds(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), AppError> {
        let start = self.from.and_time(chrono::NaiveTime::MIN).and_utc();
        let end = self
            .to
            .checked_add_days(chrono::Days::new(1))
            .ok_or_else(|| AppError::Validation("date range end is out of range".to_string()))?
            .and_time(chrono::NaiveTime::MIN)
            .and_utc();
        Ok((start, end))
    }
}

/// Minimal lead facts needed for usage accounting.
#[derive(Debug, Clone)]
pub struct LeadUsageRow {
    pub created_at: DateTime<Utc>,
    pub match_status: MatchStatus,
}

#[derive(Debug, Clone)]
pub struct PullUsageRow {
    pub created_at: DateTime<Utc>,
    pub bureau: BureauCode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_serializes_with_underscored_names() {
        assert_eq!(serde_json::to_string(&Tier::Tier1).unwrap(), "\"tier_1\"");
        assert_eq!("tier_3".parse::<Tier>().unwrap(), Tier::Tier3);
        assert!("tier_4".parse::<Tier>().is_err());
    }

    #[test]
    fn criterion_is_tagged_by_kind() {
        let raw = serde_json::json!({"kind": "choice_set", "values": ["owner", "renter"]});
        let criterion: Criterion = serde_json::from_value(raw).unwrap();
        assert_eq!(
            criterion,
            Criterion::ChoiceSet {
                values: vec!["owner".to_string(), "renter".to_string()]
            }
        );
    }

    #[test]
    fn record_debug_hides_pii() {
        let record = PrescreenRecord {
            first_name: "Ada".to_string(),
            middle_initial: None,
            last_name: "Lovelace".to_string(),
            address: "1 Main St".to_string(),
            city: "Austin".to_string(),
            state: "TX".to_string(),
            zip: "78701".to_string(),
            ssn: Some("123-45-6789".to_string()),
            dob: Some("1980-01-02".to_string()),
        };
        let rendered = format!("{:?}", record);
        assert!(!rendered.contains("6789"));
        assert!(!rendered.contains("1980"));
        assert!(!rendered.contains("Lovelace"));
    }

    #[test]
    fn page_request_is_clamped() {
        let page = PageRequest {
            page: 0,
            page_size: 10_000,
        }
        .normalized();
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, MAX_PAGE_SIZE);
        assert_eq!(
            PageRequest {
                page: 3,
                page_size: 20
            }
            .offset(),
            40
        );
    }

    #[test]
    fn date_range_rejects_inverted_bounds() {
        let from = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let to = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert!(DateRange::new(from, to).is_err());
        let (start, end) = DateRange::new(to, from).unwrap().bounds().unwrap();
        assert_eq!((end - start).num_days(), 2);
    }

    #[test]
    fn date_range_ending_on_last_representable_day_is_rejected() {
        let range = DateRange::new(NaiveDate::MIN, NaiveDate::MAX).unwrap();
        assert!(matches!(range.bounds(), Err(AppError::Validation(_))));
    }
}
