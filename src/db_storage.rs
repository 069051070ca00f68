use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::*;
use crate::store::PrescreenStore;

/// PostgreSQL implementation of [`PrescreenStore`].
///
/// Lead outcome writes and pending-lead failure run in one transaction each,
/// so batch counters always agree with the lead rows they count.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// ============ Row mapping ============

fn parse_column<T: FromStr<Err = AppError>>(column: &str, value: &str) -> Result<T, AppError> {
    value
        .parse()
        .map_err(|e| AppError::InternalError(format!("corrupt {} column: {}", column, e)))
}

#[derive(sqlx::FromRow)]
struct ProgramRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    active: bool,
    min_score: i32,
    max_score: i32,
    bureaus: Json<BTreeMap<BureauCode, BureauSetting>>,
    selection_criteria: Json<BTreeMap<String, Criterion>>,
    output_attributes: Json<Vec<String>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ProgramRow> for Program {
    fn from(row: ProgramRow) -> Self {
        Program {
            id: row.id,
            name: row.name,
            description: row.description,
            active: row.active,
            score_bounds: ScoreBounds {
                min_score: row.min_score,
                max_score: row.max_score,
            },
            bureaus: row.bureaus.0,
            selection_criteria: row.selection_criteria.0,
            output_attributes: row.output_attributes.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct BatchRow {
    id: Uuid,
    name: Option<String>,
    program_id: Uuid,
    program_snapshot: Json<Program>,
    status: String,
    total_records: i32,
    qualified_count: i32,
    failed_count: i32,
    error_count: i32,
    submitted_by: String,
    retry_of: Option<Uuid>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<BatchRow> for Batch {
    type Error = AppError;

    fn try_from(row: BatchRow) -> Result<Self, Self::Error> {
        Ok(Batch {
            id: row.id,
            name: row.name,
            program_id: row.program_id,
            program_snapshot: row.program_snapshot.0,
            status: parse_column("batches.status", &row.status)?,
            total_records: row.total_records,
            qualified_count: row.qualified_count,
            failed_count: row.failed_count,
            error_count: row.error_count,
            submitted_by: row.submitted_by,
            retry_of: row.retry_of,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LeadRow {
    id: Uuid,
    batch_id: Uuid,
    program_id: Uuid,
    position: i32,
    first_name: String,
    middle_initial: Option<String>,
    last_name: String,
    address: String,
    city: String,
    state: String,
    zip: String,
    ssn_encrypted: Option<String>,
    dob_encrypted: Option<String>,
    ssn_fingerprint: Option<String>,
    ssn_last_four: Option<String>,
    match_status: String,
    tier: String,
    error_message: Option<String>,
    notes: Option<String>,
    retry_flag: bool,
    firm_offer: Option<Json<FirmOffer>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<LeadRow> for Lead {
    type Error = AppError;

    fn try_from(row: LeadRow) -> Result<Self, Self::Error> {
        Ok(Lead {
            id: row.id,
            batch_id: row.batch_id,
            program_id: row.program_id,
            position: row.position,
            first_name: row.first_name,
            middle_initial: row.middle_initial,
            last_name: row.last_name,
            address: row.address,
            city: row.city,
            state: row.state,
            zip: row.zip,
            ssn_encrypted: row.ssn_encrypted,
            dob_encrypted: row.dob_encrypted,
            ssn_fingerprint: row.ssn_fingerprint,
            ssn_last_four: row.ssn_last_four,
            match_status: parse_column("leads.match_status", &row.match_status)?,
            tier: parse_column("leads.tier", &row.tier)?,
            error_message: row.error_message,
            notes: row.notes,
            retry_flag: row.retry_flag,
            firm_offer: row.firm_offer.map(|j| j.0),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BureauResultRow {
    id: Uuid,
    lead_id: Uuid,
    bureau: String,
    hit: bool,
    credit_score: Option<i32>,
    attributes: Json<BTreeMap<String, Value>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<BureauResultRow> for BureauResult {
    type Error = AppError;

    fn try_from(row: BureauResultRow) -> Result<Self, Self::Error> {
        Ok(BureauResult {
            id: row.id,
            lead_id: row.lead_id,
            bureau: parse_column("bureau_results.bureau", &row.bureau)?,
            hit: row.hit,
            credit_score: row.credit_score,
            attributes: row.attributes.0,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HardPullRow {
    id: Uuid,
    lead_id: Uuid,
    pulled_on: NaiveDate,
    agency: String,
    lender: String,
    eq_score: Option<i32>,
    tu_score: Option<i32>,
    ex_score: Option<i32>,
    outcome: String,
    notes: Option<String>,
    created_by: String,
    created_at: DateTime<Utc>,
}

impl From<HardPullRow> for HardPull {
    fn from(row: HardPullRow) -> Self {
        HardPull {
            id: row.id,
            lead_id: row.lead_id,
            pulled_on: row.pulled_on,
            agency: row.agency,
            lender: row.lender,
            eq_score: row.eq_score,
            tu_score: row.tu_score,
            ex_score: row.ex_score,
            outcome: row.outcome,
            notes: row.notes,
            created_by: row.created_by,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: Uuid,
    action: String,
    actor_id: String,
    lead_id: Option<Uuid>,
    batch_id: Option<Uuid>,
    ip_address: Option<String>,
    detail: Json<Value>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuditRow> for AuditLogEntry {
    type Error = AppError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        Ok(AuditLogEntry {
            id: row.id,
            action: parse_column("audit_log.action", &row.action)?,
            actor_id: row.actor_id,
            lead_id: row.lead_id,
            batch_id: row.batch_id,
            ip_address: row.ip_address,
            detail: row.detail.0,
            created_at: row.created_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, AppError>
where
    T: TryFrom<R, Error = AppError>,
{
    rows.into_iter().map(T::try_from).collect()
}

// ============ Query helpers ============

const TIER_RANK_SQL: &str = "CASE tier WHEN 'tier_1' THEN 0 WHEN 'tier_2' THEN 1 \
     WHEN 'tier_3' THEN 2 WHEN 'below' THEN 3 WHEN 'filtered' THEN 4 ELSE 5 END";

/// `%needle%` with LIKE metacharacters escaped.
fn contains_pattern(needle: &str) -> String {
    let escaped = needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

fn push_lead_filters(qb: &mut QueryBuilder<'_, Postgres>, filters: &LeadFilters) {
    if let Some(id) = filters.batch_id {
        qb.push(" AND batch_id = ").push_bind(id);
    }
    if let Some(id) = filters.program_id {
        qb.push(" AND program_id = ").push_bind(id);
    }
    if let Some(tier) = filters.tier {
        qb.push(" AND tier = ").push_bind(tier.as_str());
    }
    if let Some(status) = filters.match_status {
        qb.push(" AND match_status = ").push_bind(status.as_str());
    }
    if let Some(flag) = filters.retry_flag {
        qb.push(" AND retry_flag = ").push_bind(flag);
    }
    if let Some(ref name) = filters.name {
        qb.push(" AND (first_name || ' ' || last_name) ILIKE ")
            .push_bind(contains_pattern(name));
    }
    if let Some(ref last) = filters.ssn_last_four {
        qb.push(" AND ssn_last_four = ").push_bind(last.clone());
    }
    if let Some(ref fingerprint) = filters.ssn_fingerprint {
        qb.push(" AND ssn_fingerprint = ").push_bind(fingerprint.clone());
    }
}

fn push_batch_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &BatchFilter) {
    if let Some(id) = filter.program_id {
        qb.push(" AND program_id = ").push_bind(id);
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
}

fn push_page(qb: &mut QueryBuilder<'_, Postgres>, page: PageRequest) {
    let page = page.normalized();
    qb.push(" LIMIT ")
        .push_bind(page.page_size as i64)
        .push(" OFFSET ")
        .push_bind(page.offset() as i64);
}

#[async_trait]
impl PrescreenStore for PgStore {
    async fn insert_program(&self, program: &Program) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO programs (id, name, description, active, min_score, max_score,
                                  bureaus, selection_criteria, output_attributes,
                                  created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(program.id)
        .bind(&program.name)
        .bind(&program.description)
        .bind(program.active)
        .bind(program.score_bounds.min_score)
        .bind(program.score_bounds.max_score)
        .bind(Json(&program.bureaus))
        .bind(Json(&program.selection_criteria))
        .bind(Json(&program.output_attributes))
        .bind(program.created_at)
        .bind(program.updated_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        Ok(())
    }

    async fn update_program(&self, program: &Program) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE programs
            SET name = $2, description = $3, active = $4, min_score = $5, max_score = $6,
                bureaus = $7, selection_criteria = $8, output_attributes = $9,
                updated_at = $10
            WHERE id = $1
            "#,
        )
        .bind(program.id)
        .bind(&program.name)
        .bind(&program.description)
        .bind(program.active)
        .bind(program.score_bounds.min_score)
        .bind(program.score_bounds.max_score)
        .bind(Json(&program.bureaus))
        .bind(Json(&program.selection_criteria))
        .bind(Json(&program.output_attributes))
        .bind(program.updated_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("program {}", program.id)));
        }
        Ok(())
    }

    async fn get_program(&self, id: Uuid) -> Result<Option<Program>, AppError> {
        let row = sqlx::query_as::<_, ProgramRow>("SELECT * FROM programs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(row.map(Program::from))
    }

    async fn list_programs(&self) -> Result<Vec<Program>, AppError> {
        let rows = sqlx::query_as::<_, ProgramRow>("SELECT * FROM programs ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(rows.into_iter().map(Program::from).collect())
    }

    async fn insert_batch(&self, batch: &Batch) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO batches (id, name, program_id, program_snapshot, status, total_records,
                                 qualified_count, failed_count, error_count, submitted_by,
                                 retry_of, error_message, created_at, updated_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(batch.id)
        .bind(&batch.name)
        .bind(batch.program_id)
        .bind(Json(&batch.program_snapshot))
        .bind(batch.status.as_str())
        .bind(batch.total_records)
        .bind(batch.qualified_count)
        .bind(batch.failed_count)
        .bind(batch.error_count)
        .bind(&batch.submitted_by)
        .bind(batch.retry_of)
        .bind(&batch.error_message)
        .bind(batch.created_at)
        .bind(batch.updated_at)
        .bind(batch.completed_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<Batch>, AppError> {
        sqlx::query_as::<_, BatchRow>("SELECT * FROM batches WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?
            .map(Batch::try_from)
            .transpose()
    }

    async fn list_batches(&self, filter: &BatchFilter) -> Result<Paged<Batch>, AppError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM batches WHERE TRUE");
        push_batch_filters(&mut count, filter);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM batches WHERE TRUE");
        push_batch_filters(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, id ASC");
        push_page(&mut qb, filter.page);
        let rows: Vec<BatchRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        let page = filter.page.normalized();
        Ok(Paged {
            items: convert_all(rows)?,
            total: total as u64,
            page: page.page,
            page_size: page.page_size,
        })
    }

    async fn rename_batch(&self, id: Uuid, name: Option<String>) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE batches SET name = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(result.rows_affected() > 0)
    }

    async fn finalize_batch(
        &self,
        id: Uuid,
        status: BatchStatus,
        error_message: Option<String>,
    ) -> Result<Option<Batch>, AppError> {
        let row = sqlx::query_as::<_, BatchRow>(
            r#"
            UPDATE batches
            SET status = $2, error_message = $3, updated_at = now(), completed_at = now()
            WHERE id = $1 AND status = 'processing'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_message)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        match row {
            Some(row) => Batch::try_from(row).map(Some),
            None if self.get_batch(id).await?.is_some() => Ok(None),
            None => Err(AppError::NotFound(format!("batch {}", id))),
        }
    }

    async fn stale_processing_batches(
        &self,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Batch>, AppError> {
        let rows = sqlx::query_as::<_, BatchRow>(
            "SELECT * FROM batches WHERE status = 'processing' AND updated_at < $1 ORDER BY updated_at",
        )
        .bind(updated_before)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        convert_all(rows)
    }

    async fn insert_leads(&self, leads: &[Lead]) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;
        for lead in leads {
            sqlx::query(
                r#"
                INSERT INTO leads (id, batch_id, program_id, position, first_name, middle_initial,
                                   last_name, address, city, state, zip, ssn_encrypted,
                                   dob_encrypted, ssn_fingerprint, ssn_last_four, match_status,
                                   tier, error_message, notes, retry_flag, firm_offer,
                                   created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                        $17, $18, $19, $20, $21, $22, $23)
                "#,
            )
            .bind(lead.id)
            .bind(lead.batch_id)
            .bind(lead.program_id)
            .bind(lead.position)
            .bind(&lead.first_name)
            .bind(&lead.middle_initial)
            .bind(&lead.last_name)
            .bind(&lead.address)
            .bind(&lead.city)
            .bind(&lead.state)
            .bind(&lead.zip)
            .bind(&lead.ssn_encrypted)
            .bind(&lead.dob_encrypted)
            .bind(&lead.ssn_fingerprint)
            .bind(&lead.ssn_last_four)
            .bind(lead.match_status.as_str())
            .bind(lead.tier.as_str())
            .bind(&lead.error_message)
            .bind(&lead.notes)
            .bind(lead.retry_flag)
            .bind(lead.firm_offer.as_ref().map(Json))
            .bind(lead.created_at)
            .bind(lead.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(AppError::DatabaseError)?;
        }
        tx.commit().await.map_err(AppError::DatabaseError)?;
        Ok(())
    }

    async fn record_lead_outcome(&self, outcome: &LeadOutcome) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;

        let updated = sqlx::query(
            r#"
            UPDATE leads
            SET match_status = $2, tier = $3, error_message = $4, retry_flag = $5,
                updated_at = now()
            WHERE id = $1 AND match_status = 'pending'
            "#,
        )
        .bind(outcome.lead_id)
        .bind(outcome.match_status.as_str())
        .bind(outcome.tier.as_str())
        .bind(&outcome.error_message)
        .bind(outcome.retry_flag)
        .execute(&mut *tx)
        .await
        .map_err(AppError::DatabaseError)?;
        if updated.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "lead {} is missing or already has an outcome",
                outcome.lead_id
            )));
        }

        for result in &outcome.results {
            sqlx::query(
                r#"
                INSERT INTO bureau_results (id, lead_id, bureau, hit, credit_score, attributes, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(result.id)
            .bind(result.lead_id)
            .bind(result.bureau.as_str())
            .bind(result.hit)
            .bind(result.credit_score)
            .bind(Json(&result.attributes))
            .bind(result.created_at)
            .execute(&mut *tx)
            .await
            .map_err(AppError::DatabaseError)?;
        }

        let (qualified, failed, errors) = outcome.match_status.counter_deltas();
        sqlx::query(
            r#"
            UPDATE batches
            SET qualified_count = qualified_count + $2,
                failed_count = failed_count + $3,
                error_count = error_count + $4,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(outcome.batch_id)
        .bind(qualified)
        .bind(failed)
        .bind(errors)
        .execute(&mut *tx)
        .await
        .map_err(AppError::DatabaseError)?;

        tx.commit().await.map_err(AppError::DatabaseError)?;
        Ok(())
    }

    async fn fail_pending_leads(&self, batch_id: Uuid, message: &str) -> Result<u64, AppError> {
        let mut tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;
        let changed = sqlx::query(
            r#"
            UPDATE leads
            SET match_status = 'api_error', tier = 'pending', error_message = $2,
                retry_flag = TRUE, updated_at = now()
            WHERE batch_id = $1 AND match_status = 'pending'
            "#,
        )
        .bind(batch_id)
        .bind(message)
        .execute(&mut *tx)
        .await
        .map_err(AppError::DatabaseError)?
        .rows_affected();

        sqlx::query(
            r#"
            UPDATE batches
            SET failed_count = failed_count + $2, error_count = error_count + $2,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(batch_id)
        .bind(changed as i32)
        .execute(&mut *tx)
        .await
        .map_err(AppError::DatabaseError)?;

        tx.commit().await.map_err(AppError::DatabaseError)?;
        Ok(changed)
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, AppError> {
        sqlx::query_as::<_, LeadRow>("SELECT * FROM leads WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?
            .map(Lead::try_from)
            .transpose()
    }

    async fn get_leads(&self, ids: &[Uuid]) -> Result<Vec<Lead>, AppError> {
        let rows = sqlx::query_as::<_, LeadRow>("SELECT * FROM leads WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        convert_all(rows)
    }

    async fn leads_for_batch(&self, batch_id: Uuid) -> Result<Vec<Lead>, AppError> {
        let rows = sqlx::query_as::<_, LeadRow>(
            "SELECT * FROM leads WHERE batch_id = $1 ORDER BY position",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        convert_all(rows)
    }

    async fn list_leads(&self, query: &LeadQuery) -> Result<Paged<Lead>, AppError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM leads WHERE TRUE");
        push_lead_filters(&mut count, &query.filters);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        let order = match query.sort {
            LeadSortField::CreatedAt => "created_at",
            LeadSortField::LastName => "lower(last_name)",
            LeadSortField::Tier => TIER_RANK_SQL,
            LeadSortField::Position => "position",
        };
        let direction = match query.direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };

        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM leads WHERE TRUE");
        push_lead_filters(&mut qb, &query.filters);
        qb.push(format!(" ORDER BY {} {}, id ASC", order, direction));
        push_page(&mut qb, query.page);
        let rows: Vec<LeadRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        let page = query.page.normalized();
        Ok(Paged {
            items: convert_all(rows)?,
            total: total as u64,
            page: page.page,
            page_size: page.page_size,
        })
    }

    async fn bureau_results_for_lead(&self, lead_id: Uuid) -> Result<Vec<BureauResult>, AppError> {
        let rows = sqlx::query_as::<_, BureauResultRow>(
            "SELECT * FROM bureau_results WHERE lead_id = $1 ORDER BY created_at, bureau",
        )
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        convert_all(rows)
    }

    async fn set_retry_flag(&self, ids: &[Uuid], flag: bool) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE leads SET retry_flag = $2, updated_at = now()
            WHERE id = ANY($1) AND retry_flag <> $2
            "#,
        )
        .bind(ids)
        .bind(flag)
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        Ok(result.rows_affected())
    }

    async fn retry_queue(&self) -> Result<Vec<Lead>, AppError> {
        let rows = sqlx::query_as::<_, LeadRow>(
            "SELECT * FROM leads WHERE retry_flag ORDER BY created_at, position",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        convert_all(rows)
    }

    async fn update_lead_notes(&self, id: Uuid, notes: Option<String>) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE leads SET notes = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(notes)
            .execute(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_firm_offer(&self, id: Uuid, offer: &FirmOffer) -> Result<bool, AppError> {
        let result =
            sqlx::query("UPDATE leads SET firm_offer = $2, updated_at = now() WHERE id = $1")
                .bind(id)
                .bind(Json(offer))
                .execute(&self.pool)
                .await
                .map_err(AppError::DatabaseError)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_hard_pull(&self, pull: &HardPull) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO hard_pulls (id, lead_id, pulled_on, agency, lender, eq_score, tu_score,
                                    ex_score, outcome, notes, created_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(pull.id)
        .bind(pull.lead_id)
        .bind(pull.pulled_on)
        .bind(&pull.agency)
        .bind(&pull.lender)
        .bind(pull.eq_score)
        .bind(pull.tu_score)
        .bind(pull.ex_score)
        .bind(&pull.outcome)
        .bind(&pull.notes)
        .bind(&pull.created_by)
        .bind(pull.created_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        Ok(())
    }

    async fn delete_hard_pull(&self, id: Uuid) -> Result<Option<HardPull>, AppError> {
        let row = sqlx::query_as::<_, HardPullRow>("DELETE FROM hard_pulls WHERE id = $1 RETURNING *")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(row.map(HardPull::from))
    }

    async fn hard_pulls_for_lead(&self, lead_id: Uuid) -> Result<Vec<HardPull>, AppError> {
        let rows = sqlx::query_as::<_, HardPullRow>(
            "SELECT * FROM hard_pulls WHERE lead_id = $1 ORDER BY pulled_on DESC",
        )
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        Ok(rows.into_iter().map(HardPull::from).collect())
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (id, action, actor_id, lead_id, batch_id, ip_address, detail, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.action.as_str())
        .bind(&entry.actor_id)
        .bind(entry.lead_id)
        .bind(entry.batch_id)
        .bind(&entry.ip_address)
        .bind(Json(&entry.detail))
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Persistence(format!("audit insert failed: {}", e)))?;
        Ok(())
    }

    async fn audit_entries(&self, filter: &AuditFilter) -> Result<Vec<AuditLogEntry>, AppError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM audit_log WHERE TRUE");
        if let Some(id) = filter.lead_id {
            qb.push(" AND lead_id = ").push_bind(id);
        }
        if let Some(id) = filter.batch_id {
            qb.push(" AND batch_id = ").push_bind(id);
        }
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(filter.limit.unwrap_or(500).clamp(0, 5_000));
        let rows: Vec<AuditRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        convert_all(rows)
    }

    async fn usage_leads(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LeadUsageRow>, AppError> {
        let rows = sqlx::query_as::<_, (DateTime<Utc>, String)>(
            "SELECT created_at, match_status FROM leads WHERE created_at >= $1 AND created_at < $2",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        rows.into_iter()
            .map(|(created_at, status)| {
                Ok(LeadUsageRow {
                    created_at,
                    match_status: parse_column("leads.match_status", &status)?,
                })
            })
            .collect()
    }

    async fn usage_pulls(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PullUsageRow>, AppError> {
        let rows = sqlx::query_as::<_, (DateTime<Utc>, String)>(
            "SELECT created_at, bureau FROM bureau_results WHERE created_at >= $1 AND created_at < $2",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        rows.into_iter()
            .map(|(created_at, bureau)| {
                Ok(PullUsageRow {
                    created_at,
                    bureau: parse_column("bureau_results.bureau", &bureau)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_metacharacters_are_escaped() {
        assert_eq!(contains_pattern("o'neil"), "%o'neil%");
        assert_eq!(contains_pattern("50%_off"), "%50\\%\\_off%");
    }

    #[test]
    fn corrupt_enum_column_is_internal_error() {
        let err = parse_column::<Tier>("leads.tier", "tier_9").unwrap_err();
        assert!(matches!(err, AppError::InternalError(_)));
    }
}
