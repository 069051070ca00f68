use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, HeaderMap, StatusCode},
    Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::AuditRecorder;
use crate::bureau_client::{BureauApi, HealthProbe};
use crate::coordinator::{
    BatchCoordinator, BatchDetail, CoordinatorSettings, PreparedBatch, SubmitBatch,
};
use crate::errors::AppError;
use crate::models::*;
use crate::retry_queue::{MaterializedRecord, QueueChange, RetryQueueManager};
use crate::services::{DecryptedField, LeadDetail, LeadService, LeadView, ProgramService};
use crate::store::PrescreenStore;
use crate::usage::{UsageAggregator, UsageSummary};
use crate::vault::PiiVault;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Bureau API client, also used for the health probe.
    pub bureau: Arc<dyn BureauApi>,
    pub coordinator: BatchCoordinator,
    pub retry_queue: RetryQueueManager,
    pub programs: ProgramService,
    pub leads: LeadService,
    pub usage: UsageAggregator,
    pub audit: AuditRecorder,
}

impl AppState {
    pub fn new(
        store: Arc<dyn PrescreenStore>,
        bureau: Arc<dyn BureauApi>,
        vault: Arc<PiiVault>,
        settings: CoordinatorSettings,
    ) -> Self {
        let coordinator =
            BatchCoordinator::new(store.clone(), bureau.clone(), vault.clone(), settings);
        Self {
            retry_queue: RetryQueueManager::new(store.clone(), vault.clone(), coordinator.clone()),
            programs: ProgramService::new(store.clone()),
            leads: LeadService::new(store.clone(), vault),
            usage: UsageAggregator::new(store.clone(), bureau.clone()),
            audit: AuditRecorder::new(store),
            coordinator,
            bureau,
        }
    }
}

// ============ Actor extraction ============

/// Identity header set by the authenticating gateway in front of this service.
pub const ACTOR_HEADER: &str = "x-actor-id";

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        })
        .map(str::to_string)
}

#[async_trait]
impl<S> FromRequestParts<S> for ActorContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let actor_id = parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::Unauthorized("Missing X-Actor-Id header".to_string()))?;
        Ok(ActorContext::new(actor_id, client_ip(&parts.headers)))
    }
}

// ============ Health ============

/// Health check endpoint.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "rust-prescreen-api",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// GET /api/v1/bureau/health
///
/// Connectivity check against the bureau API, independent of batch
/// submission. Always 200; the probe result carries the status.
pub async fn bureau_health(State(state): State<Arc<AppState>>) -> Json<HealthProbe> {
    Json(state.bureau.health_probe().await)
}

// ============ Programs ============

pub async fn list_programs(
    State(state): State<Arc<AppState>>,
    _actor: ActorContext,
) -> Result<Json<Vec<Program>>, AppError> {
    Ok(Json(state.programs.list().await?))
}

pub async fn get_program(
    State(state): State<Arc<AppState>>,
    _actor: ActorContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Program>, AppError> {
    Ok(Json(state.programs.get(id).await?))
}

/// POST /api/v1/programs
pub async fn create_program(
    State(state): State<Arc<AppState>>,
    actor: ActorContext,
    Json(input): Json<ProgramInput>,
) -> Result<(StatusCode, Json<Program>), AppError> {
    let program = state.programs.create(&actor, input).await?;
    Ok((StatusCode::CREATED, Json(program)))
}

/// PUT /api/v1/programs/:id
pub async fn update_program(
    State(state): State<Arc<AppState>>,
    actor: ActorContext,
    Path(id): Path<Uuid>,
    Json(input): Json<ProgramInput>,
) -> Result<Json<Program>, AppError> {
    Ok(Json(state.programs.update(&actor, id, input).await?))
}

// ============ Batches ============

#[derive(Debug, Serialize)]
pub struct BatchAccepted {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub total_records: i32,
    pub error_message: Option<String>,
}

/// Hands a prepared batch to a background task and returns 202.
fn accept_batch(
    state: &Arc<AppState>,
    actor: ActorContext,
    prepared: PreparedBatch,
) -> (StatusCode, Json<BatchAccepted>) {
    let accepted = BatchAccepted {
        batch_id: prepared.batch.id,
        status: prepared.batch.status,
        total_records: prepared.batch.total_records,
        error_message: prepared.batch.error_message.clone(),
    };

    if prepared.is_runnable() {
        let coordinator = state.coordinator.clone();
        let batch_id = prepared.batch.id;
        tokio::spawn(async move {
            tracing::info!("Starting background run for batch_id={}", batch_id);
            if let Err(e) = coordinator.run(&actor, prepared).await {
                // Left in `processing`; reconciliation fails it later.
                tracing::error!("Batch run failed for batch_id={}: {}", batch_id, e);
            }
        });
    }

    (StatusCode::ACCEPTED, Json(accepted))
}

/// POST /api/v1/batches
///
/// Validates and stores the batch synchronously (validation and program
/// errors are returned here), then processes records in the background.
pub async fn submit_batch(
    State(state): State<Arc<AppState>>,
    actor: ActorContext,
    Json(input): Json<SubmitBatch>,
) -> Result<(StatusCode, Json<BatchAccepted>), AppError> {
    tracing::info!(
        "POST /batches - program_id={} records={}",
        input.program_id,
        input.records.len()
    );
    let prepared = state.coordinator.prepare(&actor, input).await?;
    Ok(accept_batch(&state, actor, prepared))
}

#[derive(Debug, Deserialize)]
pub struct BatchListParams {
    pub program_id: Option<Uuid>,
    pub status: Option<BatchStatus>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

fn page_request(page: Option<u32>, page_size: Option<u32>) -> PageRequest {
    let default = PageRequest::default();
    PageRequest {
        page: page.unwrap_or(default.page),
        page_size: page_size.unwrap_or(default.page_size),
    }
    .normalized()
}

pub async fn list_batches(
    State(state): State<Arc<AppState>>,
    _actor: ActorContext,
    Query(params): Query<BatchListParams>,
) -> Result<Json<Paged<Batch>>, AppError> {
    let filter = BatchFilter {
        program_id: params.program_id,
        status: params.status,
        page: page_request(params.page, params.page_size),
    };
    Ok(Json(state.coordinator.list_batches(&filter).await?))
}

pub async fn get_batch_detail(
    State(state): State<Arc<AppState>>,
    _actor: ActorContext,
    Path(id): Path<Uuid>,
) -> Result<Json<BatchDetail>, AppError> {
    Ok(Json(state.coordinator.batch_detail(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct RenameBatchRequest {
    pub name: Option<String>,
}

/// PATCH /api/v1/batches/:id
pub async fn rename_batch(
    State(state): State<Arc<AppState>>,
    actor: ActorContext,
    Path(id): Path<Uuid>,
    Json(body): Json<RenameBatchRequest>,
) -> Result<Json<Batch>, AppError> {
    Ok(Json(
        state.coordinator.rename_batch(&actor, id, body.name).await?,
    ))
}

/// POST /api/v1/batches/:id/retry
///
/// Resubmits the batch's `api_error` leads as a new batch.
pub async fn retry_batch(
    State(state): State<Arc<AppState>>,
    actor: ActorContext,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<BatchAccepted>), AppError> {
    let prepared = state.retry_queue.retry_batch(&actor, id).await?;
    Ok(accept_batch(&state, actor, prepared))
}

// ============ Leads ============

#[derive(Debug, Deserialize)]
pub struct LeadListParams {
    pub batch_id: Option<Uuid>,
    pub program_id: Option<Uuid>,
    pub tier: Option<Tier>,
    pub match_status: Option<MatchStatus>,
    pub retry_flag: Option<bool>,
    /// Name fragment, SSN last four, or full SSN.
    pub search: Option<String>,
    pub sort: Option<LeadSortField>,
    pub direction: Option<SortDirection>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

/// GET /api/v1/leads
pub async fn list_leads(
    State(state): State<Arc<AppState>>,
    _actor: ActorContext,
    Query(params): Query<LeadListParams>,
) -> Result<Json<Paged<LeadView>>, AppError> {
    let mut filters = LeadFilters {
        batch_id: params.batch_id,
        program_id: params.program_id,
        tier: params.tier,
        match_status: params.match_status,
        retry_flag: params.retry_flag,
        ..Default::default()
    };
    if let Some(ref search) = params.search {
        state.leads.apply_search(&mut filters, search)?;
    }
    let query = LeadQuery {
        filters,
        sort: params.sort.unwrap_or_default(),
        direction: params.direction.unwrap_or_default(),
        page: page_request(params.page, params.page_size),
    };
    Ok(Json(state.leads.list(&query).await?))
}

pub async fn get_lead_detail(
    State(state): State<Arc<AppState>>,
    _actor: ActorContext,
    Path(id): Path<Uuid>,
) -> Result<Json<LeadDetail>, AppError> {
    Ok(Json(state.leads.detail(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct DecryptRequest {
    pub field: PiiField,
}

/// POST /api/v1/leads/:id/decrypt
///
/// Always audited, including when the decrypt fails.
pub async fn decrypt_lead_field(
    State(state): State<Arc<AppState>>,
    actor: ActorContext,
    Path(id): Path<Uuid>,
    Json(body): Json<DecryptRequest>,
) -> Result<Json<DecryptedField>, AppError> {
    Ok(Json(state.leads.decrypt_field(&actor, id, body.field).await?))
}

#[derive(Debug, Deserialize)]
pub struct NotesRequest {
    pub notes: Option<String>,
}

pub async fn update_lead_notes(
    State(state): State<Arc<AppState>>,
    actor: ActorContext,
    Path(id): Path<Uuid>,
    Json(body): Json<NotesRequest>,
) -> Result<Json<LeadView>, AppError> {
    Ok(Json(state.leads.update_notes(&actor, id, body.notes).await?))
}

pub async fn record_firm_offer(
    State(state): State<Arc<AppState>>,
    actor: ActorContext,
    Path(id): Path<Uuid>,
    Json(offer): Json<FirmOffer>,
) -> Result<Json<LeadView>, AppError> {
    Ok(Json(state.leads.record_firm_offer(&actor, id, offer).await?))
}

pub async fn add_hard_pull(
    State(state): State<Arc<AppState>>,
    actor: ActorContext,
    Path(lead_id): Path<Uuid>,
    Json(input): Json<HardPullInput>,
) -> Result<(StatusCode, Json<HardPull>), AppError> {
    let pull = state.leads.add_hard_pull(&actor, lead_id, input).await?;
    Ok((StatusCode::CREATED, Json(pull)))
}

pub async fn delete_hard_pull(
    State(state): State<Arc<AppState>>,
    actor: ActorContext,
    Path(id): Path<Uuid>,
) -> Result<Json<HardPull>, AppError> {
    Ok(Json(state.leads.delete_hard_pull(&actor, id).await?))
}

// ============ Retry queue ============

#[derive(Debug, Deserialize)]
pub struct LeadIdsRequest {
    pub lead_ids: Vec<Uuid>,
    #[serde(default)]
    pub name: Option<String>,
}

pub async fn list_retry_queue(
    State(state): State<Arc<AppState>>,
    _actor: ActorContext,
) -> Result<Json<Vec<LeadView>>, AppError> {
    let leads = state.retry_queue.list_queue().await?;
    Ok(Json(leads.into_iter().map(LeadView::from).collect()))
}

pub async fn enqueue_retry(
    State(state): State<Arc<AppState>>,
    actor: ActorContext,
    Json(body): Json<LeadIdsRequest>,
) -> Result<Json<QueueChange>, AppError> {
    Ok(Json(state.retry_queue.enqueue(&actor, &body.lead_ids).await?))
}

pub async fn dequeue_retry(
    State(state): State<Arc<AppState>>,
    actor: ActorContext,
    Json(body): Json<LeadIdsRequest>,
) -> Result<Json<QueueChange>, AppError> {
    Ok(Json(state.retry_queue.dequeue(&actor, &body.lead_ids).await?))
}

/// POST /api/v1/retry-queue/materialize
///
/// Returns plaintext submission records; every lead is audited.
pub async fn materialize_retry(
    State(state): State<Arc<AppState>>,
    actor: ActorContext,
    Json(body): Json<LeadIdsRequest>,
) -> Result<Json<Vec<MaterializedRecord>>, AppError> {
    Ok(Json(
        state.retry_queue.materialize(&actor, &body.lead_ids).await?,
    ))
}

pub async fn resubmit_retry(
    State(state): State<Arc<AppState>>,
    actor: ActorContext,
    Json(body): Json<LeadIdsRequest>,
) -> Result<(StatusCode, Json<BatchAccepted>), AppError> {
    let prepared = state
        .retry_queue
        .resubmit(&actor, &body.lead_ids, body.name)
        .await?;
    Ok(accept_batch(&state, actor, prepared))
}

// ============ Audit ============

#[derive(Debug, Deserialize)]
pub struct AuditParams {
    pub lead_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub limit: Option<i64>,
}

pub async fn list_audit_entries(
    State(state): State<Arc<AppState>>,
    _actor: ActorContext,
    Query(params): Query<AuditParams>,
) -> Result<Json<Vec<AuditLogEntry>>, AppError> {
    let filter = AuditFilter {
        lead_id: params.lead_id,
        batch_id: params.batch_id,
        limit: Some(params.limit.unwrap_or(100).clamp(1, 1_000)),
    };
    Ok(Json(state.audit.entries(&filter).await?))
}

// ============ Usage ============

#[derive(Debug, Deserialize)]
pub struct UsageParams {
    pub from: NaiveDate,
    pub to: NaiveDate,
    #[serde(default)]
    pub include_costs: bool,
}

/// GET /api/v1/usage?from=YYYY-MM-DD&to=YYYY-MM-DD&include_costs=true
pub async fn get_usage_summary(
    State(state): State<Arc<AppState>>,
    _actor: ActorContext,
    Query(params): Query<UsageParams>,
) -> Result<Json<UsageSummary>, AppError> {
    let range = DateRange::new(params.from, params.to)?;
    Ok(Json(
        state.usage.summarize(range, params.include_costs).await?,
    ))
}
