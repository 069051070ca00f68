use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use failsafe::futures::CircuitBreaker;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::circuit_breaker::{create_bureau_circuit_breaker, BureauCircuitBreaker};
use crate::config::Config;
use crate::errors::AppError;
use crate::models::{BureauCode, Criterion, DateRange, PrescreenRecord, Program};

/// Body of one per-record, per-bureau prescreen call.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrescreenRequest {
    pub program_id: Uuid,
    pub bureaus: Vec<BureauCode>,
    pub record: BureauRecord,
    pub selection_criteria: BTreeMap<String, Criterion>,
    pub output_attributes: Vec<String>,
}

impl std::fmt::Debug for PrescreenRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrescreenRequest")
            .field("program_id", &self.program_id)
            .field("bureaus", &self.bureaus)
            .field("record", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl PrescreenRequest {
    pub fn new(program: &Program, bureau: BureauCode, record: &PrescreenRecord) -> Self {
        Self {
            program_id: program.id,
            bureaus: vec![bureau],
            record: BureauRecord::from(record),
            selection_criteria: program.selection_criteria.clone(),
            output_attributes: program.output_attributes.clone(),
        }
    }
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BureauRecord {
    pub first_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub middle_initial: Option<String>,
    pub last_name: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dob: Option<String>,
}

impl From<&PrescreenRecord> for BureauRecord {
    fn from(r: &PrescreenRecord) -> Self {
        Self {
            first_name: r.first_name.clone(),
            middle_initial: r.middle_initial.clone(),
            last_name: r.last_name.clone(),
            address: r.address.clone(),
            city: r.city.clone(),
            state: r.state.clone(),
            zip: r.zip.clone(),
            ssn: r.ssn.clone(),
            dob: r.dob.clone(),
        }
    }
}

/// One bureau's answer. Unknown attribute keys pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BureauResponse {
    pub hit: bool,
    #[serde(default)]
    pub credit_score: Option<i32>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostReportRow {
    pub date: NaiveDate,
    pub bureau: BureauCode,
    pub matches: i64,
    pub base_cost: BigDecimal,
    /// Every add-on cost column the bureau reports, keyed by its name.
    #[serde(flatten)]
    pub add_on_costs: BTreeMap<String, BigDecimal>,
    pub total: BigDecimal,
}

#[derive(Debug, Deserialize)]
struct CostReportEnvelope {
    rows: Vec<CostReportRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Connected,
    Blocked,
    NotConfigured,
    Error,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::Connected => "connected",
            ProbeStatus::Blocked => "blocked",
            ProbeStatus::NotConfigured => "not_configured",
            ProbeStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthProbe {
    pub status: ProbeStatus,
    pub detail: Option<String>,
    pub latency_ms: Option<u64>,
}

impl HealthProbe {
    fn new(status: ProbeStatus, detail: Option<String>) -> Self {
        Self {
            status,
            detail,
            latency_ms: None,
        }
    }
}

/// External multi-bureau scoring API.
#[async_trait]
pub trait BureauApi: Send + Sync {
    /// Prescreens one record against the single bureau named in the request.
    async fn prescreen(&self, request: &PrescreenRequest) -> Result<BureauResponse, AppError>;

    /// Date-ranged billing rows from the bureau's reporting endpoint.
    async fn cost_report(&self, range: &DateRange) -> Result<Vec<CostReportRow>, AppError>;

    /// Connectivity check, independent from batch submission.
    async fn health_probe(&self) -> HealthProbe;
}

/// HTTP implementation of [`BureauApi`].
#[derive(Clone)]
pub struct HttpBureauClient {
    client: reqwest::Client,
    base_url: Option<String>,
    api_key: Option<String>,
    billing_url: Option<String>,
    probe_timeout: Duration,
    breaker: Arc<BureauCircuitBreaker>,
}

impl HttpBureauClient {
    /// Creates a new `HttpBureauClient`.
    ///
    /// Missing base URL or key is not an error here: `health_probe` reports
    /// `not_configured` and batch pre-flight fails the batch instead.
    pub fn new(
        base_url: Option<String>,
        api_key: Option<String>,
        billing_url: Option<String>,
        call_timeout: Duration,
        probe_timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create bureau client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url,
            api_key,
            billing_url,
            probe_timeout,
            breaker: Arc::new(create_bureau_circuit_breaker()),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        Self::new(
            config.bureau_base_url.clone(),
            config.bureau_api_key.clone(),
            config.bureau_billing_url.clone(),
            config.bureau_timeout(),
            config.bureau_health_timeout(),
        )
    }

    fn credentials(&self) -> Result<(&str, &str), AppError> {
        match (self.base_url.as_deref(), self.api_key.as_deref()) {
            (Some(url), Some(key)) => Ok((url, key)),
            _ => Err(AppError::Configuration(
                "bureau API base URL or key not configured".to_string(),
            )),
        }
    }

    async fn send_prescreen(&self, request: &PrescreenRequest) -> Result<BureauResponse, AppError> {
        let (base_url, api_key) = self.credentials()?;
        let url = format!("{}/v1/prescreen", base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                let reason = if e.is_timeout() { "timed out" } else { "unreachable" };
                AppError::ExternalApiError(format!("bureau prescreen {}", reason))
            })?;

        let status = response.status();
        if !status.is_success() {
            // Bodies can echo the request, so only the status is kept.
            return Err(AppError::ExternalApiError(describe_status(
                "bureau prescreen",
                status,
            )));
        }

        response.json::<BureauResponse>().await.map_err(|_| {
            AppError::ExternalApiError("bureau prescreen returned malformed JSON".to_string())
        })
    }
}

fn describe_status(operation: &str, status: StatusCode) -> String {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            format!("{} rejected credentials ({})", operation, status.as_u16())
        }
        StatusCode::TOO_MANY_REQUESTS => format!("{} rate limited (429)", operation),
        other => format!("{} returned status {}", operation, other.as_u16()),
    }
}

#[async_trait]
impl BureauApi for HttpBureauClient {
    async fn prescreen(&self, request: &PrescreenRequest) -> Result<BureauResponse, AppError> {
        tracing::debug!(
            program_id = %request.program_id,
            bureaus = ?request.bureaus,
            "Submitting prescreen request"
        );
        match self.breaker.call(self.send_prescreen(request)).await {
            Ok(response) => Ok(response),
            Err(failsafe::Error::Rejected) => Err(AppError::ExternalApiError(
                "bureau circuit open; call not attempted".to_string(),
            )),
            Err(failsafe::Error::Inner(e)) => Err(e),
        }
    }

    async fn cost_report(&self, range: &DateRange) -> Result<Vec<CostReportRow>, AppError> {
        let billing_url = self.billing_url.as_deref().ok_or_else(|| {
            AppError::Configuration("bureau billing endpoint not configured".to_string())
        })?;
        let (_, api_key) = self.credentials()?;

        let from = range.from.format("%Y-%m-%d").to_string();
        let to = range.to.format("%Y-%m-%d").to_string();
        let url = reqwest::Url::parse_with_params(
            &format!("{}/v1/billing/report", billing_url),
            &[("from", from.as_str()), ("to", to.as_str())],
        )
        .map_err(|e| AppError::ExternalApiError(format!("Failed to build URL: {}", e)))?;

        tracing::info!("Fetching bureau cost report {}..{}", from, to);

        let response = self
            .client
            .get(url)
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(AppError::from)?;

        if !response.status().is_success() {
            return Err(AppError::ExternalApiError(describe_status(
                "bureau billing report",
                response.status(),
            )));
        }

        let envelope: CostReportEnvelope = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse billing report: {}", e))
        })?;
        Ok(envelope.rows)
    }

    async fn health_probe(&self) -> HealthProbe {
        let (base_url, api_key) = match self.credentials() {
            Ok(creds) => creds,
            Err(_) => {
                return HealthProbe::new(
                    ProbeStatus::NotConfigured,
                    Some("BUREAU_BASE_URL or BUREAU_API_KEY missing".to_string()),
                )
            }
        };

        let started = std::time::Instant::now();
        let result = self
            .client
            .get(format!("{}/v1/health", base_url))
            .bearer_auth(api_key)
            .timeout(self.probe_timeout)
            .send()
            .await;
        let latency_ms = Some(started.elapsed().as_millis() as u64);

        let mut probe = match result {
            Ok(response) => match response.status() {
                s if s.is_success() => HealthProbe::new(ProbeStatus::Connected, None),
                s @ (StatusCode::UNAUTHORIZED
                | StatusCode::FORBIDDEN
                | StatusCode::TOO_MANY_REQUESTS) => HealthProbe::new(
                    ProbeStatus::Blocked,
                    Some(describe_status("bureau health", s)),
                ),
                s => HealthProbe::new(ProbeStatus::Error, Some(describe_status("bureau health", s))),
            },
            Err(e) if e.is_timeout() => {
                HealthProbe::new(ProbeStatus::Error, Some("health probe timed out".to_string()))
            }
            Err(e) => HealthProbe::new(ProbeStatus::Error, Some(e.without_url().to_string())),
        };
        probe.latency_ms = latency_ms;
        probe
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_creation() {
        let client = HttpBureauClient::new(
            Some("https://bureau.example.com".to_string()),
            Some("key".to_string()),
            None,
            Duration::from_secs(5),
            Duration::from_secs(1),
        );
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn unconfigured_client_probes_not_configured() {
        let client = HttpBureauClient::new(
            None,
            None,
            None,
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(client.health_probe().await.status, ProbeStatus::NotConfigured);
    }

    #[test]
    fn response_keeps_unknown_attributes() {
        let raw = serde_json::json!({
            "hit": true,
            "creditScore": 701,
            "attributes": {"inquiries_6m": 1, "vendorFlag": "X"}
        });
        let parsed: BureauResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.credit_score, Some(701));
        assert_eq!(parsed.attributes["vendorFlag"], serde_json::json!("X"));
    }
}
