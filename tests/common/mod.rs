//! Shared fixtures: an in-memory store, a scriptable bureau and a program.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use rust_prescreen_api::bureau_client::{
    BureauApi, BureauResponse, CostReportRow, HealthProbe, PrescreenRequest, ProbeStatus,
};
use rust_prescreen_api::coordinator::{BatchCoordinator, CoordinatorSettings};
use rust_prescreen_api::errors::AppError;
use rust_prescreen_api::memory_store::MemoryStore;
use rust_prescreen_api::models::*;
use rust_prescreen_api::store::PrescreenStore;
use rust_prescreen_api::vault::PiiVault;

pub const TEST_KEY: [u8; 32] = [7u8; 32];

/// Bureau double. Every record hits with the score registered for its last
/// name (700 by default); names in `failing` error and names in `no_hit`
/// come back without a hit. Names in `latency` answer after that delay.
pub struct FakeBureau {
    pub calls: AtomicUsize,
    pub probes: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    pub latency: Mutex<HashMap<String, Duration>>,
    pub probe_status: Mutex<ProbeStatus>,
    pub failing: Mutex<HashSet<String>>,
    pub no_hit: Mutex<HashSet<String>>,
    pub scores: Mutex<HashMap<String, i32>>,
    pub cost_report_fails: bool,
}

impl Default for FakeBureau {
    fn default() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            latency: Mutex::new(HashMap::new()),
            probe_status: Mutex::new(ProbeStatus::Connected),
            failing: Mutex::new(HashSet::new()),
            no_hit: Mutex::new(HashSet::new()),
            scores: Mutex::new(HashMap::new()),
            cost_report_fails: false,
        }
    }
}

impl FakeBureau {
    pub fn fail_for(&self, last_names: &[&str]) {
        let mut failing = self.failing.lock().unwrap();
        failing.clear();
        failing.extend(last_names.iter().map(|s| s.to_string()));
    }

    pub fn set_probe(&self, status: ProbeStatus) {
        *self.probe_status.lock().unwrap() = status;
    }

    pub fn delay_for(&self, last_names: &[&str], delay: Duration) {
        let mut latency = self.latency.lock().unwrap();
        latency.extend(last_names.iter().map(|s| (s.to_string(), delay)));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight count even when the caller times the call out.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BureauApi for FakeBureau {
    async fn prescreen(&self, request: &PrescreenRequest) -> Result<BureauResponse, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let name = request.record.last_name.clone();
        let delay = self.latency.lock().unwrap().get(&name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(&name) {
            return Err(AppError::ExternalApiError(
                "bureau prescreen returned status 503".to_string(),
            ));
        }
        if self.no_hit.lock().unwrap().contains(&name) {
            return Ok(BureauResponse {
                hit: false,
                credit_score: None,
                attributes: BTreeMap::new(),
            });
        }
        let score = self.scores.lock().unwrap().get(&name).copied().unwrap_or(700);
        Ok(BureauResponse {
            hit: true,
            credit_score: Some(score),
            attributes: BTreeMap::from([("inquiries_6m".to_string(), serde_json::json!(1))]),
        })
    }

    async fn cost_report(&self, _range: &DateRange) -> Result<Vec<CostReportRow>, AppError> {
        if self.cost_report_fails {
            return Err(AppError::ExternalApiError(
                "bureau billing report returned status 502".to_string(),
            ));
        }
        Ok(Vec::new())
    }

    async fn health_probe(&self) -> HealthProbe {
        self.probes.fetch_add(1, Ordering::SeqCst);
        HealthProbe {
            status: *self.probe_status.lock().unwrap(),
            detail: None,
            latency_ms: Some(1),
        }
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub bureau: Arc<FakeBureau>,
    pub vault: Arc<PiiVault>,
    pub coordinator: BatchCoordinator,
    pub program: Program,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_bureau(FakeBureau::default()).await
    }

    pub async fn with_bureau(bureau: FakeBureau) -> Self {
        Self::with_settings(bureau, CoordinatorSettings::default()).await
    }

    pub async fn with_settings(bureau: FakeBureau, settings: CoordinatorSettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let bureau = Arc::new(bureau);
        let vault = Arc::new(PiiVault::from_key_bytes(&TEST_KEY));
        let coordinator = BatchCoordinator::new(
            store.clone() as Arc<dyn PrescreenStore>,
            bureau.clone() as Arc<dyn BureauApi>,
            vault.clone(),
            settings,
        );
        let program = program();
        store.insert_program(&program).await.unwrap();
        Self {
            store,
            bureau,
            vault,
            coordinator,
            program,
        }
    }

    pub fn dyn_store(&self) -> Arc<dyn PrescreenStore> {
        self.store.clone()
    }

    pub async fn audit_for_lead(&self, lead_id: Uuid) -> Vec<AuditLogEntry> {
        self.store
            .audit_entries(&AuditFilter {
                lead_id: Some(lead_id),
                ..Default::default()
            })
            .await
            .unwrap()
    }
}

pub fn actor() -> ActorContext {
    ActorContext::new("analyst-1", Some("203.0.113.7".to_string()))
}

pub fn program() -> Program {
    let now = Utc::now();
    let setting = BureauSetting {
        enabled: true,
        score_model: ScoreModel::Fico8,
    };
    Program {
        id: Uuid::new_v4(),
        name: "Mortgage refi".to_string(),
        description: None,
        active: true,
        score_bounds: ScoreBounds {
            min_score: 580,
            max_score: 850,
        },
        bureaus: BTreeMap::from([
            (BureauCode::Eq, setting.clone()),
            (BureauCode::Tu, setting.clone()),
            (BureauCode::Ex, setting),
        ]),
        selection_criteria: BTreeMap::new(),
        output_attributes: vec!["inquiries_6m".to_string()],
        created_at: now,
        updated_at: now,
    }
}

pub fn record(last_name: &str, ssn: &str) -> PrescreenRecord {
    PrescreenRecord {
        first_name: "Ada".to_string(),
        middle_initial: None,
        last_name: last_name.to_string(),
        address: "1 Main St".to_string(),
        city: "Austin".to_string(),
        state: "TX".to_string(),
        zip: "78701".to_string(),
        ssn: Some(ssn.to_string()),
        dob: Some("1980-04-02".to_string()),
    }
}

pub fn records(last_names: &[&str]) -> Vec<PrescreenRecord> {
    last_names
        .iter()
        .enumerate()
        .map(|(i, name)| record(name, &format!("123-45-{:04}", 1000 + i)))
        .collect()
}
