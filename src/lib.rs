//! Prescreen API Library
//!
//! Credit prescreen batch processing: program configuration, batch
//! submission against the bureau API, tier classification, encrypted PII
//! storage, an append-only audit trail, a retry queue and usage reporting.
//!
//! # Modules
//!
//! - `api`: Router assembly and API documentation routes.
//! - `core`: Core business logic.
//! - `data`: Data access layer.
//! - `integrations`: External service integrations.
//! - `obs`: Observability and logging.
//! - `audit`: Audit recorder over the store.
//! - `bureau_client`: Bureau API client (prescreen, health probe, cost report).
//! - `cache_validator`: Checksummed cache entries.
//! - `catalog`: Bureau attribute catalog and program validation.
//! - `circuit_breaker`: Circuit breaker for bureau calls.
//! - `config`: Configuration management.
//! - `coordinator`: Batch submission and processing.
//! - `db`: Database connection and migrations.
//! - `db_storage`: Postgres store.
//! - `errors`: Error handling types.
//! - `handlers`: HTTP request handlers.
//! - `memory_store`: In-memory store used by tests and local runs.
//! - `models`: Core data models.
//! - `records`: Submission record normalization.
//! - `retry_queue`: Retry queue management.
//! - `services`: Program and lead services.
//! - `store`: Store trait.
//! - `tiering`: Tier classification.
//! - `usage`: Usage aggregation.
//! - `vault`: PII encryption.

pub mod api;
pub mod core;
pub mod data;
pub mod integrations;
pub mod obs;

pub mod audit;
pub mod bureau_client;
pub mod cache_validator;
pub mod catalog;
pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod db_storage;
pub mod errors;
pub mod handlers;
pub mod memory_store;
pub mod models;
pub mod records;
pub mod retry_queue;
pub mod services;
pub mod store;
pub mod tiering;
pub mod usage;
pub mod vault;
