//! Submission record validation and normalisation.
//!
//! Error messages name the record by its zero-based position and the field
//! that failed. They never echo a submitted value.

use chrono::NaiveDate;
use regex::Regex;
use std::sync::OnceLock;

use crate::errors::AppError;
use crate::models::PrescreenRecord;

/// The bureau rejects prescreen calls carrying fewer records.
pub const MIN_BATCH_SIZE: usize = 2;

fn ssn_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{3}-?\d{2}-?\d{4}$").unwrap())
}

fn zip_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{5})(?:-?(\d{4}))?$").unwrap())
}

fn blank(value: &str) -> bool {
    value.trim().is_empty()
}

/// Digits of a well-formed SSN (`123-45-6789` or `123456789`).
pub fn normalize_ssn(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if !ssn_regex().is_match(trimmed) {
        return None;
    }
    Some(trimmed.chars().filter(|c| c.is_ascii_digit()).collect())
}

/// `12345` or `12345-6789`.
pub fn normalize_zip(raw: &str) -> Option<String> {
    let caps = zip_regex().captures(raw.trim())?;
    Some(match caps.get(2) {
        Some(plus4) => format!("{}-{}", &caps[1], plus4.as_str()),
        None => caps[1].to_string(),
    })
}

/// ISO `YYYY-MM-DD` from ISO or US `MM/DD/YYYY` input.
pub fn normalize_dob(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%m/%d/%Y"))
        .ok()
        .map(|d| d.format("%Y-%m-%d").to_string())
}

fn normalize_state(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (trimmed.len() == 2 && trimmed.chars().all(|c| c.is_ascii_alphabetic()))
        .then(|| trimmed.to_ascii_uppercase())
}

/// Checks one record for completeness and returns its normalised form.
pub fn normalize_record(position: usize, record: &PrescreenRecord) -> Result<PrescreenRecord, AppError> {
    let required = [
        ("first_name", &record.first_name),
        ("last_name", &record.last_name),
        ("address", &record.address),
        ("city", &record.city),
        ("state", &record.state),
        ("zip", &record.zip),
    ];
    let missing: Vec<&str> = required
        .iter()
        .filter(|(_, value)| blank(value))
        .map(|(name, _)| *name)
        .collect();
    if !missing.is_empty() {
        return Err(AppError::Validation(format!(
            "incomplete record at position {}: missing {}",
            position,
            missing.join(", ")
        )));
    }

    let invalid = |field: &str| {
        AppError::Validation(format!("invalid {} at position {}", field, position))
    };

    let state = normalize_state(&record.state).ok_or_else(|| invalid("state"))?;
    let zip = normalize_zip(&record.zip).ok_or_else(|| invalid("zip"))?;
    let ssn = match record.ssn.as_deref().filter(|s| !blank(s)) {
        Some(raw) => Some(normalize_ssn(raw).ok_or_else(|| invalid("ssn"))?),
        None => None,
    };
    let dob = match record.dob.as_deref().filter(|s| !blank(s)) {
        Some(raw) => Some(normalize_dob(raw).ok_or_else(|| invalid("dob"))?),
        None => None,
    };
    let middle_initial = record
        .middle_initial
        .as_deref()
        .map(str::trim)
        .and_then(|m| m.chars().next())
        .map(|c| c.to_ascii_uppercase().to_string());

    Ok(PrescreenRecord {
        first_name: record.first_name.trim().to_string(),
        middle_initial,
        last_name: record.last_name.trim().to_string(),
        address: record.address.trim().to_string(),
        city: record.city.trim().to_string(),
        state,
        zip,
        ssn,
        dob,
    })
}

/// Validates a whole submission before anything is persisted or sent.
pub fn validate_batch(records: &[PrescreenRecord]) -> Result<Vec<PrescreenRecord>, AppError> {
    if records.len() < MIN_BATCH_SIZE {
        return Err(AppError::Validation(format!(
            "minimum batch size is {} records, got {}",
            MIN_BATCH_SIZE,
            records.len()
        )));
    }
    records
        .iter()
        .enumerate()
        .map(|(position, record)| normalize_record(position, record))
        .collect()
}
