//! Fixed attribute catalog used to validate program criteria at
//! configuration time and to group bureau attributes for display.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::errors::AppError;
use crate::models::{Criterion, ProgramInput};

pub const MIN_REPORTABLE_SCORE: i32 = 300;
pub const MAX_REPORTABLE_SCORE: i32 = 850;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeCategory {
    Score,
    Tradelines,
    Inquiries,
    PublicRecords,
    Mortgage,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttributeKind {
    Range { min: f64, max: f64 },
    Flag,
    Choice(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy)]
pub struct AttributeDef {
    pub name: &'static str,
    pub kind: AttributeKind,
    pub category: AttributeCategory,
}

const fn range(name: &'static str, min: f64, max: f64, category: AttributeCategory) -> AttributeDef {
    AttributeDef {
        name,
        kind: AttributeKind::Range { min, max },
        category,
    }
}

const fn flag(name: &'static str, category: AttributeCategory) -> AttributeDef {
    AttributeDef {
        name,
        kind: AttributeKind::Flag,
        category,
    }
}

pub static CATALOG: &[AttributeDef] = &[
    range("credit_score", 300.0, 850.0, AttributeCategory::Score),
    range("open_tradelines", 0.0, 200.0, AttributeCategory::Tradelines),
    range("revolving_utilization", 0.0, 100.0, AttributeCategory::Tradelines),
    range("total_revolving_balance", 0.0, 10_000_000.0, AttributeCategory::Tradelines),
    range("months_since_oldest_trade", 0.0, 1200.0, AttributeCategory::Tradelines),
    range("delinquencies_30d_24m", 0.0, 99.0, AttributeCategory::Tradelines),
    range("delinquencies_90d_24m", 0.0, 99.0, AttributeCategory::Tradelines),
    range("inquiries_6m", 0.0, 99.0, AttributeCategory::Inquiries),
    range("inquiries_12m", 0.0, 99.0, AttributeCategory::Inquiries),
    flag("bankruptcy_7y", AttributeCategory::PublicRecords),
    flag("foreclosure_7y", AttributeCategory::PublicRecords),
    range("collections_count", 0.0, 99.0, AttributeCategory::PublicRecords),
    flag("has_mortgage", AttributeCategory::Mortgage),
    range("mortgage_balance", 0.0, 50_000_000.0, AttributeCategory::Mortgage),
    range("mortgage_payment", 0.0, 1_000_000.0, AttributeCategory::Mortgage),
    range("months_since_mortgage_open", 0.0, 1200.0, AttributeCategory::Mortgage),
    AttributeDef {
        name: "mortgage_type",
        kind: AttributeKind::Choice(&["conventional", "fha", "va", "usda", "heloc"]),
        category: AttributeCategory::Mortgage,
    },
    AttributeDef {
        name: "residence_status",
        kind: AttributeKind::Choice(&["owner", "renter", "unknown"]),
        category: AttributeCategory::Mortgage,
    },
];

pub fn lookup(name: &str) -> Option<&'static AttributeDef> {
    CATALOG.iter().find(|def| def.name == name)
}

pub fn category_of(name: &str) -> AttributeCategory {
    lookup(name)
        .map(|def| def.category)
        .unwrap_or(AttributeCategory::Other)
}

/// Validates one criterion against its catalog definition.
pub fn validate_criterion(name: &str, criterion: &Criterion) -> Result<(), AppError> {
    let def = lookup(name).ok_or_else(|| {
        AppError::Validation(format!("unknown selection attribute '{}'", name))
    })?;
    match (def.kind, criterion) {
        (AttributeKind::Range { min, max }, Criterion::Range { min: lo, max: hi }) => {
            if lo.is_none() && hi.is_none() {
                return Err(AppError::Validation(format!(
                    "range criterion '{}' needs a min or a max",
                    name
                )));
            }
            for bound in [lo, hi].into_iter().flatten() {
                if !bound.is_finite() || *bound < min || *bound > max {
                    return Err(AppError::Validation(format!(
                        "criterion '{}' bound {} outside {}..={}",
                        name, bound, min, max
                    )));
                }
            }
            if let (Some(lo), Some(hi)) = (lo, hi) {
                if lo > hi {
                    return Err(AppError::Validation(format!(
                        "criterion '{}' has min greater than max",
                        name
                    )));
                }
            }
            Ok(())
        }
        (AttributeKind::Flag, Criterion::Flag { .. }) => Ok(()),
        (AttributeKind::Choice(allowed), Criterion::ChoiceSet { values }) => {
            if values.is_empty() {
                return Err(AppError::Validation(format!(
                    "choice criterion '{}' needs at least one value",
                    name
                )));
            }
            match values.iter().find(|v| !allowed.contains(&v.as_str())) {
                Some(bad) => Err(AppError::Validation(format!(
                    "criterion '{}' does not allow '{}'",
                    name, bad
                ))),
                None => Ok(()),
            }
        }
        _ => Err(AppError::Validation(format!(
            "criterion '{}' has the wrong kind for this attribute",
            name
        ))),
    }
}

/// Configuration-time validation of a program definition.
pub fn validate_program(input: &ProgramInput) -> Result<(), AppError> {
    if input.name.trim().is_empty() {
        return Err(AppError::Validation("program name is required".to_string()));
    }
    let bounds = input.score_bounds;
    if bounds.min_score < MIN_REPORTABLE_SCORE
        || bounds.max_score > MAX_REPORTABLE_SCORE
        || bounds.min_score > bounds.max_score
    {
        return Err(AppError::Validation(format!(
            "score range must satisfy {} <= min <= max <= {}",
            MIN_REPORTABLE_SCORE, MAX_REPORTABLE_SCORE
        )));
    }
    if !input.bureaus.values().any(|setting| setting.enabled) {
        return Err(AppError::Validation(
            "at least one bureau must be enabled".to_string(),
        ));
    }
    for (name, criterion) in &input.selection_criteria {
        validate_criterion(name, criterion)?;
    }
    for name in &input.output_attributes {
        if lookup(name).is_none() {
            return Err(AppError::Validation(format!(
                "unknown output attribute '{}'",
                name
            )));
        }
    }
    Ok(())
}

/// Groups an opaque bureau attribute payload by display category. Unknown
/// keys are kept under `other`.
pub fn categorize(
    attributes: &BTreeMap<String, Value>,
) -> BTreeMap<AttributeCategory, BTreeMap<String, Value>> {
    let mut grouped: BTreeMap<AttributeCategory, BTreeMap<String, Value>> = BTreeMap::new();
    for (key, value) in attributes {
        grouped
            .entry(category_of(key))
            .or_default()
            .insert(key.clone(), value.clone());
    }
    grouped
}
