//! Usage and billing summaries.
//!
//! Local counts come only from persisted lead and bureau-result history. The
//! bureau's cost report is optional: when it cannot be fetched the summary
//! still returns with `external_report_unavailable` set.

use chrono::{Datelike, NaiveDate};
use moka::future::Cache;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::bureau_client::{BureauApi, CostReportRow};
use crate::cache_validator::ValidatedCacheEntry;
use crate::errors::AppError;
use crate::models::{BureauCode, DateRange, LeadUsageRow, MatchStatus, PullUsageRow};
use crate::store::PrescreenStore;

const COST_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonthlyUsage {
    /// `YYYY-MM`
    pub month: String,
    pub records: u64,
    pub qualified: u64,
    pub failed: u64,
    pub pulls: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub range: DateRange,
    pub pulls_by_bureau: BTreeMap<BureauCode, u64>,
    pub total_records: u64,
    pub qualified_count: u64,
    pub failed_count: u64,
    pub monthly_trend: Vec<MonthlyUsage>,
    pub external_costs: Option<Vec<CostReportRow>>,
    pub external_report_unavailable: bool,
}

#[derive(Clone)]
pub struct UsageAggregator {
    store: Arc<dyn PrescreenStore>,
    bureau: Arc<dyn BureauApi>,
    cost_cache: Cache<String, String>,
}

impl UsageAggregator {
    pub fn new(store: Arc<dyn PrescreenStore>, bureau: Arc<dyn BureauApi>) -> Self {
        let cost_cache = Cache::builder()
            .time_to_live(COST_CACHE_TTL)
            .max_capacity(1_000)
            .build();
        Self {
            store,
            bureau,
            cost_cache,
        }
    }

    pub async fn summarize(
        &self,
        range: DateRange,
        include_costs: bool,
    ) -> Result<UsageSummary, AppError> {
        let (from, to) = range.bounds()?;
        let leads = self.store.usage_leads(from, to).await?;
        let pulls = self.store.usage_pulls(from, to).await?;
        let mut summary = aggregate(range, &leads, &pulls);

        if include_costs {
            match self.fetch_external_cost_report(&range).await {
                Ok(rows) => summary.external_costs = Some(rows),
                Err(e) => {
                    tracing::warn!(
                        from = %range.from,
                        to = %range.to,
                        "External cost report unavailable: {}",
                        e
                    );
                    summary.external_report_unavailable = true;
                }
            }
        }
        Ok(summary)
    }

    /// Bureau billing rows for the range, served from a 15 minute cache.
    pub async fn fetch_external_cost_report(
        &self,
        range: &DateRange,
    ) -> Result<Vec<CostReportRow>, AppError> {
        let key = format!("costs:{}:{}", range.from, range.to);
        if let Some(cached) = self.cost_cache.get(&key).await {
            if let Some(rows) = ValidatedCacheEntry::open::<Vec<CostReportRow>>(&cached) {
                tracing::debug!("Cost report cache hit for {}", key);
                return Ok(rows);
            }
            self.cost_cache.invalidate(&key).await;
        }

        let rows = self.bureau.cost_report(range).await?;
        if let Some(sealed) = ValidatedCacheEntry::seal(&rows) {
            self.cost_cache.insert(key, sealed).await;
        }
        Ok(rows)
    }
}

fn month_key(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

/// Every `YYYY-MM` touched by the range, in order.
fn months_in(range: &DateRange) -> Vec<String> {
    let mut months = Vec::new();
    let (mut year, mut month) = (range.from.year(), range.from.month());
    let (end_year, end_month) = (range.to.year(), range.to.month());
    while (year, month) <= (end_year, end_month) {
        months.push(format!("{:04}-{:02}", year, month));
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    months
}

/// Pure aggregation over already-filtered history rows.
pub fn aggregate(range: DateRange, leads: &[LeadUsageRow], pulls: &[PullUsageRow]) -> UsageSummary {
    let mut trend: BTreeMap<String, MonthlyUsage> = months_in(&range)
        .into_iter()
        .map(|month| {
            (
                month.clone(),
                MonthlyUsage {
                    month,
                    ..Default::default()
                },
            )
        })
        .collect();

    let mut qualified_count = 0;
    let mut failed_count = 0;
    for lead in leads {
        let bucket = trend
            .entry(month_key(lead.created_at.date_naive()))
            .or_insert_with_key(|month| MonthlyUsage {
                month: month.clone(),
                ..Default::default()
            });
        bucket.records += 1;
        match lead.match_status {
            MatchStatus::Matched => {
                bucket.qualified += 1;
                qualified_count += 1;
            }
            MatchStatus::NoMatch | MatchStatus::ApiError => {
                bucket.failed += 1;
                failed_count += 1;
            }
            MatchStatus::Pending => {}
        }
    }

    let mut pulls_by_bureau: BTreeMap<BureauCode, u64> =
        BureauCode::ALL.into_iter().map(|code| (code, 0)).collect();
    for pull in pulls {
        *pulls_by_bureau.entry(pull.bureau).or_default() += 1;
        if let Some(bucket) = trend.get_mut(&month_key(pull.created_at.date_naive())) {
            bucket.pulls += 1;
        }
    }

    UsageSummary {
        range,
        pulls_by_bureau,
        total_records: leads.len() as u64,
        qualified_count,
        failed_count,
        monthly_trend: trend.into_values().collect(),
        external_costs: None,
        external_report_unavailable: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn months_span_year_boundary() {
        let range = DateRange::new(day(2025, 11, 20), day(2026, 2, 1)).unwrap();
        assert_eq!(
            months_in(&range),
            vec!["2025-11", "2025-12", "2026-01", "2026-02"]
        );
    }

    #[test]
    fn aggregate_counts_by_status_and_month() {
        let range = DateRange::new(day(2026, 1, 1), day(2026, 2, 28)).unwrap();
        let jan = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
        let feb = Utc.with_ymd_and_hms(2026, 2, 3, 8, 30, 0).unwrap();
        let leads = vec![
            LeadUsageRow {
                created_at: jan,
                match_status: MatchStatus::Matched,
            },
            LeadUsageRow {
                created_at: jan,
                match_status: MatchStatus::ApiError,
            },
            LeadUsageRow {
                created_at: feb,
                match_status: MatchStatus::NoMatch,
            },
            LeadUsageRow {
                created_at: feb,
                match_status: MatchStatus::Pending,
            },
        ];
        let pulls = vec![
            PullUsageRow {
                created_at: jan,
                bureau: BureauCode::Eq,
            },
            PullUsageRow {
                created_at: feb,
                bureau: BureauCode::Eq,
            },
            PullUsageRow {
                created_at: feb,
                bureau: BureauCode::Ex,
            },
        ];

        let summary = aggregate(range, &leads, &pulls);
        assert_eq!(summary.total_records, 4);
        assert_eq!(summary.qualified_count, 1);
        assert_eq!(summary.failed_count, 2);
        assert_eq!(summary.pulls_by_bureau[&BureauCode::Eq], 2);
        assert_eq!(summary.pulls_by_bureau[&BureauCode::Tu], 0);
        assert_eq!(summary.monthly_trend.len(), 2);
        assert_eq!(summary.monthly_trend[0].month, "2026-01");
        assert_eq!(summary.monthly_trend[0].qualified, 1);
        assert_eq!(summary.monthly_trend[1].records, 2);
        assert_eq!(summary.monthly_trend[1].pulls, 2);
    }
}
