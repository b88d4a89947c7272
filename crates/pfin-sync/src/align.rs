//! Assigns earnings announcements to reporting periods.
//!
//! Per asset, the filed periods form a ladder ordered newest first. The
//! newest period is left alone because the announcement for it usually lands
//! before the filing; the second entry, plus a tolerance window, bounds which
//! announcements are historical. Historical announcements pair positionally
//! with the windowed ladder, newest with newest. Anything later than the
//! bound is a forward estimate and is pinned to the asset's placeholder
//! period.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use pfin_core::{future_filing_date, EarningsEntry, ReportingPeriod};
use serde::Serialize;
use tracing::warn;

pub const DEFAULT_WINDOW_DAYS: i64 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignConfig {
    /// Tolerance added to the second-newest filing date.
    pub window_days: i64,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            window_days: DEFAULT_WINDOW_DAYS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlignmentSummary {
    pub paired: usize,
    pub forward_estimates: usize,
    /// Historical announcements with no period left to pair with.
    pub dropped: usize,
    /// Announcements of assets without a usable ladder or placeholder.
    pub unresolved: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentOutcome {
    pub entries: Vec<EarningsEntry>,
    pub summary: AlignmentSummary,
}

#[derive(Debug, Clone, Default)]
pub struct PeriodAligner {
    config: AlignConfig,
}

impl PeriodAligner {
    pub fn new(config: AlignConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> AlignConfig {
        self.config
    }

    pub fn align(&self, entries: Vec<EarningsEntry>, periods: &[ReportingPeriod]) -> AlignmentOutcome {
        let sentinel = future_filing_date();
        let mut periods_by_asset: BTreeMap<i64, Vec<&ReportingPeriod>> = BTreeMap::new();
        for period in periods {
            periods_by_asset.entry(period.asset_id).or_default().push(period);
        }
        let mut entries_by_asset: BTreeMap<i64, Vec<EarningsEntry>> = BTreeMap::new();
        for entry in entries {
            entries_by_asset.entry(entry.asset_id).or_default().push(entry);
        }

        let mut outcome = AlignmentOutcome {
            entries: Vec::new(),
            summary: AlignmentSummary::default(),
        };

        for (asset_id, mut asset_entries) in entries_by_asset {
            let asset_periods = periods_by_asset.remove(&asset_id).unwrap_or_default();
            let placeholder = asset_periods.iter().find(|p| p.filing_date == sentinel).copied();
            let mut ladder: Vec<&ReportingPeriod> = asset_periods
                .into_iter()
                .filter(|p| p.filing_date != sentinel)
                .collect();
            ladder.sort_by(|a, b| b.filing_date.cmp(&a.filing_date).then(b.id.cmp(&a.id)));

            let filed: Vec<NaiveDate> = ladder.iter().map(|p| p.filing_date).collect();
            let Some(bound) = historical_bound(&filed, self.config.window_days) else {
                warn!(
                    asset_id,
                    ladder = ladder.len(),
                    entries = asset_entries.len(),
                    "too few filed periods to align earnings"
                );
                outcome.summary.unresolved += asset_entries.len();
                continue;
            };

            asset_entries.sort_by(|a, b| b.filing_date.cmp(&a.filing_date));
            let (forward, historical): (Vec<_>, Vec<_>) =
                asset_entries.into_iter().partition(|e| e.filing_date > bound);

            let windowed: Vec<&ReportingPeriod> =
                ladder.into_iter().filter(|p| p.filing_date <= bound).collect();
            let paired = historical.len().min(windowed.len());
            outcome.summary.dropped += historical.len() - paired;
            outcome.summary.paired += paired;
            for (mut entry, period) in historical.into_iter().zip(windowed) {
                entry.reporting_period_id = Some(period.id);
                outcome.entries.push(entry);
            }

            match placeholder {
                Some(placeholder) => {
                    // latest first: the differ keeps the first record per placeholder key
                    outcome.summary.forward_estimates += forward.len();
                    for mut entry in forward {
                        entry.filing_date = sentinel;
                        entry.reporting_period_id = Some(placeholder.id);
                        outcome.entries.push(entry);
                    }
                }
                None if !forward.is_empty() => {
                    warn!(asset_id, count = forward.len(), "no placeholder period for forward estimates");
                    outcome.summary.unresolved += forward.len();
                }
                None => {}
            }
        }
        outcome
    }
}

/// Latest filing date that still counts as historical for a ladder, if any.
pub fn historical_bound(ladder_desc: &[NaiveDate], window_days: i64) -> Option<NaiveDate> {
    ladder_desc.get(1).map(|d| *d + Duration::days(window_days))
}
