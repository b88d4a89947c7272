//! Feed-specific shaping between fetch and reconcile.

use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Result};
use chrono::{Datelike, NaiveDate, NaiveTime};
use pfin_core::{
    future_filing_date, ColumnType, EarningsEntry, Record, ReportingPeriod, Value, FUTURE_FISCAL_YEAR,
    FUTURE_PERIOD_LABEL,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::align::{AlignmentSummary, PeriodAligner};
use crate::registry::{FeedKind, FeedSpec};

/// Day of month stamped on CPI reference dates.
pub const CPI_REFERENCE_DAY: u32 = 14;

pub struct PrepareContext<'a> {
    pub asset_map: &'a BTreeMap<String, i64>,
    pub reporting_periods: &'a [ReportingPeriod],
    /// `Equity/UNKNOWN` category stamped on new assets.
    pub asset_category_id: Option<i64>,
    pub aligner: &'a PeriodAligner,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrepareStats {
    /// Rows discarded by feed filters (unparsable CPI values, empty earnings rows).
    pub dropped_rows: usize,
    /// Rows whose symbol or reporting period could not be resolved.
    pub unmatched_rows: usize,
    pub placeholders: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alignment: Option<AlignmentSummary>,
}

#[derive(Debug, Clone, Default)]
pub struct Prepared {
    pub records: Vec<Record>,
    pub stats: PrepareStats,
}

pub fn prepare(feed: &FeedSpec, batch: Vec<Record>, ctx: &PrepareContext<'_>) -> Result<Prepared> {
    let mut stats = PrepareStats::default();
    let records = match feed.kind {
        FeedKind::Cpi => prepare_cpi(batch, &feed.series_name, &mut stats),
        FeedKind::Asset => {
            let Some(category_id) = ctx.asset_category_id else {
                bail!("asset category Equity/UNKNOWN is missing");
            };
            prepare_assets(batch, category_id)
        }
        FeedKind::EquityProfile | FeedKind::EodPrice => {
            let mut records = map_symbols(batch, ctx.asset_map, &mut stats);
            for record in &mut records {
                record.rename("date", "end_date");
            }
            records
        }
        FeedKind::ReportingPeriod => prepare_reporting_periods(batch, ctx.asset_map, &mut stats),
        FeedKind::Statement => prepare_statements(batch, ctx, &mut stats),
        FeedKind::Earning => prepare_earnings(batch, ctx, &mut stats),
    };
    if stats.dropped_rows > 0 || stats.unmatched_rows > 0 {
        warn!(
            kind = ?feed.kind,
            dropped = stats.dropped_rows,
            unmatched = stats.unmatched_rows,
            "rows left out during preparation"
        );
    }
    debug!(kind = ?feed.kind, rows = records.len(), "batch prepared");
    Ok(Prepared { records, stats })
}

/// `symbol` becomes `asset_id`; rows with unknown symbols are counted and skipped.
fn map_symbols(batch: Vec<Record>, asset_map: &BTreeMap<String, i64>, stats: &mut PrepareStats) -> Vec<Record> {
    let mut out = Vec::with_capacity(batch.len());
    for mut record in batch {
        let asset_id = record.value("symbol").as_str().and_then(|s| asset_map.get(s)).copied();
        match asset_id {
            Some(asset_id) => {
                record.rename("symbol", "asset_id");
                record.set("asset_id", asset_id);
                out.push(record);
            }
            None => stats.unmatched_rows += 1,
        }
    }
    out
}

/// `M01`..`M12`; the annual average `M13` has no month.
fn cpi_month(period: &str) -> Option<u32> {
    period
        .strip_prefix('M')
        .and_then(|m| m.parse::<u32>().ok())
        .filter(|m| (1..=12).contains(m))
}

fn prepare_cpi(batch: Vec<Record>, series_name: &str, stats: &mut PrepareStats) -> Vec<Record> {
    let mut out = Vec::with_capacity(batch.len());
    for mut record in batch {
        let year = record.value("year").clone().coerce(ColumnType::Int).as_i64();
        let month = record.value("period").as_str().and_then(cpi_month);
        let ref_date = year
            .and_then(|y| i32::try_from(y).ok())
            .zip(month)
            .and_then(|(y, m)| NaiveDate::from_ymd_opt(y, m, CPI_REFERENCE_DAY));
        let value = record.value("value").clone().coerce(ColumnType::Numeric);
        let Some(ref_date) = ref_date.filter(|_| !value.is_null()) else {
            stats.dropped_rows += 1;
            continue;
        };
        for column in ["period", "period_name", "latest", "value"] {
            record.remove(column);
        }
        record.set("year", i64::from(ref_date.year()));
        record.set("month", i64::from(ref_date.month()));
        record.set("series_value", value);
        record.set("ref_date", ref_date);
        record.set("series_name", series_name);
        out.push(record);
    }
    out
}

fn prepare_assets(batch: Vec<Record>, category_id: i64) -> Vec<Record> {
    batch
        .into_iter()
        .map(|mut record| {
            record.rename("name", "description");
            record.set("asset_cat_id", category_id);
            record.set("has_financials", true);
            record.set("has_chart", true);
            record
        })
        .collect()
}

/// One placeholder period per asset, carrying forward earnings estimates.
pub fn placeholder_period(asset_id: i64) -> Record {
    let filing = future_filing_date();
    Record::from_pairs([
        ("asset_id", Value::Int(asset_id)),
        ("fiscal_year", Value::Int(FUTURE_FISCAL_YEAR)),
        ("period", Value::from(FUTURE_PERIOD_LABEL)),
        ("filing_date", Value::Date(filing)),
        ("accepted_date", Value::Timestamp(filing.and_time(NaiveTime::MIN).and_utc())),
    ])
}

fn prepare_reporting_periods(
    batch: Vec<Record>,
    asset_map: &BTreeMap<String, i64>,
    stats: &mut PrepareStats,
) -> Vec<Record> {
    let mut records = map_symbols(batch, asset_map, stats);
    for record in &mut records {
        record.rename("date", "end_date");
    }
    // asset map iterates by symbol; placeholders follow the same order
    for asset_id in asset_map.values() {
        records.push(placeholder_period(*asset_id));
        stats.placeholders += 1;
    }
    records
}

fn filing_date_of(record: &Record) -> Option<NaiveDate> {
    record.value("filing_date").clone().coerce(ColumnType::Date).as_date()
}

fn prepare_statements(batch: Vec<Record>, ctx: &PrepareContext<'_>, stats: &mut PrepareStats) -> Vec<Record> {
    let mut period_ids: HashMap<(i64, NaiveDate), i64> = HashMap::with_capacity(ctx.reporting_periods.len());
    for period in ctx.reporting_periods {
        period_ids.entry((period.asset_id, period.filing_date)).or_insert(period.id);
    }

    let mut out = Vec::new();
    for mut record in map_symbols(batch, ctx.asset_map, stats) {
        let asset_id = record.value("asset_id").as_i64();
        let period_id = asset_id
            .zip(filing_date_of(&record))
            .and_then(|key| period_ids.get(&key).copied());
        let Some(period_id) = period_id else {
            stats.unmatched_rows += 1;
            continue;
        };
        record.rename("date", "end_date");
        record.remove("asset_id");
        record.remove("filing_date");
        record.set("reporting_period_id", period_id);
        out.push(record);
    }
    out
}

fn prepare_earnings(batch: Vec<Record>, ctx: &PrepareContext<'_>, stats: &mut PrepareStats) -> Vec<Record> {
    let reported: Vec<Record> = batch
        .into_iter()
        .filter(|r| {
            let keep = !(r.value("revenue_actual").is_null() && r.value("revenue_estimated").is_null());
            if !keep {
                stats.dropped_rows += 1;
            }
            keep
        })
        .collect();

    let mut entries = Vec::with_capacity(reported.len());
    for mut record in map_symbols(reported, ctx.asset_map, stats) {
        record.rename("date", "filing_date");
        let Some(filing_date) = filing_date_of(&record) else {
            stats.unmatched_rows += 1;
            continue;
        };
        record.set("filing_date", filing_date);
        record.set("ref_date", filing_date);
        match EarningsEntry::from_record(record) {
            Some(entry) => entries.push(entry),
            None => stats.unmatched_rows += 1,
        }
    }

    let outcome = ctx.aligner.align(entries, ctx.reporting_periods);
    stats.alignment = Some(outcome.summary);
    outcome
        .entries
        .into_iter()
        .map(|entry| {
            let mut record = entry.into_record();
            record.remove("asset_id");
            record.remove("filing_date");
            record
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TableRegistry;
    use pfin_adapters::{parse_bls_series, parse_fmp_rows};

    const FEEDS: &str = r#"
tables:
  - schema: pfin
    name: cpi
    identity: [id]
    natural_key: [year, month]
    columns: [{ name: id, type: big_int }, { name: year, type: int }, { name: month, type: int }]
    feed: { kind: cpi, series: [CUUR0000SA0] }
  - schema: pfin
    name: asset
    identity: [id]
    natural_key: [symbol]
    columns: [{ name: id, type: big_int }, { name: symbol, type: text }]
    feed: { kind: asset, watchlist: [AAPL] }
  - schema: pfin
    name: reporting_period
    identity: [id]
    natural_key: [asset_id]
    columns: [{ name: id, type: big_int }, { name: asset_id, type: big_int }]
    feed: { kind: reporting_period }
  - schema: pfin
    name: income_statement
    identity: [reporting_period_id]
    natural_key: [reporting_period_id]
    columns: [{ name: reporting_period_id, type: big_int }]
    feed: { kind: statement, endpoint: income-statement }
  - schema: pfin
    name: earning
    identity: [reporting_period_id]
    natural_key: [reporting_period_id]
    columns: [{ name: reporting_period_id, type: big_int }]
    feed: { kind: earning }
"#;

    fn feed(name: &str) -> FeedSpec {
        TableRegistry::from_yaml(FEEDS).unwrap().get(name).unwrap().feed.clone()
    }

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn assets() -> BTreeMap<String, i64> {
        BTreeMap::from([("AAPL".to_string(), 7), ("NVDA".to_string(), 9)])
    }

    fn aapl_periods() -> Vec<ReportingPeriod> {
        let mut periods: Vec<_> = [(101, "2024-08-02"), (102, "2024-05-03"), (103, "2024-02-02"), (104, "2023-11-03")]
            .into_iter()
            .map(|(id, filed)| ReportingPeriod {
                id,
                asset_id: 7,
                filing_date: d(filed),
                fiscal_year: 2024,
                period_label: "Q".into(),
            })
            .collect();
        periods.push(ReportingPeriod {
            id: 199,
            asset_id: 7,
            filing_date: future_filing_date(),
            fiscal_year: FUTURE_FISCAL_YEAR,
            period_label: FUTURE_PERIOD_LABEL.into(),
        });
        periods
    }

    fn run(name: &str, batch: Vec<Record>, periods: &[ReportingPeriod]) -> Prepared {
        let asset_map = assets();
        let aligner = PeriodAligner::default();
        let ctx = PrepareContext {
            asset_map: &asset_map,
            reporting_periods: periods,
            asset_category_id: Some(3),
            aligner: &aligner,
        };
        prepare(&feed(name), batch, &ctx).unwrap()
    }

    fn fmp(body: &[u8]) -> Vec<Record> {
        parse_fmp_rows("fmp-test", body).unwrap()
    }

    #[test]
    fn cpi_rows_get_month_value_and_reference_date() {
        let batch = parse_bls_series(
            "bls-timeseries",
            include_bytes!("../../../fixtures/bls/timeseries/CUUR0000SA0.json"),
        )
        .unwrap();
        let prepared = run("cpi", batch, &[]);
        assert_eq!(prepared.records.len(), 3);
        assert_eq!(prepared.stats.dropped_rows, 2);
        let march = &prepared.records[0];
        assert_eq!(march.value("year"), &Value::Int(2024));
        assert_eq!(march.value("month"), &Value::Int(3));
        assert_eq!(march.value("series_value"), &Value::Float(312.332));
        assert_eq!(march.value("ref_date"), &Value::Date(d("2024-03-14")));
        assert_eq!(march.value("series_name"), &Value::from("cpi-u"));
        assert!(!march.contains("period"));
    }

    #[test]
    fn assets_carry_category_and_flags() {
        let batch = fmp(include_bytes!("../../../fixtures/fmp/search-symbol/AAPL.json"));
        let prepared = run("asset", batch, &[]);
        let asset = &prepared.records[0];
        assert_eq!(asset.value("description"), &Value::from("Apple Inc."));
        assert_eq!(asset.value("asset_cat_id"), &Value::Int(3));
        assert_eq!(asset.value("has_financials"), &Value::Bool(true));
        assert!(!asset.contains("name"));
    }

    #[test]
    fn missing_asset_category_fails_the_table() {
        let asset_map = assets();
        let aligner = PeriodAligner::default();
        let ctx = PrepareContext {
            asset_map: &asset_map,
            reporting_periods: &[],
            asset_category_id: None,
            aligner: &aligner,
        };
        assert!(prepare(&feed("asset"), Vec::new(), &ctx).is_err());
    }

    #[test]
    fn reporting_periods_gain_one_placeholder_per_asset() {
        let mut batch = fmp(include_bytes!("../../../fixtures/fmp/income-statement/AAPL.json"));
        batch.push(Record::from_pairs([("symbol", Value::from("ZZZZ")), ("date", Value::from("2024-06-29"))]));
        let prepared = run("reporting_period", batch, &[]);
        assert_eq!(prepared.stats.unmatched_rows, 1);
        assert_eq!(prepared.stats.placeholders, 2);
        assert_eq!(prepared.records.len(), 6);
        assert_eq!(prepared.records[0].value("asset_id"), &Value::Int(7));
        assert_eq!(prepared.records[0].value("end_date"), &Value::from("2024-06-29"));
        let placeholder = &prepared.records[5];
        assert_eq!(placeholder.value("asset_id"), &Value::Int(9));
        assert_eq!(placeholder.value("fiscal_year"), &Value::Int(FUTURE_FISCAL_YEAR));
        assert_eq!(placeholder.value("filing_date"), &Value::Date(future_filing_date()));
    }

    #[test]
    fn statements_join_to_periods_by_filing_date() {
        let mut batch = fmp(include_bytes!("../../../fixtures/fmp/income-statement/AAPL.json"));
        let mut orphan = batch[0].clone();
        orphan.set("filing_date", "2024-08-09");
        batch.push(orphan);
        let prepared = run("income_statement", batch, &aapl_periods());
        assert_eq!(prepared.stats.unmatched_rows, 1);
        let ids: Vec<_> = prepared.records.iter().map(|r| r.value("reporting_period_id").clone()).collect();
        assert_eq!(ids, [101, 102, 103, 104].map(Value::Int).to_vec());
        assert!(!prepared.records[0].contains("asset_id"));
        assert!(!prepared.records[0].contains("filing_date"));
    }

    #[test]
    fn earnings_are_filtered_and_aligned() {
        let batch = fmp(include_bytes!("../../../fixtures/fmp/earnings/AAPL.json"));
        let prepared = run("earning", batch, &aapl_periods());
        assert_eq!(prepared.stats.dropped_rows, 1);
        let alignment = prepared.stats.alignment.unwrap();
        assert_eq!(alignment.paired, 3);
        assert_eq!(alignment.forward_estimates, 2);

        let assigned: Vec<_> = prepared
            .records
            .iter()
            .map(|r| (r.value("ref_date").clone(), r.value("reporting_period_id").clone()))
            .collect();
        assert_eq!(
            assigned,
            vec![
                (Value::Date(d("2024-05-02")), Value::Int(102)),
                (Value::Date(d("2024-02-01")), Value::Int(103)),
                (Value::Date(d("2023-11-02")), Value::Int(104)),
                (Value::Date(d("2024-10-31")), Value::Int(199)),
                (Value::Date(d("2024-08-01")), Value::Int(199)),
            ]
        );
        assert!(prepared.records.iter().all(|r| !r.contains("asset_id")));
    }
}
