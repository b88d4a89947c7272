use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Duration, NaiveDate};
use pfin_adapters::{FeedRequest, Provider, BLS_TIMESERIES_ENDPOINT};
use pfin_core::{NaturalKey, TableSchema};
use serde::Deserialize;
use tokio::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct TableRegistry {
    pub tables: Vec<TableConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    #[serde(flatten)]
    pub schema: TableSchema,
    pub natural_key: NaturalKey,
    /// Columns matching stored rows for updates; absent means insert only.
    #[serde(default)]
    pub update_key: Option<NaturalKey>,
    pub feed: FeedSpec,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Cpi,
    Asset,
    EquityProfile,
    ReportingPeriod,
    Statement,
    Earning,
    EodPrice,
}

impl FeedKind {
    pub fn provider(self) -> Provider {
        match self {
            FeedKind::Cpi => Provider::Bls,
            _ => Provider::Fmp,
        }
    }

    fn default_endpoint(self) -> Option<&'static str> {
        match self {
            FeedKind::Cpi => Some(BLS_TIMESERIES_ENDPOINT),
            FeedKind::Asset => Some("search-symbol"),
            FeedKind::EquityProfile => Some("profile"),
            FeedKind::ReportingPeriod => Some("income-statement"),
            FeedKind::Statement => None,
            FeedKind::Earning => Some("earnings"),
            FeedKind::EodPrice => Some("historical-price-eod/full"),
        }
    }

    /// Kinds that fan out over the stored asset symbols.
    pub fn needs_asset_map(self) -> bool {
        !matches!(self, FeedKind::Cpi | FeedKind::Asset)
    }

    pub fn needs_reporting_periods(self) -> bool {
        matches!(self, FeedKind::Statement | FeedKind::Earning)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedSpec {
    pub kind: FeedKind,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Symbols searched by the `asset` feed.
    #[serde(default)]
    pub watchlist: Vec<String>,
    /// BLS series ids for the `cpi` feed.
    #[serde(default)]
    pub series: Vec<String>,
    #[serde(default = "default_series_name")]
    pub series_name: String,
    #[serde(default = "default_start_year")]
    pub start_year: i32,
    /// Quarterly periods requested from statement feeds.
    #[serde(default = "default_periods")]
    pub periods: u32,
    #[serde(default = "default_history_days")]
    pub history_days: i64,
}

fn default_enabled() -> bool {
    true
}

fn default_series_name() -> String {
    "cpi-u".to_string()
}

fn default_start_year() -> i32 {
    2017
}

fn default_periods() -> u32 {
    20
}

fn default_history_days() -> i64 {
    5 * 365
}

impl FeedSpec {
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref().or(self.kind.default_endpoint())
    }

    /// Builds the fan-out request for one run. `symbols` are the stored asset
    /// symbols, used by every FMP kind except `asset`.
    pub fn request(&self, symbols: &[String], today: NaiveDate) -> Result<FeedRequest> {
        let endpoint = self
            .endpoint()
            .with_context(|| format!("{:?} feed needs an explicit endpoint", self.kind))?;
        let request = FeedRequest::new(endpoint);
        Ok(match self.kind {
            FeedKind::Cpi => request
                .list_arg("seriesid", self.series.iter().cloned())
                .arg("startyear", self.start_year)
                .arg("endyear", today.year()),
            FeedKind::Asset => request
                .list_arg("query", self.watchlist.iter().cloned())
                .arg("limit", 1),
            FeedKind::EquityProfile => request.list_arg("symbol", symbols.iter().cloned()),
            FeedKind::ReportingPeriod | FeedKind::Statement => request
                .list_arg("symbol", symbols.iter().cloned())
                .arg("period", "quarter")
                .arg("limit", self.periods),
            // two extra rows cover the upcoming announcement and the one for the unfiled quarter
            FeedKind::Earning => request
                .list_arg("symbol", symbols.iter().cloned())
                .arg("limit", self.periods + 2),
            FeedKind::EodPrice => request
                .list_arg("symbol", symbols.iter().cloned())
                .arg("from", (today - Duration::days(self.history_days)).format("%Y-%m-%d")),
        })
    }
}

impl TableConfig {
    pub fn qualified_name(&self) -> String {
        self.schema.qualified_name()
    }

    pub fn is_insert_only(&self) -> bool {
        self.update_key.is_none()
    }
}

impl TableRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<()> {
        for table in &self.tables {
            let name = table.qualified_name();
            if table.natural_key.is_empty() {
                bail!("{name}: natural_key is empty");
            }
            let keys = table
                .natural_key
                .columns()
                .iter()
                .chain(table.update_key.iter().flat_map(|k| k.columns()))
                .chain(table.schema.identity.iter());
            for column in keys {
                if !table.schema.has_column(column) {
                    bail!("{name}: key column `{column}` is not declared");
                }
            }
            if table.feed.endpoint().is_none() {
                bail!("{name}: {:?} feed needs an explicit endpoint", table.feed.kind);
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &TableConfig> {
        self.tables.iter().filter(|t| t.enabled)
    }

    pub fn get(&self, name: &str) -> Option<&TableConfig> {
        self.tables.iter().find(|t| t.schema.name == name)
    }
}
