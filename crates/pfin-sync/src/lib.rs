//! Sync pipeline orchestration: per table, read the stored snapshot, fetch the
//! feed batch, shape it, reconcile and diff it by natural key, then insert new
//! rows and apply staged updates.

pub mod align;
pub mod prepare;
pub mod reconcile;
pub mod registry;
mod report;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use pfin_adapters::{
    fetch_batch, BlsClient, FeedClient, FeedContext, FixtureFeedClient, FmpClient, Provider,
};
use pfin_core::{ColumnDef, Record};
use pfin_storage::{ArtifactStore, HttpClientConfig, HttpFetcher, PgStore, TokenBucketConfig};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use align::{AlignConfig, AlignmentOutcome, AlignmentSummary, PeriodAligner};
pub use prepare::{prepare, PrepareContext, PrepareStats, Prepared};
pub use reconcile::{reconcile, DiffError, DiffResult, Reconciled, SnapshotDiffer};
pub use registry::{FeedKind, FeedSpec, TableConfig, TableRegistry};
pub use report::{render_daily_brief, report_daily_markdown, ParquetManifest, ParquetManifestFile};

pub const CRATE_NAME: &str = "pfin-sync";

pub const TABLE_REGISTRY_FILE: &str = "tables.yaml";

/// Category stamped on assets discovered through the watchlist search.
const NEW_ASSET_CATEGORY: (&str, &str) = ("Equity", "UNKNOWN");

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("missing required setting {0}")]
    MissingSetting(&'static str),
    #[error("invalid value {value:?} for {name}")]
    InvalidSetting { name: &'static str, value: String },
    #[error("unknown table `{0}`")]
    UnknownTable(String),
    #[error("{table}: {source}")]
    Diff {
        table: String,
        #[source]
        source: DiffError,
    },
}

#[derive(Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub fmp_api_key: String,
    pub bls_api_key: Option<String>,
    pub artifacts_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fmp_calls_per_minute: u32,
    pub db_max_connections: u32,
    pub workspace_root: PathBuf,
    /// Serve feeds from recorded JSON under this directory instead of the network.
    pub fixtures_dir: Option<PathBuf>,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("database_url", &"<redacted>")
            .field("fmp_api_key", &"<redacted>")
            .field("bls_api_key", &self.bls_api_key.as_ref().map(|_| "<redacted>"))
            .field("artifacts_dir", &self.artifacts_dir)
            .field("scheduler_enabled", &self.scheduler_enabled)
            .field("sync_cron", &self.sync_cron)
            .field("user_agent", &self.user_agent)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("fmp_calls_per_minute", &self.fmp_calls_per_minute)
            .field("db_max_connections", &self.db_max_connections)
            .field("workspace_root", &self.workspace_root)
            .field("fixtures_dir", &self.fixtures_dir)
            .finish()
    }
}

impl SyncConfig {
    /// Reads the process environment after loading an optional `.env`.
    pub fn from_env() -> Result<Self, SyncError> {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                warn!(error = %err, "ignoring unreadable .env");
            }
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, SyncError> {
        let non_empty = |name: &str| get(name).filter(|v| !v.trim().is_empty());
        let fixtures_dir = non_empty("PFIN_FIXTURES_DIR").map(PathBuf::from);
        let fmp_api_key = match (non_empty("FMP_API_KEY"), &fixtures_dir) {
            (Some(key), _) => key,
            (None, Some(_)) => String::new(),
            (None, None) => return Err(SyncError::MissingSetting("FMP_API_KEY")),
        };

        Ok(Self {
            database_url: non_empty("DATABASE_URL").ok_or(SyncError::MissingSetting("DATABASE_URL"))?,
            fmp_api_key,
            bls_api_key: non_empty("BLS_API_KEY"),
            artifacts_dir: non_empty("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./artifacts")),
            scheduler_enabled: non_empty("PFIN_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: non_empty("PFIN_SYNC_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            user_agent: non_empty("PFIN_USER_AGENT").unwrap_or_else(|| "pfin-etl/0.1".to_string()),
            http_timeout_secs: parsed(&non_empty, "PFIN_HTTP_TIMEOUT_SECS", 20)?,
            fmp_calls_per_minute: parsed(&non_empty, "PFIN_FMP_CALLS_PER_MINUTE", 280)?,
            db_max_connections: parsed(&non_empty, "PFIN_DB_MAX_CONNECTIONS", 4)?,
            workspace_root: non_empty("PFIN_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            fixtures_dir,
        })
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join(TABLE_REGISTRY_FILE)
    }
}

fn parsed<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, SyncError> {
    match get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| SyncError::InvalidSetting { name, value: raw }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Pending,
    Synced,
    Failed,
}

impl TableStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TableStatus::Pending => "pending",
            TableStatus::Synced => "synced",
            TableStatus::Failed => "failed",
        }
    }
}

/// Rows written for one table, kept for the Parquet delta export.
#[derive(Debug, Clone, Default)]
pub struct TableDelta {
    pub table: String,
    pub columns: Vec<ColumnDef>,
    pub inserted: Vec<Record>,
    pub updated: Vec<Record>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableSyncReport {
    pub table: String,
    pub status: TableStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub snapshot_rows: usize,
    pub fetched_rows: usize,
    pub prepared_rows: usize,
    pub common_columns: Vec<String>,
    pub inserted: u64,
    pub updated: u64,
    pub duplicate_keys: usize,
    pub prepare: PrepareStats,
    #[serde(skip)]
    pub delta: TableDelta,
}

impl TableSyncReport {
    pub fn new(schema: &str, name: &str) -> Self {
        Self {
            table: format!("{schema}.{name}"),
            status: TableStatus::Pending,
            error: None,
            snapshot_rows: 0,
            fetched_rows: 0,
            prepared_rows: 0,
            common_columns: Vec::new(),
            inserted: 0,
            updated: 0,
            duplicate_keys: 0,
            prepare: PrepareStats::default(),
            delta: TableDelta {
                table: name.to_string(),
                ..TableDelta::default()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub inserted: u64,
    pub updated: u64,
    pub failed_tables: usize,
    pub tables: Vec<TableSyncReport>,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

impl SyncRunSummary {
    pub fn new(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        tables: Vec<TableSyncReport>,
    ) -> Self {
        Self {
            run_id,
            started_at,
            finished_at,
            inserted: tables.iter().map(|t| t.inserted).sum(),
            updated: tables.iter().map(|t| t.updated).sum(),
            failed_tables: tables.iter().filter(|t| t.status == TableStatus::Failed).count(),
            tables,
            reports_dir: String::new(),
            parquet_manifest: String::new(),
        }
    }

    pub fn failed(&self) -> impl Iterator<Item = &TableSyncReport> {
        self.tables.iter().filter(|t| t.status == TableStatus::Failed)
    }
}

/// Per-run resources. Opened at run start and closed at run end whether or
/// not the tables succeeded.
pub struct SyncContext {
    pub feed: FeedContext,
    pub today: NaiveDate,
    pub store: PgStore,
    pub archive: ArtifactStore,
    fmp: Arc<dyn FeedClient>,
    bls: Arc<dyn FeedClient>,
}

impl SyncContext {
    pub async fn open(config: &SyncConfig) -> Result<Self> {
        let feed = FeedContext::new(Uuid::new_v4());
        let archive = ArtifactStore::new(config.artifacts_dir.clone());
        let (fmp, bls) = feed_clients(config, &archive)?;
        let store = PgStore::connect(&config.database_url, config.db_max_connections)
            .await
            .context("connecting to database")?;
        Ok(Self {
            today: feed.started_at.date_naive(),
            feed,
            store,
            archive,
            fmp,
            bls,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.feed.run_id
    }

    pub fn client(&self, provider: Provider) -> &dyn FeedClient {
        match provider {
            Provider::Fmp => self.fmp.as_ref(),
            Provider::Bls => self.bls.as_ref(),
        }
    }

    pub async fn close(self) {
        self.store.close().await;
        debug!(run_id = %self.feed.run_id, "sync context closed");
    }
}

fn feed_clients(
    config: &SyncConfig,
    archive: &ArtifactStore,
) -> Result<(Arc<dyn FeedClient>, Arc<dyn FeedClient>)> {
    if let Some(dir) = &config.fixtures_dir {
        info!(dir = %dir.display(), "serving feeds from fixtures");
        let fmp: Arc<dyn FeedClient> = Arc::new(FixtureFeedClient::new(dir.clone(), Provider::Fmp));
        let bls: Arc<dyn FeedClient> = Arc::new(FixtureFeedClient::new(dir.clone(), Provider::Bls));
        return Ok((fmp, bls));
    }

    let base = HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    };
    let fmp_http = HttpFetcher::new(HttpClientConfig {
        token_bucket: Some(TokenBucketConfig::per_minute(config.fmp_calls_per_minute)),
        ..base.clone()
    })?;
    let bls_http = HttpFetcher::new(base)?;
    let fmp: Arc<dyn FeedClient> = Arc::new(
        FmpClient::new(Arc::new(fmp_http), config.fmp_api_key.clone()).with_archive(archive.clone()),
    );
    let bls: Arc<dyn FeedClient> = Arc::new(
        BlsClient::new(Arc::new(bls_http), config.bls_api_key.clone()).with_archive(archive.clone()),
    );
    Ok((fmp, bls))
}

pub struct SyncPipeline {
    config: SyncConfig,
    aligner: PeriodAligner,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        Ok(Self {
            config,
            aligner: PeriodAligner::new(AlignConfig::default()),
        })
    }

    pub fn with_aligner(mut self, aligner: PeriodAligner) -> Self {
        self.aligner = aligner;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn load_registry(&self) -> Result<TableRegistry> {
        TableRegistry::load(&self.config.registry_path()).await
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        self.run_tables(&[]).await
    }

    /// Syncs the named tables in registry order, or every enabled table when
    /// `only` is empty. A failing table is recorded and the run moves on.
    pub async fn run_tables(&self, only: &[String]) -> Result<SyncRunSummary> {
        let registry = self.load_registry().await?;
        let selected = select_tables(&registry, only)?;

        let ctx = SyncContext::open(&self.config).await?;
        let run_id = ctx.run_id();
        let started_at = ctx.feed.started_at;
        info!(run_id = %run_id, tables = selected.len(), "sync run started");

        let mut tables = Vec::with_capacity(selected.len());
        for table in selected {
            let mut report = TableSyncReport::new(&table.schema.schema, &table.schema.name);
            let span = info_span!("table_sync", table = %report.table);
            match self.sync_table(&ctx, table, &mut report).instrument(span).await {
                Ok(()) => report.status = TableStatus::Synced,
                Err(err) => {
                    error!(table = %report.table, error = %format!("{err:#}"), "table sync failed");
                    report.status = TableStatus::Failed;
                    report.error = Some(format!("{err:#}"));
                }
            }
            tables.push(report);
        }
        ctx.close().await;

        let mut summary = SyncRunSummary::new(run_id, started_at, Utc::now(), tables);
        let reports_dir = self.config.workspace_root.join("reports").join(run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;
        let manifest_path = report::export_parquet_deltas(&reports_dir, &summary.tables).await?;
        summary.reports_dir = reports_dir.display().to_string();
        summary.parquet_manifest = manifest_path.display().to_string();
        report::write_reports(&reports_dir, &summary).await?;

        info!(
            run_id = %run_id,
            inserted = summary.inserted,
            updated = summary.updated,
            failed = summary.failed_tables,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn sync_table(&self, ctx: &SyncContext, table: &TableConfig, report: &mut TableSyncReport) -> Result<()> {
        let schema_name = table.schema.schema.as_str();
        let kind = table.feed.kind;

        let snapshot = ctx.store.read_snapshot(&table.schema).await?;
        report.snapshot_rows = snapshot.len();

        let asset_map = if kind.needs_asset_map() {
            ctx.store.fetch_asset_map(schema_name).await?
        } else {
            BTreeMap::new()
        };
        let reporting_periods = if kind.needs_reporting_periods() {
            ctx.store.fetch_reporting_periods(schema_name).await?
        } else {
            Vec::new()
        };
        let asset_category_id = if kind == FeedKind::Asset {
            let (cat, sub_cat) = NEW_ASSET_CATEGORY;
            ctx.store.fetch_asset_category_id(schema_name, cat, sub_cat).await?
        } else {
            None
        };

        let symbols: Vec<String> = asset_map.keys().cloned().collect();
        let request = table.feed.request(&symbols, ctx.today)?;
        let batch = fetch_batch(ctx.client(kind.provider()), &ctx.feed, &request).await?;
        report.fetched_rows = batch.len();

        let prepared = prepare(
            &table.feed,
            batch,
            &PrepareContext {
                asset_map: &asset_map,
                reporting_periods: &reporting_periods,
                asset_category_id,
                aligner: &self.aligner,
            },
        )?;
        report.prepared_rows = prepared.records.len();
        report.prepare = prepared.stats;

        let reconciled = reconcile(&table.schema, &snapshot, prepared.records);
        report.common_columns = reconciled.common_columns.clone();
        let diff = SnapshotDiffer::new(table.natural_key.clone(), table.schema.identity.clone())
            .diff(&snapshot, &reconciled)
            .map_err(|source| SyncError::Diff {
                table: table.qualified_name(),
                source,
            })?;
        report.duplicate_keys = diff.duplicate_keys;
        if diff.duplicate_keys > 0 {
            warn!(
                duplicates = diff.duplicate_keys,
                key = %table.natural_key,
                "batch repeats natural keys; first occurrence kept"
            );
        }
        info!(
            snapshot = snapshot.len(),
            insert = diff.to_insert.len(),
            update = diff.to_update.len(),
            "diff computed"
        );

        report.delta.columns = table.schema.columns.clone();
        report.inserted = ctx.store.insert_records(&table.schema, &diff.to_insert).await?;
        report.delta.inserted = diff.to_insert;

        match &table.update_key {
            Some(update_key) => {
                report.updated = ctx
                    .store
                    .apply_updates(&table.schema, update_key, &diff.to_update)
                    .await?;
                report.delta.updated = diff.to_update;
            }
            None if !diff.to_update.is_empty() => {
                debug!(skipped = diff.to_update.len(), "insert-only table keeps stored rows");
            }
            None => {}
        }
        Ok(())
    }

    /// Nightly job running [`SyncPipeline::run_once`], when enabled.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        failed = summary.failed_tables,
                        "scheduled sync finished"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

fn select_tables<'a>(registry: &'a TableRegistry, only: &[String]) -> Result<Vec<&'a TableConfig>, SyncError> {
    if only.is_empty() {
        return Ok(registry.enabled().collect());
    }
    if let Some(unknown) = only.iter().find(|name| registry.get(name).is_none()) {
        return Err(SyncError::UnknownTable(unknown.clone()));
    }
    Ok(registry
        .tables
        .iter()
        .filter(|t| only.iter().any(|name| *name == t.schema.name))
        .collect())
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::new(config)?;
    pipeline.run_once().await
}
