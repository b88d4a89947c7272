//! Feed client contracts, the FMP and BLS clients, and list-argument fan-out.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pfin_core::{camel_to_snake, Record};
use pfin_storage::{ArtifactStore, FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pfin-adapters";

pub const FMP_BASE_URL: &str = "https://financialmodelingprep.com/stable";
pub const BLS_TIMESERIES_URL: &str = "https://api.bls.gov/publicAPI/v2/timeseries/data/";

/// Endpoint name the BLS client answers to.
pub const BLS_TIMESERIES_ENDPOINT: &str = "timeseries";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Fmp,
    Bls,
}

impl Provider {
    pub fn id(self) -> &'static str {
        match self {
            Provider::Fmp => "fmp",
            Provider::Bls => "bls",
        }
    }

    /// Turns a raw response body into cleaned, snake-cased records.
    pub fn parse_body(self, feed_id: &str, body: &[u8]) -> Result<Vec<Record>, AdapterError> {
        match self {
            Provider::Fmp => parse_fmp_rows(feed_id, body),
            Provider::Bls => parse_bls_series(feed_id, body),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl FeedContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching {feed}: {source}")]
    Fetch {
        feed: String,
        #[source]
        source: FetchError,
    },
    #[error("decoding {feed} response: {source}")]
    Decode {
        feed: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{feed} rejected the request: {message}")]
    Rejected { feed: String, message: String },
    #[error("{feed} returned an unexpected payload: {detail}")]
    Shape { feed: String, detail: String },
    #[error("no recorded response for {feed} at {}", path.display())]
    MissingFixture { feed: String, path: PathBuf },
    #[error("invalid feed request for {endpoint}: {detail}")]
    InvalidRequest { endpoint: String, detail: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One external data provider. A page is the response to a single call with
/// scalar arguments; list-valued arguments are expanded by [`fetch_batch`].
#[async_trait]
pub trait FeedClient: Send + Sync {
    fn provider(&self) -> Provider;

    async fn fetch_page(
        &self,
        ctx: &FeedContext,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<Vec<Record>, AdapterError>;
}

/// Identifier used for archive paths and logs, e.g. `fmp-historical-price-eod-full`.
pub fn feed_id(provider: Provider, endpoint: &str) -> String {
    format!("{}-{}", provider.id(), endpoint.replace('/', "-"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeedArg {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRequest {
    pub endpoint: String,
    pub args: Vec<(String, FeedArg)>,
}

impl FeedRequest {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.args.push((name.into(), FeedArg::One(value.to_string())));
        self
    }

    pub fn list_arg<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.args.push((name.into(), FeedArg::Many(values)));
        self
    }

    /// One parameter set per item of the list-valued argument, in item order.
    /// At most one argument may be list-valued.
    pub fn expand(&self) -> Result<Vec<Vec<(String, String)>>, AdapterError> {
        let mut lists = self
            .args
            .iter()
            .enumerate()
            .filter(|(_, (_, arg))| matches!(arg, FeedArg::Many(_)));
        let fan = lists.next();
        if lists.next().is_some() {
            return Err(AdapterError::InvalidRequest {
                endpoint: self.endpoint.clone(),
                detail: "more than one list-valued argument".into(),
            });
        }

        let scalar = |skip: Option<usize>| -> Vec<(String, String)> {
            self.args
                .iter()
                .enumerate()
                .filter(|(idx, _)| Some(*idx) != skip)
                .filter_map(|(_, (name, arg))| match arg {
                    FeedArg::One(value) => Some((name.clone(), value.clone())),
                    FeedArg::Many(_) => None,
                })
                .collect()
        };

        let Some((idx, (name, FeedArg::Many(items)))) = fan else {
            return Ok(vec![scalar(None)]);
        };
        Ok(items
            .iter()
            .map(|item| {
                let mut params = scalar(Some(idx));
                params.insert(0, (name.clone(), item.clone()));
                params
            })
            .collect())
    }
}

/// Issues one call per fan-out item, sequentially, and concatenates the pages
/// in item order. The first failing call fails the whole batch.
pub async fn fetch_batch(
    client: &dyn FeedClient,
    ctx: &FeedContext,
    request: &FeedRequest,
) -> Result<Vec<Record>, AdapterError> {
    let feed = feed_id(client.provider(), &request.endpoint);
    let mut batch = Vec::new();
    for params in request.expand()? {
        let page = client.fetch_page(ctx, &request.endpoint, &params).await?;
        debug!(feed = %feed, params = ?public_params(&params), rows = page.len(), "page fetched");
        batch.extend(page);
    }
    info!(feed = %feed, rows = batch.len(), "batch assembled");
    Ok(batch)
}

fn public_params(params: &[(String, String)]) -> Vec<&(String, String)> {
    params.iter().filter(|(k, _)| k != "apikey").collect()
}

fn normalize_row(value: &JsonValue) -> Record {
    Record::from_json_object(value)
        .map_keys(camel_to_snake)
        .clean_empty_strings()
}

/// FMP answers with a JSON array of flat objects, or an object carrying
/// `Error Message` when the request is refused.
pub fn parse_fmp_rows(feed_id: &str, body: &[u8]) -> Result<Vec<Record>, AdapterError> {
    let value: JsonValue = serde_json::from_slice(body).map_err(|source| AdapterError::Decode {
        feed: feed_id.to_string(),
        source,
    })?;
    match value {
        JsonValue::Array(rows) => Ok(rows.iter().map(normalize_row).collect()),
        JsonValue::Object(map) => {
            let message = map
                .get("Error Message")
                .or_else(|| map.get("error"))
                .and_then(JsonValue::as_str);
            match message {
                Some(message) => Err(AdapterError::Rejected {
                    feed: feed_id.to_string(),
                    message: message.to_string(),
                }),
                None => Err(AdapterError::Shape {
                    feed: feed_id.to_string(),
                    detail: "expected an array of rows".into(),
                }),
            }
        }
        other => Err(AdapterError::Shape {
            feed: feed_id.to_string(),
            detail: format!("expected an array of rows, got {other}"),
        }),
    }
}

/// Flattens a BLS timeseries response into one record per observation,
/// tagged with its `series_id`. Footnotes are dropped.
pub fn parse_bls_series(feed_id: &str, body: &[u8]) -> Result<Vec<Record>, AdapterError> {
    let value: JsonValue = serde_json::from_slice(body).map_err(|source| AdapterError::Decode {
        feed: feed_id.to_string(),
        source,
    })?;
    let status = value.get("status").and_then(JsonValue::as_str).unwrap_or("");
    if status != "REQUEST_SUCCEEDED" {
        let message = value
            .get("message")
            .map(JsonValue::to_string)
            .unwrap_or_else(|| status.to_string());
        return Err(AdapterError::Rejected {
            feed: feed_id.to_string(),
            message,
        });
    }
    let series = value
        .pointer("/Results/series")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| AdapterError::Shape {
            feed: feed_id.to_string(),
            detail: "missing Results.series".into(),
        })?;

    let mut rows = Vec::new();
    for entry in series {
        let series_id = entry.get("seriesID").and_then(JsonValue::as_str).unwrap_or_default();
        let data = entry.get("data").and_then(JsonValue::as_array);
        for point in data.into_iter().flatten() {
            let mut record = normalize_row(point);
            record.remove("footnotes");
            record.set("series_id", series_id);
            rows.push(record);
        }
    }
    Ok(rows)
}

/// Financial Modeling Prep "stable" API.
#[derive(Debug, Clone)]
pub struct FmpClient {
    http: Arc<HttpFetcher>,
    archive: Option<ArtifactStore>,
    api_key: String,
    base_url: String,
}

impl FmpClient {
    pub fn new(http: Arc<HttpFetcher>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            archive: None,
            api_key: api_key.into(),
            base_url: FMP_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_archive(mut self, archive: ArtifactStore) -> Self {
        self.archive = Some(archive);
        self
    }
}

#[async_trait]
impl FeedClient for FmpClient {
    fn provider(&self) -> Provider {
        Provider::Fmp
    }

    async fn fetch_page(
        &self,
        ctx: &FeedContext,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<Vec<Record>, AdapterError> {
        let feed = feed_id(Provider::Fmp, endpoint);
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), endpoint);
        let mut query = params.to_vec();
        query.push(("apikey".to_string(), self.api_key.clone()));

        let response = self
            .http
            .get(ctx.run_id, Provider::Fmp.id(), &url, &query)
            .await
            .map_err(|source| AdapterError::Fetch {
                feed: feed.clone(),
                source,
            })?;
        archive_body(self.archive.as_ref(), &feed, response.fetched_at, &response.body).await;
        parse_fmp_rows(&feed, &response.body)
    }
}

/// BLS public timeseries API (v2). Expects `seriesid`, `startyear` and
/// `endyear` parameters; `seriesid` may repeat.
#[derive(Debug, Clone)]
pub struct BlsClient {
    http: Arc<HttpFetcher>,
    archive: Option<ArtifactStore>,
    api_key: Option<String>,
    url: String,
}

impl BlsClient {
    pub fn new(http: Arc<HttpFetcher>, api_key: Option<String>) -> Self {
        Self {
            http,
            archive: None,
            api_key,
            url: BLS_TIMESERIES_URL.to_string(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_archive(mut self, archive: ArtifactStore) -> Self {
        self.archive = Some(archive);
        self
    }

    fn request_body(&self, endpoint: &str, params: &[(String, String)]) -> Result<JsonValue, AdapterError> {
        let lookup = |name: &str| {
            params
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| AdapterError::InvalidRequest {
                    endpoint: endpoint.to_string(),
                    detail: format!("missing `{name}`"),
                })
        };
        let series: Vec<&str> = params
            .iter()
            .filter(|(k, _)| k == "seriesid")
            .map(|(_, v)| v.as_str())
            .collect();
        if series.is_empty() {
            return Err(AdapterError::InvalidRequest {
                endpoint: endpoint.to_string(),
                detail: "missing `seriesid`".into(),
            });
        }
        let mut body = json!({
            "seriesid": series,
            "startyear": lookup("startyear")?,
            "endyear": lookup("endyear")?,
        });
        if let (Some(key), Some(map)) = (&self.api_key, body.as_object_mut()) {
            map.insert("registrationkey".into(), JsonValue::String(key.clone()));
        }
        Ok(body)
    }
}

#[async_trait]
impl FeedClient for BlsClient {
    fn provider(&self) -> Provider {
        Provider::Bls
    }

    async fn fetch_page(
        &self,
        ctx: &FeedContext,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<Vec<Record>, AdapterError> {
        let feed = feed_id(Provider::Bls, endpoint);
        let body = self.request_body(endpoint, params)?;
        let response = self
            .http
            .post_json(ctx.run_id, Provider::Bls.id(), &self.url, &body)
            .await
            .map_err(|source| AdapterError::Fetch {
                feed: feed.clone(),
                source,
            })?;
        archive_body(self.archive.as_ref(), &feed, response.fetched_at, &response.body).await;
        parse_bls_series(&feed, &response.body)
    }
}

async fn archive_body(
    archive: Option<&ArtifactStore>,
    feed: &str,
    fetched_at: DateTime<Utc>,
    body: &[u8],
) {
    let Some(archive) = archive else {
        return;
    };
    match archive.archive(fetched_at, feed, body).await {
        Ok(stored) => debug!(
            feed,
            path = %stored.relative_path.display(),
            deduplicated = stored.deduplicated,
            "raw response archived"
        ),
        Err(err) => warn!(feed, error = %err, "raw response not archived"),
    }
}

/// Serves recorded responses from disk instead of calling the provider.
///
/// Layout: `<root>/<provider>/<endpoint>/<label>.json`, where `/` in the
/// endpoint becomes `-` and the label is the `symbol`, `query` or `seriesid`
/// argument (`all` when none is given). An unrecorded call is an error.
#[derive(Debug, Clone)]
pub struct FixtureFeedClient {
    root: PathBuf,
    provider: Provider,
}

impl FixtureFeedClient {
    pub fn new(root: impl Into<PathBuf>, provider: Provider) -> Self {
        Self {
            root: root.into(),
            provider,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, endpoint: &str, params: &[(String, String)]) -> PathBuf {
        let label = ["symbol", "query", "seriesid"]
            .iter()
            .find_map(|name| params.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str()))
            .unwrap_or("all");
        self.root
            .join(self.provider.id())
            .join(endpoint.replace('/', "-"))
            .join(format!("{label}.json"))
    }
}

#[async_trait]
impl FeedClient for FixtureFeedClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn fetch_page(
        &self,
        _ctx: &FeedContext,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<Vec<Record>, AdapterError> {
        let feed = feed_id(self.provider, endpoint);
        let path = self.path_for(endpoint, params);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(AdapterError::MissingFixture { feed, path });
            }
            Err(err) => {
                return Err(anyhow::anyhow!("reading fixture {}: {err}", path.display()).into());
            }
        };
        debug!(path = %path.display(), bytes = body.len(), "serving recorded response");
        self.provider.parse_body(&feed, &body)
    }
}
