use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use pfin_core::{ColumnType, Record, ReportingPeriod, TableSchema, Value};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::{debug, info};

/// PostgreSQL caps bind parameters per statement at 65535.
const MAX_BIND_PARAMS: usize = 60_000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{context}: {source}")]
    Database {
        context: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("update key column `{column}` is not carried by the update candidates for {table}")]
    MissingKeyColumn { table: String, column: String },
    #[error("update key for {table} is empty")]
    EmptyUpdateKey { table: String },
}

pub(crate) fn db_err(context: impl Into<String>) -> impl FnOnce(sqlx::Error) -> StorageError {
    let context = context.into();
    move |source| StorageError::Database { context, source }
}

/// Quotes an identifier unless it is a plain lower-case name that is not a keyword.
pub fn quote_ident(ident: &str) -> String {
    let plain = ident
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !RESERVED.contains(&ident);
    if plain {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

const RESERVED: &[&str] = &[
    "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "both", "case", "cast",
    "check", "collate", "column", "constraint", "create", "current_date", "current_time",
    "current_timestamp", "current_user", "default", "desc", "distinct", "do", "else", "end",
    "except", "false", "fetch", "for", "foreign", "from", "grant", "group", "having", "in",
    "into", "lateral", "leading", "limit", "localtime", "not", "null", "offset", "on", "only",
    "or", "order", "primary", "references", "returning", "select", "some", "symmetric", "table",
    "then", "to", "trailing", "true", "union", "unique", "user", "using", "when", "where",
    "window", "with",
];

pub(crate) fn qualified(schema: &TableSchema) -> String {
    format!("{}.{}", quote_ident(&schema.schema), quote_ident(&schema.name))
}

/// Declared columns of `schema` carried by at least one record, in declaration order.
pub(crate) fn carried_columns(schema: &TableSchema, records: &[Record]) -> Vec<(String, ColumnType)> {
    schema
        .columns
        .iter()
        .filter(|c| records.iter().any(|r| r.contains(&c.name)))
        .map(|c| (c.name.clone(), c.column_type))
        .collect()
}

pub(crate) fn rows_per_statement(column_count: usize) -> usize {
    (MAX_BIND_PARAMS / column_count.max(1)).max(1)
}

/// Multi-row `INSERT ... VALUES` with every placeholder cast to its column type.
pub(crate) fn insert_builder(
    table_sql: &str,
    columns: &[(String, ColumnType)],
    rows: &[Record],
) -> QueryBuilder<'static, Postgres> {
    let column_list = columns
        .iter()
        .map(|(name, _)| quote_ident(name))
        .collect::<Vec<_>>()
        .join(", ");
    let mut qb = QueryBuilder::new(format!("INSERT INTO {table_sql} ({column_list}) "));
    qb.push_values(rows, |mut row, record| {
        for (name, column_type) in columns {
            push_cell(&mut row, record.value(name), *column_type);
        }
    });
    qb
}

fn push_cell(
    row: &mut Separated<'_, 'static, Postgres, &'static str>,
    value: &Value,
    column_type: ColumnType,
) {
    match value.clone().coerce(column_type) {
        Value::Null => row.push_bind(Option::<String>::None),
        Value::Float(f) if column_type == ColumnType::Numeric => row.push_bind(numeric_text(f)),
        Value::Bool(b) => row.push_bind(b),
        Value::Int(i) => row.push_bind(i),
        Value::Float(f) => row.push_bind(f),
        Value::Text(s) => row.push_bind(s),
        Value::Date(d) => row.push_bind(d),
        Value::Timestamp(ts) => row.push_bind(ts),
    };
    row.push_unseparated(format!("::{}", column_type.sql_type()));
}

/// `NUMERIC` crosses the wire as decimal text in both directions. A float8
/// cast keeps only 15 significant digits on the way in, and reading through
/// float8 would round values written by other clients.
fn numeric_text(f: f64) -> Option<String> {
    f.is_finite().then(|| f.to_string())
}

fn parse_numeric(text: Option<&str>) -> Value {
    text.and_then(|t| t.trim().parse::<f64>().ok())
        .filter(|f| f.is_finite())
        .map(Value::Float)
        .unwrap_or(Value::Null)
}

/// Select expression that decodes uniformly regardless of the stored width.
fn select_expr(name: &str, column_type: ColumnType) -> String {
    let ident = quote_ident(name);
    match column_type {
        ColumnType::Int | ColumnType::BigInt => format!("{ident}::bigint AS {ident}"),
        ColumnType::Float => format!("{ident}::double precision AS {ident}"),
        ColumnType::Numeric => format!("{ident}::text AS {ident}"),
        ColumnType::Timestamp => format!("{ident}::timestamptz AS {ident}"),
        _ => ident,
    }
}

fn decode_cell(row: &PgRow, name: &str, column_type: ColumnType) -> Result<Value, sqlx::Error> {
    Ok(match column_type {
        ColumnType::Bool => row.try_get::<Option<bool>, _>(name)?.into(),
        ColumnType::Int | ColumnType::BigInt => row.try_get::<Option<i64>, _>(name)?.into(),
        ColumnType::Float => row.try_get::<Option<f64>, _>(name)?.into(),
        ColumnType::Numeric => parse_numeric(row.try_get::<Option<String>, _>(name)?.as_deref()),
        ColumnType::Text => row.try_get::<Option<String>, _>(name)?.into(),
        ColumnType::Date => row.try_get::<Option<NaiveDate>, _>(name)?.into(),
        ColumnType::Timestamp => row.try_get::<Option<DateTime<Utc>>, _>(name)?.into(),
    })
}

/// Connection pool plus the table-level operations the sync engine needs.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(db_err("connecting to database"))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Reads every stored row of the table, all declared columns.
    pub async fn read_snapshot(&self, schema: &TableSchema) -> Result<Vec<Record>, StorageError> {
        let table = schema.qualified_name();
        let select_list = schema
            .columns
            .iter()
            .map(|c| select_expr(&c.name, c.column_type))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {select_list} FROM {}", qualified(schema));
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err(format!("reading snapshot of {table}")))?;

        let mut snapshot = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = Record::new();
            for column in &schema.columns {
                let value = decode_cell(row, &column.name, column.column_type)
                    .map_err(db_err(format!("decoding {table}.{}", column.name)))?;
                record.set(column.name.clone(), value);
            }
            snapshot.push(record);
        }
        debug!(table = %table, rows = snapshot.len(), "snapshot read");
        Ok(snapshot)
    }

    /// Inserts all records in one transaction using batched multi-row statements.
    pub async fn insert_records(
        &self,
        schema: &TableSchema,
        records: &[Record],
    ) -> Result<u64, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }
        let table = schema.qualified_name();
        let columns = carried_columns(schema, records);
        let table_sql = qualified(schema);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_err(format!("opening insert transaction for {table}")))?;
        let mut inserted = 0u64;
        for chunk in records.chunks(rows_per_statement(columns.len())) {
            let mut qb = insert_builder(&table_sql, &columns, chunk);
            inserted += qb
                .build()
                .execute(&mut *tx)
                .await
                .map_err(db_err(format!("inserting into {table}")))?
                .rows_affected();
        }
        tx.commit()
            .await
            .map_err(db_err(format!("committing inserts into {table}")))?;
        info!(table = %table, inserted, "inserted rows");
        Ok(inserted)
    }

    /// `symbol -> asset id` for equities flagged for financial-statement ingestion.
    pub async fn fetch_asset_map(&self, schema_name: &str) -> Result<BTreeMap<String, i64>, StorageError> {
        let s = quote_ident(schema_name);
        let sql = format!(
            "SELECT a.symbol, a.id::bigint AS id \
             FROM {s}.asset AS a JOIN {s}.asset_cat AS c ON a.asset_cat_id = c.id \
             WHERE c.cat = 'Equity' AND a.has_financials = TRUE \
             ORDER BY a.id"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("reading asset map"))?;
        let mut map = BTreeMap::new();
        for row in rows {
            let symbol: Option<String> = row.try_get("symbol").map_err(db_err("decoding asset.symbol"))?;
            let id: i64 = row.try_get("id").map_err(db_err("decoding asset.id"))?;
            if let Some(symbol) = symbol {
                map.insert(symbol, id);
            }
        }
        Ok(map)
    }

    pub async fn fetch_asset_category_id(
        &self,
        schema_name: &str,
        cat: &str,
        sub_cat: &str,
    ) -> Result<Option<i64>, StorageError> {
        let sql = format!(
            "SELECT id::bigint AS id FROM {}.asset_cat WHERE cat = $1 AND sub_cat = $2 ORDER BY id LIMIT 1",
            quote_ident(schema_name)
        );
        sqlx::query_scalar::<_, i64>(&sql)
            .bind(cat)
            .bind(sub_cat)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("reading asset category"))
    }

    /// All reporting periods with a filing date, placeholders included.
    pub async fn fetch_reporting_periods(
        &self,
        schema_name: &str,
    ) -> Result<Vec<ReportingPeriod>, StorageError> {
        let sql = format!(
            "SELECT id::bigint AS id, asset_id::bigint AS asset_id, filing_date, \
             fiscal_year::bigint AS fiscal_year, period \
             FROM {}.reporting_period WHERE filing_date IS NOT NULL",
            quote_ident(schema_name)
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("reading reporting periods"))?;
        let mut periods = Vec::with_capacity(rows.len());
        for row in rows {
            let decode = db_err("decoding reporting_period");
            let period = (|| -> Result<ReportingPeriod, sqlx::Error> {
                Ok(ReportingPeriod {
                    id: row.try_get("id")?,
                    asset_id: row.try_get("asset_id")?,
                    filing_date: row.try_get("filing_date")?,
                    fiscal_year: row.try_get::<Option<i64>, _>("fiscal_year")?.unwrap_or_default(),
                    period_label: row.try_get::<Option<String>, _>("period")?.unwrap_or_default(),
                })
            })()
            .map_err(decode)?;
            periods.push(period);
        }
        Ok(periods)
    }
}
