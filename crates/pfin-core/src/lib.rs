//! Core domain model for the pfin ETL: typed records, table schemas, and the
//! reporting-period / earnings types the sync engine aligns.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "pfin-core";

/// Fiscal year reserved for the per-asset forward-estimate period.
pub const FUTURE_FISCAL_YEAR: i64 = 4000;
/// Period label reserved for the per-asset forward-estimate period.
pub const FUTURE_PERIOD_LABEL: &str = "NA";

/// Sentinel filing date carried by every future placeholder period.
pub fn future_filing_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(4000, 12, 31).unwrap_or(NaiveDate::MAX)
}

/// Declared column type of a target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Bool,
    Int,
    BigInt,
    Float,
    Numeric,
    Text,
    Date,
    Timestamp,
}

impl ColumnType {
    /// PostgreSQL type name used when casting bound parameters.
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Bool => "boolean",
            ColumnType::Int => "integer",
            ColumnType::BigInt => "bigint",
            ColumnType::Float => "double precision",
            ColumnType::Numeric => "numeric",
            ColumnType::Text => "text",
            ColumnType::Date => "date",
            ColumnType::Timestamp => "timestamptz",
        }
    }
}

/// A typed scalar cell.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

static NULL_VALUE: Value = Value::Null;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Normalizes empty (or whitespace-only) text to `Null`.
    pub fn cleaned(self) -> Self {
        match self {
            Value::Text(text) if text.trim().is_empty() => Value::Null,
            other => other,
        }
    }

    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            JsonValue::String(s) => Value::Text(s.clone()),
            nested => Value::Text(nested.to_string()),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Text(s) => JsonValue::String(s.clone()),
            Value::Date(d) => JsonValue::String(d.format("%Y-%m-%d").to_string()),
            Value::Timestamp(ts) => JsonValue::String(ts.to_rfc3339()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            Value::Timestamp(ts) => Some(ts.date_naive()),
            _ => None,
        }
    }

    /// Converts a feed value to the declared column type.
    ///
    /// Non-strict: anything that cannot be represented becomes `Null`.
    pub fn coerce(self, column_type: ColumnType) -> Value {
        let value = self.cleaned();
        if value.is_null() {
            return Value::Null;
        }
        match column_type {
            ColumnType::Bool => match value {
                Value::Bool(b) => Value::Bool(b),
                Value::Int(i) => Value::Bool(i != 0),
                Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "t" | "1" | "yes" => Value::Bool(true),
                    "false" | "f" | "0" | "no" => Value::Bool(false),
                    _ => Value::Null,
                },
                _ => Value::Null,
            },
            ColumnType::Int | ColumnType::BigInt => match value {
                Value::Int(i) => Value::Int(i),
                Value::Bool(b) => Value::Int(i64::from(b)),
                Value::Float(f) => integral_float(f),
                Value::Text(s) => {
                    let s = s.trim();
                    match s.parse::<i64>() {
                        Ok(i) => Value::Int(i),
                        Err(_) => s.parse::<f64>().map(integral_float).unwrap_or(Value::Null),
                    }
                }
                _ => Value::Null,
            },
            ColumnType::Float | ColumnType::Numeric => match value {
                Value::Int(i) => Value::Float(i as f64),
                Value::Float(f) => Value::Float(f),
                Value::Text(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(Value::Float)
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            },
            ColumnType::Text => match value {
                Value::Text(s) => Value::Text(s),
                other => Value::Text(other.to_string()),
            },
            ColumnType::Date => match value {
                Value::Date(d) => Value::Date(d),
                Value::Timestamp(ts) => Value::Date(ts.date_naive()),
                Value::Text(s) => parse_date(&s).map(Value::Date).unwrap_or(Value::Null),
                _ => Value::Null,
            },
            ColumnType::Timestamp => match value {
                Value::Timestamp(ts) => Value::Timestamp(ts),
                Value::Date(d) => Value::Timestamp(d.and_time(NaiveTime::MIN).and_utc()),
                Value::Text(s) => parse_timestamp(&s)
                    .map(Value::Timestamp)
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            },
        }
    }

    /// Hashable form of the value for natural-key comparisons.
    pub fn key_part(&self) -> KeyPart {
        match self {
            Value::Null => KeyPart::Null,
            Value::Bool(b) => KeyPart::Bool(*b),
            Value::Int(i) => KeyPart::Int(*i),
            // -0.0 and 0.0 compare equal as keys
            Value::Float(f) => KeyPart::Float(if *f == 0.0 { 0 } else { f.to_bits() }),
            Value::Text(s) => KeyPart::Text(s.clone()),
            Value::Date(d) => KeyPart::Date(*d),
            Value::Timestamp(ts) => KeyPart::Timestamp(*ts),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

fn integral_float(f: f64) -> Value {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Value::Int(f as i64)
    } else {
        Value::Null
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(d);
    }
    parse_timestamp(raw).map(|ts| ts.date_naive())
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
}

/// One component of a natural-key tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

pub type KeyTuple = Vec<KeyPart>;

/// Ordered column tuple identifying one logical entity within a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(Vec<String>);

impl NaturalKey {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(columns.into_iter().map(Into::into).collect())
    }

    pub fn columns(&self) -> &[String] {
        &self.0
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.iter().any(|c| c == column)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

/// Ordered mapping from column name to value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let mut record = Self::new();
        for (k, v) in pairs {
            record.set(k, v);
        }
        record
    }

    /// Builds a record from a JSON object; non-object values yield an empty record.
    pub fn from_json_object(value: &JsonValue) -> Self {
        let mut record = Self::new();
        if let JsonValue::Object(map) = value {
            for (k, v) in map {
                record.set(k.clone(), Value::from_json(v));
            }
        }
        record
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == column).map(|(_, v)| v)
    }

    /// Value of `column`, or `Null` when the column is absent.
    pub fn value(&self, column: &str) -> &Value {
        self.get(column).unwrap_or(&NULL_VALUE)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.fields.iter().any(|(k, _)| k == column)
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == column) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((column, value)),
        }
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        let idx = self.fields.iter().position(|(k, _)| k == column)?;
        Some(self.fields.remove(idx).1)
    }

    /// Renames a column in place, keeping its position. A no-op when absent.
    pub fn rename(&mut self, from: &str, to: &str) {
        if from == to || !self.contains(from) {
            return;
        }
        self.remove(to);
        if let Some((k, _)) = self.fields.iter_mut().find(|(k, _)| *k == from) {
            *k = to.to_string();
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn map_keys(self, f: impl Fn(&str) -> String) -> Self {
        let mut out = Self::new();
        for (k, v) in self.fields {
            out.set(f(&k), v);
        }
        out
    }

    pub fn clean_empty_strings(self) -> Self {
        Self {
            fields: self
                .fields
                .into_iter()
                .map(|(k, v)| (k, v.cleaned()))
                .collect(),
        }
    }

    /// Restricts the record to `columns`, in that order; absent columns become `Null`.
    pub fn project(&self, columns: &[String]) -> Self {
        Self {
            fields: columns
                .iter()
                .map(|c| (c.clone(), self.value(c).clone()))
                .collect(),
        }
    }

    pub fn key(&self, key: &NaturalKey) -> KeyTuple {
        key.columns().iter().map(|c| self.value(c).key_part()).collect()
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

/// Explicit description of a target table, supplied by the table registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Surrogate identifier column(s) of stored rows, usually `id`.
    #[serde(default)]
    pub identity: Vec<String>,
}

impl TableSchema {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

/// One fiscal reporting period of an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportingPeriod {
    pub id: i64,
    pub asset_id: i64,
    pub filing_date: NaiveDate,
    pub fiscal_year: i64,
    pub period_label: String,
}

impl ReportingPeriod {
    pub fn is_future_placeholder(&self) -> bool {
        self.fiscal_year == FUTURE_FISCAL_YEAR
            && self.period_label == FUTURE_PERIOD_LABEL
            && self.filing_date == future_filing_date()
    }
}

/// An earnings announcement awaiting (or carrying) a reporting-period assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct EarningsEntry {
    pub asset_id: i64,
    pub filing_date: NaiveDate,
    pub reporting_period_id: Option<i64>,
    /// Remaining feed columns (revenue/eps actuals and estimates, ref_date, ...).
    pub metrics: Record,
}

impl EarningsEntry {
    /// Splits a prepared earnings record; `None` when asset or filing date is missing.
    pub fn from_record(mut record: Record) -> Option<Self> {
        let asset_id = record.value("asset_id").as_i64()?;
        let filing_date = record.value("filing_date").as_date()?;
        record.remove("asset_id");
        record.remove("filing_date");
        let reporting_period_id = record
            .remove("reporting_period_id")
            .and_then(|v| v.as_i64());
        Some(Self {
            asset_id,
            filing_date,
            reporting_period_id,
            metrics: record,
        })
    }

    pub fn into_record(self) -> Record {
        let mut record = Record::new();
        record.set("asset_id", self.asset_id);
        record.set("filing_date", self.filing_date);
        record.set("reporting_period_id", self.reporting_period_id);
        for (k, v) in self.metrics.fields {
            record.set(k, v);
        }
        record
    }
}

/// `fooBarBaz` -> `foo_bar_baz`: an underscore goes between a lowercase letter
/// and a following uppercase letter, then everything is lower-cased.
pub fn camel_to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev: Option<char> = None;
    for c in name.chars() {
        if c.is_ascii_uppercase() && prev.is_some_and(|p| p.is_ascii_lowercase()) {
            out.push('_');
        }
        out.push(c.to_ascii_lowercase());
        prev = Some(c);
    }
    out
}
