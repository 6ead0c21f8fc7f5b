//! Data-store contract
//!
//! Components talk to persistence only through [`DataStore`]: parameterized
//! statements in, rows / a single row / a write result out. Transactions are
//! reserved for multi-row bulk writes.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use errors::IgnisError;
use serde_json::Value;
use thiserror::Error;

/// Result type for data-store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Data-store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// Statement failed
    #[error("Query failed: {0}")]
    Query(String),

    /// Column missing or of an unexpected type
    #[error("Column {column}: {reason}")]
    Column { column: String, reason: String },

    /// Connection could not be established
    #[error("Connection error: {0}")]
    Connection(String),
}

impl StoreError {
    pub fn column(column: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::Column {
            column: column.into(),
            reason: reason.into(),
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation(_))
    }
}

impl From<StoreError> for IgnisError {
    fn from(err: StoreError) -> Self {
        IgnisError::Database(err.to_string())
    }
}

/// A statement parameter or a decoded column value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            SqlValue::Real(v) => Some(*v as i64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// SQLite booleans are integers; text "true"/"1" is accepted too
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Integer(v) => Some(*v != 0),
            SqlValue::Real(v) => Some(*v != 0.0),
            SqlValue::Text(s) => match s.trim() {
                "1" | "true" | "TRUE" => Some(true),
                "0" | "false" | "FALSE" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            SqlValue::Null => Value::Null,
            SqlValue::Integer(v) => Value::from(*v),
            SqlValue::Real(v) => Value::from(*v),
            SqlValue::Text(s) => Value::from(s.as_str()),
            SqlValue::Blob(b) => Value::from(b.len()),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Integer(v) => write!(f, "{}", v),
            SqlValue::Real(v) => write!(f, "{}", v),
            SqlValue::Text(s) => write!(f, "'{}'", s),
            SqlValue::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<u16> for SqlValue {
    fn from(v: u16) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&String> for SqlValue {
    fn from(v: &String) -> Self {
        SqlValue::Text(v.clone())
    }
}

/// Timestamps are stored as RFC 3339 text with millisecond precision
impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Text(v.to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Build a parameter slice: `params![id, "ACTIVE", None::<i64>]`
#[macro_export]
macro_rules! params {
    () => {
        Vec::<$crate::store::SqlValue>::new()
    };
    ($($value:expr),+ $(,)?) => {
        vec![$($crate::store::SqlValue::from($value)),+]
    };
}

/// A decoded result row keyed by column name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    values: HashMap<String, SqlValue>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: SqlValue) {
        self.values.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.values.get(column)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn required(&self, column: &str) -> StoreResult<&SqlValue> {
        self.values
            .get(column)
            .ok_or_else(|| StoreError::column(column, "missing"))
    }

    pub fn i64(&self, column: &str) -> StoreResult<i64> {
        self.required(column)?
            .as_i64()
            .ok_or_else(|| StoreError::column(column, "not an integer"))
    }

    pub fn opt_i64(&self, column: &str) -> Option<i64> {
        self.values.get(column).and_then(SqlValue::as_i64)
    }

    pub fn string(&self, column: &str) -> StoreResult<String> {
        match self.required(column)? {
            SqlValue::Text(s) => Ok(s.clone()),
            SqlValue::Integer(v) => Ok(v.to_string()),
            SqlValue::Real(v) => Ok(v.to_string()),
            _ => Err(StoreError::column(column, "not text")),
        }
    }

    /// Text column, `None` for NULL, missing or blank values
    pub fn opt_string(&self, column: &str) -> Option<String> {
        match self.values.get(column) {
            Some(SqlValue::Text(s)) if !s.trim().is_empty() => Some(s.clone()),
            Some(SqlValue::Integer(v)) => Some(v.to_string()),
            _ => None,
        }
    }

    /// Boolean flag column; NULL or missing reads as `default`
    pub fn flag(&self, column: &str, default: bool) -> bool {
        self.values
            .get(column)
            .and_then(SqlValue::as_bool)
            .unwrap_or(default)
    }

    pub fn timestamp(&self, column: &str) -> StoreResult<DateTime<Utc>> {
        let text = self.string(column)?;
        parse_timestamp(&text).ok_or_else(|| StoreError::column(column, "not a timestamp"))
    }

    pub fn opt_timestamp(&self, column: &str) -> Option<DateTime<Utc>> {
        self.opt_string(column).and_then(|s| parse_timestamp(&s))
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

/// Accepts RFC 3339 and SQLite's `CURRENT_TIMESTAMP` format
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Outcome of a write statement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteResult {
    /// Rows changed by the statement
    pub changes: u64,
    /// Row id of the last inserted row
    pub insert_id: i64,
}

/// Persistence collaborator used by the pipeline
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Run a statement and collect every row
    async fn query(&self, sql: &str, params: &[SqlValue]) -> StoreResult<Vec<Row>>;

    /// Run a statement and return the first row, if any
    async fn get(&self, sql: &str, params: &[SqlValue]) -> StoreResult<Option<Row>>;

    /// Run a write statement
    async fn run(&self, sql: &str, params: &[SqlValue]) -> StoreResult<WriteResult>;

    /// Execute one or more unparameterized statements
    async fn exec(&self, sql: &str) -> StoreResult<()>;

    /// Open a transaction; dropping it without commit rolls back
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>>;
}

/// Statements executed inside a single transaction
#[async_trait]
pub trait StoreTransaction: Send {
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> StoreResult<Vec<Row>>;

    async fn get(&mut self, sql: &str, params: &[SqlValue]) -> StoreResult<Option<Row>>;

    async fn run(&mut self, sql: &str, params: &[SqlValue]) -> StoreResult<WriteResult>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}
