use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{
    query::Query,
    sqlite::{
        SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
        SqliteSynchronous,
    },
    Column, Row as _, Sqlite, SqlitePool, Transaction, TypeInfo, ValueRef,
};
use tracing::{debug, info};

use crate::store::{
    DataStore, Row, SqlValue, StoreError, StoreResult, StoreTransaction, WriteResult,
};

/// [`DataStore`] backed by an sqlx SQLite pool
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    url: String,
}

impl SqliteStore {
    /// Open a pool with settings suited to a single edge host
    ///
    /// `url` is an sqlx SQLite URL (`sqlite://data/ignis.db`, `sqlite::memory:`).
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Connection(format!("{url}: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(format!("{url}: {e}")))?;

        info!("SQLite connected: {}", url);
        Ok(Self {
            pool,
            url: url.to_string(),
        })
    }

    /// Private in-memory database on a single pinned connection
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            url: "sqlite::memory:".to_string(),
        })
    }

    /// Create from an existing pool
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            url: "from_pool".to_string(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Check if database is accessible
    pub async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        debug!("SQLite closed: {}", self.url);
    }
}

fn bind_params<'q>(
    sql: &'q str,
    params: &'q [SqlValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    let mut query = sqlx::query(sql);
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<i64>),
            SqlValue::Integer(v) => query.bind(*v),
            SqlValue::Real(v) => query.bind(*v),
            SqlValue::Text(s) => query.bind(s.as_str()),
            SqlValue::Blob(b) => query.bind(b.as_slice()),
        };
    }
    query
}

/// Decode by the runtime storage class of each value
fn decode_row(row: &SqliteRow) -> StoreResult<Row> {
    let mut decoded = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name();
        let raw = row.try_get_raw(idx).map_err(map_sqlx_error)?;
        let value = if raw.is_null() {
            SqlValue::Null
        } else {
            let type_name = raw.type_info().name().to_ascii_uppercase();
            match type_name.as_str() {
                "INTEGER" | "BOOLEAN" | "INT8" | "BIGINT" => SqlValue::Integer(
                    row.try_get_unchecked::<i64, _>(idx)
                        .map_err(|e| StoreError::column(name, e.to_string()))?,
                ),
                "REAL" | "NUMERIC" => SqlValue::Real(
                    row.try_get_unchecked::<f64, _>(idx)
                        .map_err(|e| StoreError::column(name, e.to_string()))?,
                ),
                "BLOB" => SqlValue::Blob(
                    row.try_get_unchecked::<Vec<u8>, _>(idx)
                        .map_err(|e| StoreError::column(name, e.to_string()))?,
                ),
                _ => SqlValue::Text(
                    row.try_get_unchecked::<String, _>(idx)
                        .map_err(|e| StoreError::column(name, e.to_string()))?,
                ),
            }
        };
        decoded.insert(name, value);
    }
    Ok(decoded)
}

fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::UniqueViolation(db.message().to_string());
        }
    }
    StoreError::Query(err.to_string())
}

#[async_trait]
impl DataStore for SqliteStore {
    async fn query(&self, sql: &str, params: &[SqlValue]) -> StoreResult<Vec<Row>> {
        let rows = bind_params(sql, params)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(decode_row).collect()
    }

    async fn get(&self, sql: &str, params: &[SqlValue]) -> StoreResult<Option<Row>> {
        let row = bind_params(sql, params)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn run(&self, sql: &str, params: &[SqlValue]) -> StoreResult<WriteResult> {
        let result = bind_params(sql, params)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(WriteResult {
            changes: result.rows_affected(),
            insert_id: result.last_insert_rowid(),
        })
    }

    async fn exec(&self, sql: &str) -> StoreResult<()> {
        sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        Ok(Box::new(SqliteTransaction { tx }))
    }
}

/// Transaction handle; sqlx rolls back on drop
pub struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> StoreResult<Vec<Row>> {
        let rows = bind_params(sql, params)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(decode_row).collect()
    }

    async fn get(&mut self, sql: &str, params: &[SqlValue]) -> StoreResult<Option<Row>> {
        let row = bind_params(sql, params)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn run(&mut self, sql: &str, params: &[SqlValue]) -> StoreResult<WriteResult> {
        let result = bind_params(sql, params)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(WriteResult {
            changes: result.rows_affected(),
            insert_id: result.last_insert_rowid(),
        })
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await.map_err(map_sqlx_error)
    }
}
