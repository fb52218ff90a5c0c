//! PostgreSQL-backed record store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::{info, instrument};

use newsflow_core::{NewRecord, Record, RecordId};

use super::r#trait::{RecordStore, StoreError, StoreResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS news (
    id          BIGSERIAL PRIMARY KEY,
    title       VARCHAR(255) NOT NULL,
    content     TEXT NOT NULL,
    author      VARCHAR(255) NOT NULL,
    source      VARCHAR(255) NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

/// Records live in the `news` table; ids come from its `BIGSERIAL` column.
#[derive(Debug, Clone)]
pub struct PostgresRecordStore {
    pool: Arc<PgPool>,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Close every pooled connection; later queries fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Connect a pool to `database_url` and verify it answers.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `news` table if it does not exist yet.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::query(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        info!("record store schema ensured");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    #[instrument(skip(self), fields(record_id = %id), err)]
    async fn find_by_id(&self, id: RecordId) -> StoreResult<Option<Record>> {
        let row = sqlx::query(
            r#"
            SELECT id, title, content, author, source, created_at
            FROM news
            WHERE id = $1
            "#,
        )
        .bind(id.as_i64())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_id", e))?;

        row.map(|row| {
            RecordRow::from_row(&row)
                .map(Record::from)
                .map_err(|e| StoreError::InvalidRow(e.to_string()))
        })
        .transpose()
    }

    #[instrument(skip(self, record), err)]
    async fn insert(&self, record: NewRecord) -> StoreResult<Record> {
        let row = sqlx::query(
            r#"
            INSERT INTO news (title, content, author, source)
            VALUES ($1, $2, $3, $4)
            RETURNING id, title, content, author, source, created_at
            "#,
        )
        .bind(&record.title)
        .bind(&record.content)
        .bind(&record.author)
        .bind(&record.source)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        RecordRow::from_row(&row)
            .map(Record::from)
            .map_err(|e| StoreError::InvalidRow(e.to_string()))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Query(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            StoreError::Unavailable(format!("{operation}: {err}"))
        }
        _ => StoreError::Query(format!("sqlx error in {operation}: {err}")),
    }
}

#[derive(Debug)]
struct RecordRow {
    id: i64,
    title: String,
    content: String,
    author: String,
    source: String,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for RecordRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(RecordRow {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            content: row.try_get("content")?,
            author: row.try_get("author")?,
            source: row.try_get("source")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<RecordRow> for Record {
    fn from(row: RecordRow) -> Self {
        Record {
            id: RecordId::new(row.id),
            title: row.title,
            content: row.content,
            author: row.author,
            source: row.source,
            created_at: row.created_at,
        }
    }
}
