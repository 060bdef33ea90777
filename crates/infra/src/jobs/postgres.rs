//! Postgres-backed job store.
//!
//! All jobs live in one `eventing_jobs` table keyed by job path. The full
//! record is kept as JSONB; the columns the engine filters and updates on
//! (`state`, `claimed_by`, timestamps) are stored separately and take
//! precedence over the JSON copy when a row is read.
//!
//! ## Claims
//!
//! `claim` is a conditional update (`WHERE claimed_by IS NULL AND finished_at
//! IS NULL`), so of several processes sharing the table exactly one wins.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Database (any code) | `Storage`, with the SQLSTATE in the message |
//! | PoolClosed | `Storage` |
//! | Other | `Storage` |
//!
//! ## Threads
//!
//! The engine calls the store from plain OS threads. The store keeps a handle
//! to a Tokio runtime and blocks on it; called from inside a multi-threaded
//! runtime it moves the wait off the async workers with `block_in_place`.
//! Calls made from inside a current-thread runtime fail with `Storage`
//! instead of blocking the only runtime thread.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use eventing_core::{ApplicationId, JobPath};

use super::store::{JobStore, JobStoreError};
use super::types::{JobQuery, JobRecord, JobState, LoadCursor, PutOutcome};

const SELECT_COLUMNS: &str = "SELECT record, state, claimed_by, created_at, updated_at, finished_at FROM eventing_jobs";

/// Postgres job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresJobStore {
    /// Create a store over `pool`, driving queries on `handle`.
    ///
    /// `handle` should belong to a multi-threaded runtime: a current-thread
    /// runtime only makes progress while its own thread drives it.
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        if handle.runtime_flavor() != RuntimeFlavor::MultiThread {
            warn!("Postgres job store created on a current-thread runtime; store calls from inside it will fail");
        }
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    /// Create the jobs table and its index when missing.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS eventing_jobs (
                path        TEXT PRIMARY KEY,
                topic       TEXT NOT NULL,
                job_id      TEXT,
                record      JSONB NOT NULL,
                state       TEXT NOT NULL,
                claimed_by  UUID,
                created_at  TIMESTAMPTZ NOT NULL,
                updated_at  TIMESTAMPTZ NOT NULL,
                finished_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS eventing_jobs_unfinished_idx
                ON eventing_jobs (created_at, path)
                WHERE finished_at IS NULL
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        debug!("eventing_jobs schema ready");
        Ok(())
    }

    /// Drive `fut` to completion on the store's runtime.
    ///
    /// `block_in_place` is only available on the multi-threaded runtime, so a
    /// call from inside a current-thread runtime is refused with an error.
    fn run<T, F>(&self, operation: &str, fut: F) -> Result<T, JobStoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        let result = match Handle::try_current() {
            Ok(current) if current.runtime_flavor() != RuntimeFlavor::MultiThread => {
                return Err(JobStoreError::Storage(format!(
                    "{operation} called from a current-thread runtime; the Postgres job store needs a multi-threaded runtime"
                )));
            }
            Ok(_) => tokio::task::block_in_place(|| self.handle.block_on(fut)),
            Err(_) => self.handle.block_on(fut),
        };
        result.map_err(|e| map_sqlx_error(operation, e))
    }

    fn fetch_records(&self, operation: &str, mut builder: QueryBuilder<'_, Postgres>) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = self.run(operation, builder.build().fetch_all(&*self.pool))?;
        rows.iter().map(decode_record).collect()
    }
}

fn encode_record(record: &JobRecord) -> Result<Value, JobStoreError> {
    serde_json::to_value(record).map_err(|e| JobStoreError::Storage(format!("failed to encode job {}: {e}", record.path)))
}

fn decode_record(row: &PgRow) -> Result<JobRecord, JobStoreError> {
    let row = JobRow::from_row(row).map_err(|e| JobStoreError::Storage(format!("failed to read job row: {e}")))?;
    JobRecord::try_from(row)
}

impl JobStore for PostgresJobStore {
    #[instrument(skip(self, record), fields(job_path = %record.path), err)]
    fn put(&self, record: JobRecord) -> Result<PutOutcome, JobStoreError> {
        let payload = encode_record(&record)?;
        let insert = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO eventing_jobs (
                path, topic, job_id, record, state, claimed_by, created_at, updated_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, NULL, $6, $7, NULL)
            ON CONFLICT (path) DO UPDATE SET
                topic = EXCLUDED.topic,
                job_id = EXCLUDED.job_id,
                record = EXCLUDED.record,
                state = EXCLUDED.state,
                claimed_by = NULL,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at,
                finished_at = NULL
            WHERE eventing_jobs.finished_at IS NOT NULL
            RETURNING path
            "#,
        )
        .bind(record.path.as_str())
        .bind(record.topic.as_str())
        .bind(record.id.as_deref())
        .bind(&payload)
        .bind(record.state.as_str())
        .bind(record.created_at)
        .bind(record.updated_at);
        let inserted = self.run("put", insert.fetch_optional(&*self.pool))?;

        Ok(match inserted {
            Some(_) => PutOutcome::Inserted(record.path),
            None => PutOutcome::Existing(record.path),
        })
    }

    fn get(&self, path: &JobPath) -> Result<Option<JobRecord>, JobStoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE path = $1");
        let select = sqlx::query(&sql).bind(path.as_str());
        let row = self.run("get", select.fetch_optional(&*self.pool))?;
        row.as_ref().map(decode_record).transpose()
    }

    #[instrument(skip(self), fields(job_path = %path), err)]
    fn claim(&self, path: &JobPath, owner: ApplicationId) -> Result<bool, JobStoreError> {
        let claim = sqlx::query(
            r#"
            UPDATE eventing_jobs
            SET claimed_by = $2, state = 'claimed', updated_at = NOW()
            WHERE path = $1 AND claimed_by IS NULL AND finished_at IS NULL
            "#,
        )
        .bind(path.as_str())
        .bind(owner.as_uuid());
        let result = self.run("claim", claim.execute(&*self.pool))?;
        Ok(result.rows_affected() == 1)
    }

    fn release(&self, path: &JobPath) -> Result<(), JobStoreError> {
        let release = sqlx::query(
            r#"
            UPDATE eventing_jobs
            SET claimed_by = NULL, state = 'pending', updated_at = NOW()
            WHERE path = $1 AND finished_at IS NULL
            "#,
        )
        .bind(path.as_str());
        self.run("release", release.execute(&*self.pool))?;
        Ok(())
    }

    fn update(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        let payload = encode_record(record)?;
        let update = sqlx::query(
            r#"
            UPDATE eventing_jobs
            SET record = $2, state = $3, claimed_by = $4, updated_at = $5, finished_at = $6
            WHERE path = $1
            "#,
        )
        .bind(record.path.as_str())
        .bind(&payload)
        .bind(record.state.as_str())
        .bind(record.claimed_by.map(|owner| *owner.as_uuid()))
        .bind(record.updated_at)
        .bind(record.finished_at);
        let result = self.run("update", update.execute(&*self.pool))?;
        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(record.path.clone()));
        }
        Ok(())
    }

    fn mark_finished(&self, path: &JobPath, state: JobState) -> Result<(), JobStoreError> {
        let finish = sqlx::query(
            r#"
            UPDATE eventing_jobs
            SET state = $2, claimed_by = NULL, updated_at = NOW(), finished_at = NOW()
            WHERE path = $1
            "#,
        )
        .bind(path.as_str())
        .bind(state.as_str());
        let result = self.run("mark_finished", finish.execute(&*self.pool))?;
        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(path.clone()));
        }
        Ok(())
    }

    fn delete(&self, path: &JobPath) -> Result<bool, JobStoreError> {
        let delete = sqlx::query("DELETE FROM eventing_jobs WHERE path = $1").bind(path.as_str());
        let result = self.run("delete", delete.execute(&*self.pool))?;
        Ok(result.rows_affected() > 0)
    }

    fn query_unfinished(
        &self,
        after: Option<&LoadCursor>,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut builder = QueryBuilder::<Postgres>::new(SELECT_COLUMNS);
        builder
            .push(" WHERE finished_at IS NULL AND created_at < ")
            .push_bind(created_before);
        if let Some(cursor) = after {
            builder
                .push(" AND (created_at, path) > (")
                .push_bind(cursor.created_at)
                .push(", ")
                .push_bind(cursor.path.as_str().to_string())
                .push(")");
        }
        builder
            .push(" ORDER BY created_at, path LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        self.fetch_records("query_unfinished", builder)
    }

    fn query(&self, query: &JobQuery) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut builder = QueryBuilder::<Postgres>::new(SELECT_COLUMNS);
        builder.push(" WHERE finished_at IS NULL");
        if let Some(topic) = &query.topic {
            builder.push(" AND topic = ").push_bind(topic.as_str().to_string());
        }
        match query.claimed {
            Some(true) => {
                builder.push(" AND claimed_by IS NOT NULL");
            }
            Some(false) => {
                builder.push(" AND claimed_by IS NULL");
            }
            None => {}
        }
        if !query.filters.is_empty() {
            builder.push(" AND (");
            for (i, filter) in query.filters.iter().enumerate() {
                if i > 0 {
                    builder.push(" OR ");
                }
                let containment = Value::Object(filter.clone().into_iter().collect());
                builder.push("record->'properties' @> ").push_bind(containment);
            }
            builder.push(")");
        }
        builder.push(" ORDER BY created_at, path");
        if let Some(limit) = query.limit {
            builder
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        self.fetch_records("query", builder)
    }

    fn purge_finished(&self, finished_before: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let purge = sqlx::query("DELETE FROM eventing_jobs WHERE finished_at IS NOT NULL AND finished_at < $1")
            .bind(finished_before);
        let result = self.run("purge_finished", purge.execute(&*self.pool))?;
        Ok(result.rows_affected() as usize)
    }

    fn release_claims_of(&self, owner: ApplicationId) -> Result<usize, JobStoreError> {
        let release = sqlx::query(
            r#"
            UPDATE eventing_jobs
            SET claimed_by = NULL, state = 'pending', updated_at = NOW()
            WHERE claimed_by = $1 AND finished_at IS NULL
            "#,
        )
        .bind(owner.as_uuid());
        let result = self.run("release_claims_of", release.execute(&*self.pool))?;
        Ok(result.rows_affected() as usize)
    }

    fn renew_claims(&self, owner: ApplicationId) -> Result<usize, JobStoreError> {
        let renew = sqlx::query(
            r#"
            UPDATE eventing_jobs
            SET updated_at = NOW()
            WHERE claimed_by = $1 AND finished_at IS NULL
            "#,
        )
        .bind(owner.as_uuid());
        let result = self.run("renew_claims", renew.execute(&*self.pool))?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self), err)]
    fn release_expired_claims(
        &self,
        owner: ApplicationId,
        renewed_before: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let release = sqlx::query(
            r#"
            UPDATE eventing_jobs
            SET claimed_by = NULL, state = 'pending', updated_at = NOW()
            WHERE claimed_by IS NOT NULL
              AND claimed_by <> $1
              AND finished_at IS NULL
              AND updated_at < $2
            RETURNING record, state, claimed_by, created_at, updated_at, finished_at
            "#,
        )
        .bind(owner.as_uuid())
        .bind(renewed_before);
        let rows = self.run("release_expired_claims", release.fetch_all(&*self.pool))?;
        let mut released = rows.iter().map(decode_record).collect::<Result<Vec<_>, _>>()?;
        released.sort_by(|a, b| (a.created_at, &a.path).cmp(&(b.created_at, &b.path)));
        Ok(released)
    }
}

/// Map SQLx errors to job store errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            let msg = format!("database error in {operation} ({code}): {}", db_err.message());
            JobStoreError::Storage(msg)
        }
        sqlx::Error::PoolClosed => JobStoreError::Storage(format!("connection pool closed in {operation}")),
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

#[derive(Debug)]
struct JobRow {
    record: Value,
    state: String,
    claimed_by: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            record: row.try_get("record")?,
            state: row.try_get("state")?,
            claimed_by: row.try_get("claimed_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }
}

impl TryFrom<JobRow> for JobRecord {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let mut job: JobRecord = serde_json::from_value(row.record)
            .map_err(|e| JobStoreError::Storage(format!("malformed job record: {e}")))?;
        job.state = JobState::parse(&row.state)
            .ok_or_else(|| JobStoreError::Storage(format!("unknown job state '{}' for {}", row.state, job.path)))?;
        job.claimed_by = row.claimed_by.map(ApplicationId::from_uuid);
        // column timestamps have microsecond precision; keyset paging relies on them
        job.created_at = row.created_at;
        job.updated_at = row.updated_at;
        job.finished_at = row.finished_at;
        Ok(job)
    }
}
