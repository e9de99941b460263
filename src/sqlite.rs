use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{sqlite::SqlitePoolOptions, FromRow, SqlitePool};
use tracing::instrument;

use crate::{
    config::QueueConfig,
    error::QueueError,
    store::{final_error_count, stale_lock_cutoff, QueueStore},
    types::{Job, JobId, JobStatus, NewJob},
};

const CLAIMABLE: &str = "locked_at IS NULL \
    AND error_count < ? \
    AND status IN ('new', 'error') \
    AND (expire_date IS NULL OR expire_date > ?)";

const COLUMNS: &str = "id, consumer_name, command, data, status, locked_at, error_count, \
    last_error, expire_date, date_created";

/// Durable queue backed by one SQLite table. Timestamps are stored as unix
/// milliseconds; a NULL `locked_at` or `expire_date` means unset.
#[derive(Clone, Debug)]
pub struct SqliteQueue {
    pool: SqlitePool,
    table: String,
    max_error_count: u32,
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: i64,
    consumer_name: String,
    command: String,
    data: String,
    status: String,
    locked_at: Option<i64>,
    error_count: i64,
    last_error: String,
    expire_date: Option<i64>,
    date_created: i64,
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = JobId(row.id);
        let error_count = u32::try_from(row.error_count)
            .map_err(|_| QueueError::MalformedJob(format!("job {id} has a negative error count")))?;

        Ok(Job {
            id,
            consumer_name: row.consumer_name,
            command: row.command,
            data: serde_json::from_str(&row.data)?,
            status: row.status.parse()?,
            locked_at: row.locked_at.map(from_millis).transpose()?,
            error_count,
            last_error: row.last_error,
            expire_date: row.expire_date.map(from_millis).transpose()?,
            date_created: from_millis(row.date_created)?,
        })
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, QueueError> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| QueueError::MalformedJob(format!("timestamp {millis} out of range")))
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl SqliteQueue {
    /// Open a pool for `url` and make sure the job table exists.
    pub async fn connect(url: &str, config: &QueueConfig) -> Result<Self, QueueError> {
        let pool = SqlitePoolOptions::new().connect(url).await?;
        let queue = Self::new(pool, config)?;
        queue.ensure_schema().await?;
        Ok(queue)
    }

    /// Wrap an existing pool. The table is named after `config.queue_name`.
    pub fn new(pool: SqlitePool, config: &QueueConfig) -> Result<Self, QueueError> {
        if config.queue_name.trim().is_empty() {
            return Err(QueueError::MissingConfig(
                "queue_name is needed to name the job table".to_string(),
            ));
        }

        Ok(Self {
            pool,
            table: config.queue_name.clone(),
            max_error_count: config.max_error_count,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn queue_name(&self) -> &str {
        &self.table
    }

    fn table(&self) -> String {
        quote_identifier(&self.table)
    }

    #[instrument(skip_all, err, fields(table = %self.table))]
    pub async fn ensure_schema(&self) -> Result<(), QueueError> {
        let table = self.table();
        let create_table = format!(
            r#"
CREATE TABLE IF NOT EXISTS {table} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    consumer_name TEXT NOT NULL,
    command TEXT NOT NULL,
    data TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'new' CHECK (status IN ('new', 'error', 'ok', 'ignore')),
    locked_at INTEGER,
    error_count INTEGER NOT NULL DEFAULT 0 CHECK (error_count >= 0),
    last_error TEXT NOT NULL DEFAULT '',
    expire_date INTEGER,
    date_created INTEGER NOT NULL
)
            "#
        );
        sqlx::query(&create_table).execute(&self.pool).await?;

        let create_index = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {table} (locked_at, status, date_created)",
            quote_identifier(&format!("{}_claim_idx", self.table)),
        );
        sqlx::query(&create_index).execute(&self.pool).await?;

        Ok(())
    }

    async fn fetch_where(&self, clause: &str, value: &str) -> Result<Vec<Job>, QueueError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE {clause} ORDER BY date_created DESC, id DESC",
            self.table()
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(value)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }
}

#[async_trait]
impl QueueStore for SqliteQueue {
    #[instrument(skip_all, err, ret, fields(consumer = %job.consumer_name, command = %job.command, payload_size))]
    async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError> {
        let data = serde_json::to_string(&job.payload)?;
        tracing::Span::current().record("payload_size", data.len());

        let sql = format!(
            "INSERT INTO {} (consumer_name, command, data, status, expire_date, date_created) \
             VALUES (?, ?, ?, ?, ?, ?)",
            self.table()
        );
        let id = sqlx::query(&sql)
            .bind(&job.consumer_name)
            .bind(&job.command)
            .bind(data)
            .bind(job.initial_status().as_str())
            .bind(job.expires_at.map(|at| at.timestamp_millis()))
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?
            .last_insert_rowid();

        Ok(JobId(id))
    }

    #[instrument(skip_all, err, fields(filter = %filter))]
    async fn claim_next(&self, filter: &str) -> Result<Option<Job>, QueueError> {
        let table = self.table();
        let max_error_count = i64::from(self.max_error_count);
        let select = format!(
            "SELECT id FROM {table} WHERE {CLAIMABLE} AND instr(consumer_name, ?) > 0 \
             ORDER BY date_created DESC, id DESC LIMIT 1"
        );
        let update = format!("UPDATE {table} SET locked_at = ? WHERE id = ? AND {CLAIMABLE}");

        loop {
            let now = Utc::now().timestamp_millis();
            let candidate: Option<i64> = sqlx::query_scalar(&select)
                .bind(max_error_count)
                .bind(now)
                .bind(filter)
                .fetch_optional(&self.pool)
                .await?;
            let Some(id) = candidate else {
                return Ok(None);
            };

            let rows_affected = sqlx::query(&update)
                .bind(now)
                .bind(id)
                .bind(max_error_count)
                .bind(now)
                .execute(&self.pool)
                .await?
                .rows_affected();

            if rows_affected != 1 {
                tracing::debug!(job_id = id, "lost claim race, looking for another job");
                continue;
            }

            // A concurrent garbage collection may delete the row right after the claim.
            match self.get_job(JobId(id)).await {
                Ok(Some(job)) => return Ok(Some(job)),
                Ok(None) => continue,
                Err(err @ (QueueError::Serialization(_) | QueueError::MalformedJob(_))) => {
                    tracing::warn!(job_id = id, error = %err, "unreadable job, giving up on it");
                    self.increase_error(JobId(id), &err.to_string(), true).await?;
                    self.unlock(JobId(id)).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    #[instrument(skip_all, err, fields(job_id = %job_id))]
    async fn lock(&self, job_id: JobId) -> Result<(), QueueError> {
        let sql = format!("UPDATE {} SET locked_at = ? WHERE id = ?", self.table());
        sqlx::query(&sql)
            .bind(Utc::now().timestamp_millis())
            .bind(job_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip_all, err, fields(job_id = %job_id))]
    async fn unlock(&self, job_id: JobId) -> Result<(), QueueError> {
        let sql = format!("UPDATE {} SET locked_at = NULL WHERE id = ?", self.table());
        sqlx::query(&sql).bind(job_id.0).execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip_all, err, fields(job_id = %job_id, status = %status))]
    async fn mark_status(&self, job_id: JobId, status: JobStatus) -> Result<(), QueueError> {
        let sql = format!("UPDATE {} SET status = ? WHERE id = ?", self.table());
        sqlx::query(&sql)
            .bind(status.as_str())
            .bind(job_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip_all, err, fields(job_id = %job_id, final_ = final_))]
    async fn increase_error(
        &self,
        job_id: JobId,
        message: &str,
        final_: bool,
    ) -> Result<(), QueueError> {
        let table = self.table();
        if final_ {
            let floor = final_error_count(0, self.max_error_count);
            let sql = format!(
                "UPDATE {table} SET error_count = MAX(error_count + 1, ?), last_error = ? WHERE id = ?"
            );
            sqlx::query(&sql)
                .bind(i64::from(floor))
                .bind(message)
                .bind(job_id.0)
                .execute(&self.pool)
                .await?;
        } else {
            let sql = format!(
                "UPDATE {table} SET error_count = error_count + 1, last_error = ? WHERE id = ?"
            );
            sqlx::query(&sql)
                .bind(message)
                .bind(job_id.0)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    #[instrument(skip_all, err, fields(job_id = %job_id))]
    async fn remove(&self, job_id: JobId) -> Result<(), QueueError> {
        let sql = format!("DELETE FROM {} WHERE id = ?", self.table());
        sqlx::query(&sql).bind(job_id.0).execute(&self.pool).await?;
        Ok(())
    }

    async fn error_count(&self, job_id: JobId) -> Result<u32, QueueError> {
        let sql = format!("SELECT error_count FROM {} WHERE id = ?", self.table());
        let count: Option<i64> = sqlx::query_scalar(&sql)
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?;
        let count = count.ok_or(QueueError::JobNotFound(job_id))?;
        u32::try_from(count)
            .map_err(|_| QueueError::MalformedJob(format!("job {job_id} has a negative error count")))
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let sql = format!("SELECT {COLUMNS} FROM {} WHERE id = ?", self.table());
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn list_all(&self) -> Result<Vec<Job>, QueueError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} ORDER BY date_created DESC, id DESC",
            self.table()
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    async fn list_by_consumer(&self, consumer_name: &str) -> Result<Vec<Job>, QueueError> {
        self.fetch_where("consumer_name = ?", consumer_name).await
    }

    async fn list_by_command(&self, command: &str) -> Result<Vec<Job>, QueueError> {
        self.fetch_where("command = ?", command).await
    }

    #[instrument(skip_all, err, fields(job_id = %job_id))]
    async fn update_payload(&self, job_id: JobId, payload: Value) -> Result<(), QueueError> {
        let data = serde_json::to_string(&payload)?;
        let sql = format!("UPDATE {} SET data = ? WHERE id = ?", self.table());
        sqlx::query(&sql)
            .bind(data)
            .bind(job_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip_all, err, ret)]
    async fn garbage_collect(&self) -> Result<u64, QueueError> {
        let sql = format!(
            "DELETE FROM {} WHERE expire_date IS NOT NULL AND expire_date < ?",
            self.table()
        );
        let removed = sqlx::query(&sql)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }

    #[instrument(skip_all, err, ret)]
    async fn release_stale_locks(&self, older_than: Duration) -> Result<u64, QueueError> {
        let cutoff = stale_lock_cutoff(older_than)?;
        let sql = format!(
            "UPDATE {} SET locked_at = NULL WHERE locked_at IS NOT NULL AND locked_at < ?",
            self.table()
        );
        let released = sqlx::query(&sql)
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(released)
    }

    fn max_error_count(&self) -> u32 {
        self.max_error_count
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc};

    use serde_json::json;
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};

    use super::*;
    use crate::{
        dispatcher::{JobConsumer, ProcessSummary},
        queue_spec,
        registry::CommandRegistry,
    };

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    async fn queue(config: &QueueConfig) -> SqliteQueue {
        let queue = SqliteQueue::new(memory_pool().await, config).unwrap();
        queue.ensure_schema().await.unwrap();
        queue
    }

    #[tokio::test]
    async fn sqlite_queue_satisfies_queue_spec() {
        let _ = tracing_subscriber::fmt::try_init();
        queue_spec::run_all(|| async { queue(&QueueConfig::default()).await }).await;
    }

    #[tokio::test]
    async fn empty_queue_name_is_rejected() {
        let config = QueueConfig {
            queue_name: "  ".to_string(),
            ..QueueConfig::default()
        };
        let err = SqliteQueue::new(memory_pool().await, &config).unwrap_err();
        assert!(matches!(err, QueueError::MissingConfig(_)));
    }

    #[tokio::test]
    async fn table_names_are_quoted() {
        let config = QueueConfig {
            queue_name: r#"odd "queue" name"#.to_string(),
            ..QueueConfig::default()
        };
        let queue = queue(&config).await;
        let id = queue
            .enqueue(NewJob::new("Example", "DoSomething", json!({})))
            .await
            .unwrap();
        assert_eq!(queue.claim_next("").await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn ensure_schema_is_repeatable() {
        let queue = queue(&QueueConfig::default()).await;
        let id = queue
            .enqueue(NewJob::new("Example", "DoSomething", json!({"kept": true})))
            .await
            .unwrap();
        queue.ensure_schema().await.unwrap();
        assert_eq!(
            queue.get_job(id).await.unwrap().unwrap().data,
            json!({"kept": true})
        );
    }

    #[tokio::test]
    async fn queues_on_one_pool_share_claims() {
        let pool = memory_pool().await;
        let config = QueueConfig::default();
        let first = SqliteQueue::new(pool.clone(), &config).unwrap();
        first.ensure_schema().await.unwrap();
        let second = SqliteQueue::new(pool, &config).unwrap();

        let id = first
            .enqueue(NewJob::new("Example", "DoSomething", json!({})))
            .await
            .unwrap();

        let (a, b) = tokio::join!(first.claim_next(""), second.claim_next(""));
        let winners: Vec<_> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].id, id);
    }

    #[tokio::test]
    async fn unreadable_payload_is_exhausted_and_skipped() {
        let queue = queue(&QueueConfig::default()).await;
        let readable = queue
            .enqueue(NewJob::new("Example", "DoSomething", json!({})))
            .await
            .unwrap();
        let unreadable = sqlx::query(
            r#"INSERT INTO "jobQueue" (consumer_name, command, data, status, date_created)
               VALUES ('Example', 'DoSomething', 'not json', 'new', ?)"#,
        )
        .bind(Utc::now().timestamp_millis() + 60_000)
        .execute(queue.pool())
        .await
        .unwrap()
        .last_insert_rowid();

        // The broken row is newest, so it is claimed first and set aside.
        let job = queue.claim_next("").await.unwrap().unwrap();
        assert_eq!(job.id, readable);
        assert!(queue.claim_next("").await.unwrap().is_none());

        let (locked_at, error_count, last_error): (Option<i64>, i64, String) = sqlx::query_as(
            r#"SELECT locked_at, error_count, last_error FROM "jobQueue" WHERE id = ?"#,
        )
        .bind(unreadable)
        .fetch_one(queue.pool())
        .await
        .unwrap();
        assert_eq!(locked_at, None);
        assert_eq!(error_count, 4);
        assert!(last_error.contains("serialize"));
    }

    #[tokio::test]
    async fn unreadable_payload_does_not_halt_processing() {
        let queue = Arc::new(queue(&QueueConfig::default()).await);
        sqlx::query(
            r#"INSERT INTO "jobQueue" (consumer_name, command, data, status, date_created)
               VALUES ('Example', 'DoSomething', 'not json', 'new', 0)"#,
        )
        .execute(queue.pool())
        .await
        .unwrap();

        let consumer = JobConsumer::new(
            queue.clone(),
            Arc::new(CommandRegistry::new()),
            QueueConfig::default(),
        );
        let summary = consumer.process_elements().await.unwrap();
        assert_eq!(summary, ProcessSummary::default());
        assert_eq!(queue.error_count(JobId(1)).await.unwrap(), 4);
    }

    fn temp_db(prefix: &str) -> std::path::PathBuf {
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("{prefix}_{}_{nonce}.db", std::process::id()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pollers_on_a_file_database_never_share_a_job() {
        let path = temp_db("jobqueue_claim_race");
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .unwrap();
        let queue = SqliteQueue::new(pool, &QueueConfig::default()).unwrap();
        queue.ensure_schema().await.unwrap();

        for n in 0..100 {
            queue
                .enqueue(NewJob::new("Example", "DoSomething", json!({ "n": n })))
                .await
                .unwrap();
        }

        let pollers: Vec<_> = (0..8)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut claimed = Vec::new();
                    while let Some(job) = queue.claim_next("").await.unwrap() {
                        claimed.push(job.id);
                    }
                    claimed
                })
            })
            .collect();

        let mut claimed = Vec::new();
        for poller in pollers {
            claimed.extend(poller.await.unwrap());
        }
        let unique: HashSet<_> = claimed.iter().copied().collect();
        assert_eq!(claimed.len(), 100);
        assert_eq!(unique.len(), 100);

        queue.pool().close().await;
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
        }
    }
}
