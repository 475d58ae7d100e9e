//! Persistent job/task store backed by embedded SQLite.
//!
//! Single source of truth for job and task state. The pool is capped at one
//! connection so every transaction below is serialized; compound operations
//! are atomic with respect to each other.

pub mod model;

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::common::error::StoreError;
use crate::common::{id, time};

pub use model::{
    recompute_job_status, Job, JobDetail, JobStatus, NewJob, StatusCounts, Task, TaskStatus,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id          TEXT PRIMARY KEY,
        action      TEXT NOT NULL,
        region      TEXT NOT NULL DEFAULT '',
        targets     TEXT NOT NULL,
        meta        TEXT NOT NULL DEFAULT '{}',
        status      TEXT NOT NULL,
        created_at  INTEGER NOT NULL,
        updated_at  INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id          TEXT PRIMARY KEY,
        job_id      TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        target      TEXT NOT NULL,
        action      TEXT NOT NULL,
        region      TEXT NOT NULL DEFAULT '',
        payload     TEXT,
        status      TEXT NOT NULL,
        attempt     INTEGER NOT NULL DEFAULT 0,
        created_at  INTEGER NOT NULL,
        updated_at  INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks (status, region, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_job ON tasks (job_id)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs (created_at)",
];

const LIST_LIMIT_MAX: i64 = 500;

pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (or create) the store at `path` and apply the schema.
    /// ":memory:" opens an ephemeral database.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let options = if path == ":memory:" {
            SqliteConnectOptions::new().in_memory(true)
        } else {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        }
        .foreign_keys(true);

        // One connection, kept alive: serializes writes and keeps ":memory:"
        // databases from vanishing with a recycled connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        info!(path, "job store opened");
        Ok(Self { pool })
    }

    /// Create a job and one task per target in a single transaction.
    pub async fn create_job(&self, new: NewJob) -> Result<JobDetail, StoreError> {
        if new.action.is_empty() {
            return Err(StoreError::InvalidArgument("action must not be empty".into()));
        }
        if new.targets.is_empty() {
            return Err(StoreError::InvalidArgument("targets must not be empty".into()));
        }

        let now = time::now();
        let now_ms = now.timestamp_millis();
        let job = Job {
            id: id::new_id(),
            action: new.action,
            region: new.region,
            targets: new.targets,
            meta: new.meta,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
        };
        let payload_json = new
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO jobs (id, action, region, targets, meta, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            "#,
        )
        .bind(&job.id)
        .bind(&job.action)
        .bind(&job.region)
        .bind(serde_json::to_string(&job.targets)?)
        .bind(serde_json::to_string(&job.meta)?)
        .bind(job.status)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;

        let mut tasks = Vec::with_capacity(job.targets.len());
        for target in &job.targets {
            let task = Task {
                id: id::new_id(),
                job_id: job.id.clone(),
                target: target.clone(),
                action: job.action.clone(),
                region: job.region.clone(),
                payload: new.payload.clone(),
                status: TaskStatus::Queued,
                attempt: 0,
                created_at: now,
                updated_at: now,
            };
            sqlx::query(
                r#"
                INSERT INTO tasks (id, job_id, target, action, region, payload, status, attempt, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)
                "#,
            )
            .bind(&task.id)
            .bind(&task.job_id)
            .bind(&task.target)
            .bind(&task.action)
            .bind(&task.region)
            .bind(payload_json.as_deref())
            .bind(task.status)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;
            tasks.push(task);
        }
        tx.commit().await?;

        Ok(JobDetail { job, tasks })
    }

    /// Fetch a job and its tasks in creation order.
    pub async fn get_job(&self, job_id: &str) -> Result<JobDetail, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound("job"))?;
        let job = job_from_row(&row)?;

        // Tasks of one job share created_at; rowid preserves insertion order.
        let rows = sqlx::query("SELECT * FROM tasks WHERE job_id = ?1 ORDER BY created_at ASC, rowid ASC")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        let tasks = rows.iter().map(task_from_row).collect::<Result<Vec<_>, _>>()?;

        Ok(JobDetail { job, tasks })
    }

    /// List jobs, newest first. The limit is clamped to [1, 500].
    pub async fn list_jobs(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        let limit = limit.clamp(1, LIST_LIMIT_MAX);
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC LIMIT ?1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Cancel a job and all of its non-terminal tasks. The cancel is sticky:
    /// later recomputation never moves the job out of `Canceled`.
    pub async fn cancel_job(&self, job_id: &str) -> Result<(), StoreError> {
        let now_ms = time::now_ms();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(JobStatus::Canceled)
            .bind(now_ms)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound("job"));
        }

        sqlx::query(
            r#"
            UPDATE tasks SET status = ?1, updated_at = ?2
            WHERE job_id = ?3 AND status IN ('queued', 'running')
            "#,
        )
        .bind(TaskStatus::Canceled)
        .bind(now_ms)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Claim the oldest queued task matching `region` (or carrying no region
    /// at all). Increments the attempt counter, moves the task to `Running`
    /// and promotes the owning job to `Running` unless it was canceled.
    pub async fn claim_next_task(&self, region: &str) -> Result<Option<Task>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE status = 'queued' AND (region = ?1 OR region = '')
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(region)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut task = task_from_row(&row)?;

        let now_ms = time::now_ms();
        // Conditional on the task still being queued, so concurrent claimers
        // cannot duplicate a dispatch.
        let updated = sqlx::query(
            r#"
            UPDATE tasks SET status = 'running', attempt = attempt + 1, updated_at = ?1
            WHERE id = ?2 AND status = 'queued'
            "#,
        )
        .bind(now_ms)
        .bind(&task.id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Ok(None);
        }

        sqlx::query(
            r#"
            UPDATE jobs SET status = 'running', updated_at = ?1
            WHERE id = ?2 AND status != 'canceled'
            "#,
        )
        .bind(now_ms)
        .bind(&task.job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        task.status = TaskStatus::Running;
        task.attempt += 1;
        task.updated_at = time::from_ms(now_ms);
        Ok(Some(task))
    }

    /// Put a running task back in the queue. No-op for any other status.
    /// The attempt counter is left alone.
    pub async fn requeue_task(&self, task_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE tasks SET status = 'queued', updated_at = ?1 WHERE id = ?2 AND status = 'running'",
        )
        .bind(time::now_ms())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Requeue every running task whose lease expired. Returns the number of
    /// tasks affected.
    pub async fn requeue_stale_tasks(&self, lease: Duration) -> Result<u64, StoreError> {
        let now_ms = time::now_ms();
        let cutoff = now_ms - lease.as_millis() as i64;
        let updated = sqlx::query(
            "UPDATE tasks SET status = 'queued', updated_at = ?1 WHERE status = 'running' AND updated_at < ?2",
        )
        .bind(now_ms)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected())
    }

    /// Record an agent-reported outcome for a task and recompute the owning
    /// job's status. The terminal status is applied unconditionally; delivery
    /// is at-least-once and a lease-expired dispatch may still report in.
    pub async fn set_task_result(
        &self,
        task_id: &str,
        success: bool,
    ) -> Result<(Task, Job), StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound("task"))?;
        let mut task = task_from_row(&row)?;

        let now_ms = time::now_ms();
        let status = if success { TaskStatus::Finished } else { TaskStatus::Failed };
        sqlx::query("UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status)
            .bind(now_ms)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        task.status = status;
        task.updated_at = time::from_ms(now_ms);

        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(&task.job_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound("job"))?;
        let mut job = job_from_row(&row)?;

        if job.status != JobStatus::Canceled {
            let counts = task_status_counts(&mut tx, &job.id).await?;
            let next = recompute_job_status(counts);
            if next != job.status {
                sqlx::query("UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3")
                    .bind(next)
                    .bind(now_ms)
                    .bind(&job.id)
                    .execute(&mut *tx)
                    .await?;
                job.status = next;
                job.updated_at = time::from_ms(now_ms);
            }
        }

        tx.commit().await?;
        Ok((task, job))
    }
}

async fn task_status_counts(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    job_id: &str,
) -> Result<StatusCounts, StoreError> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks WHERE job_id = ?1 GROUP BY status")
        .bind(job_id)
        .fetch_all(&mut **tx)
        .await?;
    let mut counts = StatusCounts::default();
    for row in &rows {
        let status: TaskStatus = row.try_get("status")?;
        let n: i64 = row.try_get("n")?;
        counts.add(status, n);
    }
    Ok(counts)
}

fn job_from_row(row: &SqliteRow) -> Result<Job, StoreError> {
    let targets: String = row.try_get("targets")?;
    let meta: String = row.try_get("meta")?;
    Ok(Job {
        id: row.try_get("id")?,
        action: row.try_get("action")?,
        region: row.try_get("region")?,
        targets: serde_json::from_str(&targets)?,
        meta: serde_json::from_str(&meta)?,
        status: row.try_get("status")?,
        created_at: time::from_ms(row.try_get("created_at")?),
        updated_at: time::from_ms(row.try_get("updated_at")?),
    })
}

fn task_from_row(row: &SqliteRow) -> Result<Task, StoreError> {
    let payload: Option<String> = row.try_get("payload")?;
    Ok(Task {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        target: row.try_get("target")?,
        action: row.try_get("action")?,
        region: row.try_get("region")?,
        payload: payload.as_deref().map(serde_json::from_str).transpose()?,
        status: row.try_get("status")?,
        attempt: row.try_get("attempt")?,
        created_at: time::from_ms(row.try_get("created_at")?),
        updated_at: time::from_ms(row.try_get("updated_at")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn open_store() -> JobStore {
        JobStore::open(":memory:").await.unwrap()
    }

    fn new_job(action: &str, region: &str, targets: &[&str]) -> NewJob {
        NewJob {
            action: action.to_string(),
            region: region.to_string(),
            targets: targets.iter().map(|t| t.to_string()).collect(),
            ..NewJob::default()
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = open_store().await;
        let created = store
            .create_job(NewJob {
                payload: Some(json!({"key": "value"})),
                meta: [("tenant".to_string(), "t1".to_string())].into(),
                ..new_job("ping", "local", &["acct-1", "acct-2"])
            })
            .await
            .unwrap();

        let fetched = store.get_job(&created.job.id).await.unwrap();
        assert_eq!(fetched.job.action, "ping");
        assert_eq!(fetched.job.status, JobStatus::Queued);
        assert_eq!(fetched.job.meta["tenant"], "t1");
        assert_eq!(fetched.tasks.len(), 2);
        // Tasks come back in input order, all queued, sharing the job stamp.
        assert_eq!(fetched.tasks[0].target, "acct-1");
        assert_eq!(fetched.tasks[1].target, "acct-2");
        for task in &fetched.tasks {
            assert_eq!(task.status, TaskStatus::Queued);
            assert_eq!(task.attempt, 0);
            assert_eq!(task.created_at, fetched.job.created_at);
            assert_eq!(task.payload, Some(json!({"key": "value"})));
        }
    }

    #[tokio::test]
    async fn create_rejects_empty_action_and_targets() {
        let store = open_store().await;
        let err = store.create_job(new_job("", "", &["a"])).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));

        let err = store.create_job(new_job("ping", "", &[])).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn get_unknown_job_is_not_found() {
        let store = open_store().await;
        let err = store.get_job("deadbeef").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound("job")));
    }

    #[tokio::test]
    async fn list_jobs_is_newest_first_and_clamped() {
        let store = open_store().await;
        for i in 0..3 {
            store.create_job(new_job(&format!("a{i}"), "", &["t"])).await.unwrap();
            // Distinct created_at millis so ordering is observable.
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let jobs = store.list_jobs(50).await.unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].action, "a2");
        assert_eq!(jobs[2].action, "a0");

        // limit=0 clamps to 1; an oversized limit is tolerated.
        assert_eq!(store.list_jobs(0).await.unwrap().len(), 1);
        assert_eq!(store.list_jobs(10_000).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn claim_is_fifo_and_region_scoped() {
        let store = open_store().await;
        store.create_job(new_job("first", "eu", &["a"])).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store.create_job(new_job("second", "eu", &["b"])).await.unwrap();
        store.create_job(new_job("other", "us", &["c"])).await.unwrap();

        let claimed = store.claim_next_task("eu").await.unwrap().unwrap();
        assert_eq!(claimed.action, "first");
        assert_eq!(claimed.status, TaskStatus::Running);
        assert_eq!(claimed.attempt, 1);

        let claimed = store.claim_next_task("eu").await.unwrap().unwrap();
        assert_eq!(claimed.action, "second");

        // Nothing queued for eu anymore.
        assert!(store.claim_next_task("eu").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_matches_region_unscoped_tasks() {
        let store = open_store().await;
        store.create_job(new_job("anywhere", "", &["a"])).await.unwrap();

        let claimed = store.claim_next_task("eu").await.unwrap().unwrap();
        assert_eq!(claimed.action, "anywhere");
    }

    #[tokio::test]
    async fn claim_promotes_job_to_running() {
        let store = open_store().await;
        let created = store.create_job(new_job("ping", "", &["a", "b"])).await.unwrap();

        store.claim_next_task("").await.unwrap().unwrap();
        let fetched = store.get_job(&created.job.id).await.unwrap();
        assert_eq!(fetched.job.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn requeue_restores_running_tasks_only() {
        let store = open_store().await;
        let created = store.create_job(new_job("ping", "", &["a"])).await.unwrap();
        let task_id = created.tasks[0].id.clone();

        // Queued task: no-op.
        store.requeue_task(&task_id).await.unwrap();
        let fetched = store.get_job(&created.job.id).await.unwrap();
        assert_eq!(fetched.tasks[0].status, TaskStatus::Queued);

        let claimed = store.claim_next_task("").await.unwrap().unwrap();
        store.requeue_task(&claimed.id).await.unwrap();
        let fetched = store.get_job(&created.job.id).await.unwrap();
        assert_eq!(fetched.tasks[0].status, TaskStatus::Queued);
        // Attempt survives the requeue.
        assert_eq!(fetched.tasks[0].attempt, 1);

        // Re-claim increments again.
        let claimed = store.claim_next_task("").await.unwrap().unwrap();
        assert_eq!(claimed.attempt, 2);
    }

    #[tokio::test]
    async fn stale_lease_sweep_requeues_old_running_tasks() {
        let store = open_store().await;
        let created = store.create_job(new_job("ping", "", &["a"])).await.unwrap();
        let claimed = store.claim_next_task("").await.unwrap();
        assert!(claimed.is_some());

        // A generous lease leaves the fresh claim alone.
        let n = store.requeue_stale_tasks(Duration::from_secs(300)).await.unwrap();
        assert_eq!(n, 0);

        // A zero lease reclaims it.
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let n = store.requeue_stale_tasks(Duration::from_millis(0)).await.unwrap();
        assert_eq!(n, 1);

        let fetched = store.get_job(&created.job.id).await.unwrap();
        assert_eq!(fetched.tasks[0].status, TaskStatus::Queued);
        assert_eq!(fetched.tasks[0].attempt, 1);
    }

    #[tokio::test]
    async fn set_task_result_resolves_job() {
        let store = open_store().await;
        let created = store.create_job(new_job("ping", "", &["a"])).await.unwrap();
        let claimed = store.claim_next_task("").await.unwrap().unwrap();

        let (task, job) = store.set_task_result(&claimed.id, true).await.unwrap();
        assert_eq!(task.status, TaskStatus::Finished);
        assert_eq!(job.status, JobStatus::Finished);
        assert_eq!(job.id, created.job.id);
    }

    #[tokio::test]
    async fn mixed_results_resolve_to_failed() {
        let store = open_store().await;
        let created = store
            .create_job(new_job("ping", "", &["acct-1", "acct-2", "acct-3"]))
            .await
            .unwrap();

        let outcomes = [true, false, true];
        for outcome in outcomes {
            let claimed = store.claim_next_task("").await.unwrap().unwrap();
            store.set_task_result(&claimed.id, outcome).await.unwrap();
        }

        let fetched = store.get_job(&created.job.id).await.unwrap();
        assert_eq!(fetched.job.status, JobStatus::Failed);
        let statuses: Vec<_> = fetched.tasks.iter().map(|t| t.status).collect();
        assert_eq!(
            statuses,
            vec![TaskStatus::Finished, TaskStatus::Failed, TaskStatus::Finished]
        );
    }

    #[tokio::test]
    async fn result_for_unknown_task_is_not_found() {
        let store = open_store().await;
        let err = store.set_task_result("deadbeef", true).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound("task")));
    }

    #[tokio::test]
    async fn cancel_takes_queued_and_running_tasks() {
        let store = open_store().await;
        let created = store.create_job(new_job("ping", "", &["a", "b"])).await.unwrap();
        store.claim_next_task("").await.unwrap().unwrap();

        store.cancel_job(&created.job.id).await.unwrap();
        let fetched = store.get_job(&created.job.id).await.unwrap();
        assert_eq!(fetched.job.status, JobStatus::Canceled);
        assert!(fetched.tasks.iter().all(|t| t.status == TaskStatus::Canceled));

        // Nothing left to claim.
        assert!(store.claim_next_task("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_leaves_terminal_tasks_alone() {
        let store = open_store().await;
        let created = store.create_job(new_job("ping", "", &["a", "b"])).await.unwrap();
        let claimed = store.claim_next_task("").await.unwrap().unwrap();
        store.set_task_result(&claimed.id, true).await.unwrap();

        store.cancel_job(&created.job.id).await.unwrap();
        let fetched = store.get_job(&created.job.id).await.unwrap();
        let statuses: Vec<_> = fetched.tasks.iter().map(|t| t.status).collect();
        assert_eq!(statuses, vec![TaskStatus::Finished, TaskStatus::Canceled]);
    }

    #[tokio::test]
    async fn cancel_is_sticky_and_idempotent() {
        let store = open_store().await;
        let created = store.create_job(new_job("ping", "", &["a", "b"])).await.unwrap();
        let claimed = store.claim_next_task("").await.unwrap().unwrap();

        store.cancel_job(&created.job.id).await.unwrap();
        store.cancel_job(&created.job.id).await.unwrap();

        // A late success still lands on the task, but the job stays canceled.
        let (task, job) = store.set_task_result(&claimed.id, true).await.unwrap();
        assert_eq!(task.status, TaskStatus::Finished);
        assert_eq!(job.status, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_not_found() {
        let store = open_store().await;
        let err = store.cancel_job("deadbeef").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound("job")));
    }

    #[tokio::test]
    async fn claim_returns_none_for_unknown_region() {
        let store = open_store().await;
        store.create_job(new_job("ping", "eu", &["a"])).await.unwrap();
        assert!(store.claim_next_task("us").await.unwrap().is_none());
    }
}
