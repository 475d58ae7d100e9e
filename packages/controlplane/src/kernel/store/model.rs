//! Job and task models.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::time::rfc3339_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Finished,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Queued,
    Running,
    Finished,
    Failed,
    Canceled,
}

/// A batch of related tasks submitted as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub action: String,
    /// Region hint; empty means "any region".
    pub region: String,
    pub targets: Vec<String>,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    pub status: JobStatus,
    #[serde(with = "rfc3339_millis")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "rfc3339_millis")]
    pub updated_at: DateTime<Utc>,
}

/// A single unit of work for one target within a job; the dispatch atom.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub job_id: String,
    pub target: String,
    pub action: String,
    #[serde(default)]
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub status: TaskStatus,
    pub attempt: i64,
    #[serde(with = "rfc3339_millis")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "rfc3339_millis")]
    pub updated_at: DateTime<Utc>,
}

/// Inputs for job creation.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub action: String,
    pub region: String,
    pub targets: Vec<String>,
    pub payload: Option<serde_json::Value>,
    pub meta: HashMap<String, String>,
}

/// A job together with its tasks in creation order.
#[derive(Debug, Clone, Serialize)]
pub struct JobDetail {
    pub job: Job,
    pub tasks: Vec<Task>,
}

/// Per-status task counts for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub queued: i64,
    pub running: i64,
    pub finished: i64,
    pub failed: i64,
    pub canceled: i64,
}

impl StatusCounts {
    pub fn add(&mut self, status: TaskStatus, count: i64) {
        match status {
            TaskStatus::Queued => self.queued += count,
            TaskStatus::Running => self.running += count,
            TaskStatus::Finished => self.finished += count,
            TaskStatus::Failed => self.failed += count,
            TaskStatus::Canceled => self.canceled += count,
        }
    }
}

/// Derive a job's status from its task statuses.
///
/// The caller is responsible for the sticky-cancel rule: a `Canceled` job is
/// never recomputed. A job is failed only once everything terminal has
/// resolved and at least one failure occurred; successes dominate canceled
/// tasks.
pub fn recompute_job_status(counts: StatusCounts) -> JobStatus {
    if counts.running > 0 {
        return JobStatus::Running;
    }
    if counts.queued > 0 {
        if counts.finished > 0 || counts.failed > 0 || counts.canceled > 0 {
            return JobStatus::Running;
        }
        return JobStatus::Queued;
    }
    if counts.failed > 0 {
        return JobStatus::Failed;
    }
    if counts.canceled > 0 && counts.finished == 0 {
        return JobStatus::Canceled;
    }
    JobStatus::Finished
}
