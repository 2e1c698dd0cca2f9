use crate::error::{ForgeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(ForgeError::Validation(format!("Unknown status: {other}"))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub title: String,
    pub source_path: String,
    pub output_path: Option<String>,
    pub status: JobStatus,
    pub progress: f64,
    pub arm_job_id: Option<String>,
    pub error: Option<String>,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub video_type: Option<String>,
    pub total_tracks: i64,
    pub main_feature_file: Option<String>,
}

const JOB_COLUMNS: &str = "id, title, source_path, output_path, status, \
     COALESCE(progress, 0.0) as progress, arm_job_id, error, \
     COALESCE(retry_count, 0) as retry_count, created_at, started_at, \
     completed_at, video_type, COALESCE(total_tracks, 0) as total_tracks, \
     main_feature_file";

/// Columns added after the initial schema shipped; applied by name-check so
/// an old database gains them without dropping anything.
const ADDITIVE_COLUMNS: &[(&str, &str)] = &[
    ("arm_job_id", "TEXT"),
    ("error", "TEXT"),
    ("retry_count", "INTEGER DEFAULT 0"),
    ("video_type", "TEXT"),
    ("total_tracks", "INTEGER DEFAULT 0"),
    ("main_feature_file", "TEXT"),
];

pub struct Db {
    pool: SqlitePool,
}

impl Db {
    pub async fn open(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);

        // A single connection serializes all writers, which is the store's
        // contract: only the worker loop advances jobs past PENDING.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// In-memory store for tests.
    pub async fn open_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS transcode_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                source_path TEXT NOT NULL,
                output_path TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                progress REAL DEFAULT 0.0,
                arm_job_id TEXT,
                error TEXT,
                retry_count INTEGER DEFAULT 0,
                created_at DATETIME NOT NULL,
                started_at DATETIME,
                completed_at DATETIME,
                video_type TEXT,
                total_tracks INTEGER DEFAULT 0,
                main_feature_file TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        // Additive column migration, name-checked rather than blind ALTER.
        let rows = sqlx::query("PRAGMA table_info(transcode_jobs)")
            .fetch_all(&self.pool)
            .await?;
        let existing: Vec<String> = rows
            .iter()
            .map(|row| row.get::<String, _>("name"))
            .collect();

        for (name, decl) in ADDITIVE_COLUMNS {
            if !existing.iter().any(|c| c == name) {
                tracing::info!("Adding column {name} to transcode_jobs");
                sqlx::query(&format!(
                    "ALTER TABLE transcode_jobs ADD COLUMN {name} {decl}"
                ))
                .execute(&self.pool)
                .await?;
            }
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS config_overrides (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at DATETIME NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn insert_job(
        &self,
        title: &str,
        source_path: &str,
        arm_job_id: Option<&str>,
    ) -> Result<Job> {
        let result = sqlx::query(
            "INSERT INTO transcode_jobs (title, source_path, arm_job_id, status, progress, created_at)
             VALUES (?, ?, ?, 'pending', 0.0, ?)",
        )
        .bind(title)
        .bind(source_path)
        .bind(arm_job_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.get_job(id)
            .await?
            .ok_or_else(|| ForgeError::Unknown(format!("Inserted job {id} vanished")))
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM transcode_jobs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// Most recent first. Returns the page plus the unpaged total.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Job>, i64)> {
        let (jobs, total) = match status {
            Some(status) => {
                let jobs = sqlx::query_as::<_, Job>(&format!(
                    "SELECT {JOB_COLUMNS} FROM transcode_jobs WHERE status = ?
                     ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
                ))
                .bind(status)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                let total: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM transcode_jobs WHERE status = ?")
                        .bind(status)
                        .fetch_one(&self.pool)
                        .await?;
                (jobs, total)
            }
            None => {
                let jobs = sqlx::query_as::<_, Job>(&format!(
                    "SELECT {JOB_COLUMNS} FROM transcode_jobs
                     ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
                ))
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transcode_jobs")
                    .fetch_one(&self.pool)
                    .await?;
                (jobs, total)
            }
        };
        Ok((jobs, total))
    }

    /// Per-status counts with every status present (zero-filled).
    pub async fn count_jobs_by_status(&self) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) as count FROM transcode_jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts: HashMap<String, i64> = JobStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            counts.insert(status, count);
        }
        Ok(counts)
    }

    pub async fn delete_job(&self, id: i64) -> Result<()> {
        let job = self
            .get_job(id)
            .await?
            .ok_or_else(|| ForgeError::NotFound(format!("Job {id} not found")))?;
        if job.status == JobStatus::Processing {
            return Err(ForgeError::Precondition(
                "Cannot delete job in progress".into(),
            ));
        }
        sqlx::query("DELETE FROM transcode_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Jobs the worker must pick up on startup, oldest first.
    pub async fn select_non_terminal_jobs_ordered_by_created_at(&self) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM transcode_jobs
             WHERE status IN ('pending', 'processing')
             ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// PENDING -> PROCESSING edge; sets started_at. Returns false when the
    /// job is gone or not pending, in which case nothing was touched.
    pub async fn claim_job(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE transcode_jobs SET status = 'processing', started_at = ?, error = NULL
             WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn update_progress(&self, id: i64, progress: f64) -> Result<()> {
        sqlx::query("UPDATE transcode_jobs SET progress = ? WHERE id = ?")
            .bind(progress.clamp(0.0, 100.0))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_total_tracks(&self, id: i64, total_tracks: i64) -> Result<()> {
        sqlx::query("UPDATE transcode_jobs SET total_tracks = ? WHERE id = ?")
            .bind(total_tracks)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_main_feature_file(&self, id: i64, file_name: &str) -> Result<()> {
        sqlx::query("UPDATE transcode_jobs SET main_feature_file = ? WHERE id = ?")
            .bind(file_name)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_video_type(&self, id: i64, video_type: &str) -> Result<()> {
        sqlx::query("UPDATE transcode_jobs SET video_type = ? WHERE id = ?")
            .bind(video_type)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_output_path(&self, id: i64, output_path: &str) -> Result<()> {
        sqlx::query("UPDATE transcode_jobs SET output_path = ? WHERE id = ?")
            .bind(output_path)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_completed(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE transcode_jobs
             SET status = 'completed', progress = 100.0, completed_at = ?, error = NULL
             WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE transcode_jobs SET status = 'failed', completed_at = ?, error = ?
             WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Administrative: mark an abandoned non-terminal job cancelled.
    pub async fn mark_cancelled(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE transcode_jobs SET status = 'cancelled', completed_at = ?
             WHERE id = ? AND status IN ('pending', 'processing')",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// FAILED -> PENDING for a retry: clears error and progress, bumps the
    /// retry counter, resets the attempt timestamps.
    pub async fn reset_for_retry(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE transcode_jobs
             SET status = 'pending', error = NULL, progress = 0.0,
                 retry_count = retry_count + 1, started_at = NULL, completed_at = NULL
             WHERE id = ? AND status = 'failed'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Startup recovery: a job left PROCESSING by a crash goes back to
    /// PENDING so the worker re-runs it from the beginning.
    pub async fn demote_processing(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE transcode_jobs SET status = 'pending', started_at = NULL
             WHERE id = ? AND status = 'processing'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_all_overrides(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT key, value FROM config_overrides ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("key"), row.get("value")))
            .collect())
    }

    pub async fn upsert_override(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO config_overrides (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                 updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
