//! Generation job journal.
//!
//! Every notebook generation is one row in `generation_jobs` moving through
//!
//! ```text
//! queued ──▶ running ──▶ completed | failed | error
//! ```
//!
//! with each transition timestamped. Phases are rows in
//! `generation_phases` nested under a job, each with its own
//! `running ──▶ <status>` transition and duration.
//!
//! Terminal jobs are immutable: finalizing or restarting one returns
//! [`JournalError::AlreadyFinished`]. Stale recovery relies on this so a
//! runner that wakes up after its job was expired cannot overwrite the
//! recovery record.

use std::sync::Arc;

use anyhow::Result;
use chrono::Duration;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::error::JournalError;
use crate::models::{format_ts, parse_ts, GenerationJob, GenerationPhase, JobStatus};
use crate::traits::{Clock, IdGenerator, SystemClock, UuidGenerator};

/// Error message written onto jobs expired by stale recovery.
pub const STALE_JOB_MESSAGE: &str = "stale_generation_job_recovered";

/// Lower bound on the staleness cutoff.
pub const MIN_STALE_MINUTES: i64 = 5;

const JOB_COLUMNS: &str = "id, actor_id, trigger_type, status, created_at, started_at, finished_at, \
    duration_ms, imported_sources, final_message, error_message";

const PHASE_COLUMNS: &str = "id, job_id, phase_key, phase_label, attempt, status, message, \
    error_detail, started_at, finished_at, duration_ms";

/// How a job ended.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub imported_sources: i64,
    pub duration_ms: i64,
    pub final_message: String,
    pub error_message: String,
}

/// How a phase ended.
#[derive(Debug, Clone, Default)]
pub struct PhaseOutcome {
    pub status: String,
    pub message: String,
    pub error_detail: String,
    pub duration_ms: Option<i64>,
}

/// A phase together with its parent job's summary, for timeline views.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub job_status: JobStatus,
    pub trigger_type: String,
    pub job_created_at: String,
    #[serde(flatten)]
    pub phase: GenerationPhase,
}

#[derive(Clone)]
pub struct Journal {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl Journal {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { pool, clock, ids }
    }

    fn now(&self) -> String {
        format_ts(self.clock.now())
    }

    // ============ Job transitions ============

    /// Insert a job in `initial` state. `started_at` is only stamped when
    /// the job is created already running.
    pub async fn create_job(
        &self,
        actor_id: &str,
        trigger_type: &str,
        initial: JobStatus,
    ) -> Result<String, JournalError> {
        let job_id = self.ids.new_id();
        let now = self.now();
        let started_at = (initial == JobStatus::Running).then(|| now.clone());
        let trigger = match trigger_type.trim() {
            "" => "manual_refresh",
            other => other,
        };

        sqlx::query(
            "INSERT INTO generation_jobs (id, actor_id, trigger_type, status, created_at, started_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&job_id)
        .bind(actor_id)
        .bind(trigger)
        .bind(initial.as_str())
        .bind(&now)
        .bind(started_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(job_id, actor_id, trigger, status = %initial, "generation job created");
        Ok(job_id)
    }

    /// `queued → running`. Keeps the first `started_at` if one exists.
    pub async fn mark_started(&self, job_id: &str) -> Result<(), JournalError> {
        let result = sqlx::query(
            "UPDATE generation_jobs \
             SET status = 'running', started_at = COALESCE(NULLIF(started_at, ''), ?) \
             WHERE id = ? AND status IN ('queued', 'running')",
        )
        .bind(self.now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(job_id).await);
        }
        Ok(())
    }

    /// Move a live job into a terminal state.
    pub async fn finalize(&self, job_id: &str, outcome: &JobOutcome) -> Result<(), JournalError> {
        let result = sqlx::query(
            "UPDATE generation_jobs \
             SET status = ?, finished_at = ?, duration_ms = ?, imported_sources = ?, \
                 final_message = ?, error_message = ? \
             WHERE id = ? AND status IN ('queued', 'running')",
        )
        .bind(outcome.status.as_str())
        .bind(self.now())
        .bind(outcome.duration_ms.max(0))
        .bind(outcome.imported_sources.max(0))
        .bind(&outcome.final_message)
        .bind(&outcome.error_message)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(job_id).await);
        }
        Ok(())
    }

    async fn transition_error(&self, job_id: &str) -> JournalError {
        let status = sqlx::query_scalar::<_, String>("SELECT status FROM generation_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await;
        match status {
            Ok(Some(status)) => JournalError::AlreadyFinished {
                job_id: job_id.to_string(),
                status,
            },
            Ok(None) => JournalError::UnknownJob(job_id.to_string()),
            Err(e) => JournalError::Storage(e),
        }
    }

    // ============ Phases ============

    pub async fn start_phase(
        &self,
        job_id: &str,
        actor_id: &str,
        phase_key: &str,
        phase_label: &str,
        attempt: i64,
        message: &str,
    ) -> Result<String, JournalError> {
        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM generation_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        if exists == 0 {
            return Err(JournalError::UnknownJob(job_id.to_string()));
        }

        let phase_id = self.ids.new_id();
        sqlx::query(
            "INSERT INTO generation_phases \
                (id, job_id, actor_id, phase_key, phase_label, attempt, status, message, started_at) \
             VALUES (?, ?, ?, ?, ?, ?, 'running', ?, ?)",
        )
        .bind(&phase_id)
        .bind(job_id)
        .bind(actor_id)
        .bind(phase_key)
        .bind(phase_label)
        .bind(attempt.max(1))
        .bind(message)
        .bind(self.now())
        .execute(&self.pool)
        .await?;
        Ok(phase_id)
    }

    pub async fn finish_phase(&self, phase_id: &str, outcome: &PhaseOutcome) -> Result<(), JournalError> {
        let result = sqlx::query(
            "UPDATE generation_phases \
             SET status = ?, message = ?, error_detail = ?, finished_at = ?, duration_ms = ? \
             WHERE id = ?",
        )
        .bind(&outcome.status)
        .bind(&outcome.message)
        .bind(&outcome.error_detail)
        .bind(self.now())
        .bind(outcome.duration_ms.map(|ms| ms.max(0)))
        .bind(phase_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(JournalError::UnknownPhase(phase_id.to_string()));
        }
        Ok(())
    }

    // ============ Reads ============

    /// Newest job still queued or running for the actor.
    pub async fn active_job(&self, actor_id: &str) -> Result<Option<GenerationJob>, JournalError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs \
             WHERE actor_id = ? AND status IN ('queued', 'running') \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(actor_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(job_from_row))
    }

    /// One job with its phases in start order.
    pub async fn job_detail(
        &self,
        actor_id: &str,
        job_id: &str,
    ) -> Result<Option<GenerationJob>, JournalError> {
        let Some(row) = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE actor_id = ? AND id = ?"
        ))
        .bind(actor_id)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let mut job = job_from_row(&row);
        let phases = sqlx::query(&format!(
            "SELECT {PHASE_COLUMNS} FROM generation_phases \
             WHERE actor_id = ? AND job_id = ? ORDER BY started_at ASC, id ASC"
        ))
        .bind(actor_id)
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        job.phases = phases.iter().map(phase_from_row).collect();
        Ok(Some(job))
    }

    /// Phases of the actor's `job_limit` newest jobs, newest first, capped
    /// at `phase_limit` entries.
    pub async fn recent_timeline(
        &self,
        actor_id: &str,
        job_limit: i64,
        phase_limit: i64,
    ) -> Result<Vec<TimelineEntry>, JournalError> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.job_id, p.phase_key, p.phase_label, p.attempt, p.status, p.message,
                   p.error_detail, p.started_at, p.finished_at, p.duration_ms,
                   j.status AS job_status, j.trigger_type, j.created_at AS job_created_at
            FROM generation_phases p
            JOIN generation_jobs j ON j.id = p.job_id
            WHERE p.actor_id = ?
              AND p.job_id IN (
                  SELECT id FROM generation_jobs
                  WHERE actor_id = ?
                  ORDER BY created_at DESC
                  LIMIT ?
              )
            ORDER BY p.started_at DESC, p.id DESC
            LIMIT ?
            "#,
        )
        .bind(actor_id)
        .bind(actor_id)
        .bind(job_limit.clamp(1, 50))
        .bind(phase_limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| TimelineEntry {
                job_status: status_of(row.get("job_status")),
                trigger_type: row.get("trigger_type"),
                job_created_at: row.get("job_created_at"),
                phase: phase_from_row(row),
            })
            .collect())
    }

    // ============ Recovery ============

    /// Force the actor's queued/running jobs older than the cutoff to
    /// `error`. Jobs whose reference timestamp cannot be parsed are left
    /// alone. Returns how many were expired.
    pub async fn expire_stale_jobs(
        &self,
        actor_id: &str,
        stale_after_minutes: i64,
    ) -> Result<usize, JournalError> {
        let now = self.clock.now();
        let cutoff = now - Duration::minutes(stale_after_minutes.max(MIN_STALE_MINUTES));

        let rows = sqlx::query(
            "SELECT id, created_at, started_at FROM generation_jobs \
             WHERE actor_id = ? AND status IN ('queued', 'running')",
        )
        .bind(actor_id)
        .fetch_all(&self.pool)
        .await?;

        let expired: Vec<String> = rows
            .iter()
            .filter_map(|row| {
                let started: Option<String> = row.get("started_at");
                let created: String = row.get("created_at");
                let reference = started.filter(|s| !s.trim().is_empty()).unwrap_or(created);
                let reference = parse_ts(&reference)?;
                (reference <= cutoff).then(|| row.get::<String, _>("id"))
            })
            .collect();

        if expired.is_empty() {
            return Ok(0);
        }

        let now_text = format_ts(now);
        let mut tx = db::begin_write(&self.pool).await?;
        for job_id in &expired {
            sqlx::query(
                r#"
                UPDATE generation_jobs
                SET status = 'error',
                    finished_at = ?,
                    duration_ms = COALESCE(duration_ms, 0),
                    error_message = CASE
                        WHEN TRIM(COALESCE(error_message, '')) = '' THEN ?
                        ELSE error_message
                    END
                WHERE id = ?
                "#,
            )
            .bind(&now_text)
            .bind(STALE_JOB_MESSAGE)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::info!(actor_id, expired = expired.len(), "expired stale generation jobs");
        Ok(expired.len())
    }
}

fn status_of(raw: String) -> JobStatus {
    JobStatus::parse(&raw).unwrap_or(JobStatus::Error)
}

fn job_from_row(row: &SqliteRow) -> GenerationJob {
    GenerationJob {
        job_id: row.get("id"),
        actor_id: row.get("actor_id"),
        trigger_type: row.get("trigger_type"),
        status: status_of(row.get("status")),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        duration_ms: row.get("duration_ms"),
        imported_sources: row.get("imported_sources"),
        final_message: row.get("final_message"),
        error_message: row.get("error_message"),
        phases: Vec::new(),
    }
}

fn phase_from_row(row: &SqliteRow) -> GenerationPhase {
    GenerationPhase {
        phase_id: row.get("id"),
        job_id: row.get("job_id"),
        phase_key: row.get("phase_key"),
        phase_label: row.get("phase_label"),
        attempt: row.get("attempt"),
        status: row.get("status"),
        message: row.get("message"),
        error_detail: row.get("error_detail"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        duration_ms: row.get("duration_ms"),
    }
}

/// `notebook jobs`: the active job and recent phases, or one job in detail.
pub async fn run_jobs(config: &Config, actor_id: &str, job_id: Option<&str>) -> Result<()> {
    let pool = db::connect(config).await?;
    let journal = Journal::new(pool.clone(), Arc::new(SystemClock), Arc::new(UuidGenerator));

    match job_id {
        Some(job_id) => match journal.job_detail(actor_id, job_id).await? {
            Some(job) => print_job(&job),
            None => println!("No job {} for actor {}.", job_id, actor_id),
        },
        None => {
            match journal.active_job(actor_id).await? {
                Some(job) => print_job(&job),
                None => println!("No active job."),
            }
            let timeline = journal.recent_timeline(actor_id, 5, 40).await?;
            if !timeline.is_empty() {
                println!();
                println!("Recent phases:");
            }
            for entry in &timeline {
                println!(
                    "  {}  {:<16} {:<10} attempt {}  ({} job, {})",
                    entry.phase.started_at,
                    entry.phase.phase_key,
                    entry.phase.status,
                    entry.phase.attempt,
                    entry.job_status,
                    entry.trigger_type
                );
            }
        }
    }

    pool.close().await;
    Ok(())
}

fn print_job(job: &GenerationJob) {
    println!("job {}  [{}]  trigger: {}", job.job_id, job.status, job.trigger_type);
    println!("  created:  {}", job.created_at);
    if let Some(started) = &job.started_at {
        println!("  started:  {}", started);
    }
    if let Some(finished) = &job.finished_at {
        println!(
            "  finished: {} ({} ms)",
            finished,
            job.duration_ms.unwrap_or_default()
        );
    }
    if !job.final_message.is_empty() {
        println!("  {}", job.final_message);
    }
    if !job.error_message.is_empty() {
        println!("  error: {}", job.error_message);
    }
    for phase in &job.phases {
        println!(
            "    - {} ({}) {}{}",
            phase.phase_label,
            phase.status,
            phase.message,
            phase
                .duration_ms
                .map(|ms| format!(" [{} ms]", ms))
                .unwrap_or_default()
        );
    }
}
