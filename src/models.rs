//! Core data models.
//!
//! These types represent the sources, ranked evidence, sync runs, and
//! generation jobs that flow through ingestion and the job journal.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============ Timestamps ============

/// Fixed-width RFC 3339 UTC with microseconds, so lexical order is
/// chronological order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Lenient timestamp parsing: RFC 3339, RFC 2822 (feed `pubDate`), or a
/// naive `YYYY-MM-DD[ HH:MM:SS]` taken as UTC. Returns `None` when unparsable.
pub fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
    let text = value.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

// ============ Sources ============

/// A stored source row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub id: String,
    pub actor_id: String,
    pub source_name: String,
    pub url: String,
    pub published_at: Option<String>,
    pub retrieved_at: String,
    pub ingested_at: String,
    pub body: String,
    pub source_fingerprint: Option<String>,
    pub title: Option<String>,
    pub headline: Option<String>,
    pub og_title: Option<String>,
    pub html_title: Option<String>,
    pub publisher: Option<String>,
    pub site_name: Option<String>,
    pub source_type: Option<String>,
    pub source_tier: Option<String>,
    pub confidence_weight: Option<i64>,
}

/// An incoming document to fold into an actor's sources.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceUpsert {
    #[serde(default)]
    pub actor_id: String,
    pub url: String,
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub body: String,
    /// Provenance text prepended to the body ("why this source was pulled").
    #[serde(default)]
    pub trigger_excerpt: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub headline: Option<String>,
    #[serde(default)]
    pub og_title: Option<String>,
    #[serde(default)]
    pub html_title: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub site_name: Option<String>,
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub source_tier: Option<String>,
    #[serde(default)]
    pub confidence_weight: Option<i64>,
    /// Replace the canonical row's content instead of backfilling blanks.
    #[serde(default)]
    pub refresh_existing_content: bool,
}

impl SourceUpsert {
    pub fn new(actor_id: impl Into<String>, url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            url: url.into(),
            body: body.into(),
            ..Default::default()
        }
    }
}

// ============ Evidence ============

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub relevance: f64,
    pub trust: f64,
    pub recency: f64,
    pub novelty: f64,
    #[serde(rename = "final")]
    pub final_score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchInfo {
    #[serde(rename = "type")]
    pub match_type: String,
    pub matched_term: String,
    pub confidence: f64,
}

/// One ranked source, annotated for display.
#[derive(Debug, Clone, Serialize)]
pub struct RankedEvidence {
    pub source_id: String,
    pub source_name: String,
    pub url: String,
    pub domain: String,
    pub published_at: Option<String>,
    pub ingested_at: String,
    pub source_type: Option<String>,
    pub source_tier: Option<String>,
    pub confidence_weight: i64,
    pub scores: ScoreBreakdown,
    #[serde(rename = "match")]
    pub match_info: MatchInfo,
    pub entity_count: i64,
    pub corroboration_sources: i64,
    pub features: serde_json::Map<String, serde_json::Value>,
}

// ============ Collection sync ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of `collection_sync_runs`.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRun {
    pub run_id: String,
    pub actor_id: String,
    pub collection_url: String,
    pub added_after: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: RunStatus,
    pub objects_received: i64,
    pub imported_iocs: i64,
    pub imported_notes: i64,
    pub skipped: i64,
    pub error_detail: String,
}

/// Result of one `sync_collection` call.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub ok: bool,
    pub actor_id: String,
    pub collection_url: String,
    pub run_id: String,
    pub added_after: String,
    pub objects_received: i64,
    pub imported_iocs: i64,
    pub imported_notes: i64,
    pub skipped: i64,
    pub error: Option<String>,
}

/// A normalized STIX bundle, whatever shape the collection returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub spec_version: String,
    pub objects: Vec<serde_json::Value>,
}

/// Counts reported by a bundle importer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportCounts {
    pub imported_iocs: i64,
    pub imported_notes: i64,
    pub skipped: i64,
}

// ============ Generation journal ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "error" => Some(JobStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Error)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationJob {
    pub job_id: String,
    pub actor_id: String,
    pub trigger_type: String,
    pub status: JobStatus,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub imported_sources: i64,
    pub final_message: String,
    pub error_message: String,
    pub phases: Vec<GenerationPhase>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationPhase {
    pub phase_id: String,
    pub job_id: String,
    pub phase_key: String,
    pub phase_label: String,
    pub attempt: i64,
    pub status: String,
    pub message: String,
    pub error_detail: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub duration_ms: Option<i64>,
}

// ============ Actors ============

#[derive(Debug, Clone, Serialize)]
pub struct ActorProfile {
    pub id: String,
    pub display_name: String,
    pub is_tracked: bool,
    pub notebook_status: String,
    pub notebook_message: String,
    pub notebook_updated_at: Option<String>,
    pub auto_refresh_last_run_at: Option<String>,
    pub auto_refresh_last_status: Option<String>,
    pub last_refresh_duration_ms: Option<i64>,
    pub last_refresh_sources_processed: Option<i64>,
    pub created_at: String,
}
