//! Observability events.
//!
//! Each event is one structured `tracing` record on the
//! `intel_notebook::events` target, carrying the event name and its JSON
//! payload. Subscribers decide where they go.

use serde::Serialize;

use crate::models::RunStatus;

pub const TARGET: &str = "intel_notebook::events";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    RequestCompleted {
        method: String,
        path: String,
        status: u16,
        duration_ms: u64,
    },
    AutoRefreshRun {
        queued_count: usize,
        limit: usize,
    },
    AutoRefreshActorQueued {
        actor_id: String,
        job_id: String,
    },
    CollectionSyncFinished {
        actor_id: String,
        run_id: String,
        status: RunStatus,
        objects_received: i64,
        imported: i64,
        skipped: i64,
    },
    StaleGenerationRecovered {
        actor_id: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::RequestCompleted { .. } => "request_completed",
            Event::AutoRefreshRun { .. } => "auto_refresh_run",
            Event::AutoRefreshActorQueued { .. } => "auto_refresh_actor_queued",
            Event::CollectionSyncFinished { .. } => "collection_sync_finished",
            Event::StaleGenerationRecovered { .. } => "stale_generation_recovered",
        }
    }
}

pub fn emit(event: &Event) {
    let payload = serde_json::to_string(event).unwrap_or_default();
    tracing::info!(target: TARGET, event = event.name(), payload = %payload);
}
