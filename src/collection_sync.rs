//! TAXII 2.1 collection sync.
//!
//! One call to [`CollectionSync::sync_collection`] is one run:
//!
//! ```text
//! insert run (running) ──▶ GET <collection>/objects/?added_after=..
//!                              │
//!               200 ──▶ normalize ──▶ import through SourceStore
//!                              │                    │
//!         anything else ──▶ failed ◀── error ───────┘
//!                              │
//!                      completed / failed (row updated once)
//! ```
//!
//! There is a single fetch attempt per run. A failed run is retried by the
//! next scheduled refresh, never inline.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::error::SyncError;
use crate::events::{self, Event};
use crate::evidence::clamp_limit;
use crate::fingerprint::truncate_chars;
use crate::ingest::SourceStore;
use crate::models::{format_ts, Bundle, ImportCounts, RunStatus, SyncRun, SyncSummary};
use crate::stix::StixBundleImporter;
use crate::traits::{
    BundleImporter, CollectionClient, CollectionRequest, HttpCollectionClient, IdGenerator,
    SystemClock, UuidGenerator,
};

const ERROR_DETAIL_CHARS: usize = 500;

/// `<collection>/objects/`, tolerating a trailing slash on the input.
pub fn objects_url(collection_url: &str) -> String {
    format!("{}/objects/", collection_url.trim().trim_end_matches('/'))
}

/// `now - max(1, lookback_hours)` as an RFC 3339 UTC string.
pub fn added_after(now: DateTime<Utc>, lookback_hours: i64) -> String {
    format_ts(now - Duration::hours(lookback_hours.max(1)))
}

/// Coerce any upstream payload into a bundle.
///
/// An object with an `objects` array keeps its id and spec version; a bare
/// array is wrapped; anything else becomes an empty bundle.
pub fn normalize_bundle(payload: Value, ids: &dyn IdGenerator) -> Bundle {
    let fresh_id = || format!("bundle--{}", ids.new_id());
    match payload {
        Value::Object(mut map) => match map.remove("objects") {
            Some(Value::Array(objects)) => Bundle {
                kind: "bundle".to_string(),
                id: map
                    .get("id")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(fresh_id),
                spec_version: map
                    .get("spec_version")
                    .and_then(Value::as_str)
                    .filter(|v| !v.is_empty())
                    .unwrap_or("2.1")
                    .to_string(),
                objects,
            },
            _ => empty_bundle(fresh_id()),
        },
        Value::Array(objects) => Bundle {
            kind: "bundle".to_string(),
            id: fresh_id(),
            spec_version: "2.1".to_string(),
            objects,
        },
        _ => empty_bundle(fresh_id()),
    }
}

fn empty_bundle(id: String) -> Bundle {
    Bundle {
        kind: "bundle".to_string(),
        id,
        spec_version: "2.1".to_string(),
        objects: Vec::new(),
    }
}

pub struct CollectionSync {
    store: SourceStore,
    client: Arc<dyn CollectionClient>,
    importer: Arc<dyn BundleImporter>,
}

impl CollectionSync {
    pub fn new(
        store: SourceStore,
        client: Arc<dyn CollectionClient>,
        importer: Arc<dyn BundleImporter>,
    ) -> Self {
        Self {
            store,
            client,
            importer,
        }
    }

    pub fn store(&self) -> &SourceStore {
        &self.store
    }

    /// Fetch, normalize, and import one collection window for an actor.
    ///
    /// Fetch and import failures are recorded on the run row and reported
    /// in the summary; only storage errors on the run row itself surface
    /// as `Err`.
    pub async fn sync_collection(
        &self,
        actor_id: &str,
        collection_url: &str,
        bearer_token: Option<&str>,
        lookback_hours: i64,
    ) -> Result<SyncSummary> {
        let collection_url = collection_url.trim();
        let now = self.store.clock().now();
        let window_start = added_after(now, lookback_hours);

        if collection_url.is_empty() {
            return Ok(SyncSummary {
                ok: false,
                actor_id: actor_id.to_string(),
                collection_url: String::new(),
                run_id: String::new(),
                added_after: window_start,
                objects_received: 0,
                imported_iocs: 0,
                imported_notes: 0,
                skipped: 0,
                error: Some(SyncError::MissingUrl.to_string()),
            });
        }

        let pool = self.store.pool();
        let run_id = self.store.ids().new_id();
        sqlx::query(
            "INSERT INTO collection_sync_runs (id, actor_id, collection_url, added_after, started_at, status) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&run_id)
        .bind(actor_id)
        .bind(collection_url)
        .bind(&window_start)
        .bind(format_ts(now))
        .bind(RunStatus::Running.as_str())
        .execute(pool)
        .await?;

        let request = CollectionRequest {
            objects_url: objects_url(collection_url),
            bearer_token: bearer_token.map(str::to_string),
            added_after: window_start.clone(),
        };

        let outcome = self.fetch_and_import(actor_id, &request).await;
        let finished_at = format_ts(self.store.clock().now());

        let summary = match outcome {
            Ok((objects_received, counts)) => {
                sqlx::query(
                    "UPDATE collection_sync_runs SET finished_at = ?, status = ?, objects_received = ?, \
                        imported_iocs = ?, imported_notes = ?, skipped = ? \
                     WHERE id = ?",
                )
                .bind(&finished_at)
                .bind(RunStatus::Completed.as_str())
                .bind(objects_received)
                .bind(counts.imported_iocs)
                .bind(counts.imported_notes)
                .bind(counts.skipped)
                .bind(&run_id)
                .execute(pool)
                .await?;

                info!(
                    actor_id,
                    run_id = %run_id,
                    objects_received,
                    imported_iocs = counts.imported_iocs,
                    imported_notes = counts.imported_notes,
                    skipped = counts.skipped,
                    "collection sync completed"
                );
                SyncSummary {
                    ok: true,
                    actor_id: actor_id.to_string(),
                    collection_url: collection_url.to_string(),
                    run_id: run_id.clone(),
                    added_after: window_start,
                    objects_received,
                    imported_iocs: counts.imported_iocs,
                    imported_notes: counts.imported_notes,
                    skipped: counts.skipped,
                    error: None,
                }
            }
            Err(err) => {
                let detail = truncate_chars(&format!("{err:#}"), ERROR_DETAIL_CHARS);
                sqlx::query(
                    "UPDATE collection_sync_runs SET finished_at = ?, status = ?, error_detail = ? \
                     WHERE id = ?",
                )
                .bind(&finished_at)
                .bind(RunStatus::Failed.as_str())
                .bind(&detail)
                .bind(&run_id)
                .execute(pool)
                .await?;

                let transient = err
                    .downcast_ref::<SyncError>()
                    .is_some_and(SyncError::is_transient);
                warn!(actor_id, run_id = %run_id, transient, error = %detail, "collection sync failed");
                SyncSummary {
                    ok: false,
                    actor_id: actor_id.to_string(),
                    collection_url: collection_url.to_string(),
                    run_id: run_id.clone(),
                    added_after: window_start,
                    objects_received: 0,
                    imported_iocs: 0,
                    imported_notes: 0,
                    skipped: 0,
                    error: Some(detail),
                }
            }
        };

        events::emit(&Event::CollectionSyncFinished {
            actor_id: actor_id.to_string(),
            run_id,
            status: if summary.ok {
                RunStatus::Completed
            } else {
                RunStatus::Failed
            },
            objects_received: summary.objects_received,
            imported: summary.imported_iocs + summary.imported_notes,
            skipped: summary.skipped,
        });
        Ok(summary)
    }

    async fn fetch_and_import(
        &self,
        actor_id: &str,
        request: &CollectionRequest,
    ) -> Result<(i64, ImportCounts)> {
        let response = self.client.fetch_objects(request).await?;
        if response.status != 200 {
            return Err(SyncError::Status(response.status).into());
        }
        let payload: Value = serde_json::from_str(&response.body).map_err(SyncError::from)?;
        let bundle = normalize_bundle(payload, &**self.store.ids());
        let counts = self
            .importer
            .import_bundle(&self.store, actor_id, &bundle)
            .await?;
        Ok((bundle.objects.len() as i64, counts))
    }
}

/// Sync history for an actor, newest first.
pub async fn list_sync_runs(pool: &SqlitePool, actor_id: &str, limit: i64) -> Result<Vec<SyncRun>> {
    let rows = sqlx::query(
        "SELECT id, actor_id, collection_url, added_after, started_at, finished_at, status, \
            objects_received, imported_iocs, imported_notes, skipped, error_detail \
         FROM collection_sync_runs \
         WHERE actor_id = ? \
         ORDER BY started_at DESC, id DESC \
         LIMIT ?",
    )
    .bind(actor_id)
    .bind(clamp_limit(Some(limit), limit))
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let status: String = row.get("status");
            SyncRun {
                run_id: row.get("id"),
                actor_id: row.get("actor_id"),
                collection_url: row.get("collection_url"),
                added_after: row.get("added_after"),
                started_at: row.get("started_at"),
                finished_at: row.get("finished_at"),
                status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
                objects_received: row.get("objects_received"),
                imported_iocs: row.get("imported_iocs"),
                imported_notes: row.get("imported_notes"),
                skipped: row.get("skipped"),
                error_detail: row.get("error_detail"),
            }
        })
        .collect())
}

/// Production wiring: system clock, v4 ids, reqwest client, STIX importer.
pub fn build_collection_sync(config: &Config, pool: SqlitePool) -> Result<CollectionSync> {
    let store = SourceStore::new(
        pool,
        config.ingest.clone(),
        Arc::new(SystemClock),
        Arc::new(UuidGenerator),
    );
    let client = HttpCollectionClient::new(std::time::Duration::from_secs(config.sync.timeout_secs))?;
    Ok(CollectionSync::new(
        store,
        Arc::new(client),
        Arc::new(StixBundleImporter),
    ))
}

/// `notebook sync`
pub async fn run_sync(
    config: &Config,
    actor_id: &str,
    collection_url: &str,
    token: Option<&str>,
    lookback_hours: Option<i64>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let sync = build_collection_sync(config, pool.clone())?;
    let summary = sync
        .sync_collection(
            actor_id,
            collection_url,
            token.or(config.sync.bearer_token.as_deref()),
            lookback_hours.unwrap_or(config.sync.default_lookback_hours),
        )
        .await?;

    println!("sync {} ({})", summary.collection_url, actor_id);
    println!("  run: {}", summary.run_id);
    println!("  added after: {}", summary.added_after);
    println!("  objects received: {}", summary.objects_received);
    println!("  imported iocs: {}", summary.imported_iocs);
    println!("  imported notes: {}", summary.imported_notes);
    println!("  skipped: {}", summary.skipped);
    if let Some(error) = &summary.error {
        println!("  error: {}", error);
    }

    pool.close().await;
    Ok(())
}

/// `notebook runs`
pub async fn run_list_runs(config: &Config, actor_id: &str, limit: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    let runs = list_sync_runs(&pool, actor_id, limit).await?;
    if runs.is_empty() {
        println!("No sync runs.");
    }
    for run in &runs {
        println!(
            "{}  {:<9}  {}  objects={} iocs={} notes={} skipped={}",
            run.started_at,
            run.status,
            run.collection_url,
            run.objects_received,
            run.imported_iocs,
            run.imported_notes,
            run.skipped
        );
        if !run.error_detail.is_empty() {
            println!("    error: {}", run.error_detail);
        }
    }
    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    struct FixedIds;

    impl IdGenerator for FixedIds {
        fn new_id(&self) -> String {
            "fixed".to_string()
        }
    }

    #[test]
    fn test_objects_url() {
        assert_eq!(objects_url("https://taxii.example/api/c1/"), "https://taxii.example/api/c1/objects/");
        assert_eq!(objects_url(" https://taxii.example/api/c1 "), "https://taxii.example/api/c1/objects/");
    }

    #[test]
    fn test_added_after_has_one_hour_floor() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(added_after(now, 24), "2024-04-30T12:00:00.000000Z");
        assert_eq!(added_after(now, 0), "2024-05-01T11:00:00.000000Z");
        assert_eq!(added_after(now, -3), "2024-05-01T11:00:00.000000Z");
    }

    #[test]
    fn test_normalize_envelope_keeps_identity() {
        let bundle = normalize_bundle(
            json!({"id": "bundle--abc", "spec_version": "2.0", "objects": [{"type": "note"}]}),
            &FixedIds,
        );
        assert_eq!(bundle.id, "bundle--abc");
        assert_eq!(bundle.spec_version, "2.0");
        assert_eq!(bundle.objects.len(), 1);
    }

    #[test]
    fn test_normalize_bare_array_and_garbage() {
        let bundle = normalize_bundle(json!([{"type": "indicator"}, 7]), &FixedIds);
        assert_eq!(bundle.id, "bundle--fixed");
        assert_eq!(bundle.spec_version, "2.1");
        assert_eq!(bundle.objects.len(), 2);

        for payload in [json!("nope"), json!({"objects": "x"}), json!(null), json!({"more": 1})] {
            let bundle = normalize_bundle(payload, &FixedIds);
            assert!(bundle.objects.is_empty());
            assert_eq!(bundle.kind, "bundle");
        }
    }
}
