//! Schema migrations.
//!
//! All statements are `IF NOT EXISTS`, so `notebook init` can run any
//! number of times. The scoring tables are optional: a deployment that
//! has never provisioned them runs the evidence ranking in degraded mode.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const CORE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS actor_profiles (
        id TEXT PRIMARY KEY,
        display_name TEXT NOT NULL,
        is_tracked INTEGER NOT NULL DEFAULT 1,
        notebook_status TEXT NOT NULL DEFAULT 'idle',
        notebook_message TEXT NOT NULL DEFAULT '',
        notebook_updated_at TEXT,
        auto_refresh_last_run_at TEXT,
        auto_refresh_last_status TEXT,
        last_refresh_duration_ms INTEGER,
        last_refresh_sources_processed INTEGER,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sources (
        id TEXT PRIMARY KEY,
        actor_id TEXT NOT NULL,
        source_name TEXT NOT NULL DEFAULT '',
        url TEXT NOT NULL,
        published_at TEXT,
        retrieved_at TEXT NOT NULL,
        ingested_at TEXT NOT NULL,
        body TEXT NOT NULL DEFAULT '',
        source_fingerprint TEXT,
        title TEXT,
        headline TEXT,
        og_title TEXT,
        html_title TEXT,
        publisher TEXT,
        site_name TEXT,
        source_type TEXT,
        source_tier TEXT,
        confidence_weight INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS timeline_events (
        id TEXT PRIMARY KEY,
        actor_id TEXT NOT NULL,
        source_id TEXT,
        occurred_at TEXT,
        summary TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS question_updates (
        id TEXT PRIMARY KEY,
        thread_id TEXT NOT NULL,
        source_id TEXT,
        note TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ioc_items (
        id TEXT PRIMARY KEY,
        actor_id TEXT NOT NULL,
        ioc_type TEXT NOT NULL,
        ioc_value TEXT NOT NULL,
        normalized_value TEXT NOT NULL,
        confidence_score INTEGER NOT NULL DEFAULT 0,
        source_id TEXT,
        source_ref TEXT,
        extraction_method TEXT NOT NULL,
        valid_from TEXT,
        valid_until TEXT,
        revoked INTEGER NOT NULL DEFAULT 0,
        first_seen_at TEXT NOT NULL,
        last_seen_at TEXT NOT NULL,
        seen_count INTEGER NOT NULL DEFAULT 1,
        UNIQUE(actor_id, ioc_type, normalized_value)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS collection_sync_runs (
        id TEXT PRIMARY KEY,
        actor_id TEXT NOT NULL,
        collection_url TEXT NOT NULL,
        added_after TEXT,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        status TEXT NOT NULL DEFAULT 'running',
        objects_received INTEGER NOT NULL DEFAULT 0,
        imported_iocs INTEGER NOT NULL DEFAULT 0,
        imported_notes INTEGER NOT NULL DEFAULT 0,
        skipped INTEGER NOT NULL DEFAULT 0,
        error_detail TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS generation_jobs (
        id TEXT PRIMARY KEY,
        actor_id TEXT NOT NULL,
        trigger_type TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        started_at TEXT,
        finished_at TEXT,
        duration_ms INTEGER,
        imported_sources INTEGER NOT NULL DEFAULT 0,
        final_message TEXT NOT NULL DEFAULT '',
        error_message TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS generation_phases (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL,
        actor_id TEXT NOT NULL,
        phase_key TEXT NOT NULL,
        phase_label TEXT NOT NULL,
        attempt INTEGER NOT NULL DEFAULT 1,
        status TEXT NOT NULL,
        message TEXT NOT NULL DEFAULT '',
        error_detail TEXT NOT NULL DEFAULT '',
        started_at TEXT NOT NULL,
        finished_at TEXT,
        duration_ms INTEGER,
        FOREIGN KEY (job_id) REFERENCES generation_jobs(id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_sources_actor_url ON sources(actor_id, url)",
    "CREATE INDEX IF NOT EXISTS idx_sources_actor_fingerprint ON sources(actor_id, source_fingerprint)",
    "CREATE INDEX IF NOT EXISTS idx_timeline_events_source ON timeline_events(source_id)",
    "CREATE INDEX IF NOT EXISTS idx_question_updates_source ON question_updates(source_id)",
    "CREATE INDEX IF NOT EXISTS idx_sync_runs_actor_started ON collection_sync_runs(actor_id, started_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_generation_jobs_actor ON generation_jobs(actor_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_generation_phases_job ON generation_phases(job_id, started_at)",
];

const SCORING_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS source_scoring (
        source_id TEXT PRIMARY KEY,
        relevance_score REAL NOT NULL DEFAULT 0,
        trust_score REAL NOT NULL DEFAULT 0,
        recency_score REAL NOT NULL DEFAULT 0,
        novelty_score REAL NOT NULL DEFAULT 0,
        final_score REAL NOT NULL DEFAULT 0,
        scored_at TEXT NOT NULL,
        features_json TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS actor_resolution (
        id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL,
        actor_id TEXT NOT NULL,
        match_type TEXT NOT NULL,
        matched_term TEXT NOT NULL DEFAULT '',
        confidence REAL NOT NULL DEFAULT 0,
        explanation_json TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS source_entities (
        id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        entity_value TEXT NOT NULL,
        normalized_value TEXT NOT NULL,
        confidence REAL NOT NULL DEFAULT 0,
        extractor TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_actor_resolution_source ON actor_resolution(source_id, actor_id)",
    "CREATE INDEX IF NOT EXISTS idx_source_entities_source ON source_entities(source_id)",
    "CREATE INDEX IF NOT EXISTS idx_source_entities_value ON source_entities(entity_type, normalized_value)",
];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool, config.ranking.provision_scoring_tables).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables on an open pool.
pub async fn apply_schema(pool: &SqlitePool, provision_scoring: bool) -> Result<()> {
    for statement in CORE_SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    if provision_scoring {
        for statement in SCORING_SCHEMA {
            sqlx::query(statement).execute(pool).await?;
        }
    }
    Ok(())
}
