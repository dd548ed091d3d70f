//! Tracked actor profiles and their notebook status.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::models::{format_ts, ActorProfile};
use crate::traits::{Clock, IdGenerator, SystemClock, UuidGenerator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotebookStatus {
    Idle,
    Running,
    Ready,
    Error,
}

impl NotebookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotebookStatus::Idle => "idle",
            NotebookStatus::Running => "running",
            NotebookStatus::Ready => "ready",
            NotebookStatus::Error => "error",
        }
    }
}

const ACTOR_COLUMNS: &str = "id, display_name, is_tracked, notebook_status, notebook_message, \
    notebook_updated_at, auto_refresh_last_run_at, auto_refresh_last_status, \
    last_refresh_duration_ms, last_refresh_sources_processed, created_at";

pub async fn create_actor(
    pool: &SqlitePool,
    clock: &dyn Clock,
    ids: &dyn IdGenerator,
    display_name: &str,
    is_tracked: bool,
) -> Result<ActorProfile> {
    let display_name = display_name.trim();
    if display_name.is_empty() {
        anyhow::bail!("actor name must not be empty");
    }
    let id = ids.new_id();
    let now = format_ts(clock.now());
    sqlx::query(
        "INSERT INTO actor_profiles (id, display_name, is_tracked, notebook_status, notebook_message, \
            notebook_updated_at, created_at) \
         VALUES (?, ?, ?, ?, '', ?, ?)",
    )
    .bind(&id)
    .bind(display_name)
    .bind(is_tracked)
    .bind(NotebookStatus::Idle.as_str())
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    get_actor(pool, &id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("actor {} vanished after insert", id))
}

pub async fn get_actor(pool: &SqlitePool, actor_id: &str) -> Result<Option<ActorProfile>> {
    let row = sqlx::query(&format!("SELECT {ACTOR_COLUMNS} FROM actor_profiles WHERE id = ?"))
        .bind(actor_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(actor_from_row))
}

pub async fn list_actors(pool: &SqlitePool) -> Result<Vec<ActorProfile>> {
    let rows = sqlx::query(&format!(
        "SELECT {ACTOR_COLUMNS} FROM actor_profiles ORDER BY display_name ASC"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(actor_from_row).collect())
}

/// Set the notebook status and message, stamping `notebook_updated_at`.
pub async fn set_notebook_status(
    pool: &SqlitePool,
    clock: &dyn Clock,
    actor_id: &str,
    status: NotebookStatus,
    message: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE actor_profiles SET notebook_status = ?, notebook_message = ?, notebook_updated_at = ? \
         WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(message)
    .bind(format_ts(clock.now()))
    .bind(actor_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_auto_refresh_queued(pool: &SqlitePool, actor_id: &str, now: &str) -> Result<()> {
    sqlx::query(
        "UPDATE actor_profiles SET auto_refresh_last_run_at = ?, auto_refresh_last_status = 'queued' \
         WHERE id = ?",
    )
    .bind(now)
    .bind(actor_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_auto_refresh_status(pool: &SqlitePool, actor_id: &str, status: &str) -> Result<()> {
    sqlx::query("UPDATE actor_profiles SET auto_refresh_last_status = ? WHERE id = ?")
        .bind(status)
        .bind(actor_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn record_refresh_stats(
    pool: &SqlitePool,
    actor_id: &str,
    duration_ms: i64,
    sources_processed: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE actor_profiles SET last_refresh_duration_ms = ?, last_refresh_sources_processed = ? \
         WHERE id = ?",
    )
    .bind(duration_ms.max(0))
    .bind(sources_processed.max(0))
    .bind(actor_id)
    .execute(pool)
    .await?;
    Ok(())
}

fn actor_from_row(row: &SqliteRow) -> ActorProfile {
    ActorProfile {
        id: row.get("id"),
        display_name: row.get("display_name"),
        is_tracked: row.get("is_tracked"),
        notebook_status: row.get("notebook_status"),
        notebook_message: row.get("notebook_message"),
        notebook_updated_at: row.get("notebook_updated_at"),
        auto_refresh_last_run_at: row.get("auto_refresh_last_run_at"),
        auto_refresh_last_status: row.get("auto_refresh_last_status"),
        last_refresh_duration_ms: row.get("last_refresh_duration_ms"),
        last_refresh_sources_processed: row.get("last_refresh_sources_processed"),
        created_at: row.get("created_at"),
    }
}

/// `notebook actor add`
pub async fn run_add_actor(config: &Config, name: &str, untracked: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let actor = create_actor(&pool, &SystemClock, &UuidGenerator, name, !untracked).await?;
    println!("actor {}", actor.id);
    println!("  name: {}", actor.display_name);
    println!("  tracked: {}", actor.is_tracked);
    pool.close().await;
    Ok(())
}

/// `notebook actor list`
pub async fn run_list_actors(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let actors = list_actors(&pool).await?;
    if actors.is_empty() {
        println!("No actors.");
    }
    for actor in &actors {
        println!(
            "{}  {:<24}  {:<8}  {}{}",
            actor.id,
            actor.display_name,
            actor.notebook_status,
            if actor.is_tracked { "tracked" } else { "untracked" },
            actor
                .auto_refresh_last_run_at
                .as_deref()
                .map(|ts| format!("  last refresh {ts}"))
                .unwrap_or_default()
        );
    }
    pool.close().await;
    Ok(())
}
