//! Auto-refresh scheduler and stale-generation recovery.
//!
//! Each tick of the loop:
//!
//! ```text
//! recover stale ──▶ select tracked actors due for refresh (oldest first)
//!                         │
//!                         ▼
//!            mark queued ──▶ enqueue each (failures logged, batch continues)
//! ```
//!
//! Recovery is what makes a crash mid-generation self-healing: an actor
//! left `running` by a dead process is flipped to `error` on the next tick
//! and its journal jobs are expired.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Duration as ChronoDuration;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::actors;
use crate::config::{Config, SchedulerConfig};
use crate::db;
use crate::events::{self, Event};
use crate::generation::{build_generation_service, GenerationService};
use crate::journal::MIN_STALE_MINUTES;
use crate::models::{format_ts, parse_ts};
use crate::traits::{Clock, SystemClock};

pub const STALE_RECOVERY_MESSAGE: &str = "Previous refresh stalled and was recovered. Refresh again.";
pub const AUTO_REFRESH_TRIGGER: &str = "auto_refresh";

const MIN_LOOP_SECONDS: u64 = 30;

pub struct Scheduler {
    pool: SqlitePool,
    generation: GenerationService,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        pool: SqlitePool,
        generation: GenerationService,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            pool,
            generation,
            clock,
            config,
        }
    }

    /// Flip actors stuck in `running` to `error` and expire their jobs.
    ///
    /// Actors with a generation live in this process are never touched.
    /// An actor whose `notebook_updated_at` is missing or unparsable counts
    /// as stale. Returns the recovered actor ids.
    pub async fn recover_stale_generations(&self) -> Result<Vec<String>> {
        let live = self.generation.running_snapshot().await;
        let minutes = self.config.stale_recovery_minutes.max(MIN_STALE_MINUTES);
        let cutoff = self.clock.now() - ChronoDuration::minutes(minutes);

        let rows = sqlx::query(
            "SELECT id, notebook_updated_at FROM actor_profiles WHERE notebook_status = 'running'",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut recovered = Vec::new();
        for row in &rows {
            let actor_id: String = row.get("id");
            if actor_id.is_empty() || live.contains_key(&actor_id) {
                continue;
            }
            let updated: Option<String> = row.get("notebook_updated_at");
            if let Some(updated_at) = updated.as_deref().and_then(parse_ts) {
                if updated_at > cutoff {
                    continue;
                }
            }

            sqlx::query(
                "UPDATE actor_profiles \
                 SET notebook_status = 'error', notebook_message = ?, auto_refresh_last_status = 'error' \
                 WHERE id = ? AND notebook_status = 'running'",
            )
            .bind(STALE_RECOVERY_MESSAGE)
            .bind(&actor_id)
            .execute(&self.pool)
            .await?;
            recovered.push(actor_id);
        }

        for actor_id in &recovered {
            if let Err(e) = self.generation.journal().expire_stale_jobs(actor_id, minutes).await {
                warn!(actor_id = %actor_id, error = %e, "could not expire stale jobs");
            }
            events::emit(&Event::StaleGenerationRecovered {
                actor_id: actor_id.clone(),
            });
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered stale generations");
        }
        Ok(recovered)
    }

    /// Queue generations for tracked actors whose last auto refresh is older
    /// than the minimum interval. Returns how many were enqueued.
    pub async fn run_auto_refresh_once(&self) -> Result<usize> {
        let now = self.clock.now();
        let cutoff = now - ChronoDuration::hours(self.config.min_interval_hours.max(1));
        let limit = self.config.batch_size.max(1);
        let live = self.generation.running_snapshot().await;

        let rows = sqlx::query(
            "SELECT id, notebook_status, auto_refresh_last_run_at FROM actor_profiles \
             WHERE is_tracked = 1 \
             ORDER BY COALESCE(auto_refresh_last_run_at, created_at) ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let due: Vec<String> = rows
            .iter()
            .filter(|row| row.get::<String, _>("notebook_status") != "running")
            .filter(|row| {
                let last_run: Option<String> = row.get("auto_refresh_last_run_at");
                match last_run.as_deref().and_then(parse_ts) {
                    Some(last_run) => last_run <= cutoff,
                    None => true,
                }
            })
            .map(|row| row.get::<String, _>("id"))
            .filter(|id| !live.contains_key(id))
            .take(limit)
            .collect();

        let stamp = format_ts(now);
        for actor_id in &due {
            actors::mark_auto_refresh_queued(&self.pool, actor_id, &stamp).await?;
        }

        let mut queued = 0;
        for actor_id in &due {
            match self
                .generation
                .enqueue_generation(actor_id, AUTO_REFRESH_TRIGGER)
                .await
            {
                Ok(job) => {
                    queued += 1;
                    events::emit(&Event::AutoRefreshActorQueued {
                        actor_id: actor_id.clone(),
                        job_id: job.job_id,
                    });
                }
                Err(e) => {
                    warn!(actor_id = %actor_id, error = %e, "auto refresh enqueue failed");
                    if let Err(e) = actors::set_auto_refresh_status(&self.pool, actor_id, "error").await {
                        warn!(actor_id = %actor_id, error = %e, "could not record enqueue failure");
                    }
                }
            }
        }

        events::emit(&Event::AutoRefreshRun {
            queued_count: queued,
            limit,
        });
        Ok(queued)
    }

    /// One loop iteration: recovery, then the refresh batch.
    pub async fn tick(&self) -> Result<usize> {
        self.recover_stale_generations().await?;
        self.run_auto_refresh_once().await
    }

    /// Run ticks forever on a fixed interval.
    pub async fn run(self) {
        let period = Duration::from_secs(self.config.loop_seconds.max(MIN_LOOP_SECONDS));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(every_secs = period.as_secs(), "auto refresh loop started");

        loop {
            interval.tick().await;
            if let Err(e) = self.tick().await {
                warn!(error = %e, "auto refresh tick failed");
            }
        }
    }
}

/// `notebook recover`: one stale-recovery sweep.
pub async fn run_recover(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let generation = build_generation_service(config, pool.clone())?;
    let scheduler = Scheduler::new(
        pool.clone(),
        generation,
        Arc::new(SystemClock),
        config.scheduler.clone(),
    );

    let recovered = scheduler.recover_stale_generations().await?;
    if recovered.is_empty() {
        println!("No stale generations.");
    } else {
        println!("Recovered {} actor(s):", recovered.len());
        for actor_id in &recovered {
            println!("  {}", actor_id);
        }
    }

    pool.close().await;
    Ok(())
}
