//! Notebook generation.
//!
//! [`GenerationService::enqueue_generation`] records a `queued` job and
//! hands the work to a tokio task. The task drives the actor's
//! [`GenerationPipeline`] through two journaled phases and always leaves
//! the job terminal and the actor out of the running set, even if the
//! pipeline panics.
//!
//! The running set is the in-process view of which actors have a live
//! generation. Stale recovery skips anything in it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::actors::{self, NotebookStatus};
use crate::collection_sync::{build_collection_sync, CollectionSync};
use crate::config::Config;
use crate::fingerprint::truncate_chars;
use crate::journal::{JobOutcome, Journal, PhaseOutcome};
use crate::models::{GenerationJob, JobStatus};
use crate::scoring;
use crate::traits::{Clock, GenerationPipeline, SystemClock, UuidGenerator};

pub const IMPORT_PHASE: (&str, &str) = ("import_sources", "Import sources");
pub const BUILD_PHASE: (&str, &str) = ("build_notebook", "Build notebook");

const ERROR_DETAIL_CHARS: usize = 500;

#[derive(Clone)]
pub struct GenerationService {
    pool: SqlitePool,
    journal: Journal,
    clock: Arc<dyn Clock>,
    pipeline: Arc<dyn GenerationPipeline>,
    /// actor id -> live job id
    running: Arc<Mutex<HashMap<String, String>>>,
}

impl GenerationService {
    pub fn new(
        pool: SqlitePool,
        journal: Journal,
        clock: Arc<dyn Clock>,
        pipeline: Arc<dyn GenerationPipeline>,
    ) -> Self {
        Self {
            pool,
            journal,
            clock,
            pipeline,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Actors with a generation live in this process, with their job ids.
    pub async fn running_snapshot(&self) -> HashMap<String, String> {
        self.running.lock().await.clone()
    }

    pub async fn is_running(&self, actor_id: &str) -> bool {
        self.running.lock().await.contains_key(actor_id)
    }

    /// Queue a generation for the actor, or return the one already live.
    pub async fn enqueue_generation(&self, actor_id: &str, trigger_type: &str) -> Result<GenerationJob> {
        if actors::get_actor(&self.pool, actor_id).await?.is_none() {
            anyhow::bail!("unknown actor: {}", actor_id);
        }

        let mut running = self.running.lock().await;
        if let Some(job_id) = running.get(actor_id) {
            if let Some(job) = self.journal.job_detail(actor_id, job_id).await? {
                info!(actor_id, job_id = %job.job_id, "generation already running");
                return Ok(job);
            }
        }

        let job_id = self
            .journal
            .create_job(actor_id, trigger_type, JobStatus::Queued)
            .await?;
        running.insert(actor_id.to_string(), job_id.clone());
        drop(running);

        let job = match self.journal.job_detail(actor_id, &job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.running.lock().await.remove(actor_id);
                return Err(anyhow!("job {} vanished after insert", job_id));
            }
            Err(e) => {
                self.running.lock().await.remove(actor_id);
                return Err(e.into());
            }
        };

        let service = self.clone();
        let actor = actor_id.to_string();
        tokio::spawn(async move {
            service.run_job(actor, job_id).await;
        });
        Ok(job)
    }

    async fn run_job(&self, actor_id: String, job_id: String) {
        let started = Instant::now();

        let inner = {
            let service = self.clone();
            let actor_id = actor_id.clone();
            let job_id = job_id.clone();
            tokio::spawn(async move { service.execute(&actor_id, &job_id).await })
        };
        let result = match inner.await {
            Ok(result) => result,
            Err(join) => Err(anyhow!("generation task aborted: {}", join)),
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        let (outcome, status, message, processed) = match result {
            Ok(imported) => {
                let message = format!("Notebook ready. Imported {} feed source(s).", imported);
                (
                    JobOutcome {
                        status: JobStatus::Completed,
                        imported_sources: imported,
                        duration_ms,
                        final_message: message.clone(),
                        error_message: String::new(),
                    },
                    NotebookStatus::Ready,
                    message,
                    imported,
                )
            }
            Err(e) => {
                warn!(actor_id = %actor_id, job_id = %job_id, error = %e, "notebook generation failed");
                (
                    JobOutcome {
                        status: JobStatus::Error,
                        imported_sources: 0,
                        duration_ms,
                        final_message: String::new(),
                        error_message: truncate_chars(&format!("{:#}", e), ERROR_DETAIL_CHARS),
                    },
                    NotebookStatus::Error,
                    format!("Notebook generation failed: {}", e),
                    0,
                )
            }
        };

        if let Err(e) = self.journal.finalize(&job_id, &outcome).await {
            warn!(actor_id = %actor_id, job_id = %job_id, error = %e, "could not finalize generation job");
        }
        if let Err(e) = actors::record_refresh_stats(&self.pool, &actor_id, duration_ms, processed).await {
            warn!(actor_id = %actor_id, error = %e, "could not record refresh stats");
        }
        if let Err(e) =
            actors::set_notebook_status(&self.pool, &*self.clock, &actor_id, status, &message).await
        {
            warn!(actor_id = %actor_id, error = %e, "could not update notebook status");
        }

        self.running.lock().await.remove(&actor_id);
        info!(actor_id = %actor_id, job_id = %job_id, status = %outcome.status, duration_ms, "generation finished");
    }

    async fn execute(&self, actor_id: &str, job_id: &str) -> Result<i64> {
        self.journal.mark_started(job_id).await?;
        actors::set_notebook_status(
            &self.pool,
            &*self.clock,
            actor_id,
            NotebookStatus::Running,
            "Collecting sources...",
        )
        .await?;

        let imported = self
            .run_phase(job_id, actor_id, IMPORT_PHASE, self.pipeline.import_sources(actor_id))
            .await?;

        actors::set_notebook_status(
            &self.pool,
            &*self.clock,
            actor_id,
            NotebookStatus::Running,
            &format!("Sources collected ({}). Building notebook...", imported),
        )
        .await?;

        self.run_phase(job_id, actor_id, BUILD_PHASE, self.pipeline.build_notebook(actor_id))
            .await?;
        Ok(imported)
    }

    async fn run_phase<T, F>(
        &self,
        job_id: &str,
        actor_id: &str,
        (key, label): (&str, &str),
        step: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let phase_id = self
            .journal
            .start_phase(job_id, actor_id, key, label, 1, "")
            .await?;
        let started = Instant::now();
        let result = step.await;
        let duration_ms = Some(started.elapsed().as_millis() as i64);

        let outcome = match &result {
            Ok(_) => PhaseOutcome {
                status: "completed".to_string(),
                message: format!("{} done", label),
                error_detail: String::new(),
                duration_ms,
            },
            Err(e) => PhaseOutcome {
                status: "error".to_string(),
                message: format!("{} failed", label),
                error_detail: truncate_chars(&format!("{:#}", e), ERROR_DETAIL_CHARS),
                duration_ms,
            },
        };
        self.journal.finish_phase(&phase_id, &outcome).await?;
        result
    }
}

// ============ Production pipeline ============

/// Re-syncs every collection the actor has synced successfully before,
/// then rescores all of the actor's sources.
pub struct EvidencePipeline {
    sync: Arc<CollectionSync>,
    bearer_token: Option<String>,
    lookback_hours: i64,
}

impl EvidencePipeline {
    pub fn new(sync: Arc<CollectionSync>, bearer_token: Option<String>, lookback_hours: i64) -> Self {
        Self {
            sync,
            bearer_token,
            lookback_hours,
        }
    }
}

#[async_trait]
impl GenerationPipeline for EvidencePipeline {
    async fn import_sources(&self, actor_id: &str) -> Result<i64> {
        let store = self.sync.store();
        let collections: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT collection_url FROM collection_sync_runs \
             WHERE actor_id = ? AND status = 'completed' ORDER BY collection_url",
        )
        .bind(actor_id)
        .fetch_all(store.pool())
        .await?;

        let mut imported = 0;
        for url in &collections {
            let summary = self
                .sync
                .sync_collection(actor_id, url, self.bearer_token.as_deref(), self.lookback_hours)
                .await?;
            if summary.ok {
                imported += summary.imported_iocs + summary.imported_notes;
            } else {
                warn!(
                    actor_id,
                    collection_url = %url,
                    error = summary.error.as_deref().unwrap_or(""),
                    "collection refresh failed"
                );
            }
        }
        Ok(imported)
    }

    async fn build_notebook(&self, actor_id: &str) -> Result<()> {
        let store = self.sync.store();
        let actor = actors::get_actor(store.pool(), actor_id)
            .await?
            .ok_or_else(|| anyhow!("unknown actor: {}", actor_id))?;
        let terms = vec![actor.display_name];
        let now = store.clock().now();

        let sources = store.list_sources(actor_id).await?;
        let mut scored = 0;
        for source in &sources {
            if scoring::score_source(store.pool(), &**store.ids(), now, source, &terms, scoring::DEFAULT_NOVELTY)
                .await?
                .is_some()
            {
                scored += 1;
            }
        }
        // Corroboration reads entities written for other sources; the
        // second pass sees all of them.
        if scored > 0 {
            for source in &sources {
                scoring::score_source(store.pool(), &**store.ids(), now, source, &terms, scoring::DEFAULT_NOVELTY)
                    .await?;
            }
        }
        tracing::debug!(actor_id, sources = sources.len(), scored, "notebook rebuilt");
        Ok(())
    }
}

/// Production wiring over the system clock and v4 ids.
pub fn build_generation_service(config: &Config, pool: SqlitePool) -> Result<GenerationService> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let journal = Journal::new(pool.clone(), clock.clone(), Arc::new(UuidGenerator));
    let sync = Arc::new(build_collection_sync(config, pool.clone())?);
    let pipeline = EvidencePipeline::new(
        sync,
        config.sync.bearer_token.clone(),
        config.sync.default_lookback_hours,
    );
    Ok(GenerationService::new(pool, journal, clock, Arc::new(pipeline)))
}
