//! Stale-generation recovery and the auto-refresh batch.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;
use common::{setup, TestEnv};
use intel_notebook::actors;
use intel_notebook::config::SchedulerConfig;
use intel_notebook::generation::GenerationService;
use intel_notebook::journal::STALE_JOB_MESSAGE;
use intel_notebook::models::{format_ts, JobStatus};
use intel_notebook::scheduler::{Scheduler, AUTO_REFRESH_TRIGGER, STALE_RECOVERY_MESSAGE};
use intel_notebook::traits::{Clock, GenerationPipeline};
use tokio::sync::Notify;

#[derive(Default)]
struct GatedPipeline {
    gate: Option<Arc<Notify>>,
    imports: AtomicUsize,
}

#[async_trait]
impl GenerationPipeline for GatedPipeline {
    async fn import_sources(&self, _actor_id: &str) -> Result<i64> {
        self.imports.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(0)
    }

    async fn build_notebook(&self, _actor_id: &str) -> Result<()> {
        Ok(())
    }
}

fn scheduler(env: &TestEnv, pipeline: Arc<GatedPipeline>, batch_size: usize) -> (Scheduler, GenerationService) {
    let generation = GenerationService::new(env.pool.clone(), env.journal(), env.clock.clone(), pipeline);
    let config = SchedulerConfig {
        batch_size,
        min_interval_hours: 6,
        stale_recovery_minutes: 10,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(env.pool.clone(), generation.clone(), env.clock.clone(), config);
    (scheduler, generation)
}

async fn set_running(env: &TestEnv, actor_id: &str, updated_at: Option<String>) {
    sqlx::query(
        "UPDATE actor_profiles SET notebook_status = 'running', notebook_updated_at = ? WHERE id = ?",
    )
    .bind(updated_at)
    .bind(actor_id)
    .execute(&env.pool)
    .await
    .unwrap();
}

async fn wait_until_idle(generation: &GenerationService) {
    for _ in 0..500 {
        if generation.running_snapshot().await.is_empty() {
            return;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    panic!("generations never finished");
}

#[tokio::test]
async fn test_recovers_only_stale_actors_not_live_here() {
    let env = setup(false).await;
    let gate = Arc::new(Notify::new());
    let pipeline = Arc::new(GatedPipeline {
        gate: Some(gate.clone()),
        ..Default::default()
    });
    let (scheduler, generation) = scheduler(&env, pipeline.clone(), 8);

    let stale = env.actor("Stale").await;
    let recent = env.actor("Recent").await;
    let live = env.actor("Live").await;
    let undated = env.actor("Undated").await;
    let idle = env.actor("Idle").await;
    let stale_job = env
        .journal()
        .create_job(&stale, "manual_refresh", JobStatus::Running)
        .await
        .unwrap();

    generation.enqueue_generation(&live, "manual_refresh").await.unwrap();
    for _ in 0..500 {
        if pipeline.imports.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    assert_eq!(pipeline.imports.load(Ordering::SeqCst), 1);

    env.clock.advance(Duration::minutes(20));
    let now = env.clock.now();
    set_running(&env, &stale, Some(format_ts(now - Duration::minutes(20)))).await;
    set_running(&env, &recent, Some(format_ts(now - Duration::minutes(2)))).await;
    set_running(&env, &live, Some(format_ts(now - Duration::minutes(20)))).await;
    set_running(&env, &undated, None).await;

    let mut recovered = scheduler.recover_stale_generations().await.unwrap();
    recovered.sort();
    let mut expected = vec![stale.clone(), undated.clone()];
    expected.sort();
    assert_eq!(recovered, expected);

    let profile = actors::get_actor(&env.pool, &stale).await.unwrap().unwrap();
    assert_eq!(profile.notebook_status, "error");
    assert_eq!(profile.notebook_message, STALE_RECOVERY_MESSAGE);
    assert_eq!(profile.auto_refresh_last_status.as_deref(), Some("error"));

    let job = env.journal().job_detail(&stale, &stale_job).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.error_message, STALE_JOB_MESSAGE);

    for id in [&recent, &live] {
        let profile = actors::get_actor(&env.pool, id).await.unwrap().unwrap();
        assert_eq!(profile.notebook_status, "running");
    }
    let profile = actors::get_actor(&env.pool, &idle).await.unwrap().unwrap();
    assert_eq!(profile.notebook_status, "idle");

    gate.notify_one();
    wait_until_idle(&generation).await;
}

#[tokio::test]
async fn test_auto_refresh_batches_oldest_due_actors() {
    let env = setup(false).await;
    let pipeline = Arc::new(GatedPipeline::default());
    let (scheduler, generation) = scheduler(&env, pipeline, 2);

    let first = env.actor("Alpha").await;
    let second = env.actor("Bravo").await;
    let third = env.actor("Charlie").await;
    let busy = env.actor("Delta").await;
    let refreshed = env.actor("Echo").await;
    let untracked = actors::create_actor(&env.pool, &*env.clock, &*env.ids, "Foxtrot", false)
        .await
        .unwrap()
        .id;

    env.clock.advance(Duration::hours(2));
    let now = env.clock.now();
    set_running(&env, &busy, Some(format_ts(now))).await;
    actors::mark_auto_refresh_queued(&env.pool, &refreshed, &format_ts(now - Duration::hours(1)))
        .await
        .unwrap();

    let queued = scheduler.run_auto_refresh_once().await.unwrap();
    assert_eq!(queued, 2);
    wait_until_idle(&generation).await;

    for id in [&first, &second] {
        let profile = actors::get_actor(&env.pool, id).await.unwrap().unwrap();
        assert_eq!(profile.auto_refresh_last_run_at.as_deref(), Some(format_ts(now).as_str()));
        assert_eq!(profile.auto_refresh_last_status.as_deref(), Some("queued"));
        assert_eq!(profile.notebook_status, "ready");
    }
    let jobs: Vec<String> = sqlx::query_scalar("SELECT trigger_type FROM generation_jobs")
        .fetch_all(&env.pool)
        .await
        .unwrap();
    assert_eq!(jobs, vec![AUTO_REFRESH_TRIGGER.to_string(); 2]);

    for id in [&third, &busy, &untracked] {
        let profile = actors::get_actor(&env.pool, id).await.unwrap().unwrap();
        assert!(profile.auto_refresh_last_run_at.is_none());
    }

    // Next batch: only the third actor is still due.
    assert_eq!(scheduler.run_auto_refresh_once().await.unwrap(), 1);
    wait_until_idle(&generation).await;
    let profile = actors::get_actor(&env.pool, &third).await.unwrap().unwrap();
    assert!(profile.auto_refresh_last_run_at.is_some());

    assert_eq!(scheduler.run_auto_refresh_once().await.unwrap(), 0);

    // Past the interval everyone tracked and idle is due again.
    env.clock.advance(Duration::hours(7));
    assert_eq!(scheduler.run_auto_refresh_once().await.unwrap(), 2);
    wait_until_idle(&generation).await;
}
