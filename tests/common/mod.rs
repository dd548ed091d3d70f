//! Shared fixtures: a throwaway database, a controllable clock, and
//! deterministic ids.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use intel_notebook::actors;
use intel_notebook::config::Config;
use intel_notebook::db;
use intel_notebook::error::SyncError;
use intel_notebook::ingest::SourceStore;
use intel_notebook::journal::Journal;
use intel_notebook::migrate;
use intel_notebook::traits::{
    Clock, CollectionClient, CollectionRequest, CollectionResponse, IdGenerator,
};
use sqlx::SqlitePool;
use tempfile::TempDir;

pub const T0: &str = "2024-05-01T12:00:00Z";

/// A clock that only moves when told to.
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn at(rfc3339: &str) -> Arc<Self> {
        let now = DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc);
        Arc::new(Self {
            now: Mutex::new(now),
        })
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// `id-0001`, `id-0002`, ... so ids sort in creation order.
#[derive(Default)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl IdGenerator for SequentialIds {
    fn new_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        format!("id-{:04}", n)
    }
}

/// Replays canned responses and records every request.
#[derive(Default)]
pub struct FakeCollection {
    responses: Mutex<VecDeque<(u16, String)>>,
    pub requests: Mutex<Vec<CollectionRequest>>,
}

impl FakeCollection {
    pub fn with(responses: &[(u16, &str)]) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(
                responses
                    .iter()
                    .map(|(status, body)| (*status, body.to_string()))
                    .collect(),
            ),
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl CollectionClient for FakeCollection {
    async fn fetch_objects(
        &self,
        request: &CollectionRequest,
    ) -> Result<CollectionResponse, SyncError> {
        self.requests.lock().unwrap().push(request.clone());
        let (status, body) = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or((200, "[]".to_string()));
        Ok(CollectionResponse { status, body })
    }
}

pub struct TestEnv {
    pub tmp: TempDir,
    pub config: Config,
    pub pool: SqlitePool,
    pub clock: Arc<FixedClock>,
    pub ids: Arc<SequentialIds>,
}

/// Fresh database under a temp dir, migrated.
pub async fn setup(provision_scoring: bool) -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::with_db_path(tmp.path().join("data/notebook.sqlite"));
    config.ranking.provision_scoring_tables = provision_scoring;

    let pool = db::connect(&config).await.unwrap();
    migrate::apply_schema(&pool, provision_scoring).await.unwrap();

    TestEnv {
        tmp,
        config,
        pool,
        clock: FixedClock::at(T0),
        ids: Arc::new(SequentialIds::default()),
    }
}

impl TestEnv {
    pub fn store(&self) -> SourceStore {
        SourceStore::new(
            self.pool.clone(),
            self.config.ingest.clone(),
            self.clock.clone(),
            self.ids.clone(),
        )
    }

    pub fn journal(&self) -> Journal {
        Journal::new(self.pool.clone(), self.clock.clone(), self.ids.clone())
    }

    pub async fn actor(&self, name: &str) -> String {
        actors::create_actor(&self.pool, &*self.clock, &*self.ids, name, true)
            .await
            .unwrap()
            .id
    }

    pub async fn count(&self, sql: &str) -> i64 {
        sqlx::query_scalar(sql).fetch_one(&self.pool).await.unwrap()
    }
}

/// A paragraph long enough to pass the refresh body threshold.
pub fn long_body(topic: &str) -> String {
    format!(
        "Analysts observed {topic} infrastructure rotating through new hosting providers. \
         The campaign reused loaders seen in earlier intrusions against regional telecoms. \
         Defenders should review outbound traffic for the indicators listed in this report."
    )
}
