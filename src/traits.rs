//! Collaborator traits injected into the ingestion, sync, and generation
//! components.
//!
//! Every component takes the collaborators it needs at construction time
//! instead of reaching for globals:
//!
//! ```text
//! ┌──────────────┐  Clock + IdGenerator  ┌──────────────────┐
//! │ SourceStore  │◀──────────────────────│  CollectionSync  │
//! └──────┬───────┘                       │  CollectionClient│
//!        │            BundleImporter ───▶│                  │
//!        ▼                               └──────────────────┘
//! ┌──────────────┐  GenerationPipeline   ┌──────────────────┐
//! │   Journal    │◀──────────────────────│ GenerationService│
//! └──────────────┘                       └──────────────────┘
//! ```
//!
//! Production implementations live next to the trait (clock, ids, HTTP
//! client) or in the module that owns the behavior
//! ([`StixBundleImporter`](crate::stix::StixBundleImporter),
//! [`EvidencePipeline`](crate::generation::EvidencePipeline)).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::SyncError;
use crate::ingest::SourceStore;
use crate::models::{Bundle, ImportCounts};

// ═══════════════════════════════════════════════════════════════════════
// Clock and ids
// ═══════════════════════════════════════════════════════════════════════

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock UTC time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub trait IdGenerator: Send + Sync {
    fn new_id(&self) -> String;
}

/// Random v4 UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn new_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Collection client
// ═══════════════════════════════════════════════════════════════════════

/// One request against a collection's `objects/` endpoint.
#[derive(Debug, Clone)]
pub struct CollectionRequest {
    /// Full endpoint URL, already ending in `/objects/`.
    pub objects_url: String,
    pub bearer_token: Option<String>,
    /// ISO-8601 UTC lower bound passed as `added_after`.
    pub added_after: String,
}

/// Raw response; status checking and decoding belong to the sync adapter.
#[derive(Debug, Clone)]
pub struct CollectionResponse {
    pub status: u16,
    pub body: String,
}

#[async_trait]
pub trait CollectionClient: Send + Sync {
    async fn fetch_objects(
        &self,
        request: &CollectionRequest,
    ) -> std::result::Result<CollectionResponse, SyncError>;
}

pub const TAXII_ACCEPT: &str = "application/taxii+json;version=2.1";

/// `reqwest` client with a fixed per-request timeout and no retries.
pub struct HttpCollectionClient {
    client: reqwest::Client,
}

impl HttpCollectionClient {
    pub fn new(timeout: Duration) -> std::result::Result<Self, SyncError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CollectionClient for HttpCollectionClient {
    async fn fetch_objects(
        &self,
        request: &CollectionRequest,
    ) -> std::result::Result<CollectionResponse, SyncError> {
        let mut builder = self
            .client
            .get(&request.objects_url)
            .header(reqwest::header::ACCEPT, TAXII_ACCEPT)
            .query(&[("added_after", request.added_after.as_str())]);
        if let Some(token) = request.bearer_token.as_deref().filter(|t| !t.trim().is_empty()) {
            builder = builder.bearer_auth(token.trim());
        }
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(CollectionResponse { status, body })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Bundle import and generation
// ═══════════════════════════════════════════════════════════════════════

/// Folds a normalized bundle into an actor's sources and IOCs.
///
/// Implementations must write through `store` so imported objects get the
/// same URL and fingerprint dedup as any other source.
#[async_trait]
pub trait BundleImporter: Send + Sync {
    async fn import_bundle(
        &self,
        store: &SourceStore,
        actor_id: &str,
        bundle: &Bundle,
    ) -> Result<ImportCounts>;
}

/// The per-actor body of a notebook generation.
///
/// The generation service wraps each step in a journal phase.
#[async_trait]
pub trait GenerationPipeline: Send + Sync {
    /// Pull fresh sources for the actor. Returns how many were imported.
    async fn import_sources(&self, actor_id: &str) -> Result<i64>;

    /// Rebuild derived notebook state from the stored sources.
    async fn build_notebook(&self, actor_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_generator_is_unique() {
        let ids = UuidGenerator;
        let a = ids.new_id();
        let b = ids.new_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }
}
