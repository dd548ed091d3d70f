//! Source ingestion with URL and fingerprint deduplication.
//!
//! [`SourceStore::upsert_source`] is the single write path for documents.
//! Every call runs in one short transaction:
//!
//! 1. Load all rows for `(actor, url)`, newest first. The first is
//!    canonical; every other row has its references repointed to the
//!    canonical id and is then deleted.
//! 2. Merge the incoming document into the canonical row with
//!    [`merge_source`] (refresh or backfill policy).
//! 3. With no URL match, a fingerprint match on `(actor, fingerprint)`
//!    returns the existing id untouched.
//! 4. Otherwise insert a new row.
//!
//! IOCs have their own dedup key and go through [`SourceStore::upsert_ioc`].

use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::config::{Config, IngestConfig};
use crate::db;
use crate::fingerprint::{source_fingerprint, TitleCandidates};
use crate::models::{format_ts, parse_ts, Source, SourceUpsert};
use crate::traits::{Clock, IdGenerator, SystemClock, UuidGenerator};

/// Bodies shorter than this never replace an existing body on refresh.
pub const MIN_REFRESH_BODY_CHARS: usize = 120;

/// Derived scoring rows owned by a source; dropped with a merged duplicate.
const SCORING_ATTACHMENTS: &[&str] = &["source_scoring", "actor_resolution", "source_entities"];

const SOURCE_COLUMNS: &str = "id, actor_id, source_name, url, published_at, retrieved_at, \
    ingested_at, body, source_fingerprint, title, headline, og_title, html_title, publisher, \
    site_name, source_type, source_tier, confidence_weight";

// ============ Merge policy ============

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergePolicy {
    /// Replace content and metadata instead of filling blanks.
    pub refresh_content: bool,
    /// Let a new tier and confidence weight replace already-set values.
    pub overwrite_quality: bool,
}

/// An upsert after trimming, quality resolution, and fingerprinting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreparedSource {
    pub source_name: String,
    pub body: String,
    pub published_at: Option<String>,
    pub fingerprint: Option<String>,
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

impl PreparedSource {
    fn has_metadata(&self) -> bool {
        [
            &self.title,
            &self.headline,
            &self.og_title,
            &self.html_title,
            &self.publisher,
            &self.site_name,
            &self.source_type,
            &self.source_tier,
        ]
        .iter()
        .any(|v| v.is_some())
    }
}

fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

/// Keep `existing` unless blank, then take `incoming`.
fn fill(existing: &Option<String>, incoming: &Option<String>) -> Option<String> {
    if is_blank(existing) {
        incoming.clone()
    } else {
        existing.clone()
    }
}

/// Take `incoming` when present, else keep `existing`.
fn prefer(incoming: &Option<String>, existing: &Option<String>) -> Option<String> {
    incoming.clone().or_else(|| existing.clone())
}

/// Fold an incoming document into the canonical row.
///
/// Pure: the caller persists the result. `now` stamps `retrieved_at` on
/// refresh.
pub fn merge_source(
    existing: &Source,
    incoming: &PreparedSource,
    policy: MergePolicy,
    now: &str,
) -> Source {
    let mut merged = existing.clone();

    if policy.refresh_content {
        if incoming.body.chars().count() >= MIN_REFRESH_BODY_CHARS || existing.body.is_empty() {
            merged.body = incoming.body.clone();
        }
        merged.published_at = prefer(&incoming.published_at, &existing.published_at);
        merged.retrieved_at = now.to_string();
        merged.title = prefer(&incoming.title, &existing.title);
        merged.headline = prefer(&incoming.headline, &existing.headline);
        merged.og_title = prefer(&incoming.og_title, &existing.og_title);
        merged.html_title = prefer(&incoming.html_title, &existing.html_title);
        merged.publisher = prefer(&incoming.publisher, &existing.publisher);
        merged.site_name = prefer(&incoming.site_name, &existing.site_name);
        merged.source_type = prefer(&incoming.source_type, &existing.source_type);
        merged.source_tier = prefer(&incoming.source_tier, &existing.source_tier);
    } else if incoming.has_metadata() {
        merged.title = fill(&existing.title, &incoming.title);
        merged.headline = fill(&existing.headline, &incoming.headline);
        merged.og_title = fill(&existing.og_title, &incoming.og_title);
        merged.html_title = fill(&existing.html_title, &incoming.html_title);
        merged.publisher = fill(&existing.publisher, &incoming.publisher);
        merged.site_name = fill(&existing.site_name, &incoming.site_name);
        merged.source_type = fill(&existing.source_type, &incoming.source_type);
        merged.source_tier = if policy.overwrite_quality {
            prefer(&incoming.source_tier, &existing.source_tier)
        } else {
            fill(&existing.source_tier, &incoming.source_tier)
        };
    }

    if let Some(weight) = incoming.confidence_weight {
        merged.confidence_weight = if policy.overwrite_quality {
            Some(weight)
        } else {
            existing.confidence_weight.or(Some(weight))
        };
    }

    if incoming.fingerprint.is_some() {
        merged.source_fingerprint = if policy.refresh_content {
            incoming.fingerprint.clone()
        } else {
            fill(&existing.source_fingerprint, &incoming.fingerprint)
        };
    }

    merged
}

// ============ Source quality ============

/// Tier label and confidence weight for a URL's host.
pub fn resolve_quality(url: &str, config: &IngestConfig) -> (&'static str, i64) {
    let host = match host_of(url) {
        Some(host) => host,
        None => return ("unrated", 1),
    };
    if domain_matches(&host, &config.high_confidence_domains) {
        ("high", 4)
    } else if domain_matches(&host, &config.medium_confidence_domains) {
        ("medium", 3)
    } else {
        ("unrated", 1)
    }
}

/// Lowercased host without a leading `www.`.
pub fn host_of(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url.trim()).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(host.strip_prefix("www.").map(str::to_string).unwrap_or(host))
}

fn domain_matches(host: &str, domains: &[String]) -> bool {
    domains.iter().any(|domain| {
        let domain = domain.trim().to_ascii_lowercase();
        !domain.is_empty() && (host == domain || host.ends_with(&format!(".{domain}")))
    })
}

// ============ IOCs ============

/// An indicator to store against an actor.
#[derive(Debug, Clone, Default)]
pub struct IocCandidate {
    pub ioc_type: String,
    pub value: String,
    pub source_id: Option<String>,
    pub source_ref: Option<String>,
    pub extraction_method: String,
    /// 0-5; absent means unscored.
    pub confidence_score: Option<i64>,
    pub valid_from: Option<String>,
    pub valid_until: Option<String>,
    pub revoked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IocOutcome {
    pub stored: bool,
    pub created: bool,
    pub ioc_type: String,
    pub normalized_value: String,
    pub reason: String,
}

impl IocOutcome {
    fn rejected(ioc_type: &str, reason: &str) -> Self {
        Self {
            stored: false,
            created: false,
            ioc_type: ioc_type.to_string(),
            normalized_value: String::new(),
            reason: reason.to_string(),
        }
    }
}

/// Canonical `(type, normalized value)` for an indicator, or the reason it
/// was rejected.
pub fn normalize_ioc(ioc_type: &str, value: &str) -> std::result::Result<(String, String), &'static str> {
    let kind = ioc_type.trim().to_ascii_lowercase();
    let value = value.trim();
    if value.is_empty() {
        return Err("empty value");
    }
    let normalized = match kind.as_str() {
        "domain" => {
            let domain = value.trim_end_matches('.').to_ascii_lowercase();
            if !domain.contains('.') || domain.chars().any(|c| c.is_whitespace() || c == '/') {
                return Err("invalid domain");
            }
            domain
        }
        "ip" => value
            .parse::<IpAddr>()
            .map(|ip| ip.to_string())
            .map_err(|_| "invalid ip address")?,
        "url" => {
            let lowered = value.to_ascii_lowercase();
            if !(lowered.starts_with("http://") || lowered.starts_with("https://")) {
                return Err("unsupported url scheme");
            }
            lowered
        }
        "hash" => {
            let hash = value.to_ascii_lowercase();
            if !matches!(hash.len(), 32 | 40 | 64) || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err("invalid hash");
            }
            hash
        }
        "email" => {
            let email = value.to_ascii_lowercase();
            match email.split_once('@') {
                Some((local, domain)) if !local.is_empty() && domain.contains('.') => email,
                _ => return Err("invalid email"),
            }
        }
        _ => return Err("unsupported ioc type"),
    };
    Ok((kind, normalized))
}

// ============ Store ============

/// Write path for sources and IOCs.
#[derive(Clone)]
pub struct SourceStore {
    pool: SqlitePool,
    config: IngestConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl SourceStore {
    pub fn new(
        pool: SqlitePool,
        config: IngestConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            pool,
            config,
            clock,
            ids,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn ids(&self) -> &Arc<dyn IdGenerator> {
        &self.ids
    }

    /// Trim, resolve quality, fingerprint, and attach the trigger excerpt.
    pub fn prepare(&self, upsert: &SourceUpsert) -> PreparedSource {
        let titles = TitleCandidates {
            title: upsert.title.as_deref(),
            headline: upsert.headline.as_deref(),
            og_title: upsert.og_title.as_deref(),
            html_title: upsert.html_title.as_deref(),
        };
        // Fingerprint the document itself, not the provenance text.
        let fingerprint = source_fingerprint(titles, &upsert.body);

        let body = match upsert.trigger_excerpt.as_deref().filter(|e| !e.is_empty()) {
            Some(excerpt) if !upsert.body.contains(excerpt) => {
                format!("{}\n\n{}", excerpt, upsert.body)
            }
            _ => upsert.body.clone(),
        };

        let (resolved_tier, resolved_weight) = resolve_quality(&upsert.url, &self.config);
        let published_at = clean(&upsert.published_at)
            .map(|raw| parse_ts(&raw).map(format_ts).unwrap_or(raw));

        PreparedSource {
            source_name: upsert.source_name.trim().to_string(),
            body,
            published_at,
            fingerprint: Some(fingerprint).filter(|f| !f.is_empty()),
            title: clean(&upsert.title),
            headline: clean(&upsert.headline),
            og_title: clean(&upsert.og_title),
            html_title: clean(&upsert.html_title),
            publisher: clean(&upsert.publisher),
            site_name: clean(&upsert.site_name),
            source_type: clean(&upsert.source_type),
            source_tier: clean(&upsert.source_tier).or_else(|| Some(resolved_tier.to_string())),
            confidence_weight: upsert.confidence_weight.or(Some(resolved_weight)),
        }
    }

    /// Insert or merge a source, returning the canonical id.
    pub async fn upsert_source(&self, upsert: &SourceUpsert) -> Result<String> {
        let incoming = self.prepare(upsert);
        let policy = MergePolicy {
            refresh_content: upsert.refresh_existing_content,
            overwrite_quality: self.config.overwrite_source_quality,
        };
        let now = format_ts(self.clock.now());

        let mut tx = db::begin_write(&self.pool).await?;

        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE actor_id = ? AND url = ? \
             ORDER BY COALESCE(published_at, retrieved_at) DESC, retrieved_at DESC, id DESC"
        ))
        .bind(&upsert.actor_id)
        .bind(&upsert.url)
        .fetch_all(&mut *tx)
        .await?;

        if let Some((first, duplicates)) = rows.split_first() {
            let canonical = source_from_row(first);
            for row in duplicates {
                let duplicate_id: String = row.get("id");
                self.merge_duplicate(&mut tx, &canonical.id, &duplicate_id)
                    .await?;
            }

            let mut merged = merge_source(&canonical, &incoming, policy, &now);
            if merged.source_fingerprint != canonical.source_fingerprint {
                if let Some(fingerprint) = merged.source_fingerprint.as_deref().filter(|f| !f.is_empty()) {
                    let holder: Option<String> = sqlx::query_scalar(
                        "SELECT id FROM sources \
                         WHERE actor_id = ? AND source_fingerprint = ? AND id <> ? LIMIT 1",
                    )
                    .bind(&upsert.actor_id)
                    .bind(fingerprint)
                    .bind(&canonical.id)
                    .fetch_optional(&mut *tx)
                    .await?;
                    if let Some(holder) = holder {
                        // Another URL already owns this content; keep ours.
                        debug!(
                            actor_id = %upsert.actor_id,
                            source_id = %canonical.id,
                            fingerprint_holder = %holder,
                            "fingerprint already taken, keeping existing"
                        );
                        merged.source_fingerprint = canonical.source_fingerprint.clone();
                    }
                }
            }
            if merged != canonical {
                write_source(&mut tx, &merged).await?;
            }
            tx.commit().await?;

            debug!(
                actor_id = %upsert.actor_id,
                source_id = %canonical.id,
                merged_duplicates = duplicates.len(),
                refreshed = policy.refresh_content,
                "source matched by url"
            );
            return Ok(canonical.id);
        }

        if let Some(fingerprint) = &incoming.fingerprint {
            let existing: Option<String> = sqlx::query_scalar(
                "SELECT id FROM sources WHERE actor_id = ? AND source_fingerprint = ? LIMIT 1",
            )
            .bind(&upsert.actor_id)
            .bind(fingerprint)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(id) = existing {
                tx.commit().await?;
                debug!(actor_id = %upsert.actor_id, source_id = %id, "source matched by fingerprint");
                return Ok(id);
            }
        }

        let id = self.ids.new_id();
        sqlx::query(&format!(
            "INSERT INTO sources ({SOURCE_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&id)
        .bind(&upsert.actor_id)
        .bind(&incoming.source_name)
        .bind(&upsert.url)
        .bind(&incoming.published_at)
        .bind(&now)
        .bind(&now)
        .bind(&incoming.body)
        .bind(&incoming.fingerprint)
        .bind(&incoming.title)
        .bind(&incoming.headline)
        .bind(&incoming.og_title)
        .bind(&incoming.html_title)
        .bind(&incoming.publisher)
        .bind(&incoming.site_name)
        .bind(&incoming.source_type)
        .bind(&incoming.source_tier)
        .bind(incoming.confidence_weight)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(actor_id = %upsert.actor_id, source_id = %id, url = %upsert.url, "source inserted");
        Ok(id)
    }

    /// Repoint references from `duplicate_id` to `canonical_id`, then delete
    /// the duplicate. Never the other way round.
    async fn merge_duplicate(
        &self,
        conn: &mut SqliteConnection,
        canonical_id: &str,
        duplicate_id: &str,
    ) -> Result<()> {
        for table in &self.config.reference_tables {
            sqlx::query(&format!(
                "UPDATE {table} SET source_id = ? WHERE source_id = ?"
            ))
            .bind(canonical_id)
            .bind(duplicate_id)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("repointing {table} from duplicate source"))?;
        }

        for table in SCORING_ATTACHMENTS {
            if db::table_exists(&mut *conn, table).await? {
                sqlx::query(&format!("DELETE FROM {table} WHERE source_id = ?"))
                    .bind(duplicate_id)
                    .execute(&mut *conn)
                    .await?;
            }
        }

        sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(duplicate_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn get_source(&self, source_id: &str) -> Result<Option<Source>> {
        let row = sqlx::query(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?"))
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(source_from_row))
    }

    /// All sources of an actor, newest first.
    pub async fn list_sources(&self, actor_id: &str) -> Result<Vec<Source>> {
        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE actor_id = ? \
             ORDER BY COALESCE(published_at, retrieved_at) DESC, id DESC"
        ))
        .bind(actor_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(source_from_row).collect())
    }

    /// Store an indicator, deduplicated on `(actor, type, normalized value)`.
    ///
    /// A repeat sighting bumps `seen_count` and `last_seen_at` and keeps the
    /// higher confidence.
    pub async fn upsert_ioc(&self, actor_id: &str, candidate: &IocCandidate) -> Result<IocOutcome> {
        let (ioc_type, normalized_value) = match normalize_ioc(&candidate.ioc_type, &candidate.value) {
            Ok(pair) => pair,
            Err(reason) => return Ok(IocOutcome::rejected(&candidate.ioc_type, reason)),
        };
        let now = format_ts(self.clock.now());
        let confidence = candidate.confidence_score.unwrap_or(0).clamp(0, 5);

        let mut tx = db::begin_write(&self.pool).await?;
        let existing: Option<(String, i64)> = sqlx::query_as(
            "SELECT id, seen_count FROM ioc_items \
             WHERE actor_id = ? AND ioc_type = ? AND normalized_value = ?",
        )
        .bind(actor_id)
        .bind(&ioc_type)
        .bind(&normalized_value)
        .fetch_optional(&mut *tx)
        .await?;

        let created = match existing {
            Some((id, seen_count)) => {
                sqlx::query(
                    "UPDATE ioc_items SET \
                        ioc_value = ?, \
                        confidence_score = MAX(confidence_score, ?), \
                        source_id = COALESCE(?, source_id), \
                        source_ref = COALESCE(?, source_ref), \
                        valid_from = COALESCE(?, valid_from), \
                        valid_until = COALESCE(?, valid_until), \
                        revoked = ?, \
                        last_seen_at = ?, \
                        seen_count = ? \
                     WHERE id = ?",
                )
                .bind(candidate.value.trim())
                .bind(confidence)
                .bind(&candidate.source_id)
                .bind(&candidate.source_ref)
                .bind(&candidate.valid_from)
                .bind(&candidate.valid_until)
                .bind(candidate.revoked)
                .bind(&now)
                .bind(seen_count + 1)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
                false
            }
            None => {
                sqlx::query(
                    "INSERT INTO ioc_items (id, actor_id, ioc_type, ioc_value, normalized_value, \
                        confidence_score, source_id, source_ref, extraction_method, valid_from, \
                        valid_until, revoked, first_seen_at, last_seen_at, seen_count) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)",
                )
                .bind(self.ids.new_id())
                .bind(actor_id)
                .bind(&ioc_type)
                .bind(candidate.value.trim())
                .bind(&normalized_value)
                .bind(confidence)
                .bind(&candidate.source_id)
                .bind(&candidate.source_ref)
                .bind(&candidate.extraction_method)
                .bind(&candidate.valid_from)
                .bind(&candidate.valid_until)
                .bind(candidate.revoked)
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                true
            }
        };
        tx.commit().await?;

        Ok(IocOutcome {
            stored: true,
            created,
            ioc_type,
            normalized_value,
            reason: String::new(),
        })
    }
}

async fn write_source(conn: &mut SqliteConnection, source: &Source) -> Result<()> {
    sqlx::query(
        "UPDATE sources SET body = ?, published_at = ?, retrieved_at = ?, source_fingerprint = ?, \
            title = ?, headline = ?, og_title = ?, html_title = ?, publisher = ?, site_name = ?, \
            source_type = ?, source_tier = ?, confidence_weight = ? \
         WHERE id = ?",
    )
    .bind(&source.body)
    .bind(&source.published_at)
    .bind(&source.retrieved_at)
    .bind(&source.source_fingerprint)
    .bind(&source.title)
    .bind(&source.headline)
    .bind(&source.og_title)
    .bind(&source.html_title)
    .bind(&source.publisher)
    .bind(&source.site_name)
    .bind(&source.source_type)
    .bind(&source.source_tier)
    .bind(source.confidence_weight)
    .bind(&source.id)
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) fn source_from_row(row: &SqliteRow) -> Source {
    Source {
        id: row.get("id"),
        actor_id: row.get("actor_id"),
        source_name: row.get("source_name"),
        url: row.get("url"),
        published_at: row.get("published_at"),
        retrieved_at: row.get("retrieved_at"),
        ingested_at: row.get("ingested_at"),
        body: row.get("body"),
        source_fingerprint: row.get("source_fingerprint"),
        title: row.get("title"),
        headline: row.get("headline"),
        og_title: row.get("og_title"),
        html_title: row.get("html_title"),
        publisher: row.get("publisher"),
        site_name: row.get("site_name"),
        source_type: row.get("source_type"),
        source_tier: row.get("source_tier"),
        confidence_weight: row.get("confidence_weight"),
    }
}

/// Options for `notebook ingest`.
#[derive(Debug, Clone, Default)]
pub struct IngestArgs {
    pub title: Option<String>,
    pub source_name: Option<String>,
    pub published_at: Option<String>,
    pub refresh: bool,
}

/// `notebook ingest`: upsert one source whose body is read from a file.
pub async fn run_ingest(
    config: &Config,
    actor_id: &str,
    url: &str,
    file: &Path,
    args: &IngestArgs,
) -> Result<()> {
    let body = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    if url.trim().is_empty() {
        anyhow::bail!("url must not be empty");
    }

    let pool = db::connect(config).await?;
    let store = SourceStore::new(
        pool.clone(),
        config.ingest.clone(),
        Arc::new(SystemClock),
        Arc::new(UuidGenerator),
    );

    let mut upsert = SourceUpsert::new(actor_id, url.trim(), body);
    upsert.title = args.title.clone();
    upsert.source_name = args.source_name.clone().unwrap_or_default();
    upsert.published_at = args.published_at.clone();
    upsert.refresh_existing_content = args.refresh;

    let source_id = store.upsert_source(&upsert).await?;
    println!("source {}", source_id);
    pool.close().await;
    Ok(())
}
