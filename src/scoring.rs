//! Scoring writer for the optional evidence tables.
//!
//! Computes the relevance / trust / recency / novelty breakdown for one
//! source, extracts the entities it mentions, counts how many other sources
//! of the same actor share those entities, and persists everything into
//! `source_scoring`, `actor_resolution`, and `source_entities`.
//!
//! Deployments without the scoring tables skip this entirely; the ranking
//! read path degrades on its own.

use anyhow::Result;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::db;
use crate::fingerprint::truncate_chars;
use crate::ingest::host_of;
use crate::models::{format_ts, parse_ts, ScoreBreakdown, Source};
use crate::traits::IdGenerator;

const RECENCY_HORIZON_DAYS: f64 = 180.0;
const UNKNOWN_RECENCY: f64 = 0.4;
const CORROBORATION_ENTITY_LIMIT: usize = 40;
const CORROBORATION_SATURATION: f64 = 3.0;
const STORED_ENTITY_LIMIT: usize = 200;
const EXTRACTOR: &str = "ingest-v1";

pub const SCORING_TABLES: &[&str] = &["source_scoring", "actor_resolution", "source_entities"];

static ENTITY_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    vec![
        ("ip", Regex::new(r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b").expect("valid regex")),
        (
            "hash",
            Regex::new(r"\b[a-fA-F0-9]{64}\b|\b[a-fA-F0-9]{40}\b|\b[a-fA-F0-9]{32}\b")
                .expect("valid regex"),
        ),
        (
            "domain",
            Regex::new(r"\b(?:[a-zA-Z0-9-]+\.)+[a-zA-Z]{2,}\b").expect("valid regex"),
        ),
        (
            "url",
            Regex::new(r#"(?i)\bhttps?://[^\s<>"']+\b"#).expect("valid regex"),
        ),
        (
            "email",
            Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("valid regex"),
        ),
        ("ttp", Regex::new(r"(?i)\bT[0-9]{4}(?:\.[0-9]{3})?\b").expect("valid regex")),
    ]
});

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtractedEntity {
    pub entity_type: &'static str,
    pub value: String,
    pub normalized: String,
}

/// How a source was tied to its actor.
#[derive(Debug, Clone, PartialEq)]
pub struct ActorMatch {
    pub match_type: &'static str,
    pub matched_term: String,
    pub relevance: f64,
}

/// Match the actor's names against a source's title and body.
pub fn match_actor(terms: &[String], title: &str, body: &str) -> ActorMatch {
    let title = title.to_lowercase();
    let body = body.to_lowercase();
    let terms: Vec<&str> = terms.iter().map(|t| t.trim()).filter(|t| !t.is_empty()).collect();

    for term in &terms {
        if title.contains(&term.to_lowercase()) {
            return ActorMatch {
                match_type: "title_match",
                matched_term: truncate_chars(term, 120),
                relevance: 1.0,
            };
        }
    }
    for term in &terms {
        if body.contains(&term.to_lowercase()) {
            return ActorMatch {
                match_type: "actor_term",
                matched_term: truncate_chars(term, 120),
                relevance: 0.75,
            };
        }
    }
    ActorMatch {
        match_type: "unmatched",
        matched_term: terms.first().map(|t| truncate_chars(t, 120)).unwrap_or_default(),
        relevance: 0.2,
    }
}

/// Linear decay over 180 days; 0.4 when the date is unknown.
pub fn recency_score(published_at: Option<&str>, now: DateTime<Utc>) -> f64 {
    let published = match published_at.and_then(parse_ts) {
        Some(ts) => ts,
        None => return UNKNOWN_RECENCY,
    };
    let age_days = ((now - published).num_seconds() as f64 / 86_400.0).max(0.0);
    round3((1.0 - (age_days / RECENCY_HORIZON_DAYS).min(1.0)).max(0.0))
}

pub fn trust_score(confidence_weight: Option<i64>) -> f64 {
    (confidence_weight.unwrap_or(0) as f64 / 4.0).clamp(0.0, 1.0)
}

pub fn final_score(relevance: f64, trust: f64, recency: f64, novelty: f64, corroborating: i64) -> f64 {
    let corroboration = (corroborating as f64 / CORROBORATION_SATURATION).clamp(0.0, 1.0);
    round3(relevance * 0.4 + trust * 0.18 + recency * 0.22 + novelty * 0.1 + corroboration * 0.1)
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Distinct, non-benign entities mentioned in `text`, in pattern order.
pub fn extract_entities(text: &str) -> Vec<ExtractedEntity> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    for (entity_type, pattern) in ENTITY_PATTERNS.iter() {
        let entity_type: &'static str = entity_type;
        for m in pattern.find_iter(text) {
            let value = m.as_str().trim();
            let normalized = normalize_entity(entity_type, value);
            if normalized.is_empty() || is_benign(entity_type, &normalized) {
                continue;
            }
            if seen.insert((entity_type, normalized.clone())) {
                found.push(ExtractedEntity {
                    entity_type,
                    value: value.to_string(),
                    normalized,
                });
            }
        }
    }
    found
}

fn normalize_entity(entity_type: &str, value: &str) -> String {
    match entity_type {
        "url" => normalize_url(value),
        "domain" => {
            let candidate = value.trim_matches('.').to_lowercase();
            match candidate.strip_prefix("www.") {
                Some(rest) if rest.contains('.') => rest.to_string(),
                _ => candidate,
            }
        }
        "email" | "hash" => value.to_lowercase(),
        "ttp" => value.to_uppercase(),
        _ => value.to_string(),
    }
}

/// Lowercase scheme and host, drop `utm_*` parameters and the fragment,
/// sort the remaining query pairs.
fn normalize_url(value: &str) -> String {
    let mut url = match reqwest::Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url,
        _ => return value.to_string(),
    };
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, v)| !k.to_lowercase().starts_with("utm_") && !v.is_empty())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    url.set_fragment(None);
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    url.to_string().trim_end_matches('/').to_string()
}

fn is_benign(entity_type: &str, normalized: &str) -> bool {
    let value = normalized.trim().to_lowercase();
    if value.is_empty() {
        return true;
    }
    if matches!(entity_type, "domain" | "url")
        && ["example.com", "example.org", "example.net", "localhost"]
            .iter()
            .any(|marker| value.contains(marker))
    {
        return true;
    }
    entity_type == "domain" && (value.ends_with(".local") || value.ends_with(".lan"))
}

/// Distinct other sources of the actor sharing any of the first 40 entities.
async fn corroborating_sources(
    pool: &SqlitePool,
    actor_id: &str,
    source_id: &str,
    entities: &[ExtractedEntity],
) -> Result<i64> {
    let mut corroborating = HashSet::new();
    for entity in entities.iter().take(CORROBORATION_ENTITY_LIMIT) {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT se.source_id FROM source_entities se \
             JOIN sources s ON s.id = se.source_id \
             WHERE s.actor_id = ? AND se.entity_type = ? AND se.normalized_value = ? \
               AND se.source_id <> ? \
             LIMIT 50",
        )
        .bind(actor_id)
        .bind(entity.entity_type)
        .bind(&entity.normalized)
        .bind(source_id)
        .fetch_all(pool)
        .await?;
        corroborating.extend(rows);
    }
    Ok(corroborating.len() as i64)
}

/// Novelty used until a source has history to compare against.
pub const DEFAULT_NOVELTY: f64 = 0.5;

/// Score one source and persist its scoring attachment.
///
/// Returns `None` without writing when the scoring tables are absent.
pub async fn score_source(
    pool: &SqlitePool,
    ids: &dyn IdGenerator,
    now: DateTime<Utc>,
    source: &Source,
    actor_terms: &[String],
    novelty: f64,
) -> Result<Option<ScoreBreakdown>> {
    for table in SCORING_TABLES {
        if !db::table_exists(pool, table).await? {
            return Ok(None);
        }
    }

    let title = [&source.title, &source.headline, &source.og_title, &source.html_title]
        .into_iter()
        .flatten()
        .next()
        .map(String::as_str)
        .unwrap_or("");
    let actor_match = match_actor(actor_terms, title, &source.body);
    let relevance = actor_match.relevance.clamp(0.0, 1.0);
    let trust = trust_score(source.confidence_weight);
    let recency = recency_score(source.published_at.as_deref(), now);
    let novelty = novelty.clamp(0.0, 1.0);

    let entities = extract_entities(&source.body);
    let corroboration = corroborating_sources(pool, &source.actor_id, &source.id, &entities).await?;
    let final_value = final_score(relevance, trust, recency, novelty, corroboration);
    let scored_at = format_ts(now);

    let features = json!({
        "match_type": actor_match.match_type,
        "matched_terms": [actor_match.matched_term],
        "source_url": source.url,
        "corroboration_sources": corroboration,
        "entity_count": entities.len(),
    });
    let explanation = json!({
        "source_host": host_of(&source.url).unwrap_or_default(),
    });

    let mut tx = db::begin_write(pool).await?;

    sqlx::query("DELETE FROM actor_resolution WHERE actor_id = ? AND source_id = ?")
        .bind(&source.actor_id)
        .bind(&source.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO actor_resolution (id, source_id, actor_id, match_type, matched_term, \
            confidence, explanation_json, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(ids.new_id())
    .bind(&source.id)
    .bind(&source.actor_id)
    .bind(actor_match.match_type)
    .bind(&actor_match.matched_term)
    .bind(relevance)
    .bind(explanation.to_string())
    .bind(&scored_at)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM source_entities WHERE source_id = ?")
        .bind(&source.id)
        .execute(&mut *tx)
        .await?;
    for entity in entities.iter().take(STORED_ENTITY_LIMIT) {
        sqlx::query(
            "INSERT INTO source_entities (id, source_id, entity_type, entity_value, \
                normalized_value, confidence, extractor, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(ids.new_id())
        .bind(&source.id)
        .bind(entity.entity_type)
        .bind(truncate_chars(&entity.value, 500))
        .bind(truncate_chars(&entity.normalized, 500))
        .bind(relevance)
        .bind(EXTRACTOR)
        .bind(&scored_at)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        "INSERT INTO source_scoring (source_id, relevance_score, trust_score, recency_score, \
            novelty_score, final_score, scored_at, features_json) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(source_id) DO UPDATE SET \
            relevance_score = excluded.relevance_score, \
            trust_score = excluded.trust_score, \
            recency_score = excluded.recency_score, \
            novelty_score = excluded.novelty_score, \
            final_score = excluded.final_score, \
            scored_at = excluded.scored_at, \
            features_json = excluded.features_json",
    )
    .bind(&source.id)
    .bind(relevance)
    .bind(trust)
    .bind(recency)
    .bind(novelty)
    .bind(final_value)
    .bind(&scored_at)
    .bind(features.to_string())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(Some(ScoreBreakdown {
        relevance,
        trust,
        recency,
        novelty,
        final_score: final_value,
    }))
}
