//! Ranked evidence queries.
//!
//! Joins an actor's sources with the optional scoring, resolution, and
//! entity tables and orders them by final score, newest first on ties.
//!
//! # Degraded mode
//!
//! When any scoring table is missing the ranking falls back to listing the
//! actor's sources by recency with zeroed scores and empty match fields.
//! Ranking never fails just because the scoring writer has not run.
//!
//! # Corroboration
//!
//! `require_corroboration` reads `corroboration_sources` out of each row's
//! feature map in-process. Because the predicate cannot be pushed into SQL,
//! the row limit is applied after filtering so a page is never short just
//! because uncorroborated rows were dropped.

use anyhow::Result;
use serde::Deserialize;
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::ingest::host_of;
use crate::models::{MatchInfo, RankedEvidence, ScoreBreakdown};
use crate::scoring::SCORING_TABLES;

pub const MAX_LIMIT: i64 = 200;

/// Conjunctive filters for [`rank_evidence`]. Blank strings mean "no filter".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvidenceFilter {
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub min_final_score: Option<f64>,
    #[serde(default)]
    pub source_tier: Option<String>,
    #[serde(default)]
    pub match_type: Option<String>,
    #[serde(default)]
    pub require_corroboration: bool,
    #[serde(default)]
    pub limit: Option<i64>,
}

fn lowered(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
}

/// Clamp a requested limit into `[1, 200]`.
pub fn clamp_limit(limit: Option<i64>, default: i64) -> i64 {
    limit.unwrap_or(default).clamp(1, MAX_LIMIT)
}

pub async fn scoring_available(pool: &SqlitePool) -> Result<bool> {
    for table in SCORING_TABLES {
        if !db::table_exists(pool, table).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Best evidence for an actor, highest final score first.
pub async fn rank_evidence(
    pool: &SqlitePool,
    actor_id: &str,
    filter: &EvidenceFilter,
    default_limit: i64,
) -> Result<Vec<RankedEvidence>> {
    let limit = clamp_limit(filter.limit, default_limit);

    if !scoring_available(pool).await? {
        tracing::debug!(actor_id, "scoring tables absent, ranking by recency");
        return list_by_recency(pool, actor_id, limit).await;
    }

    let min_score = filter.min_final_score.unwrap_or(0.0).clamp(0.0, 1.0);

    let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
        r#"
        SELECT
            s.id, s.source_name, s.url, s.published_at, s.ingested_at,
            s.source_type, s.source_tier, s.confidence_weight,
            COALESCE(sc.relevance_score, 0.0) AS relevance,
            COALESCE(sc.trust_score, 0.0) AS trust,
            COALESCE(sc.recency_score, 0.0) AS recency,
            COALESCE(sc.novelty_score, 0.0) AS novelty,
            COALESCE(sc.final_score, 0.0) AS final_score,
            COALESCE(ar.match_type, '') AS match_type,
            COALESCE(ar.matched_term, '') AS matched_term,
            COALESCE(ar.confidence, 0.0) AS match_confidence,
            COALESCE(sc.features_json, '{}') AS features_json,
            COUNT(se.id) AS entity_count
        FROM sources s
        LEFT JOIN source_scoring sc ON sc.source_id = s.id
        LEFT JOIN actor_resolution ar ON ar.source_id = s.id AND ar.actor_id = s.actor_id
        LEFT JOIN source_entities se ON se.source_id = s.id
        WHERE s.actor_id = "#,
    );
    query.push_bind(actor_id);
    query.push(" AND COALESCE(sc.final_score, 0.0) >= ");
    query.push_bind(min_score);

    if let Some(entity_type) = lowered(&filter.entity_type) {
        query.push(" AND se.entity_type = ");
        query.push_bind(entity_type);
    }
    if let Some(tier) = lowered(&filter.source_tier) {
        query.push(" AND LOWER(COALESCE(s.source_tier, '')) = ");
        query.push_bind(tier);
    }
    if let Some(match_type) = lowered(&filter.match_type) {
        query.push(" AND LOWER(COALESCE(ar.match_type, '')) = ");
        query.push_bind(match_type);
    }

    query.push(
        r#"
        GROUP BY s.id
        ORDER BY COALESCE(sc.final_score, 0.0) DESC,
                 COALESCE(s.published_at, s.ingested_at, s.retrieved_at) DESC,
                 s.id ASC
        "#,
    );
    if !filter.require_corroboration {
        query.push(" LIMIT ");
        query.push_bind(limit);
    }

    let rows = query.build().fetch_all(pool).await?;

    let mut results = Vec::with_capacity(rows.len().min(limit as usize));
    for row in &rows {
        let evidence = ranked_from_row(row);
        if filter.require_corroboration && evidence.corroboration_sources < 1 {
            continue;
        }
        results.push(evidence);
        if results.len() as i64 >= limit {
            break;
        }
    }
    Ok(results)
}

async fn list_by_recency(pool: &SqlitePool, actor_id: &str, limit: i64) -> Result<Vec<RankedEvidence>> {
    let rows = sqlx::query(
        r#"
        SELECT id, source_name, url, published_at, ingested_at,
               source_type, source_tier, confidence_weight
        FROM sources
        WHERE actor_id = ?
        ORDER BY COALESCE(published_at, ingested_at, retrieved_at) DESC, id ASC
        LIMIT ?
        "#,
    )
    .bind(actor_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let url: String = row.get("url");
            RankedEvidence {
                source_id: row.get("id"),
                source_name: row.get("source_name"),
                domain: host_of(&url).unwrap_or_default(),
                url,
                published_at: row.get("published_at"),
                ingested_at: row.get("ingested_at"),
                source_type: row.get("source_type"),
                source_tier: row.get("source_tier"),
                confidence_weight: row.get::<Option<i64>, _>("confidence_weight").unwrap_or(0),
                scores: ScoreBreakdown::default(),
                match_info: MatchInfo::default(),
                entity_count: 0,
                corroboration_sources: 0,
                features: Map::new(),
            }
        })
        .collect())
}

fn ranked_from_row(row: &SqliteRow) -> RankedEvidence {
    let url: String = row.get("url");
    let features_raw: String = row.get("features_json");
    let features = match serde_json::from_str::<Value>(&features_raw) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let corroboration_sources = corroboration_count(&features);

    RankedEvidence {
        source_id: row.get("id"),
        source_name: row.get("source_name"),
        domain: host_of(&url).unwrap_or_default(),
        url,
        published_at: row.get("published_at"),
        ingested_at: row.get("ingested_at"),
        source_type: row.get("source_type"),
        source_tier: row.get("source_tier"),
        confidence_weight: row.get::<Option<i64>, _>("confidence_weight").unwrap_or(0),
        scores: ScoreBreakdown {
            relevance: row.get("relevance"),
            trust: row.get("trust"),
            recency: row.get("recency"),
            novelty: row.get("novelty"),
            final_score: row.get("final_score"),
        },
        match_info: MatchInfo {
            match_type: row.get("match_type"),
            matched_term: row.get("matched_term"),
            confidence: row.get("match_confidence"),
        },
        entity_count: row.get("entity_count"),
        corroboration_sources,
        features,
    }
}

/// `corroboration_sources` from a feature map; missing or malformed is 0.
pub fn corroboration_count(features: &Map<String, Value>) -> i64 {
    match features.get("corroboration_sources") {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// `notebook evidence`: print the ranked list.
pub async fn run_evidence(
    config: &Config,
    actor_id: &str,
    filter: &EvidenceFilter,
    json: bool,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let results = rank_evidence(&pool, actor_id, filter, config.ranking.default_limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else if results.is_empty() {
        println!("No evidence.");
    } else {
        for (i, item) in results.iter().enumerate() {
            println!(
                "{}. [{:.3}] {} ({})",
                i + 1,
                item.scores.final_score,
                item.source_name,
                item.domain
            );
            println!(
                "    tier: {}  match: {}  entities: {}  corroborating: {}",
                item.source_tier.as_deref().unwrap_or("-"),
                if item.match_info.match_type.is_empty() {
                    "-"
                } else {
                    &item.match_info.match_type
                },
                item.entity_count,
                item.corroboration_sources
            );
            println!("    {}", item.url);
        }
    }

    pool.close().await;
    Ok(())
}
