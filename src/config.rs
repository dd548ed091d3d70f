//! TOML configuration.
//!
//! Every section except `[db]` is optional; missing keys fall back to the
//! defaults below. [`load_config`] parses and validates in one step.
//!
//! ```toml
//! [db]
//! path = "./data/notebook.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:8088"
//!
//! [ingest]
//! overwrite_source_quality = false
//! reference_tables = ["timeline_events", "question_updates", "ioc_items"]
//! high_confidence_domains = ["cisa.gov", "mandiant.com"]
//!
//! [scheduler]
//! loop_seconds = 300
//! batch_size = 8
//!
//! [rate_limit]
//! window_seconds = 60
//! heavy_per_window = 15
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8088".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Let a non-refresh upsert replace an already-set tier and confidence weight.
    #[serde(default)]
    pub overwrite_source_quality: bool,
    /// Tables with a `source_id` column that are repointed when duplicates merge.
    #[serde(default = "default_reference_tables")]
    pub reference_tables: Vec<String>,
    #[serde(default = "default_high_confidence_domains")]
    pub high_confidence_domains: Vec<String>,
    #[serde(default = "default_medium_confidence_domains")]
    pub medium_confidence_domains: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            overwrite_source_quality: false,
            reference_tables: default_reference_tables(),
            high_confidence_domains: default_high_confidence_domains(),
            medium_confidence_domains: default_medium_confidence_domains(),
        }
    }
}

fn default_reference_tables() -> Vec<String> {
    ["timeline_events", "question_updates", "ioc_items"]
        .iter()
        .map(|t| t.to_string())
        .collect()
}

fn default_high_confidence_domains() -> Vec<String> {
    ["cisa.gov", "fbi.gov", "ncsc.gov.uk", "attack.mitre.org", "jpcert.or.jp"]
        .iter()
        .map(|d| d.to_string())
        .collect()
}

fn default_medium_confidence_domains() -> Vec<String> {
    [
        "mandiant.com",
        "crowdstrike.com",
        "talosintelligence.com",
        "unit42.paloaltonetworks.com",
        "securelist.com",
        "microsoft.com",
        "proofpoint.com",
        "welivesecurity.com",
    ]
    .iter()
    .map(|d| d.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RankingConfig {
    /// Create the optional scoring tables during `init`.
    #[serde(default = "default_true")]
    pub provision_scoring_tables: bool,
    #[serde(default = "default_ranking_limit")]
    pub default_limit: i64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            provision_scoring_tables: true,
            default_limit: default_ranking_limit(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_ranking_limit() -> i64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_sync_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_lookback_hours")]
    pub default_lookback_hours: i64,
    /// Bearer token used when the refresh pipeline replays an actor's
    /// previously synced collections.
    #[serde(default)]
    pub bearer_token: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_sync_timeout(),
            default_lookback_hours: default_lookback_hours(),
            bearer_token: None,
        }
    }
}

fn default_sync_timeout() -> u64 {
    20
}
fn default_lookback_hours() -> i64 {
    24
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_loop_seconds")]
    pub loop_seconds: u64,
    #[serde(default = "default_min_interval_hours")]
    pub min_interval_hours: i64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_stale_minutes")]
    pub stale_recovery_minutes: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            loop_seconds: default_loop_seconds(),
            min_interval_hours: default_min_interval_hours(),
            batch_size: default_batch_size(),
            stale_recovery_minutes: default_stale_minutes(),
        }
    }
}

fn default_loop_seconds() -> u64 {
    300
}
fn default_min_interval_hours() -> i64 {
    6
}
fn default_batch_size() -> usize {
    8
}
fn default_stale_minutes() -> i64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "default_per_window")]
    pub default_per_window: usize,
    #[serde(default = "default_heavy_per_window")]
    pub heavy_per_window: usize,
    /// Full prune of expired keys every N admission checks.
    #[serde(default = "default_cleanup_every")]
    pub cleanup_every: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_seconds: default_window_seconds(),
            default_per_window: default_per_window(),
            heavy_per_window: default_heavy_per_window(),
            cleanup_every: default_cleanup_every(),
        }
    }
}

fn default_window_seconds() -> u64 {
    60
}
fn default_per_window() -> usize {
    60
}
fn default_heavy_per_window() -> usize {
    15
}
fn default_cleanup_every() -> u64 {
    512
}

impl Config {
    /// A config with every section defaulted, pointing at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            server: ServerConfig::default(),
            ingest: IngestConfig::default(),
            ranking: RankingConfig::default(),
            sync: SyncConfig::default(),
            scheduler: SchedulerConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    for table in &config.ingest.reference_tables {
        if !is_sql_identifier(table) {
            anyhow::bail!("ingest.reference_tables: '{}' is not a valid table name", table);
        }
    }

    if config.ranking.default_limit < 1 || config.ranking.default_limit > 200 {
        anyhow::bail!("ranking.default_limit must be in [1, 200]");
    }

    if config.sync.timeout_secs == 0 {
        anyhow::bail!("sync.timeout_secs must be > 0");
    }

    if config.rate_limit.window_seconds == 0 {
        anyhow::bail!("rate_limit.window_seconds must be > 0");
    }
    if config.rate_limit.default_per_window == 0 || config.rate_limit.heavy_per_window == 0 {
        anyhow::bail!("rate_limit per-window limits must be >= 1");
    }
    if config.rate_limit.cleanup_every == 0 {
        anyhow::bail!("rate_limit.cleanup_every must be >= 1");
    }

    Ok(())
}

fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
