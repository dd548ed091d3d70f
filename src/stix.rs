//! STIX 2.1 bundle import.
//!
//! Indicators whose pattern is a single simple comparison become IOCs;
//! notes and reports with text become sources. Everything is written
//! through [`SourceStore`] so re-importing the same bundle is a no-op apart
//! from sighting counters.

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::ingest::{IocCandidate, SourceStore};
use crate::models::{Bundle, ImportCounts, SourceUpsert};
use crate::traits::BundleImporter;

static PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"^\[domain-name:value = '([^']+)'\]$", "domain"),
        (r"^\[ipv4-addr:value = '([^']+)'\]$", "ip"),
        (r"^\[ipv6-addr:value = '([^']+)'\]$", "ip"),
        (r"^\[url:value = '([^']+)'\]$", "url"),
        (r"^\[email-addr:value = '([^']+)'\]$", "email"),
        (
            r"^\[file:hashes\.'(?:MD5|SHA-1|SHA-256|md5|sha1|sha256)' = '([^']+)'\]$",
            "hash",
        ),
    ]
    .into_iter()
    .map(|(pattern, kind)| (Regex::new(pattern).expect("valid regex"), kind))
    .collect()
});

/// `(ioc_type, value)` from a single-comparison STIX pattern.
pub fn indicator_from_pattern(pattern: &str) -> Option<(&'static str, String)> {
    let text = pattern.trim();
    PATTERNS.iter().find_map(|(regex, kind)| {
        regex
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| (*kind, m.as_str().to_string()))
    })
}

/// STIX confidence (0-100) to the 1-5 IOC scale; unparsable is 0.
pub fn confidence_from_stix(confidence: Option<&Value>) -> i64 {
    let value = match confidence {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match value {
        None => 0,
        Some(v) if v >= 80 => 5,
        Some(v) if v >= 60 => 4,
        Some(v) if v >= 40 => 3,
        Some(v) if v >= 20 => 2,
        Some(_) => 1,
    }
}

fn text_field<'a>(object: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a str> {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn first_reference_url(object: &serde_json::Map<String, Value>) -> Option<String> {
    object
        .get("external_references")?
        .as_array()?
        .iter()
        .filter_map(Value::as_object)
        .find_map(|reference| text_field(reference, "url").map(str::to_string))
}

/// The default bundle importer.
#[derive(Debug, Clone, Copy, Default)]
pub struct StixBundleImporter;

impl StixBundleImporter {
    async fn import_indicator(
        &self,
        store: &SourceStore,
        actor_id: &str,
        object: &serde_json::Map<String, Value>,
    ) -> Result<bool> {
        let Some((ioc_type, value)) =
            text_field(object, "pattern").and_then(indicator_from_pattern)
        else {
            return Ok(false);
        };
        let candidate = IocCandidate {
            ioc_type: ioc_type.to_string(),
            value,
            source_id: None,
            source_ref: text_field(object, "id").map(str::to_string),
            extraction_method: "stix-import".to_string(),
            confidence_score: Some(confidence_from_stix(object.get("confidence"))),
            valid_from: text_field(object, "valid_from").map(str::to_string),
            valid_until: text_field(object, "valid_until").map(str::to_string),
            revoked: object.get("revoked").and_then(Value::as_bool).unwrap_or(false),
        };
        Ok(store.upsert_ioc(actor_id, &candidate).await?.stored)
    }

    async fn import_document(
        &self,
        store: &SourceStore,
        actor_id: &str,
        kind: &str,
        object: &serde_json::Map<String, Value>,
    ) -> Result<bool> {
        let (body_key, title_key, published_key) = match kind {
            "note" => ("content", "abstract", "created"),
            _ => ("description", "name", "published"),
        };
        let Some(body) = text_field(object, body_key) else {
            return Ok(false);
        };

        let object_id = text_field(object, "id")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}--{}", kind, store.ids().new_id()));
        let url = first_reference_url(object).unwrap_or_else(|| format!("stix:{object_id}"));

        let mut upsert = SourceUpsert::new(actor_id, url, body);
        upsert.source_name = format!("STIX {kind}");
        upsert.title = text_field(object, title_key).map(str::to_string);
        upsert.published_at = text_field(object, published_key)
            .or_else(|| text_field(object, "modified"))
            .map(str::to_string);
        upsert.source_type = Some(format!("stix_{kind}"));
        store.upsert_source(&upsert).await?;
        Ok(true)
    }
}

#[async_trait]
impl BundleImporter for StixBundleImporter {
    async fn import_bundle(
        &self,
        store: &SourceStore,
        actor_id: &str,
        bundle: &Bundle,
    ) -> Result<ImportCounts> {
        let mut counts = ImportCounts::default();

        for item in &bundle.objects {
            let Some(object) = item.as_object() else {
                counts.skipped += 1;
                continue;
            };
            let kind = text_field(object, "type").map(str::to_lowercase).unwrap_or_default();
            match kind.as_str() {
                "indicator" => {
                    if self.import_indicator(store, actor_id, object).await? {
                        counts.imported_iocs += 1;
                    } else {
                        counts.skipped += 1;
                    }
                }
                "note" | "report" => {
                    if self.import_document(store, actor_id, &kind, object).await? {
                        counts.imported_notes += 1;
                    } else {
                        counts.skipped += 1;
                    }
                }
                _ => counts.skipped += 1,
            }
        }

        tracing::debug!(
            actor_id,
            bundle_id = %bundle.id,
            imported_iocs = counts.imported_iocs,
            imported_notes = counts.imported_notes,
            skipped = counts.skipped,
            "bundle imported"
        );
        Ok(counts)
    }
}
