//! Evidence ranking over the scoring tables, and its degraded mode.

mod common;

use common::{setup, TestEnv, T0};
use intel_notebook::evidence::{rank_evidence, scoring_available, EvidenceFilter};
use intel_notebook::models::SourceUpsert;
use intel_notebook::scoring::score_source;
use intel_notebook::traits::Clock;

async fn add_source(env: &TestEnv, actor: &str, url: &str, title: &str, body: &str, published: &str) -> String {
    let mut upsert = SourceUpsert::new(actor, url, body);
    upsert.title = Some(title.to_string());
    upsert.published_at = Some(published.to_string());
    env.store().upsert_source(&upsert).await.unwrap()
}

async fn score(env: &TestEnv, source_id: &str, terms: &[String]) {
    let source = env.store().get_source(source_id).await.unwrap().unwrap();
    score_source(&env.pool, &*env.ids, env.clock.now(), &source, terms, 0.5)
        .await
        .unwrap()
        .expect("scoring tables present");
}

async fn set_score(env: &TestEnv, source_id: &str, final_score: f64, features: &str) {
    sqlx::query(
        "INSERT INTO source_scoring (source_id, final_score, scored_at, features_json) VALUES (?, ?, ?, ?) \
         ON CONFLICT(source_id) DO UPDATE SET final_score = excluded.final_score, features_json = excluded.features_json",
    )
    .bind(source_id)
    .bind(final_score)
    .bind(T0)
    .bind(features)
    .execute(&env.pool)
    .await
    .unwrap();
}

#[tokio::test]
async fn test_degraded_mode_ranks_by_recency() {
    let env = setup(false).await;
    let actor = env.actor("Sandworm").await;
    assert!(!scoring_available(&env.pool).await.unwrap());

    let old = add_source(&env, &actor, "https://a.example/1", "Old", "Old report body.", "2024-01-01").await;
    let new = add_source(&env, &actor, "https://a.example/2", "New", "New report body.", "2024-04-01").await;
    let mid = add_source(&env, &actor, "https://a.example/3", "Mid", "Mid report body.", "2024-02-15").await;

    let results = rank_evidence(&env.pool, &actor, &EvidenceFilter::default(), 100)
        .await
        .unwrap();
    let ids: Vec<&str> = results.iter().map(|r| r.source_id.as_str()).collect();
    assert_eq!(ids, vec![new.as_str(), mid.as_str(), old.as_str()]);
    for item in &results {
        assert_eq!(item.scores.final_score, 0.0);
        assert_eq!(item.match_info.match_type, "");
        assert_eq!(item.corroboration_sources, 0);
    }
}

#[tokio::test]
async fn test_scored_results_are_non_increasing_and_filterable() {
    let env = setup(true).await;
    let actor = env.actor("Sandworm").await;
    let terms = vec!["Sandworm".to_string()];

    let titled = add_source(
        &env,
        &actor,
        "https://www.cisa.gov/advisory",
        "Sandworm resumes attacks on grid operators",
        "Operators saw beacons to 45.77.12.9 over several weeks.",
        "2024-04-28",
    )
    .await;
    let mentioned = add_source(
        &env,
        &actor,
        "https://blog.unknown.example/post",
        "Weekly roundup",
        "Among other items, sandworm tooling reappeared.",
        "2024-04-20",
    )
    .await;
    let unrelated = add_source(
        &env,
        &actor,
        "https://blog.unknown.example/other",
        "Patch Tuesday notes",
        "Nothing about the actor here at all.",
        "2024-04-30",
    )
    .await;
    for id in [&titled, &mentioned, &unrelated] {
        score(&env, id, &terms).await;
    }

    let results = rank_evidence(&env.pool, &actor, &EvidenceFilter::default(), 100)
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].source_id, titled);
    assert_eq!(results[0].match_info.match_type, "title_match");
    assert_eq!(results[0].domain, "cisa.gov");
    for pair in results.windows(2) {
        assert!(pair[0].scores.final_score >= pair[1].scores.final_score);
    }

    let by_match = rank_evidence(
        &env.pool,
        &actor,
        &EvidenceFilter {
            match_type: Some("ACTOR_TERM".into()),
            ..Default::default()
        },
        100,
    )
    .await
    .unwrap();
    assert_eq!(by_match.len(), 1);
    assert_eq!(by_match[0].source_id, mentioned);

    let by_entity = rank_evidence(
        &env.pool,
        &actor,
        &EvidenceFilter {
            entity_type: Some("ip".into()),
            ..Default::default()
        },
        100,
    )
    .await
    .unwrap();
    assert_eq!(by_entity.len(), 1);
    assert_eq!(by_entity[0].source_id, titled);

    let by_tier = rank_evidence(
        &env.pool,
        &actor,
        &EvidenceFilter {
            source_tier: Some("high".into()),
            ..Default::default()
        },
        100,
    )
    .await
    .unwrap();
    assert_eq!(by_tier.len(), 1);

    let limited = rank_evidence(
        &env.pool,
        &actor,
        &EvidenceFilter {
            limit: Some(2),
            ..Default::default()
        },
        100,
    )
    .await
    .unwrap();
    assert_eq!(limited.len(), 2);
}

#[tokio::test]
async fn test_shared_entities_corroborate() {
    let env = setup(true).await;
    let actor = env.actor("APT28").await;
    let terms = vec!["APT28".to_string()];

    let a = add_source(&env, &actor, "https://r.example/a", "APT28 phishing wave", "Lures pointed at 45.77.12.9 for staging.", "2024-04-01").await;
    let b = add_source(&env, &actor, "https://r.example/b", "Credential theft update", "Same staging host 45.77.12.9 observed again.", "2024-04-02").await;
    let lone = add_source(&env, &actor, "https://r.example/c", "Unrelated note", "No shared infrastructure in this one.", "2024-04-03").await;

    score(&env, &a, &terms).await;
    score(&env, &b, &terms).await;
    score(&env, &lone, &terms).await;
    // Rescore the first source now that the others' entities exist.
    score(&env, &a, &terms).await;

    let results = rank_evidence(
        &env.pool,
        &actor,
        &EvidenceFilter {
            require_corroboration: true,
            ..Default::default()
        },
        100,
    )
    .await
    .unwrap();
    let mut ids: Vec<String> = results.iter().map(|r| r.source_id.clone()).collect();
    ids.sort();
    let mut expected = vec![a.clone(), b.clone()];
    expected.sort();
    assert_eq!(ids, expected);
    assert!(results.iter().all(|r| r.corroboration_sources == 1));
}

#[tokio::test]
async fn test_corroboration_filter_reads_feature_map_and_limits_after_filtering() {
    let env = setup(true).await;
    let actor = env.actor("Lazarus").await;

    let top = add_source(&env, &actor, "https://f.example/1", "One", "First body.", "2024-04-01").await;
    let second = add_source(&env, &actor, "https://f.example/2", "Two", "Second body.", "2024-04-01").await;
    let corroborated = add_source(&env, &actor, "https://f.example/3", "Three", "Third body.", "2024-04-01").await;
    set_score(&env, &top, 0.9, r#"{"corroboration_sources": 0}"#).await;
    set_score(&env, &second, 0.8, "not json").await;
    set_score(&env, &corroborated, 0.5, r#"{"corroboration_sources": 2}"#).await;

    let results = rank_evidence(
        &env.pool,
        &actor,
        &EvidenceFilter {
            require_corroboration: true,
            limit: Some(1),
            ..Default::default()
        },
        100,
    )
    .await
    .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].source_id, corroborated);
    assert_eq!(results[0].corroboration_sources, 2);
}

#[tokio::test]
async fn test_ties_break_on_newest_timestamp() {
    let env = setup(true).await;
    let actor = env.actor("Kimsuky").await;

    let older = add_source(&env, &actor, "https://t.example/1", "Older", "Older body.", "2024-03-01").await;
    let newer = add_source(&env, &actor, "https://t.example/2", "Newer", "Newer body.", "2024-04-01").await;
    set_score(&env, &older, 0.5, "{}").await;
    set_score(&env, &newer, 0.5, "{}").await;

    let results = rank_evidence(&env.pool, &actor, &EvidenceFilter::default(), 100)
        .await
        .unwrap();
    assert_eq!(results[0].source_id, newer);
    assert_eq!(results[1].source_id, older);

    let above = rank_evidence(
        &env.pool,
        &actor,
        &EvidenceFilter {
            min_final_score: Some(0.6),
            ..Default::default()
        },
        100,
    )
    .await
    .unwrap();
    assert!(above.is_empty());
}
