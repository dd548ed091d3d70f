//! HTTP routes driven in-process through the router.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use common::{setup, FakeCollection, TestEnv};
use intel_notebook::collection_sync::CollectionSync;
use intel_notebook::config::RateLimitConfig;
use intel_notebook::generation::GenerationService;
use intel_notebook::rate_limit::RateLimiter;
use intel_notebook::server::{build_router, AppState};
use intel_notebook::stix::StixBundleImporter;
use intel_notebook::traits::GenerationPipeline;
use serde_json::{json, Value};
use tower::ServiceExt;

struct NoopPipeline;

#[async_trait]
impl GenerationPipeline for NoopPipeline {
    async fn import_sources(&self, _actor_id: &str) -> Result<i64> {
        Ok(0)
    }

    async fn build_notebook(&self, _actor_id: &str) -> Result<()> {
        Ok(())
    }
}

fn app(env: &TestEnv, heavy_per_window: usize) -> (Router, GenerationService) {
    let sync = CollectionSync::new(
        env.store(),
        FakeCollection::with(&[]),
        Arc::new(StixBundleImporter),
    );
    let generation = GenerationService::new(
        env.pool.clone(),
        env.journal(),
        env.clock.clone(),
        Arc::new(NoopPipeline),
    );
    let limiter = RateLimiter::new(&RateLimitConfig {
        heavy_per_window,
        ..RateLimitConfig::default()
    });
    let state = AppState {
        config: Arc::new(env.config.clone()),
        pool: env.pool.clone(),
        clock: env.clock.clone(),
        ids: env.ids.clone(),
        sync: Arc::new(sync),
        generation: generation.clone(),
        limiter: Arc::new(limiter),
    };
    (build_router(state), generation)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value, axum::http::HeaderMap) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", "198.51.100.4");
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json, headers)
}

#[tokio::test]
async fn test_health() {
    let env = setup(false).await;
    let (app, _) = app(&env, 30);
    let (status, body, _) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_create_and_list_actors() {
    let env = setup(false).await;
    let (app, _) = app(&env, 30);

    let (status, body, _) = send(
        &app,
        "POST",
        "/actors",
        Some(json!({"display_name": "Scattered Spider"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["display_name"], "Scattered Spider");
    assert_eq!(body["is_tracked"], true);

    let (status, body, _) = send(&app, "POST", "/actors", Some(json!({"display_name": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body, _) = send(&app, "GET", "/actors", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_source_upsert_and_evidence() {
    let env = setup(false).await;
    let actor = env.actor("Scattered Spider").await;
    let (app, _) = app(&env, 30);
    let uri = format!("/actors/{}/sources", actor);

    let source = json!({
        "url": "https://news.example/spider",
        "source_name": "News",
        "title": "Help desk social engineering",
        "body": "Callers impersonated employees to reset credentials.",
        "published_at": "2024-04-30"
    });
    let (status, first, _) = send(&app, "POST", &uri, Some(source.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let (_, second, _) = send(&app, "POST", &uri, Some(source)).await;
    assert_eq!(first["source_id"], second["source_id"]);

    let (status, body, _) = send(&app, "POST", &uri, Some(json!({"url": " ", "body": "x"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["message"], "url must not be empty");

    let (status, body, _) = send(&app, "GET", &format!("/actors/{}/evidence?limit=5", actor), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scoring_available"], false);
    assert_eq!(body["count"], 1);
    assert_eq!(body["items"][0]["source_id"], first["source_id"]);
    assert_eq!(body["items"][0]["domain"], "news.example");
}

#[tokio::test]
async fn test_uploaded_source_is_scored() {
    let env = setup(true).await;
    let actor = env.actor("Scattered Spider").await;
    let (app, _) = app(&env, 30);

    let source = json!({
        "url": "https://news.example/spider-helpdesk",
        "source_name": "News",
        "title": "Scattered Spider hits help desks",
        "body": "Callers impersonated employees to reset credentials at two retailers.",
        "published_at": "2024-04-30"
    });
    let (status, created, _) = send(&app, "POST", &format!("/actors/{}/sources", actor), Some(source)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(env.count("SELECT COUNT(*) FROM source_scoring").await, 1);

    let (status, body, _) = send(&app, "GET", &format!("/actors/{}/evidence", actor), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scoring_available"], true);
    assert_eq!(body["items"][0]["source_id"], created["source_id"]);
    assert_eq!(body["items"][0]["match"]["type"], "title_match");
    assert!(body["items"][0]["scores"]["final"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn test_unknown_actor_is_404() {
    let env = setup(false).await;
    let (app, _) = app(&env, 30);

    let (status, body, _) = send(&app, "GET", "/actors/ghost/evidence", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
    assert_eq!(body["error"]["message"], "actor not found: ghost");

    let (status, _, _) = send(&app, "GET", "/actors/ghost/jobs/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_taxii_sync_route() {
    let env = setup(false).await;
    let actor = env.actor("Scattered Spider").await;
    let (app, _) = app(&env, 30);
    let uri = format!("/actors/{}/taxii/sync", actor);

    let (status, _, _) = send(&app, "POST", &uri, Some(json!({"collection_url": ""}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body, _) = send(
        &app,
        "POST",
        &uri,
        Some(json!({"collection_url": "https://taxii.example/c", "lookback_hours": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["added_after"], "2024-05-01T10:00:00.000000Z");

    let (status, body, _) = send(&app, "GET", &format!("/actors/{}/taxii/runs?limit=5", actor), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["status"], "completed");
    assert_eq!(body[0]["run_id"], "id-0002");
}

#[tokio::test]
async fn test_refresh_returns_accepted_job() {
    let env = setup(false).await;
    let actor = env.actor("Scattered Spider").await;
    let (app, generation) = app(&env, 30);

    let (status, job, _) = send(&app, "POST", &format!("/actors/{}/refresh", actor), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(job["trigger_type"], "manual_refresh");
    let job_id = job["job_id"].as_str().unwrap().to_string();

    for _ in 0..500 {
        if !generation.is_running(&actor).await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (status, detail, _) = send(&app, "GET", &format!("/actors/{}/jobs/{}", actor, job_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["status"], "completed");
    assert_eq!(detail["phases"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_heavy_writes_are_rate_limited() {
    let env = setup(false).await;
    let actor = env.actor("Scattered Spider").await;
    let (app, _) = app(&env, 2);
    let uri = format!("/actors/{}/sources", actor);
    let body = json!({"url": "https://news.example/a", "body": "Short note."});

    for _ in 0..2 {
        let (status, _, _) = send(&app, "POST", &uri, Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, error, headers) = send(&app, "POST", &uri, Some(body)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(error["error"]["code"], "rate_limited");
    let retry_after: u64 = headers[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
    assert!((1..=61).contains(&retry_after));
    assert_eq!(headers["x-ratelimit-limit"], "2");

    // Reads and default-bucket writes are unaffected.
    let (status, _, _) = send(&app, "GET", &format!("/actors/{}/evidence", actor), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(&app, "POST", "/actors", Some(json!({"display_name": "Other"}))).await;
    assert_eq!(status, StatusCode::CREATED);
}
