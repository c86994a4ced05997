mod support;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use plancache::cache::CacheStore;
use plancache::infra::http::{HttpState, build_router};

use support::{FixtureSource, Harness, spawn_harness};

const ADMIN_TOKEN: &str = "test-admin-token";

async fn refreshed_router() -> (Router, Harness) {
    let harness = spawn_harness(FixtureSource::sample());
    harness
        .context
        .coordinator
        .refresh()
        .await
        .expect("warm-up refresh");
    let state = HttpState::new(&harness.context, Some(ADMIN_TOKEN.to_string()));
    (build_router(state), harness)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

fn post(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(Method::POST).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).expect("request")
}

fn put_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::PUT)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

#[tokio::test]
async fn health_answers_ok() {
    let (router, _harness) = refreshed_router().await;
    let (status, body) = send(&router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"code": 200, "data": "ok"}));
}

#[tokio::test]
async fn plan_lookup_uses_envelope() {
    let (router, _harness) = refreshed_router().await;

    let (status, body) = send(&router, get("/api/v1/plans/1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 200);
    assert_eq!(body["data"]["id"], "1");
    assert_eq!(body["data"]["rules"][0]["name"], "daily");
    assert_eq!(body["data"]["joined_count"], 0);
    assert!(body.get("msg").is_none());

    let (status, body) = send(&router, get("/api/v1/plans/1?variant=slim")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].get("rules").is_none());
}

#[tokio::test]
async fn missing_plan_is_not_found() {
    let (router, _harness) = refreshed_router().await;
    let (status, body) = send(&router, get("/api/v1/plans/404")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({"code": 404, "msg": "Plan not found"}));
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let (router, _harness) = refreshed_router().await;

    let (status, body) = send(&router, get("/api/v1/plans/bad%20id")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);

    let (status, _) = send(&router, get("/api/v1/plans?variant=tiny")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn listing_endpoints_return_cached_catalog() {
    let (router, harness) = refreshed_router().await;
    harness
        .store
        .sadd("plans-of-user:u1", &["1".to_string()])
        .await
        .expect("join plan");

    let (_, all) = send(&router, get("/api/v1/plans?variant=slim")).await;
    assert_eq!(all["data"].as_array().map(Vec::len), Some(2));

    let (_, available) = send(&router, get("/api/v1/users/u1/plans/available")).await;
    assert_eq!(available["data"][0]["id"], "2");
    assert_eq!(available["data"].as_array().map(Vec::len), Some(1));

    let (_, joined) = send(&router, get("/api/v1/users/u1/plans/joined")).await;
    assert_eq!(joined["data"][0]["id"], "1");

    let (_, groups) = send(&router, get("/api/v1/plan-groups")).await;
    assert_eq!(groups["data"][0]["mask"], 3);
    assert_eq!(groups["data"][0]["plans"].as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn joined_counts_can_be_adjusted_and_overwritten() {
    let (router, _harness) = refreshed_router().await;

    let (status, body) = send(&router, post("/api/v1/plans/1/joined-count/increase", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], 1);

    let (_, body) = send(&router, post("/api/v1/plans/1/joined-count/decrease", None)).await;
    assert_eq!(body["data"], 0);

    let (status, body) = send(
        &router,
        put_json("/api/v1/plans/joined-counts", json!([["1", 40], ["2", 5]])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], 2);

    let (_, body) = send(&router, get("/api/v1/plans/2?variant=slim")).await;
    assert_eq!(body["data"]["joined_count"], 5);

    let (status, body) = send(
        &router,
        put_json("/api/v1/plans/joined-counts", json!([["1", -1]])),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        body["msg"]
            .as_str()
            .is_some_and(|msg| msg.contains("counts[0].count"))
    );
}

#[tokio::test]
async fn admin_refresh_requires_matching_token() {
    let (router, _harness) = refreshed_router().await;

    let (status, body) = send(&router, post("/api/v1/admin/refresh", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 401);

    let (status, _) = send(&router, post("/api/v1/admin/refresh", Some("wrong"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&router, post("/api/v1/admin/refresh", Some(ADMIN_TOKEN))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["plans"], 2);
    assert_eq!(body["data"]["groups"], 1);
    assert!(body["data"]["tracking_id"].is_string());
}

#[tokio::test]
async fn admin_routes_refuse_when_token_is_unset() {
    let harness = spawn_harness(FixtureSource::sample());
    let router = build_router(HttpState::new(&harness.context, None));

    let (status, _) = send(&router, post("/api/v1/admin/refresh", Some(ADMIN_TOKEN))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
