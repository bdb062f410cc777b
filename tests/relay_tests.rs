//! End-to-end relay tests
//!
//! Drives the full router (gatekeeper, orchestration, credential cache,
//! forwarder) against in-process upstreams.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::ServiceExt;

use std::time::Duration;

use common::{TestRelay, mint_pfx, relay, relay_with, spawn_slow_upstream, spawn_upstream};
use secure_relay::config::{AuthConfig, AuthMode};

const API_KEY: &str = "relay-key";
const CNPJ: &str = "12345678000199";

fn shared_secret() -> AuthConfig {
    AuthConfig {
        mode: AuthMode::SharedSecret,
        api_key: Some(API_KEY.to_string()),
        ..Default::default()
    }
}

fn command(pfx: &[u8], password: &str) -> Value {
    json!({
        "route": "ping",
        "auth": {
            "client_id": "partner-id",
            "client_secret": "partner-secret",
            "cnpj_id": CNPJ
        },
        "cert": {
            "pfx_base64": BASE64.encode(pfx),
            "password": password
        }
    })
}

async fn post(relay: &TestRelay, body: &Value) -> (StatusCode, Value) {
    let response = relay
        .router
        .clone()
        .oneshot(
            Request::post("/secure-request")
                .header("content-type", "application/json")
                .header("x-api-key", API_KEY)
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn scratch_is_empty(relay: &TestRelay) -> bool {
    std::fs::read_dir(relay.scratch.path()).unwrap().count() == 0
}

#[tokio::test]
async fn relays_command_to_selected_upstream() {
    let uat = spawn_upstream("uat").await;
    let relay = relay(shared_secret(), &uat.base_url(), "https://prod.invalid");
    let pfx = mint_pfx("bundle-pw");

    let (status, body) = post(&relay, &command(&pfx, "bundle-pw")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status_code"], 201);
    assert_eq!(body["url"], format!("{}/v1/command", uat.base_url()));
    assert_eq!(body["response"], json!({ "accepted": "ping", "env": "uat" }));

    let seen = uat.seen.lock().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0].body,
        json!({ "data": { "route": "ping", "version": 1, "input": {} } })
    );
    assert_eq!(
        seen[0].headers["authorization"],
        format!("Basic {}", BASE64.encode("partner-id:partner-secret")).as_str()
    );
    assert_eq!(seen[0].headers["id"], CNPJ);
    assert!(scratch_is_empty(&relay));
}

#[tokio::test]
async fn router_env_selects_prod() {
    let uat = spawn_upstream("uat").await;
    let prod = spawn_upstream("prod").await;
    let relay = relay(shared_secret(), &uat.base_url(), &prod.base_url());

    let mut body = command(&mint_pfx("pw"), "pw");
    body["router"] = json!({ "env": "prod" });
    let (status, reply) = post(&relay, &body).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["url"], format!("{}/v1/command", prod.base_url()));
    assert_eq!(reply["response"]["env"], "prod");
    assert_eq!(uat.calls(), 0);
    assert_eq!(prod.calls(), 1);
}

#[tokio::test]
async fn container_shape_is_forwarded_unchanged() {
    let uat = spawn_upstream("uat").await;
    let relay = relay(shared_secret(), &uat.base_url(), "https://prod.invalid");

    let mut body = command(&mint_pfx("pw"), "pw");
    body["data"] = json!({ "route": "balance", "version": 2, "input": { "cpf": "1" } });
    let (status, _) = post(&relay, &body).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        uat.seen.lock()[0].body,
        json!({ "data": { "route": "balance", "version": 2, "input": { "cpf": "1" } } })
    );
}

#[tokio::test]
async fn repeated_bundle_is_decoded_once() {
    let uat = spawn_upstream("uat").await;
    let relay = relay(shared_secret(), &uat.base_url(), "https://prod.invalid");
    let body = command(&mint_pfx("pw"), "pw");

    for _ in 0..3 {
        let (status, _) = post(&relay, &body).await;
        assert_eq!(status, StatusCode::OK);
    }

    let stats = relay.state.relay.cache().stats();
    assert_eq!(stats.decodes, 1);
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.size, 1);
    assert_eq!(uat.calls(), 3);
    assert!(scratch_is_empty(&relay));
}

#[tokio::test]
async fn wrong_passphrase_is_rejected_before_upstream() {
    let uat = spawn_upstream("uat").await;
    let relay = relay(shared_secret(), &uat.base_url(), "https://prod.invalid");

    let (status, body) = post(&relay, &command(&mint_pfx("right"), "wrong")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("passphrase"));
    assert_eq!(uat.calls(), 0);
    assert_eq!(relay.state.relay.cache().stats().size, 0);
}

#[tokio::test]
async fn invalid_cnpj_is_rejected_before_decode() {
    let uat = spawn_upstream("uat").await;
    let relay = relay(shared_secret(), &uat.base_url(), "https://prod.invalid");

    let mut body = command(&mint_pfx("pw"), "pw");
    body["auth"]["cnpj_id"] = json!("12.345.678/0001-99");
    let (status, reply) = post(&relay, &body).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(reply["detail"].as_str().unwrap().contains("14 digits"));
    assert_eq!(relay.state.relay.cache().stats().decodes, 0);
    assert_eq!(uat.calls(), 0);
}

#[tokio::test]
async fn unreachable_upstream_is_summarized() {
    // Bind then drop to get a port nothing listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let relay = relay(shared_secret(), &format!("http://{addr}"), "https://prod.invalid");
    let (status, body) = post(&relay, &command(&mint_pfx("pw"), "pw")).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["detail"], "Upstream request failed");
    assert!(scratch_is_empty(&relay));
}

#[tokio::test]
async fn request_deadline_answers_gateway_timeout() {
    let slow = spawn_slow_upstream(Duration::from_secs(10)).await;
    let relay = relay_with(
        shared_secret(),
        &format!("http://{slow}"),
        "https://prod.invalid",
        |config| {
            config.upstream.timeout = Duration::from_secs(5);
            config.server.request_timeout = Duration::from_millis(300);
        },
    );

    let response = relay
        .router
        .clone()
        .oneshot(
            Request::post("/secure-request")
                .header("content-type", "application/json")
                .header("x-api-key", API_KEY)
                .body(Body::from(command(&mint_pfx("pw"), "pw").to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    // The abandoned call still released its identity files
    assert!(scratch_is_empty(&relay));
}

#[tokio::test]
async fn missing_api_key_never_reaches_upstream() {
    let uat = spawn_upstream("uat").await;
    let relay = relay(shared_secret(), &uat.base_url(), "https://prod.invalid");

    let response = relay
        .router
        .clone()
        .oneshot(
            Request::post("/secure-request")
                .header("content-type", "application/json")
                .body(Body::from(command(&mint_pfx("pw"), "pw").to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(relay.state.relay.cache().stats().decodes, 0);
    assert_eq!(uat.calls(), 0);
}

#[tokio::test]
async fn health_reports_cache_and_auth_mode() {
    let relay = relay(shared_secret(), "https://uat.invalid", "https://prod.invalid");

    let response = relay
        .router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["auth_mode"], "shared-secret");
    assert_eq!(body["cache"]["hits"], 0);
    assert_eq!(body["cache"]["enabled"], true);
}
