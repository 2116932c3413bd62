//! Shared helpers for ws-api tests.

#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    http::{Request, Response},
    Router,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use ws_api::{create_app, AppState};
use ws_orchestrator::test_utils::TestHarness;

/// Builds the router on top of a harness-backed lifecycle.
pub fn create_test_app(harness: &TestHarness) -> Router {
    create_app(AppState::new(
        harness.lifecycle.clone(),
        harness.pool.clone(),
    ))
}

pub fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

/// Extract and deserialize JSON body from response
pub async fn extract_json_body<T: DeserializeOwned>(response: Response<Body>) -> T {
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read body");
    serde_json::from_slice(&body).expect("Failed to parse JSON")
}
