#![allow(clippy::unwrap_used)]
// Integration tests for the unauthenticated identify probe.

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fleetsync_api::{CallContext, Generation, identify};

fn ctx() -> CallContext {
    CallContext::background().with_timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn test_identify_gen2_device() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/shelly"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": null,
            "id": "shellyplus1-a8032ab12345",
            "mac": "A8032AB12345",
            "model": "SNSW-001X16EU",
            "gen": 2,
            "ver": "1.0.3",
            "app": "Plus1",
            "auth_en": true
        })))
        .mount(&server)
        .await;

    let info = identify(&reqwest::Client::new(), &server.uri(), &ctx())
        .await
        .unwrap();
    assert_eq!(info.generation, Generation::Gen2);
    assert_eq!(info.mac, "A8032AB12345");
    assert!(info.auth_enabled);
    assert!(info.name.is_none());
}

#[tokio::test]
async fn test_identify_non_device_fails() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/shelly"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let result = identify(&reqwest::Client::new(), &server.uri(), &ctx()).await;
    tokio_test::assert_err!(result);
}
