//! End-to-end tests: the real router served on a loopback listener,
//! driven over HTTP with a mocked DNS backend and tempdir storage.

use reqwest::StatusCode;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use crate::api::{AppState, IngestServer};
use crate::auth::AuthEngine;
use crate::auth::mock;
use crate::auth::resolver::DnsResolver;
use crate::config::{Config, ControlConfig, DmarcEnforcement};
use crate::control::ConnectionControl;
use crate::metrics;
use crate::ratelimit::RateLimiter;
use crate::storage::MessageStore;
use crate::webhook::WebhookClient;

const TOKEN: &str = "integration-test-bearer-token";

const MESSAGE: &str = "From: alice@example.com\r\nTo: bob@gateway.example\r\nSubject: hello\r\n\r\nHi Bob!\r\n";

struct TestServer {
    base: String,
    client: reqwest::Client,
    data_dir: tempfile::TempDir,
    _guard: tokio_util::sync::DropGuard,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    /// Every message file currently in the inbox, any day shard.
    fn stored_files(&self) -> Vec<std::path::PathBuf> {
        let mut found = Vec::new();
        let mut stack = vec![self.data_dir.path().join("inbox")];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().is_some_and(|e| e == "json") {
                    found.push(path);
                }
            }
        }
        found
    }
}

async fn setup(resolver: mock::Resolver, mutate: impl FnOnce(&mut Config)) -> TestServer {
    let data_dir = tempfile::tempdir().expect("create tempdir");
    let mut config = Config {
        bearer_token: TOKEN.to_string(),
        data_dir: data_dir.path().to_path_buf(),
        dmarc_enforcement: DmarcEnforcement::Strict,
        ..Config::default()
    };
    mutate(&mut config);
    let config = Arc::new(config);

    let store = MessageStore::open(&config.data_dir).await.expect("open store");
    let (metrics, _registry) = metrics::build();

    let state = AppState {
        engine: AuthEngine::new(&config, DnsResolver::mock(resolver)),
        store,
        control: ConnectionControl::new(config.control.clone()),
        limiter: Arc::new(RateLimiter::new(
            config.rate_limit_per_minute,
            config.rate_limit_burst,
        )),
        metrics: metrics.clone(),
        webhook: WebhookClient::new(None, config.max_idle_conns, metrics),
        tls: None,
        config: config.clone(),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let router = IngestServer::router(state);
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .expect("serve");
    });

    TestServer {
        base: format!("http://{addr}"),
        client: reqwest::Client::new(),
        data_dir,
        _guard: shutdown.drop_guard(),
    }
}

fn spf_pass_resolver() -> mock::Resolver {
    mock::Resolver::default().txt_record("example.com", "v=spf1 ip4:203.0.113.0/24 -all")
}

async fn post_message(server: &TestServer, client_addr: &str, body: &str) -> reqwest::Response {
    server
        .client
        .post(server.url("/mail/inbound"))
        .bearer_auth(TOKEN)
        .header("X-Original-Sender", "alice@example.com")
        .header("X-Original-Recipient", "bob@gateway.example")
        .header("X-Original-Client-Address", client_addr)
        .header("X-Original-Client-Hostname", "mta.example.net")
        .header("X-Original-Helo", "mta.example.net")
        .header("X-Original-Mail-From", "alice@example.com")
        .body(body.to_string())
        .send()
        .await
        .expect("request")
}

#[tokio::test]
#[traced_test]
async fn aligned_spf_pass_is_accepted_and_persisted() {
    let server = setup(spf_pass_resolver(), |_| {}).await;

    let response = post_message(&server, "203.0.113.5", MESSAGE).await;
    assert_eq!(response.status(), StatusCode::OK);

    let request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .expect("request id header")
        .to_string();
    assert!(request_id.starts_with("req_"), "{request_id}");

    let body: Value = response.json().await.expect("json body");
    assert_eq!(body["action"], "accept");
    let id = body["id"].as_str().expect("id");
    assert!(id.starts_with("msg_"));

    let files = server.stored_files();
    assert_eq!(files.len(), 1);
    assert_eq!(
        files[0].file_name().unwrap().to_str().unwrap(),
        format!("{id}.json")
    );

    let stored: Value =
        serde_json::from_slice(&std::fs::read(&files[0]).expect("read stored file")).unwrap();
    assert_eq!(stored["auth"]["spf"]["result"], "pass");
    assert_eq!(stored["auth"]["dkim"][0]["result"], "none");
    assert_eq!(stored["auth"]["dmarc"]["result"], "none");
    assert_eq!(stored["auth"]["overall_pass"], true);
}

#[tokio::test]
async fn dmarc_reject_is_enforced_and_not_persisted() {
    let resolver = spf_pass_resolver()
        .txt_record("_dmarc.example.com", "v=DMARC1; p=reject; pct=100");
    let server = setup(resolver, |_| {}).await;

    let response = post_message(&server, "198.51.100.9", MESSAGE).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body: Value = response.json().await.expect("json body");
    assert_eq!(body["error"], true);
    assert_eq!(body["type"], "FORBIDDEN");
    assert_eq!(body["details"]["action"], "reject");
    assert!(body["request_id"].as_str().unwrap().starts_with("req_"));

    assert!(server.stored_files().is_empty());
}

#[tokio::test]
async fn dmarc_quarantine_persists_with_quarantine_action() {
    let resolver = spf_pass_resolver()
        .txt_record("_dmarc.example.com", "v=DMARC1; p=quarantine; pct=100");
    let server = setup(resolver, |_| {}).await;

    let response = post_message(&server, "198.51.100.9", MESSAGE).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = response.json().await.expect("json body");
    assert_eq!(body["action"], "quarantine");
    assert_eq!(server.stored_files().len(), 1);
}

#[tokio::test]
async fn missing_or_wrong_bearer_token_is_unauthorized() {
    let server = setup(spf_pass_resolver(), |_| {}).await;

    let response = server
        .client
        .post(server.url("/mail/inbound"))
        .header("X-Original-Client-Address", "203.0.113.5")
        .body(MESSAGE)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "AUTH_ERROR");

    let response = server
        .client
        .post(server.url("/mail/inbound"))
        .bearer_auth("integration-test-bearer-tokeX")
        .body(MESSAGE)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn oversize_body_is_rejected_without_storage() {
    let server = setup(spf_pass_resolver(), |config| {
        config.max_message_size = 1024;
    })
    .await;

    let at_limit = "x".repeat(1024);
    let response = post_message(&server, "203.0.113.5", &at_limit).await;
    assert_eq!(response.status(), StatusCode::OK);

    let over_limit = "x".repeat(1025);
    let response = post_message(&server, "203.0.113.5", &over_limit).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "VALIDATION_ERROR");

    assert_eq!(server.stored_files().len(), 1);
}

#[tokio::test]
async fn http_rate_limit_applies_per_client_ip() {
    let server = setup(spf_pass_resolver(), |config| {
        config.rate_limit_per_minute = 60;
        config.rate_limit_burst = 2;
    })
    .await;

    for _ in 0..2 {
        let response = server
            .client
            .post(server.url("/mail/inbound"))
            .bearer_auth(TOKEN)
            .header("X-Forwarded-For", "192.0.2.77")
            .header("X-Original-Client-Address", "203.0.113.5")
            .header("X-Original-Mail-From", "alice@example.com")
            .body(MESSAGE)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = server
        .client
        .post(server.url("/mail/inbound"))
        .bearer_auth(TOKEN)
        .header("X-Forwarded-For", "192.0.2.77")
        .body(MESSAGE)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "RATE_LIMIT_ERROR");

    // a different client IP has its own bucket
    let response = server
        .client
        .post(server.url("/mail/inbound"))
        .bearer_auth(TOKEN)
        .header("X-Forwarded-For", "192.0.2.78")
        .header("X-Original-Client-Address", "203.0.113.5")
        .header("X-Original-Mail-From", "alice@example.com")
        .body(MESSAGE)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn banned_ip_gets_forbidden_after_repeated_violations() {
    let server = setup(spf_pass_resolver(), |config| {
        config.control = ControlConfig {
            max_per_ip: 0,
            ban_threshold: 3,
            ..config.control.clone()
        };
    })
    .await;

    // with max_per_ip=0 every attempt is a cap violation
    for _ in 0..3 {
        let response = server
            .client
            .post(server.url("/mail/inbound"))
            .bearer_auth(TOKEN)
            .header("X-Forwarded-For", "192.0.2.99")
            .body(MESSAGE)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["type"], "RATE_LIMIT_ERROR");
    }

    let response = server
        .client
        .post(server.url("/mail/inbound"))
        .bearer_auth(TOKEN)
        .header("X-Forwarded-For", "192.0.2.99")
        .body(MESSAGE)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "FORBIDDEN");
}

#[tokio::test]
async fn health_and_ready_respond() {
    let server = setup(mock::Resolver::default(), |_| {}).await;

    let response = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");

    let response = server.client.get(server.url("/ready")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_route_is_a_tagged_404() {
    let server = setup(mock::Resolver::default(), |_| {}).await;

    let response = server
        .client
        .get(server.url("/nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "NOT_FOUND");
    assert!(body["request_id"].as_str().unwrap().starts_with("req_"));
}

#[tokio::test]
async fn provided_request_id_is_echoed() {
    let server = setup(mock::Resolver::default(), |_| {}).await;

    let response = server
        .client
        .get(server.url("/health"))
        .header("X-Request-ID", "req_cafe0123deadbeef")
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.headers().get("x-request-id").unwrap(),
        "req_cafe0123deadbeef"
    );
}
