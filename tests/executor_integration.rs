//! Integration tests for the HTTP executor: retry, Retry-After, circuit
//! breaking, pacing, and budget-enforced streaming downloads.

use std::sync::Arc;
use std::time::{Duration, Instant};

use foliofetch_core::budget::{BudgetAccountant, ContentClass, ScopeLimits};
use foliofetch_core::config::{Config, OnExceed};
use foliofetch_core::net::HttpExecutor;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Network settings tuned for fast tests: no pacing, no backoff growth.
fn test_config(max_attempts: u32, threshold: u32, cooldown_s: u64) -> Config {
    let text = format!(
        r#"
        [provider_settings.x.network]
        delay_ms = 0
        jitter_ms = 0
        max_attempts = {max_attempts}
        base_backoff_s = 0.0
        backoff_multiplier = 1.0
        max_backoff_s = 0.0
        timeout_s = 5
        circuit_breaker_enabled = true
        circuit_breaker_threshold = {threshold}
        circuit_breaker_cooldown_s = {cooldown_s}
        "#
    );
    toml::from_str(&text).expect("test config parses")
}

fn executor_with(config: &Config, budget: BudgetAccountant) -> HttpExecutor {
    HttpExecutor::new(config, Arc::new(budget))
}

fn executor(config: &Config) -> HttpExecutor {
    executor_with(config, BudgetAccountant::unlimited())
}

#[tokio::test]
async fn test_success_returns_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .mount(&server)
        .await;

    let config = test_config(3, 5, 60);
    let executor = executor(&config);
    let cancel = CancellationToken::new();
    let response = executor
        .execute("x", &format!("{}/ok", server.uri()), &cancel)
        .await
        .expect("request succeeds");
    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config(3, 5, 60);
    let executor = executor(&config);
    let cancel = CancellationToken::new();
    let error = executor
        .execute("x", &format!("{}/missing", server.uri()), &cancel)
        .await
        .expect_err("404 is terminal");
    assert_eq!(error.kind(), "client-error");
    server.verify().await;
}

#[tokio::test]
async fn test_server_error_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_string("finally"))
        .mount(&server)
        .await;

    let config = test_config(3, 5, 60);
    let executor = executor(&config);
    let cancel = CancellationToken::new();
    let response = executor
        .execute("x", &format!("{}/flaky", server.uri()), &cancel)
        .await
        .expect("third attempt succeeds");
    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
async fn test_server_error_exhausts_to_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let config = test_config(2, 5, 60);
    let executor = executor(&config);
    let cancel = CancellationToken::new();
    let error = executor
        .execute("x", &format!("{}/down", server.uri()), &cancel)
        .await
        .expect_err("exhausted");
    assert_eq!(error.kind(), "transient");
    server.verify().await;
}

#[tokio::test]
async fn test_retry_after_zero_sleeps_zero_and_counts_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/limited"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/limited"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let config = test_config(2, 5, 60);
    let executor = executor(&config);
    let cancel = CancellationToken::new();
    let started = Instant::now();
    let response = executor
        .execute("x", &format!("{}/limited", server.uri()), &cancel)
        .await
        .expect("second attempt succeeds");
    assert_eq!(response.status().as_u16(), 200);
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "Retry-After 0 means no sleep"
    );
}

#[tokio::test]
async fn test_breaker_trips_after_exhausted_requests_and_recovers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/q"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .mount(&server)
        .await;

    // threshold 2, cooldown 1s, 2 attempts per request.
    let config = test_config(2, 2, 1);
    let executor = executor(&config);
    let cancel = CancellationToken::new();
    let url = format!("{}/q", server.uri());

    // Two exhausted requests trip the breaker open.
    for _ in 0..2 {
        let error = executor.execute("x", &url, &cancel).await.expect_err("429s");
        assert_eq!(error.kind(), "rate-limited");
    }
    let requests_so_far = server.received_requests().await.unwrap().len();
    assert_eq!(requests_so_far, 4, "2 requests x 2 attempts");

    // Third request fails fast without touching the network.
    let error = executor.execute("x", &url, &cancel).await.expect_err("open");
    assert_eq!(error.kind(), "circuit-open");
    assert_eq!(server.received_requests().await.unwrap().len(), 4);

    // After the cooldown a single probe is admitted; success closes.
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/q"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let response = executor.execute("x", &url, &cancel).await.expect("probe succeeds");
    assert_eq!(response.status().as_u16(), 200);
    let response = executor.execute("x", &url, &cancel).await.expect("closed again");
    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
async fn test_pacing_spaces_consecutive_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/paced"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let text = r#"
        [provider_settings.x.network]
        delay_ms = 300
        jitter_ms = 0
        max_attempts = 1
        timeout_s = 5
    "#;
    let config: Config = toml::from_str(text).unwrap();
    let executor = executor(&config);
    let cancel = CancellationToken::new();
    let url = format!("{}/paced", server.uri());

    let started = Instant::now();
    executor.execute("x", &url, &cancel).await.unwrap();
    executor.execute("x", &url, &cancel).await.unwrap();
    assert!(
        started.elapsed() >= Duration::from_millis(300),
        "second request must wait out the spacing"
    );
}

#[tokio::test]
async fn test_get_json_accounts_metadata_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .mount(&server)
        .await;

    let config = test_config(1, 5, 60);
    let executor = executor(&config);
    let cancel = CancellationToken::new();
    let value = executor
        .get_json("x", &format!("{}/api", server.uri()), "w1", &cancel)
        .await
        .expect("json fetched");
    assert_eq!(value["ok"], true);

    let report = executor.budget().report();
    assert_eq!(report.metadata.files, 1);
    assert!(report.metadata.bytes > 0);
}

#[tokio::test]
async fn test_fetch_to_file_writes_and_accounts() {
    let server = MockServer::start().await;
    let body = vec![7u8; 4096];
    Mock::given(method("GET"))
        .and(path("/file.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let config = test_config(1, 5, 60);
    let executor = executor(&config);
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("objects").join("file.pdf");
    let cancel = CancellationToken::new();

    let bytes = executor
        .fetch_to_file(
            "x",
            &format!("{}/file.pdf", server.uri()),
            &dest,
            ContentClass::Pdf,
            "w1",
            &cancel,
        )
        .await
        .expect("download succeeds");
    assert_eq!(bytes, 4096);
    assert_eq!(std::fs::read(&dest).unwrap(), body);

    let report = executor.budget().report();
    assert_eq!(report.pdf.files, 1);
    assert_eq!(report.pdf.bytes, 4096);
}

#[tokio::test]
async fn test_budget_violation_mid_stream_deletes_file_and_stops() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/big.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 64 * 1024]))
        .mount(&server)
        .await;

    let config = test_config(1, 5, 60);
    let budget = BudgetAccountant::new(
        ScopeLimits {
            pdf_bytes: 1024,
            ..ScopeLimits::default()
        },
        ScopeLimits::default(),
        OnExceed::Stop,
    );
    let executor = executor_with(&config, budget);
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("big.pdf");
    let cancel = CancellationToken::new();

    let error = executor
        .fetch_to_file(
            "x",
            &format!("{}/big.pdf", server.uri()),
            &dest,
            ContentClass::Pdf,
            "w1",
            &cancel,
        )
        .await
        .expect_err("limit is 1 KiB");
    assert_eq!(error.kind(), "budget-exceeded");
    assert!(!dest.exists(), "partial file must be deleted");
    assert!(executor.budget().stop_requested(), "stop policy raises the flag");
    assert_eq!(executor.budget().report().pdf.bytes, 0, "nothing committed");
}

#[tokio::test]
async fn test_cancelled_token_aborts_and_cleans_up() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 1024])
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let config = test_config(1, 5, 60);
    let executor = executor(&config);
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("slow.pdf");
    let cancel = CancellationToken::new();

    let cancel_soon = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel_soon.cancel();
    });

    let started = Instant::now();
    let error = executor
        .fetch_to_file(
            "x",
            &format!("{}/slow.pdf", server.uri()),
            &dest,
            ContentClass::Pdf,
            "w1",
            &cancel,
        )
        .await
        .expect_err("cancelled");
    assert_eq!(error.kind(), "transient");
    assert!(started.elapsed() < Duration::from_secs(5), "cancellation is prompt");
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_request_timeout_exhausts_to_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stall"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;

    let text = r#"
        [provider_settings.x.network]
        delay_ms = 0
        jitter_ms = 0
        max_attempts = 1
        base_backoff_s = 0.0
        max_backoff_s = 0.0
        timeout_s = 1
    "#;
    let config: Config = toml::from_str(text).unwrap();
    let executor = executor(&config);
    let cancel = CancellationToken::new();
    let error = executor
        .execute("x", &format!("{}/stall", server.uri()), &cancel)
        .await
        .expect_err("times out");
    assert_eq!(error.kind(), "transient", "read timeouts are transient faults");
}
