//! Upstream timeouts and retries.

mod common;

use std::time::{Duration, Instant};

use common::{free_ports, start_echo_backend, start_gateway, start_silent_backend};

fn config(port: u16, nodes: &str, retry: usize) -> String {
    config_with(port, nodes, retry, 200, 60)
}

fn config_with(port: u16, nodes: &str, retry: usize, timeout_ms: u64, request_secs: u64) -> String {
    format!(
        r#"
        [server]
        host = "127.0.0.1"

        [timeouts]
        drain_secs = 1
        request_secs = {request_secs}

        [[drivers]]
        name = "static"
        driver = "edge:gateway:discovery_static"

        [[services]]
        id = "slow"
        discovery = "static"
        nodes = "{nodes}"
        timeout_ms = {timeout_ms}
        retry = {retry}

        [[routers]]
        id = "slow"
        port = {port}
        service = "slow"
        "#
    )
}

#[tokio::test]
async fn silent_upstream_yields_gateway_timeout() {
    let silent = start_silent_backend().await;
    let [port] = free_ports();
    let (gateway, _) = start_gateway(&config(port, &silent.to_string(), 0)).await;

    let started = Instant::now();
    let response = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{port}/"))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.status(), 504);
    assert!(elapsed >= Duration::from_millis(200), "answered after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "answered after {elapsed:?}");
    assert!(response.text().await.unwrap().contains("did not respond"));

    gateway.shutdown().await;
}

#[tokio::test]
async fn retry_moves_to_next_node() {
    let silent = start_silent_backend().await;
    let echo = start_echo_backend().await;
    let [port] = free_ports();
    let nodes = format!("{silent};{echo}");
    let (gateway, _) = start_gateway(&config(port, &nodes, 1)).await;

    let client = reqwest::Client::new();
    for _ in 0..4 {
        let response = client
            .get(format!("http://127.0.0.1:{port}/"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    gateway.shutdown().await;
}

#[tokio::test]
async fn grpc_timeout_maps_to_deadline_exceeded() {
    let silent = start_silent_backend().await;
    let [port] = free_ports();
    let (gateway, _) = start_gateway(&config(port, &silent.to_string(), 0)).await;

    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/pkg.Orders/Get"))
        .header("content-type", "application/grpc")
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["grpc-status"], "4");

    gateway.shutdown().await;
}

#[tokio::test]
async fn request_ceiling_finishes_through_the_context() {
    let silent = start_silent_backend().await;
    let [port] = free_ports();
    let raw = config_with(port, &silent.to_string(), 0, 5000, 1);
    let (gateway, _) = start_gateway(&raw).await;
    let client = reqwest::Client::new();

    let started = Instant::now();
    let response = client
        .get(format!("http://127.0.0.1:{port}/"))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.status(), 504);
    assert!(response.headers().contains_key("x-request-id"));
    assert!(elapsed < Duration::from_secs(3), "answered after {elapsed:?}");
    assert_eq!(response.text().await.unwrap(), "request did not complete in time");

    let response = client
        .post(format!("http://127.0.0.1:{port}/pkg.Orders/Get"))
        .header("content-type", "application/grpc")
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["grpc-status"], "4");
    assert!(response.headers().contains_key("x-request-id"));

    gateway.shutdown().await;
}

#[tokio::test]
async fn grpc_client_deadline_bounds_the_upstream_call() {
    let silent = start_silent_backend().await;
    let [port] = free_ports();
    let raw = config_with(port, &silent.to_string(), 0, 5000, 60);
    let (gateway, _) = start_gateway(&raw).await;

    let started = Instant::now();
    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/pkg.Orders/Get"))
        .header("content-type", "application/grpc")
        .header("grpc-timeout", "200m")
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["grpc-status"], "4");
    assert!(elapsed < Duration::from_secs(2), "answered after {elapsed:?}");

    gateway.shutdown().await;
}
