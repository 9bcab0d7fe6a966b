#![allow(dead_code)]

use std::time::Duration;

use octofhir_server::{AppConfig, build_app};
use serde_json::{Value, json};
use tokio::task::JoinHandle;

pub struct TestServer {
    pub base: String,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn fhir(&self, path: &str) -> String {
        format!("{}/fhir/{}", self.base, path.trim_start_matches('/'))
    }

    pub fn ws(&self, path: &str) -> String {
        format!("{}/{}", self.base.replacen("http://", "ws://", 1), path.trim_start_matches('/'))
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// Config with a fast retry schedule for delivery tests.
pub fn fast_retry_config(max_attempts: u32) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.subscriptions.retry.max_attempts = max_attempts;
    cfg.subscriptions.retry.initial_backoff_ms = 5;
    cfg.subscriptions.retry.max_backoff_ms = 20;
    cfg
}

pub async fn start_server(cfg: AppConfig) -> TestServer {
    let app = build_app(&cfg).expect("build app");

    // Bind to an ephemeral port
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
    });

    TestServer {
        base: format!("http://{addr}"),
        shutdown: Some(tx),
        handle: Some(handle),
    }
}

pub fn observation(code: &str) -> Value {
    json!({
        "resourceType": "Observation",
        "status": "final",
        "code": {"coding": [{"system": "SNOMED-CT", "code": code}]}
    })
}

pub async fn post_json(client: &reqwest::Client, url: &str, body: &Value) -> reqwest::Response {
    client
        .post(url)
        .header("content-type", "application/fhir+json")
        .json(body)
        .send()
        .await
        .expect("request")
}

/// Poll `check` until it returns true or the deadline passes.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
