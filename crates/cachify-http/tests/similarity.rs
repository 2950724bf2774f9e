//! Similarity-mode request caching through a real axum server.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::routing::post;
use axum::{Json, Router, middleware};
use serde_json::{Value, json};
use tokio::task::JoinHandle;

use cachify::HybridCache;
use cachify_http::{CacheMode, RequestCacheConfig, RequestCacheState, request_cache_middleware};

fn similarity_config(min_similarity: f64) -> RequestCacheConfig {
    let mut config = RequestCacheConfig::default();
    config.mode = CacheMode::Similarity;
    config.cacheable_methods = vec!["POST".to_string()];
    config.similarity.enabled = true;
    config.similarity.min_similarity = min_similarity;
    config
}

async fn start_server(
    config: RequestCacheConfig,
) -> (
    String,
    Arc<AtomicUsize>,
    tokio::sync::oneshot::Sender<()>,
    JoinHandle<()>,
) {
    let cache = HybridCache::builder().build().expect("build cache");
    let state = RequestCacheState::new(cache, config).expect("build state");

    let counter = Arc::new(AtomicUsize::new(0));
    let handler_counter = Arc::clone(&counter);
    let handler = move || {
        let counter = Arc::clone(&handler_counter);
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Json(json!({ "invocation": n }))
        }
    };
    let app = Router::new()
        .route("/data", post(handler))
        .layer(middleware::from_fn_with_state(
            state,
            request_cache_middleware,
        ));

    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
    });

    (format!("http://{addr}"), counter, tx, server)
}

#[tokio::test]
async fn near_duplicate_json_requests_share_a_response() {
    let (base, counter, shutdown, handle) = start_server(similarity_config(0.9)).await;
    let client = reqwest::Client::new();

    // The two payloads differ only in the ignored "id" field.
    let first = client
        .post(format!("{base}/data"))
        .json(&json!({"prompt": "hello world", "id": "1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(first.headers()["X-Cachify-Cache"], "MISS");
    let first_body: Value = first.json().await.unwrap();

    let second = client
        .post(format!("{base}/data"))
        .json(&json!({"prompt": "hello world", "id": "2"}))
        .send()
        .await
        .unwrap();
    assert_eq!(second.headers()["X-Cachify-Cache"], "HIT");
    let similarity: f64 = second.headers()["X-Cachify-Cache-Similarity"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(similarity >= 0.900, "similarity {similarity} below floor");
    let second_body: Value = second.json().await.unwrap();

    assert_eq!(first_body, second_body);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let _ = shutdown.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn cosmetically_different_text_hits_via_the_index() {
    let (base, counter, shutdown, handle) = start_server(similarity_config(0.9)).await;
    let client = reqwest::Client::new();

    let first = client
        .post(format!("{base}/data"))
        .header("content-type", "text/plain")
        .body("summarize the  quarterly report")
        .send()
        .await
        .unwrap();
    assert_eq!(first.headers()["X-Cachify-Cache"], "MISS");
    let first_body: Value = first.json().await.unwrap();

    // Different canonical form (comma survives text canonicalization) but
    // identical token stream: the exact probe misses, the banded index hits.
    let second = client
        .post(format!("{base}/data"))
        .header("content-type", "text/plain")
        .body("Summarize the, quarterly report")
        .send()
        .await
        .unwrap();
    assert_eq!(second.headers()["X-Cachify-Cache"], "HIT");
    let similarity: f64 = second.headers()["X-Cachify-Cache-Similarity"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(similarity >= 0.9);

    let second_body: Value = second.json().await.unwrap();
    assert_eq!(first_body, second_body);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let _ = shutdown.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn dissimilar_payloads_miss() {
    let (base, counter, shutdown, handle) = start_server(similarity_config(0.9)).await;
    let client = reqwest::Client::new();

    client
        .post(format!("{base}/data"))
        .json(&json!({"prompt": "hello world"}))
        .send()
        .await
        .unwrap();
    let second = client
        .post(format!("{base}/data"))
        .json(&json!({"prompt": "completely unrelated query about weather forecasts"}))
        .send()
        .await
        .unwrap();

    assert_eq!(second.headers()["X-Cachify-Cache"], "MISS");
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    let _ = shutdown.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn malformed_json_disables_caching_for_the_request() {
    let (base, counter, shutdown, handle) = start_server(similarity_config(0.9)).await;
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let response = client
            .post(format!("{base}/data"))
            .header("content-type", "application/json")
            .body("{ this is not json")
            .send()
            .await
            .unwrap();
        // The request succeeds, uncached.
        assert_eq!(response.status(), 200);
        assert!(response.headers().get("X-Cachify-Cache").is_none());
    }
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    let _ = shutdown.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn required_header_gates_the_candidate_scan() {
    let mut config = similarity_config(0.9);
    config.similarity.required_headers = vec!["x-model".to_string()];
    let (base, counter, shutdown, handle) = start_server(config).await;
    let client = reqwest::Client::new();

    // Exact repeats still hit through the exact probe.
    for expectation in ["MISS", "HIT"] {
        let response = client
            .post(format!("{base}/data"))
            .json(&json!({"prompt": "same"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.headers()["X-Cachify-Cache"], expectation);
    }

    // A near-duplicate without the required header cannot use the index.
    let near = client
        .post(format!("{base}/data"))
        .header("content-type", "text/plain")
        .body("same,")
        .send()
        .await
        .unwrap();
    assert_eq!(near.headers()["X-Cachify-Cache"], "MISS");
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    let _ = shutdown.send(());
    let _ = handle.await;
}
