//! Gateway behavior against stub HTTP providers: retry, circuit breaker,
//! batch order, expansion parsing, extract-mode reranking, and the
//! dimension guard. Each test spins an axum stub on a loopback port and
//! points an openai-compat provider at it, so nothing leaves the machine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};

use qmd::collections::CollectionRegistry;
use qmd::config::{Config, RerankMode};
use qmd::engine::Engine;
use qmd::error::QmdError;
use qmd::llm::{LlmGateway, ProviderConfig, ProviderKind, RerankDoc};
use qmd::search::run_vsearch;
use qmd::store::Store;
use qmd::text::hash_content;

#[derive(Clone)]
struct StubState {
    hits: Arc<AtomicUsize>,
    /// Fail with 500 until this many requests have been seen.
    fail_until: usize,
    /// Embedding width served by `/v1/embeddings`.
    dims: usize,
    /// Canned chat reply.
    chat_reply: String,
    /// Input index dropped from embedding responses, when set.
    drop_index: Option<usize>,
}

async fn stub_embeddings(
    State(state): State<StubState>,
    Json(body): Json<serde_json::Value>,
) -> axum::response::Response {
    let n = state.hits.fetch_add(1, Ordering::SeqCst);
    if n < state.fail_until {
        return (StatusCode::INTERNAL_SERVER_ERROR, "stub failure").into_response();
    }
    let inputs = body["input"].as_array().cloned().unwrap_or_default();
    let data: Vec<serde_json::Value> = inputs
        .iter()
        .enumerate()
        .filter(|(i, _)| state.drop_index != Some(*i))
        .map(|(i, input)| {
            let text = input.as_str().unwrap_or_default();
            // "pasta" texts point one way, everything else the other, so
            // cosine ranking is predictable.
            let mut vector = vec![0.0f32; state.dims];
            if text.contains("pasta") {
                vector[0] = 1.0;
            } else if state.dims > 1 {
                vector[1] = 1.0;
            }
            serde_json::json!({ "index": i, "embedding": vector })
        })
        .collect();
    Json(serde_json::json!({ "data": data })).into_response()
}

async fn stub_chat(State(state): State<StubState>) -> axum::response::Response {
    let n = state.hits.fetch_add(1, Ordering::SeqCst);
    if n < state.fail_until {
        return (StatusCode::INTERNAL_SERVER_ERROR, "stub failure").into_response();
    }
    Json(serde_json::json!({
        "choices": [ { "message": { "role": "assistant", "content": state.chat_reply } } ]
    }))
    .into_response()
}

async fn spawn_stub(state: StubState) -> String {
    let app = Router::new()
        .route("/v1/embeddings", post(stub_embeddings))
        .route("/v1/chat/completions", post(stub_chat))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/v1")
}

fn stub_state(fail_until: usize, dims: usize, chat_reply: &str) -> StubState {
    StubState {
        hits: Arc::new(AtomicUsize::new(0)),
        fail_until,
        dims,
        chat_reply: chat_reply.to_string(),
        drop_index: None,
    }
}

fn test_config(dir: &std::path::Path) -> Config {
    Config {
        data_dir: dir.to_path_buf(),
        config_dir: dir.to_path_buf(),
        index_name: "index".into(),
        // Short timeouts keep failure paths fast.
        timeout_override: Some(Duration::from_secs(5)),
        embed_batch_size: 32,
        rerank_doc_limit: 40,
        rerank_chunks_per_doc: 3,
        max_index_file_bytes: u64::MAX,
        breaker_cooldown: Duration::from_millis(200),
        rerank_mode: RerankMode::Llm,
        llm_cache: false,
    }
}

fn provider_at(base_url: &str) -> ProviderConfig {
    ProviderConfig {
        kind: ProviderKind::OpenAiCompat,
        api_key: "test-key".to_string(),
        base_url: base_url.trim_end_matches('/').to_string(),
        embed_model: "stub-embed".to_string(),
        chat_model: "stub-chat".to_string(),
        rerank_model: "stub-rerank".to_string(),
    }
}

#[tokio::test]
async fn embed_batch_preserves_order_and_nulls_missing_slots() {
    let mut state = stub_state(0, 3, "");
    state.drop_index = Some(1);
    let base = spawn_stub(state).await;

    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let gateway =
        LlmGateway::with_providers(&config, Some(provider_at(&base)), None, None);

    let texts = vec![
        "pasta one".to_string(),
        "dropped".to_string(),
        "other".to_string(),
    ];
    let slots = gateway.embed_batch(&texts).await.unwrap();
    assert_eq!(slots.len(), 3);
    assert_eq!(slots[0].as_ref().unwrap()[0], 1.0);
    assert!(slots[1].is_none(), "missing provider slot maps to None");
    assert_eq!(slots[2].as_ref().unwrap()[1], 1.0);
}

#[tokio::test]
async fn transient_errors_are_retried_to_success() {
    let state = stub_state(2, 2, "");
    let hits = state.hits.clone();
    let base = spawn_stub(state).await;

    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let gateway =
        LlmGateway::with_providers(&config, Some(provider_at(&base)), None, None);

    let vector = gateway.embed_one("pasta").await.unwrap();
    assert_eq!(vector.len(), 2);
    // Two 500s then the success.
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn circuit_opens_after_three_failed_operations() {
    let state = stub_state(usize::MAX, 2, "");
    let hits = state.hits.clone();
    let base = spawn_stub(state).await;

    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let gateway = LlmGateway::with_providers(
        &config,
        None,
        None,
        Some(provider_at(&base)),
    );

    let docs = vec![RerankDoc {
        key: "file::0".to_string(),
        text: "candidate".to_string(),
    }];

    for _ in 0..3 {
        let err = gateway.rerank("q", &docs).await.unwrap_err();
        assert!(matches!(err, QmdError::Provider { .. }));
    }
    let after_three = hits.load(Ordering::SeqCst);
    assert_eq!(after_three, 9, "three operations, three attempts each");

    // Fourth call fails fast without touching the wire.
    let err = gateway.rerank("q", &docs).await.unwrap_err();
    assert!(matches!(err, QmdError::CoolingDown { .. }));
    assert_eq!(hits.load(Ordering::SeqCst), after_three);

    // After the cooldown elapses the next call is attempted again.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let err = gateway.rerank("q", &docs).await.unwrap_err();
    assert!(matches!(err, QmdError::Provider { .. }));
    assert!(hits.load(Ordering::SeqCst) > after_three);
}

#[tokio::test]
async fn expansion_parses_labeled_reply() {
    let state = stub_state(
        0,
        2,
        "lex: pasta water ratio\nvec: how much water for pasta\nhyde: Use a liter per 100g.",
    );
    let base = spawn_stub(state).await;

    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let gateway =
        LlmGateway::with_providers(&config, None, Some(provider_at(&base)), None);

    let queryables = gateway.expand_query("pasta water", true, None).await;
    assert_eq!(queryables.len(), 3);
    assert_eq!(queryables[0].text, "pasta water ratio");
}

#[tokio::test]
async fn expansion_degrades_on_unusable_reply() {
    let state = stub_state(0, 2, "I cannot help with that.");
    let base = spawn_stub(state).await;

    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let gateway =
        LlmGateway::with_providers(&config, None, Some(provider_at(&base)), None);

    let queryables = gateway.expand_query("pasta water", true, None).await;
    // The deterministic fallback: lex + vec + hyde.
    assert_eq!(queryables.len(), 3);
    assert_eq!(queryables[0].text, "pasta water");
    assert!(queryables[2].text.starts_with("Information about"));
}

#[tokio::test]
async fn llm_rerank_extract_mode_orders_and_scores() {
    let state = stub_state(0, 2, "[2] extracted two\n[0] extracted zero");
    let base = spawn_stub(state).await;

    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let gateway = LlmGateway::with_providers(
        &config,
        None,
        None,
        Some(provider_at(&base)),
    );

    let docs: Vec<RerankDoc> = (0..3)
        .map(|i| RerankDoc {
            key: format!("file::{i}"),
            text: format!("candidate {i}"),
        })
        .collect();

    let outcomes = gateway.rerank("q", &docs).await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].key, "file::2");
    assert!((outcomes[0].score - 1.0).abs() < 1e-9);
    assert_eq!(outcomes[0].extract.as_deref(), Some("extracted two"));
    assert_eq!(outcomes[1].key, "file::0");
    assert!((outcomes[1].score - 0.95).abs() < 1e-9);
}

async fn engine_with_gateway(config: Config, gateway: LlmGateway) -> Engine {
    let registry = CollectionRegistry::load(&config.collections_path()).unwrap();
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    Engine::from_parts(config, registry, store, gateway)
}

async fn seed_document(engine: &Engine, path: &str, body: &str) -> String {
    let hash = hash_content(body);
    engine.store.insert_content(&hash, body, 1).await.unwrap();
    engine
        .store
        .insert_document("notes", path, path, &hash, 1, 1)
        .await
        .unwrap();
    hash
}

#[tokio::test]
async fn embed_then_vector_search_end_to_end() {
    let base = spawn_stub(stub_state(0, 2, "")).await;
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let gateway =
        LlmGateway::with_providers(&config, Some(provider_at(&base)), None, None);
    let engine = engine_with_gateway(config, gateway).await;

    seed_document(&engine, "pasta.md", "pasta water binds the sauce").await;
    seed_document(&engine, "git.md", "git feature branch workflow").await;

    let summary = qmd::embedder::run_embed(
        &engine.store,
        &engine.gateway,
        false,
        &qmd::progress::NoProgress,
    )
    .await
    .unwrap();
    assert_eq!(summary.hashes, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.dims, 2);

    let results = run_vsearch(&engine, "pasta sauce", 10, 0.3, &[]).await.unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].file, "qmd://notes/pasta.md");
    assert!(results[0].score > 0.9, "aligned vectors score near 1.0");

    // Re-running is a no-op: nothing pending.
    let summary = qmd::embedder::run_embed(
        &engine.store,
        &engine.gateway,
        false,
        &qmd::progress::NoProgress,
    )
    .await
    .unwrap();
    assert_eq!(summary.hashes, 0);
}

#[tokio::test]
async fn dimension_switch_requires_force_rebuild() {
    let tmp = tempfile::tempdir().unwrap();

    // First build locks dims = 2.
    let base2 = spawn_stub(stub_state(0, 2, "")).await;
    let config = test_config(tmp.path());
    let gateway =
        LlmGateway::with_providers(&config, Some(provider_at(&base2)), None, None);
    let engine = engine_with_gateway(config, gateway).await;
    seed_document(&engine, "pasta.md", "pasta water binds the sauce").await;
    qmd::embedder::run_embed(&engine.store, &engine.gateway, false, &qmd::progress::NoProgress)
        .await
        .unwrap();

    // A 4-dim provider is rejected without --force.
    let base4 = spawn_stub(stub_state(0, 4, "")).await;
    let gateway4 = LlmGateway::with_providers(
        &engine.config,
        Some(provider_at(&base4)),
        None,
        None,
    );
    seed_document(&engine, "soup.md", "soup stock simmers slowly").await;
    let err = qmd::embedder::run_embed(
        &engine.store,
        &gateway4,
        false,
        &qmd::progress::NoProgress,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, QmdError::DimensionMismatch { existing: 2, requested: 4 }));

    // With force the table is dropped and rebuilt at the new width.
    let summary = qmd::embedder::run_embed(
        &engine.store,
        &gateway4,
        true,
        &qmd::progress::NoProgress,
    )
    .await
    .unwrap();
    assert_eq!(summary.dims, 4);
    assert_eq!(engine.store.vector_dims().await.unwrap().unwrap().0, 4);
}
