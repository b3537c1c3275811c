//! Call round-trip benchmark suite.
//!
//! Benchmarks complete CALL → RESULT round trips through an in-memory
//! browser:
//! - Sequential calls
//! - Concurrent batches: 10, 100, 1000
//! - Calls carrying a callback argument
//!
//! Run with: cargo bench --bench call_roundtrip
//! Results saved to: target/criterion/
//!
//! Set `RUST_LOG=lcap_bridge=debug` to see bridge logs.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use futures_util::future::try_join_all;
use lcap_bridge::{
    BridgeConfig, Browser, CallArg, FunctionRegistry, PopupClient, ServerListener, args,
};
use serde_json::json;
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Configuration
// ============================================================================

const CLIENT_URL: &str = "http://localhost:3000/";
const PLATFORM_URL: &str = "https://platform.example.com/main.jsp";
const PLATFORM_ORIGIN: &str = "https://platform.example.com";

const BATCH_SIZES: &[usize] = &[10, 100, 1000];

// ============================================================================
// Setup
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Builds a browser with a connected client.
async fn connected_client() -> (Browser, PopupClient) {
    let browser = Browser::new();

    let mut registry = FunctionRegistry::new();
    registry.register_sync("_RB.selectQuery", |invocation| {
        Ok(json!([{ "id": 1, "section": invocation.value(1).cloned() }]))
    });
    registry.register_fn("_RB.job", |invocation| async move {
        if let Some(progress) = invocation.callback(0) {
            progress.invoke_json(vec![json!(100)]);
        }
        Ok(json!("done"))
    });

    let listener = ServerListener::builder()
        .trusted_origin("http://localhost:3000")
        .allow("_RB")
        .registry(registry)
        .build()
        .expect("listener");
    browser
        .on_page_load(PLATFORM_ORIGIN, move |page| {
            listener.install(page);
        })
        .expect("page loader");

    let tab = browser.open_tab(CLIENT_URL).expect("client tab");
    let config = BridgeConfig::builder()
        .platform_url(PLATFORM_URL)
        .build()
        .expect("config");
    let client = PopupClient::initialize(&tab, config);
    tab.with_user_gesture(|g| client.connect_from_click(g))
        .expect("connect");

    // First call doubles as the handshake barrier.
    client
        .call("_RB.selectQuery", args![["id"], "Warmup"])
        .await
        .expect("warmup");

    (browser, client)
}

// ============================================================================
// Benchmark: Sequential Calls
// ============================================================================

fn bench_sequential(c: &mut Criterion) {
    init_tracing();
    let rt = Runtime::new().expect("runtime");
    let (_browser, client) = rt.block_on(connected_client());

    c.bench_function("call_sequential", |b| {
        b.to_async(&rt).iter(|| async {
            client
                .call("_RB.selectQuery", args![["id", "name"], "Section", "", 100, true])
                .await
                .expect("call")
        });
    });
}

// ============================================================================
// Benchmark: Concurrent Batches
// ============================================================================

fn bench_concurrent(c: &mut Criterion) {
    init_tracing();
    let rt = Runtime::new().expect("runtime");
    let (_browser, client) = rt.block_on(connected_client());

    let mut group = c.benchmark_group("call_concurrent");
    for &size in BATCH_SIZES {
        group.bench_with_input(BenchmarkId::new("batch", size), &size, |b, &batch| {
            b.to_async(&rt).iter(|| async {
                let calls: Vec<_> = (0..batch)
                    .map(|i| client.call("_RB.selectQuery", args![["id"], format!("S{i}")]))
                    .collect();
                try_join_all(calls).await.expect("batch")
            });
        });
    }
    group.finish();
}

// ============================================================================
// Benchmark: Callback Arguments
// ============================================================================

fn bench_callbacks(c: &mut Criterion) {
    init_tracing();
    let rt = Runtime::new().expect("runtime");
    let (_browser, client) = rt.block_on(connected_client());
    let invoked = Arc::new(AtomicUsize::new(0));

    c.bench_function("call_with_callback", |b| {
        b.to_async(&rt).iter(|| {
            let counter = Arc::clone(&invoked);
            let call = client.call(
                "_RB.job",
                args![CallArg::callback(move |_| {
                    counter.fetch_add(1, Ordering::Relaxed);
                })],
            );
            async move { call.await.expect("call") }
        });
    });
}

criterion_group!(benches, bench_sequential, bench_concurrent, bench_callbacks);
criterion_main!(benches);
