//! The universal guarantees: bounded latency, always-returns, deterministic
//! assembly, budget compliance, and event coverage.

use super::*;

#[tokio::test(start_paused = true)]
async fn load_returns_within_the_effective_deadline() {
    let tree = TestTree::new();
    tree.write("core/a.md", "aaa").await;
    tree.write("guidelines/g.md", "ggg").await;
    let source = ScriptedSource::new();
    source.delay(tree.path("core/a.md"), Duration::from_secs(60));
    source.delay(tree.path("guidelines/g.md"), Duration::from_secs(60));
    let loader = build_loader(&tree, EventBus::new(), Some(source), |_| {}).await;

    let started = tokio::time::Instant::now();
    let result = loader
        .load(LoadRequest {
            layers: Some(vec!["core".to_string(), "guidelines".to_string()]),
            timeout_override_ms: Some(200),
            ..LoadRequest::default()
        })
        .await
        .expect("load");
    let elapsed = started.elapsed();

    // D = 200ms; jitter allowance is max(10ms, 2% of D) = 10ms.
    assert!(elapsed <= Duration::from_millis(210), "took {elapsed:?}");
    assert!(result.duration_ms <= 210);
    assert_eq!(result.status, LoadStatus::Timeout);
    assert!(result
        .warnings
        .iter()
        .any(|warning| warning.reason == "skipped:deadline"));
}

#[tokio::test]
async fn load_always_returns_a_result() {
    // Missing content root: no layers exist, nothing to read.
    let tree = TestTree::new();
    let loader = build_loader(&tree, EventBus::new(), None, |config| {
        config.content_root = tree.path("does-not-exist");
    })
    .await;

    let result = loader
        .load(LoadRequest {
            task: Some("anything at all".to_string()),
            ..LoadRequest::default()
        })
        .await
        .expect("task-only load");
    assert!(result.layers_loaded.is_empty());

    let result = loader
        .load(LoadRequest {
            layers: Some(vec!["ghost".to_string()]),
            ..LoadRequest::default()
        })
        .await
        .expect("unknown-layer load");
    assert!(result
        .warnings
        .iter()
        .any(|warning| warning.reason == "unknown_layer"));

    // The only rejected shape: no task, no layers.
    let error = loader.load(LoadRequest::default()).await.expect_err("empty");
    assert!(error.is_bad_request());
}

#[tokio::test]
async fn assembly_is_byte_identical_across_runs() {
    let tree = TestTree::new();
    tree.write("core/a.md", "alpha\n").await;
    tree.write("core/b.md", "beta\n").await;
    tree.write("guidelines/g.md", "gamma\n").await;
    let loader = build_loader(&tree, EventBus::new(), None, |_| {}).await;
    let request = || LoadRequest {
        layers: Some(vec!["core".to_string(), "guidelines".to_string()]),
        ..LoadRequest::default()
    };

    let first = loader.load(request()).await.expect("first");
    assert_eq!(first.status, LoadStatus::Success);
    for _ in 0..3 {
        let again = loader.load(request()).await.expect("repeat");
        assert_eq!(again.content.as_bytes(), first.content.as_bytes());
        assert_eq!(again.layers_loaded, first.layers_loaded);
    }
}

#[tokio::test]
async fn budget_is_respected_when_layer_costs_fit_exactly() {
    let tree = TestTree::new();
    // 400 bytes = 100 tokens per layer.
    tree.write_bytes("core/a.md", &[b'a'; 400]).await;
    tree.write_bytes("guidelines/g.md", &[b'g'; 400]).await;
    tree.write_bytes("practices/p.md", &[b'p'; 400]).await;
    let loader = build_loader(&tree, EventBus::new(), None, |config| {
        config.loading.default_layers = Vec::new();
    })
    .await;

    let result = loader
        .load(LoadRequest {
            layers: Some(vec!["*".to_string()]),
            token_budget: Some(200),
            ..LoadRequest::default()
        })
        .await
        .expect("load");
    assert_eq!(result.layers_loaded.len(), 2);
    assert!(result.approximate_tokens <= 200);
    assert_eq!(
        result
            .warnings
            .iter()
            .filter(|warning| warning.reason == "skipped:budget")
            .count(),
        1
    );
}

#[tokio::test]
async fn every_load_brackets_events_exactly_once() {
    let tree = TestTree::new();
    tree.write("core/a.md", "aaa").await;
    tree.write("guidelines/g.md", "ggg").await;
    let bus = EventBus::new();
    let mut events = bus.subscribe();
    let loader = build_loader(&tree, bus.clone(), None, |_| {}).await;

    let result = loader
        .load(LoadRequest {
            layers: Some(vec!["core".to_string(), "guidelines".to_string()]),
            ..LoadRequest::default()
        })
        .await
        .expect("load");
    assert_eq!(result.layers_loaded.len(), 2);

    let kinds = drain_kinds(&mut events);
    assert_eq!(count_kind(&kinds, EventKind::LoadStart), 1);
    assert_eq!(count_kind(&kinds, EventKind::LoadComplete), 1);
    assert_eq!(count_kind(&kinds, EventKind::LoadLayerStart), 2);
    assert_eq!(
        count_kind(&kinds, EventKind::LoadLayerComplete)
            + count_kind(&kinds, EventKind::LoadLayerFallback),
        2
    );
}

#[tokio::test]
async fn events_carry_the_request_correlation_id() {
    let tree = TestTree::new();
    tree.write("core/a.md", "aaa").await;
    let bus = EventBus::new();
    let mut events = bus.subscribe();
    let loader = build_loader(&tree, bus.clone(), None, |_| {}).await;

    let result = loader
        .load(LoadRequest {
            layers: Some(vec!["core".to_string()]),
            correlation_id: Some("req-42".to_string()),
            ..LoadRequest::default()
        })
        .await
        .expect("load");
    assert_eq!(result.correlation_id, "req-42");
    for event in events.drain() {
        assert_eq!(event.correlation_id, "req-42", "{:?}", event.kind);
    }
}

#[tokio::test]
async fn disabled_event_bus_still_loads() {
    let tree = TestTree::new();
    tree.write("core/a.md", "aaa").await;
    let bus = EventBus::new();
    let mut events = bus.subscribe();
    let loader = build_loader(&tree, bus.clone(), None, |config| {
        config.events_enabled = false;
    })
    .await;

    let result = loader
        .load(LoadRequest {
            layers: Some(vec!["core".to_string()]),
            ..LoadRequest::default()
        })
        .await
        .expect("load");
    assert_eq!(result.status, LoadStatus::Success);
    // The builder swapped in a disabled bus; the external one saw nothing.
    assert!(events.drain().is_empty());
    assert!(!loader.event_bus().is_enabled());
}
