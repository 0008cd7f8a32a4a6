//! End-to-end improvement cycle against a stubbed observability backend:
//! a quality regression is detected, the cycle commits a change record,
//! cooldown blocks the next trigger, and a rollback plans the inverse of
//! the committed improvements without erasing history.

use engine_core::audit::ChangeType;
use engine_core::QualityEngine;
use engine_config::EngineConfig;
use serde_json::{json, Value};
use std::time::Duration;

fn run_json(id: usize, start: chrono::DateTime<chrono::Utc>, quality: f64) -> Value {
    json!({
        "id": format!("run-{}", id),
        "session_name": "credit-prod",
        "status": "success",
        "start_time": start.to_rfc3339(),
        "end_time": (start + chrono::Duration::seconds(1)).to_rfc3339(),
        "total_tokens": 128,
        "outputs": { "quality_score": quality },
        "extra_metadata": { "model": "gpt-4o" }
    })
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_regression_cycle_cooldown_and_rollback() {
    let mut server = mockito::Server::new_async().await;
    let now = chrono::Utc::now();

    // 50 baseline traces at 0.93 four days ago, 50 current traces at 0.80.
    // The backend ignores time filters; the analyzer buckets by timestamp.
    let mut runs = Vec::new();
    for i in 0..50 {
        runs.push(run_json(i, now - chrono::Duration::days(4), 0.93));
    }
    for i in 50..100 {
        runs.push(run_json(i, now - chrono::Duration::minutes(30), 0.80));
    }
    server
        .mock("GET", "/api/v1/runs")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(json!(runs).to_string())
        .create_async()
        .await;
    server
        .mock("GET", "/api/v1/datasets")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body("[]")
        .create_async()
        .await;
    server
        .mock("POST", "/api/v1/datasets")
        .with_status(200)
        .with_body(json!({ "id": "ds-1", "name": "stub" }).to_string())
        .create_async()
        .await;
    server
        .mock("GET", "/api/v1/datasets/ds-1/search")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body("[]")
        .create_async()
        .await;
    server
        .mock("GET", "/api/v1/workspaces/current/stats")
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::default();
    config.observability.api_key = "test-key".to_string();
    config.observability.organization_id = "test-org".to_string();
    config.observability.base_url = server.url();
    config.observability.max_retries = 0;
    config.observability.retry_base_ms = 10;
    config.audit.path = dir.path().join("audit/history.json");

    let mut engine = QualityEngine::new(config).await.unwrap();
    let handle = engine.handle();
    engine.start().await.unwrap();

    // Wait for the ingested traces to flow through the batch processor
    wait_until("traces processed", || {
        let handle = handle.clone();
        async move { handle.status().await.counters.traces_processed >= 100 }
    })
    .await;

    // Scenario 1: a trigger produces a committed optimization cycle
    let outcome = handle.trigger("operator: quality check", false).unwrap();
    assert!(outcome.success, "trigger refused: {}", outcome.reason);

    wait_until("cycle committed", || {
        let handle = handle.clone();
        async move { handle.history(1).await.1.total >= 1 }
    })
    .await;

    let (recent, summary) = handle.history(10).await;
    assert_eq!(summary.optimization_cycles, 1);
    let cycle = &recent[0];
    assert_eq!(cycle.change_type, ChangeType::OptimizationCycle);
    assert!(cycle.success);
    for component in ["delta_analysis", "meta_learning", "quality_prediction"] {
        assert!(
            cycle.components_executed.iter().any(|c| c == component),
            "missing component {}",
            component
        );
    }
    let regression = cycle
        .improvements_identified
        .iter()
        .find(|i| i.kind == "regression_detected")
        .expect("regression improvement");
    // A 0.13 drop is past the 0.10 cutoff
    assert_eq!(
        regression.severity,
        Some(engine_core::audit::Severity::High)
    );
    assert!(regression.before.is_some() && regression.after.is_some());

    // Cooldown began at commit time
    wait_until("cooldown started", || {
        let handle = handle.clone();
        async move { handle.status().await.cooldown_remaining_secs > 0 }
    })
    .await;
    assert!(handle.status().await.cooldown_remaining_secs > 3500);

    // The applied strategies received the cycle's outcome
    let learned = engine.strategies();
    assert!(
        learned.iter().any(|s| s.sample_size > 0),
        "no strategy outcome was recorded"
    );

    // Scenario 2: an immediate second trigger is blocked by cooldown
    let blocked = handle.trigger("manual retry", false).unwrap();
    assert!(!blocked.success);
    assert!(blocked.reason.starts_with("Cooldown active"));

    // Scenario 3: rollback plans the inverse and preserves history
    let rollback = handle.rollback(None).await.unwrap();
    assert!(rollback.success);
    assert_eq!(rollback.configurations_rolled_back, 1);
    assert_eq!(
        rollback.target_cycle_id.as_deref(),
        Some(cycle.cycle_id.as_str())
    );
    let inverse = &rollback.rollback_details[0];
    assert_eq!(inverse.kind, "rollback_regression_detected");
    assert_eq!(inverse.before, regression.after);
    assert_eq!(inverse.after, regression.before);

    let (recent, _) = handle.history(2).await;
    assert_eq!(recent[0].change_type, ChangeType::RollbackExecution);
    assert_eq!(recent[1].change_id, cycle.change_id);

    engine.shutdown().await.unwrap();
}
