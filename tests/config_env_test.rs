//! Environment-driven configuration, exercised end-to-end through
//! `EngineConfig::load`. Kept as a single test because environment
//! variables are process-global.

use engine_config::{ConfigOverrides, EngineConfig};

#[tokio::test]
async fn test_environment_overrides_layer_over_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.toml");
    tokio::fs::write(
        &path,
        r#"
[observability]
api_key = "file-key"
organization_id = "file-org"

[pipeline]
batch_size = 10
"#,
    )
    .await
    .unwrap();

    std::env::set_var("OBS_API_KEY", "env-key");
    std::env::set_var("OBS_ORG_ID", "env-org");
    std::env::set_var("OBS_BASE_URL", "https://obs.internal.example.com");
    std::env::set_var("QUALITY_THRESHOLD", "0.92");
    std::env::set_var("POLL_INTERVAL_SECONDS", "30");
    std::env::set_var("BATCH_SIZE", "25");
    std::env::set_var("TRACE_CHAN_CAPACITY", "100");
    std::env::set_var("COOLDOWN_SECONDS", "1800");
    std::env::set_var("RATE_LIMIT_PER_MINUTE", "500");
    std::env::set_var("AUDIT_MEM_SIZE", "10");
    std::env::set_var("AUDIT_PATH", "/tmp/audit.json");

    let config = EngineConfig::load(Some(path.clone()), ConfigOverrides::default())
        .await
        .unwrap();

    assert_eq!(config.observability.api_key, "env-key");
    assert_eq!(config.observability.organization_id, "env-org");
    assert_eq!(
        config.observability.base_url,
        "https://obs.internal.example.com"
    );
    assert_eq!(config.monitor.low, 0.92);
    assert_eq!(config.pipeline.poll_interval_secs, 30);
    assert_eq!(config.pipeline.batch_size, 25);
    assert_eq!(config.pipeline.trace_chan_capacity, 100);
    assert_eq!(config.orchestrator.cooldown_secs, 1800);
    assert_eq!(config.observability.rate_limit_per_minute, 500);
    assert_eq!(config.audit.mem_size, 10);
    assert_eq!(
        config.audit.path,
        std::path::PathBuf::from("/tmp/audit.json")
    );

    // An invalid numeric value fails fast instead of being ignored
    std::env::set_var("QUALITY_THRESHOLD", "not-a-number");
    let result = EngineConfig::load(Some(path), ConfigOverrides::default()).await;
    assert!(result.is_err());

    for var in [
        "OBS_API_KEY",
        "OBS_ORG_ID",
        "OBS_BASE_URL",
        "QUALITY_THRESHOLD",
        "POLL_INTERVAL_SECONDS",
        "BATCH_SIZE",
        "TRACE_CHAN_CAPACITY",
        "COOLDOWN_SECONDS",
        "RATE_LIMIT_PER_MINUTE",
        "AUDIT_MEM_SIZE",
        "AUDIT_PATH",
    ] {
        std::env::remove_var(var);
    }
}
