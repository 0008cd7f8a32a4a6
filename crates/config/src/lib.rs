//! Configuration management for the quality engine.
//!
//! This crate handles all configuration aspects including loading from files,
//! environment variables, and providing a unified configuration interface.
//!
//! Loading order is default -> file -> environment, so environment variables
//! always win. `OBS_API_KEY` and `OBS_ORG_ID` are required; everything else
//! has a sensible default.

use common::{Error, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default base URL of the observability backend
pub const DEFAULT_BASE_URL: &str = "https://api.smith.langchain.com";

/// Default location of the file-backed audit mirror
pub const DEFAULT_AUDIT_PATH: &str = "audit_trails/ai_changes_history.json";

/// KV key under which the audit history is mirrored when KV-backed
pub const AUDIT_KV_KEY: &str = "tilores:ai_changes_history";

/// Main configuration structure (sensitive fields are redacted in debug output)
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Observability backend client
    pub observability: ObservabilityConfig,

    /// Trace ingestion and batch processing
    pub pipeline: PipelineConfig,

    /// Quality threshold tiers and alerting
    pub monitor: MonitorConfig,

    /// Improvement cycle orchestration
    pub orchestrator: OrchestratorConfig,

    /// Audit log storage
    pub audit: AuditConfig,

    /// Pattern indexing
    pub patterns: PatternConfig,

    /// Delta / regression analysis windows
    pub delta: DeltaConfig,

    /// Feedback collection
    pub feedback: FeedbackConfig,

    /// HTTP adapter
    pub server: ServerConfig,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("observability", &DebugRedactedObservability(&self.observability))
            .field("pipeline", &self.pipeline)
            .field("monitor", &self.monitor)
            .field("orchestrator", &self.orchestrator)
            .field("audit", &self.audit)
            .field("patterns", &self.patterns)
            .field("delta", &self.delta)
            .field("feedback", &self.feedback)
            .field("server", &self.server)
            .finish()
    }
}

/// Wrapper to redact the API key in debug output
struct DebugRedactedObservability<'a>(&'a ObservabilityConfig);

impl<'a> std::fmt::Debug for DebugRedactedObservability<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservabilityConfig")
            .field("api_key", &"<REDACTED>")
            .field("organization_id", &self.0.organization_id)
            .field("base_url", &self.0.base_url)
            .field("request_timeout_secs", &self.0.request_timeout_secs)
            .field("max_retries", &self.0.max_retries)
            .field("retry_base_ms", &self.0.retry_base_ms)
            .field("rate_limit_per_minute", &self.0.rate_limit_per_minute)
            .field("fallbacks", &self.0.fallbacks)
            .finish()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            observability: ObservabilityConfig::default(),
            pipeline: PipelineConfig::default(),
            monitor: MonitorConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            audit: AuditConfig::default(),
            patterns: PatternConfig::default(),
            delta: DeltaConfig::default(),
            feedback: FeedbackConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// A GET endpoint whose backend rejects GET with 405 and expects a POST
/// to an alternate path instead. The table is configuration rather than
/// code because the quirk belongs to the backend's contract, not ours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointFallback {
    /// GET path observed to return 405
    pub get_path: String,
    /// POST path to use instead
    pub post_path: String,
}

static DEFAULT_FALLBACKS: Lazy<Vec<EndpointFallback>> = Lazy::new(|| {
    vec![
        EndpointFallback {
            get_path: "/api/v1/runs/stats".to_string(),
            post_path: "/api/v1/runs/query/stats".to_string(),
        },
        EndpointFallback {
            get_path: "/api/v1/workspaces/current/stats".to_string(),
            post_path: "/api/v1/workspaces/stats".to_string(),
        },
    ]
});

/// Observability backend client configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// API key sent as `X-API-Key`
    pub api_key: String,
    /// Organization id sent as `X-Organization-Id`
    pub organization_id: String,
    /// Base URL of the backend
    pub base_url: String,
    /// Per-request timeout
    pub request_timeout_secs: u64,
    /// Retry budget for transient failures
    pub max_retries: u32,
    /// Base backoff delay, doubled per attempt
    pub retry_base_ms: u64,
    /// Sliding-window request budget per 60 s
    pub rate_limit_per_minute: usize,
    /// GET->POST fallback table for endpoints with 405 drift
    pub fallbacks: Vec<EndpointFallback>,
}

impl std::fmt::Debug for ObservabilityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        DebugRedactedObservability(self).fmt(f)
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            organization_id: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: 30,
            max_retries: 3,
            retry_base_ms: 1000,
            rate_limit_per_minute: 1000,
            fallbacks: DEFAULT_FALLBACKS.clone(),
        }
    }
}

/// Trace ingestion and batch processing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Poll interval for fetching recent traces
    pub poll_interval_secs: u64,
    /// Traces fetched and processed per iteration
    pub batch_size: usize,
    /// Bounded trace channel capacity
    pub trace_chan_capacity: usize,
    /// How long a full channel blocks the ingestor before drop-oldest
    pub backpressure_ms: u64,
    /// Fetch window reaching back from now
    pub lookback_secs: i64,
    /// Ring buffer length for per-model/per-provider means
    pub window_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            batch_size: 50,
            trace_chan_capacity: 200,
            backpressure_ms: 500,
            lookback_secs: 300,
            window_size: 500,
        }
    }
}

/// Quality tier thresholds. A quality below `critical` is critical, below
/// `high` is high, and so on; at or above `low` only liveness alerts fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
    /// The overall quality target; `QUALITY_THRESHOLD` in the environment
    pub low: f64,
    /// Minimum gap between liveness (minimal) alerts
    pub liveness_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            critical: 0.70,
            high: 0.80,
            medium: 0.85,
            low: 0.90,
            liveness_interval_secs: 900,
        }
    }
}

/// Improvement cycle orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Minimum interval between committed cycles
    pub cooldown_secs: u64,
    /// Shorter cooldown applied after a failed cycle
    pub retry_cooldown_secs: u64,
    /// Hard deadline for draining an in-flight cycle on shutdown
    pub drain_deadline_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 3600,
            retry_cooldown_secs: 300,
            drain_deadline_secs: 30,
        }
    }
}

/// Audit log storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// In-memory window size
    pub mem_size: usize,
    /// File-backed mirror path
    pub path: PathBuf,
    /// SQLite URL for the KV-backed mirror; wins over `path` when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kv_url: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            mem_size: 50,
            path: PathBuf::from(DEFAULT_AUDIT_PATH),
            kv_url: None,
        }
    }
}

/// Pattern indexing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Quality at or above which a trace becomes an exemplar candidate
    pub index_threshold: f64,
    /// Results returned by a similarity query
    pub top_k: usize,
    /// Minimum similarity for a result to be returned
    pub min_similarity: f64,
    /// Backend dataset holding indexed exemplars
    pub dataset_name: String,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            index_threshold: 0.95,
            top_k: 5,
            min_similarity: 0.85,
            dataset_name: "success_patterns".to_string(),
        }
    }
}

/// Delta / regression analysis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaConfig {
    /// Baseline window start, days before now
    pub baseline_start_days: i64,
    /// Baseline window end (= current window start), days before now
    pub baseline_end_days: i64,
    /// Overall delta below negative of this is a regression
    pub regression_threshold: f64,
    /// Per-model / per-spectrum delta magnitude marking an affected group
    pub group_threshold: f64,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            baseline_start_days: 8,
            baseline_end_days: 1,
            regression_threshold: 0.05,
            group_threshold: 0.05,
        }
    }
}

/// Feedback collection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Backend dataset holding feedback patterns
    pub dataset_name: String,
    /// Lookback for `recent` corrections
    pub recent_days: i64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            dataset_name: "feedback_patterns".to_string(),
            recent_days: 7,
        }
    }
}

/// HTTP adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8090".to_string(),
        }
    }
}

/// CLI-level overrides applied after file and environment
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub server_bind: Option<String>,
    pub audit_path: Option<PathBuf>,
}

impl EngineConfig {
    /// Load configuration from a file path
    pub async fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load configuration with hierarchy: default -> file -> env -> cli
    pub async fn load(config_path: Option<PathBuf>, overrides: ConfigOverrides) -> Result<Self> {
        let mut config = EngineConfig::default();

        if let Some(path) = config_path {
            if path.exists() {
                config = Self::from_file(path).await?;
            }
        }

        config.apply_env_overrides()?;
        config.apply_overrides(overrides);
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Recognized variables:
    /// - OBS_API_KEY, OBS_ORG_ID (required unless already configured)
    /// - OBS_BASE_URL
    /// - QUALITY_THRESHOLD (0-1)
    /// - POLL_INTERVAL_SECONDS, BATCH_SIZE, TRACE_CHAN_CAPACITY
    /// - COOLDOWN_SECONDS, RATE_LIMIT_PER_MINUTE
    /// - AUDIT_MEM_SIZE, AUDIT_PATH, AUDIT_KV_URL
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(key) = std::env::var("OBS_API_KEY") {
            self.observability.api_key = key;
        }
        if let Ok(org) = std::env::var("OBS_ORG_ID") {
            self.observability.organization_id = org;
        }
        if let Ok(url) = std::env::var("OBS_BASE_URL") {
            self.observability.base_url = url;
        }
        if let Some(threshold) = parse_env::<f64>("QUALITY_THRESHOLD")? {
            self.monitor.low = threshold;
        }
        if let Some(secs) = parse_env::<u64>("POLL_INTERVAL_SECONDS")? {
            self.pipeline.poll_interval_secs = secs;
        }
        if let Some(size) = parse_env::<usize>("BATCH_SIZE")? {
            self.pipeline.batch_size = size;
        }
        if let Some(cap) = parse_env::<usize>("TRACE_CHAN_CAPACITY")? {
            self.pipeline.trace_chan_capacity = cap;
        }
        if let Some(secs) = parse_env::<u64>("COOLDOWN_SECONDS")? {
            self.orchestrator.cooldown_secs = secs;
        }
        if let Some(limit) = parse_env::<usize>("RATE_LIMIT_PER_MINUTE")? {
            self.observability.rate_limit_per_minute = limit;
        }
        if let Some(size) = parse_env::<usize>("AUDIT_MEM_SIZE")? {
            self.audit.mem_size = size;
        }
        if let Ok(path) = std::env::var("AUDIT_PATH") {
            self.audit.path = PathBuf::from(path);
        }
        if let Ok(url) = std::env::var("AUDIT_KV_URL") {
            self.audit.kv_url = Some(url);
        }
        Ok(())
    }

    /// Apply CLI overrides
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(bind) = overrides.server_bind {
            self.server.bind = bind;
        }
        if let Some(path) = overrides.audit_path {
            self.audit.path = path;
        }
    }

    /// Validate the configuration, failing fast on anything unusable
    pub fn validate(&self) -> Result<()> {
        if self.observability.api_key.is_empty() {
            return Err(Error::Config("OBS_API_KEY is required".to_string()));
        }
        if self.observability.organization_id.is_empty() {
            return Err(Error::Config("OBS_ORG_ID is required".to_string()));
        }
        if !(0.0..=1.0).contains(&self.monitor.low) {
            return Err(Error::Config(format!(
                "QUALITY_THRESHOLD must be within [0, 1], got {}",
                self.monitor.low
            )));
        }
        let tiers = [
            self.monitor.critical,
            self.monitor.high,
            self.monitor.medium,
            self.monitor.low,
        ];
        if tiers.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::Config(
                "monitor tiers must be strictly increasing: critical < high < medium < low"
                    .to_string(),
            ));
        }
        if self.pipeline.batch_size == 0 {
            return Err(Error::Config("BATCH_SIZE must be positive".to_string()));
        }
        if self.pipeline.trace_chan_capacity == 0 {
            return Err(Error::Config(
                "TRACE_CHAN_CAPACITY must be positive".to_string(),
            ));
        }
        if self.observability.rate_limit_per_minute == 0 {
            return Err(Error::Config(
                "RATE_LIMIT_PER_MINUTE must be positive".to_string(),
            ));
        }
        if self.audit.mem_size == 0 {
            return Err(Error::Config("AUDIT_MEM_SIZE must be positive".to_string()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} has an invalid value: {:?}", name, raw))),
        Err(_) => Ok(None),
    }
}
