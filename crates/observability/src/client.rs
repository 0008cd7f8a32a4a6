//! Observability backend HTTP client.
//!
//! One shared `reqwest` client with default auth headers, bounded in-flight
//! concurrency, a sliding-window rate limiter, and bounded retries with
//! exponential backoff. GET endpoints with known 405 drift fall back to
//! their documented POST alternates; if the alternates fail too, the stats
//! operations degrade to deterministic zero-valued responses so downstream
//! components stay live while the backend misbehaves.

use crate::rate_limit::RateLimiter;
use crate::types::{
    AnnotationQueueRef, BulkExportRef, BulkExportStatus, DatasetRef, Example, FeedbackRef, RawRun,
    RunFilters, RunStats, SessionRef, WorkspaceStats,
};
use common::{Error, Result};
use engine_config::{EndpointFallback, ObservabilityConfig};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on concurrently in-flight requests
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

const HEADER_API_KEY: &str = "x-api-key";
const HEADER_ORG_ID: &str = "x-organization-id";

/// Client for the observability backend
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: reqwest::Client,
    base_url: String,
    limiter: RateLimiter,
    in_flight: Semaphore,
    max_retries: u32,
    retry_base: Duration,
    fallbacks: HashMap<String, String>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.inner.base_url)
            .field("max_retries", &self.inner.max_retries)
            .finish()
    }
}

impl Client {
    /// Create a new client builder
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Create a client from an [`ObservabilityConfig`]
    pub fn from_config(config: &ObservabilityConfig) -> Result<Self> {
        ClientBuilder::default()
            .api_key(&config.api_key)
            .organization_id(&config.organization_id)
            .base_url(&config.base_url)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .max_retries(config.max_retries)
            .retry_base(Duration::from_millis(config.retry_base_ms))
            .rate_limit_per_minute(config.rate_limit_per_minute)
            .fallbacks(&config.fallbacks)
            .build()
    }

    /// Base URL this client talks to
    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// List recent runs matching the filters. Malformed items are skipped
    /// and logged, never propagated.
    pub async fn list_runs(&self, filters: &RunFilters) -> Result<Vec<RawRun>> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if !filters.session_names.is_empty() {
            query.push(("session", filters.session_names.join(",")));
        }
        if let Some(start) = filters.start_time {
            query.push(("start_time", start.to_rfc3339()));
        }
        if let Some(end) = filters.end_time {
            query.push(("end_time", end.to_rfc3339()));
        }
        if let Some(limit) = filters.limit {
            query.push(("limit", limit.to_string()));
        }
        if filters.include_feedback {
            query.push(("include_feedback", "true".to_string()));
        }

        let value = self.request_json(Method::GET, "/api/v1/runs", &query, None).await?;
        Ok(parse_items(value, "runs"))
    }

    /// Workspace-level statistics. Degrades to a zero-valued
    /// [`WorkspaceStats`] when the endpoint and its alternate both fail.
    pub async fn get_workspace_stats(&self) -> Result<WorkspaceStats> {
        match self
            .get_with_fallback("/api/v1/workspaces/current/stats", &[])
            .await
        {
            Ok(value) => Ok(serde_json::from_value(value)?),
            Err(FallbackOutcome::NoFallback(err)) => Err(err),
            Err(FallbackOutcome::AlternateFailed(err)) => {
                warn!("workspace stats unavailable, serving zero-valued fallback: {}", err);
                Ok(WorkspaceStats::default())
            }
        }
    }

    /// Aggregate run statistics. Degrades to the zero-run [`RunStats`]
    /// fallback when the endpoint and its alternate both fail.
    pub async fn get_runs_stats(&self, filters: &RunFilters) -> Result<RunStats> {
        let query = stats_query(filters);
        match self.get_with_fallback("/api/v1/runs/stats", &query).await {
            Ok(value) => Ok(serde_json::from_value(value)?),
            Err(FallbackOutcome::NoFallback(err)) => Err(err),
            Err(FallbackOutcome::AlternateFailed(err)) => {
                warn!("runs stats unavailable, serving zero-valued fallback: {}", err);
                Ok(RunStats::default())
            }
        }
    }

    /// Grouped run statistics (per session group).
    pub async fn get_runs_group_stats(&self, filters: &RunFilters) -> Result<Value> {
        let query = stats_query(filters);
        self.request_json(Method::GET, "/api/v1/runs/group/stats", &query, None)
            .await
    }

    // ------------------------------------------------------------------
    // Datasets
    // ------------------------------------------------------------------

    pub async fn create_dataset(&self, name: &str, description: &str) -> Result<DatasetRef> {
        let body = json!({ "name": name, "description": description });
        let value = self
            .request_json(Method::POST, "/api/v1/datasets", &[], Some(body))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn list_datasets(&self) -> Result<Vec<DatasetRef>> {
        let value = self.request_json(Method::GET, "/api/v1/datasets", &[], None).await?;
        Ok(parse_items(value, "datasets"))
    }

    /// Append examples to a dataset, returning the number accepted.
    pub async fn add_examples(&self, dataset_id: &str, examples: &[Example]) -> Result<usize> {
        let path = format!("/api/v1/datasets/{}/examples", dataset_id);
        let body = serde_json::to_value(examples)?;
        let value = self.request_json(Method::POST, &path, &[], Some(body)).await?;
        Ok(value
            .get("added")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(examples.len()))
    }

    pub async fn search_examples(
        &self,
        dataset_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Example>> {
        let path = format!("/api/v1/datasets/{}/search", dataset_id);
        let params = [
            ("query", query.to_string()),
            ("limit", limit.to_string()),
        ];
        let value = self.request_json(Method::GET, &path, &params, None).await?;
        Ok(parse_items(value, "examples"))
    }

    // ------------------------------------------------------------------
    // Feedback
    // ------------------------------------------------------------------

    pub async fn create_feedback(
        &self,
        run_id: &str,
        key: &str,
        score: f64,
        comment: Option<&str>,
        correction: Option<&Value>,
    ) -> Result<FeedbackRef> {
        let mut body = Map::new();
        body.insert("run_id".to_string(), json!(run_id));
        body.insert("key".to_string(), json!(key));
        body.insert("score".to_string(), json!(score));
        if let Some(comment) = comment {
            body.insert("comment".to_string(), json!(comment));
        }
        if let Some(correction) = correction {
            body.insert("correction".to_string(), correction.clone());
        }
        let value = self
            .request_json(Method::POST, "/api/v1/feedback", &[], Some(Value::Object(body)))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    // ------------------------------------------------------------------
    // Bulk exports
    // ------------------------------------------------------------------

    pub async fn create_bulk_export(&self, filters: Value) -> Result<BulkExportRef> {
        let value = self
            .request_json(Method::POST, "/api/v1/bulk-exports", &[], Some(filters))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_bulk_export_status(&self, export_id: &str) -> Result<BulkExportStatus> {
        let path = format!("/api/v1/bulk-exports/{}", export_id);
        let value = self.request_json(Method::GET, &path, &[], None).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn download_bulk_export(&self, export_id: &str) -> Result<Vec<u8>> {
        let path = format!("/api/v1/bulk-exports/{}/download", export_id);
        let response = self.execute(Method::GET, &path, &[], None).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Backend {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("failed to read export body: {}", e)))?;
        Ok(bytes.to_vec())
    }

    // ------------------------------------------------------------------
    // Sessions & annotation queues
    // ------------------------------------------------------------------

    pub async fn list_sessions(&self) -> Result<Vec<SessionRef>> {
        let value = self.request_json(Method::GET, "/api/v1/sessions", &[], None).await?;
        Ok(parse_items(value, "sessions"))
    }

    pub async fn list_annotation_queues(&self) -> Result<Vec<AnnotationQueueRef>> {
        let value = self
            .request_json(Method::GET, "/api/v1/annotation-queues", &[], None)
            .await?;
        Ok(parse_items(value, "queues"))
    }

    pub async fn create_annotation_queue(
        &self,
        name: &str,
        description: &str,
    ) -> Result<AnnotationQueueRef> {
        let body = json!({ "name": name, "description": description });
        let value = self
            .request_json(Method::POST, "/api/v1/annotation-queues", &[], Some(body))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn add_to_annotation_queue(&self, queue_id: &str, run_ids: &[String]) -> Result<()> {
        let path = format!("/api/v1/annotation-queues/{}/runs", queue_id);
        let body = json!({ "run_ids": run_ids });
        self.request_json(Method::POST, &path, &[], Some(body)).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Request core
    // ------------------------------------------------------------------

    /// GET with 405 -> POST fallback from the configured table. Query
    /// parameters become the POST body on the alternate path.
    async fn get_with_fallback(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> std::result::Result<Value, FallbackOutcome> {
        match self.request_json(Method::GET, path, query, None).await {
            Ok(value) => Ok(value),
            Err(Error::Backend { status: 405, .. }) => {
                let Some(post_path) = self.inner.fallbacks.get(path).cloned() else {
                    return Err(FallbackOutcome::NoFallback(Error::Backend {
                        status: 405,
                        body: format!("no POST alternate configured for {}", path),
                    }));
                };
                debug!("GET {} returned 405, retrying as POST {}", path, post_path);
                let body: Map<String, Value> = query
                    .iter()
                    .map(|(k, v)| (k.to_string(), Value::String(v.clone())))
                    .collect();
                self.request_json(Method::POST, &post_path, &[], Some(Value::Object(body)))
                    .await
                    .map_err(FallbackOutcome::AlternateFailed)
            }
            Err(err) => Err(FallbackOutcome::NoFallback(err)),
        }
    }

    /// Issue a request and parse the JSON response body.
    async fn request_json(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Value> {
        let response = self.execute(method, path, query, body).await?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(Error::Backend {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(Error::from)
    }

    /// Rate-limited, retrying request execution. Transient failures (429,
    /// 5xx, network errors, timeouts) are retried with exponential backoff
    /// up to `max_retries`; everything else is returned to the caller.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.inner.base_url, path);
        let _permit = self
            .inner
            .in_flight
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)?;

        let mut attempt: u32 = 0;
        loop {
            self.inner.limiter.acquire().await;

            let mut request = self.inner.http.request(method.clone(), &url);
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(ref body) = body {
                request = request.json(body);
            }

            let outcome = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        Err(Error::Transport(format!("{} {} returned {}", method, path, status)))
                    } else {
                        return Ok(response);
                    }
                }
                Err(e) if e.is_timeout() => {
                    Err(Error::Timeout(format!("{} {} timed out", method, path)))
                }
                Err(e) => Err(Error::Transport(format!("{} {} failed: {}", method, path, e))),
            };

            match outcome {
                Err(err) if err.is_transient() && attempt < self.inner.max_retries => {
                    let backoff = self.inner.retry_base * 2u32.saturating_pow(attempt);
                    warn!(
                        attempt = attempt + 1,
                        "transient backend failure, retrying in {:?}: {}", backoff, err
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
                Ok(()) => unreachable!(),
            }
        }
    }
}

/// Distinguishes "the GET itself failed" from "the POST alternate failed",
/// because only the latter is allowed to degrade to zero-valued stats.
enum FallbackOutcome {
    NoFallback(Error),
    AlternateFailed(Error),
}

fn stats_query(filters: &RunFilters) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if !filters.session_names.is_empty() {
        query.push(("session", filters.session_names.join(",")));
    }
    if let Some(start) = filters.start_time {
        query.push(("start_time", start.to_rfc3339()));
    }
    if let Some(end) = filters.end_time {
        query.push(("end_time", end.to_rfc3339()));
    }
    query
}

/// Parse a response that is either a bare array or an object wrapping the
/// array under `key`. Items that fail to deserialize are skipped.
fn parse_items<T: serde::de::DeserializeOwned>(value: Value, key: &str) -> Vec<T> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Array(items)) => items,
            _ => {
                warn!("unexpected response shape: object without {:?} array", key);
                return Vec::new();
            }
        },
        _ => {
            warn!("unexpected response shape: neither array nor object");
            return Vec::new();
        }
    };

    let total = items.len();
    let parsed: Vec<T> = items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("skipping malformed item: {}", e);
                None
            }
        })
        .collect();
    if parsed.len() < total {
        warn!("dropped {} malformed items of {}", total - parsed.len(), total);
    }
    parsed
}

/// Builder for the observability client
#[derive(Default)]
pub struct ClientBuilder {
    api_key: Option<String>,
    organization_id: Option<String>,
    base_url: Option<String>,
    timeout: Option<Duration>,
    max_retries: Option<u32>,
    retry_base: Option<Duration>,
    rate_limit_per_minute: Option<usize>,
    max_in_flight: Option<usize>,
    fallbacks: Vec<EndpointFallback>,
}

impl ClientBuilder {
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn organization_id(mut self, org: impl Into<String>) -> Self {
        self.organization_id = Some(org.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        let url: String = url.into();
        self.base_url = Some(url.trim_end_matches('/').to_string());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    #[must_use]
    pub fn retry_base(mut self, base: Duration) -> Self {
        self.retry_base = Some(base);
        self
    }

    #[must_use]
    pub fn rate_limit_per_minute(mut self, limit: usize) -> Self {
        self.rate_limit_per_minute = Some(limit);
        self
    }

    #[must_use]
    pub fn max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = Some(limit);
        self
    }

    pub fn fallbacks(mut self, fallbacks: &[EndpointFallback]) -> Self {
        self.fallbacks = fallbacks.to_vec();
        self
    }

    /// Build the client
    pub fn build(self) -> Result<Client> {
        let api_key = self
            .api_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Config("API key is required".to_string()))?;
        let organization_id = self
            .organization_id
            .filter(|o| !o.is_empty())
            .ok_or_else(|| Error::Config("organization id is required".to_string()))?;
        let base_url = self
            .base_url
            .unwrap_or_else(|| engine_config::DEFAULT_BASE_URL.to_string());
        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(HEADER_API_KEY),
            HeaderValue::from_str(&api_key)
                .map_err(|e| Error::Config(format!("invalid API key: {}", e)))?,
        );
        headers.insert(
            HeaderName::from_static(HEADER_ORG_ID),
            HeaderValue::from_str(&organization_id)
                .map_err(|e| Error::Config(format!("invalid organization id: {}", e)))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        let fallbacks = self
            .fallbacks
            .into_iter()
            .map(|f| (f.get_path, f.post_path))
            .collect();

        Ok(Client {
            inner: Arc::new(ClientInner {
                http,
                base_url,
                limiter: RateLimiter::per_minute(self.rate_limit_per_minute.unwrap_or(1000)),
                in_flight: Semaphore::new(self.max_in_flight.unwrap_or(DEFAULT_MAX_IN_FLIGHT)),
                max_retries: self.max_retries.unwrap_or(3),
                retry_base: self.retry_base.unwrap_or(Duration::from_secs(1)),
                fallbacks,
            }),
        })
    }
}
