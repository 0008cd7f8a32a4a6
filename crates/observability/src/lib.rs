//! HTTP client for the observability backend.
//!
//! This crate owns the session lifecycle, authentication, request-rate
//! limiting, retry policy, and the GET->POST endpoint fallback table for
//! the trace and feedback store the engine monitors.

pub mod client;
pub mod rate_limit;
pub mod types;

pub use client::{Client, ClientBuilder};
pub use rate_limit::RateLimiter;
pub use types::{
    AnnotationQueueRef, BulkExportRef, BulkExportStatus, DatasetRef, Example, FeedbackRef, RawRun,
    RunFilters, RunStats, SessionRef, WorkspaceStats,
};
