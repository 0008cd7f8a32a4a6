//! Common types and utilities shared across all crates.
//!
//! This crate provides foundational types, error definitions, and utility
//! functions that are used throughout the quality engine.

use std::fmt;

/// Re-export commonly used external crates
pub use async_trait::async_trait;
pub use chrono;
pub use serde;
pub use serde_json;
pub use tracing;
pub use uuid;

/// Common result type used across the codebase
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the quality engine
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Non-retryable backend rejection (4xx other than 429)
    #[error("Backend error ({status}): {body}")]
    Backend { status: u16, body: String },

    /// Transient network failure: connect errors, resets, 5xx, 429
    #[error("Transport error: {0}")]
    Transport(String),

    /// The audit store is unavailable and the engine is read-only
    #[error("Degraded: {0}")]
    Degraded(String),

    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Whether this failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout(_))
    }
}

/// Identifier of an improvement cycle.
///
/// Cycle ids are wall-clock derived (`cycle_<unix_nanos>`) so that audit
/// entries sort by creation time even across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct CycleId(pub String);

impl CycleId {
    pub fn new() -> Self {
        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| chrono::Utc::now().timestamp_micros().saturating_mul(1000));
        Self(format!("cycle_{}", nanos))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CycleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CycleId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Timestamp type alias for consistency
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Get current timestamp
pub fn now() -> Timestamp {
    chrono::Utc::now()
}

/// Module trait for all engine services
#[async_trait]
pub trait Module: Send + Sync {
    /// Module name
    fn name(&self) -> &str;

    /// Initialize the module
    async fn initialize(&mut self) -> Result<()>;

    /// Shutdown the module
    async fn shutdown(&mut self) -> Result<()>;
}

/// Version information
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Utility functions
pub mod utils {
    /// Sanitize a string for safe display/logging
    pub fn sanitize(input: &str) -> String {
        input
            .chars()
            .filter(|c| c.is_ascii_graphic() || c.is_ascii_whitespace())
            .collect()
    }

    /// Truncate a string to a maximum length
    pub fn truncate(s: &str, max_len: usize) -> String {
        if s.len() <= max_len {
            s.to_string()
        } else {
            format!("{}...", &s[..max_len.saturating_sub(3)])
        }
    }

    /// Clamp a score into the valid quality range
    pub fn clamp_score(score: f64) -> f64 {
        score.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cycle_id_generation() {
        let id1 = CycleId::new();
        let id2 = CycleId::new();
        assert!(id1.as_str().starts_with("cycle_"));
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_version_display() {
        let version = Version {
            major: 1,
            minor: 2,
            patch: 3,
        };
        assert_eq!(version.to_string(), "1.2.3");
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Transport("connection reset".into()).is_transient());
        assert!(Error::Timeout("deadline".into()).is_transient());
        assert!(!Error::Backend {
            status: 404,
            body: "not found".into()
        }
        .is_transient());
        assert!(!Error::Config("missing key".into()).is_transient());
    }

    proptest! {
        #[test]
        fn test_version_roundtrip(major in 0u32..100, minor in 0u32..100, patch in 0u32..100) {
            let version = Version { major, minor, patch };
            let serialized = serde_json::to_string(&version).unwrap();
            let deserialized: Version = serde_json::from_str(&serialized).unwrap();

            assert_eq!(version.major, deserialized.major);
            assert_eq!(version.minor, deserialized.minor);
            assert_eq!(version.patch, deserialized.patch);
        }

        #[test]
        fn test_sanitize_does_not_crash(s in "\\PC*") {
            let _ = utils::sanitize(&s);
        }

        #[test]
        fn test_clamp_score_in_range(x in -10.0f64..10.0) {
            let clamped = utils::clamp_score(x);
            assert!((0.0..=1.0).contains(&clamped));
        }
    }
}
