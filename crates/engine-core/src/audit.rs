//! Durable, append-only change log with rollback planning.
//!
//! All mutations flow through a single writer task driven by a bounded
//! channel, which keeps records totally ordered by append sequence.
//! Readers snapshot a bounded in-memory window under a read lock and never
//! block the writer. Every append is written through to the durable store
//! (full history); if persistence fails repeatedly the log flips to a
//! read-only degraded mode and refuses further mutations while the rest of
//! the pipeline keeps ingesting.

use common::{CycleId, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};

/// Attempts to persist one append before degrading.
const PERSIST_ATTEMPTS: u32 = 3;

/// Delay between persist attempts.
const PERSIST_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(50);

/// Capacity of the writer command channel.
const COMMAND_BUFFER: usize = 64;

/// Kinds of audited changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    OptimizationCycle,
    OptimizationFailure,
    RollbackExecution,
    ManualTrigger,
}

/// Severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// One identified improvement within a cycle. Only entries carrying both
/// `before` and `after` are rollback-capable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Improvement {
    #[serde(rename = "type")]
    pub kind: String,
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impact: Option<String>,
}

impl Improvement {
    /// Whether this entry can be inverted by a rollback.
    pub fn is_invertible(&self) -> bool {
        self.before.is_some() && self.after.is_some()
    }

    /// The inverse configuration entry for a rollback of `cycle_id`.
    fn invert(&self, cycle_id: &str) -> Improvement {
        Improvement {
            kind: format!("rollback_{}", self.kind),
            component: self.component.clone(),
            severity: self.severity,
            before: self.after.clone(),
            after: self.before.clone(),
            reason: Some(format!("Rollback from cycle {}", cycle_id)),
            impact: Some("Restoring previous stable configuration".to_string()),
        }
    }
}

/// One audited change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Monotonic id assigned by the writer: `change_<unix_seconds>_<seq>`
    pub change_id: String,
    pub cycle_id: String,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    /// ISO-8601
    pub timestamp: String,
    pub trigger_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score_before: Option<f64>,
    pub components_executed: Vec<String>,
    pub improvements_identified: Vec<Improvement>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ChangeRecord {
    /// A record pending id assignment by the writer.
    pub fn new(change_type: ChangeType, trigger_reason: impl Into<String>) -> Self {
        Self {
            change_id: String::new(),
            cycle_id: CycleId::new().0,
            change_type,
            timestamp: chrono::Utc::now().to_rfc3339(),
            trigger_reason: trigger_reason.into(),
            quality_score_before: None,
            components_executed: Vec::new(),
            improvements_identified: Vec::new(),
            success: true,
            error: None,
            metadata: Map::new(),
        }
    }
}

/// Aggregate view over the full history.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditSummary {
    pub total: usize,
    pub optimization_cycles: usize,
    pub failed_optimizations: usize,
    pub rollbacks: usize,
    pub success_rate: f64,
    pub last_change_at: Option<String>,
}

/// Outcome of a rollback request.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackResult {
    pub success: bool,
    pub target_cycle_id: Option<String>,
    pub configurations_rolled_back: usize,
    pub rollback_details: Vec<Improvement>,
    pub change_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Stable JSON encoding of the history: serializing through `Value` sorts
/// every object key, so equal histories produce identical bytes.
pub fn to_canonical_json(records: &[ChangeRecord]) -> Result<String> {
    let value = serde_json::to_value(records)?;
    Ok(serde_json::to_string_pretty(&value)?)
}

/// Durable mirror of the change history.
#[common::async_trait]
pub trait AuditStore: Send + Sync {
    async fn load(&self) -> Result<Vec<ChangeRecord>>;
    async fn save(&self, records: &[ChangeRecord]) -> Result<()>;
}

/// File-backed store holding the full history as one canonical JSON array.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[common::async_trait]
impl AuditStore for FileStore {
    async fn load(&self) -> Result<Vec<ChangeRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    async fn save(&self, records: &[ChangeRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = to_canonical_json(records)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

/// SQLite-backed key-value store mirroring the history under a single key.
pub struct KvStore {
    pool: sqlx::SqlitePool,
}

impl KvStore {
    /// Connect to the SQLite database at `url` and ensure the kv table.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            // A single connection keeps in-memory databases coherent and is
            // plenty for a single-writer mirror.
            .max_connections(1)
            .connect(url)
            .await
            .map_err(kv_error)?;
        sqlx::query("CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
            .execute(&pool)
            .await
            .map_err(kv_error)?;
        Ok(Self { pool })
    }
}

fn kv_error(e: sqlx::Error) -> Error {
    Error::Internal(format!("audit KV store: {}", e))
}

#[common::async_trait]
impl AuditStore for KvStore {
    async fn load(&self) -> Result<Vec<ChangeRecord>> {
        let row: Option<String> = sqlx::query_scalar("SELECT value FROM kv WHERE key = ?")
            .bind(engine_config::AUDIT_KV_KEY)
            .fetch_optional(&self.pool)
            .await
            .map_err(kv_error)?;
        match row {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save(&self, records: &[ChangeRecord]) -> Result<()> {
        let json = to_canonical_json(records)?;
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(engine_config::AUDIT_KV_KEY)
        .bind(json)
        .execute(&self.pool)
        .await
        .map_err(kv_error)?;
        Ok(())
    }
}

enum AuditCommand {
    Append {
        record: ChangeRecord,
        ack: oneshot::Sender<Result<ChangeRecord>>,
    },
    Fetch {
        cycle_id: String,
        ack: oneshot::Sender<Option<ChangeRecord>>,
    },
    LastSuccessful {
        ack: oneshot::Sender<Option<ChangeRecord>>,
    },
    Summary {
        ack: oneshot::Sender<AuditSummary>,
    },
    Rollback {
        target_cycle_id: Option<String>,
        ack: oneshot::Sender<Result<RollbackResult>>,
    },
    Clear {
        ack: oneshot::Sender<Result<usize>>,
    },
}

/// Handle to the audit log. Cheap to clone; all clones talk to the same
/// writer task.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::Sender<AuditCommand>,
    window: Arc<RwLock<VecDeque<ChangeRecord>>>,
    degraded: Arc<AtomicBool>,
}

impl AuditLog {
    /// Load history from the store, prime the in-memory window with the
    /// most recent `mem_size` entries, and start the writer task.
    pub async fn open(store: Box<dyn AuditStore>, mem_size: usize) -> Result<Self> {
        let history = store.load().await?;
        info!("audit log loaded with {} records", history.len());

        let mut window = VecDeque::with_capacity(mem_size);
        for record in history.iter().skip(history.len().saturating_sub(mem_size)) {
            window.push_back(record.clone());
        }
        let window = Arc::new(RwLock::new(window));
        let degraded = Arc::new(AtomicBool::new(false));

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let writer = Writer {
            seq: history.len() as u64,
            store,
            history,
            window: window.clone(),
            degraded: degraded.clone(),
            mem_size,
        };
        tokio::spawn(writer.run(rx));

        Ok(Self {
            tx,
            window,
            degraded,
        })
    }

    /// Whether the log is in read-only degraded mode.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Append a record. The writer assigns the `change_id` and returns the
    /// completed record.
    pub async fn append(&self, record: ChangeRecord) -> Result<ChangeRecord> {
        if self.is_degraded() {
            return Err(Error::Degraded("audit log is read-only".to_string()));
        }
        let (ack, response) = oneshot::channel();
        self.tx
            .send(AuditCommand::Append { record, ack })
            .await
            .map_err(|_| Error::Internal("audit writer stopped".to_string()))?;
        response
            .await
            .map_err(|_| Error::Internal("audit writer dropped request".to_string()))?
    }

    /// The most recent records, newest first, bounded by the in-memory
    /// window size.
    pub async fn recent(&self, limit: usize) -> Vec<ChangeRecord> {
        let window = self.window.read().await;
        window.iter().rev().take(limit).cloned().collect()
    }

    /// Full record lookup by cycle id (window first, then durable store).
    pub async fn get_by_cycle_id(&self, cycle_id: &str) -> Option<ChangeRecord> {
        {
            let window = self.window.read().await;
            if let Some(record) = window.iter().rev().find(|r| r.cycle_id == cycle_id) {
                return Some(record.clone());
            }
        }
        let (ack, response) = oneshot::channel();
        if self
            .tx
            .send(AuditCommand::Fetch {
                cycle_id: cycle_id.to_string(),
                ack,
            })
            .await
            .is_err()
        {
            return None;
        }
        response.await.ok().flatten()
    }

    /// The most recent committed cycle with identified improvements.
    pub async fn last_successful_state(&self) -> Option<ChangeRecord> {
        let (ack, response) = oneshot::channel();
        self.tx.send(AuditCommand::LastSuccessful { ack }).await.ok()?;
        response.await.ok().flatten()
    }

    /// Aggregate view over the full history.
    pub async fn summary(&self) -> AuditSummary {
        let (ack, response) = oneshot::channel();
        if self.tx.send(AuditCommand::Summary { ack }).await.is_err() {
            return AuditSummary::default();
        }
        response.await.unwrap_or_default()
    }

    /// Plan and record a rollback. Never deletes prior records; the plan is
    /// appended as a new `rollback_execution` record.
    pub async fn rollback(&self, target_cycle_id: Option<String>) -> Result<RollbackResult> {
        if self.is_degraded() {
            return Err(Error::Degraded("audit log is read-only".to_string()));
        }
        let (ack, response) = oneshot::channel();
        self.tx
            .send(AuditCommand::Rollback {
                target_cycle_id,
                ack,
            })
            .await
            .map_err(|_| Error::Internal("audit writer stopped".to_string()))?;
        response
            .await
            .map_err(|_| Error::Internal("audit writer dropped request".to_string()))?
    }

    /// Administrative history wipe; the wipe itself is recorded.
    pub async fn clear_history(&self) -> Result<usize> {
        if self.is_degraded() {
            return Err(Error::Degraded("audit log is read-only".to_string()));
        }
        let (ack, response) = oneshot::channel();
        self.tx
            .send(AuditCommand::Clear { ack })
            .await
            .map_err(|_| Error::Internal("audit writer stopped".to_string()))?;
        response
            .await
            .map_err(|_| Error::Internal("audit writer dropped request".to_string()))?
    }
}

struct Writer {
    store: Box<dyn AuditStore>,
    history: Vec<ChangeRecord>,
    seq: u64,
    window: Arc<RwLock<VecDeque<ChangeRecord>>>,
    degraded: Arc<AtomicBool>,
    mem_size: usize,
}

impl Writer {
    async fn run(mut self, mut rx: mpsc::Receiver<AuditCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                AuditCommand::Append { record, ack } => {
                    let _ = ack.send(self.append(record).await);
                }
                AuditCommand::Fetch { cycle_id, ack } => {
                    let record = self
                        .history
                        .iter()
                        .rev()
                        .find(|r| r.cycle_id == cycle_id)
                        .cloned();
                    let _ = ack.send(record);
                }
                AuditCommand::LastSuccessful { ack } => {
                    let _ = ack.send(self.last_successful().cloned());
                }
                AuditCommand::Summary { ack } => {
                    let _ = ack.send(self.summary());
                }
                AuditCommand::Rollback {
                    target_cycle_id,
                    ack,
                } => {
                    let _ = ack.send(self.rollback(target_cycle_id).await);
                }
                AuditCommand::Clear { ack } => {
                    let _ = ack.send(self.clear().await);
                }
            }
        }
        debug!("audit writer stopped");
    }

    async fn append(&mut self, mut record: ChangeRecord) -> Result<ChangeRecord> {
        if self.degraded.load(Ordering::Relaxed) {
            return Err(Error::Degraded("audit log is read-only".to_string()));
        }

        record.change_id = format!("change_{}_{}", chrono::Utc::now().timestamp(), self.seq);
        self.seq += 1;
        self.history.push(record.clone());

        if let Err(e) = self.persist().await {
            // Undo the in-memory append so memory and disk stay coherent,
            // then flip read-only.
            self.history.pop();
            self.degraded.store(true, Ordering::Relaxed);
            error!("audit persistence failed, entering read-only degraded mode: {}", e);
            return Err(Error::Degraded(format!("audit persistence failed: {}", e)));
        }

        let mut window = self.window.write().await;
        if window.len() == self.mem_size {
            window.pop_front();
        }
        window.push_back(record.clone());
        drop(window);

        debug!(
            "appended {} ({:?}, success={})",
            record.change_id, record.change_type, record.success
        );
        Ok(record)
    }

    async fn persist(&self) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..PERSIST_ATTEMPTS {
            match self.store.save(&self.history).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("audit store save attempt {} failed: {}", attempt + 1, e);
                    last_err = Some(e);
                    tokio::time::sleep(PERSIST_RETRY_DELAY).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Internal("audit save failed".to_string())))
    }

    fn last_successful(&self) -> Option<&ChangeRecord> {
        self.history.iter().rev().find(|record| {
            record.change_type == ChangeType::OptimizationCycle
                && record.success
                && !record.improvements_identified.is_empty()
        })
    }

    /// Cycles already targeted by a rollback are not rolled back twice.
    fn already_rolled_back(&self, cycle_id: &str) -> bool {
        self.history.iter().any(|record| {
            record.change_type == ChangeType::RollbackExecution
                && record
                    .metadata
                    .get("target_cycle_id")
                    .and_then(Value::as_str)
                    == Some(cycle_id)
        })
    }

    fn summary(&self) -> AuditSummary {
        let total = self.history.len();
        let optimization_cycles = self
            .history
            .iter()
            .filter(|r| r.change_type == ChangeType::OptimizationCycle)
            .count();
        let failed_optimizations = self
            .history
            .iter()
            .filter(|r| r.change_type == ChangeType::OptimizationFailure)
            .count();
        let rollbacks = self
            .history
            .iter()
            .filter(|r| r.change_type == ChangeType::RollbackExecution)
            .count();
        let successes = self.history.iter().filter(|r| r.success).count();

        AuditSummary {
            total,
            optimization_cycles,
            failed_optimizations,
            rollbacks,
            success_rate: if total > 0 {
                successes as f64 / total as f64
            } else {
                1.0
            },
            last_change_at: self.history.last().map(|r| r.timestamp.clone()),
        }
    }

    async fn rollback(&mut self, target_cycle_id: Option<String>) -> Result<RollbackResult> {
        // Resolve the full target record; a summary is never enough to
        // compute the inverse set.
        let target = match &target_cycle_id {
            Some(cycle_id) => self
                .history
                .iter()
                .rev()
                .find(|r| r.cycle_id == *cycle_id)
                .cloned(),
            None => self
                .history
                .iter()
                .rev()
                .find(|record| {
                    record.change_type == ChangeType::OptimizationCycle
                        && record.success
                        && !record.improvements_identified.is_empty()
                        && !self.already_rolled_back(&record.cycle_id)
                })
                .cloned(),
        };

        let Some(target) = target else {
            if let Some(cycle_id) = &target_cycle_id {
                warn!("rollback attempted for unknown cycle {}", cycle_id);
                return Ok(RollbackResult {
                    success: false,
                    target_cycle_id: target_cycle_id.clone(),
                    configurations_rolled_back: 0,
                    rollback_details: Vec::new(),
                    change_id: None,
                    error: Some("target_details_unavailable".to_string()),
                });
            }
            // No eligible cycle left to invert: record the no-op rollback.
            let mut record =
                ChangeRecord::new(ChangeType::RollbackExecution, "rollback requested");
            record.success = false;
            record.error = Some("no_configurations_to_rollback".to_string());
            record
                .metadata
                .insert("configurations_rolled_back".to_string(), json!(0));
            let record = self.append(record).await?;
            return Ok(RollbackResult {
                success: false,
                target_cycle_id: None,
                configurations_rolled_back: 0,
                rollback_details: Vec::new(),
                change_id: Some(record.change_id),
                error: Some("no_configurations_to_rollback".to_string()),
            });
        };

        let details: Vec<Improvement> = if self.already_rolled_back(&target.cycle_id) {
            Vec::new()
        } else {
            target
                .improvements_identified
                .iter()
                .filter(|improvement| improvement.is_invertible())
                .map(|improvement| improvement.invert(&target.cycle_id))
                .collect()
        };
        let applied = details.len();

        let mut record = ChangeRecord::new(
            ChangeType::RollbackExecution,
            format!("Rollback from cycle {}", target.cycle_id),
        );
        record.success = applied > 0;
        record.improvements_identified = details.clone();
        record
            .metadata
            .insert("target_cycle_id".to_string(), json!(target.cycle_id));
        record
            .metadata
            .insert("configurations_rolled_back".to_string(), json!(applied));
        if applied == 0 {
            record.error = Some("no_configurations_to_rollback".to_string());
        }

        let record = self.append(record).await?;
        info!(
            "rollback of cycle {} recorded as {} ({} configurations)",
            target.cycle_id, record.change_id, applied
        );

        Ok(RollbackResult {
            success: applied > 0,
            target_cycle_id: Some(target.cycle_id),
            configurations_rolled_back: applied,
            rollback_details: details,
            change_id: Some(record.change_id),
            error: None,
        })
    }

    async fn clear(&mut self) -> Result<usize> {
        let cleared = self.history.len();
        self.history.clear();
        self.window.write().await.clear();

        let mut record = ChangeRecord::new(ChangeType::ManualTrigger, "history_cleared");
        record
            .metadata
            .insert("records_cleared".to_string(), json!(cleared));
        self.append(record).await?;
        Ok(cleared)
    }
}
