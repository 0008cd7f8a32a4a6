//! Trace ingestion: periodic backend polling onto a bounded queue.
//!
//! The queue applies backpressure to the ingestor when full: a push blocks
//! for a bounded interval waiting for the consumer, then drops the oldest
//! queued trace so the newest data survives sustained overload. Drops are
//! counted and exposed.

use chrono::{Duration as ChronoDuration, Utc};
use engine_config::PipelineConfig;
use observability::{Client, RawRun, RunFilters};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

/// Bounded trace queue with drop-oldest overflow behavior.
pub struct TraceQueue {
    inner: parking_lot::Mutex<VecDeque<RawRun>>,
    capacity: usize,
    backpressure: Duration,
    /// Signalled when an item is pushed
    readable: Notify,
    /// Signalled when an item is popped
    writable: Notify,
    dropped: AtomicU64,
}

impl TraceQueue {
    pub fn new(capacity: usize, backpressure: Duration) -> Self {
        Self {
            inner: parking_lot::Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            backpressure,
            readable: Notify::new(),
            writable: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push a trace. Blocks up to the backpressure interval when the queue
    /// is full, then evicts the oldest entry to make room.
    pub async fn push(&self, run: RawRun) {
        if self.try_push_inner(run.clone()) {
            return;
        }

        let deadline = tokio::time::Instant::now() + self.backpressure;
        loop {
            let wait = tokio::time::timeout_at(deadline, self.writable.notified()).await;
            if self.try_push_inner(run.clone()) {
                return;
            }
            if wait.is_err() {
                // Backpressure window elapsed with the queue still full:
                // drop the oldest trace and enqueue the new one.
                let mut queue = self.inner.lock();
                if queue.len() >= self.capacity {
                    queue.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                queue.push_back(run);
                drop(queue);
                self.readable.notify_one();
                return;
            }
        }
    }

    fn try_push_inner(&self, run: RawRun) -> bool {
        let mut queue = self.inner.lock();
        if queue.len() < self.capacity {
            queue.push_back(run);
            drop(queue);
            self.readable.notify_one();
            true
        } else {
            false
        }
    }

    /// Pop one trace, waiting until one is available.
    pub async fn pop(&self) -> RawRun {
        loop {
            let notified = self.readable.notified();
            if let Some(run) = self.try_pop() {
                return run;
            }
            notified.await;
        }
    }

    /// Pop one trace if immediately available.
    pub fn try_pop(&self) -> Option<RawRun> {
        let mut queue = self.inner.lock();
        let run = queue.pop_front();
        drop(queue);
        if run.is_some() {
            self.writable.notify_one();
        }
        run
    }

    /// Drain up to `max` traces without waiting.
    pub fn drain(&self, max: usize) -> Vec<RawRun> {
        let mut drained = Vec::new();
        while drained.len() < max {
            match self.try_pop() {
                Some(run) => drained.push(run),
                None => break,
            }
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total traces dropped to overflow since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Polls the backend for recent traces and feeds the queue.
pub struct TraceIngestor {
    client: Client,
    queue: std::sync::Arc<TraceQueue>,
    config: PipelineConfig,
    session_names: Vec<String>,
    fetch_failures: AtomicU64,
}

impl TraceIngestor {
    pub fn new(
        client: Client,
        queue: std::sync::Arc<TraceQueue>,
        config: PipelineConfig,
        session_names: Vec<String>,
    ) -> Self {
        Self {
            client,
            queue,
            config,
            session_names,
            fetch_failures: AtomicU64::new(0),
        }
    }

    pub fn fetch_failures(&self) -> u64 {
        self.fetch_failures.load(Ordering::Relaxed)
    }

    /// The ingestion loop. Exits cleanly when the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("trace ingestor shutting down");
                        return;
                    }
                }
                _ = interval.tick() => {
                    self.poll_once().await;
                }
            }
        }
    }

    /// One fetch iteration. Fetch errors are logged and counted, never
    /// propagated; a failed poll must not stop ingestion.
    pub async fn poll_once(&self) {
        let end = Utc::now();
        let start = end - ChronoDuration::seconds(self.config.lookback_secs);
        let filters = RunFilters {
            session_names: self.session_names.clone(),
            start_time: Some(start),
            end_time: Some(end),
            limit: Some(self.config.batch_size),
            include_feedback: true,
        };

        match self.client.list_runs(&filters).await {
            Ok(runs) => {
                debug!("fetched {} recent traces", runs.len());
                for run in runs {
                    self.queue.push(run).await;
                }
            }
            Err(e) => {
                self.fetch_failures.fetch_add(1, Ordering::Relaxed);
                warn!("trace fetch failed: {}", e);
            }
        }
    }
}
