//! Metrics and observability for org-replicator.
//!
//! Counters live in atomics so a snapshot can be taken at any point of a run,
//! and are mirrored to the `metrics` facade for whatever recorder the host
//! process installs.

use std::sync::atomic::{AtomicU64, Ordering};

use std::time::Instant;

/// Metrics collector for replication runs.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Remote describe calls
    pub describes: AtomicU64,
    /// Remote query calls
    pub queries: AtomicU64,
    /// Remote upsert/insert calls
    pub upserts: AtomicU64,
    /// Retried remote calls
    pub retries: AtomicU64,
    /// Durable cache hits
    pub cache_hits: AtomicU64,
    /// Durable cache misses
    pub cache_misses: AtomicU64,
    /// Source records read
    pub records_read: AtomicU64,
    /// Records written to the destination
    pub records_upserted: AtomicU64,
    /// Records skipped as already replicated
    pub records_skipped: AtomicU64,
    /// Records rejected or dropped
    pub records_failed: AtomicU64,
    /// Reference fields omitted as unresolved
    pub references_omitted: AtomicU64,
    /// Object types replicated without error
    pub objects_succeeded: AtomicU64,
    /// Object types that ended in error
    pub objects_failed: AtomicU64,
}

/// Remote call kinds counted by [`Metrics::record_call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// describe / describe_global
    Describe,
    /// query / count
    Query,
    /// upsert / insert
    Upsert,
}

impl Metrics {
    /// Create new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a remote call.
    pub fn record_call(&self, kind: CallKind) {
        let (counter, name) = match kind {
            CallKind::Describe => (&self.describes, "org_replicator_describes_total"),
            CallKind::Query => (&self.queries, "org_replicator_queries_total"),
            CallKind::Upsert => (&self.upserts, "org_replicator_upserts_total"),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!(name).increment(1);
    }

    /// Record a retry.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!("org_replicator_retries_total").increment(1);
    }

    /// Record a cache lookup.
    pub fn record_cache(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            ::metrics::counter!("org_replicator_cache_hits_total").increment(1);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
            ::metrics::counter!("org_replicator_cache_misses_total").increment(1);
        }
    }

    /// Record source records read.
    pub fn record_read(&self, n: u64) {
        self.records_read.fetch_add(n, Ordering::Relaxed);
    }

    /// Record per-record write outcomes.
    pub fn record_writes(&self, upserted: u64, skipped: u64, failed: u64) {
        self.records_upserted.fetch_add(upserted, Ordering::Relaxed);
        self.records_skipped.fetch_add(skipped, Ordering::Relaxed);
        self.records_failed.fetch_add(failed, Ordering::Relaxed);
        ::metrics::counter!("org_replicator_records_upserted_total").increment(upserted);
        ::metrics::counter!("org_replicator_records_failed_total").increment(failed);
    }

    /// Record omitted reference fields.
    pub fn record_omitted(&self, n: u64) {
        self.references_omitted.fetch_add(n, Ordering::Relaxed);
    }

    /// Record an object type finishing.
    pub fn record_object(&self, success: bool) {
        if success {
            self.objects_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.objects_failed.fetch_add(1, Ordering::Relaxed);
            ::metrics::counter!("org_replicator_objects_failed_total").increment(1);
        }
    }

    /// Get snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            describes: self.describes.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            upserts: self.upserts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            records_read: self.records_read.load(Ordering::Relaxed),
            records_upserted: self.records_upserted.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            references_omitted: self.references_omitted.load(Ordering::Relaxed),
            objects_succeeded: self.objects_succeeded.load(Ordering::Relaxed),
            objects_failed: self.objects_failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    /// Remote describe calls
    pub describes: u64,
    /// Remote query calls
    pub queries: u64,
    /// Remote upsert/insert calls
    pub upserts: u64,
    /// Retried remote calls
    pub retries: u64,
    /// Durable cache hits
    pub cache_hits: u64,
    /// Durable cache misses
    pub cache_misses: u64,
    /// Source records read
    pub records_read: u64,
    /// Records written to the destination
    pub records_upserted: u64,
    /// Records skipped as already replicated
    pub records_skipped: u64,
    /// Records rejected or dropped
    pub records_failed: u64,
    /// Reference fields omitted as unresolved
    pub references_omitted: u64,
    /// Object types replicated without error
    pub objects_succeeded: u64,
    /// Object types that ended in error
    pub objects_failed: u64,
}

impl MetricsSnapshot {
    /// Fraction of cache lookups that hit.
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// Remote calls of every kind.
    pub fn remote_calls(&self) -> u64 {
        self.describes + self.queries + self.upserts
    }
}

/// Timer for measuring operation duration.
pub struct Timer {
    start: Instant,
    label: String,
}

impl Timer {
    /// Start a new timer.
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            label: label.into(),
        }
    }

    /// Get elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop timer and log duration.
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();
        tracing::debug!("{} completed in {}ms", self.label, elapsed);
        elapsed
    }
}
