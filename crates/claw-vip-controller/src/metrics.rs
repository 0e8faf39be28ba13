//! Minimal in-process counters exposed for observability. Deliberately not
//! a dependency on the `claw-metrics` time-series store elsewhere in the
//! workspace — that crate's retention/query machinery is built for GPU
//! telemetry at a scale this controller doesn't need; a handful of atomics
//! is enough to answer "is it healthy".

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters tracked across the controller's lifetime.
#[derive(Default)]
pub struct Metrics {
    reloads_performed: AtomicU64,
    reloads_skipped: AtomicU64,
    reconcile_errors: AtomicU64,
    resolver_warnings: AtomicU64,
}

/// A point-in-time read of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Reloads that actually wrote a new config and signaled the daemon.
    pub reloads_performed: u64,
    /// Reconcile passes whose content hash matched the prior pass.
    pub reloads_skipped: u64,
    /// Reconcile passes that ended in an error and were requeued.
    pub reconcile_errors: u64,
    /// Total resolver warnings emitted (malformed entries, collisions,
    /// missing services/endpoints) across the controller's lifetime.
    pub resolver_warnings: u64,
}

impl Metrics {
    /// Creates a zeroed counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a reload that wrote and signaled.
    pub fn record_reload_performed(&self) {
        self.reloads_performed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a reload pass that found no content change.
    pub fn record_reload_skipped(&self) {
        self.reloads_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a reconcile pass that ended in an error.
    pub fn record_reconcile_error(&self) {
        self.reconcile_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records `count` resolver warnings from a single resolve pass.
    pub fn record_resolver_warnings(&self, count: u64) {
        self.resolver_warnings.fetch_add(count, Ordering::Relaxed);
    }

    /// Reads every counter's current value.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            reloads_performed: self.reloads_performed.load(Ordering::Relaxed),
            reloads_skipped: self.reloads_skipped.load(Ordering::Relaxed),
            reconcile_errors: self.reconcile_errors.load(Ordering::Relaxed),
            resolver_warnings: self.resolver_warnings.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let metrics = Metrics::new();
        metrics.record_reload_performed();
        metrics.record_reload_performed();
        metrics.record_reload_skipped();
        metrics.record_reconcile_error();
        metrics.record_resolver_warnings(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.reloads_performed, 2);
        assert_eq!(snapshot.reloads_skipped, 1);
        assert_eq!(snapshot.reconcile_errors, 1);
        assert_eq!(snapshot.resolver_warnings, 3);
    }
}
