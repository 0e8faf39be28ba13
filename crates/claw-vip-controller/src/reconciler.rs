//! C6 — Reconciler: the work queue and the single worker loop that drives
//! C3 (resolve) -> C4 (render) -> C5 (reload) to fixpoint on every
//! informer-reported change.
//!
//! The per-key backoff table mirrors
//! `clawnode::gateway::reconnect::ReconnectConfig`'s exponential-with-cap
//! shape, applied to requeue delay instead of reconnect delay.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::error::ReconcileError;
use crate::informer::{ClusterApi, Informers};
use crate::metrics::Metrics;
use crate::reload::{Outcome, ReloadCoordinator};
use crate::render;
use crate::resolver;
use crate::types::VrrpConfig;

/// Backoff shape applied to a key that fails reconciliation repeatedly.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling on the retry delay.
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Computes the delay for the given 1-indexed failure count.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = self.multiplier.powi(failures.saturating_sub(1) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }
}

/// Deduplicating work queue: a key already pending is not enqueued twice,
/// mirroring a standard controller-runtime work queue.
pub struct WorkQueue {
    tx: mpsc::Sender<String>,
    pending: Arc<Mutex<HashSet<String>>>,
}

impl WorkQueue {
    /// Creates a queue paired with its receiving half.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, pending: Arc::new(Mutex::new(HashSet::new())) }, rx)
    }

    /// Enqueues `key` unless it is already pending.
    pub async fn add(&self, key: String) {
        let newly_inserted = self.pending.lock().insert(key.clone());
        if newly_inserted && self.tx.send(key).await.is_err() {
            warn!("work queue receiver dropped, enqueue had no effect");
        }
    }

    fn forget(&self, key: &str) {
        self.pending.lock().remove(key);
    }
}

/// Tracks consecutive-failure counts per key, purely in memory.
#[derive(Default)]
struct BackoffTracker {
    failures: HashMap<String, u32>,
}

impl BackoffTracker {
    fn record_failure(&mut self, key: &str) -> u32 {
        let count = self.failures.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn forget(&mut self, key: &str) {
        self.failures.remove(key);
    }
}

/// Everything the worker loop needs to turn a changed key into a
/// fully-applied keepalived config.
pub struct ReconcilerContext<C: ClusterApi> {
    /// Informer caches.
    pub informers: Arc<Informers<C>>,
    /// Static VRRP topology facts computed once at startup.
    pub node_topology: crate::types::NodeInfo,
    /// This node's VRRP priority.
    pub priority: u8,
    /// Sibling peer IPs.
    pub peers: Vec<std::net::IpAddr>,
    /// Whether to render unicast peers.
    pub unicast: bool,
    /// VRRP group auth password.
    pub auth_password: String,
    /// Namespace/name of the VIP-mapping ConfigMap.
    pub config_map_ref: (String, String),
    /// Where reconciled config gets written and who gets signaled.
    pub reload: Arc<ReloadCoordinator>,
    /// Lifetime counters for observability.
    pub metrics: Arc<Metrics>,
}

/// Runs the reconciler worker loop until `work_rx` closes. Every received
/// key triggers a full resolve-render-reload pass over the *entire* mapping
/// (the key only indicates that *something* changed, per C1's contract);
/// on failure the key is requeued after a backoff delay instead of being
/// retried inline, so one slow failure cannot stall the queue.
pub async fn run<C: ClusterApi>(
    context: Arc<ReconcilerContext<C>>,
    queue: Arc<WorkQueue>,
    mut work_rx: mpsc::Receiver<String>,
    backoff: BackoffConfig,
) {
    let mut tracker = BackoffTracker::default();

    while let Some(key) = work_rx.recv().await {
        queue.forget(&key);

        match reconcile_once(&context).await {
            Ok(Outcome::Reloaded) => {
                info!(%key, "reconciled: config reloaded");
                context.metrics.record_reload_performed();
                tracker.forget(&key);
            }
            Ok(Outcome::Skipped) => {
                context.metrics.record_reload_skipped();
                tracker.forget(&key);
            }
            Err(ReconcileError::DeferredSync) => {
                info!(%key, "informers not synced yet, deferring");
                let queue = Arc::clone(&queue);
                let key_for_retry = key.clone();
                tokio::spawn(async move {
                    sleep(Duration::from_millis(200)).await;
                    queue.add(key_for_retry).await;
                });
            }
            Err(err) => {
                context.metrics.record_reconcile_error();
                let failures = tracker.record_failure(&key);
                let delay = backoff.delay_for(failures);
                error!(%key, failures, ?delay, error = %err, "reconcile failed, requeueing with backoff");
                let queue = Arc::clone(&queue);
                let key_for_retry = key.clone();
                tokio::spawn(async move {
                    sleep(delay).await;
                    queue.add(key_for_retry).await;
                });
            }
        }
    }
}

async fn reconcile_once<C: ClusterApi>(
    context: &ReconcilerContext<C>,
) -> Result<Outcome, ReconcileError> {
    if !context.informers.is_synced() {
        return Err(ReconcileError::DeferredSync);
    }

    let config_map = context
        .informers
        .read_vip_mapping_config_map(&context.config_map_ref.0, &context.config_map_ref.1)
        .await?;

    let services = context.informers.all_services();
    let (mapping, parse_warnings) = resolver::parse_mapping(&config_map, &services);
    let (virtual_services, resolve_warnings) = resolver::resolve(&context.informers, &mapping).await;
    context
        .metrics
        .record_resolver_warnings((parse_warnings.len() + resolve_warnings.len()) as u64);
    let vips = resolver::all_vips(&mapping, &virtual_services);

    let vrrp_config = VrrpConfig {
        interface_name: context.node_topology.interface_name.clone(),
        node_ip: context.node_topology.node_ip,
        priority: context.priority,
        peers: context.peers.clone(),
        unicast: context.unicast,
        auth_password: context.auth_password.clone(),
        vips,
        virtual_servers: virtual_services,
    };

    let rendered = render::render(&vrrp_config)?;
    Ok(context.reload.apply(&rendered)?)
}
