//! C1 — Informers: list+watch Services, Endpoints and the VIP-mapping
//! ConfigMap, and maintain an indexed local cache of each.
//!
//! The cluster API itself is out of scope for this crate:
//! `ClusterApi` is the seam a concrete Kubernetes client plugs into.
//! `Informers<C>` is generic over it the same way
//! `claw_autoscaler::AutoscalerManager<M: MetricsProvider>` is generic over
//! its metrics source, rather than reaching for a boxed trait object.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ClusterApiError, InformerError};
use crate::types::{Endpoints, Service, ServiceRef};

/// A Kubernetes ConfigMap, reduced to the fields this crate cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMap {
    /// Namespace the ConfigMap lives in.
    pub namespace: String,
    /// Name of the ConfigMap.
    pub name: String,
    /// Its `data` section.
    pub data: BTreeMap<String, String>,
}

/// A cluster Node, reduced to what topology discovery needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// The node's internal (preferred) or external IP.
    pub ip: std::net::IpAddr,
    /// Labels, consulted against `--node-selector`.
    pub labels: BTreeMap<String, String>,
}

/// One cluster object as carried on a `WatchEvent`.
#[derive(Debug, Clone)]
pub enum ClusterObject {
    /// A Service add/update.
    Service(Service),
    /// An Endpoints add/update.
    Endpoints(Endpoints),
    /// A ConfigMap add/update.
    ConfigMap(ConfigMap),
}

/// The kind of change a `WatchEvent` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// The object was newly observed.
    Added,
    /// The object changed.
    Modified,
    /// The object no longer exists.
    Deleted,
}

/// One change notification from the watch stream. `key` is an opaque
/// identifier (`namespace/name`, or `configmap:namespace/name`) used purely
/// for work-queue dedup; the reconciler never inspects `object`'s identity
/// to decide what to do, only that *something* changed.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// Opaque dedup key for the work queue.
    pub key: String,
    /// Added / Modified / Deleted.
    pub kind: WatchEventKind,
    /// The new object state; `None` for `Deleted`.
    pub object: Option<ClusterObject>,
}

/// The interface this crate needs from a cluster API client. Left
/// unimplemented here on purpose — a concrete Kubernetes client is handed
/// in by the binary that wires this crate up.
pub trait ClusterApi: Send + Sync + 'static {
    /// Lists all Services visible to this controller. Failure here is
    /// fatal at startup.
    fn list_services(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Service>, ClusterApiError>> + Send;

    /// Lists all Endpoints visible to this controller.
    fn list_endpoints(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Endpoints>, ClusterApiError>> + Send;

    /// Lists cluster Nodes, optionally restricted by a label selector
    /// (applied by the implementation, not this trait).
    fn list_nodes(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<NodeRecord>, ClusterApiError>> + Send;

    /// Fetches a single ConfigMap by namespace/name.
    fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<ConfigMap, ClusterApiError>> + Send;

    /// Subscribes to opaque change notifications. The channel closes when
    /// the underlying watch is torn down for good (the informer machinery
    /// handles reconnects internally; this crate never sees a torn-down
    /// watch as anything but "no more events for now").
    fn watch(&self) -> mpsc::Receiver<WatchEvent>;
}

/// Indexed, thread-safe local cache of Services, Endpoints and the VIP
/// mapping ConfigMap, kept current by a background task draining
/// `ClusterApi::watch()`.
pub struct Informers<C: ClusterApi> {
    client: Arc<C>,
    services: Arc<RwLock<HashMap<ServiceRef, Service>>>,
    endpoints: Arc<RwLock<HashMap<ServiceRef, Endpoints>>>,
    config_maps: Arc<RwLock<HashMap<(String, String), ConfigMap>>>,
    synced: Arc<AtomicBool>,
}

impl<C: ClusterApi> Informers<C> {
    /// Performs the initial list (fatal on failure) and spawns the
    /// background task that applies subsequent watch events to the cache,
    /// forwarding each cache-changing event's key to the returned channel.
    ///
    /// # Errors
    ///
    /// Returns `InformerError` if the initial list of any resource kind
    /// fails.
    pub async fn start(client: Arc<C>) -> Result<(Self, mpsc::Receiver<String>), InformerError> {
        let services = client.list_services().await.map_err(|e| {
            InformerError::InitialListFailed(ClusterApiError::InitialListFailed {
                resource: "Service",
                reason: e.to_string(),
            })
        })?;
        let endpoints = client.list_endpoints().await.map_err(|e| {
            InformerError::InitialListFailed(ClusterApiError::InitialListFailed {
                resource: "Endpoints",
                reason: e.to_string(),
            })
        })?;

        let services_cache = Arc::new(RwLock::new(
            services
                .into_iter()
                .map(|s| (s.service_ref.clone(), s))
                .collect::<HashMap<_, _>>(),
        ));
        let endpoints_cache = Arc::new(RwLock::new(
            endpoints
                .into_iter()
                .map(|e| (e.service_ref.clone(), e))
                .collect::<HashMap<_, _>>(),
        ));
        let config_maps_cache = Arc::new(RwLock::new(HashMap::new()));
        let synced = Arc::new(AtomicBool::new(true));

        let (key_tx, key_rx) = mpsc::channel(256);
        let mut watch_rx = client.watch();
        let services_bg = Arc::clone(&services_cache);
        let endpoints_bg = Arc::clone(&endpoints_cache);
        let config_maps_bg = Arc::clone(&config_maps_cache);

        tokio::spawn(async move {
            while let Some(event) = watch_rx.recv().await {
                let key = event.key.clone();
                if Self::apply_event(&services_bg, &endpoints_bg, &config_maps_bg, event) {
                    debug!(key = %key, "informer cache changed");
                    if key_tx.send(key).await.is_err() {
                        break;
                    }
                } else {
                    debug!(key = %key, "informer event was a no-op, suppressing");
                }
            }
            warn!("cluster watch stream closed");
        });

        Ok((
            Self {
                client,
                services: services_cache,
                endpoints: endpoints_cache,
                config_maps: config_maps_cache,
                synced,
            },
            key_rx,
        ))
    }

    /// Applies one watch event to the caches. Returns `true` if the cache
    /// actually changed (a `DeepEqual`-style check before forwarding a
    /// dedup key to the work queue).
    fn apply_event(
        services: &RwLock<HashMap<ServiceRef, Service>>,
        endpoints: &RwLock<HashMap<ServiceRef, Endpoints>>,
        config_maps: &RwLock<HashMap<(String, String), ConfigMap>>,
        event: WatchEvent,
    ) -> bool {
        match (event.kind, event.object) {
            (WatchEventKind::Deleted, _) => {
                let removed_service = services.write().remove(&service_ref_from_key(&event.key));
                let removed_endpoints = endpoints
                    .write()
                    .remove(&service_ref_from_key(&event.key));
                let removed_cm = config_maps.write().remove(&cm_key_from_key(&event.key));
                removed_service.is_some() || removed_endpoints.is_some() || removed_cm.is_some()
            }
            (_, Some(ClusterObject::Service(svc))) => {
                let mut guard = services.write();
                let changed = guard.get(&svc.service_ref) != Some(&svc);
                guard.insert(svc.service_ref.clone(), svc);
                changed
            }
            (_, Some(ClusterObject::Endpoints(ep))) => {
                let mut guard = endpoints.write();
                let changed = guard.get(&ep.service_ref) != Some(&ep);
                guard.insert(ep.service_ref.clone(), ep);
                changed
            }
            (_, Some(ClusterObject::ConfigMap(cm))) => {
                let mut guard = config_maps.write();
                let cache_key = (cm.namespace.clone(), cm.name.clone());
                let changed = guard.get(&cache_key) != Some(&cm);
                guard.insert(cache_key, cm);
                changed
            }
            (_, None) => false,
        }
    }

    /// O(1) lookup of an observed Service.
    #[must_use]
    pub fn lookup_service(&self, service_ref: &ServiceRef) -> Option<Service> {
        self.services.read().get(service_ref).cloned()
    }

    /// O(1) lookup of a Service's Endpoints.
    #[must_use]
    pub fn lookup_endpoints(&self, service_ref: &ServiceRef) -> Option<Endpoints> {
        self.endpoints.read().get(service_ref).cloned()
    }

    /// Whether the initial list has completed. Always `true` after
    /// `start()` returns successfully; kept as a method so the reconciler's
    /// "not synced" check reads naturally even though, with this crate's
    /// synchronous initial-list design, it can never observe `false`.
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Reads the VIP-mapping ConfigMap, fetching it live from the cluster
    /// API the first time and serving the watch-maintained cache
    /// thereafter.
    ///
    /// # Errors
    ///
    /// Returns `ClusterApiError::ConfigMapNotFound` if the configured
    /// ConfigMap does not exist.
    pub async fn read_vip_mapping_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ConfigMap, ClusterApiError> {
        if let Some(cm) = self
            .config_maps
            .read()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
        {
            return Ok(cm);
        }
        let cm = self.client.get_config_map(namespace, name).await?;
        self.config_maps
            .write()
            .insert((cm.namespace.clone(), cm.name.clone()), cm.clone());
        Ok(cm)
    }

    /// All Services currently cached, snapshotted.
    #[must_use]
    pub fn all_services(&self) -> Vec<Service> {
        self.services.read().values().cloned().collect()
    }
}

fn service_ref_from_key(key: &str) -> ServiceRef {
    let (ns, name) = key.split_once('/').unwrap_or(("", key));
    ServiceRef::new(ns, name)
}

fn cm_key_from_key(key: &str) -> (String, String) {
    let stripped = key.strip_prefix("configmap:").unwrap_or(key);
    let (ns, name) = stripped.split_once('/').unwrap_or(("", stripped));
    (ns.to_string(), name.to_string())
}

/// An in-memory `ClusterApi` double for unit and end-to-end tests.
/// Mirrors the shape of
/// `claw_autoscaler::InMemoryMetricsProvider`: a plain, always-compiled
/// fixture rather than a `#[cfg(test)]`-gated mock, so integration tests in
/// `tests/` can use it too.
pub mod testing {
    use super::{
        ClusterApi, ClusterApiError, ConfigMap, Endpoints, NodeRecord, Service, WatchEvent,
    };
    use parking_lot::RwLock;
    use tokio::sync::mpsc;

    /// A `ClusterApi` backed entirely by in-memory `Vec`s, with no watch
    /// stream (the channel returned by `watch()` is immediately closed
    /// unless events are pushed via `push_event`).
    #[derive(Default)]
    pub struct StaticClusterApi {
        services: RwLock<Vec<Service>>,
        endpoints: RwLock<Vec<Endpoints>>,
        nodes: RwLock<Vec<NodeRecord>>,
        config_maps: RwLock<Vec<ConfigMap>>,
        watch_tx: RwLock<Option<mpsc::Sender<WatchEvent>>>,
    }

    impl StaticClusterApi {
        /// Creates an empty fixture.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Seeds the Service list.
        #[must_use]
        pub fn with_services(self, services: Vec<Service>) -> Self {
            *self.services.write() = services;
            self
        }

        /// Seeds the Endpoints list.
        #[must_use]
        pub fn with_endpoints(self, endpoints: Vec<Endpoints>) -> Self {
            *self.endpoints.write() = endpoints;
            self
        }

        /// Seeds the Node list.
        #[must_use]
        pub fn with_nodes(self, nodes: Vec<NodeRecord>) -> Self {
            *self.nodes.write() = nodes;
            self
        }

        /// Seeds the ConfigMap list.
        #[must_use]
        pub fn with_config_maps(self, config_maps: Vec<ConfigMap>) -> Self {
            *self.config_maps.write() = config_maps;
            self
        }

        /// Pushes a synthetic watch event to any active subscriber,
        /// simulating a cluster-side change.
        pub async fn push_event(&self, event: WatchEvent) {
            let sender = self.watch_tx.read().clone();
            if let Some(tx) = sender {
                let _ = tx.send(event).await;
            }
        }
    }

    impl ClusterApi for StaticClusterApi {
        async fn list_services(&self) -> Result<Vec<Service>, ClusterApiError> {
            Ok(self.services.read().clone())
        }

        async fn list_endpoints(&self) -> Result<Vec<Endpoints>, ClusterApiError> {
            Ok(self.endpoints.read().clone())
        }

        async fn list_nodes(&self) -> Result<Vec<NodeRecord>, ClusterApiError> {
            Ok(self.nodes.read().clone())
        }

        async fn get_config_map(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<ConfigMap, ClusterApiError> {
            self.config_maps
                .read()
                .iter()
                .find(|cm| cm.namespace == namespace && cm.name == name)
                .cloned()
                .ok_or_else(|| ClusterApiError::ConfigMapNotFound {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
        }

        fn watch(&self) -> mpsc::Receiver<WatchEvent> {
            let (tx, rx) = mpsc::channel(64);
            *self.watch_tx.write() = Some(tx);
            rx
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StaticClusterApi;
    use super::*;
    use crate::types::{Protocol, ServicePort, TargetPort};
    use std::sync::Arc;

    fn svc(ns: &str, name: &str) -> Service {
        Service {
            service_ref: ServiceRef::new(ns, name),
            cluster_ip: Some("10.10.0.1".parse().unwrap()),
            ports: vec![ServicePort {
                port: 80,
                protocol: Protocol::Tcp,
                target_port: TargetPort::Number(8080),
            }],
            annotations: Default::default(),
        }
    }

    #[tokio::test]
    async fn start_populates_caches_from_initial_list() {
        let api = Arc::new(StaticClusterApi::new().with_services(vec![svc("default", "echo")]));
        let (informers, _rx) = Informers::start(api).await.unwrap();
        assert!(informers.is_synced());
        assert!(informers
            .lookup_service(&ServiceRef::new("default", "echo"))
            .is_some());
        assert!(informers
            .lookup_service(&ServiceRef::new("default", "missing"))
            .is_none());
    }

    #[tokio::test]
    async fn watch_event_updates_cache_and_forwards_key() {
        let api = Arc::new(StaticClusterApi::new());
        let (informers, mut rx) = Informers::start(api.clone()).await.unwrap();

        api.push_event(WatchEvent {
            key: "default/echo".to_string(),
            kind: WatchEventKind::Added,
            object: Some(ClusterObject::Service(svc("default", "echo"))),
        })
        .await;

        let key = rx.recv().await.unwrap();
        assert_eq!(key, "default/echo");
        assert!(informers
            .lookup_service(&ServiceRef::new("default", "echo"))
            .is_some());
    }

    #[tokio::test]
    async fn no_op_update_is_not_forwarded() {
        let api = Arc::new(StaticClusterApi::new().with_services(vec![svc("default", "echo")]));
        let (_informers, mut rx) = Informers::start(api.clone()).await.unwrap();

        api.push_event(WatchEvent {
            key: "default/echo".to_string(),
            kind: WatchEventKind::Modified,
            object: Some(ClusterObject::Service(svc("default", "echo"))),
        })
        .await;

        // Give the background task a chance to run, then confirm nothing
        // was forwarded by sending one more, distinguishable event.
        api.push_event(WatchEvent {
            key: "default/other".to_string(),
            kind: WatchEventKind::Added,
            object: Some(ClusterObject::Service(svc("default", "other"))),
        })
        .await;

        let key = rx.recv().await.unwrap();
        assert_eq!(key, "default/other");
    }
}
