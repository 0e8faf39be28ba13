//! The shared data model: observed cluster state, the declarative VIP
//! mapping, and the state derived from them on each reconciliation pass.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

/// Reference to a Service by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceRef {
    /// Namespace the Service lives in.
    pub namespace: String,
    /// Name of the Service.
    pub name: String,
}

impl ServiceRef {
    /// Creates a new service reference.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The `namespace/name` key form used in caches and work queue items.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// L4 protocol carried by a `ServicePort` or `EndpointPort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
        }
    }
}

/// A Service port's target, either a numeric container port or a named one
/// resolved against matching `EndpointPort`s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetPort {
    /// A literal container port number.
    Number(u16),
    /// A port name resolved against `EndpointPort::name`.
    Name(String),
}

/// One port exposed by an observed Service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    /// The Service-facing port.
    pub port: u16,
    /// Protocol for this port.
    pub protocol: Protocol,
    /// The backend container port this maps to.
    pub target_port: TargetPort,
}

/// An observed Service. Immutable for the controller; refreshed wholesale on
/// every informer change event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Namespace/name of the Service.
    pub service_ref: ServiceRef,
    /// The Service's cluster IP, if any.
    pub cluster_ip: Option<IpAddr>,
    /// Ports this Service exposes.
    pub ports: Vec<ServicePort>,
    /// Annotations carried on the Service, consulted for the legacy
    /// `k8s.io/public-vip` mapping fallback.
    pub annotations: std::collections::BTreeMap<String, String>,
}

/// One port within an `EndpointSubset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPort {
    /// Optional name, matched against a Service's named `TargetPort`.
    pub name: Option<String>,
    /// The backend port number.
    pub port: u16,
    /// Protocol for this port.
    pub protocol: Protocol,
}

/// One subset of ready addresses within an `Endpoints` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSubset {
    /// Ready pod addresses in this subset.
    pub addresses: Vec<IpAddr>,
    /// Ports offered by every address in this subset.
    pub ports: Vec<EndpointPort>,
}

/// The cluster's projection of which pod addresses currently back a Service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// Namespace/name of the backing Service.
    pub service_ref: ServiceRef,
    /// Subsets of ready addresses.
    pub subsets: Vec<EndpointSubset>,
}

impl Endpoints {
    /// True if every subset is empty (no ready addresses at all).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subsets.iter().all(|s| s.addresses.is_empty())
    }
}

/// The L4 forwarding method recorded against a VIP mapping entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ForwardMethod {
    /// IPVS masquerading (NAT).
    Nat,
    /// IPVS direct routing, selected by the `PROXY` mapping keyword.
    Proxy,
}

impl Default for ForwardMethod {
    fn default() -> Self {
        Self::Nat
    }
}

impl fmt::Display for ForwardMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nat => write!(f, "NAT"),
            Self::Proxy => write!(f, "PROXY"),
        }
    }
}

/// Where a `VipMapping` entry was sourced from. Purely informational: the
/// ConfigMap always wins over an annotation for the same external IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingSource {
    /// Declared in the VIP-mapping ConfigMap (canonical).
    ConfigMap,
    /// Declared via the legacy `k8s.io/public-vip` Service annotation.
    Annotation,
}

/// One externalIP -> Service mapping entry, as declared in the VIP-mapping
/// ConfigMap (or, as a fallback, a Service annotation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VipMapping {
    /// The externally-routable VIP this entry maps to.
    pub external_ip: Ipv4Addr,
    /// The Service this VIP forwards to.
    pub service_ref: ServiceRef,
    /// NAT or PROXY.
    pub forward_method: ForwardMethod,
    /// Where this mapping entry came from.
    pub source: MappingSource,
}

/// A single reachable pod address for one `ServicePort`, after resolving a
/// named `target_port` against the Endpoints subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedBackend {
    /// Backend pod address.
    pub ip: IpAddr,
    /// Backend port.
    pub port: u16,
}

/// One VIP/port/protocol forwarding unit, the renderer's input item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualService {
    /// The VIP this unit forwards traffic for.
    pub external_ip: Ipv4Addr,
    /// The VIP-facing port.
    pub port: u16,
    /// Protocol.
    pub protocol: Protocol,
    /// NAT or PROXY, recorded verbatim from the owning `VipMapping`.
    pub forward_method: ForwardMethod,
    /// Live backend addresses, sorted by (ip, port).
    pub backends: Vec<ResolvedBackend>,
}

/// Sorts backends by (ip, port) ascending.
pub fn sort_backends(backends: &mut [ResolvedBackend]) {
    backends.sort_by(|a, b| (a.ip, a.port).cmp(&(b.ip, b.port)));
}

/// Sorts virtual services by (externalIP, port) ascending.
pub fn sort_virtual_services(services: &mut [VirtualService]) {
    services.sort_by(|a, b| (a.external_ip, a.port).cmp(&(b.external_ip, b.port)));
}

/// This node's routable IP, interface name, and netmask, computed once at
/// startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// This node's cluster-routable IP.
    pub node_ip: IpAddr,
    /// The local interface that IP is bound to.
    pub interface_name: String,
    /// CIDR prefix length of that interface's address.
    pub netmask_bits: u8,
}

/// The fully-resolved VRRP instance + virtual server set handed to the
/// renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrrpConfig {
    /// Local interface the VRRP instance binds to.
    pub interface_name: String,
    /// This node's own routable IP (used as `unicast_src_ip`).
    pub node_ip: IpAddr,
    /// This node's VRRP priority (`100 + position` in the sorted peer set).
    pub priority: u8,
    /// Sibling peer IPs (this node excluded), sorted.
    pub peers: Vec<IpAddr>,
    /// Whether to emit unicast peers instead of relying on multicast.
    pub unicast: bool,
    /// Deterministically-derived (or operator-overridden) VRRP auth password.
    pub auth_password: String,
    /// Sorted list of VIPs this instance owns.
    pub vips: Vec<Ipv4Addr>,
    /// Virtual server blocks, sorted by (externalIP, port).
    pub virtual_servers: Vec<VirtualService>,
}
