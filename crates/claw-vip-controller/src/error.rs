//! Error types for the VIP controller, one enum per component module.

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::types::{Protocol, ServiceRef};

/// Errors surfaced by a `ClusterApi` implementation.
#[derive(Debug, Error)]
pub enum ClusterApiError {
    /// The initial list call failed; fatal at startup.
    #[error("initial list of {resource} failed: {reason}")]
    InitialListFailed {
        /// The resource kind being listed (`Service`, `Endpoints`, ...).
        resource: &'static str,
        /// Underlying failure reason.
        reason: String,
    },
    /// A ConfigMap lookup found no object with that name.
    #[error("config map {namespace}/{name} not found")]
    ConfigMapNotFound {
        /// Namespace searched.
        namespace: String,
        /// Name searched.
        name: String,
    },
}

/// Errors from the informer cache layer.
#[derive(Debug, Error)]
pub enum InformerError {
    /// Propagated startup failure from the cluster API.
    #[error(transparent)]
    InitialListFailed(#[from] ClusterApiError),
}

/// Errors from node topology discovery (C2). All fatal at startup.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// No local interface's address matched any cluster Node IP.
    #[error("no local interface address matches a cluster node IP")]
    NoMatchingInterface,
    /// Local interface enumeration itself failed.
    #[error("failed to enumerate local network interfaces: {0}")]
    InterfaceEnumerationFailed(String),
    /// The operator-supplied `--keepalived-ip` override did not parse.
    #[error("invalid --keepalived-ip override: {0}")]
    InvalidOverride(String),
    /// This node's IP was not present in the peer set used for priority
    /// assignment (should be unreachable: the peer set is built to include
    /// every resolved node IP, including this one).
    #[error("node ip {0} is not a member of its own peer set")]
    NodeNotInPeerSet(std::net::IpAddr),
    /// The peer set is larger than `u8` priority space can represent.
    #[error("peer set of {0} nodes exceeds the representable priority range")]
    PriorityOverflow(usize),
}

/// A non-fatal resolution problem, logged at `warn` and then skipped.
#[derive(Debug, Clone, Error)]
pub enum ResolverWarning {
    /// The mapping referenced a Service that isn't in the cache.
    #[error("service {0} referenced by vip mapping not found")]
    ServiceNotFound(ServiceRef),
    /// The Service has no (or no ready) Endpoints; its virtual service is omitted.
    #[error("service {0} has no ready endpoints")]
    NoReadyEndpoints(ServiceRef),
    /// A ConfigMap mapping line didn't parse as `namespace/name[:METHOD]`.
    #[error("malformed vip mapping entry for {external_ip}: {line:?}")]
    MalformedEntry {
        /// The external IP the malformed line was attached to.
        external_ip: Ipv4Addr,
        /// The raw line that failed to parse.
        line: String,
    },
    /// Two resolved virtual services collided on (ip, port, protocol); the
    /// documented tie-break (lowest `ServiceRef`) was applied and the loser
    /// was dropped.
    #[error(
        "virtual service {external_ip}:{port}/{protocol} claimed by both {kept} and {dropped}; kept {kept}"
    )]
    PortCollision {
        /// The VIP in question.
        external_ip: Ipv4Addr,
        /// The colliding port.
        port: u16,
        /// The colliding protocol.
        protocol: Protocol,
        /// The service reference that was retained.
        kept: ServiceRef,
        /// The service reference that was dropped.
        dropped: ServiceRef,
    },
}

/// Errors from the renderer (C4). Any occurrence is a programming error —
/// the template is embedded and the context is always well-formed — so
/// callers should treat this as fatal.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The embedded template failed to parse, the `VrrpConfig` context
    /// failed to serialize, or a render-time expression failed to evaluate.
    #[error("template render failed: {0}")]
    Template(#[from] tera::Error),
}

/// Errors from the reload coordinator (C5).
#[derive(Debug, Error)]
pub enum ReloadError {
    /// Writing the rendered config to its temp path, or renaming it into
    /// place, failed.
    #[error("failed to write config to {path}: {source}")]
    Write {
        /// Destination path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// No process matching the daemon name could be signaled.
    #[error("no running process named {0} to signal")]
    DaemonNotRunning(String),
    /// Sending the reload signal to a matched process failed.
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        /// The pid the signal was sent to.
        pid: i32,
        /// The raw errno-derived failure.
        #[source]
        source: std::io::Error,
    },
    /// The reload rate limiter had no token available; the caller should
    /// retry this same content, not treat it as applied.
    #[error("reload rate limit exceeded, retry with backoff")]
    RateLimited,
}

/// The reconciler's unified error type; each component's error is wrapped in
/// via `#[from]`.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The informer caches have not completed their initial list yet; the
    /// worker should requeue the key with backoff and try again later.
    #[error("informers not yet synced")]
    DeferredSync,
    /// The VIP-mapping ConfigMap could not be read this pass; retried with
    /// backoff rather than treated as a deferred-sync condition, since the
    /// informers themselves are already synced.
    #[error("vip mapping config map unavailable: {0}")]
    ConfigMapUnavailable(#[from] ClusterApiError),
    /// Propagated renderer failure (fatal; see `RenderError`).
    #[error(transparent)]
    Render(#[from] RenderError),
    /// Propagated reload-coordinator failure (retried with backoff).
    #[error(transparent)]
    Reload(#[from] ReloadError),
}

/// Errors from the startup preflight checks. All fatal.
#[derive(Debug, Error)]
pub enum PreflightError {
    /// A mapping requires IPVS connection tracking but the operator did not
    /// pass `--ipvs-conntrack`.
    #[error(
        "a NAT-forwarded TCP virtual service is configured but --ipvs-conntrack was not set"
    )]
    ConntrackRequired,
    /// A required pod environment variable was not set.
    #[error("required environment variable {0} is not set")]
    MissingEnvVar(&'static str),
}
