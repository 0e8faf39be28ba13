//! # claw-vip-controller
//!
//! Reconciles a declarative externalIP -> Service mapping into a local
//! keepalived + IPVS configuration, so a set of virtual IPs stays owned by
//! exactly one healthy node at a time.
//!
//! This crate provides:
//!
//! - Informers — list+watch caches over Services, Endpoints and the
//!   VIP-mapping ConfigMap, behind a generic `ClusterApi` seam
//! - Node topology — this node's routable IP, VRRP priority and sibling set
//! - VIP resolution — turning the mapping into backend-resolved virtual
//!   services
//! - Configuration rendering — deterministic keepalived.conf generation
//! - Reload coordination — content-hash-gated, rate-limited config apply
//! - A reconciler work queue driving the above to fixpoint
//! - A supervisor owning the keepalived child process

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod informer;
pub mod metrics;
pub mod preflight;
pub mod reconciler;
pub mod reload;
pub mod render;
pub mod resolver;
pub mod source;
pub mod supervisor;
pub mod topology;
pub mod types;

pub use config::{Cli, PodEnv};
pub use informer::{ClusterApi, Informers};
pub use metrics::Metrics;
