//! CLI surface and the pod environment the controller reads at startup.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::error::PreflightError;

/// claw-vip-controller: reconciles Service/Endpoints state into a local
/// keepalived + IPVS configuration so a set of VIPs stay owned by exactly
/// one healthy node.
#[derive(Parser, Debug, Clone)]
#[command(name = "claw-vip-controller")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Use in-cluster credentials to talk to the cluster API.
    #[arg(long)]
    pub use_kubernetes_cluster_service: bool,

    /// Emit unicast VRRP peers instead of relying on multicast.
    #[arg(long)]
    pub use_unicast: bool,

    /// Override the deterministically-derived VRRP auth password.
    #[arg(long)]
    pub vrrp_password: Option<String>,

    /// Override the detected node IP instead of intersecting local
    /// interfaces with the cluster Node set.
    #[arg(long)]
    pub keepalived_ip: Option<IpAddr>,

    /// Location of the VIP mapping ConfigMap, as `namespace/name`.
    #[arg(long)]
    pub services_configmap: String,

    /// Restrict the VRRP peer set to nodes matching this label selector.
    #[arg(long)]
    pub node_selector: Option<String>,

    /// Path keepalived's rendered configuration is written to.
    #[arg(long, default_value = "/etc/keepalived/keepalived.conf")]
    pub config_path: PathBuf,

    /// Process name matched when signaling the daemon to reload.
    #[arg(long, default_value = "keepalived")]
    pub daemon_name: String,

    /// Acknowledge that IPVS connection tracking is enabled on this node.
    /// Required whenever a NAT-forwarded TCP virtual service is configured.
    #[arg(long)]
    pub ipvs_conntrack: bool,

    /// Path to a JSON cluster-state snapshot (`source::FileClusterApi`),
    /// used when no concrete Kubernetes client is wired in. A deployment
    /// with a real cluster client embeds this crate as a library instead
    /// of running this binary.
    #[arg(long)]
    pub cluster_state_file: Option<PathBuf>,

    /// Path to the keepalived binary the supervisor spawns.
    #[arg(long, default_value = "/usr/sbin/keepalived")]
    pub keepalived_binary: PathBuf,
}

/// The controller's own pod identity, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodEnv {
    /// `POD_NAME`.
    pub pod_name: String,
    /// `POD_NAMESPACE`.
    pub pod_namespace: String,
}

impl PodEnv {
    /// Reads the pod identity from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if either variable is unset.
    pub fn from_env() -> Result<Self, PreflightError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the pod identity via an injected lookup function, so tests
    /// don't have to mutate the real process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if either variable is unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PreflightError> {
        Ok(Self {
            pod_name: lookup("POD_NAME").ok_or(PreflightError::MissingEnvVar("POD_NAME"))?,
            pod_namespace: lookup("POD_NAMESPACE")
                .ok_or(PreflightError::MissingEnvVar("POD_NAMESPACE"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_env_reads_both_vars() {
        let env = PodEnv::from_lookup(|key| match key {
            "POD_NAME" => Some("vip-controller-abc".to_string()),
            "POD_NAMESPACE" => Some("kube-system".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(env.pod_name, "vip-controller-abc");
        assert_eq!(env.pod_namespace, "kube-system");
    }

    #[test]
    fn pod_env_missing_namespace_is_fatal() {
        let result = PodEnv::from_lookup(|key| match key {
            "POD_NAME" => Some("vip-controller-abc".to_string()),
            _ => None,
        });
        assert!(matches!(result, Err(PreflightError::MissingEnvVar("POD_NAMESPACE"))));
    }
}
