//! C2 — Node Topology: resolve this node's own routable IP, interface name
//! and netmask; enumerate sibling nodes; compute VRRP priority and the
//! deterministic auth password.
//!
//! Executed once at startup; a change of node IP requires a restart.

use std::net::IpAddr;

use crate::error::TopologyError;
use crate::informer::NodeRecord;
use crate::types::NodeInfo;

/// Interface name prefixes excluded from node-IP candidate selection:
/// loopback, Docker's default bridge, and the common CNI bridge/veth
/// naming conventions.
const EXCLUDED_PREFIXES: &[&str] = &["lo", "docker0", "cni", "flannel", "cali", "veth", "tunl"];

/// One local interface address, as enumerated by `LocalInterfaces`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    /// Interface name (`eth0`, `ens4`, ...).
    pub name: String,
    /// An IPv4 address bound to that interface.
    pub ip: IpAddr,
    /// CIDR prefix length of that address.
    pub prefix_len: u8,
}

/// Enumerates this host's local network interfaces. Exists as a trait so
/// tests can substitute a fixture instead of reading the real host's
/// network configuration.
pub trait LocalInterfaces {
    /// Returns every IPv4 address bound to a local interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface list cannot be read.
    fn interfaces(&self) -> Result<Vec<InterfaceAddr>, TopologyError>;
}

/// The real `LocalInterfaces` implementation, backed by `if_addrs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl LocalInterfaces for SystemInterfaces {
    fn interfaces(&self) -> Result<Vec<InterfaceAddr>, TopologyError> {
        let ifaces = if_addrs::get_if_addrs()
            .map_err(|e| TopologyError::InterfaceEnumerationFailed(e.to_string()))?;
        Ok(ifaces
            .into_iter()
            .filter_map(|iface| match iface.addr {
                if_addrs::IfAddr::V4(v4) => {
                    let prefix_len = ipnet::Ipv4Net::with_netmask(v4.ip, v4.netmask)
                        .map(|net| net.prefix_len())
                        .unwrap_or(32);
                    Some(InterfaceAddr { name: iface.name, ip: IpAddr::V4(v4.ip), prefix_len })
                }
                if_addrs::IfAddr::V6(_) => None,
            })
            .collect())
    }
}

fn is_excluded(name: &str) -> bool {
    EXCLUDED_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// Discovers this node's `NodeInfo` by intersecting local interface
/// addresses with the cluster Node IP set, honoring an optional operator
/// override.
///
/// # Errors
///
/// Returns `TopologyError::NoMatchingInterface` if no local, non-excluded
/// interface address is present in `cluster_nodes`.
pub fn discover(
    local: &impl LocalInterfaces,
    cluster_nodes: &[NodeRecord],
    override_ip: Option<IpAddr>,
) -> Result<NodeInfo, TopologyError> {
    let candidates: Vec<InterfaceAddr> = local
        .interfaces()?
        .into_iter()
        .filter(|iface| !is_excluded(&iface.name))
        .collect();

    if let Some(ip) = override_ip {
        let matched = candidates.into_iter().find(|iface| iface.ip == ip);
        return match matched {
            Some(iface) => Ok(NodeInfo {
                node_ip: iface.ip,
                interface_name: iface.name,
                netmask_bits: iface.prefix_len,
            }),
            None => Ok(NodeInfo {
                // The override is trusted even when it doesn't resolve to a
                // local interface we enumerated (e.g. a secondary IP the
                // enumeration backend doesn't surface); netmask falls back
                // to a host route.
                node_ip: ip,
                interface_name: String::new(),
                netmask_bits: 32,
            }),
        };
    }

    let cluster_ips: std::collections::HashSet<IpAddr> =
        cluster_nodes.iter().map(|n| n.ip).collect();

    candidates
        .into_iter()
        .find(|iface| cluster_ips.contains(&iface.ip))
        .map(|iface| NodeInfo {
            node_ip: iface.ip,
            interface_name: iface.name,
            netmask_bits: iface.prefix_len,
        })
        .ok_or(TopologyError::NoMatchingInterface)
}

/// Sorts and deduplicates a set of node IPs, lexicographically on their
/// string form.
#[must_use]
pub fn sort_peer_ips(ips: &[IpAddr]) -> Vec<IpAddr> {
    let mut sorted = ips.to_vec();
    sorted.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
    sorted.dedup();
    sorted
}

/// Computes `100 + position(node_ip, sorted_all)`.
/// `sorted_all` must already be sorted (see `sort_peer_ips`) and must
/// include `node_ip` itself.
///
/// # Errors
///
/// Returns an error if `node_ip` is absent from `sorted_all`, or if the
/// peer set is larger than fits in the priority's representable range.
pub fn priority_for(node_ip: IpAddr, sorted_all: &[IpAddr]) -> Result<u8, TopologyError> {
    let index = sorted_all
        .iter()
        .position(|ip| *ip == node_ip)
        .ok_or(TopologyError::NodeNotInPeerSet(node_ip))?;
    u8::try_from(100 + index).map_err(|_| TopologyError::PriorityOverflow(sorted_all.len()))
}

/// Returns the sibling peers of `node_ip`: every other IP in `sorted_all`.
#[must_use]
pub fn siblings(node_ip: IpAddr, sorted_all: &[IpAddr]) -> Vec<IpAddr> {
    sorted_all.iter().copied().filter(|ip| *ip != node_ip).collect()
}

/// Derives the VRRP group authentication password deterministically from
/// the sorted peer set, so every peer agrees without coordination.
/// keepalived truncates `auth_pass` to 8 characters, so this
/// returns exactly 8 hex characters.
#[must_use]
pub fn derive_auth_password(sorted_all: &[IpAddr]) -> String {
    let joined = sorted_all
        .iter()
        .map(IpAddr::to_string)
        .collect::<Vec<_>>()
        .join(",");
    blake3::hash(joined.as_bytes()).to_hex()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedInterfaces(Vec<InterfaceAddr>);

    impl LocalInterfaces for FixedInterfaces {
        fn interfaces(&self) -> Result<Vec<InterfaceAddr>, TopologyError> {
            Ok(self.0.clone())
        }
    }

    fn iface(name: &str, ip: &str, prefix_len: u8) -> InterfaceAddr {
        InterfaceAddr {
            name: name.to_string(),
            ip: ip.parse().unwrap(),
            prefix_len,
        }
    }

    fn node(ip: &str) -> NodeRecord {
        NodeRecord {
            ip: ip.parse().unwrap(),
            labels: Default::default(),
        }
    }

    #[test]
    fn discover_excludes_loopback_and_bridges() {
        let local = FixedInterfaces(vec![
            iface("lo", "127.0.0.1", 8),
            iface("docker0", "172.17.0.1", 16),
            iface("cni0", "10.244.0.1", 24),
            iface("eth0", "10.0.0.4", 24),
        ]);
        let nodes = vec![node("10.0.0.3"), node("10.0.0.4"), node("10.0.0.5")];

        let info = discover(&local, &nodes, None).unwrap();
        assert_eq!(info.node_ip.to_string(), "10.0.0.4");
        assert_eq!(info.interface_name, "eth0");
        assert_eq!(info.netmask_bits, 24);
    }

    #[test]
    fn discover_fails_without_intersection() {
        let local = FixedInterfaces(vec![iface("eth0", "10.0.0.9", 24)]);
        let nodes = vec![node("10.0.0.3"), node("10.0.0.4")];
        let result = discover(&local, &nodes, None);
        assert!(matches!(result, Err(TopologyError::NoMatchingInterface)));
    }

    #[test]
    fn override_ip_wins_even_without_local_match() {
        let local = FixedInterfaces(vec![]);
        let nodes = vec![node("10.0.0.3")];
        let info = discover(&local, &nodes, Some("10.0.0.9".parse().unwrap())).unwrap();
        assert_eq!(info.node_ip.to_string(), "10.0.0.9");
    }

    #[test]
    fn priority_assigns_sequentially_from_sorted_position() {
        let sorted = sort_peer_ips(&[
            "10.0.0.5".parse().unwrap(),
            "10.0.0.3".parse().unwrap(),
            "10.0.0.4".parse().unwrap(),
        ]);
        assert_eq!(sorted.iter().map(ToString::to_string).collect::<Vec<_>>(), vec![
            "10.0.0.3", "10.0.0.4", "10.0.0.5"
        ]);

        let p3 = priority_for("10.0.0.3".parse().unwrap(), &sorted).unwrap();
        let p4 = priority_for("10.0.0.4".parse().unwrap(), &sorted).unwrap();
        let p5 = priority_for("10.0.0.5".parse().unwrap(), &sorted).unwrap();
        assert_eq!(p3, 100);
        assert_eq!(p4, 101);
        assert_eq!(p5, 102);
    }

    #[test]
    fn priorities_are_unique_across_the_peer_set() {
        let sorted = sort_peer_ips(&[
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            "10.0.0.3".parse().unwrap(),
        ]);
        let priorities: std::collections::HashSet<u8> = sorted
            .iter()
            .map(|ip| priority_for(*ip, &sorted).unwrap())
            .collect();
        assert_eq!(priorities.len(), sorted.len());
    }

    #[test]
    fn siblings_excludes_self() {
        let sorted = sort_peer_ips(&[
            "10.0.0.3".parse().unwrap(),
            "10.0.0.4".parse().unwrap(),
            "10.0.0.5".parse().unwrap(),
        ]);
        let peers = siblings("10.0.0.4".parse().unwrap(), &sorted);
        assert_eq!(
            peers.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["10.0.0.3", "10.0.0.5"]
        );
    }

    #[test]
    fn password_is_deterministic_and_depends_on_peer_set() {
        let set_a = sort_peer_ips(&["10.0.0.3".parse().unwrap(), "10.0.0.4".parse().unwrap()]);
        let set_b = sort_peer_ips(&["10.0.0.3".parse().unwrap(), "10.0.0.4".parse().unwrap()]);
        let set_c = sort_peer_ips(&["10.0.0.3".parse().unwrap(), "10.0.0.5".parse().unwrap()]);

        assert_eq!(derive_auth_password(&set_a), derive_auth_password(&set_b));
        assert_ne!(derive_auth_password(&set_a), derive_auth_password(&set_c));
        assert_eq!(derive_auth_password(&set_a).len(), 8);
    }
}
