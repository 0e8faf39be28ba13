//! Startup checks that must pass before the reconciler loop is allowed to
//! run at all. All failures here are fatal.

use crate::error::PreflightError;
use crate::types::{ForwardMethod, Protocol, VirtualService};

/// Fails if any resolved virtual service is NAT-forwarded TCP but the
/// operator has not acknowledged that IPVS connection tracking is enabled
/// (fail fast rather than silently drop return traffic once IPVS starts
/// forwarding connections it can't track).
///
/// # Errors
///
/// Returns `PreflightError::ConntrackRequired` if the condition above holds
/// and `conntrack_enabled` is `false`.
pub fn check_conntrack(
    virtual_services: &[VirtualService],
    conntrack_enabled: bool,
) -> Result<(), PreflightError> {
    if conntrack_enabled {
        return Ok(());
    }
    let needs_conntrack = virtual_services
        .iter()
        .any(|vs| vs.forward_method == ForwardMethod::Nat && vs.protocol == Protocol::Tcp);
    if needs_conntrack {
        Err(PreflightError::ConntrackRequired)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vs(protocol: Protocol, forward_method: ForwardMethod) -> VirtualService {
        VirtualService {
            external_ip: "10.4.0.50".parse().unwrap(),
            port: 80,
            protocol,
            forward_method,
            backends: vec![],
        }
    }

    #[test]
    fn passes_when_conntrack_enabled() {
        let services = vec![vs(Protocol::Tcp, ForwardMethod::Nat)];
        assert!(check_conntrack(&services, true).is_ok());
    }

    #[test]
    fn fails_for_nat_tcp_without_conntrack() {
        let services = vec![vs(Protocol::Tcp, ForwardMethod::Nat)];
        assert!(matches!(
            check_conntrack(&services, false),
            Err(PreflightError::ConntrackRequired)
        ));
    }

    #[test]
    fn passes_for_proxy_forwarding_without_conntrack() {
        let services = vec![vs(Protocol::Tcp, ForwardMethod::Proxy)];
        assert!(check_conntrack(&services, false).is_ok());
    }

    #[test]
    fn passes_for_udp_without_conntrack() {
        let services = vec![vs(Protocol::Udp, ForwardMethod::Nat)];
        assert!(check_conntrack(&services, false).is_ok());
    }
}
