//! C3 — VIP Resolver: turn the declarative VIP mapping into a sorted,
//! deduplicated list of `VirtualService`s.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use tracing::warn;

use crate::error::ResolverWarning;
use crate::informer::{ConfigMap, Informers};
use crate::informer::ClusterApi;
use crate::types::{
    Endpoints, ForwardMethod, MappingSource, ResolvedBackend, Service, ServiceRef, TargetPort,
    VipMapping, VirtualService, sort_backends, sort_virtual_services,
};

/// The legacy per-Service annotation recognised as a fallback mapping
/// source. Never authoritative over a ConfigMap entry for the same
/// external IP.
pub const LEGACY_VIP_ANNOTATION: &str = "k8s.io/public-vip";

/// Parses the VIP-mapping ConfigMap's `data` section into
/// `externalIP -> [VipMapping]`, plus any entries an operator-provided
/// Service annotation contributes for IPs the ConfigMap does not already
/// claim.
///
/// Keys are externalIPs in dotted-quad form; values are `namespace/name` or
/// `namespace/name:METHOD`, optionally newline-separated to map several
/// services to the same VIP. Malformed entries are logged and skipped,
/// never fatal.
#[must_use]
pub fn parse_mapping(
    config_map: &ConfigMap,
    services: &[Service],
) -> (HashMap<Ipv4Addr, Vec<VipMapping>>, Vec<ResolverWarning>) {
    let mut warnings = Vec::new();
    let mut mapping: HashMap<Ipv4Addr, Vec<VipMapping>> = HashMap::new();

    for (key, value) in &config_map.data {
        let Ok(external_ip) = key.parse::<Ipv4Addr>() else {
            warnings.push(ResolverWarning::MalformedEntry {
                external_ip: Ipv4Addr::UNSPECIFIED,
                line: format!("{key}={value}"),
            });
            continue;
        };

        for line in value.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match parse_entry(line) {
                Some((service_ref, forward_method)) => {
                    mapping.entry(external_ip).or_default().push(VipMapping {
                        external_ip,
                        service_ref,
                        forward_method,
                        source: MappingSource::ConfigMap,
                    });
                }
                None => warnings.push(ResolverWarning::MalformedEntry {
                    external_ip,
                    line: line.to_string(),
                }),
            }
        }
    }

    for service in services {
        let Some(annotation) = service.annotations.get(LEGACY_VIP_ANNOTATION) else {
            continue;
        };
        let Ok(external_ip) = annotation.parse::<Ipv4Addr>() else {
            warnings.push(ResolverWarning::MalformedEntry {
                external_ip: Ipv4Addr::UNSPECIFIED,
                line: format!("{LEGACY_VIP_ANNOTATION}={annotation}"),
            });
            continue;
        };
        // The ConfigMap always wins for an IP it already declares.
        if mapping.contains_key(&external_ip) {
            continue;
        }
        mapping.entry(external_ip).or_default().push(VipMapping {
            external_ip,
            service_ref: service.service_ref.clone(),
            forward_method: ForwardMethod::Nat,
            source: MappingSource::Annotation,
        });
    }

    (mapping, warnings)
}

fn parse_entry(line: &str) -> Option<(ServiceRef, ForwardMethod)> {
    let (service_part, method_part) = match line.split_once(':') {
        Some((svc, method)) => (svc, Some(method)),
        None => (line, None),
    };
    let (namespace, name) = service_part.split_once('/')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    let method = match method_part.map(str::to_ascii_uppercase).as_deref() {
        None => ForwardMethod::Nat,
        Some("NAT") => ForwardMethod::Nat,
        Some("PROXY") => ForwardMethod::Proxy,
        Some(_) => return None,
    };
    Some((ServiceRef::new(namespace, name), method))
}

/// Resolves a parsed mapping table against the informer caches into the
/// final, sorted `VirtualService` list with zero-backend services dropped.
pub async fn resolve<C: ClusterApi>(
    informers: &Informers<C>,
    mapping: &HashMap<Ipv4Addr, Vec<VipMapping>>,
) -> (Vec<VirtualService>, Vec<ResolverWarning>) {
    let mut warnings = Vec::new();
    // (external_ip, port, protocol) -> (owning ServiceRef, VirtualService)
    let mut by_key: BTreeMap<(Ipv4Addr, u16, bool), (ServiceRef, VirtualService)> =
        BTreeMap::new();

    let mut entries: Vec<&VipMapping> = mapping.values().flatten().collect();
    entries.sort_by(|a, b| {
        (a.external_ip, &a.service_ref.namespace, &a.service_ref.name).cmp(&(
            b.external_ip,
            &b.service_ref.namespace,
            &b.service_ref.name,
        ))
    });

    for entry in entries {
        let Some(service) = informers.lookup_service(&entry.service_ref) else {
            warnings.push(ResolverWarning::ServiceNotFound(entry.service_ref.clone()));
            continue;
        };
        let Some(endpoints) = informers.lookup_endpoints(&entry.service_ref) else {
            warnings.push(ResolverWarning::NoReadyEndpoints(entry.service_ref.clone()));
            continue;
        };
        if endpoints.is_empty() {
            warnings.push(ResolverWarning::NoReadyEndpoints(entry.service_ref.clone()));
            continue;
        }

        for port in &service.ports {
            let mut backends = resolve_backends(port, &endpoints);
            if backends.is_empty() {
                // No live backends to forward to; omit the virtual service entirely.
                continue;
            }
            sort_backends(&mut backends);

            let is_tcp = matches!(port.protocol, crate::types::Protocol::Tcp);
            let dedup_key = (entry.external_ip, port.port, is_tcp);
            match by_key.get(&dedup_key) {
                Some((kept_ref, _)) if *kept_ref != entry.service_ref => {
                    let (kept, dropped) = if kept_ref < &entry.service_ref {
                        (kept_ref.clone(), entry.service_ref.clone())
                    } else {
                        (entry.service_ref.clone(), kept_ref.clone())
                    };
                    if kept == entry.service_ref {
                        // The new entry sorts first; replace the existing one.
                        by_key.insert(
                            dedup_key,
                            (
                                entry.service_ref.clone(),
                                VirtualService {
                                    external_ip: entry.external_ip,
                                    port: port.port,
                                    protocol: port.protocol,
                                    forward_method: entry.forward_method,
                                    backends,
                                },
                            ),
                        );
                    }
                    warnings.push(ResolverWarning::PortCollision {
                        external_ip: entry.external_ip,
                        port: port.port,
                        protocol: port.protocol,
                        kept,
                        dropped,
                    });
                }
                _ => {
                    by_key.insert(
                        dedup_key,
                        (
                            entry.service_ref.clone(),
                            VirtualService {
                                external_ip: entry.external_ip,
                                port: port.port,
                                protocol: port.protocol,
                                forward_method: entry.forward_method,
                                backends,
                            },
                        ),
                    );
                }
            }
        }
    }

    for warning in &warnings {
        warn!(%warning, "vip resolution warning");
    }

    let mut services: Vec<VirtualService> = by_key.into_values().map(|(_, vs)| vs).collect();
    sort_virtual_services(&mut services);
    (services, warnings)
}

fn resolve_backends(
    port: &crate::types::ServicePort,
    endpoints: &Endpoints,
) -> Vec<ResolvedBackend> {
    let mut backends = Vec::new();
    for subset in &endpoints.subsets {
        for ep_port in &subset.ports {
            if ep_port.protocol != port.protocol {
                continue;
            }
            let matches_target = match &port.target_port {
                TargetPort::Number(n) => *n == ep_port.port,
                TargetPort::Name(name) => ep_port.name.as_deref() == Some(name.as_str()),
            };
            if !matches_target {
                continue;
            }
            for address in &subset.addresses {
                backends.push(ResolvedBackend {
                    ip: *address,
                    port: ep_port.port,
                });
            }
        }
    }
    backends
}

/// Every distinct external IP referenced by a resolved `VirtualService`
/// set, plus any mapping entry whose VIP survived resolution with zero
/// virtual services (the IP still stays in `virtual_ipaddress` even with
/// no backing `virtual_server`).
#[must_use]
pub fn all_vips(
    mapping: &HashMap<Ipv4Addr, Vec<VipMapping>>,
    virtual_services: &[VirtualService],
) -> Vec<Ipv4Addr> {
    let mut vips: Vec<Ipv4Addr> = mapping.keys().copied().collect();
    for vs in virtual_services {
        if !vips.contains(&vs.external_ip) {
            vips.push(vs.external_ip);
        }
    }
    vips.sort_unstable();
    vips.dedup();
    vips
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::informer::testing::StaticClusterApi;
    use crate::types::{EndpointPort, EndpointSubset, Protocol, ServicePort};
    use std::sync::Arc;

    fn cm(entries: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            namespace: "kube-system".to_string(),
            name: "vip-mapping".to_string(),
            data: entries
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }

    #[test]
    fn parses_default_nat_method() {
        let map = cm(&[("10.4.0.50", "default/echoheaders")]);
        let (mapping, warnings) = parse_mapping(&map, &[]);
        assert!(warnings.is_empty());
        let entries = &mapping[&"10.4.0.50".parse::<Ipv4Addr>().unwrap()];
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].forward_method, ForwardMethod::Nat);
        assert_eq!(entries[0].service_ref, ServiceRef::new("default", "echoheaders"));
    }

    #[test]
    fn parses_explicit_proxy_method() {
        let map = cm(&[("10.4.0.51", "default/named:PROXY")]);
        let (mapping, warnings) = parse_mapping(&map, &[]);
        assert!(warnings.is_empty());
        assert_eq!(
            mapping[&"10.4.0.51".parse::<Ipv4Addr>().unwrap()][0].forward_method,
            ForwardMethod::Proxy
        );
    }

    #[test]
    fn parses_newline_separated_multi_mapping() {
        let map = cm(&[("10.4.0.52", "default/a\ndefault/b:PROXY")]);
        let (mapping, warnings) = parse_mapping(&map, &[]);
        assert!(warnings.is_empty());
        let entries = &mapping[&"10.4.0.52".parse::<Ipv4Addr>().unwrap()];
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].forward_method, ForwardMethod::Nat);
        assert_eq!(entries[1].forward_method, ForwardMethod::Proxy);
    }

    #[test]
    fn unknown_forward_method_is_malformed() {
        let map = cm(&[("10.4.0.52", "default/a:80")]);
        let (mapping, warnings) = parse_mapping(&map, &[]);
        assert!(mapping.is_empty());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn malformed_entries_are_warned_not_fatal() {
        let map = cm(&[("10.4.0.53", "not-a-valid-entry")]);
        let (mapping, warnings) = parse_mapping(&map, &[]);
        assert!(mapping.is_empty());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn configmap_wins_over_annotation_for_same_ip() {
        let map = cm(&[("10.4.0.60", "default/from-configmap")]);
        let mut svc = test_service("default", "from-annotation", 80, Protocol::Tcp, TargetPort::Number(8080));
        svc.annotations
            .insert(LEGACY_VIP_ANNOTATION.to_string(), "10.4.0.60".to_string());
        let (mapping, _warnings) = parse_mapping(&map, std::slice::from_ref(&svc));
        let entries = &mapping[&"10.4.0.60".parse::<Ipv4Addr>().unwrap()];
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source, MappingSource::ConfigMap);
    }

    #[test]
    fn annotation_is_used_when_configmap_silent() {
        let map = cm(&[]);
        let mut svc = test_service("default", "from-annotation", 80, Protocol::Tcp, TargetPort::Number(8080));
        svc.annotations
            .insert(LEGACY_VIP_ANNOTATION.to_string(), "10.4.0.61".to_string());
        let (mapping, _warnings) = parse_mapping(&map, std::slice::from_ref(&svc));
        let entries = &mapping[&"10.4.0.61".parse::<Ipv4Addr>().unwrap()];
        assert_eq!(entries[0].source, MappingSource::Annotation);
    }

    fn test_service(
        ns: &str,
        name: &str,
        port: u16,
        protocol: Protocol,
        target_port: TargetPort,
    ) -> Service {
        Service {
            service_ref: ServiceRef::new(ns, name),
            cluster_ip: Some("10.10.0.1".parse().unwrap()),
            ports: vec![ServicePort { port, protocol, target_port }],
            annotations: Default::default(),
        }
    }

    fn endpoints_single(ns: &str, name: &str, ip: &str, port: u16, protocol: Protocol) -> Endpoints {
        Endpoints {
            service_ref: ServiceRef::new(ns, name),
            subsets: vec![EndpointSubset {
                addresses: vec![ip.parse().unwrap()],
                ports: vec![EndpointPort { name: None, port, protocol }],
            }],
        }
    }

    #[tokio::test]
    async fn single_vip_with_single_backend_resolves() {
        let svc = test_service("default", "echoheaders", 80, Protocol::Tcp, TargetPort::Number(8080));
        let eps = endpoints_single("default", "echoheaders", "10.2.48.2", 8080, Protocol::Tcp);
        let api = Arc::new(
            StaticClusterApi::new()
                .with_services(vec![svc])
                .with_endpoints(vec![eps]),
        );
        let (informers, _rx) = Informers::start(api).await.unwrap();

        let map = cm(&[("10.4.0.50", "default/echoheaders")]);
        let (mapping, warnings) = parse_mapping(&map, &informers.all_services());
        assert!(warnings.is_empty());

        let (virtual_services, warnings) = resolve(&informers, &mapping).await;
        assert!(warnings.is_empty());
        assert_eq!(virtual_services.len(), 1);
        let vs = &virtual_services[0];
        assert_eq!(vs.external_ip.to_string(), "10.4.0.50");
        assert_eq!(vs.port, 80);
        assert_eq!(vs.backends, vec![ResolvedBackend { ip: "10.2.48.2".parse().unwrap(), port: 8080 }]);

        let vips = all_vips(&mapping, &virtual_services);
        assert_eq!(vips, vec!["10.4.0.50".parse::<Ipv4Addr>().unwrap()]);
    }

    #[tokio::test]
    async fn scaling_up_backends_yields_all_real_servers_in_ip_order() {
        let svc = test_service("default", "echoheaders", 80, Protocol::Tcp, TargetPort::Number(8080));
        let eps = Endpoints {
            service_ref: ServiceRef::new("default", "echoheaders"),
            subsets: vec![EndpointSubset {
                addresses: vec![
                    "10.2.68.9".parse().unwrap(),
                    "10.2.68.7".parse().unwrap(),
                    "10.2.68.5".parse().unwrap(),
                    "10.2.68.8".parse().unwrap(),
                    "10.2.68.6".parse().unwrap(),
                ],
                ports: vec![EndpointPort { name: None, port: 8080, protocol: Protocol::Tcp }],
            }],
        };
        let api = Arc::new(
            StaticClusterApi::new()
                .with_services(vec![svc])
                .with_endpoints(vec![eps]),
        );
        let (informers, _rx) = Informers::start(api).await.unwrap();
        let map = cm(&[("10.4.0.50", "default/echoheaders")]);
        let (mapping, _) = parse_mapping(&map, &informers.all_services());
        let (virtual_services, _) = resolve(&informers, &mapping).await;
        assert_eq!(virtual_services.len(), 1);
        let ips: Vec<String> = virtual_services[0]
            .backends
            .iter()
            .map(|b| b.ip.to_string())
            .collect();
        assert_eq!(
            ips,
            vec!["10.2.68.5", "10.2.68.6", "10.2.68.7", "10.2.68.8", "10.2.68.9"]
        );
    }

    #[tokio::test]
    async fn resolves_backends_by_named_target_port() {
        let svc = test_service(
            "default",
            "named",
            80,
            Protocol::Tcp,
            TargetPort::Name("http".to_string()),
        );
        let eps = Endpoints {
            service_ref: ServiceRef::new("default", "named"),
            subsets: vec![EndpointSubset {
                addresses: vec!["10.0.0.1".parse().unwrap()],
                ports: vec![EndpointPort {
                    name: Some("http".to_string()),
                    port: 9000,
                    protocol: Protocol::Tcp,
                }],
            }],
        };
        let api = Arc::new(
            StaticClusterApi::new()
                .with_services(vec![svc])
                .with_endpoints(vec![eps]),
        );
        let (informers, _rx) = Informers::start(api).await.unwrap();
        let map = cm(&[("10.4.0.51", "default/named")]);
        let (mapping, _) = parse_mapping(&map, &informers.all_services());
        let (virtual_services, _) = resolve(&informers, &mapping).await;
        assert_eq!(virtual_services.len(), 1);
        assert_eq!(
            virtual_services[0].backends,
            vec![ResolvedBackend { ip: "10.0.0.1".parse().unwrap(), port: 9000 }]
        );
    }

    #[tokio::test]
    async fn missing_endpoints_omits_virtual_service_but_keeps_vip() {
        let svc = test_service("default", "lonely", 80, Protocol::Tcp, TargetPort::Number(8080));
        let api = Arc::new(StaticClusterApi::new().with_services(vec![svc]));
        let (informers, _rx) = Informers::start(api).await.unwrap();
        let map = cm(&[("10.4.0.55", "default/lonely")]);
        let (mapping, _) = parse_mapping(&map, &informers.all_services());
        let (virtual_services, warnings) = resolve(&informers, &mapping).await;
        assert!(virtual_services.is_empty());
        assert_eq!(warnings.len(), 1);
        let vips = all_vips(&mapping, &virtual_services);
        assert_eq!(vips, vec!["10.4.0.55".parse::<Ipv4Addr>().unwrap()]);
    }

    #[tokio::test]
    async fn disjoint_ports_share_one_vip() {
        let svc_a = test_service("default", "a", 80, Protocol::Tcp, TargetPort::Number(8080));
        let svc_b = test_service("default", "b", 443, Protocol::Tcp, TargetPort::Number(8443));
        let eps_a = endpoints_single("default", "a", "10.2.0.1", 8080, Protocol::Tcp);
        let eps_b = endpoints_single("default", "b", "10.2.0.2", 8443, Protocol::Tcp);
        let api = Arc::new(
            StaticClusterApi::new()
                .with_services(vec![svc_a, svc_b])
                .with_endpoints(vec![eps_a, eps_b]),
        );
        let (informers, _rx) = Informers::start(api).await.unwrap();
        let map = cm(&[("10.4.0.56", "default/a\ndefault/b")]);
        let (mapping, warnings) = parse_mapping(&map, &informers.all_services());
        assert!(warnings.is_empty());
        let (virtual_services, warnings) = resolve(&informers, &mapping).await;
        assert!(warnings.is_empty());
        assert_eq!(virtual_services.len(), 2);
        assert_eq!(virtual_services[0].port, 80);
        assert_eq!(virtual_services[1].port, 443);
        assert!(virtual_services.iter().all(|vs| vs.external_ip.to_string() == "10.4.0.56"));
    }

    #[tokio::test]
    async fn port_collision_keeps_lower_service_ref() {
        let svc_a = test_service("default", "aaa", 80, Protocol::Tcp, TargetPort::Number(8080));
        let svc_b = test_service("default", "zzz", 80, Protocol::Tcp, TargetPort::Number(8081));
        let eps_a = endpoints_single("default", "aaa", "10.2.0.1", 8080, Protocol::Tcp);
        let eps_b = endpoints_single("default", "zzz", "10.2.0.2", 8081, Protocol::Tcp);
        let api = Arc::new(
            StaticClusterApi::new()
                .with_services(vec![svc_a, svc_b])
                .with_endpoints(vec![eps_a, eps_b]),
        );
        let (informers, _rx) = Informers::start(api).await.unwrap();
        let map = cm(&[("10.4.0.57", "default/aaa\ndefault/zzz")]);
        let (mapping, _) = parse_mapping(&map, &informers.all_services());
        let (virtual_services, warnings) = resolve(&informers, &mapping).await;
        assert_eq!(virtual_services.len(), 1);
        assert_eq!(
            virtual_services[0].backends[0],
            ResolvedBackend { ip: "10.2.0.1".parse().unwrap(), port: 8080 }
        );
        assert_eq!(warnings.len(), 1);
    }
}
