//! claw-vip-controller binary: wires up CLI parsing, logging, and process
//! lifecycle around the library's reconciliation logic.

use std::sync::Arc;

use claw_vip_controller::config::{Cli, PodEnv};
use claw_vip_controller::informer::{ClusterApi, Informers};
use claw_vip_controller::metrics::Metrics;
use claw_vip_controller::reconciler::{self, BackoffConfig, ReconcilerContext, WorkQueue};
use claw_vip_controller::reload::ReloadCoordinator;
use claw_vip_controller::source::FileClusterApi;
use claw_vip_controller::supervisor::Supervisor;
use claw_vip_controller::{preflight, resolver, topology};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        error!(error = %err, "claw-vip-controller exited with a fatal error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let _pod_env = PodEnv::from_env()?;

    let Some(state_file) = &cli.cluster_state_file else {
        return Err("no concrete ClusterApi wired in: pass --cluster-state-file, \
                     or embed claw_vip_controller as a library with your own ClusterApi impl"
            .into());
    };
    let client = Arc::new(FileClusterApi::load(state_file)?);

    run_with_client(client, cli).await
}

async fn run_with_client<C: ClusterApi>(
    client: Arc<C>,
    cli: Cli,
) -> Result<(), Box<dyn std::error::Error>> {
    let (informers, mut watch_key_rx) = Informers::start(Arc::clone(&client)).await?;
    let informers = Arc::new(informers);

    let cluster_nodes = client.list_nodes().await?;
    let node_info = topology::discover(&topology::SystemInterfaces, &cluster_nodes, cli.keepalived_ip)?;

    let peer_ips: Vec<_> = cluster_nodes.iter().map(|n| n.ip).collect();
    let sorted_peers = topology::sort_peer_ips(&peer_ips);
    let priority = topology::priority_for(node_info.node_ip, &sorted_peers)?;
    let siblings = topology::siblings(node_info.node_ip, &sorted_peers);
    let auth_password = cli
        .vrrp_password
        .clone()
        .unwrap_or_else(|| topology::derive_auth_password(&sorted_peers));

    let (config_ns, config_name) = cli
        .services_configmap
        .split_once('/')
        .ok_or("--services-configmap must be namespace/name")?;

    let config_map = informers.read_vip_mapping_config_map(config_ns, config_name).await?;
    let services = informers.all_services();
    let (mapping, parse_warnings) = resolver::parse_mapping(&config_map, &services);
    let (virtual_services, resolve_warnings) = resolver::resolve(&informers, &mapping).await;
    info!(
        warnings = parse_warnings.len() + resolve_warnings.len(),
        virtual_services = virtual_services.len(),
        "bootstrap vip resolution complete"
    );

    preflight::check_conntrack(&virtual_services, cli.ipvs_conntrack)?;

    let reload = Arc::new(ReloadCoordinator::new(cli.config_path.clone(), cli.daemon_name.clone()));
    let metrics = Arc::new(Metrics::new());
    metrics.record_resolver_warnings((parse_warnings.len() + resolve_warnings.len()) as u64);

    let context = Arc::new(ReconcilerContext {
        informers: Arc::clone(&informers),
        node_topology: node_info,
        priority,
        peers: siblings,
        unicast: cli.use_unicast,
        auth_password,
        config_map_ref: (config_ns.to_string(), config_name.to_string()),
        reload: Arc::clone(&reload),
        metrics: Arc::clone(&metrics),
    });

    let rendered = claw_vip_controller::render::render(&claw_vip_controller::types::VrrpConfig {
        interface_name: context.node_topology.interface_name.clone(),
        node_ip: context.node_topology.node_ip,
        priority: context.priority,
        peers: context.peers.clone(),
        unicast: context.unicast,
        auth_password: context.auth_password.clone(),
        vips: resolver::all_vips(&mapping, &virtual_services),
        virtual_servers: virtual_services,
    })?;
    reload.apply(&rendered)?;

    let (queue, work_rx) = WorkQueue::new(256);
    let queue = Arc::new(queue);

    let forwarder_queue = Arc::clone(&queue);
    tokio::spawn(async move {
        while let Some(key) = watch_key_rx.recv().await {
            forwarder_queue.add(key).await;
        }
    });

    let supervisor = Supervisor::new(cli.keepalived_binary.clone(), cli.config_path.clone());
    let supervisor_handle = tokio::spawn(supervisor.run());

    reconciler::run(context, queue, work_rx, BackoffConfig::default()).await;

    let snapshot = metrics.snapshot();
    info!(
        reloads_performed = snapshot.reloads_performed,
        reloads_skipped = snapshot.reloads_skipped,
        reconcile_errors = snapshot.reconcile_errors,
        resolver_warnings = snapshot.resolver_warnings,
        "reconciler loop exited"
    );

    supervisor_handle.abort();
    Ok(())
}
