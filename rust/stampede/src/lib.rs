//! stampede is a distributed HTTP load generator.
//!
//! A cluster of symmetric peers discovers itself by gossip, replicates the
//! set of active scenarios through LWW-element-sets, and cooperatively
//! partitions each scenario's per-second request volume across the live
//! set.  This crate is the process shell: CLI parsing, configuration,
//! logging, the builtin journeys, and node bootstrap.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use stampede_metrics::MetricCollector;
use stampede_node::{Node, NodeConfig};
use stampede_transport::TransportConfig;
use stampede_types::HostMode;

pub mod config;
pub mod journeys;
pub mod logging;
pub mod resolver;

#[derive(Parser, Debug)]
#[command(name = "stampede", about = "Distributed HTTP load generator", version)]
pub struct Args {
    /// Comma-separated bootstrap peer URIs (tcp://host:port)
    #[arg(short, long)]
    pub bootstrap: Option<String>,

    /// Network interface to bind to: public, local, or an IP address
    #[arg(short = 'H', long, default_value = "public")]
    pub host: String,

    /// Port to bind to (incremented when taken)
    #[arg(short, long, default_value_t = stampede_node::DEFAULT_PORT)]
    pub port: u16,

    /// Fail instead of incrementing when the port is taken
    #[arg(long)]
    pub strict_port: bool,

    /// Scenario spec to preload into the cluster
    #[arg(short, long)]
    pub job: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit a periodic stats line
    #[arg(short, long)]
    pub stats: bool,

    /// Root directory for per-node metrics snapshots
    #[arg(long, default_value = "./metrics")]
    pub metrics_dir: PathBuf,

    /// Directory holding scenario files
    #[arg(long, default_value = "./scenarios")]
    pub scenarios_dir: PathBuf,

    /// Dashboard port (the dashboard is not part of this build)
    #[arg(long)]
    pub web_port: Option<u16>,

    /// Optional YAML config file (defaults to ./stampede_config.yaml)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Args {
    fn bootstrap_list(&self) -> Vec<String> {
        self.bootstrap
            .as_deref()
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn node_config(&self, tunables: &config::NodeTunables) -> NodeConfig {
        NodeConfig {
            host: HostMode::parse(&self.host),
            port: self.port,
            bootstrap: self.bootstrap_list(),
            job: self.job.clone(),
            output_stats: self.stats,
            metrics_dir: self.metrics_dir.clone(),
            gossip_interval: tunables.gossip_interval(),
            gossip_fanout: tunables.gossip_fanout,
            snapshot_interval: tunables.snapshot_interval(),
            snapshot_ttl: tunables.snapshot_ttl(),
            peer_snapshot_interval: tunables.peer_snapshot_interval(),
            transport: TransportConfig {
                poll_timeout: tunables.poll_timeout(),
                max_bind_attempts: tunables.max_bind_attempts,
                strict_port: self.strict_port,
            },
        }
    }
}

/// Bring a node up, run it until SIGINT, shut it down.
pub async fn entrypoint(args: Args) {
    let root_config = match &args.config {
        Some(path) => config::RootConfig::load_from_path(&path.to_string_lossy()),
        None => config::RootConfig::load(),
    };
    logging::init_tracing(args.verbose);

    if let Some(web_port) = args.web_port {
        tracing::warn!("the dashboard is not part of this build; ignoring --web-port {web_port}");
    }

    let collector = Arc::new(MetricCollector::new());
    let resolver = Arc::new(resolver::RegistryResolver::new(Some(
        args.scenarios_dir.clone(),
    )));
    let node = Arc::new(Node::new(
        args.node_config(&root_config.node),
        resolver,
        collector,
    ));

    if let Err(err) = node.bind().await {
        // inability to bind any port or to create the storage directory is
        // fatal by design
        tracing::error!("failed to start node: {err}");
        std::process::exit(1);
    }
    tracing::info!(
        "node {} listening on {}",
        node.identity().short(),
        node.uri()
    );

    tokio::select! {
        _ = node.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
    }
    node.shutdown().await;
    tracing::info!("node shutdown gracefully");
}
