//! A cluster node: transport, replicated state, scheduler, and the loops
//! that keep them fed.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use stampede_crdt::{
    wall_clock, Extras, Presence, ScenarioEntry, SnapshotExtras, StateKey, StateStore,
};
use stampede_error::{ErrorCodes, StampedeError};
use stampede_metrics::{MetricCollector, MetricsSnapshot};
use stampede_transport::{Transport, TransportConfig, TransportError};
use stampede_types::{HostMode, NodeId};
use stampede_wire::MAX_STRING_LENGTH;
use thiserror::Error;

use crate::journey::ScenarioResolver;
use crate::scheduler::Scheduler;
use crate::view::ClusterView;

pub const DEFAULT_PORT: u16 = 42042;
pub const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_GOSSIP_FANOUT: usize = 4;
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_secs(120 * 60);
pub const DEFAULT_PEER_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StampedeError for NodeError {
    fn code(&self) -> ErrorCodes {
        match self {
            NodeError::Transport(err) => err.code(),
            NodeError::Io(_) => ErrorCodes::Internal,
            NodeError::Encode(_) => ErrorCodes::Internal,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub host: HostMode,
    pub port: u16,
    /// Peer URIs (`tcp://host:port`) to announce ourselves to at bind time.
    pub bootstrap: Vec<String>,
    /// A scenario spec to preload into the replicated set.
    pub job: Option<String>,
    /// Emit a one-line stats summary every second.
    pub output_stats: bool,
    /// Root of the per-node snapshot files.
    pub metrics_dir: PathBuf,
    pub gossip_interval: Duration,
    pub gossip_fanout: usize,
    pub snapshot_interval: Duration,
    pub snapshot_ttl: Duration,
    pub peer_snapshot_interval: Duration,
    pub transport: TransportConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            host: HostMode::default(),
            port: DEFAULT_PORT,
            bootstrap: Vec::new(),
            job: None,
            output_stats: false,
            metrics_dir: PathBuf::from("./metrics"),
            gossip_interval: DEFAULT_GOSSIP_INTERVAL,
            gossip_fanout: DEFAULT_GOSSIP_FANOUT,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            snapshot_ttl: DEFAULT_SNAPSHOT_TTL,
            peer_snapshot_interval: DEFAULT_PEER_SNAPSHOT_INTERVAL,
            transport: TransportConfig::default(),
        }
    }
}

#[derive(Default)]
struct ViewCache {
    keys: BTreeSet<String>,
    index: Option<usize>,
}

/// The part of a node that scenario code is allowed to see, shared behind
/// the [`ClusterView`] seam.
pub struct NodeShared {
    identity: NodeId,
    state: Arc<StateStore>,
    cache: Mutex<ViewCache>,
}

impl NodeShared {
    /// Recompute the cached count/index when the live set changed.
    fn with_cache<T>(&self, f: impl FnOnce(&ViewCache) -> T) -> T {
        let current = self.state.set(StateKey::NodeRegister).keys();
        let mut cache = self.cache.lock();
        if cache.keys != current {
            cache.index = current.iter().position(|k| k == self.identity.as_str());
            cache.keys = current;
        }
        f(&cache)
    }
}

impl ClusterView for NodeShared {
    fn identity(&self) -> &str {
        self.identity.as_str()
    }

    fn count(&self) -> usize {
        self.with_cache(|cache| cache.keys.len())
    }

    fn index(&self) -> Option<usize> {
        self.with_cache(|cache| cache.index)
    }

    fn state(&self) -> &StateStore {
        &self.state
    }
}

pub struct Node {
    shared: Arc<NodeShared>,
    transport: Arc<Transport>,
    scheduler: Arc<Scheduler>,
    resolver: Arc<dyn ScenarioResolver>,
    collector: Arc<MetricCollector>,
    config: NodeConfig,
    running: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        resolver: Arc<dyn ScenarioResolver>,
        collector: Arc<MetricCollector>,
    ) -> Self {
        let identity = NodeId::generate();
        let state = Arc::new(StateStore::new());

        if let Some(job) = &config.job {
            let entry = ScenarioEntry::new(wall_clock(), job.clone());
            state.set(StateKey::Scenarios).add_now(job.clone(), entry.to_extras());
        }

        let host = config.host.resolve();
        let transport = Arc::new(Transport::new(
            host,
            config.port,
            identity.clone(),
            config.transport.clone(),
        ));

        Node {
            shared: Arc::new(NodeShared {
                identity,
                state,
                cache: Mutex::new(ViewCache::default()),
            }),
            transport,
            scheduler: Arc::new(Scheduler::new()),
            resolver,
            collector,
            config,
            running: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn identity(&self) -> &NodeId {
        &self.shared.identity
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.shared.state
    }

    pub fn view(&self) -> Arc<NodeShared> {
        Arc::clone(&self.shared)
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn count(&self) -> usize {
        self.shared.count()
    }

    pub fn index(&self) -> Option<usize> {
        self.shared.index()
    }

    pub fn port(&self) -> u16 {
        self.transport.port()
    }

    pub fn uri(&self) -> String {
        self.transport.endpoint().uri()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Bind the transport, prepare the metrics directory, replay persisted
    /// snapshots, register ourselves, and announce to bootstrap peers.
    ///
    /// Bind exhaustion and an unusable metrics directory are fatal.
    pub async fn bind(&self) -> Result<(), NodeError> {
        self.transport.bind().await?;

        let own_dir = self.config.metrics_dir.join(self.shared.identity.as_str());
        std::fs::create_dir_all(&own_dir)?;
        self.replay_persisted_snapshots();

        self.register_self();

        for peer in &self.config.bootstrap {
            tracing::debug!("bootstrapping to {peer}");
            if let Err(err) = self
                .transport
                .send(None, peer, StateKey::NodeRegister, &self.shared.state)
                .await
            {
                tracing::warn!("bootstrap send to {peer} failed: {err}");
            }
        }
        Ok(())
    }

    fn register_self(&self) {
        let presence = Presence::new(self.transport.host(), self.transport.port());
        self.shared
            .state
            .set(StateKey::NodeRegister)
            .add_now(self.shared.identity.as_str(), presence.to_extras());
    }

    /// Run the node's concurrent loops until shutdown: transport listen,
    /// gossip, scheduler, snapshot persistence, and the optional stats
    /// line.
    pub async fn run(self: &Arc<Self>) {
        let node = Arc::clone(self);
        self.tasks.spawn(async move {
            if let Err(err) = node.transport.listen(Arc::clone(&node.shared.state)).await {
                tracing::error!("listen loop failed: {err}");
            }
        });

        let node = Arc::clone(self);
        self.tasks.spawn(async move {
            while node.is_running() {
                node.update_neighbours(false).await;
                tokio::select! {
                    _ = node.cancel.cancelled() => return,
                    _ = tokio::time::sleep(node.config.gossip_interval) => {}
                }
            }
        });

        let node = Arc::clone(self);
        self.tasks.spawn(async move {
            let view: Arc<dyn ClusterView> = node.shared.clone() as Arc<dyn ClusterView>;
            node.scheduler
                .run(view, Arc::clone(&node.resolver), Arc::clone(&node.collector))
                .await;
        });

        let node = Arc::clone(self);
        self.tasks.spawn(async move {
            while node.is_running() {
                tokio::select! {
                    _ = node.cancel.cancelled() => return,
                    _ = tokio::time::sleep(node.config.snapshot_interval) => {}
                }
                if let Err(err) = node.save_metrics_snapshot().await {
                    tracing::error!("metrics snapshot save failed: {err}");
                }
                node.prune_expired_snapshots();
            }
        });

        let node = Arc::clone(self);
        self.tasks.spawn(async move {
            while node.is_running() {
                tokio::select! {
                    _ = node.cancel.cancelled() => return,
                    _ = tokio::time::sleep(node.config.peer_snapshot_interval) => {}
                }
                if let Err(err) = node.persist_peer_snapshots().await {
                    tracing::warn!("peer snapshot persistence failed: {err}");
                }
            }
        });

        if self.config.output_stats {
            let node = Arc::clone(self);
            self.tasks.spawn(async move {
                while node.is_running() {
                    let port = node.transport.port().to_string();
                    tracing::info!(
                        "{}:{} Node Count:{} Index:{:?} Journeys Spawned:{}",
                        node.shared.identity.short(),
                        &port[port.len().saturating_sub(2)..],
                        node.count(),
                        node.index(),
                        node.scheduler.total_spawned(),
                    );
                    tokio::select! {
                        _ = node.cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            });
        }

        self.cancel.cancelled().await;
    }

    /// One gossip round: re-assert our registration, pick up to
    /// `gossip_fanout` random peers, and exchange every replicated key with
    /// each.
    pub async fn update_neighbours(&self, shutting_down: bool) {
        if !shutting_down
            && !self
                .shared
                .state
                .set(StateKey::NodeRegister)
                .contains(self.shared.identity.as_str())
        {
            tracing::debug!("self not found in node register, re-adding");
            self.register_self();
        }

        let peers: Vec<(String, Presence)> = {
            self.shared
                .state
                .set(StateKey::NodeRegister)
                .entries()
                .into_iter()
                .filter(|(id, _)| id != self.shared.identity.as_str())
                .filter_map(|(id, entry)| {
                    Presence::from_extras(&entry.extras)
                        .map(|presence| (id, presence))
                        .ok()
                })
                .collect()
        };
        let selected = pick_random_neighbours(peers, self.config.gossip_fanout);

        for (peer_id, presence) in selected {
            let uri = presence.endpoint().uri();
            for key in StateKey::ALL {
                if shutting_down {
                    tracing::info!("sending {key} to {peer_id} {uri}");
                } else {
                    tracing::debug!("sending {key} to {peer_id} {uri}");
                }
                if let Err(err) = self
                    .transport
                    .send(Some(&peer_id), &uri, key, &self.shared.state)
                    .await
                {
                    tracing::warn!("gossip send of {key} to {peer_id} failed: {err}");
                }
            }
        }
    }

    /// Take a reset snapshot, replicate it through the CRDT, and persist it
    /// to disk.
    async fn save_metrics_snapshot(&self) -> Result<(), NodeError> {
        let data = self.collector.snapshot(true);
        let snapshot = MetricsSnapshot::from_collector(self.shared.identity.as_str(), data);
        let payload = serde_json::to_string(&snapshot.data)?;

        if payload.len() <= MAX_STRING_LENGTH {
            let extras = SnapshotExtras {
                node_identity: snapshot.node_identity.clone(),
                timestamp: snapshot.timestamp,
                snapshot_payload: payload,
            };
            self.shared.state.set(StateKey::MetricsSnapshots).add(
                snapshot.element_key(),
                extras.to_extras(),
                snapshot.timestamp as f64,
            );
        } else {
            tracing::warn!(
                "metrics snapshot payload too large to replicate ({} bytes), keeping it local",
                payload.len()
            );
        }

        let dir = self.config.metrics_dir.join(&snapshot.node_identity);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("metrics_{}.json", snapshot.timestamp));
        tokio::fs::write(path, serde_json::to_vec(&snapshot)?).await?;
        Ok(())
    }

    /// Soft-delete replicated snapshots older than the TTL.
    fn prune_expired_snapshots(&self) {
        let ttl = self.config.snapshot_ttl.as_secs_f64();
        let now = wall_clock();
        let expired: Vec<String> = {
            let set = self.shared.state.set(StateKey::MetricsSnapshots);
            set.entries()
                .into_iter()
                .filter(|(_, entry)| {
                    SnapshotExtras::from_extras(&entry.extras)
                        .map(|extras| now - extras.timestamp as f64 > ttl)
                        .unwrap_or(true)
                })
                .map(|(key, _)| key)
                .collect()
        };
        for key in expired {
            tracing::debug!("pruning expired metrics snapshot {key}");
            self.shared
                .state
                .set(StateKey::MetricsSnapshots)
                .remove_now(key, Extras::new());
        }
    }

    /// Write remote peers' replicated snapshots to disk, for persistence
    /// and post-mortem analysis.
    async fn persist_peer_snapshots(&self) -> Result<(), NodeError> {
        let entries = self.shared.state.set(StateKey::MetricsSnapshots).entries();
        for (_, entry) in entries {
            let Ok(extras) = SnapshotExtras::from_extras(&entry.extras) else {
                continue;
            };
            if extras.node_identity == self.shared.identity.as_str() {
                continue;
            }
            let dir = self.config.metrics_dir.join(&extras.node_identity);
            let path = dir.join(format!("metrics_{}.json", extras.timestamp));
            if path.exists() {
                continue;
            }
            let data = match serde_json::from_str(&extras.snapshot_payload) {
                Ok(data) => data,
                Err(err) => {
                    tracing::warn!("undecodable peer snapshot from {}: {err}", extras.node_identity);
                    continue;
                }
            };
            let snapshot = MetricsSnapshot {
                node_identity: extras.node_identity,
                timestamp: extras.timestamp,
                data,
            };
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(path, serde_json::to_vec(&snapshot)?).await?;
        }
        Ok(())
    }

    /// Load every on-disk snapshot younger than the TTL back into the
    /// replicated set.
    fn replay_persisted_snapshots(&self) {
        let Ok(node_dirs) = std::fs::read_dir(&self.config.metrics_dir) else {
            return;
        };
        let mut replayed = 0usize;
        for node_dir in node_dirs.flatten() {
            let Ok(files) = std::fs::read_dir(node_dir.path()) else {
                continue;
            };
            for file in files.flatten() {
                match self.replay_snapshot_file(&file.path()) {
                    Ok(true) => replayed += 1,
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!("skipping snapshot {}: {err}", file.path().display());
                    }
                }
            }
        }
        if replayed > 0 {
            tracing::info!("replayed {replayed} persisted metrics snapshots");
        }
    }

    fn replay_snapshot_file(&self, path: &Path) -> Result<bool, NodeError> {
        let Some(timestamp) = snapshot_file_timestamp(path) else {
            return Ok(false);
        };
        if wall_clock() - timestamp as f64 > self.config.snapshot_ttl.as_secs_f64() {
            return Ok(false);
        }
        let contents = std::fs::read_to_string(path)?;
        let snapshot: MetricsSnapshot = serde_json::from_str(&contents)?;
        let payload = serde_json::to_string(&snapshot.data)?;
        if payload.len() > MAX_STRING_LENGTH {
            return Ok(false);
        }
        let extras = SnapshotExtras {
            node_identity: snapshot.node_identity.clone(),
            timestamp: snapshot.timestamp,
            snapshot_payload: payload,
        };
        self.shared.state.set(StateKey::MetricsSnapshots).add(
            snapshot.element_key(),
            extras.to_extras(),
            snapshot.timestamp as f64,
        );
        Ok(true)
    }

    /// Graceful shutdown: stop taking work, finish or cancel journeys,
    /// deregister, advertise the departure, and close the transport.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down node");
        self.running.store(false, Ordering::Relaxed);

        self.scheduler.shutdown().await;

        self.shared
            .state
            .set(StateKey::NodeRegister)
            .remove_now(self.shared.identity.as_str(), Extras::new());
        self.update_neighbours(true).await;

        self.transport.close().await;
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("node shutdown complete");
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.shared.identity)
            .field("endpoint", &self.transport.endpoint())
            .field("count", &self.count())
            .field("index", &self.index())
            .finish()
    }
}

/// Sample up to `n` peers uniformly at random.
fn pick_random_neighbours(
    mut peers: Vec<(String, Presence)>,
    n: usize,
) -> Vec<(String, Presence)> {
    peers.sort_by(|a, b| a.0.cmp(&b.0));
    let mut rng = rand::thread_rng();
    peers.choose_multiple(&mut rng, n.min(peers.len())).cloned().collect()
}

fn snapshot_file_timestamp(path: &Path) -> Option<i64> {
    path.file_name()?
        .to_str()?
        .strip_prefix("metrics_")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}
