//! The node runtime: gossip membership, the scenario scheduler, work
//! partitioning, and per-request execution contexts.

mod context;
mod journey;
mod manager;
mod node;
mod partition;
mod scheduler;
mod view;

pub use context::{Context, ContextMetadata};
pub use journey::{JourneyError, JourneyFn, JourneyFuture, ResolveError, ResolvedScenario, ScenarioResolver};
pub use manager::{ScenarioManager, Work};
pub use node::{Node, NodeConfig, NodeError, NodeShared, DEFAULT_PORT};
pub use partition::{journey_offset, target_volume_per_node};
pub use scheduler::Scheduler;
pub use view::ClusterView;
