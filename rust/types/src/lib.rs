//! Core types shared across the stampede crates: node identities, bind
//! endpoints, volume models, and scenario descriptions.

mod endpoint;
mod node;
mod scenario;
mod volume;

pub use endpoint::{local_ip, Endpoint, HostMode};
pub use node::NodeId;
pub use scenario::{Journey, Scenario, SharedDatapool, DEFAULT_DELAY_SECS, DEFAULT_INTERVAL_SECS, DEFAULT_JOURNEY_SEPARATION_SECS};
pub use volume::{JourneyComplete, VolumeModel, VolumeModelError};
