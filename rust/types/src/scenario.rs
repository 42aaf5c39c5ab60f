use std::sync::Arc;

use parking_lot::Mutex;
use stampede_datapool::Datapool;

use crate::volume::VolumeModel;

pub const DEFAULT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_DELAY_SECS: u64 = 30;
pub const DEFAULT_JOURNEY_SEPARATION_SECS: f64 = 1.0;

/// A datapool shared between the scheduler (which moves the cursor) and the
/// per-interval checkouts.  Concurrent use of one pool by several scenarios
/// is undefined; each scenario owns its pools.
pub type SharedDatapool = Arc<Mutex<dyn Datapool>>;

/// One request-producing program: an opaque spec naming the journey
/// function, an optional supply of data items, and the volume to drive.
#[derive(Clone)]
pub struct Journey {
    /// Opaque `module:symbol` identifier, resolved by the embedding binary.
    pub spec: String,
    pub datapool: Option<SharedDatapool>,
    pub volume: VolumeModel,
}

impl Journey {
    pub fn new(spec: impl Into<String>, datapool: Option<SharedDatapool>, volume: VolumeModel) -> Self {
        Journey {
            spec: spec.into(),
            datapool,
            volume,
        }
    }
}

impl std::fmt::Debug for Journey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journey")
            .field("spec", &self.spec)
            .field("datapool", &self.datapool.is_some())
            .field("volume", &self.volume)
            .finish()
    }
}

/// A set of journeys driven on a shared clock.
#[derive(Clone, Debug)]
pub struct Scenario {
    pub journeys: Vec<Journey>,
    /// Seconds per work interval.
    pub interval: u64,
    /// Seconds between a scenario landing in the CRDT and its first interval.
    pub delay: u64,
    /// Seconds between sub-interval spawn bursts.
    pub journey_separation: f64,
}

impl Scenario {
    pub fn new(journeys: Vec<Journey>) -> Self {
        Scenario {
            journeys,
            interval: DEFAULT_INTERVAL_SECS,
            delay: DEFAULT_DELAY_SECS,
            journey_separation: DEFAULT_JOURNEY_SEPARATION_SECS,
        }
    }

    pub fn with_interval(mut self, interval: u64) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_delay(mut self, delay: u64) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_journey_separation(mut self, separation: f64) -> Self {
        self.journey_separation = separation;
        self
    }

    /// How many spawn bursts fit into one interval.
    pub fn sub_intervals(&self) -> usize {
        (self.interval as f64 / self.journey_separation) as usize
    }
}
