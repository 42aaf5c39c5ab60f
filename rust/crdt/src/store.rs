use parking_lot::{Mutex, MutexGuard};

use crate::LwwElementSet;

/// The well-known replicated keys.  Every peer carries exactly these; an
/// unknown key in a gossip request is answered with an empty payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum StateKey {
    NodeRegister,
    Scenarios,
    MetricsSnapshots,
}

impl StateKey {
    /// Gossip sends keys in this order each round.
    pub const ALL: [StateKey; 3] = [
        StateKey::NodeRegister,
        StateKey::Scenarios,
        StateKey::MetricsSnapshots,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StateKey::NodeRegister => "node_register",
            StateKey::Scenarios => "scenarios",
            StateKey::MetricsSnapshots => "metrics_snapshots",
        }
    }

    pub fn parse(s: &str) -> Option<StateKey> {
        match s {
            "node_register" => Some(StateKey::NodeRegister),
            "scenarios" => Some(StateKey::Scenarios),
            "metrics_snapshots" => Some(StateKey::MetricsSnapshots),
            _ => None,
        }
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One LWW set per well-known key.  Each set sits behind its own lock so the
/// gossip loop, the transport, and the scheduler can touch different keys
/// without contending; encode-under-lock gives atomic snapshots.
#[derive(Debug, Default)]
pub struct StateStore {
    node_register: Mutex<LwwElementSet>,
    scenarios: Mutex<LwwElementSet>,
    metrics_snapshots: Mutex<LwwElementSet>,
}

impl StateStore {
    pub fn new() -> Self {
        StateStore::default()
    }

    pub fn set(&self, key: StateKey) -> MutexGuard<'_, LwwElementSet> {
        match key {
            StateKey::NodeRegister => self.node_register.lock(),
            StateKey::Scenarios => self.scenarios.lock(),
            StateKey::MetricsSnapshots => self.metrics_snapshots.lock(),
        }
    }

    /// A point-in-time copy, for encoding outside the lock.
    pub fn clone_set(&self, key: StateKey) -> LwwElementSet {
        self.set(key).clone()
    }

    /// Merge a received replica into the local set for `key`.
    pub fn merge(&self, key: StateKey, other: &LwwElementSet) {
        self.set(key).merge(other);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Extras;

    #[test]
    fn key_names_round_trip() {
        for key in StateKey::ALL {
            assert_eq!(StateKey::parse(key.as_str()), Some(key));
        }
        assert_eq!(StateKey::parse("bogus"), None);
    }

    #[test]
    fn store_isolates_keys() {
        let store = StateStore::new();
        store
            .set(StateKey::NodeRegister)
            .add("n1", Extras::new(), 1.0);
        assert!(store.set(StateKey::NodeRegister).contains("n1"));
        assert!(!store.set(StateKey::Scenarios).contains("n1"));
    }

    #[test]
    fn merge_applies_to_the_named_key() {
        let store = StateStore::new();
        let mut incoming = LwwElementSet::new();
        incoming.add("s1", Extras::new(), 3.0);
        store.merge(StateKey::Scenarios, &incoming);
        assert!(store.set(StateKey::Scenarios).contains("s1"));
    }
}
