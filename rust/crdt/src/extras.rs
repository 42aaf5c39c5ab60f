//! Typed views over the extras maps of the three well-known state keys.
//!
//! The wire format stays a flat scalar map; these views give the rest of
//! the system named fields and one place where malformed gossip metadata is
//! rejected.

use stampede_error::{ErrorCodes, StampedeError};
use stampede_types::Endpoint;
use thiserror::Error;

use crate::scalar::{Extras, Scalar};

#[derive(Error, Debug)]
pub enum ExtrasError {
    #[error("missing extras field '{0}'")]
    MissingField(&'static str),
    #[error("extras field '{0}' has the wrong type")]
    WrongType(&'static str),
}

impl StampedeError for ExtrasError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::InvalidArgument
    }
}

fn require_str(extras: &Extras, field: &'static str) -> Result<String, ExtrasError> {
    extras
        .get(field)
        .ok_or(ExtrasError::MissingField(field))?
        .as_str()
        .map(str::to_string)
        .ok_or(ExtrasError::WrongType(field))
}

fn require_int(extras: &Extras, field: &'static str) -> Result<i64, ExtrasError> {
    extras
        .get(field)
        .ok_or(ExtrasError::MissingField(field))?
        .as_int()
        .ok_or(ExtrasError::WrongType(field))
}

fn require_float(extras: &Extras, field: &'static str) -> Result<f64, ExtrasError> {
    extras
        .get(field)
        .ok_or(ExtrasError::MissingField(field))?
        .as_float()
        .ok_or(ExtrasError::WrongType(field))
}

/// `node_register` metadata: where the node can be reached.
#[derive(Clone, Debug, PartialEq)]
pub struct Presence {
    pub host: String,
    pub port: u16,
}

impl Presence {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Presence {
            host: host.into(),
            port,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    pub fn to_extras(&self) -> Extras {
        [
            ("host".to_string(), Scalar::from(self.host.as_str())),
            ("port".to_string(), Scalar::from(self.port)),
        ]
        .into_iter()
        .collect()
    }

    pub fn from_extras(extras: &Extras) -> Result<Self, ExtrasError> {
        let host = require_str(extras, "host")?;
        let port = require_int(extras, "port")?;
        let port = u16::try_from(port).map_err(|_| ExtrasError::WrongType("port"))?;
        Ok(Presence { host, port })
    }
}

/// `scenarios` metadata: when the scenario was submitted, and its spec.
#[derive(Clone, Debug, PartialEq)]
pub struct ScenarioEntry {
    pub init_time: f64,
    pub scenario: String,
}

impl ScenarioEntry {
    pub fn new(init_time: f64, scenario: impl Into<String>) -> Self {
        ScenarioEntry {
            init_time,
            scenario: scenario.into(),
        }
    }

    pub fn to_extras(&self) -> Extras {
        [
            ("init_time".to_string(), Scalar::from(self.init_time)),
            ("scenario".to_string(), Scalar::from(self.scenario.as_str())),
        ]
        .into_iter()
        .collect()
    }

    pub fn from_extras(extras: &Extras) -> Result<Self, ExtrasError> {
        Ok(ScenarioEntry {
            init_time: require_float(extras, "init_time")?,
            scenario: require_str(extras, "scenario")?,
        })
    }
}

/// `metrics_snapshots` metadata: who produced the snapshot, when, and the
/// encoded payload itself.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotExtras {
    pub node_identity: String,
    pub timestamp: i64,
    pub snapshot_payload: String,
}

impl SnapshotExtras {
    pub fn to_extras(&self) -> Extras {
        [
            (
                "node_identity".to_string(),
                Scalar::from(self.node_identity.as_str()),
            ),
            ("timestamp".to_string(), Scalar::from(self.timestamp)),
            (
                "snapshot_payload".to_string(),
                Scalar::from(self.snapshot_payload.as_str()),
            ),
        ]
        .into_iter()
        .collect()
    }

    pub fn from_extras(extras: &Extras) -> Result<Self, ExtrasError> {
        Ok(SnapshotExtras {
            node_identity: require_str(extras, "node_identity")?,
            timestamp: require_int(extras, "timestamp")?,
            snapshot_payload: require_str(extras, "snapshot_payload")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_round_trip() {
        let presence = Presence::new("10.0.0.7", 42042);
        let back = Presence::from_extras(&presence.to_extras()).unwrap();
        assert_eq!(back, presence);
        assert_eq!(back.endpoint().uri(), "tcp://10.0.0.7:42042");
    }

    #[test]
    fn presence_rejects_missing_host() {
        let extras: Extras = [("port".to_string(), Scalar::Int(1))].into_iter().collect();
        assert!(matches!(
            Presence::from_extras(&extras),
            Err(ExtrasError::MissingField("host"))
        ));
    }

    #[test]
    fn presence_rejects_out_of_range_port() {
        let extras: Extras = [
            ("host".to_string(), Scalar::from("h")),
            ("port".to_string(), Scalar::Int(70_000)),
        ]
        .into_iter()
        .collect();
        assert!(matches!(
            Presence::from_extras(&extras),
            Err(ExtrasError::WrongType("port"))
        ));
    }

    #[test]
    fn scenario_entry_round_trip() {
        let entry = ScenarioEntry::new(1234.5, "demo:http");
        assert_eq!(ScenarioEntry::from_extras(&entry.to_extras()).unwrap(), entry);
    }

    #[test]
    fn snapshot_extras_round_trip() {
        let extras = SnapshotExtras {
            node_identity: "abc123".to_string(),
            timestamp: 1_700_000_000,
            snapshot_payload: "{}".to_string(),
        };
        assert_eq!(
            SnapshotExtras::from_extras(&extras.to_extras()).unwrap(),
            extras
        );
    }
}
