//! Wire schema for gossip messages.
//!
//! Replicated sets travel as compact bincode with hard validation on
//! receive: a malicious or confused peer can cost us at most a bounded
//! decode, never arbitrary memory or a poisoned merge.  There is no schema
//! versioning; all peers must run compatible builds.

use bincode::Options;
use serde::{Deserialize, Serialize};
use stampede_crdt::{Entry, LwwElementSet, Scalar};
use stampede_error::{ErrorCodes, StampedeError};
use thiserror::Error;

/// Hard ceiling on any single gossip message.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
/// Max elements per add/remove side.
pub const MAX_COLLECTION_SIZE: usize = 100_000;
/// Max metadata keys per element.
pub const MAX_METADATA_KEYS: usize = 50;
/// Max bytes for any element key or string metadata value.  Large enough for
/// an encoded metrics snapshot with histogram data.
pub const MAX_STRING_LENGTH: usize = 10 * 1024;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("message too large ({size} > {MAX_MESSAGE_SIZE})")]
    TooLarge { size: usize },
    #[error("failed to encode: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode: {0}")]
    Decode(#[source] bincode::Error),
    #[error("invalid message: {0}")]
    Validation(String),
}

impl StampedeError for WireError {
    fn code(&self) -> ErrorCodes {
        match self {
            WireError::TooLarge { .. } => ErrorCodes::ResourceExhausted,
            WireError::Encode(_) => ErrorCodes::Internal,
            WireError::Decode(_) => ErrorCodes::InvalidArgument,
            WireError::Validation(_) => ErrorCodes::InvalidArgument,
        }
    }
}

/// Frame headroom for the envelope around a maximum-size payload.
pub const ENVELOPE_OVERHEAD: usize = 4096;

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE as u64)
        .allow_trailing_bytes()
}

fn envelope_codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit((MAX_MESSAGE_SIZE + ENVELOPE_OVERHEAD) as u64)
        .allow_trailing_bytes()
}

/// Encode a replicated set for the wire.
pub fn serialize_lww(set: &LwwElementSet) -> Result<Vec<u8>, WireError> {
    let bytes = codec().serialize(set).map_err(WireError::Encode)?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::TooLarge { size: bytes.len() });
    }
    Ok(bytes)
}

/// Decode and validate a replicated set received from a peer.
pub fn deserialize_lww(data: &[u8]) -> Result<LwwElementSet, WireError> {
    validate_message_size(data)?;
    let set: LwwElementSet = codec().deserialize(data).map_err(WireError::Decode)?;
    validate_lww(&set)?;
    Ok(set)
}

/// Quick size gate before any decoding work.
pub fn validate_message_size(data: &[u8]) -> Result<(), WireError> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::TooLarge { size: data.len() });
    }
    Ok(())
}

/// Structural validation of a decoded set.  The two-sided shape is enforced
/// by the type; this checks the bounds a peer could still violate.
pub fn validate_lww(set: &LwwElementSet) -> Result<(), WireError> {
    validate_side(&set.add_set, "add_set")?;
    validate_side(&set.remove_set, "remove_set")?;
    Ok(())
}

fn validate_side(
    side: &std::collections::HashMap<String, Entry>,
    context: &str,
) -> Result<(), WireError> {
    if side.len() > MAX_COLLECTION_SIZE {
        return Err(WireError::Validation(format!(
            "{context}: too many elements ({} > {MAX_COLLECTION_SIZE})",
            side.len()
        )));
    }
    for (key, entry) in side {
        if key.len() > MAX_STRING_LENGTH {
            return Err(WireError::Validation(format!(
                "{context}: key too long ({} > {MAX_STRING_LENGTH})",
                key.len()
            )));
        }
        validate_entry(entry, context, key)?;
    }
    Ok(())
}

fn validate_entry(entry: &Entry, context: &str, key: &str) -> Result<(), WireError> {
    if !entry.timestamp.is_finite() || entry.timestamp < 0.0 {
        return Err(WireError::Validation(format!(
            "{context}[{key}].timestamp: must be a non-negative number"
        )));
    }
    if entry.extras.len() > MAX_METADATA_KEYS {
        return Err(WireError::Validation(format!(
            "{context}[{key}]: too many metadata keys ({} > {MAX_METADATA_KEYS})",
            entry.extras.len()
        )));
    }
    for (field, value) in &entry.extras {
        if let Scalar::Str(s) = value {
            if s.len() > MAX_STRING_LENGTH {
                return Err(WireError::Validation(format!(
                    "{context}[{key}].{field}: string too long ({} > {MAX_STRING_LENGTH})",
                    s.len()
                )));
            }
        }
    }
    Ok(())
}

/// One transport frame.  A request carries the dealer's identity so the
/// router can address the reply; a reply carries the router's identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: String,
    pub key: String,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Envelope {
            sender: sender.into(),
            key: key.into(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        envelope_codec().serialize(self).map_err(WireError::Encode)
    }

    pub fn decode(data: &[u8]) -> Result<Envelope, WireError> {
        if data.len() > MAX_MESSAGE_SIZE + ENVELOPE_OVERHEAD {
            return Err(WireError::TooLarge { size: data.len() });
        }
        envelope_codec().deserialize(data).map_err(WireError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stampede_crdt::Extras;

    fn sample_set() -> LwwElementSet {
        let mut set = LwwElementSet::new();
        let extras: Extras = [
            ("host".to_string(), Scalar::from("10.0.0.1")),
            ("port".to_string(), Scalar::Int(42042)),
            ("up".to_string(), Scalar::Bool(true)),
            ("load".to_string(), Scalar::Float(0.25)),
            ("note".to_string(), Scalar::Null),
        ]
        .into_iter()
        .collect();
        set.add("node-a", extras, 100.5);
        set.remove("node-b", Extras::new(), 99.0);
        set
    }

    #[test]
    fn round_trip_preserves_the_set() {
        let set = sample_set();
        let bytes = serialize_lww(&set).unwrap();
        let back = deserialize_lww(&bytes).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn empty_set_round_trips() {
        let set = LwwElementSet::new();
        let back = deserialize_lww(&serialize_lww(&set).unwrap()).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn oversized_message_is_rejected_before_decode() {
        let data = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            deserialize_lww(&data),
            Err(WireError::TooLarge { .. })
        ));
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(
            deserialize_lww(&[0xff, 0xfe, 0xfd]),
            Err(WireError::Decode(_))
        ));
    }

    #[test]
    fn negative_timestamp_is_rejected() {
        let mut set = LwwElementSet::new();
        set.add_set.insert(
            "bad".to_string(),
            Entry::new(-1.0, Extras::new()),
        );
        let bytes = codec().serialize(&set).unwrap();
        assert!(matches!(
            deserialize_lww(&bytes),
            Err(WireError::Validation(_))
        ));
    }

    #[test]
    fn nan_timestamp_is_rejected() {
        let mut set = LwwElementSet::new();
        set.add_set.insert(
            "bad".to_string(),
            Entry::new(f64::NAN, Extras::new()),
        );
        let bytes = codec().serialize(&set).unwrap();
        assert!(matches!(
            deserialize_lww(&bytes),
            Err(WireError::Validation(_))
        ));
    }

    #[test]
    fn long_key_is_rejected() {
        let mut set = LwwElementSet::new();
        set.add("x".repeat(MAX_STRING_LENGTH + 1), Extras::new(), 1.0);
        let bytes = codec().serialize(&set).unwrap();
        assert!(matches!(
            deserialize_lww(&bytes),
            Err(WireError::Validation(_))
        ));
    }

    #[test]
    fn long_string_value_is_rejected() {
        let mut set = LwwElementSet::new();
        let extras: Extras = [(
            "blob".to_string(),
            Scalar::Str("x".repeat(MAX_STRING_LENGTH + 1)),
        )]
        .into_iter()
        .collect();
        set.add("k", extras, 1.0);
        let bytes = codec().serialize(&set).unwrap();
        assert!(matches!(
            deserialize_lww(&bytes),
            Err(WireError::Validation(_))
        ));
    }

    #[test]
    fn too_many_metadata_keys_is_rejected() {
        let mut set = LwwElementSet::new();
        let extras: Extras = (0..=MAX_METADATA_KEYS)
            .map(|i| (format!("k{i}"), Scalar::Int(i as i64)))
            .collect();
        set.add("k", extras, 1.0);
        let bytes = codec().serialize(&set).unwrap();
        assert!(matches!(
            deserialize_lww(&bytes),
            Err(WireError::Validation(_))
        ));
    }

    #[test]
    fn metadata_at_the_limit_is_accepted() {
        let mut set = LwwElementSet::new();
        let extras: Extras = (0..MAX_METADATA_KEYS)
            .map(|i| (format!("k{i}"), Scalar::Int(i as i64)))
            .collect();
        set.add("k", extras, 1.0);
        let bytes = serialize_lww(&set).unwrap();
        assert!(deserialize_lww(&bytes).is_ok());
    }

    #[test]
    fn envelope_round_trip() {
        let envelope = Envelope::new("node-a", "node_register", vec![1, 2, 3]);
        let back = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(back, envelope);
    }
}
