//! Deterministic division of a per-second volume across the live set.

use std::io::Cursor;

/// How many of `target_volume` requests node `node_index` should emit this
/// second.
///
/// Every node gets `target / count`; the `target % count` leftover units go
/// to the nodes in the rotated window starting at `offset % count`,
/// wrapping around.  The rotation keeps many small journeys (volume 1) from
/// all landing on node 0.
///
/// For any offset, the shares over all nodes sum to exactly
/// `target_volume`.
pub fn target_volume_per_node(
    node_index: usize,
    node_count: usize,
    target_volume: u64,
    offset: usize,
) -> u64 {
    if target_volume == 0 || node_count == 0 || node_index >= node_count {
        return 0;
    }

    let base = target_volume / node_count as u64;
    let remainder = (target_volume % node_count as u64) as usize;

    if remainder > 0 {
        let remainder_start = offset % node_count;
        let remainder_end = (remainder_start + remainder) % node_count;
        let gets_remainder = if remainder_end > remainder_start {
            node_index >= remainder_start && node_index < remainder_end
        } else {
            // the window wraps past the last node
            node_index >= remainder_start || node_index < remainder_end
        };
        if gets_remainder {
            return base + 1;
        }
    }

    base
}

/// The per-journey remainder rotation: a stable hash of the journey spec,
/// reduced mod the node count.  Every node computes the same offset for the
/// same spec, so the remainder window agrees cluster-wide.
pub fn journey_offset(spec: &str, node_count: usize) -> usize {
    if node_count == 0 {
        return 0;
    }
    let hash = murmur3::murmur3_x64_128(&mut Cursor::new(spec.as_bytes()), 0).unwrap_or(0);
    (hash as u64 % node_count as u64) as usize
}
