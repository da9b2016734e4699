//! The engine-side record of an encapsulated message.

use serde::{Deserialize, Serialize};

use crate::protocol::PacketType;

/// Mass label attached to a packet that is not part of a challenge stream.
pub const NEUTRAL_DIST: [f64; 3] = [0.0, 0.0, 1.0];

/// A Sphinx-encapsulated message together with the simulation metadata that
/// travels alongside it inside the engine.
///
/// The ciphertext in `bytes` is opaque; everything else mirrors what the
/// routing material will reveal hop by hop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    /// Packed Sphinx ciphertext as it goes onto the wire.
    pub bytes: Vec<u8>,
    /// Node the ciphertext is addressed to next.
    pub next_node: String,
    /// Traffic family of the encapsulated message.
    pub of_type: PacketType,
    /// Entity the packet last left: the originating user or node, or the
    /// relay that re-emitted it.
    pub sender: String,
    /// Message id shared by all splits of one message.
    pub msg_id: String,
    /// 5-digit split id.
    pub split: String,
    /// Total number of splits of the message.
    pub num_splits: usize,
    /// Sum of the per-hop delays sampled at construction.
    pub expected_delay: f64,
    /// Probability-mass label used by the ε estimator. Challenge packets
    /// start with a unit basis vector; everything else is neutral mass.
    pub dist: [f64; 3],
}

impl Packet {
    /// Unit basis label for challenge stream `k`.
    pub fn challenge_dist(k: usize) -> [f64; 3] {
        let mut dist = [0.0; 3];
        dist[k] = 1.0;
        dist
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn challenge_dist_is_a_unit_basis_vector() {
        assert_eq!(Packet::challenge_dist(0), [1.0, 0.0, 0.0]);
        assert_eq!(Packet::challenge_dist(1), [0.0, 1.0, 0.0]);
    }
}
