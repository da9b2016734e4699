//! Derivation of the fixed Sphinx packet dimensions.
//!
//! The simulator sizes its UDP buffers from the mixnet shape rather than
//! from the packets it actually produces, so listeners keep working even
//! when the cryptographic layer pads differently.

use serde::{Deserialize, Serialize};

use crate::protocol::constants;

/// Packet dimensions derived from `(body_size, layers)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    /// Plaintext capacity of a single packet in bytes.
    pub body_size: usize,
    /// Number of mix layers above the providers.
    pub layers: usize,
    /// Sphinx header length.
    pub header_len: usize,
    /// Sphinx body length, the plaintext capacity plus the per-packet overhead.
    pub body_len: usize,
    /// Slack added on top of `header_len + body_len` when sizing receive buffers.
    pub add_buffer: usize,
}

impl Geometry {
    pub fn derive(body_size: usize, layers: usize) -> Self {
        let add_body = if body_size < 65536 { 72 } else { 74 };

        let mut add_buffer = if body_size < 65536 { 36 } else { 40 };
        if layers > 1 && layers < 5 {
            add_buffer += 1;
        } else if layers == 5 {
            add_buffer += 2;
        } else if layers > 5 {
            add_buffer += 3;
        }

        Self {
            body_size,
            layers,
            header_len: 40 * layers + 77,
            body_len: body_size + add_body,
            add_buffer,
        }
    }

    /// Size of the receive buffer handed to every node listener.
    pub fn datagram_size(&self) -> usize {
        self.header_len + self.body_len + self.add_buffer
    }

    /// Number of splits a message of `size` bytes occupies.
    pub fn num_splits(&self, size: usize) -> usize {
        size.div_ceil(self.body_size).max(1)
    }

    /// Plaintext size of the given split of a message of `size` bytes.
    ///
    /// All splits but the last are exactly `body_size`; the last carries the
    /// remainder.
    pub fn split_size(&self, size: usize, split: usize) -> usize {
        let num_splits = self.num_splits(size);
        if split + 1 < num_splits {
            self.body_size
        } else {
            size - self.body_size * (num_splits - 1)
        }
    }

    /// Formats a split index as its 5-digit wire id.
    pub fn split_id(split: usize) -> String {
        format!("{:0width$}", split, width = constants::SPLIT_LEN)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn small_body_dimensions() {
        let geometry = Geometry::derive(5436, 2);

        assert_eq!(geometry.header_len, 157);
        assert_eq!(geometry.body_len, 5436 + 72);
        assert_eq!(geometry.add_buffer, 37);
        assert_eq!(geometry.datagram_size(), 157 + 5508 + 37);
    }

    #[test]
    fn large_body_dimensions() {
        let geometry = Geometry::derive(70000, 6);

        assert_eq!(geometry.body_len, 70000 + 74);
        assert_eq!(geometry.add_buffer, 43);
    }

    #[test]
    fn buffer_slack_tracks_layer_count() {
        assert_eq!(Geometry::derive(1024, 0).add_buffer, 36);
        assert_eq!(Geometry::derive(1024, 1).add_buffer, 36);
        assert_eq!(Geometry::derive(1024, 2).add_buffer, 37);
        assert_eq!(Geometry::derive(1024, 4).add_buffer, 37);
        assert_eq!(Geometry::derive(1024, 5).add_buffer, 38);
        assert_eq!(Geometry::derive(1024, 7).add_buffer, 39);
    }

    #[test]
    fn splits_cover_the_message() {
        let geometry = Geometry::derive(100, 2);

        assert_eq!(geometry.num_splits(100), 1);
        assert_eq!(geometry.num_splits(101), 2);
        assert_eq!(geometry.num_splits(250), 3);

        assert_eq!(geometry.split_size(250, 0), 100);
        assert_eq!(geometry.split_size(250, 1), 100);
        assert_eq!(geometry.split_size(250, 2), 50);

        let total: usize = (0..geometry.num_splits(250))
            .map(|split| geometry.split_size(250, split))
            .sum();
        assert_eq!(total, 250);
    }

    #[test]
    fn split_ids_are_zero_padded() {
        assert_eq!(Geometry::split_id(0), "00000");
        assert_eq!(Geometry::split_id(42), "00042");
    }
}
