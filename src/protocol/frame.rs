//! Framing of the metadata that rides inside a Sphinx packet.
//!
//! Relay hops only ever see the opaque routing material emitted by the
//! Sphinx library; the simulator's own metadata (final destination, message
//! id, split id and traffic type) is prepended to the plaintext and
//! recovered at the exit hop. Node identifiers are additionally packed into
//! the fixed-width address slots the library routes on.

use sphinx_packet::{
    constants::NODE_ADDRESS_LENGTH,
    route::{DestinationAddressBytes, NodeAddressBytes},
};

use crate::protocol::{
    constants::{ID_LEN, MSG_ID_LEN, SPLIT_LEN},
    PacketType,
};

/// Length of the metadata frame in front of the plaintext.
pub const HEADER_LEN: usize = ID_LEN + MSG_ID_LEN + SPLIT_LEN + 1;

/// Metadata recovered from an exit-hop plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub destination: String,
    pub msg_id: String,
    pub split: String,
    pub of_type: PacketType,
}

/// Errors produced while decoding addresses or exit-hop frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("plaintext shorter than the metadata frame: {0} bytes")]
    Truncated(usize),
    #[error("frame field is not valid ASCII")]
    BadEncoding,
    #[error("unknown traffic type id: {0}")]
    BadTypeId(u8),
}

/// Prepends the metadata frame to a message plaintext.
pub fn encode(
    destination: &str,
    msg_id: &str,
    split: &str,
    of_type: PacketType,
    message: &[u8],
) -> Vec<u8> {
    debug_assert_eq!(destination.len(), ID_LEN);
    debug_assert_eq!(msg_id.len(), MSG_ID_LEN);
    debug_assert_eq!(split.len(), SPLIT_LEN);

    let mut plaintext = Vec::with_capacity(HEADER_LEN + message.len());
    plaintext.extend_from_slice(destination.as_bytes());
    plaintext.extend_from_slice(msg_id.as_bytes());
    plaintext.extend_from_slice(split.as_bytes());
    plaintext.push(of_type.id());
    plaintext.extend_from_slice(message);
    plaintext
}

/// Recovers the metadata frame from an exit-hop plaintext.
pub fn parse(plaintext: &[u8]) -> Result<Frame, FrameError> {
    if plaintext.len() < HEADER_LEN {
        return Err(FrameError::Truncated(plaintext.len()));
    }

    let (destination, rest) = plaintext.split_at(ID_LEN);
    let (msg_id, rest) = rest.split_at(MSG_ID_LEN);
    let (split, rest) = rest.split_at(SPLIT_LEN);
    let type_id = rest[0];

    let field = |bytes: &[u8]| -> Result<String, FrameError> {
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| FrameError::BadEncoding)
    };

    Ok(Frame {
        destination: field(destination)?,
        msg_id: field(msg_id)?,
        split: field(split)?,
        of_type: PacketType::from_id(type_id).ok_or(FrameError::BadTypeId(type_id))?,
    })
}

/// Packs a node id into the fixed-width relay address slot.
pub fn node_address(id: &str) -> NodeAddressBytes {
    let mut bytes = [0u8; NODE_ADDRESS_LENGTH];
    bytes[..id.len()].copy_from_slice(id.as_bytes());
    NodeAddressBytes::from_bytes(bytes)
}

/// Recovers a node id from a relay address slot.
pub fn node_id(address: &NodeAddressBytes) -> Result<String, FrameError> {
    let bytes = address.as_bytes();
    std::str::from_utf8(&bytes[..ID_LEN])
        .map(str::to_owned)
        .map_err(|_| FrameError::BadEncoding)
}

/// Packs an entity id into the destination address slot.
pub fn destination_address(id: &str) -> DestinationAddressBytes {
    let mut bytes = [0u8; NODE_ADDRESS_LENGTH];
    bytes[..id.len()].copy_from_slice(id.as_bytes());
    DestinationAddressBytes::from_bytes(bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    const MSG_ID: &str = "0123456789abcdef01234567";

    #[test]
    fn frame_round_trip() {
        let plaintext = encode("u000042", MSG_ID, "00003", PacketType::Payload, b"hello");
        let frame = parse(&plaintext).unwrap();

        assert_eq!(frame.destination, "u000042");
        assert_eq!(frame.msg_id, MSG_ID);
        assert_eq!(frame.split, "00003");
        assert_eq!(frame.of_type, PacketType::Payload);
        assert_eq!(&plaintext[HEADER_LEN..], b"hello");
    }

    #[test]
    fn short_plaintext_is_rejected() {
        assert!(matches!(parse(b"u00004"), Err(FrameError::Truncated(6))));
    }

    #[test]
    fn unknown_type_id_is_rejected() {
        let mut plaintext = encode("p000000", MSG_ID, "00000", PacketType::Drop, b"");
        plaintext[HEADER_LEN - 1] = 9;
        assert!(matches!(parse(&plaintext), Err(FrameError::BadTypeId(9))));
    }

    #[test]
    fn node_address_round_trip() {
        let address = node_address("m000007");
        assert_eq!(node_id(&address).unwrap(), "m000007");
    }
}
