//! Sphinx packet construction and the wire-level message model.

pub mod constants;
pub mod factory;
pub mod frame;
pub mod geometry;
pub mod packet;
pub mod sphinx;

use serde::{Deserialize, Serialize};

/// The four traffic families a packet can belong to on the wire.
///
/// The numeric ids are encapsulated in the final-hop frame; the names are
/// what the traffic log prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    Payload,
    Loop,
    Drop,
    LoopMix,
}

impl PacketType {
    /// Compact id carried inside the packet.
    pub fn id(self) -> u8 {
        match self {
            PacketType::Payload => 0,
            PacketType::Loop => 1,
            PacketType::Drop => 2,
            PacketType::LoopMix => 3,
        }
    }

    /// Decodes a compact id back into a packet type.
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(PacketType::Payload),
            1 => Some(PacketType::Loop),
            2 => Some(PacketType::Drop),
            3 => Some(PacketType::LoopMix),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PacketType::Payload => "PAYLOAD",
            PacketType::Loop => "LOOP",
            PacketType::Drop => "DROP",
            PacketType::LoopMix => "LOOP_MIX",
        }
    }
}

/// The namespace of the engine's sending workers.
///
/// A superset of [PacketType]: `Delay` re-emits a packet after its mix delay
/// elapsed, and the two challenge kinds exist only at the origin. On the
/// wire a challenge is reframed as a DROP carrying a unit mass label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendKind {
    Payload,
    Loop,
    Drop,
    LoopMix,
    Delay,
    Challenge(usize),
}

impl SendKind {
    /// The packet type synthesised when this worker finds no queued data.
    pub fn synthesised_type(self) -> PacketType {
        match self {
            SendKind::Payload | SendKind::Challenge(_) => PacketType::Drop,
            SendKind::Loop => PacketType::Loop,
            SendKind::Drop => PacketType::Drop,
            SendKind::LoopMix => PacketType::LoopMix,
            SendKind::Delay => unreachable!("DELAY events always carry a packet"),
        }
    }
}
