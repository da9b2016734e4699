//! Thin adapter over the external Sphinx implementation.
//!
//! Header construction, per-hop processing and forward-message reception all
//! belong to the `sphinx-packet` crate; this module only fixes the payload
//! capacity, converts between simulation seconds and header delays, derives
//! replay tags and moves secret keys in and out of their hex form. Routing
//! material stays opaque throughout.

use data_encoding::HEXLOWER;
use sha2::{Digest, Sha256};
use sphinx_packet::{
    crypto::{PrivateKey, PublicKey, PRIVATE_KEY_SIZE},
    header::delays::Delay,
    payload::PAYLOAD_OVERHEAD_SIZE,
    route::{Destination, Node as RouteNode},
    SphinxPacket, SphinxPacketBuilder,
};

pub use sphinx_packet::constants::MAX_PATH_LENGTH;
pub use sphinx_packet::crypto::keygen;

use crate::protocol::{frame, geometry::Geometry};

/// Replay-detection token derived from a packet header.
pub type ReplayTag = [u8; 32];

const NANOS_PER_SEC: f64 = 1e9;

#[derive(Debug, thiserror::Error)]
pub enum SphinxError {
    #[error("sphinx construction failed: {0}")]
    Construction(String),
    #[error("sphinx packet could not be decoded: {0}")]
    Decode(String),
    #[error("sphinx processing failed: {0}")]
    Process(String),
    #[error("bad secret key encoding")]
    BadSecretKey,
}

/// Encapsulates a framed plaintext for the given route.
///
/// Every packet is padded to the same capacity regardless of how much of the
/// body the message actually uses, so ciphertexts are indistinguishable.
pub fn encapsulate(
    geometry: &Geometry,
    route: &[RouteNode],
    destination: &Destination,
    delays: &[Delay],
    plaintext: &[u8],
) -> Result<Vec<u8>, SphinxError> {
    let capacity = frame::HEADER_LEN + geometry.body_size + PAYLOAD_OVERHEAD_SIZE;

    let packet = SphinxPacketBuilder::new()
        .with_payload_size(capacity)
        .build_packet(plaintext, route, destination, delays)
        .map_err(|e| SphinxError::Construction(e.to_string()))?;

    Ok(packet.to_bytes())
}

/// Decodes packed bytes back into a Sphinx packet.
pub fn unpack(bytes: &[u8]) -> Result<SphinxPacket, SphinxError> {
    SphinxPacket::from_bytes(bytes).map_err(|e| SphinxError::Decode(e.to_string()))
}

/// Replay tag of a packet: a digest of the group element every processing
/// node consumes. Two observations of the same ciphertext at one node yield
/// the same tag; an honest re-wrap yields a fresh one.
pub fn replay_tag(packet: &SphinxPacket) -> ReplayTag {
    Sha256::digest(packet.header.shared_secret.as_bytes()).into()
}

/// Converts a sampled simulation delay into a header delay element.
pub fn delay_from_secs(secs: f64) -> Delay {
    Delay::new_from_nanos((secs * NANOS_PER_SEC) as u64)
}

/// Converts a header delay element back into simulation seconds.
pub fn delay_to_secs(delay: &Delay) -> f64 {
    delay.to_nanos() as f64 / NANOS_PER_SEC
}

/// Serialises a node secret to hex for checkpointing.
pub fn secret_to_hex(key: &PrivateKey) -> String {
    HEXLOWER.encode(&key.to_bytes())
}

/// Rebuilds a node keypair from its checkpointed hex secret.
pub fn keypair_from_hex(hex: &str) -> Result<(PrivateKey, PublicKey), SphinxError> {
    let decoded = HEXLOWER
        .decode(hex.as_bytes())
        .map_err(|_| SphinxError::BadSecretKey)?;
    let bytes: [u8; PRIVATE_KEY_SIZE] = decoded
        .try_into()
        .map_err(|_| SphinxError::BadSecretKey)?;

    let secret = PrivateKey::from(bytes);
    let public = PublicKey::from(&secret);
    Ok((secret, public))
}
