//! Crate-wide error type.

use crate::protocol::sphinx::SphinxError;

/// Errors surfaced by the simulator.
///
/// Only configuration errors and the loop-mix latency assertion terminate a
/// run; transport and decode failures are absorbed where they occur.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("couldn't parse the trace file: {0}")]
    Trace(#[from] serde_json::Error),
    #[error("couldn't parse the config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Sphinx(#[from] SphinxError),
    #[error("couldn't encode the checkpoint: {0}")]
    CheckpointEncode(#[from] rmp_serde::encode::Error),
    #[error("couldn't decode the checkpoint: {0}")]
    CheckpointDecode(#[from] rmp_serde::decode::Error),
    #[error(
        "loop-mix probe {msg_id} returned to {node} after {latency:.7}s, \
         faster than its expected delay of {expected:.7}s"
    )]
    LatencyAssertion {
        node: String,
        msg_id: String,
        latency: f64,
        expected: f64,
    },
    #[error("inconsistent simulation state: {0}")]
    State(String),
}
