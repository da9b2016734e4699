//! Per-node simulation state.
//!
//! A node owns its keypair and replay cache and exposes a pure
//! `process_packet`; every mutable counter on it is driven by the engine.
//! The matching UDP listener lives in [crate::tools::transport] and carries
//! no state of its own.

use std::collections::{HashMap, HashSet};

use sphinx_packet::{
    crypto::{PrivateKey, PublicKey},
    ProcessedPacket,
};

use crate::{
    error::SimError,
    protocol::{
        frame::{self, FrameError},
        sphinx::{self, ReplayTag, SphinxError},
        PacketType,
    },
    setup::topology,
};

/// Weight of a fresh observation in the loop-mix latency average.
const LATENCY_EWMA_WEIGHT: f64 = 0.1;

/// Outcome of processing one ciphertext at a node.
#[derive(Debug)]
pub enum Processed {
    /// The packet unwraps to another hop: hold it for `delay`, then forward
    /// the re-packed ciphertext to `next_node`.
    Relay {
        delay: f64,
        next_node: String,
        bytes: Vec<u8>,
    },
    /// The packet terminated here.
    Dest {
        destination: String,
        msg_id: String,
        split: String,
        of_type: PacketType,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The packet's tag was seen before at this node.
    #[error("REPLAY ATTACK")]
    Replay,
    #[error(transparent)]
    Sphinx(#[from] SphinxError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// One provider or mix relay.
pub struct Node {
    pub id: String,
    pub layer: usize,
    pub port: u16,
    pub secret_key: PrivateKey,
    pub public_key: PublicKey,
    /// Replay-detection tags observed so far; monotone-growing.
    tag_cache: HashSet<ReplayTag>,
    /// Packets accepted since the last entropy update.
    pub k_t: u64,
    /// Residual anonymity-set size from previous rounds.
    pub l_t: u64,
    /// Running anonymity-set entropy.
    pub h_t: f64,
    /// Packets currently pooled for the mass estimator.
    pub n: u64,
    /// Aggregate mass label over the pooled packets.
    pub prob_sum: [f64; 3],
    /// In-flight loop-mix probes: msg id to (send time, expected delay).
    sending_time: HashMap<String, (f64, f64)>,
    /// Round-trip time of the last returned probe.
    pub last_latency: f64,
    /// Exponentially weighted probe round-trip average.
    pub running_latency: f64,
}

impl Node {
    pub fn new(
        id: String,
        layer: usize,
        base_port: u16,
        secret_key: PrivateKey,
        public_key: PublicKey,
    ) -> Self {
        let number = topology::numeric(&id).unwrap_or_default();
        Self {
            port: base_port + number as u16,
            id,
            layer,
            secret_key,
            public_key,
            tag_cache: HashSet::new(),
            k_t: 0,
            l_t: 0,
            h_t: 0.0,
            n: 0,
            prob_sum: [0.0; 3],
            sending_time: HashMap::new(),
            last_latency: 0.0,
            running_latency: 0.0,
        }
    }

    /// Creates a node with a freshly generated keypair.
    pub fn generate(id: String, layer: usize, base_port: u16) -> Self {
        let (secret_key, public_key) = sphinx::keygen();
        Self::new(id, layer, base_port, secret_key, public_key)
    }

    /// Unwraps one layer of a ciphertext.
    ///
    /// Pure with respect to the simulation: only the replay cache mutates.
    pub fn process_packet(&mut self, bytes: &[u8]) -> Result<Processed, ProcessError> {
        let packet = sphinx::unpack(bytes)?;
        let tag = sphinx::replay_tag(&packet);

        let processed = packet
            .process(&self.secret_key)
            .map_err(|e| SphinxError::Process(e.to_string()))?;

        if !self.tag_cache.insert(tag) {
            return Err(ProcessError::Replay);
        }

        match processed {
            ProcessedPacket::ForwardHop(next_packet, address, delay) => Ok(Processed::Relay {
                delay: sphinx::delay_to_secs(&delay),
                next_node: frame::node_id(&address)?,
                bytes: next_packet.to_bytes(),
            }),
            ProcessedPacket::FinalHop(_, _, payload) => {
                let plaintext = payload
                    .recover_plaintext()
                    .map_err(|e| SphinxError::Process(e.to_string()))?;
                let recovered = frame::parse(&plaintext)?;

                Ok(Processed::Dest {
                    destination: recovered.destination,
                    msg_id: recovered.msg_id,
                    split: recovered.split,
                    of_type: recovered.of_type,
                })
            }
        }
    }

    /// Folds the packets accepted since the last update into the running
    /// anonymity-set entropy and returns the new value.
    pub fn update_entropy(&mut self) -> f64 {
        let k = self.k_t as f64;
        let l = self.l_t as f64;
        let denominator = k + l;

        if denominator == 0.0 {
            return self.h_t;
        }

        self.h_t = l * self.h_t / denominator;
        if self.k_t != 0 {
            self.h_t += k * k.log2() / denominator;
            self.h_t -= k / denominator * (k / denominator).log2();
        }
        if self.l_t != 0 {
            self.h_t -= l / denominator * (l / denominator).log2();
        }

        self.l_t = self.l_t + self.k_t - 1;
        self.k_t = 0;

        self.h_t
    }

    /// Records an emitted loop-mix probe in the sending ledger.
    pub fn record_probe(&mut self, msg_id: String, now: f64, expected_delay: f64) {
        self.sending_time.insert(msg_id, (now, expected_delay));
    }

    /// Closes a returned loop-mix probe: updates the latency estimate and
    /// removes the ledger entry.
    ///
    /// A probe returning faster than the delays baked into its own header
    /// means the clock or the scheduler is corrupted, which is fatal.
    pub fn complete_probe(&mut self, now: f64, msg_id: &str) -> Result<f64, SimError> {
        let (start, expected_delay) = self.sending_time.remove(msg_id).ok_or_else(|| {
            SimError::State(format!("loop-mix probe {msg_id} unknown at {}", self.id))
        })?;

        let latency = now - start;
        // Tolerate accumulated floating-point rounding across the hops.
        if latency + 1e-9 < expected_delay {
            return Err(SimError::LatencyAssertion {
                node: self.id.clone(),
                msg_id: msg_id.to_string(),
                latency,
                expected: expected_delay,
            });
        }

        self.last_latency = latency;
        self.running_latency =
            LATENCY_EWMA_WEIGHT * latency + (1.0 - LATENCY_EWMA_WEIGHT) * self.running_latency;
        Ok(latency)
    }

    /// Whether a probe with this id is currently in flight from here.
    pub fn probe_in_flight(&self, msg_id: &str) -> bool {
        self.sending_time.contains_key(msg_id)
    }

    pub fn tag_cache_len(&self) -> usize {
        self.tag_cache.len()
    }

    /// Snapshot of the replay cache, for checkpointing.
    pub fn tags(&self) -> impl Iterator<Item = &ReplayTag> {
        self.tag_cache.iter()
    }

    /// Snapshot of the probe ledger, for checkpointing.
    pub fn probes(&self) -> impl Iterator<Item = (&String, &(f64, f64))> {
        self.sending_time.iter()
    }

    /// Restores replay cache and probe ledger from a checkpoint.
    pub fn restore_caches(
        &mut self,
        tags: impl IntoIterator<Item = ReplayTag>,
        probes: impl IntoIterator<Item = (String, (f64, f64))>,
    ) {
        self.tag_cache = tags.into_iter().collect();
        self.sending_time = probes.into_iter().collect();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn node() -> Node {
        Node::generate("m000002".into(), 1, 49152)
    }

    #[test]
    fn ports_follow_node_numbering() {
        assert_eq!(node().port, 49154);
        assert_eq!(Node::generate("p000000".into(), 0, 50000).port, 50000);
    }

    #[test]
    fn entropy_stays_within_the_arrival_bound() {
        let mut node = node();
        let mut accepted = 0u64;

        for _ in 0..100 {
            node.k_t += 2;
            accepted += 2;

            let h_t = node.update_entropy();
            assert!(h_t >= 0.0);
            assert!(h_t <= (accepted as f64).log2() + 1e-9);
            assert_eq!(node.k_t, 0);
        }
    }

    #[test]
    fn lone_packets_carry_no_entropy() {
        let mut node = node();

        for _ in 0..5 {
            node.k_t += 1;
            assert_eq!(node.update_entropy(), 0.0);
            assert_eq!(node.l_t, 0);
        }
    }

    #[test]
    fn entropy_update_without_arrivals_is_a_no_op() {
        let mut node = node();
        assert_eq!(node.update_entropy(), 0.0);
        assert_eq!(node.l_t, 0);
    }

    #[test]
    fn batched_arrivals_raise_entropy() {
        let mut node = node();
        node.k_t = 8;

        let h_t = node.update_entropy();
        assert!(h_t > 0.0);
        assert!(h_t <= 3.0 + 1e-9);
        assert_eq!(node.l_t, 7);
    }

    #[test]
    fn probe_ledger_round_trip() {
        let mut node = node();
        node.record_probe("abc".into(), 10.0, 2.5);
        assert!(node.probe_in_flight("abc"));

        let latency = node.complete_probe(14.0, "abc").unwrap();
        assert_eq!(latency, 4.0);
        assert_eq!(node.last_latency, 4.0);
        assert!((node.running_latency - 0.4).abs() < 1e-12);
        assert!(!node.probe_in_flight("abc"));
    }

    #[test]
    fn early_probe_return_is_fatal() {
        let mut node = node();
        node.record_probe("abc".into(), 10.0, 5.0);

        let result = node.complete_probe(12.0, "abc");
        assert!(matches!(
            result,
            Err(SimError::LatencyAssertion { latency, .. }) if latency == 2.0
        ));
    }
}
