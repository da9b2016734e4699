//! Checkpointing: freezing the engine mid-run and resuming it later.
//!
//! A checkpoint captures the payload queues, the latency tracker, the event
//! log, the metric state, the RNG frozen at its stream position and every
//! node's mutable counters. Secret keys go in as hex; Sphinx parameters and
//! the scheduling environment are rebuilt from the configuration on load.
//! The file is an opaque MessagePack blob that round-trips within this
//! implementation only.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs,
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{
    engine::{
        event::{EventId, EventLog},
        meter::RuntimeMeter,
        observer::Observer,
        queues::{LatencyTracker, PayloadQueues},
        Engine,
    },
    error::SimError,
    node::Node,
    protocol::sphinx::{self, ReplayTag},
    setup::{
        config::{Config, Lambdas},
        topology::Topology,
        trace,
    },
    tools::util::SimRng,
};

/// Frozen per-node mutable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub layer: usize,
    pub secret_key: String,
    pub tags: Vec<ReplayTag>,
    pub k_t: u64,
    pub l_t: u64,
    pub h_t: f64,
    pub n: u64,
    pub prob_sum: [f64; 3],
    pub sending_time: HashMap<String, (f64, f64)>,
    pub last_latency: f64,
    pub running_latency: f64,
}

/// Everything needed to resume a run at `end_time`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub config: Config,
    pub end_time: f64,
    pub next_event_id: EventId,
    /// The engine RNG frozen mid-stream, so a restored run draws exactly
    /// the values an uninterrupted run would have drawn.
    pub rng: SimRng,
    pub lambdas: Lambdas,
    /// The cohort size the lambdas were last calibrated to.
    pub cohort_size: usize,
    pub observer: Observer,
    pub queues: PayloadQueues,
    pub tracker: LatencyTracker,
    pub event_log: EventLog,
    pub nodes: Vec<NodeSnapshot>,
    pub users: BTreeMap<String, String>,
    pub fake_senders: Vec<String>,
    pub challengers: [String; 2],
}

/// Serialises the engine's state at the current simulation time.
pub fn save(engine: &Engine, path: &Path) -> Result<(), SimError> {
    let nodes = engine
        .nodes
        .values()
        .map(|node| NodeSnapshot {
            id: node.id.clone(),
            layer: node.layer,
            secret_key: sphinx::secret_to_hex(&node.secret_key),
            tags: node.tags().copied().collect(),
            k_t: node.k_t,
            l_t: node.l_t,
            h_t: node.h_t,
            n: node.n,
            prob_sum: node.prob_sum,
            sending_time: node
                .probes()
                .map(|(msg_id, entry)| (msg_id.clone(), *entry))
                .collect(),
            last_latency: node.last_latency,
            running_latency: node.running_latency,
        })
        .collect();

    let checkpoint = Checkpoint {
        config: engine.config.clone(),
        end_time: engine.clock,
        next_event_id: engine.next_event_id,
        rng: engine.rng.clone(),
        lambdas: engine.lambdas,
        cohort_size: engine.sampler.cohort_size(),
        observer: engine.observer.clone(),
        queues: engine.queues.clone(),
        tracker: engine.tracker.clone(),
        event_log: engine.event_log.clone(),
        nodes,
        users: engine.topology.users.clone(),
        fake_senders: engine.topology.fake_senders.clone(),
        challengers: engine.topology.challengers.clone(),
    };

    let bytes = rmp_serde::to_vec(&checkpoint)?;
    fs::write(path, bytes)?;
    Ok(())
}

/// Re-materialises an engine from a checkpoint file.
///
/// Per-node public keys are rebuilt from the stored secrets, the trace is
/// re-read from its configured path, pending events are re-enqueued at
/// their absolute due times and mails still waiting out the lag re-enter
/// through the payload wrapper.
pub fn load(path: &Path, meter: RuntimeMeter) -> Result<Engine, SimError> {
    let bytes = fs::read(path)?;
    let checkpoint: Checkpoint = rmp_serde::from_slice(&bytes)?;
    restore(checkpoint, meter)
}

pub fn restore(checkpoint: Checkpoint, meter: RuntimeMeter) -> Result<Engine, SimError> {
    let Checkpoint {
        config,
        end_time,
        next_event_id,
        rng,
        lambdas,
        cohort_size,
        observer,
        queues,
        tracker,
        event_log,
        nodes: snapshots,
        users,
        fake_senders,
        challengers,
    } = checkpoint;

    config.validate()?;
    let traces = trace::load_traces(&config.traces_file)?;

    let mut nodes = Vec::with_capacity(snapshots.len());
    for snapshot in snapshots {
        let (secret_key, public_key) = sphinx::keypair_from_hex(&snapshot.secret_key)?;
        let mut node = Node::new(
            snapshot.id,
            snapshot.layer,
            config.base_port,
            secret_key,
            public_key,
        );
        node.k_t = snapshot.k_t;
        node.l_t = snapshot.l_t;
        node.h_t = snapshot.h_t;
        node.n = snapshot.n;
        node.prob_sum = snapshot.prob_sum;
        node.last_latency = snapshot.last_latency;
        node.running_latency = snapshot.running_latency;
        node.restore_caches(snapshot.tags, snapshot.sending_time);
        nodes.push(node);
    }

    let senders: Vec<String> = traces
        .iter()
        .map(|mail| mail.sender.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let num_senders = config.num_senders.unwrap_or(senders.len());

    let topology = Topology::assemble(
        &config,
        senders,
        users,
        fake_senders,
        challengers,
        num_senders,
        &nodes,
    );

    Engine::assemble(
        config,
        traces,
        std::sync::Arc::new(topology),
        nodes,
        rng,
        meter,
        lambdas,
        queues,
        tracker,
        event_log,
        observer,
        next_event_id,
        Some(cohort_size),
        Some(end_time),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn node_snapshots_round_trip_through_messagepack() {
        let node = Node::generate("m000002".into(), 1, 49152);
        let snapshot = NodeSnapshot {
            id: node.id.clone(),
            layer: node.layer,
            secret_key: sphinx::secret_to_hex(&node.secret_key),
            tags: vec![[7u8; 32]],
            k_t: 3,
            l_t: 1,
            h_t: 0.5,
            n: 2,
            prob_sum: [0.25, 0.25, 1.5],
            sending_time: HashMap::from([("abc".to_string(), (1.0, 0.5))]),
            last_latency: 2.0,
            running_latency: 1.5,
        };

        let bytes = rmp_serde::to_vec(&snapshot).unwrap();
        let restored: NodeSnapshot = rmp_serde::from_slice(&bytes).unwrap();

        assert_eq!(restored.secret_key, snapshot.secret_key);
        assert_eq!(restored.tags, snapshot.tags);
        assert_eq!(restored.prob_sum, snapshot.prob_sum);
        assert_eq!(restored.sending_time["abc"], (1.0, 0.5));

        let (secret, _) = sphinx::keypair_from_hex(&restored.secret_key).unwrap();
        assert_eq!(sphinx::secret_to_hex(&secret), snapshot.secret_key);
    }
}
