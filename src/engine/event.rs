//! Scheduled events and the checkpointable mirror of the in-flight set.
//!
//! The heap only orders `(due_time, insertion_seq)` pairs; every event's
//! arguments live in exactly one slot of the [EventLog] from the moment it
//! is scheduled until the moment it fires. The log therefore IS the
//! serialisable scheduler state: a checkpoint dumps it, a restore replays
//! it. Trace mails waiting for their lag are the one exception; they are
//! re-derived from the trace on restore instead of being mirrored.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    protocol::{packet::Packet, PacketType, SendKind},
    setup::trace::Mail,
};

pub type EventId = u64;

/// A packet emission: fresh traffic from a worker or a DELAY departure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendPacketEvent {
    pub kind: SendKind,
    pub data: Option<Packet>,
    /// The node a DELAY departure happens at.
    pub node: Option<String>,
}

/// Arrival of an emitted packet at its next hop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessPacketEvent {
    pub kind: SendKind,
    pub data: Packet,
}

/// Bookkeeping after a packet terminated at its destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostprocessEvent {
    pub msg_id: String,
    pub of_type: PacketType,
    pub node: String,
}

/// The next tick of one of the four decoy workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoyEvent {
    pub kind: SendKind,
}

/// Encapsulation of one split of a trace mail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadToSphinxEvent {
    pub mail: Mail,
    pub msg_id: Option<String>,
    pub start_split: usize,
}

/// Hand-over of an encoded split to its sender's payload queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutOnPayloadQueueEvent {
    pub sender: String,
    pub packet: Packet,
}

/// Which queue a heap entry belongs to.
#[derive(Debug, Clone)]
pub enum EventSlot {
    /// A trace mail waiting out the lag; heap-only by design.
    PayloadWrapper(Mail),
    /// A challenge worker tick; its due time lives in the challenge array.
    Challenge(usize),
    PayloadToSphinx,
    PutOnPayloadQueue,
    Decoy,
    SendPacket,
    ProcessPacket,
    Postprocess,
}

/// Heap entry: events fire in `(due, seq)` order, so simultaneous events
/// run first-scheduled-first.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub due: f64,
    pub seq: u64,
    pub id: EventId,
    pub slot: EventSlot,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due
            .total_cmp(&other.due)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Mirror of every in-flight future event, keyed by opaque event id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventLog {
    pub postprocess: HashMap<EventId, (f64, PostprocessEvent)>,
    pub send_packet: HashMap<EventId, (f64, SendPacketEvent)>,
    pub decoy_wrapper: HashMap<EventId, (f64, DecoyEvent)>,
    pub process_packet: HashMap<EventId, (f64, ProcessPacketEvent)>,
    pub payload_to_sphinx: HashMap<EventId, (f64, PayloadToSphinxEvent)>,
    pub put_on_payload_queue: HashMap<EventId, (f64, PutOnPayloadQueueEvent)>,
    /// Next due time of the two challenge workers.
    pub challenge_worker: [f64; 2],
}

impl EventLog {
    /// Number of mirrored events, challenge ticks excluded.
    pub fn len(&self) -> usize {
        self.postprocess.len()
            + self.send_packet.len()
            + self.decoy_wrapper.len()
            + self.process_packet.len()
            + self.payload_to_sphinx.len()
            + self.put_on_payload_queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use std::{cmp::Reverse, collections::BinaryHeap};

    use super::*;

    fn event(due: f64, seq: u64) -> ScheduledEvent {
        ScheduledEvent {
            due,
            seq,
            id: seq,
            slot: EventSlot::Decoy,
        }
    }

    #[test]
    fn heap_pops_by_due_time() {
        let mut heap = BinaryHeap::new();
        heap.push(Reverse(event(2.0, 0)));
        heap.push(Reverse(event(0.5, 1)));
        heap.push(Reverse(event(1.0, 2)));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|Reverse(e)| e.seq)).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn simultaneous_events_fire_in_insertion_order() {
        let mut heap = BinaryHeap::new();
        for seq in 0..10 {
            heap.push(Reverse(event(1.0, seq)));
        }

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|Reverse(e)| e.seq)).collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }
}
