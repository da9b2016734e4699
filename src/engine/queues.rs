//! Per-sender payload queues and the end-to-end latency tracker.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::protocol::packet::Packet;

/// FIFO of encoded PAYLOAD splits per sender, engine-owned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayloadQueues {
    queues: BTreeMap<String, VecDeque<Packet>>,
}

impl PayloadQueues {
    pub fn push(&mut self, sender: &str, packet: Packet) {
        self.queues
            .entry(sender.to_string())
            .or_default()
            .push_back(packet);
    }

    pub fn pop(&mut self, sender: &str) -> Option<Packet> {
        let queue = self.queues.get_mut(sender)?;
        let packet = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(sender);
        }
        packet
    }

    pub fn has_packets(&self, sender: &str) -> bool {
        self.queues.contains_key(sender)
    }

    /// Senders with at least one queued split, in a stable order.
    pub fn active_senders(&self) -> impl Iterator<Item = &String> {
        self.queues.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

/// Per-message split countdown and first-send time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedMessage {
    pub remaining_splits: usize,
    pub first_send_time: f64,
}

/// Records when each PAYLOAD message first hit the wire and how many of its
/// splits are still in flight.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyTracker {
    messages: HashMap<String, TrackedMessage>,
}

impl LatencyTracker {
    pub fn contains(&self, msg_id: &str) -> bool {
        self.messages.contains_key(msg_id)
    }

    pub fn insert(&mut self, msg_id: &str, num_splits: usize, now: f64) {
        self.messages.insert(
            msg_id.to_string(),
            TrackedMessage {
                remaining_splits: num_splits,
                first_send_time: now,
            },
        );
    }

    /// Counts one delivered split down. Returns the end-to-end latency when
    /// the last split lands, removing the entry.
    pub fn complete_split(&mut self, msg_id: &str, now: f64) -> Option<f64> {
        let entry = self.messages.get_mut(msg_id)?;

        if entry.remaining_splits > 1 {
            entry.remaining_splits -= 1;
            return None;
        }

        let latency = now - entry.first_send_time;
        self.messages.remove(msg_id);
        Some(latency)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::{packet::NEUTRAL_DIST, PacketType};

    fn packet(msg_id: &str) -> Packet {
        Packet {
            bytes: vec![0u8; 8],
            next_node: "p000000".into(),
            of_type: PacketType::Payload,
            sender: "u000000".into(),
            msg_id: msg_id.into(),
            split: "00000".into(),
            num_splits: 1,
            expected_delay: 0.0,
            dist: NEUTRAL_DIST,
        }
    }

    #[test]
    fn queues_are_fifo_per_sender() {
        let mut queues = PayloadQueues::default();
        queues.push("u000000", packet("a"));
        queues.push("u000000", packet("b"));
        queues.push("u000001", packet("c"));

        assert_eq!(
            queues.active_senders().collect::<Vec<_>>(),
            vec!["u000000", "u000001"]
        );
        assert_eq!(queues.pop("u000000").unwrap().msg_id, "a");
        assert_eq!(queues.pop("u000000").unwrap().msg_id, "b");
        assert!(queues.pop("u000000").is_none());
        assert!(!queues.has_packets("u000000"));
        assert!(queues.has_packets("u000001"));
    }

    #[test]
    fn tracker_counts_every_split_exactly_once() {
        let mut tracker = LatencyTracker::default();
        tracker.insert("msg", 3, 1.0);

        assert_eq!(tracker.complete_split("msg", 2.0), None);
        assert_eq!(tracker.complete_split("msg", 3.0), None);
        assert_eq!(tracker.complete_split("msg", 4.5), Some(3.5));

        // The entry is gone once the message completed.
        assert!(!tracker.contains("msg"));
        assert_eq!(tracker.complete_split("msg", 5.0), None);
    }

    #[test]
    fn unknown_messages_are_ignored() {
        let mut tracker = LatencyTracker::default();
        assert_eq!(tracker.complete_split("ghost", 1.0), None);
    }
}
