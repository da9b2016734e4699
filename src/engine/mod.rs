//! The discrete-event core driving the experiment.
//!
//! A single cooperative loop owns every piece of mutable state: the nodes'
//! counters, the payload queues, the latency tracker, the event log and the
//! RNG. Callbacks run one at a time in `(due_time, insertion)` order; the
//! UDP listeners are the only other threads and they carry no simulation
//! state. Each callback charges its measured wall runtime to the simulation
//! clock before any follow-up event it schedules becomes due.

pub mod checkpoint;
pub mod event;
pub mod meter;
pub mod observer;
pub mod queues;
pub mod sampler;

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap},
    sync::Arc,
};

use tracing::{debug, warn};

use crate::{
    engine::{
        event::{
            DecoyEvent, EventId, EventLog, EventSlot, PayloadToSphinxEvent, PostprocessEvent,
            ProcessPacketEvent, PutOnPayloadQueueEvent, ScheduledEvent, SendPacketEvent,
        },
        meter::RuntimeMeter,
        observer::Observer,
        queues::{LatencyTracker, PayloadQueues},
        sampler::SenderSampler,
    },
    error::SimError,
    node::{Node, ProcessError, Processed},
    protocol::{
        constants::FIRST_SPLIT, factory::PacketFactory, geometry::Geometry, packet::Packet,
        PacketType, SendKind,
    },
    setup::{
        config::{Config, Lambdas},
        topology::Topology,
        trace::Mail,
    },
    tools::{
        logging::TrafficLog,
        transport::SocketTransport,
        util::{self, SimRng},
    },
};

/// Terminal state of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub delivered: usize,
    pub total_mails: usize,
    pub mean_latency: f64,
    pub mean_entropy: f64,
    pub epsilon: f64,
    pub end_time: f64,
}

pub struct Engine {
    pub(crate) config: Config,
    pub(crate) topology: Arc<Topology>,
    factory: PacketFactory,
    sampler: SenderSampler,
    transport: SocketTransport,
    traffic_log: TrafficLog,
    meter: RuntimeMeter,
    rng: SimRng,

    pub(crate) nodes: BTreeMap<String, Node>,
    pub(crate) queues: PayloadQueues,
    pub(crate) tracker: LatencyTracker,
    pub(crate) event_log: EventLog,
    pub(crate) observer: Observer,
    pub(crate) lambdas: Lambdas,
    pub(crate) traces: Vec<Mail>,

    pub(crate) clock: f64,
    seq: u64,
    pub(crate) next_event_id: EventId,
    heap: BinaryHeap<Reverse<ScheduledEvent>>,
    total_mails: usize,
    terminated: bool,
    started: bool,
}

impl Engine {
    /// Wires a fresh engine over an already-built topology.
    pub fn new(
        config: Config,
        traces: Vec<Mail>,
        topology: Topology,
        nodes: Vec<Node>,
        rng: SimRng,
        meter: RuntimeMeter,
    ) -> Result<Self, SimError> {
        let topology = Arc::new(topology);
        let lambdas = Lambdas::calibrated(
            &config.lambdas,
            topology.num_senders,
            topology.pki.len(),
        );

        Self::assemble(
            config,
            traces,
            topology,
            nodes,
            rng,
            meter,
            lambdas,
            PayloadQueues::default(),
            LatencyTracker::default(),
            EventLog::default(),
            Observer::default(),
            0,
            None,
            None,
        )
    }

    /// Shared assembly path for fresh engines and checkpoint restores. When
    /// `end_time` is set the engine resumes: the clock starts there, the
    /// mirrored events are re-enqueued and the initial workers are not
    /// started again.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        config: Config,
        traces: Vec<Mail>,
        topology: Arc<Topology>,
        nodes: Vec<Node>,
        rng: SimRng,
        meter: RuntimeMeter,
        lambdas: Lambdas,
        queues: PayloadQueues,
        tracker: LatencyTracker,
        event_log: EventLog,
        observer: Observer,
        next_event_id: EventId,
        cohort_size: Option<usize>,
        end_time: Option<f64>,
    ) -> Result<Self, SimError> {
        let geometry = Geometry::derive(config.body_size, config.layers);
        let factory = PacketFactory::new(Arc::clone(&topology), geometry);
        let mut sampler = SenderSampler::new(
            Arc::clone(&topology),
            config.client_model,
            &traces,
            config.start_time,
            config.lag,
        );
        if let Some(cohort_size) = cohort_size {
            sampler.set_cohort_size(cohort_size);
        }

        let ports = topology.pki.values().map(|info| info.port).collect();
        let transport = SocketTransport::start(ports, geometry.datagram_size())?;
        let traffic_log = TrafficLog::create(&config.log_file)?;

        let total_mails = traces.len();
        let restored = end_time.is_some();

        let mut engine = Self {
            clock: end_time.unwrap_or(config.start_time),
            nodes: nodes.into_iter().map(|node| (node.id.clone(), node)).collect(),
            config,
            topology,
            factory,
            sampler,
            transport,
            traffic_log,
            meter,
            rng,
            queues,
            tracker,
            event_log,
            observer,
            lambdas,
            traces,
            seq: 0,
            next_event_id,
            heap: BinaryHeap::new(),
            total_mails,
            terminated: false,
            started: restored,
        };

        if let Some(end_time) = end_time {
            engine.replay_pending_events(end_time);
        }
        Ok(engine)
    }

    /// Runs until the deadline, or until every trace mail delivered when no
    /// deadline is configured.
    pub fn run(&mut self) -> Result<Summary, SimError> {
        if !self.started {
            self.started = true;
            self.start_workers();
        }

        let deadline = self.config.until.map(|until| self.config.start_time + until);
        if self.config.until.is_none() && self.observer.completed() >= self.total_mails {
            self.terminated = true;
        }

        while !self.terminated {
            let Some(Reverse(event)) = self.heap.pop() else {
                break;
            };

            if let Some(deadline) = deadline {
                if event.due > deadline {
                    // Keep the event mirrored for a later checkpoint.
                    self.heap.push(Reverse(event));
                    self.clock = self.clock.max(deadline);
                    break;
                }
            }

            // A callback's charged runtime can outrun the next due time; the
            // clock never moves backwards.
            self.clock = self.clock.max(event.due);
            self.dispatch(event)?;
        }

        if self.terminated || deadline.is_none() {
            self.shutdown();
        }
        self.traffic_log.flush();
        Ok(self.summary())
    }

    pub fn summary(&self) -> Summary {
        Summary {
            delivered: self.observer.completed(),
            total_mails: self.total_mails,
            mean_latency: self.observer.mean_latency,
            mean_entropy: self.observer.mean_entropy,
            epsilon: self.observer.epsilon,
            end_time: self.clock,
        }
    }

    pub fn observer(&self) -> &Observer {
        &self.observer
    }

    pub fn clock(&self) -> f64 {
        self.clock
    }

    /// Overrides the run deadline.
    pub fn set_until(&mut self, until: Option<f64>) {
        self.config.until = until;
    }

    /// Sends every listener its sentinel and joins them.
    pub fn shutdown(&mut self) {
        self.transport.terminate();
    }

    // ---- scheduling -----------------------------------------------------

    fn next_id(&mut self) -> EventId {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    fn push_heap(&mut self, due: f64, id: EventId, slot: EventSlot) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Reverse(ScheduledEvent { due, seq, id, slot }));
    }

    fn schedule_send(&mut self, due: f64, event: SendPacketEvent) {
        let id = self.next_id();
        self.event_log.send_packet.insert(id, (due, event));
        self.push_heap(due, id, EventSlot::SendPacket);
    }

    fn schedule_process(&mut self, due: f64, event: ProcessPacketEvent) {
        let id = self.next_id();
        self.event_log.process_packet.insert(id, (due, event));
        self.push_heap(due, id, EventSlot::ProcessPacket);
    }

    fn schedule_postprocess(&mut self, due: f64, event: PostprocessEvent) {
        let id = self.next_id();
        self.event_log.postprocess.insert(id, (due, event));
        self.push_heap(due, id, EventSlot::Postprocess);
    }

    fn schedule_decoy(&mut self, due: f64, event: DecoyEvent) {
        let id = self.next_id();
        self.event_log.decoy_wrapper.insert(id, (due, event));
        self.push_heap(due, id, EventSlot::Decoy);
    }

    fn schedule_payload_to_sphinx(&mut self, due: f64, event: PayloadToSphinxEvent) {
        let id = self.next_id();
        self.event_log.payload_to_sphinx.insert(id, (due, event));
        self.push_heap(due, id, EventSlot::PayloadToSphinx);
    }

    fn schedule_put_on_queue(&mut self, due: f64, event: PutOnPayloadQueueEvent) {
        let id = self.next_id();
        self.event_log.put_on_payload_queue.insert(id, (due, event));
        self.push_heap(due, id, EventSlot::PutOnPayloadQueue);
    }

    fn schedule_challenge(&mut self, challenger: usize, due: f64) {
        let id = self.next_id();
        self.event_log.challenge_worker[challenger] = due;
        self.push_heap(due, id, EventSlot::Challenge(challenger));
    }

    fn schedule_payload_wrapper(&mut self, mail: Mail, due: f64) {
        let id = self.next_id();
        self.push_heap(due, id, EventSlot::PayloadWrapper(mail));
    }

    /// Enqueues the trace and kicks off the decoy and challenge workers.
    fn start_workers(&mut self) {
        for mail in self.traces.clone() {
            let due = self.config.start_time + mail.time + self.config.lag;
            self.schedule_payload_wrapper(mail, due);
        }

        for kind in [SendKind::Loop, SendKind::Drop, SendKind::Payload] {
            if !self.sampler.has_senders() {
                break;
            }
            let mean = self.decoy_mean(kind);
            let delay = util::sample_exp(&mut self.rng, mean);
            self.schedule_decoy(self.clock + delay, DecoyEvent { kind });
        }
        let delay = util::sample_exp(&mut self.rng, self.lambdas.loop_mix);
        self.schedule_decoy(self.clock + delay, DecoyEvent { kind: SendKind::LoopMix });

        for challenger in 0..2 {
            self.schedule_challenge(challenger, self.clock + self.config.time_unit);
        }
    }

    /// Re-enqueues every mirrored event of a restored checkpoint at its
    /// absolute due time, and the trace mails still waiting out the lag.
    fn replay_pending_events(&mut self, end_time: f64) {
        // Events whose due time has already passed fire right away.
        const CLAMP: f64 = 1e-6;
        let clamp = |due: f64| due.max(end_time + CLAMP);

        let mut pending: Vec<(f64, EventId, EventSlot)> = Vec::new();
        for (&id, (due, _)) in &self.event_log.payload_to_sphinx {
            pending.push((clamp(*due), id, EventSlot::PayloadToSphinx));
        }
        for (&id, (due, _)) in &self.event_log.put_on_payload_queue {
            pending.push((clamp(*due), id, EventSlot::PutOnPayloadQueue));
        }
        for (&id, (due, _)) in &self.event_log.decoy_wrapper {
            pending.push((clamp(*due), id, EventSlot::Decoy));
        }
        for (&id, (due, _)) in &self.event_log.send_packet {
            pending.push((clamp(*due), id, EventSlot::SendPacket));
        }
        for (&id, (due, _)) in &self.event_log.process_packet {
            pending.push((clamp(*due), id, EventSlot::ProcessPacket));
        }
        for (&id, (due, _)) in &self.event_log.postprocess {
            pending.push((clamp(*due), id, EventSlot::Postprocess));
        }

        // Event ids grow in scheduling order, which reproduces the original
        // FIFO tie-break for simultaneous events.
        pending.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        for (due, id, slot) in pending {
            self.push_heap(due, id, slot);
        }

        for challenger in 0..2 {
            let due = clamp(self.event_log.challenge_worker[challenger]);
            let id = self.next_id();
            self.event_log.challenge_worker[challenger] = due;
            self.push_heap(due, id, EventSlot::Challenge(challenger));
        }

        let horizon = end_time - self.config.start_time - self.config.lag;
        for mail in self.traces.clone() {
            if mail.time > horizon {
                let due = self.config.start_time + mail.time + self.config.lag;
                self.schedule_payload_wrapper(mail, due);
            }
        }
    }

    // ---- callbacks ------------------------------------------------------

    fn dispatch(&mut self, event: ScheduledEvent) -> Result<(), SimError> {
        let ScheduledEvent { id, slot, .. } = event;
        let missing =
            |name: &str| SimError::State(format!("event {id} missing from the {name} log"));

        match slot {
            EventSlot::PayloadWrapper(mail) => self.handle_payload_to_sphinx(PayloadToSphinxEvent {
                mail,
                msg_id: None,
                start_split: 0,
            }),
            EventSlot::Challenge(challenger) => self.handle_challenge(challenger),
            EventSlot::PayloadToSphinx => {
                let (_, event) = self
                    .event_log
                    .payload_to_sphinx
                    .remove(&id)
                    .ok_or_else(|| missing("payload_to_sphinx"))?;
                self.handle_payload_to_sphinx(event)
            }
            EventSlot::PutOnPayloadQueue => {
                let (_, event) = self
                    .event_log
                    .put_on_payload_queue
                    .remove(&id)
                    .ok_or_else(|| missing("put_on_payload_queue"))?;
                self.handle_put_on_queue(event);
                Ok(())
            }
            EventSlot::Decoy => {
                let (_, event) = self
                    .event_log
                    .decoy_wrapper
                    .remove(&id)
                    .ok_or_else(|| missing("decoy_wrapper"))?;
                self.handle_decoy(event)
            }
            EventSlot::SendPacket => {
                let (_, event) = self
                    .event_log
                    .send_packet
                    .remove(&id)
                    .ok_or_else(|| missing("send_packet"))?;
                self.handle_send(event)
            }
            EventSlot::ProcessPacket => {
                let (_, event) = self
                    .event_log
                    .process_packet
                    .remove(&id)
                    .ok_or_else(|| missing("process_packet"))?;
                self.handle_process(event)
            }
            EventSlot::Postprocess => {
                let (_, event) = self
                    .event_log
                    .postprocess
                    .remove(&id)
                    .ok_or_else(|| missing("postprocess"))?;
                self.handle_postprocess(event)
            }
        }
    }

    /// Encapsulates one split of a trace mail, then hands it to the
    /// sender's payload queue once the encapsulation runtime elapsed.
    fn handle_payload_to_sphinx(&mut self, event: PayloadToSphinxEvent) -> Result<(), SimError> {
        let watch = self.meter.start();
        let PayloadToSphinxEvent {
            mail,
            msg_id,
            start_split,
        } = event;

        let msg_id = msg_id.unwrap_or_else(|| util::gen_msg_id(&mut self.rng));
        let geometry = *self.factory.geometry();
        let num_splits = geometry.num_splits(mail.size);
        let split_size = geometry.split_size(mail.size, start_split);
        let split = Geometry::split_id(start_split);

        let packet = self.factory.gen_packet(
            &mut self.rng,
            self.lambdas.delay,
            &mail.sender,
            &msg_id,
            PacketType::Payload,
            split_size,
            &split,
            num_splits,
            Some(&mail.receiver),
        )?;

        let runtime = watch.elapsed();
        let due = self.clock + runtime;
        self.schedule_put_on_queue(
            due,
            PutOnPayloadQueueEvent {
                sender: mail.sender.clone(),
                packet,
            },
        );

        if start_split + 1 < num_splits {
            self.schedule_payload_to_sphinx(
                due,
                PayloadToSphinxEvent {
                    mail,
                    msg_id: Some(msg_id),
                    start_split: start_split + 1,
                },
            );
        }

        self.clock += runtime;
        Ok(())
    }

    fn handle_put_on_queue(&mut self, event: PutOnPayloadQueueEvent) {
        let watch = self.meter.start();
        self.queues.push(&event.sender, event.packet);
        self.clock += watch.elapsed();
    }

    /// One decoy tick: emit, then sample the next holding time.
    fn handle_decoy(&mut self, event: DecoyEvent) -> Result<(), SimError> {
        let kind = event.kind;
        self.handle_send(SendPacketEvent {
            kind,
            data: None,
            node: None,
        })?;

        let mean = self.decoy_mean(kind);
        let delay = util::sample_exp(&mut self.rng, mean);
        self.schedule_decoy(self.clock + delay, DecoyEvent { kind });
        Ok(())
    }

    fn handle_challenge(&mut self, challenger: usize) -> Result<(), SimError> {
        self.handle_send(SendPacketEvent {
            kind: SendKind::Challenge(challenger),
            data: None,
            node: None,
        })?;

        self.schedule_challenge(challenger, self.clock + self.config.time_unit);
        Ok(())
    }

    fn decoy_mean(&self, kind: SendKind) -> f64 {
        match kind {
            SendKind::Loop => self.lambdas.loop_,
            SendKind::Drop => self.lambdas.drop,
            SendKind::Payload => self.lambdas.payload,
            SendKind::LoopMix => self.lambdas.loop_mix,
            SendKind::Delay | SendKind::Challenge(_) => {
                unreachable!("no Poisson process drives {kind:?}")
            }
        }
    }

    /// Emits one packet: resolves the sender, dequeues or synthesises the
    /// data, settles the mass accounting for DELAY departures and puts the
    /// ciphertext on the wire.
    fn handle_send(&mut self, event: SendPacketEvent) -> Result<(), SimError> {
        let watch = self.meter.start();
        let SendPacketEvent {
            kind,
            mut data,
            node,
        } = event;

        let sender = match kind {
            SendKind::Delay => {
                data.as_ref()
                    .ok_or_else(|| SimError::State("DELAY event without a packet".into()))?
                    .sender
                    .clone()
            }
            SendKind::LoopMix => self.topology.random_node(&mut self.rng).to_string(),
            SendKind::Challenge(challenger) => self.topology.challengers[challenger].clone(),
            _ => self
                .sampler
                .sample(&mut self.rng, self.clock, &self.queues, &mut self.lambdas),
        };

        if kind == SendKind::Payload && data.is_none() {
            data = self.queues.pop(&sender);
        }

        let mut data = match data {
            Some(packet) => packet,
            None => {
                let of_type = kind.synthesised_type();
                let msg_id = util::gen_msg_id(&mut self.rng);
                let mut packet = self.factory.gen_packet(
                    &mut self.rng,
                    self.lambdas.delay,
                    &sender,
                    &msg_id,
                    of_type,
                    self.factory.geometry().body_size,
                    FIRST_SPLIT,
                    1,
                    None,
                )?;
                if let SendKind::Challenge(challenger) = kind {
                    packet.dist = Packet::challenge_dist(challenger);
                }
                packet
            }
        };

        if kind == SendKind::LoopMix {
            let clock = self.clock;
            let origin = self.node_mut(&sender)?;
            origin.record_probe(data.msg_id.clone(), clock, data.expected_delay);
        }

        if kind == SendKind::Delay && data.of_type != PacketType::LoopMix {
            let at = node.ok_or_else(|| SimError::State("DELAY event without a node".into()))?;
            let top_layer = self.topology.layers;
            let epsilon_warm =
                self.clock >= self.config.start_time + self.config.e2e_lag;

            let relay = self.nodes.get_mut(&at).ok_or_else(|| {
                SimError::State(format!("DELAY fired at an unknown node: {at}"))
            })?;
            if relay.n == 0 {
                return Err(SimError::State(format!(
                    "mass pool underflow at {at}: DELAY fired with no pooled packets"
                )));
            }

            let mut dist = [0.0; 3];
            for (slot, sum) in dist.iter_mut().zip(relay.prob_sum) {
                *slot = sum / relay.n as f64;
            }
            data.dist = dist;
            relay.n -= 1;
            for (sum, share) in relay.prob_sum.iter_mut().zip(dist) {
                *sum = share * relay.n as f64;
            }

            if dist[0] > 0.0 && dist[1] > 0.0 && relay.layer == top_layer && epsilon_warm {
                let sample = (dist[0] / dist[1]).log2().abs();
                self.observer.update_epsilon(sample);
            }
        }

        let port = self.topology.port_of(&data.next_node)?;
        self.transport.send(&data.bytes, port);
        self.traffic_log.record(
            self.clock,
            &data.sender,
            &data.next_node,
            &data.msg_id,
            &data.split,
            data.of_type.as_str(),
        );

        let runtime = watch.elapsed();
        self.schedule_process(self.clock + runtime, ProcessPacketEvent { kind, data });
        self.clock += runtime;
        Ok(())
    }

    /// Delivers an emitted packet to its next hop: entropy accounting for
    /// the hop it left, then cryptographic processing at the receiver.
    fn handle_process(&mut self, event: ProcessPacketEvent) -> Result<(), SimError> {
        let watch = self.meter.start();
        let ProcessPacketEvent { kind, data } = event;

        if kind == SendKind::Payload
            && data.of_type == PacketType::Payload
            && !self.tracker.contains(&data.msg_id)
        {
            self.tracker.insert(&data.msg_id, data.num_splits, self.clock);
        }

        if kind == SendKind::Delay || (kind == SendKind::LoopMix && self.config.loop_mix_entropy) {
            let departed = self.node_mut(&data.sender)?;
            if kind == SendKind::LoopMix {
                departed.l_t += 1;
            }
            departed.update_entropy();

            let mean = self.mean_entropy();
            self.observer.record_entropy(mean);
            debug!(mean_entropy = mean, "entropy updated at {}", data.sender);
        }

        let receiver = data.next_node.clone();
        let outcome = self.node_mut(&receiver)?.process_packet(&data.bytes);

        match outcome {
            Err(ProcessError::Replay) => {
                warn!("REPLAY ATTACK");
            }
            Err(error) => {
                debug!("dropped an unprocessable packet at {receiver}: {error}");
            }
            Ok(Processed::Relay {
                delay,
                next_node,
                bytes,
            }) => {
                let relay = self.node_mut(&receiver)?;
                relay.k_t += 1;
                if data.of_type != PacketType::LoopMix {
                    relay.n += 1;
                    for (sum, share) in relay.prob_sum.iter_mut().zip(data.dist) {
                        *sum += share;
                    }
                }

                let packet = Packet {
                    bytes,
                    next_node,
                    of_type: data.of_type,
                    sender: receiver.clone(),
                    msg_id: data.msg_id,
                    split: data.split,
                    num_splits: data.num_splits,
                    expected_delay: data.expected_delay,
                    dist: data.dist,
                };

                let runtime = watch.elapsed();
                self.schedule_send(
                    self.clock + runtime + delay,
                    SendPacketEvent {
                        kind: SendKind::Delay,
                        data: Some(packet),
                        node: Some(receiver),
                    },
                );
                self.clock += runtime;
                return Ok(());
            }
            Ok(Processed::Dest {
                destination,
                msg_id,
                split,
                of_type,
            }) => {
                let runtime = watch.elapsed();
                self.traffic_log.record(
                    self.clock + runtime,
                    &receiver,
                    &destination,
                    &msg_id,
                    &split,
                    of_type.as_str(),
                );
                self.schedule_postprocess(
                    self.clock + runtime,
                    PostprocessEvent {
                        msg_id,
                        of_type,
                        node: receiver,
                    },
                );
                self.clock += runtime;
                return Ok(());
            }
        }

        self.clock += watch.elapsed();
        Ok(())
    }

    /// Terminal bookkeeping for a delivered packet.
    fn handle_postprocess(&mut self, event: PostprocessEvent) -> Result<(), SimError> {
        let watch = self.meter.start();

        match event.of_type {
            PacketType::Payload => {
                if let Some(latency) = self.tracker.complete_split(&event.msg_id, self.clock) {
                    self.observer.record_latency(latency);
                    if self.config.until.is_none()
                        && self.observer.completed() >= self.total_mails
                    {
                        self.terminated = true;
                    }
                }
            }
            PacketType::LoopMix => {
                let now = self.clock;
                self.node_mut(&event.node)?.complete_probe(now, &event.msg_id)?;
            }
            PacketType::Loop | PacketType::Drop => {}
        }

        self.clock += watch.elapsed();
        Ok(())
    }

    // ---- helpers --------------------------------------------------------

    fn node_mut(&mut self, id: &str) -> Result<&mut Node, SimError> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| SimError::State(format!("unknown node: {id}")))
    }

    fn mean_entropy(&self) -> f64 {
        let sum: f64 = self.nodes.values().map(|node| node.h_t).sum();
        sum / self.nodes.len() as f64
    }
}
