//! A factory for creating Sphinx-encapsulated simulation packets.

use std::sync::Arc;

use sphinx_packet::route::{Destination, Node as RouteNode, SURBIdentifier};

use crate::{
    error::SimError,
    protocol::{
        frame, geometry::Geometry, packet::Packet, packet::NEUTRAL_DIST, sphinx, PacketType,
    },
    setup::topology::Topology,
    tools::util::{self, SimRng},
};

/// Builds wire-ready packets: samples a layered path for the requested
/// traffic type, assigns per-hop delays and hands the framed plaintext to
/// the Sphinx layer.
#[derive(Clone)]
pub struct PacketFactory {
    topology: Arc<Topology>,
    geometry: Geometry,
}

impl PacketFactory {
    pub fn new(topology: Arc<Topology>, geometry: Geometry) -> Self {
        Self { topology, geometry }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Samples the route for one packet and resolves its destination id.
    ///
    /// Loop-mix probes climb from the origin's layer to the top, wrap
    /// through the layers below and return to the origin. All other types
    /// run provider to provider with one mix per layer in between.
    fn sample_path(
        &self,
        rng: &mut SimRng,
        sender: &str,
        of_type: PacketType,
        receiver: Option<&str>,
    ) -> Result<(Vec<String>, String), SimError> {
        let topology = &self.topology;
        let num_layers = topology.per_layer.len();

        if of_type == PacketType::LoopMix {
            let origin_layer = topology
                .pki
                .get(sender)
                .ok_or_else(|| SimError::State(format!("unknown loop-mix origin: {sender}")))?
                .layer;

            let mut path = Vec::with_capacity(num_layers);
            for layer in origin_layer + 1..num_layers {
                path.push(topology.random_in_layer(rng, layer).to_string());
            }
            for layer in 0..origin_layer {
                path.push(topology.random_in_layer(rng, layer).to_string());
            }
            path.push(sender.to_string());

            return Ok((path, sender.to_string()));
        }

        let sender_provider = topology.provider_of(sender)?.to_string();
        let mut mixes = Vec::with_capacity(num_layers - 1);
        for layer in 1..num_layers {
            mixes.push(topology.random_in_layer(rng, layer).to_string());
        }

        let (terminal, destination) = match of_type {
            PacketType::Payload => {
                let receiver = receiver.ok_or_else(|| {
                    SimError::State("payload packet without a receiver".into())
                })?;
                (topology.provider_of(receiver)?.to_string(), receiver.to_string())
            }
            PacketType::Drop => {
                let provider = topology.random_in_layer(rng, 0).to_string();
                (provider.clone(), provider)
            }
            PacketType::Loop => (sender_provider.clone(), sender.to_string()),
            PacketType::LoopMix => unreachable!("handled above"),
        };

        let mut path = Vec::with_capacity(mixes.len() + 2);
        path.push(sender_provider);
        path.extend(mixes);
        path.push(terminal);

        Ok((path, destination))
    }

    /// Constructs one Sphinx packet of the given type and plaintext size.
    #[allow(clippy::too_many_arguments)]
    pub fn gen_packet(
        &self,
        rng: &mut SimRng,
        delay_mean: f64,
        sender: &str,
        msg_id: &str,
        of_type: PacketType,
        size: usize,
        split: &str,
        num_splits: usize,
        receiver: Option<&str>,
    ) -> Result<Packet, SimError> {
        let (path, destination) = self.sample_path(rng, sender, of_type, receiver)?;

        let mut route = Vec::with_capacity(path.len());
        for id in &path {
            let info = self
                .topology
                .pki
                .get(id)
                .ok_or_else(|| SimError::State(format!("node missing from PKI: {id}")))?;
            route.push(RouteNode::new(frame::node_address(id), info.public_key.clone()));
        }

        // The first hop forwards immediately; every later hop holds the
        // packet for an exponential delay. The expectation sums the delays
        // as the header quantises them, so observed round trips can never
        // undercut it.
        let mut expected_delay = 0.0;
        let mut delays = Vec::with_capacity(path.len());
        for hop in 0..path.len() {
            let sampled = if hop == 0 {
                0.0
            } else {
                util::sample_exp(rng, delay_mean)
            };
            let delay = sphinx::delay_from_secs(sampled);
            expected_delay += sphinx::delay_to_secs(&delay);
            delays.push(delay);
        }

        let mut identifier: SURBIdentifier = Default::default();
        let identifier_len = identifier.len();
        identifier.copy_from_slice(&msg_id.as_bytes()[..identifier_len]);
        let sphinx_destination =
            Destination::new(frame::destination_address(&destination), identifier);

        let message = util::random_plaintext(rng, size);
        let plaintext = frame::encode(&destination, msg_id, split, of_type, &message);
        let bytes = sphinx::encapsulate(
            &self.geometry,
            &route,
            &sphinx_destination,
            &delays,
            &plaintext,
        )?;

        Ok(Packet {
            bytes,
            next_node: path[0].clone(),
            of_type,
            sender: sender.to_string(),
            msg_id: msg_id.to_string(),
            split: split.to_string(),
            num_splits,
            expected_delay,
            dist: NEUTRAL_DIST,
        })
    }
}
