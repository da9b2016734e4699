//! Mixnet topology: node identities, the PKI view and the user population.

use std::collections::{BTreeMap, BTreeSet};

use rand::Rng;
use sphinx_packet::crypto::PublicKey;

use crate::{
    error::SimError,
    node::Node,
    setup::{config::Config, trace::Mail},
    tools::util::SimRng,
};

/// Width of the numeric part of an entity id.
const ID_DIGITS: usize = 6;

/// Immutable PKI entry for one node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub port: u16,
    pub layer: usize,
    pub public_key: PublicKey,
}

/// The static view of the experiment: who exists, where they listen and who
/// terminates whose traffic. Read-only once constructed.
#[derive(Debug, Clone)]
pub struct Topology {
    /// Node id to its PKI entry, globally consistent.
    pub pki: BTreeMap<String, NodeInfo>,
    /// Node ids grouped by layer; index 0 holds the providers.
    pub per_layer: Vec<Vec<String>>,
    /// All node ids in a stable order, for uniform origin sampling.
    pub node_ids: Vec<String>,
    /// User id to the provider terminating its traffic. Contains every trace
    /// participant plus the synthetic senders and the two challengers.
    pub users: BTreeMap<String, String>,
    /// Sorted real senders from the trace.
    pub senders: Vec<String>,
    /// Synthetic senders padding the cohort up to `num_senders`.
    pub fake_senders: Vec<String>,
    /// Real and synthetic senders, the ALL_SIMULATION pool.
    pub sender_pool: Vec<String>,
    /// The two pseudonymous senders driving the ε estimator.
    pub challengers: [String; 2],
    /// Mix layers above the providers.
    pub layers: usize,
    /// Resolved sender-cohort target.
    pub num_senders: usize,
}

/// Formats a provider id.
pub fn provider_id(idx: usize) -> String {
    format!("p{idx:0ID_DIGITS$}")
}

/// Formats a mix id; mix numbering continues after the providers so node
/// numbers map to unique ports.
pub fn mix_id(layer: usize, idx: usize, nodes_per_layer: usize, num_providers: usize) -> String {
    format!(
        "m{:0ID_DIGITS$}",
        (layer - 1) * nodes_per_layer + idx + num_providers
    )
}

fn user_id(idx: u32) -> String {
    format!("u{idx:0ID_DIGITS$}")
}

/// Numeric part of an entity id.
pub fn numeric(id: &str) -> Option<u32> {
    if id.len() != ID_DIGITS + 1 {
        return None;
    }
    id[1..].parse().ok()
}

impl Topology {
    /// Builds the experiment topology, generating one keypair per node and
    /// assigning every user a provider uniformly at random.
    pub fn build(
        config: &Config,
        traces: &[Mail],
        rng: &mut SimRng,
    ) -> Result<(Self, Vec<Node>), SimError> {
        let mut user_ids = BTreeSet::new();
        let mut senders = BTreeSet::new();

        for mail in traces {
            user_ids.insert(mail.sender.clone());
            user_ids.insert(mail.receiver.clone());
            senders.insert(mail.sender.clone());
        }

        let senders: Vec<String> = senders.into_iter().collect();
        let num_senders = config.num_senders.unwrap_or(senders.len());

        // Synthetic participants take fresh ids after the highest real one.
        let mut next_user = user_ids
            .iter()
            .filter_map(|id| numeric(id))
            .max()
            .map_or(0, |max| max + 1);
        let mut fresh_user = |user_ids: &mut BTreeSet<String>| {
            let id = user_id(next_user);
            next_user += 1;
            user_ids.insert(id.clone());
            id
        };

        let fake_senders: Vec<String> = (senders.len()..num_senders)
            .map(|_| fresh_user(&mut user_ids))
            .collect();
        let challengers = [fresh_user(&mut user_ids), fresh_user(&mut user_ids)];

        if next_user > 10u32.pow(ID_DIGITS as u32) {
            return Err(SimError::Config("user id space exhausted".into()));
        }

        let mut users = BTreeMap::new();
        for id in &user_ids {
            let provider = provider_id(rng.gen_range(0..config.num_providers));
            users.insert(id.clone(), provider);
        }

        let mut nodes = Vec::new();
        for provider in 0..config.num_providers {
            nodes.push(Node::generate(provider_id(provider), 0, config.base_port));
        }
        for layer in 1..=config.layers {
            for idx in 0..config.nodes_per_layer {
                let id = mix_id(layer, idx, config.nodes_per_layer, config.num_providers);
                nodes.push(Node::generate(id, layer, config.base_port));
            }
        }

        let topology = Self::assemble(
            config,
            senders,
            users,
            fake_senders,
            challengers,
            num_senders,
            &nodes,
        );
        Ok((topology, nodes))
    }

    /// Assembles the read-only view from already-constructed parts; shared
    /// between a fresh build and a checkpoint restore.
    pub fn assemble(
        config: &Config,
        senders: Vec<String>,
        users: BTreeMap<String, String>,
        fake_senders: Vec<String>,
        challengers: [String; 2],
        num_senders: usize,
        nodes: &[Node],
    ) -> Self {
        let mut pki = BTreeMap::new();
        let mut per_layer = vec![Vec::new(); config.layers + 1];

        for node in nodes {
            pki.insert(
                node.id.clone(),
                NodeInfo {
                    port: node.port,
                    layer: node.layer,
                    public_key: node.public_key.clone(),
                },
            );
            per_layer[node.layer].push(node.id.clone());
        }

        let node_ids = pki.keys().cloned().collect();
        let sender_pool = senders
            .iter()
            .chain(fake_senders.iter())
            .cloned()
            .collect();

        Self {
            pki,
            per_layer,
            node_ids,
            users,
            senders,
            fake_senders,
            sender_pool,
            challengers,
            layers: config.layers,
            num_senders,
        }
    }

    /// The provider terminating a user's traffic.
    pub fn provider_of(&self, user: &str) -> Result<&str, SimError> {
        self.users
            .get(user)
            .map(String::as_str)
            .ok_or_else(|| SimError::State(format!("unknown user: {user}")))
    }

    /// UDP port of a node.
    pub fn port_of(&self, node: &str) -> Result<u16, SimError> {
        self.pki
            .get(node)
            .map(|info| info.port)
            .ok_or_else(|| SimError::State(format!("unknown node: {node}")))
    }

    /// Uniformly samples one node id from a layer.
    pub fn random_in_layer(&self, rng: &mut SimRng, layer: usize) -> &str {
        let members = &self.per_layer[layer];
        &members[rng.gen_range(0..members.len())]
    }

    /// Uniformly samples one node id from the whole PKI.
    pub fn random_node(&self, rng: &mut SimRng) -> &str {
        &self.node_ids[rng.gen_range(0..self.node_ids.len())]
    }
}

#[cfg(test)]
mod test {
    use rand::SeedableRng;

    use super::*;

    fn config() -> Config {
        toml::from_str(
            r#"
            log_file = "events.log"
            traces_file = "traces.json"
            layers = 2
            num_providers = 2
            nodes_per_layer = 3
            "#,
        )
        .unwrap()
    }

    fn traces() -> Vec<Mail> {
        vec![
            Mail {
                time: 0.0,
                size: 100,
                sender: "u000000".into(),
                receiver: "u000002".into(),
            },
            Mail {
                time: 1.0,
                size: 100,
                sender: "u000001".into(),
                receiver: "u000000".into(),
            },
        ]
    }

    #[test]
    fn id_formats() {
        assert_eq!(provider_id(1), "p000001");
        assert_eq!(mix_id(1, 0, 3, 2), "m000002");
        assert_eq!(mix_id(2, 2, 3, 2), "m000007");
        assert_eq!(numeric("m000042"), Some(42));
        assert_eq!(numeric("m42"), None);
    }

    #[test]
    fn builds_layered_pki() {
        let mut rng = SimRng::seed_from_u64(1);
        let (topology, nodes) = Topology::build(&config(), &traces(), &mut rng).unwrap();

        assert_eq!(nodes.len(), 2 + 2 * 3);
        assert_eq!(topology.per_layer[0], vec!["p000000", "p000001"]);
        assert_eq!(topology.per_layer[1].len(), 3);
        assert_eq!(topology.per_layer[2].len(), 3);

        // Ports follow node numbering from the base port.
        assert_eq!(topology.port_of("p000001").unwrap(), 49153);
        assert_eq!(topology.port_of("m000004").unwrap(), 49156);

        // Every trace participant has a provider assigned.
        for user in ["u000000", "u000001", "u000002"] {
            assert!(topology.provider_of(user).unwrap().starts_with('p'));
        }
    }

    #[test]
    fn synthetic_users_extend_the_population() {
        let mut config = config();
        config.num_senders = Some(5);

        let mut rng = SimRng::seed_from_u64(1);
        let (topology, _) = Topology::build(&config, &traces(), &mut rng).unwrap();

        // Two real senders, padded with three synthetic ones.
        assert_eq!(topology.senders.len(), 2);
        assert_eq!(topology.fake_senders.len(), 3);
        assert_eq!(topology.sender_pool.len(), 5);

        // Challengers come after the synthetic senders and are registered.
        assert_eq!(topology.challengers[0], "u000006");
        assert_eq!(topology.challengers[1], "u000007");
        for id in topology.fake_senders.iter().chain(topology.challengers.iter()) {
            assert!(topology.users.contains_key(id));
        }
    }

    #[test]
    fn deterministic_under_a_fixed_seed() {
        let mut first_rng = SimRng::seed_from_u64(7);
        let mut second_rng = SimRng::seed_from_u64(7);

        let (first, _) = Topology::build(&config(), &traces(), &mut first_rng).unwrap();
        let (second, _) = Topology::build(&config(), &traces(), &mut second_rng).unwrap();

        assert_eq!(first.users, second.users);
        assert_eq!(first.node_ids, second.node_ids);
    }
}
