use std::{collections::BTreeMap, sync::Arc};

use rand::SeedableRng;

use crate::{
    node::{Node, ProcessError, Processed},
    protocol::{
        constants::FIRST_SPLIT, factory::PacketFactory, geometry::Geometry, PacketType,
    },
    setup::{config::Config, topology::Topology},
    tests::mail,
    tools::util::{gen_msg_id, SimRng},
};

fn network() -> (PacketFactory, BTreeMap<String, Node>, SimRng) {
    let config: Config = toml::from_str(
        r#"
        log_file = "events.log"
        traces_file = "traces.json"
        layers = 1
        num_providers = 2
        nodes_per_layer = 1
        body_size = 256
        "#,
    )
    .unwrap();
    let traces = vec![mail(0.0, 64, "u000000", "u000001")];

    let mut rng = SimRng::seed_from_u64(11);
    let (topology, nodes) = Topology::build(&config, &traces, &mut rng).unwrap();
    let factory = PacketFactory::new(
        Arc::new(topology),
        Geometry::derive(config.body_size, config.layers),
    );
    let nodes = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
    (factory, nodes, rng)
}

#[test]
fn a_repeated_ciphertext_is_dropped() {
    let (factory, mut nodes, mut rng) = network();

    let msg_id = gen_msg_id(&mut rng);
    let packet = factory
        .gen_packet(
            &mut rng,
            0.1,
            "u000000",
            &msg_id,
            PacketType::Drop,
            64,
            FIRST_SPLIT,
            1,
            None,
        )
        .unwrap();

    let entry = nodes.get_mut(&packet.next_node).unwrap();

    // First sight: a fresh tag, processed into a relay.
    let first = entry.process_packet(&packet.bytes);
    assert!(matches!(first, Ok(Processed::Relay { .. })));
    assert_eq!(entry.tag_cache_len(), 1);

    // Second sight of the identical ciphertext: replay, dropped, and no
    // state moves.
    let second = entry.process_packet(&packet.bytes);
    assert!(matches!(second, Err(ProcessError::Replay)));
    assert_eq!(entry.tag_cache_len(), 1);
    assert_eq!(entry.k_t, 0);
    assert_eq!(entry.n, 0);
}

#[test]
fn distinct_packets_grow_the_tag_cache() {
    let (factory, mut nodes, mut rng) = network();

    // LOOP packets from one sender always enter at the same provider.
    for expected_tags in 1..=3 {
        let msg_id = gen_msg_id(&mut rng);
        let packet = factory
            .gen_packet(
                &mut rng,
                0.1,
                "u000000",
                &msg_id,
                PacketType::Loop,
                64,
                FIRST_SPLIT,
                1,
                None,
            )
            .unwrap();

        let entry = nodes.get_mut(&packet.next_node).unwrap();
        assert!(entry.process_packet(&packet.bytes).is_ok());
        assert_eq!(entry.tag_cache_len(), expected_tags);
    }
}
