//! End-to-end simulation scenarios.

mod replay;

use std::{
    fs,
    sync::atomic::{AtomicU16, Ordering},
};

use tempfile::TempDir;

use crate::setup::{config::Config, trace::Mail};

/// Each scenario gets its own slice of the port space, so parallel tests
/// never contend for a listener socket.
static NEXT_BASE_PORT: AtomicU16 = AtomicU16::new(57000);

pub(crate) fn reserve_ports() -> u16 {
    NEXT_BASE_PORT.fetch_add(64, Ordering::SeqCst)
}

pub(crate) fn mail(time: f64, size: usize, sender: &str, receiver: &str) -> Mail {
    Mail {
        time,
        size,
        sender: sender.into(),
        receiver: receiver.into(),
    }
}

/// Writes the trace into the scenario directory and returns a small,
/// seeded configuration pointing at it: one mix layer, two providers,
/// no lag and the ε warm-up disabled.
pub(crate) fn scenario_config(dir: &TempDir, mails: &[Mail]) -> Config {
    let traces_file = dir.path().join("traces.json");
    fs::write(&traces_file, serde_json::to_string(mails).unwrap()).unwrap();

    let mut config: Config = toml::from_str(
        r#"
        log_file = "events.log"
        traces_file = "traces.json"
        "#,
    )
    .unwrap();

    config.log_file = dir.path().join("events.log");
    config.traces_file = traces_file;
    config.lag = 0.0;
    config.e2e_lag = 0.0;
    config.layers = 1;
    config.num_providers = 2;
    config.nodes_per_layer = 1;
    config.body_size = 512;
    config.base_port = reserve_ports();
    config.time_unit = 5.0;
    config.rng_seed = Some(1);
    config
}
