//! The facade tying configuration, PKI, workers and the run loop together.

use std::path::Path;

use rand::SeedableRng;

use crate::{
    engine::{checkpoint, meter::RuntimeMeter, observer::Observer, Engine, Summary},
    error::SimError,
    setup::{config::Config, topology::Topology, trace},
    tools::util::SimRng,
};

/// One experiment: a topology of live node listeners plus the event loop
/// that drives traffic through them.
pub struct Simulator {
    engine: Engine,
}

impl Simulator {
    /// Builds a simulator from a TOML configuration file.
    pub fn from_config_file(path: &Path) -> Result<Self, SimError> {
        Self::new(Config::from_file(path)?)
    }

    pub fn new(config: Config) -> Result<Self, SimError> {
        Self::with_meter(config, RuntimeMeter::Wall)
    }

    /// Builds a simulator with an explicit runtime meter; tests use the
    /// zero meter so transcripts depend only on the RNG seed.
    pub fn with_meter(config: Config, meter: RuntimeMeter) -> Result<Self, SimError> {
        config.validate()?;
        let traces = trace::load_traces(&config.traces_file)?;

        let mut rng = match config.rng_seed {
            Some(seed) => SimRng::seed_from_u64(seed),
            None => SimRng::from_entropy(),
        };

        let (topology, nodes) = Topology::build(&config, &traces, &mut rng)?;
        let engine = Engine::new(config, traces, topology, nodes, rng, meter)?;
        Ok(Self { engine })
    }

    /// Runs to termination: the configured deadline, or full delivery of
    /// the trace when no deadline is set.
    pub fn run(&mut self) -> Result<Summary, SimError> {
        self.engine.run()
    }

    /// Serialises the engine state at the current simulation time.
    pub fn save(&self, path: &Path) -> Result<(), SimError> {
        checkpoint::save(&self.engine, path)
    }

    /// Re-materialises a simulator from a checkpoint file.
    pub fn load_simulation(path: &Path) -> Result<Self, SimError> {
        Self::load_with_meter(path, RuntimeMeter::Wall)
    }

    pub fn load_with_meter(path: &Path, meter: RuntimeMeter) -> Result<Self, SimError> {
        Ok(Self {
            engine: checkpoint::load(path, meter)?,
        })
    }

    /// Overrides the run deadline, e.g. to let a restored checkpoint run to
    /// full delivery.
    pub fn set_until(&mut self, until: Option<f64>) {
        self.engine.set_until(until);
    }

    pub fn observer(&self) -> &Observer {
        self.engine.observer()
    }

    pub fn summary(&self) -> Summary {
        self.engine.summary()
    }

    pub fn clock(&self) -> f64 {
        self.engine.clock()
    }

    /// Stops the node listeners without waiting for termination.
    pub fn shutdown(&mut self) {
        self.engine.shutdown();
    }
}
