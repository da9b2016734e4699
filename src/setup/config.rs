//! Simulation configuration loading and validation.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::SimError,
    protocol::{constants::DEFAULT_LAMBDA, sphinx::MAX_PATH_LENGTH},
};

const LAMBDA_KEYS: [&str; 5] = ["DROP", "LOOP", "PAYLOAD", "DELAY", "LOOP_MIX"];

/// Client model used to pick the sender of fresh traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientModel {
    #[serde(rename = "ALL_SIMULATION")]
    AllSimulation,
    #[serde(rename = "TIME_PROXIMITY")]
    TimeProximity,
    #[serde(rename = "UNIFORM_PROVIDER")]
    UniformProvider,
}

/// Convenience struct for reading the simulator's TOML configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Sink for the per-event traffic log.
    pub log_file: PathBuf,
    /// Mail trace driving PAYLOAD traffic.
    pub traces_file: PathBuf,
    /// Simulation-time offset before any PAYLOAD is generated.
    #[serde(default = "defaults::lag")]
    pub lag: f64,
    /// Warm-up before the ε estimator starts updating.
    #[serde(default = "defaults::e2e_lag")]
    pub e2e_lag: f64,
    /// Mix layers above the providers.
    #[serde(default = "defaults::layers")]
    pub layers: usize,
    #[serde(default = "defaults::num_providers")]
    pub num_providers: usize,
    #[serde(default = "defaults::nodes_per_layer")]
    pub nodes_per_layer: usize,
    /// Plaintext capacity of a single Sphinx packet in bytes.
    #[serde(default = "defaults::body_size")]
    pub body_size: usize,
    /// UDP port of node number zero.
    #[serde(default = "defaults::base_port")]
    pub base_port: u16,
    /// Cadence of the two challenge workers.
    #[serde(default = "defaults::time_unit")]
    pub time_unit: f64,
    /// Initial simulation clock.
    #[serde(default)]
    pub start_time: f64,
    /// Whether LOOP_MIX probes count towards mix entropy.
    #[serde(default)]
    pub loop_mix_entropy: bool,
    /// Poisson means, keyed DROP / LOOP / PAYLOAD / DELAY / LOOP_MIX.
    #[serde(default)]
    pub lambdas: HashMap<String, f64>,
    /// Seed for the engine RNG; unseeded when absent.
    #[serde(default)]
    pub rng_seed: Option<u64>,
    #[serde(default = "defaults::client_model")]
    pub client_model: ClientModel,
    /// Target sender cohort size; defaults to the trace's sender count.
    #[serde(default)]
    pub num_senders: Option<usize>,
    /// Simulation-time budget measured from `start_time`. When absent the
    /// run terminates once every trace mail has fully delivered.
    #[serde(default)]
    pub until: Option<f64>,
}

mod defaults {
    use super::ClientModel;

    pub fn lag() -> f64 {
        2600.0
    }
    pub fn e2e_lag() -> f64 {
        2500.0
    }
    pub fn layers() -> usize {
        2
    }
    pub fn num_providers() -> usize {
        2
    }
    pub fn nodes_per_layer() -> usize {
        2
    }
    pub fn body_size() -> usize {
        5436
    }
    pub fn base_port() -> u16 {
        49152
    }
    pub fn time_unit() -> f64 {
        1.0
    }
    pub fn client_model() -> ClientModel {
        ClientModel::AllSimulation
    }
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, SimError> {
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            return Err(SimError::Config(
                "config file must be in TOML format".into(),
            ));
        }

        let raw = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SimError> {
        let fail = |msg: &str| Err(SimError::Config(msg.into()));

        if self.traces_file.extension().and_then(|e| e.to_str()) != Some("json") {
            return fail("traces file must be in JSON format");
        }
        if self.lag < 0.0 || !self.lag.is_finite() {
            return fail("lag must be a non-negative number");
        }
        if self.e2e_lag < 0.0 || !self.e2e_lag.is_finite() {
            return fail("e2e_lag must be a non-negative number");
        }
        if self.num_providers == 0 {
            return fail("num_providers must be positive");
        }
        if self.nodes_per_layer == 0 {
            return fail("nodes_per_layer must be positive");
        }
        if self.body_size == 0 {
            return fail("body_size must be positive");
        }
        if self.base_port == 0 {
            return fail("base_port must be positive");
        }
        if self.time_unit <= 0.0 || !self.time_unit.is_finite() {
            return fail("time_unit must be positive");
        }
        if self.start_time < 0.0 || !self.start_time.is_finite() {
            return fail("start_time must be a non-negative number");
        }
        if self.layers + 2 > MAX_PATH_LENGTH {
            return Err(SimError::Config(format!(
                "at most {} mix layers fit in a sphinx route",
                MAX_PATH_LENGTH - 2
            )));
        }

        let num_nodes = self.num_providers + self.layers * self.nodes_per_layer;
        if usize::from(self.base_port) + num_nodes > usize::from(u16::MAX) {
            return fail("node ports exceed the UDP port space");
        }

        for (key, value) in &self.lambdas {
            if !LAMBDA_KEYS.contains(&key.as_str()) {
                return Err(SimError::Config(format!("unknown lambda key: {key}")));
            }
            if *value <= 0.0 || !value.is_finite() {
                return Err(SimError::Config(format!("lambda {key} must be positive")));
            }
        }

        if let Some(num_senders) = self.num_senders {
            if num_senders < 2 {
                return fail("num_senders must be at least 2");
            }
        }
        if let Some(until) = self.until {
            if until <= 0.0 || !until.is_finite() {
                return fail("until must be positive");
            }
        }

        Ok(())
    }
}

/// The calibrated Poisson means the workers actually sample from.
///
/// The per-type means from the configuration are spread over their emitters
/// on load: one decoy worker stands in for the whole sender cohort, and the
/// loop-mix worker stands in for every node in the PKI.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Lambdas {
    pub drop: f64,
    pub loop_: f64,
    pub payload: f64,
    pub delay: f64,
    pub loop_mix: f64,
}

impl Lambdas {
    pub fn calibrated(table: &HashMap<String, f64>, num_senders: usize, pki_size: usize) -> Self {
        let get = |key: &str| table.get(key).copied().unwrap_or(DEFAULT_LAMBDA);
        let senders = num_senders.max(1) as f64;

        Self {
            drop: get("DROP") / senders,
            loop_: get("LOOP") / senders,
            payload: get("PAYLOAD") / senders,
            delay: get("DELAY"),
            loop_mix: get("LOOP_MIX") / pki_size.max(1) as f64,
        }
    }

    /// Rescales the per-sender traffic means when the active cohort changes
    /// size, keeping the aggregate emission rate fixed.
    pub fn rescale_cohort(&mut self, old_count: usize, new_count: usize) {
        if old_count == new_count || new_count == 0 {
            return;
        }
        let factor = old_count as f64 / new_count as f64;
        self.drop *= factor;
        self.loop_ *= factor;
        self.payload *= factor;
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    fn base_config() -> Config {
        toml::from_str(
            r#"
            log_file = "events.log"
            traces_file = "traces.json"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_match_the_documented_table() {
        let config = base_config();

        assert_eq!(config.lag, 2600.0);
        assert_eq!(config.e2e_lag, 2500.0);
        assert_eq!(config.layers, 2);
        assert_eq!(config.num_providers, 2);
        assert_eq!(config.nodes_per_layer, 2);
        assert_eq!(config.body_size, 5436);
        assert_eq!(config.base_port, 49152);
        assert_eq!(config.time_unit, 1.0);
        assert_eq!(config.start_time, 0.0);
        assert!(!config.loop_mix_entropy);
        assert_eq!(config.client_model, ClientModel::AllSimulation);
        assert!(config.rng_seed.is_none());
        assert!(config.until.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn non_toml_path_is_rejected() {
        assert!(Config::from_file(Path::new("config.yaml")).is_err());
    }

    #[test]
    fn config_file_round_trip() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("couldn't create a temporary file");
        writeln!(
            file,
            r#"
            log_file = "events.log"
            traces_file = "traces.json"
            layers = 1
            rng_seed = 7

            [lambdas]
            DELAY = 0.5
            "#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.layers, 1);
        assert_eq!(config.rng_seed, Some(7));
        assert_eq!(config.lambdas["DELAY"], 0.5);
    }

    #[test]
    fn constraint_violations_are_fatal() {
        let mut config = base_config();
        config.lag = -1.0;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.num_senders = Some(1);
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.lambdas.insert("RAW".into(), 1.0);
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.lambdas.insert("DROP".into(), 0.0);
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.layers = 9;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.traces_file = "traces.csv".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn lambda_division_on_load() {
        let mut table = HashMap::new();
        table.insert("DROP".to_string(), 10.0);
        table.insert("DELAY".to_string(), 4.0);

        let lambdas = Lambdas::calibrated(&table, 5, 8);
        assert_eq!(lambdas.drop, 2.0);
        assert_eq!(lambdas.payload, DEFAULT_LAMBDA / 5.0);
        assert_eq!(lambdas.loop_, DEFAULT_LAMBDA / 5.0);
        assert_eq!(lambdas.delay, 4.0);
        assert_eq!(lambdas.loop_mix, DEFAULT_LAMBDA / 8.0);
    }

    #[test]
    fn cohort_rescale_keeps_aggregate_rate() {
        let mut lambdas = Lambdas::calibrated(&HashMap::new(), 4, 4);
        let before = lambdas.drop;

        lambdas.rescale_cohort(4, 8);
        assert_eq!(lambdas.drop, before / 2.0);
        // Aggregate rate: 8 senders over half the mean equals 4 over the mean.
        assert_eq!(8.0 / lambdas.drop, 4.0 / before);

        lambdas.rescale_cohort(8, 4);
        assert!((lambdas.drop - before).abs() < 1e-12);
    }
}
