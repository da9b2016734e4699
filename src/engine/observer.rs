//! Running metrics of the experiment.

use serde::{Deserialize, Serialize};
use tracing::info;

/// Weight of a fresh sample in the ε estimate.
const EPSILON_EWMA_WEIGHT: f64 = 0.01;

/// Engine-owned metric state: the running mean end-to-end latency, the mean
/// anonymity-set entropy across nodes and the empirical ε estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observer {
    latency_sum: f64,
    completed: usize,
    pub mean_latency: f64,
    pub mean_entropy: f64,
    pub epsilon: f64,
    epsilon_updates: u64,
}

impl Default for Observer {
    fn default() -> Self {
        Self {
            latency_sum: 0.0,
            completed: 0,
            mean_latency: 0.0,
            mean_entropy: 0.0,
            epsilon: 0.0,
            epsilon_updates: 0,
        }
    }
}

impl Observer {
    /// Folds a completed message into the running latency mean.
    pub fn record_latency(&mut self, latency: f64) {
        self.latency_sum += latency;
        self.completed += 1;
        self.mean_latency = self.latency_sum / self.completed as f64;

        info!(
            delivered = self.completed,
            mean_latency = self.mean_latency,
            "message delivered after {latency:.4}s"
        );
    }

    /// Stores the network-wide mean entropy after a node update.
    pub fn record_entropy(&mut self, mean_entropy: f64) {
        self.mean_entropy = mean_entropy;
    }

    /// Folds one exit-layer observation into the ε estimate.
    pub fn update_epsilon(&mut self, sample: f64) {
        self.epsilon = EPSILON_EWMA_WEIGHT * sample + (1.0 - EPSILON_EWMA_WEIGHT) * self.epsilon;
        self.epsilon_updates += 1;
    }

    /// Messages fully delivered so far.
    pub fn completed(&self) -> usize {
        self.completed
    }

    /// How often the ε estimate has been updated.
    pub fn epsilon_updates(&self) -> u64 {
        self.epsilon_updates
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn latency_mean_is_running() {
        let mut observer = Observer::default();

        observer.record_latency(2.0);
        assert_eq!(observer.mean_latency, 2.0);

        observer.record_latency(4.0);
        assert_eq!(observer.mean_latency, 3.0);
        assert_eq!(observer.completed(), 2);
    }

    #[test]
    fn epsilon_is_an_ewma() {
        let mut observer = Observer::default();
        assert_eq!(observer.epsilon, 0.0);

        observer.update_epsilon(1.0);
        assert!((observer.epsilon - 0.01).abs() < 1e-12);

        observer.update_epsilon(1.0);
        assert!((observer.epsilon - 0.0199).abs() < 1e-12);
        assert_eq!(observer.epsilon_updates(), 2);
    }
}
