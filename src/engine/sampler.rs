//! Client models choosing the sender of fresh traffic.

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use rand::Rng;

use crate::{
    engine::queues::PayloadQueues,
    setup::{
        config::{ClientModel, Lambdas},
        topology::Topology,
        trace::Mail,
    },
    tools::util::SimRng,
};

/// Picks which cohort member emits the next LOOP, DROP or PAYLOAD packet.
///
/// ALL_SIMULATION draws uniformly over the whole sender pool.
/// TIME_PROXIMITY prefers senders with queued payload, padded by those whose
/// trace activity is nearest to the current simulation time, and rescales
/// the traffic means when the cohort size moves. UNIFORM_PROVIDER first
/// draws a provider by its empirical sender share.
pub struct SenderSampler {
    topology: Arc<Topology>,
    model: ClientModel,
    /// Absolute send times per real sender, sorted.
    mail_times: BTreeMap<String, Vec<f64>>,
    /// The sender pool grouped by terminating provider, in a stable order.
    provider_members: BTreeMap<String, Vec<String>>,
    cohort_size: usize,
}

impl SenderSampler {
    pub fn new(
        topology: Arc<Topology>,
        model: ClientModel,
        traces: &[Mail],
        start_time: f64,
        lag: f64,
    ) -> Self {
        let mut mail_times: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for mail in traces {
            mail_times
                .entry(mail.sender.clone())
                .or_default()
                .push(start_time + lag + mail.time);
        }
        for times in mail_times.values_mut() {
            times.sort_by(f64::total_cmp);
        }

        let mut provider_members: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for sender in &topology.sender_pool {
            if let Some(provider) = topology.users.get(sender) {
                provider_members
                    .entry(provider.clone())
                    .or_default()
                    .push(sender.clone());
            }
        }

        Self {
            cohort_size: topology.num_senders,
            topology,
            model,
            mail_times,
            provider_members,
        }
    }

    /// Whether there is anyone to sample from at all.
    pub fn has_senders(&self) -> bool {
        !self.topology.sender_pool.is_empty()
    }

    /// The cohort size the traffic means are currently calibrated to; part
    /// of the resumable engine state.
    pub fn cohort_size(&self) -> usize {
        self.cohort_size
    }

    pub(crate) fn set_cohort_size(&mut self, cohort_size: usize) {
        self.cohort_size = cohort_size;
    }

    pub fn sample(
        &mut self,
        rng: &mut SimRng,
        now: f64,
        queues: &PayloadQueues,
        lambdas: &mut Lambdas,
    ) -> String {
        match self.model {
            ClientModel::AllSimulation => self.all_simulation(rng),
            ClientModel::TimeProximity => self.time_proximity(rng, now, queues, lambdas),
            ClientModel::UniformProvider => self.uniform_provider(rng, queues),
        }
    }

    fn all_simulation(&self, rng: &mut SimRng) -> String {
        let pool = &self.topology.sender_pool;
        pool[rng.gen_range(0..pool.len())].clone()
    }

    /// The TIME_PROXIMITY cohort at `now`: active senders first, then the
    /// real senders nearest in trace time, then the synthetic pad.
    pub fn time_proximity_cohort(&self, now: f64, queues: &PayloadQueues) -> Vec<String> {
        let num_senders = self.topology.num_senders;
        let mut cohort: Vec<String> = queues.active_senders().cloned().collect();

        if cohort.len() < num_senders {
            let mut nearest: Vec<(f64, &String)> = self
                .topology
                .senders
                .iter()
                .filter(|sender| !queues.has_packets(sender.as_str()))
                .map(|sender| (self.nearest_mail_gap(sender, now), sender))
                .collect();
            nearest.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(b.1)));

            for (_, sender) in nearest {
                if cohort.len() == num_senders {
                    break;
                }
                cohort.push(sender.clone());
            }
            for sender in &self.topology.fake_senders {
                if cohort.len() == num_senders {
                    break;
                }
                cohort.push(sender.clone());
            }
        }

        cohort.truncate(num_senders);
        cohort
    }

    fn time_proximity(
        &mut self,
        rng: &mut SimRng,
        now: f64,
        queues: &PayloadQueues,
        lambdas: &mut Lambdas,
    ) -> String {
        let cohort = self.time_proximity_cohort(now, queues);

        if !cohort.is_empty() && cohort.len() != self.cohort_size {
            lambdas.rescale_cohort(self.cohort_size, cohort.len());
            self.cohort_size = cohort.len();
        }

        cohort[rng.gen_range(0..cohort.len())].clone()
    }

    fn uniform_provider(&self, rng: &mut SimRng, queues: &PayloadQueues) -> String {
        // Drawing a pool member and keeping its provider samples providers
        // by their empirical sender share.
        let total: usize = self.provider_members.values().map(Vec::len).sum();
        let mut pick = rng.gen_range(0..total);

        let mut chosen = None;
        for (provider, members) in &self.provider_members {
            if pick < members.len() {
                chosen = Some((provider, members));
                break;
            }
            pick -= members.len();
        }
        let (provider, members) = chosen.expect("sender pool accounted for");

        let active: Vec<&String> = members
            .iter()
            .filter(|sender| queues.has_packets(sender.as_str()))
            .collect();
        if active.is_empty() {
            members[rng.gen_range(0..members.len())].clone()
        } else {
            active[rng.gen_range(0..active.len())].clone()
        }
    }

    /// Distance from `now` to the sender's nearest trace mail.
    fn nearest_mail_gap(&self, sender: &str, now: f64) -> f64 {
        let Some(times) = self.mail_times.get(sender) else {
            return f64::INFINITY;
        };

        let idx = times.partition_point(|t| *t < now);
        let mut gap = f64::INFINITY;
        if idx < times.len() {
            gap = (times[idx] - now).abs();
        }
        if idx > 0 {
            gap = gap.min((times[idx - 1] - now).abs());
        }
        gap
    }
}
