//! Links between simulated replicas: one-way latency, random loss and
//! split-brain partitions, all drawn from the runner's seeded RNG.

use crate::NodeIndex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;
use std::time::Duration;

/// Smallest latency a message can be sampled with.
const MIN_LATENCY: Duration = Duration::from_millis(1);

/// Link parameters shared by every pair of replicas.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Mean one-way latency.
    pub latency: Duration,
    /// Jitter as a fraction of `latency`, sampled uniformly in both directions.
    pub jitter_fraction: f64,
    /// Sealers plus observers. The runner overwrites this from its key set.
    pub num_nodes: u32,
    /// Probability that a single message is lost.
    pub packet_loss_rate: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(50),
            jitter_fraction: 0.1,
            num_nodes: 4,
            packet_loss_rate: 0.0,
        }
    }
}

/// The simulated network between replicas.
///
/// Cuts are undirected: a severed link drops traffic both ways.
#[derive(Debug)]
pub struct SimulatedNetwork {
    config: NetworkConfig,
    /// Severed links, stored with the lower index first.
    cuts: BTreeSet<(NodeIndex, NodeIndex)>,
}

fn link(a: NodeIndex, b: NodeIndex) -> (NodeIndex, NodeIndex) {
    (a.min(b), a.max(b))
}

impl SimulatedNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            cuts: BTreeSet::new(),
        }
    }

    /// Whether traffic between `from` and `to` is currently cut.
    pub fn is_partitioned(&self, from: NodeIndex, to: NodeIndex) -> bool {
        self.cuts.contains(&link(from, to))
    }

    /// Split the cluster: no message crosses between `side_a` and `side_b`.
    /// Links inside each side stay up.
    pub fn partition_groups(&mut self, side_a: &[NodeIndex], side_b: &[NodeIndex]) {
        for &a in side_a {
            for &b in side_b {
                if a != b {
                    self.cuts.insert(link(a, b));
                }
            }
        }
    }

    /// Restore every link.
    pub fn heal_all(&mut self) {
        self.cuts.clear();
    }

    /// Draw whether the next message is lost.
    pub fn should_drop_packet(&self, rng: &mut ChaCha8Rng) -> bool {
        self.config.packet_loss_rate > 0.0 && rng.gen::<f64>() < self.config.packet_loss_rate
    }

    /// Draw the one-way latency for a message. Links are symmetric, so the
    /// endpoints only matter to callers that log them.
    pub fn sample_latency(
        &self,
        _from: NodeIndex,
        _to: NodeIndex,
        rng: &mut ChaCha8Rng,
    ) -> Duration {
        let base = self.config.latency.as_secs_f64();
        let spread = base * self.config.jitter_fraction;
        let offset = if spread > 0.0 {
            rng.gen_range(-spread..spread)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + offset).max(0.0)).max(MIN_LATENCY)
    }

    pub fn all_nodes(&self) -> Vec<NodeIndex> {
        (0..self.config.num_nodes).collect()
    }

    pub fn total_nodes(&self) -> usize {
        self.config.num_nodes as usize
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn four_replicas() -> SimulatedNetwork {
        SimulatedNetwork::new(NetworkConfig::default())
    }

    #[test]
    fn test_even_split_blocks_cross_traffic_both_ways() {
        let mut network = four_replicas();
        network.partition_groups(&[0, 1], &[2, 3]);

        for a in [0, 1] {
            for b in [2, 3] {
                assert!(network.is_partitioned(a, b));
                assert!(network.is_partitioned(b, a));
            }
        }
        // Each half still talks internally, but holds only two of four votes.
        assert!(!network.is_partitioned(0, 1));
        assert!(!network.is_partitioned(3, 2));
    }

    #[test]
    fn test_isolated_leader_and_heal() {
        let mut network = four_replicas();
        let others: Vec<NodeIndex> = network
            .all_nodes()
            .into_iter()
            .filter(|n| *n != 0)
            .collect();
        network.partition_groups(&[0], &others);

        assert!(others.iter().all(|&n| network.is_partitioned(0, n)));
        assert!(!network.is_partitioned(1, 2));

        network.heal_all();
        for a in network.all_nodes() {
            for b in network.all_nodes() {
                assert!(!network.is_partitioned(a, b));
            }
        }
    }

    #[test]
    fn test_overlapping_sides_do_not_cut_self() {
        let mut network = four_replicas();
        network.partition_groups(&[0, 1], &[1, 2]);

        assert!(!network.is_partitioned(1, 1));
        assert!(network.is_partitioned(0, 2));
        assert!(network.is_partitioned(0, 1));
    }

    #[test]
    fn test_latency_within_jitter_and_reproducible() {
        let network = SimulatedNetwork::new(NetworkConfig {
            latency: Duration::from_millis(100),
            jitter_fraction: 0.2,
            ..NetworkConfig::default()
        });
        let mut first = ChaCha8Rng::seed_from_u64(7);
        let mut second = ChaCha8Rng::seed_from_u64(7);

        for _ in 0..200 {
            let latency = network.sample_latency(0, 1, &mut first);
            assert!(latency >= Duration::from_millis(80));
            assert!(latency <= Duration::from_millis(120));
            assert_eq!(latency, network.sample_latency(0, 1, &mut second));
        }
    }

    #[test]
    fn test_latency_has_a_floor() {
        let network = SimulatedNetwork::new(NetworkConfig {
            latency: Duration::ZERO,
            jitter_fraction: 0.5,
            ..NetworkConfig::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(network.sample_latency(2, 3, &mut rng), MIN_LATENCY);
    }

    #[test]
    fn test_loss_rate_is_honoured() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        assert!(!(0..1000).any(|_| four_replicas().should_drop_packet(&mut rng)));

        let lossy = SimulatedNetwork::new(NetworkConfig {
            packet_loss_rate: 0.1,
            ..NetworkConfig::default()
        });
        let drops = (0..10_000)
            .filter(|_| lossy.should_drop_packet(&mut rng))
            .count();
        assert!((800..1200).contains(&drops), "dropped {} of 10000", drops);
    }
}
