//! Community detection
//!
//! Leiden-style iterative clustering: greedy local moving by modularity
//! gain, a refinement pass that splits communities whose members are no
//! longer connected, then aggregation into a super-node graph and recursion.
//! Node visit order comes from a seeded xorshift PRNG so runs reproduce.

use std::collections::{HashMap, HashSet, VecDeque};

// ============================================================================
// DETERMINISTIC PRNG
// ============================================================================

/// xorshift64 generator; deterministic for a given seed
#[derive(Debug, Clone)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        Self {
            // Zero locks the generator at zero forever
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Uniform index in `[0, n)`
    pub fn next_index(&mut self, n: usize) -> usize {
        (self.next_u64() % n.max(1) as u64) as usize
    }

    /// Fisher-Yates shuffle
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.next_index(i + 1);
            items.swap(i, j);
        }
    }
}

// ============================================================================
// CONFIG
// ============================================================================

/// Community detection tunables
#[derive(Debug, Clone)]
pub struct CommunityConfig {
    /// PRNG seed for visit ordering
    pub seed: u64,
    /// Modularity resolution; higher values favour smaller communities
    pub resolution: f64,
    /// Maximum aggregation levels
    pub max_levels: usize,
    /// Maximum local-moving sweeps per level
    pub max_passes: usize,
}

impl Default for CommunityConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            resolution: 1.0,
            max_levels: 10,
            max_passes: 20,
        }
    }
}

// ============================================================================
// DETECTOR
// ============================================================================

type Adjacency = HashMap<String, Vec<(String, f64)>>;

/// Indexed, undirected view of the graph used inside one level
struct Level {
    neighbors: Vec<Vec<(usize, f64)>>,
    /// Weighted degree per node
    degree: Vec<f64>,
    /// Total edge weight (each undirected edge counted once)
    total_weight: f64,
}

impl Level {
    fn from_pairs(node_count: usize, pairs: &HashMap<(usize, usize), f64>) -> Self {
        let mut neighbors = vec![Vec::new(); node_count];
        let mut degree = vec![0.0; node_count];
        let mut total_weight = 0.0;
        for (&(a, b), &w) in pairs {
            neighbors[a].push((b, w));
            degree[a] += w;
            if a != b {
                neighbors[b].push((a, w));
                degree[b] += w;
            }
            total_weight += w;
        }
        Self {
            neighbors,
            degree,
            total_weight,
        }
    }
}

/// Leiden-style community detector
#[derive(Debug, Clone, Default)]
pub struct CommunityDetector {
    config: CommunityConfig,
}

impl CommunityDetector {
    pub fn new(config: CommunityConfig) -> Self {
        Self { config }
    }

    /// Assign every node to a community; ids are dense from zero
    ///
    /// Deterministic for a fixed seed and input graph.
    pub fn detect(&self, adjacency: &Adjacency) -> HashMap<String, usize> {
        // Stable node ordering before the PRNG shuffles visits
        let mut names: Vec<&String> = adjacency.keys().collect();
        names.sort();
        let index: HashMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();

        // Symmetrise: directed weights between a pair sum into one edge
        let mut pairs: HashMap<(usize, usize), f64> = HashMap::new();
        for (source, targets) in adjacency {
            let a = index[source.as_str()];
            for (target, weight) in targets {
                let Some(&b) = index.get(target.as_str()) else {
                    continue;
                };
                let key = (a.min(b), a.max(b));
                *pairs.entry(key).or_default() += weight.max(0.0);
            }
        }

        let mut rng = XorShift64::new(self.config.seed);
        let mut membership: Vec<usize> = (0..names.len()).collect();
        let mut level_pairs = pairs;
        let mut level_size = names.len();

        for _ in 0..self.config.max_levels {
            let level = Level::from_pairs(level_size, &level_pairs);
            let mut local = self.local_moving(&level, &mut rng);
            self.refine(&level, &mut local);
            let communities = renumber(&mut local);

            // Map the outer membership through this level's assignment
            for slot in membership.iter_mut() {
                *slot = local[*slot];
            }

            if communities == level_size {
                break;
            }

            // Aggregate into a super-node graph
            let mut aggregated: HashMap<(usize, usize), f64> = HashMap::new();
            for (&(a, b), &w) in &level_pairs {
                let ca = local[a];
                let cb = local[b];
                let key = (ca.min(cb), ca.max(cb));
                *aggregated.entry(key).or_default() += w;
            }
            level_pairs = aggregated;
            level_size = communities;
        }

        names
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), membership[i]))
            .collect()
    }

    /// Greedy neighbour-community reassignment by modularity gain
    fn local_moving(&self, level: &Level, rng: &mut XorShift64) -> Vec<usize> {
        let n = level.neighbors.len();
        let mut membership: Vec<usize> = (0..n).collect();
        let mut community_degree: Vec<f64> = level.degree.clone();
        let m = level.total_weight.max(f64::EPSILON);

        let mut order: Vec<usize> = (0..n).collect();
        for _ in 0..self.config.max_passes {
            rng.shuffle(&mut order);
            let mut moved = 0usize;

            for &node in &order {
                let current = membership[node];
                let k_i = level.degree[node];

                // Weight from node into each neighbouring community
                let mut links: HashMap<usize, f64> = HashMap::new();
                for &(neighbor, weight) in &level.neighbors[node] {
                    if neighbor != node {
                        *links.entry(membership[neighbor]).or_default() += weight;
                    }
                }

                community_degree[current] -= k_i;
                let base_gain = |community: usize, link: f64| -> f64 {
                    link - self.config.resolution * community_degree[community] * k_i / (2.0 * m)
                };

                let stay_gain = base_gain(current, links.get(&current).copied().unwrap_or(0.0));
                let mut best = (current, stay_gain);
                for (&community, &link) in &links {
                    if community == current {
                        continue;
                    }
                    let gain = base_gain(community, link);
                    if gain > best.1 + 1e-12 {
                        best = (community, gain);
                    }
                }

                community_degree[best.0] += k_i;
                if best.0 != current {
                    membership[node] = best.0;
                    moved += 1;
                }
            }

            if moved == 0 {
                break;
            }
        }
        membership
    }

    /// Split communities whose members are not mutually reachable
    fn refine(&self, level: &Level, membership: &mut [usize]) {
        let n = membership.len();
        let mut next_id = membership.iter().copied().max().map_or(0, |m| m + 1);
        let mut visited = vec![false; n];

        for start in 0..n {
            if visited[start] {
                continue;
            }
            // BFS restricted to the node's community
            let community = membership[start];
            let mut component = Vec::new();
            let mut queue = VecDeque::from([start]);
            visited[start] = true;
            while let Some(node) = queue.pop_front() {
                component.push(node);
                for &(neighbor, _) in &level.neighbors[node] {
                    if !visited[neighbor] && membership[neighbor] == community {
                        visited[neighbor] = true;
                        queue.push_back(neighbor);
                    }
                }
            }
            // The first component keeps the id; later ones split off
            let keeps_id = component.contains(&community_anchor(membership, community, &component));
            if !keeps_id {
                for &node in &component {
                    membership[node] = next_id;
                }
                next_id += 1;
            }
        }
    }
}

/// Anchor node for a community: the lowest-index member, used to decide
/// which connected component keeps the original id
fn community_anchor(membership: &[usize], community: usize, fallback: &[usize]) -> usize {
    membership
        .iter()
        .enumerate()
        .find(|(_, &c)| c == community)
        .map(|(i, _)| i)
        .unwrap_or_else(|| fallback[0])
}

/// Renumber community ids densely from zero; returns the community count
fn renumber(membership: &mut [usize]) -> usize {
    let mut mapping: HashMap<usize, usize> = HashMap::new();
    for slot in membership.iter_mut() {
        let next = mapping.len();
        *slot = *mapping.entry(*slot).or_insert(next);
    }
    mapping.len()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn two_cliques() -> Adjacency {
        let mut adjacency = Adjacency::new();
        let clique = |adjacency: &mut Adjacency, names: &[&str]| {
            for a in names {
                for b in names {
                    if a < b {
                        adjacency
                            .entry(a.to_string())
                            .or_default()
                            .push((b.to_string(), 1.0));
                    }
                }
                adjacency.entry(a.to_string()).or_default();
            }
        };
        clique(&mut adjacency, &["a1", "a2", "a3", "a4"]);
        clique(&mut adjacency, &["b1", "b2", "b3", "b4"]);
        // One weak bridge between the cliques
        adjacency
            .get_mut("a1")
            .unwrap()
            .push(("b1".to_string(), 0.05));
        adjacency
    }

    #[test]
    fn test_xorshift_deterministic() {
        let mut a = XorShift64::new(7);
        let mut b = XorShift64::new(7);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
        let mut c = XorShift64::new(8);
        assert_ne!(a.next_u64(), c.next_u64());
    }

    #[test]
    fn test_xorshift_zero_seed_is_usable() {
        let mut rng = XorShift64::new(0);
        assert_ne!(rng.next_u64(), 0);
    }

    #[test]
    fn test_two_cliques_separate() {
        let detector = CommunityDetector::default();
        let communities = detector.detect(&two_cliques());

        // Members of one clique share a community
        assert_eq!(communities["a1"], communities["a2"]);
        assert_eq!(communities["a2"], communities["a3"]);
        assert_eq!(communities["b1"], communities["b2"]);
        // The cliques stay apart
        assert_ne!(communities["a1"], communities["b1"]);
    }

    #[test]
    fn test_detection_is_reproducible() {
        let detector = CommunityDetector::default();
        let graph = two_cliques();
        let first = detector.detect(&graph);
        let second = detector.detect(&graph);
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_and_singleton() {
        let detector = CommunityDetector::default();
        assert!(detector.detect(&Adjacency::new()).is_empty());

        let mut lone = Adjacency::new();
        lone.insert("only".into(), vec![]);
        let communities = detector.detect(&lone);
        assert_eq!(communities.len(), 1);
    }
}
