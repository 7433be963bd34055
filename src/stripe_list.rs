//! Stripe lists
//!
//! A stripe list is a fixed template assigning the `n` chunk slots of a
//! stripe (`k` data slots followed by `n - k` parity slots) to distinct
//! nodes. Lists are generated once at startup; a consistent-hash ring then
//! maps every key onto one of them.
//!
//! The default generator balances nodes greedily: each slot goes to the
//! unused node with the smallest `(weight, cost)` pair, where a data chunk
//! weighs 1 and a parity chunk weighs `k` (a parity chunk is touched by every
//! write to its stripe).

use std::fmt;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ds::BitmaskArray;
use crate::hash::{self, ConsistentHash};
use crate::{Error, Result};

/// How slots are assigned to nodes during generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StripeAlgorithm {
    /// Slot `j` of list `i` goes to node `(i + j) mod N`
    RoundRobin,
    /// Greedy minimum `(weight, cost)` pick
    #[default]
    LoadAware,
    /// Uniform pick among unused nodes from a seeded generator
    Random,
}

/// Generation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeListParams {
    /// Chunks per stripe (`n`)
    pub chunks: usize,
    /// Data chunks per stripe (`k`)
    pub data_chunks: usize,
    pub num_lists: usize,
    pub algorithm: StripeAlgorithm,
    /// Ring positions per list
    pub replicas: u32,
    pub seed: u64,
}

/// One slot a node occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StripeListIndex {
    pub list_id: usize,
    pub stripe_id: u32,
    pub chunk_id: usize,
    pub is_parity: bool,
}

/// Placement of a key
#[derive(Debug, Clone, Copy)]
pub struct StripeLookup<'a, T> {
    pub list_id: usize,
    /// Data slot of the key within the list
    pub data_index: usize,
    /// Node holding the key's data chunk
    pub node: &'a T,
    pub data: &'a [T],
    pub parity: &'a [T],
}

pub struct StripeList<T> {
    n: usize,
    k: usize,
    nodes: Vec<T>,
    /// Node indices per list, data slots first
    lists: Vec<Vec<usize>>,
    /// Node references per list, same layout as `lists`
    entries: Vec<Vec<T>>,
    weight: Vec<u32>,
    cost: Vec<u32>,
    data: BitmaskArray,
    parity: BitmaskArray,
    ring: ConsistentHash<usize>,
}

impl<T: Clone + PartialEq> StripeList<T> {
    pub fn new(params: StripeListParams, nodes: Vec<T>) -> Result<Self> {
        let StripeListParams {
            chunks: n,
            data_chunks: k,
            num_lists,
            ..
        } = params;

        if nodes.len() < n {
            return Err(Error::NotEnoughNodes {
                available: nodes.len(),
                required: n,
            });
        }
        if k == 0 || k > n || num_lists == 0 {
            return Err(Error::InvalidConfig(format!(
                "stripe list needs 0 < k <= n and at least one list, got n = {}, k = {}, lists = {}",
                n, k, num_lists
            )));
        }

        let count = nodes.len();
        let mut stripe_list = Self {
            n,
            k,
            nodes,
            lists: Vec::with_capacity(num_lists),
            entries: Vec::with_capacity(num_lists),
            weight: vec![0; count],
            cost: vec![0; count],
            data: BitmaskArray::new(count, num_lists),
            parity: BitmaskArray::new(count, num_lists),
            ring: ConsistentHash::new(params.replicas),
        };
        stripe_list.generate(params);
        Ok(stripe_list)
    }

    fn is_used(&self, list: usize, node: usize) -> bool {
        self.data.check(list, node) || self.parity.check(list, node)
    }

    /// Unused node with the smallest (weight, cost)
    fn pick_min(&self, list: usize) -> usize {
        (0..self.nodes.len())
            .filter(|&node| !self.is_used(list, node))
            .min_by_key(|&node| (self.weight[node], self.cost[node], node))
            .unwrap_or(0)
    }

    fn pick_next(&self, list: usize, slot: usize) -> usize {
        let count = self.nodes.len();
        (0..count)
            .map(|step| (list + slot + step) % count)
            .find(|&node| !self.is_used(list, node))
            .unwrap_or(0)
    }

    fn pick_random(&self, list: usize, rng: &mut StdRng) -> usize {
        let unused: Vec<usize> = (0..self.nodes.len())
            .filter(|&node| !self.is_used(list, node))
            .collect();
        unused.choose(rng).copied().unwrap_or(0)
    }

    fn generate(&mut self, params: StripeListParams) {
        let (n, k) = (self.n, self.k);
        let mut rng = StdRng::seed_from_u64(params.seed);

        for list in 0..params.num_lists {
            // Parity slots first: they weigh the most
            for slot in k..n {
                let node = match params.algorithm {
                    StripeAlgorithm::LoadAware => self.pick_min(list),
                    StripeAlgorithm::RoundRobin => self.pick_next(list, slot),
                    StripeAlgorithm::Random => self.pick_random(list, &mut rng),
                };
                self.parity.set(list, node);
            }
            for slot in 0..k {
                let node = match params.algorithm {
                    StripeAlgorithm::LoadAware => self.pick_min(list),
                    StripeAlgorithm::RoundRobin => self.pick_next(list, slot),
                    StripeAlgorithm::Random => self.pick_random(list, &mut rng),
                };
                self.data.set(list, node);
            }

            // Data then parity, each in node order
            let mut assigned: Vec<usize> = self.data.ones(list).collect();
            assigned.extend(self.parity.ones(list));
            for (slot, &node) in assigned.iter().enumerate() {
                self.weight[node] += if slot < k { 1 } else { k as u32 };
                self.cost[node] += 1;
            }

            self.entries
                .push(assigned.iter().map(|&node| self.nodes[node].clone()).collect());
            self.lists.push(assigned);
            self.ring.add(list);
        }

        debug!(
            lists = params.num_lists,
            nodes = self.nodes.len(),
            algorithm = ?params.algorithm,
            "generated stripe lists"
        );
    }

    /// Placement of a key
    pub fn get(&self, key: &[u8]) -> StripeLookup<'_, T> {
        let key_hash = hash::hash(key);
        let list_id = self.list_for_hash(key_hash);
        let data_index = key_hash as usize % self.k;
        let entry = &self.entries[list_id];
        StripeLookup {
            list_id,
            data_index,
            node: &entry[data_index],
            data: &entry[..self.k],
            parity: &entry[self.k..],
        }
    }

    /// List owning a key hash; the hash is re-hashed to spread nearby keys
    fn list_for_hash(&self, key_hash: u32) -> usize {
        self.ring
            .get_by_hash(hash::hash_u32(key_hash))
            .copied()
            .unwrap_or(0)
    }

    /// Walk `jump` slots past the hashed start point of `data_index`
    pub fn get_by_jump(&self, list_id: usize, data_index: usize, jump: usize) -> (usize, &T) {
        let start = hash::hash_u32(data_index as u32) as usize;
        let chunk_id = (start + jump) % self.n;
        (chunk_id, &self.entries[list_id][chunk_id])
    }

    pub fn get_node(&self, list_id: usize, chunk_id: usize) -> &T {
        &self.entries[list_id][chunk_id]
    }

    /// Node index of a chunk slot
    pub fn node_index(&self, list_id: usize, chunk_id: usize) -> usize {
        self.lists[list_id][chunk_id]
    }

    pub fn data_nodes(&self, list_id: usize) -> &[T] {
        &self.entries[list_id][..self.k]
    }

    pub fn parity_nodes(&self, list_id: usize) -> &[T] {
        &self.entries[list_id][self.k..]
    }

    /// Every slot a node occupies, across all lists
    pub fn list(&self, node_index: usize) -> Vec<StripeListIndex> {
        self.lists
            .iter()
            .enumerate()
            .filter_map(|(list_id, slots)| {
                slots
                    .iter()
                    .position(|&node| node == node_index)
                    .map(|chunk_id| StripeListIndex {
                        list_id,
                        stripe_id: 0,
                        chunk_id,
                        is_parity: chunk_id >= self.k,
                    })
            })
            .collect()
    }

    /// Lists in which the node holds a parity slot
    pub fn lists_with_parity_on(&self, node_index: usize) -> Vec<usize> {
        (0..self.lists.len())
            .filter(|&list| self.parity.check(list, node_index))
            .collect()
    }

    pub fn is_data(&self, list_id: usize, node_index: usize) -> bool {
        self.data.check(list_id, node_index)
    }

    pub fn is_parity(&self, list_id: usize, node_index: usize) -> bool {
        self.parity.check(list_id, node_index)
    }

    /// Index of a node in the node set
    pub fn search(&self, node: &T) -> Option<usize> {
        self.nodes.iter().position(|candidate| candidate == node)
    }

    pub fn nodes(&self) -> &[T] {
        &self.nodes
    }

    pub fn num_lists(&self) -> usize {
        self.lists.len()
    }

    pub fn chunks_per_stripe(&self) -> usize {
        self.n
    }

    pub fn data_chunks(&self) -> usize {
        self.k
    }

    pub fn weight(&self, node_index: usize) -> u32 {
        self.weight[node_index]
    }

    pub fn cost(&self, node_index: usize) -> u32 {
        self.cost[node_index]
    }
}

impl<T> fmt::Display for StripeList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (list_id, slots) in self.lists.iter().enumerate() {
            let (data, parity) = slots.split_at(self.k);
            writeln!(f, "#{:<4} data {:?} parity {:?}", list_id, data, parity)?;
        }
        write!(f, "weight {:?} cost {:?}", self.weight, self.cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(n: usize, k: usize, num_lists: usize, algorithm: StripeAlgorithm) -> StripeListParams {
        StripeListParams {
            chunks: n,
            data_chunks: k,
            num_lists,
            algorithm,
            replicas: 8,
            seed: 7,
        }
    }

    fn node_names(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("server-{}", i)).collect()
    }

    #[test]
    fn test_not_enough_nodes() {
        let result = StripeList::new(params(8, 6, 4, StripeAlgorithm::LoadAware), node_names(7));
        assert!(matches!(
            result,
            Err(Error::NotEnoughNodes { available: 7, required: 8 })
        ));
    }

    #[test]
    fn test_generation_is_deterministic() {
        for algorithm in [StripeAlgorithm::LoadAware, StripeAlgorithm::RoundRobin, StripeAlgorithm::Random] {
            let a = StripeList::new(params(6, 4, 16, algorithm), node_names(10)).unwrap();
            let b = StripeList::new(params(6, 4, 16, algorithm), node_names(10)).unwrap();
            assert_eq!(a.lists, b.lists, "{:?}", algorithm);
        }
    }

    #[test]
    fn test_slots_are_disjoint() {
        for algorithm in [StripeAlgorithm::LoadAware, StripeAlgorithm::RoundRobin, StripeAlgorithm::Random] {
            let stripe_list = StripeList::new(params(8, 6, 32, algorithm), node_names(11)).unwrap();
            for list in 0..stripe_list.num_lists() {
                let slots = &stripe_list.lists[list];
                let mut sorted = slots.clone();
                sorted.sort_unstable();
                sorted.dedup();
                assert_eq!(sorted.len(), 8);

                for node in 0..11 {
                    assert!(!(stripe_list.is_data(list, node) && stripe_list.is_parity(list, node)));
                }
                assert_eq!(stripe_list.data.count(list), 6);
                assert_eq!(stripe_list.parity.count(list), 2);
            }
        }
    }

    #[test]
    fn test_load_aware_balances_weight() {
        let stripe_list = StripeList::new(params(6, 4, 60, StripeAlgorithm::LoadAware), node_names(10)).unwrap();
        let weights: Vec<u32> = (0..10).map(|i| stripe_list.weight(i)).collect();
        let max = *weights.iter().max().unwrap();
        let min = *weights.iter().min().unwrap();
        // One parity pick is the largest single step
        assert!(max - min <= 4, "{:?}", weights);

        let total_cost: u32 = (0..10).map(|i| stripe_list.cost(i)).sum();
        assert_eq!(total_cost, 60 * 6);
    }

    #[test]
    fn test_round_robin_layout() {
        let stripe_list = StripeList::new(params(3, 2, 4, StripeAlgorithm::RoundRobin), node_names(5)).unwrap();
        // List 1: parity slot 2 -> node 3, data slots -> nodes 1, 2
        assert_eq!(stripe_list.lists[1], vec![1, 2, 3]);
        assert_eq!(stripe_list.get_node(1, 2), "server-3");
    }

    #[test]
    fn test_key_lookup() {
        let stripe_list = StripeList::new(params(8, 6, 16, StripeAlgorithm::LoadAware), node_names(8)).unwrap();
        let lookup = stripe_list.get(b"user:1001");
        assert!(lookup.list_id < 16);
        assert!(lookup.data_index < 6);
        assert_eq!(lookup.data.len(), 6);
        assert_eq!(lookup.parity.len(), 2);
        assert_eq!(lookup.node, &lookup.data[lookup.data_index]);
        assert_eq!(lookup.node, stripe_list.get_node(lookup.list_id, lookup.data_index));

        // Same key, same placement
        let again = stripe_list.get(b"user:1001");
        assert_eq!(again.list_id, lookup.list_id);
        assert_eq!(again.data_index, lookup.data_index);
    }

    #[test]
    fn test_get_by_jump_wraps() {
        let stripe_list = StripeList::new(params(4, 2, 2, StripeAlgorithm::LoadAware), node_names(6)).unwrap();
        let (first, _) = stripe_list.get_by_jump(1, 0, 0);
        let (wrapped, node) = stripe_list.get_by_jump(1, 0, 4);
        assert_eq!(first, wrapped);
        assert_eq!(node, stripe_list.get_node(1, wrapped));
        let (next, _) = stripe_list.get_by_jump(1, 0, 1);
        assert_eq!(next, (first + 1) % 4);
    }

    #[test]
    fn test_reverse_lookup() {
        let stripe_list = StripeList::new(params(6, 4, 24, StripeAlgorithm::LoadAware), node_names(9)).unwrap();
        for node in 0..9 {
            let slots = stripe_list.list(node);
            assert_eq!(slots.len() as u32, stripe_list.cost(node));
            for slot in slots {
                assert_eq!(stripe_list.node_index(slot.list_id, slot.chunk_id), node);
                assert_eq!(slot.is_parity, stripe_list.is_parity(slot.list_id, node));
            }
            let parity_lists = stripe_list.lists_with_parity_on(node);
            assert!(parity_lists.iter().all(|&l| stripe_list.is_parity(l, node)));
        }
    }

    #[test]
    fn test_search_and_display() {
        let names = node_names(6);
        let stripe_list = StripeList::new(params(4, 3, 2, StripeAlgorithm::LoadAware), names.clone()).unwrap();
        assert_eq!(stripe_list.search(&names[4]), Some(4));
        assert_eq!(stripe_list.search(&"server-99".to_string()), None);
        let printed = stripe_list.to_string();
        assert!(printed.contains("#0"));
        assert!(printed.contains("#1"));
    }
}
