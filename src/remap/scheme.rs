//! Choosing where remapped chunks go

use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;

use parking_lot::{Mutex, RwLock};
use tracing::{error, trace};

use super::RemapStateView;
use crate::pending::values::ChunkSlot;
use crate::stripe_list::StripeList;

/// Latency charged to a server each time it is picked as a redirect target,
/// in seconds
pub const PICK_INCREMENT: f64 = 0.0001;

/// Least-latency redirection within a stripe
#[derive(Default)]
pub struct BasicRemapScheme {
    loading: Mutex<HashMap<SocketAddrV4, f64>>,
    overloaded: RwLock<HashSet<SocketAddrV4>>,
}

impl BasicRemapScheme {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_latency(&self, server: SocketAddrV4, latency: f64) {
        self.loading.lock().insert(server, latency);
    }

    pub fn latency(&self, server: SocketAddrV4) -> f64 {
        self.loading.lock().get(&server).copied().unwrap_or(0.0)
    }

    pub fn set_overloaded<I: IntoIterator<Item = SocketAddrV4>>(&self, servers: I) {
        let mut overloaded = self.overloaded.write();
        overloaded.clear();
        overloaded.extend(servers);
    }

    pub fn is_overloaded(&self, view: &dyn RemapStateView, server: SocketAddrV4) -> bool {
        self.overloaded.read().contains(&server) || view.use_coordinated_flow(server)
    }

    /// Redirect the chunk slots of one request away from servers that allow
    /// remapping
    ///
    /// `original` lists the request's data slots first (`data_count` of
    /// them), then its parity slots. Gets only redirect data slots. The
    /// returned slots line up with `original`; a slot without a usable
    /// replacement stays where it was.
    pub fn redirect(
        &self,
        view: &dyn RemapStateView,
        stripe_list: &StripeList<SocketAddrV4>,
        original: &[ChunkSlot],
        data_count: usize,
        is_get: bool,
    ) -> Vec<ChunkSlot> {
        let mut remapped = original.to_vec();
        let mut selected: HashSet<SocketAddrV4> = original
            .iter()
            .map(|&(list_id, chunk_id)| *stripe_list.get_node(list_id as usize, chunk_id as usize))
            .collect();
        let mut loading = self.loading.lock();

        let limit = if is_get { data_count.min(original.len()) } else { original.len() };
        for (slot, &(list_id, chunk_id)) in original.iter().enumerate().take(limit) {
            let server = *stripe_list.get_node(list_id as usize, chunk_id as usize);
            if !view.allow_remapping(server) {
                continue;
            }

            let mut best: Option<(u32, SocketAddrV4, f64)> = None;
            for candidate_chunk in 0..stripe_list.chunks_per_stripe() {
                let candidate = *stripe_list.get_node(list_id as usize, candidate_chunk);
                if selected.contains(&candidate) || view.use_coordinated_flow(candidate) {
                    continue;
                }
                let latency = loading.get(&candidate).copied().unwrap_or(0.0);
                if best.map_or(true, |(_, _, lowest)| latency < lowest) {
                    best = Some((candidate_chunk as u32, candidate, latency));
                }
            }

            match best {
                Some((candidate_chunk, candidate, _)) => {
                    trace!(from = %server, to = %candidate, list_id, chunk_id, "chunk redirected");
                    remapped[slot] = (list_id, candidate_chunk);
                    selected.insert(candidate);
                    *loading.entry(candidate).or_default() += PICK_INCREMENT;
                }
                None => error!(server = %server, list_id, chunk_id, "no server available for redirection"),
            }
        }
        remapped
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::stripe_list::{StripeAlgorithm, StripeListParams};

    struct View(HashSet<SocketAddrV4>);

    impl RemapStateView for View {
        fn use_coordinated_flow(&self, server: SocketAddrV4) -> bool {
            self.0.contains(&server)
        }

        fn allow_remapping(&self, server: SocketAddrV4) -> bool {
            self.0.contains(&server)
        }
    }

    fn stripe_list() -> StripeList<SocketAddrV4> {
        let nodes = (0..8)
            .map(|i| SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, i), 9000))
            .collect();
        let params = StripeListParams {
            chunks: 6,
            data_chunks: 4,
            num_lists: 4,
            algorithm: StripeAlgorithm::LoadAware,
            replicas: 16,
            seed: 0,
        };
        StripeList::new(params, nodes).unwrap()
    }

    /// Data slot of chunk 0 followed by both parity slots of list 0
    fn set_slots() -> Vec<ChunkSlot> {
        vec![(0, 0), (0, 4), (0, 5)]
    }

    #[test]
    fn test_normal_servers_untouched() {
        let list = stripe_list();
        let scheme = BasicRemapScheme::new();
        let view = View(HashSet::new());
        assert_eq!(scheme.redirect(&view, &list, &set_slots(), 1, false), set_slots());
    }

    #[test]
    fn test_redirects_to_least_loaded_stripe_member() {
        let list = stripe_list();
        let scheme = BasicRemapScheme::new();
        let hot = *list.get_node(0, 0);
        for chunk in 1..4 {
            scheme.update_latency(*list.get_node(0, chunk), 0.01 * chunk as f64);
        }
        let view = View(HashSet::from([hot]));

        let remapped = scheme.redirect(&view, &list, &set_slots(), 1, false);
        assert_eq!(remapped, vec![(0, 1), (0, 4), (0, 5)]);
        let target = *list.get_node(0, 1);
        assert!((scheme.latency(target) - (0.01 + PICK_INCREMENT)).abs() < 1e-12);
        assert!(scheme.is_overloaded(&view, hot));
        assert!(!scheme.is_overloaded(&view, target));
    }

    #[test]
    fn test_redirect_targets_are_distinct() {
        let list = stripe_list();
        let scheme = BasicRemapScheme::new();
        let parity_a = *list.get_node(0, 4);
        let parity_b = *list.get_node(0, 5);
        let view = View(HashSet::from([parity_a, parity_b]));

        let remapped = scheme.redirect(&view, &list, &set_slots(), 1, false);
        assert_eq!(remapped[0], (0, 0));
        let targets: HashSet<u32> = remapped[1..].iter().map(|&(_, chunk)| chunk).collect();
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|&chunk| (1..4).contains(&chunk)));
    }

    #[test]
    fn test_get_redirects_only_data() {
        let list = stripe_list();
        let scheme = BasicRemapScheme::new();
        let parity = *list.get_node(0, 4);
        let view = View(HashSet::from([parity]));
        assert_eq!(scheme.redirect(&view, &list, &set_slots(), 1, true), set_slots());
    }

    #[test]
    fn test_keeps_slot_when_nothing_fits() {
        let list = stripe_list();
        let scheme = BasicRemapScheme::new();
        let everyone: HashSet<SocketAddrV4> = (0..6).map(|chunk| *list.get_node(0, chunk)).collect();
        let view = View(everyone);
        assert_eq!(scheme.redirect(&view, &list, &set_slots(), 1, false), set_slots());
    }
}
