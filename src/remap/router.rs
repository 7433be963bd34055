//! Router side of the remap protocol
//!
//! A router reacts to the coordinator's broadcasts. On `Intermediate` it
//! asks the server to sync its metadata, tells the server's stripe peers to
//! revert parity deltas that were never acknowledged, and waits for the
//! normal requests it still has in flight against the server. Only then does
//! it acknowledge with `WaitDegraded`. `Coordinated` is acknowledged with
//! `WaitNormal` right away.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, Builder, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::coordinator::POLL_INTERVAL;
use super::message::{decode_states, encode_states};
use super::transit::StateTransitInfo;
use super::{BusEvent, GroupBus, RemapState, RemapStateView, Role, COORDINATOR_GROUP, ROUTER_GROUP};
use crate::config::RemapConfig;
use crate::pending::{Key, Match, PendingIdentifier, PendingType, PendingValue, Requester, RouterPending};
use crate::stripe_list::StripeList;
use crate::Result;

/// Outbound calls a router makes to storage servers
///
/// `origin` is the instance id of the calling router; completions go back
/// to that router.
pub trait ServerLink: Send + Sync {
    /// Ask `server` to push its metadata to the coordinator
    fn sync_metadata(&self, server: SocketAddrV4) -> Result<()>;

    /// Ask `peer` to roll back the parity deltas it backed up for `target`
    /// at `timestamps`, and those of `keys`
    ///
    /// Completion is reported back as [`RouterEvent::RevertAcked`].
    fn revert_parity_delta(
        &self,
        origin: u16,
        peer: SocketAddrV4,
        target: SocketAddrV4,
        timestamps: &[u32],
        keys: &[Key],
    ) -> Result<()>;

    /// Tell `peer` that updates of `data_server` in `from..=to` are durable,
    /// so their backups can be dropped
    ///
    /// Completion is reported back as [`RouterEvent::ParityAcked`].
    fn ack_parity_delta(
        &self,
        origin: u16,
        peer: SocketAddrV4,
        data_server: SocketAddrV4,
        from: u32,
        to: u32,
        request_id: u32,
    ) -> Result<()>;
}

/// Completions posted to a router by its collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterEvent {
    RevertAcked { target: SocketAddrV4 },
    RequestCompleted { parent_request_id: u32 },
    ParityAcked { request_id: u32 },
}

/// How a request for a key is served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPath {
    Normal { list_id: usize, server: SocketAddrV4 },
    /// Through the coordinator-mediated path
    Degraded { list_id: usize, server: SocketAddrV4 },
}

#[derive(Debug, Default)]
struct Timestamps {
    current: u32,
    last_ack: u32,
    /// Issued but not yet completed
    pending_updates: BTreeSet<u32>,
}

#[derive(Debug)]
struct ServerEntry {
    state: Mutex<RemapState>,
    transit: StateTransitInfo,
    timestamps: Mutex<Timestamps>,
}

impl ServerEntry {
    fn new(state: RemapState) -> Self {
        Self {
            state: Mutex::new(state),
            transit: StateTransitInfo::new(),
            timestamps: Mutex::new(Timestamps::default()),
        }
    }
}

pub struct RouterRemapHandler {
    name: String,
    instance_id: u16,
    bus: Arc<dyn GroupBus>,
    inbox: Receiver<BusEvent>,
    events_tx: Sender<RouterEvent>,
    events_rx: Receiver<RouterEvent>,
    link: Arc<dyn ServerLink>,
    stripe_list: Arc<StripeList<SocketAddrV4>>,
    pending: Arc<RouterPending>,
    config: RemapConfig,
    servers: RwLock<HashMap<SocketAddrV4, Arc<ServerEntry>>>,
    ack_lock: Mutex<()>,
    next_request_id: AtomicU32,
}

impl RouterRemapHandler {
    /// Connect as `name` and join the router group; every server of the
    /// stripe list starts in `Normal`
    pub fn new(
        name: impl Into<String>,
        instance_id: u16,
        bus: Arc<dyn GroupBus>,
        link: Arc<dyn ServerLink>,
        stripe_list: Arc<StripeList<SocketAddrV4>>,
        config: RemapConfig,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        let inbox = bus.connect(&name)?;
        let servers = stripe_list
            .nodes()
            .iter()
            .map(|&server| (server, Arc::new(ServerEntry::new(RemapState::Normal))))
            .collect();
        let (events_tx, events_rx) = unbounded();
        let handler = Arc::new(Self {
            name,
            instance_id,
            bus,
            inbox,
            events_tx,
            events_rx,
            link,
            stripe_list,
            pending: Arc::new(RouterPending::new()),
            config,
            servers: RwLock::new(servers),
            ack_lock: Mutex::new(()),
            next_request_id: AtomicU32::new(1),
        });
        handler.bus.join(&handler.name, ROUTER_GROUP)?;
        info!(member = %handler.name, instance_id, "router remap handler ready");
        Ok(handler)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance_id(&self) -> u16 {
        self.instance_id
    }

    pub fn pending(&self) -> &Arc<RouterPending> {
        &self.pending
    }

    pub fn stripe_list(&self) -> &Arc<StripeList<SocketAddrV4>> {
        &self.stripe_list
    }

    /// Where collaborators post completions
    pub fn events(&self) -> Sender<RouterEvent> {
        self.events_tx.clone()
    }

    pub fn next_request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Track a server outside the stripe list
    pub fn add_server(&self, server: SocketAddrV4) -> bool {
        let mut servers = self.servers.write();
        if servers.contains_key(&server) {
            return false;
        }
        servers.insert(server, Arc::new(ServerEntry::new(RemapState::Normal)));
        true
    }

    fn entry(&self, server: SocketAddrV4) -> Option<Arc<ServerEntry>> {
        self.servers.read().get(&server).cloned()
    }

    pub fn server_state(&self, server: SocketAddrV4) -> Option<RemapState> {
        self.entry(server).map(|entry| *entry.state.lock())
    }

    /// Revert acknowledgements still outstanding for `server`
    pub fn revert_count(&self, server: SocketAddrV4) -> u32 {
        self.entry(server).map_or(0, |entry| entry.transit.counter())
    }

    /// Normal requests `server` is still waiting on
    pub fn pending_normal_count(&self, server: SocketAddrV4) -> usize {
        self.entry(server)
            .map_or(0, |entry| entry.transit.pending_request_count())
    }

    /// Apply a coordinator broadcast
    pub fn set_state(&self, payload: &[u8]) -> Result<()> {
        for (server, next) in decode_states(payload)? {
            let Some(entry) = self.entry(server) else {
                error!(server = %server, "state received for unknown server");
                continue;
            };
            match next {
                RemapState::Intermediate => {
                    {
                        let mut state = entry.state.lock();
                        if matches!(*state, RemapState::Intermediate | RemapState::WaitDegraded) {
                            debug!(server = %server, state = %*state, "already draining");
                            continue;
                        }
                        if !state.transit(server, RemapState::Intermediate) {
                            continue;
                        }
                        // Reset under the state lock so no completion of the
                        // previous round can mark this one done
                        entry.transit.unset_completed();
                    }
                    self.drain(server, &entry)?;
                }
                RemapState::Coordinated => {
                    {
                        let mut state = entry.state.lock();
                        if *state == RemapState::WaitNormal {
                            continue;
                        }
                        if !state.transit(server, RemapState::Coordinated) {
                            continue;
                        }
                    }
                    self.ack_transit(Some(server))?;
                }
                RemapState::Degraded => {
                    let mut state = entry.state.lock();
                    if *state == RemapState::Intermediate {
                        error!(server = %server, "degraded announced before this router acknowledged");
                    }
                    state.transit(server, RemapState::Degraded);
                }
                RemapState::Normal => {
                    entry.state.lock().transit(server, RemapState::Normal);
                }
                RemapState::Undefined | RemapState::WaitDegraded | RemapState::WaitNormal => {
                    warn!(server = %server, state = %next, "unexpected state in broadcast");
                }
            }
            debug!(server = %server, state = ?self.server_state(server), "state applied");
        }
        Ok(())
    }

    fn drain(&self, server: SocketAddrV4, entry: &ServerEntry) -> Result<()> {
        if let Err(err) = self.link.sync_metadata(server) {
            warn!(server = %server, error = %err, "metadata sync request failed");
        }
        self.revert_delta(server, entry)?;
        self.gather_pending_normal_requests(server, entry)?;
        self.ack_transit(Some(server))
    }

    /// Servers sharing a stripe list with `server`, still on the normal path
    fn stripe_peers(&self, server: SocketAddrV4) -> Vec<SocketAddrV4> {
        let Some(index) = self.stripe_list.search(&server) else {
            return Vec::new();
        };
        let mut peers = BTreeSet::new();
        for list_id in 0..self.stripe_list.num_lists() {
            if !self.stripe_list.is_data(list_id, index) && !self.stripe_list.is_parity(list_id, index) {
                continue;
            }
            let list = self.stripe_list.data_nodes(list_id).iter();
            peers.extend(list.chain(self.stripe_list.parity_nodes(list_id)).copied());
        }
        peers.remove(&server);
        peers
            .into_iter()
            .filter(|&peer| !self.use_coordinated_flow(peer))
            .collect()
    }

    /// Parity servers of the lists where `server` holds data
    fn parity_peers(&self, server: SocketAddrV4) -> Vec<SocketAddrV4> {
        let Some(index) = self.stripe_list.search(&server) else {
            return Vec::new();
        };
        let peers: BTreeSet<SocketAddrV4> = (0..self.stripe_list.num_lists())
            .filter(|&list_id| self.stripe_list.is_data(list_id, index))
            .flat_map(|list_id| self.stripe_list.parity_nodes(list_id).iter().copied())
            .collect();
        peers
            .into_iter()
            .filter(|&peer| !self.use_coordinated_flow(peer))
            .collect()
    }

    fn revert_delta(&self, target: SocketAddrV4, entry: &ServerEntry) -> Result<()> {
        let timestamps: Vec<u32> = entry
            .timestamps
            .lock()
            .pending_updates
            .iter()
            .copied()
            .collect();

        // Sets issued on behalf of the target
        let requester = Requester::from(target);
        let server_set = self.pending.keys(PendingType::ServerSet)?;
        let mut keys = Vec::new();
        let dropped = server_set.extract(|pid, key| {
            if pid.requester != Some(requester) {
                return false;
            }
            if *self.stripe_list.get(key.as_bytes()).node == target {
                keys.push(key.clone());
                false
            } else {
                true
            }
        });
        for (pid, _) in dropped {
            if self.pending.has_server_request(pid.parent_request_id) {
                continue;
            }
            let application_set = self.pending.key_values(PendingType::ApplicationSet)?;
            if application_set
                .erase(pid.parent_instance_id, pid.parent_request_id, Match::any())
                .is_some()
            {
                debug!(parent_request_id = pid.parent_request_id, "set completed by revert");
                self.post(RouterEvent::RequestCompleted {
                    parent_request_id: pid.parent_request_id,
                });
            }
        }

        let peers = self.stripe_peers(target);
        // Count every peer before the first request can be answered
        for _ in &peers {
            entry.transit.increment_counter();
        }
        for peer in peers {
            if let Err(err) = self.link.revert_parity_delta(self.instance_id, peer, target, &timestamps, &keys) {
                warn!(peer = %peer, target = %target, error = %err, "parity revert request failed");
                entry.transit.decrement_counter();
            }
        }
        info!(
            target = %target,
            timestamps = timestamps.len(),
            keys = keys.len(),
            outstanding = entry.transit.counter(),
            "parity revert sent"
        );
        Ok(())
    }

    /// Track the normal requests touching `target` that must finish before
    /// it can be acknowledged
    fn gather_pending_normal_requests(&self, target: SocketAddrV4, entry: &ServerEntry) -> Result<()> {
        let mut tracked = HashSet::new();
        let mut outdated = HashSet::new();
        let mut visit = |pid: &PendingIdentifier, key: &[u8]| {
            let lookup = self.stripe_list.get(key);
            if *lookup.node == target {
                outdated.insert(pid.parent_request_id);
                return;
            }
            if !lookup.parity.contains(&target) || self.use_coordinated_flow(*lookup.node) {
                return;
            }
            tracked.insert(pid.parent_request_id);
        };

        for ty in [PendingType::ServerSet, PendingType::ServerDel] {
            self.pending.keys(ty)?.scan(|pid, key| visit(pid, key.as_bytes()));
        }
        self.pending
            .updates(PendingType::ServerUpdate)?
            .scan(|pid, update| {
                if let Some(key) = update.key_bytes() {
                    visit(pid, key)
                }
            });

        // Requests to the target itself will fail over; stop waiting on them
        let mut released = BTreeSet::new();
        for parent_request_id in &outdated {
            for (&server, other) in self.servers.read().iter() {
                if server != target && other.transit.remove_pending_request(*parent_request_id) {
                    other.transit.set_completed();
                    released.insert(server);
                }
            }
        }

        tracked.retain(|id| !outdated.contains(id));
        let waiting = entry.transit.gather(tracked);
        debug!(target = %target, waiting, outdated = outdated.len(), "pending normal requests gathered");

        // Servers whose last awaited request just went away have no event left
        // to trigger their ack
        for server in released {
            self.ack_transit(Some(server))?;
        }
        Ok(())
    }

    /// Ack state, if the router is ready to acknowledge `server`
    fn check_ack_for_server(&self, server: SocketAddrV4, entry: &ServerEntry) -> Option<RemapState> {
        let mut state = entry.state.lock();
        match *state {
            RemapState::Intermediate => {
                if entry.transit.counter() > 0 || !entry.transit.is_completed() {
                    return None;
                }
                state.transit(server, RemapState::WaitDegraded);
                Some(RemapState::WaitDegraded)
            }
            RemapState::Coordinated => {
                state.transit(server, RemapState::WaitNormal);
                Some(RemapState::WaitNormal)
            }
            _ => None,
        }
    }

    /// Acknowledge every server (or just `target`) that is ready
    pub fn ack_transit(&self, target: Option<SocketAddrV4>) -> Result<()> {
        let _guard = self.ack_lock.lock();
        let targets: Vec<(SocketAddrV4, Arc<ServerEntry>)> = match target {
            Some(server) => self.entry(server).map(|entry| (server, entry)).into_iter().collect(),
            None => self
                .servers
                .read()
                .iter()
                .map(|(&server, entry)| (server, Arc::clone(entry)))
                .collect(),
        };

        let records: Vec<(SocketAddrV4, RemapState)> = targets
            .iter()
            .filter_map(|(server, entry)| {
                self.check_ack_for_server(*server, entry)
                    .map(|state| (*server, state))
            })
            .collect();
        if records.is_empty() {
            return Ok(());
        }
        let payload = encode_states(&records)?;
        self.bus.multicast(&self.name, &[COORDINATOR_GROUP], &payload)?;
        info!(router = %self.name, acked = ?records, "transition acknowledged");
        Ok(())
    }

    /// Timestamp for the next update applied at `server`
    pub fn next_timestamp(&self, server: SocketAddrV4) -> Option<u32> {
        let entry = self.entry(server)?;
        let mut timestamps = entry.timestamps.lock();
        timestamps.current = timestamps.current.wrapping_add(1);
        let timestamp = timestamps.current;
        timestamps.pending_updates.insert(timestamp);
        Some(timestamp)
    }

    /// An update finished on every chunk it touched
    pub fn complete_update(&self, server: SocketAddrV4, timestamp: u32) -> Result<usize> {
        if let Some(entry) = self.entry(server) {
            entry.timestamps.lock().pending_updates.remove(&timestamp);
        }
        self.ack_parity_delta(Some(server), false)
    }

    /// Let parity servers drop backups of completed updates
    ///
    /// Without `force`, a server is skipped until `ack_batch_size` updates
    /// have completed since its last ack. Returns the number of ack requests
    /// sent.
    pub fn ack_parity_delta(&self, target: Option<SocketAddrV4>, force: bool) -> Result<usize> {
        let targets: Vec<(SocketAddrV4, Arc<ServerEntry>)> = match target {
            Some(server) => self.entry(server).map(|entry| (server, entry)).into_iter().collect(),
            None => self
                .servers
                .read()
                .iter()
                .map(|(&server, entry)| (server, Arc::clone(entry)))
                .collect(),
        };

        let acks = self.pending.acks(PendingType::AckRevertParity)?;
        let mut sent = 0;
        for (server, entry) in targets {
            let (from, to) = {
                let timestamps = entry.timestamps.lock();
                let settled = match timestamps.pending_updates.first() {
                    Some(&first) => timestamps.current.min(first.saturating_sub(1)),
                    None => timestamps.current,
                };
                (timestamps.last_ack, settled)
            };
            if to <= from || (!force && to - from < self.config.ack_batch_size) {
                continue;
            }

            for peer in self.parity_peers(server) {
                let request_id = self.next_request_id();
                let pid = PendingIdentifier::root(self.instance_id, request_id, None);
                self.pending.insert_ack(pid, peer, from, to);
                match self.link.ack_parity_delta(self.instance_id, peer, server, from, to, request_id) {
                    Ok(()) => sent += 1,
                    Err(err) => {
                        warn!(peer = %peer, data_server = %server, error = %err, "parity ack request failed");
                        acks.erase(self.instance_id, request_id, Match::any());
                    }
                }
            }
            entry.timestamps.lock().last_ack = to;
            debug!(server = %server, from, to, "parity deltas acknowledged");
        }
        Ok(sent)
    }

    /// Route a get for `key`
    pub fn route_get(&self, key: &[u8]) -> RequestPath {
        let lookup = self.stripe_list.get(key);
        let server = *lookup.node;
        if self.use_coordinated_flow(server) {
            RequestPath::Degraded {
                list_id: lookup.list_id,
                server,
            }
        } else {
            RequestPath::Normal {
                list_id: lookup.list_id,
                server,
            }
        }
    }

    /// Responses from a degraded server arrive through the coordinator
    pub fn accept_normal_response(&self, server: SocketAddrV4) -> bool {
        self.server_state(server) != Some(RemapState::Degraded)
    }

    fn post(&self, event: RouterEvent) {
        // The receiving half lives as long as the handler
        let _ = self.events_tx.send(event);
    }

    fn handle_event(&self, event: RouterEvent) -> Result<()> {
        match event {
            RouterEvent::RevertAcked { target } => {
                let Some(entry) = self.entry(target) else {
                    return Ok(());
                };
                if entry.transit.decrement_counter() == 0 {
                    self.ack_transit(Some(target))?;
                }
            }
            RouterEvent::RequestCompleted { parent_request_id } => {
                let finished: Vec<SocketAddrV4> = self
                    .servers
                    .read()
                    .iter()
                    .filter(|(_, entry)| entry.transit.remove_pending_request(parent_request_id))
                    .map(|(&server, entry)| {
                        entry.transit.set_completed();
                        server
                    })
                    .collect();
                for server in finished {
                    self.ack_transit(Some(server))?;
                }
            }
            RouterEvent::ParityAcked { request_id } => {
                let acks = self.pending.acks(PendingType::AckRevertParity)?;
                if acks.erase(self.instance_id, request_id, Match::any()).is_none() {
                    warn!(request_id, "ack for unknown parity request");
                }
            }
        }
        Ok(())
    }

    fn handle(&self, event: BusEvent) {
        match event {
            BusEvent::Message { sender, payload, .. } => {
                if Role::of(&sender) != Some(Role::Coordinator) {
                    return;
                }
                if let Err(err) = self.set_state(&payload) {
                    warn!(sender = %sender, error = %err, "failed to apply state message");
                }
            }
            BusEvent::Membership { member, joined, .. } => {
                debug!(member = %member, joined, "membership changed");
            }
        }
    }

    /// Handle every delivered bus message and completion until both queues
    /// are empty; returns how many were handled
    pub fn process_pending(&self) -> usize {
        let mut total = 0;
        loop {
            let mut handled = 0;
            while let Ok(event) = self.inbox.try_recv() {
                self.handle(event);
                handled += 1;
            }
            while let Ok(event) = self.events_rx.try_recv() {
                if let Err(err) = self.handle_event(event) {
                    warn!(error = %err, "failed to handle router event");
                }
                handled += 1;
            }
            if handled == 0 {
                return total;
            }
            total += handled;
        }
    }

    /// Handle bus messages and completions on a background thread
    pub fn listen(self: &Arc<Self>, exit: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        let handler = Arc::clone(self);
        let thread = Builder::new()
            .name("routerRemap".to_string())
            .spawn(move || loop {
                if exit.load(Ordering::Relaxed) {
                    break;
                }
                let disconnected = select! {
                    recv(handler.inbox) -> event => match event {
                        Ok(event) => {
                            handler.handle(event);
                            false
                        }
                        Err(_) => true,
                    },
                    recv(handler.events_rx) -> event => {
                        if let Ok(event) = event {
                            if let Err(err) = handler.handle_event(event) {
                                warn!(error = %err, "failed to handle router event");
                            }
                        }
                        false
                    },
                    default(POLL_INTERVAL) => false,
                };
                if disconnected {
                    break;
                }
            })?;
        Ok(thread)
    }

    /// Periodically acknowledge completed updates to parity servers and any
    /// drained server still waiting to be acknowledged
    pub fn start_ack_ticker(self: &Arc<Self>, exit: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        let handler = Arc::clone(self);
        let interval = self.config.ack_interval();
        let thread = Builder::new()
            .name("routerAckTicker".to_string())
            .spawn(move || {
                let mut last = Instant::now();
                while !exit.load(Ordering::Relaxed) {
                    thread::sleep(POLL_INTERVAL.min(interval));
                    if last.elapsed() < interval {
                        continue;
                    }
                    last = Instant::now();
                    if let Err(err) = handler.ack_transit(None) {
                        warn!(error = %err, "periodic transit ack failed");
                    }
                    if let Err(err) = handler.ack_parity_delta(None, true) {
                        warn!(error = %err, "periodic parity ack failed");
                    }
                }
            })?;
        Ok(thread)
    }
}

impl RemapStateView for RouterRemapHandler {
    fn use_coordinated_flow(&self, server: SocketAddrV4) -> bool {
        self.server_state(server)
            .map_or(false, |state| state != RemapState::Normal)
    }

    fn allow_remapping(&self, server: SocketAddrV4) -> bool {
        matches!(
            self.server_state(server),
            Some(RemapState::Intermediate | RemapState::WaitDegraded | RemapState::Degraded)
        )
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::remap::LocalBus;
    use crate::stripe_list::{StripeAlgorithm, StripeListParams};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Sync(SocketAddrV4),
        Revert { peer: SocketAddrV4, keys: usize },
        Ack { peer: SocketAddrV4, from: u32, to: u32, request_id: u32 },
    }

    #[derive(Default)]
    struct RecordingLink {
        calls: Mutex<Vec<Call>>,
    }

    impl RecordingLink {
        fn take(&self) -> Vec<Call> {
            std::mem::take(&mut *self.calls.lock())
        }
    }

    impl ServerLink for RecordingLink {
        fn sync_metadata(&self, server: SocketAddrV4) -> Result<()> {
            self.calls.lock().push(Call::Sync(server));
            Ok(())
        }

        fn revert_parity_delta(&self, _: u16, peer: SocketAddrV4, _: SocketAddrV4, _: &[u32], keys: &[Key]) -> Result<()> {
            self.calls.lock().push(Call::Revert { peer, keys: keys.len() });
            Ok(())
        }

        fn ack_parity_delta(
            &self,
            _: u16,
            peer: SocketAddrV4,
            _: SocketAddrV4,
            from: u32,
            to: u32,
            request_id: u32,
        ) -> Result<()> {
            self.calls.lock().push(Call::Ack {
                peer,
                from,
                to,
                request_id,
            });
            Ok(())
        }
    }

    struct Fixture {
        bus: Arc<LocalBus>,
        coordinator: Receiver<BusEvent>,
        link: Arc<RecordingLink>,
        router: Arc<RouterRemapHandler>,
    }

    fn fixture(config: RemapConfig) -> Fixture {
        let nodes = (0..8)
            .map(|i| SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, i), 9000))
            .collect();
        let params = StripeListParams {
            chunks: 6,
            data_chunks: 4,
            num_lists: 8,
            algorithm: StripeAlgorithm::LoadAware,
            replicas: 16,
            seed: 0,
        };
        let stripe_list = Arc::new(StripeList::new(params, nodes).unwrap());
        let bus = Arc::new(LocalBus::new());
        let coordinator = bus.connect("coordinator").unwrap();
        bus.join("coordinator", COORDINATOR_GROUP).unwrap();
        let link = Arc::new(RecordingLink::default());
        let router = RouterRemapHandler::new("router1", 1, bus.clone(), link.clone(), stripe_list, config).unwrap();
        coordinator.try_iter().count();
        Fixture {
            bus,
            coordinator,
            link,
            router,
        }
    }

    fn target(f: &Fixture) -> SocketAddrV4 {
        f.router.stripe_list().nodes()[3]
    }

    fn announce(f: &Fixture, server: SocketAddrV4, state: RemapState) {
        let payload = encode_states(&[(server, state)]).unwrap();
        f.bus.multicast("coordinator", &[ROUTER_GROUP], &payload).unwrap();
        f.router.process_pending();
    }

    fn acks_received(f: &Fixture) -> Vec<(SocketAddrV4, RemapState)> {
        f.coordinator
            .try_iter()
            .filter_map(|event| match event {
                BusEvent::Message { sender, payload, .. } if sender == "router1" => Some(decode_states(&payload).unwrap()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn ack_reverts(f: &Fixture, server: SocketAddrV4) {
        let reverts = f
            .link
            .take()
            .into_iter()
            .filter(|call| matches!(call, Call::Revert { .. }))
            .count();
        for _ in 0..reverts {
            f.router.events().send(RouterEvent::RevertAcked { target: server }).unwrap();
        }
        f.router.process_pending();
    }

    /// A key whose parity lives on `server` while its data lives elsewhere
    fn key_with_parity_on(f: &Fixture, server: SocketAddrV4) -> Vec<u8> {
        (0..10_000)
            .map(|i| format!("key-{}", i).into_bytes())
            .find(|key| {
                let lookup = f.router.stripe_list().get(key);
                *lookup.node != server && lookup.parity.contains(&server)
            })
            .unwrap()
    }

    #[test]
    fn test_intermediate_waits_for_reverts() {
        let f = fixture(RemapConfig::default());
        let server = target(&f);
        announce(&f, server, RemapState::Intermediate);

        assert_eq!(f.router.server_state(server), Some(RemapState::Intermediate));
        assert!(f.router.use_coordinated_flow(server));
        assert!(f.router.allow_remapping(server));
        assert!(f.router.revert_count(server) > 0);
        assert!(acks_received(&f).is_empty());
        assert_eq!(f.link.calls.lock()[0], Call::Sync(server));

        ack_reverts(&f, server);
        assert_eq!(acks_received(&f), vec![(server, RemapState::WaitDegraded)]);
        assert_eq!(f.router.server_state(server), Some(RemapState::WaitDegraded));

        // A repeated broadcast does not restart the drain
        announce(&f, server, RemapState::Intermediate);
        assert_eq!(f.router.server_state(server), Some(RemapState::WaitDegraded));
        assert!(f.link.take().is_empty());
    }

    #[test]
    fn test_pending_requests_delay_ack() {
        let f = fixture(RemapConfig::default());
        let server = target(&f);
        let key = key_with_parity_on(&f, server);
        let pid = PendingIdentifier::new(1, 1, 500, 50, None);
        f.router
            .pending()
            .insert_key(PendingType::ServerSet, pid, &key)
            .unwrap();

        announce(&f, server, RemapState::Intermediate);
        ack_reverts(&f, server);
        assert_eq!(f.router.pending_normal_count(server), 1);
        assert!(acks_received(&f).is_empty());

        f.router
            .events()
            .send(RouterEvent::RequestCompleted { parent_request_id: 50 })
            .unwrap();
        f.router.process_pending();
        assert_eq!(acks_received(&f), vec![(server, RemapState::WaitDegraded)]);
    }

    /// A key whose parity lives on `server` and whose data lives on another
    /// server, returned with that data server
    fn key_spanning(f: &Fixture, server: SocketAddrV4) -> (Vec<u8>, SocketAddrV4) {
        let key = key_with_parity_on(f, server);
        let data_server = *f.router.stripe_list().get(&key).node;
        (key, data_server)
    }

    #[test]
    fn test_drain_of_data_server_releases_waiting_parity_server() {
        let f = fixture(RemapConfig::default());
        let parity_server = target(&f);
        let (key, data_server) = key_spanning(&f, parity_server);
        let pid = PendingIdentifier::new(1, 1, 600, 60, None);
        f.router
            .pending()
            .insert_key(PendingType::ServerSet, pid, &key)
            .unwrap();

        announce(&f, parity_server, RemapState::Intermediate);
        ack_reverts(&f, parity_server);
        assert_eq!(f.router.pending_normal_count(parity_server), 1);
        assert!(acks_received(&f).is_empty());

        // The awaited set now targets a draining server and will fail over
        announce(&f, data_server, RemapState::Intermediate);
        ack_reverts(&f, data_server);
        let acks = acks_received(&f);
        assert!(acks.contains(&(parity_server, RemapState::WaitDegraded)));
        assert!(acks.contains(&(data_server, RemapState::WaitDegraded)));
        assert_eq!(f.router.pending_normal_count(parity_server), 0);
        assert_eq!(f.router.server_state(parity_server), Some(RemapState::WaitDegraded));
    }

    #[test]
    fn test_ack_ticker_acknowledges_drained_server() {
        let config = RemapConfig {
            ack_timeout_ms: 20,
            ..RemapConfig::default()
        };
        let f = fixture(config);
        let server = target(&f);
        let key = key_with_parity_on(&f, server);
        let pid = PendingIdentifier::new(1, 1, 700, 70, None);
        f.router
            .pending()
            .insert_key(PendingType::ServerSet, pid, &key)
            .unwrap();

        announce(&f, server, RemapState::Intermediate);
        ack_reverts(&f, server);
        assert!(acks_received(&f).is_empty());

        // Drained without any completion event reaching the router
        let entry = f.router.entry(server).unwrap();
        entry.transit.remove_pending_request(70);
        entry.transit.set_completed();

        let exit = Arc::new(AtomicBool::new(false));
        let ticker = f.router.start_ack_ticker(exit.clone()).unwrap();
        let start = Instant::now();
        let mut acks = Vec::new();
        while acks.is_empty() && start.elapsed() < std::time::Duration::from_secs(2) {
            thread::sleep(std::time::Duration::from_millis(10));
            acks = acks_received(&f);
        }
        exit.store(true, Ordering::Relaxed);
        ticker.join().unwrap();

        assert_eq!(acks, vec![(server, RemapState::WaitDegraded)]);
        assert_eq!(f.router.server_state(server), Some(RemapState::WaitDegraded));
    }

    #[test]
    fn test_degraded_and_back() {
        let f = fixture(RemapConfig::default());
        let server = target(&f);
        announce(&f, server, RemapState::Intermediate);
        ack_reverts(&f, server);
        announce(&f, server, RemapState::Degraded);
        acks_received(&f);

        assert!(!f.router.accept_normal_response(server));
        let key = (0..10_000)
            .map(|i| format!("key-{}", i).into_bytes())
            .find(|key| *f.router.stripe_list().get(key).node == server)
            .unwrap();
        assert!(matches!(f.router.route_get(&key), RequestPath::Degraded { server: s, .. } if s == server));

        announce(&f, server, RemapState::Coordinated);
        assert_eq!(acks_received(&f), vec![(server, RemapState::WaitNormal)]);
        announce(&f, server, RemapState::Normal);
        assert!(!f.router.use_coordinated_flow(server));
        assert!(matches!(f.router.route_get(&key), RequestPath::Normal { .. }));
    }

    #[test]
    fn test_illegal_broadcast_rejected() {
        let f = fixture(RemapConfig::default());
        let server = target(&f);
        announce(&f, server, RemapState::Degraded);
        assert_eq!(f.router.server_state(server), Some(RemapState::Normal));

        let unknown = SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 1), 1);
        announce(&f, unknown, RemapState::Intermediate);
        assert_eq!(f.router.server_state(unknown), None);
    }

    #[test]
    fn test_parity_acks_batched() {
        let config = RemapConfig {
            ack_batch_size: 3,
            ..RemapConfig::default()
        };
        let f = fixture(config);
        let server = target(&f);

        let first = f.router.next_timestamp(server).unwrap();
        let second = f.router.next_timestamp(server).unwrap();
        let third = f.router.next_timestamp(server).unwrap();
        assert_eq!((first, second, third), (1, 2, 3));

        // The oldest update is still running, nothing is settled
        assert_eq!(f.router.complete_update(server, second).unwrap(), 0);
        assert_eq!(f.router.complete_update(server, third).unwrap(), 0);
        let sent = f.router.complete_update(server, first).unwrap();
        assert!(sent > 0);

        let calls = f.link.take();
        assert_eq!(calls.len(), sent);
        assert!(calls
            .iter()
            .all(|call| matches!(call, Call::Ack { from: 0, to: 3, .. })));
        assert_eq!(f.router.pending().len(PendingType::AckRevertParity), sent);

        for call in calls {
            if let Call::Ack { request_id, .. } = call {
                f.router.events().send(RouterEvent::ParityAcked { request_id }).unwrap();
            }
        }
        f.router.process_pending();
        assert_eq!(f.router.pending().len(PendingType::AckRevertParity), 0);

        // Below the batch size only a forced round sends
        f.router.next_timestamp(server).unwrap();
        f.router.complete_update(server, 4).unwrap();
        assert!(f.link.take().is_empty());
        assert!(f.router.ack_parity_delta(Some(server), true).unwrap() > 0);
    }
}
