//! Coordinator side of the remap protocol
//!
//! The coordinator owns the authoritative state of every storage server.
//! Transitions are started here, broadcast to routers and servers, and
//! finished by a [`TransitWorker`](super::TransitWorker) once every alive
//! router has acknowledged the intermediate phase.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::message::{decode_states, encode_states};
use super::monitor::{LoadDecision, LoadMonitor};
use super::worker::TransitEvent;
use super::{
    BusEvent, GroupBus, RemapState, RemapStateView, Role, COORDINATOR_GROUP, ROUTER_GROUP, SERVER_GROUP,
};
use crate::config::RemapConfig;
use crate::{Error, Result};

/// Interval at which blocked waits re-check the exit flag
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Work the coordinator runs around a server's transition
///
/// Every method defaults to doing nothing.
pub trait TransitHooks: Send + Sync {
    /// Before waiting for `Intermediate` acks (metadata sync, reconstruction
    /// of a crashed server)
    fn degraded_begin(&self, _server: SocketAddrV4, _crashed: bool) {}

    /// After `Degraded` has been broadcast
    fn degraded_end(&self, _server: SocketAddrV4) {}

    /// Before a server returns to `Normal` (migrate remapped data back,
    /// release degraded locks)
    fn normal_end(&self, _server: SocketAddrV4) {}
}

struct NoHooks;

impl TransitHooks for NoHooks {}

#[derive(Default)]
struct ServerTable {
    alive: BTreeSet<SocketAddrV4>,
    crashed: HashSet<SocketAddrV4>,
    states: HashMap<SocketAddrV4, Arc<Mutex<RemapState>>>,
}

/// Transitions started together are announced together
#[derive(Default)]
struct Batch {
    in_flight: HashSet<SocketAddrV4>,
    updated: Vec<SocketAddrV4>,
}

pub struct CoordinatorRemapHandler {
    name: String,
    bus: Arc<dyn GroupBus>,
    inbox: Receiver<BusEvent>,
    config: RemapConfig,
    routers: Mutex<BTreeSet<String>>,
    /// Routers that acknowledged the current phase, per server
    acks: Mutex<HashMap<SocketAddrV4, HashSet<String>>>,
    ack_signal: Condvar,
    servers: RwLock<ServerTable>,
    batch: Mutex<Batch>,
    transit_tx: Sender<TransitEvent>,
    transit_rx: Receiver<TransitEvent>,
    hooks: RwLock<Arc<dyn TransitHooks>>,
    /// Latency reports of the alive routers
    monitor: LoadMonitor,
}

impl CoordinatorRemapHandler {
    /// Connect to the bus as `name` and join every remap group
    pub fn new(name: impl Into<String>, bus: Arc<dyn GroupBus>, config: RemapConfig) -> Result<Arc<Self>> {
        let name = name.into();
        let inbox = bus.connect(&name)?;
        for group in [COORDINATOR_GROUP, ROUTER_GROUP, SERVER_GROUP] {
            bus.join(&name, group)?;
        }
        let (transit_tx, transit_rx) = unbounded();
        info!(member = %name, "coordinator remap handler ready");
        Ok(Arc::new(Self {
            name,
            bus,
            inbox,
            config,
            routers: Mutex::new(BTreeSet::new()),
            acks: Mutex::new(HashMap::new()),
            ack_signal: Condvar::new(),
            servers: RwLock::new(ServerTable::default()),
            batch: Mutex::new(Batch::default()),
            transit_tx,
            transit_rx,
            hooks: RwLock::new(Arc::new(NoHooks)),
            monitor: LoadMonitor::new(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn load_monitor(&self) -> &LoadMonitor {
        &self.monitor
    }

    /// Evaluate the routers' latency reports and start the resulting
    /// transitions
    pub fn check_load(&self) -> Result<LoadDecision> {
        self.monitor.check(self)
    }

    pub fn config(&self) -> &RemapConfig {
        &self.config
    }

    pub fn set_hooks(&self, hooks: Arc<dyn TransitHooks>) {
        *self.hooks.write() = hooks;
    }

    pub(crate) fn hooks(&self) -> Arc<dyn TransitHooks> {
        Arc::clone(&self.hooks.read())
    }

    pub(crate) fn transit_events(&self) -> &Receiver<TransitEvent> {
        &self.transit_rx
    }

    fn state_of(&self, server: SocketAddrV4) -> Option<Arc<Mutex<RemapState>>> {
        self.servers.read().states.get(&server).cloned()
    }

    pub fn server_state(&self, server: SocketAddrV4) -> Option<RemapState> {
        self.state_of(server).map(|state| *state.lock())
    }

    pub fn alive_servers(&self) -> Vec<SocketAddrV4> {
        self.servers.read().alive.iter().copied().collect()
    }

    pub fn alive_routers(&self) -> Vec<String> {
        self.routers.lock().iter().cloned().collect()
    }

    pub fn is_crashed(&self, server: SocketAddrV4) -> bool {
        self.servers.read().crashed.contains(&server)
    }

    /// Start tracking a server in `Normal`; `false` if already tracked
    pub fn add_alive_server(&self, server: SocketAddrV4) -> bool {
        {
            let mut servers = self.servers.write();
            if !servers.alive.insert(server) {
                return false;
            }
            servers.states.insert(server, Arc::new(Mutex::new(RemapState::Normal)));
        }
        self.acks.lock().insert(server, HashSet::new());
        info!(server = %server, "server added");
        true
    }

    pub fn add_crashed_server(&self, server: SocketAddrV4) -> bool {
        self.servers.write().crashed.insert(server)
    }

    /// Forget a server; any worker waiting on its acks is released
    pub fn remove_alive_server(&self, server: SocketAddrV4) -> bool {
        {
            let mut servers = self.servers.write();
            if !servers.alive.remove(&server) {
                return false;
            }
            servers.crashed.remove(&server);
            if let Some(state) = servers.states.remove(&server) {
                *state.lock() = RemapState::Undefined;
            }
        }
        self.acks.lock().remove(&server);
        self.ack_signal.notify_all();
        info!(server = %server, "server removed");
        true
    }

    fn add_alive_router(&self, router: &str) {
        if self.routers.lock().insert(router.to_string()) {
            info!(router, "router joined");
        }
    }

    fn remove_alive_router(&self, router: &str) {
        if !self.routers.lock().remove(router) {
            return;
        }
        info!(router, "router left");
        self.monitor.remove_router(router);
        let mut acks = self.acks.lock();
        for acked in acks.values_mut() {
            acked.remove(router);
        }
        // The departed router may have been the last one missing
        self.ack_signal.notify_all();
    }

    fn reset_acks(&self, server: SocketAddrV4) {
        self.acks.lock().entry(server).or_default().clear();
    }

    fn all_acked_locked(&self, acks: &HashMap<SocketAddrV4, HashSet<String>>, server: SocketAddrV4) -> bool {
        match acks.get(&server) {
            Some(acked) => self.routers.lock().iter().all(|router| acked.contains(router)),
            // Nothing left to wait for once the server is gone
            None => true,
        }
    }

    /// Whether every alive router acknowledged the current phase of `server`
    pub fn is_all_acked(&self, server: SocketAddrV4) -> bool {
        let acks = self.acks.lock();
        self.all_acked_locked(&acks, server)
    }

    /// Block until every alive router acknowledged `server`, `timeout`
    /// passes, or `exit` is raised; `true` only in the first case
    pub fn wait_for_acks(&self, server: SocketAddrV4, timeout: Option<Duration>, exit: &AtomicBool) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut acks = self.acks.lock();
        loop {
            if self.all_acked_locked(&acks, server) {
                return true;
            }
            if exit.load(Ordering::Relaxed) {
                return false;
            }
            let slice = Instant::now() + POLL_INTERVAL;
            let wake = deadline.map_or(slice, |deadline| deadline.min(slice));
            self.ack_signal.wait_until(&mut acks, wake);
            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                return self.all_acked_locked(&acks, server);
            }
        }
    }

    fn snapshot(&self, servers: &[SocketAddrV4]) -> Vec<(SocketAddrV4, RemapState)> {
        let targets = if servers.is_empty() {
            self.alive_servers()
        } else {
            servers.to_vec()
        };
        targets
            .into_iter()
            .filter_map(|server| self.server_state(server).map(|state| (server, state)))
            .collect()
    }

    fn send_states(&self, servers: &[SocketAddrV4], groups: &[&str]) -> Result<()> {
        let records = self.snapshot(servers);
        if records.is_empty() {
            return Ok(());
        }
        let payload = encode_states(&records)?;
        self.bus.multicast(&self.name, groups, &payload)?;
        debug!(count = records.len(), ?groups, "states sent");
        Ok(())
    }

    /// Announce the states of `servers` (all alive servers when empty) to
    /// routers and servers
    pub fn broadcast_state(&self, servers: &[SocketAddrV4]) -> Result<()> {
        self.send_states(servers, &[ROUTER_GROUP, SERVER_GROUP])
    }

    pub fn send_state_to_routers(&self, servers: &[SocketAddrV4]) -> Result<()> {
        self.send_states(servers, &[ROUTER_GROUP])
    }

    fn begin_transit(&self, servers: &[SocketAddrV4], start: bool, forced: bool) -> Result<Vec<SocketAddrV4>> {
        let (from, to) = if start {
            (RemapState::Normal, RemapState::Intermediate)
        } else {
            (RemapState::Degraded, RemapState::Coordinated)
        };

        let mut checked = Vec::new();
        for &server in servers {
            let Some(state) = self.state_of(server) else {
                warn!(server = %server, "transition requested for unknown server");
                continue;
            };
            let mut state = state.lock();
            if forced {
                *state = to;
            } else if *state != from || !state.transit(server, to) {
                debug!(server = %server, state = %*state, "transition skipped");
                continue;
            }
            self.reset_acks(server);
            checked.push(server);
        }
        if checked.is_empty() {
            return Ok(checked);
        }

        self.batch.lock().in_flight.extend(checked.iter().copied());
        if let Err(err) = self.broadcast_state(&checked) {
            for &server in &checked {
                if let Some(state) = self.state_of(server) {
                    let mut state = state.lock();
                    if *state == to {
                        *state = from;
                    } else {
                        error!(server = %server, state = %*state, "unexpected state while reverting");
                    }
                }
            }
            let mut batch = self.batch.lock();
            for server in &checked {
                batch.in_flight.remove(server);
            }
            return Err(err);
        }

        for &server in &checked {
            self.transit_tx
                .send(TransitEvent { server, start })
                .map_err(|_| Error::Bus("transit queue closed".into()))?;
        }
        info!(servers = ?checked, state = %to, forced, "transition started");
        Ok(checked)
    }

    /// Move `servers` from `Normal` towards `Degraded`; returns the servers
    /// whose transition actually started
    pub fn transit_to_degraded(&self, servers: &[SocketAddrV4], forced: bool) -> Result<Vec<SocketAddrV4>> {
        self.begin_transit(servers, true, forced)
    }

    /// Move `servers` from `Degraded` back towards `Normal`; crashed servers
    /// never return
    pub fn transit_to_normal(&self, servers: &[SocketAddrV4], forced: bool) -> Result<Vec<SocketAddrV4>> {
        let servers: Vec<SocketAddrV4> = {
            let table = self.servers.read();
            servers
                .iter()
                .copied()
                .filter(|server| !table.crashed.contains(server))
                .collect()
        };
        self.begin_transit(&servers, false, forced)
    }

    /// Enter or leave remapping for a set of servers
    pub fn switch_phase(
        &self,
        to_remap: bool,
        servers: &[SocketAddrV4],
        is_crashed: bool,
        forced: bool,
    ) -> Result<Vec<SocketAddrV4>> {
        if to_remap {
            if is_crashed {
                for &server in servers {
                    self.add_crashed_server(server);
                }
            }
            self.transit_to_degraded(servers, forced)
        } else {
            self.transit_to_normal(servers, forced)
        }
    }

    /// A server stopped responding: route around it for good
    pub fn switch_phase_for_crashed_server(&self, server: SocketAddrV4) -> Result<()> {
        match self.server_state(server) {
            None => Err(Error::UnknownServer(server)),
            Some(RemapState::Normal) => self.switch_phase(true, &[server], true, false).map(|_| ()),
            Some(state) => {
                // Already out of the normal path; the degraded hooks see the flag
                self.add_crashed_server(server);
                info!(server = %server, state = %state, "crashed server already remapped");
                Ok(())
            }
        }
    }

    /// Complete the phase started for `event.server`; `false` if the server
    /// changed state (or left) in the meantime
    pub(crate) fn finish_transit(&self, event: TransitEvent) -> Result<bool> {
        let server = event.server;
        let (expected, next) = if event.start {
            (RemapState::Intermediate, RemapState::Degraded)
        } else {
            (RemapState::Coordinated, RemapState::Normal)
        };
        let Some(state) = self.state_of(server) else {
            self.batch.lock().in_flight.remove(&server);
            return Ok(false);
        };

        if !event.start {
            if *state.lock() != expected {
                warn!(server = %server, "state changed while waiting for acks");
                self.batch.lock().in_flight.remove(&server);
                return Ok(false);
            }
            self.hooks().normal_end(server);
        }
        {
            let mut state = state.lock();
            if *state != expected {
                warn!(server = %server, state = %*state, "state changed while waiting for acks");
                self.batch.lock().in_flight.remove(&server);
                return Ok(false);
            }
            state.transit(server, next);
        }

        let updated = {
            let mut batch = self.batch.lock();
            if batch.in_flight.remove(&server) {
                batch.updated.push(server);
            }
            if !batch.in_flight.is_empty() {
                debug!(server = %server, waiting = batch.in_flight.len(), "waiting for the rest of the batch");
                return Ok(true);
            }
            std::mem::take(&mut batch.updated)
        };
        if !updated.is_empty() {
            self.broadcast_state(&updated)?;
        }
        info!(server = %server, state = %next, "transition complete");
        if event.start {
            self.hooks().degraded_end(server);
        }
        Ok(true)
    }

    /// Record a router's acknowledgement message
    pub fn update_state(&self, sender: &str, payload: &[u8]) -> Result<()> {
        if Role::of(sender) != Some(Role::Router) {
            return Ok(());
        }
        for (server, acked_state) in decode_states(payload)? {
            let expected = match self.server_state(server) {
                Some(RemapState::Intermediate) => RemapState::WaitDegraded,
                Some(RemapState::Coordinated) => RemapState::WaitNormal,
                current => {
                    debug!(server = %server, ?current, "ack outside a transition ignored");
                    continue;
                }
            };
            if acked_state != expected {
                debug!(server = %server, state = %acked_state, "ack for another phase ignored");
                continue;
            }

            let known_router = self.routers.lock().contains(sender);
            let mut acks = self.acks.lock();
            match acks.get_mut(&server) {
                Some(acked) if known_router => {
                    acked.insert(sender.to_string());
                    debug!(server = %server, router = sender, "router acknowledged");
                }
                _ => {
                    warn!(server = %server, router = sender, "ack from unknown router or for unknown server");
                    continue;
                }
            }
            if self.all_acked_locked(&acks, server) {
                self.ack_signal.notify_all();
            }
        }
        Ok(())
    }

    /// Alive servers outside `Normal`
    pub fn remapped_count(&self) -> usize {
        let servers = self.servers.read();
        servers
            .alive
            .iter()
            .filter_map(|server| servers.states.get(server))
            .filter(|state| *state.lock() != RemapState::Normal)
            .count()
    }

    pub fn reach_maximum_remapped(&self, maximum: usize) -> bool {
        self.remapped_count() >= maximum
    }

    pub fn is_in_transition(&self, server: SocketAddrV4) -> bool {
        matches!(
            self.server_state(server),
            Some(RemapState::Intermediate | RemapState::Coordinated)
        )
    }

    fn handle(&self, event: BusEvent) {
        match event {
            BusEvent::Message { sender, payload, .. } => {
                if sender == self.name {
                    return;
                }
                if let Err(err) = self.update_state(&sender, &payload) {
                    warn!(sender = %sender, error = %err, "bad state message");
                }
            }
            BusEvent::Membership { group, member, joined, .. } => {
                if member == self.name {
                    return;
                }
                let result = match (Role::of(&member), group.as_str(), joined) {
                    (Some(Role::Router), ROUTER_GROUP, true) => {
                        self.add_alive_router(&member);
                        // Bring the newcomer up to date
                        self.send_state_to_routers(&[])
                    }
                    (Some(Role::Router), ROUTER_GROUP, false) => {
                        self.remove_alive_router(&member);
                        Ok(())
                    }
                    (Some(Role::Server), SERVER_GROUP, true) => self.broadcast_state(&[]),
                    _ => Ok(()),
                };
                if let Err(err) = result {
                    warn!(member = %member, error = %err, "failed to broadcast states");
                }
            }
        }
    }

    /// Handle every bus event already delivered; returns how many
    pub fn process_pending(&self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.inbox.try_recv() {
            self.handle(event);
            handled += 1;
        }
        handled
    }

    /// Handle bus events on a background thread until `exit` is raised
    pub fn listen(self: &Arc<Self>, exit: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        let handler = Arc::clone(self);
        let thread = Builder::new()
            .name("coordinatorRemap".to_string())
            .spawn(move || loop {
                if exit.load(Ordering::Relaxed) {
                    break;
                }
                match handler.inbox.recv_timeout(POLL_INTERVAL) {
                    Ok(event) => handler.handle(event),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(thread)
    }
}

impl RemapStateView for CoordinatorRemapHandler {
    fn use_coordinated_flow(&self, server: SocketAddrV4) -> bool {
        self.server_state(server)
            .map_or(false, |state| state != RemapState::Normal)
    }

    fn allow_remapping(&self, server: SocketAddrV4) -> bool {
        matches!(
            self.server_state(server),
            Some(RemapState::Intermediate | RemapState::Degraded)
        )
    }
}
