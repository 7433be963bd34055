//! Storage server view of peer remap states

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::coordinator::POLL_INTERVAL;
use super::message::decode_states;
use super::{BusEvent, GroupBus, RemapState, RemapStateView, Role, SERVER_GROUP};
use crate::Result;

/// Follows the coordinator's broadcasts; never initiates anything
pub struct StorageRemapHandler {
    name: String,
    inbox: Receiver<BusEvent>,
    states: RwLock<HashMap<SocketAddrV4, RemapState>>,
}

impl StorageRemapHandler {
    pub fn new(name: impl Into<String>, bus: &dyn GroupBus) -> Result<Arc<Self>> {
        let name = name.into();
        let inbox = bus.connect(&name)?;
        bus.join(&name, SERVER_GROUP)?;
        info!(member = %name, "storage remap handler ready");
        Ok(Arc::new(Self {
            name,
            inbox,
            states: RwLock::new(HashMap::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply a coordinator broadcast
    pub fn set_state(&self, payload: &[u8]) -> Result<()> {
        let records = decode_states(payload)?;
        let mut states = self.states.write();
        for (server, state) in records {
            let previous = states.insert(server, state);
            if previous != Some(state) {
                debug!(server = %server, ?previous, state = %state, "peer state updated");
            }
        }
        Ok(())
    }

    pub fn server_state(&self, server: SocketAddrV4) -> Option<RemapState> {
        self.states.read().get(&server).copied()
    }

    /// Responses from a degraded peer come through the coordinated path
    pub fn accept_normal_response(&self, server: SocketAddrV4) -> bool {
        self.server_state(server) != Some(RemapState::Degraded)
    }

    fn handle(&self, event: BusEvent) {
        if let BusEvent::Message { sender, payload, .. } = event {
            if Role::of(&sender) != Some(Role::Coordinator) {
                return;
            }
            if let Err(err) = self.set_state(&payload) {
                warn!(sender = %sender, error = %err, "bad state message");
            }
        }
    }

    pub fn process_pending(&self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.inbox.try_recv() {
            self.handle(event);
            handled += 1;
        }
        handled
    }

    pub fn listen(self: &Arc<Self>, exit: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        let handler = Arc::clone(self);
        let thread = Builder::new()
            .name("storageRemap".to_string())
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

impl RemapStateView for StorageRemapHandler {
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
    use crate::remap::message::encode_states;
    use crate::remap::LocalBus;

    fn peer(i: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, i), 9100)
    }

    #[test]
    fn test_follows_coordinator_broadcasts() {
        let bus = LocalBus::new();
        bus.connect("coordinator").unwrap();
        let storage = StorageRemapHandler::new("server1", &bus).unwrap();
        assert!(!storage.use_coordinated_flow(peer(2)));

        let payload = encode_states(&[(peer(2), RemapState::Intermediate), (peer(3), RemapState::Normal)]).unwrap();
        bus.multicast("coordinator", &[SERVER_GROUP], &payload).unwrap();
        storage.process_pending();
        assert!(storage.use_coordinated_flow(peer(2)));
        assert!(storage.allow_remapping(peer(2)));
        assert!(storage.accept_normal_response(peer(2)));
        assert!(!storage.use_coordinated_flow(peer(3)));

        let payload = encode_states(&[(peer(2), RemapState::Degraded)]).unwrap();
        bus.multicast("coordinator", &[SERVER_GROUP], &payload).unwrap();
        storage.process_pending();
        assert!(!storage.accept_normal_response(peer(2)));
    }

    #[test]
    fn test_ignores_non_coordinators() {
        let bus = LocalBus::new();
        bus.connect("server9").unwrap();
        let storage = StorageRemapHandler::new("server1", &bus).unwrap();

        let payload = encode_states(&[(peer(2), RemapState::Degraded)]).unwrap();
        bus.multicast("server9", &[SERVER_GROUP], &payload).unwrap();
        storage.process_pending();
        assert_eq!(storage.server_state(peer(2)), None);
        assert!(storage.set_state(&[3, 1]).is_err());
    }
}
