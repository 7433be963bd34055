//! Live remapping
//!
//! A storage server that runs hot is moved out of the normal request path in
//! two phases. The coordinator announces `Intermediate`; every router
//! drains the requests it still has in flight against the server, reverts
//! unacknowledged parity deltas and then acknowledges. Once all routers
//! have acknowledged, the coordinator announces `Degraded` and routers send
//! the server's traffic through the coordinator-mediated path. The way back
//! runs through `Coordinated` in the same fashion.
//!
//! State changes travel over a [`GroupBus`] as compact state messages (see
//! [`message`]).

pub mod bus;
pub mod coordinator;
pub mod message;
pub mod monitor;
pub mod router;
pub mod scheme;
pub mod storage;
pub mod transit;
pub mod worker;

use std::fmt;
use std::net::SocketAddrV4;

use crossbeam_channel::Receiver;
use tracing::warn;

use crate::{Error, Result};

pub use bus::LocalBus;
pub use coordinator::{CoordinatorRemapHandler, TransitHooks};
pub use monitor::{LoadDecision, LoadMonitor};
pub use router::{RequestPath, RouterEvent, RouterRemapHandler, ServerLink};
pub use scheme::BasicRemapScheme;
pub use storage::StorageRemapHandler;
pub use transit::StateTransitInfo;
pub use worker::{TransitEvent, TransitWorker};

/// Group joined by coordinators
pub const COORDINATOR_GROUP: &str = "coordinators";
/// Group joined by routers
pub const ROUTER_GROUP: &str = "routers";
/// Group joined by storage servers
pub const SERVER_GROUP: &str = "servers";

/// Remapping phase of one storage server as seen by one participant
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RemapState {
    #[default]
    Undefined = 0,
    Normal = 1,
    Intermediate = 2,
    Coordinated = 3,
    Degraded = 4,
    WaitDegraded = 5,
    WaitNormal = 6,
}

impl RemapState {
    pub fn name(&self) -> &'static str {
        match self {
            RemapState::Undefined => "UNDEFINED",
            RemapState::Normal => "NORMAL",
            RemapState::Intermediate => "INTERMEDIATE",
            RemapState::Coordinated => "COORDINATED",
            RemapState::Degraded => "DEGRADED",
            RemapState::WaitDegraded => "WAIT_DEGRADED",
            RemapState::WaitNormal => "WAIT_NORMAL",
        }
    }

    /// Whether a server may move from `self` to `next`
    ///
    /// Staying put is always allowed, as is dropping to `Undefined` when a
    /// server leaves the cluster.
    pub fn can_transit_to(self, next: RemapState) -> bool {
        use RemapState::*;
        if self == next || next == Undefined {
            return true;
        }
        matches!(
            (self, next),
            (Undefined, Normal)
                | (Normal, Intermediate)
                | (Intermediate, WaitDegraded)
                | (Intermediate, Degraded)
                | (Intermediate, Coordinated)
                | (WaitDegraded, Degraded)
                | (Degraded, Coordinated)
                | (Coordinated, WaitNormal)
                | (Coordinated, Normal)
                | (WaitNormal, Normal)
        )
    }

    /// Move `self` to `next` if allowed, logging rejected moves
    pub fn transit(&mut self, server: SocketAddrV4, next: RemapState) -> bool {
        if self.can_transit_to(next) {
            *self = next;
            true
        } else {
            warn!(server = %server, from = %self, to = %next, "illegal remap transition rejected");
            false
        }
    }
}

impl fmt::Display for RemapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for RemapState {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        use RemapState::*;
        Ok(match value {
            0 => Undefined,
            1 => Normal,
            2 => Intermediate,
            3 => Coordinated,
            4 => Degraded,
            5 => WaitDegraded,
            6 => WaitNormal,
            _ => return Err(Error::Message(format!("unknown remap state {}", value))),
        })
    }
}

/// Role of a bus member, encoded as the prefix of its name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Coordinator,
    Router,
    Server,
}

impl Role {
    pub fn prefix(&self) -> &'static str {
        match self {
            Role::Coordinator => "coordinator",
            Role::Router => "router",
            Role::Server => "server",
        }
    }

    /// Member name for the `id`-th participant of this role
    pub fn member(&self, id: impl fmt::Display) -> String {
        format!("{}{}", self.prefix(), id)
    }

    /// Role of a member, from its name
    pub fn of(member: &str) -> Option<Role> {
        [Role::Coordinator, Role::Router, Role::Server]
            .into_iter()
            .find(|role| member.starts_with(role.prefix()))
    }
}

/// Something delivered by the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Message {
        sender: String,
        group: String,
        payload: Vec<u8>,
    },
    Membership {
        group: String,
        member: String,
        joined: bool,
        /// Members of the group after the change
        members: Vec<String>,
    },
}

/// Group communication used to exchange remap states
///
/// Delivery is reliable and totally ordered per group; a member receives
/// its own multicasts.
pub trait GroupBus: Send + Sync {
    /// Register a member and return its mailbox
    fn connect(&self, member: &str) -> Result<Receiver<BusEvent>>;

    /// Drop a member from every group it joined
    fn disconnect(&self, member: &str) -> Result<()>;

    fn join(&self, member: &str, group: &str) -> Result<()>;

    fn leave(&self, member: &str, group: &str) -> Result<()>;

    /// Deliver `payload` once to every member of any of `groups`
    fn multicast(&self, sender: &str, groups: &[&str], payload: &[u8]) -> Result<()>;
}

/// Read access to remap states, as needed by request planning
pub trait RemapStateView {
    /// Requests to `server` must take the coordinator-mediated path
    fn use_coordinated_flow(&self, server: SocketAddrV4) -> bool;

    /// Requests to `server` may be redirected elsewhere
    fn allow_remapping(&self, server: SocketAddrV4) -> bool;
}
