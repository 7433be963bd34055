//! Background completion of remap transitions

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Builder, JoinHandle};

use crossbeam_channel::RecvTimeoutError;
use tracing::{error, warn};

use super::coordinator::{CoordinatorRemapHandler, POLL_INTERVAL};
use crate::Result;

/// A transition the coordinator started and a worker must finish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitEvent {
    pub server: SocketAddrV4,
    /// `true` when heading for `Degraded`, `false` when heading back to `Normal`
    pub start: bool,
}

pub struct TransitWorker {
    thread_hdl: JoinHandle<()>,
}

impl TransitWorker {
    pub fn new(handler: Arc<CoordinatorRemapHandler>, exit: Arc<AtomicBool>) -> Result<Self> {
        let thread_hdl = Builder::new()
            .name("remapTransit".to_string())
            .spawn(move || Self::run(&handler, &exit))?;
        Ok(Self { thread_hdl })
    }

    fn run(handler: &CoordinatorRemapHandler, exit: &AtomicBool) {
        let events = handler.transit_events().clone();
        loop {
            if exit.load(Ordering::Relaxed) {
                break;
            }
            match events.recv_timeout(POLL_INTERVAL) {
                Ok(event) => Self::process(handler, event, exit),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn process(handler: &CoordinatorRemapHandler, event: TransitEvent, exit: &AtomicBool) {
        let server = event.server;
        if event.start {
            handler.hooks().degraded_begin(server, handler.is_crashed(server));
        }

        let timeout = handler.config().ack_wait_timeout();
        if !handler.wait_for_acks(server, timeout, exit) {
            if exit.load(Ordering::Relaxed) {
                return;
            }
            warn!(server = %server, ?timeout, "routers did not acknowledge in time, forcing the transition");
        }

        if let Err(err) = handler.finish_transit(event) {
            error!(server = %server, error = %err, "failed to announce transition");
        }
    }

    pub fn join(self) -> thread::Result<()> {
        self.thread_hdl.join()
    }
}
