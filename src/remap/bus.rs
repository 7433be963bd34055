//! In-process group bus

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{BusEvent, GroupBus};
use crate::{Error, Result};

#[derive(Default)]
struct Registry {
    mailboxes: HashMap<String, Sender<BusEvent>>,
    groups: BTreeMap<String, BTreeSet<String>>,
}

impl Registry {
    fn members(&self, group: &str) -> Vec<String> {
        self.groups
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn announce(&self, group: &str, member: &str, joined: bool) {
        let members = self.members(group);
        // The leaving member has already been removed, but still learns it left
        let mut recipients = members.clone();
        if !joined {
            recipients.push(member.to_string());
        }
        for recipient in &recipients {
            if let Some(mailbox) = self.mailboxes.get(recipient) {
                let event = BusEvent::Membership {
                    group: group.to_string(),
                    member: member.to_string(),
                    joined,
                    members: members.clone(),
                };
                if mailbox.send(event).is_err() {
                    debug!(group, member, recipient = %recipient, "membership not delivered, mailbox closed");
                }
            }
        }
    }
}

/// Bus connecting handlers that live in the same process
///
/// One lock serializes every operation, so all members observe the same
/// order of messages and membership changes.
#[derive(Default)]
pub struct LocalBus {
    registry: Mutex<Registry>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current members of a group
    pub fn members(&self, group: &str) -> Vec<String> {
        self.registry.lock().members(group)
    }
}

impl GroupBus for LocalBus {
    fn connect(&self, member: &str) -> Result<Receiver<BusEvent>> {
        let mut registry = self.registry.lock();
        if registry.mailboxes.contains_key(member) {
            return Err(Error::Bus(format!("member {} already connected", member)));
        }
        let (tx, rx) = unbounded();
        registry.mailboxes.insert(member.to_string(), tx);
        debug!(member, "bus member connected");
        Ok(rx)
    }

    fn disconnect(&self, member: &str) -> Result<()> {
        let mut registry = self.registry.lock();
        let joined: Vec<String> = registry
            .groups
            .iter()
            .filter(|(_, members)| members.contains(member))
            .map(|(group, _)| group.clone())
            .collect();
        for group in joined {
            if let Some(members) = registry.groups.get_mut(&group) {
                members.remove(member);
            }
            registry.announce(&group, member, false);
        }
        registry
            .mailboxes
            .remove(member)
            .map(|_| ())
            .ok_or_else(|| Error::Bus(format!("unknown member {}", member)))
    }

    fn join(&self, member: &str, group: &str) -> Result<()> {
        let mut registry = self.registry.lock();
        if !registry.mailboxes.contains_key(member) {
            return Err(Error::Bus(format!("unknown member {}", member)));
        }
        let inserted = registry
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(member.to_string());
        if inserted {
            registry.announce(group, member, true);
        }
        Ok(())
    }

    fn leave(&self, member: &str, group: &str) -> Result<()> {
        let mut registry = self.registry.lock();
        let removed = registry
            .groups
            .get_mut(group)
            .map_or(false, |members| members.remove(member));
        if !removed {
            return Err(Error::Bus(format!("{} is not a member of {}", member, group)));
        }
        registry.announce(group, member, false);
        Ok(())
    }

    fn multicast(&self, sender: &str, groups: &[&str], payload: &[u8]) -> Result<()> {
        let registry = self.registry.lock();
        if !registry.mailboxes.contains_key(sender) {
            return Err(Error::Bus(format!("unknown member {}", sender)));
        }

        let mut delivered = BTreeSet::new();
        for group in groups {
            for member in registry.members(group) {
                if !delivered.insert(member.clone()) {
                    continue;
                }
                if let Some(mailbox) = registry.mailboxes.get(&member) {
                    trace!(sender, group = *group, member = %member, "deliver");
                    let event = BusEvent::Message {
                        sender: sender.to_string(),
                        group: group.to_string(),
                        payload: payload.to_vec(),
                    };
                    if mailbox.send(event).is_err() {
                        warn!(sender, group = *group, member = %member, "delivery failed, mailbox closed");
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &Receiver<BusEvent>) -> Vec<BusEvent> {
        rx.try_iter().collect()
    }

    #[test]
    fn test_membership_events() {
        let bus = LocalBus::new();
        let a = bus.connect("router1").unwrap();
        let b = bus.connect("router2").unwrap();
        bus.join("router1", "routers").unwrap();
        bus.join("router2", "routers").unwrap();

        let seen_by_a = drain(&a);
        assert_eq!(seen_by_a.len(), 2);
        assert_eq!(
            seen_by_a[1],
            BusEvent::Membership {
                group: "routers".into(),
                member: "router2".into(),
                joined: true,
                members: vec!["router1".into(), "router2".into()],
            }
        );
        assert_eq!(drain(&b).len(), 1);

        bus.leave("router1", "routers").unwrap();
        assert!(matches!(drain(&a).as_slice(), [BusEvent::Membership { joined: false, .. }]));
        assert!(matches!(
            drain(&b).as_slice(),
            [BusEvent::Membership { joined: false, members, .. }] if members == &vec!["router2".to_string()]
        ));
    }

    #[test]
    fn test_multicast_delivers_once_per_member() {
        let bus = LocalBus::new();
        let coordinator = bus.connect("coordinator").unwrap();
        let router = bus.connect("router1").unwrap();
        bus.join("coordinator", "coordinators").unwrap();
        bus.join("coordinator", "routers").unwrap();
        bus.join("router1", "routers").unwrap();
        drain(&coordinator);
        drain(&router);

        bus.multicast("router1", &["coordinators", "routers"], b"ack").unwrap();
        let got = drain(&coordinator);
        assert_eq!(got.len(), 1);
        assert!(matches!(&got[0], BusEvent::Message { sender, payload, .. } if sender == "router1" && payload == b"ack"));
        // The sender hears itself
        assert_eq!(drain(&router).len(), 1);
    }

    #[test]
    fn test_closed_mailbox_does_not_stop_delivery() {
        let bus = LocalBus::new();
        let coordinator = bus.connect("coordinator").unwrap();
        let gone = bus.connect("router1").unwrap();
        let router = bus.connect("router2").unwrap();
        for member in ["coordinator", "router1", "router2"] {
            bus.join(member, "routers").unwrap();
        }
        drop(gone);
        drain(&coordinator);
        drain(&router);

        // router1 never disconnected, so it is still a member with a dead mailbox
        assert_eq!(bus.members("routers").len(), 3);
        bus.multicast("coordinator", &["routers"], b"state").unwrap();
        assert!(matches!(drain(&coordinator).as_slice(), [BusEvent::Message { .. }]));
        assert!(matches!(
            drain(&router).as_slice(),
            [BusEvent::Message { payload, .. }] if payload == b"state"
        ));

        // Membership changes still reach the live members
        bus.leave("router2", "routers").unwrap();
        assert!(matches!(
            drain(&coordinator).as_slice(),
            [BusEvent::Membership { member, joined: false, .. }] if member == "router2"
        ));
    }

    #[test]
    fn test_unknown_members_rejected() {
        let bus = LocalBus::new();
        assert!(bus.join("ghost", "routers").is_err());
        assert!(bus.multicast("ghost", &["routers"], b"x").is_err());
        bus.connect("router1").unwrap();
        assert!(bus.connect("router1").is_err());
        assert!(bus.leave("router1", "routers").is_err());
    }

    #[test]
    fn test_disconnect_leaves_all_groups() {
        let bus = LocalBus::new();
        let watcher = bus.connect("coordinator").unwrap();
        bus.connect("server1").unwrap();
        bus.join("coordinator", "servers").unwrap();
        bus.join("server1", "servers").unwrap();
        drain(&watcher);

        bus.disconnect("server1").unwrap();
        assert_eq!(bus.members("servers"), vec!["coordinator".to_string()]);
        assert!(matches!(
            drain(&watcher).as_slice(),
            [BusEvent::Membership { member, joined: false, .. }] if member == "server1"
        ));
    }
}
