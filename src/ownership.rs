//! Controller membership and device ownership.
//!
//! Devices are split across controllers with a plain modulo over the number
//! of known peers plus one slot for ourselves. The result is recomputed on
//! every call. When the membership grows, devices can move to a different
//! owner; rules the old owner already installed stay where they are.

use std::collections::BTreeMap;

use log::info;

use crate::types::{ControllerId, DeviceId};

/// Peer controllers seen in join announcements. Append-only: there is no
/// leave protocol, so a peer stays here for the life of the process.
#[derive(Debug, Clone)]
pub struct Membership {
    local_id: ControllerId,
    peers: BTreeMap<ControllerId, String>,
}

impl Membership {
    pub fn new(local_id: ControllerId) -> Self {
        Self {
            local_id,
            peers: BTreeMap::new(),
        }
    }

    pub fn local_id(&self) -> ControllerId {
        self.local_id
    }

    /// Records a peer. Returns `true` if it was not known yet. Our own id is
    /// never recorded as a peer.
    pub fn join(&mut self, id: ControllerId, name: &str) -> bool {
        if id == self.local_id || self.peers.contains_key(&id) {
            return false;
        }
        self.peers.insert(id, name.to_string());
        info!(
            "controller {} ({}) joined, {} peer(s) known",
            id,
            name,
            self.peers.len()
        );
        true
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn name(&self, id: ControllerId) -> Option<&str> {
        self.peers.get(&id).map(String::as_str)
    }

    pub fn peer_ids(&self) -> Vec<ControllerId> {
        self.peers.keys().copied().collect()
    }

    /// Whether this controller is responsible for `device`.
    pub fn owns(&self, device: DeviceId) -> bool {
        owner_of(device, self.peers.len()) == self.local_id
    }
}

/// Slot a device falls into given `peer_count` other controllers.
pub fn owner_of(device: DeviceId, peer_count: usize) -> ControllerId {
    device % (peer_count as u64 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(ids: &[ControllerId]) -> Vec<Membership> {
        ids.iter()
            .map(|&local| {
                let mut m = Membership::new(local);
                for &peer in ids {
                    m.join(peer, &format!("c{}", peer));
                }
                m
            })
            .collect()
    }

    #[test]
    fn alone_owns_everything_in_slot_zero() {
        let m = Membership::new(0);
        assert!(m.owns(0));
        assert!(m.owns(17));
        assert!(!Membership::new(1).owns(17));
    }

    #[test]
    fn join_ignores_self_and_duplicates() {
        let mut m = Membership::new(3);
        assert!(!m.join(3, "me"));
        assert!(m.join(1, "one"));
        assert!(!m.join(1, "renamed"));
        assert_eq!(m.len(), 1);
        assert_eq!(m.name(1), Some("one"));
    }

    #[test]
    fn owns_is_stable_for_fixed_membership() {
        let m = cluster(&[0, 1, 2]).remove(1);
        for device in 0..64 {
            let first = m.owns(device);
            assert_eq!(first, m.owns(device));
        }
    }

    #[test]
    fn two_controllers_split_by_parity() {
        let members = cluster(&[0, 1]);
        assert!(members[0].owns(4));
        assert!(!members[1].owns(4));
        assert!(members[1].owns(7));
        assert!(!members[0].owns(7));
    }

    #[test]
    fn exactly_one_owner_in_complete_membership() {
        for size in 1..6u64 {
            let ids: Vec<ControllerId> = (0..size).collect();
            let members = cluster(&ids);
            for device in 0..200 {
                let owners = members.iter().filter(|m| m.owns(device)).count();
                assert_eq!(owners, 1, "device {} with {} controllers", device, size);
            }
        }
    }

    #[test]
    fn growth_can_move_ownership() {
        let mut m = Membership::new(0);
        m.join(1, "one");
        assert!(m.owns(4));
        m.join(2, "two");
        // 4 mod 3 == 1
        assert!(!m.owns(4));
    }
}
