//! Per-device state and the control channel towards the device.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use log::{debug, info, warn};

use crate::error::Result;
use crate::topology::TopologyStore;
use crate::types::{ChannelHandle, DeviceId, HostAddr, Node, PortInfo, PortNo, RuleIntent};

/// Fire-and-forget rule programming on a forwarding device. Implementations
/// serialise their own sends; nothing is reported back.
pub trait ControlChannel: Send + Sync {
    fn install_rule(&self, device: DeviceId, destination: HostAddr, port: PortNo);
    fn remove_rule(&self, device: DeviceId, destination: HostAddr, port: PortNo);
    fn clear_rules(&self, device: DeviceId);
}

/// Control channel that only logs what it would send.
#[derive(Debug, Default)]
pub struct LogChannel;

impl ControlChannel for LogChannel {
    fn install_rule(&self, device: DeviceId, destination: HostAddr, port: PortNo) {
        info!("{:#x}: install dst={} out={}", device, destination, port);
    }

    fn remove_rule(&self, device: DeviceId, destination: HostAddr, port: PortNo) {
        info!("{:#x}: remove dst={} out={}", device, destination, port);
    }

    fn clear_rules(&self, device: DeviceId) {
        info!("{:#x}: clear all rules", device);
    }
}

/// Result of a packet-seen notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// First sighting of the host on this device; a host link was added.
    Attached,
    /// The host is already bound to a port here.
    Known,
    /// The packet came in on an uplink, so the host lives elsewhere.
    ViaUplink,
}

/// State the controller keeps for one connected device.
pub struct DeviceAdapter {
    id: DeviceId,
    channel: Weak<dyn ControlChannel>,
    /// host -> port it was seen on
    neighbours: HashMap<HostAddr, PortNo>,
    /// local port -> neighbouring device
    uplinks: BTreeMap<PortNo, DeviceId>,
    /// rules requested so far, destination -> output port
    flows: BTreeMap<HostAddr, PortNo>,
}

impl DeviceAdapter {
    pub fn new(id: DeviceId, channel: &ChannelHandle) -> Self {
        Self {
            id,
            channel: Arc::downgrade(&channel.0),
            neighbours: HashMap::new(),
            uplinks: BTreeMap::new(),
            flows: BTreeMap::new(),
        }
    }

    /// Swaps in the handle of a new connection, keeping learned state.
    pub fn set_channel(&mut self, channel: &ChannelHandle) {
        self.channel = Arc::downgrade(&channel.0);
    }

    /// Registers `host` as a neighbour on `in_port`, then adds the host link
    /// to the store. The neighbour entry always exists before the edge does.
    pub fn on_packet_seen(
        &mut self,
        store: &mut TopologyStore,
        host: HostAddr,
        in_port: PortNo,
    ) -> PacketOutcome {
        if self.neighbours.contains_key(&host) {
            return PacketOutcome::Known;
        }
        if self.uplinks.contains_key(&in_port) {
            store.add_host(host);
            debug!("{:#x}: {} seen on uplink port {}", self.id, host, in_port);
            return PacketOutcome::ViaUplink;
        }
        self.neighbours.insert(host, in_port);
        store.add_host(host);
        store.add_link(
            Node::Device(self.id),
            Node::Host(host),
            PortInfo::host(in_port),
        );
        debug!("{:#x}: add host {} on port {}", self.id, host, in_port);
        PacketOutcome::Attached
    }

    /// Records an uplink and inserts the device link. Returns `true` when
    /// either the uplink table or the store changed.
    pub fn on_uplink_added(
        &mut self,
        store: &mut TopologyStore,
        local_port: PortNo,
        peer: DeviceId,
        peer_port: PortNo,
    ) -> bool {
        let previous = self.uplinks.insert(local_port, peer);
        let linked = store.add_link(
            Node::Device(self.id),
            Node::Device(peer),
            PortInfo::uplink(local_port, peer_port),
        );
        previous != Some(peer) || linked
    }

    /// Drops an uplink. The device link leaves the store only once no other
    /// uplink port still leads to `peer`.
    pub fn on_uplink_removed(
        &mut self,
        store: &mut TopologyStore,
        local_port: PortNo,
        peer: DeviceId,
    ) -> Result<()> {
        if self.uplinks.get(&local_port) == Some(&peer) {
            self.uplinks.remove(&local_port);
        }
        if self.uplink_to(peer).is_some() {
            debug!("{:#x}: still linked to {:#x}", self.id, peer);
            return Ok(());
        }
        store.remove_link(Node::Device(self.id), Node::Device(peer))
    }

    pub fn neighbour_port(&self, host: HostAddr) -> Option<PortNo> {
        self.neighbours.get(&host).copied()
    }

    /// Lowest-numbered uplink port leading to `peer`.
    pub fn uplink_to(&self, peer: DeviceId) -> Option<PortNo> {
        self.uplinks
            .iter()
            .find(|(_, dev)| **dev == peer)
            .map(|(&port, _)| port)
    }

    pub fn flows(&self) -> &BTreeMap<HostAddr, PortNo> {
        &self.flows
    }

    pub fn install_rule(&self, destination: HostAddr, port: PortNo) {
        if let Some(channel) = self.channel() {
            channel.install_rule(self.id, destination, port);
        }
    }

    pub fn remove_rule(&self, destination: HostAddr, port: PortNo) {
        if let Some(channel) = self.channel() {
            channel.remove_rule(self.id, destination, port);
        }
    }

    pub fn clear_rules(&mut self) {
        self.flows.clear();
        if let Some(channel) = self.channel() {
            channel.clear_rules(self.id);
        }
    }

    /// Brings the device's rules in line with `intents`: stale destinations
    /// are removed, moved ones re-pointed and new ones installed. Intents for
    /// other devices are ignored.
    pub fn sync_rules(&mut self, intents: &[RuleIntent]) {
        let wanted: BTreeMap<HostAddr, PortNo> = intents
            .iter()
            .filter(|i| i.device == self.id)
            .map(|i| (i.destination, i.port))
            .collect();

        for (&dst, &port) in &self.flows {
            if !wanted.contains_key(&dst) {
                self.remove_rule(dst, port);
            }
        }
        for (&dst, &port) in &wanted {
            match self.flows.get(&dst) {
                Some(&old) if old == port => {}
                Some(&old) => {
                    self.remove_rule(dst, old);
                    self.install_rule(dst, port);
                }
                None => self.install_rule(dst, port),
            }
        }
        self.flows = wanted;
    }

    fn channel(&self) -> Option<Arc<dyn ControlChannel>> {
        let channel = self.channel.upgrade();
        if channel.is_none() {
            warn!("{:#x}: control channel is gone, dropping request", self.id);
        }
        channel
    }
}
