//! Coordination loop.
//!
//! The [`Controller`] owns the topology store, the membership view and the
//! device adapters. Device events and inbound gossip are handled one at a
//! time in arrival order; nothing else touches that state, so none of it is
//! behind a lock. Other tasks talk to the loop through a [`ControllerHandle`].
//!
//! A locally observed change runs: adapter update, store mutation,
//! broadcast (when this controller owns the device), recomputation, rule
//! sync. A change received from a peer runs the same steps minus the
//! broadcast.

use std::collections::BTreeMap;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

use crate::config::Config;
use crate::device::{DeviceAdapter, PacketOutcome};
use crate::error::{Error, Result};
use crate::gossip::{GossipCodec, GossipEvent, Inbound};
use crate::ownership::Membership;
use crate::routing::RouteEngine;
use crate::topology::{TopologySnapshot, TopologyStore};
use crate::transport::GossipTransport;
use crate::types::{
    ChannelHandle, DeviceEvent, DeviceId, Endpoint, HostAddr, Node, PortInfo, PortNo,
};

/// One unit of work for the loop.
enum Input {
    Device(DeviceEvent),
    Gossip(Inbound),
    Tick,
}

/// Cloneable access to a running [`Controller`].
#[derive(Clone)]
pub struct ControllerHandle {
    events: mpsc::Sender<DeviceEvent>,
    shutdown: watch::Sender<bool>,
    snapshots: watch::Receiver<TopologySnapshot>,
}

impl ControllerHandle {
    /// Queues a device event for the loop.
    pub async fn send(&self, event: DeviceEvent) -> Result<()> {
        self.events.send(event).await.map_err(|_| Error::QueueClosed)
    }

    pub fn events(&self) -> mpsc::Sender<DeviceEvent> {
        self.events.clone()
    }

    /// Asks the loop to stop after the event it is currently handling.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Read-only view of the topology, updated after every handled event.
    pub fn snapshots(&self) -> watch::Receiver<TopologySnapshot> {
        self.snapshots.clone()
    }
}

pub struct Controller<T> {
    group: String,
    topology: TopologyStore,
    membership: Membership,
    devices: BTreeMap<DeviceId, DeviceAdapter>,
    codec: GossipCodec,
    transport: T,
    device_rx: mpsc::Receiver<DeviceEvent>,
    shutdown: watch::Receiver<bool>,
    snapshots: watch::Sender<TopologySnapshot>,
    poll_interval: Duration,
    clear_rules_on_connect: bool,
}

impl<T: GossipTransport> Controller<T> {
    pub fn new(cfg: &Config, transport: T) -> (Self, ControllerHandle) {
        let (events_tx, device_rx) = mpsc::channel(cfg.event_queue.max(1));
        let (shutdown_tx, shutdown) = watch::channel(false);
        let (snapshots, snapshots_rx) = watch::channel(TopologySnapshot {
            controller: cfg.controller_id,
            ..Default::default()
        });

        let controller = Self {
            group: cfg.group.clone(),
            topology: TopologyStore::new(),
            membership: Membership::new(cfg.controller_id),
            devices: BTreeMap::new(),
            codec: GossipCodec::new(&cfg.cluster_secret),
            transport,
            device_rx,
            shutdown,
            snapshots,
            poll_interval: Duration::from_millis(cfg.poll_interval_ms.max(1)),
            clear_rules_on_connect: cfg.clear_rules_on_connect,
        };
        let handle = ControllerHandle {
            events: events_tx,
            shutdown: shutdown_tx,
            snapshots: snapshots_rx,
        };
        (controller, handle)
    }

    pub fn topology(&self) -> &TopologyStore {
        &self.topology
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn device(&self, id: DeviceId) -> Option<&DeviceAdapter> {
        self.devices.get(&id)
    }

    /// Runs until shut down. Pending broadcasts are not flushed on exit.
    pub async fn run(mut self) {
        if let Err(e) = self.transport.join(&self.group).await {
            warn!("failed to join gossip group {}: {}", self.group, e);
        }
        info!(
            "controller {} running in group {}",
            self.membership.local_id(),
            self.group
        );

        let mut tick = interval(self.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut devices_open = true;
        let mut gossip_open = true;

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let input = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        // Every handle is gone; nobody can stop us later.
                        break;
                    }
                    continue;
                }
                event = self.device_rx.recv(), if devices_open => match event {
                    Some(event) => Input::Device(event),
                    None => {
                        debug!("device event queue closed");
                        devices_open = false;
                        continue;
                    }
                },
                inbound = self.transport.recv(), if gossip_open => match inbound {
                    Some(inbound) => Input::Gossip(inbound),
                    None => {
                        warn!("gossip transport closed");
                        gossip_open = false;
                        continue;
                    }
                },
                _ = tick.tick() => Input::Tick,
            };

            match input {
                Input::Device(event) => self.handle_device_event(event).await,
                Input::Gossip(inbound) => self.handle_gossip(inbound),
                Input::Tick => {
                    debug!(
                        "alive: {} node(s), {} link(s), {} peer(s)",
                        self.topology.node_count(),
                        self.topology.link_count(),
                        self.membership.len()
                    );
                }
            }
        }
        info!("controller {} stopped", self.membership.local_id());
    }

    /// Handles one notification from the device-facing collaborator.
    pub async fn handle_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::ConnectionUp { device, channel } => self.connection_up(device, channel),
            DeviceEvent::ConnectionDown { device } => self.connection_down(device),
            DeviceEvent::PacketIn {
                device,
                src,
                in_port,
                ..
            } => self.local_host_seen(device, src, in_port).await,
            DeviceEvent::LinkEvent { added, a, b } => self.local_link_event(added, a, b).await,
        }
        self.publish();
    }

    /// Handles one event from the gossip transport. Never re-broadcasts.
    pub fn handle_gossip(&mut self, inbound: Inbound) {
        if inbound.group != self.group {
            debug!(
                "ignoring gossip for group {} from {}",
                inbound.group, inbound.sender_id
            );
            return;
        }
        let event = match self.codec.decode(&inbound) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    "dropping gossip from {} ({}): {}",
                    inbound.sender_id, inbound.sender_name, e
                );
                return;
            }
        };
        debug!("gossip {} from {}", event.kind(), inbound.sender_id);

        match event {
            GossipEvent::Join {
                controller, name, ..
            } => {
                if self.membership.join(controller, &name) {
                    // Ownership may have moved.
                    self.recompute();
                }
            }
            GossipEvent::HostSeen { device, host, port } => {
                if self.apply_host_seen(device, host, port) {
                    self.recompute();
                }
            }
            GossipEvent::LinkEvent { added, a, b } => {
                if self.apply_link_event(added, a, b) {
                    self.recompute();
                }
            }
        }
        self.publish();
    }

    fn connection_up(&mut self, device: DeviceId, channel: ChannelHandle) {
        if let Some(adapter) = self.devices.get_mut(&device) {
            warn!(
                "already know device {:#x}, setting new connection object",
                device
            );
            adapter.set_channel(&channel);
            return;
        }
        info!("controlling device {:#x}", device);
        let mut adapter = DeviceAdapter::new(device, &channel);
        if self.clear_rules_on_connect {
            adapter.clear_rules();
        }
        self.devices.insert(device, adapter);
        self.topology.add_device(device);
        self.recompute();
    }

    fn connection_down(&mut self, device: DeviceId) {
        if self.devices.remove(&device).is_none() {
            debug!("disconnect from unknown device {:#x}", device);
        }
        match self.topology.remove_device(device) {
            Ok(()) => {
                info!("device {:#x} disconnected", device);
                self.recompute();
            }
            Err(e) => warn!("{}", e),
        }
    }

    async fn local_host_seen(&mut self, device: DeviceId, host: HostAddr, port: PortNo) {
        if !self.apply_host_seen(device, host, port) {
            return;
        }
        if self.membership.owns(device) {
            self.broadcast(GossipEvent::HostSeen { device, host, port }).await;
        }
        self.recompute();
    }

    /// Adds `host` behind `device`:`port`. Returns `true` if the topology
    /// changed.
    fn apply_host_seen(&mut self, device: DeviceId, host: HostAddr, port: PortNo) -> bool {
        match self.devices.get_mut(&device) {
            Some(adapter) => {
                adapter.on_packet_seen(&mut self.topology, host, port) == PacketOutcome::Attached
            }
            None => {
                let new_host = self.topology.add_host(host);
                let new_link = self.topology.add_link(
                    Node::Device(device),
                    Node::Host(host),
                    PortInfo::host(port),
                );
                new_host || new_link
            }
        }
    }

    async fn local_link_event(&mut self, added: bool, a: Endpoint, b: Endpoint) {
        debug!(
            "link {} event: {} <-> {}",
            if added { "up" } else { "down" },
            a,
            b
        );
        let changed = self.apply_link_event(added, a, b);
        if self.membership.owns(a.device) || self.membership.owns(b.device) {
            self.broadcast(GossipEvent::LinkEvent { added, a, b }).await;
        }
        if changed {
            self.recompute();
        }
    }

    /// Applies a link change to whichever endpoints are connected here and
    /// to the store. Returns `true` if anything changed.
    fn apply_link_event(&mut self, added: bool, a: Endpoint, b: Endpoint) -> bool {
        let mut changed = false;
        let mut handled = false;
        for (near, far) in [(a, b), (b, a)] {
            let Some(adapter) = self.devices.get_mut(&near.device) else {
                continue;
            };
            handled = true;
            if added {
                changed |= adapter.on_uplink_added(
                    &mut self.topology,
                    near.port,
                    far.device,
                    far.port,
                );
            } else {
                match adapter.on_uplink_removed(&mut self.topology, near.port, far.device) {
                    Ok(()) => changed = true,
                    Err(e) => debug!("{:#x}: {}", near.device, e),
                }
            }
        }
        if handled {
            if !added && !changed {
                warn!("link {} <-> {} already gone", a, b);
            }
            return changed;
        }

        let (na, nb) = (Node::Device(a.device), Node::Device(b.device));
        if added {
            self.topology
                .add_link(na, nb, PortInfo::uplink(a.port, b.port))
        } else {
            match self.topology.remove_link(na, nb) {
                Ok(()) => true,
                Err(e) => {
                    warn!("{}", e);
                    false
                }
            }
        }
    }

    async fn broadcast(&self, event: GossipEvent) {
        let payload = match self.codec.encode(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode {}: {}", event.kind(), e);
                return;
            }
        };
        if let Err(e) = self.transport.broadcast(&self.group, payload).await {
            warn!("failed to broadcast {}: {}", event.kind(), e);
        }
    }

    /// Recomputes all routes and syncs owned, connected devices.
    fn recompute(&mut self) {
        let membership = &self.membership;
        let intents =
            RouteEngine::recompute(&self.topology, &self.devices, |d| membership.owns(d));
        for (id, adapter) in self.devices.iter_mut() {
            if membership.owns(*id) {
                adapter.sync_rules(&intents);
            }
        }
    }

    fn publish(&self) {
        let snapshot = self
            .topology
            .snapshot(self.membership.local_id(), self.membership.peer_ids());
        self.snapshots.send_replace(snapshot);
    }
}
