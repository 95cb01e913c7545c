//! In-memory topology graph.
//!
//! The store is an undirected graph of devices and hosts keyed by [`Node`].
//! It is owned by the coordination loop and never shared, so it needs no
//! locking. Inserts are idempotent; removals of absent entries fail softly.

use std::collections::HashMap;

use log::debug;
use petgraph::algo::astar;
use petgraph::graphmap::UnGraphMap;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::types::{ControllerId, DeviceId, HostAddr, Node, NodeKind, PortInfo, PortNo};

/// An edge of the graph together with the endpoint its ports are relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Link {
    pub a: Node,
    pub b: Node,
    pub ports: PortInfo,
}

impl Link {
    /// Port of this link on `node`, if recorded.
    pub fn port_at(&self, node: Node) -> Option<PortNo> {
        if node == self.a {
            Some(self.ports.local)
        } else if node == self.b {
            self.ports.remote
        } else {
            None
        }
    }
}

/// Read-only copy of the graph handed to diagnostics subscribers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TopologySnapshot {
    pub controller: ControllerId,
    pub peers: Vec<ControllerId>,
    pub nodes: Vec<(Node, NodeKind)>,
    pub links: Vec<Link>,
}

impl TopologySnapshot {
    pub fn contains_node(&self, node: Node) -> bool {
        self.nodes.iter().any(|(n, _)| *n == node)
    }

    pub fn contains_link(&self, a: Node, b: Node) -> bool {
        self.links
            .iter()
            .any(|l| (l.a == a && l.b == b) || (l.a == b && l.b == a))
    }
}

#[derive(Debug)]
pub struct TopologyStore {
    graph: UnGraphMap<Node, Link>,
    /// Kind recorded when a node was first seen. Entries outlive node
    /// removal so a node that comes back keeps its kind, which means the
    /// map grows with every node ever seen.
    kinds: HashMap<Node, NodeKind>,
}

impl Default for TopologyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyStore {
    pub fn new() -> Self {
        Self {
            graph: UnGraphMap::new(),
            kinds: HashMap::new(),
        }
    }

    /// Adds a device connected to this controller. Returns `true` if the
    /// node is new.
    pub fn add_device(&mut self, id: DeviceId) -> bool {
        self.insert_node(Node::Device(id), NodeKind::Device)
    }

    /// Adds a device learned from a peer or from the far side of a link.
    pub fn add_remote_device(&mut self, id: DeviceId) -> bool {
        self.insert_node(Node::Device(id), NodeKind::RemoteDevice)
    }

    pub fn add_host(&mut self, addr: HostAddr) -> bool {
        self.insert_node(Node::Host(addr), NodeKind::Host)
    }

    /// Inserts the edge `a`-`b`. Missing endpoints are created first, devices
    /// as remote devices. An edge already present in either orientation is
    /// left untouched and `false` is returned.
    pub fn add_link(&mut self, a: Node, b: Node, ports: PortInfo) -> bool {
        self.ensure_node(a);
        self.ensure_node(b);
        if self.graph.contains_edge(a, b) {
            return false;
        }
        self.graph.add_edge(a, b, Link { a, b, ports });
        debug!("link {} <-> {} added", a, b);
        true
    }

    pub fn remove_device(&mut self, id: DeviceId) -> Result<()> {
        self.remove_node(Node::Device(id))
    }

    pub fn remove_host(&mut self, addr: HostAddr) -> Result<()> {
        self.remove_node(Node::Host(addr))
    }

    /// Removes the edge between `a` and `b`, whichever endpoint inserted it.
    pub fn remove_link(&mut self, a: Node, b: Node) -> Result<()> {
        if self.graph.remove_edge(a, b).is_some() || self.graph.remove_edge(b, a).is_some() {
            debug!("link {} <-> {} removed", a, b);
            return Ok(());
        }
        Err(Error::LinkNotFound(a, b))
    }

    pub fn contains_node(&self, node: Node) -> bool {
        self.graph.contains_node(node)
    }

    pub fn contains_link(&self, a: Node, b: Node) -> bool {
        self.graph.contains_edge(a, b)
    }

    /// Kind of `node`, also known after the node was removed.
    pub fn kind(&self, node: Node) -> Option<NodeKind> {
        self.kinds.get(&node).copied()
    }

    pub fn link(&self, a: Node, b: Node) -> Option<&Link> {
        self.graph.edge_weight(a, b)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn link_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Device ids in ascending order, local and remote alike.
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self
            .graph
            .nodes()
            .filter_map(|n| match n {
                Node::Device(id) => Some(id),
                Node::Host(_) => None,
            })
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn hosts(&self) -> Vec<HostAddr> {
        let mut hosts: Vec<HostAddr> = self
            .graph
            .nodes()
            .filter_map(|n| match n {
                Node::Host(addr) => Some(addr),
                Node::Device(_) => None,
            })
            .collect();
        hosts.sort_unstable();
        hosts
    }

    /// Minimum-hop path from `from` to `to`, both ends included. Among
    /// equal-length paths the first one found wins.
    pub fn shortest_path(&self, from: Node, to: Node) -> Option<Vec<Node>> {
        if !self.graph.contains_node(from) || !self.graph.contains_node(to) {
            return None;
        }
        astar(&self.graph, from, |n| n == to, |_| 1usize, |_| 0)
            .map(|(_, path)| path)
    }

    pub fn snapshot(&self, controller: ControllerId, peers: Vec<ControllerId>) -> TopologySnapshot {
        let mut nodes: Vec<(Node, NodeKind)> = self
            .graph
            .nodes()
            .map(|n| (n, self.kinds.get(&n).copied().unwrap_or(NodeKind::RemoteDevice)))
            .collect();
        nodes.sort_by_key(|(n, _)| *n);
        let links = self.graph.all_edges().map(|(_, _, link)| *link).collect();
        TopologySnapshot {
            controller,
            peers,
            nodes,
            links,
        }
    }

    fn insert_node(&mut self, node: Node, kind: NodeKind) -> bool {
        if self.graph.contains_node(node) {
            return false;
        }
        self.graph.add_node(node);
        // Kind is fixed on first sight, even across remove/re-add.
        self.kinds.entry(node).or_insert(kind);
        debug!("{} added as {:?}", node, self.kinds[&node]);
        true
    }

    fn ensure_node(&mut self, node: Node) {
        match node {
            Node::Device(id) => self.add_remote_device(id),
            Node::Host(addr) => self.add_host(addr),
        };
    }

    fn remove_node(&mut self, node: Node) -> Result<()> {
        if self.graph.remove_node(node) {
            debug!("{} removed", node);
            Ok(())
        } else {
            Err(Error::NodeNotFound(node))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(n: u8) -> HostAddr {
        HostAddr([0, 0, 0, 0, 0, n])
    }

    fn dev(id: DeviceId) -> Node {
        Node::Device(id)
    }

    #[test]
    fn inserts_are_idempotent() {
        let mut store = TopologyStore::new();
        assert!(store.add_device(1));
        assert!(!store.add_device(1));
        assert!(store.add_host(host(1)));
        assert!(!store.add_host(host(1)));
        assert!(store.add_link(dev(1), Node::Host(host(1)), PortInfo::host(3)));
        assert!(!store.add_link(dev(1), Node::Host(host(1)), PortInfo::host(3)));
        assert_eq!(store.node_count(), 2);
        assert_eq!(store.link_count(), 1);
    }

    #[test]
    fn insert_order_does_not_matter() {
        let mut first = TopologyStore::new();
        first.add_device(1);
        first.add_device(2);
        first.add_link(dev(1), dev(2), PortInfo::uplink(1, 2));
        first.add_host(host(9));

        let mut second = TopologyStore::new();
        second.add_host(host(9));
        second.add_link(dev(2), dev(1), PortInfo::uplink(2, 1));
        second.add_device(2);
        second.add_device(1);

        assert_eq!(first.devices(), second.devices());
        assert_eq!(first.hosts(), second.hosts());
        assert_eq!(first.link_count(), second.link_count());
        assert!(second.contains_link(dev(1), dev(2)));
    }

    #[test]
    fn device_links_are_deduplicated_across_orientations() {
        let mut store = TopologyStore::new();
        assert!(store.add_link(dev(1), dev(2), PortInfo::uplink(5, 6)));
        assert!(!store.add_link(dev(2), dev(1), PortInfo::uplink(6, 5)));
        assert_eq!(store.link_count(), 1);

        let link = store.link(dev(2), dev(1)).unwrap();
        assert_eq!(link.port_at(dev(1)), Some(5));
        assert_eq!(link.port_at(dev(2)), Some(6));
    }

    #[test]
    fn add_link_creates_missing_endpoints() {
        let mut store = TopologyStore::new();
        store.add_link(dev(7), Node::Host(host(1)), PortInfo::host(2));
        assert_eq!(store.kind(dev(7)), Some(NodeKind::RemoteDevice));
        assert_eq!(store.kind(Node::Host(host(1))), Some(NodeKind::Host));
    }

    #[test]
    fn node_kind_is_fixed_once_set() {
        let mut store = TopologyStore::new();
        store.add_remote_device(4);
        store.add_device(4);
        assert_eq!(store.kind(dev(4)), Some(NodeKind::RemoteDevice));
    }

    #[test]
    fn kind_survives_node_removal() {
        let mut store = TopologyStore::new();
        store.add_remote_device(4);
        store.remove_device(4).unwrap();
        assert!(!store.contains_node(dev(4)));
        assert_eq!(store.kind(dev(4)), Some(NodeKind::RemoteDevice));

        assert!(store.add_device(4));
        assert_eq!(store.kind(dev(4)), Some(NodeKind::RemoteDevice));
    }

    #[test]
    fn remove_link_either_orientation() {
        let mut store = TopologyStore::new();
        store.add_link(dev(1), dev(2), PortInfo::uplink(1, 1));
        store.remove_link(dev(2), dev(1)).unwrap();
        assert!(!store.contains_link(dev(1), dev(2)));

        store.add_link(dev(1), dev(2), PortInfo::uplink(1, 1));
        store.remove_link(dev(1), dev(2)).unwrap();
        assert_eq!(store.link_count(), 0);
    }

    #[test]
    fn remove_missing_entries_fail_softly() {
        let mut store = TopologyStore::new();
        store.add_device(1);
        assert!(matches!(
            store.remove_link(dev(1), dev(2)),
            Err(Error::LinkNotFound(_, _))
        ));
        assert!(matches!(
            store.remove_host(host(1)),
            Err(Error::NodeNotFound(_))
        ));
        assert!(store.contains_node(dev(1)));
    }

    #[test]
    fn remove_device_drops_incident_links() {
        let mut store = TopologyStore::new();
        store.add_link(dev(1), dev(2), PortInfo::uplink(1, 1));
        store.add_link(dev(1), Node::Host(host(1)), PortInfo::host(3));
        store.remove_device(1).unwrap();
        assert_eq!(store.link_count(), 0);
        assert!(store.contains_node(Node::Host(host(1))));
    }

    #[test]
    fn shortest_path_prefers_fewer_hops() {
        let mut store = TopologyStore::new();
        // 1 - 2 - 3 - 4 and 1 - 4
        store.add_link(dev(1), dev(2), PortInfo::uplink(1, 1));
        store.add_link(dev(2), dev(3), PortInfo::uplink(2, 1));
        store.add_link(dev(3), dev(4), PortInfo::uplink(2, 1));
        store.add_link(dev(1), dev(4), PortInfo::uplink(2, 2));
        store.add_link(dev(4), Node::Host(host(1)), PortInfo::host(3));

        let path = store.shortest_path(dev(1), Node::Host(host(1))).unwrap();
        assert_eq!(path, vec![dev(1), dev(4), Node::Host(host(1))]);
    }

    #[test]
    fn shortest_path_none_when_disconnected() {
        let mut store = TopologyStore::new();
        store.add_device(1);
        store.add_host(host(1));
        assert!(store.shortest_path(dev(1), Node::Host(host(1))).is_none());
        assert!(store.shortest_path(dev(1), dev(99)).is_none());
    }

    #[test]
    fn snapshot_lists_nodes_and_links() {
        let mut store = TopologyStore::new();
        store.add_device(1);
        store.add_link(dev(1), Node::Host(host(1)), PortInfo::host(3));
        let snap = store.snapshot(0, vec![1]);
        assert_eq!(snap.nodes.len(), 2);
        assert!(snap.contains_node(Node::Host(host(1))));
        assert!(snap.contains_link(Node::Host(host(1)), dev(1)));
        assert_eq!(snap.peers, vec![1]);
    }
}
