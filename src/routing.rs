//! Shortest-path route computation.
//!
//! Every recomputation walks all owned devices and all known hosts and
//! resolves the first hop of a minimum-hop path into an output port. There
//! is no incremental update: topology changes are rare next to lookups.

use std::collections::BTreeMap;

use log::debug;

use crate::device::DeviceAdapter;
use crate::topology::TopologyStore;
use crate::types::{DeviceId, Node, RuleIntent};

pub struct RouteEngine;

impl RouteEngine {
    /// Computes one rule intent per reachable (owned device, host) pair.
    ///
    /// A device is routed only if `owns` accepts it and it has an adapter,
    /// since ports are resolved from the adapter's neighbour and uplink
    /// tables. Unreachable hosts and unresolvable first hops are skipped.
    pub fn recompute<F>(
        store: &TopologyStore,
        devices: &BTreeMap<DeviceId, DeviceAdapter>,
        owns: F,
    ) -> Vec<RuleIntent>
    where
        F: Fn(DeviceId) -> bool,
    {
        let hosts = store.hosts();
        let mut intents = Vec::new();

        for device in store.devices() {
            if !owns(device) {
                continue;
            }
            let Some(adapter) = devices.get(&device) else {
                debug!("{:#x}: owned but not connected here, no routes", device);
                continue;
            };
            debug!("-- next hops for {:#x}", device);

            for &host in &hosts {
                let Some(path) = store.shortest_path(Node::Device(device), Node::Host(host)) else {
                    continue;
                };
                if path.len() < 2 {
                    continue;
                }
                let port = match path[1] {
                    Node::Host(neighbour) => adapter.neighbour_port(neighbour),
                    Node::Device(next) => adapter.uplink_to(next),
                };
                match port {
                    Some(port) => {
                        debug!("from {:#x} to {}: {} via port {}", device, host, path[1], port);
                        intents.push(RuleIntent {
                            device,
                            destination: host,
                            port,
                        });
                    }
                    None => debug!(
                        "from {:#x} to {}: no port towards {}",
                        device, host, path[1]
                    ),
                }
            }
        }
        intents
    }
}
