//! Data structures shared by the topology, routing and gossip layers.
//!
//! Identifiers here double as graph-node keys on every controller, so the
//! serialised forms must round-trip exactly: device ids and ports stay
//! integers and host addresses keep their raw octets.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::ControlChannel;
use crate::error::Error;

/// Datapath id of a forwarding device.
pub type DeviceId = u64;

/// Port number on a forwarding device.
pub type PortNo = u16;

/// Numeric id of a controller instance.
pub type ControllerId = u64;

/// Link-layer address of an end host.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostAddr(pub [u8; 6]);

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostAddr({})", self)
    }
}

impl FromStr for HostAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.replace(['-', ':'], ""))
            .map_err(|_| Error::InvalidHostAddr(s.to_string()))?;
        let octets: [u8; 6] = raw
            .try_into()
            .map_err(|_| Error::InvalidHostAddr(s.to_string()))?;
        Ok(HostAddr(octets))
    }
}

impl TryFrom<String> for HostAddr {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HostAddr> for String {
    fn from(addr: HostAddr) -> Self {
        addr.to_string()
    }
}

/// Key of a node in the topology graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Node {
    Device(DeviceId),
    Host(HostAddr),
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Device(id) => write!(f, "device {:#x}", id),
            Node::Host(addr) => write!(f, "host {}", addr),
        }
    }
}

/// What a node stands for. Fixed the first time the node is inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A device connected to this controller.
    Device,
    /// A device only known through links or gossip.
    RemoteDevice,
    Host,
}

/// Port annotation of a link, seen from the endpoint that inserted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub local: PortNo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<PortNo>,
}

impl PortInfo {
    pub fn host(port: PortNo) -> Self {
        Self {
            local: port,
            remote: None,
        }
    }

    pub fn uplink(local: PortNo, remote: PortNo) -> Self {
        Self {
            local,
            remote: Some(remote),
        }
    }
}

/// One side of a device-to-device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub device: DeviceId,
    pub port: PortNo,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{}", self.device, self.port)
    }
}

/// Request to forward traffic for `destination` out of `port` on `device`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleIntent {
    pub device: DeviceId,
    pub destination: HostAddr,
    pub port: PortNo,
}

/// Notification delivered by the device-facing collaborator.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    ConnectionUp {
        device: DeviceId,
        channel: ChannelHandle,
    },
    ConnectionDown {
        device: DeviceId,
    },
    PacketIn {
        device: DeviceId,
        src: HostAddr,
        dst: HostAddr,
        in_port: PortNo,
    },
    LinkEvent {
        added: bool,
        a: Endpoint,
        b: Endpoint,
    },
}

/// Control-channel handle as owned by the device-facing collaborator.
#[derive(Clone)]
pub struct ChannelHandle(pub Arc<dyn ControlChannel>);

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChannelHandle")
    }
}
