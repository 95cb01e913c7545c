//! Distributed shortest-path controller core.
//!
//! Several controller instances each own a share of the forwarding devices
//! and replicate one topology graph between them over gossip. Every instance
//! computes next hops for the devices it owns and programs them through an
//! external control channel.

pub mod auth;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod gossip;
pub mod ownership;
pub mod routing;
pub mod runtime;
pub mod topology;
pub mod transport;
pub mod types;

pub use auth::ClusterSecret;
pub use config::Config;
pub use controller::{Controller, ControllerHandle};
pub use device::{ControlChannel, DeviceAdapter, LogChannel};
pub use error::{Error, Result};
pub use gossip::{GossipCodec, GossipEvent, Inbound, InboundKind};
pub use ownership::Membership;
pub use routing::RouteEngine;
pub use topology::{TopologySnapshot, TopologyStore};
pub use transport::{GossipTransport, MemoryBus, MemoryTransport, UdpTransport};
pub use types::{
    ChannelHandle, ControllerId, DeviceEvent, DeviceId, Endpoint, HostAddr, Node, NodeKind,
    PortInfo, PortNo, RuleIntent,
};
