//! Gossip codec for topology updates.
//!
//! Locally observed mutations are broadcast to the controller group as
//! JSON bodies tagged by `kind`. Each body is prefixed with an HMAC tag
//! keyed by the cluster secret, so controllers configured with a different
//! secret ignore each other. Join announcements come from
//! the transport's membership notifications and carry no body.

use serde::{Deserialize, Serialize};

use crate::auth::ClusterSecret;
use crate::error::{Error, Result};
use crate::types::{ControllerId, DeviceId, Endpoint, HostAddr, PortNo};

/// Event exchanged between controllers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GossipEvent {
    /// `host` was first seen on `device` at `port`.
    HostSeen {
        device: DeviceId,
        host: HostAddr,
        port: PortNo,
    },
    /// A device-to-device link came up or went down.
    LinkEvent { added: bool, a: Endpoint, b: Endpoint },
    /// A controller entered the group.
    Join {
        controller: ControllerId,
        name: String,
        group: String,
    },
}

impl GossipEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            GossipEvent::HostSeen { .. } => "HOST_SEEN",
            GossipEvent::LinkEvent { .. } => "LINK_EVENT",
            GossipEvent::Join { .. } => "JOIN",
        }
    }
}

/// How an inbound transport event was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboundKind {
    /// A peer entered a group.
    Join,
    /// A peer broadcast a payload to a group.
    Shout,
}

/// Raw event yielded by a gossip transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inbound {
    pub kind: InboundKind,
    pub sender_id: ControllerId,
    pub sender_name: String,
    pub group: String,
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// Encodes outgoing topology updates and decodes inbound transport events.
#[derive(Debug, Clone)]
pub struct GossipCodec {
    secret: ClusterSecret,
}

impl GossipCodec {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: ClusterSecret::from_password(secret),
        }
    }

    /// Frames a topology update for broadcast. Joins are never broadcast.
    pub fn encode(&self, event: &GossipEvent) -> Result<Vec<u8>> {
        if let GossipEvent::Join { .. } = event {
            return Err(Error::UnexpectedKind("JOIN"));
        }
        let body = serde_json::to_vec(event)?;
        Ok(self.secret.seal(&body))
    }

    pub fn decode(&self, inbound: &Inbound) -> Result<GossipEvent> {
        match inbound.kind {
            InboundKind::Join => Ok(GossipEvent::Join {
                controller: inbound.sender_id,
                name: inbound.sender_name.clone(),
                group: inbound.group.clone(),
            }),
            InboundKind::Shout => {
                let body = self
                    .secret
                    .open(&inbound.payload)
                    .ok_or(Error::BadTag)?;
                match serde_json::from_slice(body)? {
                    GossipEvent::Join { .. } => Err(Error::UnexpectedKind("JOIN")),
                    event => Ok(event),
                }
            }
        }
    }
}
