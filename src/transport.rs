//! Group messaging transports used by the gossip layer.
//!
//! A transport joins named groups, broadcasts opaque payloads to them and
//! yields [`Inbound`] events: `JOIN` when a peer enters a group, `SHOUT` for
//! a payload. Delivery is best effort and only ordered per sender.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};

use crate::auth::ClusterSecret;
use crate::error::{Error, Result};
use crate::gossip::{Inbound, InboundKind};
use crate::types::ControllerId;

/// Largest datagram the UDP transport accepts.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Pause after a failed socket read before trying again.
const RECV_BACKOFF: Duration = Duration::from_millis(100);

#[async_trait]
pub trait GossipTransport: Send + Sync {
    /// Enters `group` and announces ourselves to its members.
    async fn join(&mut self, group: &str) -> Result<()>;

    /// Sends `payload` to every other member of `group`.
    async fn broadcast(&self, group: &str, payload: Vec<u8>) -> Result<()>;

    /// Waits for the next inbound event. `None` once the transport is closed.
    async fn recv(&mut self) -> Option<Inbound>;
}

/// In-process message bus shared by several [`MemoryTransport`]s.
#[derive(Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<Inbound>,
    roster: Arc<Mutex<Vec<Inbound>>>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            tx,
            roster: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Creates an endpoint. It receives every message sent after this call.
    pub fn endpoint(&self, id: ControllerId, name: &str) -> MemoryTransport {
        MemoryTransport {
            id,
            name: name.to_string(),
            tx: self.tx.clone(),
            rx: self.tx.subscribe(),
            roster: Arc::clone(&self.roster),
            pending: VecDeque::new(),
        }
    }
}

pub struct MemoryTransport {
    id: ControllerId,
    name: String,
    tx: broadcast::Sender<Inbound>,
    rx: broadcast::Receiver<Inbound>,
    roster: Arc<Mutex<Vec<Inbound>>>,
    /// joins of members that entered before us
    pending: VecDeque<Inbound>,
}

impl MemoryTransport {
    fn send(&self, inbound: Inbound) {
        // No receivers just means nobody else is on the bus yet.
        let _ = self.tx.send(inbound);
    }
}

#[async_trait]
impl GossipTransport for MemoryTransport {
    async fn join(&mut self, group: &str) -> Result<()> {
        let announce = Inbound {
            kind: InboundKind::Join,
            sender_id: self.id,
            sender_name: self.name.clone(),
            group: group.to_string(),
            payload: Vec::new(),
        };
        {
            let mut roster = self.roster.lock().unwrap_or_else(|e| e.into_inner());
            self.pending.extend(
                roster
                    .iter()
                    .filter(|j| j.group == group && j.sender_id != self.id)
                    .cloned(),
            );
            roster.push(announce.clone());
        }
        self.send(announce);
        Ok(())
    }

    async fn broadcast(&self, group: &str, payload: Vec<u8>) -> Result<()> {
        self.send(Inbound {
            kind: InboundKind::Shout,
            sender_id: self.id,
            sender_name: self.name.clone(),
            group: group.to_string(),
            payload,
        });
        Ok(())
    }

    async fn recv(&mut self) -> Option<Inbound> {
        if let Some(join) = self.pending.pop_front() {
            return Some(join);
        }
        loop {
            match self.rx.recv().await {
                Ok(inbound) if inbound.sender_id == self.id => continue,
                Ok(inbound) => return Some(inbound),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("controller {} lagged, {} gossip message(s) lost", self.id, missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Datagram transport over a static peer list.
///
/// Every datagram is a JSON-encoded [`Inbound`] sealed with the cluster
/// secret; datagrams that fail verification are dropped before anything
/// else looks at them. A JOIN from a sender we have not heard from before
/// is answered with our own JOINs, so both sides learn about each other
/// whichever starts first.
pub struct UdpTransport {
    id: ControllerId,
    name: String,
    secret: ClusterSecret,
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
    groups: Vec<String>,
    seen: HashSet<ControllerId>,
    /// Senders still owed our JOINs. Flushed at the start of `recv`.
    replies: VecDeque<SocketAddr>,
}

impl UdpTransport {
    pub async fn bind(
        id: ControllerId,
        name: &str,
        secret: &str,
        bind: SocketAddr,
        peers: Vec<SocketAddr>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(bind).await?;
        debug!("gossip socket bound on {}", socket.local_addr()?);
        Ok(Self {
            id,
            name: name.to_string(),
            secret: ClusterSecret::from_password(secret),
            socket,
            peers,
            groups: Vec::new(),
            seen: HashSet::new(),
            replies: VecDeque::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn frame(&self, kind: InboundKind, group: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
        let inbound = Inbound {
            kind,
            sender_id: self.id,
            sender_name: self.name.clone(),
            group: group.to_string(),
            payload,
        };
        Ok(self.secret.seal(&serde_json::to_vec(&inbound)?))
    }

    fn unframe(&self, datagram: &[u8]) -> Result<Inbound> {
        let body = self.secret.open(datagram).ok_or(Error::BadTag)?;
        Ok(serde_json::from_slice(body)?)
    }

    async fn send_all(&self, datagram: &[u8]) {
        for peer in &self.peers {
            if let Err(e) = self.socket.send_to(datagram, peer).await {
                warn!("gossip send to {} failed: {}", peer, e);
            }
        }
    }

    async fn announce_to(&self, addr: SocketAddr) {
        for group in &self.groups {
            match self.frame(InboundKind::Join, group, Vec::new()) {
                Ok(datagram) => {
                    if let Err(e) = self.socket.send_to(&datagram, addr).await {
                        warn!("join reply to {} failed: {}", addr, e);
                    }
                }
                Err(e) => warn!("failed to encode join: {}", e),
            }
        }
    }

    /// An entry leaves the queue only once its reply went out, so a
    /// cancelled `recv` retries it instead of losing it.
    async fn flush_replies(&mut self) {
        while let Some(&addr) = self.replies.front() {
            self.announce_to(addr).await;
            self.replies.pop_front();
        }
    }
}

#[async_trait]
impl GossipTransport for UdpTransport {
    async fn join(&mut self, group: &str) -> Result<()> {
        if !self.groups.iter().any(|g| g == group) {
            self.groups.push(group.to_string());
        }
        let datagram = self.frame(InboundKind::Join, group, Vec::new())?;
        self.send_all(&datagram).await;
        Ok(())
    }

    async fn broadcast(&self, group: &str, payload: Vec<u8>) -> Result<()> {
        let datagram = self.frame(InboundKind::Shout, group, payload)?;
        self.send_all(&datagram).await;
        Ok(())
    }

    /// Cancel safe: nothing is awaited between taking a datagram off the
    /// socket and returning it.
    async fn recv(&mut self) -> Option<Inbound> {
        self.flush_replies().await;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("gossip receive failed: {}", e);
                    sleep(RECV_BACKOFF).await;
                    continue;
                }
            };
            let inbound = match self.unframe(&buf[..len]) {
                Ok(inbound) => inbound,
                Err(e) => {
                    debug!("dropping datagram from {}: {}", from, e);
                    continue;
                }
            };
            if inbound.sender_id == self.id {
                continue;
            }
            if inbound.kind == InboundKind::Join && self.seen.insert(inbound.sender_id) {
                self.replies.push_back(from);
            }
            return Some(inbound);
        }
    }
}
