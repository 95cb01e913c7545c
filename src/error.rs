//! Error types for the controller core.
//!
//! None of these are fatal: the coordination loop logs them and moves on
//! to the next event.

use crate::types::Node;

/// Errors produced by the topology store, gossip codec and transports.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Neither orientation of the edge is present in the graph.
    #[error("no link between {0} and {1}")]
    LinkNotFound(Node, Node),

    #[error("{0} is not in the topology")]
    NodeNotFound(Node),

    /// A gossip body that is not valid JSON for a topology update.
    #[error("malformed gossip payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// Authentication tag missing or computed with a different cluster secret.
    #[error("gossip payload failed authentication")]
    BadTag,

    #[error("unexpected gossip event kind {0}")]
    UnexpectedKind(&'static str),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid host address {0:?}")]
    InvalidHostAddr(String),

    /// The coordination loop is gone.
    #[error("controller event queue closed")]
    QueueClosed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
