//! # Echomix Node
//!
//! The runtime half of the Echomix mix network: a [`MixNode`] accepts
//! onion packets, peels one layer, waits the sender-chosen delay and
//! forwards; a [`Provider`] is a mix that additionally registers clients,
//! buffers messages for them in per-client inboxes, and flushes an inbox
//! when its owner pulls with a valid bearer token.
//!
//! Every accepted connection is an independent task; a packet's delay
//! timer never blocks the accept loop.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod config;
pub mod inbox;
pub mod mix;
pub mod provider;
pub mod replay;

pub use config::NodeConfig;
pub use inbox::InboxStore;
pub use mix::MixNode;
pub use provider::{FetchOutcome, Provider};
pub use replay::ReplayGuard;

use thiserror::Error;

/// Errors produced by the node runtimes.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Packet processing failed.
    #[error("sphinx error: {0}")]
    Sphinx(#[from] echomix_sphinx::SphinxError),

    /// Envelope or dial failure.
    #[error("transport error: {0}")]
    Transport(#[from] echomix_transport::TransportError),

    /// Filesystem or socket failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Request body (de)serialization failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The packet's replay tag was seen before; dropped.
    #[error("packet replay detected")]
    Replay,

    /// The in-flight ceiling was hit; the packet was shed.
    #[error("too many packets in flight")]
    Backpressure,

    /// A final-flagged packet arrived at a mix with no inbox storage.
    #[error("final hop reached a node that is not a provider")]
    NotAProvider,

    /// Store targeted an id that never registered here.
    #[error("no inbox for recipient {0}")]
    UnknownRecipient(String),

    /// An id contained characters that are not allowed in inbox paths.
    #[error("invalid identifier {0:?}")]
    InvalidId(String),
}

/// Result alias for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
