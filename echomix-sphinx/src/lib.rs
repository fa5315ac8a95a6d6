//! # Echomix Sphinx
//!
//! Implements the Sphinx onion packet format used by the Echomix mix network.
//! A sender wraps a message into a fixed-size layered packet; every mix node
//! peels exactly one layer, learns only its own routing slot (next hop, hop
//! flag, forwarding delay), and emits a packet that is bit-for-bit the same
//! size as the one it received.
//!
//! ## Packet layout
//!
//! ```text
//! ┌─────────┬──────────────────┬─────────┬──────────────┐
//! │ α (32B) │ β (routing info) │ γ (16B) │ payload (2KB)│
//! └─────────┴──────────────────┴─────────┴──────────────┘
//! ```
//!
//! - **α**: ephemeral Curve25519 point, re-blinded at every hop so that each
//!   node derives its own shared secret without learning the sender's key.
//! - **β**: constant-width stack of encrypted per-hop routing slots, padded
//!   from the hop keystreams so no node learns its position on the path.
//! - **γ**: truncated HMAC over β, verified before any unwrapping happens.
//! - **payload**: keystream-encrypted in layers; the final hop recovers the
//!   plaintext.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod header;
pub mod keys;
pub mod packet;

pub use header::{FINAL_FLAG, MAC_SIZE, MAX_ADDR_SIZE, MAX_HOPS, RELAY_FLAG, ROUTING_INFO_SIZE};
pub use keys::{KeyPair, MontgomeryPoint, Scalar};
pub use packet::{Hop, RoutingAction, SphinxPacket, UnwrapResult, PACKET_SIZE, PAYLOAD_SIZE};

use thiserror::Error;

/// Errors produced while building or unwrapping Sphinx packets.
#[derive(Debug, Error)]
pub enum SphinxError {
    /// A group element failed validation (wrong width, identity, or a
    /// non-contributory shared secret).
    #[error("invalid group element")]
    BadPoint,

    /// The header MAC did not verify; the packet was tampered with or is
    /// addressed to a different node.
    #[error("header MAC verification failed")]
    BadMac,

    /// The decrypted routing slot does not parse as a network endpoint or
    /// recipient identifier.
    #[error("routing block does not parse: {0}")]
    BadRouting(String),

    /// The routing slot carries a hop flag this implementation does not know.
    #[error("unknown hop flag {0:#04x}")]
    BadFlag(u8),

    /// The plaintext does not fit the fixed payload width.
    #[error("payload of {0} bytes exceeds capacity")]
    PayloadTooLarge(usize),

    /// The recovered payload length prefix is inconsistent.
    #[error("payload framing is corrupt")]
    BadPayload,

    /// The requested path is longer than the header can hold.
    #[error("path of {0} hops exceeds the maximum of {MAX_HOPS}")]
    TooManyHops(usize),

    /// A packet cannot be built over an empty path.
    #[error("path must contain at least one hop")]
    EmptyPath,

    /// Raw packet bytes are not exactly one packet wide.
    #[error("expected {PACKET_SIZE} packet bytes, got {0}")]
    BadLength(usize),
}

/// Result alias for Sphinx operations.
pub type Result<T> = std::result::Result<T, SphinxError>;
