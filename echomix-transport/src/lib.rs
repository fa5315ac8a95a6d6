//! # Echomix Transport
//!
//! Everything between the Sphinx packet format and a running node: the
//! length-delimited wire envelope, the network directory, path and delay
//! sampling, and the sending client.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐    ┌──────────┐    ┌───────┐    ┌───────┐    ┌──────────┐
//! │ Client │───▶│ Provider │───▶│ Mix 1 │───▶│ Mix 2 │───▶│ Provider │
//! │(sender)│    │ (ingress)│    └───────┘    └───────┘    │ (egress) │
//! └────────┘    └──────────┘                              └────┬─────┘
//!      ▲                                                       │ inbox
//!      └────────────────────── pull ◀──────────────────────────┘
//! ```
//!
//! Each hop unwraps one onion layer, waits an exponentially distributed
//! delay chosen by the sender, and forwards. The egress provider buffers
//! the plaintext in the recipient's inbox until it is pulled.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod envelope;
pub mod path;
pub mod pki;

pub use client::{Client, ClientConfig};
pub use envelope::{Envelope, EnvelopeCodec};
pub use pki::Directory;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur in the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Packet construction or unwrapping failed.
    #[error("sphinx error: {0}")]
    Sphinx(#[from] echomix_sphinx::SphinxError),

    /// Network I/O failed.
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection before a full envelope arrived.
    #[error("connection closed mid-envelope")]
    ConnectionClosed,

    /// A dial, read or write exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The directory cannot supply the requested path.
    #[error("not enough mixes: need {need}, directory has {have}")]
    TooFewMixes {
        /// Mixes required for the path.
        need: usize,
        /// Mixes present in the directory.
        have: usize,
    },

    /// The exponential rate parameter must be strictly positive.
    #[error("invalid delay rate parameter {0}")]
    InvalidRate(f64),

    /// An id was looked up that the directory does not contain.
    #[error("unknown id: {0}")]
    UnknownId(String),

    /// Descriptor or request (de)serialization failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The provider rejected our bearer token.
    #[error("provider rejected the pull token")]
    AuthFailed,

    /// An operation that needs a token ran before registration finished.
    #[error("client is not registered with its provider")]
    NotRegistered,
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// A mix or provider as published through the PKI. Immutable once admitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixDescriptor {
    /// Stable identifier.
    pub id: String,
    /// Listening host.
    pub host: String,
    /// Listening port.
    pub port: u16,
    /// Curve25519 public key.
    pub public_key: [u8; 32],
}

/// A client as published through the PKI.
///
/// `provider_id` is a back-reference to the client's egress provider,
/// resolved against the directory at path-construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientDescriptor {
    /// Stable identifier.
    pub id: String,
    /// Host the client listens on for deliveries.
    pub host: String,
    /// Port the client listens on for deliveries.
    pub port: u16,
    /// Curve25519 public key.
    pub public_key: [u8; 32],
    /// Id of the provider buffering this client's inbox.
    pub provider_id: String,
}

impl MixDescriptor {
    /// The descriptor's dialable `host:port` form.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parse the published public key.
    pub fn public_point(&self) -> Result<echomix_sphinx::MontgomeryPoint> {
        Ok(echomix_sphinx::keys::point_from_bytes(&self.public_key)?)
    }
}

impl ClientDescriptor {
    /// The client's dialable `host:port` form.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_address_formatting() {
        let mix = MixDescriptor {
            id: "mix-1".into(),
            host: "127.0.0.1".into(),
            port: 9001,
            public_key: [7u8; 32],
        };
        assert_eq!(mix.address(), "127.0.0.1:9001");
    }

    #[test]
    fn descriptor_json_roundtrip() {
        let client = ClientDescriptor {
            id: "alice".into(),
            host: "127.0.0.1".into(),
            port: 41000,
            public_key: [3u8; 32],
            provider_id: "provider-1".into(),
        };
        let encoded = serde_json::to_vec(&client).unwrap();
        let decoded: ClientDescriptor = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.id, client.id);
        assert_eq!(decoded.provider_id, client.provider_id);
        assert_eq!(decoded.public_key, client.public_key);
    }
}
