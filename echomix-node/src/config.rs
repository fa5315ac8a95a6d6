//! Node configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;
use echomix_transport::Directory;

/// Configuration shared by mixes and providers.
///
/// Loading and merging this from files or flags is the launcher's concern;
/// the runtime only reads the resolved values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable node identifier, as published through the PKI.
    pub id: String,
    /// Address the listener binds to; port 0 picks a free port.
    pub listen_address: SocketAddr,
    /// Path of the PKI directory blob.
    pub pki_path: PathBuf,
    /// Root under which `inboxes/<client-id>/` lives (providers only).
    pub inbox_root: PathBuf,
    /// Deadline for every outbound dial, read and write.
    pub io_timeout: Duration,
    /// Ceiling on packets being delayed or forwarded at once; packets
    /// above it are shed.
    pub max_in_flight: usize,
    /// Number of replay tags remembered.
    pub replay_capacity: usize,
    /// How long a replay tag stays fresh.
    pub replay_ttl: Duration,
    /// Base backoff before the single forward retry.
    pub retry_backoff: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "mix".into(),
            listen_address: "127.0.0.1:9000".parse().expect("static address"),
            pki_path: "echomix-pki.json".into(),
            inbox_root: ".".into(),
            io_timeout: Duration::from_secs(10),
            max_in_flight: 4096,
            replay_capacity: 1 << 16,
            replay_ttl: Duration::from_secs(600),
            retry_backoff: Duration::from_millis(200),
        }
    }
}

impl NodeConfig {
    /// Read the PKI snapshot this node was configured with. Startup treats
    /// failure as fatal.
    pub fn load_directory(&self) -> Result<Directory> {
        Ok(Directory::load(&self.pki_path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = NodeConfig::default();
        assert_eq!(config.listen_address.port(), 9000);
        assert!(config.max_in_flight > 0);
        assert!(config.replay_capacity > 0);
    }

    #[test]
    fn config_json_roundtrip() {
        let config = NodeConfig {
            id: "provider-1".into(),
            ..NodeConfig::default()
        };
        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: NodeConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, "provider-1");
        assert_eq!(decoded.io_timeout, config.io_timeout);
    }

    #[test]
    fn directory_loads_from_configured_path() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let directory = Directory::default();
        std::fs::write(file.path(), serde_json::to_vec(&directory).unwrap()).unwrap();

        let config = NodeConfig {
            pki_path: file.path().to_path_buf(),
            ..NodeConfig::default()
        };
        assert!(config.load_directory().is_ok());

        let missing = NodeConfig {
            pki_path: "/nonexistent/pki.json".into(),
            ..NodeConfig::default()
        };
        assert!(missing.load_directory().is_err());
    }
}
