//! The network directory: a keyed blob table read once at startup.
//!
//! The directory file is JSON with three tables — mixes, providers and
//! clients — each holding the published descriptors. The core treats it as
//! read-only; admitting and persisting descriptors is the directory
//! operator's concern.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{ClientDescriptor, MixDescriptor, Result, TransportError};

/// In-memory snapshot of the PKI directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Directory {
    mixes: Vec<MixDescriptor>,
    providers: Vec<MixDescriptor>,
    clients: Vec<ClientDescriptor>,
}

impl Directory {
    /// Assemble a directory from descriptor lists.
    pub fn new(
        mixes: Vec<MixDescriptor>,
        providers: Vec<MixDescriptor>,
        clients: Vec<ClientDescriptor>,
    ) -> Self {
        Self {
            mixes,
            providers,
            clients,
        }
    }

    /// Read the directory blob from disk. Callers treat failure as fatal:
    /// a node cannot run without a view of the network.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// All active mixes.
    pub fn mixes(&self) -> &[MixDescriptor] {
        &self.mixes
    }

    /// All providers.
    pub fn providers(&self) -> &[MixDescriptor] {
        &self.providers
    }

    /// All published clients.
    pub fn clients(&self) -> &[ClientDescriptor] {
        &self.clients
    }

    /// Look up a provider by id.
    pub fn provider(&self, id: &str) -> Result<&MixDescriptor> {
        self.providers
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| TransportError::UnknownId(id.to_string()))
    }

    /// Look up a client by id.
    pub fn client(&self, id: &str) -> Result<&ClientDescriptor> {
        self.clients
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| TransportError::UnknownId(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_directory() -> Directory {
        Directory::new(
            vec![MixDescriptor {
                id: "mix-1".into(),
                host: "127.0.0.1".into(),
                port: 9001,
                public_key: [1u8; 32],
            }],
            vec![MixDescriptor {
                id: "provider-1".into(),
                host: "127.0.0.1".into(),
                port: 9100,
                public_key: [2u8; 32],
            }],
            vec![ClientDescriptor {
                id: "alice".into(),
                host: "127.0.0.1".into(),
                port: 41000,
                public_key: [3u8; 32],
                provider_id: "provider-1".into(),
            }],
        )
    }

    #[test]
    fn lookups_resolve_by_id() {
        let directory = sample_directory();
        assert_eq!(directory.provider("provider-1").unwrap().port, 9100);
        assert_eq!(
            directory.client("alice").unwrap().provider_id,
            "provider-1"
        );
        assert!(matches!(
            directory.client("mallory"),
            Err(TransportError::UnknownId(_))
        ));
    }

    #[test]
    fn load_roundtrips_through_disk() {
        let directory = sample_directory();
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), serde_json::to_vec(&directory).unwrap()).unwrap();

        let loaded = Directory::load(file.path()).unwrap();
        assert_eq!(loaded.mixes().len(), 1);
        assert_eq!(loaded.providers().len(), 1);
        assert_eq!(loaded.clients().len(), 1);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Directory::load("/nonexistent/echomix-pki.json").is_err());
    }
}
