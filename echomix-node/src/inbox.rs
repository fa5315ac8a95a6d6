//! Per-client inbox storage.
//!
//! Layout: `<root>/inboxes/<client-id>/<message-id>`, one stored payload
//! per file. Writes land in a dot-prefixed temp file first and are renamed
//! into place, so a reader never observes a half-written message. The
//! directory tree survives restarts.

use std::path::PathBuf;

use crate::{NodeError, Result};

/// A message sitting in an inbox.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// Opaque message id, also the file name.
    pub id: String,
    /// The buffered payload.
    pub payload: Vec<u8>,
}

/// Filesystem-backed inbox collection rooted at `<root>/inboxes`.
#[derive(Debug, Clone)]
pub struct InboxStore {
    root: PathBuf,
}

impl InboxStore {
    /// Create a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into().join("inboxes"),
        }
    }

    /// Create the inbox directory for `client_id` if it is missing.
    pub async fn ensure(&self, client_id: &str) -> Result<()> {
        let path = self.inbox_path(client_id)?;
        tokio::fs::create_dir_all(&path).await?;
        Ok(())
    }

    /// Append a payload under `message_id`. The inbox must already exist:
    /// storing for an unregistered id is `UnknownRecipient`.
    pub async fn store(&self, client_id: &str, message_id: &str, payload: &[u8]) -> Result<()> {
        validate_id(message_id)?;
        let inbox = self.inbox_path(client_id)?;
        if !tokio::fs::try_exists(&inbox).await? {
            return Err(NodeError::UnknownRecipient(client_id.to_string()));
        }

        let tmp = inbox.join(format!(".{message_id}"));
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, inbox.join(message_id)).await?;
        Ok(())
    }

    /// Enumerate an inbox. `None` means the inbox was never created;
    /// otherwise all committed messages, in directory-enumeration order
    /// (the order is not part of any contract).
    pub async fn entries(&self, client_id: &str) -> Result<Option<Vec<StoredMessage>>> {
        let inbox = self.inbox_path(client_id)?;
        if !tokio::fs::try_exists(&inbox).await? {
            return Ok(None);
        }

        let mut messages = Vec::new();
        let mut dir = tokio::fs::read_dir(&inbox).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue; // in-flight temp file
            }
            let payload = tokio::fs::read(entry.path()).await?;
            messages.push(StoredMessage { id: name, payload });
        }
        Ok(Some(messages))
    }

    /// Delete one delivered message.
    pub async fn remove(&self, client_id: &str, message_id: &str) -> Result<()> {
        validate_id(message_id)?;
        let inbox = self.inbox_path(client_id)?;
        tokio::fs::remove_file(inbox.join(message_id)).await?;
        Ok(())
    }

    fn inbox_path(&self, client_id: &str) -> Result<PathBuf> {
        validate_id(client_id)?;
        Ok(self.root.join(client_id))
    }
}

/// Ids become path components, so only a conservative alphabet is allowed.
pub(crate) fn validate_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(NodeError::InvalidId(id.to_string()))
    }
}
