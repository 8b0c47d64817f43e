//! Presence DLP - Protected Document Opener
//!
//! What a viewer does before showing a protected document: the `.enc` file
//! must be registered, and the Security Service must answer, *before* any
//! key is unwrapped. While open, the viewer heartbeats and saves through
//! here so every save rotates the file key.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::error::{DlpError, DlpResult};
use crate::gateway::protocol::response;
use crate::gateway::{GatewayClient, HeartbeatVerdict};
use crate::storage::{FileRecord, SqliteStore, Storage};
use crate::vault::CryptoVault;

/// Decrypted document held in memory only
pub struct OpenedDocument {
    pub record: FileRecord,
    pub content: Vec<u8>,
}

impl Drop for OpenedDocument {
    fn drop(&mut self) {
        self.content.zeroize();
    }
}

/// Opener for protected documents
pub struct ProtectedOpener {
    storage: Arc<SqliteStore>,
    vault: Arc<CryptoVault>,
    client: GatewayClient,
}

impl ProtectedOpener {
    pub fn new(storage: Arc<SqliteStore>, vault: Arc<CryptoVault>, client: GatewayClient) -> Self {
        Self {
            storage,
            vault,
            client,
        }
    }

    /// Open a registered `.enc` file.
    ///
    /// Refuses unregistered paths with [`DlpError::AccessDenied`] and a
    /// missing or failing service with [`DlpError::ServiceUnreachable`].
    /// The key is unwrapped only while the service reports an authorized
    /// session and answers `continue` to a heartbeat for this document;
    /// otherwise the open is refused with [`DlpError::AccessDenied`].
    pub fn open(&self, path: &Path) -> DlpResult<OpenedDocument> {
        let record = self.storage.file_by_path(path)?.ok_or_else(|| {
            DlpError::AccessDenied(format!("{} is not a registered protected document", path.display()))
        })?;

        let status = self.client.get_status();
        if response::is_error(&status) {
            let message = status
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("no answer");
            warn!("Refusing to open #{}: Security Service unavailable", record.id);
            return Err(DlpError::ServiceUnreachable(message.to_string()));
        }

        let authorized = status.get("authorized").and_then(Value::as_bool) == Some(true);
        let verdict = HeartbeatVerdict::from_response(&self.client.heartbeat(record.id));
        if !authorized || verdict != HeartbeatVerdict::Continue {
            warn!("Refusing to open #{}: no authorized user present", record.id);
            return Err(DlpError::AccessDenied(format!(
                "{} requires an authorized user in front of the camera",
                record.original_name
            )));
        }

        let content = self
            .vault
            .decrypt_file_content(&record.enc_path, &record.wrapped_file_key)?;
        info!("Opened protected document #{} ({})", record.id, record.original_name);

        Ok(OpenedDocument { record, content })
    }

    /// Heartbeat for an open document; on `Close` the viewer saves and exits
    pub fn heartbeat(&self, document: &OpenedDocument) -> HeartbeatVerdict {
        HeartbeatVerdict::from_response(&self.client.heartbeat(document.record.id))
    }

    /// Store new content under a fresh file key
    pub fn save(&self, document: &mut OpenedDocument, content: Vec<u8>) -> DlpResult<()> {
        if !self.storage.update_file_content(document.record.id, &content)? {
            return Err(DlpError::RecordNotFound(format!("file #{}", document.record.id)));
        }
        document.record = self.storage.file_by_id(document.record.id)?;
        document.content.zeroize();
        document.content = content;
        Ok(())
    }
}
