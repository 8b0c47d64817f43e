//! Presence DLP - Protocol Gateway
//!
//! Token-authenticated request/response channel on loopback. The token is
//! regenerated at every service start and handed to local clients through
//! protected storage.

pub mod client;
pub mod protocol;
pub mod server;

use std::path::Path;

use zeroize::Zeroize;

use crate::crypto::ProtectedStorage;
use crate::error::{DlpError, DlpResult};

pub use client::{GatewayClient, HeartbeatVerdict};
pub use protocol::{Command, Request};
pub use server::{Gateway, GatewayContext};

/// Description bound to the protected token container
pub const TOKEN_DESCRIPTION: &str = "PresenceDlpIpcToken";

/// Protect and persist the gateway token
pub fn store_token(path: &Path, token: &str, store: &dyn ProtectedStorage) -> DlpResult<()> {
    store.write_protected(path, token.as_bytes(), TOKEN_DESCRIPTION)
}

/// Read and unwrap the gateway token
pub fn load_token(path: &Path, store: &dyn ProtectedStorage) -> DlpResult<String> {
    let mut raw = store.read_protected(path, TOKEN_DESCRIPTION)?;
    let token = String::from_utf8(raw.clone())
        .map_err(|_| DlpError::ProtectedStorage("token is not UTF-8".into()));
    raw.zeroize();
    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_token;
    use crate::crypto::protected::tests::ephemeral_store;
    use tempfile::tempdir;

    #[test]
    fn test_token_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ipc.token");
        let store = ephemeral_store();
        let token = generate_token();

        store_token(&path, &token, &store).unwrap();
        assert_ne!(std::fs::read(&path).unwrap(), token.as_bytes());
        assert_eq!(load_token(&path, &store).unwrap(), token);

        let intruder = ephemeral_store();
        assert!(load_token(&path, &intruder).is_err());
    }
}
