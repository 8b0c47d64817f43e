//! Presence DLP - Platform Protected Storage
//!
//! Wraps small secrets (master key, IPC token) so that only the same local
//! user on the same machine can unwrap them. The container key comes from a
//! random root secret kept in the user's OS credential store; nothing on
//! disk or in the environment is enough to rebuild it.
//!
//! Container format:
//! ```text
//! [MAGIC 4B]["PDLP"]
//! [VERSION 1B][0x01]
//! [NONCE 24B][random]
//! [CIPHERTEXT variable][XChaCha20-Poly1305, description as AAD]
//! ```

use std::fs;
use std::path::Path;

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};

use tracing::info;
use zeroize::Zeroize;

use super::keys::{contexts, derive_key, generate_xchacha_nonce, SecretKey, XCHACHA_NONCE_LEN};
use crate::error::{DlpError, DlpResult};
use crate::secure_fs;

/// Magic bytes identifying a protected container
const MAGIC: &[u8; 4] = b"PDLP";

/// Current container version
const VERSION: u8 = 0x01;

/// Header size: MAGIC(4) + VERSION(1) + NONCE(24)
const HEADER_SIZE: usize = 4 + 1 + XCHACHA_NONCE_LEN;

/// Machine/identity-bound secret wrapping
pub trait ProtectedStorage: Send + Sync {
    /// Wrap `plaintext`; `description` must be presented again to unwrap
    fn protect(&self, plaintext: &[u8], description: &str) -> DlpResult<Vec<u8>>;

    /// Unwrap a container produced by [`ProtectedStorage::protect`]
    fn unprotect(&self, blob: &[u8], description: &str) -> DlpResult<Vec<u8>>;

    /// Wrap and write to `path` with owner-only permissions
    fn write_protected(&self, path: &Path, plaintext: &[u8], description: &str) -> DlpResult<()> {
        let blob = self.protect(plaintext, description)?;
        secure_fs::write_private(path, &blob)
    }

    /// Read `path` and unwrap it
    fn read_protected(&self, path: &Path, description: &str) -> DlpResult<Vec<u8>> {
        if !path.exists() {
            return Err(DlpError::FileNotFound(path.display().to_string()));
        }
        let blob = fs::read(path)?;
        self.unprotect(&blob, description)
    }
}

/// Keyring service holding the root secret
pub const KEYRING_SERVICE: &str = "presence-dlp";

/// Keyring account holding the root secret
pub const KEYRING_ACCOUNT: &str = "protected-storage-root";

/// A single secret slot in a credential store
pub trait KeySlot {
    /// `None` when nothing was stored yet
    fn load(&self) -> DlpResult<Option<String>>;
    fn store(&self, value: &str) -> DlpResult<()>;
}

impl KeySlot for keyring::Entry {
    fn load(&self) -> DlpResult<Option<String>> {
        match self.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(DlpError::ProtectedStorage(format!("credential store: {}", e))),
        }
    }

    fn store(&self, value: &str) -> DlpResult<()> {
        self.set_password(value)
            .map_err(|e| DlpError::ProtectedStorage(format!("credential store: {}", e)))
    }
}

/// Protected storage rooted in the OS credential store (Secret Service,
/// Keychain, Windows Credential Manager) of the local user
pub struct MachineBoundStore {
    kek: SecretKey,
}

impl MachineBoundStore {
    /// Use the current user's credential store, creating the root secret on
    /// first start
    pub fn new() -> DlpResult<Self> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_ACCOUNT)
            .map_err(|e| DlpError::ProtectedStorage(format!("credential store: {}", e)))?;
        Self::from_slot(&entry)
    }

    /// Load the root secret from `slot`, or generate and store a random one
    pub fn from_slot(slot: &dyn KeySlot) -> DlpResult<Self> {
        let root = match slot.load()? {
            Some(mut encoded) => {
                let decoded = hex::decode(encoded.trim());
                encoded.zeroize();
                let mut raw = decoded
                    .map_err(|_| DlpError::ProtectedStorage("root secret is not hex".into()))?;
                let root = SecretKey::from_slice(&raw)
                    .map_err(|_| DlpError::ProtectedStorage("root secret has the wrong length".into()));
                raw.zeroize();
                root?
            }
            None => {
                info!("Creating protected storage root secret in the credential store");
                let root = SecretKey::generate();
                let mut encoded = hex::encode(root.expose());
                let stored = slot.store(&encoded);
                encoded.zeroize();
                stored?;
                root
            }
        };
        Self::from_root(&root)
    }

    /// Derive the container key from a root secret
    pub fn from_root(root: &SecretKey) -> DlpResult<Self> {
        let kek = derive_key(root.expose(), KEYRING_ACCOUNT.as_bytes(), contexts::MACHINE_KEK)?;
        Ok(Self { kek })
    }

    fn cipher(&self) -> DlpResult<XChaCha20Poly1305> {
        XChaCha20Poly1305::new_from_slice(self.kek.expose())
            .map_err(|e| DlpError::ProtectedStorage(e.to_string()))
    }
}

impl ProtectedStorage for MachineBoundStore {
    fn protect(&self, plaintext: &[u8], description: &str) -> DlpResult<Vec<u8>> {
        let nonce = generate_xchacha_nonce();
        let ciphertext = self
            .cipher()?
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: description.as_bytes(),
                },
            )
            .map_err(|e| DlpError::ProtectedStorage(e.to_string()))?;

        let mut out = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn unprotect(&self, blob: &[u8], description: &str) -> DlpResult<Vec<u8>> {
        if blob.len() < HEADER_SIZE + 16 {
            return Err(DlpError::ProtectedStorage("container too short".into()));
        }
        if &blob[..4] != MAGIC {
            return Err(DlpError::ProtectedStorage("bad magic".into()));
        }
        if blob[4] != VERSION {
            return Err(DlpError::ProtectedStorage(format!(
                "unsupported container version {}",
                blob[4]
            )));
        }

        let nonce = XNonce::from_slice(&blob[5..HEADER_SIZE]);
        self.cipher()?
            .decrypt(
                nonce,
                Payload {
                    msg: &blob[HEADER_SIZE..],
                    aad: description.as_bytes(),
                },
            )
            .map_err(|_| {
                DlpError::ProtectedStorage("container not bound to this machine or user".into())
            })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::tempdir;

    /// In-memory credential slot
    #[derive(Default)]
    pub(crate) struct MemorySlot(pub RefCell<Option<String>>);

    impl KeySlot for MemorySlot {
        fn load(&self) -> DlpResult<Option<String>> {
            Ok(self.0.borrow().clone())
        }

        fn store(&self, value: &str) -> DlpResult<()> {
            *self.0.borrow_mut() = Some(value.to_string());
            Ok(())
        }
    }

    /// Store with a fresh random root, as if on another account or machine
    pub(crate) fn ephemeral_store() -> MachineBoundStore {
        MachineBoundStore::from_root(&SecretKey::generate()).unwrap()
    }

    #[test]
    fn test_protect_roundtrip() {
        let store = ephemeral_store();
        let blob = store.protect(b"master key bytes", "MasterKey").unwrap();

        assert_eq!(&blob[..4], MAGIC);
        assert_eq!(store.unprotect(&blob, "MasterKey").unwrap(), b"master key bytes");
    }

    #[test]
    fn test_root_secret_created_once() {
        let slot = MemorySlot::default();
        let first = MachineBoundStore::from_slot(&slot).unwrap();
        let stored = slot.0.borrow().clone().unwrap();
        assert_eq!(stored.len(), 64);

        let blob = first.protect(b"secret", "MasterKey").unwrap();
        let again = MachineBoundStore::from_slot(&slot).unwrap();
        assert_eq!(slot.0.borrow().as_deref(), Some(stored.as_str()));
        assert_eq!(again.unprotect(&blob, "MasterKey").unwrap(), b"secret");
    }

    #[test]
    fn test_other_credential_store_cannot_unwrap() {
        let here = MachineBoundStore::from_slot(&MemorySlot::default()).unwrap();
        let elsewhere = MachineBoundStore::from_slot(&MemorySlot::default()).unwrap();

        let blob = here.protect(b"secret", "MasterKey").unwrap();
        assert!(matches!(
            elsewhere.unprotect(&blob, "MasterKey"),
            Err(DlpError::ProtectedStorage(_))
        ));
    }

    #[test]
    fn test_corrupt_root_secret_rejected() {
        let slot = MemorySlot(RefCell::new(Some("not-hex".into())));
        assert!(MachineBoundStore::from_slot(&slot).is_err());

        let short = MemorySlot(RefCell::new(Some("abcd".into())));
        assert!(MachineBoundStore::from_slot(&short).is_err());
        // never silently replaced
        assert_eq!(short.0.borrow().as_deref(), Some("abcd"));
    }

    #[test]
    fn test_description_is_bound() {
        let store = ephemeral_store();
        let blob = store.protect(b"token", "IpcToken").unwrap();
        assert!(store.unprotect(&blob, "MasterKey").is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ipc.token");
        let store = ephemeral_store();

        store.write_protected(&path, b"abc123", "IpcToken").unwrap();
        assert_eq!(store.read_protected(&path, "IpcToken").unwrap(), b"abc123");
        assert!(matches!(
            store.read_protected(&dir.path().join("missing"), "IpcToken"),
            Err(DlpError::FileNotFound(_))
        ));
    }
}
