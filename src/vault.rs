//! Presence DLP - Crypto Vault
//!
//! Owns the master key and implements the envelope scheme: every secret at
//! rest (biometric templates, per-document file keys) is a [`WrappedSecret`]
//! under the master key, and every protected document is encrypted under
//! its own [`FileKey`].

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use zeroize::Zeroize;

use crate::crypto::{self, FileKey, MasterKey, ProtectedStorage, SecretKey, WrappedSecret};
use crate::error::{DlpError, DlpResult};
use crate::secure_fs;

/// Description bound to the protected master key container
pub const MASTER_KEY_DESCRIPTION: &str = "PresenceDlpMasterKey";

/// Extension appended to encrypted documents
pub const ENCRYPTED_EXTENSION: &str = "enc";

/// Crypto Vault - master key holder and envelope operations
pub struct CryptoVault {
    master: MasterKey,
}

impl CryptoVault {
    // ═══════════════════════════════════════════════════════════════════════
    // MASTER KEY LIFECYCLE
    // ═══════════════════════════════════════════════════════════════════════

    /// Load the wrapped master key, or generate and persist a new one.
    ///
    /// An existing key file that cannot be unwrapped is fatal
    /// ([`DlpError::MasterKeyUnavailable`]): the vault cannot operate with a
    /// key copied from another machine or account.
    pub fn load_or_create_master_key(
        path: &Path,
        store: &dyn ProtectedStorage,
    ) -> DlpResult<MasterKey> {
        if path.exists() {
            let mut raw = store
                .read_protected(path, MASTER_KEY_DESCRIPTION)
                .map_err(|e| DlpError::MasterKeyUnavailable(e.to_string()))?;

            let key = SecretKey::from_slice(&raw)
                .map_err(|e| DlpError::MasterKeyUnavailable(e.to_string()));
            raw.zeroize();
            return key;
        }

        info!("Generating new master key at {}", path.display());
        let key = SecretKey::generate();
        store.write_protected(path, key.expose(), MASTER_KEY_DESCRIPTION)?;
        Ok(key)
    }

    /// Open the vault backed by the master key at `path`
    pub fn open(path: &Path, store: &dyn ProtectedStorage) -> DlpResult<Self> {
        let master = Self::load_or_create_master_key(path, store)?;
        Ok(Self { master })
    }

    /// Build a vault around an already-loaded key
    pub fn with_master_key(master: MasterKey) -> Self {
        Self { master }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // SECRETS
    // ═══════════════════════════════════════════════════════════════════════

    /// Wrap a secret under the master key
    pub fn encrypt(&self, plaintext: &[u8]) -> DlpResult<WrappedSecret> {
        crypto::seal(&self.master, plaintext)
    }

    /// Unwrap a secret; tag mismatch yields [`DlpError::Integrity`]
    pub fn decrypt(&self, blob: &WrappedSecret) -> DlpResult<Vec<u8>> {
        crypto::open(&self.master, blob)
    }

    /// Unwrap a serialized envelope
    pub fn decrypt_bytes(&self, data: &[u8]) -> DlpResult<Vec<u8>> {
        self.decrypt(&WrappedSecret::from_bytes(data)?)
    }

    fn unwrap_file_key(&self, wrapped: &WrappedSecret) -> DlpResult<FileKey> {
        let mut raw = self.decrypt(wrapped)?;
        let key = SecretKey::from_slice(&raw);
        raw.zeroize();
        key
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DOCUMENTS
    // ═══════════════════════════════════════════════════════════════════════

    /// Encrypt a document under a fresh file key.
    ///
    /// Writes `<name>.enc` next to the original, wipes and deletes the
    /// plaintext original, and returns the file key wrapped under the master
    /// key for storage alongside the record.
    pub fn encrypt_file(&self, path: &Path) -> DlpResult<(PathBuf, WrappedSecret)> {
        let sealed = self.seal_file(path)?;
        secure_fs::wipe_and_delete(path)?;
        Ok(sealed)
    }

    /// First half of [`CryptoVault::encrypt_file`]: write `<name>.enc` and
    /// leave the original in place.
    ///
    /// Refuses with [`DlpError::FileExists`] before writing anything when
    /// the `.enc` target already exists.
    pub fn seal_file(&self, path: &Path) -> DlpResult<(PathBuf, WrappedSecret)> {
        if !path.is_file() {
            return Err(DlpError::FileNotFound(path.display().to_string()));
        }
        let enc_path = encrypted_path_for(path);
        if enc_path.exists() {
            return Err(DlpError::FileExists(enc_path.display().to_string()));
        }

        let mut plaintext = fs::read(path)?;
        let file_key = FileKey::generate();
        let sealed = crypto::seal(&file_key, &plaintext);
        plaintext.zeroize();
        let sealed = sealed?;

        let wrapped_key = self.encrypt(file_key.expose())?;
        secure_fs::write_atomic(&enc_path, &sealed.to_bytes())?;
        debug!("Encrypted {} -> {}", path.display(), enc_path.display());

        Ok((enc_path, wrapped_key))
    }

    /// Decrypt a document into memory. Never writes plaintext to disk.
    pub fn decrypt_file_content(
        &self,
        enc_path: &Path,
        wrapped_file_key: &WrappedSecret,
    ) -> DlpResult<Vec<u8>> {
        if !enc_path.is_file() {
            return Err(DlpError::FileNotFound(enc_path.display().to_string()));
        }

        let file_key = self.unwrap_file_key(wrapped_file_key)?;
        let data = fs::read(enc_path)?;
        crypto::open(&file_key, &WrappedSecret::from_bytes(&data)?)
    }

    /// Replace a document's content under a brand-new file key.
    ///
    /// Returns the new wrapped key; the previous key no longer decrypts the
    /// file once this returns.
    pub fn rewrite_file_content(&self, enc_path: &Path, content: &[u8]) -> DlpResult<WrappedSecret> {
        let file_key = FileKey::generate();
        let sealed = crypto::seal(&file_key, content)?;
        secure_fs::write_atomic(enc_path, &sealed.to_bytes())?;
        self.encrypt(file_key.expose())
    }
}

/// `report.docx` -> `report.docx.enc`
pub fn encrypted_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_owned()).unwrap_or_default();
    name.push(".");
    name.push(ENCRYPTED_EXTENSION);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::protected::tests::ephemeral_store;
    use tempfile::tempdir;

    fn test_vault() -> CryptoVault {
        CryptoVault::with_master_key(SecretKey::generate())
    }

    #[test]
    fn test_master_key_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("master.key");
        let store = ephemeral_store();

        let first = CryptoVault::load_or_create_master_key(&path, &store).unwrap();
        assert!(path.exists());
        let second = CryptoVault::load_or_create_master_key(&path, &store).unwrap();
        assert_eq!(first.expose(), second.expose());
    }

    #[test]
    fn test_master_key_from_other_machine_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("master.key");
        let here = ephemeral_store();
        let there = ephemeral_store();

        CryptoVault::load_or_create_master_key(&path, &here).unwrap();
        let err = CryptoVault::open(&path, &there).err().unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_secret_roundtrip() {
        let vault = test_vault();
        let wrapped = vault.encrypt(b"").unwrap();
        assert!(vault.decrypt(&wrapped).unwrap().is_empty());

        let wrapped = vault.encrypt(b"feature vector").unwrap();
        assert_eq!(vault.decrypt_bytes(&wrapped.to_bytes()).unwrap(), b"feature vector");
    }

    #[test]
    fn test_encrypt_file_lifecycle() {
        let dir = tempdir().unwrap();
        let original = dir.path().join("salaries.xlsx");
        fs::write(&original, b"name,salary\nbob,100").unwrap();

        let vault = test_vault();
        let (enc_path, wrapped_key) = vault.encrypt_file(&original).unwrap();

        assert_eq!(enc_path, dir.path().join("salaries.xlsx.enc"));
        assert!(!original.exists());
        assert_ne!(fs::read(&enc_path).unwrap(), b"name,salary\nbob,100");

        let content = vault.decrypt_file_content(&enc_path, &wrapped_key).unwrap();
        assert_eq!(content, b"name,salary\nbob,100");
    }

    #[test]
    fn test_existing_target_never_overwritten() {
        let dir = tempdir().unwrap();
        let original = dir.path().join("plan.txt");
        fs::write(&original, b"v1").unwrap();

        let vault = test_vault();
        let (enc_path, key) = vault.encrypt_file(&original).unwrap();
        let before = fs::read(&enc_path).unwrap();

        fs::write(&original, b"v2").unwrap();
        assert!(matches!(vault.encrypt_file(&original), Err(DlpError::FileExists(_))));
        assert_eq!(fs::read(&original).unwrap(), b"v2");
        assert_eq!(fs::read(&enc_path).unwrap(), before);
        assert_eq!(vault.decrypt_file_content(&enc_path, &key).unwrap(), b"v1");
    }

    #[test]
    fn test_rewrite_rotates_key() {
        let dir = tempdir().unwrap();
        let original = dir.path().join("notes.txt");
        fs::write(&original, b"v1").unwrap();

        let vault = test_vault();
        let (enc_path, old_key) = vault.encrypt_file(&original).unwrap();
        let new_key = vault.rewrite_file_content(&enc_path, b"v2").unwrap();

        assert_eq!(vault.decrypt_file_content(&enc_path, &new_key).unwrap(), b"v2");
        assert!(matches!(
            vault.decrypt_file_content(&enc_path, &old_key),
            Err(DlpError::Integrity)
        ));
    }

    #[test]
    fn test_tampered_document_rejected() {
        let dir = tempdir().unwrap();
        let original = dir.path().join("plan.md");
        fs::write(&original, b"launch date").unwrap();

        let vault = test_vault();
        let (enc_path, key) = vault.encrypt_file(&original).unwrap();

        let mut data = fs::read(&enc_path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0x01;
        fs::write(&enc_path, &data).unwrap();

        assert!(matches!(
            vault.decrypt_file_content(&enc_path, &key),
            Err(DlpError::Integrity)
        ));
    }

    #[test]
    fn test_missing_source() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            test_vault().encrypt_file(&dir.path().join("nope.txt")),
            Err(DlpError::FileNotFound(_))
        ));
    }
}
