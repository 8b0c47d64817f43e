//! Presence DLP - Key Material
//!
//! The long-lived master key, per-document file keys and the random helpers
//! used for nonces and tokens.

use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, Secret};
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use crate::error::{DlpError, DlpResult};

/// Key length for AES-256
pub const KEY_LEN: usize = 32;

/// Nonce length for AES-GCM
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length
pub const TAG_LEN: usize = 16;

/// Nonce length for XChaCha20 (protected storage containers)
pub const XCHACHA_NONCE_LEN: usize = 24;

/// Length of the random IPC token before hex encoding
pub const TOKEN_LEN: usize = 32;

/// HKDF contexts
pub mod contexts {
    /// Protected-storage key derived from the credential-store root secret
    pub const MACHINE_KEK: &[u8] = b"PDLP:MACHINE-KEK:v1";
}

/// Secure key wrapper with automatic zeroization
#[derive(Clone, ZeroizeOnDrop)]
pub struct SecretKey {
    #[zeroize(skip)]
    inner: Secret<[u8; KEY_LEN]>,
}

impl SecretKey {
    /// Create a key from raw bytes
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            inner: Secret::new(bytes),
        }
    }

    /// Create a key from a slice, checking its length
    pub fn from_slice(bytes: &[u8]) -> DlpResult<Self> {
        if bytes.len() != KEY_LEN {
            return Err(DlpError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: bytes.len(),
            });
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self::new(key))
    }

    /// Expose the key bytes (use with caution)
    pub fn expose(&self) -> &[u8; KEY_LEN] {
        self.inner.expose_secret()
    }

    /// Generate a random key from the OS CSPRNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self::new(bytes)
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}

/// Service-lifetime key that wraps every secret at rest
pub type MasterKey = SecretKey;

/// Per-document key; only ever persisted wrapped under the master key
pub type FileKey = SecretKey;

/// Derive a key using HKDF-SHA256
pub fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> DlpResult<SecretKey> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; KEY_LEN];

    hk.expand(info, &mut okm)
        .map_err(|e| DlpError::KeyDerivationFailed(e.to_string()))?;

    Ok(SecretKey::new(okm))
}

/// Generate a random nonce for AES-GCM
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Generate a random nonce for XChaCha20
pub fn generate_xchacha_nonce() -> [u8; XCHACHA_NONCE_LEN] {
    let mut nonce = [0u8; XCHACHA_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Generate a fresh 256-bit IPC token, hex encoded
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Compare two byte strings without short-circuiting on the first difference
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_differ() {
        let k1 = SecretKey::generate();
        let k2 = SecretKey::generate();
        assert_ne!(k1.expose(), k2.expose());
    }

    #[test]
    fn test_from_slice_checks_length() {
        assert!(SecretKey::from_slice(&[7u8; 32]).is_ok());
        assert!(matches!(
            SecretKey::from_slice(&[7u8; 16]),
            Err(DlpError::InvalidKeyLength { expected: 32, actual: 16 })
        ));
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = derive_key(b"machine", b"user", contexts::MACHINE_KEK).unwrap();
        let b = derive_key(b"machine", b"user", contexts::MACHINE_KEK).unwrap();
        let c = derive_key(b"machine", b"other-user", contexts::MACHINE_KEK).unwrap();

        assert_eq!(a.expose(), b.expose());
        assert_ne!(a.expose(), c.expose());
    }

    #[test]
    fn test_token_shape() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn test_debug_redacts() {
        let key = SecretKey::generate();
        assert_eq!(format!("{:?}", key), "SecretKey([REDACTED])");
    }
}
