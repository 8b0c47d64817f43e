//! Presence DLP - Wrapped Secret Envelope
//!
//! AES-256-GCM envelope used for every secret at rest:
//!
//! ```text
//! [NONCE 12B][TAG 16B][CIPHERTEXT variable]
//! ```

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};

use super::keys::{generate_nonce, SecretKey, NONCE_LEN, TAG_LEN};
use crate::error::{DlpError, DlpResult};

/// Minimum size of a serialized envelope (empty plaintext)
pub const ENVELOPE_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Encrypted secret: nonce, detached GCM tag and ciphertext
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedSecret {
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
    pub ciphertext: Vec<u8>,
}

impl WrappedSecret {
    /// Serialize to bytes (nonce || tag || ciphertext)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(ENVELOPE_OVERHEAD + self.ciphertext.len());
        result.extend_from_slice(&self.nonce);
        result.extend_from_slice(&self.tag);
        result.extend_from_slice(&self.ciphertext);
        result
    }

    /// Deserialize from bytes; rejects anything shorter than nonce + tag
    pub fn from_bytes(data: &[u8]) -> DlpResult<Self> {
        if data.len() < ENVELOPE_OVERHEAD {
            return Err(DlpError::InvalidEnvelope(format!(
                "{} bytes, need at least {}",
                data.len(),
                ENVELOPE_OVERHEAD
            )));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&data[..NONCE_LEN]);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&data[NONCE_LEN..ENVELOPE_OVERHEAD]);

        Ok(Self {
            nonce,
            tag,
            ciphertext: data[ENVELOPE_OVERHEAD..].to_vec(),
        })
    }
}

/// Encrypt under `key` with a fresh random nonce
pub fn seal(key: &SecretKey, plaintext: &[u8]) -> DlpResult<WrappedSecret> {
    let cipher = Aes256Gcm::new_from_slice(key.expose())
        .map_err(|e| DlpError::EncryptionFailed(e.to_string()))?;

    let nonce = generate_nonce();
    let mut buffer = plaintext.to_vec();

    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut buffer)
        .map_err(|e| DlpError::EncryptionFailed(e.to_string()))?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(WrappedSecret {
        nonce,
        tag: tag_bytes,
        ciphertext: buffer,
    })
}

/// Decrypt and verify; fails with [`DlpError::Integrity`] on any tag mismatch
pub fn open(key: &SecretKey, wrapped: &WrappedSecret) -> DlpResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.expose())
        .map_err(|e| DlpError::EncryptionFailed(e.to_string()))?;

    let mut buffer = wrapped.ciphertext.clone();

    match cipher.decrypt_in_place_detached(
        Nonce::from_slice(&wrapped.nonce),
        b"",
        &mut buffer,
        Tag::from_slice(&wrapped.tag),
    ) {
        Ok(()) => Ok(buffer),
        Err(_) => {
            zeroize::Zeroize::zeroize(&mut buffer);
            Err(DlpError::Integrity)
        }
    }
}
