//! Presence DLP - Error Types

use thiserror::Error;

/// Result type for agent operations
pub type DlpResult<T> = Result<T, DlpError>;

/// Agent error types
#[derive(Error, Debug)]
pub enum DlpError {
    // ═══════════════════════════════════════════════════════════════
    // CRYPTO ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Authentication tag did not verify. Never accompanied by plaintext.
    #[error("Integrity check failed - data corrupted or wrong key")]
    Integrity,

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// Master key exists but cannot be unwrapped on this machine/identity.
    #[error("Master key unusable on this machine or account: {0}")]
    MasterKeyUnavailable(String),

    #[error("Protected storage error: {0}")]
    ProtectedStorage(String),

    // ═══════════════════════════════════════════════════════════════
    // STORAGE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    // ═══════════════════════════════════════════════════════════════
    // FILE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Refused to overwrite an existing file
    #[error("File already exists: {0}")]
    FileExists(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    // ═══════════════════════════════════════════════════════════════
    // VISION ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Camera unavailable: {0}")]
    CameraUnavailable(String),

    #[error("Face engine error: {0}")]
    FaceEngine(String),

    #[error("Image processing error: {0}")]
    ImageError(String),

    /// A face in view is unknown or failed a physical liveness check.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    // ═══════════════════════════════════════════════════════════════
    // PROCESS GUARD ERRORS
    // ═══════════════════════════════════════════════════════════════

    /// A single OS process or window operation failed
    #[error("Platform operation failed: {0}")]
    Platform(String),

    // ═══════════════════════════════════════════════════════════════
    // GATEWAY ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Security service unreachable: {0}")]
    ServiceUnreachable(String),

    // ═══════════════════════════════════════════════════════════════
    // CONFIG ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Invalid configuration: {0}")]
    Config(String),

    // ═══════════════════════════════════════════════════════════════
    // SERVICE ERRORS
    // ═══════════════════════════════════════════════════════════════

    /// The monitoring loop ended without being asked to
    #[error("Monitoring loop stopped: {0}")]
    MonitorStopped(String),

    // ═══════════════════════════════════════════════════════════════
    // SERIALIZATION ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl DlpError {
    /// The service must refuse to start (or stop) on this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, DlpError::MasterKeyUnavailable(_))
    }

    /// Explicit security rejection - never silently turned into a grant
    pub fn is_security_rejection(&self) -> bool {
        matches!(
            self,
            DlpError::Integrity | DlpError::Unauthorized | DlpError::AccessDenied(_)
        )
    }

    /// Swallowed and logged; the caller keeps going
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DlpError::Platform(_)
                | DlpError::Protocol(_)
                | DlpError::FrameTooLarge { .. }
                | DlpError::CameraUnavailable(_)
                | DlpError::InvalidEnvelope(_)
                | DlpError::SerializationError(_)
        )
    }
}

impl From<rusqlite::Error> for DlpError {
    fn from(e: rusqlite::Error) -> Self {
        DlpError::DatabaseError(e.to_string())
    }
}

impl From<serde_json::Error> for DlpError {
    fn from(e: serde_json::Error) -> Self {
        DlpError::SerializationError(e.to_string())
    }
}

impl From<bincode::Error> for DlpError {
    fn from(e: bincode::Error) -> Self {
        DlpError::SerializationError(e.to_string())
    }
}

impl From<image::ImageError> for DlpError {
    fn from(e: image::ImageError) -> Self {
        DlpError::ImageError(e.to_string())
    }
}
