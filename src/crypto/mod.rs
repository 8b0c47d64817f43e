//! Presence DLP - Cryptographic Core
//!
//! AES-256-GCM envelopes for secrets at rest, key material, and the
//! machine-bound protected storage that wraps the master key and IPC token.

pub mod keys;
pub mod envelope;
pub mod protected;

pub use keys::*;
pub use envelope::*;
pub use protected::*;
