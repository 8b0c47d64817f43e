//! # Presence DLP
//!
//! Endpoint data-loss-prevention agent: protected applications and
//! documents are usable only while an enrolled, physically present person
//! is in front of the camera.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      SECURITY SERVICE                         │
//! │   monitoring loop (OS thread)        gateway (tokio, loopback)│
//! │   ┌───────────────────────┐          ┌──────────────────────┐ │
//! │   │ trigger → liveness →  │  state   │ HEARTBEAT            │ │
//! │   │ presence → enforce    │ ───────► │ GET_STATUS           │ │
//! │   └──────┬─────────┬──────┘ ◄─────── │ RELOAD_CONFIG        │ │
//! │          │         │        control  └──────────────────────┘ │
//! │   ┌──────┴──────┐ ┌┴──────────────┐                           │
//! │   │  LIVENESS   │ │ PROCESS GUARD │                           │
//! │   │  ANALYZER   │ │ freeze / hide │                           │
//! │   └──────┬──────┘ └───────────────┘                           │
//! │   ┌──────┴──────────────────────────────────────────────────┐ │
//! │   │  CRYPTO VAULT  master key → wrapped templates / file keys│ │
//! │   └─────────────────────────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! - Every secret at rest is AES-256-GCM `nonce || tag || ciphertext`
//! - One file key per document, rotated on every save
//! - Master key and gateway token wrapped under a root secret held in the
//!   OS credential store
//! - Unknown or spoofed faces block access even next to a valid employee
//! - Every frozen process is resumed on shutdown

pub mod config;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod guard;
pub mod opener;
pub mod secure_fs;
pub mod service;
pub mod storage;
pub mod vault;
pub mod vision;

pub use config::ServiceConfig;
pub use error::{DlpError, DlpResult};
pub use gateway::{GatewayClient, HeartbeatVerdict};
pub use guard::ProcessGuard;
pub use opener::{OpenedDocument, ProtectedOpener};
pub use service::{serve, AuthorizationState, SecurityService, SessionPhase};
pub use storage::{SqliteStore, Storage};
pub use vault::CryptoVault;
pub use vision::{LivenessAnalyzer, PresenceVerifier};

/// Presence DLP version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
