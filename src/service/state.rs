//! Presence DLP - Shared Authorization State
//!
//! Written by the monitoring loop only. Gateway handlers read it and touch
//! nothing but the heartbeat timestamp.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Session phase derived from the shared flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Nothing to protect
    Idle,
    /// Session open, liveness not yet proven
    AwaitingLiveness,
    /// Live, enrolled person present
    Authorized,
    /// Face missing for `misses` consecutive ticks, still under tolerance
    Degraded { misses: u32 },
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Idle => write!(f, "idle"),
            SessionPhase::AwaitingLiveness => write!(f, "awaiting-liveness"),
            SessionPhase::Authorized => write!(f, "authorized"),
            SessionPhase::Degraded { misses } => write!(f, "degraded({})", misses),
        }
    }
}

/// Messages delivered to the monitoring loop between ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Re-read the blacklist and the enrolled templates
    Reload,
    /// Release everything and leave the loop
    Shutdown,
}

/// Process-wide authorization flags
#[derive(Debug)]
pub struct AuthorizationState {
    session_active: AtomicBool,
    liveness_passed: AtomicBool,
    authorized: AtomicBool,
    /// Milliseconds after `epoch` of the last heartbeat, plus one; 0 = never
    last_heartbeat: AtomicU64,
    miss_count: AtomicU32,
    epoch: Instant,
}

impl AuthorizationState {
    pub fn new() -> Self {
        Self {
            session_active: AtomicBool::new(false),
            liveness_passed: AtomicBool::new(false),
            authorized: AtomicBool::new(false),
            last_heartbeat: AtomicU64::new(0),
            miss_count: AtomicU32::new(0),
            epoch: Instant::now(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // READERS
    // ═══════════════════════════════════════════════════════════════════════

    pub fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }

    pub fn session_active(&self) -> bool {
        self.session_active.load(Ordering::SeqCst)
    }

    pub fn liveness_passed(&self) -> bool {
        self.liveness_passed.load(Ordering::SeqCst)
    }

    pub fn miss_count(&self) -> u32 {
        self.miss_count.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> SessionPhase {
        if !self.session_active() {
            SessionPhase::Idle
        } else if !self.liveness_passed() {
            SessionPhase::AwaitingLiveness
        } else {
            match self.miss_count() {
                0 => SessionPhase::Authorized,
                misses => SessionPhase::Degraded { misses },
            }
        }
    }

    /// Time since the last viewer heartbeat, `None` if there never was one
    pub fn since_last_heartbeat(&self) -> Option<Duration> {
        match self.last_heartbeat.load(Ordering::SeqCst) {
            0 => None,
            stamp => {
                let at = self.epoch + Duration::from_millis(stamp - 1);
                Some(Instant::now().saturating_duration_since(at))
            }
        }
    }

    /// A viewer heartbeat arrived less than `window` ago
    pub fn viewer_active(&self, window: Duration) -> bool {
        self.since_last_heartbeat()
            .map(|elapsed| elapsed < window)
            .unwrap_or(false)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // GATEWAY WRITE
    // ═══════════════════════════════════════════════════════════════════════

    /// Record "viewer alive now"
    pub fn record_heartbeat(&self) {
        self.record_heartbeat_at(Instant::now());
    }

    pub fn record_heartbeat_at(&self, at: Instant) {
        let millis = at.saturating_duration_since(self.epoch).as_millis() as u64;
        self.last_heartbeat.store(millis + 1, Ordering::SeqCst);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // MONITORING LOOP WRITES
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn set_authorized(&self, value: bool) {
        self.authorized.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_session_active(&self, value: bool) {
        self.session_active.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_liveness_passed(&self, value: bool) {
        self.liveness_passed.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_miss_count(&self, value: u32) {
        self.miss_count.store(value, Ordering::SeqCst);
    }
}

impl Default for AuthorizationState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_locked_idle() {
        let state = AuthorizationState::new();
        assert!(!state.is_authorized());
        assert_eq!(state.phase(), SessionPhase::Idle);
        assert!(state.since_last_heartbeat().is_none());
        assert!(!state.viewer_active(Duration::from_secs(2)));
    }

    #[test]
    fn test_heartbeat_window() {
        let state = AuthorizationState::new();
        state.record_heartbeat();
        assert!(state.viewer_active(Duration::from_secs(2)));
        assert!(!state.viewer_active(Duration::ZERO));
    }

    #[test]
    fn test_phase_derivation() {
        let state = AuthorizationState::new();
        state.set_session_active(true);
        assert_eq!(state.phase(), SessionPhase::AwaitingLiveness);

        state.set_liveness_passed(true);
        assert_eq!(state.phase(), SessionPhase::Authorized);

        state.set_miss_count(1);
        assert_eq!(state.phase(), SessionPhase::Degraded { misses: 1 });
        assert_eq!(state.phase().to_string(), "degraded(1)");
    }
}
