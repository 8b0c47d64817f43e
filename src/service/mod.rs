//! Presence DLP - Security Service
//!
//! The monitoring loop. Each tick:
//!
//! 1. trigger = a blacklisted process is running, or a viewer sent a
//!    heartbeat within the heartbeat window
//! 2. no trigger: close the session, release the camera, reset to
//!    authorized
//! 3. session without proven liveness: full liveness scan; failure blocks
//!    the running targets and ends the tick
//! 4. otherwise: identity-only check with a miss tolerance; reaching the
//!    tolerance revokes authorization *and* the liveness proof
//! 5. enforcement: unblock targets when authorized, block them otherwise
//!
//! The loop is the only writer of [`AuthorizationState`] and the only user of
//! the camera.

pub mod runtime;
pub mod state;

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{error, info, warn};

use crate::config::ServiceConfig;
use crate::error::DlpResult;
use crate::guard::{Pid, ProcessGuard};
use crate::storage::Storage;
use crate::vision::PresenceVerifier;

pub use runtime::serve;
pub use state::{AuthorizationState, ControlMessage, SessionPhase};

/// Loop timing and tolerance
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub tick_interval: Duration,
    pub min_sleep: Duration,
    pub miss_tolerance: u32,
    pub heartbeat_window: Duration,
}

impl ServiceSettings {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            min_sleep: config.min_sleep(),
            miss_tolerance: config.miss_tolerance,
            heartbeat_window: config.heartbeat_window(),
        }
    }
}

/// Security Service orchestrator
pub struct SecurityService {
    storage: Arc<dyn Storage>,
    verifier: Box<dyn PresenceVerifier>,
    guard: Arc<ProcessGuard>,
    state: Arc<AuthorizationState>,
    blacklist: Vec<String>,
    settings: ServiceSettings,
}

impl SecurityService {
    /// Build the service and load the blacklist
    pub fn new(
        storage: Arc<dyn Storage>,
        verifier: Box<dyn PresenceVerifier>,
        guard: Arc<ProcessGuard>,
        state: Arc<AuthorizationState>,
        settings: ServiceSettings,
    ) -> DlpResult<Self> {
        let mut service = Self {
            storage,
            verifier,
            guard,
            state,
            blacklist: Vec::new(),
            settings,
        };
        service.reload_blacklist()?;
        Ok(service)
    }

    pub fn state(&self) -> Arc<AuthorizationState> {
        Arc::clone(&self.state)
    }

    pub fn blacklist(&self) -> &[String] {
        &self.blacklist
    }

    // ═══════════════════════════════════════════════════════════════════════
    // CONFIGURATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Re-read protected applications and enrolled templates
    pub fn reload_config(&mut self) -> DlpResult<()> {
        self.reload_blacklist()?;
        let templates = self.verifier.update_cache()?;
        info!(
            "Configuration reloaded: {} protected application(s), {} template(s)",
            self.blacklist.len(),
            templates
        );
        Ok(())
    }

    fn reload_blacklist(&mut self) -> DlpResult<()> {
        self.blacklist = self.storage.apps()?.into_iter().map(|app| app.exe).collect();
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // STATE MACHINE
    // ═══════════════════════════════════════════════════════════════════════

    /// Advance the state machine by one tick
    pub fn tick(&mut self) -> DlpResult<()> {
        let running = self.guard.find_running_targets(&self.blacklist);
        let viewer_active = self.state.viewer_active(self.settings.heartbeat_window);

        if running.is_empty() && !viewer_active {
            if self.state.session_active() {
                self.end_session();
            }
            return Ok(());
        }

        if !self.state.session_active() {
            info!("Protected activity detected, session started");
            self.state.set_session_active(true);
            self.state.set_liveness_passed(false);
            self.state.set_miss_count(0);
        }

        if !self.state.liveness_passed() {
            let verdict = self.verifier.verify_liveness()?;
            if !verdict.is_granted() {
                warn!("Liveness failed: {}", verdict.reason());
                self.state.set_authorized(false);
                self.block_all(&running);
                return Ok(());
            }

            info!("Liveness proven for this session");
            self.state.set_liveness_passed(true);
            self.state.set_authorized(true);
            self.state.set_miss_count(0);
        }

        if self.verifier.check_authorization()? {
            self.state.set_miss_count(0);
            self.state.set_authorized(true);
        } else {
            let misses = self.state.miss_count() + 1;
            self.state.set_miss_count(misses);

            if misses >= self.settings.miss_tolerance {
                if self.state.is_authorized() {
                    warn!("Authorized person absent for {} checks, blocking", misses);
                }
                self.state.set_authorized(false);
                self.state.set_liveness_passed(false);
            }
        }

        if self.state.is_authorized() {
            for &pid in &running {
                self.guard.unblock(pid);
            }
        } else {
            self.block_all(&running);
        }
        Ok(())
    }

    /// One tick with the loop's failure policy: errors are logged and an
    /// active session is never left authorized by one. A panic inside the
    /// tick is contained so the loop keeps enforcing; it revokes
    /// authorization and forces a fresh liveness proof.
    pub fn run_tick(&mut self) {
        match panic::catch_unwind(AssertUnwindSafe(|| self.tick())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Monitoring tick failed: {}", e);
                if self.state.session_active() {
                    self.state.set_authorized(false);
                }
            }
            Err(payload) => {
                error!("Monitoring tick panicked: {}", panic_message(payload.as_ref()));
                // next tick either ends the session or starts over at liveness
                self.state.set_session_active(true);
                self.state.set_liveness_passed(false);
                self.state.set_authorized(false);
            }
        }
    }

    fn end_session(&mut self) {
        info!("Protected activity ended, camera released");
        self.verifier.release_camera();
        self.state.set_session_active(false);
        self.state.set_liveness_passed(false);
        self.state.set_miss_count(0);
        self.state.set_authorized(true);
    }

    fn block_all(&self, pids: &BTreeSet<Pid>) {
        for &pid in pids {
            self.guard.block(pid);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LOOP
    // ═══════════════════════════════════════════════════════════════════════

    /// Run until [`ControlMessage::Shutdown`] arrives or every sender is
    /// gone. Blocked processes are always released on the way out.
    pub fn run(&mut self, control: &Receiver<ControlMessage>) {
        info!("Monitoring loop started");
        let mut reload_pending = false;

        loop {
            let started = Instant::now();

            if std::mem::take(&mut reload_pending) {
                if let Err(e) = self.reload_config() {
                    warn!("Configuration reload failed: {}", e);
                }
            }

            self.run_tick();

            let delay = next_delay(
                started.elapsed(),
                self.settings.tick_interval,
                self.settings.min_sleep,
            );
            if !wait_for_next_tick(control, Instant::now() + delay, &mut reload_pending) {
                break;
            }
        }

        self.shutdown();
    }

    /// Unfreeze everything and close the camera
    pub fn shutdown(&mut self) {
        self.guard.release_all();
        self.verifier.release_camera();
        info!("Monitoring loop stopped");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Sleep before the next tick: the rest of the interval, never less than
/// the floor
pub fn next_delay(elapsed: Duration, interval: Duration, min_sleep: Duration) -> Duration {
    interval.saturating_sub(elapsed).max(min_sleep)
}

/// Wait until `deadline`, collecting control messages. `false` means stop.
fn wait_for_next_tick(
    control: &Receiver<ControlMessage>,
    deadline: Instant,
    reload_pending: &mut bool,
) -> bool {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        match control.recv_timeout(remaining) {
            Ok(ControlMessage::Reload) => *reload_pending = true,
            Ok(ControlMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => return false,
            Err(RecvTimeoutError::Timeout) => return true,
        }
    }
}
