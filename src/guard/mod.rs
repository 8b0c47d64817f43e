//! Presence DLP - Process Guard
//!
//! Reversible suppression of protected applications: windows are
//! minimized, disabled and hidden, then the process is frozen. Every OS call
//! is best-effort; a failure is logged and never reaches the caller.

pub mod platform;

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub use platform::{Pid, Platform, ProcessInfo, SystemPlatform, WindowId};

/// Windows captured at block time and the processes currently frozen
#[derive(Debug, Default)]
struct BlockedSet {
    windows: HashMap<Pid, Vec<WindowId>>,
    suspended: HashSet<Pid>,
}

/// Process Guard
pub struct ProcessGuard {
    platform: Box<dyn Platform>,
    state: Mutex<BlockedSet>,
}

impl ProcessGuard {
    pub fn new(platform: Box<dyn Platform>) -> Self {
        Self {
            platform,
            state: Mutex::new(BlockedSet::default()),
        }
    }

    /// Pids of running processes whose executable is in `names`.
    ///
    /// Comparison ignores case and an `.exe` suffix on either side.
    pub fn find_running_targets(&self, names: &[String]) -> BTreeSet<Pid> {
        if names.is_empty() {
            return BTreeSet::new();
        }
        let targets: HashSet<String> = names.iter().map(|n| normalize_exe(n)).collect();

        self.platform
            .list_processes()
            .into_iter()
            .filter(|p| targets.contains(&normalize_exe(&p.name)))
            .map(|p| p.pid)
            .collect()
    }

    /// Hide every window of `pid` and freeze the process. No-op when the
    /// process is already frozen.
    pub fn block(&self, pid: Pid) {
        let mut state = self.state.lock();
        if state.suspended.contains(&pid) {
            return;
        }

        let windows = self.platform.windows_of(pid);
        if !windows.is_empty() {
            if let Some(focused) = self.platform.focused_window() {
                if windows.contains(&focused) {
                    if let Err(e) = self.platform.focus_away(&windows) {
                        debug!("Focus shift failed: {}", e);
                    }
                }
            }

            for &window in &windows {
                self.suppress_window(window);
            }

            let recorded = state.windows.entry(pid).or_default();
            for window in windows {
                if !recorded.contains(&window) {
                    recorded.push(window);
                }
            }
        }

        match self.platform.suspend(pid) {
            Ok(()) => {
                state.suspended.insert(pid);
                warn!("Blocked process {}", pid);
            }
            Err(e) => warn!("Could not suspend process {}: {}", pid, e),
        }
    }

    /// Thaw `pid` and bring back the windows recorded when it was blocked.
    /// Safe to call on a process that is not blocked.
    pub fn unblock(&self, pid: Pid) {
        let mut state = self.state.lock();

        if state.suspended.remove(&pid) {
            if let Err(e) = self.platform.resume(pid) {
                warn!("Could not resume process {}: {}", pid, e);
            }
        }

        if let Some(windows) = state.windows.remove(&pid) {
            for window in windows {
                if self.platform.window_exists(window) {
                    self.reveal_window(window);
                }
            }
            info!("Released process {}", pid);
        }
    }

    /// Unblock every tracked process. Used on shutdown so nothing is left
    /// frozen.
    pub fn release_all(&self) {
        let pids: BTreeSet<Pid> = {
            let state = self.state.lock();
            state
                .suspended
                .iter()
                .chain(state.windows.keys())
                .copied()
                .collect()
        };

        if !pids.is_empty() {
            info!("Releasing {} blocked process(es)", pids.len());
        }
        for pid in pids {
            self.unblock(pid);
        }
    }

    pub fn is_suspended(&self, pid: Pid) -> bool {
        self.state.lock().suspended.contains(&pid)
    }

    /// Pids with any block state (frozen or windows recorded)
    pub fn blocked_pids(&self) -> BTreeSet<Pid> {
        let state = self.state.lock();
        state
            .suspended
            .iter()
            .chain(state.windows.keys())
            .copied()
            .collect()
    }

    fn suppress_window(&self, window: WindowId) {
        if let Err(e) = self.platform.minimize(window) {
            debug!("minimize {:?}: {}", window, e);
        }
        if let Err(e) = self.platform.set_input_enabled(window, false) {
            debug!("disable input {:?}: {}", window, e);
        }
        if let Err(e) = self.platform.hide(window) {
            debug!("hide {:?}: {}", window, e);
        }
    }

    fn reveal_window(&self, window: WindowId) {
        if let Err(e) = self.platform.show(window) {
            debug!("show {:?}: {}", window, e);
        }
        if let Err(e) = self.platform.set_input_enabled(window, true) {
            debug!("enable input {:?}: {}", window, e);
        }
        if let Err(e) = self.platform.restore(window) {
            debug!("restore {:?}: {}", window, e);
        }
    }
}

/// `EXCEL.EXE` -> `excel`
fn normalize_exe(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}
