//! Presence DLP - OS Process & Window Control
//!
//! [`Platform`] is the only place that touches OS processes and windows.
//! [`SystemPlatform`] enumerates and signals processes through `sysinfo`
//! and drives X11 windows through the `xdotool` utility.

use std::process::Command;

use parking_lot::Mutex;
use sysinfo::{Pid as SysPid, ProcessesToUpdate, Signal, System};
use tracing::debug;

use crate::error::{DlpError, DlpResult};

/// OS process id
pub type Pid = u32;

/// Opaque top-level window handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(pub u64);

/// Running process as seen by the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    /// Executable name, e.g. `excel.exe` or `gedit`
    pub name: String,
}

/// OS operations needed to suppress and restore a process
pub trait Platform: Send + Sync {
    /// Every running process
    fn list_processes(&self) -> Vec<ProcessInfo>;

    /// Top-level windows owned by `pid`
    fn windows_of(&self, pid: Pid) -> Vec<WindowId>;

    fn window_exists(&self, window: WindowId) -> bool;

    fn suspend(&self, pid: Pid) -> DlpResult<()>;

    fn resume(&self, pid: Pid) -> DlpResult<()>;

    fn minimize(&self, window: WindowId) -> DlpResult<()>;

    fn hide(&self, window: WindowId) -> DlpResult<()>;

    fn show(&self, window: WindowId) -> DlpResult<()>;

    fn restore(&self, window: WindowId) -> DlpResult<()>;

    fn set_input_enabled(&self, window: WindowId, enabled: bool) -> DlpResult<()>;

    /// Window currently holding keyboard focus
    fn focused_window(&self) -> Option<WindowId>;

    /// Give focus to a window outside `avoid`
    fn focus_away(&self, avoid: &[WindowId]) -> DlpResult<()>;
}

/// Desktop implementation: `sysinfo` for processes, `xdotool` for windows
pub struct SystemPlatform {
    system: Mutex<System>,
}

impl SystemPlatform {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn signal(&self, pid: Pid, signal: Signal) -> DlpResult<()> {
        let mut system = self.system.lock();
        let sys_pid = SysPid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);

        let process = system
            .process(sys_pid)
            .ok_or_else(|| DlpError::Platform(format!("process {} not found", pid)))?;

        match process.kill_with(signal) {
            Some(true) => Ok(()),
            Some(false) => Err(DlpError::Platform(format!("{:?} to {} refused", signal, pid))),
            None => Err(DlpError::Platform(format!("{:?} unsupported here", signal))),
        }
    }
}

impl Default for SystemPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SystemPlatform {
    fn list_processes(&self) -> Vec<ProcessInfo> {
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::All, true);

        system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().into_owned(),
            })
            .collect()
    }

    fn windows_of(&self, pid: Pid) -> Vec<WindowId> {
        match xdotool(&["search", "--pid", &pid.to_string()]) {
            Ok(out) => parse_window_ids(&out),
            Err(e) => {
                debug!("No windows for {}: {}", pid, e);
                Vec::new()
            }
        }
    }

    fn window_exists(&self, window: WindowId) -> bool {
        xdotool(&["getwindowname", &window.0.to_string()]).is_ok()
    }

    fn suspend(&self, pid: Pid) -> DlpResult<()> {
        self.signal(pid, Signal::Stop)
    }

    fn resume(&self, pid: Pid) -> DlpResult<()> {
        self.signal(pid, Signal::Continue)
    }

    fn minimize(&self, window: WindowId) -> DlpResult<()> {
        xdotool(&["windowminimize", &window.0.to_string()]).map(|_| ())
    }

    fn hide(&self, window: WindowId) -> DlpResult<()> {
        xdotool(&["windowunmap", &window.0.to_string()]).map(|_| ())
    }

    fn show(&self, window: WindowId) -> DlpResult<()> {
        xdotool(&["windowmap", &window.0.to_string()]).map(|_| ())
    }

    fn restore(&self, window: WindowId) -> DlpResult<()> {
        xdotool(&["windowraise", &window.0.to_string()]).map(|_| ())
    }

    fn set_input_enabled(&self, window: WindowId, enabled: bool) -> DlpResult<()> {
        // X11 has no per-window input switch; an unmapped window gets no input anyway
        debug!("Input {} for window {}", if enabled { "on" } else { "off" }, window.0);
        Ok(())
    }

    fn focused_window(&self) -> Option<WindowId> {
        xdotool(&["getwindowfocus"])
            .ok()
            .and_then(|out| parse_window_ids(&out).into_iter().next())
    }

    fn focus_away(&self, avoid: &[WindowId]) -> DlpResult<()> {
        let visible = parse_window_ids(&xdotool(&["search", "--onlyvisible", "--name", ".*"])?);
        let target = focus_target(&visible, avoid)
            .ok_or_else(|| DlpError::Platform("no other window can take focus".into()))?;
        xdotool(&["windowactivate", &target.0.to_string()]).map(|_| ())
    }
}

fn xdotool(args: &[&str]) -> DlpResult<String> {
    let output = Command::new("xdotool")
        .args(args)
        .output()
        .map_err(|e| DlpError::Platform(format!("xdotool: {}", e)))?;

    if !output.status.success() {
        return Err(DlpError::Platform(format!(
            "xdotool {} exited with {}",
            args.join(" "),
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Topmost candidate not in `avoid`; `xdotool search` lists bottom to top
fn focus_target(candidates: &[WindowId], avoid: &[WindowId]) -> Option<WindowId> {
    candidates.iter().rev().copied().find(|w| !avoid.contains(w))
}

fn parse_window_ids(out: &str) -> Vec<WindowId> {
    out.lines()
        .filter_map(|line| line.trim().parse::<u64>().ok())
        .map(WindowId)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_window_ids() {
        assert_eq!(
            parse_window_ids("62914561\n\n62914575\nnoise\n"),
            vec![WindowId(62914561), WindowId(62914575)]
        );
        assert!(parse_window_ids("").is_empty());
    }

    #[test]
    fn test_focus_target_skips_blocked_windows() {
        let stack = [WindowId(1), WindowId(2), WindowId(3)];
        assert_eq!(focus_target(&stack, &[WindowId(3)]), Some(WindowId(2)));
        assert_eq!(focus_target(&stack, &[WindowId(2), WindowId(3)]), Some(WindowId(1)));
        assert_eq!(focus_target(&stack, &stack), None);
        assert_eq!(focus_target(&[], &[]), None);
    }

    #[test]
    fn test_lists_own_process() {
        let platform = SystemPlatform::new();
        let me = std::process::id();
        assert!(platform.list_processes().iter().any(|p| p.pid == me));
    }
}
