//! OS process table access
//!
//! Platform strategy:
//! - Linux/macOS: psutil for enumeration and start times, nix for signals
//! - Windows: sysinfo for enumeration and termination

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::{interrupt_group, prepare_command, SystemProcessTable};
#[cfg(windows)]
pub use windows::{interrupt_group, prepare_command, SystemProcessTable};

use crate::core::models::{LiveProcess, ProcessIdentity};
use std::io;

/// How hard to ask a process to go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    /// SIGTERM on Unix
    Graceful,
    /// SIGKILL on Unix, TerminateProcess on Windows
    Forceful,
}

/// View of the live OS process table.
///
/// A process that has exited but not yet been reaped (zombie) is reported as
/// absent.
pub trait ProcessTable: Send + Sync {
    fn processes(&self) -> io::Result<Vec<LiveProcess>>;

    fn lookup(&self, pid: u32) -> Option<LiveProcess>;

    /// Deliver a termination signal. Signalling a pid that no longer exists
    /// is not an error.
    fn signal(&self, pid: u32, signal: TermSignal) -> io::Result<()>;

    /// True when the exact process instance is still running.
    fn is_running(&self, identity: &ProcessIdentity) -> bool {
        self.lookup(identity.pid)
            .map(|process| process.start_time == identity.start_time)
            .unwrap_or(false)
    }

    fn current(&self) -> Option<ProcessIdentity> {
        self.lookup(std::process::id()).map(|process| process.identity())
    }
}

/// Check if a PID represents a root process
pub fn is_root_process(pid: u32) -> bool {
    #[cfg(windows)]
    {
        pid == 0 || pid == 4 || pid == 1
    }

    #[cfg(unix)]
    {
        pid == 1 || pid == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_visible() {
        let table = SystemProcessTable::new();
        let me = table.current().expect("current process should be listed");
        assert_eq!(me.pid, std::process::id());
        assert!(table.is_running(&me));
    }

    #[test]
    fn different_start_time_is_not_running() {
        let table = SystemProcessTable::new();
        let me = table.current().unwrap();
        let impostor = ProcessIdentity::new(
            me.pid,
            crate::core::models::StartTime::from_millis(me.start_time.as_millis() + 60_000),
        );
        assert!(!table.is_running(&impostor));
    }

    #[test]
    fn start_times_are_wall_clock() {
        let me = SystemProcessTable::new().current().unwrap();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        // The test binary started moments ago, not decades before now
        let age = now.saturating_sub(me.start_time.as_millis());
        assert!(me.start_time.as_millis() <= now + 2_000);
        assert!(age < 24 * 60 * 60 * 1000, "start time {} is {age} ms old", me.start_time);
    }

    #[test]
    fn enumeration_includes_current_process() {
        let table = SystemProcessTable::new();
        let processes = table.processes().unwrap();
        assert!(processes.iter().any(|p| p.pid == std::process::id()));
    }

    #[test]
    fn test_root_process_detection() {
        assert!(is_root_process(1));
        assert!(is_root_process(0));
        assert!(!is_root_process(std::process::id()));
    }
}
