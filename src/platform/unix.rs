use super::{ProcessTable, TermSignal};
use crate::core::models::{LiveProcess, StartTime};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use psutil::process::{Process, Status};
use std::io;
use std::process::Command;
use tracing::debug;

/// Put a spawned build in its own process group (group id = its pid) so a
/// terminal interrupt reaches the reaper first and [`interrupt_group`] can
/// forward it to the whole build.
pub fn prepare_command(cmd: &mut Command) -> io::Result<()> {
    use std::os::unix::process::CommandExt;

    cmd.process_group(0);
    Ok(())
}

/// Send SIGINT to the process group led by `pid`.
pub fn interrupt_group(pid: u32) -> io::Result<()> {
    match signal::killpg(to_pid(pid)?, Signal::SIGINT) {
        Ok(()) => {
            debug!(pgid = pid, "interrupt forwarded to process group");
            Ok(())
        }
        Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

fn to_pid(pid: u32) -> io::Result<Pid> {
    i32::try_from(pid)
        .map(Pid::from_raw)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))
}

/// procfs reports start times in ticks since boot; shift them onto the epoch.
#[cfg(target_os = "linux")]
static BOOT_TIME: once_cell::sync::Lazy<std::time::Duration> = once_cell::sync::Lazy::new(|| {
    psutil::host::boot_time()
        .ok()
        .and_then(|boot| boot.duration_since(std::time::UNIX_EPOCH).ok())
        .unwrap_or_default()
});

fn start_time(process: &Process) -> StartTime {
    #[cfg(target_os = "linux")]
    let offset = *BOOT_TIME + process.create_time();
    #[cfg(not(target_os = "linux"))]
    let offset = process.create_time();
    StartTime::from_epoch_offset(offset)
}

/// Process table backed by psutil (procfs on Linux, sysctl on macOS)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

impl SystemProcessTable {
    pub fn new() -> Self {
        Self
    }
}

fn to_live_process(process: &Process) -> Option<LiveProcess> {
    // Exited but unreaped processes keep their pid; they are not running
    if let Ok(Status::Zombie) = process.status() {
        return None;
    }
    Some(LiveProcess {
        pid: process.pid(),
        start_time: start_time(process),
        parent: process.ppid().ok().flatten(),
        command_line: process.cmdline().ok().flatten(),
    })
}

impl ProcessTable for SystemProcessTable {
    fn processes(&self) -> io::Result<Vec<LiveProcess>> {
        let processes = psutil::process::processes()
            .map_err(|err| io::Error::other(format!("failed to enumerate processes: {err}")))?;
        // Processes that vanish mid-scan show up as errors; skip them
        Ok(processes
            .into_iter()
            .filter_map(|process| process.ok())
            .filter_map(|process| to_live_process(&process))
            .collect())
    }

    fn lookup(&self, pid: u32) -> Option<LiveProcess> {
        let process = Process::new(pid).ok()?;
        to_live_process(&process)
    }

    fn signal(&self, pid: u32, signal: TermSignal) -> io::Result<()> {
        let sig = match signal {
            TermSignal::Graceful => Signal::SIGTERM,
            TermSignal::Forceful => Signal::SIGKILL,
        };
        match signal::kill(to_pid(pid)?, sig) {
            Ok(()) => {
                debug!(pid, signal = sig.as_str(), "signal sent");
                Ok(())
            }
            Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }
}
