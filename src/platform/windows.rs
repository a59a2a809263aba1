use super::{ProcessTable, TermSignal};
use crate::core::models::{LiveProcess, StartTime};
use parking_lot::Mutex;
use std::io;
use std::process::Command;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, Signal, System};

pub fn prepare_command(_cmd: &mut Command) -> io::Result<()> {
    Ok(())
}

/// The child shares the reaper's console, so Ctrl-C already reached it.
pub fn interrupt_group(_pid: u32) -> io::Result<()> {
    Ok(())
}

/// Process table backed by a sysinfo snapshot that is refreshed per query
#[derive(Debug)]
pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

fn to_live_process(process: &sysinfo::Process) -> LiveProcess {
    let args: Vec<String> = process
        .cmd()
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    LiveProcess {
        pid: process.pid().as_u32(),
        // sysinfo reports whole seconds
        start_time: StartTime::from_millis(process.start_time() * 1000),
        parent: process.parent().map(|p| p.as_u32()),
        command_line: if args.is_empty() {
            None
        } else {
            Some(args.join(" "))
        },
    }
}

impl ProcessTable for SystemProcessTable {
    fn processes(&self) -> io::Result<Vec<LiveProcess>> {
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );
        Ok(system.processes().values().map(to_live_process).collect())
    }

    fn lookup(&self, pid: u32) -> Option<LiveProcess> {
        let sys_pid = Pid::from_u32(pid);
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::everything(),
        );
        system.process(sys_pid).map(to_live_process)
    }

    fn signal(&self, pid: u32, signal: TermSignal) -> io::Result<()> {
        let sys_pid = Pid::from_u32(pid);
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
        let Some(process) = system.process(sys_pid) else {
            return Ok(());
        };
        let delivered = match signal {
            // No graceful termination for arbitrary Windows processes
            TermSignal::Graceful => process
                .kill_with(Signal::Term)
                .unwrap_or_else(|| process.kill()),
            TermSignal::Forceful => process.kill(),
        };
        if delivered {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("TerminateProcess failed for pid {pid}"),
            ))
        }
    }
}
