//! Leaked process detection and termination
//!
//! A registry record names one process instance by `(pid, start_time)`.
//! Before the build starts, records whose process is still running but whose
//! owning session is gone are killed; records whose process has exited, or
//! whose pid now belongs to a different process, are only dropped.

use crate::{
    config::{CleanupConfig, KILL_POLL_INTERVAL},
    core::models::{LiveProcess, ProcessIdentity, ProcessRecord, StartTime},
    core::process_tree::protected_pids,
    error::{CleanupError, CleanupResult},
    platform::{ProcessTable, TermSignal},
    storage::ProcessRegistry,
    tracker::DaemonTracker,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Owner token used for live processes found by command line rather than
/// through the registry.
pub const UNTRACKED_OWNER: &str = "untracked";

/// How long to wait for the OS to reap a process after SIGKILL
const FORCE_KILL_WAIT: Duration = Duration::from_secs(2);

/// Shared flag that stops an in-flight kill pass
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What the live process table says about a registry record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakStatus {
    /// The exact process instance is still running
    Running,
    /// Nothing holds the pid any more
    Exited,
    /// The pid belongs to a different process now
    PidReused { live_start: StartTime },
}

impl LeakStatus {
    pub fn classify(table: &dyn ProcessTable, record: &ProcessRecord) -> Self {
        match table.lookup(record.pid) {
            None => LeakStatus::Exited,
            Some(live) if live.start_time == record.start_time => LeakStatus::Running,
            Some(live) => LeakStatus::PidReused {
                live_start: live.start_time,
            },
        }
    }

    pub fn is_stale(&self) -> bool {
        !matches!(self, LeakStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakedProcess {
    pub record: ProcessRecord,
    pub status: LeakStatus,
    /// False for processes discovered by command line, not in the registry
    pub tracked: bool,
}

impl LeakedProcess {
    pub fn tracked(record: ProcessRecord, status: LeakStatus) -> Self {
        Self {
            record,
            status,
            tracked: true,
        }
    }

    pub fn untracked(process: &LiveProcess, home_dir: &std::path::Path) -> Self {
        let mut record =
            ProcessRecord::new(process.pid, process.start_time, UNTRACKED_OWNER, home_dir);
        if let Some(command) = &process.command_line {
            record = record.with_command(command.clone());
        }
        Self {
            record,
            status: LeakStatus::Running,
            tracked: false,
        }
    }

    pub fn identity(&self) -> ProcessIdentity {
        self.record.identity()
    }
}

/// Finds processes that outlived the build session that started them.
pub struct LeakDetector {
    tracker: Arc<DaemonTracker>,
}

impl LeakDetector {
    pub fn new(tracker: Arc<DaemonTracker>) -> Self {
        Self { tracker }
    }

    /// Classify every registry record that is not owned by a live session.
    ///
    /// Stale records (exited or pid reused) are always returned so the
    /// killer can drop them; running processes are returned only when their
    /// owner is gone.
    pub fn find_leaked(&self) -> CleanupResult<Vec<LeakedProcess>> {
        let table = self.tracker.process_table().as_ref();
        let protected: HashSet<u32> = protected_pids(table).into_iter().collect();
        let mut leaked = Vec::new();

        for record in self.tracker.acquire()?.list()? {
            let status = LeakStatus::classify(table, &record);
            match status {
                LeakStatus::Running => {
                    if protected.contains(&record.pid) {
                        debug!(identity = %record.identity(), "skipping own process ancestry");
                        continue;
                    }
                    if self.owner_is_alive(table, &record) {
                        continue;
                    }
                    info!(process = %record.describe(), "leaked process found");
                }
                LeakStatus::Exited => {
                    debug!(identity = %record.identity(), "registered process has exited");
                }
                LeakStatus::PidReused { live_start } => {
                    debug!(identity = %record.identity(), %live_start, "pid reused by another process");
                }
            }
            leaked.push(LeakedProcess::tracked(record, status));
        }

        Ok(leaked)
    }

    /// Live processes that are not in the registry but whose command line
    /// mentions one of `markers` (for example the checkout directory).
    pub fn find_untracked(&self, markers: &[PathBuf]) -> CleanupResult<Vec<LeakedProcess>> {
        let table = self.tracker.process_table().as_ref();
        let protected: HashSet<u32> = protected_pids(table).into_iter().collect();
        let registered: HashSet<ProcessIdentity> = self
            .tracker
            .acquire()?
            .list()?
            .map(|record| record.identity())
            .collect();
        let markers: Vec<String> = markers
            .iter()
            .map(|marker| marker.to_string_lossy().into_owned())
            .filter(|marker| !marker.is_empty())
            .collect();

        let processes = table.processes().map_err(|err| CleanupError::ProcessControl {
            pid: 0,
            message: format!("cannot enumerate processes: {err}"),
        })?;

        Ok(processes
            .iter()
            .filter(|process| !protected.contains(&process.pid))
            .filter(|process| !registered.contains(&process.identity()))
            .filter(|process| {
                process
                    .command_line
                    .as_deref()
                    .map(|cmd| markers.iter().any(|marker| cmd.contains(marker.as_str())))
                    .unwrap_or(false)
            })
            .map(|process| LeakedProcess::untracked(process, self.tracker.home_dir()))
            .collect())
    }

    fn owner_is_alive(&self, table: &dyn ProcessTable, record: &ProcessRecord) -> bool {
        if record.owner_build_id == self.tracker.build_id() {
            return true;
        }
        record
            .owner
            .map(|owner| Some(owner) != self.tracker.owner() && table.is_running(&owner))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct KillOptions {
    /// Time between the graceful signal and the forceful one
    pub grace_period: Duration,
    pub poll_interval: Duration,
    /// Overall deadline for the whole kill pass; None when unbounded
    pub deadline: Option<Instant>,
    pub cancel: CancellationFlag,
}

impl KillOptions {
    pub fn from_config(config: &CleanupConfig, cancel: CancellationFlag) -> Self {
        Self {
            grace_period: config.kill_grace_period,
            poll_interval: KILL_POLL_INTERVAL,
            deadline: Instant::now().checked_add(config.kill_timeout),
            cancel,
        }
    }
}

impl Default for KillOptions {
    fn default() -> Self {
        Self {
            grace_period: crate::config::KILL_GRACE_PERIOD,
            poll_interval: KILL_POLL_INTERVAL,
            deadline: None,
            cancel: CancellationFlag::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Graceful,
    Forced,
    AlreadyGone,
}

#[derive(Debug)]
pub struct KillFailure {
    pub record: ProcessRecord,
    pub error: CleanupError,
}

/// Outcome of a kill pass. Failures never abort the pass.
#[derive(Debug, Default)]
pub struct KillReport {
    pub terminated: Vec<(ProcessRecord, Termination)>,
    pub stale_removed: Vec<ProcessRecord>,
    pub failures: Vec<KillFailure>,
    /// Not attempted because the pass was cancelled or ran out of time
    pub abandoned: Vec<ProcessRecord>,
}

impl KillReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.abandoned.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} terminated, {} stale records removed, {} failed, {} abandoned",
            self.terminated.len(),
            self.stale_removed.len(),
            self.failures.len(),
            self.abandoned.len()
        )
    }
}

/// Terminates leaked processes: graceful signal, bounded wait, then force.
pub struct ProcessKiller {
    table: Arc<dyn ProcessTable>,
    options: KillOptions,
}

impl ProcessKiller {
    pub fn new(table: Arc<dyn ProcessTable>, options: KillOptions) -> Self {
        Self { table, options }
    }

    pub fn options(&self) -> &KillOptions {
        &self.options
    }

    /// Best-effort kill of every entry; stale entries are only dropped from
    /// the registry. Once the pass is cancelled or out of time no further
    /// signals are sent, but records of processes that are already gone are
    /// still dropped.
    pub fn kill(&self, registry: &ProcessRegistry, leaked: Vec<LeakedProcess>) -> KillReport {
        let mut report = KillReport::default();
        let mut stopped = false;

        for entry in leaked {
            if !stopped {
                if let Some(reason) = self.stop_reason() {
                    warn!(reason, "kill pass stopped early");
                    stopped = true;
                }
            }

            if entry.status.is_stale() || (stopped && !self.table.is_running(&entry.identity())) {
                self.drop_stale(registry, entry, &mut report);
                continue;
            }
            if stopped {
                report.abandoned.push(entry.record);
                continue;
            }

            match self.terminate(&entry.identity()) {
                Ok(outcome) => {
                    info!(process = %entry.record.describe(), ?outcome, "process terminated");
                    if entry.tracked {
                        if let Err(err) = registry.remove_identity(&entry.identity()) {
                            warn!(identity = %entry.identity(), "terminated but record not removed: {err}");
                        }
                    }
                    report.terminated.push((entry.record, outcome));
                }
                Err(error) => {
                    warn!(process = %entry.record.describe(), "{error}");
                    report.failures.push(KillFailure {
                        record: entry.record,
                        error,
                    });
                }
            }
        }

        for record in &report.abandoned {
            warn!(process = %record.describe(), "process left running");
        }
        report
    }

    fn drop_stale(&self, registry: &ProcessRegistry, entry: LeakedProcess, report: &mut KillReport) {
        if !entry.tracked {
            return;
        }
        match registry.remove_identity(&entry.identity()) {
            Ok(_) => report.stale_removed.push(entry.record),
            Err(err) => {
                warn!(identity = %entry.identity(), "failed to drop stale record: {err}");
                report.failures.push(KillFailure {
                    record: entry.record,
                    error: err.into(),
                });
            }
        }
    }

    /// Terminate one exact process instance. The identity is re-checked
    /// before every signal so a recycled pid is never hit.
    pub fn terminate(&self, identity: &ProcessIdentity) -> CleanupResult<Termination> {
        if !self.table.is_running(identity) {
            return Ok(Termination::AlreadyGone);
        }

        let graceful = self.table.signal(identity.pid, TermSignal::Graceful);
        if let Err(err) = &graceful {
            debug!(%identity, "graceful termination failed: {err}");
        } else if self.wait_for_exit(identity, self.grace_window()) {
            return Ok(Termination::Graceful);
        }

        if !self.table.is_running(identity) {
            return Ok(Termination::Graceful);
        }
        self.table
            .signal(identity.pid, TermSignal::Forceful)
            .map_err(|err| CleanupError::ProcessControl {
                pid: identity.pid,
                message: err.to_string(),
            })?;
        if self.wait_for_exit(identity, FORCE_KILL_WAIT) {
            Ok(Termination::Forced)
        } else {
            Err(CleanupError::ProcessControl {
                pid: identity.pid,
                message: "still running after forceful termination".to_string(),
            })
        }
    }

    fn grace_window(&self) -> Duration {
        match self.options.deadline {
            Some(deadline) => self
                .options
                .grace_period
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.options.grace_period,
        }
    }

    fn wait_for_exit(&self, identity: &ProcessIdentity, window: Duration) -> bool {
        let started = Instant::now();
        loop {
            if !self.table.is_running(identity) {
                return true;
            }
            if started.elapsed() >= window || self.options.cancel.is_cancelled() {
                return false;
            }
            thread::sleep(self.options.poll_interval.min(window));
        }
    }

    fn stop_reason(&self) -> Option<&'static str> {
        if self.options.cancel.is_cancelled() {
            return Some("cancelled");
        }
        match self.options.deadline {
            Some(deadline) if Instant::now() >= deadline => Some("deadline exceeded"),
            _ => None,
        }
    }
}
