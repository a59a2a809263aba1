//! Command handlers behind the CLI

pub mod parser;

pub use parser::{Cli, Commands, GlobalOptions};

use crate::{
    cache_cleaner::CleanReport,
    config::{CleanupConfig, KILL_POLL_INTERVAL},
    error::{CleanupError, CleanupResult},
    lifecycle::{self, BuildLifecycle},
    platform::{interrupt_group, prepare_command, ProcessTable, SystemProcessTable},
    reaper::{CancellationFlag, KillReport},
    tasks::{CleanupTask, TaskContext, TaskOutcome},
    tracker::SharedServices,
};
use std::process::{Child, Command, ExitStatus};
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};

/// Exit code for fatal cleanup errors
pub const EXIT_FATAL: i32 = 2;

pub struct CommandRunner {
    config: CleanupConfig,
    services: Arc<SharedServices>,
    table: Arc<dyn ProcessTable>,
    cancel: CancellationFlag,
}

impl CommandRunner {
    pub fn new(config: CleanupConfig, cancel: CancellationFlag) -> Self {
        Self {
            config,
            services: Arc::new(SharedServices::new()),
            table: Arc::new(SystemProcessTable::new()),
            cancel,
        }
    }

    /// Run one command and return the process exit code.
    pub fn run(&self, command: Commands) -> i32 {
        match self.dispatch(command) {
            Ok(code) => code,
            Err(err) if err.is_fatal() => {
                error!("{}", err.user_message());
                EXIT_FATAL
            }
            Err(err) => {
                warn!("{}", err.user_message());
                1
            }
        }
    }

    fn dispatch(&self, command: Commands) -> CleanupResult<i32> {
        match command {
            Commands::KillLeaked => self.run_task(CleanupTask::KillExistingProcesses, false),
            Commands::CleanDaemons => self.run_task(CleanupTask::CleanUpDaemons, false),
            Commands::CleanCaches { dry_run } => self.run_task(CleanupTask::CleanUpCaches, dry_run),
            Commands::Clean { dry_run } => self.run_task(CleanupTask::Clean, dry_run),
            Commands::Record { pid, owner } => self.record(pid, owner),
            Commands::List => self.list(),
            Commands::Run { command } => self.run_build(command),
        }
    }

    fn context(&self) -> CleanupResult<TaskContext> {
        let tracker = lifecycle::shared_tracker(&self.services, &self.config, Arc::clone(&self.table))?;
        Ok(TaskContext::new(self.config.clone(), tracker).with_cancellation(self.cancel.clone()))
    }

    fn run_task(&self, task: CleanupTask, dry_run: bool) -> CleanupResult<i32> {
        let mut ctx = self.context()?.dry_run(dry_run);
        let mut code = 0;
        for (task, outcome) in ctx.execute(task)? {
            match outcome {
                TaskOutcome::Killed(report) => {
                    print_kill_report(task, &report);
                    if !report.is_clean() {
                        code = 1;
                    }
                }
                TaskOutcome::Cleaned(report) => print_clean_report(task, &report),
                TaskOutcome::Skipped(reason) => println!("{task}: skipped ({reason})"),
                TaskOutcome::Done => {}
            }
        }
        Ok(code)
    }

    fn record(&self, pid: u32, owner: Option<String>) -> CleanupResult<i32> {
        let tracker = lifecycle::shared_tracker(&self.services, &self.config, Arc::clone(&self.table))?;
        let record = match owner {
            None => tracker.track(pid, None)?,
            Some(owner) => {
                let live = self.table.lookup(pid).ok_or_else(|| CleanupError::ProcessControl {
                    pid,
                    message: "process is not running".to_string(),
                })?;
                tracker.record(pid, live.start_time, &owner)?
            }
        };
        println!("recorded {}", record.describe());
        Ok(0)
    }

    fn list(&self) -> CleanupResult<i32> {
        let tracker = lifecycle::shared_tracker(&self.services, &self.config, Arc::clone(&self.table))?;
        let records = tracker.records()?;
        if records.is_empty() {
            println!("no registered processes");
        }
        for record in records {
            let state = if self.table.is_running(&record.identity()) {
                "running"
            } else {
                "gone"
            };
            println!("{:<8} {}", state, record.describe());
        }
        Ok(0)
    }

    /// Full lifecycle around a build command; the exit code is the command's.
    fn run_build(&self, argv: Vec<String>) -> CleanupResult<i32> {
        let Some((program, args)) = argv.split_first() else {
            return Err(CleanupError::Config("no command given".to_string()));
        };

        let mut lifecycle = BuildLifecycle::new(
            self.config.clone(),
            Arc::clone(&self.services),
            Arc::clone(&self.table),
        )
        .with_cancellation(self.cancel.clone());

        lifecycle.acquire_tracker()?;
        match lifecycle.pre_build() {
            Ok(report) => print_kill_report(CleanupTask::KillExistingProcesses, &report),
            Err(err) if !err.is_fatal() => warn!("leak kill failed: {err}"),
            Err(err) => return Err(err),
        }

        let status = lifecycle.run_build(|tracker| -> CleanupResult<i32> {
            let mut cmd = Command::new(program);
            cmd.args(args);
            prepare_command(&mut cmd).map_err(|err| spawn_error(0, err))?;
            let mut child = cmd.spawn().map_err(|err| spawn_error(0, err))?;
            let pid = child.id();
            if let Err(err) = tracker.track(pid, Some(&argv.join(" "))) {
                warn!(pid, "could not register build process: {err}");
            }
            info!(pid, command = %program, "build started");
            let status = self.wait_for_build(&mut child).map_err(|err| spawn_error(pid, err))?;
            info!(pid, %status, "build finished");
            Ok(status.code().unwrap_or(1))
        })?;

        let post = lifecycle.post_build(false);
        lifecycle.finish()?;
        match post {
            Ok(report) => {
                print_kill_report(CleanupTask::CleanUpDaemons, &report.daemons);
                if let Some(caches) = &report.caches {
                    print_clean_report(CleanupTask::CleanUpCaches, caches);
                }
            }
            Err(err) if !err.is_fatal() => warn!("post-build cleanup failed: {err}"),
            Err(err) => return Err(err),
        }
        status
    }

    /// Wait for the build, forwarding an interrupt of the reaper to the
    /// build's process group once.
    fn wait_for_build(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        let mut forwarded = false;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if !forwarded && self.cancel.is_cancelled() {
                warn!(pid = child.id(), "interrupted; stopping the build");
                if let Err(err) = interrupt_group(child.id()) {
                    warn!(pid = child.id(), "could not interrupt the build: {err}");
                }
                forwarded = true;
            }
            thread::sleep(KILL_POLL_INTERVAL);
        }
    }
}

fn spawn_error(pid: u32, err: std::io::Error) -> CleanupError {
    CleanupError::ProcessControl {
        pid,
        message: format!("build command failed: {err}"),
    }
}

fn print_kill_report(task: CleanupTask, report: &KillReport) {
    println!("{task}: {}", report.summary());
    for (record, how) in &report.terminated {
        println!("  killed {} ({how:?})", record.describe());
    }
    for failure in &report.failures {
        println!("  failed {}: {}", failure.record.describe(), failure.error);
    }
    for record in &report.abandoned {
        println!("  still running {}", record.describe());
    }
}

fn print_clean_report(task: CleanupTask, report: &CleanReport) {
    println!("{task}: {}", report.summary());
    let verb = if report.dry_run { "would remove" } else { "removed" };
    for entry in &report.removed {
        println!("  {verb} {}", entry.path.display());
    }
    for failure in &report.failed {
        println!("  failed {}: {}", failure.entry.path.display(), failure.error);
    }
}
