//! Named cleanup tasks exposed to the build
//!
//! Each task runs at most once per [`TaskContext`]; `clean` pulls in the
//! leak kill before anything else.

use crate::{
    cache_cleaner::CleanReport,
    config::CleanupConfig,
    error::{CleanupError, CleanupResult},
    lifecycle,
    reaper::{CancellationFlag, KillReport},
    tracker::DaemonTracker,
};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CleanupTask {
    KillExistingProcesses,
    CleanUpDaemons,
    CleanUpCaches,
    Clean,
}

impl CleanupTask {
    pub const ALL: [CleanupTask; 4] = [
        CleanupTask::KillExistingProcesses,
        CleanupTask::CleanUpDaemons,
        CleanupTask::CleanUpCaches,
        CleanupTask::Clean,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CleanupTask::KillExistingProcesses => "killExistingProcessesStartedByGradle",
            CleanupTask::CleanUpDaemons => "cleanUpDaemons",
            CleanupTask::CleanUpCaches => "cleanUpCaches",
            CleanupTask::Clean => "clean",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|task| task.name() == name)
    }

    pub fn dependencies(&self) -> &'static [CleanupTask] {
        match self {
            CleanupTask::Clean => &[
                CleanupTask::KillExistingProcesses,
                CleanupTask::CleanUpDaemons,
                CleanupTask::CleanUpCaches,
            ],
            _ => &[],
        }
    }
}

impl fmt::Display for CleanupTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug)]
pub enum TaskOutcome {
    Killed(KillReport),
    Cleaned(CleanReport),
    /// Cache cleanup without a configured version
    Skipped(String),
    /// Aggregate task with no work of its own
    Done,
}

pub struct TaskContext {
    pub config: CleanupConfig,
    pub tracker: Arc<DaemonTracker>,
    pub cancel: CancellationFlag,
    pub dry_run: bool,
    executed: HashSet<CleanupTask>,
}

impl TaskContext {
    pub fn new(config: CleanupConfig, tracker: Arc<DaemonTracker>) -> Self {
        Self {
            config,
            tracker,
            cancel: CancellationFlag::new(),
            dry_run: false,
            executed: HashSet::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn has_run(&self, task: CleanupTask) -> bool {
        self.executed.contains(&task)
    }

    /// Run `task` after its dependencies. Tasks already executed in this
    /// context are skipped.
    pub fn execute(&mut self, task: CleanupTask) -> CleanupResult<Vec<(CleanupTask, TaskOutcome)>> {
        let mut outcomes = Vec::new();
        self.execute_into(task, &mut outcomes)?;
        Ok(outcomes)
    }

    fn execute_into(
        &mut self,
        task: CleanupTask,
        outcomes: &mut Vec<(CleanupTask, TaskOutcome)>,
    ) -> CleanupResult<()> {
        if self.executed.contains(&task) {
            debug!(task = task.name(), "task already executed");
            return Ok(());
        }
        for dependency in task.dependencies() {
            self.execute_into(*dependency, outcomes)?;
        }

        info!(task = task.name(), "running task");
        let outcome = match task {
            CleanupTask::KillExistingProcesses => TaskOutcome::Killed(lifecycle::kill_leaked(
                &self.tracker,
                &self.config,
                self.cancel.clone(),
            )?),
            CleanupTask::CleanUpDaemons => TaskOutcome::Killed(lifecycle::clean_up_daemons(
                &self.tracker,
                &self.config,
                self.cancel.clone(),
            )?),
            CleanupTask::CleanUpCaches => match lifecycle::clean_up_caches(&self.config, self.dry_run) {
                Ok(report) => TaskOutcome::Cleaned(report),
                Err(CleanupError::Config(message)) if self.config.version.is_none() => {
                    TaskOutcome::Skipped(message)
                }
                Err(err) => return Err(err),
            },
            CleanupTask::Clean => TaskOutcome::Done,
        };
        self.executed.insert(task);
        outcomes.push((task, outcome));
        Ok(())
    }
}
