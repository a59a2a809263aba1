//! Build lifecycle around the cleanup service
//!
//! `Init -> AcquireTracker -> PreBuildLeakKill -> BuildRun -> PostBuildClean
//! -> Terminal`, strictly one step at a time.

use crate::{
    cache_cleaner::{self, CacheCleaner, CleanReport, RetentionPolicy},
    config::CleanupConfig,
    core::version::Version,
    error::{CleanupError, CleanupResult},
    platform::ProcessTable,
    reaper::{CancellationFlag, KillOptions, KillReport, LeakDetector, ProcessKiller},
    tracker::{DaemonTracker, SharedServices, DAEMON_TRACKER_SERVICE},
};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Init,
    AcquireTracker,
    PreBuildLeakKill,
    BuildRun,
    PostBuildClean,
    Terminal,
}

impl Phase {
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Init => Some(Phase::AcquireTracker),
            Phase::AcquireTracker => Some(Phase::PreBuildLeakKill),
            Phase::PreBuildLeakKill => Some(Phase::BuildRun),
            Phase::BuildRun => Some(Phase::PostBuildClean),
            Phase::PostBuildClean => Some(Phase::Terminal),
            Phase::Terminal => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct PostBuildReport {
    pub daemons: KillReport,
    /// None when no engine version is configured
    pub caches: Option<CleanReport>,
}

/// Get the session tracker, creating it on first use.
pub fn shared_tracker(
    services: &SharedServices,
    config: &CleanupConfig,
    table: Arc<dyn ProcessTable>,
) -> CleanupResult<Arc<DaemonTracker>> {
    services.register_if_absent(DAEMON_TRACKER_SERVICE, || {
        DaemonTracker::from_config(config, table)
    })
}

/// Kill leaked processes (and, when enabled, untracked ones).
pub fn kill_leaked(
    tracker: &Arc<DaemonTracker>,
    config: &CleanupConfig,
    cancel: CancellationFlag,
) -> CleanupResult<KillReport> {
    let detector = LeakDetector::new(Arc::clone(tracker));
    let mut leaked = detector.find_leaked()?;
    if config.kill_untracked {
        let markers = [config.root_project_dir.clone(), config.home_dir.clone()];
        leaked.extend(detector.find_untracked(&markers)?);
    }
    let killer = ProcessKiller::new(
        Arc::clone(tracker.process_table()),
        KillOptions::from_config(config, cancel),
    );
    let registry = tracker.acquire()?;
    let report = killer.kill(&registry, leaked);
    info!("leak kill: {}", report.summary());
    Ok(report)
}

pub fn clean_up_daemons(
    tracker: &DaemonTracker,
    config: &CleanupConfig,
    cancel: CancellationFlag,
) -> CleanupResult<KillReport> {
    let killer = ProcessKiller::new(
        Arc::clone(tracker.process_table()),
        KillOptions::from_config(config, cancel),
    );
    let report = tracker.clean_up_daemons(&killer)?;
    info!("daemon cleanup: {}", report.summary());
    Ok(report)
}

pub fn clean_up_caches(config: &CleanupConfig, dry_run: bool) -> CleanupResult<CleanReport> {
    let version: Version = config
        .version
        .as_deref()
        .ok_or_else(|| CleanupError::Config("cache cleanup needs the engine version".to_string()))?
        .parse()
        .map_err(|err| CleanupError::Config(format!("{err}")))?;
    let entries = cache_cleaner::scan(&config.home_dir)?;
    let report = CacheCleaner::new().dry_run(dry_run).clean(
        entries,
        &version,
        RetentionPolicy::days(config.retention_days),
    );
    info!("cache cleanup: {}", report.summary());
    Ok(report)
}

/// Drives one build through the cleanup lifecycle.
pub struct BuildLifecycle {
    phase: Phase,
    config: CleanupConfig,
    services: Arc<SharedServices>,
    table: Arc<dyn ProcessTable>,
    tracker: Option<Arc<DaemonTracker>>,
    cancel: CancellationFlag,
}

impl BuildLifecycle {
    pub fn new(
        config: CleanupConfig,
        services: Arc<SharedServices>,
        table: Arc<dyn ProcessTable>,
    ) -> Self {
        Self {
            phase: Phase::Init,
            config,
            services,
            table,
            tracker: None,
            cancel: CancellationFlag::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn tracker(&self) -> Option<&Arc<DaemonTracker>> {
        self.tracker.as_ref()
    }

    fn advance(&mut self, to: Phase) -> CleanupResult<()> {
        if self.phase.next() != Some(to) {
            return Err(CleanupError::Lifecycle {
                from: self.phase,
                to,
            });
        }
        info!(from = ?self.phase, ?to, "lifecycle transition");
        self.phase = to;
        Ok(())
    }

    fn require_tracker(&self) -> CleanupResult<Arc<DaemonTracker>> {
        self.tracker.clone().ok_or(CleanupError::Lifecycle {
            from: self.phase,
            to: Phase::AcquireTracker,
        })
    }

    pub fn acquire_tracker(&mut self) -> CleanupResult<Arc<DaemonTracker>> {
        self.advance(Phase::AcquireTracker)?;
        let tracker = shared_tracker(&self.services, &self.config, Arc::clone(&self.table))?;
        self.tracker = Some(Arc::clone(&tracker));
        Ok(tracker)
    }

    /// Blocking leak kill; must finish before the build may run.
    pub fn pre_build(&mut self) -> CleanupResult<KillReport> {
        self.advance(Phase::PreBuildLeakKill)?;
        let tracker = self.require_tracker()?;
        let report = kill_leaked(&tracker, &self.config, self.cancel.clone())?;
        if !report.abandoned.is_empty() {
            warn!(count = report.abandoned.len(), "leaked processes still running before build");
        }
        Ok(report)
    }

    pub fn run_build<T>(&mut self, build: impl FnOnce(&DaemonTracker) -> T) -> CleanupResult<T> {
        self.advance(Phase::BuildRun)?;
        let tracker = self.require_tracker()?;
        Ok(build(&tracker))
    }

    /// Daemon and cache cleanup. Cache cleanup is skipped without a
    /// configured version; its failures are logged, not returned.
    pub fn post_build(&mut self, dry_run: bool) -> CleanupResult<PostBuildReport> {
        self.advance(Phase::PostBuildClean)?;
        let tracker = self.require_tracker()?;
        let daemons = clean_up_daemons(&tracker, &self.config, self.cancel.clone())?;
        let caches = if self.config.version.is_some() {
            match clean_up_caches(&self.config, dry_run) {
                Ok(report) => Some(report),
                Err(err) if !err.is_fatal() => {
                    warn!("cache cleanup skipped: {err}");
                    None
                }
                Err(err) => return Err(err),
            }
        } else {
            warn!("no engine version configured; skipping cache cleanup");
            None
        };
        Ok(PostBuildReport { daemons, caches })
    }

    pub fn finish(&mut self) -> CleanupResult<()> {
        self.advance(Phase::Terminal)
    }
}
