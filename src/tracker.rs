//! Daemon tracking service
//!
//! One [`DaemonTracker`] lives for a whole engine session and is shared by
//! every build invocation in it through [`SharedServices`].

use crate::{
    config::CleanupConfig,
    core::models::{ProcessIdentity, ProcessRecord, StartTime},
    error::{CleanupError, CleanupResult, RegistryError},
    platform::ProcessTable,
    reaper::{KillReport, LeakStatus, LeakedProcess, ProcessKiller},
    storage::ProcessRegistry,
};
use dashmap::{mapref::entry::Entry, DashMap};
use once_cell::sync::OnceCell;
use std::any::Any;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Name under which the tracker is registered in [`SharedServices`]
pub const DAEMON_TRACKER_SERVICE: &str = "daemonTracker";

/// Engine-session service container (`registerIfAbsent` semantics).
#[derive(Default)]
pub struct SharedServices {
    services: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl SharedServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the service registered under `name`, constructing it with
    /// `factory` on first use. The factory runs at most once per name even
    /// with concurrent callers.
    pub fn register_if_absent<T, F>(&self, name: &str, factory: F) -> CleanupResult<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> CleanupResult<T>,
    {
        match self.services.entry(name.to_string()) {
            Entry::Occupied(existing) => Arc::clone(existing.get())
                .downcast::<T>()
                .map_err(|_| {
                    CleanupError::Config(format!(
                        "shared service {name} is registered with a different type"
                    ))
                }),
            Entry::Vacant(slot) => {
                let service = Arc::new(factory()?);
                slot.insert(Arc::clone(&service) as Arc<dyn Any + Send + Sync>);
                debug!(service = name, "shared service registered");
                Ok(service)
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }
}

/// Immutable parameters captured when the tracker is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerParams {
    pub gradle_home_dir: PathBuf,
    pub root_project_dir: PathBuf,
    pub home_dir: PathBuf,
    pub registry_path: PathBuf,
}

impl From<&CleanupConfig> for TrackerParams {
    fn from(config: &CleanupConfig) -> Self {
        Self {
            gradle_home_dir: config.gradle_home_dir.clone(),
            root_project_dir: config.root_project_dir.clone(),
            home_dir: config.home_dir.clone(),
            registry_path: config.registry_path(),
        }
    }
}

pub struct DaemonTracker {
    params: TrackerParams,
    build_id: String,
    owner: Option<ProcessIdentity>,
    table: Arc<dyn ProcessTable>,
    registry: OnceCell<Arc<ProcessRegistry>>,
}

impl std::fmt::Debug for DaemonTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonTracker")
            .field("params", &self.params)
            .field("build_id", &self.build_id)
            .field("owner", &self.owner)
            .finish()
    }
}

impl DaemonTracker {
    /// Create a tracker for a new engine session.
    ///
    /// Fails with [`CleanupError::HomeDirectory`] when the gradle home cannot
    /// hold the registry.
    pub fn new(params: TrackerParams, table: Arc<dyn ProcessTable>) -> CleanupResult<Self> {
        ensure_writable_dir(&params.gradle_home_dir)?;
        let owner = table.current();
        let build_id = uuid::Uuid::new_v4().to_string();
        info!(build_id = %build_id, home = %params.gradle_home_dir.display(), "daemon tracker created");
        Ok(Self {
            params,
            build_id,
            owner,
            table,
            registry: OnceCell::new(),
        })
    }

    /// Tracker for the configured session; a configured build id joins a
    /// session shared by several invocations.
    pub fn from_config(config: &CleanupConfig, table: Arc<dyn ProcessTable>) -> CleanupResult<Self> {
        let tracker = Self::new(TrackerParams::from(config), table)?;
        Ok(match config.build_id.as_deref() {
            Some(build_id) => tracker.join_session(build_id),
            None => tracker,
        })
    }

    /// Adopt an external session token. Each invocation of a shared session
    /// is short-lived, so the invoking process (our parent) is recorded as
    /// the session owner instead of this one.
    fn join_session(mut self, build_id: &str) -> Self {
        let invoker = self
            .owner
            .and_then(|me| self.table.lookup(me.pid))
            .and_then(|me| me.parent)
            .and_then(|parent| self.table.lookup(parent))
            .map(|parent| parent.identity());
        if invoker.is_some() {
            self.owner = invoker;
        }
        self.build_id = build_id.to_string();
        debug!(build_id, owner = ?self.owner, "joined existing build session");
        self
    }

    /// Use a caller-supplied session token instead of a random one.
    pub fn with_build_id(mut self, build_id: impl Into<String>) -> Self {
        self.build_id = build_id.into();
        self
    }

    /// Shared registry handle, opened on first access.
    pub fn acquire(&self) -> Result<Arc<ProcessRegistry>, RegistryError> {
        self.registry
            .get_or_try_init(|| ProcessRegistry::open(&self.params.registry_path).map(Arc::new))
            .map(Arc::clone)
    }

    pub fn root_project_dir(&self) -> &Path {
        &self.params.root_project_dir
    }

    pub fn home_dir(&self) -> &Path {
        &self.params.home_dir
    }

    pub fn gradle_home_dir(&self) -> &Path {
        &self.params.gradle_home_dir
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    /// Identity of the engine process that owns this session
    pub fn owner(&self) -> Option<ProcessIdentity> {
        self.owner
    }

    pub fn process_table(&self) -> &Arc<dyn ProcessTable> {
        &self.table
    }

    /// Register a spawned process with a known start time.
    pub fn record(
        &self,
        pid: u32,
        start_time: StartTime,
        owner_build_id: &str,
    ) -> CleanupResult<ProcessRecord> {
        let mut record = ProcessRecord::new(pid, start_time, owner_build_id, &self.params.home_dir);
        if owner_build_id == self.build_id {
            if let Some(owner) = self.owner {
                record = record.with_owner(owner);
            }
        }
        self.acquire()?.record(&record)?;
        Ok(record)
    }

    /// Register a process spawned by this session, reading its start time
    /// from the process table.
    pub fn track(&self, pid: u32, command: Option<&str>) -> CleanupResult<ProcessRecord> {
        let live = self.table.lookup(pid).ok_or_else(|| CleanupError::ProcessControl {
            pid,
            message: "process is not running".to_string(),
        })?;
        let mut record = ProcessRecord::new(pid, live.start_time, &self.build_id, &self.params.home_dir);
        if let Some(owner) = self.owner {
            record = record.with_owner(owner);
        }
        if let Some(command) = command.map(str::to_string).or(live.command_line) {
            record = record.with_command(command);
        }
        self.acquire()?.record(&record)?;
        Ok(record)
    }

    pub fn records(&self) -> CleanupResult<Vec<ProcessRecord>> {
        Ok(self.acquire()?.records()?)
    }

    /// Records spawned by this session
    pub fn tracked(&self) -> CleanupResult<Vec<ProcessRecord>> {
        Ok(self
            .acquire()?
            .list()?
            .filter(|record| record.owner_build_id == self.build_id)
            .collect())
    }

    pub fn forget(&self, identity: &ProcessIdentity) -> CleanupResult<()> {
        self.acquire()?.remove_identity(identity)?;
        Ok(())
    }

    /// Terminate every process this session still tracks and drop its
    /// records.
    pub fn clean_up_daemons(&self, killer: &ProcessKiller) -> CleanupResult<KillReport> {
        let registry = self.acquire()?;
        let targets: Vec<LeakedProcess> = self
            .tracked()?
            .into_iter()
            .map(|record| {
                let status = LeakStatus::classify(self.table.as_ref(), &record);
                LeakedProcess::tracked(record, status)
            })
            .collect();
        info!(count = targets.len(), build_id = %self.build_id, "cleaning up session daemons");
        Ok(killer.kill(&registry, targets))
    }
}

/// Create `dir` if needed and prove it is writable.
fn ensure_writable_dir(dir: &Path) -> CleanupResult<()> {
    let unusable = |message: String| CleanupError::HomeDirectory {
        path: dir.to_path_buf(),
        message,
    };
    fs::create_dir_all(dir).map_err(|err| unusable(format!("cannot create directory: {err}")))?;
    if !dir.is_dir() {
        return Err(unusable("not a directory".to_string()));
    }
    tempfile::tempfile_in(dir).map_err(|err| unusable(format!("not writable: {err}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::SystemProcessTable;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use tempfile::TempDir;

    fn params(dir: &TempDir) -> TrackerParams {
        let mut config = CleanupConfig::for_project(dir.path().join("project"));
        config.gradle_home_dir = dir.path().join("gradle-home");
        TrackerParams::from(&config)
    }

    fn table() -> Arc<dyn ProcessTable> {
        Arc::new(SystemProcessTable::new())
    }

    #[test]
    fn acquire_returns_the_same_handle() {
        let dir = TempDir::new().unwrap();
        let tracker = DaemonTracker::new(params(&dir), table()).unwrap();
        let a = tracker.acquire().unwrap();
        let b = tracker.acquire().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn concurrent_first_acquire_yields_one_instance() {
        let dir = TempDir::new().unwrap();
        let tracker = Arc::new(DaemonTracker::new(params(&dir), table()).unwrap());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    tracker.acquire().unwrap()
                })
            })
            .collect();
        let handles: Vec<Arc<ProcessRegistry>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn register_if_absent_constructs_once() {
        let services = Arc::new(SharedServices::new());
        let constructed = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let services = Arc::clone(&services);
                let constructed = Arc::clone(&constructed);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    services
                        .register_if_absent("counter", || {
                            constructed.fetch_add(1, Ordering::SeqCst);
                            Ok(String::from("service"))
                        })
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().as_str(), "service");
        }
        assert_eq!(constructed.load(Ordering::SeqCst), 1);
        assert!(services.contains("counter"));
    }

    #[test]
    fn register_if_absent_rejects_type_mismatch() {
        let services = SharedServices::new();
        services.register_if_absent("svc", || Ok(1u32)).unwrap();
        let err = services.register_if_absent("svc", || Ok(String::new())).unwrap_err();
        assert!(matches!(err, CleanupError::Config(_)));
    }

    #[test]
    fn parameters_are_captured_at_construction() {
        let dir = TempDir::new().unwrap();
        let params = params(&dir);
        let tracker = DaemonTracker::new(params.clone(), table()).unwrap();
        assert_eq!(tracker.root_project_dir(), params.root_project_dir);
        assert_eq!(tracker.home_dir(), params.home_dir);
        assert!(tracker.gradle_home_dir().is_dir());
        assert!(tracker.owner().is_some());
    }

    #[test]
    fn unusable_gradle_home_is_fatal() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"not a dir").unwrap();

        let mut params = params(&dir);
        params.gradle_home_dir = blocker.join("gradle-home");
        let err = DaemonTracker::new(params, table()).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, CleanupError::HomeDirectory { .. }));
    }

    #[test]
    fn configured_build_id_joins_the_invoking_session() {
        let dir = TempDir::new().unwrap();
        let mut config = CleanupConfig::for_project(dir.path().join("project"));
        config.gradle_home_dir = dir.path().join("gradle-home");
        config.build_id = Some("ci-build-7".to_string());

        let table = table();
        let tracker = DaemonTracker::from_config(&config, Arc::clone(&table)).unwrap();
        assert_eq!(tracker.build_id(), "ci-build-7");
        let me = table.lookup(std::process::id()).unwrap();
        if let Some(parent) = me.parent.and_then(|pid| table.lookup(pid)) {
            assert_eq!(tracker.owner(), Some(parent.identity()));
        }

        // A second invocation with the same token sees the same records
        tracker.track(std::process::id(), None).unwrap();
        let again = DaemonTracker::from_config(&config, table).unwrap();
        assert_eq!(again.tracked().unwrap().len(), 1);
    }

    #[test]
    fn track_records_current_session_ownership() {
        let dir = TempDir::new().unwrap();
        let tracker = DaemonTracker::new(params(&dir), table())
            .unwrap()
            .with_build_id("session-1");

        let record = tracker.track(std::process::id(), Some("test runner")).unwrap();
        assert_eq!(record.owner_build_id, "session-1");
        assert_eq!(record.owner, tracker.owner());

        tracker
            .record(4_000_000, StartTime::from_millis(1), "other-session")
            .unwrap();
        let tracked = tracker.tracked().unwrap();
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].command.as_deref(), Some("test runner"));
        assert_eq!(tracker.records().unwrap().len(), 2);

        tracker.forget(&record.identity()).unwrap();
        assert!(tracker.tracked().unwrap().is_empty());
    }
}
