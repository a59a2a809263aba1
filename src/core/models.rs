//! Core data model
//!
//! Process identity, registry records and cache entries shared by the
//! tracker, the reaper and the cache cleaner.

use crate::core::version::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// Process start time in milliseconds since the Unix epoch, as reported by
/// the OS. Together with the pid it identifies one process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StartTime(u64);

impl StartTime {
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn from_epoch_offset(offset: Duration) -> Self {
        Self(offset.as_millis() as u64)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StartTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match DateTime::<Utc>::from_timestamp_millis(self.0 as i64) {
            Some(at) => write!(f, "{}", at.format("%Y-%m-%d %H:%M:%S%.3f UTC")),
            None => write!(f, "{}ms", self.0),
        }
    }
}

/// A pid is only meaningful together with the start time of the process
/// that held it; pids are recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub start_time: StartTime,
}

impl ProcessIdentity {
    pub fn new(pid: u32, start_time: StartTime) -> Self {
        Self { pid, start_time }
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {} (started {})", self.pid, self.start_time)
    }
}

/// One line of the on-disk registry: a process spawned by a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub start_time: StartTime,
    /// Opaque token naming the build session that spawned the process
    pub owner_build_id: String,
    pub home_dir: PathBuf,
    /// Engine process that recorded the entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<ProcessIdentity>,
    #[serde(default = "default_now")]
    pub recorded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl ProcessRecord {
    pub fn new(
        pid: u32,
        start_time: StartTime,
        owner_build_id: impl Into<String>,
        home_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pid,
            start_time,
            owner_build_id: owner_build_id.into(),
            home_dir: home_dir.into(),
            owner: None,
            recorded_at: Utc::now(),
            command: None,
        }
    }

    pub fn with_owner(mut self, owner: ProcessIdentity) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn identity(&self) -> ProcessIdentity {
        ProcessIdentity::new(self.pid, self.start_time)
    }

    pub fn describe(&self) -> String {
        match &self.command {
            Some(command) => format!("{} [{}] {}", self.identity(), self.owner_build_id, command),
            None => format!("{} [{}]", self.identity(), self.owner_build_id),
        }
    }
}

fn default_now() -> DateTime<Utc> {
    Utc::now()
}

/// Snapshot of a process currently present in the OS process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveProcess {
    pub pid: u32,
    pub start_time: StartTime,
    pub parent: Option<u32>,
    pub command_line: Option<String>,
}

impl LiveProcess {
    pub fn identity(&self) -> ProcessIdentity {
        ProcessIdentity::new(self.pid, self.start_time)
    }
}

/// A version-named directory under `<home>/caches`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub version: Version,
    pub last_access: SystemTime,
}

impl CacheEntry {
    /// Age relative to `now`; entries touched in the future count as fresh.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_access).unwrap_or(Duration::ZERO)
    }
}
