//! Stale version cache cleanup
//!
//! Removes `<home>/caches/<version>` directories left behind by other engine
//! versions once they have not been touched for the retention period.

use crate::{
    config::{self, CACHES_DIR_NAME},
    core::models::CacheEntry,
    core::version::Version,
    error::{CleanupError, CleanupResult},
};
use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Duration,
}

impl RetentionPolicy {
    pub fn days(days: u64) -> Self {
        Self {
            max_age: config::days(days),
        }
    }

    pub fn is_expired(&self, entry: &CacheEntry, now: SystemTime) -> bool {
        entry.age(now) > self.max_age
    }
}

#[derive(Debug)]
pub struct CleanFailure {
    pub entry: CacheEntry,
    pub error: CleanupError,
}

#[derive(Debug, Default)]
pub struct CleanReport {
    pub removed: Vec<CacheEntry>,
    pub kept: Vec<CacheEntry>,
    pub failed: Vec<CleanFailure>,
    pub bytes_freed: u64,
    pub dry_run: bool,
}

impl CleanReport {
    pub fn summary(&self) -> String {
        let verb = if self.dry_run { "would remove" } else { "removed" };
        format!(
            "{} {} cache(s) ({} bytes), kept {}, {} failed",
            verb,
            self.removed.len(),
            self.bytes_freed,
            self.kept.len(),
            self.failed.len()
        )
    }
}

/// List version-named cache directories under `<home_dir>/caches`, oldest
/// version first. A missing caches directory yields nothing.
pub fn scan(home_dir: &Path) -> CleanupResult<Vec<CacheEntry>> {
    let caches = home_dir.join(CACHES_DIR_NAME);
    if !caches.is_dir() {
        debug!(path = %caches.display(), "no caches directory");
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for dir in WalkDir::new(&caches).min_depth(1).max_depth(1) {
        let dir = match dir {
            Ok(dir) => dir,
            Err(err) => {
                warn!(path = %caches.display(), "skipping unreadable cache entry: {err}");
                continue;
            }
        };
        if !dir.file_type().is_dir() {
            continue;
        }
        let Some(version) = dir
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<Version>().ok())
        else {
            continue;
        };
        match last_access(dir.path()) {
            Ok(last_access) => entries.push(CacheEntry {
                path: dir.path().to_path_buf(),
                version,
                last_access,
            }),
            Err(err) => warn!(path = %dir.path().display(), "cannot read cache timestamps: {err}"),
        }
    }

    entries.sort_by(|a, b| a.version.cmp(&b.version));
    Ok(entries)
}

/// Most recent modification of the directory and its direct children
fn last_access(dir: &Path) -> io::Result<SystemTime> {
    let mut latest = fs::metadata(dir)?.modified()?;
    for child in WalkDir::new(dir).min_depth(1).max_depth(1).into_iter().flatten() {
        if let Ok(modified) = child.metadata().map_err(io::Error::from).and_then(|m| m.modified()) {
            latest = latest.max(modified);
        }
    }
    Ok(latest)
}

fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .flatten()
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheCleaner {
    dry_run: bool,
}

impl CacheCleaner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Delete entries of other versions that outlived `retention`.
    pub fn clean(
        &self,
        entries: Vec<CacheEntry>,
        current_version: &Version,
        retention: RetentionPolicy,
    ) -> CleanReport {
        self.clean_at(entries, current_version, retention, SystemTime::now())
    }

    pub fn clean_at(
        &self,
        entries: Vec<CacheEntry>,
        current_version: &Version,
        retention: RetentionPolicy,
        now: SystemTime,
    ) -> CleanReport {
        let mut report = CleanReport {
            dry_run: self.dry_run,
            ..Default::default()
        };

        for entry in entries {
            if entry.version == *current_version || !retention.is_expired(&entry, now) {
                report.kept.push(entry);
                continue;
            }

            let size = dir_size(&entry.path);
            if self.dry_run {
                info!(path = %entry.path.display(), size, "would remove stale cache");
                report.bytes_freed += size;
                report.removed.push(entry);
                continue;
            }

            match fs::remove_dir_all(&entry.path) {
                Ok(()) => {
                    info!(path = %entry.path.display(), version = %entry.version, size, "removed stale cache");
                    report.bytes_freed += size;
                    report.removed.push(entry);
                }
                Err(source) => {
                    let error = CleanupError::StaleCacheAccess {
                        path: entry.path.clone(),
                        source,
                    };
                    warn!("{error}");
                    report.failed.push(CleanFailure { entry, error });
                }
            }
        }

        report
    }
}
