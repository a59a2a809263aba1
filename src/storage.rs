//! On-disk process registry
//!
//! One JSON object per line. Appends and rewrites hold an exclusive advisory
//! lock on a sidecar `.lock` file so that several engines on one machine can
//! share the registry. Readers take no lock: rewrites replace the file by an
//! atomic rename and a torn trailing append is simply skipped.

use crate::{
    config::REGISTRY_LOCK_SUFFIX,
    core::models::{ProcessIdentity, ProcessRecord},
    error::RegistryError,
};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Lines, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Exclusive lock held for the duration of a mutation
struct RegistryLock {
    file: File,
}

impl RegistryLock {
    fn acquire(lock_path: &Path) -> Result<Self, RegistryError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|source| RegistryError::Lock {
                path: lock_path.to_path_buf(),
                source,
            })?;
        file.lock_exclusive().map_err(|source| RegistryError::Lock {
            path: lock_path.to_path_buf(),
            source,
        })?;
        Ok(Self { file })
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Persistent, append-mostly list of processes spawned by builds.
#[derive(Debug, Clone)]
pub struct ProcessRegistry {
    path: PathBuf,
    lock_path: PathBuf,
}

impl ProcessRegistry {
    /// Open (or lazily create) the registry at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| RegistryError::io(parent, err))?;
        }
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(REGISTRY_LOCK_SUFFIX);
        Ok(Self {
            lock_path: PathBuf::from(lock_name),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record. Recording an identity that is already present is a
    /// no-op.
    pub fn record(&self, record: &ProcessRecord) -> Result<(), RegistryError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _lock = RegistryLock::acquire(&self.lock_path)?;

        let identity = record.identity();
        if self.iter_records()?.any(|existing| existing.identity() == identity) {
            debug!(%identity, "process already registered");
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)
            .map_err(|err| RegistryError::io(&self.path, err))?;
        if !ends_with_newline(&mut file).map_err(|err| RegistryError::io(&self.path, err))? {
            // A previous writer died mid-line; start on a fresh one
            line.insert(0, b'\n');
        }
        file.write_all(&line)
            .and_then(|_| file.sync_data())
            .map_err(|err| RegistryError::io(&self.path, err))?;

        debug!(%identity, owner = %record.owner_build_id, "process registered");
        Ok(())
    }

    /// Lazily read the current on-disk state.
    ///
    /// Every call re-opens the file, so a fresh call restarts the sequence.
    /// Malformed lines (including a truncated trailing record) are skipped.
    pub fn list(&self) -> Result<RecordIter, RegistryError> {
        self.iter_records()
    }

    /// Convenience wrapper collecting [`ProcessRegistry::list`].
    pub fn records(&self) -> Result<Vec<ProcessRecord>, RegistryError> {
        Ok(self.list()?.collect())
    }

    /// Remove every record for `pid`. Idempotent.
    pub fn remove(&self, pid: u32) -> Result<usize, RegistryError> {
        self.rewrite_where(|record| record.pid != pid, false)
    }

    /// Remove only the record for this exact process instance.
    pub fn remove_identity(&self, identity: &ProcessIdentity) -> Result<usize, RegistryError> {
        self.rewrite_where(|record| record.identity() != *identity, false)
    }

    /// Rewrite the file, dropping malformed lines.
    pub fn compact(&self) -> Result<usize, RegistryError> {
        self.rewrite_where(|_| true, true)
    }

    fn iter_records(&self) -> Result<RecordIter, RegistryError> {
        match File::open(&self.path) {
            Ok(file) => Ok(RecordIter {
                lines: Some(BufReader::new(file).lines()),
                path: self.path.clone(),
                line_no: 0,
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(RecordIter::empty(&self.path)),
            Err(err) => Err(RegistryError::io(&self.path, err)),
        }
    }

    /// Keep only records matching `keep`; returns how many were dropped.
    fn rewrite_where<F>(&self, keep: F, force: bool) -> Result<usize, RegistryError>
    where
        F: Fn(&ProcessRecord) -> bool,
    {
        let _lock = RegistryLock::acquire(&self.lock_path)?;

        let mut kept = Vec::new();
        let mut removed = 0;
        for record in self.iter_records()? {
            if keep(&record) {
                kept.push(record);
            } else {
                removed += 1;
            }
        }
        if removed == 0 && !force {
            return Ok(0);
        }

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp =
            tempfile::NamedTempFile::new_in(dir).map_err(|err| RegistryError::io(dir, err))?;
        for record in &kept {
            serde_json::to_writer(&mut tmp, record)?;
            tmp.write_all(b"\n")
                .map_err(|err| RegistryError::io(tmp.path(), err))?;
        }
        tmp.as_file()
            .sync_data()
            .map_err(|err| RegistryError::io(tmp.path(), err))?;
        tmp.persist(&self.path)
            .map_err(|err| RegistryError::io(&self.path, err.error))?;

        debug!(removed, remaining = kept.len(), "registry rewritten");
        Ok(removed)
    }
}

fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Lazy iterator over the records of one registry snapshot.
pub struct RecordIter {
    lines: Option<Lines<BufReader<File>>>,
    path: PathBuf,
    line_no: usize,
}

impl RecordIter {
    fn empty(path: &Path) -> Self {
        Self {
            lines: None,
            path: path.to_path_buf(),
            line_no: 0,
        }
    }
}

impl Iterator for RecordIter {
    type Item = ProcessRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.as_mut()?.next()? {
                Ok(line) => line,
                Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                    self.line_no += 1;
                    warn!(path = %self.path.display(), line = self.line_no, "skipping non-UTF-8 registry line");
                    continue;
                }
                Err(err) => {
                    warn!(path = %self.path.display(), "registry read aborted: {err}");
                    self.lines = None;
                    return None;
                }
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ProcessRecord>(&line) {
                Ok(record) => return Some(record),
                Err(err) => {
                    warn!(path = %self.path.display(), line = self.line_no, "skipping malformed registry record: {err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::StartTime;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn rec(pid: u32, start: u64, owner: &str) -> ProcessRecord {
        ProcessRecord::new(pid, StartTime::from_millis(start), owner, "/gradle-home")
    }

    fn registry(dir: &TempDir) -> ProcessRegistry {
        ProcessRegistry::open(dir.path().join("nested").join("registry.jsonl")).unwrap()
    }

    #[test]
    fn missing_file_lists_nothing() {
        let dir = TempDir::new().unwrap();
        assert!(registry(&dir).records().unwrap().is_empty());
    }

    #[test]
    fn record_then_list_preserves_order() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry.record(&rec(300, 3, "b")).unwrap();
        registry.record(&rec(100, 1, "a")).unwrap();

        let pids: Vec<u32> = registry.list().unwrap().map(|r| r.pid).collect();
        assert_eq!(pids, vec![300, 100]);
    }

    #[test]
    fn duplicate_identity_is_recorded_once() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry.record(&rec(100, 1, "a")).unwrap();
        registry.record(&rec(100, 1, "a")).unwrap();
        registry.record(&rec(100, 2, "a")).unwrap();
        assert_eq!(registry.records().unwrap().len(), 2);
    }

    #[test]
    fn list_is_restartable() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry.record(&rec(1, 1, "a")).unwrap();
        let first: Vec<_> = registry.list().unwrap().collect();
        let second: Vec<_> = registry.list().unwrap().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry.record(&rec(100, 1, "a")).unwrap();
        registry.record(&rec(200, 2, "a")).unwrap();

        assert_eq!(registry.remove(100).unwrap(), 1);
        assert_eq!(registry.remove(100).unwrap(), 0);
        assert_eq!(registry.remove(999).unwrap(), 0);
        let pids: Vec<u32> = registry.list().unwrap().map(|r| r.pid).collect();
        assert_eq!(pids, vec![200]);
    }

    #[test]
    fn remove_identity_leaves_reused_pid_alone() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry.record(&rec(100, 1, "a")).unwrap();
        registry.record(&rec(100, 2, "b")).unwrap();

        registry
            .remove_identity(&ProcessIdentity::new(100, StartTime::from_millis(1)))
            .unwrap();
        let remaining = registry.records().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].owner_build_id, "b");
    }

    #[test]
    fn truncated_tail_is_skipped_and_later_appends_survive() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry.record(&rec(100, 1, "a")).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(registry.path()).unwrap();
            file.write_all(br#"{"pid":200,"start_ti"#).unwrap();
        }
        assert_eq!(registry.records().unwrap().len(), 1);

        registry.record(&rec(300, 3, "a")).unwrap();
        let pids: Vec<u32> = registry.list().unwrap().map(|r| r.pid).collect();
        assert_eq!(pids, vec![100, 300]);

        assert_eq!(registry.compact().unwrap(), 0);
        let content = fs::read_to_string(registry.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn concurrent_writers_lose_nothing() {
        const WRITERS: u32 = 4;
        const PER_WRITER: u32 = 25;

        let dir = TempDir::new().unwrap();
        let path = Arc::new(dir.path().join("registry.jsonl"));

        let handles: Vec<_> = (0..WRITERS)
            .map(|writer| {
                let path = Arc::clone(&path);
                thread::spawn(move || {
                    // Separate handle per writer, like separate engine processes
                    let registry = ProcessRegistry::open(path.as_path()).unwrap();
                    for i in 0..PER_WRITER {
                        let pid = writer * 1000 + i;
                        registry.record(&rec(pid, pid as u64, "concurrent")).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let registry = ProcessRegistry::open(path.as_path()).unwrap();
        assert_eq!(registry.records().unwrap().len(), (WRITERS * PER_WRITER) as usize);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Record(u32, u64),
        Remove(u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u32..6, 1u64..3).prop_map(|(pid, start)| Op::Record(pid, start)),
            (1u32..6).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn list_reflects_net_operations(ops in prop::collection::vec(op(), 0..20)) {
            let dir = TempDir::new().unwrap();
            let registry = registry(&dir);
            let mut model: Vec<(u32, u64)> = Vec::new();

            for op in ops {
                match op {
                    Op::Record(pid, start) => {
                        registry.record(&rec(pid, start, "prop")).unwrap();
                        if !model.contains(&(pid, start)) {
                            model.push((pid, start));
                        }
                    }
                    Op::Remove(pid) => {
                        registry.remove(pid).unwrap();
                        model.retain(|(p, _)| *p != pid);
                    }
                }
            }

            let listed: Vec<(u32, u64)> = registry
                .list()
                .unwrap()
                .map(|r| (r.pid, r.start_time.as_millis()))
                .collect();
            prop_assert_eq!(listed, model);
        }
    }
}
