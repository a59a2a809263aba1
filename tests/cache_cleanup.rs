//! Cache scan and clean over a real directory tree

use build_reaper::cache_cleaner::{scan, CacheCleaner, RetentionPolicy};
use build_reaper::config::CACHES_DIR_NAME;
use build_reaper::Version;
use pretty_assertions::assert_eq;
use std::fs;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[test]
fn scan_then_clean_keeps_current_and_fresh_versions() {
    let home = TempDir::new().unwrap();
    for version in ["4.10.3", "5.0", "6.0", "modules-2"] {
        let dir = home.path().join(CACHES_DIR_NAME).join(version);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("entry.bin"), [1u8; 64]).unwrap();
    }

    let entries = scan(home.path()).unwrap();
    let versions: Vec<&str> = entries.iter().map(|e| e.version.as_str()).collect();
    assert_eq!(versions, vec!["4.10.3", "5.0", "6.0"]);

    // Everything was just written; pretend a long time has passed.
    let later = SystemTime::now() + 60 * DAY;
    let current: Version = "6.0".parse().unwrap();
    let report = CacheCleaner::new().clean_at(entries, &current, RetentionPolicy::days(30), later);

    assert_eq!(report.removed.len(), 2);
    assert_eq!(report.kept.len(), 1);
    assert_eq!(report.bytes_freed, 128);
    assert!(home.path().join(CACHES_DIR_NAME).join("6.0").exists());
    assert!(!home.path().join(CACHES_DIR_NAME).join("5.0").exists());
    assert!(home.path().join(CACHES_DIR_NAME).join("modules-2").exists());
}

#[test]
fn fresh_caches_survive_a_real_clean() {
    let home = TempDir::new().unwrap();
    fs::create_dir_all(home.path().join(CACHES_DIR_NAME).join("5.0")).unwrap();

    let report = CacheCleaner::new().clean(
        scan(home.path()).unwrap(),
        &"6.0".parse().unwrap(),
        RetentionPolicy::days(30),
    );
    assert!(report.removed.is_empty());
    assert!(home.path().join(CACHES_DIR_NAME).join("5.0").exists());
}
