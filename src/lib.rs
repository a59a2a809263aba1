//! build-reaper
//!
//! Cleanup service for a build engine: records the daemons a build spawns,
//! kills the ones leaked by dead sessions, and prunes caches left behind by
//! other engine versions.

pub mod cache_cleaner;
pub mod commands;
pub mod config;
pub mod core;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod platform;
pub mod reaper;
pub mod storage;
pub mod tasks;
pub mod tracker;

// Re-export commonly used types for convenience
pub use cache_cleaner::{CacheCleaner, CleanReport, RetentionPolicy};
pub use config::CleanupConfig;
pub use core::models::*;
pub use core::version::Version;
pub use error::{CleanupError, CleanupResult, RegistryError};
pub use lifecycle::{BuildLifecycle, Phase};
pub use reaper::{CancellationFlag, KillOptions, KillReport, LeakDetector, LeakStatus, ProcessKiller};
pub use storage::ProcessRegistry;
pub use tasks::{CleanupTask, TaskContext, TaskOutcome};
pub use tracker::{DaemonTracker, SharedServices};
