//! Configuration for the cleanup service
//!
//! Values are layered: built-in defaults, then `build-reaper.toml` in the root
//! project directory (or an explicit `--config` file), then `BUILD_REAPER_*`
//! environment variables, then command line overrides.

use crate::error::CleanupError;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "build-reaper.toml";
pub const ENV_PREFIX: &str = "BUILD_REAPER";

/// Directory under the gradle home that holds the daemon registry
pub const REGISTRY_DIR_NAME: &str = "build-reaper";
pub const REGISTRY_FILE_NAME: &str = "daemon-registry.jsonl";
pub const REGISTRY_LOCK_SUFFIX: &str = ".lock";

/// Isolated home directory used by integration test builds
pub const INT_TEST_HOME_DIR: &str = "intTestHomeDir";
pub const CACHES_DIR_NAME: &str = "caches";

pub const DEFAULT_RETENTION_DAYS: u64 = 30;
pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);
pub const KILL_OVERALL_TIMEOUT: Duration = Duration::from_secs(60);
pub const KILL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Command line values that take precedence over every other source.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_file: Option<PathBuf>,
    pub root_project_dir: Option<PathBuf>,
    pub gradle_home_dir: Option<PathBuf>,
    pub home_dir: Option<PathBuf>,
    pub version: Option<String>,
    pub retention_days: Option<u64>,
    pub kill_untracked: Option<bool>,
    pub log_file: Option<PathBuf>,
    pub build_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    root_project_dir: PathBuf,
    gradle_home_dir: PathBuf,
    #[serde(default)]
    home_dir: Option<PathBuf>,
    #[serde(default)]
    version: Option<String>,
    retention_days: u64,
    kill_grace_secs: u64,
    kill_timeout_secs: u64,
    kill_untracked: bool,
    #[serde(default)]
    log_file: Option<PathBuf>,
    #[serde(default)]
    build_id: Option<String>,
}

/// Resolved configuration handed to the tracker, reaper and cache cleaner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupConfig {
    pub root_project_dir: PathBuf,
    pub gradle_home_dir: PathBuf,
    pub home_dir: PathBuf,
    /// Version of the running build engine; required for cache cleanup
    pub version: Option<String>,
    pub retention_days: u64,
    pub kill_grace_period: Duration,
    pub kill_timeout: Duration,
    /// Also kill unregistered processes that reference this checkout
    pub kill_untracked: bool,
    pub log_file: Option<PathBuf>,
    /// Session token shared by separate invocations of one build; a fresh
    /// one is generated per process when unset
    pub build_id: Option<String>,
}

impl CleanupConfig {
    /// Build the configuration for a checkout, with defaults only.
    pub fn for_project(root_project_dir: impl Into<PathBuf>) -> Self {
        let root_project_dir = root_project_dir.into();
        Self {
            home_dir: root_project_dir.join(INT_TEST_HOME_DIR),
            gradle_home_dir: default_gradle_home(),
            root_project_dir,
            version: None,
            retention_days: DEFAULT_RETENTION_DAYS,
            kill_grace_period: KILL_GRACE_PERIOD,
            kill_timeout: KILL_OVERALL_TIMEOUT,
            kill_untracked: false,
            log_file: None,
            build_id: None,
        }
    }

    pub fn load(overrides: ConfigOverrides) -> Result<Self, CleanupError> {
        let root_project_dir = match &overrides.root_project_dir {
            Some(dir) => dir.clone(),
            None => match std::env::var_os(format!("{ENV_PREFIX}_ROOT_PROJECT_DIR")) {
                Some(dir) => PathBuf::from(dir),
                None => std::env::current_dir().map_err(|err| {
                    CleanupError::Config(format!("cannot determine working directory: {err}"))
                })?,
            },
        };
        let config_file = overrides
            .config_file
            .clone()
            .unwrap_or_else(|| root_project_dir.join(CONFIG_FILE_NAME));

        let settings = Config::builder()
            .set_default("root_project_dir", path_str(&root_project_dir))?
            .set_default("gradle_home_dir", path_str(&default_gradle_home()))?
            .set_default("retention_days", DEFAULT_RETENTION_DAYS)?
            .set_default("kill_grace_secs", KILL_GRACE_PERIOD.as_secs())?
            .set_default("kill_timeout_secs", KILL_OVERALL_TIMEOUT.as_secs())?
            .set_default("kill_untracked", false)?
            .add_source(File::from(config_file.as_path()).required(overrides.config_file.is_some()))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .set_override_option(
                "root_project_dir",
                overrides.root_project_dir.as_deref().map(path_str),
            )?
            .set_override_option(
                "gradle_home_dir",
                overrides.gradle_home_dir.as_deref().map(path_str),
            )?
            .set_override_option("home_dir", overrides.home_dir.as_deref().map(path_str))?
            .set_override_option("version", overrides.version.clone())?
            .set_override_option("retention_days", overrides.retention_days)?
            .set_override_option("kill_untracked", overrides.kill_untracked)?
            .set_override_option("log_file", overrides.log_file.as_deref().map(path_str))?
            .set_override_option("build_id", overrides.build_id.clone())?
            .build()?;

        let raw: RawConfig = settings.try_deserialize()?;
        Ok(raw.into())
    }

    pub fn registry_path(&self) -> PathBuf {
        self.gradle_home_dir
            .join(REGISTRY_DIR_NAME)
            .join(REGISTRY_FILE_NAME)
    }

    /// Retention as a duration; saturates for absurdly large day counts.
    pub fn retention(&self) -> Duration {
        days(self.retention_days)
    }
}

impl From<RawConfig> for CleanupConfig {
    fn from(raw: RawConfig) -> Self {
        let home_dir = raw
            .home_dir
            .unwrap_or_else(|| raw.root_project_dir.join(INT_TEST_HOME_DIR));
        Self {
            root_project_dir: raw.root_project_dir,
            gradle_home_dir: raw.gradle_home_dir,
            home_dir,
            version: raw.version.filter(|v| !v.trim().is_empty()),
            retention_days: raw.retention_days,
            kill_grace_period: Duration::from_secs(raw.kill_grace_secs),
            kill_timeout: Duration::from_secs(raw.kill_timeout_secs),
            kill_untracked: raw.kill_untracked,
            log_file: raw.log_file,
            build_id: raw.build_id.filter(|id| !id.trim().is_empty()),
        }
    }
}

pub(crate) fn days(days: u64) -> Duration {
    days.checked_mul(24 * 60 * 60)
        .map(Duration::from_secs)
        .unwrap_or(Duration::MAX)
}

fn default_gradle_home() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".gradle"))
        .unwrap_or_else(|| std::env::temp_dir().join(".gradle"))
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn defaults_derive_home_dir_from_project() {
        let config = CleanupConfig::for_project("/work/checkout");
        assert_eq!(
            config.home_dir,
            PathBuf::from("/work/checkout").join(INT_TEST_HOME_DIR)
        );
        assert_eq!(config.retention_days, DEFAULT_RETENTION_DAYS);
        assert_eq!(config.retention(), Duration::from_secs(30 * 86_400));
        assert_eq!(config.build_id, None);
    }

    #[test]
    fn huge_retention_saturates() {
        let mut config = CleanupConfig::for_project("/work/checkout");
        config.retention_days = u64::MAX;
        assert_eq!(config.retention(), Duration::MAX);
    }

    #[test]
    #[serial]
    fn build_id_comes_from_the_environment_unless_overridden() {
        let root = TempDir::new().unwrap();
        std::env::set_var("BUILD_REAPER_BUILD_ID", "ci-1234");
        let from_env = CleanupConfig::load(ConfigOverrides {
            root_project_dir: Some(root.path().to_path_buf()),
            ..Default::default()
        });
        let from_cli = CleanupConfig::load(ConfigOverrides {
            root_project_dir: Some(root.path().to_path_buf()),
            build_id: Some("local".to_string()),
            ..Default::default()
        });
        std::env::remove_var("BUILD_REAPER_BUILD_ID");

        assert_eq!(from_env.unwrap().build_id.as_deref(), Some("ci-1234"));
        assert_eq!(from_cli.unwrap().build_id.as_deref(), Some("local"));
    }

    #[test]
    #[serial]
    fn file_values_are_overridden_by_cli() {
        let root = TempDir::new().unwrap();
        std::fs::write(
            root.path().join(CONFIG_FILE_NAME),
            "retention_days = 7\nversion = \"5.0\"\nkill_untracked = true\n",
        )
        .unwrap();

        let config = CleanupConfig::load(ConfigOverrides {
            root_project_dir: Some(root.path().to_path_buf()),
            version: Some("6.0".to_string()),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(config.retention_days, 7);
        assert!(config.kill_untracked);
        assert_eq!(config.version.as_deref(), Some("6.0"));
        assert_eq!(config.home_dir, root.path().join(INT_TEST_HOME_DIR));
    }

    #[test]
    #[serial]
    fn missing_explicit_config_file_is_an_error() {
        let root = TempDir::new().unwrap();
        let result = CleanupConfig::load(ConfigOverrides {
            root_project_dir: Some(root.path().to_path_buf()),
            config_file: Some(root.path().join("nope.toml")),
            ..Default::default()
        });
        assert!(matches!(result, Err(CleanupError::Config(_))));
    }

    #[test]
    fn registry_path_lives_under_gradle_home() {
        let mut config = CleanupConfig::for_project("/work/checkout");
        config.gradle_home_dir = PathBuf::from("/opt/gradle-home");
        assert_eq!(
            config.registry_path(),
            PathBuf::from("/opt/gradle-home/build-reaper/daemon-registry.jsonl")
        );
    }
}
