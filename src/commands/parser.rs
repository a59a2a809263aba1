//! Command line definition

use crate::config::ConfigOverrides;
use clap::{Args, Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;

/// build-reaper - kill leaked build daemons and prune stale caches
#[derive(Parser, Debug, Clone)]
#[command(
    name = "build-reaper",
    about = "Kill leaked build daemons and prune stale version caches",
    version,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalOptions {
    /// Root of the checkout (defaults to the working directory)
    #[arg(long, global = true, value_name = "DIR")]
    pub root_project_dir: Option<PathBuf>,

    /// Build engine user home holding the daemon registry
    #[arg(long, global = true, value_name = "DIR")]
    pub gradle_home_dir: Option<PathBuf>,

    /// Home directory whose caches are cleaned
    #[arg(long, global = true, value_name = "DIR")]
    pub home_dir: Option<PathBuf>,

    /// Version of the running build engine
    #[arg(long, global = true, value_name = "VERSION")]
    pub build_version: Option<String>,

    /// Days an unused foreign cache is kept
    #[arg(long, global = true, value_name = "DAYS")]
    pub retention_days: Option<u64>,

    /// Log filter (trace, debug, info, warn, error or an EnvFilter directive)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Configuration file (defaults to build-reaper.toml in the root project dir)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Also kill unregistered processes whose command line mentions the checkout
    #[arg(long, global = true)]
    pub kill_untracked: bool,

    /// Session token shared by every invocation of one build
    #[arg(long, global = true, value_name = "ID")]
    pub build_id: Option<String>,
}

impl GlobalOptions {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            config_file: self.config.clone(),
            root_project_dir: self.root_project_dir.clone(),
            gradle_home_dir: self.gradle_home_dir.clone(),
            home_dir: self.home_dir.clone(),
            version: self.build_version.clone(),
            retention_days: self.retention_days,
            kill_untracked: self.kill_untracked.then_some(true),
            log_file: None,
            build_id: self.build_id.clone(),
        }
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Kill processes leaked by earlier build sessions
    #[command(name = "kill-leaked", alias = "killExistingProcessesStartedByGradle")]
    KillLeaked,

    /// Kill the daemons registered by this session
    #[command(name = "clean-daemons", alias = "cleanUpDaemons")]
    CleanDaemons,

    /// Remove stale caches of other engine versions
    #[command(name = "clean-caches", alias = "cleanUpCaches")]
    CleanCaches {
        /// Report what would be removed without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Leak kill followed by daemon and cache cleanup
    Clean {
        #[arg(long)]
        dry_run: bool,
    },

    /// Register an already running process
    Record {
        #[arg(value_name = "PID")]
        pid: u32,
        /// Owning session token (defaults to this session)
        #[arg(long, value_name = "ID")]
        owner: Option<String>,
    },

    /// Print registry contents
    List,

    /// Run a build command inside the cleanup lifecycle
    Run {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
        command: Vec<String>,
    },
}

impl Cli {
    pub fn try_parse_args_from<I, T>(iter: I) -> Result<Cli, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Cli::try_parse_from(iter)
    }
}
