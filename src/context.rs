use std::path::PathBuf;
use std::time::Duration;

use crate::exec::{ExecMode, Executor};

/// Default metadata directory, relative to the working directory.
pub const DEFAULT_DATA_DIR: &str = ".vpcctl_data";

/// Upper bound on any single link/filter command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between SIGTERM and SIGKILL when stopping a workload.
pub const APP_STOP_GRACE: Duration = Duration::from_secs(5);

/// Everything an operation needs to know about its environment, carried
/// explicitly instead of living in process globals: where the metadata is,
/// whether mutations are real, and how external commands are run.
pub struct Context {
    pub data_dir: PathBuf,
    pub dry_run: bool,
    pub exec: Executor,
}

impl Context {
    pub fn new(data_dir: impl Into<PathBuf>, dry_run: bool) -> Self {
        Self::with_timeout(data_dir, dry_run, DEFAULT_COMMAND_TIMEOUT)
    }

    pub fn with_timeout(data_dir: impl Into<PathBuf>, dry_run: bool, timeout: Duration) -> Self {
        let mode = if dry_run {
            ExecMode::DryRun
        } else {
            ExecMode::Live
        };
        Self {
            data_dir: data_dir.into(),
            dry_run,
            exec: Executor::new(mode, timeout),
        }
    }
}
