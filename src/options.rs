//! Build, clean and install options plus setup parameters.

use crate::commands::CommandEchoMode;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

/// Options recognized by the build job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BuildOptions {
    pub dry_run: bool,
    pub keep_going: bool,
    pub log_elapsed_time: bool,
    pub max_job_count: usize,
    pub command_echo_mode: CommandEchoMode,
    /// Re-read all artifact timestamps from disk instead of trusting the
    /// cached values.
    pub force_timestamp_check: bool,
    /// Treat exactly these files as changed, everything else as unchanged.
    pub changed_files: Vec<PathBuf>,
    /// Restrict building to artifacts below these files, if non-empty.
    pub files_to_consider: Vec<PathBuf>,
    /// Restrict building to artifacts with these tags, if non-empty.
    pub active_file_tags: BTreeSet<String>,
    pub install_artifacts: bool,
    pub remove_stale_artifacts: bool,
    /// Concurrency cap per named job pool.
    pub job_limits_per_pool: BTreeMap<String, usize>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            keep_going: false,
            log_elapsed_time: false,
            max_job_count: num_cpus::get(),
            command_echo_mode: CommandEchoMode::default(),
            force_timestamp_check: false,
            changed_files: Vec::new(),
            files_to_consider: Vec::new(),
            active_file_tags: BTreeSet::new(),
            install_artifacts: false,
            remove_stale_artifacts: false,
            job_limits_per_pool: BTreeMap::new(),
        }
    }
}

impl BuildOptions {
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        assert!(jobs > 0);
        self.max_job_count = jobs;
        self
    }

    pub fn keep_going(mut self) -> Self {
        self.keep_going = true;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanOptions {
    pub dry_run: bool,
    pub keep_going: bool,
    /// Also drop the persisted build graph.
    pub remove_build_graph: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallOptions {
    pub install_root: PathBuf,
    pub dry_run: bool,
    pub keep_going: bool,
    pub clean_install_root: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            install_root: PathBuf::from("install-root"),
            dry_run: false,
            keep_going: false,
            clean_install_root: false,
        }
    }
}

/// Exit codes of the documented CLI contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    BuildFailure = 1,
    UsageError = 2,
    Cancelled = 3,
}

impl ExitCode {
    pub fn from_result(result: &crate::error::Result<()>) -> Self {
        use crate::error::ErrorKind;
        match result {
            Ok(()) => Self::Success,
            Err(e) if e.is_cancelled() => Self::Cancelled,
            Err(e) if e.kind() == ErrorKind::Configuration => Self::UsageError,
            Err(_) => Self::BuildFailure,
        }
    }
}

/// Parameters of the setup job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetupParameters {
    pub build_root: PathBuf,
    /// The final build-configuration tree; the project identity and the
    /// build-graph file location derive from it.
    pub build_configuration: crate::language::JsonValue,
    /// The environment the project is resolved and built under.
    pub environment: BTreeMap<String, String>,
    /// Overrides merged into the resolver's configuration tree.
    pub overridden_values: crate::language::JsonMap,
    /// Re-resolve even if the stored graph looks reusable, replacing the
    /// stored build-graph data.
    pub override_build_graph_data: bool,
    pub force_probe_execution: bool,
    /// Environment variables ignored by change tracking.
    pub env_ignore_list: BTreeSet<String>,
    /// Whether a changed `alwaysRun` flag on a rule forces one re-run of
    /// its transformers.
    pub treat_always_run_change_as_rerun: bool,
    pub settings_dir: Option<PathBuf>,
    pub dry_run: bool,
}

impl SetupParameters {
    pub fn new(build_root: impl Into<PathBuf>) -> Self {
        Self {
            build_root: build_root.into(),
            build_configuration: crate::language::JsonValue::Null,
            environment: std::env::vars().collect(),
            overridden_values: Default::default(),
            override_build_graph_data: false,
            force_probe_execution: false,
            env_ignore_list: ["LS_COLORS", "PS1", "PWD", "OLDPWD", "SHLVL", "_"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            treat_always_run_change_as_rerun: true,
            settings_dir: None,
            dry_run: false,
        }
    }

    pub fn with_configuration(mut self, configuration: crate::language::JsonValue) -> Self {
        self.build_configuration = configuration;
        self
    }

    pub fn project_id(&self) -> String {
        crate::language::derive_project_id(&self.build_configuration)
    }

    pub fn build_directory(&self) -> PathBuf {
        self.build_root.join(self.project_id())
    }

    pub fn build_graph_file_path(&self) -> PathBuf {
        self.build_directory().join(format!("{}.bg", self.project_id()))
    }

    /// The settings directory, defaulting to the platform config dir.
    pub fn effective_settings_dir(&self) -> PathBuf {
        self.settings_dir.clone().unwrap_or_else(|| {
            dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("quarry")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn exit_codes() {
        assert_eq!(ExitCode::from_result(&Ok(())), ExitCode::Success);
        assert_eq!(ExitCode::from_result(&Err(Error::cancelled())), ExitCode::Cancelled);
        assert_eq!(
            ExitCode::from_result(&Err(Error::configuration("bad flag"))),
            ExitCode::UsageError
        );
        assert_eq!(
            ExitCode::from_result(&Err(Error::internal("boom"))),
            ExitCode::BuildFailure
        );
    }
}
