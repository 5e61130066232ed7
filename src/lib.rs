#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;

pub mod utils;

pub mod language;

pub mod script;

pub mod commands;

pub mod options;

pub mod pool;

pub mod registry;

pub mod graph;

pub mod rulegraph;

pub mod scanner;

pub mod apply;

pub mod tracker;

pub mod executor;

pub mod clean;

pub mod install;

pub mod jobs;

pub mod updater;

pub use commands::{Command, CommandEchoMode, ProcessCommand, ScriptCommand};
pub use error::{CodeLocation, Error, ErrorKind, Result};
pub use executor::{BuildEvent, ProcessHost, ProcessResult, SystemProcessHost};
pub use graph::BuildGraph;
pub use jobs::{BuildEngine, Job, JobEvent, RuntimeFactory};
pub use language::{
    derive_project_id, file_tags, FileTag, FileTags, PropertyMap, ResolvedProduct, Rule,
    RuleArtifact, ScriptSource, TopLevelProject,
};
pub use options::{BuildOptions, CleanOptions, ExitCode, InstallOptions, SetupParameters};
pub use script::{ScriptRuntime, SimpleRuntime};
pub use tracker::{BuildData, ProjectResolver};
pub use updater::ProjectFileUpdater;
