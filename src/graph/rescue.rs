//! Change-tracking state carried across project re-resolution.

use crate::{
    commands::Command,
    language::{FileTags, PropertyMap},
    script::EvalObservations,
    utils::FileTime,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf};

/// A child edge of a rescued artifact, by path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RescuedChild {
    pub file_path: PathBuf,
    pub added_by_scanner: bool,
}

/// Everything worth preserving about one generated artifact when its
/// product's build data is thrown away. Reattached path-by-path when the
/// fresh build data creates the same output again.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RescuableArtifactData {
    pub timestamp: Option<FileTime>,
    pub known_out_of_date: bool,
    pub file_tags: FileTags,
    pub properties: PropertyMap,
    pub commands: Vec<Command>,
    pub prepare_observations: EvalObservations,
    pub command_observations: EvalObservations,
    pub children: Vec<RescuedChild>,
    pub file_dependencies: Vec<PathBuf>,
    pub last_command_execution_time: FileTime,
    pub last_prepare_execution_time: FileTime,
    pub prepare_needs_change_tracking: bool,
    pub commands_need_change_tracking: bool,
    pub marked_for_rerun: bool,
    pub always_run: bool,
    /// Whether a flipped `alwaysRun` value on the new rule forces one
    /// re-execution; taken from the setup parameters at capture time.
    #[serde(default)]
    pub rerun_on_always_run_change: bool,
}

pub type AllRescuableArtifactData = BTreeMap<PathBuf, RescuableArtifactData>;
