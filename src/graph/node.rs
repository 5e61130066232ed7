//! Node kinds of the bipartite build graph.

use crate::{
    language::{FileTags, ProductId, PropertyMap, Rule},
    utils::{split_file_path, FileTime},
};
use std::{collections::BTreeSet, path::PathBuf, sync::Arc};

/// Index of a node in the graph arena. Stable for the lifetime of the
/// graph; freed slots are tombstoned, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a transformer in the graph arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransformerId(pub u32);

impl TransformerId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a passive file-dependency resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileDepId(pub u32);

impl FileDepId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Transient per-node execution state, reset on every executor run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BuildState {
    #[default]
    Untouched,
    Buildable,
    Building,
    Built,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    SourceFile,
    Generated,
}

/// A file in the build graph.
#[derive(Clone, Debug)]
pub struct Artifact {
    pub file_path: PathBuf,
    /// Cached modification time; `None` forces the next read from disk.
    pub timestamp: Option<FileTime>,
    pub product: ProductId,
    pub kind: ArtifactKind,
    pub file_tags: FileTags,
    pub properties: PropertyMap,
    /// Present iff the artifact is generated.
    pub transformer: Option<TransformerId>,
    pub file_dependencies: BTreeSet<FileDepId>,
    /// Subset of `children` discovered by dependency scanners; pruned and
    /// regenerated on rescan.
    pub children_added_by_scanner: BTreeSet<NodeId>,
    pub always_updated: bool,
    /// Stale content from a previous configuration may still be on disk.
    pub old_data_possibly_present: bool,
    /// Transient: dependency scanning already ran this build.
    pub inputs_scanned: bool,
}

impl Artifact {
    pub fn new(product: ProductId, kind: ArtifactKind, file_path: PathBuf) -> Self {
        Self {
            file_path,
            timestamp: None,
            product,
            kind,
            file_tags: FileTags::new(),
            properties: PropertyMap::default(),
            transformer: None,
            file_dependencies: BTreeSet::new(),
            children_added_by_scanner: BTreeSet::new(),
            always_updated: true,
            old_data_possibly_present: false,
            inputs_scanned: false,
        }
    }

    pub fn is_generated(&self) -> bool {
        self.kind == ArtifactKind::Generated
    }

    pub fn dir_path(&self) -> PathBuf {
        split_file_path(&self.file_path).0
    }

    pub fn file_name(&self) -> String {
        split_file_path(&self.file_path).1
    }

    pub fn clear_timestamp(&mut self) {
        self.timestamp = None;
    }

    /// The cached timestamp, reading from disk on first use.
    pub fn timestamp(&mut self) -> FileTime {
        if let Some(t) = self.timestamp {
            return t;
        }
        let t = crate::utils::file_time(&self.file_path).unwrap_or_else(FileTime::oldest);
        self.timestamp = Some(t);
        t
    }
}

/// An external file referenced by scanners; never produced by a rule.
#[derive(Clone, Debug)]
pub struct FileDependency {
    pub file_path: PathBuf,
    pub timestamp: Option<FileTime>,
}

impl FileDependency {
    pub fn new(file_path: PathBuf) -> Self {
        Self { file_path, timestamp: None }
    }

    pub fn timestamp(&mut self) -> FileTime {
        if let Some(t) = self.timestamp {
            return t;
        }
        let t = crate::utils::file_time(&self.file_path).unwrap_or_else(FileTime::oldest);
        self.timestamp = Some(t);
        t
    }
}

/// An artifact set remembered across rule applications. Removing an
/// artifact leaves a marker behind so the set compares unequal to any
/// current set and forces re-application.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackedInputs {
    pub artifacts: BTreeSet<NodeId>,
    pub contains_removed: bool,
}

impl TrackedInputs {
    pub fn capture(artifacts: BTreeSet<NodeId>) -> Self {
        Self { artifacts, contains_removed: false }
    }

    pub fn differs_from(&self, current: &BTreeSet<NodeId>) -> bool {
        self.contains_removed || &self.artifacts != current
    }

    /// Drops `id` and leaves the removed marker if it was present.
    pub fn drop_artifact(&mut self, id: NodeId) {
        if self.artifacts.remove(&id) {
            self.contains_removed = true;
        }
    }
}

/// Per-product realisation of a rule.
#[derive(Clone, Debug)]
pub struct RuleNodeData {
    pub product: ProductId,
    pub rule: Arc<Rule>,
    pub old_input_artifacts: TrackedInputs,
    pub old_explicitly_depends_on: TrackedInputs,
    pub old_auxiliary_inputs: TrackedInputs,
    pub last_application_time: FileTime,
    /// Set once a prepare script of this rule touched the filesystem;
    /// input timestamps must then be re-examined on every run.
    pub needs_to_consider_changed_inputs: bool,
}

impl RuleNodeData {
    pub fn new(product: ProductId, rule: Arc<Rule>) -> Self {
        Self {
            product,
            rule,
            old_input_artifacts: TrackedInputs::default(),
            old_explicitly_depends_on: TrackedInputs::default(),
            old_auxiliary_inputs: TrackedInputs::default(),
            last_application_time: FileTime::oldest(),
            needs_to_consider_changed_inputs: false,
        }
    }

    pub fn remove_old_input_artifact(&mut self, id: NodeId) {
        self.old_input_artifacts.drop_artifact(id);
        self.old_explicitly_depends_on.drop_artifact(id);
        self.old_auxiliary_inputs.drop_artifact(id);
    }
}

#[derive(Clone, Debug)]
pub enum NodeData {
    Artifact(Artifact),
    Rule(RuleNodeData),
}

/// One node of the bipartite DAG, artifact or rule realisation, with its
/// shared edge sets.
#[derive(Clone, Debug)]
pub struct Node {
    pub children: BTreeSet<NodeId>,
    pub parents: BTreeSet<NodeId>,
    pub build_state: BuildState,
    pub data: NodeData,
}

impl Node {
    pub fn new(data: NodeData) -> Self {
        Self {
            children: BTreeSet::new(),
            parents: BTreeSet::new(),
            build_state: BuildState::Untouched,
            data,
        }
    }

    pub fn product(&self) -> ProductId {
        match &self.data {
            NodeData::Artifact(a) => a.product,
            NodeData::Rule(r) => r.product,
        }
    }

    pub fn as_artifact(&self) -> Option<&Artifact> {
        match &self.data {
            NodeData::Artifact(a) => Some(a),
            NodeData::Rule(_) => None,
        }
    }

    pub fn as_artifact_mut(&mut self) -> Option<&mut Artifact> {
        match &mut self.data {
            NodeData::Artifact(a) => Some(a),
            NodeData::Rule(_) => None,
        }
    }

    pub fn as_rule(&self) -> Option<&RuleNodeData> {
        match &self.data {
            NodeData::Rule(r) => Some(r),
            NodeData::Artifact(_) => None,
        }
    }

    pub fn as_rule_mut(&mut self) -> Option<&mut RuleNodeData> {
        match &mut self.data {
            NodeData::Rule(r) => Some(r),
            NodeData::Artifact(_) => None,
        }
    }

    pub fn is_artifact(&self) -> bool {
        matches!(self.data, NodeData::Artifact(_))
    }

    pub fn describe(&self) -> String {
        match &self.data {
            NodeData::Artifact(a) => format!("ARTIFACT {}", a.file_path.display()),
            NodeData::Rule(r) => format!("RULE {}", r.rule),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracked_inputs_removed_marker() {
        let mut tracked =
            TrackedInputs::capture([NodeId(1), NodeId(2)].into_iter().collect());
        let current: BTreeSet<NodeId> = [NodeId(1), NodeId(2)].into_iter().collect();
        assert!(!tracked.differs_from(&current));

        tracked.drop_artifact(NodeId(2));
        let reduced: BTreeSet<NodeId> = [NodeId(1)].into_iter().collect();
        // the marker keeps the set "different" even though the contents match
        assert!(tracked.differs_from(&reduced));
        // dropping an unknown artifact leaves no marker behind
        let mut clean = TrackedInputs::capture([NodeId(3)].into_iter().collect());
        clean.drop_artifact(NodeId(9));
        assert!(!clean.contains_removed);
    }
}
