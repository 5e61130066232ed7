//! The bipartite build graph: file artifacts and rule nodes, connected by
//! dependency edges, owned per product.
//!
//! Nodes live in one arena and are addressed by [`NodeId`]; products hold
//! id sets instead of owning pointers, and nodes refer back to their
//! product by [`ProductId`]. Edges are kept bidirectionally
//! (`children`/`parents`); the persistence layer stores only `children`
//! and the loader rebuilds `parents`.

pub mod node;
pub mod rescue;
pub mod transformer;

pub use node::{
    Artifact, ArtifactKind, BuildState, FileDepId, FileDependency, Node, NodeData, NodeId,
    RuleNodeData, TrackedInputs, TransformerId,
};
pub use rescue::{AllRescuableArtifactData, RescuableArtifactData, RescuedChild};
pub use transformer::Transformer;

use crate::{
    error::{Error, ErrorKind, Result},
    language::{same_rule, FileTag, FileTags, ProductId, PropertyMap, Rule, TopLevelProject},
    pool::{PoolReader, PoolWriter, Tag},
    registry::{FileResourceRegistry, FileResourceRef},
    scanner::RawScanResults,
    utils::FileTime,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Write as _,
    path::{Path, PathBuf},
    sync::Arc,
};

/// The per-tag secondary index of a product, plus a version counter that
/// invalidates cached artifacts-map script values when bumped.
#[derive(Debug, Default)]
pub struct TagIndex {
    map: BTreeMap<FileTag, BTreeSet<NodeId>>,
    version: u64,
}

impl TagIndex {
    pub fn lookup(&self, tag: &FileTag) -> BTreeSet<NodeId> {
        self.map.get(tag).cloned().unwrap_or_default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    fn add(&mut self, id: NodeId, tags: &FileTags) {
        for tag in tags {
            self.map.entry(tag.clone()).or_default().insert(id);
        }
        self.version += 1;
    }

    fn remove(&mut self, id: NodeId, tags: &FileTags) {
        for tag in tags {
            if let Some(set) = self.map.get_mut(tag) {
                set.remove(&id);
                if set.is_empty() {
                    self.map.remove(tag);
                }
            }
        }
        self.version += 1;
    }
}

/// Build-graph state of one product.
#[derive(Debug, Default)]
pub struct ProductBuildData {
    pub nodes: BTreeSet<NodeId>,
    /// Entry points of the product: its root rule nodes and target
    /// artifacts.
    pub roots: BTreeSet<NodeId>,
    /// Guarded separately; artifacts-map queries from the script thread
    /// must see a consistent snapshot.
    tag_index: Mutex<TagIndex>,
    pub rescuable: AllRescuableArtifactData,
}

impl ProductBuildData {
    pub fn artifacts_by_file_tag(&self, tag: &FileTag) -> BTreeSet<NodeId> {
        self.tag_index.lock().lookup(tag)
    }

    pub fn tag_index_version(&self) -> u64 {
        self.tag_index.lock().version()
    }
}

#[derive(Debug, Default)]
pub struct BuildGraph {
    nodes: Vec<Option<Node>>,
    transformers: Vec<Transformer>,
    file_deps: Vec<FileDependency>,
    products: Vec<ProductBuildData>,
    pub registry: FileResourceRegistry,
    pub raw_scan_results: RawScanResults,
    dirty: bool,
}

impl BuildGraph {
    pub fn new(product_count: usize) -> Self {
        let mut products = Vec::with_capacity(product_count);
        products.resize_with(product_count, ProductBuildData::default);
        Self { products, ..Default::default() }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn product_count(&self) -> usize {
        self.products.len()
    }

    pub fn product_data(&self, id: ProductId) -> &ProductBuildData {
        &self.products[id.index()]
    }

    pub fn product_data_mut(&mut self, id: ProductId) -> &mut ProductBuildData {
        &mut self.products[id.index()]
    }

    /// All live node ids.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_some())
            .map(|(i, _)| NodeId(i as u32))
    }

    pub fn try_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    /// Panics on a dead id; ids handed out by the graph stay valid until
    /// the node is removed.
    pub fn node(&self, id: NodeId) -> &Node {
        self.try_node(id).unwrap_or_else(|| panic!("dead node id {id:?}"))
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .unwrap_or_else(|| panic!("dead node id {id:?}"))
    }

    pub fn artifact(&self, id: NodeId) -> Option<&Artifact> {
        self.try_node(id).and_then(Node::as_artifact)
    }

    pub fn artifact_mut(&mut self, id: NodeId) -> Option<&mut Artifact> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut).and_then(Node::as_artifact_mut)
    }

    pub fn transformer(&self, id: TransformerId) -> &Transformer {
        &self.transformers[id.index()]
    }

    pub fn transformer_mut(&mut self, id: TransformerId) -> &mut Transformer {
        &mut self.transformers[id.index()]
    }

    pub fn add_transformer(&mut self, transformer: Transformer) -> TransformerId {
        let id = TransformerId(self.transformers.len() as u32);
        self.transformers.push(transformer);
        self.dirty = true;
        id
    }

    pub fn file_dependency(&self, id: FileDepId) -> &FileDependency {
        &self.file_deps[id.index()]
    }

    pub fn file_dependency_mut(&mut self, id: FileDepId) -> &mut FileDependency {
        &mut self.file_deps[id.index()]
    }

    pub fn file_dependency_ids(&self) -> impl Iterator<Item = FileDepId> + '_ {
        (0..self.file_deps.len()).map(|i| FileDepId(i as u32))
    }

    pub fn add_file_dependency(&mut self, file_path: PathBuf) -> FileDepId {
        if let Some(existing) = self
            .registry
            .lookup_path(&file_path)
            .into_iter()
            .find_map(|r| match r {
                FileResourceRef::Dependency(id) => Some(id),
                FileResourceRef::Artifact(_) => None,
            })
        {
            return existing;
        }
        let id = FileDepId(self.file_deps.len() as u32);
        self.registry.insert(&file_path, FileResourceRef::Dependency(id));
        self.file_deps.push(FileDependency::new(file_path));
        self.dirty = true;
        id
    }

    /// Inserts an artifact under `product`, updating the registry and the
    /// product's tag index in one step.
    ///
    /// Fails with a conflict when a generated artifact already occupies
    /// the same file path (in any product), or any artifact does within
    /// this product.
    pub fn insert_artifact(&mut self, artifact: Artifact) -> Result<NodeId> {
        if artifact.file_path.as_os_str().is_empty() {
            return Err(Error::internal("artifact without a file path"));
        }
        let product = artifact.product;
        for resource in self.registry.lookup_path(&artifact.file_path) {
            let FileResourceRef::Artifact(other_id) = resource else { continue };
            let Some(other) = self.artifact(other_id) else { continue };
            if other.product == product {
                return Err(Error::new(
                    ErrorKind::Conflict,
                    format!(
                        "product already contains an artifact for '{}'",
                        artifact.file_path.display()
                    ),
                ));
            }
            if other.is_generated() && artifact.is_generated() {
                return Err(Error::new(
                    ErrorKind::Conflict,
                    format!(
                        "two generated artifacts claim the file path '{}'",
                        artifact.file_path.display()
                    ),
                ));
            }
        }
        let id = NodeId(self.nodes.len() as u32);
        self.registry.insert(&artifact.file_path, FileResourceRef::Artifact(id));
        let data = &mut self.products[product.index()];
        data.nodes.insert(id);
        data.tag_index.lock().add(id, &artifact.file_tags);
        trace!("insert artifact '{}'", artifact.file_path.display());
        self.nodes.push(Some(Node::new(NodeData::Artifact(artifact))));
        self.dirty = true;
        Ok(id)
    }

    pub fn create_rule_node(&mut self, product: ProductId, rule: Arc<Rule>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(Node::new(NodeData::Rule(RuleNodeData::new(product, rule)))));
        self.products[product.index()].nodes.insert(id);
        self.dirty = true;
        id
    }

    /// Replaces an artifact's tags, keeping the per-product index exact.
    pub fn set_artifact_file_tags(&mut self, id: NodeId, tags: FileTags) {
        let Some(artifact) = self.artifact(id) else { return };
        let product = artifact.product;
        let old_tags = artifact.file_tags.clone();
        if old_tags == tags {
            return;
        }
        {
            let mut index = self.products[product.index()].tag_index.lock();
            index.remove(id, &old_tags);
            index.add(id, &tags);
        }
        if let Some(artifact) = self.artifact_mut(id) {
            artifact.file_tags = tags;
        }
        self.dirty = true;
    }

    pub fn add_artifact_file_tag(&mut self, id: NodeId, tag: FileTag) {
        let Some(artifact) = self.artifact(id) else { return };
        let mut tags = artifact.file_tags.clone();
        if tags.insert(tag) {
            self.set_artifact_file_tags(id, tags);
        }
    }

    /// Adds the edge `parent -> child`, maintaining both directions.
    ///
    /// Rejects a second child with the same file path, which would make
    /// command inputs ambiguous.
    pub fn connect(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        if parent == child {
            return Err(Error::internal("cannot connect a node to itself"));
        }
        if self.node(parent).children.contains(&child) {
            return Ok(());
        }
        if let Some(new_child) = self.artifact(child) {
            let new_path = new_child.file_path.clone();
            for existing in self.node(parent).children.clone() {
                if let Some(a) = self.artifact(existing) {
                    if a.file_path == new_path {
                        return Err(Error::internal(format!(
                            "two distinct child artifacts for file path '{}'",
                            new_path.display()
                        )));
                    }
                }
            }
        }
        trace!("connect '{}' -> '{}'", self.node(parent).describe(), self.node(child).describe());
        self.node_mut(parent).children.insert(child);
        self.node_mut(child).parents.insert(parent);
        self.dirty = true;
        Ok(())
    }

    /// Like [`Self::connect`], but refuses edges that would close a cycle.
    pub fn safe_connect(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        if self.path_exists(child, parent) {
            let mut cycle = Vec::new();
            self.find_path(child, parent, &mut Vec::new(), &mut cycle);
            return Err(self.cycle_error(&cycle));
        }
        self.connect(parent, child)
    }

    pub fn cycle_error(&self, cycle: &[NodeId]) -> Error {
        let mut err = Error::new(ErrorKind::Cycle, "cycle in build graph detected");
        for id in cycle {
            err = err.append(format!("  {}", self.node(*id).describe()));
        }
        err
    }

    /// Removes the edge and any scanner bookkeeping attached to it.
    pub fn disconnect(&mut self, parent: NodeId, child: NodeId) {
        if let Some(node) = self.nodes.get_mut(parent.index()).and_then(Option::as_mut) {
            node.children.remove(&child);
            if let Some(artifact) = node.as_artifact_mut() {
                artifact.children_added_by_scanner.remove(&child);
            }
        }
        if let Some(node) = self.nodes.get_mut(child.index()).and_then(Option::as_mut) {
            node.parents.remove(&parent);
        }
        self.dirty = true;
    }

    /// DFS reachability along `children` edges.
    pub fn path_exists(&self, from: NodeId, to: NodeId) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.try_node(id) {
                stack.extend(node.children.iter().copied());
            }
        }
        false
    }

    fn find_path(&self, from: NodeId, to: NodeId, trail: &mut Vec<NodeId>, out: &mut Vec<NodeId>) {
        if !out.is_empty() {
            return;
        }
        trail.push(from);
        if from == to {
            *out = trail.clone();
        } else if let Some(node) = self.try_node(from) {
            for child in node.children.clone() {
                self.find_path(child, to, trail, out);
            }
        }
        trail.pop();
    }

    /// Looks up the artifact at `file_path` belonging to `product`.
    pub fn lookup_artifact(&self, product: ProductId, file_path: &Path) -> Option<NodeId> {
        self.registry.lookup_path(file_path).into_iter().find_map(|r| match r {
            FileResourceRef::Artifact(id) => {
                self.artifact(id).filter(|a| a.product == product).map(|_| id)
            }
            FileResourceRef::Dependency(_) => None,
        })
    }

    /// Looks up an artifact at `file_path` in any product.
    pub fn lookup_artifact_anywhere(&self, file_path: &Path) -> Option<NodeId> {
        self.registry.lookup_path(file_path).into_iter().find_map(|r| match r {
            FileResourceRef::Artifact(id) => self.artifact(id).map(|_| id),
            FileResourceRef::Dependency(_) => None,
        })
    }

    pub fn lookup_file_dependency(&self, file_path: &Path) -> Option<FileDepId> {
        self.registry.lookup_path(file_path).into_iter().find_map(|r| match r {
            FileResourceRef::Dependency(id) => Some(id),
            FileResourceRef::Artifact(_) => None,
        })
    }

    /// Removes one artifact node: all edges, registry entry, product
    /// membership, tag index, rule-node input history.
    pub fn remove_artifact(&mut self, id: NodeId) {
        let Some(artifact) = self.artifact(id) else { return };
        let product = artifact.product;
        let file_path = artifact.file_path.clone();
        let tags = artifact.file_tags.clone();
        let transformer = artifact.transformer;
        debug!("remove artifact '{}'", file_path.display());

        for parent in self.node(id).parents.clone() {
            self.disconnect(parent, id);
        }
        for child in self.node(id).children.clone() {
            self.disconnect(id, child);
        }
        if let Some(tid) = transformer {
            self.transformers[tid.index()].outputs.remove(&id);
            self.transformers[tid.index()].inputs.remove(&id);
        }
        for tid in 0..self.transformers.len() {
            self.transformers[tid].inputs.remove(&id);
            self.transformers[tid].explicitly_depends_on.remove(&id);
        }
        self.registry.remove(&file_path, FileResourceRef::Artifact(id));
        let data = &mut self.products[product.index()];
        data.nodes.remove(&id);
        data.roots.remove(&id);
        data.tag_index.lock().remove(id, &tags);

        // rule nodes remember their former inputs; leave the removed marker
        let candidate_nodes: Vec<NodeId> = data.nodes.iter().copied().collect();
        let rule_nodes: Vec<NodeId> = candidate_nodes
            .into_iter()
            .filter(|n| self.try_node(*n).map_or(false, |n| !n.is_artifact()))
            .collect();
        for rule_node in rule_nodes {
            if let Some(data) = self.node_mut(rule_node).as_rule_mut() {
                data.remove_old_input_artifact(id);
            }
        }

        self.nodes[id.index()] = None;
        self.dirty = true;
    }

    /// Removes an artifact plus every generated artifact that only
    /// existed because of it. `removed` collects the file paths of the
    /// removed *generated* artifacts; the caller owns disk removal and
    /// directory GC.
    pub fn remove_artifact_and_exclusive_dependents(
        &mut self,
        id: NodeId,
        removed: &mut Vec<(NodeId, PathBuf)>,
    ) {
        let Some(artifact) = self.artifact(id) else { return };
        if artifact.is_generated() {
            removed.push((id, artifact.file_path.clone()));
        }
        for parent in self.node(id).parents.clone() {
            let Some(parent_node) = self.try_node(parent) else { continue };
            let Some(parent_artifact) = parent_node.as_artifact() else { continue };
            let Some(tid) = parent_artifact.transformer else { continue };
            self.disconnect(parent, id);
            let transformer = &mut self.transformers[tid.index()];
            let was_input = transformer.inputs.remove(&id);
            if transformer.inputs.is_empty() && was_input {
                self.remove_artifact_and_exclusive_dependents(parent, removed);
            } else if was_input {
                // the parent's input set shrank; it must be rebuilt
                transformer.marked_for_rerun = true;
                if let Some(parent_artifact) = self.artifact_mut(parent) {
                    parent_artifact.clear_timestamp();
                }
            }
        }
        self.remove_artifact(id);
    }

    pub fn reset_build_states(&mut self) {
        for node in self.nodes.iter_mut().flatten() {
            node.build_state = BuildState::Untouched;
            if let Some(artifact) = node.as_artifact_mut() {
                artifact.inputs_scanned = false;
            }
        }
    }

    /// Clears cached timestamps of every artifact and file dependency.
    pub fn invalidate_timestamps(&mut self) {
        for node in self.nodes.iter_mut().flatten() {
            if let Some(artifact) = node.as_artifact_mut() {
                artifact.timestamp = None;
            }
        }
        for dep in &mut self.file_deps {
            dep.timestamp = None;
        }
    }

    /// Writes the indented artifact tree of every product, roots first.
    pub fn dump_nodes(&self, project: &TopLevelProject) -> String {
        let mut out = String::new();
        for (index, product) in project.products.iter().enumerate() {
            let data = &self.products[index];
            let _ = writeln!(out, "product {}", product.name);
            let mut visited = BTreeSet::new();
            for root in &data.roots {
                self.dump_node(*root, 1, &mut visited, &mut out);
            }
        }
        out
    }

    fn dump_node(&self, id: NodeId, depth: usize, visited: &mut BTreeSet<NodeId>, out: &mut String) {
        let Some(node) = self.try_node(id) else { return };
        if node.is_artifact() {
            let _ = writeln!(out, "{}{}", "    ".repeat(depth), node.describe());
            if !visited.insert(id) {
                return;
            }
        }
        for child in &node.children {
            self.dump_node(*child, depth + if node.is_artifact() { 1 } else { 0 }, visited, out);
        }
    }

    /// Verifies the structural invariants; violations are internal errors.
    pub fn sanity_check(&self, project: &TopLevelProject) -> Result<()> {
        if project.products.len() != self.products.len() {
            return Err(Error::internal(format!(
                "graph has build data for {} products, project has {}",
                self.products.len(),
                project.products.len()
            )));
        }
        let mut generated_paths: BTreeMap<PathBuf, NodeId> = BTreeMap::new();
        for id in self.node_ids().collect::<Vec<_>>() {
            let node = self.node(id);
            for parent in &node.parents {
                let ok = self.try_node(*parent).map_or(false, |p| p.children.contains(&id));
                if !ok {
                    return Err(Error::internal(format!(
                        "edge mismatch: {} not a child of its parent",
                        node.describe()
                    )));
                }
            }
            for child in &node.children {
                let ok = self.try_node(*child).map_or(false, |c| c.parents.contains(&id));
                if !ok {
                    return Err(Error::internal(format!(
                        "edge mismatch: {} not a parent of its child",
                        node.describe()
                    )));
                }
            }
            let product = self.products.get(node.product().index()).ok_or_else(|| {
                Error::internal(format!("{} belongs to an unknown product", node.describe()))
            })?;
            if !product.nodes.contains(&id) {
                return Err(Error::internal(format!(
                    "{} missing from its product's node set",
                    node.describe()
                )));
            }
            let Some(artifact) = node.as_artifact() else { continue };
            if !artifact.children_added_by_scanner.is_subset(&node.children) {
                return Err(Error::internal(format!(
                    "scanner children of '{}' are not all children",
                    artifact.file_path.display()
                )));
            }
            for tag in &artifact.file_tags {
                if !product.artifacts_by_file_tag(tag).contains(&id) {
                    return Err(Error::internal(format!(
                        "tag index misses '{}' under tag '{tag}'",
                        artifact.file_path.display()
                    )));
                }
            }
            if artifact.is_generated() {
                if let Some(previous) =
                    generated_paths.insert(artifact.file_path.clone(), id)
                {
                    if previous != id {
                        return Err(Error::internal(format!(
                            "two generated artifacts share '{}'",
                            artifact.file_path.display()
                        )));
                    }
                }
                let Some(tid) = artifact.transformer else {
                    return Err(Error::internal(format!(
                        "generated artifact '{}' has no transformer",
                        artifact.file_path.display()
                    )));
                };
                let transformer = self.transformer(tid);
                if !transformer.outputs.contains(&id) {
                    return Err(Error::internal(format!(
                        "transformer does not own its output '{}'",
                        artifact.file_path.display()
                    )));
                }
                for input in &transformer.inputs {
                    if !node.children.contains(input) {
                        return Err(Error::internal(format!(
                            "transformer input missing from children of '{}'",
                            artifact.file_path.display()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // persistence
    // ------------------------------------------------------------------

    pub fn store(&self, writer: &mut PoolWriter) -> Result<()> {
        writer.write_tag(Tag::Project);
        writer.write_u64(self.nodes.len() as u64);
        for slot in &self.nodes {
            match slot {
                None => writer.write_bool(false),
                Some(node) => {
                    writer.write_bool(true);
                    self.store_node(writer, node)?;
                }
            }
        }
        writer.write_u64(self.transformers.len() as u64);
        for transformer in &self.transformers {
            self.store_transformer(writer, transformer)?;
        }
        writer.write_u64(self.file_deps.len() as u64);
        for dep in &self.file_deps {
            writer.write_tag(Tag::FileDependency);
            writer.write_path(&dep.file_path);
            writer.write_opt_file_time(dep.timestamp);
        }
        writer.write_u64(self.products.len() as u64);
        for product in &self.products {
            writer.write_tag(Tag::Product);
            writer.write_u32_iter(product.nodes.iter().map(|n| n.0));
            writer.write_u32_iter(product.roots.iter().map(|n| n.0));
            writer.write_tag(Tag::RescueData);
            writer.write_value(&product.rescuable)?;
        }
        self.raw_scan_results.store(writer)?;
        Ok(())
    }

    fn store_node(&self, writer: &mut PoolWriter, node: &Node) -> Result<()> {
        match &node.data {
            NodeData::Artifact(a) => {
                writer.write_tag(Tag::ArtifactNode);
                writer.write_u32_iter(node.children.iter().map(|n| n.0));
                writer.write_path(&a.file_path);
                writer.write_opt_file_time(a.timestamp);
                writer.write_u32(a.product.0);
                writer.write_bool(a.is_generated());
                writer.write_value(&a.file_tags)?;
                writer.write_shared(a.properties.intern_key(), &a.properties)?;
                writer.write_opt_u32(a.transformer.map(|t| t.0));
                writer.write_u32_iter(a.file_dependencies.iter().map(|d| d.0));
                writer.write_u32_iter(a.children_added_by_scanner.iter().map(|n| n.0));
                writer.write_bool(a.always_updated);
                writer.write_bool(a.old_data_possibly_present);
            }
            NodeData::Rule(r) => {
                writer.write_tag(Tag::RuleNode);
                writer.write_u32_iter(node.children.iter().map(|n| n.0));
                writer.write_u32(r.product.0);
                writer.write_shared(Arc::as_ptr(&r.rule) as usize, &*r.rule)?;
                for tracked in
                    [&r.old_input_artifacts, &r.old_explicitly_depends_on, &r.old_auxiliary_inputs]
                {
                    writer.write_u32_iter(tracked.artifacts.iter().map(|n| n.0));
                    writer.write_bool(tracked.contains_removed);
                }
                writer.write_file_time(r.last_application_time);
                writer.write_bool(r.needs_to_consider_changed_inputs);
            }
        }
        Ok(())
    }

    fn store_transformer(&self, writer: &mut PoolWriter, t: &Transformer) -> Result<()> {
        writer.write_tag(Tag::Transformer);
        writer.write_shared(Arc::as_ptr(&t.rule) as usize, &*t.rule)?;
        writer.write_u32(t.product.0);
        writer.write_u32_iter(t.inputs.iter().map(|n| n.0));
        writer.write_u32_iter(t.explicitly_depends_on.iter().map(|n| n.0));
        writer.write_u32_iter(t.outputs.iter().map(|n| n.0));
        writer.write_value(&t.commands)?;
        writer.write_value(&t.prepare_observations)?;
        writer.write_value(&t.command_observations)?;
        writer.write_file_time(t.last_command_execution_time);
        writer.write_file_time(t.last_prepare_execution_time);
        writer.write_bool(t.prepare_needs_change_tracking);
        writer.write_bool(t.commands_need_change_tracking);
        writer.write_bool(t.marked_for_rerun);
        writer.write_bool(t.always_run);
        Ok(())
    }

    /// Phase one reconstructs every object; phase two rebuilds `parents`
    /// edges, the registry and the tag indices.
    pub fn load(reader: &mut PoolReader) -> Result<Self> {
        reader.expect_tag(Tag::Project)?;
        let node_count = reader.read_usize()?;
        let mut nodes: Vec<Option<Node>> = Vec::with_capacity(node_count.min(1 << 20));
        for _ in 0..node_count {
            if !reader.read_bool()? {
                nodes.push(None);
                continue;
            }
            nodes.push(Some(Self::load_node(reader)?));
        }
        let transformer_count = reader.read_usize()?;
        let mut transformers = Vec::with_capacity(transformer_count.min(1 << 20));
        for _ in 0..transformer_count {
            transformers.push(Self::load_transformer(reader)?);
        }
        let dep_count = reader.read_usize()?;
        let mut file_deps = Vec::with_capacity(dep_count.min(1 << 20));
        for _ in 0..dep_count {
            reader.expect_tag(Tag::FileDependency)?;
            let file_path = reader.read_path()?;
            let timestamp = reader.read_opt_file_time()?;
            file_deps.push(FileDependency { file_path, timestamp });
        }
        let product_count = reader.read_usize()?;
        let mut products = Vec::with_capacity(product_count.min(1 << 16));
        for _ in 0..product_count {
            reader.expect_tag(Tag::Product)?;
            let nodes_set: BTreeSet<NodeId> =
                reader.read_u32_vec()?.into_iter().map(NodeId).collect();
            let roots: BTreeSet<NodeId> =
                reader.read_u32_vec()?.into_iter().map(NodeId).collect();
            reader.expect_tag(Tag::RescueData)?;
            let rescuable: AllRescuableArtifactData = reader.read_value()?;
            products.push(ProductBuildData {
                nodes: nodes_set,
                roots,
                tag_index: Mutex::new(TagIndex::default()),
                rescuable,
            });
        }
        let raw_scan_results = RawScanResults::load(reader)?;

        let mut graph = Self {
            nodes,
            transformers,
            file_deps,
            products,
            registry: FileResourceRegistry::new(),
            raw_scan_results,
            dirty: false,
        };
        graph.restore_back_pointers();
        Ok(graph)
    }

    fn load_node(reader: &mut PoolReader) -> Result<Node> {
        let tag = reader.read_tag()?;
        match tag {
            Tag::ArtifactNode => {
                let children: BTreeSet<NodeId> =
                    reader.read_u32_vec()?.into_iter().map(NodeId).collect();
                let file_path = reader.read_path()?;
                let timestamp = reader.read_opt_file_time()?;
                let product = ProductId(reader.read_u32()?);
                let generated = reader.read_bool()?;
                let file_tags: FileTags = reader.read_value()?;
                let properties: Arc<PropertyMap> = reader.read_shared()?;
                let transformer = reader.read_opt_u32()?.map(TransformerId);
                let file_dependencies: BTreeSet<FileDepId> =
                    reader.read_u32_vec()?.into_iter().map(FileDepId).collect();
                let children_added_by_scanner: BTreeSet<NodeId> =
                    reader.read_u32_vec()?.into_iter().map(NodeId).collect();
                let always_updated = reader.read_bool()?;
                let old_data_possibly_present = reader.read_bool()?;
                let mut node = Node::new(NodeData::Artifact(Artifact {
                    file_path,
                    timestamp,
                    product,
                    kind: if generated { ArtifactKind::Generated } else { ArtifactKind::SourceFile },
                    file_tags,
                    properties: (*properties).clone(),
                    transformer,
                    file_dependencies,
                    children_added_by_scanner,
                    always_updated,
                    old_data_possibly_present,
                    inputs_scanned: false,
                }));
                node.children = children;
                Ok(node)
            }
            Tag::RuleNode => {
                let children: BTreeSet<NodeId> =
                    reader.read_u32_vec()?.into_iter().map(NodeId).collect();
                let product = ProductId(reader.read_u32()?);
                let rule: Arc<Rule> = reader.read_shared()?;
                let mut tracked = Vec::with_capacity(3);
                for _ in 0..3 {
                    let artifacts: BTreeSet<NodeId> =
                        reader.read_u32_vec()?.into_iter().map(NodeId).collect();
                    let contains_removed = reader.read_bool()?;
                    tracked.push(TrackedInputs { artifacts, contains_removed });
                }
                let last_application_time = reader.read_file_time()?;
                let needs_to_consider_changed_inputs = reader.read_bool()?;
                let mut data = RuleNodeData::new(product, rule);
                data.old_auxiliary_inputs = tracked.pop().unwrap();
                data.old_explicitly_depends_on = tracked.pop().unwrap();
                data.old_input_artifacts = tracked.pop().unwrap();
                data.last_application_time = last_application_time;
                data.needs_to_consider_changed_inputs = needs_to_consider_changed_inputs;
                let mut node = Node::new(NodeData::Rule(data));
                node.children = children;
                Ok(node)
            }
            other => Err(Error::new(
                ErrorKind::CorruptBuildGraph,
                format!("expected a node record, found {other:?}"),
            )),
        }
    }

    fn load_transformer(reader: &mut PoolReader) -> Result<Transformer> {
        reader.expect_tag(Tag::Transformer)?;
        let rule: Arc<Rule> = reader.read_shared()?;
        let product = ProductId(reader.read_u32()?);
        let inputs: BTreeSet<NodeId> = reader.read_u32_vec()?.into_iter().map(NodeId).collect();
        let explicitly_depends_on: BTreeSet<NodeId> =
            reader.read_u32_vec()?.into_iter().map(NodeId).collect();
        let outputs: BTreeSet<NodeId> = reader.read_u32_vec()?.into_iter().map(NodeId).collect();
        let commands = reader.read_value()?;
        let prepare_observations = reader.read_value()?;
        let command_observations = reader.read_value()?;
        let mut transformer = Transformer::new(rule, product);
        transformer.inputs = inputs;
        transformer.explicitly_depends_on = explicitly_depends_on;
        transformer.outputs = outputs;
        transformer.commands = commands;
        transformer.prepare_observations = prepare_observations;
        transformer.command_observations = command_observations;
        transformer.last_command_execution_time = reader.read_file_time()?;
        transformer.last_prepare_execution_time = reader.read_file_time()?;
        transformer.prepare_needs_change_tracking = reader.read_bool()?;
        transformer.commands_need_change_tracking = reader.read_bool()?;
        transformer.marked_for_rerun = reader.read_bool()?;
        transformer.always_run = reader.read_bool()?;
        Ok(transformer)
    }

    fn restore_back_pointers(&mut self) {
        let ids: Vec<NodeId> = self.node_ids().collect();
        for id in &ids {
            for child in self.node(*id).children.clone() {
                if let Some(node) = self.nodes.get_mut(child.index()).and_then(Option::as_mut) {
                    node.parents.insert(*id);
                }
            }
        }
        for id in ids {
            let Some(artifact) = self.artifact(id) else { continue };
            let file_path = artifact.file_path.clone();
            let product = artifact.product;
            let tags = artifact.file_tags.clone();
            self.registry.insert(&file_path, FileResourceRef::Artifact(id));
            self.products[product.index()].tag_index.lock().add(id, &tags);
        }
        for (index, dep) in self.file_deps.iter().enumerate() {
            self.registry
                .insert(&dep.file_path, FileResourceRef::Dependency(FileDepId(index as u32)));
        }
    }

    /// Finds the rule node realising `rule` within `product`.
    pub fn rule_node_for(&self, product: ProductId, rule: &Arc<Rule>) -> Option<NodeId> {
        self.products[product.index()].nodes.iter().copied().find(|id| {
            self.try_node(*id)
                .and_then(Node::as_rule)
                .map_or(false, |data| same_rule(&data.rule, rule))
        })
    }

    /// Refreshes the cached timestamp of an artifact from disk.
    pub fn refresh_timestamp(&mut self, id: NodeId) -> FileTime {
        let Some(artifact) = self.artifact_mut(id) else { return FileTime::oldest() };
        artifact.timestamp = None;
        artifact.timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::file_tags;

    fn graph_with_product() -> BuildGraph {
        BuildGraph::new(1)
    }

    fn source(graph: &mut BuildGraph, path: &str, tags: &[&str]) -> NodeId {
        let mut artifact =
            Artifact::new(ProductId(0), ArtifactKind::SourceFile, PathBuf::from(path));
        artifact.file_tags = file_tags(tags.iter().copied());
        graph.insert_artifact(artifact).unwrap()
    }

    fn generated(graph: &mut BuildGraph, path: &str, tags: &[&str]) -> NodeId {
        let mut artifact =
            Artifact::new(ProductId(0), ArtifactKind::Generated, PathBuf::from(path));
        artifact.file_tags = file_tags(tags.iter().copied());
        graph.insert_artifact(artifact).unwrap()
    }

    #[test]
    fn edges_stay_bidirectional() {
        let mut graph = graph_with_product();
        let parent = generated(&mut graph, "/b/app", &["application"]);
        let child = source(&mut graph, "/s/main.c", &["c"]);
        graph.connect(parent, child).unwrap();
        assert!(graph.node(parent).children.contains(&child));
        assert!(graph.node(child).parents.contains(&parent));

        graph.disconnect(parent, child);
        assert!(graph.node(parent).children.is_empty());
        assert!(graph.node(child).parents.is_empty());
    }

    #[test]
    fn safe_connect_refuses_cycles() {
        let mut graph = graph_with_product();
        let a = generated(&mut graph, "/b/a", &["x"]);
        let b = generated(&mut graph, "/b/b", &["x"]);
        let c = generated(&mut graph, "/b/c", &["x"]);
        graph.connect(a, b).unwrap();
        graph.connect(b, c).unwrap();
        let err = graph.safe_connect(c, a).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cycle);
        // the offending edge was not added
        assert!(!graph.node(c).children.contains(&a));
    }

    #[test]
    fn generated_path_collisions_are_conflicts() {
        let mut graph = BuildGraph::new(2);
        let mut first =
            Artifact::new(ProductId(0), ArtifactKind::Generated, PathBuf::from("/b/lib.a"));
        first.file_tags = file_tags(["staticlibrary"]);
        graph.insert_artifact(first).unwrap();
        let second =
            Artifact::new(ProductId(1), ArtifactKind::Generated, PathBuf::from("/b/lib.a"));
        let err = graph.insert_artifact(second).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        // the same source file in two products is fine
        let src_a = Artifact::new(ProductId(0), ArtifactKind::SourceFile, "/s/a.c".into());
        let src_b = Artifact::new(ProductId(1), ArtifactKind::SourceFile, "/s/a.c".into());
        graph.insert_artifact(src_a).unwrap();
        graph.insert_artifact(src_b).unwrap();
    }

    #[test]
    fn tag_index_follows_tag_changes() {
        let mut graph = graph_with_product();
        let id = source(&mut graph, "/s/main.c", &["c"]);
        let tag = FileTag::new("c");
        assert!(graph.product_data(ProductId(0)).artifacts_by_file_tag(&tag).contains(&id));
        let version = graph.product_data(ProductId(0)).tag_index_version();

        graph.set_artifact_file_tags(id, file_tags(["objc"]));
        assert!(!graph.product_data(ProductId(0)).artifacts_by_file_tag(&tag).contains(&id));
        assert!(graph
            .product_data(ProductId(0))
            .artifacts_by_file_tag(&FileTag::new("objc"))
            .contains(&id));
        assert!(graph.product_data(ProductId(0)).tag_index_version() > version);
    }

    #[test]
    fn store_and_load_preserve_structure() {
        let mut graph = graph_with_product();
        let rule = Arc::new(Rule {
            name: "compiler".into(),
            inputs: file_tags(["c"]),
            output_file_tags: file_tags(["obj"]),
            requires_inputs: true,
            ..Default::default()
        });
        let src = source(&mut graph, "/s/main.c", &["c"]);
        let rule_node = graph.create_rule_node(ProductId(0), rule.clone());
        let out = generated(&mut graph, "/b/main.o", &["obj"]);
        let mut transformer = Transformer::new(rule, ProductId(0));
        transformer.inputs.insert(src);
        transformer.outputs.insert(out);
        let tid = graph.add_transformer(transformer);
        graph.artifact_mut(out).unwrap().transformer = Some(tid);
        graph.connect(out, src).unwrap();
        graph.connect(out, rule_node).unwrap();
        graph.connect(rule_node, src).unwrap();
        let dep = graph.add_file_dependency(PathBuf::from("/usr/include/stdio.h"));
        graph.artifact_mut(out).unwrap().file_dependencies.insert(dep);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.bg");
        let mut writer = crate::pool::PoolWriter::new(&serde_json::json!({"p": 1}));
        graph.store(&mut writer).unwrap();
        writer.commit(&path).unwrap();

        let (mut reader, _) = crate::pool::PoolReader::open(&path).unwrap();
        let loaded = BuildGraph::load(&mut reader).unwrap();

        // parents were rebuilt from children
        assert!(loaded.node(src).parents.contains(&out));
        assert!(loaded.node(src).parents.contains(&rule_node));
        assert!(loaded.node(out).children.contains(&src));
        let loaded_out = loaded.artifact(out).unwrap();
        assert_eq!(loaded_out.transformer, Some(tid));
        assert!(loaded_out.file_dependencies.contains(&dep));
        let loaded_transformer = loaded.transformer(tid);
        assert!(loaded_transformer.outputs.contains(&out));
        // the rule is shared between the rule node and the transformer
        let loaded_rule_node = loaded.node(rule_node).as_rule().unwrap();
        assert!(same_rule(&loaded_transformer.rule, &loaded_rule_node.rule));
        // the registry answers lookups again
        assert_eq!(loaded.lookup_artifact(ProductId(0), Path::new("/b/main.o")), Some(out));
        assert_eq!(
            loaded.lookup_file_dependency(Path::new("/usr/include/stdio.h")),
            Some(dep)
        );
    }

    #[test]
    fn exclusive_dependents_cascade() {
        let mut graph = graph_with_product();
        let rule = Arc::new(Rule { name: "link".into(), ..Default::default() });
        let src = source(&mut graph, "/s/main.c", &["c"]);
        let obj = generated(&mut graph, "/b/main.o", &["obj"]);
        let app = generated(&mut graph, "/b/app", &["application"]);
        let mut t1 = Transformer::new(rule.clone(), ProductId(0));
        t1.inputs.insert(src);
        t1.outputs.insert(obj);
        let t1 = graph.add_transformer(t1);
        graph.artifact_mut(obj).unwrap().transformer = Some(t1);
        let mut t2 = Transformer::new(rule, ProductId(0));
        t2.inputs.insert(obj);
        t2.outputs.insert(app);
        let t2 = graph.add_transformer(t2);
        graph.artifact_mut(app).unwrap().transformer = Some(t2);
        graph.connect(obj, src).unwrap();
        graph.connect(app, obj).unwrap();

        let mut removed = Vec::new();
        graph.remove_artifact_and_exclusive_dependents(src, &mut removed);
        let removed_paths: Vec<_> =
            removed.iter().map(|(_, p)| p.display().to_string()).collect();
        // the source is not reported for disk removal, its generated
        // descendants are
        assert_eq!(removed_paths, ["/b/main.o", "/b/app"]);
        assert!(graph.try_node(src).is_none());
        assert!(graph.try_node(obj).is_none());
        assert!(graph.try_node(app).is_none());
    }
}
