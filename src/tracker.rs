//! Change tracking and rescue.
//!
//! The setup path decides, trigger by trigger, whether the stored build
//! graph can be reused as-is, patched in place (source lists changed), or
//! must be rebuilt from a fresh resolve. Rebuilding captures rescuable
//! artifact data first so the new graph inherits timestamps, commands and
//! recorded property requests of transformers that did not really change.
//!
//! This module also owns transformer up-to-dateness: the recorded
//! observations of prepare scripts and commands are replayed against the
//! current project state.

use crate::{
    apply,
    clean,
    error::{Error, ErrorKind, Result},
    graph::{
        Artifact, ArtifactKind, BuildGraph, Node, NodeId, RescuableArtifactData, RescuedChild,
        Transformer,
    },
    language::{ProductId, ResolvedProduct, TopLevelProject},
    options::SetupParameters,
    pool::{PoolReader, PoolWriter},
    rulegraph::RuleGraph,
    script::{EvalObservations, PropertyRequest},
    utils,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Arc,
};

/// Supplies a freshly resolved project; the project-description parser
/// and evaluator live behind this seam.
pub trait ProjectResolver: Send {
    fn resolve(&mut self, params: &SetupParameters) -> Result<TopLevelProject>;
}

/// The in-memory result of a setup job.
#[derive(Debug)]
pub struct BuildData {
    pub project: TopLevelProject,
    pub graph: BuildGraph,
}

impl BuildData {
    /// The indented artifact tree of every product, for diagnostics.
    pub fn dump_nodes(&self) -> String {
        self.graph.dump_nodes(&self.project)
    }

    /// Persists project and graph into the pool file, single writer.
    pub fn store(&self) -> Result<()> {
        let mut writer = PoolWriter::new(&self.project.build_configuration);
        writer.write_value(&self.project)?;
        self.graph.store(&mut writer)?;
        writer.commit(&self.project.build_graph_file_path())
    }
}

/// How a product fared between the stored and the fresh project.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ProductState {
    Unchanged,
    FileListChanged,
    Changed,
    New,
}

/// Loads the stored build graph if it is still valid, otherwise resolves
/// and rebuilds, rescuing whatever survives.
pub fn setup_build_data(
    params: &SetupParameters,
    resolver: &mut dyn ProjectResolver,
) -> Result<BuildData> {
    let bg_path = params.build_graph_file_path();
    let loaded = match PoolReader::open(&bg_path) {
        Ok((mut reader, _stored_config)) => {
            let project: TopLevelProject = reader.read_value()?;
            let graph = BuildGraph::load(&mut reader)?;
            Some((project, graph))
        }
        Err(err) if err.kind() == ErrorKind::NoBuildGraph => None,
        Err(err)
            if matches!(err.kind(), ErrorKind::SchemaMismatch | ErrorKind::CorruptBuildGraph)
                && params.override_build_graph_data =>
        {
            info!("discarding stored build graph: {err}");
            None
        }
        Err(err) => return Err(err),
    };

    let Some((stored_project, mut graph)) = loaded else {
        debug!("no reusable build graph, resolving from scratch");
        let project = resolver.resolve(params)?;
        return build_fresh(project, BTreeMap::new());
    };

    if params.override_build_graph_data
        && params.build_configuration != stored_project.build_configuration
    {
        debug!("configuration override, resolving from scratch");
        let project = resolver.resolve(params)?;
        let rescue = capture_all_rescue_data(
            &stored_project,
            &mut graph,
            params.treat_always_run_change_as_rerun,
        );
        return build_fresh(project, rescue);
    }

    if let Some(reason) = re_resolution_trigger(params, &stored_project) {
        info!("project needs re-resolution: {reason}");
        let new_project = resolver.resolve(params)?;
        return track_project_changes(
            stored_project,
            graph,
            new_project,
            params.treat_always_run_change_as_rerun,
        );
    }

    trace!("stored build graph is up to date");
    let mut project = stored_project;
    reconcile_rules(&mut project, &graph);
    Ok(BuildData { project, graph })
}

/// Checks every condition that invalidates the stored project as a
/// whole; returns a description of the first one that fires.
fn re_resolution_trigger(params: &SetupParameters, stored: &TopLevelProject) -> Option<String> {
    if params.build_configuration != stored.build_configuration {
        return Some("the build configuration changed".into());
    }
    for (key, value) in &params.environment {
        if params.env_ignore_list.contains(key) {
            continue;
        }
        if stored.environment.get(key) != Some(value) {
            return Some(format!("environment variable '{key}' changed"));
        }
    }
    for key in stored.environment.keys() {
        if !params.env_ignore_list.contains(key) && !params.environment.contains_key(key) {
            return Some(format!("environment variable '{key}' was removed"));
        }
    }
    if params.force_probe_execution && !stored.probes.is_empty() {
        return Some("probe execution was forced".into());
    }
    if let Some(reason) = replay_fs_probes(stored) {
        return Some(reason);
    }
    for product in &stored.products {
        let defining_file = product.defining_file();
        if let Some(t) = utils::file_time(defining_file) {
            if t > stored.last_start_resolve_time {
                return Some(format!(
                    "project file '{}' is newer than the last resolve",
                    defining_file.display()
                ));
            }
        }
        if let Some(reason) = wildcard_sources_changed(product) {
            return Some(reason);
        }
    }
    for file in &stored.build_system_files {
        if utils::file_time(file).map_or(true, |t| t > stored.last_start_resolve_time) {
            return Some(format!("build system file '{}' changed", file.display()));
        }
    }
    for file in &stored.module_provider_files {
        if utils::file_time(file).map_or(true, |t| t > stored.last_end_resolve_time) {
            return Some(format!("module provider file '{}' changed", file.display()));
        }
    }
    None
}

fn replay_fs_probes(stored: &TopLevelProject) -> Option<String> {
    for (path, recorded) in &stored.fs_probes.canonical {
        let current = utils::canonicalize(path).ok();
        if &current != recorded {
            return Some(format!("canonical path of '{}' changed", path.display()));
        }
    }
    for (path, recorded) in &stored.fs_probes.exists {
        if path.exists() != *recorded {
            return Some(format!("existence of '{}' changed", path.display()));
        }
    }
    for (dir, recorded) in &stored.fs_probes.dir_entries {
        let mut entries: Vec<String> = std::fs::read_dir(dir)
            .map(|iter| {
                iter.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        entries.sort();
        if &entries != recorded {
            return Some(format!("directory contents of '{}' changed", dir.display()));
        }
    }
    for (path, recorded) in &stored.fs_probes.last_modified {
        let current = utils::file_time(path).unwrap_or_default();
        if current != *recorded {
            return Some(format!("last modification of '{}' changed", path.display()));
        }
    }
    None
}

/// Re-expands a product's wildcard groups and compares against the stored
/// source set.
fn wildcard_sources_changed(product: &ResolvedProduct) -> Option<String> {
    let base_dir = product.defining_file().parent().unwrap_or_else(|| Path::new("."));
    for group in &product.groups {
        if group.wildcards.is_empty() {
            continue;
        }
        let mut expanded = BTreeSet::new();
        for pattern in &group.wildcards {
            let full = utils::resolve_path(base_dir, format!("{}{}", group.prefix, pattern));
            if let Ok(paths) = glob::glob(&full.to_string_lossy()) {
                for path in paths.flatten() {
                    expanded.insert(path);
                }
            }
        }
        for pattern in &group.excluded_wildcards {
            let full = utils::resolve_path(base_dir, format!("{}{}", group.prefix, pattern));
            if let Ok(paths) = glob::glob(&full.to_string_lossy()) {
                for path in paths.flatten() {
                    expanded.remove(&path);
                }
            }
        }
        let stored: BTreeSet<PathBuf> = group.files.iter().cloned().collect();
        if expanded != stored {
            return Some(format!(
                "wildcard-expanded sources of group '{}' in product '{}' changed",
                group.name, product.name
            ));
        }
    }
    None
}

/// Classifies every product of the fresh project against the stored one
/// and picks the cheapest way to keep the graph correct.
fn track_project_changes(
    stored_project: TopLevelProject,
    mut graph: BuildGraph,
    new_project: TopLevelProject,
    rerun_on_always_run_change: bool,
) -> Result<BuildData> {
    let same_shape = stored_project.products.len() == new_project.products.len()
        && stored_project
            .products
            .iter()
            .zip(&new_project.products)
            .all(|(old, new)| old.name == new.name);

    let mut states: Vec<ProductState> = new_project
        .products
        .iter()
        .map(|new| match stored_project.product(&new.name) {
            None => ProductState::New,
            Some(old) => classify_product(old, new),
        })
        .collect();

    // a changed product makes its dependents changed as well; their
    // rescued inputs would otherwise look like brand-new artifacts
    loop {
        let mut progressed = false;
        for index in 0..new_project.products.len() {
            if states[index] == ProductState::Changed {
                continue;
            }
            let deps = new_project.dependency_ids(ProductId(index as u32));
            if deps.iter().any(|d| {
                matches!(states[d.index()], ProductState::Changed | ProductState::New)
            }) {
                states[index] = ProductState::Changed;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    let only_file_lists_changed = same_shape
        && states
            .iter()
            .all(|s| matches!(s, ProductState::Unchanged | ProductState::FileListChanged));

    if only_file_lists_changed {
        for (index, state) in states.iter().enumerate() {
            if *state != ProductState::FileListChanged {
                continue;
            }
            let product = ProductId(index as u32);
            apply_file_list_changes(
                &mut graph,
                &new_project,
                product,
                &stored_project.products[index],
            )?;
        }
        let mut project = new_project;
        reconcile_rules(&mut project, &graph);
        return Ok(BuildData { project, graph });
    }

    info!("project structure changed, rebuilding build data with rescue");
    let rescue =
        capture_all_rescue_data(&stored_project, &mut graph, rerun_on_always_run_change);
    build_fresh(new_project, rescue)
}

fn classify_product(old: &ResolvedProduct, new: &ResolvedProduct) -> ProductState {
    let rules_equal = old.rules.len() == new.rules.len()
        && old.rules.iter().zip(&new.rules).all(|(a, b)| **a == **b);
    if !rules_equal
        || old.module_properties != new.module_properties
        || old.dependencies != new.dependencies
        || old.product_file_tags != new.product_file_tags
        || old.exported_modules != new.exported_modules
        || old.scanners.len() != new.scanners.len()
        || old.environment != new.environment
    {
        return ProductState::Changed;
    }
    if old.sources != new.sources {
        // tags or properties of a kept source changing is more than a
        // file-list edit
        let old_paths = old.source_file_set();
        let new_paths = new.source_file_set();
        let kept_equal = old
            .sources
            .iter()
            .filter(|s| new_paths.contains(&s.file_path))
            .all(|s| new.sources.iter().any(|n| *n == *s));
        let added_or_removed = old_paths != new_paths;
        if kept_equal && added_or_removed {
            return ProductState::FileListChanged;
        }
        return ProductState::Changed;
    }
    ProductState::Unchanged
}

/// Adds new source artifacts and removes vanished ones in place,
/// including the generated descendants of the latter.
fn apply_file_list_changes(
    graph: &mut BuildGraph,
    project: &TopLevelProject,
    product: ProductId,
    old_product: &ResolvedProduct,
) -> Result<()> {
    let new_product = project.product_by_id(product);
    let old_paths = old_product.source_file_set();
    let new_paths = new_product.source_file_set();

    let mut created = Vec::new();
    for source in &new_product.sources {
        if old_paths.contains(&source.file_path) {
            continue;
        }
        debug!("project file change adds source file {}", source.file_path.display());
        let mut artifact =
            Artifact::new(product, ArtifactKind::SourceFile, source.file_path.clone());
        artifact.file_tags = source.file_tags.clone();
        artifact.properties = source.properties.clone();
        created.push(graph.insert_artifact(artifact)?);
    }
    apply::connect_rule_nodes_to_artifacts(graph, project, &created)?;

    let build_dirs = clean::generated_base_dirs(project);
    let mut removed = Vec::new();
    for path in old_paths.difference(&new_paths) {
        debug!("project file change removes source file {}", path.display());
        let Some(id) = graph.lookup_artifact(product, path) else { continue };
        // drops the source node and every generated artifact that only
        // existed because of it; a multiplex output with other inputs
        // left merely gets marked for rerun
        graph.remove_artifact_and_exclusive_dependents(id, &mut removed);
    }
    let mut removed_paths = Vec::new();
    for (_, path) in removed {
        clean::remove_generated_artifact_from_disk(&path)?;
        removed_paths.push(path);
    }
    clean::remove_empty_parent_directories(&removed_paths, &build_dirs);
    graph.set_dirty();
    Ok(())
}

/// Captures rescuable data for every generated artifact, keyed per
/// product name.
fn capture_all_rescue_data(
    project: &TopLevelProject,
    graph: &mut BuildGraph,
    rerun_on_always_run_change: bool,
) -> BTreeMap<String, BTreeMap<PathBuf, RescuableArtifactData>> {
    let mut all: BTreeMap<String, BTreeMap<PathBuf, RescuableArtifactData>> = BTreeMap::new();
    for (index, product) in project.products.iter().enumerate() {
        let product_id = ProductId(index as u32);
        let ids: Vec<NodeId> =
            graph.product_data(product_id).nodes.iter().copied().collect();
        let mut per_product = BTreeMap::new();
        for id in ids {
            let Some(artifact) = graph.artifact(id) else { continue };
            if !artifact.is_generated() {
                continue;
            }
            let Some(tid) = artifact.transformer else { continue };
            let children: Vec<RescuedChild> = graph
                .node(id)
                .children
                .iter()
                .filter_map(|child| {
                    let node = graph.try_node(*child)?;
                    let child_artifact = node.as_artifact()?;
                    Some(RescuedChild {
                        file_path: child_artifact.file_path.clone(),
                        added_by_scanner: graph
                            .artifact(id)
                            .map_or(false, |a| a.children_added_by_scanner.contains(child)),
                    })
                })
                .collect();
            let file_dependencies = artifact
                .file_dependencies
                .iter()
                .map(|dep| graph.file_dependency(*dep).file_path.clone())
                .collect();
            let transformer = graph.transformer(tid);
            per_product.insert(
                artifact.file_path.clone(),
                RescuableArtifactData {
                    timestamp: artifact.timestamp,
                    known_out_of_date: transformer.marked_for_rerun,
                    file_tags: artifact.file_tags.clone(),
                    properties: artifact.properties.clone(),
                    commands: transformer.commands.clone(),
                    prepare_observations: transformer.prepare_observations.clone(),
                    command_observations: transformer.command_observations.clone(),
                    children,
                    file_dependencies,
                    last_command_execution_time: transformer.last_command_execution_time,
                    last_prepare_execution_time: transformer.last_prepare_execution_time,
                    prepare_needs_change_tracking: transformer.prepare_needs_change_tracking,
                    commands_need_change_tracking: transformer.commands_need_change_tracking,
                    marked_for_rerun: transformer.marked_for_rerun,
                    always_run: transformer.always_run,
                    rerun_on_always_run_change,
                },
            );
        }
        debug!("rescued data for {} artifacts of product '{}'", per_product.len(), product.name);
        all.insert(product.name.clone(), per_product);
    }
    all
}

/// Builds build data for every product of a freshly resolved project.
fn build_fresh(
    project: TopLevelProject,
    mut rescue: BTreeMap<String, BTreeMap<PathBuf, RescuableArtifactData>>,
) -> Result<BuildData> {
    let mut graph = BuildGraph::new(project.products.len());
    for index in 0..project.products.len() {
        let product = ProductId(index as u32);
        let name = &project.products[index].name;
        let product_rescue = rescue.remove(name).unwrap_or_default();
        build_product_data(&mut graph, &project, product, product_rescue)?;
    }
    graph.sanity_check(&project)?;
    Ok(BuildData { project, graph })
}

/// Creates source artifacts and the rule-node skeleton for one product.
pub fn build_product_data(
    graph: &mut BuildGraph,
    project: &TopLevelProject,
    product: ProductId,
    rescue: BTreeMap<PathBuf, RescuableArtifactData>,
) -> Result<()> {
    let desc = project.product_by_id(product);
    if !desc.enabled {
        return Ok(());
    }
    graph.product_data_mut(product).rescuable = rescue;

    let mut created = Vec::new();
    for source in &desc.sources {
        let mut artifact =
            Artifact::new(product, ArtifactKind::SourceFile, source.file_path.clone());
        artifact.file_tags = source.file_tags.clone();
        artifact.properties = source.properties.clone();
        created.push(graph.insert_artifact(artifact)?);
    }

    let rule_graph = RuleGraph::build(&desc.rules, &desc.product_file_tags);
    let mut pairs = Vec::new();
    rule_graph.traverse(&mut |parent, rule| {
        pairs.push((parent.cloned(), rule.clone()));
    })?;
    for (parent, rule) in pairs {
        let rule_node = match graph.rule_node_for(product, &rule) {
            Some(id) => id,
            None => graph.create_rule_node(product, rule.clone()),
        };
        match parent {
            None => {
                graph.product_data_mut(product).roots.insert(rule_node);
            }
            Some(parent_rule) => {
                let parent_node = graph
                    .rule_node_for(product, &parent_rule)
                    .ok_or_else(|| Error::internal("rule graph parent without a node"))?;
                graph.connect(parent_node, rule_node)?;
            }
        }
    }

    apply::connect_rule_nodes_to_artifacts(graph, project, &created)?;
    Ok(())
}

/// After a load, the project's rule `Arc`s are distinct from the ones the
/// graph restored. Downstream identity comparisons require sharing, so
/// point the project at the graph's instances.
pub fn reconcile_rules(project: &mut TopLevelProject, graph: &BuildGraph) {
    for (index, product) in project.products.iter_mut().enumerate() {
        let product_id = ProductId(index as u32);
        let graph_rules: Vec<Arc<crate::language::Rule>> = graph
            .product_data(product_id)
            .nodes
            .iter()
            .filter_map(|id| graph.try_node(*id))
            .filter_map(Node::as_rule)
            .map(|data| data.rule.clone())
            .collect();
        for rule in &mut product.rules {
            if let Some(shared) = graph_rules.iter().find(|g| {
                g.name == rule.name && g.prepare_script.location == rule.prepare_script.location
            }) {
                *rule = shared.clone();
            }
        }
    }
}

// ---------------------------------------------------------------------
// transformer up-to-dateness
// ---------------------------------------------------------------------

/// Whether the prepare script of `transformer` must run again because a
/// recorded dependency changed.
pub fn prepare_script_needs_rerun(
    graph: &BuildGraph,
    project: &TopLevelProject,
    transformer: &Transformer,
) -> bool {
    if transformer.always_run || transformer.marked_for_rerun {
        return true;
    }
    if !transformer.prepare_needs_change_tracking {
        return false;
    }
    !observations_up_to_date(
        graph,
        project,
        transformer.product,
        &transformer.prepare_observations,
        transformer.last_prepare_execution_time,
    )
}

/// Whether the recorded command-side dependencies of `transformer` went
/// stale.
pub fn commands_need_rerun(
    graph: &BuildGraph,
    project: &TopLevelProject,
    transformer: &Transformer,
) -> bool {
    if transformer.always_run || transformer.marked_for_rerun {
        return true;
    }
    if !transformer.commands_need_change_tracking {
        return false;
    }
    !observations_up_to_date(
        graph,
        project,
        transformer.product,
        &transformer.command_observations,
        transformer.last_command_execution_time,
    )
}

fn observations_up_to_date(
    graph: &BuildGraph,
    project: &TopLevelProject,
    product: ProductId,
    observations: &EvalObservations,
    reference_time: crate::utils::FileTime,
) -> bool {
    for request in &observations.properties_requested {
        if current_property_value(project, product, request) != request.value {
            trace!(
                "property {}.{} changed since last execution",
                request.module,
                request.path.join(".")
            );
            return false;
        }
    }
    for request in &observations.properties_requested_from_artifact {
        let current = graph
            .lookup_artifact_anywhere(&request.artifact)
            .and_then(|id| graph.artifact(id))
            .and_then(|a| a.properties.module_property(&request.request.module, &request.request.path))
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        if current != request.request.value {
            return false;
        }
    }
    for file in &observations.imported_files_used {
        if utils::file_time(file).map_or(true, |t| t > reference_time) {
            trace!("imported file '{}' changed", file.display());
            return false;
        }
    }
    for request in &observations.requested_dependencies {
        if project.product(&request.product).is_some() != request.found {
            return false;
        }
    }
    for request in &observations.requested_exports {
        let current = project
            .product(&request.product)
            .map(|p| p.exported_modules.clone())
            .unwrap_or_default();
        if current != request.exported_modules {
            return false;
        }
    }
    for request in &observations.requested_artifacts {
        let product_id = if request.product.is_empty() {
            Some(product)
        } else {
            project.product_id(&request.product)
        };
        let Some(product_id) = product_id else { return false };
        let current: BTreeSet<PathBuf> = graph
            .product_data(product_id)
            .artifacts_by_file_tag(&request.tag)
            .iter()
            .filter_map(|id| graph.artifact(*id))
            .map(|a| a.file_path.clone())
            .collect();
        if current != request.file_paths {
            trace!("artifacts map for tag '{}' changed", request.tag);
            return false;
        }
    }
    true
}

fn current_property_value(
    project: &TopLevelProject,
    product: ProductId,
    request: &PropertyRequest,
) -> serde_json::Value {
    if request.module == "project" {
        let current = serde_json::json!({
            "buildDirectory": project.build_directory().to_string_lossy(),
            "configuration": project.build_configuration,
        });
        let mut value = &current;
        for key in &request.path {
            match value.get(key) {
                Some(next) => value = next,
                None => return serde_json::Value::Null,
            }
        }
        return value.clone();
    }
    let desc = if request.product.is_empty() {
        project.product_by_id(product)
    } else {
        match project.product(&request.product) {
            Some(p) => p,
            None => return serde_json::Value::Null,
        }
    };
    desc.module_properties
        .module_property(&request.module, &request.path)
        .cloned()
        .unwrap_or(serde_json::Value::Null)
}
