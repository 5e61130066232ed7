//! The rule-application engine.
//!
//! Applying a rule node expands its rule over the current set of
//! compatible inputs: output artifacts are created or reused, conflicts
//! detected, and the prepare script turns into the transformer's command
//! list. The entry point is [`apply_rule_node`], driven by the executor
//! whenever a rule node becomes buildable.

use crate::{
    clean,
    commands::{commands_from_script_value, Command},
    error::{Error, ErrorKind, Result},
    graph::{
        Artifact, ArtifactKind, BuildGraph, Node, NodeId, TrackedInputs, Transformer,
        TransformerId,
    },
    language::{
        same_rule, FileTag, FileTags, JsonMap, JsonValue, ProductId, Rule, RuleArtifact,
        TopLevelProject,
    },
    script::{EvalContext, ScriptRuntime},
    tracker,
    utils::{self, FileTime},
};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::Arc,
};

/// What one rule-node application did to the graph.
#[derive(Debug, Default)]
pub struct ApplicationResult {
    pub created_artifacts: Vec<NodeId>,
    pub invalidated_artifacts: Vec<NodeId>,
    /// Artifacts removed because their inputs disappeared; already deleted
    /// from graph and disk.
    pub removed_artifacts: Vec<PathBuf>,
}

/// Computes the rule's compatible inputs from the product's tag index,
/// honouring excluded inputs and skipping this rule's own outputs.
pub fn current_input_artifacts(
    graph: &BuildGraph,
    project: &TopLevelProject,
    product: ProductId,
    rule: &Arc<Rule>,
) -> BTreeSet<NodeId> {
    let mut set = BTreeSet::new();
    let data = graph.product_data(product);
    for tag in &rule.inputs {
        for id in data.artifacts_by_file_tag(tag) {
            let Some(artifact) = graph.artifact(id) else { continue };
            if artifact
                .transformer
                .map_or(false, |t| same_rule(&graph.transformer(t).rule, rule))
            {
                continue;
            }
            if artifact.file_tags.iter().any(|t| rule.excluded_inputs.contains(t)) {
                continue;
            }
            set.insert(id);
        }
    }
    if rule.inputs_from_dependencies.is_empty() {
        return set;
    }
    for dep in project.dependency_ids(product) {
        let dep_data = graph.product_data(dep);
        for tag in &rule.inputs_from_dependencies {
            for id in dep_data.artifacts_by_file_tag(tag) {
                let Some(artifact) = graph.artifact(id) else { continue };
                if artifact.file_tags.iter().any(|t| rule.excluded_inputs.contains(t)) {
                    continue;
                }
                set.insert(id);
            }
        }
    }
    set
}

/// Artifacts matching the rule's `explicitlyDependsOn` tags, in the
/// product itself and in its dependencies.
pub fn collect_explicitly_depends_on(
    graph: &BuildGraph,
    project: &TopLevelProject,
    product: ProductId,
    rule: &Arc<Rule>,
) -> BTreeSet<NodeId> {
    collect_by_tags(graph, project, product, &rule.explicitly_depends_on, true)
}

pub fn collect_auxiliary_inputs(
    graph: &BuildGraph,
    project: &TopLevelProject,
    product: ProductId,
    rule: &Arc<Rule>,
) -> BTreeSet<NodeId> {
    collect_by_tags(graph, project, product, &rule.auxiliary_inputs, false)
}

fn collect_by_tags(
    graph: &BuildGraph,
    project: &TopLevelProject,
    product: ProductId,
    tags: &FileTags,
    include_dependencies: bool,
) -> BTreeSet<NodeId> {
    let mut set = BTreeSet::new();
    let data = graph.product_data(product);
    for tag in tags {
        set.extend(data.artifacts_by_file_tag(tag));
        if include_dependencies {
            for dep in project.dependency_ids(product) {
                set.extend(graph.product_data(dep).artifacts_by_file_tag(tag));
            }
        }
    }
    set
}

/// Re-evaluates one rule node against the current graph, applying the
/// rule if anything relevant changed since the last application.
pub fn apply_rule_node(
    graph: &mut BuildGraph,
    project: &TopLevelProject,
    rule_node_id: NodeId,
    runtime: &mut dyn ScriptRuntime,
) -> Result<ApplicationResult> {
    let (product, rule) = {
        let data = graph
            .node(rule_node_id)
            .as_rule()
            .ok_or_else(|| Error::internal("apply_rule_node on an artifact node"))?;
        (data.product, data.rule.clone())
    };

    let all_compatible_inputs = current_input_artifacts(graph, project, product, &rule);
    let explicitly_depends_on = collect_explicitly_depends_on(graph, project, product, &rule);
    let auxiliary_inputs = collect_auxiliary_inputs(graph, project, product, &rule);

    let (old_inputs, old_edo, old_aux, last_application_time, consider_changed) = {
        let data = graph.node(rule_node_id).as_rule().unwrap();
        (
            data.old_input_artifacts.clone(),
            data.old_explicitly_depends_on.clone(),
            data.old_auxiliary_inputs.clone(),
            data.last_application_time,
            data.needs_to_consider_changed_inputs,
        )
    };

    let added_inputs: BTreeSet<NodeId> =
        all_compatible_inputs.difference(&old_inputs.artifacts).copied().collect();
    let removed_inputs: BTreeSet<NodeId> =
        old_inputs.artifacts.difference(&all_compatible_inputs).copied().collect();
    let changed_inputs = changed_input_artifacts(
        graph,
        &all_compatible_inputs,
        &explicitly_depends_on,
        &auxiliary_inputs,
        &old_edo,
        &old_aux,
        last_application_time,
        consider_changed,
    );
    let mut up_to_date = changed_inputs.is_empty()
        && added_inputs.is_empty()
        && removed_inputs.is_empty()
        && !old_inputs.contains_removed;

    debug!(
        "consider {}rule {} (compatible: {}, added: {}, removed: {}, changed: {})",
        if rule.multiplex { "multiplex " } else { "" },
        rule,
        all_compatible_inputs.len(),
        added_inputs.len(),
        removed_inputs.len(),
        changed_inputs.len()
    );

    let mut inputs: BTreeSet<NodeId> = if rule.multiplex {
        all_compatible_inputs.clone()
    } else {
        changed_inputs.union(&added_inputs).copied().collect()
    };

    // a stale prepare script pulls its inputs back in
    for input in &all_compatible_inputs {
        let mut found = false;
        for parent in graph.node(*input).parents.clone() {
            let Some(output) = graph.try_node(parent).and_then(Node::as_artifact) else {
                continue;
            };
            let Some(tid) = output.transformer else { continue };
            let transformer = graph.transformer(tid);
            if !same_rule(&transformer.rule, &rule) {
                continue;
            }
            found = true;
            if tracker::prepare_script_needs_rerun(graph, project, transformer) {
                up_to_date = false;
                inputs.insert(*input);
            }
            break;
        }
        if rule.multiplex && found {
            break;
        }
    }

    // rules without declared inputs re-run iff they have no outputs yet or
    // their prepare script went stale
    if up_to_date && (!rule.declares_inputs() || !rule.requires_inputs) && inputs.is_empty() {
        let mut has_outputs = false;
        for parent in graph.node(rule_node_id).parents.clone() {
            let Some(output) = graph.try_node(parent).and_then(Node::as_artifact) else {
                continue;
            };
            let Some(tid) = output.transformer else { continue };
            let transformer = graph.transformer(tid);
            if !same_rule(&transformer.rule, &rule) {
                continue;
            }
            has_outputs = true;
            if tracker::prepare_script_needs_rerun(graph, project, transformer) {
                up_to_date = false;
                break;
            }
            if rule.multiplex {
                break;
            }
        }
        if !has_outputs {
            up_to_date = false;
        }
    }

    if up_to_date {
        trace!("rule {} is up to date", rule);
        return Ok(ApplicationResult::default());
    }

    let must_apply_rule =
        !inputs.is_empty() || !rule.declares_inputs() || !rule.requires_inputs;

    // For a non-multiplex rule the removal of an input removes the
    // corresponding outputs. For a multiplex rule the outputs only vanish
    // when all inputs are gone and the rule requires inputs.
    let removed_input_forces_output_removal = !rule.multiplex || !must_apply_rule;
    let mut outputs_to_remove = BTreeSet::new();
    let mut connections_to_break = Vec::new();
    for removed in &removed_inputs {
        for parent in graph.node(*removed).parents.clone() {
            let Some(output) = graph.try_node(parent).and_then(Node::as_artifact) else {
                continue;
            };
            let Some(tid) = output.transformer else { continue };
            if !same_rule(&graph.transformer(tid).rule, &rule) {
                continue;
            }
            if removed_input_forces_output_removal {
                outputs_to_remove.insert(parent);
            } else {
                connections_to_break.push((parent, *removed));
            }
        }
        graph.disconnect(rule_node_id, *removed);
    }
    for (parent, child) in connections_to_break {
        graph.disconnect(parent, child);
    }
    let mut result = ApplicationResult::default();
    if !outputs_to_remove.is_empty() {
        handle_removed_rule_outputs(graph, project, &inputs, outputs_to_remove, &mut result)?;
    }

    if must_apply_rule {
        let mut applicator = RulesApplicator::new(graph, project, product, rule.clone(), runtime);
        applicator.apply_rule(rule_node_id, &inputs, &explicitly_depends_on)?;
        let rule_uses_io = applicator.rule_uses_io;
        result.created_artifacts = applicator.created;
        result.invalidated_artifacts = applicator.invalidated;
        if let Some(data) = graph.node_mut(rule_node_id).as_rule_mut() {
            data.last_application_time = FileTime::now();
            if rule_uses_io {
                data.needs_to_consider_changed_inputs = true;
            }
        }
    } else {
        trace!("prepare script of {} does not need to run", rule);
    }

    // inputs are children of the rule node, so the scheduler re-considers
    // the rule after any of them was rebuilt
    for input in &all_compatible_inputs {
        graph.connect(rule_node_id, *input)?;
    }

    if let Some(data) = graph.node_mut(rule_node_id).as_rule_mut() {
        data.old_input_artifacts = TrackedInputs::capture(all_compatible_inputs);
        data.old_explicitly_depends_on = TrackedInputs::capture(explicitly_depends_on);
        data.old_auxiliary_inputs = TrackedInputs::capture(auxiliary_inputs);
    }
    graph.set_dirty();
    Ok(result)
}

/// Makes every rule node consuming one of `artifacts` aware of it by
/// adding the corresponding child edge. Called for freshly created
/// artifacts so that downstream rules see them on this very build.
pub fn connect_rule_nodes_to_artifacts(
    graph: &mut BuildGraph,
    project: &TopLevelProject,
    artifacts: &[NodeId],
) -> Result<()> {
    for id in artifacts {
        let Some(artifact) = graph.artifact(*id) else { continue };
        let tags = artifact.file_tags.clone();
        let origin = artifact.product;
        for index in 0..project.products.len() {
            let product = ProductId(index as u32);
            let rule_nodes: Vec<(NodeId, Arc<Rule>)> = graph
                .product_data(product)
                .nodes
                .iter()
                .filter_map(|n| {
                    graph.try_node(*n).and_then(Node::as_rule).map(|d| (*n, d.rule.clone()))
                })
                .collect();
            for (rule_node, rule) in rule_nodes {
                let consuming_tags = if product == origin {
                    &rule.inputs
                } else if project.dependency_ids(product).contains(&origin) {
                    &rule.inputs_from_dependencies
                } else {
                    continue;
                };
                let matches = tags.iter().any(|t| consuming_tags.contains(t))
                    && !tags.iter().any(|t| rule.excluded_inputs.contains(t));
                // a rule never consumes its own outputs
                let own_output = graph
                    .artifact(*id)
                    .and_then(|a| a.transformer)
                    .map_or(false, |t| same_rule(&graph.transformer(t).rule, &rule));
                if matches && !own_output {
                    graph.safe_connect(rule_node, *id)?;
                }
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn changed_input_artifacts(
    graph: &mut BuildGraph,
    all_compatible_inputs: &BTreeSet<NodeId>,
    explicitly_depends_on: &BTreeSet<NodeId>,
    auxiliary_inputs: &BTreeSet<NodeId>,
    old_edo: &TrackedInputs,
    old_aux: &TrackedInputs,
    last_application_time: FileTime,
    consider_changed: bool,
) -> BTreeSet<NodeId> {
    if old_edo.differs_from(explicitly_depends_on) {
        return all_compatible_inputs.clone();
    }
    if !consider_changed {
        return BTreeSet::new();
    }
    for id in explicitly_depends_on {
        if artifact_timestamp(graph, *id) > last_application_time {
            return all_compatible_inputs.clone();
        }
    }
    if old_aux.differs_from(auxiliary_inputs) {
        return all_compatible_inputs.clone();
    }
    for id in auxiliary_inputs {
        if artifact_timestamp(graph, *id) > last_application_time {
            return all_compatible_inputs.clone();
        }
    }
    let mut changed = BTreeSet::new();
    for id in all_compatible_inputs {
        if artifact_timestamp(graph, *id) > last_application_time {
            changed.insert(*id);
        }
    }
    changed
}

fn artifact_timestamp(graph: &mut BuildGraph, id: NodeId) -> FileTime {
    graph.artifact_mut(id).map(Artifact::timestamp).unwrap_or_else(FileTime::oldest)
}

/// Removes outputs whose inputs disappeared, plus everything that only
/// existed because of them; files are deleted from disk and empty parent
/// directories pruned.
fn handle_removed_rule_outputs(
    graph: &mut BuildGraph,
    project: &TopLevelProject,
    input_artifacts: &BTreeSet<NodeId>,
    outputs_to_remove: BTreeSet<NodeId>,
    result: &mut ApplicationResult,
) -> Result<()> {
    let build_dirs = clean::generated_base_dirs(project);
    let mut removed = Vec::new();
    for output in outputs_to_remove {
        debug!(
            "rule application removes output artifact {:?}",
            graph.artifact(output).map(|a| a.file_path.clone())
        );
        graph.remove_artifact_and_exclusive_dependents(output, &mut removed);
    }
    let mut removed_paths = Vec::new();
    for (id, path) in removed {
        if input_artifacts.contains(&id) {
            return Err(Error::internal(format!(
                "removed rule output '{}' is still an input",
                path.display()
            )));
        }
        clean::remove_generated_artifact_from_disk(&path)?;
        removed_paths.push(path);
    }
    clean::remove_empty_parent_directories(&removed_paths, &build_dirs);
    result.removed_artifacts.extend(removed_paths);
    Ok(())
}

struct RulesApplicator<'a> {
    graph: &'a mut BuildGraph,
    project: &'a TopLevelProject,
    product: ProductId,
    rule: Arc<Rule>,
    runtime: &'a mut dyn ScriptRuntime,
    complete_input_set: BTreeSet<NodeId>,
    created: Vec<NodeId>,
    invalidated: Vec<NodeId>,
    rule_uses_io: bool,
}

impl<'a> RulesApplicator<'a> {
    fn new(
        graph: &'a mut BuildGraph,
        project: &'a TopLevelProject,
        product: ProductId,
        rule: Arc<Rule>,
        runtime: &'a mut dyn ScriptRuntime,
    ) -> Self {
        Self {
            graph,
            project,
            product,
            rule,
            runtime,
            complete_input_set: BTreeSet::new(),
            created: Vec::new(),
            invalidated: Vec::new(),
            rule_uses_io: false,
        }
    }

    fn apply_rule(
        &mut self,
        rule_node_id: NodeId,
        inputs: &BTreeSet<NodeId>,
        explicitly_depends_on: &BTreeSet<NodeId>,
    ) -> Result<()> {
        if inputs.is_empty() && self.rule.declares_inputs() && self.rule.requires_inputs {
            return Ok(());
        }
        self.complete_input_set = inputs.clone();
        // a rule without declared inputs runs once, like a multiplex rule
        if self.rule.multiplex || !self.rule.declares_inputs() {
            self.do_apply(rule_node_id, inputs.clone(), explicitly_depends_on)?;
        } else {
            for input in inputs {
                self.do_apply(
                    rule_node_id,
                    BTreeSet::from([*input]),
                    explicitly_depends_on,
                )?;
            }
        }
        Ok(())
    }

    fn do_apply(
        &mut self,
        rule_node_id: NodeId,
        inputs: BTreeSet<NodeId>,
        explicitly_depends_on: &BTreeSet<NodeId>,
    ) -> Result<()> {
        debug!("apply rule {} to {} input(s)", self.rule, inputs.len());

        let mut transformer = Transformer::new(self.rule.clone(), self.product);
        transformer.inputs = inputs.clone();
        transformer.explicitly_depends_on = explicitly_depends_on.clone();
        let mut prepare_obs = crate::script::EvalObservations::default();

        let mut ctx = self.eval_context(&inputs, explicitly_depends_on);

        struct PlannedOutput {
            id: NodeId,
            previous_transformer: Option<TransformerId>,
        }
        let mut planned: Vec<PlannedOutput> = Vec::new();
        let mut output_json = Vec::new();

        if self.rule.is_dynamic() {
            let script = self.rule.output_artifacts_script.clone().unwrap();
            let value = self.runtime.evaluate(&ctx, &script)?;
            let observations = self.runtime.take_observations();
            self.rule_uses_io |= observations.used_io;
            prepare_obs.merge(observations);
            let JsonValue::Array(items) = value else {
                return Err(Error::script(
                    "outputArtifacts script must return an array of objects",
                    script.location.clone(),
                ));
            };
            let mut new_outputs = BTreeSet::new();
            for item in &items {
                let (id, previous) =
                    self.create_output_from_value(item, &inputs, &script)?;
                new_outputs.insert(id);
                planned.push(PlannedOutput { id, previous_transformer: previous });
            }
            let old_outputs = self.collect_old_output_artifacts(&inputs);
            let vanished: BTreeSet<NodeId> =
                old_outputs.difference(&new_outputs).copied().collect();
            if !vanished.is_empty() {
                let mut result = ApplicationResult::default();
                handle_removed_rule_outputs(
                    self.graph,
                    self.project,
                    &self.complete_input_set,
                    vanished,
                    &mut result,
                )?;
            }
        } else {
            let mut output_file_paths = BTreeSet::new();
            for rule_artifact in self.rule.artifacts.clone() {
                let (id, previous) = self.create_output_from_rule_artifact(
                    &rule_artifact,
                    &inputs,
                    &mut prepare_obs,
                    &mut output_file_paths,
                    &mut ctx,
                )?;
                planned.push(PlannedOutput { id, previous_transformer: previous });
            }
        }

        if planned.is_empty() {
            return Ok(());
        }

        for output in &planned {
            for dependency in explicitly_depends_on {
                self.graph.connect(output.id, *dependency)?;
            }
            transformer.outputs.insert(output.id);
            output_json.push(self.artifact_json(output.id));
        }

        // a reused output keeps its predecessor's command change tracking
        if let Some(prev) = planned.iter().find_map(|o| o.previous_transformer) {
            let old = self.graph.transformer(prev).clone();
            transformer.rescue_change_tracking_data(&old);
        }

        // commands see the finished output set
        ctx.bind("outputs", JsonValue::Array(output_json.clone()));
        if let [single] = output_json.as_slice() {
            ctx.bind("output", single.clone());
        }

        let prepare = self.rule.prepare_script.clone();
        let value = self.runtime.evaluate(&ctx, &prepare)?;
        let observations = self.runtime.take_observations();
        self.rule_uses_io |= observations.used_io;
        prepare_obs.merge(observations);
        transformer.prepare_observations = prepare_obs;
        transformer.prepare_needs_change_tracking = true;
        transformer.last_prepare_execution_time = FileTime::now();
        let mut commands = commands_from_script_value(&value, &prepare.location)?;
        if commands.is_empty() {
            return Err(Error::script(
                format!("rule {} produced no commands", self.rule),
                prepare.location.clone(),
            ));
        }
        for command in &mut commands {
            if let Command::Process(process) = command {
                let env = &self.project.product_by_id(self.product).environment;
                process.captured_environment = process
                    .relevant_environment_keys
                    .iter()
                    .filter_map(|key| env.get(key).map(|v| (key.clone(), v.clone())))
                    .collect();
            }
        }
        transformer.commands = commands;

        let tid = self.graph.add_transformer(transformer);
        for output in &planned {
            if let Some(previous) = output.previous_transformer {
                if previous != tid {
                    self.graph.transformer_mut(previous).outputs.remove(&output.id);
                }
            }
            if let Some(artifact) = self.graph.artifact_mut(output.id) {
                artifact.transformer = Some(tid);
            }
            // rule node becomes a child of each output
            self.graph.connect(output.id, rule_node_id)?;
            self.reattach_rescue_data(output.id, tid)?;
        }
        Ok(())
    }

    /// If rescuable data for this output survived the last re-resolution,
    /// restore what keeps the artifact from looking dirty: its timestamp,
    /// the scanner-discovered edges, and, when the commands came out
    /// identical, the transformer's execution history.
    fn reattach_rescue_data(&mut self, output: NodeId, tid: TransformerId) -> Result<()> {
        let path = match self.graph.artifact(output) {
            Some(artifact) => artifact.file_path.clone(),
            None => return Ok(()),
        };
        let Some(rescue) =
            self.graph.product_data_mut(self.product).rescuable.remove(&path)
        else {
            return Ok(());
        };
        trace!("reattaching rescued data for '{}'", path.display());

        if let Some(artifact) = self.graph.artifact_mut(output) {
            artifact.timestamp = rescue.timestamp;
            artifact.old_data_possibly_present = true;
        }
        for child in &rescue.children {
            if !child.added_by_scanner {
                continue;
            }
            let Some(dep) = self
                .graph
                .lookup_artifact(self.product, &child.file_path)
                .or_else(|| self.graph.lookup_artifact_anywhere(&child.file_path))
            else {
                continue;
            };
            self.graph.safe_connect(output, dep)?;
            if let Some(artifact) = self.graph.artifact_mut(output) {
                artifact.children_added_by_scanner.insert(dep);
            }
        }
        for file_path in &rescue.file_dependencies {
            let dep = self.graph.add_file_dependency(file_path.clone());
            if let Some(artifact) = self.graph.artifact_mut(output) {
                artifact.file_dependencies.insert(dep);
            }
        }

        let transformer = self.graph.transformer_mut(tid);
        if rescue.commands == transformer.commands && !rescue.known_out_of_date {
            transformer.command_observations = rescue.command_observations;
            transformer.last_command_execution_time = rescue.last_command_execution_time;
            transformer.commands_need_change_tracking = rescue.commands_need_change_tracking;
        } else {
            debug!("rescued commands for '{}' differ, transformer will rerun", path.display());
            transformer.marked_for_rerun = true;
        }
        if rescue.rerun_on_always_run_change && rescue.always_run != transformer.always_run {
            debug!("alwaysRun changed for '{}', transformer will rerun once", path.display());
            transformer.marked_for_rerun = true;
        }
        Ok(())
    }

    fn create_output_from_rule_artifact(
        &mut self,
        rule_artifact: &RuleArtifact,
        inputs: &BTreeSet<NodeId>,
        prepare_obs: &mut crate::script::EvalObservations,
        output_file_paths: &mut BTreeSet<PathBuf>,
        ctx: &mut EvalContext,
    ) -> Result<(NodeId, Option<TransformerId>)> {
        let value = self.runtime.evaluate(ctx, &rule_artifact.file_path)?;
        let observations = self.runtime.take_observations();
        self.rule_uses_io |= observations.used_io;
        prepare_obs.merge(observations);
        let Some(path) = value.as_str() else {
            return Err(Error::script(
                "artifact filePath script must produce a string",
                rule_artifact.file_path.location.clone(),
            ));
        };
        let resolved = self.resolve_out_path(path);
        if !output_file_paths.insert(resolved.clone()) {
            return Err(Error::with_location(
                ErrorKind::Conflict,
                format!("rule {} already created '{}'", self.rule, resolved.display()),
                self.rule.location().clone(),
            ));
        }
        let (id, previous) = self.create_output_artifact(
            resolved,
            rule_artifact.file_tags.clone(),
            rule_artifact.always_updated,
            inputs,
        )?;

        // per-output bindings extend the module properties on a clone
        if !rule_artifact.bindings.is_empty() {
            let (file_path, file_tags, mut properties) = {
                let artifact = self.graph.artifact(id).unwrap();
                (
                    artifact.file_path.clone(),
                    artifact.file_tags.clone(),
                    artifact.properties.clone(),
                )
            };
            ctx.bind("fileName", JsonValue::String(file_path.to_string_lossy().into_owned()));
            ctx.bind(
                "fileTags",
                JsonValue::Array(
                    file_tags.iter().map(|t| JsonValue::String(t.to_string())).collect(),
                ),
            );
            for binding in &rule_artifact.bindings {
                let value = self.runtime.evaluate(ctx, &binding.code)?;
                let observations = self.runtime.take_observations();
                prepare_obs.merge(observations);
                let (module, path) = binding
                    .name
                    .split_first()
                    .ok_or_else(|| {
                        Error::script(
                            "artifact binding without a property name",
                            binding.code.location.clone(),
                        )
                    })?;
                properties = properties.with_module_property(module, path, value);
            }
            if let Some(artifact) = self.graph.artifact_mut(id) {
                artifact.properties = properties;
            }
        }
        Ok((id, previous))
    }

    fn create_output_from_value(
        &mut self,
        value: &JsonValue,
        inputs: &BTreeSet<NodeId>,
        script: &crate::language::ScriptSource,
    ) -> Result<(NodeId, Option<TransformerId>)> {
        let Some(obj) = value.as_object() else {
            return Err(Error::script(
                "outputArtifacts elements must be objects",
                script.location.clone(),
            ));
        };
        let Some(file_path) = obj.get("filePath").and_then(JsonValue::as_str) else {
            return Err(Error::script(
                "output artifact needs a 'filePath'",
                script.location.clone(),
            ));
        };
        let file_tags: FileTags = obj
            .get("fileTags")
            .and_then(JsonValue::as_array)
            .map(|tags| {
                tags.iter().filter_map(JsonValue::as_str).map(FileTag::new).collect()
            })
            .unwrap_or_default();
        let always_updated =
            obj.get("alwaysUpdated").and_then(JsonValue::as_bool).unwrap_or(true);
        let resolved = self.resolve_out_path(file_path);
        let (id, previous) =
            self.create_output_artifact(resolved, file_tags, always_updated, inputs)?;

        if let Some(tags) = obj.get("explicitlyDependsOn").and_then(JsonValue::as_array) {
            for tag in tags.iter().filter_map(JsonValue::as_str) {
                let dependencies = self
                    .graph
                    .product_data(self.product)
                    .artifacts_by_file_tag(&FileTag::new(tag));
                for dependency in dependencies {
                    self.graph.connect(id, dependency)?;
                }
            }
        }

        // remaining keys are nested module-property overrides
        const ARTIFACT_KEYS: [&str; 4] =
            ["filePath", "fileTags", "alwaysUpdated", "explicitlyDependsOn"];
        let mut properties = self.graph.artifact(id).unwrap().properties.clone();
        for (module, module_value) in obj {
            if ARTIFACT_KEYS.contains(&module.as_str()) {
                continue;
            }
            let Some(module_obj) = module_value.as_object() else { continue };
            let mut paths = Vec::new();
            flatten_overrides(module_obj, &mut Vec::new(), &mut paths);
            for (path, leaf) in paths {
                properties = properties.with_module_property(module, &path, leaf);
            }
        }
        if let Some(artifact) = self.graph.artifact_mut(id) {
            artifact.properties = properties;
        }
        Ok((id, previous))
    }

    /// Creates or reuses the output artifact at `file_path`, enforcing the
    /// conflict rules.
    fn create_output_artifact(
        &mut self,
        file_path: PathBuf,
        file_tags: FileTags,
        always_updated: bool,
        inputs: &BTreeSet<NodeId>,
    ) -> Result<(NodeId, Option<TransformerId>)> {
        let existing = self.graph.lookup_artifact(self.product, &file_path);
        let (id, previous_transformer) = match existing {
            Some(id) => {
                let previous = self.graph.artifact(id).and_then(|a| a.transformer);
                if let Some(prev_tid) = previous {
                    let prev = self.graph.transformer(prev_tid);
                    if !same_rule(&prev.rule, &self.rule) {
                        let tags = self
                            .graph
                            .artifact(id)
                            .map(|a| {
                                a.file_tags
                                    .iter()
                                    .map(FileTag::as_str)
                                    .collect::<Vec<_>>()
                                    .join(", ")
                            })
                            .unwrap_or_default();
                        return Err(Error::with_location(
                            ErrorKind::Conflict,
                            format!(
                                "conflicting rules for producing '{}' [{tags}]",
                                file_path.display()
                            ),
                            self.rule.location().clone(),
                        )
                        .append_located(
                            format!("while trying to apply rule {}", self.rule),
                            self.rule.location().clone(),
                        )
                        .append_located(
                            format!("it was already defined by rule {}", prev.rule),
                            prev.rule.location().clone(),
                        ));
                    }
                    if !self.rule.multiplex && prev.inputs != *inputs {
                        let prev_input = prev
                            .inputs
                            .iter()
                            .next()
                            .and_then(|i| self.graph.artifact(*i))
                            .map(|a| a.file_path.display().to_string())
                            .unwrap_or_default();
                        let new_input = inputs
                            .iter()
                            .next()
                            .and_then(|i| self.graph.artifact(*i))
                            .map(|a| a.file_path.display().to_string())
                            .unwrap_or_default();
                        return Err(Error::with_location(
                            ErrorKind::Conflict,
                            format!("conflicting instances of rule {}", self.rule),
                            self.rule.location().clone(),
                        )
                        .append(format!(
                            "output artifact '{}' is to be produced from input artifacts \
                             '{prev_input}' and '{new_input}', but the rule is not a multiplex rule",
                            file_path.display()
                        )));
                    }
                }
                if self.rule.declares_inputs() && self.rule.requires_inputs {
                    if let Some(artifact) = self.graph.artifact_mut(id) {
                        artifact.clear_timestamp();
                    }
                }
                self.invalidated.push(id);
                (id, previous)
            }
            None => {
                let mut artifact =
                    Artifact::new(self.product, ArtifactKind::Generated, file_path.clone());
                artifact.properties =
                    self.project.product_by_id(self.product).module_properties.clone();
                let id = match self.graph.insert_artifact(artifact) {
                    Ok(id) => id,
                    Err(err) if err.kind() == ErrorKind::Conflict => {
                        return Err(self.cross_product_conflict(err, &file_path));
                    }
                    Err(err) => return Err(err),
                };
                self.created.push(id);
                (id, None)
            }
        };

        self.graph.set_artifact_file_tags(id, file_tags);
        if let Some(artifact) = self.graph.artifact_mut(id) {
            artifact.always_updated = always_updated;
        }
        for input in inputs {
            if *input == id {
                return Err(Error::internal(format!(
                    "artifact '{}' cannot be its own input",
                    file_path.display()
                )));
            }
            self.graph.connect(id, *input)?;
        }
        Ok((id, previous_transformer))
    }

    /// Decorates a path conflict across products with both rule
    /// locations and the owning products.
    fn cross_product_conflict(&self, err: Error, file_path: &PathBuf) -> Error {
        let mut err = err.append_located(
            format!(
                "while applying rule {} in product '{}'",
                self.rule,
                self.project.product_by_id(self.product).name
            ),
            self.rule.location().clone(),
        );
        if let Some(other) = self.graph.lookup_artifact_anywhere(file_path) {
            if let Some(other_artifact) = self.graph.artifact(other) {
                let other_product = self.project.product_by_id(other_artifact.product);
                if let Some(tid) = other_artifact.transformer {
                    let other_rule = &self.graph.transformer(tid).rule;
                    err = err.append_located(
                        format!(
                            "the file is already produced by rule {} in product '{}'",
                            other_rule, other_product.name
                        ),
                        other_rule.location().clone(),
                    );
                }
            }
        }
        err
    }

    fn collect_old_output_artifacts(&self, inputs: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
        let mut result = BTreeSet::new();
        for input in inputs {
            for parent in &self.graph.node(*input).parents {
                let Some(artifact) = self.graph.try_node(*parent).and_then(Node::as_artifact)
                else {
                    continue;
                };
                let Some(tid) = artifact.transformer else { continue };
                let transformer = self.graph.transformer(tid);
                if same_rule(&transformer.rule, &self.rule)
                    && transformer.inputs.contains(input)
                {
                    result.insert(*parent);
                }
            }
        }
        result
    }

    /// Output paths may not escape the build directory.
    fn resolve_out_path(&self, path: &str) -> PathBuf {
        let sanitized = path.replace("..", "dotdot");
        let build_dir = &self.project.product_by_id(self.product).build_directory;
        utils::resolve_path(build_dir, sanitized)
    }

    fn artifact_json(&self, id: NodeId) -> JsonValue {
        artifact_to_json(self.graph, id)
    }

    fn eval_context(
        &self,
        inputs: &BTreeSet<NodeId>,
        explicitly_depends_on: &BTreeSet<NodeId>,
    ) -> EvalContext {
        let product = self.project.product_by_id(self.product);
        let mut ctx = EvalContext::default();
        ctx.current_product = product.name.clone();

        let all_inputs: Vec<JsonValue> =
            inputs.iter().map(|id| artifact_to_json(self.graph, *id)).collect();
        let mut inputs_by_tag: BTreeMap<String, Vec<JsonValue>> = BTreeMap::new();
        for (id, json) in inputs.iter().zip(&all_inputs) {
            if let Some(artifact) = self.graph.artifact(*id) {
                for tag in &artifact.file_tags {
                    inputs_by_tag.entry(tag.to_string()).or_default().push(json.clone());
                }
            }
        }
        ctx.bind(
            "inputs",
            JsonValue::Object(
                inputs_by_tag
                    .into_iter()
                    .map(|(tag, list)| (tag, JsonValue::Array(list)))
                    .collect(),
            ),
        );
        if let [single] = all_inputs.as_slice() {
            ctx.bind("input", single.clone());
        }
        ctx.bind("allInputs", JsonValue::Array(all_inputs));
        ctx.bind(
            "explicitlyDependsOn",
            JsonValue::Array(
                explicitly_depends_on
                    .iter()
                    .map(|id| artifact_to_json(self.graph, *id))
                    .collect(),
            ),
        );
        ctx.bind(
            "product",
            serde_json::json!({
                "name": product.name,
                "buildDirectory": product.build_directory.to_string_lossy(),
                "type": product
                    .product_file_tags
                    .iter()
                    .map(FileTag::as_str)
                    .collect::<Vec<_>>(),
                "modules": product.module_properties.value().get("modules").cloned(),
            }),
        );
        ctx.bind(
            "project",
            serde_json::json!({
                "buildDirectory": self.project.build_directory().to_string_lossy(),
                "configuration": self.project.build_configuration,
            }),
        );

        let data = self.graph.product_data(self.product);
        let mut artifacts_map = BTreeMap::new();
        let mut tags = BTreeSet::new();
        for id in &data.nodes {
            if let Some(artifact) = self.graph.artifact(*id) {
                tags.extend(artifact.file_tags.iter().cloned());
            }
        }
        for tag in tags {
            let ids = data.artifacts_by_file_tag(&tag);
            artifacts_map.insert(
                tag,
                ids.iter().map(|id| artifact_to_json(self.graph, *id)).collect(),
            );
        }
        ctx.artifacts_map = artifacts_map;

        for dep in self.project.dependency_ids(self.product) {
            let dep_product = self.project.product_by_id(dep);
            ctx.exports
                .insert(dep_product.name.clone(), dep_product.exported_modules.clone());
        }
        ctx
    }
}

/// Folds a nested override object into `(dotted path, leaf value)` pairs.
fn flatten_overrides(
    obj: &JsonMap,
    prefix: &mut Vec<String>,
    out: &mut Vec<(Vec<String>, JsonValue)>,
) {
    for (key, value) in obj {
        prefix.push(key.clone());
        match value.as_object() {
            Some(nested) if !nested.is_empty() => flatten_overrides(nested, prefix, out),
            _ => out.push((prefix.clone(), value.clone())),
        }
        prefix.pop();
    }
}

/// The script-visible shape of an artifact.
pub fn artifact_to_json(graph: &BuildGraph, id: NodeId) -> JsonValue {
    let Some(artifact) = graph.artifact(id) else { return JsonValue::Null };
    serde_json::json!({
        "filePath": artifact.file_path.to_string_lossy(),
        "fileName": artifact.file_name(),
        "baseName": utils::base_name(&artifact.file_path),
        "completeBaseName": utils::complete_base_name(&artifact.file_path),
        "fileTags": artifact.file_tags.iter().map(FileTag::as_str).collect::<Vec<_>>(),
        "modules": artifact.properties.value().get("modules").cloned(),
    })
}
