//! Parallel DAG traversal.
//!
//! The executor owns the only mutable view of the graph. It walks the
//! scheduled nodes leaves-first: rule nodes are applied inline (they
//! mutate the graph), transformers whose outputs went stale are handed to
//! a worker pool, and readiness propagates upwards as children finish.
//! Job pools bound the concurrency of commands declaring them; a shared
//! atomic flag makes cancellation advisory but prompt.

pub mod process;
pub mod script;

pub use process::{
    execute_process_command, process_failure_error, ProcessHandle, ProcessHost, ProcessResult,
    SystemProcessHost,
};
pub use script::{apply_file_operations, ScriptCommandExecutor, ScriptExecutorHandle};

use crate::{
    apply::{self, artifact_to_json},
    clean,
    commands::{Command, CommandEchoMode},
    error::{Error, Result},
    graph::{BuildGraph, BuildState, Node, NodeId, TransformerId},
    language::{FileTag, ProductId, TopLevelProject},
    options::BuildOptions,
    scanner::{InputArtifactScanner, ScannerRegistry},
    script::{EvalContext, EvalObservations, ScriptRuntime},
    tracker,
    utils::{self, FileTime},
};
use parking_lot::{Condvar, Mutex};
use std::{
    cmp::Reverse,
    collections::{BTreeMap, BTreeSet, BinaryHeap},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, Receiver, Sender},
        Arc,
    },
    time::{Duration, Instant},
};

/// How long a cancelled process gets between the soft and the hard kill.
const CANCEL_GRACE: Duration = Duration::from_millis(1000);

/// Progress and result signals emitted while building.
#[derive(Clone, Debug)]
pub enum BuildEvent {
    TaskStarted { description: String, maximum: u64 },
    TotalEffortChanged(u64),
    TaskProgress(u64),
    CommandDescription { highlight: String, message: String },
    ProcessResultReady(ProcessResult),
    Warning(Error),
}

pub type EventSender = Sender<BuildEvent>;

/// Bounded semaphores per named job pool.
#[derive(Debug)]
struct JobPools {
    limits: BTreeMap<String, usize>,
    counts: Mutex<BTreeMap<String, usize>>,
    cv: Condvar,
}

impl JobPools {
    fn new(limits: BTreeMap<String, usize>) -> Self {
        Self { limits, counts: Mutex::new(BTreeMap::new()), cv: Condvar::new() }
    }

    /// Blocks until a slot in `pool` is free; returns `false` on
    /// cancellation.
    fn acquire(&self, pool: &str, cancel: &AtomicBool) -> bool {
        let Some(&limit) = self.limits.get(pool) else { return true };
        let mut counts = self.counts.lock();
        loop {
            let used = counts.entry(pool.to_string()).or_insert(0);
            if *used < limit {
                *used += 1;
                return true;
            }
            if cancel.load(Ordering::Relaxed) {
                return false;
            }
            self.cv.wait_for(&mut counts, Duration::from_millis(50));
        }
    }

    fn release(&self, pool: &str) {
        if !self.limits.contains_key(pool) {
            return;
        }
        let mut counts = self.counts.lock();
        if let Some(used) = counts.get_mut(pool) {
            *used = used.saturating_sub(1);
        }
        self.cv.notify_all();
    }
}

struct JobOutcome {
    transformer: TransformerId,
    outputs: Vec<NodeId>,
    result: Result<()>,
    observations: EvalObservations,
}

struct JobPayload {
    transformer: TransformerId,
    outputs: Vec<NodeId>,
    commands: Vec<Command>,
    environment: BTreeMap<String, String>,
    working_directory: PathBuf,
    ctx: EvalContext,
}

pub struct Executor<'a> {
    graph: &'a mut BuildGraph,
    project: &'a TopLevelProject,
    options: &'a BuildOptions,
    host: Arc<dyn ProcessHost>,
    scanners: &'a ScannerRegistry,
    runtime: &'a mut dyn ScriptRuntime,
    script_exec: ScriptExecutorHandle,
    events: Option<EventSender>,
    cancel: Arc<AtomicBool>,
    pool: rayon::ThreadPool,
    job_pools: Arc<JobPools>,
    scheduled: BTreeSet<NodeId>,
    failed: BTreeSet<NodeId>,
    errors: Vec<Error>,
    ready: BinaryHeap<Reverse<NodeId>>,
    progress: u64,
}

impl<'a> Executor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: &'a mut BuildGraph,
        project: &'a TopLevelProject,
        options: &'a BuildOptions,
        host: Arc<dyn ProcessHost>,
        scanners: &'a ScannerRegistry,
        runtime: &'a mut dyn ScriptRuntime,
        command_runtime: Box<dyn ScriptRuntime>,
        events: Option<EventSender>,
        cancel: Arc<AtomicBool>,
    ) -> Result<(Self, ScriptCommandExecutor)> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.max_job_count.max(1))
            .thread_name(|i| format!("quarry-worker-{i}"))
            .build()
            .map_err(|err| Error::internal(format!("cannot create worker pool: {err}")))?;
        let script_executor = ScriptCommandExecutor::new(command_runtime);
        let executor = Self {
            graph,
            project,
            options,
            host,
            scanners,
            runtime,
            script_exec: script_executor.handle(),
            events,
            cancel,
            pool,
            job_pools: Arc::new(JobPools::new(options.job_limits_per_pool.clone())),
            scheduled: BTreeSet::new(),
            failed: BTreeSet::new(),
            errors: Vec::new(),
            ready: BinaryHeap::new(),
            progress: 0,
        };
        Ok((executor, script_executor))
    }

    fn emit(&self, event: BuildEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Builds the targets plus everything they depend on.
    pub fn build(&mut self, target_products: &[ProductId]) -> Result<()> {
        let started = Instant::now();
        self.graph.reset_build_states();
        if self.options.force_timestamp_check {
            self.graph.invalidate_timestamps();
        }
        if self.options.remove_stale_artifacts {
            clean::remove_stale_artifacts(self.graph, self.project)?;
        }

        let products = self.product_closure(target_products);
        self.scheduled = products
            .iter()
            .flat_map(|p| self.graph.product_data(*p).nodes.iter().copied())
            .collect();

        // source files and external dependencies are re-stat'ed on every
        // build; cached values only stay valid for generated artifacts
        for id in self.scheduled.clone() {
            if let Some(artifact) = self.graph.artifact_mut(id) {
                if !artifact.is_generated() {
                    artifact.clear_timestamp();
                }
            }
        }
        let dep_ids: Vec<_> = self.graph.file_dependency_ids().collect();
        for dep in dep_ids {
            self.graph.file_dependency_mut(dep).timestamp = None;
        }
        self.emit(BuildEvent::TaskStarted {
            description: "Building".into(),
            maximum: self.scheduled.len() as u64,
        });
        self.emit(BuildEvent::TotalEffortChanged(self.scheduled.len() as u64));

        for id in self.scheduled.clone() {
            if self.children_satisfied(id) {
                self.push_ready(id);
            }
        }

        let (job_tx, job_rx): (Sender<JobOutcome>, Receiver<JobOutcome>) = channel();
        let mut in_flight = 0usize;

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                self.drain(&job_rx, &mut in_flight);
                if !self.errors.iter().any(Error::is_cancelled) {
                    self.errors.push(Error::cancelled());
                }
                break;
            }

            // admit work while a global slot is free; unadmitted nodes
            // simply stay in the ready queue
            while in_flight < self.options.max_job_count.max(1)
                && !self.cancel.load(Ordering::Relaxed)
            {
                let Some(node) = self.pop_ready() else { break };
                if self.process_node(node, &job_tx)? {
                    in_flight += 1;
                }
            }

            if in_flight == 0 && self.ready.is_empty() {
                if self.cancel.load(Ordering::Relaxed)
                    && !self.errors.iter().any(Error::is_cancelled)
                {
                    self.errors.push(Error::cancelled());
                }
                break;
            }

            match job_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(outcome) => {
                    in_flight -= 1;
                    self.handle_outcome(outcome);
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    if in_flight > 0 {
                        self.errors.push(Error::internal("worker pool died"));
                    }
                    break;
                }
            }
        }

        if self.options.log_elapsed_time {
            info!("build took {:.3}s", started.elapsed().as_secs_f64());
        }

        if let Some(first) = self.errors.first().cloned() {
            let mut aggregated = first;
            for err in self.errors.iter().skip(1) {
                aggregated = aggregated.append(err.message());
            }
            return Err(aggregated);
        }
        Ok(())
    }

    fn drain(&mut self, job_rx: &Receiver<JobOutcome>, in_flight: &mut usize) {
        while *in_flight > 0 {
            if let Ok(outcome) = job_rx.recv_timeout(Duration::from_secs(30)) {
                *in_flight -= 1;
                self.handle_outcome(outcome);
            } else {
                break;
            }
        }
    }

    fn product_closure(&self, targets: &[ProductId]) -> BTreeSet<ProductId> {
        let mut closure = BTreeSet::new();
        let mut stack: Vec<ProductId> = targets.to_vec();
        while let Some(product) = stack.pop() {
            if !closure.insert(product) {
                continue;
            }
            stack.extend(self.project.dependency_ids(product));
        }
        closure
    }

    fn push_ready(&mut self, id: NodeId) {
        self.ready.push(Reverse(id));
    }

    fn pop_ready(&mut self) -> Option<NodeId> {
        self.ready.pop().map(|Reverse(id)| id)
    }

    fn children_satisfied(&self, id: NodeId) -> bool {
        let Some(node) = self.graph.try_node(id) else { return false };
        node.children.iter().all(|child| self.child_satisfied(*child))
    }

    fn child_satisfied(&self, child: NodeId) -> bool {
        if !self.scheduled.contains(&child) {
            return true;
        }
        self.graph
            .try_node(child)
            .map_or(true, |node| node.build_state == BuildState::Built)
    }

    fn propagate(&mut self, id: NodeId) {
        let parents: Vec<NodeId> = self
            .graph
            .try_node(id)
            .map(|node| node.parents.iter().copied().collect())
            .unwrap_or_default();
        for parent in parents {
            if !self.scheduled.contains(&parent) {
                continue;
            }
            let state = self.graph.node(parent).build_state;
            if matches!(state, BuildState::Untouched | BuildState::Buildable)
                && self.children_satisfied(parent)
            {
                self.graph.node_mut(parent).build_state = BuildState::Buildable;
                self.push_ready(parent);
            }
        }
    }

    fn mark_built(&mut self, id: NodeId) {
        if let Some(node) = self.graph.try_node(id) {
            if node.build_state == BuildState::Built {
                return;
            }
        } else {
            return;
        }
        self.graph.node_mut(id).build_state = BuildState::Built;
        self.progress += 1;
        self.emit(BuildEvent::TaskProgress(self.progress));
        self.propagate(id);
    }

    fn mark_failed(&mut self, id: NodeId) {
        self.failed.insert(id);
        self.mark_built(id);
    }

    /// Returns `true` when a worker job was dispatched for the node.
    fn process_node(&mut self, id: NodeId, job_tx: &Sender<JobOutcome>) -> Result<bool> {
        let Some(node) = self.graph.try_node(id) else { return Ok(false) };
        if !self.scheduled.contains(&id) {
            return Ok(false);
        }
        match node.build_state {
            BuildState::Built | BuildState::Building => return Ok(false),
            BuildState::Untouched | BuildState::Buildable => {}
        }
        if !self.children_satisfied(id) {
            return Ok(false);
        }
        let children: Vec<NodeId> = node.children.iter().copied().collect();
        if children.iter().any(|c| self.failed.contains(c)) {
            self.mark_failed(id);
            return Ok(false);
        }

        if node.is_artifact() {
            let artifact = node.as_artifact().unwrap();
            if !artifact.is_generated() {
                if let Some(artifact) = self.graph.artifact_mut(id) {
                    artifact.timestamp();
                }
                self.mark_built(id);
                return Ok(false);
            }
            self.process_generated_artifact(id, job_tx)
        } else {
            self.process_rule_node(id);
            Ok(false)
        }
    }

    fn process_rule_node(&mut self, id: NodeId) {
        match apply::apply_rule_node(self.graph, self.project, id, self.runtime) {
            Ok(result) => {
                let mut fresh = result.created_artifacts.clone();
                fresh.extend(result.invalidated_artifacts.iter().copied());
                if let Err(err) = apply::connect_rule_nodes_to_artifacts(
                    self.graph,
                    self.project,
                    &result.created_artifacts,
                ) {
                    self.handle_node_error(id, err);
                    return;
                }
                for artifact in fresh {
                    if self.graph.try_node(artifact).is_some() {
                        self.scheduled.insert(artifact);
                    }
                }
                self.mark_built(id);
            }
            Err(err) => self.handle_node_error(id, err),
        }
    }

    fn process_generated_artifact(
        &mut self,
        id: NodeId,
        job_tx: &Sender<JobOutcome>,
    ) -> Result<bool> {
        let Some(tid) = self.graph.artifact(id).and_then(|a| a.transformer) else {
            // a generated artifact without a transformer cannot be built
            self.mark_failed(id);
            self.errors.push(Error::internal(format!(
                "generated artifact {:?} has no transformer",
                self.graph.artifact(id).map(|a| a.file_path.clone())
            )));
            return Ok(false);
        };

        // implicit dependencies first; they may add children
        let mut scanner = InputArtifactScanner::new(
            self.graph,
            self.project,
            self.scanners,
            self.runtime,
        );
        if let Err(err) = scanner.scan(id) {
            self.handle_node_error(id, err);
            return Ok(false);
        }
        if !self.children_satisfied(id) {
            self.graph.node_mut(id).build_state = BuildState::Buildable;
            return Ok(false);
        }

        let outputs: Vec<NodeId> =
            self.graph.transformer(tid).outputs.iter().copied().collect();
        for output in &outputs {
            if !self.children_satisfied(*output) {
                return Ok(false);
            }
            if self
                .graph
                .try_node(*output)
                .map_or(false, |n| n.build_state == BuildState::Building)
            {
                return Ok(false);
            }
        }

        if !self.artifact_matches_filters(id) || !self.transformer_needs_run(tid, &outputs) {
            for output in outputs {
                self.mark_built(output);
            }
            return Ok(false);
        }

        self.dispatch_transformer(tid, outputs, job_tx)
    }

    fn artifact_matches_filters(&self, id: NodeId) -> bool {
        let Some(artifact) = self.graph.artifact(id) else { return false };
        if !self.options.active_file_tags.is_empty()
            && !artifact
                .file_tags
                .iter()
                .any(|t| self.options.active_file_tags.contains(t.as_str()))
        {
            return false;
        }
        if !self.options.files_to_consider.is_empty()
            && !self.options.files_to_consider.iter().any(|f| f == &artifact.file_path)
        {
            return false;
        }
        true
    }

    fn transformer_needs_run(&mut self, tid: TransformerId, outputs: &[NodeId]) -> bool {
        {
            let transformer = self.graph.transformer(tid);
            if transformer.always_run || transformer.marked_for_rerun {
                return true;
            }
        }
        if tracker::commands_need_rerun(self.graph, self.project, self.graph.transformer(tid)) {
            return true;
        }

        if !self.options.changed_files.is_empty() {
            let changed: BTreeSet<&PathBuf> = self.options.changed_files.iter().collect();
            for output in outputs {
                let Some(artifact) = self.graph.artifact(*output) else { continue };
                if utils::file_time(&artifact.file_path).is_none() {
                    return true;
                }
                let children: Vec<NodeId> =
                    self.graph.node(*output).children.iter().copied().collect();
                for child in children {
                    if let Some(child_artifact) = self.graph.artifact(child) {
                        if changed.contains(&child_artifact.file_path) {
                            return true;
                        }
                    }
                }
                for dep in &artifact.file_dependencies.clone() {
                    if changed.contains(&self.graph.file_dependency(*dep).file_path) {
                        return true;
                    }
                }
            }
            return false;
        }

        for output in outputs {
            let Some(artifact) = self.graph.artifact(*output) else { continue };
            let always_updated = artifact.always_updated;
            let out_time = match self.graph.artifact_mut(*output).map(|a| a.timestamp()) {
                Some(t) if t.is_valid() => t,
                _ => return true,
            };
            if !always_updated {
                // such artifacts only need to exist
                continue;
            }
            let children: Vec<NodeId> =
                self.graph.node(*output).children.iter().copied().collect();
            for child in children {
                if self.graph.try_node(child).map_or(false, Node::is_artifact) {
                    let child_time = self
                        .graph
                        .artifact_mut(child)
                        .map(|a| a.timestamp())
                        .unwrap_or_else(FileTime::oldest);
                    if child_time > out_time {
                        return true;
                    }
                }
            }
            let deps: Vec<_> = self
                .graph
                .artifact(*output)
                .map(|a| a.file_dependencies.iter().copied().collect())
                .unwrap_or_default();
            for dep in deps {
                if self.graph.file_dependency_mut(dep).timestamp() > out_time {
                    return true;
                }
            }
        }
        false
    }

    fn dispatch_transformer(
        &mut self,
        tid: TransformerId,
        outputs: Vec<NodeId>,
        job_tx: &Sender<JobOutcome>,
    ) -> Result<bool> {
        let transformer = self.graph.transformer(tid);
        let product = transformer.product;
        let commands = transformer.commands.clone();
        let inputs: Vec<NodeId> = transformer.inputs.iter().copied().collect();
        let edo: Vec<NodeId> = transformer.explicitly_depends_on.iter().copied().collect();
        let product_desc = self.project.product_by_id(product);

        for output in &outputs {
            if let Some(artifact) = self.graph.artifact(*output) {
                utils::create_parent_dir_all(&artifact.file_path)?;
            }
            self.graph.node_mut(*output).build_state = BuildState::Building;
        }

        // command-time scripts see the same bindings the prepare script saw
        let mut ctx = EvalContext::default();
        ctx.current_product = product_desc.name.clone();
        let input_json: Vec<_> =
            inputs.iter().map(|i| artifact_to_json(self.graph, *i)).collect();
        if let [single] = input_json.as_slice() {
            ctx.bind("input", single.clone());
        }
        ctx.bind("allInputs", serde_json::Value::Array(input_json));
        let output_json: Vec<_> =
            outputs.iter().map(|o| artifact_to_json(self.graph, *o)).collect();
        if let [single] = output_json.as_slice() {
            ctx.bind("output", single.clone());
        }
        ctx.bind("outputs", serde_json::Value::Array(output_json));
        ctx.bind(
            "explicitlyDependsOn",
            serde_json::Value::Array(
                edo.iter().map(|i| artifact_to_json(self.graph, *i)).collect(),
            ),
        );
        ctx.bind(
            "product",
            serde_json::json!({
                "name": product_desc.name,
                "buildDirectory": product_desc.build_directory.to_string_lossy(),
                "type": product_desc
                    .product_file_tags
                    .iter()
                    .map(FileTag::as_str)
                    .collect::<Vec<_>>(),
                "modules": product_desc.module_properties.value().get("modules").cloned(),
            }),
        );

        let payload = JobPayload {
            transformer: tid,
            outputs,
            commands,
            environment: product_desc.environment.clone(),
            working_directory: product_desc.build_directory.clone(),
            ctx,
        };
        let host = self.host.clone();
        let cancel = self.cancel.clone();
        let job_pools = self.job_pools.clone();
        let script_exec = self.script_exec.clone();
        let events = self.events.clone();
        let echo_mode = self.options.command_echo_mode;
        let dry_run = self.options.dry_run;
        let tx = job_tx.clone();
        self.pool.spawn(move || {
            let outcome = run_transformer_job(
                payload,
                host,
                cancel,
                job_pools,
                script_exec,
                events,
                echo_mode,
                dry_run,
            );
            let _ = tx.send(outcome);
        });
        Ok(true)
    }

    fn handle_outcome(&mut self, outcome: JobOutcome) {
        match outcome.result {
            Ok(()) => {
                let commands_tracked = outcome.observations != EvalObservations::default();
                {
                    let transformer = self.graph.transformer_mut(outcome.transformer);
                    transformer.last_command_execution_time = FileTime::now();
                    transformer.marked_for_rerun = false;
                    transformer.command_observations = outcome.observations;
                    transformer.commands_need_change_tracking = commands_tracked;
                }
                for output in outcome.outputs {
                    if !self.options.dry_run {
                        let refreshed = self.graph.refresh_timestamp(output);
                        let (path, always_updated) = self
                            .graph
                            .artifact(output)
                            .map(|a| (a.file_path.clone(), a.always_updated))
                            .unwrap_or_default();
                        if always_updated && !refreshed.is_valid() {
                            self.emit(BuildEvent::Warning(Error::internal(format!(
                                "rule promised to always update '{}' but did not produce it",
                                path.display()
                            ))));
                        }
                    }
                    if let Some(artifact) = self.graph.artifact_mut(output) {
                        artifact.old_data_possibly_present = false;
                    }
                    self.mark_built(output);
                }
                self.graph.set_dirty();
            }
            Err(err) if err.is_cancelled() => {
                self.cancel.store(true, Ordering::Relaxed);
                for output in outcome.outputs {
                    self.mark_failed(output);
                }
            }
            Err(err) => {
                warn!("{err}");
                self.errors.push(err);
                for output in outcome.outputs {
                    self.mark_failed(output);
                }
                if !self.options.keep_going {
                    self.cancel.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    fn handle_node_error(&mut self, id: NodeId, err: Error) {
        warn!("{err}");
        self.errors.push(err);
        self.mark_failed(id);
        if !self.options.keep_going {
            self.cancel.store(true, Ordering::Relaxed);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_transformer_job(
    payload: JobPayload,
    host: Arc<dyn ProcessHost>,
    cancel: Arc<AtomicBool>,
    job_pools: Arc<JobPools>,
    script_exec: ScriptExecutorHandle,
    events: Option<EventSender>,
    echo_mode: CommandEchoMode,
    dry_run: bool,
) -> JobOutcome {
    let mut observations = EvalObservations::default();
    let emit = |event: BuildEvent| {
        if let Some(events) = &events {
            let _ = events.send(event);
        }
    };
    let mut run = || -> Result<()> {
        for command in &payload.commands {
            if cancel.load(Ordering::Relaxed) {
                return Err(Error::cancelled());
            }
            if dry_run && !command.ignore_dry_run() {
                if !command.is_silent() {
                    emit(BuildEvent::CommandDescription {
                        highlight: String::new(),
                        message: format!("[dry run] {}", command.description()),
                    });
                }
                continue;
            }
            match echo_mode {
                CommandEchoMode::Silent => {}
                CommandEchoMode::Summary => {
                    if !command.is_silent() {
                        emit(BuildEvent::CommandDescription {
                            highlight: String::new(),
                            message: command.description().to_string(),
                        });
                    }
                }
                CommandEchoMode::CommandLine => {
                    let message = match command {
                        Command::Process(c) => {
                            format!("{} {}", c.program, c.arguments.join(" "))
                        }
                        Command::Script(c) => c.description.clone(),
                    };
                    emit(BuildEvent::CommandDescription { highlight: String::new(), message });
                }
            }

            let pool = command.job_pool().map(str::to_string);
            if let Some(pool) = &pool {
                if !job_pools.acquire(pool, &cancel) {
                    return Err(Error::cancelled());
                }
            }
            let command_result = match command {
                Command::Process(process) => {
                    let result = execute_process_command(
                        host.as_ref(),
                        process,
                        &payload.environment,
                        &payload.working_directory,
                        &cancel,
                        CANCEL_GRACE,
                    );
                    match result {
                        Ok(process_result) => {
                            let failed = !process_result.success;
                            let failure = process_failure_error(&process_result);
                            emit(BuildEvent::ProcessResultReady(process_result));
                            if failed {
                                Err(failure)
                            } else {
                                Ok(())
                            }
                        }
                        Err(err) => Err(err),
                    }
                }
                Command::Script(script_command) => {
                    let mut ctx = payload.ctx.clone();
                    for (key, value) in &script_command.scope {
                        ctx.bind(key, value.clone());
                    }
                    script_exec.evaluate(&script_command.source, &ctx).and_then(
                        |(value, obs)| {
                            observations.merge(obs);
                            apply_file_operations(&value, &script_command.source.location)
                        },
                    )
                }
            };
            if let Some(pool) = &pool {
                job_pools.release(pool);
            }
            command_result?;
        }
        Ok(())
    };
    let result = run();
    JobOutcome {
        transformer: payload.transformer,
        outputs: payload.outputs,
        result,
        observations,
    }
}
