//! Asynchronous jobs: setup, build, clean, install.
//!
//! Each job runs on its own thread, streams progress events and finishes
//! exactly once. One job at a time per project: a process-wide lock keyed
//! by project id rejects overlapping jobs immediately, and the setup job
//! additionally locks the build-graph file against other processes.

use crate::{
    clean,
    error::{Error, Result},
    executor::{BuildEvent, Executor, ProcessHost, ProcessResult, SystemProcessHost},
    install,
    language::ProductId,
    options::{BuildOptions, CleanOptions, InstallOptions, SetupParameters},
    scanner::ScannerRegistry,
    script::ScriptRuntime,
    tracker::{BuildData, ProjectResolver},
    utils,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, Receiver, Sender},
        Arc,
    },
    thread::JoinHandle,
};

/// Everything a job reports while running, closed by exactly one
/// `Finished`.
#[derive(Clone, Debug)]
pub enum JobEvent {
    TaskStarted { description: String, maximum: u64 },
    TotalEffortChanged(u64),
    TaskProgress(u64),
    CommandDescription { highlight: String, message: String },
    ProcessResultReady(ProcessResult),
    Warning(Error),
    Finished(std::result::Result<(), Error>),
}

static ACTIVE_PROJECTS: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

#[derive(Debug)]
struct ProjectLock {
    id: String,
}

impl ProjectLock {
    fn acquire(id: &str) -> Result<Self> {
        let mut active = ACTIVE_PROJECTS.lock();
        if !active.insert(id.to_string()) {
            return Err(Error::configuration(format!(
                "a job is already in progress for project '{id}'"
            )));
        }
        Ok(Self { id: id.to_string() })
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        ACTIVE_PROJECTS.lock().remove(&self.id);
    }
}

/// Exclusive-writer lock file next to the build graph.
struct BuildGraphLock {
    path: PathBuf,
}

impl BuildGraphLock {
    fn acquire(graph_file: &PathBuf) -> Result<Self> {
        let path = graph_file.with_extension("bg.lock");
        utils::create_parent_dir_all(&path)?;
        match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::configuration(format!(
                    "build graph at '{}' is locked by another process",
                    graph_file.display()
                )))
            }
            Err(err) => Err(Error::io(err, &path)),
        }
    }
}

impl Drop for BuildGraphLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A running job. Events arrive on [`Job::events`]; [`Job::wait`] joins
/// the worker and yields the build data back.
pub struct Job {
    events: Receiver<JobEvent>,
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<Result<BuildData>>,
}

impl Job {
    /// Requests cancellation; the job finishes with a cancellation error.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn events(&self) -> &Receiver<JobEvent> {
        &self.events
    }

    pub fn wait(self) -> Result<BuildData> {
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(Error::internal("job thread panicked")),
        }
    }
}

/// Creates the script runtimes a build job needs; rule application and
/// command execution each own a private engine.
pub type RuntimeFactory = Box<dyn Fn() -> Box<dyn ScriptRuntime> + Send>;

/// The external-interface façade.
pub struct BuildEngine {
    host: Arc<dyn ProcessHost>,
}

impl Default for BuildEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildEngine {
    pub fn new() -> Self {
        Self { host: Arc::new(SystemProcessHost) }
    }

    pub fn with_host(host: Arc<dyn ProcessHost>) -> Self {
        Self { host }
    }

    /// Resolves or reloads the project and prepares its build data.
    pub fn setup(
        &self,
        params: SetupParameters,
        mut resolver: Box<dyn ProjectResolver>,
    ) -> Job {
        let (events_tx, events) = channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let job_cancel = cancel.clone();
        let handle = std::thread::Builder::new()
            .name("quarry-setup".into())
            .spawn(move || {
                let result = run_setup(&params, resolver.as_mut(), &events_tx, &job_cancel);
                finish(&events_tx, &result);
                result
            })
            .expect("cannot spawn setup job");
        Job { events, cancel, handle }
    }

    /// Executes the build graph for the named products (all if empty).
    pub fn build(
        &self,
        data: BuildData,
        options: BuildOptions,
        products: Vec<String>,
        runtime_factory: RuntimeFactory,
    ) -> Job {
        let (events_tx, events) = channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let job_cancel = cancel.clone();
        let host = self.host.clone();
        let handle = std::thread::Builder::new()
            .name("quarry-build".into())
            .spawn(move || {
                let result = run_build(
                    data,
                    &options,
                    &products,
                    host,
                    runtime_factory,
                    &events_tx,
                    job_cancel,
                );
                match result {
                    Ok(data) => {
                        finish(&events_tx, &Ok(()));
                        Ok(data)
                    }
                    Err(err) => {
                        finish::<()>(&events_tx, &Err(err.clone()));
                        Err(err)
                    }
                }
            })
            .expect("cannot spawn build job");
        Job { events, cancel, handle }
    }

    /// Removes the generated artifacts of the named products.
    pub fn clean(&self, data: BuildData, options: CleanOptions, products: Vec<String>) -> Job {
        let (events_tx, events) = channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let handle = std::thread::Builder::new()
            .name("quarry-clean".into())
            .spawn(move || {
                let result = run_clean(data, &options, &products, &events_tx);
                match result {
                    Ok(data) => {
                        finish(&events_tx, &Ok(()));
                        Ok(data)
                    }
                    Err(err) => {
                        finish::<()>(&events_tx, &Err(err.clone()));
                        Err(err)
                    }
                }
            })
            .expect("cannot spawn clean job");
        Job { events, cancel, handle }
    }

    /// Copies installable artifacts into the install root.
    pub fn install(
        &self,
        data: BuildData,
        options: InstallOptions,
        products: Vec<String>,
    ) -> Job {
        let (events_tx, events) = channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let handle = std::thread::Builder::new()
            .name("quarry-install".into())
            .spawn(move || {
                let result = (|| -> Result<BuildData> {
                    let _lock = ProjectLock::acquire(&data.project.project_id())?;
                    let _ = events_tx.send(JobEvent::TaskStarted {
                        description: "Installing".into(),
                        maximum: 0,
                    });
                    let targets = select_products(&data, &products)?;
                    let count =
                        install::install_products(&data.graph, &targets, &options)?;
                    let _ = events_tx.send(JobEvent::TaskProgress(count));
                    Ok(data)
                })();
                match result {
                    Ok(data) => {
                        finish(&events_tx, &Ok(()));
                        Ok(data)
                    }
                    Err(err) => {
                        finish::<()>(&events_tx, &Err(err.clone()));
                        Err(err)
                    }
                }
            })
            .expect("cannot spawn install job");
        Job { events, cancel, handle }
    }
}

fn finish<T>(events: &Sender<JobEvent>, result: &std::result::Result<T, Error>) {
    let _ = events.send(JobEvent::Finished(match result {
        Ok(_) => Ok(()),
        Err(err) => Err(err.clone()),
    }));
}

fn run_setup(
    params: &SetupParameters,
    resolver: &mut dyn ProjectResolver,
    events: &Sender<JobEvent>,
    cancel: &AtomicBool,
) -> Result<BuildData> {
    let _project_lock = ProjectLock::acquire(&params.project_id())?;
    let _file_lock = BuildGraphLock::acquire(&params.build_graph_file_path())?;
    let _ = events.send(JobEvent::TaskStarted {
        description: "Resolving project".into(),
        maximum: 1,
    });
    if cancel.load(Ordering::Relaxed) {
        return Err(Error::cancelled());
    }
    let mut data = crate::tracker::setup_build_data(params, resolver)?;
    if cancel.load(Ordering::Relaxed) {
        return Err(Error::cancelled());
    }
    if !params.dry_run && data.graph.is_dirty() {
        data.store()?;
        data.graph.mark_clean();
    }
    let _ = events.send(JobEvent::TaskProgress(1));
    Ok(data)
}

fn run_build(
    mut data: BuildData,
    options: &BuildOptions,
    products: &[String],
    host: Arc<dyn ProcessHost>,
    runtime_factory: RuntimeFactory,
    events: &Sender<JobEvent>,
    cancel: Arc<AtomicBool>,
) -> Result<BuildData> {
    let _project_lock = ProjectLock::acquire(&data.project.project_id())?;
    let _file_lock = BuildGraphLock::acquire(&data.project.build_graph_file_path())?;
    let targets = select_products(&data, products)?;

    let mut scanners = ScannerRegistry::with_builtins();
    for product in &data.project.products {
        scanners.register_user_scanners(&product.scanners);
    }

    // forward executor events into the job's channel; repeated warnings
    // are emitted once
    let (build_events_tx, build_events_rx) = channel::<BuildEvent>();
    let forward_to = events.clone();
    let forwarder = std::thread::spawn(move || {
        let mut warnings = crate::error::WarningCollector::new();
        while let Ok(event) = build_events_rx.recv() {
            let mapped = match event {
                BuildEvent::TaskStarted { description, maximum } => {
                    JobEvent::TaskStarted { description, maximum }
                }
                BuildEvent::TotalEffortChanged(n) => JobEvent::TotalEffortChanged(n),
                BuildEvent::TaskProgress(n) => JobEvent::TaskProgress(n),
                BuildEvent::CommandDescription { highlight, message } => {
                    JobEvent::CommandDescription { highlight, message }
                }
                BuildEvent::ProcessResultReady(result) => {
                    JobEvent::ProcessResultReady(result)
                }
                BuildEvent::Warning(warning) => {
                    if !warnings.add(warning.clone()) {
                        continue;
                    }
                    JobEvent::Warning(warning)
                }
            };
            if forward_to.send(mapped).is_err() {
                break;
            }
        }
    });

    let mut rule_runtime = runtime_factory();
    let command_runtime = runtime_factory();
    let build_result = {
        let (mut executor, _script_executor) = Executor::new(
            &mut data.graph,
            &data.project,
            options,
            host,
            &scanners,
            rule_runtime.as_mut(),
            command_runtime,
            Some(build_events_tx),
            cancel,
        )?;
        executor.build(&targets)
    };
    let _ = forwarder.join();

    // the partial graph survives failed commands and cancellation, but a
    // structurally broken application (conflict, cycle, script error)
    // must not clobber the stored graph
    let keep_graph = match &build_result {
        Ok(()) => true,
        Err(err) => matches!(err.kind(), crate::error::ErrorKind::Cancelled | crate::error::ErrorKind::Io),
    };
    if keep_graph && !options.dry_run && data.graph.is_dirty() {
        data.store()?;
        data.graph.mark_clean();
    }
    build_result?;

    if options.install_artifacts {
        install::install_products(&data.graph, &targets, &InstallOptions::default())?;
    }
    Ok(data)
}

fn run_clean(
    mut data: BuildData,
    options: &CleanOptions,
    products: &[String],
    events: &Sender<JobEvent>,
) -> Result<BuildData> {
    let _project_lock = ProjectLock::acquire(&data.project.project_id())?;
    let targets = select_products(&data, products)?;
    let _ = events.send(JobEvent::TaskStarted {
        description: "Cleaning up".into(),
        maximum: targets.len() as u64,
    });
    clean::clean_products(&mut data.graph, &data.project, &targets, options)?;
    if options.remove_build_graph && !options.dry_run {
        let path = data.project.build_graph_file_path();
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::io(err, &path)),
        }
    } else if !options.dry_run && data.graph.is_dirty() {
        data.store()?;
        data.graph.mark_clean();
    }
    Ok(data)
}

fn select_products(data: &BuildData, names: &[String]) -> Result<Vec<ProductId>> {
    if names.is_empty() {
        return Ok((0..data.project.products.len()).map(|i| ProductId(i as u32)).collect());
    }
    names
        .iter()
        .map(|name| {
            data.project
                .product_id(name)
                .ok_or_else(|| Error::configuration(format!("no such product '{name}'")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_project_lock_fails_immediately() {
        let first = ProjectLock::acquire("p-lock-test").unwrap();
        let err = ProjectLock::acquire("p-lock-test").unwrap_err();
        assert!(err.message().contains("already in progress"));
        drop(first);
        ProjectLock::acquire("p-lock-test").unwrap();
    }

    #[test]
    fn build_graph_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let graph_file = dir.path().join("cfg.bg");
        let first = BuildGraphLock::acquire(&graph_file).unwrap();
        assert!(BuildGraphLock::acquire(&graph_file).is_err());
        drop(first);
        BuildGraphLock::acquire(&graph_file).unwrap();
    }
}
