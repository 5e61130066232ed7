//! End-to-end scenarios driving real processes through the engine.

use quarry::{
    error::ErrorKind,
    file_tags,
    language::{ProductId, ResolvedProduct, SourceArtifactDesc},
    utils::FileTime,
    BuildData, BuildEngine, BuildOptions, CodeLocation, JobEvent, ProjectResolver, PropertyMap,
    Rule, RuleArtifact, ScriptSource, SetupParameters, SimpleRuntime, TopLevelProject,
};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct FnResolver<F>(F);

impl<F> ProjectResolver for FnResolver<F>
where
    F: FnMut(&SetupParameters) -> quarry::Result<TopLevelProject> + Send,
{
    fn resolve(&mut self, params: &SetupParameters) -> quarry::Result<TopLevelProject> {
        self.0(params)
    }
}

fn resolver_for(
    fixture: &Fixture,
    files: Vec<&'static str>,
    rules: Vec<Arc<Rule>>,
) -> Box<dyn ProjectResolver> {
    let src_dir = fixture.src_dir.clone();
    let build_root = fixture.build_root.clone();
    let project_file = fixture.project_file.clone();
    Box::new(FnResolver(move |params: &SetupParameters| {
        Ok(make_project(
            &src_dir,
            &build_root,
            &project_file,
            params,
            &[product_desc("app", &files, rules.clone())],
        ))
    }))
}

fn failing_resolver() -> Box<dyn ProjectResolver> {
    Box::new(FnResolver(|_: &SetupParameters| -> quarry::Result<TopLevelProject> {
        panic!("the stored build graph should have been reused")
    }))
}

struct ProductDesc {
    name: String,
    files: Vec<&'static str>,
    rules: Vec<Arc<Rule>>,
}

fn product_desc(name: &str, files: &[&'static str], rules: Vec<Arc<Rule>>) -> ProductDesc {
    ProductDesc { name: name.to_string(), files: files.to_vec(), rules }
}

fn make_project(
    src_dir: &Path,
    build_root: &Path,
    project_file: &Path,
    params: &SetupParameters,
    products: &[ProductDesc],
) -> TopLevelProject {
    let mut project = TopLevelProject {
        build_root: build_root.to_path_buf(),
        build_configuration: params.build_configuration.clone(),
        environment: params.environment.clone(),
        last_start_resolve_time: FileTime::now(),
        ..Default::default()
    };
    let project_build_dir = project.build_directory();
    for desc in products {
        let sources = desc
            .files
            .iter()
            .map(|name| SourceArtifactDesc {
                file_path: src_dir.join(name),
                file_tags: match Path::new(name).extension().and_then(|e| e.to_str()) {
                    Some("c") => file_tags(["c"]),
                    Some("h") => file_tags(["h"]),
                    _ => file_tags(["unknown"]),
                },
                properties: PropertyMap::default(),
            })
            .collect();
        project.products.push(ResolvedProduct {
            name: desc.name.clone(),
            product_file_tags: file_tags(["application"]),
            location: CodeLocation::new(project_file, 2, 5),
            build_directory: project_build_dir.join(&desc.name),
            module_properties: PropertyMap::default(),
            rules: desc.rules.clone(),
            sources,
            enabled: true,
            ..Default::default()
        });
    }
    project.last_end_resolve_time = FileTime::now();
    project
}

fn compile_rule(project_file: &Path) -> Arc<Rule> {
    Arc::new(Rule {
        name: "compiler".into(),
        inputs: file_tags(["c"]),
        output_file_tags: file_tags(["obj"]),
        requires_inputs: true,
        prepare_script: ScriptSource::new(
            r#"{"program": "cp", "arguments": ["$in", "$out"],
                "description": "compiling ${input.fileName}"}"#,
            CodeLocation::new(project_file, 10, 9),
        ),
        artifacts: vec![RuleArtifact {
            file_path: ScriptSource::new(
                r#""obj/${input.completeBaseName}.o""#,
                CodeLocation::new(project_file, 11, 13),
            ),
            file_tags: file_tags(["obj"]),
            always_updated: true,
            bindings: Vec::new(),
        }],
        ..Default::default()
    })
}

fn link_rule(project_file: &Path) -> Arc<Rule> {
    Arc::new(Rule {
        name: "linker".into(),
        inputs: file_tags(["obj"]),
        output_file_tags: file_tags(["application"]),
        multiplex: true,
        requires_inputs: true,
        prepare_script: ScriptSource::new(
            r#"{"program": "sh",
                "arguments": ["-c", "cat \"$@\" > \"$0\"", "$out", "$in"],
                "description": "linking ${output.fileName}"}"#,
            CodeLocation::new(project_file, 20, 9),
        ),
        artifacts: vec![RuleArtifact {
            file_path: ScriptSource::new(
                r#""app""#,
                CodeLocation::new(project_file, 21, 13),
            ),
            file_tags: file_tags(["application"]),
            always_updated: true,
            bindings: Vec::new(),
        }],
        ..Default::default()
    })
}

struct Fixture {
    _dir: tempfile::TempDir,
    src_dir: PathBuf,
    build_root: PathBuf,
    project_file: PathBuf,
    engine: BuildEngine,
}

impl Fixture {
    fn new() -> Self {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let src_dir = dir.path().join("src");
        std::fs::create_dir_all(&src_dir).unwrap();
        let build_root = dir.path().join("build");
        let project_file = src_dir.join("project.qry");
        std::fs::write(&project_file, "Project {\n    Product {\n    }\n}\n").unwrap();
        Self { _dir: dir, src_dir, build_root, project_file, engine: BuildEngine::new() }
    }

    fn params(&self) -> SetupParameters {
        // the build root is unique per test, which keeps per-project
        // locks of concurrently running tests apart
        let mut params = SetupParameters::new(&self.build_root).with_configuration(
            serde_json::json!({"profile": "test", "root": self.build_root}),
        );
        params.environment = BTreeMap::new();
        params
    }

    fn write_source(&self, name: &str, content: &str) {
        std::fs::write(self.src_dir.join(name), content).unwrap();
    }

    fn touch(&self, name: &str) {
        // make sure the new timestamp is observably newer
        std::thread::sleep(Duration::from_millis(20));
        let path = self.src_dir.join(name);
        let content = std::fs::read(&path).unwrap();
        std::fs::write(&path, content).unwrap();
    }

    fn touch_project_file(&self) {
        std::thread::sleep(Duration::from_millis(20));
        let content = std::fs::read(&self.project_file).unwrap();
        std::fs::write(&self.project_file, content).unwrap();
    }

    fn setup(&self, resolver: Box<dyn ProjectResolver>) -> BuildData {
        self.engine.setup(self.params(), resolver).wait().unwrap()
    }

    fn build(&self, data: BuildData) -> (quarry::Result<BuildData>, Vec<JobEvent>) {
        self.build_with(data, BuildOptions::default())
    }

    fn build_with(
        &self,
        data: BuildData,
        options: BuildOptions,
    ) -> (quarry::Result<BuildData>, Vec<JobEvent>) {
        let job = self.engine.build(
            data,
            options,
            Vec::new(),
            Box::new(|| Box::new(SimpleRuntime::new())),
        );
        let mut events = Vec::new();
        while let Ok(event) = job.events().recv_timeout(Duration::from_secs(120)) {
            let done = matches!(event, JobEvent::Finished(_));
            events.push(event);
            if done {
                break;
            }
        }
        (job.wait(), events)
    }

    fn product_build_dir(&self, data: &BuildData, product: &str) -> PathBuf {
        data.project.product(product).unwrap().build_directory.clone()
    }
}

fn processes_run(events: &[JobEvent]) -> usize {
    events.iter().filter(|e| matches!(e, JobEvent::ProcessResultReady(_))).count()
}

#[test]
fn s1_single_file_compile_and_link_is_incremental() {
    let fixture = Fixture::new();
    fixture.write_source("main.c", "int main() { return 0; }\n");
    let rules = vec![compile_rule(&fixture.project_file), link_rule(&fixture.project_file)];

    let data = fixture.setup(resolver_for(&fixture, vec!["main.c"], rules.clone()));
    let (data, events) = fixture.build(data);
    let data = data.unwrap();
    assert_eq!(processes_run(&events), 2);
    let build_dir = fixture.product_build_dir(&data, "app");
    let object = build_dir.join("obj/main.o");
    let app = build_dir.join("app");
    assert!(object.is_file());
    assert!(app.is_file());

    // nothing changed, nothing runs
    let (data, events) = fixture.build(data);
    let data = data.unwrap();
    assert_eq!(processes_run(&events), 0);

    fixture.touch("main.c");
    let (data, events) = fixture.build(data);
    let data = data.unwrap();
    assert_eq!(processes_run(&events), 2);

    let (data, events) = fixture.build(data);
    data.unwrap();
    assert_eq!(processes_run(&events), 0);
}

#[test]
fn s2_multiplex_rule_reapplies_on_input_removal() {
    let fixture = Fixture::new();
    fixture.write_source("a.c", "aaa\n");
    fixture.write_source("b.c", "bbb\n");
    let combine = Arc::new(Rule {
        name: "combine".into(),
        inputs: file_tags(["c"]),
        output_file_tags: file_tags(["application"]),
        multiplex: true,
        requires_inputs: true,
        prepare_script: ScriptSource::new(
            r#"{"program": "sh",
                "arguments": ["-c", "cat \"$@\" > \"$0\"", "$out", "$in"],
                "description": "combining sources"}"#,
            CodeLocation::new(&fixture.project_file, 10, 9),
        ),
        artifacts: vec![RuleArtifact {
            file_path: ScriptSource::new(
                r#""app""#,
                CodeLocation::new(&fixture.project_file, 11, 13),
            ),
            file_tags: file_tags(["application"]),
            always_updated: true,
            bindings: Vec::new(),
        }],
        ..Default::default()
    });

    let data = fixture.setup(resolver_for(&fixture, vec!["a.c", "b.c"], vec![combine.clone()]));
    let (data, events) = fixture.build(data);
    let data = data.unwrap();
    assert_eq!(processes_run(&events), 1);
    let app = fixture.product_build_dir(&data, "app").join("app");
    assert_eq!(std::fs::read_to_string(&app).unwrap(), "aaa\nbbb\n");
    drop(data);

    // the project file loses b.c; the rule must run again with one input
    fixture.touch_project_file();
    let data = fixture.setup(resolver_for(&fixture, vec!["a.c"], vec![combine]));
    let (data, events) = fixture.build(data);
    let data = data.unwrap();
    assert_eq!(processes_run(&events), 1);
    assert_eq!(std::fs::read_to_string(&app).unwrap(), "aaa\n");
    drop(data);
}

#[test]
fn s3_input_removal_cascades_through_nonmultiplex_rules() {
    let fixture = Fixture::new();
    fixture.write_source("main.c", "int main() { return 0; }\n");
    let rules = vec![compile_rule(&fixture.project_file), link_rule(&fixture.project_file)];

    let data = fixture.setup(resolver_for(&fixture, vec!["main.c"], rules.clone()));
    let (data, _) = fixture.build(data);
    let data = data.unwrap();
    let build_dir = fixture.product_build_dir(&data, "app");
    let object = build_dir.join("obj/main.o");
    let app = build_dir.join("app");
    assert!(object.is_file());
    assert!(app.is_file());
    drop(data);

    fixture.touch_project_file();
    let data = fixture.setup(resolver_for(&fixture, vec![], rules));
    // the generated descendants disappeared with the source
    assert!(!object.exists());
    assert!(!app.exists());

    let (data, events) = fixture.build(data);
    data.unwrap();
    assert_eq!(processes_run(&events), 0);
    assert!(!object.exists());
    assert!(!app.exists());
}

#[test]
fn s4_scanner_discovers_header_dependencies() {
    let fixture = Fixture::new();
    fixture.write_source("main.c", "#include \"h.h\"\nint main() { return 0; }\n");
    fixture.write_source("h.h", "#define ANSWER 42\n");
    let rules = vec![compile_rule(&fixture.project_file), link_rule(&fixture.project_file)];

    let data = fixture.setup(resolver_for(&fixture, vec!["main.c", "h.h"], rules));
    let (data, events) = fixture.build(data);
    let data = data.unwrap();
    assert_eq!(processes_run(&events), 2);

    let build_dir = fixture.product_build_dir(&data, "app");
    let object_id = data
        .graph
        .lookup_artifact(ProductId(0), &build_dir.join("obj/main.o"))
        .expect("main.o must be in the graph");
    let header_id = data
        .graph
        .lookup_artifact(ProductId(0), &fixture.src_dir.join("h.h"))
        .expect("h.h must be in the graph");
    let object_node = data.graph.node(object_id);
    assert!(object_node.children.contains(&header_id));
    let object = data.graph.artifact(object_id).unwrap();
    assert!(object.children_added_by_scanner.contains(&header_id));

    // touching the header reruns exactly the compile-and-link path
    fixture.touch("h.h");
    let (data, events) = fixture.build(data);
    data.unwrap();
    assert_eq!(processes_run(&events), 2);
}

#[test]
fn s5_conflicting_outputs_across_products_fail_the_build() {
    let fixture = Fixture::new();
    let lib_rule = |name: &str, line: u32| {
        Arc::new(Rule {
            name: format!("{name}-archiver"),
            output_file_tags: file_tags(["application"]),
            requires_inputs: false,
            prepare_script: ScriptSource::new(
                r#"{"program": "true", "description": "archiving"}"#,
                CodeLocation::new(&fixture.project_file, line, 9),
            ),
            artifacts: vec![RuleArtifact {
                file_path: ScriptSource::new(
                    r#""lib.a""#,
                    CodeLocation::new(&fixture.project_file, line + 1, 13),
                ),
                file_tags: file_tags(["application"]),
                always_updated: true,
                bindings: Vec::new(),
            }],
            ..Default::default()
        })
    };
    // both products emit into the same directory, so both rules claim
    // the same lib.a
    let src_dir = fixture.src_dir.clone();
    let build_root = fixture.build_root.clone();
    let project_file = fixture.project_file.clone();
    let rule_a = lib_rule("liba", 10);
    let rule_b = lib_rule("libb", 20);
    let resolver = Box::new(FnResolver(move |params: &SetupParameters| {
        let mut project = make_project(
            &src_dir,
            &build_root,
            &project_file,
            params,
            &[
                product_desc("liba", &[], vec![rule_a.clone()]),
                product_desc("libb", &[], vec![rule_b.clone()]),
            ],
        );
        let shared = project.build_directory().join("libs");
        for product in &mut project.products {
            product.build_directory = shared.clone();
        }
        Ok(project)
    }));

    let data = fixture.setup(resolver);
    let graph_file = data.project.build_graph_file_path();
    let stored_before = std::fs::read(&graph_file).unwrap();

    let (result, _) = fixture.build(data);
    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let message = err.message();
    assert!(message.contains("lib.a"), "{message}");
    assert!(message.contains("liba") && message.contains("libb"), "{message}");

    // the stored graph is untouched by the failed build
    let stored_after = std::fs::read(&graph_file).unwrap();
    assert_eq!(stored_before, stored_after);
}

#[test]
fn s6_cancellation_stops_quickly_and_recovers() {
    let fixture = Fixture::new();
    let slow_rule = Arc::new(Rule {
        name: "slow".into(),
        output_file_tags: file_tags(["application"]),
        requires_inputs: false,
        prepare_script: ScriptSource::new(
            r#"[{"program": "sleep", "arguments": ["2"], "description": "sleeping"},
               {"program": "sh",
                "arguments": ["-c", "echo done > \"$0\"", "$out"],
                "description": "writing output"}]"#,
            CodeLocation::new(&fixture.project_file, 10, 9),
        ),
        artifacts: vec![RuleArtifact {
            file_path: ScriptSource::new(
                r#""slow.out""#,
                CodeLocation::new(&fixture.project_file, 11, 13),
            ),
            file_tags: file_tags(["application"]),
            always_updated: true,
            bindings: Vec::new(),
        }],
        ..Default::default()
    });

    let data = fixture.setup(resolver_for(&fixture, vec![], vec![slow_rule.clone()]));
    let out = fixture.product_build_dir(&data, "app").join("slow.out");

    let job = fixture.engine.build(
        data,
        BuildOptions::default(),
        Vec::new(),
        Box::new(|| Box::new(SimpleRuntime::new())),
    );
    std::thread::sleep(Duration::from_millis(300));
    let cancelled_at = Instant::now();
    job.cancel();
    let err = job.wait().unwrap_err();
    assert!(err.is_cancelled(), "{err}");
    assert!(
        cancelled_at.elapsed() < Duration::from_millis(1500),
        "cancellation took {:?}",
        cancelled_at.elapsed()
    );
    assert!(!out.exists());

    // the next build starts from the persisted graph and succeeds
    let data = fixture.setup(resolver_for(&fixture, vec![], vec![slow_rule]));
    let (data, _) = fixture.build(data);
    data.unwrap();
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "done\n");
}

#[test]
fn stored_graph_round_trips_and_is_reused() {
    let fixture = Fixture::new();
    fixture.write_source("main.c", "int main() { return 0; }\n");
    let rules = vec![compile_rule(&fixture.project_file), link_rule(&fixture.project_file)];

    let data = fixture.setup(resolver_for(&fixture, vec!["main.c"], rules));
    let (data, _) = fixture.build(data);
    let data = data.unwrap();
    let dumped = data.dump_nodes();
    drop(data);

    // no trigger fired, so the resolver must not run at all
    let reloaded = fixture.setup(failing_resolver());
    assert_eq!(reloaded.dump_nodes(), dumped);

    let (reloaded, events) = fixture.build(reloaded);
    reloaded.unwrap();
    assert_eq!(processes_run(&events), 0);
}

#[test]
fn dry_run_leaves_disk_and_graph_alone() {
    let fixture = Fixture::new();
    fixture.write_source("main.c", "int main() { return 0; }\n");
    let rules = vec![compile_rule(&fixture.project_file), link_rule(&fixture.project_file)];

    let data = fixture.setup(resolver_for(&fixture, vec!["main.c"], rules));
    let (data, _) = fixture.build(data);
    let data = data.unwrap();
    let graph_file = data.project.build_graph_file_path();
    let app = fixture.product_build_dir(&data, "app").join("app");
    let app_bytes = std::fs::read(&app).unwrap();
    let stored_before = std::fs::read(&graph_file).unwrap();
    drop(data);

    fixture.touch("main.c");
    let data = fixture.setup(failing_resolver());
    let (data, events) = fixture.build_with(data, BuildOptions::default().dry_run());
    data.unwrap();
    assert_eq!(processes_run(&events), 0);
    assert_eq!(std::fs::read(&app).unwrap(), app_bytes);
    assert_eq!(std::fs::read(&graph_file).unwrap(), stored_before);

    // a real build afterwards still sees the change
    let data = fixture.setup(failing_resolver());
    let (data, events) = fixture.build(data);
    data.unwrap();
    assert_eq!(processes_run(&events), 2);
}

#[test]
fn keep_going_builds_independent_branches() {
    let fixture = Fixture::new();
    fixture.write_source("good.c", "fine\n");
    let good_rule = Arc::new(Rule {
        name: "good-compiler".into(),
        inputs: file_tags(["c"]),
        output_file_tags: file_tags(["application"]),
        requires_inputs: true,
        prepare_script: ScriptSource::new(
            r#"{"program": "cp", "arguments": ["$in", "$out"], "description": "copying"}"#,
            CodeLocation::new(&fixture.project_file, 10, 9),
        ),
        artifacts: vec![RuleArtifact {
            file_path: ScriptSource::new(
                r#""good.out""#,
                CodeLocation::new(&fixture.project_file, 11, 13),
            ),
            file_tags: file_tags(["application"]),
            always_updated: true,
            bindings: Vec::new(),
        }],
        ..Default::default()
    });
    let bad_rule = Arc::new(Rule {
        name: "bad-compiler".into(),
        output_file_tags: file_tags(["application"]),
        requires_inputs: false,
        prepare_script: ScriptSource::new(
            r#"{"program": "false", "description": "failing"}"#,
            CodeLocation::new(&fixture.project_file, 20, 9),
        ),
        artifacts: vec![RuleArtifact {
            file_path: ScriptSource::new(
                r#""bad.out""#,
                CodeLocation::new(&fixture.project_file, 21, 13),
            ),
            file_tags: file_tags(["application"]),
            always_updated: true,
            bindings: Vec::new(),
        }],
        ..Default::default()
    });

    let src_dir = fixture.src_dir.clone();
    let build_root = fixture.build_root.clone();
    let project_file = fixture.project_file.clone();
    let resolver = Box::new(FnResolver(move |params: &SetupParameters| {
        Ok(make_project(
            &src_dir,
            &build_root,
            &project_file,
            params,
            &[
                product_desc("good", &["good.c"], vec![good_rule.clone()]),
                product_desc("bad", &[], vec![bad_rule.clone()]),
            ],
        ))
    }));

    let data = fixture.setup(resolver);
    let good_out = fixture.product_build_dir(&data, "good").join("good.out");
    let (result, _) = fixture.build_with(data, BuildOptions::default().keep_going());
    let err = result.unwrap_err();
    assert!(!err.is_cancelled());
    // the independent branch still finished
    assert_eq!(std::fs::read_to_string(&good_out).unwrap(), "fine\n");
}
