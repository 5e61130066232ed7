//! Dependency scanners discover the implicit edges of the build graph.
//!
//! Scanners are pluggable: the built-in include scanner handles C/C++
//! `#include`, the modules scanner handles C++ `import`/`export module`,
//! and products can attach script-defined scanners. Scan results are
//! cached per `(scanner, file)` and reused while the file's timestamp and
//! the relevant module properties stay compatible.

pub mod include;
pub mod modules;
pub mod user;

pub use include::IncludeScanner;
pub use modules::CppModulesScanner;
pub use user::UserScanner;

use crate::{
    error::{ErrorKind, Result},
    graph::{BuildGraph, NodeId},
    language::{FileTag, ProductId, PropertyMap, ResolvedScanner, TopLevelProject},
    pool::{PoolReader, PoolWriter},
    registry::FileResourceRef,
    script::{EvalContext, ScriptRuntime},
    utils::{self, FileTime},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Arc,
};

/// What a single file scan produced.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanData {
    pub dependencies: Vec<PathBuf>,
    pub module_dependencies: Vec<String>,
    pub provides_module: Option<String>,
    pub is_interface_module: bool,
}

/// The capability set every scanner implements.
pub trait DependencyScanner: Send {
    /// Stable identity, also the cache key component.
    fn id(&self) -> &str;

    /// Whether files discovered by this scanner are scanned as well.
    fn recursive(&self) -> bool;

    fn collect_search_paths(
        &self,
        artifact_properties: &PropertyMap,
        runtime: &mut dyn ScriptRuntime,
        ctx: &EvalContext,
    ) -> Result<Vec<PathBuf>>;

    fn collect_dependencies(
        &self,
        file: &Path,
        file_tags_hint: &str,
        runtime: &mut dyn ScriptRuntime,
        ctx: &EvalContext,
    ) -> Result<ScanData>;

    /// Whether a cached result taken under `stored` properties may serve a
    /// request under `requested` properties.
    fn module_properties_compatible(&self, stored: &PropertyMap, requested: &PropertyMap) -> bool;
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RawScanKey {
    pub scanner: String,
    pub file_path: PathBuf,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawScanResult {
    /// Property map the scan ran under.
    pub properties: PropertyMap,
    /// Timestamp of the file when it was scanned.
    pub timestamp: FileTime,
    pub data: ScanData,
    /// Search paths in effect during the scan.
    pub search_paths: Vec<PathBuf>,
}

/// The per-file scan cache, shared across products and builds.
#[derive(Debug, Default)]
pub struct RawScanResults {
    map: Mutex<BTreeMap<RawScanKey, RawScanResult>>,
}

impl RawScanResults {
    pub fn fetch(
        &self,
        scanner: &dyn DependencyScanner,
        file_path: &Path,
        requested: &PropertyMap,
        current_timestamp: FileTime,
    ) -> Option<RawScanResult> {
        let key =
            RawScanKey { scanner: scanner.id().to_string(), file_path: file_path.to_path_buf() };
        let map = self.map.lock();
        let result = map.get(&key)?;
        if result.timestamp != current_timestamp {
            return None;
        }
        if !scanner.module_properties_compatible(&result.properties, requested) {
            return None;
        }
        Some(result.clone())
    }

    pub fn insert(&self, scanner_id: &str, file_path: &Path, result: RawScanResult) {
        let key =
            RawScanKey { scanner: scanner_id.to_string(), file_path: file_path.to_path_buf() };
        self.map.lock().insert(key, result);
    }

    /// Finds the file whose scan under `scanner_id` declared it provides
    /// `module`.
    pub fn provider_of_module(&self, scanner_id: &str, module: &str) -> Option<PathBuf> {
        self.map
            .lock()
            .iter()
            .find(|(key, result)| {
                key.scanner == scanner_id
                    && result.data.provides_module.as_deref() == Some(module)
            })
            .map(|(key, _)| key.file_path.clone())
    }

    pub fn store(&self, writer: &mut PoolWriter) -> Result<()> {
        let map = self.map.lock();
        let entries: Vec<(&RawScanKey, &RawScanResult)> = map.iter().collect();
        writer.write_value(&entries)
    }

    pub fn load(reader: &mut PoolReader) -> Result<Self> {
        let entries: Vec<(RawScanKey, RawScanResult)> = reader.read_value()?;
        Ok(Self { map: Mutex::new(entries.into_iter().collect()) })
    }
}

/// Built-in and user scanners applicable to one product, by input tag.
pub struct ScannerRegistry {
    scanners: Vec<Arc<dyn DependencyScanner>>,
    by_tag: BTreeMap<FileTag, Vec<usize>>,
}

impl std::fmt::Debug for ScannerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.scanners.iter().map(|s| s.id()).collect();
        f.debug_struct("ScannerRegistry").field("scanners", &ids).finish()
    }
}

impl ScannerRegistry {
    /// Registers the built-in scanners under their conventional tags.
    pub fn with_builtins() -> Self {
        let mut registry = Self { scanners: Vec::new(), by_tag: BTreeMap::new() };
        let include = registry.add(Arc::new(IncludeScanner::new()));
        for tag in ["c", "cpp", "cxx", "objc", "objcpp", "h", "hpp"] {
            registry.by_tag.entry(FileTag::new(tag)).or_default().push(include);
        }
        let modules = registry.add(Arc::new(CppModulesScanner::new()));
        for tag in ["cpp", "cppm", "ixx"] {
            registry.by_tag.entry(FileTag::new(tag)).or_default().push(modules);
        }
        registry
    }

    fn add(&mut self, scanner: Arc<dyn DependencyScanner>) -> usize {
        self.scanners.push(scanner);
        self.scanners.len() - 1
    }

    /// Attaches a product's script-defined scanners.
    pub fn register_user_scanners(&mut self, scanners: &[Arc<ResolvedScanner>]) {
        for resolved in scanners {
            let index = self.add(Arc::new(UserScanner::new(resolved.clone())));
            for tag in &resolved.inputs {
                self.by_tag.entry(tag.clone()).or_default().push(index);
            }
        }
    }

    pub fn scanners_for_tags(&self, tags: &BTreeSet<FileTag>) -> Vec<Arc<dyn DependencyScanner>> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for tag in tags {
            for &index in self.by_tag.get(tag).into_iter().flatten() {
                if seen.insert(index) {
                    out.push(self.scanners[index].clone());
                }
            }
        }
        out
    }
}

/// Resolution of one scanned dependency, in priority order: artifact in
/// the product, artifact anywhere, known file dependency, fresh file
/// dependency for an existing on-disk file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolvedDependency {
    InProduct(NodeId),
    OtherProduct(NodeId),
    FileDependency(crate::graph::FileDepId),
    NewFile,
    Unresolved,
}

pub fn resolve_dependency(
    graph: &BuildGraph,
    product: ProductId,
    base_dir: &Path,
    search_paths: &[PathBuf],
    dependency: &Path,
) -> (PathBuf, ResolvedDependency) {
    let mut candidates = Vec::new();
    if dependency.is_absolute() {
        candidates.push(utils::clean_path(dependency));
    } else {
        candidates.push(utils::resolve_path(base_dir, dependency));
        for search_path in search_paths {
            candidates.push(utils::resolve_path(search_path, dependency));
        }
    }

    for candidate in &candidates {
        let mut in_product = None;
        let mut in_other = None;
        let mut file_dep = None;
        for resource in graph.registry.lookup_path(candidate) {
            match resource {
                FileResourceRef::Artifact(id) => {
                    let Some(artifact) = graph.artifact(id) else { continue };
                    if artifact.product == product {
                        in_product = Some(id);
                        break;
                    }
                    in_other.get_or_insert(id);
                }
                FileResourceRef::Dependency(id) => {
                    file_dep.get_or_insert(id);
                }
            }
        }
        if let Some(id) = in_product {
            return (candidate.clone(), ResolvedDependency::InProduct(id));
        }
        if let Some(id) = in_other {
            return (candidate.clone(), ResolvedDependency::OtherProduct(id));
        }
        if let Some(id) = file_dep {
            return (candidate.clone(), ResolvedDependency::FileDependency(id));
        }
        if candidate.is_file() {
            return (candidate.clone(), ResolvedDependency::NewFile);
        }
    }
    (
        candidates.into_iter().next().unwrap_or_else(|| dependency.to_path_buf()),
        ResolvedDependency::Unresolved,
    )
}

/// Scans the inputs of one generated artifact and rewires its
/// scanner-added children.
pub struct InputArtifactScanner<'a> {
    graph: &'a mut BuildGraph,
    project: &'a TopLevelProject,
    registry: &'a ScannerRegistry,
    runtime: &'a mut dyn ScriptRuntime,
    new_dependency_added: bool,
}

impl<'a> InputArtifactScanner<'a> {
    pub fn new(
        graph: &'a mut BuildGraph,
        project: &'a TopLevelProject,
        registry: &'a ScannerRegistry,
        runtime: &'a mut dyn ScriptRuntime,
    ) -> Self {
        Self { graph, project, registry, runtime, new_dependency_added: false }
    }

    /// Whether the last [`Self::scan`] discovered a dependency that was
    /// not yet a child; such artifacts must be rebuilt.
    pub fn new_dependency_added(&self) -> bool {
        self.new_dependency_added
    }

    pub fn scan(&mut self, artifact_id: NodeId) -> Result<()> {
        let Some(artifact) = self.graph.artifact(artifact_id) else { return Ok(()) };
        if artifact.inputs_scanned || !artifact.is_generated() {
            return Ok(());
        }
        let Some(transformer_id) = artifact.transformer else { return Ok(()) };
        trace!("scan inputs of {}", artifact.file_path.display());

        // scanner-added children are regenerated from scratch
        let old_scanner_children = artifact.children_added_by_scanner.clone();
        for child in old_scanner_children {
            self.graph.disconnect(artifact_id, child);
        }
        if let Some(artifact) = self.graph.artifact_mut(artifact_id) {
            artifact.inputs_scanned = true;
            artifact.file_dependencies.clear();
        }

        let inputs: Vec<NodeId> =
            self.graph.transformer(transformer_id).inputs.iter().copied().collect();
        for input in inputs {
            self.scan_input(artifact_id, input)?;
        }
        Ok(())
    }

    fn scan_input(&mut self, output_id: NodeId, input_id: NodeId) -> Result<()> {
        let Some(input) = self.graph.artifact(input_id) else { return Ok(()) };
        let scanners = self.registry.scanners_for_tags(&input.file_tags);
        if scanners.is_empty() {
            return Ok(());
        }
        let product = input.product;
        let properties = input.properties.clone();
        let tags_hint =
            input.file_tags.iter().map(FileTag::as_str).collect::<Vec<_>>().join(",");
        let first_file = input.file_path.clone();

        let ctx = self.eval_context(product, &first_file, &properties);
        for scanner in scanners {
            let search_paths =
                scanner.collect_search_paths(&properties, self.runtime, &ctx)?;
            let mut queue = vec![first_file.clone()];
            let mut visited = BTreeSet::new();
            while let Some(file) = queue.pop() {
                if !visited.insert(file.clone()) {
                    continue;
                }
                let follow_ups = self.scan_one_file(
                    output_id,
                    product,
                    scanner.as_ref(),
                    &ctx,
                    &file,
                    &tags_hint,
                    &properties,
                    &search_paths,
                )?;
                if scanner.recursive() {
                    queue.extend(follow_ups);
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_one_file(
        &mut self,
        output_id: NodeId,
        product: ProductId,
        scanner: &dyn DependencyScanner,
        ctx: &EvalContext,
        file: &Path,
        tags_hint: &str,
        properties: &PropertyMap,
        search_paths: &[PathBuf],
    ) -> Result<Vec<PathBuf>> {
        let timestamp = utils::file_time(file).unwrap_or_else(FileTime::oldest);
        let cached =
            self.graph.raw_scan_results.fetch(scanner, file, properties, timestamp);
        let result = match cached {
            Some(result) => result,
            None => {
                let data = scanner.collect_dependencies(file, tags_hint, self.runtime, ctx)?;
                let result = RawScanResult {
                    properties: properties.clone(),
                    timestamp,
                    data,
                    search_paths: search_paths.to_vec(),
                };
                self.graph.raw_scan_results.insert(scanner.id(), file, result.clone());
                result
            }
        };

        let mut follow_ups = Vec::new();
        let base_dir = file.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
        for dependency in &result.data.dependencies {
            let (path, resolved) =
                resolve_dependency(self.graph, product, &base_dir, search_paths, dependency);
            self.handle_dependency(output_id, &path, resolved)?;
            follow_ups.push(path);
        }
        for module in &result.data.module_dependencies {
            if let Some(provider) = self.find_module_provider(product, module) {
                let path = self
                    .graph
                    .artifact(provider)
                    .map(|a| a.file_path.clone())
                    .unwrap_or_default();
                self.handle_dependency(
                    output_id,
                    &path,
                    ResolvedDependency::InProduct(provider),
                )?;
            } else {
                debug!("required module '{module}' has no known provider");
            }
        }
        Ok(follow_ups)
    }

    fn handle_dependency(
        &mut self,
        output_id: NodeId,
        path: &Path,
        resolved: ResolvedDependency,
    ) -> Result<()> {
        match resolved {
            ResolvedDependency::InProduct(dep) | ResolvedDependency::OtherProduct(dep) => {
                if dep == output_id {
                    return Ok(());
                }
                let already_child = self.graph.node(output_id).children.contains(&dep);
                if !already_child {
                    match self.graph.safe_connect(output_id, dep) {
                        Ok(()) => self.new_dependency_added = true,
                        Err(err) if err.kind() == ErrorKind::Cycle => {
                            warn!("ignoring scanned dependency: {err}");
                            return Ok(());
                        }
                        Err(err) => return Err(err),
                    }
                }
                if let Some(artifact) = self.graph.artifact_mut(output_id) {
                    artifact.children_added_by_scanner.insert(dep);
                }
            }
            ResolvedDependency::FileDependency(dep) => {
                if let Some(artifact) = self.graph.artifact_mut(output_id) {
                    if artifact.file_dependencies.insert(dep) {
                        self.new_dependency_added = true;
                    }
                }
            }
            ResolvedDependency::NewFile => {
                let dep = self.graph.add_file_dependency(path.to_path_buf());
                if let Some(artifact) = self.graph.artifact_mut(output_id) {
                    artifact.file_dependencies.insert(dep);
                }
                self.new_dependency_added = true;
            }
            ResolvedDependency::Unresolved => {
                trace!("unresolved scanned dependency '{}'", path.display());
            }
        }
        Ok(())
    }

    /// Finds the in-product artifact whose scan declared it provides
    /// `module`.
    fn find_module_provider(&self, product: ProductId, module: &str) -> Option<NodeId> {
        let path = self
            .graph
            .raw_scan_results
            .provider_of_module(modules::SCANNER_ID, module)?;
        self.graph.lookup_artifact(product, &path)
    }

    fn eval_context(
        &self,
        product: ProductId,
        file_path: &Path,
        properties: &PropertyMap,
    ) -> EvalContext {
        let product_desc = self.project.product_by_id(product);
        let mut ctx = EvalContext::default();
        ctx.current_product = product_desc.name.clone();
        ctx.bind(
            "artifact",
            serde_json::json!({
                "filePath": file_path.to_string_lossy(),
                "fileName": file_path.file_name().map(|n| n.to_string_lossy().into_owned()),
                "modules": properties.value().get("modules").cloned(),
            }),
        );
        ctx.bind(
            "product",
            serde_json::json!({
                "name": product_desc.name,
                "buildDirectory": product_desc.build_directory.to_string_lossy(),
                "modules": product_desc.module_properties.value().get("modules").cloned(),
            }),
        );
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_cache_hit_requires_compatible_properties_and_timestamp() {
        let cache = RawScanResults::default();
        let scanner = IncludeScanner::new();
        let props = PropertyMap::new(
            serde_json::json!({"modules": {"cpp": {"includePaths": ["/inc"]}}})
                .as_object()
                .unwrap()
                .clone(),
        );
        let stamp = FileTime::now();
        cache.insert(
            scanner.id(),
            Path::new("/src/main.c"),
            RawScanResult {
                properties: props.clone(),
                timestamp: stamp,
                data: ScanData {
                    dependencies: vec![PathBuf::from("h.h")],
                    ..Default::default()
                },
                search_paths: vec![],
            },
        );
        assert!(cache.fetch(&scanner, Path::new("/src/main.c"), &props, stamp).is_some());
        // stale timestamp misses
        assert!(cache
            .fetch(&scanner, Path::new("/src/main.c"), &props, FileTime::now())
            .is_none());
        // incompatible include paths miss
        let other = PropertyMap::new(
            serde_json::json!({"modules": {"cpp": {"includePaths": ["/other"]}}})
                .as_object()
                .unwrap()
                .clone(),
        );
        assert!(cache.fetch(&scanner, Path::new("/src/main.c"), &other, stamp).is_none());
    }
}
