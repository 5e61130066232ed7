//! The resolved project description the engine consumes.
//!
//! A [`TopLevelProject`] is produced by the external resolver (see
//! [`crate::ProjectResolver`]): products with their declarative rules,
//! wildcard-expanded source lists, interned module-property maps and the
//! probe records replayed by change tracking. Nothing in here is specific
//! to the build graph; the graph references these types read-only.

use crate::{
    error::CodeLocation,
    utils::FileTime,
};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

pub type JsonMap = serde_json::Map<String, serde_json::Value>;
pub type JsonValue = serde_json::Value;

/// A label used to match rule inputs and outputs and to classify artifacts.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileTag(String);

impl FileTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FileTag {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for FileTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type FileTags = BTreeSet<FileTag>;

/// Builds a [`FileTags`] set from string literals.
pub fn file_tags<I, S>(tags: I) -> FileTags
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    tags.into_iter().map(|t| FileTag::new(t)).collect()
}

/// An interned, shared module-property map.
///
/// Products hand the same map to all their artifacts; rule applications
/// clone it only when per-artifact bindings override values. Equality is
/// cheap pointer equality first, deep comparison second.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyMap(Arc<JsonMap>);

impl PropertyMap {
    pub fn new(map: JsonMap) -> Self {
        Self(Arc::new(map))
    }

    pub fn value(&self) -> &JsonMap {
        &self.0
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Stable key for interning the map in the persistence pool.
    pub fn intern_key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Looks up `modules.<module>.<path...>`.
    pub fn module_property(&self, module: &str, path: &[String]) -> Option<&JsonValue> {
        let mut value = self.0.get("modules")?.get(module)?;
        for key in path {
            value = value.get(key)?;
        }
        Some(value)
    }

    /// Deep-copies the map for modification; the result is a fresh,
    /// unshared instance.
    pub fn clone_detached(&self) -> JsonMap {
        (*self.0).clone()
    }

    /// Replaces `modules.<module>.<path...>` in a detached copy.
    /// Intermediate non-object values are overwritten by objects.
    pub fn with_module_property(
        &self,
        module: &str,
        path: &[String],
        value: JsonValue,
    ) -> PropertyMap {
        fn object_entry<'a>(map: &'a mut JsonMap, key: &str) -> &'a mut JsonMap {
            let slot = map
                .entry(key.to_string())
                .or_insert_with(|| JsonValue::Object(JsonMap::new()));
            if !slot.is_object() {
                *slot = JsonValue::Object(JsonMap::new());
            }
            match slot {
                JsonValue::Object(obj) => obj,
                _ => unreachable!(),
            }
        }

        let mut map = self.clone_detached();
        {
            let mut slot = object_entry(&mut map, "modules");
            slot = object_entry(slot, module);
            for key in &path[..path.len().saturating_sub(1)] {
                slot = object_entry(slot, key);
            }
            if let Some(last) = path.last() {
                slot.insert(last.clone(), value);
            }
        }
        PropertyMap::new(map)
    }
}

impl PartialEq for PropertyMap {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0 == other.0
    }
}

impl Eq for PropertyMap {}

/// A piece of evaluator source with its origin.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSource {
    pub source_code: String,
    pub location: CodeLocation,
}

impl ScriptSource {
    pub fn new(source_code: impl Into<String>, location: CodeLocation) -> Self {
        Self { source_code: source_code.into(), location }
    }

    /// Content fingerprint used by transformer change tracking.
    pub fn fingerprint(&self) -> String {
        hex::encode(Md5::digest(self.source_code.as_bytes()))
    }
}

/// A per-output binding of a static rule artifact,
/// `Artifact { cpp.defines: [...] }` style.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactBinding {
    /// Dotted module-property path, e.g. `["cpp", "defines"]`.
    pub name: Vec<String>,
    pub code: ScriptSource,
}

/// A declared output of a static rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleArtifact {
    /// Script producing the output path, evaluated per application.
    pub file_path: ScriptSource,
    pub file_tags: FileTags,
    pub always_updated: bool,
    pub bindings: Vec<ArtifactBinding>,
}

/// A declarative recipe mapping input file tags to output file tags.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub inputs: FileTags,
    pub inputs_from_dependencies: FileTags,
    pub auxiliary_inputs: FileTags,
    pub excluded_inputs: FileTags,
    pub explicitly_depends_on: FileTags,
    pub output_file_tags: FileTags,
    pub multiplex: bool,
    pub requires_inputs: bool,
    pub always_run: bool,
    pub prepare_script: ScriptSource,
    /// Present iff the rule is dynamic.
    pub output_artifacts_script: Option<ScriptSource>,
    /// Static output declarations; empty for dynamic rules.
    pub artifacts: Vec<RuleArtifact>,
}

impl Rule {
    pub fn is_dynamic(&self) -> bool {
        self.output_artifacts_script.is_some()
    }

    pub fn declares_inputs(&self) -> bool {
        !self.inputs.is_empty() || !self.inputs_from_dependencies.is_empty()
    }

    /// All output tags the rule can produce, including static artifact tags.
    pub fn collected_output_file_tags(&self) -> FileTags {
        let mut tags = self.output_file_tags.clone();
        for artifact in &self.artifacts {
            tags.extend(artifact.file_tags.iter().cloned());
        }
        tags
    }

    pub fn location(&self) -> &CodeLocation {
        &self.prepare_script.location
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ins: Vec<_> = self.inputs.iter().map(FileTag::as_str).collect();
        let outs: Vec<_> =
            self.collected_output_file_tags().iter().map(|t| t.to_string()).collect();
        write!(f, "{}: [{}] -> [{}]", self.name, ins.join(", "), outs.join(", "))
    }
}

/// Compares rules by identity; rules are shared via `Arc` within one
/// resolved project.
pub fn same_rule(a: &Arc<Rule>, b: &Arc<Rule>) -> bool {
    Arc::ptr_eq(a, b)
}

/// A user-defined dependency scanner attached to a product.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolvedScanner {
    pub id: String,
    pub inputs: FileTags,
    pub recursive: bool,
    pub search_paths_script: Option<ScriptSource>,
    pub scan_script: ScriptSource,
}

/// A file group inside a product, with its recorded source location so the
/// project-file updater can address it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub location: CodeLocation,
    pub prefix: String,
    pub files: Vec<PathBuf>,
    pub wildcards: Vec<String>,
    pub excluded_wildcards: Vec<String>,
    pub file_tags: FileTags,
}

/// A source file of a product after wildcard expansion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceArtifactDesc {
    pub file_path: PathBuf,
    pub file_tags: FileTags,
    pub properties: PropertyMap,
}

/// Index of a product inside its [`TopLevelProject`].
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ProductId(pub u32);

impl ProductId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedProduct {
    pub name: String,
    /// The product's own type tags; rules producing these are roots.
    pub product_file_tags: FileTags,
    pub location: CodeLocation,
    pub build_directory: PathBuf,
    pub module_properties: PropertyMap,
    /// Modules this product exports to products depending on it.
    pub exported_modules: JsonMap,
    pub rules: Vec<Arc<Rule>>,
    pub scanners: Vec<Arc<ResolvedScanner>>,
    pub groups: Vec<Group>,
    /// Wildcard-expanded sources.
    pub sources: Vec<SourceArtifactDesc>,
    /// Names of products this product depends on.
    pub dependencies: Vec<String>,
    /// The build environment commands run in.
    pub environment: BTreeMap<String, String>,
    pub enabled: bool,
}

impl ResolvedProduct {
    /// The file this product was defined in.
    pub fn defining_file(&self) -> &Path {
        &self.location.file_path
    }

    /// The set of source file paths, for wildcard-change detection.
    pub fn source_file_set(&self) -> BTreeSet<PathBuf> {
        self.sources.iter().map(|s| s.file_path.clone()).collect()
    }
}

/// A resolver-time observation whose replay value controls change tracking.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    pub id: String,
    pub location: CodeLocation,
    pub values: JsonValue,
}

/// Filesystem queries recorded during resolution, replayed on reload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FsProbes {
    pub canonical: BTreeMap<PathBuf, Option<PathBuf>>,
    pub exists: BTreeMap<PathBuf, bool>,
    pub dir_entries: BTreeMap<PathBuf, Vec<String>>,
    pub last_modified: BTreeMap<PathBuf, FileTime>,
}

impl FsProbes {
    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
            && self.exists.is_empty()
            && self.dir_entries.is_empty()
            && self.last_modified.is_empty()
    }
}

/// The root of a resolved project description.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TopLevelProject {
    pub products: Vec<ResolvedProduct>,
    /// The final build-configuration tree the project identity derives from.
    pub build_configuration: JsonValue,
    pub profile_configs: JsonMap,
    /// Environment snapshot taken at resolve time.
    pub environment: BTreeMap<String, String>,
    pub probes: Vec<Probe>,
    pub fs_probes: FsProbes,
    /// Imported build-system files (helper scripts etc.).
    pub build_system_files: BTreeSet<PathBuf>,
    /// Files generated by module providers.
    pub module_provider_files: BTreeSet<PathBuf>,
    pub last_start_resolve_time: FileTime,
    pub last_end_resolve_time: FileTime,
    /// All build directories live under this root.
    pub build_root: PathBuf,
}

impl TopLevelProject {
    /// Derives the configuration identity from the build-configuration
    /// tree. Stable across runs; maps serialize with sorted keys.
    pub fn project_id(&self) -> String {
        derive_project_id(&self.build_configuration)
    }

    pub fn build_directory(&self) -> PathBuf {
        self.build_root.join(self.project_id())
    }

    pub fn build_graph_file_path(&self) -> PathBuf {
        self.build_directory().join(format!("{}.bg", self.project_id()))
    }

    pub fn product(&self, name: &str) -> Option<&ResolvedProduct> {
        self.products.iter().find(|p| p.name == name)
    }

    pub fn product_id(&self, name: &str) -> Option<ProductId> {
        self.products.iter().position(|p| p.name == name).map(|i| ProductId(i as u32))
    }

    pub fn product_by_id(&self, id: ProductId) -> &ResolvedProduct {
        &self.products[id.index()]
    }

    /// Direct dependencies of `id`, as product ids.
    pub fn dependency_ids(&self, id: ProductId) -> Vec<ProductId> {
        self.products[id.index()]
            .dependencies
            .iter()
            .filter_map(|name| self.product_id(name))
            .collect()
    }
}

pub fn derive_project_id(configuration: &JsonValue) -> String {
    let canonical = serde_json::to_string(configuration).unwrap_or_default();
    let digest = Md5::digest(canonical.as_bytes());
    // Eight bytes are plenty to tell configurations apart.
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_id_is_stable() {
        let cfg = serde_json::json!({"target": {"buildVariant": "debug"}, "profile": "gcc"});
        assert_eq!(derive_project_id(&cfg), derive_project_id(&cfg.clone()));
        let other = serde_json::json!({"target": {"buildVariant": "release"}, "profile": "gcc"});
        assert_ne!(derive_project_id(&cfg), derive_project_id(&other));
    }

    #[test]
    fn property_map_override_detaches() {
        let base = PropertyMap::new(
            serde_json::json!({"modules": {"cc": {"flags": ["-O2"]}}})
                .as_object()
                .unwrap()
                .clone(),
        );
        let patched = base.with_module_property(
            "cc",
            &["flags".to_string()],
            serde_json::json!(["-O0"]),
        );
        assert!(!base.ptr_eq(&patched));
        assert_eq!(
            patched.module_property("cc", &["flags".to_string()]),
            Some(&serde_json::json!(["-O0"]))
        );
        assert_eq!(
            base.module_property("cc", &["flags".to_string()]),
            Some(&serde_json::json!(["-O2"]))
        );
    }

    #[test]
    fn collected_output_tags_include_static_artifacts() {
        let rule = Rule {
            name: "compiler".into(),
            output_file_tags: file_tags(["obj"]),
            artifacts: vec![RuleArtifact {
                file_path: ScriptSource::default(),
                file_tags: file_tags(["obj", "debuginfo"]),
                always_updated: true,
                bindings: Vec::new(),
            }],
            ..Default::default()
        };
        assert_eq!(rule.collected_output_file_tags(), file_tags(["obj", "debuginfo"]));
    }
}
