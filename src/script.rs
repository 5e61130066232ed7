//! The evaluator seam.
//!
//! Prepare scripts, output-artifacts scripts and scan scripts run in an
//! embedded scripting runtime that the engine treats as an external
//! collaborator behind [`ScriptRuntime`]. The engine supplies host
//! bindings via [`EvalContext`]; the runtime must report every property
//! read, imported file, dependency access and artifacts-map subscript it
//! performed, since those reports are the sole inputs to transformer
//! change tracking.
//!
//! [`SimpleRuntime`] is the built-in implementation: scripts are JSON
//! documents with `${dotted.path}` substitution against the host bindings
//! and `$in`/`$out` argument expansion. It is what the test suite uses and
//! is sufficient for embedders that describe commands declaratively.

use crate::{
    error::{Error, Result},
    language::{FileTag, JsonMap, JsonValue, ScriptSource},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

pub type ScriptValue = JsonValue;

/// One property read on a host-exposed object, with the value seen.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyRequest {
    /// Product the property was read from; empty means the rule's product.
    pub product: String,
    /// Module holding the property; empty for product-level properties.
    pub module: String,
    pub path: Vec<String>,
    pub value: JsonValue,
}

/// A property read on a specific artifact.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPropertyRequest {
    pub artifact: PathBuf,
    pub request: PropertyRequest,
}

/// An `artifacts.<tag>` subscript with the file paths it returned.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactsMapRequest {
    pub product: String,
    pub tag: FileTag,
    pub file_paths: BTreeSet<PathBuf>,
}

/// A dependency-product access and whether the product existed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRequest {
    pub product: String,
    pub found: bool,
}

/// An exported-modules read from a dependency product.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportsRequest {
    pub product: String,
    pub exported_modules: JsonMap,
}

/// Everything one evaluation observed. Drained via
/// [`ScriptRuntime::take_observations`] after each `evaluate` call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalObservations {
    pub properties_requested: Vec<PropertyRequest>,
    pub properties_requested_from_artifact: Vec<ArtifactPropertyRequest>,
    pub imported_files_used: Vec<PathBuf>,
    pub requested_dependencies: Vec<DependencyRequest>,
    pub requested_artifacts: Vec<ArtifactsMapRequest>,
    pub requested_exports: Vec<ExportsRequest>,
    /// The evaluation touched the filesystem; timestamp-based input
    /// re-checking stays armed for the rule.
    pub used_io: bool,
}

impl EvalObservations {
    pub fn merge(&mut self, other: EvalObservations) {
        self.properties_requested.extend(other.properties_requested);
        self.properties_requested_from_artifact.extend(other.properties_requested_from_artifact);
        self.imported_files_used.extend(other.imported_files_used);
        self.requested_dependencies.extend(other.requested_dependencies);
        self.requested_artifacts.extend(other.requested_artifacts);
        self.requested_exports.extend(other.requested_exports);
        self.used_io |= other.used_io;
    }
}

/// Host bindings for one evaluation.
///
/// `bindings` carries the objects a prepare script sees: `project`,
/// `product`, `inputs` (tag -> artifact list), `input`, `allInputs`,
/// `outputs`, `output`, `explicitlyDependsOn`, plus whatever extra scope
/// the caller adds (`fileName`, `fileTags` for artifact bindings).
#[derive(Clone, Debug, Default)]
pub struct EvalContext {
    pub bindings: JsonMap,
    /// Tag -> artifact objects of the rule's product (plus dependencies'
    /// target artifacts), backing `artifacts.<tag>`.
    pub artifacts_map: BTreeMap<FileTag, Vec<JsonValue>>,
    /// Exported modules by dependency product name.
    pub exports: BTreeMap<String, JsonMap>,
    pub current_product: String,
}

impl EvalContext {
    pub fn bind(&mut self, name: &str, value: JsonValue) {
        self.bindings.insert(name.to_string(), value);
    }
}

/// The sandboxed evaluator contract.
///
/// Implementations are not required to be thread-safe; the engine runs all
/// evaluations of one build on a single dedicated thread.
pub trait ScriptRuntime: Send {
    fn evaluate(&mut self, ctx: &EvalContext, script: &ScriptSource) -> Result<ScriptValue>;

    /// Returns and clears the records accumulated since the last call.
    fn take_observations(&mut self) -> EvalObservations;

    /// Asks a running evaluation to stop at the next opportunity.
    fn abort_evaluation(&mut self) {}
}

/// JSON-with-substitution evaluator.
///
/// The script source must parse as a JSON value. Strings may contain
/// `${dotted.path}` references into the context bindings; a string that is
/// exactly one reference takes the referenced value's type, otherwise the
/// reference is stringified in place. Array elements `"$in"`/`"$inputs"`
/// splice all input file paths, `"$out"` resolves to the first output file
/// path, `"$outputs"` splices all output file paths.
///
/// Reads under `product.modules.*`, `project.*`, `artifacts.*` and
/// `dependencies.*` are recorded as change-tracking observations.
#[derive(Debug, Default)]
pub struct SimpleRuntime {
    pending: EvalObservations,
}

impl SimpleRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&mut self, ctx: &EvalContext, path: &str, location: &ScriptSource) -> Result<JsonValue> {
        let segments: Vec<&str> = path.split('.').collect();
        match segments.first().copied() {
            Some("artifacts") => {
                let Some(tag) = segments.get(1) else {
                    return Err(Error::script(
                        "artifacts subscript needs a file tag",
                        location.location.clone(),
                    ));
                };
                let tag = FileTag::new(*tag);
                let artifacts =
                    ctx.artifacts_map.get(&tag).cloned().unwrap_or_default();
                self.pending.requested_artifacts.push(ArtifactsMapRequest {
                    product: ctx.current_product.clone(),
                    tag,
                    file_paths: artifacts
                        .iter()
                        .filter_map(|a| a.get("filePath"))
                        .filter_map(|p| p.as_str())
                        .map(PathBuf::from)
                        .collect(),
                });
                let value = JsonValue::Array(artifacts);
                Ok(descend(&value, &segments[2..]).cloned().unwrap_or(JsonValue::Null))
            }
            Some("dependencies") => {
                let Some(product) = segments.get(1) else {
                    return Err(Error::script(
                        "dependencies subscript needs a product name",
                        location.location.clone(),
                    ));
                };
                let exported = ctx.exports.get(*product);
                self.pending.requested_dependencies.push(DependencyRequest {
                    product: (*product).to_string(),
                    found: exported.is_some(),
                });
                let Some(exported) = exported else { return Ok(JsonValue::Null) };
                if segments.get(2) == Some(&"exports") {
                    self.pending.requested_exports.push(ExportsRequest {
                        product: (*product).to_string(),
                        exported_modules: exported.clone(),
                    });
                    let value = JsonValue::Object(exported.clone());
                    return Ok(descend(&value, &segments[3..]).cloned().unwrap_or(JsonValue::Null));
                }
                Ok(JsonValue::Null)
            }
            _ => {
                let value = ctx
                    .bindings
                    .get(segments[0])
                    .and_then(|v| descend(v, &segments[1..]))
                    .cloned()
                    .unwrap_or(JsonValue::Null);
                self.record_read(&segments, &value);
                Ok(value)
            }
        }
    }

    fn record_read(&mut self, segments: &[&str], value: &JsonValue) {
        match segments {
            ["product", "modules", module, rest @ ..] if !rest.is_empty() => {
                self.pending.properties_requested.push(PropertyRequest {
                    product: String::new(),
                    module: (*module).to_string(),
                    path: rest.iter().map(|s| s.to_string()).collect(),
                    value: value.clone(),
                });
            }
            ["project", rest @ ..] if !rest.is_empty() => {
                self.pending.properties_requested.push(PropertyRequest {
                    product: String::new(),
                    module: "project".to_string(),
                    path: rest.iter().map(|s| s.to_string()).collect(),
                    value: value.clone(),
                });
            }
            _ => {}
        }
    }

    fn substitute(
        &mut self,
        ctx: &EvalContext,
        text: &str,
        script: &ScriptSource,
    ) -> Result<JsonValue> {
        // A string that is exactly one reference keeps the value's type.
        if let Some(inner) = text.strip_prefix("${").and_then(|t| t.strip_suffix("}")) {
            if !inner.contains("${") {
                return self.lookup(ctx, inner, script);
            }
        }
        let mut out = String::new();
        let mut rest = text;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                return Err(Error::script(
                    format!("unterminated reference in '{text}'"),
                    script.location.clone(),
                ));
            };
            let value = self.lookup(ctx, &after[..end], script)?;
            match value {
                JsonValue::String(s) => out.push_str(&s),
                JsonValue::Null => {}
                other => out.push_str(&other.to_string()),
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(JsonValue::String(out))
    }

    fn walk(
        &mut self,
        ctx: &EvalContext,
        value: &JsonValue,
        script: &ScriptSource,
    ) -> Result<JsonValue> {
        match value {
            JsonValue::String(s) => self.substitute(ctx, s, script),
            JsonValue::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str() {
                        Some("$in") | Some("$inputs") => {
                            out.extend(file_paths_of(ctx.bindings.get("allInputs")));
                        }
                        Some("$out") => {
                            let paths = file_paths_of(ctx.bindings.get("outputs"));
                            if let Some(first) = paths.into_iter().next() {
                                out.push(first);
                            }
                        }
                        Some("$outputs") | Some("$outs") => {
                            out.extend(file_paths_of(ctx.bindings.get("outputs")));
                        }
                        _ => out.push(self.walk(ctx, item, script)?),
                    }
                }
                Ok(JsonValue::Array(out))
            }
            JsonValue::Object(map) => {
                let mut out = JsonMap::new();
                for (key, item) in map {
                    out.insert(key.clone(), self.walk(ctx, item, script)?);
                }
                Ok(JsonValue::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

fn file_paths_of(artifacts: Option<&JsonValue>) -> Vec<JsonValue> {
    artifacts
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|a| a.get("filePath"))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

fn descend<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut current = value;
    for segment in path {
        current = match current {
            JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            other => other.get(segment)?,
        };
    }
    Some(current)
}

impl ScriptRuntime for SimpleRuntime {
    fn evaluate(&mut self, ctx: &EvalContext, script: &ScriptSource) -> Result<ScriptValue> {
        let parsed: JsonValue = serde_json::from_str(&script.source_code).map_err(|err| {
            Error::script(format!("script is not valid JSON: {err}"), script.location.clone())
        })?;
        self.walk(ctx, &parsed, script)
    }

    fn take_observations(&mut self) -> EvalObservations {
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodeLocation;

    fn ctx_with_input() -> EvalContext {
        let mut ctx = EvalContext::default();
        ctx.current_product = "app".into();
        ctx.bind(
            "input",
            serde_json::json!({"filePath": "/src/main.c", "completeBaseName": "main"}),
        );
        ctx.bind(
            "allInputs",
            serde_json::json!([{"filePath": "/src/main.c"}, {"filePath": "/src/util.c"}]),
        );
        ctx.bind("outputs", serde_json::json!([{"filePath": "/build/app"}]));
        ctx.bind(
            "product",
            serde_json::json!({"name": "app", "modules": {"cc": {"compilerPath": "cc"}}}),
        );
        ctx
    }

    fn script(src: &str) -> ScriptSource {
        ScriptSource::new(src, CodeLocation::new("test.qry", 1, 1))
    }

    #[test]
    fn argument_expansion() {
        let mut rt = SimpleRuntime::new();
        let value = rt
            .evaluate(
                &ctx_with_input(),
                &script(r#"["${product.modules.cc.compilerPath}", "-o", "$out", "$in"]"#),
            )
            .unwrap();
        assert_eq!(
            value,
            serde_json::json!(["cc", "-o", "/build/app", "/src/main.c", "/src/util.c"])
        );
    }

    #[test]
    fn module_property_reads_are_observed() {
        let mut rt = SimpleRuntime::new();
        rt.evaluate(&ctx_with_input(), &script(r#""${product.modules.cc.compilerPath}""#))
            .unwrap();
        let obs = rt.take_observations();
        assert_eq!(obs.properties_requested.len(), 1);
        let req = &obs.properties_requested[0];
        assert_eq!(req.module, "cc");
        assert_eq!(req.path, ["compilerPath"]);
        assert_eq!(req.value, serde_json::json!("cc"));
        assert!(rt.take_observations().properties_requested.is_empty());
    }

    #[test]
    fn single_reference_keeps_type() {
        let mut rt = SimpleRuntime::new();
        let value =
            rt.evaluate(&ctx_with_input(), &script(r#""${allInputs}""#)).unwrap();
        assert!(value.is_array());
        let mixed = rt
            .evaluate(&ctx_with_input(), &script(r#""obj/${input.completeBaseName}.o""#))
            .unwrap();
        assert_eq!(mixed, serde_json::json!("obj/main.o"));
    }

    #[test]
    fn artifacts_map_access_is_recorded() {
        let mut rt = SimpleRuntime::new();
        let mut ctx = ctx_with_input();
        ctx.artifacts_map.insert(
            FileTag::new("obj"),
            vec![serde_json::json!({"filePath": "/build/main.o"})],
        );
        let value = rt.evaluate(&ctx, &script(r#""${artifacts.obj}""#)).unwrap();
        assert_eq!(value, serde_json::json!([{"filePath": "/build/main.o"}]));
        let obs = rt.take_observations();
        assert_eq!(obs.requested_artifacts.len(), 1);
        assert_eq!(obs.requested_artifacts[0].tag, FileTag::new("obj"));
        assert!(obs.requested_artifacts[0].file_paths.contains(&PathBuf::from("/build/main.o")));
    }
}
