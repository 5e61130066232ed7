//! The built-in C/C++ `#include` scanner.

use crate::{
    error::{Error, Result},
    language::{JsonValue, PropertyMap},
    scanner::{DependencyScanner, ScanData},
    script::{EvalContext, ScriptRuntime},
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

static INCLUDE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?m)^\s*#\s*include\s*["<]([^">]+)[">]"#).unwrap());

/// Keys of the `cpp` module that determine where headers are looked up.
/// System, distribution and compiler paths only count when the product
/// opts in via `cpp.treatSystemHeadersAsDependencies`.
const SEARCH_PATH_KEYS: [&str; 1] = ["includePaths"];
const SYSTEM_SEARCH_PATH_KEYS: [&str; 3] =
    ["systemIncludePaths", "distributionIncludePaths", "compilerIncludePaths"];

#[derive(Debug, Default)]
pub struct IncludeScanner {
    _priv: (),
}

impl IncludeScanner {
    pub fn new() -> Self {
        Self::default()
    }

    fn cpp_value<'a>(properties: &'a PropertyMap, key: &str) -> Option<&'a JsonValue> {
        properties.module_property("cpp", &[key.to_string()])
    }

    fn paths_from(properties: &PropertyMap, key: &str) -> Vec<PathBuf> {
        Self::cpp_value(properties, key)
            .and_then(JsonValue::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(JsonValue::as_str)
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn scan_relevant_cpp_state(properties: &PropertyMap) -> Vec<JsonValue> {
        let mut state = Vec::new();
        for key in SEARCH_PATH_KEYS.iter().chain(SYSTEM_SEARCH_PATH_KEYS.iter()) {
            state.push(Self::cpp_value(properties, key).cloned().unwrap_or(JsonValue::Null));
        }
        state.push(
            Self::cpp_value(properties, "treatSystemHeadersAsDependencies")
                .cloned()
                .unwrap_or(JsonValue::Null),
        );
        state
    }
}

impl DependencyScanner for IncludeScanner {
    fn id(&self) -> &str {
        "cpp-include-scanner"
    }

    fn recursive(&self) -> bool {
        true
    }

    fn collect_search_paths(
        &self,
        artifact_properties: &PropertyMap,
        _runtime: &mut dyn ScriptRuntime,
        _ctx: &EvalContext,
    ) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for key in SEARCH_PATH_KEYS {
            paths.extend(Self::paths_from(artifact_properties, key));
        }
        let system_headers_count = Self::cpp_value(
            artifact_properties,
            "treatSystemHeadersAsDependencies",
        )
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
        if system_headers_count {
            for key in SYSTEM_SEARCH_PATH_KEYS {
                paths.extend(Self::paths_from(artifact_properties, key));
            }
        }
        Ok(paths)
    }

    fn collect_dependencies(
        &self,
        file: &Path,
        _file_tags_hint: &str,
        _runtime: &mut dyn ScriptRuntime,
        _ctx: &EvalContext,
    ) -> Result<ScanData> {
        let content = match std::fs::read_to_string(file) {
            Ok(content) => content,
            // binary or vanished files simply yield no dependencies
            Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
                return Ok(ScanData::default())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ScanData::default())
            }
            Err(err) => return Err(Error::io(err, file)),
        };
        let dependencies = INCLUDE_RE
            .captures_iter(&content)
            .map(|caps| PathBuf::from(&caps[1]))
            .collect();
        Ok(ScanData { dependencies, ..Default::default() })
    }

    fn module_properties_compatible(&self, stored: &PropertyMap, requested: &PropertyMap) -> bool {
        Self::scan_relevant_cpp_state(stored) == Self::scan_relevant_cpp_state(requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::SimpleRuntime;
    use std::fs;

    #[test]
    fn finds_quoted_and_angled_includes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.c");
        fs::write(
            &file,
            "#include \"h.h\"\n #  include <sys/types.h>\nint main() { return 0; }\n// #include \"ignored\" is still matched only at line starts\n",
        )
        .unwrap();
        let scanner = IncludeScanner::new();
        let mut runtime = SimpleRuntime::new();
        let data = scanner
            .collect_dependencies(&file, "c", &mut runtime, &EvalContext::default())
            .unwrap();
        assert_eq!(
            data.dependencies,
            vec![PathBuf::from("h.h"), PathBuf::from("sys/types.h")]
        );
    }

    #[test]
    fn system_paths_are_opt_in() {
        let props = |system: bool| {
            PropertyMap::new(
                serde_json::json!({"modules": {"cpp": {
                    "includePaths": ["/inc"],
                    "systemIncludePaths": ["/usr/include"],
                    "treatSystemHeadersAsDependencies": system,
                }}})
                .as_object()
                .unwrap()
                .clone(),
            )
        };
        let scanner = IncludeScanner::new();
        let mut runtime = SimpleRuntime::new();
        let without = scanner
            .collect_search_paths(&props(false), &mut runtime, &EvalContext::default())
            .unwrap();
        assert_eq!(without, vec![PathBuf::from("/inc")]);
        let with = scanner
            .collect_search_paths(&props(true), &mut runtime, &EvalContext::default())
            .unwrap();
        assert!(with.contains(&PathBuf::from("/usr/include")));
    }
}
