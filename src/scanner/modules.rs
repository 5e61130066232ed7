//! The built-in C++ modules scanner.
//!
//! Detects `export module`/`module` declarations and `import` statements,
//! recording which module a file provides, whether it is an interface
//! unit, and which modules it requires. Requirements are resolved against
//! provides-module records of the same product rather than search paths.

use crate::{
    error::{Error, Result},
    language::PropertyMap,
    scanner::{DependencyScanner, ScanData},
    script::{EvalContext, ScriptRuntime},
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

pub const SCANNER_ID: &str = "cpp-modules-scanner";

static MODULE_DECL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(export\s+)?module\s+([\w.:]+)\s*;").unwrap());
static IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(?:export\s+)?import\s+([\w.:]+)\s*;").unwrap());

#[derive(Debug, Default)]
pub struct CppModulesScanner {
    _priv: (),
}

impl CppModulesScanner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DependencyScanner for CppModulesScanner {
    fn id(&self) -> &str {
        SCANNER_ID
    }

    fn recursive(&self) -> bool {
        false
    }

    fn collect_search_paths(
        &self,
        _artifact_properties: &PropertyMap,
        _runtime: &mut dyn ScriptRuntime,
        _ctx: &EvalContext,
    ) -> Result<Vec<std::path::PathBuf>> {
        Ok(Vec::new())
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
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ScanData::default())
            }
            Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
                return Ok(ScanData::default())
            }
            Err(err) => return Err(Error::io(err, file)),
        };
        let mut data = ScanData::default();
        if let Some(caps) = MODULE_DECL_RE.captures(&content) {
            data.is_interface_module = caps.get(1).is_some();
            data.provides_module = Some(caps[2].to_string());
        }
        for caps in IMPORT_RE.captures_iter(&content) {
            let name = caps[1].to_string();
            // a partition import refers back to the module itself
            if Some(&name) != data.provides_module.as_ref()
                && !data.module_dependencies.contains(&name)
            {
                data.module_dependencies.push(name);
            }
        }
        Ok(data)
    }

    fn module_properties_compatible(&self, _stored: &PropertyMap, _requested: &PropertyMap) -> bool {
        // module declarations only depend on the file contents
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::SimpleRuntime;
    use std::fs;

    #[test]
    fn detects_interface_and_imports() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("shapes.cppm");
        fs::write(
            &file,
            "export module shapes;\nimport geometry;\nimport std.core;\nexport import colors;\n",
        )
        .unwrap();
        let scanner = CppModulesScanner::new();
        let mut runtime = SimpleRuntime::new();
        let data = scanner
            .collect_dependencies(&file, "cppm", &mut runtime, &EvalContext::default())
            .unwrap();
        assert_eq!(data.provides_module.as_deref(), Some("shapes"));
        assert!(data.is_interface_module);
        assert_eq!(data.module_dependencies, ["geometry", "std.core", "colors"]);
    }

    #[test]
    fn implementation_unit_is_not_interface() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("shapes.cpp");
        fs::write(&file, "module shapes;\nimport geometry;\n").unwrap();
        let scanner = CppModulesScanner::new();
        let mut runtime = SimpleRuntime::new();
        let data = scanner
            .collect_dependencies(&file, "cpp", &mut runtime, &EvalContext::default())
            .unwrap();
        assert_eq!(data.provides_module.as_deref(), Some("shapes"));
        assert!(!data.is_interface_module);
    }
}
