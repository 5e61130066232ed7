//! Script-defined dependency scanners.

use crate::{
    error::{Error, ErrorKind, Result},
    language::{JsonValue, PropertyMap, ResolvedScanner},
    scanner::{DependencyScanner, ScanData},
    script::{EvalContext, ScriptRuntime},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Runs a product's `searchPathsScript` and `scanScript` in the script
/// runtime, with the scanned artifact exposed as a module-qualified value.
#[derive(Debug)]
pub struct UserScanner {
    scanner: Arc<ResolvedScanner>,
}

impl UserScanner {
    pub fn new(scanner: Arc<ResolvedScanner>) -> Self {
        Self { scanner }
    }
}

impl DependencyScanner for UserScanner {
    fn id(&self) -> &str {
        &self.scanner.id
    }

    fn recursive(&self) -> bool {
        self.scanner.recursive
    }

    fn collect_search_paths(
        &self,
        _artifact_properties: &PropertyMap,
        runtime: &mut dyn ScriptRuntime,
        ctx: &EvalContext,
    ) -> Result<Vec<PathBuf>> {
        let Some(script) = &self.scanner.search_paths_script else {
            return Ok(Vec::new());
        };
        let value = runtime.evaluate(ctx, script)?;
        string_paths(&value).ok_or_else(|| {
            Error::script(
                "searchPaths script must return an array of strings",
                script.location.clone(),
            )
        })
    }

    fn collect_dependencies(
        &self,
        file: &Path,
        _file_tags_hint: &str,
        runtime: &mut dyn ScriptRuntime,
        ctx: &EvalContext,
    ) -> Result<ScanData> {
        let mut ctx = ctx.clone();
        ctx.bind("filePath", JsonValue::String(file.to_string_lossy().into_owned()));
        let value = runtime.evaluate(&ctx, &self.scanner.scan_script)?;
        let dependencies = string_paths(&value).ok_or_else(|| {
            Error::with_location(
                ErrorKind::Script,
                "scan script must return an array of strings",
                self.scanner.scan_script.location.clone(),
            )
        })?;
        Ok(ScanData { dependencies, ..Default::default() })
    }

    fn module_properties_compatible(&self, stored: &PropertyMap, requested: &PropertyMap) -> bool {
        // user scripts may read anything, so only identical maps qualify
        stored == requested
    }
}

fn string_paths(value: &JsonValue) -> Option<Vec<PathBuf>> {
    let items = value.as_array()?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(PathBuf::from(item.as_str()?));
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::CodeLocation,
        language::{file_tags, ScriptSource},
        script::SimpleRuntime,
    };

    fn scanner() -> UserScanner {
        UserScanner::new(Arc::new(ResolvedScanner {
            id: "idl-scanner".into(),
            inputs: file_tags(["idl"]),
            recursive: false,
            search_paths_script: Some(ScriptSource::new(
                r#"["${product.buildDirectory}"]"#,
                CodeLocation::new("scanner.qry", 3, 1),
            )),
            scan_script: ScriptSource::new(
                r#"["common.idl"]"#,
                CodeLocation::new("scanner.qry", 4, 1),
            ),
        }))
    }

    #[test]
    fn scripts_drive_paths_and_dependencies() {
        let scanner = scanner();
        let mut runtime = SimpleRuntime::new();
        let mut ctx = EvalContext::default();
        ctx.bind("product", serde_json::json!({"buildDirectory": "/build"}));
        let paths = scanner
            .collect_search_paths(&PropertyMap::default(), &mut runtime, &ctx)
            .unwrap();
        assert_eq!(paths, vec![PathBuf::from("/build")]);
        let data = scanner
            .collect_dependencies(Path::new("/src/a.idl"), "idl", &mut runtime, &ctx)
            .unwrap();
        assert_eq!(data.dependencies, vec![PathBuf::from("common.idl")]);
    }
}
