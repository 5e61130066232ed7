//! The script-command executor.
//!
//! Script engines are not thread-safe, so all command-time evaluations run
//! on one dedicated thread owning a private runtime. Worker threads hand
//! over `(source, context)` pairs and block on the reply. The evaluated
//! value is a list of file operations which the calling worker applies;
//! the runtime itself stays free of side effects.

use crate::{
    error::{Error, ErrorKind, Result},
    language::{JsonValue, ScriptSource},
    script::{EvalContext, EvalObservations, ScriptRuntime},
    utils,
};
use std::{
    path::{Path, PathBuf},
    sync::mpsc::{channel, Sender},
};

struct ScriptTask {
    source: ScriptSource,
    ctx: EvalContext,
    reply: Sender<Result<(JsonValue, EvalObservations)>>,
}

/// Owns the dedicated evaluation thread. The thread exits once the last
/// [`ScriptExecutorHandle`] is gone; handles may outlive this owner, so
/// dropping it never blocks.
pub struct ScriptCommandExecutor {
    sender: Sender<ScriptTask>,
}

impl std::fmt::Debug for ScriptCommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptCommandExecutor").finish()
    }
}

impl ScriptCommandExecutor {
    pub fn new(mut runtime: Box<dyn ScriptRuntime>) -> Self {
        let (sender, receiver) = channel::<ScriptTask>();
        std::thread::Builder::new()
            .name("quarry-script".into())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    let value = runtime.evaluate(&task.ctx, &task.source);
                    let observations = runtime.take_observations();
                    let _ = task.reply.send(value.map(|v| (v, observations)));
                }
            })
            .expect("cannot spawn script thread");
        Self { sender }
    }

    /// A cloneable handle workers use to submit evaluations.
    pub fn handle(&self) -> ScriptExecutorHandle {
        ScriptExecutorHandle { sender: self.sender.clone() }
    }
}

#[derive(Clone)]
pub struct ScriptExecutorHandle {
    sender: Sender<ScriptTask>,
}

impl ScriptExecutorHandle {
    pub fn evaluate(
        &self,
        source: &ScriptSource,
        ctx: &EvalContext,
    ) -> Result<(JsonValue, EvalObservations)> {
        let (reply, receiver) = channel();
        self.sender
            .send(ScriptTask { source: source.clone(), ctx: ctx.clone(), reply })
            .map_err(|_| Error::internal("script thread is gone"))?;
        receiver
            .recv()
            .map_err(|_| Error::internal("script thread dropped the reply"))?
    }
}

/// Applies the file operations a script command evaluated to.
///
/// Supported operations: `{"op": "write", "filePath": ..., "contents": ...}`,
/// `{"op": "copy", "sourcePath": ..., "filePath": ...}`,
/// `{"op": "mkdir", "filePath": ...}` and
/// `{"op": "delete", "filePath": ...}`.
pub fn apply_file_operations(value: &JsonValue, location: &crate::error::CodeLocation) -> Result<()> {
    let ops: Vec<&serde_json::Map<String, JsonValue>> = match value {
        JsonValue::Array(items) => items
            .iter()
            .map(|item| {
                item.as_object().ok_or_else(|| {
                    Error::script("file operations must be objects", location.clone())
                })
            })
            .collect::<Result<_>>()?,
        JsonValue::Null => Vec::new(),
        JsonValue::Object(map) => vec![map],
        _ => {
            return Err(Error::script(
                "script command must evaluate to file operations",
                location.clone(),
            ))
        }
    };
    for op in ops {
        let kind = op.get("op").and_then(JsonValue::as_str).unwrap_or("write");
        let file_path = op
            .get("filePath")
            .and_then(JsonValue::as_str)
            .map(PathBuf::from)
            .ok_or_else(|| {
                Error::script("file operation needs a 'filePath'", location.clone())
            })?;
        match kind {
            "write" => {
                let contents =
                    op.get("contents").and_then(JsonValue::as_str).unwrap_or_default();
                utils::create_parent_dir_all(&file_path)?;
                std::fs::write(&file_path, contents)
                    .map_err(|err| Error::io(err, &file_path))?;
            }
            "copy" => {
                let source = op
                    .get("sourcePath")
                    .and_then(JsonValue::as_str)
                    .map(PathBuf::from)
                    .ok_or_else(|| {
                        Error::script("copy operation needs a 'sourcePath'", location.clone())
                    })?;
                utils::create_parent_dir_all(&file_path)?;
                std::fs::copy(&source, &file_path)
                    .map_err(|err| Error::io(err, &source))?;
            }
            "mkdir" => {
                std::fs::create_dir_all(&file_path)
                    .map_err(|err| Error::io(err, &file_path))?;
            }
            "delete" => {
                remove_if_exists(&file_path)?;
            }
            other => {
                return Err(Error::with_location(
                    ErrorKind::Script,
                    format!("unknown file operation '{other}'"),
                    location.clone(),
                ))
            }
        }
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::io(err, path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::CodeLocation, script::SimpleRuntime};

    #[test]
    fn evaluates_on_dedicated_thread_and_applies_ops() {
        let executor = ScriptCommandExecutor::new(Box::new(SimpleRuntime::new()));
        let handle = executor.handle();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("marker.txt");
        let mut ctx = EvalContext::default();
        ctx.bind("outFile", serde_json::json!(out.to_string_lossy()));
        let source = ScriptSource::new(
            r#"[{"op": "write", "filePath": "${outFile}", "contents": "made by script"}]"#,
            CodeLocation::new("p.qry", 10, 1),
        );
        let (value, _) = handle.evaluate(&source, &ctx).unwrap();
        apply_file_operations(&value, &source.location).unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "made by script");
    }
}
