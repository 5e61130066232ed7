//! Command descriptors produced by rule prepare scripts.

use crate::{
    error::{CodeLocation, Error, ErrorKind, Result},
    language::{JsonMap, JsonValue, ScriptSource},
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf};

/// How much of a command the build log shows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandEchoMode {
    Silent,
    #[default]
    Summary,
    CommandLine,
}

/// An external process invocation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessCommand {
    pub program: String,
    pub arguments: Vec<String>,
    pub working_directory: PathBuf,
    /// Explicit overrides applied on top of the build environment.
    pub environment: BTreeMap<String, String>,
    /// Build-environment keys the command declares relevant; their values
    /// are re-sampled from the product environment at execution time.
    pub relevant_environment_keys: Vec<String>,
    /// Snapshot of the relevant keys taken when the command was created.
    pub captured_environment: BTreeMap<String, String>,
    pub description: String,
    pub silent: bool,
    pub job_pool: Option<String>,
    pub ignore_dry_run: bool,
    /// Seconds until the process is considered hung.
    pub timeout: Option<u64>,
}

/// An evaluator command; runs on the dedicated script thread. The value it
/// returns is a list of file operations applied by the executor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptCommand {
    pub source: ScriptSource,
    /// Extra bindings visible to the command on top of the transformer's.
    pub scope: JsonMap,
    pub description: String,
    pub silent: bool,
    pub job_pool: Option<String>,
    pub ignore_dry_run: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Process(ProcessCommand),
    Script(ScriptCommand),
}

impl Command {
    pub fn description(&self) -> &str {
        match self {
            Command::Process(c) => &c.description,
            Command::Script(c) => &c.description,
        }
    }

    pub fn is_silent(&self) -> bool {
        match self {
            Command::Process(c) => c.silent,
            Command::Script(c) => c.silent,
        }
    }

    pub fn job_pool(&self) -> Option<&str> {
        match self {
            Command::Process(c) => c.job_pool.as_deref(),
            Command::Script(c) => c.job_pool.as_deref(),
        }
    }

    pub fn ignore_dry_run(&self) -> bool {
        match self {
            Command::Process(c) => c.ignore_dry_run,
            Command::Script(c) => c.ignore_dry_run,
        }
    }
}

/// Interprets a prepare script's return value as a command list.
///
/// The value may be a single command object or an array of them; each
/// object carries `type: "process" | "script"`.
pub fn commands_from_script_value(
    value: &JsonValue,
    location: &CodeLocation,
) -> Result<Vec<Command>> {
    let objects: Vec<&JsonMap> = match value {
        JsonValue::Array(items) => items
            .iter()
            .map(|item| {
                item.as_object().ok_or_else(|| {
                    Error::script("command list elements must be objects", location.clone())
                })
            })
            .collect::<Result<_>>()?,
        JsonValue::Object(map) => vec![map],
        _ => {
            return Err(Error::script(
                "prepare script must return a command or a list of commands",
                location.clone(),
            ))
        }
    };
    objects.into_iter().map(|obj| command_from_object(obj, location)).collect()
}

fn command_from_object(obj: &JsonMap, location: &CodeLocation) -> Result<Command> {
    let kind = obj.get("type").and_then(JsonValue::as_str).unwrap_or("process");
    let description = string_field(obj, "description");
    let silent = obj.get("silent").and_then(JsonValue::as_bool).unwrap_or(false);
    let job_pool = obj.get("jobPool").and_then(JsonValue::as_str).map(str::to_string);
    let ignore_dry_run =
        obj.get("ignoreDryRun").and_then(JsonValue::as_bool).unwrap_or(false);
    match kind {
        "process" => {
            let program = obj
                .get("program")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| {
                    Error::script("process command needs a 'program'", location.clone())
                })?
                .to_string();
            Ok(Command::Process(ProcessCommand {
                program,
                arguments: string_list(obj.get("arguments")),
                working_directory: PathBuf::from(string_field(obj, "workingDirectory")),
                environment: string_map(obj.get("environment")),
                relevant_environment_keys: string_list(obj.get("relevantEnvironmentVariables")),
                captured_environment: BTreeMap::new(),
                description,
                silent,
                job_pool,
                ignore_dry_run,
                timeout: obj.get("timeout").and_then(JsonValue::as_u64),
            }))
        }
        "script" => {
            let source = obj
                .get("sourceCode")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| {
                    Error::script("script command needs 'sourceCode'", location.clone())
                })?;
            Ok(Command::Script(ScriptCommand {
                source: ScriptSource::new(source, location.clone()),
                scope: obj
                    .get("scope")
                    .and_then(JsonValue::as_object)
                    .cloned()
                    .unwrap_or_default(),
                description,
                silent,
                job_pool,
                ignore_dry_run,
            }))
        }
        other => Err(Error::with_location(
            ErrorKind::Script,
            format!("unknown command type '{other}'"),
            location.clone(),
        )),
    }
}

fn string_field(obj: &JsonMap, key: &str) -> String {
    obj.get(key).and_then(JsonValue::as_str).unwrap_or_default().to_string()
}

fn string_list(value: Option<&JsonValue>) -> Vec<String> {
    value
        .and_then(JsonValue::as_array)
        .map(|items| {
            items.iter().filter_map(JsonValue::as_str).map(str::to_string).collect()
        })
        .unwrap_or_default()
}

fn string_map(value: Option<&JsonValue>) -> BTreeMap<String, String> {
    value
        .and_then(JsonValue::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_process_command() {
        let value = serde_json::json!({
            "program": "cc",
            "arguments": ["-c", "-o", "main.o", "main.c"],
            "description": "compiling main.c",
            "jobPool": "compiler"
        });
        let commands =
            commands_from_script_value(&value, &CodeLocation::new("p.qry", 1, 1)).unwrap();
        assert_eq!(commands.len(), 1);
        let Command::Process(cmd) = &commands[0] else { panic!("expected process command") };
        assert_eq!(cmd.program, "cc");
        assert_eq!(cmd.arguments.len(), 4);
        assert_eq!(commands[0].job_pool(), Some("compiler"));
    }

    #[test]
    fn parses_command_array_with_script() {
        let value = serde_json::json!([
            {"program": "touch", "arguments": ["x"]},
            {"type": "script", "sourceCode": "[]", "description": "bookkeeping"}
        ]);
        let commands =
            commands_from_script_value(&value, &CodeLocation::new("p.qry", 2, 1)).unwrap();
        assert_eq!(commands.len(), 2);
        assert!(matches!(commands[1], Command::Script(_)));
    }

    #[test]
    fn rejects_non_command_value() {
        let err = commands_from_script_value(
            &serde_json::json!(42),
            &CodeLocation::new("p.qry", 3, 1),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Script);
    }
}
