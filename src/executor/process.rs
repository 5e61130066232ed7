//! Process spawning and the process-command executor.

use crate::{
    commands::ProcessCommand,
    error::{Error, ErrorKind, Result},
    utils::FileTime,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io::Read,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Outcome of one spawned process, reported in command-finish order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub program: String,
    pub arguments: Vec<String>,
    pub working_directory: PathBuf,
    pub exit_code: i32,
    pub success: bool,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// A running process owned by the host.
pub trait ProcessHandle: Send {
    /// Waits for completion, polling `cancel`; a timeout or cancellation
    /// terminates the process (soft, then hard after the grace period).
    fn wait(
        &mut self,
        timeout: Option<Duration>,
        cancel: &AtomicBool,
        grace: Duration,
    ) -> Result<ProcessResult>;

    fn terminate(&mut self, hard: bool);
}

/// The process-spawning seam; also answers the filesystem queries whose
/// results are recorded as probes.
pub trait ProcessHost: Send + Sync {
    fn spawn(
        &self,
        program: &str,
        arguments: &[String],
        environment: &BTreeMap<String, String>,
        working_directory: &Path,
    ) -> Result<Box<dyn ProcessHandle>>;

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn canonical(&self, path: &Path) -> Option<PathBuf> {
        crate::utils::canonicalize(path).ok()
    }

    fn last_modified(&self, path: &Path) -> Option<FileTime> {
        crate::utils::file_time(path)
    }

    fn entries(&self, dir: &Path) -> Vec<String> {
        let mut entries: Vec<String> = std::fs::read_dir(dir)
            .map(|iter| {
                iter.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        entries.sort();
        entries
    }
}

/// [`ProcessHost`] over `std::process`.
#[derive(Debug, Default)]
pub struct SystemProcessHost;

impl ProcessHost for SystemProcessHost {
    fn spawn(
        &self,
        program: &str,
        arguments: &[String],
        environment: &BTreeMap<String, String>,
        working_directory: &Path,
    ) -> Result<Box<dyn ProcessHandle>> {
        let mut command = Command::new(program);
        command.args(arguments).stdout(Stdio::piped()).stderr(Stdio::piped());
        if !working_directory.as_os_str().is_empty() {
            command.current_dir(working_directory);
        }
        for (key, value) in environment {
            command.env(key, value);
        }
        let mut child = command.spawn().map_err(|err| {
            Error::new(ErrorKind::Io, format!("cannot start process '{program}': {err}"))
        })?;
        // drain pipes concurrently; a full pipe must never block the child
        let stdout_reader = child.stdout.take().map(spawn_pipe_reader);
        let stderr_reader = child.stderr.take().map(spawn_pipe_reader);
        Ok(Box::new(SystemProcessHandle {
            child,
            program: program.to_string(),
            arguments: arguments.to_vec(),
            working_directory: working_directory.to_path_buf(),
            stdout_reader,
            stderr_reader,
        }))
    }
}

fn spawn_pipe_reader<R: Read + Send + 'static>(
    mut pipe: R,
) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = String::new();
        let _ = pipe.read_to_string(&mut buf);
        buf
    })
}

struct SystemProcessHandle {
    child: Child,
    program: String,
    arguments: Vec<String>,
    working_directory: PathBuf,
    stdout_reader: Option<std::thread::JoinHandle<String>>,
    stderr_reader: Option<std::thread::JoinHandle<String>>,
}

impl SystemProcessHandle {
    fn drain_output(&mut self) -> (Vec<String>, Vec<String>) {
        let stdout = self
            .stdout_reader
            .take()
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();
        let stderr = self
            .stderr_reader
            .take()
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();
        (
            stdout.lines().map(str::to_string).collect(),
            stderr.lines().map(str::to_string).collect(),
        )
    }

    fn result(&mut self, exit_code: i32, success: bool) -> ProcessResult {
        let (stdout, stderr) = self.drain_output();
        ProcessResult {
            program: self.program.clone(),
            arguments: self.arguments.clone(),
            working_directory: self.working_directory.clone(),
            exit_code,
            success,
            stdout,
            stderr,
        }
    }
}

impl ProcessHandle for SystemProcessHandle {
    fn wait(
        &mut self,
        timeout: Option<Duration>,
        cancel: &AtomicBool,
        grace: Duration,
    ) -> Result<ProcessResult> {
        let start = Instant::now();
        let poll = Duration::from_millis(10);
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    let code = status.code().unwrap_or(-1);
                    return Ok(self.result(code, status.success()));
                }
                Ok(None) => {}
                Err(err) => return Err(Error::io(err, &self.program)),
            }
            if cancel.load(Ordering::Relaxed) {
                self.terminate(false);
                let hard_deadline = Instant::now() + grace;
                while Instant::now() < hard_deadline {
                    if let Ok(Some(_)) = self.child.try_wait() {
                        break;
                    }
                    std::thread::sleep(poll);
                }
                self.terminate(true);
                let _ = self.child.wait();
                return Err(Error::cancelled());
            }
            if let Some(timeout) = timeout {
                if start.elapsed() > timeout {
                    self.terminate(true);
                    let _ = self.child.wait();
                    let mut result = self.result(-1, false);
                    result.stderr.push(format!(
                        "process '{}' timed out after {} seconds",
                        self.program,
                        timeout.as_secs()
                    ));
                    return Ok(result);
                }
            }
            std::thread::sleep(poll);
        }
    }

    fn terminate(&mut self, hard: bool) {
        // std::process only offers the hard kill; a soft request is a
        // best-effort kill as well
        let _ = hard;
        let _ = self.child.kill();
    }
}

/// Runs one process command to completion.
pub fn execute_process_command(
    host: &dyn ProcessHost,
    command: &ProcessCommand,
    build_environment: &BTreeMap<String, String>,
    default_working_directory: &Path,
    cancel: &Arc<AtomicBool>,
    grace: Duration,
) -> Result<ProcessResult> {
    let mut environment = build_environment.clone();
    // the declared-relevant keys are re-sampled from the build environment
    for key in &command.relevant_environment_keys {
        if let Some(value) = build_environment.get(key) {
            environment.insert(key.clone(), value.clone());
        }
    }
    for (key, value) in &command.environment {
        environment.insert(key.clone(), value.clone());
    }
    let working_directory = if command.working_directory.as_os_str().is_empty() {
        default_working_directory
    } else {
        &command.working_directory
    };
    let mut handle =
        host.spawn(&command.program, &command.arguments, &environment, working_directory)?;
    handle.wait(command.timeout.map(Duration::from_secs), cancel, grace)
}

/// Converts a failed [`ProcessResult`] into the error reported for its
/// transformer.
pub fn process_failure_error(result: &ProcessResult) -> Error {
    let mut err = Error::new(
        ErrorKind::Io,
        format!(
            "process '{} {}' failed with exit code {}",
            result.program,
            result.arguments.join(" "),
            result.exit_code
        ),
    );
    for line in &result.stderr {
        err = err.append(line.clone());
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_a_process_and_captures_output() {
        let host = SystemProcessHost;
        let command = ProcessCommand {
            program: "echo".into(),
            arguments: vec!["hello".into()],
            ..Default::default()
        };
        let cancel = Arc::new(AtomicBool::new(false));
        let result = execute_process_command(
            &host,
            &command,
            &BTreeMap::new(),
            Path::new("."),
            &cancel,
            Duration::from_millis(100),
        )
        .unwrap();
        assert!(result.success);
        assert_eq!(result.stdout, vec!["hello"]);
    }

    #[test]
    fn nonzero_exit_reports_failure() {
        let host = SystemProcessHost;
        let command = ProcessCommand {
            program: "false".into(),
            ..Default::default()
        };
        let cancel = Arc::new(AtomicBool::new(false));
        let result = execute_process_command(
            &host,
            &command,
            &BTreeMap::new(),
            Path::new("."),
            &cancel,
            Duration::from_millis(100),
        )
        .unwrap();
        assert!(!result.success);
        assert_eq!(process_failure_error(&result).kind(), ErrorKind::Io);
    }
}
