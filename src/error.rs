//! Error and warning types shared across the engine.

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    io,
    path::{Path, PathBuf},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A position in a project description or script file.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CodeLocation {
    pub file_path: PathBuf,
    pub line: u32,
    pub column: u32,
}

impl CodeLocation {
    pub fn new(file_path: impl Into<PathBuf>, line: u32, column: u32) -> Self {
        Self { file_path: file_path.into(), line, column }
    }

    pub fn is_valid(&self) -> bool {
        !self.file_path.as_os_str().is_empty()
    }
}

impl fmt::Display for CodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file_path.display(), self.line, self.column)
    }
}

/// Classifies an [`Error`] for recovery policy decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Unknown profile, invalid override, misuse of the API.
    Configuration,
    /// No build graph file exists for the configuration.
    NoBuildGraph,
    /// The build graph file was written by an incompatible version.
    SchemaMismatch,
    /// The build graph file contains unexpected data.
    CorruptBuildGraph,
    /// A cycle in the rule graph or the artifact graph.
    Cycle,
    /// Two rules or two artifacts fight over one file path.
    Conflict,
    /// A prepare, output-artifacts or scan script threw.
    Script,
    Io,
    Cancelled,
    /// A violated engine invariant.
    Internal,
}

/// One description plus an optional source location.
///
/// Errors aggregate several of these, e.g. a cycle error carries one item
/// per node on the cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorItem {
    pub description: String,
    pub location: Option<CodeLocation>,
}

impl fmt::Display for ErrorItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "{}: {}", loc, self.description),
            None => f.write_str(&self.description),
        }
    }
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Serialize, Deserialize)]
#[error("{}", self.message())]
pub struct Error {
    kind: ErrorKind,
    items: Vec<ErrorItem>,
}

impl Error {
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self { kind, items: vec![ErrorItem { description: description.into(), location: None }] }
    }

    pub fn with_location(
        kind: ErrorKind,
        description: impl Into<String>,
        location: CodeLocation,
    ) -> Self {
        Self {
            kind,
            items: vec![ErrorItem { description: description.into(), location: Some(location) }],
        }
    }

    pub fn configuration(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, description)
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, description)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "build was cancelled")
    }

    pub fn io(err: io::Error, path: impl AsRef<Path>) -> Self {
        Self::new(ErrorKind::Io, format!("{}: {err}", path.as_ref().display()))
    }

    pub fn script(description: impl Into<String>, location: CodeLocation) -> Self {
        Self::with_location(ErrorKind::Script, description, location)
    }

    /// Appends another item, keeping the original kind.
    pub fn append(mut self, description: impl Into<String>) -> Self {
        self.items.push(ErrorItem { description: description.into(), location: None });
        self
    }

    pub fn append_located(mut self, description: impl Into<String>, location: CodeLocation) -> Self {
        self.items.push(ErrorItem { description: description.into(), location: Some(location) });
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn items(&self) -> &[ErrorItem] {
        &self.items
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    pub fn location(&self) -> Option<&CodeLocation> {
        self.items.iter().find_map(|item| item.location.as_ref())
    }

    pub fn message(&self) -> String {
        let mut out = String::new();
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(&item.to_string());
        }
        out
    }
}

/// Collects warnings for a project, deduplicated by `(message, location)`.
#[derive(Debug, Default)]
pub struct WarningCollector {
    seen: std::collections::HashSet<(String, Option<CodeLocation>)>,
    warnings: Vec<Error>,
}

impl WarningCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the warning was new and has been recorded.
    pub fn add(&mut self, warning: Error) -> bool {
        let key = (
            warning.items.first().map(|item| item.description.clone()).unwrap_or_default(),
            warning.items.first().and_then(|item| item.location.clone()),
        );
        if !self.seen.insert(key) {
            return false;
        }
        warn!("{warning}");
        self.warnings.push(warning);
        true
    }

    pub fn warnings(&self) -> &[Error] {
        &self.warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_item_message() {
        let err = Error::new(ErrorKind::Cycle, "cycle in rule graph")
            .append_located("rule compiler", CodeLocation::new("p.qry", 4, 5))
            .append_located("rule linker", CodeLocation::new("p.qry", 9, 5));
        let msg = err.message();
        assert!(msg.contains("cycle in rule graph"));
        assert!(msg.contains("p.qry:4:5: rule compiler"));
        assert_eq!(err.kind(), ErrorKind::Cycle);
    }

    #[test]
    fn warning_dedup() {
        let mut sink = WarningCollector::new();
        let w = || {
            Error::with_location(
                ErrorKind::Configuration,
                "overriding property",
                CodeLocation::new("p.qry", 1, 1),
            )
        };
        assert!(sink.add(w()));
        assert!(!sink.add(w()));
        assert_eq!(sink.warnings().len(), 1);
    }
}
