//! Minimal textual edits on the project description file.
//!
//! The engine only ever applies structural edits it fully understands:
//! inserting or removing a `Group` block and editing a `files` binding.
//! The addressed item is located through its recorded source location;
//! every edit reports how many lines it inserted or removed so recorded
//! locations of later items can be shifted instead of re-parsed.

use crate::{
    error::{CodeLocation, Error, ErrorKind, Result},
    language::TopLevelProject,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineEndingType {
    Lf,
    CrLf,
    Mixed,
    Unknown,
}

pub fn guess_line_ending_type(text: &str) -> LineEndingType {
    let crlf = text.matches("\r\n").count();
    let lf = text.matches('\n').count() - crlf;
    match (lf, crlf) {
        (0, 0) => LineEndingType::Unknown,
        (_, 0) => LineEndingType::Lf,
        (0, _) => LineEndingType::CrLf,
        _ => LineEndingType::Mixed,
    }
}

/// Reported by every edit: lines at or after `change_line` moved by
/// `line_offset`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineShift {
    pub change_line: u32,
    pub line_offset: i32,
}

static FILES_BINDING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^(\s*)files\s*:\s*(.*?)\s*$"#).unwrap());
static STRING_LITERAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#""((?:[^"\\]|\\.)*)""#).unwrap());

#[derive(Debug)]
pub struct ProjectFileUpdater {
    file_path: PathBuf,
    lines: Vec<String>,
    ending: LineEndingType,
}

impl ProjectFileUpdater {
    pub fn load(file_path: impl Into<PathBuf>) -> Result<Self> {
        let file_path = file_path.into();
        let raw = std::fs::read_to_string(&file_path)
            .map_err(|err| Error::io(err, &file_path))?;
        let ending = guess_line_ending_type(&raw);
        // edit in LF space, restore the original endings on store
        let normalized = raw.replace("\r\n", "\n");
        let lines = normalized.split('\n').map(str::to_string).collect();
        Ok(Self { file_path, lines, ending })
    }

    pub fn store(&self) -> Result<()> {
        let joined = self.lines.join("\n");
        let content = match self.ending {
            LineEndingType::CrLf => joined.replace('\n', "\r\n"),
            _ => joined,
        };
        std::fs::write(&self.file_path, content).map_err(|err| Error::io(err, &self.file_path))
    }

    /// Appends `Group { name: ...; files: [] }` inside the product block,
    /// indented four spaces deeper than the product.
    pub fn add_group(&mut self, product: &CodeLocation, name: &str) -> Result<LineShift> {
        let (start, end) = self.item_block(product)?;
        let indent = " ".repeat(self.indent_of(start) + 4);
        let inner = " ".repeat(self.indent_of(start) + 8);
        let insert_at = end;
        let block = vec![
            format!("{indent}Group {{"),
            format!("{inner}name: \"{name}\""),
            format!("{inner}files: []"),
            format!("{indent}}}"),
        ];
        let offset = block.len() as i32;
        for (i, line) in block.into_iter().enumerate() {
            self.lines.insert(insert_at + i, line);
        }
        Ok(LineShift { change_line: (insert_at + 1) as u32, line_offset: offset })
    }

    /// Deletes the addressed group block entirely.
    pub fn remove_group(&mut self, group: &CodeLocation) -> Result<LineShift> {
        let (start, end) = self.item_block(group)?;
        let removed = end - start + 1;
        self.lines.drain(start..=end);
        Ok(LineShift { change_line: (start + 1) as u32, line_offset: -(removed as i32) })
    }

    /// Merges `files` into the item's `files` binding, keeping new
    /// entries sorted without reordering existing ones. A string literal
    /// binding is promoted to an array, a missing binding is added.
    pub fn add_files(&mut self, item: &CodeLocation, files: &[String]) -> Result<LineShift> {
        if files.is_empty() {
            return Ok(LineShift { change_line: item.line, line_offset: 0 });
        }
        let mut sorted: Vec<String> = files.to_vec();
        sorted.sort();

        let (start, end) = self.item_block(item)?;
        let indent = self.indent_of(start) + 4;
        match self.files_binding(start, end) {
            Some((line, binding_end)) => {
                let mut existing = self.collect_file_entries(line, binding_end);
                let removed_lines = binding_end - line + 1;
                // insert the sorted block after the existing entries that
                // compare smaller than its first element
                let first_new = &sorted[0];
                let split = existing
                    .iter()
                    .position(|repr| repr > first_new)
                    .unwrap_or(existing.len());
                let mut merged: Vec<String> = existing.drain(..split).collect();
                for file in &sorted {
                    if !merged.contains(file) && !existing.contains(file) {
                        merged.push(file.clone());
                    }
                }
                merged.extend(existing);
                self.lines.drain(line..=binding_end);
                let inserted = self.write_files_binding(line, indent, &merged);
                Ok(LineShift {
                    change_line: (line + 1) as u32,
                    line_offset: inserted as i32 - removed_lines as i32,
                })
            }
            None => {
                // no binding yet; add one right after the item header
                let insert_at = start + 1;
                let inserted = self.write_files_binding(insert_at, indent, &sorted);
                Ok(LineShift { change_line: (insert_at + 1) as u32, line_offset: inserted as i32 })
            }
        }
    }

    /// Removes `files` from the item's `files` binding.
    pub fn remove_files(&mut self, item: &CodeLocation, files: &[String]) -> Result<LineShift> {
        if files.is_empty() {
            return Ok(LineShift { change_line: item.line, line_offset: 0 });
        }
        let (start, end) = self.item_block(item)?;
        let indent = self.indent_of(start) + 4;
        let Some((line, binding_end)) = self.files_binding(start, end) else {
            return Err(Error::configuration(format!(
                "item at {} has no files binding",
                item
            )));
        };
        let mut entries = self.collect_file_entries(line, binding_end);
        let before = entries.len();
        entries.retain(|entry| !files.contains(entry));
        if before - entries.len() != files.len() {
            return Err(Error::configuration(format!(
                "not all files to be removed are listed at {}",
                item
            )));
        }
        let removed_lines = binding_end - line + 1;
        self.lines.drain(line..=binding_end);
        let inserted = self.write_files_binding(line, indent, &entries);
        Ok(LineShift {
            change_line: (line + 1) as u32,
            line_offset: inserted as i32 - removed_lines as i32,
        })
    }

    /// 0-based `(first, last)` line indices of the item's `{ ... }` block.
    fn item_block(&self, location: &CodeLocation) -> Result<(usize, usize)> {
        if location.line == 0 || location.line as usize > self.lines.len() {
            return Err(Error::with_location(
                ErrorKind::Configuration,
                "recorded source location is outside the project file",
                location.clone(),
            ));
        }
        let start = location.line as usize - 1;
        let mut depth = 0i32;
        let mut saw_open = false;
        for (index, line) in self.lines.iter().enumerate().skip(start) {
            for ch in line.chars() {
                match ch {
                    '{' => {
                        depth += 1;
                        saw_open = true;
                    }
                    '}' => depth -= 1,
                    _ => {}
                }
            }
            if saw_open && depth == 0 {
                return Ok((start, index));
            }
        }
        Err(Error::with_location(
            ErrorKind::Configuration,
            "unbalanced braces in project file",
            location.clone(),
        ))
    }

    fn indent_of(&self, line: usize) -> usize {
        self.lines[line].len() - self.lines[line].trim_start().len()
    }

    /// Finds the `files:` binding inside the block, returning its
    /// 0-based first and last line.
    fn files_binding(&self, start: usize, end: usize) -> Option<(usize, usize)> {
        for index in start..=end {
            let Some(caps) = FILES_BINDING_RE.captures(&self.lines[index]) else { continue };
            let rest = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            if !rest.contains('[') || rest.contains(']') {
                return Some((index, index));
            }
            // multi-line array literal
            for close in index..=end {
                if self.lines[close].contains(']') {
                    return Some((index, close));
                }
            }
            return Some((index, end));
        }
        None
    }

    fn collect_file_entries(&self, line: usize, binding_end: usize) -> Vec<String> {
        let mut entries = Vec::new();
        for index in line..=binding_end {
            let text = &self.lines[index];
            let text = if index == line {
                // skip the binding name itself
                text.splitn(2, ':').nth(1).unwrap_or("")
            } else {
                text.as_str()
            };
            for caps in STRING_LITERAL_RE.captures_iter(text) {
                entries.push(caps[1].to_string());
            }
        }
        entries
    }

    /// Rewrites the binding at `at`; returns the number of lines written.
    fn write_files_binding(&mut self, at: usize, indent: usize, entries: &[String]) -> usize {
        let pad = " ".repeat(indent);
        if entries.is_empty() {
            self.lines.insert(at, format!("{pad}files: []"));
            return 1;
        }
        let elem_pad = " ".repeat(indent + 4);
        let mut block = Vec::with_capacity(entries.len() + 2);
        block.push(format!("{pad}files: ["));
        for (index, entry) in entries.iter().enumerate() {
            let comma = if index + 1 == entries.len() { "" } else { "," };
            block.push(format!("{elem_pad}\"{entry}\"{comma}"));
        }
        block.push(format!("{pad}]"));
        let count = block.len();
        for (offset, line) in block.into_iter().enumerate() {
            self.lines.insert(at + offset, line);
        }
        count
    }
}

/// Applies a reported shift to every recorded location in `file` at or
/// after the changed line, so later edits in the same session stay
/// addressable.
pub fn shift_item_locations(project: &mut TopLevelProject, file: &Path, shift: LineShift) {
    if shift.line_offset == 0 {
        return;
    }
    let apply = |location: &mut CodeLocation| {
        if location.file_path == file && location.line >= shift.change_line {
            location.line = (location.line as i64 + shift.line_offset as i64).max(1) as u32;
        }
    };
    for product in &mut project.products {
        apply(&mut product.location);
        for group in &mut product.groups {
            apply(&mut group.location);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PROJECT: &str = "Project {\n    Product {\n        name: \"app\"\n        files: [\n            \"a.c\",\n            \"m.c\"\n        ]\n    }\n}\n";

    fn updater_with(content: &str) -> (tempfile::TempDir, ProjectFileUpdater) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.qry");
        std::fs::write(&path, content).unwrap();
        (dir, ProjectFileUpdater::load(&path).unwrap())
    }

    #[test]
    fn adds_files_sorted_between_existing() {
        let (_dir, mut updater) = updater_with(PROJECT);
        let product = CodeLocation::new("project.qry", 2, 5);
        let shift =
            updater.add_files(&product, &["b.c".to_string(), "z.c".to_string()]).unwrap();
        assert_eq!(shift.line_offset, 2);
        updater.store().unwrap();
        let text = updater.lines.join("\n");
        // the new sorted block lands after the existing entries that
        // compare smaller than its first element; existing order is kept
        let a = text.find("\"a.c\"").unwrap();
        let b = text.find("\"b.c\"").unwrap();
        let m = text.find("\"m.c\"").unwrap();
        let z = text.find("\"z.c\"").unwrap();
        assert!(a < b && b < z && z < m, "{text}");
    }

    #[test]
    fn removes_files_and_group() {
        let (_dir, mut updater) = updater_with(PROJECT);
        let product = CodeLocation::new("project.qry", 2, 5);
        updater.remove_files(&product, &["a.c".to_string()]).unwrap();
        let text = updater.lines.join("\n");
        assert!(!text.contains("\"a.c\""));
        assert!(text.contains("\"m.c\""));
    }

    #[test]
    fn missing_file_removal_is_an_error() {
        let (_dir, mut updater) = updater_with(PROJECT);
        let product = CodeLocation::new("project.qry", 2, 5);
        assert!(updater.remove_files(&product, &["nope.c".to_string()]).is_err());
    }

    #[test]
    fn string_binding_is_promoted_to_array() {
        let content = "Project {\n    Product {\n        files: \"only.c\"\n    }\n}\n";
        let (_dir, mut updater) = updater_with(content);
        let product = CodeLocation::new("project.qry", 2, 5);
        updater.add_files(&product, &["extra.c".to_string()]).unwrap();
        let text = updater.lines.join("\n");
        assert!(text.contains("files: ["), "{text}");
        assert!(text.contains("\"only.c\""));
        assert!(text.contains("\"extra.c\""));
    }

    #[test]
    fn group_insertion_reports_shift() {
        let (_dir, mut updater) = updater_with(PROJECT);
        let product = CodeLocation::new("project.qry", 2, 5);
        let shift = updater.add_group(&product, "generated").unwrap();
        assert_eq!(shift.line_offset, 4);
        let text = updater.lines.join("\n");
        assert!(text.contains("        Group {"), "{text}");
        assert!(text.contains("            name: \"generated\""));
    }

    #[test]
    fn crlf_endings_survive_the_round_trip() {
        let content = PROJECT.replace('\n', "\r\n");
        let (dir, mut updater) = updater_with(&content);
        assert_eq!(updater.ending, LineEndingType::CrLf);
        let product = CodeLocation::new("project.qry", 2, 5);
        updater.add_files(&product, &["b.c".to_string()]).unwrap();
        updater.store().unwrap();
        let path = dir.path().join("project.qry");
        let written = std::fs::read(path).unwrap();
        let written = String::from_utf8(written).unwrap();
        assert!(written.contains("\r\n"));
        assert!(!written.replace("\r\n", "").contains('\n'));
    }

    #[test]
    fn line_ending_detection() {
        assert_eq!(guess_line_ending_type("a\nb\n"), LineEndingType::Lf);
        assert_eq!(guess_line_ending_type("a\r\nb\r\n"), LineEndingType::CrLf);
        assert_eq!(guess_line_ending_type("a\r\nb\n"), LineEndingType::Mixed);
        assert_eq!(guess_line_ending_type("just one line"), LineEndingType::Unknown);
    }
}
