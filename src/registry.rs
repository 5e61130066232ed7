//! Process-wide index from (directory, file name) to the file resources
//! living at that path.
//!
//! Lookups vastly outnumber insertions, so a single coarse lock is fine.
//! Path-uniqueness rules for generated artifacts are enforced by the graph
//! before it inserts (see [`crate::graph::BuildGraph::insert_artifact`]);
//! the registry itself allows several resources per path because a source
//! file may be an artifact in more than one product.

use crate::graph::node::{FileDepId, NodeId};
use crate::utils::split_file_path;
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

/// Handle to either kind of file resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileResourceRef {
    Artifact(NodeId),
    Dependency(FileDepId),
}

#[derive(Debug, Default)]
pub struct FileResourceRegistry {
    inner: RwLock<HashMap<(PathBuf, String), Vec<FileResourceRef>>>,
}

impl FileResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, file_path: &Path, resource: FileResourceRef) {
        let key = key_of(file_path);
        let mut inner = self.inner.write();
        let slot = inner.entry(key).or_default();
        if !slot.contains(&resource) {
            slot.push(resource);
        }
    }

    /// Removes one registration. Idempotent.
    pub fn remove(&self, file_path: &Path, resource: FileResourceRef) {
        let key = key_of(file_path);
        let mut inner = self.inner.write();
        if let Some(slot) = inner.get_mut(&key) {
            slot.retain(|r| *r != resource);
            if slot.is_empty() {
                inner.remove(&key);
            }
        }
    }

    pub fn lookup(&self, dir_path: &Path, file_name: &str) -> Vec<FileResourceRef> {
        self.inner
            .read()
            .get(&(dir_path.to_path_buf(), file_name.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn lookup_path(&self, file_path: &Path) -> Vec<FileResourceRef> {
        let (dir, name) = split_file_path(file_path);
        self.lookup(&dir, &name)
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

fn key_of(file_path: &Path) -> (PathBuf, String) {
    split_file_path(file_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_lookup_remove() {
        let registry = FileResourceRegistry::new();
        let path = Path::new("/build/main.o");
        registry.insert(path, FileResourceRef::Artifact(NodeId(7)));
        registry.insert(path, FileResourceRef::Artifact(NodeId(7)));
        assert_eq!(registry.lookup_path(path).len(), 1);
        assert_eq!(registry.lookup(Path::new("/build"), "main.o").len(), 1);

        registry.remove(path, FileResourceRef::Artifact(NodeId(7)));
        assert!(registry.lookup_path(path).is_empty());
        // removing again is fine
        registry.remove(path, FileResourceRef::Artifact(NodeId(7)));
    }
}
