//! Removal of generated artifacts and the directory GC that follows it.

use crate::{
    error::{Error, Result},
    graph::{BuildGraph, NodeId},
    language::{ProductId, TopLevelProject},
    options::CleanOptions,
};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

/// Deletes one generated file; a missing file is fine.
pub fn remove_generated_artifact_from_disk(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("removed '{}'", path.display());
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::io(err, path)),
    }
}

/// The directories generated artifacts may live under; directory GC never
/// leaves them.
pub fn generated_base_dirs(project: &TopLevelProject) -> BTreeSet<PathBuf> {
    let mut dirs: BTreeSet<PathBuf> =
        project.products.iter().map(|p| p.build_directory.clone()).collect();
    dirs.insert(project.build_directory());
    dirs
}

/// Removes every ancestor directory of the deleted files that became
/// empty, bottom-up, while staying inside the build directories.
pub fn remove_empty_parent_directories(removed: &[PathBuf], base_dirs: &BTreeSet<PathBuf>) {
    let mut candidates: BTreeSet<PathBuf> = removed
        .iter()
        .filter_map(|path| path.parent().map(Path::to_path_buf))
        .collect();
    while let Some(dir) = candidates.pop_last() {
        let inside_build_dir = base_dirs.iter().any(|base| dir.starts_with(base) && dir != *base);
        if !inside_build_dir {
            continue;
        }
        let empty = std::fs::read_dir(&dir).map_or(false, |mut it| it.next().is_none());
        if !empty {
            continue;
        }
        if std::fs::remove_dir(&dir).is_ok() {
            trace!("removed empty directory '{}'", dir.display());
            if let Some(parent) = dir.parent() {
                candidates.insert(parent.to_path_buf());
            }
        }
    }
}

/// Removes the generated artifacts of the selected products from disk.
///
/// Graph nodes stay; their cleared timestamps make the next build
/// regenerate everything. Rescue records of removed files are dropped so
/// nothing resurrects stale change-tracking state.
pub fn clean_products(
    graph: &mut BuildGraph,
    project: &TopLevelProject,
    products: &[ProductId],
    options: &CleanOptions,
) -> Result<()> {
    let base_dirs = generated_base_dirs(project);
    let mut removed = Vec::new();
    let mut first_error: Option<Error> = None;
    for product in products {
        let ids: Vec<NodeId> =
            graph.product_data(*product).nodes.iter().copied().collect();
        for id in ids {
            let Some(artifact) = graph.artifact(id) else { continue };
            if !artifact.is_generated() {
                continue;
            }
            let path = artifact.file_path.clone();
            if options.dry_run {
                info!("would remove '{}'", path.display());
                continue;
            }
            match remove_generated_artifact_from_disk(&path) {
                Ok(()) => {
                    if let Some(artifact) = graph.artifact_mut(id) {
                        artifact.clear_timestamp();
                    }
                    graph.product_data_mut(*product).rescuable.remove(&path);
                    removed.push(path);
                }
                Err(err) => {
                    if !options.keep_going {
                        return Err(err);
                    }
                    warn!("{err}");
                    first_error.get_or_insert(err);
                }
            }
        }
    }
    if !options.dry_run {
        remove_empty_parent_directories(&removed, &base_dirs);
        graph.set_dirty();
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Deletes files below the build directories that no artifact claims.
pub fn remove_stale_artifacts(graph: &mut BuildGraph, project: &TopLevelProject) -> Result<()> {
    let base_dirs = generated_base_dirs(project);
    let graph_file = project.build_graph_file_path();
    let mut removed = Vec::new();
    for base in &base_dirs {
        if !base.exists() {
            continue;
        }
        for entry in WalkDir::new(base).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path == graph_file || path.extension().map_or(false, |e| e == "tmp") {
                continue;
            }
            if graph.registry.lookup_path(path).is_empty() {
                debug!("removing stale file '{}'", path.display());
                remove_generated_artifact_from_disk(path)?;
                removed.push(path.to_path_buf());
            }
        }
    }
    remove_empty_parent_directories(&removed, &base_dirs);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_parent_dirs_are_pruned_bottom_up() {
        let root = tempfile::tempdir().unwrap();
        let build_dir = root.path().join("default");
        let deep = build_dir.join("obj/sub");
        std::fs::create_dir_all(&deep).unwrap();
        let file = deep.join("a.o");
        std::fs::write(&file, "x").unwrap();
        std::fs::remove_file(&file).unwrap();

        let mut base_dirs = BTreeSet::new();
        base_dirs.insert(build_dir.clone());
        remove_empty_parent_directories(&[file], &base_dirs);
        assert!(!build_dir.join("obj").exists());
        // the build dir itself survives
        assert!(build_dir.exists());
    }
}
