//! Copies installable artifacts into the install root.

use crate::{
    error::{Error, Result},
    graph::BuildGraph,
    language::{FileTag, JsonValue, ProductId},
    options::InstallOptions,
    utils,
};
use std::path::PathBuf;

/// An artifact installs when it carries the `installable` tag or its
/// `quarry.install` module property is set. `quarry.installDir` picks the
/// subdirectory below the install root.
pub fn install_products(
    graph: &BuildGraph,
    products: &[ProductId],
    options: &InstallOptions,
) -> Result<u64> {
    if options.clean_install_root && options.install_root.exists() && !options.dry_run {
        std::fs::remove_dir_all(&options.install_root)
            .map_err(|err| Error::io(err, &options.install_root))?;
    }
    let installable_tag = FileTag::new("installable");
    let mut installed = 0u64;
    let mut first_error: Option<Error> = None;
    for product in products {
        for id in &graph.product_data(*product).nodes {
            let Some(artifact) = graph.artifact(*id) else { continue };
            let flagged = artifact.file_tags.contains(&installable_tag)
                || artifact
                    .properties
                    .module_property("quarry", &["install".to_string()])
                    .and_then(JsonValue::as_bool)
                    .unwrap_or(false);
            if !flagged {
                continue;
            }
            let install_dir = artifact
                .properties
                .module_property("quarry", &["installDir".to_string()])
                .and_then(JsonValue::as_str)
                .unwrap_or("");
            let target: PathBuf =
                options.install_root.join(install_dir).join(artifact.file_name());
            if options.dry_run {
                info!(
                    "would install '{}' to '{}'",
                    artifact.file_path.display(),
                    target.display()
                );
                installed += 1;
                continue;
            }
            let copy = || -> Result<()> {
                utils::create_parent_dir_all(&target)?;
                std::fs::copy(&artifact.file_path, &target)
                    .map_err(|err| Error::io(err, &artifact.file_path))?;
                Ok(())
            };
            match copy() {
                Ok(()) => {
                    debug!(
                        "installed '{}' to '{}'",
                        artifact.file_path.display(),
                        target.display()
                    );
                    installed += 1;
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
    match first_error {
        Some(err) => Err(err),
        None => Ok(installed),
    }
}
