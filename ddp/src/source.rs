use crate::errors::{DdpError, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Copy `file` into `output_dir`, keeping its file name.
///
/// Used to snapshot the script or config a run was started with next to its
/// outputs. `output_dir` must already exist. An existing copy is overwritten,
/// but copying a file onto itself is refused: the copy would truncate it.
pub fn copy_source(file: &Path, output_dir: &Path) -> Result<PathBuf> {
    let name = file.file_name().ok_or_else(|| {
        DdpError::Config(format!("{} does not name a file", file.display()))
    })?;
    let destination = output_dir.join(name);

    if is_same_file(file, &destination) {
        return Err(DdpError::Config(format!(
            "{} and {} are the same file",
            file.display(),
            destination.display()
        )));
    }

    std::fs::copy(file, &destination).map_err(|e| {
        tracing::error!(
            from = %file.display(),
            to = %destination.display(),
            error = %e,
            "Failed to copy source file"
        );
        e
    })?;

    info!(from = %file.display(), to = %destination.display(), "Copied source file");
    Ok(destination)
}

// A destination that does not exist yet cannot alias the source
fn is_same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
