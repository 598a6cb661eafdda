use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::registry::SOURCE_EXTENSION;

/// Origin name of the core library unit.
pub const CORE_ORIGIN: &str = "<core>";

/// Text of the core library, compiled into the crate.
pub const CORE_SOURCE: &str = include_str!("../core/core.kiln");

/// Source files in `dir`, sorted by path.
///
/// Only the directory itself is read unless `recursive` is set.
pub fn collect_sources(dir: impl AsRef<Path>, recursive: bool) -> Result<Vec<PathBuf>, walkdir::Error> {
    let mut walker = WalkDir::new(dir.as_ref()).min_depth(1).sort_by_file_name();
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().is_some_and(|ext| ext == SOURCE_EXTENSION) {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}
