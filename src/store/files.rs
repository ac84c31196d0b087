//! Finding and opening Parquet files

use std::path::{Path, PathBuf};

use tokio::fs::{self, File};

use crate::error::util::validate_directory;
use crate::error::{CollapseError, Result};
use crate::utils::{log_operation_complete, log_warning};

/// Parquet files of an extent: the path itself, or the `*.parquet` files of a
/// directory in name order
///
/// Files whose name starts with `_` hold metadata and are skipped.
pub async fn find_parquet_files(path: &Path) -> Result<Vec<PathBuf>> {
    let metadata = fs::metadata(path).await.map_err(|e| CollapseError::io_at(path, e))?;
    if metadata.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    validate_directory(path, "Parquet files")?;

    let mut files = Vec::new();
    let mut entries = fs::read_dir(path).await.map_err(|e| CollapseError::io_at(path, e))?;
    while let Some(entry) = entries.next_entry().await.map_err(|e| CollapseError::io_at(path, e))? {
        let file = entry.path();
        if is_data_file(&file) && entry.file_type().await.is_ok_and(|t| t.is_file()) {
            files.push(file);
        }
    }
    files.sort();

    if files.is_empty() {
        log_warning("No Parquet files found in directory", Some(path));
    } else {
        log_operation_complete("found", path, files.len(), None);
    }
    Ok(files)
}

fn is_data_file(path: &Path) -> bool {
    let parquet = path.extension().is_some_and(|ext| ext == "parquet");
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('_') || n.starts_with('.'));
    parquet && !hidden
}

/// Open a Parquet file for reading
pub async fn open_parquet_file(path: &Path) -> Result<File> {
    File::open(path).await.map_err(|e| CollapseError::io_at(path, e))
}
