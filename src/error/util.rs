//! Utility functions for error handling
//!
//! Small helpers that attach the offending path to filesystem failures.

use std::fs;
use std::io;
use std::path::Path;

use crate::error::{CollapseError, Result};

/// Read a file to string, reporting which file and why it was needed
pub fn safe_read_to_string(path: &Path, purpose: &str) -> Result<String> {
    if !path.is_file() {
        return Err(CollapseError::io_at(
            path,
            io::Error::new(io::ErrorKind::NotFound, format!("file needed for {purpose} not found")),
        ));
    }

    fs::read_to_string(path).map_err(|e| {
        let context = match e.kind() {
            io::ErrorKind::InvalidData => format!("{purpose}: file is not valid UTF-8"),
            io::ErrorKind::PermissionDenied => format!("{purpose}: permission denied"),
            _ => format!("{purpose}: failed to read file"),
        };
        CollapseError::io_at(path, io::Error::new(e.kind(), context))
    })
}

/// Check that a directory exists and can be listed
pub fn validate_directory(path: &Path, purpose: &str) -> Result<()> {
    if !path.is_dir() {
        return Err(CollapseError::io_at(
            path,
            io::Error::new(io::ErrorKind::NotFound, format!("directory needed for {purpose} not found")),
        ));
    }

    fs::read_dir(path)
        .map(|_| ())
        .map_err(|e| CollapseError::io_at(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reports_path() {
        let path = Path::new("/definitely/not/here/mapping.txt");
        let err = safe_read_to_string(path, "linkage map").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("mapping.txt"));
        assert!(message.contains("linkage map"));
    }

    #[test]
    fn file_is_not_a_directory() {
        let dir = std::env::temp_dir();
        assert!(validate_directory(&dir, "scratch").is_ok());
        assert!(validate_directory(&dir.join("no-such-subdir-42"), "scratch").is_err());
    }
}
