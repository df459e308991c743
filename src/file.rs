//! File descriptors passed between the splitter and the sorter.

use std::path::PathBuf;

/// A file taking part in a sort run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    /// Path to the file.
    pub path: PathBuf,
    /// File size in bytes. For generated chunks this is the size reported by the writer.
    pub size: u64,
    /// Whether the file is owned by the sort run and must be deleted once consumed.
    pub temporary: bool,
}

impl File {
    /// Creates a descriptor of a caller-owned file.
    pub fn source(path: impl Into<PathBuf>, size: u64) -> Self {
        File {
            path: path.into(),
            size,
            temporary: false,
        }
    }

    /// Creates a descriptor of a file owned by the sort run.
    pub fn temporary(path: impl Into<PathBuf>, size: u64) -> Self {
        File {
            path: path.into(),
            size,
            temporary: true,
        }
    }
}
