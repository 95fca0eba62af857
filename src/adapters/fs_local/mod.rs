// Local filesystem adapter - File operations through std::fs

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::error::{ExportError, ExportResult};
use crate::ports::FsPort;

/// Filesystem adapter over the local disk
#[derive(Debug, Default, Clone)]
pub struct LocalFsAdapter;

impl LocalFsAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl FsPort for LocalFsAdapter {
    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn file_size(&self, path: &Path) -> ExportResult<u64> {
        let metadata = fs::metadata(path).map_err(|e| ExportError::Io {
            message: format!("Failed to get file size of {}: {}", path.display(), e),
        })?;
        Ok(metadata.len())
    }

    fn delete_file(&self, path: &Path) -> ExportResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ExportError::Io {
                message: format!("Failed to delete {}: {}", path.display(), e),
            }),
        }
    }
}
