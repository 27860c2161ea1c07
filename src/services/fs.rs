use crate::core::execute::{FileOps, OperationKind};
use crate::error::CoreError;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;

/// [`FileOps`] over the local filesystem.
pub struct LocalFileOps;

impl LocalFileOps {
    pub fn new() -> Self {
        Self
    }

    #[cfg(unix)]
    fn symlink(original: &Path, link: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(original, link)
    }

    #[cfg(windows)]
    fn symlink(original: &Path, link: &Path) -> io::Result<()> {
        std::os::windows::fs::symlink_file(original, link)
    }

    /// Copy into a target that must not exist yet, keeping the source mtime.
    /// A failed copy removes the partial target.
    fn copy_new(source: &Path, target: &Path) -> io::Result<()> {
        let mut input = File::open(source)?;
        let modified = input.metadata()?.modified()?;
        let mut output = OpenOptions::new().write(true).create_new(true).open(target)?;
        let result = io::copy(&mut input, &mut output)
            .and_then(|_| output.set_modified(modified))
            .and_then(|()| output.sync_all());
        drop(output);
        if let Err(e) = result {
            if let Err(cleanup) = fs::remove_file(target) {
                log::warn!("Could not remove partial copy {}: {}", target.display(), cleanup);
            }
            return Err(e);
        }
        Ok(())
    }

    fn move_file(source: &Path, target: &Path) -> io::Result<()> {
        if fs::symlink_metadata(target).is_ok() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "target already exists"));
        }
        match fs::rename(source, target) {
            Ok(()) => Ok(()),
            Err(e) => {
                // likely a cross-device move
                log::debug!("rename failed ({}), copying {} instead", e, source.display());
                Self::copy_new(source, target)?;
                if let Err(e) = fs::remove_file(source) {
                    // keep exactly one copy
                    if let Err(cleanup) = fs::remove_file(target) {
                        log::warn!("Could not remove copy {}: {}", target.display(), cleanup);
                    }
                    return Err(e);
                }
                Ok(())
            }
        }
    }
}

impl Default for LocalFileOps {
    fn default() -> Self {
        Self::new()
    }
}

impl FileOps for LocalFileOps {
    fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    fn apply(
        &self,
        source: &Path,
        target: &Path,
        operation: OperationKind,
        overwrite: bool,
    ) -> Result<(), CoreError> {
        if fs::symlink_metadata(source).is_err() {
            return Err(CoreError::filesystem(source, "source does not exist"));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| CoreError::filesystem(parent, e))?;
        }
        if overwrite && self.exists(target) {
            self.remove(target)?;
        }

        let result = match operation {
            OperationKind::Symlink => {
                let original = std::path::absolute(source).map_err(|e| CoreError::filesystem(source, e))?;
                Self::symlink(&original, target)
            }
            OperationKind::Copy => Self::copy_new(source, target),
            OperationKind::Move => Self::move_file(source, target),
        };
        result.map_err(|e| CoreError::filesystem(target, format!("{} failed: {}", operation, e)))
    }

    fn backlink(&self, original: &Path, moved_to: &Path) -> Result<(), CoreError> {
        let moved_to = std::path::absolute(moved_to).map_err(|e| CoreError::filesystem(moved_to, e))?;
        Self::symlink(&moved_to, original)
            .map_err(|e| CoreError::filesystem(original, format!("backlink failed: {}", e)))
    }

    fn remove(&self, path: &Path) -> Result<(), CoreError> {
        let metadata = fs::symlink_metadata(path).map_err(|e| CoreError::filesystem(path, e))?;
        let result = if metadata.is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };
        result.map_err(|e| CoreError::filesystem(path, e))
    }
}
