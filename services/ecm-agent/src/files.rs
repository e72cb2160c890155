//! Plugin binary persistence on the local filesystem.
//!
//! Binaries are written to a temporary file and renamed into place, so a
//! crash mid-write never leaves a truncated plugin at its final location.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::{debug, warn};

/// Largest plugin binary the agent will read back.
pub const MAX_PLUGIN_BYTES: u64 = i32::MAX as u64;

/// Errors from plugin file operations.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("plugin file {path} is too large: {size} bytes (max {limit})")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("plugin name {0:?} does not resolve to a file inside the plugin directory")]
    InvalidName(String),
}

/// Distinguishes concurrent temporary files for the same target.
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Hidden sibling of `path` that no plugin name can collide with.
fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{file_name}.{}.{seq}.tmp", std::process::id()))
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> FileError + '_ {
    move |source| FileError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Resolve `dir/plugin_name`, rejecting names that would escape `dir`.
pub fn plugin_path(dir: &Path, plugin_name: &str) -> Result<PathBuf, FileError> {
    let file_name = Path::new(plugin_name);
    let mut components = file_name.components();
    match (components.next(), components.next()) {
        (Some(std::path::Component::Normal(_)), None) => Ok(dir.join(file_name)),
        _ => Err(FileError::InvalidName(plugin_name.to_string())),
    }
}

/// Save and delete plugin binaries.
#[derive(Debug, Clone, Default)]
pub struct PluginFiles;

impl PluginFiles {
    pub fn new() -> Self {
        Self
    }

    /// Write `data` to `path`, creating parent directories as needed.
    pub fn save(&self, data: &[u8], path: &Path) -> Result<(), FileError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }

        let temp_path = temp_path_for(path);
        let mut file = fs::File::create(&temp_path).map_err(io_error(&temp_path))?;
        let written = file
            .write_all(data)
            .and_then(|_| file.sync_all())
            .map_err(io_error(&temp_path));
        drop(file);

        if let Err(e) = written {
            fs::remove_file(&temp_path).ok();
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp_path, path) {
            fs::remove_file(&temp_path).ok();
            return Err(io_error(path)(e));
        }

        debug!(path = %path.display(), size = data.len(), "Plugin file saved");
        Ok(())
    }

    /// Read a plugin binary back.
    pub fn read(&self, path: &Path) -> Result<Vec<u8>, FileError> {
        let size = fs::metadata(path).map_err(io_error(path))?.len();
        if size > MAX_PLUGIN_BYTES {
            return Err(FileError::TooLarge {
                path: path.to_path_buf(),
                size,
                limit: MAX_PLUGIN_BYTES,
            });
        }

        fs::read(path).map_err(io_error(path))
    }

    /// Delete a plugin binary.
    ///
    /// Returns `true` only if a regular file existed and was removed.
    pub fn delete(&self, path: &Path) -> bool {
        if !path.is_file() {
            return false;
        }

        match fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "Plugin file deleted");
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to delete plugin file");
                false
            }
        }
    }
}
