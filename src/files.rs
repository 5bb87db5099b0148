//! Attachment loading for file summarisation.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;

/// Cap on how much document text is fed to the summariser.
const MAX_SUMMARY_INPUT_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),

    /// Stored path points outside the configured file base directory.
    #[error("path escapes file base directory: {0}")]
    OutsideBase(String),
}

/// One loaded document section.
#[derive(Debug, Clone)]
pub struct Doc {
    pub content: String,
}

/// Reads uploaded attachments from the local filesystem.
///
/// Stored paths are always resolved relative to the configured base
/// directory; anything that escapes it is rejected before touching disk.
#[derive(Debug, Clone)]
pub struct FileLoader {
    base_dir: PathBuf,
}

impl FileLoader {
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn resolve(&self, stored_path: &str) -> Result<PathBuf, FileError> {
        let relative = Path::new(stored_path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(FileError::OutsideBase(stored_path.to_string()));
        }
        Ok(self.base_dir.join(relative))
    }

    /// Load a stored attachment as text documents.
    ///
    /// Content is trimmed and truncated to the summariser input cap.
    /// Whitespace-only files yield an empty doc list.
    pub async fn load(&self, stored_path: &str) -> Result<Vec<Doc>, FileError> {
        let path = self.resolve(stored_path)?;
        let raw = fs::read_to_string(&path).await?;

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        let mut content = trimmed.to_string();
        if content.len() > MAX_SUMMARY_INPUT_BYTES {
            let mut cut = MAX_SUMMARY_INPUT_BYTES;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            content.truncate(cut);
        }

        Ok(vec![Doc { content }])
    }
}
