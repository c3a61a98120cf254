//! Resume cursor for the chain listener.
//!
//! The cursor is the last block whose logs have been fully handled. It lives in memory as a
//! [Cursor] and is persisted through a [CursorStore]; [FileCursorStore] keeps it as a decimal
//! integer in a text file. A stored value of 0 (or no file at all) means "uninitialized".

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("cursor io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cursor file {path} does not hold a block number: {content:?}")]
    Parse { path: PathBuf, content: String },
}

/// Cursor: last processed block, as seen by this process. Never moves backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub last_processed_block: u64,
}

impl Cursor {
    pub fn new(last_processed_block: u64) -> Self {
        Self {
            last_processed_block,
        }
    }

    /// Uninitialized cursors are replaced with the chain head instead of being scanned from.
    pub fn is_uninitialized(&self) -> bool {
        self.last_processed_block == 0
    }

    /// Move to `block` if it is ahead. Returns true when the cursor changed.
    pub fn advance(&mut self, block: u64) -> bool {
        if block > self.last_processed_block {
            self.last_processed_block = block;
            true
        } else {
            false
        }
    }
}

/// Persistence for the last processed block.
pub trait CursorStore: Send + Sync {
    /// Last persisted block, or 0 when nothing has been persisted yet.
    fn load(&self) -> Result<u64, CursorError>;
    fn save(&self, block: u64) -> Result<(), CursorError>;
}

/// Cursor persisted as a decimal integer in a single text file.
///
/// Saves write a sibling `.tmp` file and rename it over the target, so a torn write never
/// leaves a shorter (smaller) number behind.
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl CursorStore for FileCursorStore {
    fn load(&self) -> Result<u64, CursorError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no cursor file, starting from chain head");
                return Ok(0);
            }
            Err(source) => {
                return Err(CursorError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let block = content
            .trim()
            .parse::<u64>()
            .map_err(|_| CursorError::Parse {
                path: self.path.clone(),
                content: content.clone(),
            })?;
        tracing::info!(block, "loaded cursor");
        Ok(block)
    }

    fn save(&self, block: u64) -> Result<(), CursorError> {
        let tmp = self.tmp_path();
        let io_err = |source| CursorError::Io {
            path: self.path.clone(),
            source,
        };
        std::fs::write(&tmp, block.to_string()).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

/// In-memory cursor store (no disk persistence). Clones share the same value.
#[derive(Debug, Clone, Default)]
pub struct MemoryCursorStore {
    inner: Arc<Mutex<u64>>,
}

impl MemoryCursorStore {
    pub fn new(block: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(block)),
        }
    }

    pub fn get(&self) -> u64 {
        *self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl CursorStore for MemoryCursorStore {
    fn load(&self) -> Result<u64, CursorError> {
        Ok(self.get())
    }

    fn save(&self, block: u64) -> Result<(), CursorError> {
        *self.inner.lock().unwrap_or_else(|p| p.into_inner()) = block;
        Ok(())
    }
}
