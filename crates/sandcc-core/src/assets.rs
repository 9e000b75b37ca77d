//! Where the toolchain's binary assets come from.

use crate::{Result, SandccError};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

/// Loads an asset (a guest module or the sysroot archive) by file name.
pub trait AssetSource: Send {
    fn load(&self, name: &str) -> Result<Vec<u8>>;
}

/// Assets read from a directory on disk.
#[derive(Debug, Clone)]
pub struct DirectoryAssets {
    root: PathBuf,
}

impl DirectoryAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AssetSource for DirectoryAssets {
    fn load(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.root.join(name);
        tracing::debug!(path = %path.display(), "loading asset");
        std::fs::read(&path).map_err(|source| SandccError::Asset {
            name: name.to_owned(),
            source,
        })
    }
}

/// Assets bundled in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryAssets {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryAssets {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(name, bytes);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.files.insert(name.into(), bytes.into());
    }
}

impl AssetSource for MemoryAssets {
    fn load(&self, name: &str) -> Result<Vec<u8>> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| SandccError::Asset {
                name: name.to_owned(),
                source: io::Error::new(io::ErrorKind::NotFound, "not bundled"),
            })
    }
}
