use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no such file: {0}")]
    Missing(String),

    #[error("storage i/o failed on {path}: {detail}")]
    Io { path: String, detail: String },
}

/// Byte-level persistent storage collaborator. Failures are reported
/// upward and never halt the scheduler.
pub trait Storage {
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;
    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), StorageError>;
    /// Removing a missing file reports `Missing`; callers that need
    /// idempotence (file_del) treat that as success.
    fn delete(&mut self, path: &str) -> Result<(), StorageError>;
    fn list(&self, dir: &str) -> Result<Vec<String>, StorageError>;
}

/// SD-card-backed storage rooted at a directory.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

fn io_err(path: &str, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::Missing(path.to_string())
    } else {
        StorageError::Io { path: path.to_string(), detail: e.to_string() }
    }
}

impl Storage for FsStorage {
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        std::fs::read(self.full(path)).map_err(|e| io_err(path, e))
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let full = self.full(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(path, e))?;
        }
        std::fs::write(full, data).map_err(|e| io_err(path, e))
    }

    fn delete(&mut self, path: &str) -> Result<(), StorageError> {
        std::fs::remove_file(self.full(path)).map_err(|e| io_err(path, e))
    }

    fn list(&self, dir: &str) -> Result<Vec<String>, StorageError> {
        let full = self.full(dir);
        if !Path::new(&full).exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for ent in std::fs::read_dir(&full).map_err(|e| io_err(dir, e))? {
            let ent = ent.map_err(|e| io_err(dir, e))?;
            if ent.path().is_file() {
                out.push(format!("{}/{}", dir, ent.file_name().to_string_lossy()));
            }
        }
        out.sort();
        Ok(out)
    }
}

/// In-memory storage for tests and the simulated satellite.
#[derive(Default)]
pub struct MemStorage {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }
}

impl Storage for MemStorage {
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::Missing(path.to_string()))
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        self.files.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&mut self, path: &str) -> Result<(), StorageError> {
        self.files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StorageError::Missing(path.to_string()))
    }

    fn list(&self, dir: &str) -> Result<Vec<String>, StorageError> {
        let prefix = format!("{}/", dir);
        Ok(self
            .files
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect())
    }
}
