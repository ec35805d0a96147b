//! Object sinks.
//!
//! The receiver hands every reconstructed object to an [`ObjectWriter`]
//! exactly once, in completion order.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Content location {0:?} has no usable path")]
    InvalidLocation(String),
}

/// FDT metadata of a completed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub toi:              u64,
    pub content_location: String,
    pub content_type:     String,
}

pub trait ObjectWriter: Send + Sync {
    fn write(&self, meta: &ObjectMeta, data: &[u8]) -> Result<(), WriterError>;
}

// ── In-memory ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedObject {
    pub meta: ObjectMeta,
    pub data: Vec<u8>,
}

/// Keeps every object in memory.
#[derive(Debug, Default)]
pub struct BufferWriter {
    objects: Mutex<Vec<ReceivedObject>>,
}

impl BufferWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn objects(&self) -> Vec<ReceivedObject> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectWriter for BufferWriter {
    fn write(&self, meta: &ObjectMeta, data: &[u8]) -> Result<(), WriterError> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ReceivedObject { meta: meta.clone(), data: data.to_vec() });
        Ok(())
    }
}

// ── Filesystem ───────────────────────────────────────────────────────────────

/// Writes each object below `root`, at the path of its content location.
#[derive(Debug, Clone)]
pub struct FsWriter {
    root: PathBuf,
}

impl FsWriter {
    pub fn new<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            fs::create_dir_all(&root)?;
        }
        Ok(Self { root })
    }

    /// Destination of `content_location`.  Scheme and authority are dropped
    /// and `..` segments are ignored, so the result always lies under `root`.
    pub fn destination(&self, content_location: &str) -> Result<PathBuf, WriterError> {
        let path = match content_location.split_once("://") {
            Some((_, rest)) => rest.split_once('/').map_or("", |(_, p)| p),
            None => content_location,
        };
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let relative: PathBuf = Path::new(path)
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part),
                _ => None,
            })
            .collect();
        if relative.as_os_str().is_empty() {
            return Err(WriterError::InvalidLocation(content_location.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

impl ObjectWriter for FsWriter {
    fn write(&self, meta: &ObjectMeta, data: &[u8]) -> Result<(), WriterError> {
        let dest = self.destination(&meta.content_location)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        File::create(&dest)?.write_all(data)?;
        tracing::info!(toi = meta.toi, path = %dest.display(), len = data.len(), "object written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_sanitized() {
        let w = FsWriter { root: PathBuf::from("/out") };
        assert_eq!(w.destination("file:///a/b.txt").unwrap(), PathBuf::from("/out/a/b.txt"));
        assert_eq!(w.destination("http://host/x/../y.bin?v=1").unwrap(), PathBuf::from("/out/x/y.bin"));
        assert_eq!(w.destination("../../etc/passwd").unwrap(), PathBuf::from("/out/etc/passwd"));
        assert!(w.destination("http://host/").is_err());
    }

    #[test]
    fn test_buffer_writer_collects() {
        let w = BufferWriter::new();
        let meta = ObjectMeta { toi: 1, content_location: "a".into(), content_type: "t".into() };
        w.write(&meta, b"xyz").unwrap();
        assert_eq!(w.len(), 1);
        assert_eq!(w.objects()[0].data, b"xyz");
    }
}
