use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use uuid::Uuid;

use super::error::{ChunkUploadError, Result};
use super::planner::ChunkRange;

/// Process-unique identifier of a file handed to the engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct FileId(String);

impl FileId {
    pub fn generate() -> Self {
        Self(format!("f{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
enum FileSource {
    Path(PathBuf),
    Memory(Bytes),
}

/// A local file ready to be uploaded.
///
/// The size is captured when the handle is created and does not follow later
/// changes on disk.
#[derive(Debug, Clone)]
pub struct FileHandle {
    id: FileId,
    name: String,
    size: u64,
    target_name: Option<String>,
    source: FileSource,
}

impl FileHandle {
    /// Stat `path` and build a handle named after its file name
    pub async fn open(path: &Path) -> Result<Self> {
        let display = path.display().to_string();
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| ChunkUploadError::from_io_error(e, &display))?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or(display);

        Ok(Self {
            id: FileId::generate(),
            name,
            size: metadata.len(),
            target_name: None,
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    /// Build a handle over bytes already in memory
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            id: FileId::generate(),
            name: name.into(),
            size: data.len() as u64,
            target_name: None,
            source: FileSource::Memory(data),
        }
    }

    pub fn with_target_name(mut self, target_name: impl Into<String>) -> Self {
        self.target_name = Some(target_name.into());
        self
    }

    pub fn id(&self) -> &FileId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Location on disk; `None` for in-memory handles
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            FileSource::Path(path) => Some(path),
            FileSource::Memory(_) => None,
        }
    }

    pub fn target_name(&self) -> Option<&str> {
        self.target_name.as_deref()
    }

    /// Name the server should store the file under
    pub fn upload_name(&self) -> &str {
        self.target_name.as_deref().unwrap_or(&self.name)
    }

    /// Read the bytes of `range` into an owned buffer
    pub async fn read_range(&self, range: ChunkRange) -> Result<Bytes> {
        match &self.source {
            FileSource::Memory(data) => {
                if range.end > data.len() as u64 {
                    return Err(ChunkUploadError::from_io_error(
                        std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "range past end of buffer",
                        ),
                        &self.name,
                    ));
                }
                Ok(data.slice(range.start as usize..range.end as usize))
            }
            FileSource::Path(path) => {
                let display = path.display().to_string();
                let io_err = |e| ChunkUploadError::from_io_error(e, &display);

                let mut file = tokio::fs::File::open(path).await.map_err(io_err)?;
                file.seek(SeekFrom::Start(range.start))
                    .await
                    .map_err(io_err)?;

                let mut buffer = vec![0u8; range.len() as usize];
                file.read_exact(&mut buffer).await.map_err(io_err)?;
                Ok(Bytes::from(buffer))
            }
        }
    }
}

/// Ownership map of the file handles an orchestrator has queued.
///
/// Scoped to whoever creates it; the engine never keeps its own table.
#[derive(Debug, Default)]
pub struct FileRegistry {
    files: HashMap<FileId, FileHandle>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: FileHandle) -> FileId {
        let id = handle.id().clone();
        self.files.insert(id.clone(), handle);
        id
    }

    /// Open `path` and register it
    pub async fn add_path(&mut self, path: &Path) -> Result<FileId> {
        let handle = FileHandle::open(path).await?;
        Ok(self.insert(handle))
    }

    pub fn get(&self, id: &FileId) -> Option<&FileHandle> {
        self.files.get(id)
    }

    pub fn remove(&mut self, id: &FileId) -> Option<FileHandle> {
        self.files.remove(id)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileHandle> {
        self.files.values()
    }
}
