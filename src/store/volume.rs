//! Volumes
//!
//! Random-access byte spaces the direct store is laid out on.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};

use crate::error::{AtlasError, Result};

/// A growable, randomly addressable byte space
pub trait Volume: Send + Sync {
    /// Fill `buf` from `offset`; reading past the end is an error
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `offset`, growing the volume if needed
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Current length in bytes
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cut the volume down to `len` bytes
    fn truncate(&self, len: u64) -> Result<()>;

    /// Make previous writes durable
    fn sync(&self) -> Result<()>;

    /// Release the medium; later calls fail
    fn close(&self) -> Result<()>;

    /// Backing file, if any
    fn path(&self) -> Option<&Path>;
}

// =============================================================================
// HeapVolume
// =============================================================================

/// Volume held in process memory
#[derive(Default)]
pub struct HeapVolume {
    data: RwLock<Vec<u8>>,
}

impl HeapVolume {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Volume for HeapVolume {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(AtlasError::Corruption(format!(
                "read of {} bytes at {} past end of heap volume ({})",
                buf.len(),
                offset,
                data.len()
            )));
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + bytes.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.data.write().truncate(len as usize);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut data = self.data.write();
        data.clear();
        data.shrink_to_fit();
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        None
    }
}

// =============================================================================
// FileVolume
// =============================================================================

struct FileState {
    file: Option<File>,
    len: u64,
}

/// Volume backed by a single random-access file
pub struct FileVolume {
    path: PathBuf,
    state: Mutex<FileState>,
}

impl FileVolume {
    /// Open or create the file, creating parent directories
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(FileState {
                file: Some(file),
                len,
            }),
        })
    }
}

fn closed_volume() -> AtlasError {
    AtlasError::Closed
}

impl Volume for FileVolume {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        let file = state.file.as_mut().ok_or_else(closed_volume)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                AtlasError::Corruption(format!(
                    "read of {} bytes at {} past end of {}",
                    buf.len(),
                    offset,
                    self.path.display()
                ))
            } else {
                AtlasError::Io(e)
            }
        })
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let file = state.file.as_mut().ok_or_else(closed_volume)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        let end = offset + data.len() as u64;
        if end > state.len {
            state.len = end;
        }
        Ok(())
    }

    fn len(&self) -> u64 {
        self.state.lock().len
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let mut state = self.state.lock();
        let file = state.file.as_mut().ok_or_else(closed_volume)?;
        file.set_len(len)?;
        state.len = len;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        let file = state.file.as_mut().ok_or_else(closed_volume)?;
        file.sync_all()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(file) = state.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}
