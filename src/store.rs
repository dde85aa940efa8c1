//! Append-only byte logs read incrementally by offset.
//!
//! The discovery log and the external verifier's result log are both plain
//! append-only files. Callers go through [`AppendLog`] so tests (and any other
//! backend) can swap in [`MemoryAppendLog`].

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait AppendLog: Send + Sync {
    /// Append `bytes` and return the log length afterwards.
    fn append(&self, bytes: &[u8]) -> Result<u64>;

    /// Bytes from `offset` to the current end, plus the end offset. A log
    /// shorter than `offset` (truncated or rotated) yields nothing and keeps
    /// `offset`, so the caller's offset never moves backwards.
    fn read_since(&self, offset: u64) -> Result<(Vec<u8>, u64)>;

    fn len(&self) -> Result<u64>;
}

#[derive(Clone, Debug)]
pub struct FileAppendLog {
    path: PathBuf,
}

impl FileAppendLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileAppendLog { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AppendLog for FileAppendLog {
    fn append(&self, bytes: &[u8]) -> Result<u64> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {} for append", self.path.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("appending to {}", self.path.display()))?;
        file.sync_data()
            .with_context(|| format!("syncing {}", self.path.display()))?;
        Ok(file.metadata()?.len())
    }

    fn read_since(&self, offset: u64) -> Result<(Vec<u8>, u64)> {
        let mut file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), offset)),
            Err(e) => {
                return Err(e).with_context(|| format!("opening {}", self.path.display()));
            }
        };
        let len = file.metadata()?.len();
        if len <= offset {
            return Ok((Vec::new(), offset));
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity((len - offset) as usize);
        file.read_to_end(&mut buf)
            .with_context(|| format!("reading {} from offset {}", self.path.display(), offset))?;
        let end = offset + buf.len() as u64;
        Ok((buf, end))
    }

    fn len(&self) -> Result<u64> {
        match fs::metadata(&self.path) {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e).with_context(|| format!("stat {}", self.path.display())),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryAppendLog {
    bytes: Mutex<Vec<u8>>,
}

impl MemoryAppendLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl AppendLog for MemoryAppendLog {
    fn append(&self, bytes: &[u8]) -> Result<u64> {
        let mut buf = self.bytes.lock().unwrap_or_else(|e| e.into_inner());
        buf.extend_from_slice(bytes);
        Ok(buf.len() as u64)
    }

    fn read_since(&self, offset: u64) -> Result<(Vec<u8>, u64)> {
        let buf = self.bytes.lock().unwrap_or_else(|e| e.into_inner());
        let len = buf.len() as u64;
        if len <= offset {
            return Ok((Vec::new(), offset));
        }
        Ok((buf[offset as usize..].to_vec(), len))
    }

    fn len(&self) -> Result<u64> {
        Ok(self.bytes.lock().unwrap_or_else(|e| e.into_inner()).len() as u64)
    }
}
