//! Durable, ordered telemetry buffer.
//!
//! Readings are appended one JSON document per line and removed only in bulk,
//! after the cloud confirmed a batch. A snapshot remembers how many bytes it
//! covers so a clear never drops lines appended while the batch was in flight.

use log::warn;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::models::farm::SensorReading;

#[derive(Debug)]
pub enum BufferError {
    Io(io::Error),
    Json(serde_json::Error),
    /// The region covered by a snapshot is no longer present in the buffer.
    Changed { expected: u64, actual: u64 },
}

impl core::fmt::Display for BufferError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BufferError::Io(e) => write!(f, "io error: {}", e),
            BufferError::Json(e) => write!(f, "json error: {}", e),
            BufferError::Changed { expected, actual } => write!(
                f,
                "buffer shrank underneath snapshot (snapshot covers {} bytes, buffer holds {})",
                expected, actual
            ),
        }
    }
}

impl std::error::Error for BufferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BufferError::Io(e) => Some(e),
            BufferError::Json(e) => Some(e),
            BufferError::Changed { .. } => None,
        }
    }
}

impl From<io::Error> for BufferError {
    fn from(value: io::Error) -> Self {
        BufferError::Io(value)
    }
}

impl From<serde_json::Error> for BufferError {
    fn from(value: serde_json::Error) -> Self {
        BufferError::Json(value)
    }
}

/// Raw buffer contents at one point in time, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferSnapshot {
    pub entries: Vec<String>,
    end_offset: u64,
}

impl BufferSnapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

pub trait TelemetryBuffer: Send + Sync {
    /// Durably record one reading before returning.
    fn append(&self, reading: &SensorReading) -> Result<(), BufferError>;

    /// Everything currently buffered, in arrival order. Nothing is removed.
    fn drain_snapshot(&self) -> Result<BufferSnapshot, BufferError>;

    /// Atomically remove exactly the entries of `snapshot`; later appends are kept.
    fn clear(&self, snapshot: &BufferSnapshot) -> Result<(), BufferError>;
}

/// JSON Lines file buffer.
pub struct FileBuffer {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileBuffer {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BufferError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = Self::open_append(&path)?;

        // A crash mid-append leaves an unterminated record; fence it off so the next append starts clean.
        let existing = fs::read(&path)?;
        if existing.last().is_some_and(|b| *b != b'\n') {
            warn!(
                "Telemetry buffer {} ends with an incomplete record; it will be skipped on forward",
                path.display()
            );
            file.write_all(b"\n")?;
            file.sync_data()?;
        }

        Ok(FileBuffer {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).read(true).open(path)
    }

    fn lock(&self) -> MutexGuard<'_, File> {
        // The guarded handle stays valid even if a holder panicked mid-write.
        self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Persist the rename itself.
    fn sync_dir(&self) -> io::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        File::open(dir)?.sync_all()
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl TelemetryBuffer for FileBuffer {
    fn append(&self, reading: &SensorReading) -> Result<(), BufferError> {
        let mut line = reading.to_line()?;
        line.push('\n');

        let mut file = self.lock();
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn drain_snapshot(&self) -> Result<BufferSnapshot, BufferError> {
        let _file = self.lock();
        let bytes = fs::read(&self.path)?;

        // Only newline-terminated records are complete.
        let end = bytes.iter().rposition(|b| *b == b'\n').map(|i| i + 1).unwrap_or(0);
        let entries = bytes[..end]
            .split(|b| *b == b'\n')
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect();

        Ok(BufferSnapshot {
            entries,
            end_offset: end as u64,
        })
    }

    fn clear(&self, snapshot: &BufferSnapshot) -> Result<(), BufferError> {
        let mut file = self.lock();
        let bytes = fs::read(&self.path)?;
        let actual = bytes.len() as u64;
        if actual < snapshot.end_offset {
            return Err(BufferError::Changed {
                expected: snapshot.end_offset,
                actual,
            });
        }

        let tail = &bytes[snapshot.end_offset as usize..];
        let tmp = self.tmp_path();
        {
            let mut out = File::create(&tmp)?;
            out.write_all(tail)?;
            out.sync_all()?;
        }
        // Open the replacement before it takes the buffer's name; the handle follows the file
        // through the rename, so appends never go to an unlinked inode.
        let replacement = Self::open_append(&tmp)?;
        fs::rename(&tmp, &self.path)?;
        *file = replacement;
        self.sync_dir()?;
        Ok(())
    }
}
