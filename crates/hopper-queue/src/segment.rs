//! Segment file handles and their lifecycle extensions.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Lifecycle state of a persisted segment, encoded in its file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    /// Currently being written.
    Active,
    /// Closed and eligible for dequeue.
    Flushed,
    /// Checked out by a reader.
    Pending,
}

impl Extension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Extension::Active => "active",
            Extension::Flushed => "flushed",
            Extension::Pending => "pending",
        }
    }

    /// Classify a path by its extension, if it carries one of ours.
    pub fn of(path: &Path) -> Option<Extension> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("active") => Some(Extension::Active),
            Some("flushed") => Some(Extension::Flushed),
            Some("pending") => Some(Extension::Pending),
            _ => None,
        }
    }
}

/// A segment being written. Closing flushes it into the queue; deleting
/// discards a half-written segment.
pub struct WriteSegment {
    file: File,
    path: PathBuf,
    written: u64,
}

impl WriteSegment {
    pub(crate) fn new(file: File, path: PathBuf) -> Self {
        Self {
            file,
            path,
            written: 0,
        }
    }

    /// Fsync the segment contents.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Close the segment and rename it to `.flushed`, making it eligible
    /// for dequeue.
    pub fn close(self) -> Result<()> {
        let flushed = self.path.with_extension(Extension::Flushed.as_str());
        drop(self.file);
        fs::rename(&self.path, &flushed)?;
        Ok(())
    }

    /// Discard the segment without flushing it.
    pub fn delete(self) -> Result<()> {
        drop(self.file);
        fs::remove_file(&self.path)?;
        Ok(())
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.written
    }
}

impl Write for WriteSegment {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// A segment checked out for reading. It must end in either `commit`
/// (consumed, deleted) or `failed` (offered again); a crash in between is
/// resolved by queue recovery.
#[derive(Debug)]
pub struct ReadSegment {
    file: Option<File>,
    path: PathBuf,
    size: u64,
}

impl ReadSegment {
    pub(crate) fn new(file: File, path: PathBuf, size: u64) -> Self {
        Self {
            file: Some(file),
            path,
            size,
        }
    }

    /// An independent handle onto the open segment, sharing the read
    /// position. Used to stream contents while this handle stays behind
    /// to commit or fail.
    pub fn reader(&self) -> io::Result<File> {
        match &self.file {
            Some(file) => file.try_clone(),
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                "segment already closed",
            )),
        }
    }

    /// Close and unlink the segment.
    pub fn commit(&mut self) -> Result<()> {
        self.file.take();
        fs::remove_file(&self.path)?;
        Ok(())
    }

    /// Close the segment and rename it back to `.flushed`, making it
    /// available for another reader.
    pub fn failed(&mut self) -> Result<()> {
        self.file.take();
        let flushed = self.path.with_extension(Extension::Flushed.as_str());
        fs::rename(&self.path, &flushed)?;
        Ok(())
    }

    /// Byte length of the segment at checkout time.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Read for ReadSegment {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.file {
            Some(file) => file.read(buf),
            None => Ok(0),
        }
    }
}
