//! The on-disk segment queue.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use fs2::FileExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::segment::{Extension, ReadSegment, WriteSegment};

const LOCK_FILE: &str = "LOCK";

/// Persistent FIFO of segments in a single directory.
///
/// Opening the queue takes an advisory exclusive lock on `<root>/LOCK`
/// which is held until the queue is dropped, so exactly one process owns
/// the directory at a time.
pub struct Queue {
    root: PathBuf,
    lock: File,
}

impl Queue {
    /// Open (or create) the queue rooted at `root` and run crash
    /// recovery: every `.active` and `.pending` segment left behind by a
    /// previous process is renamed back to `.flushed`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let lock_path = root.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)?;
        if lock.try_lock_exclusive().is_err() {
            return Err(QueueError::Locked { path: lock_path });
        }

        recover_segments(&root)?;
        info!(root = %root.display(), "segment queue opened");

        Ok(Self { root, lock })
    }

    /// The queue's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a new segment. The returned writer owns a `.active` file;
    /// closing it flushes the segment into the queue.
    pub fn enqueue(&self) -> Result<WriteSegment> {
        let id = Uuid::new_v4();
        let path = self
            .root
            .join(format!("{}.{}", id, Extension::Active.as_str()));
        let file = File::create(&path)?;
        debug!(segment = %path.display(), "segment enqueued");
        Ok(WriteSegment::new(file, path))
    }

    /// Check out the oldest flushed segment for reading.
    ///
    /// Selection is by minimum modification time with the file name as a
    /// deterministic tie-break. The chosen segment is renamed to
    /// `.pending` before it is opened; the rename is the atomic claim, so
    /// a segment can only ever be handed to one reader.
    pub fn dequeue(&self) -> Result<ReadSegment> {
        let mut chosen: Option<(SystemTime, OsString, PathBuf)> = None;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path();
            if Extension::of(&path) != Some(Extension::Flushed) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            let name = entry.file_name();
            let older = match &chosen {
                None => true,
                Some((t, n, _)) => (modified, &name) < (*t, n),
            };
            if older {
                chosen = Some((modified, name, path));
            }
        }

        let (_, _, flushed) = chosen.ok_or(QueueError::NoSegmentsAvailable)?;
        let pending = flushed.with_extension(Extension::Pending.as_str());
        fs::rename(&flushed, &pending)?;

        let file = match File::open(&pending) {
            Ok(file) => file,
            Err(open_err) => {
                // Undo the claim so the segment is offered again.
                if let Err(rename_err) = fs::rename(&pending, &flushed) {
                    warn!(
                        segment = %pending.display(),
                        error = %rename_err,
                        "failed to restore claimed segment",
                    );
                    return Err(rename_err.into());
                }
                return Err(open_err.into());
            }
        };

        let size = file.metadata()?.len();
        debug!(segment = %pending.display(), size, "segment dequeued");
        Ok(ReadSegment::new(file, pending, size))
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock);
    }
}

fn recover_segments(root: &Path) -> Result<()> {
    let mut to_rename = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path();
        if matches!(
            Extension::of(&path),
            Some(Extension::Active) | Some(Extension::Pending)
        ) {
            to_rename.push(path);
        }
    }

    for path in to_rename {
        let flushed = path.with_extension(Extension::Flushed.as_str());
        fs::rename(&path, &flushed)?;
        debug!(segment = %flushed.display(), "segment recovered");
    }
    Ok(())
}
