//! Persistent FIFO queue of record segments.
//!
//! Segments live as `<uuid>.<ext>` files in a single directory and move
//! through their lifecycle by rename: `.active` while a writer owns them,
//! `.flushed` once eligible for readers, `.pending` while checked out. A
//! `LOCK` file grants the directory to one process at a time, and crash
//! recovery folds `.active` and `.pending` files back to `.flushed` on
//! open.

pub mod error;
mod queue;
mod segment;

pub use error::{QueueError, Result};
pub use queue::Queue;
pub use segment::{Extension, ReadSegment, WriteSegment};
