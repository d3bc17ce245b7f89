//! A journaled, append-only, multi-subscriber message log over a directory
//! of segment files.
//!
//! A directory managed by this crate holds a metastore, one data/index file
//! pair per segment, and one checkpoint file per subscriber. A single writer
//! appends records and rotates segments once they reach the configured unit
//! limit; any number of subscribers independently track their own read
//! position and advance it as they consume records. [`Journal`] is the
//! top-level handle tying these pieces together; see its docs for the
//! `init` → `open_writer`/`open_reader` → read/write lifecycle.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod file;
pub mod header;
pub mod ids;
pub mod indexer;
pub mod journal;
pub mod metastore;
pub mod reader;
pub mod repair;
pub mod segment;
pub mod writer;

pub use config::{JournalConfig, Safety, Whence};
pub use error::{Error, ErrorKind, Result};
pub use ids::{LogId, Marker, Position};
pub use journal::Journal;
pub use reader::RecordView;
