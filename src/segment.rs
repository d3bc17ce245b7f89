//! Segment & index store (spec.md §4.2): the cached handles a context keeps
//! open across calls so a hot append or read loop isn't reopening files on
//! every record. Grounded in the teacher's `mmap.rs` remap-on-demand pattern,
//! generalized from "one fixed-size ring segment" to "one of many
//! sequentially-numbered segments".

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::file::{self, ReadOnlyMap};
use crate::ids::{index_path, segment_path, LogId};

/// Holds whichever data/index handles the owning context last touched,
/// reopening only when the requested `LogId` changes.
pub struct SegmentStore {
    dir: PathBuf,

    writer_log: Option<LogId>,
    writer_file: Option<File>,

    reader_log: Option<LogId>,
    reader_file: Option<File>,
    reader_map: Option<ReadOnlyMap>,

    index_log: Option<LogId>,
    index_file: Option<File>,
}

impl SegmentStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            writer_log: None,
            writer_file: None,
            reader_log: None,
            reader_file: None,
            reader_map: None,
            index_log: None,
            index_file: None,
        }
    }

    /// Data segment opened (created if absent) for append, at the
    /// configured segment mode. Cached across calls for the same `log`.
    pub fn writer_handle(&mut self, log: LogId, segment_mode: u32) -> Result<&File> {
        if self.writer_log != Some(log) {
            let path = segment_path(&self.dir, log);
            let file = file::open_read_write_create_mode(&path, segment_mode)?;
            self.writer_file = Some(file);
            self.writer_log = Some(log);
        }
        Ok(self.writer_file.as_ref().expect("just set"))
    }

    /// Data segment opened read-only for a reader's positional reads.
    /// Readers never create a segment: its presence is implied by the
    /// index having been resynced against it.
    pub fn reader_handle(&mut self, log: LogId) -> Result<&File> {
        if self.reader_log != Some(log) {
            let path = segment_path(&self.dir, log);
            let file = file::open_read_only(&path)?;
            self.reader_file = Some(file);
            self.reader_map = None;
            self.reader_log = Some(log);
        }
        Ok(self.reader_file.as_ref().expect("just set"))
    }

    /// Read-only mapping of the reader's current data segment, remapped
    /// whenever the segment changes or a prior repair invalidated it.
    /// `None` for a segment that is present but still empty — `memmap2`
    /// refuses to map a zero-length file.
    pub fn reader_map(&mut self, log: LogId) -> Result<Option<&ReadOnlyMap>> {
        self.reader_handle(log)?;
        if self.reader_map.is_none() {
            let file = self.reader_file.as_ref().expect("reader_handle set it");
            if file::file_size(file)? == 0 {
                return Ok(None);
            }
            self.reader_map = Some(ReadOnlyMap::map(file)?);
        }
        Ok(self.reader_map.as_ref())
    }

    /// Index file for `log`, created lazily (empty) the first time a writer
    /// or the indexer touches a segment that has none yet.
    pub fn index_handle(&mut self, log: LogId) -> Result<&File> {
        if self.index_log != Some(log) {
            let path = index_path(&self.dir, log);
            let file = file::open_read_write_create(&path)?;
            self.index_file = Some(file);
            self.index_log = Some(log);
        }
        Ok(self.index_file.as_ref().expect("just set"))
    }

    /// Index and data handles for `log` together, for the resync path which
    /// needs both open at once (can't be two separate `&mut self` calls).
    pub fn index_and_reader(&mut self, log: LogId) -> Result<(&File, &File)> {
        self.index_handle(log)?;
        self.reader_handle(log)?;
        Ok((
            self.index_file.as_ref().expect("index_handle set it"),
            self.reader_file.as_ref().expect("reader_handle set it"),
        ))
    }

    /// Drop the cached reader mapping/handle without touching the writer or
    /// index caches — used after a repair truncates the segment out from
    /// under a live mapping.
    pub fn invalidate_reader(&mut self) {
        self.reader_map = None;
        self.reader_file = None;
        self.reader_log = None;
    }

    pub fn invalidate_writer(&mut self) {
        self.writer_file = None;
        self.writer_log = None;
    }

    pub fn invalidate_index(&mut self) {
        self.index_file = None;
        self.index_log = None;
    }

    /// Drop every cached handle for `log` — a segment that repair or GC is
    /// about to rewrite or remove out from under us.
    pub fn invalidate_all(&mut self, log: LogId) {
        if self.writer_log == Some(log) {
            self.invalidate_writer();
        }
        if self.reader_log == Some(log) {
            self.invalidate_reader();
        }
        if self.index_log == Some(log) {
            self.invalidate_index();
        }
    }
}
