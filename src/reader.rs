//! Reader path (spec.md §4.6, §4.7): locating the next unread interval for a
//! subscriber and reading individual records out of it.

use std::path::Path;

use crate::checkpoint;
use crate::error::{Error, ErrorKind, Result};
use crate::header::{RecordHeader, HEADER_SIZE};
use crate::ids::{segment_path, LogId, Marker, Position};
use crate::indexer::resync_index;
use crate::segment::SegmentStore;

/// A zero-copy view into a mapped record: header plus a borrowed payload
/// slice, valid as long as the owning `SegmentStore`'s mapping isn't
/// invalidated.
#[derive(Debug)]
pub struct RecordView<'a> {
    pub header: RecordHeader,
    pub payload: &'a [u8],
}

/// Walk forward from `cp` to the first segment with unread data, skipping
/// fully-consumed closed segments and missing (already garbage-collected)
/// ones. Never advances past `storage_log`, the writer's live segment.
pub(crate) fn find_first_log_after(
    store: &mut SegmentStore,
    dir: &Path,
    cp: Position,
    hdr_magic: u32,
    storage_log: LogId,
) -> Result<(LogId, Position)> {
    let mut log = cp.log;
    loop {
        let effective_marker: Marker = if log == cp.log { cp.marker } else { 0 };

        if !segment_path(dir, log).exists() {
            if log >= storage_log {
                return Ok((log, Position::new(log, 0)));
            }
            log += 1;
            continue;
        }

        let result = resync_index(store, log, hdr_magic, storage_log)?;
        if result.closed && effective_marker >= result.last.marker && log < storage_log {
            log += 1;
            continue;
        }
        return Ok((log, result.last));
    }
}

/// Compute and persist the next unread interval `[start, finish]` for a
/// subscriber currently checkpointed at `cp`. Returns the count of unread
/// records in the interval (0 when there is nothing new).
pub fn read_interval(
    store: &mut SegmentStore,
    dir: &Path,
    subscriber: &str,
    cp: Position,
    start: &mut Position,
    finish: &mut Position,
    hdr_magic: u32,
    storage_log: LogId,
    safe: bool,
) -> Result<i64> {
    let (found_log, last) = find_first_log_after(store, dir, cp, hdr_magic, storage_log)?;
    let mut begin = Position::new(found_log, if found_log == cp.log { cp.marker } else { 0 });

    if found_log != cp.log {
        checkpoint::set_checkpoint(store, dir, subscriber, begin, safe)?;
    }

    store.invalidate_reader();

    let count = last.marker as i64 - begin.marker as i64;
    if count > 0 {
        begin.marker += 1;
        *start = begin;
        *finish = last;
        Ok(count)
    } else if count < 0 {
        checkpoint::set_checkpoint(store, dir, subscriber, last, safe)?;
        *start = last;
        *finish = last;
        Ok(0)
    } else {
        *start = begin;
        *finish = last;
        Ok(0)
    }
}

/// Read a single record at `(log, marker)`, forcing one resync-and-retry if
/// the index looks stale or corrupt.
pub fn read_message<'a>(
    store: &'a mut SegmentStore,
    log: LogId,
    marker: Marker,
    hdr_magic: u32,
    storage_log: LogId,
) -> Result<RecordView<'a>> {
    if marker < 1 {
        return Err(Error::with_detail(ErrorKind::IllegalLogId, "marker must be >= 1"));
    }

    let offset = resolve_offset(store, log, marker, hdr_magic, storage_log)?;

    let map = store
        .reader_map(log)?
        .ok_or_else(|| Error::with_detail(ErrorKind::FileCorrupt, "index entry exists but segment is empty"))?;
    let slice = map.as_slice();
    let offset = offset as usize;

    if offset + HEADER_SIZE > slice.len() {
        return Err(Error::with_detail(ErrorKind::FileCorrupt, "record offset out of bounds"));
    }
    let header_bytes: [u8; HEADER_SIZE] = slice[offset..offset + HEADER_SIZE].try_into().expect("slice length");
    let header = RecordHeader::from_bytes(&header_bytes);
    header.check_magic(hdr_magic)?;

    let payload_start = offset + HEADER_SIZE;
    let payload_end = payload_start + header.mlen as usize;
    if payload_end > slice.len() {
        return Err(Error::with_detail(ErrorKind::FileCorrupt, "record payload out of bounds"));
    }

    Ok(RecordView {
        header,
        payload: &slice[payload_start..payload_end],
    })
}

fn resolve_offset(store: &mut SegmentStore, log: LogId, marker: Marker, hdr_magic: u32, storage_log: LogId) -> Result<u64> {
    for attempt in 0..2 {
        let index_file = store.index_handle(log)?;
        let idx_len = crate::file::file_size(index_file)?;
        let entry_offset = (marker as u64 - 1) * 8;

        if idx_len % 8 != 0 || entry_offset + 8 > idx_len {
            if attempt == 0 {
                resync_index(store, log, hdr_magic, storage_log)?;
                continue;
            }
            return Err(Error::with_detail(ErrorKind::IndexCorrupt, "marker out of range after resync"));
        }

        let index_file = store.index_handle(log)?;
        let value = read_u64(index_file, entry_offset)?;
        if value == 0 {
            if entry_offset + 8 == idx_len {
                return Err(Error::new(ErrorKind::CloseLogId));
            }
            if attempt == 0 {
                resync_index(store, log, hdr_magic, storage_log)?;
                continue;
            }
            return Err(Error::with_detail(ErrorKind::IndexCorrupt, "unexpected zero index entry"));
        }
        return Ok(value);
    }
    unreachable!("loop always returns or continues exactly twice")
}

fn read_u64(file: &std::fs::File, offset: u64) -> Result<u64> {
    use std::os::unix::fs::FileExt;
    let mut buf = [0u8; 8];
    file.read_exact_at(&mut buf, offset)
        .map_err(|e| Error::from_io(ErrorKind::IndexRead, e))?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::add_subscriber;
    use crate::config::{JournalConfig, Whence};
    use crate::header::DEFAULT_HDR_MAGIC;
    use crate::metastore::MetastoreManager;
    use crate::writer::{open_writer, write_message};
    use tempfile::tempdir;

    #[test]
    fn read_interval_returns_all_records_from_begin() {
        let dir = tempdir().expect("tempdir");
        let config = JournalConfig::default();
        let mut meta = MetastoreManager::open_or_create(dir.path(), &config).expect("meta");
        let mut store = SegmentStore::new(dir.path());
        let (mut log, mut marker) = open_writer(&mut store, &mut meta, &config).expect("open");
        write_message(&mut store, &mut meta, &mut log, &mut marker, &config, b"x", None).expect("write");
        write_message(&mut store, &mut meta, &mut log, &mut marker, &config, b"yy", None).expect("write");
        write_message(&mut store, &mut meta, &mut log, &mut marker, &config, b"zzz", None).expect("write");

        add_subscriber(&mut store, dir.path(), "s", Whence::Begin, config.hdr_magic, log, true).expect("add");
        let cp = checkpoint::read_checkpoint(dir.path(), "s").expect("cp");

        let mut start = Position::ZERO;
        let mut finish = Position::ZERO;
        let count = read_interval(&mut store, dir.path(), "s", cp, &mut start, &mut finish, config.hdr_magic, log, true)
            .expect("interval");

        assert_eq!(count, 3);
        assert_eq!(start, Position::new(0, 1));
        assert_eq!(finish, Position::new(0, 3));

        let first = read_message(&mut store, 0, 1, DEFAULT_HDR_MAGIC, log).expect("read 1");
        assert_eq!(first.payload, b"x");
        let second = read_message(&mut store, 0, 2, DEFAULT_HDR_MAGIC, log).expect("read 2");
        assert_eq!(second.payload, b"yy");
        let third = read_message(&mut store, 0, 3, DEFAULT_HDR_MAGIC, log).expect("read 3");
        assert_eq!(third.payload, b"zzz");
    }

    #[test]
    fn read_interval_from_end_sees_nothing_yet() {
        let dir = tempdir().expect("tempdir");
        let config = JournalConfig::default();
        let mut meta = MetastoreManager::open_or_create(dir.path(), &config).expect("meta");
        let mut store = SegmentStore::new(dir.path());
        let (mut log, mut marker) = open_writer(&mut store, &mut meta, &config).expect("open");
        write_message(&mut store, &mut meta, &mut log, &mut marker, &config, b"x", None).expect("write");

        add_subscriber(&mut store, dir.path(), "s", Whence::End, config.hdr_magic, log, true).expect("add");
        let cp = checkpoint::read_checkpoint(dir.path(), "s").expect("cp");

        let mut start = Position::ZERO;
        let mut finish = Position::ZERO;
        let count = read_interval(&mut store, dir.path(), "s", cp, &mut start, &mut finish, config.hdr_magic, log, true)
            .expect("interval");
        assert_eq!(count, 0);
    }

    #[test]
    fn read_message_on_closed_sentinel_returns_close_logid() {
        let dir = tempdir().expect("tempdir");
        let config = JournalConfig { unit_limit: 10, ..JournalConfig::default() };
        let mut meta = MetastoreManager::open_or_create(dir.path(), &config).expect("meta");
        let mut store = SegmentStore::new(dir.path());
        let (mut log, mut marker) = open_writer(&mut store, &mut meta, &config).expect("open");
        write_message(&mut store, &mut meta, &mut log, &mut marker, &config, b"12345678", None).expect("write");
        write_message(&mut store, &mut meta, &mut log, &mut marker, &config, b"next", None).expect("write");

        let result = resync_index(&mut store, 0, config.hdr_magic, log).expect("resync closed segment");
        assert!(result.closed);

        let err = read_message(&mut store, 0, result.last.marker + 1, config.hdr_magic, log).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CloseLogId);
    }
}
