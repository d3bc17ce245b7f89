//! Indexer / resync (spec.md §4.5): builds or extends a segment's index by
//! scanning its data file forward from the last known-good offset, and
//! detects/marks a segment as closed once rotation has moved past it.

use std::fs::File;
use std::os::unix::fs::FileExt;

use crate::error::{Error, ErrorKind, Result};
use crate::file::{self, LockGuard};
use crate::header::{RecordHeader, HEADER_SIZE};
use crate::ids::{LogId, Position};
use crate::segment::SegmentStore;

const FLUSH_BATCH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncResult {
    pub last: Position,
    pub closed: bool,
}

/// One scan attempt's failure: how far the index can be trusted, and why.
struct Torn {
    truncate_to: u64,
    err: Error,
}

/// Resync the index for `log` against its data file, retrying once under
/// corruption per the restart protocol before surfacing `IndexCorrupt`.
pub fn resync_index(
    store: &mut SegmentStore,
    log: LogId,
    hdr_magic: u32,
    storage_log: LogId,
) -> Result<ResyncResult> {
    let (index_file, data_file) = store.index_and_reader(log)?;
    let _lock = LockGuard::acquire(index_file)?;

    match attempt(index_file, data_file, log, hdr_magic, storage_log) {
        Ok(result) => Ok(result),
        Err(torn) => {
            log::warn!(
                "index corruption in segment {log:08x}, truncating to {} and retrying: {}",
                torn.truncate_to,
                torn.err
            );
            file::set_len(index_file, torn.truncate_to)?;
            match attempt(index_file, data_file, log, hdr_magic, storage_log) {
                Ok(result) => Ok(result),
                Err(torn2) => Err(Error::with_detail(
                    ErrorKind::IndexCorrupt,
                    format!("segment {log:08x} failed to resync twice: {}", torn2.err),
                )),
            }
        }
    }
}

fn attempt(
    index_file: &File,
    data_file: &File,
    log: LogId,
    hdr_magic: u32,
    storage_log: LogId,
) -> std::result::Result<ResyncResult, Torn> {
    let idx_len = file::file_size(index_file).map_err(|e| Torn { truncate_to: 0, err: e })?;
    let data_len = file::file_size(data_file).map_err(|e| Torn { truncate_to: 0, err: e })?;

    if idx_len % 8 != 0 {
        let truncate_to = (idx_len / 8) * 8;
        return Err(Torn {
            truncate_to,
            err: Error::with_detail(ErrorKind::IndexCorrupt, format!("index length {idx_len} not a multiple of 8")),
        });
    }

    let mut data_off;
    if idx_len > 8 {
        let last = read_u64(index_file, idx_len - 8).map_err(|e| Torn { truncate_to: idx_len - 8, err: e })?;
        if last == 0 {
            return Ok(ResyncResult {
                last: Position::new(log, (idx_len / 8 - 1) as u32),
                closed: true,
            });
        }
        if last > data_len {
            return Err(Torn {
                truncate_to: idx_len - 8,
                err: Error::with_detail(ErrorKind::IndexCorrupt, "index entry points past end of data"),
            });
        }
        data_off = last;
        let header = read_header(data_file, data_off).map_err(|e| Torn { truncate_to: idx_len - 8, err: e })?;
        data_off += header.record_len();
    } else if idx_len == 8 {
        data_off = read_u64(index_file, 0).map_err(|e| Torn { truncate_to: 0, err: e })?;
        if data_off > data_len {
            return Err(Torn {
                truncate_to: 0,
                err: Error::with_detail(ErrorKind::IndexCorrupt, "index entry points past end of data"),
            });
        }
        let header = read_header(data_file, data_off).map_err(|e| Torn { truncate_to: 0, err: e })?;
        data_off += header.record_len();
    } else {
        data_off = 0;
    }

    let mut idx_len = idx_len;
    let flush_base_start = idx_len;
    let mut batch: Vec<u8> = Vec::new();
    let mut flush_base = flush_base_start;

    loop {
        if data_off + HEADER_SIZE as u64 > data_len {
            break;
        }
        let header = match read_header(data_file, data_off) {
            Ok(h) => h,
            Err(e) => {
                flush(index_file, flush_base, &batch).map_err(|e| Torn { truncate_to: flush_base, err: e })?;
                return Err(Torn { truncate_to: flush_base, err: e });
            }
        };
        if header.magic != hdr_magic {
            flush(index_file, flush_base, &batch).map_err(|e| Torn { truncate_to: flush_base, err: e })?;
            return Err(Torn {
                truncate_to: flush_base,
                err: Error::with_detail(
                    ErrorKind::IndexCorrupt,
                    format!("record magic mismatch at offset {data_off}"),
                ),
            });
        }
        let next = data_off + header.record_len();
        if next > data_len {
            break;
        }
        batch.extend_from_slice(&data_off.to_le_bytes());
        idx_len += 8;
        data_off = next;

        if batch.len() / 8 >= FLUSH_BATCH {
            flush(index_file, flush_base, &batch).map_err(|e| Torn { truncate_to: flush_base, err: e })?;
            flush_base = idx_len;
            batch.clear();
        }
    }

    flush(index_file, flush_base, &batch).map_err(|e| Torn { truncate_to: flush_base, err: e })?;

    let mut last = Position::new(log, (idx_len / 8) as u32);
    let mut closed = false;

    if log < storage_log {
        if data_off != data_len {
            return Err(Torn {
                truncate_to: idx_len,
                err: Error::with_detail(ErrorKind::FileCorrupt, "segment below storage_log has a torn tail"),
            });
        }
        if idx_len > 0 {
            write_u64(index_file, idx_len, 0).map_err(|e| Torn { truncate_to: idx_len, err: e })?;
        }
        closed = true;
        last = Position::new(log, (idx_len / 8) as u32);
    }

    Ok(ResyncResult { last, closed })
}

fn flush(index_file: &File, base: u64, batch: &[u8]) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    index_file
        .write_all_at(batch, base)
        .map_err(|e| Error::from_io(ErrorKind::IndexWrite, e))
}

fn read_u64(file: &File, offset: u64) -> Result<u64> {
    let mut buf = [0u8; 8];
    file.read_exact_at(&mut buf, offset)
        .map_err(|e| Error::from_io(ErrorKind::IndexRead, e))?;
    Ok(u64::from_le_bytes(buf))
}

fn write_u64(file: &File, offset: u64, value: u64) -> Result<()> {
    file.write_all_at(&value.to_le_bytes(), offset)
        .map_err(|e| Error::from_io(ErrorKind::IndexWrite, e))
}

fn read_header(file: &File, offset: u64) -> Result<RecordHeader> {
    let mut buf = [0u8; HEADER_SIZE];
    file.read_exact_at(&mut buf, offset)
        .map_err(|e| Error::from_io(ErrorKind::FileRead, e))?;
    Ok(RecordHeader::from_bytes(&buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::DEFAULT_HDR_MAGIC;
    use tempfile::tempdir;

    fn write_record(store: &mut SegmentStore, log: LogId, payload: &[u8]) -> u64 {
        let off;
        {
            let file = store.writer_handle(log, 0o640).expect("writer");
            off = file::file_size(file).expect("size");
            let header = RecordHeader::new(DEFAULT_HDR_MAGIC, 0, 0, payload.len() as u32);
            file::pwrite_all(file, off, &header.to_bytes()).expect("write header");
            file::pwrite_all(file, off + HEADER_SIZE as u64, payload).expect("write payload");
        }
        off
    }

    #[test]
    fn resync_open_segment_indexes_all_records() {
        let dir = tempdir().expect("tempdir");
        let mut store = SegmentStore::new(dir.path());
        write_record(&mut store, 0, b"a");
        write_record(&mut store, 0, b"bb");
        write_record(&mut store, 0, b"ccc");

        let result = resync_index(&mut store, 0, DEFAULT_HDR_MAGIC, 0).expect("resync");
        assert_eq!(result.last, Position::new(0, 3));
        assert!(!result.closed);
    }

    #[test]
    fn resync_closed_segment_appends_sentinel() {
        let dir = tempdir().expect("tempdir");
        let mut store = SegmentStore::new(dir.path());
        write_record(&mut store, 0, b"a");
        write_record(&mut store, 0, b"bb");

        let result = resync_index(&mut store, 0, DEFAULT_HDR_MAGIC, 1).expect("resync");
        assert_eq!(result.last, Position::new(0, 2));
        assert!(result.closed);

        store.invalidate_index();
        let reopened = resync_index(&mut store, 0, DEFAULT_HDR_MAGIC, 1).expect("resync again");
        assert_eq!(reopened.last, Position::new(0, 2));
        assert!(reopened.closed);
    }

    #[test]
    fn resync_empty_closed_segment_has_no_sentinel() {
        let dir = tempdir().expect("tempdir");
        let mut store = SegmentStore::new(dir.path());
        store.writer_handle(0, 0o640).expect("create empty segment");

        let result = resync_index(&mut store, 0, DEFAULT_HDR_MAGIC, 1).expect("resync");
        assert_eq!(result.last, Position::new(0, 0));
        assert!(result.closed);
        let index_file = store.index_handle(0).expect("index");
        assert_eq!(file::file_size(index_file).expect("size"), 0);
    }

    #[test]
    fn resync_stops_cleanly_at_torn_tail() {
        let dir = tempdir().expect("tempdir");
        let mut store = SegmentStore::new(dir.path());
        write_record(&mut store, 0, b"a");
        {
            let file = store.writer_handle(0, 0o640).expect("writer");
            let off = file::file_size(file).expect("size");
            let header = RecordHeader::new(DEFAULT_HDR_MAGIC, 0, 0, 10);
            file::pwrite_all(file, off, &header.to_bytes()).expect("write header");
            file::pwrite_all(file, off + HEADER_SIZE as u64, b"short").expect("write partial payload");
        }

        let result = resync_index(&mut store, 0, DEFAULT_HDR_MAGIC, 0).expect("resync");
        assert_eq!(result.last, Position::new(0, 1));
        assert!(!result.closed);
    }

    #[test]
    fn resync_surfaces_index_corrupt_on_bad_magic_and_repair_datafile_heals_it() {
        let dir = tempdir().expect("tempdir");
        let mut store = SegmentStore::new(dir.path());
        write_record(&mut store, 0, b"a");
        let bad_off = write_record(&mut store, 0, b"bb");

        // Pre-seed the index with an entry for the first record, then corrupt
        // the second record's header magic so the scan hits a mismatch, not a
        // torn tail.
        {
            let index_file = store.index_handle(0).expect("index");
            file::pwrite_all(index_file, 0, &0u64.to_le_bytes()).expect("seed index");
        }
        {
            let file = store.writer_handle(0, 0o640).expect("writer");
            file::pwrite_all(file, bad_off, &0xdeadbeefu32.to_le_bytes()).expect("corrupt magic");
        }

        // A bad magic restarts the scan once, finds the same mismatch again,
        // and surfaces IndexCorrupt: truncating the index doesn't touch the
        // corrupt data byte, so this is not self-healing. Salvaging the
        // corrupted record is repair_datafile's job.
        let err = resync_index(&mut store, 0, DEFAULT_HDR_MAGIC, 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IndexCorrupt);

        let removed = crate::repair::repair_datafile(&mut store, dir.path(), 0, DEFAULT_HDR_MAGIC).expect("repair");
        assert_eq!(removed, 1);

        store.invalidate_all(0);
        let result = resync_index(&mut store, 0, DEFAULT_HDR_MAGIC, 0).expect("resync after repair");
        assert_eq!(result.last, Position::new(0, 1));
        assert!(!result.closed);
    }
}
