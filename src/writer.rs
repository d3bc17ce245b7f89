//! Writer path (spec.md §4.3) and atomic rotation (§4.4). One writer per
//! directory; no compare-and-swap is needed since there is never writer
//! contention, only the metastore lock guarding against a *prior* writer
//! process that crashed mid-rotation.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::JournalConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::file::{self, LockGuard};
use crate::header::{RecordHeader, HEADER_SIZE};
use crate::ids::{LogId, Marker, Position};
use crate::indexer::resync_index;
use crate::metastore::MetastoreManager;
use crate::segment::SegmentStore;

/// Open (or resume) the writer side: reload the metastore to pick up any
/// rotation a prior, now-dead process performed, then resync the current
/// segment's index far enough to learn how many records it already holds.
pub fn open_writer(
    store: &mut SegmentStore,
    meta: &mut MetastoreManager,
    config: &JournalConfig,
) -> Result<(LogId, Marker)> {
    let current_log = {
        let _lock = meta.lock()?;
        meta.get().storage_log
    };
    store.writer_handle(current_log, config.segment_mode)?;
    let result = resync_index(store, current_log, config.hdr_magic, current_log)?;
    Ok((current_log, result.last.marker))
}

/// Append `payload`, rotating first if the current segment is already at or
/// past the unit limit, and again afterward if this write pushed it over.
pub fn write_message(
    store: &mut SegmentStore,
    meta: &mut MetastoreManager,
    current_log: &mut LogId,
    current_marker: &mut Marker,
    config: &JournalConfig,
    payload: &[u8],
    timestamp: Option<(u32, u32)>,
) -> Result<Position> {
    loop {
        let log = *current_log;
        let mut written: Option<(u64, RecordHeader)> = None;
        {
            let file = store.writer_handle(log, config.segment_mode)?;
            let _lock = LockGuard::acquire(file)?;
            let off = file::file_size(file)?;
            if off < config.unit_limit as u64 {
                let (tv_sec, tv_usec) = timestamp.unwrap_or_else(wall_clock);
                let header = RecordHeader::new(config.hdr_magic, tv_sec, tv_usec, payload.len() as u32);
                file::pwrite_all(file, off, &header.to_bytes())?;
                file::pwrite_all(file, off + HEADER_SIZE as u64, payload)?;
                written = Some((off, header));
            }
        }

        match written {
            Some((off, header)) => {
                *current_marker += 1;
                let marker = *current_marker;
                let post = off + header.record_len();
                if post >= config.unit_limit as u64 {
                    *current_log = rotate(meta, log, store, config)?;
                    *current_marker = 0;
                }
                return Ok(Position::new(log, marker));
            }
            None => {
                *current_log = rotate(meta, log, store, config)?;
                *current_marker = 0;
            }
        }
    }
}

/// Atomic rotation under the metastore lock: the first process to notice
/// `storage_log == current_log` creates the next segment and advances
/// `storage_log`; any other process racing in just adopts the new value.
fn rotate(meta: &mut MetastoreManager, current_log: LogId, store: &mut SegmentStore, config: &JournalConfig) -> Result<LogId> {
    let _lock = meta.lock()?;
    let mut snapshot = meta.get();
    if snapshot.storage_log == current_log {
        let new_log = current_log
            .checked_add(1)
            .ok_or_else(|| Error::with_detail(ErrorKind::IllegalLogId, "log id space exhausted"))?;
        store.writer_handle(new_log, config.segment_mode)?;
        snapshot.storage_log = new_log;
        meta.save(snapshot)?;
        log::info!("rotated segment {current_log:08x} -> {new_log:08x}");
        Ok(new_log)
    } else {
        log::debug!("rotation already performed by another process, adopting {:08x}", snapshot.storage_log);
        Ok(snapshot.storage_log)
    }
}

fn wall_clock() -> (u32, u32) {
    let duration = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    (duration.as_secs() as u32, duration.subsec_micros())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::segment_path;
    use tempfile::tempdir;

    fn setup(dir: &std::path::Path, unit_limit: u32) -> (SegmentStore, MetastoreManager, JournalConfig) {
        let config = JournalConfig {
            unit_limit,
            ..JournalConfig::default()
        };
        let meta = MetastoreManager::open_or_create(dir, &config).expect("metastore");
        (SegmentStore::new(dir), meta, config)
    }

    #[test]
    fn write_message_returns_increasing_markers() {
        let dir = tempdir().expect("tempdir");
        let (mut store, mut meta, config) = setup(dir.path(), 1024);
        let (mut log, mut marker) = open_writer(&mut store, &mut meta, &config).expect("open");

        let p1 = write_message(&mut store, &mut meta, &mut log, &mut marker, &config, b"a", None).expect("write");
        let p2 = write_message(&mut store, &mut meta, &mut log, &mut marker, &config, b"bb", None).expect("write");

        assert_eq!(p1, Position::new(0, 1));
        assert_eq!(p2, Position::new(0, 2));
    }

    #[test]
    fn write_message_rotates_on_unit_limit() {
        let dir = tempdir().expect("tempdir");
        // Small enough that a single 8-byte payload overflows it.
        let (mut store, mut meta, config) = setup(dir.path(), 20);
        let (mut log, mut marker) = open_writer(&mut store, &mut meta, &config).expect("open");

        for _ in 0..3 {
            write_message(&mut store, &mut meta, &mut log, &mut marker, &config, b"12345678", None).expect("write");
        }

        assert!(log >= 1);
        assert!(segment_path(dir.path(), 1).exists());
    }

    #[test]
    fn open_writer_resumes_marker_count_from_index() {
        let dir = tempdir().expect("tempdir");
        let (mut store, mut meta, config) = setup(dir.path(), 1024);
        {
            let (mut log, mut marker) = open_writer(&mut store, &mut meta, &config).expect("open");
            write_message(&mut store, &mut meta, &mut log, &mut marker, &config, b"a", None).expect("write");
            write_message(&mut store, &mut meta, &mut log, &mut marker, &config, b"bb", None).expect("write");
        }

        let mut store2 = SegmentStore::new(dir.path());
        let (log, marker) = open_writer(&mut store2, &mut meta, &config).expect("reopen");
        assert_eq!(log, 0);
        assert_eq!(marker, 2);
    }
}
