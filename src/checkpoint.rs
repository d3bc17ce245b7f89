//! Checkpoint & subscriber manager (spec.md §4.9): subscriber lifecycle,
//! durable position tracking, and the retention sweep that rides along with
//! every checkpoint advance.

use std::fs;
use std::path::Path;

use crate::config::Whence;
use crate::error::{Error, ErrorKind, Result};
use crate::file::{self, LockGuard};
use crate::ids::{
    checkpoint_path, decode_subscriber_name, index_path, parse_log_id, segment_path, LogId, Position,
    CHECKPOINT_PREFIX,
};
use crate::indexer::resync_index;
use crate::segment::SegmentStore;

/// Minimum parseable 8-hex-digit segment name in the directory, or 0 if the
/// directory holds no segments yet.
pub fn first_log_id(dir: &Path) -> Result<LogId> {
    let mut min = None;
    for entry in fs::read_dir(dir).map_err(|e| Error::from_io(ErrorKind::Open, e))? {
        let entry = entry.map_err(|e| Error::from_io(ErrorKind::Open, e))?;
        let name = entry.file_name();
        if let Some(id) = name.to_str().and_then(parse_log_id) {
            min = Some(min.map_or(id, |m: LogId| m.min(id)));
        }
    }
    Ok(min.unwrap_or(0))
}

/// Highest 8-hex-digit segment name present, or 0 if none.
pub fn last_log_id(dir: &Path) -> Result<LogId> {
    let mut max = None;
    for entry in fs::read_dir(dir).map_err(|e| Error::from_io(ErrorKind::Open, e))? {
        let entry = entry.map_err(|e| Error::from_io(ErrorKind::Open, e))?;
        let name = entry.file_name();
        if let Some(id) = name.to_str().and_then(parse_log_id) {
            max = Some(max.map_or(id, |m: LogId| m.max(id)));
        }
    }
    Ok(max.unwrap_or(0))
}

/// Create `cp.<hex>` exclusively and seed it per `whence`.
pub fn add_subscriber(
    store: &mut SegmentStore,
    dir: &Path,
    name: &str,
    whence: Whence,
    hdr_magic: u32,
    storage_log: LogId,
    safe: bool,
) -> Result<()> {
    let path = checkpoint_path(dir, name);
    let file = file::open_create_exclusive(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::AlreadyExists {
            Error::new(ErrorKind::SubscriberExists)
        } else {
            Error::from_io(ErrorKind::Checkpoint, e)
        }
    })?;

    let position = match whence {
        Whence::Begin => Position::new(first_log_id(dir)?, 0),
        Whence::End => {
            // The log's true tail always lives in the current writer
            // segment: resyncing it directly is equivalent to, and cheaper
            // than, walking every unconsumed segment via a throwaway reader.
            let result = resync_index(store, storage_log, hdr_magic, storage_log)?;
            result.last
        }
    };

    file::pwrite_all(&file, 0, &position.to_bytes())?;
    if safe {
        file::sync(&file, true)?;
    }
    log::debug!("subscriber {name} added at {position:?}");
    Ok(())
}

pub fn remove_subscriber(dir: &Path, name: &str) -> Result<()> {
    let path = checkpoint_path(dir, name);
    match fs::remove_file(&path) {
        Ok(()) => {
            log::debug!("subscriber {name} removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::new(ErrorKind::InvalidSubscriber)),
        Err(e) => Err(Error::from_io(ErrorKind::Checkpoint, e)),
    }
}

pub fn list_subscribers(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::from_io(ErrorKind::Open, e))? {
        let entry = entry.map_err(|e| Error::from_io(ErrorKind::Open, e))?;
        let name = entry.file_name();
        if let Some(encoded) = name.to_str().and_then(|n| n.strip_prefix(CHECKPOINT_PREFIX)) {
            if let Some(decoded) = decode_subscriber_name(encoded) {
                names.push(decoded);
            }
        }
    }
    Ok(names)
}

pub fn read_checkpoint(dir: &Path, name: &str) -> Result<Position> {
    let path = checkpoint_path(dir, name);
    let file = file::open_read_only(&path).map_err(|e| {
        if e.errno() == Some(libc::ENOENT) {
            Error::new(ErrorKind::InvalidSubscriber)
        } else {
            e
        }
    })?;
    let mut buf = [0u8; 8];
    file::pread_exact(&file, 0, &mut buf)?;
    Ok(Position::from_bytes(&buf))
}

/// Read-modify-write a subscriber's checkpoint under lock, then run
/// retention for every segment the advance passed over.
pub fn set_checkpoint(store: &mut SegmentStore, dir: &Path, name: &str, new_id: Position, safe: bool) -> Result<()> {
    let path = checkpoint_path(dir, name);
    let file = file::open_read_write(&path).map_err(|e| {
        if e.errno() == Some(libc::ENOENT) {
            Error::new(ErrorKind::InvalidSubscriber)
        } else {
            e
        }
    })?;
    let old = {
        let _lock = LockGuard::acquire(&file)?;
        let size = file::file_size(&file)?;
        let old = if size < 8 {
            Position::new(new_id.log, 0)
        } else {
            let mut buf = [0u8; 8];
            file::pread_exact(&file, 0, &mut buf)?;
            Position::from_bytes(&buf)
        };
        file::pwrite_all(&file, 0, &new_id.to_bytes())?;
        if safe {
            file::sync(&file, true)?;
        }
        old
    };

    for log in old.log..new_id.log {
        let (count, _earliest) = pending_readers(dir, log)?;
        if count == 0 {
            store.invalidate_all(log);
            let _ = fs::remove_file(segment_path(dir, log));
            let _ = fs::remove_file(index_path(dir, log));
            log::info!("retention removed segment {log:08x}");
        }
    }
    Ok(())
}

/// Count subscribers whose checkpoint has not yet passed `log`, and the
/// lowest checkpoint log id observed across all subscribers.
pub fn pending_readers(dir: &Path, log: LogId) -> Result<(u32, LogId)> {
    let mut count = 0u32;
    let mut earliest = LogId::MAX;
    for entry in fs::read_dir(dir).map_err(|e| Error::from_io(ErrorKind::Open, e))? {
        let entry = entry.map_err(|e| Error::from_io(ErrorKind::Open, e))?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(n) => n,
            None => continue,
        };
        if !name.starts_with(CHECKPOINT_PREFIX) {
            continue;
        }
        let file = match file::open_read_only(&entry.path()) {
            Ok(f) => f,
            Err(_) => continue,
        };
        let _lock = LockGuard::acquire(&file)?;
        let size = file::file_size(&file)?;
        if size < 8 {
            continue;
        }
        let mut buf = [0u8; 8];
        file::pread_exact(&file, 0, &mut buf)?;
        let pos = Position::from_bytes(&buf);
        if pos.log <= log {
            count += 1;
        }
        earliest = earliest.min(pos.log);
    }
    Ok((count, earliest))
}
