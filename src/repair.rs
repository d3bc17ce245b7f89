//! Repair (spec.md §4.8, §4.10): datafile salvage for a single corrupt
//! segment, and the directory-wide rebuild/nuke orchestrator.

use std::fs::{self, File};
use std::path::Path;

use crate::config::{Safety, DEFAULT_UNIT_LIMIT};
use crate::error::{Error, ErrorKind, Result};
use crate::file::{self, LockGuard};
use crate::header::{RecordHeader, DEFAULT_HDR_MAGIC, HEADER_SIZE};
use crate::ids::{metastore_path, segment_path, LogId, Position, CHECKPOINT_PREFIX};
use crate::metastore::{Metastore, METASTORE_SIZE};
use crate::segment::SegmentStore;

const COPY_CHUNK: usize = 4096;

/// Salvage a corrupt segment by locating runs of valid headers and sliding
/// the surviving bytes left over each hole. Returns the number of holes
/// removed.
pub fn repair_datafile(store: &mut SegmentStore, dir: &Path, log: LogId, hdr_magic: u32) -> Result<usize> {
    store.invalidate_all(log);
    let path = segment_path(dir, log);
    let file = file::open_read_write(&path)?;
    let _lock = LockGuard::acquire(&file)?;
    let data_len = file::file_size(&file)?;

    let holes = scan_for_holes(&file, data_len, hdr_magic)?;
    if holes.is_empty() {
        return Ok(0);
    }

    let mut read_pos = 0u64;
    let mut write_pos = 0u64;
    for &(start, end) in &holes {
        copy_range(&file, read_pos, write_pos, start - read_pos)?;
        write_pos += start - read_pos;
        log::warn!("repair_datafile: coalescing hole [{start}, {end}) in segment {log:08x}");
        read_pos = end;
    }
    copy_range(&file, read_pos, write_pos, data_len - read_pos)?;
    write_pos += data_len - read_pos;

    file::set_len(&file, write_pos)?;
    file::sync(&file, true)?;
    Ok(holes.len())
}

/// Forward scan classifying the data file into valid records and invalid
/// byte ranges. A byte range is invalid once a header fails to validate;
/// recovery resumes at the next position where two consecutive headers both
/// validate (or, failing that, at end of file).
fn scan_for_holes(file: &File, data_len: u64, hdr_magic: u32) -> Result<Vec<(u64, u64)>> {
    let mut holes = Vec::new();
    let mut offset = 0u64;

    while offset + HEADER_SIZE as u64 <= data_len {
        match read_header(file, offset) {
            Ok(header) if header.magic == hdr_magic && offset + header.record_len() <= data_len => {
                offset += header.record_len();
            }
            _ => {
                let bad_start = offset;
                let anchor = find_anchor(file, offset + 1, data_len, hdr_magic);
                match anchor {
                    Some(p) => {
                        holes.push((bad_start, p));
                        offset = p;
                    }
                    None => {
                        holes.push((bad_start, data_len));
                        offset = data_len;
                    }
                }
            }
        }
    }
    Ok(holes)
}

/// Byte-scan forward from `from` for a position whose header validates and
/// whose next record's header also validates (or which reaches cleanly to
/// EOF), treating that as a trustworthy resync point.
fn find_anchor(file: &File, from: u64, data_len: u64, hdr_magic: u32) -> Option<u64> {
    let mut p = from;
    while p + HEADER_SIZE as u64 <= data_len {
        if let Ok(h1) = read_header(file, p) {
            if h1.magic == hdr_magic {
                let next = p + h1.record_len();
                if next == data_len {
                    return Some(p);
                }
                if next < data_len {
                    if let Ok(h2) = read_header(file, next) {
                        if h2.magic == hdr_magic {
                            return Some(p);
                        }
                    }
                }
            }
        }
        p += 1;
    }
    None
}

fn read_header(file: &File, offset: u64) -> Result<RecordHeader> {
    let mut buf = [0u8; HEADER_SIZE];
    file::pread_exact(file, offset, &mut buf)?;
    Ok(RecordHeader::from_bytes(&buf))
}

fn copy_range(file: &File, mut src: u64, mut dst: u64, mut len: u64) -> Result<()> {
    if src == dst || len == 0 {
        return Ok(());
    }
    let mut buf = [0u8; COPY_CHUNK];
    while len > 0 {
        let chunk = len.min(COPY_CHUNK as u64) as usize;
        file::pread_exact(file, src, &mut buf[..chunk])?;
        file::pwrite_all(file, dst, &buf[..chunk])?;
        src += chunk as u64;
        dst += chunk as u64;
        len -= chunk as u64;
    }
    Ok(())
}

/// Directory-wide rebuild (or, if `aggressive`, destruction) orchestrator.
pub fn ctx_repair(dir: &Path, earliest: LogId, latest: LogId, aggressive: bool) -> Result<()> {
    rebuild_metastore(dir, latest)?;
    rebuild_first_checkpoint(dir, earliest)?;

    if !aggressive {
        return Ok(());
    }

    let mut victims = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::from_io(ErrorKind::Open, e))? {
        let entry = entry.map_err(|e| Error::from_io(ErrorKind::Open, e))?;
        victims.push(entry.path());
    }
    for victim in victims {
        let _ = fs::remove_file(&victim);
    }
    fs::remove_dir(dir).map_err(|e| Error::from_io(ErrorKind::NotADirectory, e))?;
    log::warn!("ctx_repair(aggressive) removed directory {}", dir.display());
    Ok(())
}

fn rebuild_metastore(dir: &Path, latest: LogId) -> Result<()> {
    let path = metastore_path(dir);
    let expected = Metastore {
        storage_log: latest,
        unit_limit: DEFAULT_UNIT_LIMIT,
        safety: Safety::AlmostSafe as u32,
        hdr_magic: DEFAULT_HDR_MAGIC,
    };

    let matches = file::open_read_only(&path).ok().is_some_and(|f| {
        file::file_size(&f).is_ok_and(|size| {
            if size != METASTORE_SIZE as u64 {
                return false;
            }
            let mut buf = [0u8; METASTORE_SIZE];
            file::pread_exact(&f, 0, &mut buf).is_ok() && Metastore::from_bytes(&buf) == expected
        })
    });

    if matches {
        return Ok(());
    }

    let _ = fs::remove_file(&path);
    let file = file::open_read_write_create(&path)?;
    file::set_len(&file, METASTORE_SIZE as u64)?;
    file::pwrite_all(&file, 0, &expected.to_bytes())?;
    file::sync(&file, true)?;
    log::warn!("ctx_repair rebuilt metastore at {}", path.display());
    Ok(())
}

fn rebuild_first_checkpoint(dir: &Path, earliest: LogId) -> Result<()> {
    let found = fs::read_dir(dir)
        .map_err(|e| Error::from_io(ErrorKind::Open, e))?
        .filter_map(|e| e.ok())
        .find(|e| e.file_name().to_string_lossy().starts_with(CHECKPOINT_PREFIX));

    let entry = match found {
        Some(entry) => entry,
        None => return Ok(()),
    };

    let path = entry.path();
    let expected = Position::new(earliest, 0);
    let file = file::open_read_write(&path)?;
    let matches = file::file_size(&file).is_ok_and(|size| {
        if size != 8 {
            return false;
        }
        let mut buf = [0u8; 8];
        file::pread_exact(&file, 0, &mut buf).is_ok() && Position::from_bytes(&buf) == expected
    });

    if matches {
        return Ok(());
    }

    file::set_len(&file, 8)?;
    file::pwrite_all(&file, 0, &expected.to_bytes())?;
    file::sync(&file, true)?;
    log::warn!("ctx_repair rebuilt checkpoint {}", path.display());
    Ok(())
}
