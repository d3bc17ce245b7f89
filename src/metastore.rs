//! Metastore manager (spec.md §4.1): the 16-byte `storage_log`/`unit_limit`/
//! `safety`/`hdr_magic` struct every directory carries, mapped read-write and
//! shared across every process that opens the directory.

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::config::{JournalConfig, Safety};
use crate::error::{Error, ErrorKind, Result};
use crate::file::{self, LockGuard, ReadWriteMap};
use crate::ids::{metastore_path, LogId};

pub const METASTORE_SIZE: usize = 16;
const LEGACY_METASTORE_SIZE: u64 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metastore {
    pub storage_log: LogId,
    pub unit_limit: u32,
    pub safety: u32,
    pub hdr_magic: u32,
}

impl Metastore {
    pub fn to_bytes(self) -> [u8; METASTORE_SIZE] {
        let mut buf = [0u8; METASTORE_SIZE];
        buf[0..4].copy_from_slice(&self.storage_log.to_le_bytes());
        buf[4..8].copy_from_slice(&self.unit_limit.to_le_bytes());
        buf[8..12].copy_from_slice(&self.safety.to_le_bytes());
        buf[12..16].copy_from_slice(&self.hdr_magic.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8; METASTORE_SIZE]) -> Self {
        Self {
            storage_log: u32::from_le_bytes(bytes[0..4].try_into().expect("slice length")),
            unit_limit: u32::from_le_bytes(bytes[4..8].try_into().expect("slice length")),
            safety: u32::from_le_bytes(bytes[8..12].try_into().expect("slice length")),
            hdr_magic: u32::from_le_bytes(bytes[12..16].try_into().expect("slice length")),
        }
    }

    pub fn is_safe(&self) -> bool {
        Safety::from_u32(self.safety).map(Safety::is_safe).unwrap_or(false)
    }
}

/// Opens or creates `<dir>/metastore`, kept mapped read-write for the
/// lifetime of this handle.
pub struct MetastoreManager {
    #[allow(dead_code)]
    path: PathBuf,
    file: File,
    map: ReadWriteMap,
}

impl MetastoreManager {
    pub fn open_or_create(dir: &Path, defaults: &JournalConfig) -> Result<Self> {
        let path = metastore_path(dir);
        let existed = path.exists();
        let file = file::open_read_write_create(&path)?;

        if !existed {
            let meta = Metastore {
                storage_log: 0,
                unit_limit: defaults.unit_limit,
                safety: defaults.safety as u32,
                hdr_magic: defaults.hdr_magic,
            };
            file::set_len(&file, METASTORE_SIZE as u64)?;
            file::pwrite_all(&file, 0, &meta.to_bytes())?;
            file::sync(&file, true)?;
            log::info!("created metastore at {}", path.display());
        } else {
            let size = file::file_size(&file)?;
            if size == LEGACY_METASTORE_SIZE {
                log::info!("upgrading legacy 12-byte metastore at {}", path.display());
                // Growing the file zero-fills the new tail: exactly "append a
                // u32 zero" without disturbing the three fields already there.
                file::set_len(&file, METASTORE_SIZE as u64)?;
                file::sync(&file, true)?;
            } else if size != METASTORE_SIZE as u64 {
                return Err(Error::with_detail(
                    ErrorKind::MetaOpen,
                    format!("metastore has unexpected size {size}"),
                ));
            }
        }

        let map = ReadWriteMap::map(&file)?;
        Ok(Self { path, file, map })
    }

    /// Metastore lock: guards any reload/save and is held for the duration
    /// of rotation (spec.md §5). Ties up the fd, not a borrow of `self`, so
    /// callers can still reach `save`'s `&mut self` while holding it.
    pub fn lock(&self) -> Result<LockGuard> {
        LockGuard::acquire(&self.file)
    }

    /// Current contents as last observed in the shared mapping. Callers
    /// typically call this right after acquiring the lock to "reload", since
    /// another process may have rotated since our last read.
    pub fn get(&self) -> Metastore {
        let mut bytes = [0u8; METASTORE_SIZE];
        bytes.copy_from_slice(&self.map.as_slice()[0..METASTORE_SIZE]);
        Metastore::from_bytes(&bytes)
    }

    /// Persist `meta` under an already-held lock: `msync` with `MS_SYNC` when
    /// safe, `MS_ASYNC` (schedule only) otherwise.
    pub fn save(&mut self, meta: Metastore) -> Result<()> {
        self.map.as_mut_slice()[0..METASTORE_SIZE].copy_from_slice(&meta.to_bytes());
        self.map.msync(meta.is_safe())
    }
}
