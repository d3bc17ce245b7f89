//! The `Journal` context (spec.md §6): ties the metastore, segment store,
//! writer/reader/indexer/checkpoint/repair modules together behind the
//! {NEW, INIT, APPEND, READ, INVALID} mode state machine.

use std::fs;
use std::path::{Path, PathBuf};

use std::os::unix::fs::DirBuilderExt;

use crate::checkpoint;
use crate::config::{JournalConfig, Safety, Whence};
use crate::error::{Error, ErrorKind, Result};
use crate::ids::{parse_log_id, LogId, Marker, Position};
use crate::indexer::resync_index;
use crate::metastore::MetastoreManager;
use crate::reader::{self, RecordView};
use crate::repair;
use crate::segment::SegmentStore;
use crate::writer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    New,
    Init,
    Append,
    Read,
}

pub struct Journal {
    dir: PathBuf,
    mode: Mode,
    config: JournalConfig,
    meta: Option<MetastoreManager>,
    store: SegmentStore,
    current_log: LogId,
    current_marker: Marker,
    subscriber: Option<String>,
    last_error: Option<Error>,
}

impl Journal {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let dir = path.as_ref().to_path_buf();
        Self {
            store: SegmentStore::new(&dir),
            dir,
            mode: Mode::New,
            config: JournalConfig::default(),
            meta: None,
            current_log: 0,
            current_marker: 0,
            subscriber: None,
            last_error: None,
        }
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(ref e) = result {
            self.last_error = Some(e.snapshot());
        }
        result
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// Create the directory if absent and open (or create) its metastore.
    /// Re-initializing an already-initialized directory keeps the on-disk
    /// metastore authoritative and just logs that the passed config was
    /// ignored, per SPEC_FULL.md §4.11.
    pub fn init(&mut self, config: JournalConfig) -> Result<()> {
        if self.mode != Mode::New {
            return self.track(Err(Error::new(ErrorKind::IllegalInit)));
        }

        let result = (|| -> Result<()> {
            if self.dir.exists() && !self.dir.is_dir() {
                return Err(Error::new(ErrorKind::NotADirectory));
            }
            if self.dir.as_os_str().len() as i64 > libc::PATH_MAX as i64 {
                return Err(Error::new(ErrorKind::PathTooLong));
            }
            if !self.dir.exists() {
                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(config.dir_mode)
                    .create(&self.dir)
                    .map_err(|e| Error::from_io(ErrorKind::Mkdir, e))?;
            }

            let already_initialized = crate::ids::metastore_path(&self.dir).exists();
            let mgr = MetastoreManager::open_or_create(&self.dir, &config)?;
            if already_initialized {
                log::debug!("{} already initialized, ignoring passed-in config", self.dir.display());
            }

            let snapshot = mgr.get();
            self.config = JournalConfig {
                unit_limit: snapshot.unit_limit,
                safety: Safety::from_u32(snapshot.safety).unwrap_or(config.safety),
                hdr_magic: snapshot.hdr_magic,
                segment_mode: config.segment_mode,
                dir_mode: config.dir_mode,
            };
            self.meta = Some(mgr);
            Ok(())
        })();

        if result.is_ok() {
            self.mode = Mode::Init;
        }
        self.track(result)
    }

    pub fn open_writer(&mut self) -> Result<()> {
        if self.mode != Mode::Init {
            return self.track(Err(Error::new(ErrorKind::IllegalOpen)));
        }
        let result = (|| -> Result<()> {
            let meta = self.meta.as_mut().expect("Init mode implies metastore is open");
            let (log, marker) = writer::open_writer(&mut self.store, meta, &self.config)?;
            self.current_log = log;
            self.current_marker = marker;
            Ok(())
        })();
        if result.is_ok() {
            self.mode = Mode::Append;
        }
        self.track(result)
    }

    pub fn open_reader(&mut self, subscriber: &str) -> Result<()> {
        if self.mode != Mode::Init {
            return self.track(Err(Error::new(ErrorKind::IllegalOpen)));
        }
        let result = (|| -> Result<()> {
            checkpoint::read_checkpoint(&self.dir, subscriber)?;
            self.subscriber = Some(subscriber.to_string());
            Ok(())
        })();
        if result.is_ok() {
            self.mode = Mode::Read;
        }
        self.track(result)
    }

    pub fn write(&mut self, payload: &[u8]) -> Result<Position> {
        self.write_message(payload, None)
    }

    pub fn write_message(&mut self, payload: &[u8], timestamp: Option<(u32, u32)>) -> Result<Position> {
        if self.mode != Mode::Append {
            return self.track(Err(Error::new(ErrorKind::IllegalWrite)));
        }
        let result = {
            let meta = self.meta.as_mut().expect("Append mode implies metastore is open");
            writer::write_message(
                &mut self.store,
                meta,
                &mut self.current_log,
                &mut self.current_marker,
                &self.config,
                payload,
                timestamp,
            )
        };
        self.track(result)
    }

    pub fn read_interval(&mut self, start: &mut Position, finish: &mut Position) -> Result<i64> {
        if self.mode != Mode::Read {
            return self.track(Err(Error::new(ErrorKind::IllegalCheckpoint)));
        }
        let subscriber = self.subscriber.clone().expect("Read mode implies a bound subscriber");
        let result = (|| -> Result<i64> {
            let storage_log = self.meta.as_ref().expect("Read mode implies metastore is open").get().storage_log;
            let hdr_magic = self.config.hdr_magic;
            let safe = self.config.safety.is_safe();
            let cp = checkpoint::read_checkpoint(&self.dir, &subscriber)?;
            reader::read_interval(&mut self.store, &self.dir, &subscriber, cp, start, finish, hdr_magic, storage_log, safe)
        })();
        self.track(result)
    }

    /// Read a single record, escalating to full datafile repair (spec.md
    /// §4.5's outer retry) when the inner resync-and-retry-once still finds
    /// the index corrupt and the segment in question is not the one the
    /// writer is actively appending to.
    pub fn read_message(&mut self, id: Position) -> Result<RecordView<'_>> {
        if self.mode != Mode::Read {
            return self.track(Err(Error::new(ErrorKind::IllegalCheckpoint)));
        }
        let storage_log = self.meta.as_ref().expect("Read mode implies metastore is open").get().storage_log;
        let hdr_magic = self.config.hdr_magic;

        // `RecordView<'_>` borrows `self.store` for as long as the elided
        // lifetime ties it to this call, so the borrow checker can't let a
        // retry loop both hold that borrow across an iteration and take a
        // fresh `&mut self.store` for repair in the same loop. Drive the
        // retry/repair decision with only owned data (an `Error`'s retry
        // classification) in this loop, then do the single borrow-returning
        // read once outside it; repeating the final read is side-effect
        // free (resync/repair already converged the state).
        const OUTER_ATTEMPTS: u32 = 4;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let retry = match reader::read_message(&mut self.store, id.log, id.marker, hdr_magic, storage_log) {
                Ok(_) => false,
                Err(e) => {
                    let retryable = matches!(e.kind, ErrorKind::IndexCorrupt | ErrorKind::FileCorrupt);
                    retryable && attempt < OUTER_ATTEMPTS && id.log != storage_log
                }
            };
            if !retry {
                break;
            }
            log::warn!("read_message retrying segment {:08x} after repair (attempt {attempt})", id.log);
            let _ = repair::repair_datafile(&mut self.store, &self.dir, id.log, hdr_magic);
            let _ = fs::remove_file(crate::ids::index_path(&self.dir, id.log));
            self.store.invalidate_all(id.log);
        }

        let outcome = reader::read_message(&mut self.store, id.log, id.marker, hdr_magic, storage_log);
        if let Err(ref e) = outcome {
            self.last_error = Some(e.snapshot());
        }
        outcome
    }

    pub fn read_checkpoint(&self, subscriber: &str) -> Result<Position> {
        checkpoint::read_checkpoint(&self.dir, subscriber)
    }

    pub fn advance_id(&mut self, subscriber: &str, id: Position) -> Result<()> {
        if self.meta.is_none() {
            return self.track(Err(Error::new(ErrorKind::IllegalCheckpoint)));
        }
        let safe = self.config.safety.is_safe();
        let result = checkpoint::set_checkpoint(&mut self.store, &self.dir, subscriber, id, safe);
        self.track(result)
    }

    pub fn add_subscriber(&mut self, subscriber: &str, whence: Whence) -> Result<()> {
        if self.meta.is_none() {
            return self.track(Err(Error::new(ErrorKind::IllegalCheckpoint)));
        }
        let storage_log = self.meta.as_ref().expect("checked above").get().storage_log;
        let hdr_magic = self.config.hdr_magic;
        let safe = self.config.safety.is_safe();
        let result = checkpoint::add_subscriber(&mut self.store, &self.dir, subscriber, whence, hdr_magic, storage_log, safe);
        self.track(result)
    }

    pub fn remove_subscriber(&mut self, subscriber: &str) -> Result<()> {
        let result = checkpoint::remove_subscriber(&self.dir, subscriber);
        self.track(result)
    }

    pub fn list_subscribers(&self) -> Result<Vec<String>> {
        checkpoint::list_subscribers(&self.dir)
    }

    pub fn first_log_id(&self) -> Result<LogId> {
        checkpoint::first_log_id(&self.dir)
    }

    pub fn last_log_id(&self) -> Result<LogId> {
        checkpoint::last_log_id(&self.dir)
    }

    pub fn raw_size(&self) -> Result<u64> {
        let mut total = 0u64;
        for entry in fs::read_dir(&self.dir).map_err(|e| Error::from_io(ErrorKind::Open, e))? {
            let entry = entry.map_err(|e| Error::from_io(ErrorKind::Open, e))?;
            if parse_log_id(&entry.file_name().to_string_lossy()).is_some() {
                if let Ok(metadata) = entry.metadata() {
                    total += metadata.len();
                }
            }
        }
        Ok(total)
    }

    /// Run the retention sweep against every subscriber's current
    /// checkpoint without waiting for the next `advance_id` to trigger it —
    /// useful after a crash left stale segments nobody will advance past.
    pub fn clean(&mut self) -> Result<()> {
        let storage_log = self.meta.as_ref().map(|m| m.get().storage_log).unwrap_or(0);
        let first = checkpoint::first_log_id(&self.dir).unwrap_or(0);
        let result = (|| -> Result<()> {
            for log in first..storage_log {
                let (count, _) = checkpoint::pending_readers(&self.dir, log)?;
                if count == 0 {
                    self.store.invalidate_all(log);
                    let _ = fs::remove_file(crate::ids::segment_path(&self.dir, log));
                    let _ = fs::remove_file(crate::ids::index_path(&self.dir, log));
                }
            }
            Ok(())
        })();
        self.track(result)
    }

    pub fn repair(&mut self, aggressive: bool) -> Result<()> {
        let earliest = self.first_log_id().unwrap_or(0);
        let latest = self.last_log_id().unwrap_or(0);
        let result = repair::ctx_repair(&self.dir, earliest, latest, aggressive);
        if result.is_ok() && aggressive {
            self.close();
        }
        self.track(result)
    }

    pub fn repair_segment(&mut self, log: LogId) -> Result<usize> {
        let hdr_magic = self.config.hdr_magic;
        let result = repair::repair_datafile(&mut self.store, &self.dir, log, hdr_magic);
        self.track(result)
    }

    pub fn close(&mut self) {
        self.meta = None;
        self.store = SegmentStore::new(&self.dir);
        self.subscriber = None;
        self.mode = Mode::New;
        self.current_log = 0;
        self.current_marker = 0;
    }

    pub fn alter_safety(&mut self, safety: Safety) -> Result<()> {
        self.config.safety = safety;
        let result = self.persist_config_if_open(|m| m.safety = safety as u32);
        self.track(result)
    }

    pub fn alter_journal_size(&mut self, unit_limit: u32) -> Result<()> {
        self.config.unit_limit = unit_limit;
        let result = self.persist_config_if_open(|m| m.unit_limit = unit_limit);
        self.track(result)
    }

    pub fn alter_mode(&mut self, segment_mode: u32, dir_mode: u32) -> Result<()> {
        self.config.segment_mode = segment_mode;
        self.config.dir_mode = dir_mode;
        Ok(())
    }

    fn persist_config_if_open(&mut self, mutate: impl FnOnce(&mut crate::metastore::Metastore)) -> Result<()> {
        match self.meta.as_mut() {
            Some(meta) => {
                let _lock = meta.lock()?;
                let mut snapshot = meta.get();
                mutate(&mut snapshot);
                meta.save(snapshot)
            }
            None => Ok(()),
        }
    }

    /// Resync `log`'s index without waiting for a reader to drive it —
    /// mainly useful for tests and inspection tooling.
    pub fn resync(&mut self, log: LogId) -> Result<()> {
        let hdr_magic = self.config.hdr_magic;
        let storage_log = self.meta.as_ref().map(|m| m.get().storage_log).unwrap_or(log);
        let result = resync_index(&mut self.store, log, hdr_magic, storage_log).map(|_| ());
        self.track(result)
    }
}
