use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{apply_update, ChangeCallback, LedgerStore, Modify, Subscribers, SubscriptionId};
use crate::error::{CoordError, Result};

/// Wait between attempts to take a held lock file.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(1);
/// Attempts before a write gives up on a held lock file.
const LOCK_ATTEMPTS_MAX: u32 = 10_000;
/// A lock file older than this belongs to a writer that died mid-write.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// Ledger persisted as one JSON object in a file.
///
/// Every instance on the same path, in this process or another, serializes
/// its read-modify-writes through a sidecar `<path>.lock` file created with
/// `create_new`. The new contents land in a temporary file in the same
/// directory that replaces the ledger by rename, so readers never see a
/// partial write and need no lock.
#[derive(Debug)]
pub struct JsonFileLedger {
    path: PathBuf,
    lock_path: PathBuf,
    /// Keeps threads sharing one instance off the lock file
    writer: Mutex<()>,
    subscribers: Subscribers,
}

type Entries = BTreeMap<String, Value>;

impl JsonFileLedger {
    /// Open a ledger at `path`. A missing file is an empty ledger.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut lock_path = OsString::from(path.as_os_str());
        lock_path.push(".lock");
        let ledger = Self {
            path,
            lock_path: PathBuf::from(lock_path),
            writer: Mutex::new(()),
            subscribers: Subscribers::default(),
        };
        ledger.load()?;
        Ok(ledger)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    fn storage_error(&self, path: &Path, source: std::io::Error) -> CoordError {
        CoordError::Storage {
            path: path.to_path_buf(),
            source,
        }
    }

    fn load(&self) -> Result<Entries> {
        match fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(Entries::new()),
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| CoordError::Malformed {
                key: self.path.display().to_string(),
                source,
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Entries::new()),
            Err(err) => Err(self.storage_error(&self.path, err)),
        }
    }

    fn store(&self, entries: &Entries) -> Result<()> {
        let raw = serde_json::to_string_pretty(entries)?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir).map_err(|err| self.storage_error(dir, err))?;
        tmp.write_all(raw.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|err| self.storage_error(tmp.path(), err))?;
        tmp.persist(&self.path)
            .map_err(|err| self.storage_error(&self.path, err.error))?;
        Ok(())
    }

    /// Take the lock file, waiting out other writers.
    fn lock_file(&self) -> Result<LockFile<'_>> {
        for _ in 0..LOCK_ATTEMPTS_MAX {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    // Holder pid, for whoever finds the lock left behind.
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(LockFile { path: &self.lock_path });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if self.lock_is_stale() {
                        warn!(path = %self.lock_path.display(), "removing stale ledger lock");
                        match fs::remove_file(&self.lock_path) {
                            Ok(()) => continue,
                            Err(err) if err.kind() == ErrorKind::NotFound => continue,
                            Err(err) => return Err(self.storage_error(&self.lock_path, err)),
                        }
                    }
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(err) => return Err(self.storage_error(&self.lock_path, err)),
            }
        }
        Err(CoordError::LedgerBusy {
            path: self.path.clone(),
            waited_ms: LOCK_RETRY_INTERVAL.as_millis() as u64 * u64::from(LOCK_ATTEMPTS_MAX),
        })
    }

    fn lock_is_stale(&self) -> bool {
        fs::metadata(&self.lock_path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > LOCK_STALE_AFTER)
    }
}

/// A held `<path>.lock`; removed on drop.
struct LockFile<'a> {
    path: &'a Path,
}

impl Drop for LockFile<'_> {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to remove ledger lock");
        }
    }
}

impl LedgerStore for JsonFileLedger {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load()?.get(key).map(Value::to_string))
    }

    fn update(&self, key: &str, modify: Modify<'_>) -> Result<bool> {
        let change = {
            let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            let _lock = self.lock_file()?;
            let mut entries = self.load()?;
            let current = entries.get(key).map(Value::to_string);
            let update = modify(current.as_deref())?;
            let change = apply_update(current.as_ref(), key, update);

            if let Some(change) = &change {
                match &change.value {
                    Some(raw) => {
                        entries.insert(key.to_string(), serde_json::from_str(raw)?);
                    }
                    None => {
                        entries.remove(key);
                    }
                }
                self.store(&entries)?;
                debug!(path = %self.path.display(), key, "ledger written");
            }
            change
        };

        match change {
            Some(change) => {
                self.subscribers.notify(&change);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn subscribe(&self, key: &str, callback: ChangeCallback) -> SubscriptionId {
        self.subscribers.add(key, callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(id)
    }
}
