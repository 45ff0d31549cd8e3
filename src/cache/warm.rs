//! WARM tier: checksummed entries on local disk.
//!
//! # Layout
//! ```text
//! <root>/entries/<sha256(key)>.entry   committed entries
//! <root>/tmp/                          in-progress writes
//! <root>/quarantine/                   entries that failed verification
//! ```
//!
//! # Entry format
//! ```text
//! magic "BHW1" | key_len u32 LE | value_len u64 LE | sha256(key ‖ value) | key | value
//! ```
//!
//! # Write protocol
//! write temp file → fsync → re-read and verify → rename over the entry.
//! A reader sees either the previous entry or the new one, never a partial file.
//!
//! All methods block; callers run them on the blocking pool.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};

use crate::cache::StorageError;
use crate::resilience::ResourceLedger;

const MAGIC: &[u8; 4] = b"BHW1";
const HEADER_LEN: usize = 4 + 4 + 8 + 32;
const PROBE_KEY: &str = "__bulkhead_probe__";

#[derive(Debug, Clone)]
struct WarmMeta {
    path: PathBuf,
    size: u64,
    /// Write order; lower is older.
    seq: u64,
    /// Caller-assigned version of the value; 0 for entries found on disk.
    generation: u64,
}

/// Disk-backed store bounded by a byte ledger.
#[derive(Debug)]
pub(crate) struct WarmStore {
    root: PathBuf,
    entries_dir: PathBuf,
    tmp_dir: PathBuf,
    quarantine_dir: PathBuf,
    index: Mutex<HashMap<String, WarmMeta>>,
    ledger: ResourceLedger<String>,
    /// Serialises writers so eviction and reservation see a stable index.
    write_lock: Mutex<()>,
    seq: AtomicU64,
    quarantined: AtomicU64,
}

impl WarmStore {
    pub(crate) fn new(root: impl Into<PathBuf>, capacity_bytes: u64) -> Self {
        let root = root.into();
        Self {
            entries_dir: root.join("entries"),
            tmp_dir: root.join("tmp"),
            quarantine_dir: root.join("quarantine"),
            root,
            index: Mutex::new(HashMap::new()),
            ledger: ResourceLedger::new("warm_bytes", capacity_bytes, None),
            write_lock: Mutex::new(()),
            seq: AtomicU64::new(0),
            quarantined: AtomicU64::new(0),
        }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    /// Rebuild the index from disk. Corrupt entries are quarantined and
    /// leftover temp files removed. Returns the number of entries loaded.
    pub(crate) fn load(&self) -> Result<usize, StorageError> {
        self.ensure_dirs()?;

        if let Ok(leftovers) = fs::read_dir(&self.tmp_dir) {
            for entry in leftovers.flatten() {
                let _ = fs::remove_file(entry.path());
            }
        }

        let mut found = Vec::new();
        let dir = fs::read_dir(&self.entries_dir).map_err(|e| read_failure(&self.entries_dir, e))?;
        for entry in dir.flatten() {
            let path = entry.path();
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable warm entry");
                    continue;
                }
            };
            match decode(&bytes) {
                Ok((key, _)) => found.push((modified, key.to_string(), path, bytes.len() as u64)),
                Err(reason) => {
                    self.quarantine(&path, reason);
                }
            }
        }

        found.sort_by_key(|(modified, ..)| *modified);
        let mut index = self.index.lock().expect("warm index mutex poisoned");
        let mut loaded = 0;
        for (_, key, path, size) in found {
            if self.ledger.try_acquire(&key, size).is_err() {
                let _ = fs::remove_file(&path);
                continue;
            }
            let seq = self.next_seq();
            index.insert(
                key,
                WarmMeta {
                    path,
                    size,
                    seq,
                    generation: 0,
                },
            );
            loaded += 1;
        }
        tracing::info!(root = %self.root.display(), entries = loaded, bytes = self.ledger.used(), "Warm tier loaded");
        Ok(loaded)
    }

    /// Read and verify an entry. `Ok(None)` for a miss.
    ///
    /// An entry that fails verification is quarantined and reported as
    /// `DiskCorruption`; the caller treats it as a miss.
    pub(crate) fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let meta = match self.index.lock().expect("warm index mutex poisoned").get(key) {
            Some(meta) => meta.clone(),
            None => return Ok(None),
        };

        let bytes = match fs::read(&meta.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.forget(key, meta.seq);
                return Ok(None);
            }
            Err(e) => return Err(read_failure(&meta.path, e)),
        };

        match decode(&bytes) {
            Ok((stored_key, value)) if stored_key == key => Ok(Some(value.to_vec())),
            Ok(_) => self.reject(key, &meta, "key mismatch"),
            Err(reason) => self.reject(key, &meta, reason),
        }
    }

    /// Atomically write an entry, evicting the oldest entries if the byte
    /// budget requires it.
    ///
    /// Returns `Ok(false)` without touching the disk when the stored entry
    /// already carries a newer `generation`.
    pub(crate) fn write(&self, key: &str, value: &[u8], generation: u64) -> Result<bool, StorageError> {
        let _writer = self.write_lock.lock().expect("warm write mutex poisoned");
        if self.meta(key).is_some_and(|m| m.generation > generation) {
            tracing::debug!(key = %key, generation, "Warm write superseded by a newer value");
            return Ok(false);
        }
        let envelope = encode(key, value);
        let size = envelope.len() as u64;
        let capacity = self.ledger.capacity();
        if size > capacity {
            return Err(StorageError::TooLarge { size, capacity });
        }

        let previous = self.meta(key).map(|m| m.size).unwrap_or(0);
        while self.ledger.used().saturating_sub(previous) + size > capacity {
            if !self.evict_oldest(key) {
                break;
            }
        }

        self.ensure_dirs()?;
        let path = self.entry_path(key);
        commit(&self.tmp_dir, &path, key, &envelope)?;

        let owned = key.to_string();
        let mut index = self.index.lock().expect("warm index mutex poisoned");
        if let Some(old) = index.get(key) {
            self.ledger.release(&owned, old.size);
        }
        if self.ledger.try_acquire(&owned, size).is_err() {
            tracing::warn!(key = %key, size, "Warm ledger out of sync after write");
        }
        let seq = self.next_seq();
        index.insert(
            owned,
            WarmMeta {
                path,
                size,
                seq,
                generation,
            },
        );
        Ok(true)
    }

    pub(crate) fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let _writer = self.write_lock.lock().expect("warm write mutex poisoned");
        let Some(meta) = self.meta(key) else {
            return Ok(false);
        };
        match fs::remove_file(&meta.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(write_failure(&meta.path, e)),
        }
        self.forget(key, meta.seq);
        Ok(true)
    }

    /// Full write + read + integrity check against a scratch entry.
    pub(crate) fn probe(&self) -> Result<(), StorageError> {
        self.ensure_dirs()?;
        let nonce: [u8; 32] = rand::random();
        let envelope = encode(PROBE_KEY, &nonce);
        let path = self.tmp_dir.join("probe.entry");
        commit(&self.tmp_dir, &path, PROBE_KEY, &envelope)?;

        let result = fs::read(&path)
            .map_err(|e| read_failure(&path, e))
            .and_then(|bytes| match decode(&bytes) {
                Ok((PROBE_KEY, value)) if value == &nonce[..] => Ok(()),
                Ok(_) => Err(StorageError::DiskCorruption {
                    path: path.clone(),
                    reason: "probe content mismatch",
                }),
                Err(reason) => Err(StorageError::DiskCorruption {
                    path: path.clone(),
                    reason,
                }),
            });
        let _ = fs::remove_file(&path);
        result
    }

    /// Delete quarantined files older than `retention`. Returns the number purged.
    pub(crate) fn purge_quarantine(&self, retention: Duration) -> usize {
        let Ok(dir) = fs::read_dir(&self.quarantine_dir) else {
            return 0;
        };
        let now = SystemTime::now();
        let mut purged = 0;
        for entry in dir.flatten() {
            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|modified| now.duration_since(modified).unwrap_or_default() >= retention)
                .unwrap_or(false);
            if expired && fs::remove_file(entry.path()).is_ok() {
                purged += 1;
            }
        }
        if purged > 0 {
            tracing::info!(purged, "Purged expired quarantine files");
        }
        purged
    }

    pub(crate) fn entry_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.entries_dir.join(format!("{}.entry", hex::encode(digest)))
    }

    #[cfg(test)]
    pub(crate) fn quarantine_dir(&self) -> &Path {
        &self.quarantine_dir
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.index.lock().expect("warm index mutex poisoned").contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.index.lock().expect("warm index mutex poisoned").len()
    }

    pub(crate) fn used_bytes(&self) -> u64 {
        self.ledger.used()
    }

    pub(crate) fn capacity_bytes(&self) -> u64 {
        self.ledger.capacity()
    }

    /// Entries moved to quarantine since this store was created.
    pub(crate) fn quarantined(&self) -> u64 {
        self.quarantined.load(Ordering::Relaxed)
    }

    /// Quarantine the entry `meta` describes, unless a writer replaced it
    /// after it was read; the replacement is left alone and the read is a miss.
    fn reject(&self, key: &str, meta: &WarmMeta, reason: &'static str) -> Result<Option<Vec<u8>>, StorageError> {
        let _writer = self.write_lock.lock().expect("warm write mutex poisoned");
        if self.meta(key).map(|current| current.seq) != Some(meta.seq) {
            tracing::debug!(key = %key, reason, "Corrupt read raced a rewrite, keeping the new entry");
            return Ok(None);
        }
        self.quarantine(&meta.path, reason);
        self.forget(key, meta.seq);
        Err(StorageError::DiskCorruption {
            path: meta.path.clone(),
            reason,
        })
    }

    fn quarantine(&self, path: &Path, reason: &'static str) {
        let stamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "entry".to_string());
        let target = self.quarantine_dir.join(format!("{name}.{stamp}"));

        let moved = fs::create_dir_all(&self.quarantine_dir).and_then(|_| fs::rename(path, &target));
        match moved {
            Ok(()) => {
                self.quarantined.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(path = %path.display(), quarantine = %target.display(), reason, "Quarantined corrupt warm entry");
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, reason, "Could not quarantine corrupt entry, deleting");
                let _ = fs::remove_file(path);
            }
        }
    }

    /// Drop `key` from the index if it still refers to the same write.
    fn forget(&self, key: &str, seq: u64) {
        let mut index = self.index.lock().expect("warm index mutex poisoned");
        if let Some(meta) = index.get(key) {
            if meta.seq == seq {
                let size = meta.size;
                index.remove(key);
                self.ledger.release(&key.to_string(), size);
            }
        }
    }

    fn evict_oldest(&self, except: &str) -> bool {
        let victim = {
            let index = self.index.lock().expect("warm index mutex poisoned");
            index
                .iter()
                .filter(|(k, _)| k.as_str() != except)
                .min_by_key(|(_, meta)| meta.seq)
                .map(|(k, meta)| (k.clone(), meta.clone()))
        };
        let Some((key, meta)) = victim else {
            return false;
        };
        let _ = fs::remove_file(&meta.path);
        self.forget(&key, meta.seq);
        tracing::debug!(key = %key, size = meta.size, "Evicted oldest warm entry");
        true
    }

    fn meta(&self, key: &str) -> Option<WarmMeta> {
        self.index.lock().expect("warm index mutex poisoned").get(key).cloned()
    }

    fn ensure_dirs(&self) -> Result<(), StorageError> {
        for dir in [&self.entries_dir, &self.tmp_dir] {
            fs::create_dir_all(dir).map_err(|e| write_failure(dir, e))?;
        }
        Ok(())
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

/// Write `envelope` to a temp file, verify it, and rename it to `target`.
/// The temp file is removed on any failure.
fn commit(tmp_dir: &Path, target: &Path, key: &str, envelope: &[u8]) -> Result<(), StorageError> {
    let tmp = tmp_dir.join(format!("{}.tmp", uuid::Uuid::new_v4()));
    let result = write_verified(&tmp, key, envelope).and_then(|()| {
        fs::rename(&tmp, target).map_err(|e| write_failure(target, e))
    });
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_verified(tmp: &Path, key: &str, envelope: &[u8]) -> Result<(), StorageError> {
    let mut file = File::create(tmp).map_err(|e| write_failure(tmp, e))?;
    file.write_all(envelope).map_err(|e| write_failure(tmp, e))?;
    file.sync_all().map_err(|e| write_failure(tmp, e))?;
    drop(file);

    let readback = fs::read(tmp).map_err(|e| write_failure(tmp, e))?;
    match decode(&readback) {
        Ok((stored_key, _)) if stored_key == key && readback == envelope => Ok(()),
        Ok(_) => Err(StorageError::DiskCorruption {
            path: tmp.to_path_buf(),
            reason: "read-back mismatch",
        }),
        Err(reason) => Err(StorageError::DiskCorruption {
            path: tmp.to_path_buf(),
            reason,
        }),
    }
}

fn write_failure(path: &Path, source: io::Error) -> StorageError {
    StorageError::DiskWriteFailure {
        path: path.to_path_buf(),
        source,
    }
}

fn read_failure(path: &Path, source: io::Error) -> StorageError {
    StorageError::DiskReadFailure {
        path: path.to_path_buf(),
        source,
    }
}

fn checksum(key: &[u8], value: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(value);
    hasher.finalize().into()
}

pub(crate) fn encode(key: &str, value: &[u8]) -> Vec<u8> {
    let key = key.as_bytes();
    let mut out = Vec::with_capacity(HEADER_LEN + key.len() + value.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(key.len() as u32).to_le_bytes());
    out.extend_from_slice(&(value.len() as u64).to_le_bytes());
    out.extend_from_slice(&checksum(key, value));
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    out
}

/// Decode and verify an entry, returning `(key, value)`.
pub(crate) fn decode(bytes: &[u8]) -> Result<(&str, &[u8]), &'static str> {
    if bytes.len() < HEADER_LEN {
        return Err("truncated header");
    }
    if &bytes[..4] != MAGIC {
        return Err("bad magic");
    }
    let key_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let mut value_len = [0u8; 8];
    value_len.copy_from_slice(&bytes[8..16]);
    let value_len = u64::from_le_bytes(value_len) as usize;
    let body = &bytes[HEADER_LEN..];
    if key_len.checked_add(value_len) != Some(body.len()) {
        return Err("length mismatch");
    }

    let (key, value) = body.split_at(key_len);
    if checksum(key, value)[..] != bytes[16..HEADER_LEN] {
        return Err("checksum mismatch");
    }
    let key = std::str::from_utf8(key).map_err(|_| "key is not utf-8")?;
    Ok((key, value))
}
