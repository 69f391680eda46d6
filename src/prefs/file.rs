//! File-backed preference store.
//!
//! Every mutation is appended to `prefs.log` before it becomes visible, so a
//! crash never loses an acknowledged write. Entries are length-prefixed
//! MessagePack with a trailing CRC32. On open the log is replayed into memory;
//! a torn or corrupt tail is truncated. The log is rewritten once dead entries
//! dominate.
//!
//! The directory is guarded by an exclusive OS lock, which makes this store the
//! single source of truth for quota counters across processes.

use super::{PrefValue, PreferenceStore};
use crate::error::{GateError, Result};
use chrono::Utc;
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Magic bytes for the store manifest.
const STORE_MAGIC: &[u8; 4] = b"EGT\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// Magic bytes for the preference log.
const LOG_MAGIC: &[u8; 4] = b"PRF\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Magic + version.
const LOG_HEADER_LEN: u64 = 5;

/// Sanity bound for a single entry.
const MAX_ENTRY_LEN: usize = 1024 * 1024;

const LOG_FILE: &str = "prefs.log";

/// File store configuration.
#[derive(Clone, Debug)]
pub struct FileStoreConfig {
    /// Directory holding the manifest, lock and log.
    pub path: PathBuf,

    /// Never compact below this many log entries.
    /// Default: 1024
    pub compact_min_entries: usize,

    /// Compact once entries exceed `live keys * compact_ratio`.
    /// Default: 4
    pub compact_ratio: usize,

    /// fsync after every write.
    /// Default: true
    pub sync_writes: bool,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./entitlements"),
            compact_min_entries: 1024,
            compact_ratio: 4,
            sync_writes: true,
        }
    }
}

impl FileStoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum LogOp {
    Set { key: String, value: PrefValue },
    Remove { key: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct LogEntry {
    seq: u64,
    op: LogOp,
    /// Milliseconds since Unix epoch.
    timestamp: i64,
}

/// Append handle and bookkeeping, guarded together.
struct LogWriter {
    file: File,
    /// Length of the valid log, in bytes.
    len: u64,
    next_seq: u64,
    entries: usize,
}

/// Append-only, checksummed, lock-protected preference store.
pub struct FilePreferenceStore {
    config: FileStoreConfig,

    /// Held for the lifetime of the store.
    _lock_file: File,

    values: RwLock<HashMap<String, PrefValue>>,

    log: Mutex<LogWriter>,
}

impl FilePreferenceStore {
    /// Open the store at `config.path`, creating it if missing.
    ///
    /// Fails with [`GateError::Locked`] if another process holds the store.
    pub fn open(config: FileStoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;

        let manifest = config.path.join("MANIFEST");
        if manifest.exists() {
            Self::verify_manifest(&manifest)?;
        } else {
            Self::write_manifest(&manifest)?;
        }

        let lock_file = Self::acquire_lock(&config.path)?;

        let log_path = config.path.join(LOG_FILE);
        let (values, next_seq, entries, len) = Self::replay(&log_path)?;
        let file = OpenOptions::new().read(true).write(true).open(&log_path)?;

        info!(
            path = %config.path.display(),
            keys = values.len(),
            entries,
            "opened preference store"
        );

        Ok(Self {
            config,
            _lock_file: lock_file,
            values: RwLock::new(values),
            log: Mutex::new(LogWriter {
                file,
                len,
                next_seq,
                entries,
            }),
        })
    }

    /// Number of entries currently in the log (live and dead).
    pub fn log_entries(&self) -> usize {
        self.log.lock().entries
    }

    /// Rewrite the log so it holds exactly one entry per live key.
    pub fn compact(&self) -> Result<()> {
        let mut log = self.log.lock();
        let values = self.values.read();
        self.rewrite(&mut log, &values)
    }

    fn append(&self, op: LogOp) -> Result<()> {
        let mut log = self.log.lock();

        let entry = LogEntry {
            seq: log.next_seq,
            op,
            timestamp: Utc::now().timestamp_millis(),
        };
        let frame = Self::encode_entry(&entry)?;

        let start = log.len;
        if let Err(e) = Self::write_frame(&mut log.file, start, &frame, self.config.sync_writes) {
            // Drop whatever part of the frame reached the file.
            if let Err(trunc) = log.file.set_len(start) {
                warn!(error = %trunc, "failed to roll back partial preference write");
            }
            return Err(e);
        }

        log.len = start + frame.len() as u64;
        log.next_seq += 1;
        log.entries += 1;

        let mut values = self.values.write();
        match entry.op {
            LogOp::Set { key, value } => {
                values.insert(key, value);
            }
            LogOp::Remove { key } => {
                values.remove(&key);
            }
        }

        let threshold = self
            .config
            .compact_min_entries
            .max(values.len().saturating_mul(self.config.compact_ratio));
        if log.entries > threshold {
            // The entry is already durable; a failed rewrite only delays compaction.
            if let Err(e) = self.rewrite(&mut log, &values) {
                warn!(error = %e, "preference log compaction failed");
            }
        }

        Ok(())
    }

    fn rewrite(&self, log: &mut LogWriter, values: &HashMap<String, PrefValue>) -> Result<()> {
        let log_path = self.config.path.join(LOG_FILE);
        let tmp_path = self.config.path.join("prefs.log.tmp");

        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        tmp.write_all(LOG_MAGIC)?;
        tmp.write_all(&[LOG_VERSION])?;

        let mut len = LOG_HEADER_LEN;
        let mut seq = 1u64;
        let now = Utc::now().timestamp_millis();
        for (key, value) in values {
            let frame = Self::encode_entry(&LogEntry {
                seq,
                op: LogOp::Set {
                    key: key.clone(),
                    value: value.clone(),
                },
                timestamp: now,
            })?;
            tmp.write_all(&frame)?;
            len += frame.len() as u64;
            seq += 1;
        }
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&tmp_path, &log_path)?;

        let before = log.entries;
        log.file = OpenOptions::new().read(true).write(true).open(&log_path)?;
        log.len = len;
        log.next_seq = seq;
        log.entries = values.len();

        debug!(before, after = log.entries, "compacted preference log");
        Ok(())
    }

    /// Replay the log into a map. Returns (values, next_seq, entries, valid_len).
    fn replay(path: &Path) -> Result<(HashMap<String, PrefValue>, u64, usize, u64)> {
        let file_len = if path.exists() { fs::metadata(path)?.len() } else { 0 };

        if file_len < LOG_HEADER_LEN {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            file.write_all(LOG_MAGIC)?;
            file.write_all(&[LOG_VERSION])?;
            file.sync_all()?;
            return Ok((HashMap::new(), 1, 0, LOG_HEADER_LEN));
        }

        let mut reader = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(GateError::InvalidFormat("Invalid preference log magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(GateError::InvalidFormat(format!(
                "Unsupported preference log version: {}",
                version[0]
            )));
        }

        let mut values = HashMap::new();
        let mut max_seq = 0u64;
        let mut entries = 0usize;
        let mut valid_len = LOG_HEADER_LEN;

        loop {
            if valid_len == file_len {
                break;
            }
            match Self::read_entry(&mut reader) {
                Ok((entry, frame_len)) => {
                    max_seq = max_seq.max(entry.seq);
                    entries += 1;
                    valid_len += frame_len;
                    match entry.op {
                        LogOp::Set { key, value } => {
                            values.insert(key, value);
                        }
                        LogOp::Remove { key } => {
                            values.remove(&key);
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        valid_len,
                        file_len,
                        "truncating damaged preference log tail"
                    );
                    let file = OpenOptions::new().write(true).open(path)?;
                    file.set_len(valid_len)?;
                    file.sync_all()?;
                    break;
                }
            }
        }

        Ok((values, max_seq + 1, entries, valid_len))
    }

    fn encode_entry(entry: &LogEntry) -> Result<Vec<u8>> {
        let encoded = rmp_serde::to_vec(entry)?;
        let len = u32::try_from(encoded.len())
            .map_err(|_| GateError::Serialization("preference entry too large".into()))?;

        let mut frame = Vec::with_capacity(encoded.len() + 8);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&encoded);
        frame.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());
        Ok(frame)
    }

    fn write_frame(file: &mut File, offset: u64, frame: &[u8], sync: bool) -> Result<()> {
        use std::io::{Seek, SeekFrom};

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(frame)?;
        if sync {
            file.sync_data()?;
        }
        Ok(())
    }

    fn read_entry(reader: &mut impl Read) -> Result<(LogEntry, u64)> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_ENTRY_LEN {
            return Err(GateError::Corruption("preference entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(GateError::ChecksumMismatch { expected, got });
        }

        let entry = rmp_serde::from_slice(&encoded)?;
        Ok((entry, (len + 8) as u64))
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(GateError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(GateError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file.try_lock_exclusive().map_err(|_| GateError::Locked)?;
        Ok(lock_file)
    }
}

impl PreferenceStore for FilePreferenceStore {
    fn get(&self, key: &str) -> Result<Option<PrefValue>> {
        Ok(self.values.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: PrefValue) -> Result<()> {
        if self.values.read().get(key) == Some(&value) {
            return Ok(());
        }
        self.append(LogOp::Set {
            key: key.to_string(),
            value,
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        if !self.values.read().contains_key(key) {
            return Ok(());
        }
        self.append(LogOp::Remove {
            key: key.to_string(),
        })
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .values
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn flush(&self) -> Result<()> {
        self.log.lock().file.sync_all()?;
        Ok(())
    }
}

impl Drop for FilePreferenceStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.flush();
    }
}
