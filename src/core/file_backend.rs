//! Backend A: file-atomic persistence.
//!
//! Backups are timestamped sidecar copies recorded in an append-only
//! manifest with content hashes. Applies rewrite the whole log
//! write-to-temp-then-rename under a sidecar `.lock` file; a failed rename
//! leaves the original untouched. The lock is held by an RAII guard, so it
//! releases on every exit path.

use crate::core::config::BackendChoice;
use crate::core::engine::RepairOperation;
use crate::core::error::MendError;
use crate::core::logfile::LogFile;
use crate::core::persist::{
    ApplyStatus, MAX_UNDO_POINTS, PersistenceBackend, UndoPoint, apply_operation,
};
use crate::core::time;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// How long to wait on a contended sidecar lock before giving up.
const LOCK_WAIT: Duration = Duration::from_secs(5);
const LOCK_POLL: Duration = Duration::from_millis(50);

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", path.display(), suffix))
}

/// Held while the log file is a process-exclusive resource. Dropping the
/// guard removes the lock file, success or not.
struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    fn acquire(log_path: &Path) -> Result<LockGuard, MendError> {
        let path = sidecar(log_path, ".lock");
        let deadline = Instant::now() + LOCK_WAIT;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut f) => {
                    let _ = writeln!(f, "{}", std::process::id());
                    return Ok(LockGuard { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(MendError::PersistenceError(format!(
                            "lock contention on {} (held by another process?)",
                            path.display()
                        )));
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(MendError::IoError(e)),
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// One line of the backup manifest sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackupEntry {
    backup_id: String,
    ts: String,
    sha256: String,
    path: String,
}

/// The file-atomic backend.
#[derive(Debug, Default)]
pub struct FileBackend;

impl FileBackend {
    pub fn new() -> Self {
        FileBackend
    }

    fn manifest_path(log_path: &Path) -> PathBuf {
        sidecar(log_path, ".backups.jsonl")
    }

    fn read_manifest(log_path: &Path) -> Result<Vec<BackupEntry>, MendError> {
        let path = Self::manifest_path(log_path);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for line in fs::read_to_string(&path)?.lines() {
            if line.trim().is_empty() {
                continue;
            }
            // tolerate a torn trailing line from a crashed writer
            if let Ok(entry) = serde_json::from_str::<BackupEntry>(line) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn append_manifest(log_path: &Path, entry: &BackupEntry) -> Result<(), MendError> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::manifest_path(log_path))?;
        writeln!(f, "{}", serde_json::to_string(entry)?)?;
        Ok(())
    }

    /// Write-to-temp-then-rename in the log's own directory, so the rename
    /// stays on one filesystem.
    fn write_atomic(path: &Path, contents: &str) -> Result<(), MendError> {
        let tmp = sidecar(path, &format!(".tmp.{}", time::new_backup_id()));
        fs::write(&tmp, contents)?;
        match fs::rename(&tmp, path) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                Err(MendError::PersistenceError(format!(
                    "rename onto {} failed: {}",
                    path.display(),
                    e
                )))
            }
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

impl PersistenceBackend for FileBackend {
    fn create_backup(&self, log: &LogFile) -> Result<String, MendError> {
        let bytes = fs::read(&log.path)?;
        let backup_id = time::new_backup_id();
        let backup_path = sidecar(&log.path, &format!(".{}.bak", backup_id));
        fs::write(&backup_path, &bytes)?;
        Self::append_manifest(
            &log.path,
            &BackupEntry {
                backup_id: backup_id.clone(),
                ts: time::now_iso(),
                sha256: sha256_hex(&bytes),
                path: backup_path.display().to_string(),
            },
        )?;
        Ok(backup_id)
    }

    fn apply_repair(&self, log: &mut LogFile, op: &RepairOperation) -> Result<bool, MendError> {
        let _lock = LockGuard::acquire(&log.path)?;
        let status = apply_operation(log, &op.kind);
        if status == ApplyStatus::Applied {
            Self::write_atomic(&log.path, &log.render())?;
        }
        Ok(status.is_satisfied())
    }

    fn rollback_to_backup(&self, log: &mut LogFile, backup_id: &str) -> Result<bool, MendError> {
        let Some(entry) = Self::read_manifest(&log.path)?
            .into_iter()
            .find(|e| e.backup_id == backup_id)
        else {
            return Ok(false);
        };
        let backup_path = PathBuf::from(&entry.path);
        if !backup_path.exists() {
            return Ok(false);
        }
        let bytes = fs::read(&backup_path)?;
        if sha256_hex(&bytes) != entry.sha256 {
            return Err(MendError::PersistenceError(format!(
                "backup {} failed checksum verification",
                backup_id
            )));
        }
        {
            let _lock = LockGuard::acquire(&log.path)?;
            Self::write_atomic(&log.path, &String::from_utf8_lossy(&bytes))?;
        }
        *log = LogFile::load(&log.path)?;
        Ok(true)
    }

    fn undo_history(&self, log: &LogFile) -> Result<Vec<UndoPoint>, MendError> {
        let mut entries = Self::read_manifest(&log.path)?;
        entries.reverse();
        entries.truncate(MAX_UNDO_POINTS);
        Ok(entries
            .into_iter()
            .map(|e| UndoPoint {
                id: e.backup_id,
                timestamp: e.ts,
                label: format!("backup sha256:{}", &e.sha256[..12.min(e.sha256.len())]),
            })
            .collect())
    }

    fn backend_name(&self) -> BackendChoice {
        BackendChoice::FileAtomic
    }
}
