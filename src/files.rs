//! File manager.
//!
//! Owns the processing and outgoing roots and an index of every file the
//! server has created under them. Uploaded sources land as
//! `{processing}/job_{id}_{filename}`, result artefacts under the
//! outgoing root, and scratch files get collision-free
//! `temp_{epoch}_{pid}_{seq}.{suffix}` names. Entries are unlinked when
//! their job is garbage-collected; temporaries older than a configured
//! age are swept periodically.
//!
//! Invariant: every tracked path canonicalises inside one of the two
//! roots. Checked when an entry is created and again on every open.

use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Maximum filename length accepted from clients.
pub const MAX_FILENAME_LEN: usize = 255;

/// Windows-reserved device names, refused for portability of artefacts.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Errors from file manager operations.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("unsafe filename `{0}`")]
    InvalidFilename(String),

    #[error("file of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: u64, max: u64 },

    #[error("path {0} escapes the managed roots")]
    OutsideRoot(PathBuf),

    #[error("no tracked file named `{0}`")]
    NotFound(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path, source: io::Error) -> FileError {
    FileError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One tracked file.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub job_id: u32,
    pub session_id: u32,
    pub basename: String,
    pub path: PathBuf,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub is_temporary: bool,
}

#[derive(Debug, Default)]
struct FileIndex {
    entries: Vec<FileEntry>,
}

impl FileIndex {
    fn find(&self, basename: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.basename == basename)
    }
}

/// The file manager. Thread-safe; the index mutex is held only for
/// short bookkeeping sections, never across filesystem calls on
/// user-sized data.
#[derive(Debug)]
pub struct FileManager {
    processing_root: PathBuf,
    outgoing_root: PathBuf,
    index: Mutex<FileIndex>,
    temp_seq: AtomicU64,
}

impl FileManager {
    /// Create both roots (0755) and canonicalise them.
    pub fn new(processing: &Path, outgoing: &Path) -> Result<Self, FileError> {
        for root in [processing, outgoing] {
            fs::create_dir_all(root).map_err(|e| io_err(root, e))?;
        }
        let processing_root = fs::canonicalize(processing).map_err(|e| io_err(processing, e))?;
        let outgoing_root = fs::canonicalize(outgoing).map_err(|e| io_err(outgoing, e))?;
        Ok(Self {
            processing_root,
            outgoing_root,
            index: Mutex::new(FileIndex::default()),
            temp_seq: AtomicU64::new(0),
        })
    }

    pub fn processing_root(&self) -> &Path {
        &self.processing_root
    }

    pub fn outgoing_root(&self) -> &Path {
        &self.outgoing_root
    }

    /// Persist an uploaded source for a job as
    /// `{processing}/job_{id}_{filename}`. The write is exclusive-create;
    /// a partial write is removed before the error propagates.
    pub fn save_uploaded(
        &self,
        job_id: u32,
        session_id: u32,
        filename: &str,
        data: &[u8],
        max_size: u64,
    ) -> Result<PathBuf, FileError> {
        if !is_safe_filename(filename) {
            return Err(FileError::InvalidFilename(filename.to_string()));
        }
        if data.len() as u64 > max_size {
            return Err(FileError::TooLarge {
                size: data.len() as u64,
                max: max_size,
            });
        }

        let basename = format!("job_{job_id}_{filename}");
        let path = self.confined(&self.processing_root, &basename)?;
        self.write_exclusive(&path, data)?;
        self.track(job_id, session_id, basename, path.clone(), data.len() as u64, false);

        debug!(job_id, filename, size = data.len(), "saved uploaded source");
        Ok(path)
    }

    /// Persist a result artefact under the outgoing root.
    pub fn save_artifact(
        &self,
        job_id: u32,
        session_id: u32,
        basename: &str,
        data: &[u8],
    ) -> Result<PathBuf, FileError> {
        if !is_safe_filename(basename) {
            return Err(FileError::InvalidFilename(basename.to_string()));
        }
        let path = self.confined(&self.outgoing_root, basename)?;
        self.write_exclusive(&path, data)?;
        self.track(job_id, session_id, basename.to_string(), path.clone(), data.len() as u64, false);
        Ok(path)
    }

    /// Read a tracked file back, refusing paths outside the roots and
    /// touching its access time.
    pub fn load(&self, basename: &str) -> Result<Vec<u8>, FileError> {
        let path = {
            let mut index = self.lock();
            let pos = index
                .find(basename)
                .ok_or_else(|| FileError::NotFound(basename.to_string()))?;
            index.entries[pos].last_accessed = Utc::now();
            index.entries[pos].path.clone()
        };

        // Re-verify confinement at open time: the entry was created safe,
        // but the invariant is checked on every open as well.
        let canonical = fs::canonicalize(&path).map_err(|e| io_err(&path, e))?;
        if !canonical.starts_with(&self.processing_root) && !canonical.starts_with(&self.outgoing_root)
        {
            return Err(FileError::OutsideRoot(canonical));
        }

        let mut file = fs::File::open(&canonical).map_err(|e| io_err(&canonical, e))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).map_err(|e| io_err(&canonical, e))?;
        Ok(data)
    }

    /// Create an empty scratch file with a collision-free name.
    pub fn create_temp(&self, job_id: u32, suffix: &str) -> Result<PathBuf, FileError> {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        let basename = format!(
            "temp_{}_{}_{}.{}",
            Utc::now().timestamp(),
            std::process::id(),
            seq,
            suffix
        );
        if !is_safe_filename(&basename) {
            return Err(FileError::InvalidFilename(basename));
        }
        let path = self.confined(&self.processing_root, &basename)?;
        self.write_exclusive(&path, &[])?;
        self.track(job_id, 0, basename, path.clone(), 0, true);
        Ok(path)
    }

    /// Unlink every tracked file belonging to a job. Returns how many
    /// files were removed.
    pub fn cleanup_job(&self, job_id: u32) -> usize {
        let victims: Vec<FileEntry> = {
            let mut index = self.lock();
            let (gone, keep): (Vec<_>, Vec<_>) =
                index.entries.drain(..).partition(|e| e.job_id == job_id);
            index.entries = keep;
            gone
        };

        let mut removed = 0;
        for entry in &victims {
            match fs::remove_file(&entry.path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %entry.path.display(), error = %e, "failed to unlink job file"),
            }
        }
        if removed > 0 {
            debug!(job_id, removed, "cleaned up job files");
        }
        removed
    }

    pub fn list_job(&self, job_id: u32) -> Vec<FileEntry> {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn info(&self, basename: &str) -> Option<FileEntry> {
        let index = self.lock();
        index.find(basename).map(|pos| index.entries[pos].clone())
    }

    pub fn tracked_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Sweep temporary files older than `max_age`. Candidates are gathered
    /// under the lock, then unlinked with the lock released so a long
    /// sweep never starves the request path.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::hours(24));
        let victims: Vec<(String, PathBuf)> = self
            .lock()
            .entries
            .iter()
            .filter(|e| e.is_temporary && e.created_at < cutoff)
            .map(|e| (e.basename.clone(), e.path.clone()))
            .collect();

        let mut removed = 0;
        for (basename, path) in victims {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to sweep temp file");
                    continue;
                }
            }
            let mut index = self.lock();
            if let Some(pos) = index.find(&basename) {
                index.entries.remove(pos);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "swept expired temporary files");
        }
        removed
    }

    fn confined(&self, root: &Path, basename: &str) -> Result<PathBuf, FileError> {
        let path = root.join(basename);
        // basename passed the safety check, so joining cannot traverse;
        // verify anyway against the canonical root.
        match path.parent() {
            Some(parent) if parent == root => Ok(path),
            _ => Err(FileError::OutsideRoot(path)),
        }
    }

    fn write_exclusive(&self, path: &Path, data: &[u8]) -> Result<(), FileError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| io_err(path, e))?;
        if let Err(e) = file.write_all(data).and_then(|_| file.flush()) {
            drop(file);
            let _ = fs::remove_file(path);
            return Err(io_err(path, e));
        }
        Ok(())
    }

    fn track(
        &self,
        job_id: u32,
        session_id: u32,
        basename: String,
        path: PathBuf,
        size: u64,
        is_temporary: bool,
    ) {
        let now = Utc::now();
        self.lock().entries.push(FileEntry {
            job_id,
            session_id,
            basename,
            path,
            size,
            created_at: now,
            last_accessed: now,
            is_temporary,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FileIndex> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Filename safety gate: no separators, traversal, control characters,
/// shell-hostile punctuation, reserved device names, or oversize names.
pub fn is_safe_filename(filename: &str) -> bool {
    if filename.is_empty() || filename.len() > MAX_FILENAME_LEN {
        return false;
    }
    if filename.contains("..") {
        return false;
    }
    for ch in filename.chars() {
        if ch.is_control() {
            return false;
        }
        if matches!(ch, '/' | '\\' | '<' | '>' | ':' | '"' | '|' | '?' | '*') {
            return false;
        }
    }
    let stem = filename.split('.').next().unwrap_or(filename);
    if RESERVED_NAMES.iter().any(|r| stem.eq_ignore_ascii_case(r)) {
        return false;
    }
    true
}
