// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared INI configuration store with atomic writes and file locking.
//!
//! The store holds a small amount of cross-invocation state: the `[tracker]`
//! settings section and the `[triggered_limits]` cache blob. It may be shared
//! by several trackers in one process and by several processes at once, so
//! every read-modify-write sequence runs under an exclusive advisory lock on
//! a sidecar `.lock` file, and every write lands via tmp-file + fsync +
//! rename. The lock is held only across the critical section; callers must
//! not perform network I/O inside [`ConfigStore::with_lock`].

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use aicm_core::AicmError;
use fs2::FileExt;
use rand::Rng;
use tracing::{debug, warn};

/// Number of times a failed rename is retried.
const RENAME_RETRIES: u32 = 3;

/// Base sleep between rename retries; jittered up to 2x.
const RENAME_RETRY_SLEEP: Duration = Duration::from_millis(10);

/// Parsed INI document: section name to key/value map.
///
/// `BTreeMap` keeps rendering deterministic. Unknown sections survive a
/// read-modify-write cycle untouched.
pub type IniDocument = BTreeMap<String, BTreeMap<String, String>>;

/// Handle to an INI file on disk.
///
/// The handle stores no document state; every operation re-reads the file so
/// concurrent writers (other processes included) are always observed.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl ConfigStore {
    /// Open a store at `path`. The file itself is created on first write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self { path, lock_path }
    }

    /// The conventional store location: `~/.config/aicm/AICM.INI`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("aicm")
            .join("AICM.INI")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read one value.
    pub fn get(&self, section: &str, key: &str) -> Result<Option<String>, AicmError> {
        let _guard = self.lock()?;
        Ok(self
            .read_document()
            .get(section)
            .and_then(|s| s.get(key))
            .cloned())
    }

    /// Write one value.
    pub fn set(&self, section: &str, key: &str, value: &str) -> Result<(), AicmError> {
        self.with_lock(|doc| {
            doc.entry(section.to_string())
                .or_default()
                .insert(key.to_string(), value.to_string());
        })
    }

    /// Read a whole section (empty map when absent).
    pub fn section(&self, section: &str) -> Result<BTreeMap<String, String>, AicmError> {
        let _guard = self.lock()?;
        Ok(self.read_document().remove(section).unwrap_or_default())
    }

    /// Replace a whole section, dropping keys not present in `values`.
    pub fn replace_section(
        &self,
        section: &str,
        values: BTreeMap<String, String>,
    ) -> Result<(), AicmError> {
        self.with_lock(|doc| {
            doc.insert(section.to_string(), values);
        })
    }

    /// Run a read-modify-write sequence under the exclusive file lock.
    ///
    /// The document is re-read under the lock, handed to `f`, and written
    /// back atomically afterwards.
    pub fn with_lock<T>(&self, f: impl FnOnce(&mut IniDocument) -> T) -> Result<T, AicmError> {
        let _guard = self.lock()?;
        let mut doc = self.read_document();
        let result = f(&mut doc);
        self.write_document(&doc)?;
        Ok(result)
    }

    fn lock(&self) -> Result<LockGuard, AicmError> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| AicmError::ConfigPersist {
                message: format!("cannot create {}", parent.display()),
                source: Some(Box::new(e)),
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| AicmError::ConfigPersist {
                message: format!("cannot open lock file {}", self.lock_path.display()),
                source: Some(Box::new(e)),
            })?;
        file.lock_exclusive().map_err(|e| AicmError::ConfigPersist {
            message: format!("cannot lock {}", self.lock_path.display()),
            source: Some(Box::new(e)),
        })?;
        Ok(LockGuard { file })
    }

    /// Parse the file tolerantly. Read errors yield an empty document.
    fn read_document(&self) -> IniDocument {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return IniDocument::new(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "config store unreadable, treating as empty");
                return IniDocument::new();
            }
        };
        parse_ini(&text, &self.path)
    }

    /// Serialize and atomically replace the file.
    fn write_document(&self, doc: &IniDocument) -> Result<(), AicmError> {
        let tmp_path = self.path.with_extension("tmp");
        let persist_err = |message: String, e: std::io::Error| AicmError::ConfigPersist {
            message,
            source: Some(Box::new(e)),
        };

        let mut file = File::create(&tmp_path)
            .map_err(|e| persist_err(format!("cannot create {}", tmp_path.display()), e))?;
        file.write_all(render_ini(doc).as_bytes())
            .map_err(|e| persist_err(format!("cannot write {}", tmp_path.display()), e))?;
        file.sync_all()
            .map_err(|e| persist_err(format!("cannot fsync {}", tmp_path.display()), e))?;
        drop(file);

        let mut last_err = None;
        for attempt in 0..RENAME_RETRIES {
            match fs::rename(&tmp_path, &self.path) {
                Ok(()) => {
                    debug!(path = %self.path.display(), "config store written");
                    return Ok(());
                }
                Err(err) => {
                    let jitter = rand::thread_rng().gen_range(0.0..1.0);
                    std::thread::sleep(RENAME_RETRY_SLEEP.mul_f64(1.0 + jitter));
                    warn!(
                        path = %self.path.display(),
                        attempt = attempt + 1,
                        error = %err,
                        "config store rename failed"
                    );
                    last_err = Some(err);
                }
            }
        }
        Err(AicmError::ConfigPersist {
            message: format!("cannot rename {} over {}", tmp_path.display(), self.path.display()),
            source: last_err.map(|e| Box::new(e) as _),
        })
    }
}

struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn parse_ini(text: &str, path: &Path) -> IniDocument {
    let mut doc = IniDocument::new();
    let mut current: Option<String> = None;
    for (line_no, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim().to_string();
            // Duplicate sections merge; later keys win.
            doc.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warn!(
                path = %path.display(),
                line = line_no + 1,
                "dropping malformed config line"
            );
            continue;
        };
        let Some(section) = &current else {
            warn!(
                path = %path.display(),
                line = line_no + 1,
                "dropping key outside any section"
            );
            continue;
        };
        doc.get_mut(section)
            .expect("current section exists")
            .insert(key.trim().to_string(), value.trim().to_string());
    }
    doc
}

fn render_ini(doc: &IniDocument) -> String {
    let mut out = String::new();
    for (name, section) in doc {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push('[');
        out.push_str(name);
        out.push_str("]\n");
        for (key, value) in section {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
    }
    out
}
