// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Per-session bookkeeping of which files were read and when.
//!
//! Edit tools consult the tracker before writing and surface a *warning*
//! — not a hard block — when the target was never read in this session or
//! changed on disk after the last read.  Scripted flows keep working; the
//! model just gets told its view may be stale.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::SystemTime;

use chrono::{DateTime, Utc};

/// Stat signature used to detect out-of-band modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StatSignature {
    mtime: Option<SystemTime>,
    size: u64,
}

impl StatSignature {
    fn of(path: &Path) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        Some(Self { mtime: meta.modified().ok(), size: meta.len() })
    }
}

#[derive(Debug, Clone)]
struct FileAccessRecord {
    first_read: DateTime<Utc>,
    signature: Option<StatSignature>,
}

/// Result of a modification check.
#[derive(Debug, Clone)]
pub struct Modification {
    pub modified: bool,
    pub message: String,
}

/// Process-wide read tracker, indexed by (session, path).
///
/// A path appears at most once per session; re-reads refresh the stat
/// signature but keep the first-read timestamp.
#[derive(Default)]
pub struct FileAccessTracker {
    records: Mutex<HashMap<(String, PathBuf), FileAccessRecord>>,
}

impl FileAccessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide singleton.
    pub fn global() -> &'static FileAccessTracker {
        static GLOBAL: OnceLock<FileAccessTracker> = OnceLock::new();
        GLOBAL.get_or_init(FileAccessTracker::new)
    }

    /// Record that `path` was read in `session` just now.
    pub fn record_read(&self, session: &str, path: &Path) {
        let key = (session.to_string(), path.to_path_buf());
        let signature = StatSignature::of(path);
        let mut records = self.records.lock().expect("tracker lock poisoned");
        records
            .entry(key)
            .and_modify(|r| r.signature = signature)
            .or_insert(FileAccessRecord { first_read: Utc::now(), signature });
    }

    pub fn has_file_been_read(&self, session: &str, path: &Path) -> bool {
        let key = (session.to_string(), path.to_path_buf());
        self.records.lock().expect("tracker lock poisoned").contains_key(&key)
    }

    /// First-read timestamp, when known.
    pub fn first_read_at(&self, session: &str, path: &Path) -> Option<DateTime<Utc>> {
        let key = (session.to_string(), path.to_path_buf());
        self.records
            .lock()
            .expect("tracker lock poisoned")
            .get(&key)
            .map(|r| r.first_read)
    }

    /// Compare the current stat signature against the one captured at the
    /// last read.
    pub fn check_file_modification(&self, session: &str, path: &Path) -> Modification {
        let key = (session.to_string(), path.to_path_buf());
        let recorded = {
            let records = self.records.lock().expect("tracker lock poisoned");
            records.get(&key).and_then(|r| r.signature)
        };

        let Some(recorded) = recorded else {
            return Modification {
                modified: false,
                message: format!("{} has not been read in this session", path.display()),
            };
        };

        match StatSignature::of(path) {
            Some(current) if current != recorded => Modification {
                modified: true,
                message: format!(
                    "{} changed on disk after it was last read",
                    path.display()
                ),
            },
            Some(_) => Modification { modified: false, message: String::new() },
            None => Modification {
                modified: true,
                message: format!("{} no longer exists on disk", path.display()),
            },
        }
    }

    /// Warnings an edit tool should attach before writing `path`.
    pub fn edit_warnings(&self, session: &str, path: &Path) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.has_file_been_read(session, path) {
            if path.exists() {
                warnings.push(format!(
                    "warning: {} was not read in this session before editing",
                    path.display()
                ));
            }
        } else {
            let m = self.check_file_modification(session, path);
            if m.modified {
                warnings.push(format!("warning: {}", m.message));
            }
        }
        warnings
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
