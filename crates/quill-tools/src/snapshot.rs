// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Content-addressed per-session file backups.
//!
//! Before every successful edit the pre-edit bytes of the target file are
//! copied into `<state_dir>/file-history/<session_id>/<hash>@v<N>`, where
//! `hash` is a 16-hex fingerprint of the absolute path (path identity, not
//! content) and `N` increases monotonically per path.  A sidecar
//! `<hash>@v<N>.meta.json` records the owning message id and timestamp so
//! undo can target message boundaries.  Snapshots on disk outlive the
//! process; version counters are rebuilt from the directory on next use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// 16-hex fingerprint of an absolute path.
pub fn path_fingerprint(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Backup file name (`<hash>@v<N>`), empty when no backup was made.
    pub backup_name: String,
    /// Version number; 0 means the source file did not exist at edit time.
    pub version: u32,
    pub original_path: PathBuf,
    pub message_id: String,
    pub created_at: DateTime<Utc>,
}

/// Per-session snapshot directory with LRU retention.
pub struct SnapshotStore {
    root: PathBuf,
    /// Snapshots retained per path; older versions are pruned after each
    /// successful backup.
    keep: usize,
    /// Highest version seen per path; lazily rebuilt from the directory.
    versions: Mutex<HashMap<String, u32>>,
}

impl SnapshotStore {
    /// Store rooted at `<state_dir>/file-history/<session_id>` — sessions
    /// never collide.
    pub fn for_session(state_dir: &Path, session_id: &str) -> Self {
        Self {
            root: state_dir.join("file-history").join(session_id),
            keep: 10,
            versions: Mutex::new(HashMap::new()),
        }
    }

    /// Override the per-path retention count (default 10).
    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = keep.max(1);
        self
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.root
    }

    /// Copy the current bytes of `path` into the next versioned backup.
    ///
    /// Soft-fails when the file does not exist: a zero-version meta is
    /// returned and no backup file is produced, so a later undo knows the
    /// file was created by the edit.
    pub fn create_snapshot(&self, path: &Path, message_id: &str) -> anyhow::Result<SnapshotMeta> {
        let abs = absolutise(path);
        let hash = path_fingerprint(&abs);

        if !abs.exists() {
            debug!(path = %abs.display(), "snapshot of nonexistent file; recording zero version");
            return Ok(SnapshotMeta {
                backup_name: String::new(),
                version: 0,
                original_path: abs,
                message_id: message_id.to_string(),
                created_at: Utc::now(),
            });
        }

        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("creating snapshot dir {}", self.root.display()))?;

        let version = self.next_version(&hash)?;
        let backup_name = format!("{hash}@v{version}");
        let backup_path = self.root.join(&backup_name);

        std::fs::copy(&abs, &backup_path)
            .with_context(|| format!("backing up {} to {}", abs.display(), backup_path.display()))?;

        let meta = SnapshotMeta {
            backup_name: backup_name.clone(),
            version,
            original_path: abs,
            message_id: message_id.to_string(),
            created_at: Utc::now(),
        };
        let meta_path = self.root.join(format!("{backup_name}.meta.json"));
        std::fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)
            .with_context(|| format!("writing {}", meta_path.display()))?;

        // Retention is enforced on every backup so the per-path count
        // never exceeds the configured limit, even across restarts.
        if let Err(e) = self.cleanup(self.keep) {
            warn!("snapshot retention pass failed: {e:#}");
        }

        debug!(backup = %backup_name, message_id, "snapshot created");
        Ok(meta)
    }

    /// All snapshots of `path`, ascending by version.
    pub fn list_snapshots(&self, path: &Path) -> anyhow::Result<Vec<SnapshotMeta>> {
        let abs = absolutise(path);
        let hash = path_fingerprint(&abs);
        let mut out = Vec::new();

        let entries = match std::fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(_) => return Ok(out),
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(version) = parse_backup_name(&name, &hash) else {
                continue;
            };
            let meta_path = self.root.join(format!("{name}.meta.json"));
            let meta = std::fs::read_to_string(&meta_path)
                .ok()
                .and_then(|t| serde_json::from_str::<SnapshotMeta>(&t).ok())
                .unwrap_or_else(|| SnapshotMeta {
                    backup_name: name.clone(),
                    version,
                    original_path: abs.clone(),
                    message_id: String::new(),
                    created_at: entry
                        .metadata()
                        .and_then(|m| m.modified())
                        .map(DateTime::<Utc>::from)
                        .unwrap_or_else(|_| Utc::now()),
                });
            out.push(meta);
        }

        out.sort_by_key(|m| m.version);
        Ok(out)
    }

    /// Overwrite the live file with the snapshot owned by `message_id`,
    /// atomically (write-temp-then-rename).
    pub fn restore_snapshot(&self, path: &Path, message_id: &str) -> anyhow::Result<()> {
        let abs = absolutise(path);
        let snapshots = self.list_snapshots(&abs)?;
        let Some(meta) = snapshots.iter().rev().find(|m| m.message_id == message_id) else {
            bail!(
                "no snapshot of {} for message {message_id}",
                abs.display()
            );
        };

        let backup_path = self.root.join(&meta.backup_name);
        let bytes = std::fs::read(&backup_path)
            .with_context(|| format!("reading backup {}", backup_path.display()))?;

        let tmp = abs.with_extension("quill-restore.tmp");
        std::fs::write(&tmp, &bytes).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &abs)
            .with_context(|| format!("renaming into {}", abs.display()))?;
        debug!(path = %abs.display(), version = meta.version, "snapshot restored");
        Ok(())
    }

    /// Keep the newest `keep_n` snapshots per path; delete the rest.
    /// Returns the number of backups removed.
    pub fn cleanup(&self, keep_n: usize) -> anyhow::Result<usize> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(_) => return Ok(0),
        };

        // Group versions by path hash.
        let mut by_hash: HashMap<String, Vec<u32>> = HashMap::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".meta.json") {
                continue;
            }
            if let Some((hash, version)) = split_backup_name(&name) {
                by_hash.entry(hash).or_default().push(version);
            }
        }

        let mut removed = 0;
        for (hash, mut versions) in by_hash {
            versions.sort_unstable();
            if versions.len() <= keep_n {
                continue;
            }
            let drop_count = versions.len() - keep_n;
            for version in versions.into_iter().take(drop_count) {
                let name = format!("{hash}@v{version}");
                for p in [self.root.join(&name), self.root.join(format!("{name}.meta.json"))] {
                    if let Err(e) = std::fs::remove_file(&p) {
                        if p.exists() {
                            warn!(path = %p.display(), "snapshot cleanup failed: {e}");
                        }
                    }
                }
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn next_version(&self, hash: &str) -> anyhow::Result<u32> {
        let mut versions = self.versions.lock().expect("snapshot lock poisoned");
        let current = match versions.get(hash) {
            Some(v) => *v,
            None => {
                // Rebuild from the directory — snapshots outlive the process.
                let mut max = 0u32;
                if let Ok(entries) = std::fs::read_dir(&self.root) {
                    for entry in entries.flatten() {
                        let name = entry.file_name().to_string_lossy().to_string();
                        if let Some(v) = parse_backup_name(&name, hash) {
                            max = max.max(v);
                        }
                    }
                }
                max
            }
        };
        let next = current + 1;
        versions.insert(hash.to_string(), next);
        Ok(next)
    }
}

fn absolutise(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")).join(path)
    }
}

/// Parse `<hash>@v<N>` for a known hash; rejects `.meta.json` sidecars.
fn parse_backup_name(name: &str, hash: &str) -> Option<u32> {
    if name.ends_with(".meta.json") {
        return None;
    }
    let rest = name.strip_prefix(hash)?;
    rest.strip_prefix("@v")?.parse().ok()
}

/// Split any `<hash>@v<N>` backup name into its parts.
fn split_backup_name(name: &str) -> Option<(String, u32)> {
    let (hash, rest) = name.split_once("@v")?;
    Some((hash.to_string(), rest.parse().ok()?))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
