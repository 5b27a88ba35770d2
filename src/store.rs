//! Flat-file persistence for the member registry, bot settings and pending
//! verification challenges.
//!
//! Loads never fail: a missing file yields the default value and a corrupt
//! file is logged and replaced by the default. Saves are synchronous, go
//! through a temp file plus rename, and report failure by logging only.
//! Every registry save also leaves an immutable timestamped snapshot next to
//! the canonical file.

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
    time::SystemTime,
};
use tracing::{debug, info, warn};

use crate::{
    config::SnapshotRetention, registry::UserRecord, settings::BotSettings,
    verification::PendingChallenge,
};

pub const USERS_FILE: &str = "user-data.json";
pub const SETTINGS_FILE: &str = "settings.json";
pub const PENDING_FILE: &str = "pending.json";
pub const SNAPSHOT_PREFIX: &str = "backup-user-data-";
pub const SNAPSHOT_SUFFIX: &str = ".json";
const TEMP_FILE_SUFFIX: &str = ".tmp";

pub struct Store {
    data_dir: PathBuf,
    retention: SnapshotRetention,
    write_lock: Mutex<()>,
}

impl Store {
    pub fn new(data_dir: impl Into<PathBuf>, retention: SnapshotRetention) -> Self {
        Self {
            data_dir: data_dir.into(),
            retention,
            write_lock: Mutex::new(()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    pub fn load_users(&self) -> BTreeMap<String, UserRecord> {
        load_json_or_default(&self.path(USERS_FILE))
    }

    pub fn load_settings(&self) -> BotSettings {
        load_json_or_default(&self.path(SETTINGS_FILE))
    }

    pub fn load_pending(&self) -> Vec<PendingChallenge> {
        load_json_or_default(&self.path(PENDING_FILE))
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Writes the canonical registry file plus a new snapshot. Returns the
    /// snapshot path, or `None` when anything failed (already logged).
    pub fn save_users(&self, users: &BTreeMap<String, UserRecord>) -> Option<PathBuf> {
        let _guard = self.lock();
        self.write_users(users)
    }

    /// Like [`Store::save_users`], but `collect` runs under the write lock so
    /// a save can never overwrite the file with an older view than the one a
    /// concurrent save already wrote.
    pub fn save_users_with(
        &self,
        collect: impl FnOnce() -> BTreeMap<String, UserRecord>,
    ) -> Option<PathBuf> {
        let _guard = self.lock();
        self.write_users(&collect())
    }

    fn write_users(&self, users: &BTreeMap<String, UserRecord>) -> Option<PathBuf> {
        let bytes = match serde_json::to_vec_pretty(users) {
            Ok(b) => b,
            Err(e) => {
                warn!("save_users serialize failed: {:?}", e);
                return None;
            }
        };
        if let Err(e) = write_atomic(&self.path(USERS_FILE), &bytes) {
            warn!("save_users write failed: {:?}", e);
            return None;
        }
        let snap = self.next_snapshot_path(Utc::now());
        if let Err(e) = std::fs::write(&snap, &bytes) {
            warn!("snapshot write failed: {}: {:?}", snap.display(), e);
            return None;
        }
        debug!("saved {} members, snapshot {}", users.len(), snap.display());
        if let Some(max) = self.retention.max_files {
            self.enforce_max_snapshots(max);
        }
        Some(snap)
    }

    pub fn save_settings(&self, settings: &BotSettings) -> bool {
        let _guard = self.lock();
        self.write_plain(SETTINGS_FILE, settings)
    }

    pub fn save_pending(&self, pending: &[PendingChallenge]) -> bool {
        let _guard = self.lock();
        self.write_plain(PENDING_FILE, pending)
    }

    /// Collects the pending challenges under the write lock, then saves them.
    pub fn save_pending_with(&self, collect: impl FnOnce() -> Vec<PendingChallenge>) -> bool {
        let _guard = self.lock();
        self.write_plain(PENDING_FILE, &collect())
    }

    fn write_plain<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> bool {
        let res = serde_json::to_vec_pretty(value)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| write_atomic(&self.path(name), &bytes));
        match res {
            Ok(()) => true,
            Err(e) => {
                warn!("save {} failed: {:?}", name, e);
                false
            }
        }
    }

    /// Saves within the same millisecond get a `_NNN` suffix, which sorts
    /// after the unsuffixed name.
    fn next_snapshot_path(&self, now: DateTime<Utc>) -> PathBuf {
        let stamp = snapshot_stamp(now);
        let mut p = self.path(&format!("{}{}{}", SNAPSHOT_PREFIX, stamp, SNAPSHOT_SUFFIX));
        let mut n = 1;
        while p.exists() {
            p = self.path(&format!(
                "{}{}_{:03}{}",
                SNAPSHOT_PREFIX, stamp, n, SNAPSHOT_SUFFIX
            ));
            n += 1;
        }
        p
    }

    /// Snapshot files, oldest first.
    pub fn list_snapshots(&self) -> Vec<PathBuf> {
        let mut out = list_snapshot_files(&self.data_dir, SNAPSHOT_PREFIX, SNAPSHOT_SUFFIX);
        out.sort();
        out
    }

    fn enforce_max_snapshots(&self, max: usize) {
        let files = self.list_snapshots();
        if files.len() <= max {
            return;
        }
        let excess = files.len() - max;
        for p in files.into_iter().take(excess) {
            if let Err(e) = std::fs::remove_file(&p) {
                warn!(
                    "snapshot cleanup (max_files) remove failed: {}: {:?}",
                    p.display(),
                    e
                );
            }
        }
    }

    /// Deletes snapshots older than the configured retention window. Returns
    /// how many files were removed.
    pub fn cleanup_snapshots_once(&self, now: DateTime<Utc>) -> usize {
        let Some(days) = self.retention.retention_days.filter(|d| *d > 0) else {
            return 0;
        };
        let keep = chrono::Duration::days(days);
        let mut removed = 0;
        for p in self.list_snapshots() {
            let Some(mt) = file_mtime_utc(&p) else { continue };
            if now - mt <= keep {
                continue;
            }
            match std::fs::remove_file(&p) {
                Ok(()) => removed += 1,
                Err(e) => warn!(
                    "snapshot cleanup (retention) remove failed: {}: {:?}",
                    p.display(),
                    e
                ),
            }
        }
        if removed > 0 {
            info!("snapshot cleanup removed {} files older than {} days", removed, days);
        }
        removed
    }

    pub fn retention(&self) -> &SnapshotRetention {
        &self.retention
    }
}

/// ISO-8601 timestamp with ':' and '.' replaced so it is safe in file names.
pub fn snapshot_stamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            warn!("read {} failed, using defaults: {:?}", path.display(), e);
            return T::default();
        }
    };
    match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            warn!("parse {} failed, using defaults: {:?}", path.display(), e);
            T::default()
        }
    }
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = PathBuf::from(format!("{}{}", path.display(), TEMP_FILE_SUFFIX));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn file_mtime_utc(p: &Path) -> Option<DateTime<Utc>> {
    let meta = std::fs::metadata(p).ok()?;
    let mt: SystemTime = meta.modified().ok()?;
    Some(DateTime::<Utc>::from(mt))
}

fn list_snapshot_files(data_dir: &Path, prefix: &str, suffix: &str) -> Vec<PathBuf> {
    let mut out = vec![];
    let rd = match std::fs::read_dir(data_dir) {
        Ok(r) => r,
        Err(_) => return out,
    };
    for ent in rd.flatten() {
        let p = ent.path();
        if !p.is_file() {
            continue;
        }
        let name = match p.file_name().and_then(|x| x.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if name.starts_with(prefix) && name.ends_with(suffix) {
            out.push(p);
        }
    }
    out
}
