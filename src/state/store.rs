//! Lock-bracketed persistence for the workflow document.
//!
//! Every read and write acquires the cross-process lock, performs its file
//! operation, and releases. Writes go through a temp-file-and-rename so a
//! crash mid-write never leaves a torn document, and each persisting write
//! first snapshots the previous document into the backup directory, throttled
//! to one snapshot per backup interval with the oldest pruned past retention.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{BackupSettings, Config};
use crate::errors::StateError;
use crate::lock::LockCoordinator;
use crate::phase::PhasePlan;
use crate::state::document::{StateUpdate, WorkflowDocument};

const BACKUP_PREFIX: &str = "workflow-";
const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Persisted, lock-coordinated access to the workflow document.
#[derive(Debug)]
pub struct PersistedStateStore {
    state_file: PathBuf,
    backup_dir: PathBuf,
    coordinator: LockCoordinator,
    backup: BackupSettings,
    plan: PhasePlan,
}

impl PersistedStateStore {
    pub fn new(config: &Config) -> Self {
        Self {
            state_file: config.state_file.clone(),
            backup_dir: config.backup_dir.clone(),
            coordinator: LockCoordinator::new(config.lock_file.clone(), config.lock.clone()),
            backup: config.backup.clone(),
            plan: config.plan.clone(),
        }
    }

    /// Read the document under the lock, triggering a throttled backup.
    ///
    /// A missing or unreadable document self-heals: a well-formed default is
    /// synthesized, persisted, and returned, so readers always observe a
    /// valid document.
    pub async fn read(&self) -> Result<WorkflowDocument, StateError> {
        let guard = self.coordinator.acquire().await?;
        if self.state_file.exists() {
            // Backup failure on the read path degrades to a log line
            if let Err(e) = self.snapshot_current(false) {
                warn!(error = %e, "backup skipped during read");
            }
        }
        let doc = self.read_or_heal();
        guard.release()?;
        doc
    }

    /// Replace the document under the lock.
    ///
    /// Snapshots the previous document first (throttled), then writes the
    /// new one atomically.
    pub async fn write(&self, doc: &WorkflowDocument) -> Result<(), StateError> {
        let guard = self.coordinator.acquire().await?;
        let result = self.backup_then_write(doc);
        guard.release()?;
        result
    }

    /// Read-modify-write under a single lock acquisition.
    ///
    /// Holding the lock across the whole cycle means no other process can
    /// interleave between the read and the write.
    pub async fn update(&self, update: StateUpdate) -> Result<WorkflowDocument, StateError> {
        let guard = self.coordinator.acquire().await?;
        let result = self.read_or_heal().and_then(|mut doc| {
            doc.apply(update);
            self.backup_then_write(&doc)?;
            Ok(doc)
        });
        guard.release()?;
        result
    }

    /// Validate the on-disk document without healing it.
    pub async fn validate(&self) -> Result<(), StateError> {
        let guard = self.coordinator.acquire().await?;
        let result = (|| {
            let content =
                fs::read_to_string(&self.state_file).map_err(|e| StateError::ReadFailed {
                    path: self.state_file.clone(),
                    source: e,
                })?;
            let raw: serde_json::Value =
                serde_json::from_str(&content).map_err(StateError::Serialize)?;
            WorkflowDocument::validate_raw(&raw)
        })();
        guard.release()?;
        result
    }

    /// Snapshot the current document on demand, honoring the throttle.
    ///
    /// Returns the snapshot name, or None when the throttle suppressed it.
    pub async fn create_backup(&self) -> Result<Option<String>, StateError> {
        let guard = self.coordinator.acquire().await?;
        let result = if self.state_file.exists() {
            self.snapshot_current(false)
        } else {
            Ok(None)
        };
        guard.release()?;
        result
    }

    /// List backup snapshot names, newest first.
    pub fn list_backups(&self) -> Result<Vec<String>, StateError> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => {
                return Err(StateError::ReadFailed {
                    path: self.backup_dir.clone(),
                    source: e,
                });
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if backup_timestamp(&name).is_some() {
                names.push(name);
            }
        }
        names.sort();
        names.reverse();
        Ok(names)
    }

    /// Restore a named backup snapshot as the current document.
    ///
    /// The document being replaced is snapshotted first, unthrottled, so a
    /// bad restore can itself be undone.
    pub async fn restore_backup(&self, name: &str) -> Result<WorkflowDocument, StateError> {
        let source = self.backup_dir.join(name);
        if backup_timestamp(name).is_none() || !source.exists() {
            return Err(StateError::UnknownBackup {
                name: name.to_string(),
            });
        }

        let guard = self.coordinator.acquire().await?;
        let result = (|| {
            let content = fs::read_to_string(&source).map_err(|e| StateError::ReadFailed {
                path: source.clone(),
                source: e,
            })?;
            let doc: WorkflowDocument =
                serde_json::from_str(&content).map_err(StateError::Serialize)?;

            if self.state_file.exists() {
                self.snapshot_current(true)?;
            }
            self.write_atomic(&doc)?;
            info!(backup = name, "restored workflow document from backup");
            Ok(doc)
        })();
        guard.release()?;
        result
    }

    fn read_or_heal(&self) -> Result<WorkflowDocument, StateError> {
        match fs::read_to_string(&self.state_file) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(doc) => Ok(doc),
                Err(e) => {
                    warn!(
                        path = %self.state_file.display(),
                        error = %e,
                        "workflow document is corrupt, synthesizing default"
                    );
                    self.heal()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.state_file.display(), "no workflow document, synthesizing default");
                self.heal()
            }
            Err(e) => Err(StateError::ReadFailed {
                path: self.state_file.clone(),
                source: e,
            }),
        }
    }

    fn heal(&self) -> Result<WorkflowDocument, StateError> {
        let first = self.plan.first().map(|p| p.name.as_str()).unwrap_or("");
        let next = self
            .plan
            .first()
            .and_then(|p| self.plan.next_after(&p.name))
            .map(|p| p.name.as_str());
        let doc = WorkflowDocument::synthesized(first, next);
        self.write_atomic(&doc)?;
        Ok(doc)
    }

    fn backup_then_write(&self, doc: &WorkflowDocument) -> Result<(), StateError> {
        if self.state_file.exists() {
            self.snapshot_current(false)?;
        }
        self.write_atomic(doc)
    }

    /// Copy the current document into the backup directory.
    ///
    /// Throttled: skipped when the newest existing snapshot is younger than
    /// the backup interval, unless `force` is set. Prunes oldest snapshots
    /// past the retention count.
    fn snapshot_current(&self, force: bool) -> Result<Option<String>, StateError> {
        let backups = self.list_backups()?;
        if !force {
            if let Some(newest) = backups.first().and_then(|n| backup_timestamp(n)) {
                let age = (Utc::now() - newest).num_seconds();
                if age >= 0 && (age as u64) < self.backup.interval_secs {
                    return Ok(None);
                }
            }
        }

        fs::create_dir_all(&self.backup_dir).map_err(|e| StateError::WriteFailed {
            path: self.backup_dir.clone(),
            source: e,
        })?;

        // Names have one-second granularity; a counter suffix keeps a
        // same-second snapshot from overwriting an earlier one
        let stamp = Utc::now().format(BACKUP_TIMESTAMP_FORMAT).to_string();
        let mut name = format!("{BACKUP_PREFIX}{stamp}.json");
        let mut counter = 1;
        while self.backup_dir.join(&name).exists() {
            name = format!("{BACKUP_PREFIX}{stamp}-{counter}.json");
            counter += 1;
        }
        let dest = self.backup_dir.join(&name);
        fs::copy(&self.state_file, &dest).map_err(|e| StateError::WriteFailed {
            path: dest.clone(),
            source: e,
        })?;
        debug!(backup = %name, "snapshotted workflow document");

        self.prune_backups()?;
        Ok(Some(name))
    }

    fn prune_backups(&self) -> Result<(), StateError> {
        let backups = self.list_backups()?;
        for stale in backups.iter().skip(self.backup.retention) {
            let path = self.backup_dir.join(stale);
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to prune old backup");
            }
        }
        Ok(())
    }

    /// Write via a sibling temp file and rename, so readers never observe a
    /// partially written document.
    fn write_atomic(&self, doc: &WorkflowDocument) -> Result<(), StateError> {
        let json = serde_json::to_string_pretty(doc).map_err(StateError::Serialize)?;

        if let Some(parent) = self.state_file.parent() {
            fs::create_dir_all(parent).map_err(|e| StateError::WriteFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let tmp = self.state_file.with_extension("json.tmp");
        let write = |path: &Path| -> std::io::Result<()> {
            let mut file = fs::File::create(path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()
        };
        write(&tmp).map_err(|e| StateError::WriteFailed {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &self.state_file).map_err(|e| StateError::WriteFailed {
            path: self.state_file.clone(),
            source: e,
        })?;
        Ok(())
    }
}

/// Parse the timestamp out of a snapshot name, accepting an optional
/// same-second counter suffix (`workflow-20260101-120000-2.json`).
fn backup_timestamp(name: &str) -> Option<DateTime<Utc>> {
    let stem = name.strip_prefix(BACKUP_PREFIX)?.strip_suffix(".json")?;
    // "%Y%m%d-%H%M%S" is always 15 bytes
    let (stamp, rest) = stem.split_at_checked(15)?;
    if !rest.is_empty() {
        let counter = rest.strip_prefix('-')?;
        if counter.is_empty() || !counter.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
    }
    NaiveDateTime::parse_from_str(stamp, BACKUP_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}
