// ABOUTME: Durable per-profile run status, the only state carried between runs
// ABOUTME: JSON records replaced atomically (temp file + fsync + rename) so crashes never leave torn files

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{SyncError, SyncResult};
use crate::sync::{ApplyCounts, SyncMode};
use crate::table::KeySet;

/// Version of the status record layout.
pub const STATUS_VERSION: u32 = 1;

/// Outcome of the most recent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOutcome {
    Success,
    /// A classified, anticipated failure
    Exception,
    /// An unanticipated failure or a broken invariant
    Error,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Success => f.write_str("SUCCESS"),
            RunOutcome::Exception => f.write_str("EXCEPTION"),
            RunOutcome::Error => f.write_str("ERROR"),
        }
    }
}

/// Bookkeeping for one profile, rewritten whole at the end of every run.
///
/// The `last_success_*` fields are the baseline the next incremental run
/// trusts; only a successful run may change them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub version: u32,
    pub profile: String,
    pub table: String,
    /// When the most recent run finished, successful or not
    pub last_attempt: DateTime<Utc>,
    pub last_status: Option<RunOutcome>,
    pub last_status_details: String,
    /// Incremental lookback anchor, in the clock of the replicated table
    pub last_successful_attempt: Option<NaiveDateTime>,
    pub last_success_dest_row_count: Option<u64>,
    /// Destination primary keys right after the last successful commit
    #[serde(default)]
    pub last_success_pks: KeySet,
    #[serde(default)]
    pub last_mode: Option<SyncMode>,
    #[serde(default)]
    pub last_counts: Option<ApplyCounts>,
}

impl RunStatus {
    /// Whether a successful run has ever been recorded for this profile.
    pub fn has_baseline(&self) -> bool {
        self.last_successful_attempt.is_some()
    }

    /// Multi-line description for operators.
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("Profile:                 {}", self.profile),
            format!("Table:                   {}", self.table),
            format!("Last attempt:            {}", self.last_attempt.to_rfc3339()),
            format!(
                "Last status:             {}",
                self.last_status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string())
            ),
            format!("Details:                 {}", self.last_status_details),
        ];
        match self.last_successful_attempt {
            Some(ts) => lines.push(format!("Last successful attempt: {}", ts)),
            None => lines.push("Last successful attempt: never".to_string()),
        }
        if let Some(count) = self.last_success_dest_row_count {
            lines.push(format!("Destination rows:        {}", count));
        }
        if let Some(mode) = self.last_mode {
            lines.push(format!("Last successful mode:    {}", mode));
        }
        lines.join("\n")
    }
}

/// File-backed store with one JSON record per profile.
///
/// Not lock-protected: concurrent runs of the same profile must be
/// serialized by the caller.
#[derive(Debug, Clone)]
pub struct StatusStore {
    dir: PathBuf,
}

impl StatusStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a profile's record. Profile names become file names, so path
    /// separators and relative components are refused.
    pub fn path_for(&self, profile: &str) -> SyncResult<PathBuf> {
        let valid = !profile.is_empty()
            && profile != "."
            && profile != ".."
            && profile
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(SyncError::configuration(format!(
                "profile name '{}' may only contain letters, digits, '-', '_' and '.'",
                profile
            )));
        }
        Ok(self.dir.join(format!("{}.status.json", profile)))
    }

    /// Load the previous status of a profile.
    ///
    /// Returns `None` when there is none. A record that cannot be parsed or
    /// has an unknown version is reported and also treated as absent, which
    /// forces the next run to be retroactive.
    pub fn load(&self, profile: &str) -> SyncResult<Option<RunStatus>> {
        let path = self.path_for(profile)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No previous run status for profile '{}'", profile);
                return Ok(None);
            }
            Err(e) => {
                return Err(SyncError::Status(
                    anyhow::Error::new(e)
                        .context(format!("Failed to read run status from {:?}", path)),
                ))
            }
        };

        let status: RunStatus = match serde_json::from_str(&contents) {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(
                    "Ignoring unreadable run status {:?}: {}. Treating profile as new.",
                    path,
                    e
                );
                return Ok(None);
            }
        };

        if status.version != STATUS_VERSION {
            tracing::warn!(
                "Ignoring run status {:?} with unsupported version {} (expected {})",
                path,
                status.version,
                STATUS_VERSION
            );
            return Ok(None);
        }

        tracing::debug!("Loaded run status from {:?}", path);
        Ok(Some(status))
    }

    /// Replace a profile's record atomically.
    ///
    /// The record is written to a temporary file in the same directory,
    /// synced, renamed over the old one, and the directory is synced so the
    /// rename itself is durable.
    pub fn save(&self, status: &RunStatus) -> SyncResult<()> {
        self.write_atomically(status).map_err(SyncError::Status)
    }

    fn write_atomically(&self, status: &RunStatus) -> anyhow::Result<()> {
        let path = self
            .path_for(&status.profile)
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create status directory {:?}", self.dir))?;

        let temp = tempfile::NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("Failed to create temporary file in {:?}", self.dir))?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer_pretty(&mut writer, status)
                .context("Failed to serialize run status")?;
            writer.flush().context("Failed to write run status")?;
        }
        temp.as_file()
            .sync_all()
            .context("Failed to sync run status to disk")?;
        temp.persist(&path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to move run status into place at {:?}", path))?;

        sync_directory(&self.dir)?;
        tracing::debug!("Saved run status to {:?}", path);
        Ok(())
    }
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> anyhow::Result<()> {
    fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .with_context(|| format!("Failed to sync status directory {:?}", dir))
}

// NTFS journals the rename; directories cannot be opened for fsync there.
#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> anyhow::Result<()> {
    Ok(())
}
