//! Durable session state: which units are done, failed, or pending.
//!
//! One JSON document per input, at `<state_dir>/<input hash>.state.json`.
//! The file is plain pretty-printed JSON so an operator can inspect or
//! repair it by hand.
//!
//! ## Persistence model
//!
//! Mutations only touch the in-memory [`ProcessingSession`]; nothing reaches
//! disk until [`CheckpointStore::save`]. The orchestrator decides how often
//! to save. `save` writes a temporary file in the same directory, fsyncs it,
//! and renames it over the target, so a crash mid-write leaves the previous
//! state intact.
//!
//! ## Concurrency
//!
//! Workers share one `CheckpointStore`; every mutation runs under its
//! internal mutex, so no two workers ever update the session at once.

use crate::error::ExtractError;
use crate::output::SessionSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Suffix appended to the state file once every unit has completed.
pub const COMPLETED_SUFFIX: &str = ".completed";

/// Counters persisted with the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub records_extracted: u64,
    pub api_calls: u64,
    pub api_errors: u64,
    /// Highest `N` issued as a synthesized `unknown-N` key.
    #[serde(default)]
    pub unknown_keys_generated: u64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Progress of one input through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingSession {
    pub session_id: String,
    pub total_units: usize,
    pub completed_units: BTreeSet<usize>,
    pub failed_units: BTreeSet<usize>,
    /// Last error per unit.
    #[serde(default)]
    pub errors: BTreeMap<usize, String>,
    #[serde(default)]
    pub warnings: BTreeMap<usize, Vec<String>>,
    #[serde(default)]
    pub stats: SessionStats,
    #[serde(default)]
    pub config_fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingSession {
    pub fn new(total_units: usize, config_fingerprint: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            total_units,
            completed_units: BTreeSet::new(),
            failed_units: BTreeSet::new(),
            errors: BTreeMap::new(),
            warnings: BTreeMap::new(),
            stats: SessionStats::default(),
            config_fingerprint,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mark `unit` completed and forget its earlier error and warnings.
    ///
    /// A repeated call is a no-op, timestamp included.
    pub fn record_success(&mut self, unit: usize) {
        let changed = self.completed_units.insert(unit)
            | self.failed_units.remove(&unit)
            | self.errors.remove(&unit).is_some()
            | self.warnings.remove(&unit).is_some();
        if changed {
            self.touch();
        }
    }

    /// Mark `unit` failed, replacing any earlier error message.
    pub fn record_failure(&mut self, unit: usize, message: impl Into<String>) {
        self.completed_units.remove(&unit);
        self.failed_units.insert(unit);
        self.errors.insert(unit, message.into());
        self.touch();
    }

    pub fn add_warning(&mut self, unit: usize, warning: impl Into<String>) {
        self.warnings.entry(unit).or_default().push(warning.into());
        self.touch();
    }

    /// Smallest unit not yet completed. Failed units count as pending.
    pub fn next_pending_unit(&self) -> Option<usize> {
        (0..self.total_units).find(|unit| !self.completed_units.contains(unit))
    }

    pub fn is_complete(&self) -> bool {
        self.completed_units.len() >= self.total_units
    }

    pub fn summary(&self) -> SessionSummary {
        let completed = self.completed_units.len();
        let completion_percent = if self.total_units == 0 {
            0.0
        } else {
            completed as f64 * 100.0 / self.total_units as f64
        };
        SessionSummary {
            session_id: self.session_id.clone(),
            total_units: self.total_units,
            completed,
            failed: self.failed_units.len(),
            remaining: self.total_units.saturating_sub(completed),
            completion_percent,
            errors: self.errors.clone(),
            warnings: self.warnings.clone(),
            stats: self.stats,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Check the invariants a hand-edited file could break.
    fn validate(&self) -> Result<(), String> {
        if self.total_units == 0 {
            return Err("total_units must be at least 1".into());
        }
        if let Some(unit) = self.completed_units.intersection(&self.failed_units).next() {
            return Err(format!("unit {unit} is both completed and failed"));
        }
        if let Some(unit) = self
            .completed_units
            .iter()
            .chain(self.failed_units.iter())
            .find(|&&unit| unit >= self.total_units)
        {
            return Err(format!(
                "unit {unit} is out of range (total_units = {})",
                self.total_units
            ));
        }
        if self.updated_at < self.created_at {
            return Err("updated_at is earlier than created_at".into());
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now().max(self.updated_at);
    }
}

/// Shared, mutex-guarded session plus the file it persists to.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    session: Mutex<ProcessingSession>,
}

impl CheckpointStore {
    /// State file for the input identified by `input_hash`.
    pub fn state_path(state_dir: &Path, input_hash: &str) -> PathBuf {
        state_dir.join(format!("{input_hash}.state.json"))
    }

    /// Start a new session. Fails with [`ExtractError::SessionExists`] if a
    /// state file is already present; the caller chooses resume or discard.
    pub fn initialize(
        path: impl Into<PathBuf>,
        total_units: usize,
        config_fingerprint: Option<String>,
    ) -> Result<Self, ExtractError> {
        let path = path.into();
        if total_units == 0 {
            return Err(ExtractError::EmptySelection { total: 0 });
        }
        if path.exists() {
            let updated_at = Self::read_session(&path)
                .map(|s| s.updated_at.to_rfc3339())
                .unwrap_or_else(|_| "unknown".into());
            return Err(ExtractError::SessionExists { path, updated_at });
        }
        let session = ProcessingSession::new(total_units, config_fingerprint);
        info!(
            session = %session.session_id,
            total_units,
            path = %path.display(),
            "session initialized"
        );
        Ok(Self {
            path,
            session: Mutex::new(session),
        })
    }

    /// Load an existing session.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ExtractError> {
        let path = path.into();
        let session = Self::read_session(&path)?;
        info!(
            session = %session.session_id,
            completed = session.completed_units.len(),
            failed = session.failed_units.len(),
            total_units = session.total_units,
            "session loaded"
        );
        Ok(Self {
            path,
            session: Mutex::new(session),
        })
    }

    /// Read and validate a state file without taking ownership of it.
    pub fn read_session(path: &Path) -> Result<ProcessingSession, ExtractError> {
        let bytes = std::fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ExtractError::NoSession {
                path: path.to_path_buf(),
            },
            _ => ExtractError::CorruptState {
                path: path.to_path_buf(),
                detail: e.to_string(),
            },
        })?;
        let session: ProcessingSession =
            serde_json::from_slice(&bytes).map_err(|e| ExtractError::CorruptState {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        session
            .validate()
            .map_err(|detail| ExtractError::CorruptState {
                path: path.to_path_buf(),
                detail,
            })?;
        Ok(session)
    }

    /// True iff a loadable session exists with units still to complete.
    pub fn can_resume(path: &Path) -> bool {
        Self::read_session(path)
            .map(|s| s.completed_units.len() < s.total_units)
            .unwrap_or(false)
    }

    /// Delete an existing state file. A missing file is not an error.
    pub fn discard(path: &Path) -> Result<(), ExtractError> {
        match std::fs::remove_file(path) {
            Ok(()) => {
                info!(path = %path.display(), "discarded previous session");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ExtractError::StateWriteFailed {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically write the current session to disk.
    pub fn save(&self) -> Result<(), ExtractError> {
        let json = {
            let session = self.lock();
            serde_json::to_vec_pretty(&*session)
                .map_err(|e| ExtractError::Internal(format!("session serialization: {e}")))?
        };
        write_atomic(&self.path, &json).map_err(|source| ExtractError::StateWriteFailed {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), bytes = json.len(), "session saved");
        Ok(())
    }

    pub fn record_success(&self, unit: usize) {
        self.lock().record_success(unit);
    }

    pub fn record_failure(&self, unit: usize, message: impl Into<String>) {
        self.lock().record_failure(unit, message);
    }

    pub fn add_warning(&self, unit: usize, warning: impl Into<String>) {
        self.lock().add_warning(unit, warning);
    }

    /// Apply `f` to the persisted counters.
    pub fn update_stats(&self, f: impl FnOnce(&mut SessionStats)) {
        let mut session = self.lock();
        f(&mut session.stats);
        session.touch();
    }

    pub fn next_pending_unit(&self) -> Option<usize> {
        self.lock().next_pending_unit()
    }

    /// Copy of the current in-memory session.
    pub fn snapshot(&self) -> ProcessingSession {
        self.lock().clone()
    }

    /// Refuse to continue a session started under different settings.
    /// A session saved without a fingerprint is accepted.
    pub fn validate_fingerprint(&self, current: &str) -> Result<(), ExtractError> {
        match &self.lock().config_fingerprint {
            Some(saved) if saved != current => Err(ExtractError::ConfigMismatch {
                saved: saved.clone(),
                current: current.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Save, then move the state file aside as `<file>.completed`.
    pub fn finalize(self) -> Result<PathBuf, ExtractError> {
        self.save()?;
        let mut target = self.path.clone().into_os_string();
        target.push(COMPLETED_SUFFIX);
        let target = PathBuf::from(target);
        std::fs::rename(&self.path, &target).map_err(|source| {
            ExtractError::StateWriteFailed {
                path: target.clone(),
                source,
            }
        })?;
        info!(path = %target.display(), "session finalized");
        Ok(target)
    }

    fn lock(&self) -> MutexGuard<'_, ProcessingSession> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Write `bytes` to `path` via a synced temporary file in the same directory.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
