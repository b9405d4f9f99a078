//! Dead-letter persistence
//!
//! The queue is written as pretty JSON through a temp file in the same directory and an atomic
//! rename, under an advisory lock on a sibling `.lock` file.

use super::{DeadLetterEntry, DeadLetterError, Disposition};
use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

/// Current dead-letter file schema version
const SCHEMA_VERSION: &str = "1.0.0";

/// Maximum accepted dead-letter file size (10 MB)
pub const MAX_DEAD_LETTER_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// On-disk form of the dead-letter queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterFile {
    schema_version: String,
    saved_at: DateTime<Utc>,
    entries: Vec<DeadLetterEntry>,
}

impl DeadLetterFile {
    /// Snapshot of `entries`.
    pub fn new(entries: Vec<DeadLetterEntry>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            saved_at: Utc::now(),
            entries,
        }
    }

    /// Entries in the snapshot
    pub fn entries(&self) -> &[DeadLetterEntry] {
        &self.entries
    }

    /// Consume the snapshot.
    pub fn into_entries(self) -> Vec<DeadLetterEntry> {
        self.entries
    }

    /// Write atomically to `path`.
    pub fn save(&self, path: &Path) -> Result<(), DeadLetterError> {
        debug!(path = %path.display(), entries = self.entries.len(), "Saving dead-letter queue");

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| DeadLetterError::Io(e.to_string()))?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| DeadLetterError::Serialization(e.to_string()))?;

        let mut lock = RwLock::new(open_lock_file(path)?);
        let _guard = lock
            .write()
            .map_err(|e| DeadLetterError::Lock(format!("Failed to acquire write lock: {e}")))?;

        let parent_dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut temp_file = tempfile::NamedTempFile::new_in(parent_dir)
            .map_err(|e| DeadLetterError::Io(format!("Failed to create temp file: {e}")))?;
        temp_file
            .write_all(json.as_bytes())
            .map_err(|e| DeadLetterError::Io(format!("Failed to write temp file: {e}")))?;
        temp_file
            .flush()
            .map_err(|e| DeadLetterError::Io(format!("Failed to flush temp file: {e}")))?;
        temp_file
            .as_file()
            .sync_all()
            .map_err(|e| DeadLetterError::Io(format!("Failed to sync temp file: {e}")))?;
        temp_file
            .persist(path)
            .map_err(|e| DeadLetterError::Io(format!("Failed to persist temp file: {e}")))?;

        Ok(())
    }

    /// Load from `path`. A missing file is an empty queue.
    ///
    /// Entries that were still waiting for a recovery attempt are parked: a restarted process
    /// never resumes them automatically.
    pub fn load(path: &Path) -> Result<Self, DeadLetterError> {
        if !path.exists() {
            debug!(path = %path.display(), "No dead-letter file, starting empty");
            return Ok(Self::new(Vec::new()));
        }

        let lock = RwLock::new(open_lock_file(path)?);
        let _guard = lock
            .read()
            .map_err(|e| DeadLetterError::Lock(format!("Failed to acquire read lock: {e}")))?;

        let size = std::fs::metadata(path)
            .map_err(|e| DeadLetterError::Io(e.to_string()))?
            .len();
        if size > MAX_DEAD_LETTER_FILE_SIZE {
            return Err(DeadLetterError::TooLarge {
                size,
                max: MAX_DEAD_LETTER_FILE_SIZE,
            });
        }

        let contents =
            std::fs::read_to_string(path).map_err(|e| DeadLetterError::Io(e.to_string()))?;
        let mut file: DeadLetterFile = serde_json::from_str(&contents).map_err(|e| {
            warn!(error = %e, "Failed to deserialize dead-letter file");
            DeadLetterError::Deserialization(e.to_string())
        })?;

        if file.schema_version != SCHEMA_VERSION {
            return Err(DeadLetterError::SchemaMismatch {
                expected: SCHEMA_VERSION.to_string(),
                found: file.schema_version,
            });
        }

        let mut parked = 0;
        for entry in &mut file.entries {
            if entry.disposition == Disposition::RetriableExhausted {
                entry.park("process restarted before recovery finished");
                parked += 1;
            }
        }

        info!(
            path = %path.display(),
            entries = file.entries.len(),
            parked_on_load = parked,
            "Dead-letter queue loaded"
        );
        Ok(file)
    }
}

fn open_lock_file(path: &Path) -> Result<File, DeadLetterError> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path.with_extension("lock"))
        .map_err(|e| DeadLetterError::Lock(format!("Failed to open lock file: {e}")))
}
