//! Crash-consistent session persistence. Checkpoints are whole-state JSON
//! documents written atomically (temp file + rename) with a companion
//! `.sha256` artifact; a reader that finds a checksum mismatch warns and
//! proceeds with the payload it has.
//!
//! Store layout under the session root:
//!
//! ```text
//! <root>/active.lock
//! <root>/sessions/<session-id>/checkpoint.json
//! <root>/sessions/<session-id>/checkpoint.sha256
//! <root>/archived/<session-id>/...
//! <root>/consolidated.json
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use paperfuse_core::{Paper, PaperId};

use crate::error::{EngineError, Result};

pub const CHECKPOINT_VERSION: u32 = 1;

const CHECKPOINT_FILE: &str = "checkpoint.json";
const CHECKSUM_FILE: &str = "checkpoint.sha256";
const LOCK_FILE: &str = "active.lock";
const OUTPUT_FILE: &str = "consolidated.json";

/// Which papers a source has already handled, and whether it ran out of work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProgress {
    /// Papers with a definitive outcome at this source (enriched, confirmed
    /// absent, or permanently failed). Transient failures stay out so a
    /// resumed run retries them.
    pub processed: BTreeSet<PaperId>,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    pub version: u32,
    pub session_id: String,
    /// Hash of the input paper set; a session only resumes against the same
    /// input.
    pub input_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub last_checkpoint_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "deserialize_sources")]
    pub sources: BTreeMap<String, SourceProgress>,
    pub papers: Vec<Paper>,
    #[serde(default)]
    pub permanent_failures: BTreeMap<String, BTreeSet<PaperId>>,
}

impl SessionCheckpoint {
    pub fn new(session_id: String, input_fingerprint: String, papers: Vec<Paper>) -> Self {
        let now = Utc::now();
        Self {
            version: CHECKPOINT_VERSION,
            session_id,
            input_fingerprint,
            created_at: now,
            last_checkpoint_at: now,
            sources: BTreeMap::new(),
            papers,
            permanent_failures: BTreeMap::new(),
        }
    }

    pub fn progress(&mut self, source: &str) -> &mut SourceProgress {
        self.sources.entry(source.to_string()).or_default()
    }
}

/// Checkpoints written by earlier builds carried the source list in other
/// shapes (a bare array of names, or string values). Anything that does not
/// decode as a progress map degrades to empty progress, which only costs
/// re-fetching.
fn deserialize_sources<'de, D>(d: D) -> std::result::Result<BTreeMap<String, SourceProgress>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(d)?;
    Ok(normalize_sources(&value))
}

fn normalize_sources(value: &Value) -> BTreeMap<String, SourceProgress> {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(name, progress)| {
                let decoded = serde_json::from_value::<SourceProgress>(progress.clone())
                    .unwrap_or_else(|_| {
                        warn!(source = %name, "unrecognized source progress shape, resetting");
                        SourceProgress::default()
                    });
                (name.clone(), decoded)
            })
            .collect(),
        Value::Array(entries) => entries
            .iter()
            .filter_map(Value::as_str)
            .map(|name| (name.to_string(), SourceProgress::default()))
            .collect(),
        Value::Null => BTreeMap::new(),
        other => {
            warn!(shape = %other, "unrecognized sources field, resetting all progress");
            BTreeMap::new()
        }
    }
}

/// Hash of the input set: resume is only offered for a byte-identical list
/// of paper ids and titles.
pub fn input_fingerprint(papers: &[Paper]) -> String {
    let mut hasher = Sha256::new();
    for paper in papers {
        hasher.update(paper.id.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(paper.title.as_bytes());
        hasher.update([b'\n']);
    }
    hex::encode(hasher.finalize())
}

pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join("sessions").join(session_id)
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Claim the store for this run. Fails when another run holds it.
    pub fn acquire_lock(&self, session_id: &str) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let path = self.lock_path();
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {
                fs::write(&path, session_id)?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(EngineError::SessionLocked(path))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Claim the store while resuming. A leftover lock from the session being
    /// resumed is expected after a crash; a lock naming any other session
    /// belongs to a live run and is left alone.
    pub fn take_over_lock(&self, session_id: &str) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let path = self.lock_path();
        match fs::read_to_string(&path) {
            Ok(owner) if owner.trim() == session_id => Ok(()),
            Ok(_) => Err(EngineError::SessionLocked(path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::write(&path, session_id)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn release_lock(&self) {
        let _ = fs::remove_file(self.lock_path());
    }

    /// Write a checkpoint atomically, then refresh the companion checksum.
    pub fn save(&self, checkpoint: &SessionCheckpoint) -> Result<()> {
        let dir = self.session_dir(&checkpoint.session_id);
        fs::create_dir_all(&dir)?;

        let bytes = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| EngineError::Checkpoint(e.to_string()))?;
        let checksum = hex::encode(Sha256::digest(&bytes));

        atomic_write(&dir.join(CHECKPOINT_FILE), &bytes)?;
        atomic_write(&dir.join(CHECKSUM_FILE), checksum.as_bytes())?;
        Ok(())
    }

    /// Load a session checkpoint. A missing or mismatched checksum is logged
    /// and tolerated; an unreadable payload or unknown schema version is not.
    pub fn load(&self, session_id: &str) -> Result<SessionCheckpoint> {
        let dir = self.session_dir(session_id);
        let bytes = fs::read(dir.join(CHECKPOINT_FILE))?;

        match fs::read_to_string(dir.join(CHECKSUM_FILE)) {
            Ok(expected) => {
                let actual = hex::encode(Sha256::digest(&bytes));
                if expected.trim() != actual {
                    warn!(session = session_id, "checkpoint checksum mismatch, loading anyway");
                }
            }
            Err(_) => {
                warn!(session = session_id, "checkpoint checksum file missing, loading anyway");
            }
        }

        let checkpoint: SessionCheckpoint = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Checkpoint(format!("unreadable checkpoint: {e}")))?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(EngineError::Checkpoint(format!(
                "unsupported checkpoint version {}",
                checkpoint.version
            )));
        }
        Ok(checkpoint)
    }

    /// Most recent unarchived session matching the fingerprint, if any.
    /// Unreadable sessions are skipped with a warning.
    pub fn latest_resumable(&self, fingerprint: &str) -> Result<Option<SessionCheckpoint>> {
        let sessions_dir = self.root.join("sessions");
        if !sessions_dir.exists() {
            return Ok(None);
        }

        let mut best: Option<SessionCheckpoint> = None;
        for entry in fs::read_dir(&sessions_dir)? {
            let entry = entry?;
            let Some(session_id) = entry.file_name().to_str().map(ToOwned::to_owned) else {
                continue;
            };
            match self.load(&session_id) {
                Ok(checkpoint) if checkpoint.input_fingerprint == fingerprint => {
                    let newer = best
                        .as_ref()
                        .is_none_or(|b| checkpoint.last_checkpoint_at > b.last_checkpoint_at);
                    if newer {
                        best = Some(checkpoint);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(session = %session_id, error = %e, "skipping unreadable session");
                }
            }
        }
        Ok(best)
    }

    /// Move a finished session out of the resumable set and drop the lock.
    pub fn archive(&self, session_id: &str) -> Result<()> {
        let archived_dir = self.root.join("archived");
        fs::create_dir_all(&archived_dir)?;
        fs::rename(
            self.session_dir(session_id),
            archived_dir.join(session_id),
        )?;
        self.release_lock();
        info!(session = session_id, "session archived");
        Ok(())
    }

    /// Write the consolidated paper set. Same atomic discipline as
    /// checkpoints.
    pub fn write_output(&self, papers: &[Paper]) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)?;
        let bytes = serde_json::to_vec_pretty(papers)
            .map_err(|e| EngineError::Checkpoint(e.to_string()))?;
        let path = self.root.join(OUTPUT_FILE);
        atomic_write(&path, &bytes)?;
        Ok(path)
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
