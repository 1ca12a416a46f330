//! Stage checkpoint store.
//!
//! Each successful stage writes one [`StageRecord`] keyed by run id, stage
//! and the SHA-256 fingerprint of the inputs the stage actually consumed.
//! A lookup only hits when all three match, so changing any upstream input
//! silently turns the cached record into a miss and the stage runs again.
//! Old records stay next to new ones; nothing is ever deleted.
//!
//! ## On-disk layout ([`FileCheckpointStore`])
//!
//! ```text
//! {root}/
//! └── {run_id}/
//!     ├── scrape/
//!     │   └── {fingerprint}.json
//!     ├── describe/
//!     └── ...
//! ```
//!
//! Records are written to `{fingerprint}.json.tmp` and renamed into place so
//! a crash mid-write never leaves a truncated record behind.

use crate::error::PipelineError;
use crate::model::{RunId, Stage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

// ── Fingerprints ─────────────────────────────────────────────────────────

/// Hex SHA-256 over a stage's named inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn builder(stage: Stage) -> FingerprintBuilder {
        let mut hasher = Sha256::new();
        hasher.update(b"product2mesh/v1\0");
        hasher.update(stage.as_str().as_bytes());
        hasher.update([0u8]);
        FingerprintBuilder { hasher }
    }

    /// Wrap an existing hex digest (e.g. a file stem read back from disk).
    pub fn from_hex(hex: impl Into<String>) -> Option<Self> {
        let hex = hex.into();
        (hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit())).then_some(Self(hex))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for logs.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Accumulates named inputs into a [`Fingerprint`].
///
/// Each field is hashed as `len(name) name len(json) json`, where `json` is
/// written with object keys sorted at every depth. Map insertion order and
/// field concatenation therefore cannot change or collide a fingerprint.
pub struct FingerprintBuilder {
    hasher: Sha256,
}

impl FingerprintBuilder {
    pub fn field<T: Serialize + ?Sized>(mut self, name: &str, value: &T) -> Result<Self, PipelineError> {
        let canonical = serde_json::to_value(value)
            .and_then(|v| {
                let mut buf = Vec::new();
                write_canonical(&v, &mut buf)?;
                Ok(buf)
            })
            .map_err(|e| PipelineError::Internal(format!("cannot fingerprint '{}': {}", name, e)))?;
        self.hasher.update((name.len() as u64).to_le_bytes());
        self.hasher.update(name.as_bytes());
        self.hasher.update((canonical.len() as u64).to_le_bytes());
        self.hasher.update(&canonical);
        Ok(self)
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(format!("{:x}", self.hasher.finalize()))
    }
}

/// Compact JSON with object keys in byte order, independent of how the
/// map was built.
fn write_canonical(value: &Value, out: &mut Vec<u8>) -> Result<(), serde_json::Error> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push(b'{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_canonical(item, out)?;
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        scalar => serde_json::to_writer(&mut *out, scalar)?,
    }
    Ok(())
}

// ── Records ──────────────────────────────────────────────────────────────

/// Persisted output of one successful stage execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub run_id: RunId,
    pub stage: Stage,
    pub input_fingerprint: Fingerprint,
    pub output_payload: Value,
    pub completed_at: DateTime<Utc>,
}

impl StageRecord {
    pub fn new(run_id: RunId, stage: Stage, input_fingerprint: Fingerprint, output_payload: Value) -> Self {
        Self {
            run_id,
            stage,
            input_fingerprint,
            output_payload,
            completed_at: Utc::now(),
        }
    }
}

/// Durable stage-output storage.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The record for `(run_id, stage)` whose fingerprint equals `fingerprint`.
    async fn get(
        &self,
        run_id: &RunId,
        stage: Stage,
        fingerprint: &Fingerprint,
    ) -> Result<Option<StageRecord>, PipelineError>;

    /// Store a stage output. Identical payloads are a no-op returning the
    /// existing record; a differing payload replaces it with a warning.
    async fn put(
        &self,
        run_id: &RunId,
        stage: Stage,
        fingerprint: &Fingerprint,
        payload: Value,
    ) -> Result<StageRecord, PipelineError>;

    /// Every record stored for `(run_id, stage)`, oldest first.
    async fn history(&self, run_id: &RunId, stage: Stage) -> Result<Vec<StageRecord>, PipelineError>;
}

fn resolve_existing(existing: StageRecord, payload: Value, fingerprint: &Fingerprint) -> Result<StageRecord, StageRecord> {
    if existing.output_payload == payload {
        debug!(
            "{}/{}: identical payload already stored for {}",
            existing.run_id,
            existing.stage,
            fingerprint.short()
        );
        Ok(existing)
    } else {
        warn!(
            "{}/{}: payload for fingerprint {} differs from the stored record; overwriting",
            existing.run_id,
            existing.stage,
            fingerprint.short()
        );
        Err(StageRecord::new(existing.run_id, existing.stage, fingerprint.clone(), payload))
    }
}

// ── File store ───────────────────────────────────────────────────────────

/// Checkpoints as JSON files under a root directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stage_dir(&self, run_id: &RunId, stage: Stage) -> PathBuf {
        self.root.join(run_id.as_str()).join(stage.as_str())
    }

    fn record_path(&self, run_id: &RunId, stage: Stage, fingerprint: &Fingerprint) -> PathBuf {
        self.stage_dir(run_id, stage)
            .join(format!("{}.json", fingerprint.as_str()))
    }

    async fn read_record(path: &Path) -> Result<Option<StageRecord>, PipelineError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PipelineError::Checkpoint(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            PipelineError::Checkpoint(format!("corrupt record {}: {}", path.display(), e))
        })
    }

    async fn write_record(&self, record: &StageRecord) -> Result<(), PipelineError> {
        let path = self.record_path(&record.run_id, record.stage, &record.input_fingerprint);
        let io_err = |e: std::io::Error| {
            PipelineError::Checkpoint(format!("cannot write {}: {}", path.display(), e))
        };

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
        }
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| PipelineError::Internal(format!("cannot serialise record: {}", e)))?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;
        Ok(())
    }

    /// Run ids that have at least one stage directory, sorted.
    pub async fn runs(&self) -> Result<Vec<RunId>, PipelineError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PipelineError::Checkpoint(e.to_string())),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PipelineError::Checkpoint(e.to_string()))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(|n| RunId::new(n).ok()) {
                runs.push(id);
            }
        }
        runs.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(runs)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(
        &self,
        run_id: &RunId,
        stage: Stage,
        fingerprint: &Fingerprint,
    ) -> Result<Option<StageRecord>, PipelineError> {
        let path = self.record_path(run_id, stage, fingerprint);
        let record = Self::read_record(&path).await?;
        // Guard against a record copied under the wrong name.
        Ok(record.filter(|r| r.input_fingerprint == *fingerprint && r.stage == stage))
    }

    async fn put(
        &self,
        run_id: &RunId,
        stage: Stage,
        fingerprint: &Fingerprint,
        payload: Value,
    ) -> Result<StageRecord, PipelineError> {
        let record = match self.get(run_id, stage, fingerprint).await? {
            Some(existing) => match resolve_existing(existing, payload, fingerprint) {
                Ok(same) => return Ok(same),
                Err(replacement) => replacement,
            },
            None => StageRecord::new(run_id.clone(), stage, fingerprint.clone(), payload),
        };
        self.write_record(&record).await?;
        debug!("{}/{}: checkpoint {} written", run_id, stage, fingerprint.short());
        Ok(record)
    }

    async fn history(&self, run_id: &RunId, stage: Stage) -> Result<Vec<StageRecord>, PipelineError> {
        let dir = self.stage_dir(run_id, stage);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PipelineError::Checkpoint(e.to_string())),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PipelineError::Checkpoint(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(r)) => records.push(r),
                Ok(None) => {}
                Err(e) => warn!("skipping unreadable checkpoint: {}", e),
            }
        }
        records.sort_by_key(|r| r.completed_at);
        Ok(records)
    }
}

// ── Memory store ─────────────────────────────────────────────────────────

type MemoryKey = (RunId, Stage, Fingerprint);

/// In-process store with the same semantics as [`FileCheckpointStore`].
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<HashMap<MemoryKey, StageRecord>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<MemoryKey, StageRecord>>, PipelineError> {
        self.records
            .lock()
            .map_err(|_| PipelineError::Checkpoint("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(
        &self,
        run_id: &RunId,
        stage: Stage,
        fingerprint: &Fingerprint,
    ) -> Result<Option<StageRecord>, PipelineError> {
        let records = self.lock()?;
        Ok(records
            .get(&(run_id.clone(), stage, fingerprint.clone()))
            .cloned())
    }

    async fn put(
        &self,
        run_id: &RunId,
        stage: Stage,
        fingerprint: &Fingerprint,
        payload: Value,
    ) -> Result<StageRecord, PipelineError> {
        let mut records = self.lock()?;
        let key = (run_id.clone(), stage, fingerprint.clone());
        let record = match records.get(&key).cloned() {
            Some(existing) => match resolve_existing(existing, payload, fingerprint) {
                Ok(same) => return Ok(same),
                Err(replacement) => replacement,
            },
            None => StageRecord::new(run_id.clone(), stage, fingerprint.clone(), payload),
        };
        records.insert(key, record.clone());
        Ok(record)
    }

    async fn history(&self, run_id: &RunId, stage: Stage) -> Result<Vec<StageRecord>, PipelineError> {
        let records = self.lock()?;
        let mut out: Vec<StageRecord> = records
            .values()
            .filter(|r| &r.run_id == run_id && r.stage == stage)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.completed_at);
        Ok(out)
    }
}
