use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use thiserror::Error;

use crate::evidence::record::{EvidenceRecord, EvidenceRunMetadata};
use crate::model::{FeatureId, RunId, TenantId};

const EVIDENCE_DIR_NAME: &str = "evidence";
const RUNS_DIR_NAME: &str = "runs";
const MANIFEST_FILE_NAME: &str = "run.json";
const EVENTS_FILE_NAME: &str = "events.jsonl";

/// Errors that can occur during journal operations.
#[derive(Error, Debug)]
pub enum EvidenceError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid run ID")]
    InvalidRunId,

    /// A record was appended for a run that was never opened.
    #[error("Unknown run: {0}")]
    UnknownRun(RunId),
}

pub type EvidenceResult<T> = Result<T, EvidenceError>;

/// Run journal backed by the local filesystem.
#[derive(Debug, Clone)]
pub struct EvidenceStore {
    root_dir: PathBuf,
    retention_days: u64,
}

impl EvidenceStore {
    /// Create a journal under `<state_dir>/evidence` that keeps runs for
    /// `retention_days` (0 keeps them forever).
    pub fn new(state_dir: impl Into<PathBuf>, retention_days: u64) -> EvidenceResult<Self> {
        let root_dir = state_dir.into().join(EVIDENCE_DIR_NAME);
        fs::create_dir_all(root_dir.join(RUNS_DIR_NAME))?;
        Ok(Self {
            root_dir,
            retention_days,
        })
    }

    /// Create the run directory and manifest. Reopening an existing run
    /// (after a restart) keeps its manifest.
    pub fn open_run(
        &self,
        run_id: &RunId,
        feature: &FeatureId,
        tenant: &TenantId,
    ) -> EvidenceResult<EvidenceRunMetadata> {
        let run_dir = self.run_dir(run_id)?;
        fs::create_dir_all(&run_dir)?;
        if let Some(existing) = self.read_metadata(&run_dir.join(MANIFEST_FILE_NAME))? {
            return Ok(existing);
        }
        let metadata =
            EvidenceRunMetadata::new(run_id.clone(), feature.clone(), tenant.clone(), Utc::now());
        self.write_metadata(&run_dir, &metadata)?;
        Ok(metadata)
    }

    /// Append one record to an opened run.
    pub fn append_record(&self, record: &EvidenceRecord) -> EvidenceResult<()> {
        let run_dir = self.run_dir(&record.run_id)?;
        let Some(mut metadata) = self.read_metadata(&run_dir.join(MANIFEST_FILE_NAME))? else {
            return Err(EvidenceError::UnknownRun(record.run_id.clone()));
        };

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join(EVENTS_FILE_NAME))?;
        let json = serde_json::to_string(record)?;
        writeln!(file, "{}", json)?;
        file.sync_all()?;

        metadata.record(record.recorded_at);
        self.write_metadata(&run_dir, &metadata)
    }

    /// Mark a run complete with its final outcome.
    pub fn complete_run(&self, run_id: &RunId, outcome: &str) -> EvidenceResult<()> {
        let run_dir = self.run_dir(run_id)?;
        let Some(mut metadata) = self.read_metadata(&run_dir.join(MANIFEST_FILE_NAME))? else {
            return Err(EvidenceError::UnknownRun(run_id.clone()));
        };
        metadata.outcome = Some(outcome.to_string());
        metadata.updated_at = Utc::now();
        self.write_metadata(&run_dir, &metadata)
    }

    /// Every record of a run, in append order.
    pub fn read_records(&self, run_id: &RunId) -> EvidenceResult<Vec<EvidenceRecord>> {
        let path = self.run_dir(run_id)?.join(EVENTS_FILE_NAME);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    /// Manifests of all journaled runs, oldest first.
    pub fn list_runs(&self) -> EvidenceResult<Vec<EvidenceRunMetadata>> {
        let runs_dir = self.root_dir.join(RUNS_DIR_NAME);
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in fs::read_dir(&runs_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(metadata) = self.read_metadata(&entry.path().join(MANIFEST_FILE_NAME))? {
                runs.push(metadata);
            }
        }
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    /// Delete all records for a run.
    pub fn delete_run(&self, run_id: &RunId) -> EvidenceResult<()> {
        let run_dir = self.run_dir(run_id)?;
        match fs::remove_dir_all(&run_dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(EvidenceError::Io(err)),
        }
    }

    /// Delete completed runs older than the retention period. Runs still in
    /// progress are never pruned.
    pub fn enforce_retention(&self) -> EvidenceResult<usize> {
        if self.retention_days == 0 {
            return Ok(0);
        }

        let cutoff = Utc::now() - Duration::days(self.retention_days as i64);
        let mut deleted = 0;
        for metadata in self.list_runs()? {
            if metadata.is_complete() && metadata.created_at < cutoff {
                self.delete_run(&metadata.run_id)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn run_dir(&self, run_id: &RunId) -> EvidenceResult<PathBuf> {
        let id = run_id.as_str();
        if id.trim().is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(EvidenceError::InvalidRunId);
        }
        Ok(self.root_dir.join(RUNS_DIR_NAME).join(id))
    }

    fn read_metadata(&self, manifest_path: &Path) -> EvidenceResult<Option<EvidenceRunMetadata>> {
        match fs::read_to_string(manifest_path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(EvidenceError::Io(err)),
        }
    }

    fn write_metadata(&self, run_dir: &Path, metadata: &EvidenceRunMetadata) -> EvidenceResult<()> {
        let json = serde_json::to_string_pretty(metadata)?;
        let temp_path = run_dir.join(format!("{}.tmp", MANIFEST_FILE_NAME));
        let manifest_path = run_dir.join(MANIFEST_FILE_NAME);

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &manifest_path)?;
        Ok(())
    }
}
