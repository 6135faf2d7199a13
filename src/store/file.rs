use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{Store, StoreState};
use crate::error::{StoreError, StoreResult};
use crate::model::{Feature, FeatureId, FeatureStatus, PipelineRun, Tenant, TenantId};

const STATE_FILE_NAME: &str = "state.json";
const LOCK_FILE_NAME: &str = "state.lock";

/// Store backed by a JSON snapshot on the local filesystem.
///
/// The snapshot file is the only copy of the state, so several processes
/// (a running scheduler and CLI edits) can share one state directory. Reads
/// load it under a shared lock on `state.lock`; mutations reload, apply and
/// rewrite it under an exclusive lock. Every rewrite goes through a temp
/// file and a rename, so a crash leaves either the previous or the new state
/// on disk.
///
/// Lock sections are short and never await.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileStore {
    /// Open (or create) the store under `state_dir`.
    pub fn open(state_dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = state_dir.as_ref();
        fs::create_dir_all(dir)?;
        let store = Self {
            path: dir.join(STATE_FILE_NAME),
            lock_path: dir.join(LOCK_FILE_NAME),
        };
        // Fail early on an unreadable snapshot.
        store.read(|_| ())?;
        Ok(store)
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self, exclusive: bool) -> StoreResult<File> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)?;
        let locked = if exclusive {
            file.lock()
        } else {
            file.lock_shared()
        };
        locked.map_err(|err| StoreError::Lock(format!("{}: {}", self.lock_path.display(), err)))?;
        // Released when the returned file is dropped.
        Ok(file)
    }

    fn load(&self) -> StoreResult<StoreState> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(StoreState::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn persist(&self, state: &StoreState) -> StoreResult<()> {
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state)?;
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn read<T>(&self, read: impl FnOnce(&StoreState) -> T) -> StoreResult<T> {
        let _guard = self.lock(false)?;
        let state = self.load()?;
        Ok(read(&state))
    }

    /// Apply `mutate` to the current on-disk state and persist the result.
    /// On failure nothing is written.
    fn mutate<T>(&self, mutate: impl FnOnce(&mut StoreState) -> StoreResult<T>) -> StoreResult<T> {
        let _guard = self.lock(true)?;
        let mut state = self.load()?;
        let value = mutate(&mut state)?;
        self.persist(&state)?;
        Ok(value)
    }
}

#[async_trait]
impl Store for FileStore {
    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>> {
        self.read(StoreState::list_tenants)
    }

    async fn upsert_tenant(&self, tenant: &Tenant) -> StoreResult<()> {
        self.mutate(|state| {
            state.upsert_tenant(tenant);
            Ok(())
        })
    }

    async fn list_features(
        &self,
        tenant: &TenantId,
        status: Option<FeatureStatus>,
    ) -> StoreResult<Vec<Feature>> {
        self.read(|state| state.list_features(tenant, status))
    }

    async fn get_feature(&self, id: &FeatureId) -> StoreResult<Option<Feature>> {
        self.read(|state| state.features.get(id).cloned())
    }

    async fn insert_feature(&self, feature: &Feature) -> StoreResult<()> {
        self.mutate(|state| state.insert_feature(feature))
    }

    async fn update_feature_status(
        &self,
        id: &FeatureId,
        status: FeatureStatus,
        reason: Option<String>,
    ) -> StoreResult<()> {
        self.mutate(|state| state.update_feature_status(id, status, reason))
    }

    async fn set_dependencies(&self, id: &FeatureId, depends_on: &[FeatureId]) -> StoreResult<()> {
        self.mutate(|state| state.set_dependencies(id, depends_on))
    }

    async fn set_pull_request(&self, id: &FeatureId, url: &str) -> StoreResult<()> {
        self.mutate(|state| state.set_pull_request(id, url))
    }

    async fn create_pipeline_run(&self, run: &PipelineRun) -> StoreResult<()> {
        self.mutate(|state| state.create_pipeline_run(run))
    }

    async fn update_pipeline_run(&self, run: &PipelineRun) -> StoreResult<()> {
        self.mutate(|state| state.update_pipeline_run(run))
    }

    async fn list_unfinished_pipeline_runs(&self) -> StoreResult<Vec<PipelineRun>> {
        self.read(StoreState::list_unfinished_pipeline_runs)
    }

    async fn list_pipeline_runs(&self, feature: &FeatureId) -> StoreResult<Vec<PipelineRun>> {
        self.read(|state| state.list_pipeline_runs(feature))
    }
}
