//! Execution backend that runs each stage as a local OS process.
//!
//! The command for each stage comes from `WorkerCommands`. Launch
//! parameters are passed as environment variables and stdout is captured
//! as the unit's output.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ExecutionBackend, WorkerState};
use crate::config::WorkerCommands;
use crate::error::BackendError;
use crate::model::{LaunchParams, Stage, UnitHandle};

pub const ENV_FEATURE_ID: &str = "FORGELINE_FEATURE_ID";
pub const ENV_TENANT_ID: &str = "FORGELINE_TENANT_ID";
pub const ENV_STAGE: &str = "FORGELINE_STAGE";
pub const ENV_RUN_ID: &str = "FORGELINE_RUN_ID";
pub const ENV_FEEDBACK: &str = "FORGELINE_FEEDBACK";

struct Worker {
    child: Child,
    output: Arc<Mutex<String>>,
    reader: Option<JoinHandle<()>>,
}

/// Runs stage workers as child processes of the scheduler.
///
/// Workers do not outlive the backend: children are killed on drop, so a
/// restarted scheduler sees its previous handles as lost. A worker is
/// released once its exit has been reported or it has been stopped.
pub struct ProcessBackend {
    commands: WorkerCommands,
    workers: Mutex<HashMap<UnitHandle, Worker>>,
    next_id: AtomicU64,
}

impl ProcessBackend {
    pub fn new(commands: WorkerCommands) -> Self {
        Self {
            commands,
            workers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn handle_for(&self, stage: Stage, params: &LaunchParams) -> UnitHandle {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        UnitHandle::new(format!("proc-{}-{}-{}", params.feature, stage, n))
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    async fn start_worker(
        &self,
        stage: Stage,
        params: &LaunchParams,
    ) -> Result<UnitHandle, BackendError> {
        let argv = self
            .commands
            .for_stage(stage)
            .ok_or(BackendError::NotConfigured(stage))?;
        let (program, args) = argv
            .split_first()
            .ok_or(BackendError::NotConfigured(stage))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env(ENV_FEATURE_ID, params.feature.as_str())
            .env(ENV_TENANT_ID, params.tenant.as_str())
            .env(ENV_STAGE, stage.as_str())
            .env(ENV_RUN_ID, params.run_id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        match &params.feedback {
            Some(feedback) => {
                command.env(ENV_FEEDBACK, feedback);
            }
            None => {
                command.env_remove(ENV_FEEDBACK);
            }
        }
        if let Some(dir) = &self.commands.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| BackendError::Unavailable(format!("failed to spawn {}: {}", program, e)))?;

        let output = Arc::new(Mutex::new(String::new()));
        let reader = child.stdout.take().map(|mut stdout| {
            let output = output.clone();
            tokio::spawn(async move {
                let mut buf = String::new();
                if let Err(err) = stdout.read_to_string(&mut buf).await {
                    warn!("failed to read worker output: {}", err);
                }
                output.lock().await.push_str(&buf);
            })
        });

        let handle = self.handle_for(stage, params);
        info!(handle = %handle, pid = ?child.id(), program = %program, "worker process spawned");
        self.workers.lock().await.insert(
            handle.clone(),
            Worker {
                child,
                output,
                reader,
            },
        );
        Ok(handle)
    }

    async fn worker_status(&self, handle: &UnitHandle) -> Result<WorkerState, BackendError> {
        let mut workers = self.workers.lock().await;
        let Some(worker) = workers.get_mut(handle) else {
            return Ok(WorkerState::Lost);
        };
        let status = worker
            .child
            .try_wait()
            .map_err(|e| BackendError::Other(e.to_string()))?;
        let Some(status) = status else {
            return Ok(WorkerState::Running);
        };
        // Report the exit only once stdout has been fully read.
        if let Some(reader) = &worker.reader {
            if !reader.is_finished() {
                return Ok(WorkerState::Running);
            }
        }
        let output = worker.output.lock().await.trim().to_string();
        workers.remove(handle);
        let exit_code = status.code().unwrap_or(-1);
        debug!(handle = %handle, exit_code, "worker process exited");
        Ok(WorkerState::Exited {
            exit_code,
            output: if output.is_empty() { None } else { Some(output) },
        })
    }

    async fn stop_worker(&self, handle: &UnitHandle) -> Result<(), BackendError> {
        let mut workers = self.workers.lock().await;
        let Some(mut worker) = workers.remove(handle) else {
            return Ok(());
        };
        if worker
            .child
            .try_wait()
            .map_err(|e| BackendError::Other(e.to_string()))?
            .is_some()
        {
            return Ok(());
        }
        warn!(handle = %handle, pid = ?worker.child.id(), "killing worker process");
        worker
            .child
            .kill()
            .await
            .map_err(|e| BackendError::Other(format!("failed to kill worker: {}", e)))
    }
}
