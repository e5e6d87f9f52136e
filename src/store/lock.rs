//! Per-run-id write serialization.
//!
//! Checkpoint and artifact writes for a given run must be serialized so two
//! concurrent resume attempts cannot interleave and corrupt state. Two
//! layers, both keyed by run id:
//!
//! - an in-process `tokio::sync::Mutex` per run id, for tasks in this
//!   process
//! - an `fs2` advisory file lock on `<run_dir>/run.lock`, against a second
//!   conductor process touching the same data dir
//!
//! Different run ids never contend; they never touch the same keys.

use fs2::FileExt;
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::errors::{StoreError, WorkflowError};

/// Registry of per-run locks. Cheap to clone via `Arc` at the coordinator.
pub struct RunLocks {
    runs_dir: PathBuf,
    inner: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held for the duration of one run's execution (start or resume). Releases
/// both layers on drop.
#[derive(Debug)]
pub struct RunGuard {
    _task_guard: OwnedMutexGuard<()>,
    lock_file: File,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        // Advisory lock; failure to unlock only delays the next holder
        // until the fd closes.
        let _ = FileExt::unlock(&self.lock_file);
    }
}

impl RunLocks {
    pub fn new(runs_dir: PathBuf) -> Self {
        Self {
            runs_dir,
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn task_mutex(&self, run_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(run_id).or_default().clone()
    }

    fn lock_file(&self, run_id: Uuid) -> Result<File, StoreError> {
        let run_dir = self.runs_dir.join(run_id.to_string());
        let path = run_dir.join("run.lock");
        let unavailable = |source: std::io::Error| StoreError::Unavailable {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(&run_dir).map_err(unavailable)?;
        File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(unavailable)
    }

    /// Acquire the run's lock, refusing instead of queueing: a second
    /// executor on the same run id gets `LockBusy` immediately.
    pub fn try_acquire(&self, run_id: Uuid) -> Result<RunGuard, WorkflowError> {
        let task_guard = self
            .task_mutex(run_id)
            .try_lock_owned()
            .map_err(|_| WorkflowError::LockBusy {
                run_id: run_id.to_string(),
            })?;

        let lock_file = self.lock_file(run_id)?;
        lock_file.try_lock_exclusive().map_err(|_| WorkflowError::LockBusy {
            run_id: run_id.to_string(),
        })?;

        Ok(RunGuard {
            _task_guard: task_guard,
            lock_file,
        })
    }
}
