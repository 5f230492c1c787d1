//! Command-driven replicas
//!
//! Each replica is a temporary working directory. Applying a patch writes
//! its content to `patch` inside the directory; a replay runs the
//! configured command there with a cleared environment and reads the
//! workload metrics it prints as JSON on its last stdout line.
//!
//! The command sees only:
//!
//! | variable | value |
//! |---|---|
//! | `PATH` | inherited, so the command can be resolved |
//! | `HOMEOSTAT_SERVICE` | service under test |
//! | `HOMEOSTAT_REPLICA_DIR` | the replica directory |
//! | `HOMEOSTAT_REQUESTS` | requests to replay |
//! | `HOMEOSTAT_PATCH` | patch file path, empty before a patch is applied |

use crate::error::TwinError;
use crate::replica::{Replica, TwinProvisioner};
use homeostat_core::{Anomaly, Patch, TwinMetrics};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::process::Command;

/// Provisions directory-backed replicas driven by an external command
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    command: Vec<String>,
}

impl CommandProvisioner {
    /// `command[0]` is the program, the rest its arguments
    pub fn new(command: Vec<String>) -> Result<Self, TwinError> {
        if command.is_empty() {
            return Err(TwinError::Provision("replay command is empty".to_string()));
        }
        Ok(Self { command })
    }
}

#[async_trait::async_trait]
impl TwinProvisioner for CommandProvisioner {
    async fn provision(&self, anomaly: &Anomaly) -> Result<Arc<dyn Replica>, TwinError> {
        let dir = tempfile::Builder::new()
            .prefix("homeostat-replica-")
            .tempdir()
            .map_err(|e| TwinError::Provision(e.to_string()))?;
        let id = dir
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        tracing::debug!(replica = %id, service = %anomaly.service, "replica provisioned");

        Ok(Arc::new(CommandReplica {
            id,
            service: anomaly.service.clone(),
            command: self.command.clone(),
            dir: Mutex::new(Some(dir)),
            patch_file: Mutex::new(None),
        }))
    }
}

/// A replica backed by a temporary directory
#[derive(Debug)]
pub struct CommandReplica {
    id: String,
    service: String,
    command: Vec<String>,
    dir: Mutex<Option<TempDir>>,
    patch_file: Mutex<Option<PathBuf>>,
}

impl CommandReplica {
    fn dir_path(&self) -> Result<PathBuf, TwinError> {
        self.dir
            .lock()
            .as_ref()
            .map(|d| d.path().to_path_buf())
            .ok_or_else(|| TwinError::Replay("replica already torn down".to_string()))
    }
}

#[async_trait::async_trait]
impl Replica for CommandReplica {
    fn id(&self) -> &str {
        &self.id
    }

    async fn replay(&self, requests: u64) -> Result<TwinMetrics, TwinError> {
        let dir = self.dir_path()?;
        let patch = self
            .patch_file
            .lock()
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| TwinError::Replay("replay command is empty".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .current_dir(&dir)
            .env("HOMEOSTAT_SERVICE", &self.service)
            .env("HOMEOSTAT_REPLICA_DIR", &dir)
            .env("HOMEOSTAT_REQUESTS", requests.to_string())
            .env("HOMEOSTAT_PATCH", patch)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }

        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(TwinError::Replay(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| TwinError::Replay("replay printed no metrics".to_string()))?;
        Ok(serde_json::from_str(line)?)
    }

    async fn apply_patch(&self, patch: &Patch) -> Result<(), TwinError> {
        let path = self.dir_path()?.join("patch");
        tokio::fs::write(&path, patch.content.as_bytes())
            .await
            .map_err(|e| TwinError::PatchRejected(e.to_string()))?;
        *self.patch_file.lock() = Some(path);
        Ok(())
    }

    async fn teardown(&self) -> Result<(), TwinError> {
        let dir = self.dir.lock().take();
        match dir {
            Some(dir) => dir
                .close()
                .map_err(|e| TwinError::Teardown(e.to_string())),
            None => Ok(()),
        }
    }
}
