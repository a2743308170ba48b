//! Continuation by re-executing the CLI as a detached child process.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::domain::BatchId;
use crate::ports::ContinuationTrigger;

/// Spawns `<program> process-task <batch_id> --continue` and does not wait.
#[derive(Debug, Clone)]
pub struct SelfExecContinuation {
    program: PathBuf,
    extra_args: Vec<String>,
}

impl SelfExecContinuation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
        }
    }

    /// Re-exec the running binary.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.extra_args.extend(args);
        self
    }

    fn command(&self, batch_id: BatchId) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("process-task")
            .arg(batch_id.to_string())
            .arg("--continue")
            .args(&self.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(false);
        cmd
    }
}

#[async_trait]
impl ContinuationTrigger for SelfExecContinuation {
    async fn schedule(&self, batch_id: BatchId) -> std::io::Result<()> {
        let child = self.command(batch_id).spawn()?;
        info!(%batch_id, pid = child.id(), "scheduled continuation");
        // child is detached: dropping the handle does not kill it
        drop(child);
        Ok(())
    }
}
