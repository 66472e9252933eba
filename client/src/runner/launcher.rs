//! Probe process launching

use crate::parser::LossyLines;
use async_trait::async_trait;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Stderr kept for failure reasons
const STDERR_LIMIT: usize = 8 * 1024;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Probe binary not found: {0}")]
    NotFound(String),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Probe stdout unavailable")]
    NoStdout,

    #[error("Failed to prepare run output: {0}")]
    Io(#[from] std::io::Error),
}

/// Program plus argument vector
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl std::fmt::Display for ProbeCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// How a probe process ended
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeExit {
    /// `None` when killed by a signal
    pub code: Option<i32>,
    pub stderr: String,
}

#[async_trait]
pub trait ProbeProcess: Send {
    /// Next stdout line, `None` at end of output
    async fn next_line(&mut self) -> std::io::Result<Option<String>>;

    async fn wait(&mut self) -> std::io::Result<ProbeExit>;

    async fn kill(&mut self) -> std::io::Result<()>;
}

#[async_trait]
pub trait ProbeLauncher: Send + Sync {
    async fn launch(&self, command: &ProbeCommand) -> Result<Box<dyn ProbeProcess>, LaunchError>;
}

/// Spawns real processes through `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct TokioLauncher;

#[async_trait]
impl ProbeLauncher for TokioLauncher {
    async fn launch(&self, command: &ProbeCommand) -> Result<Box<dyn ProbeProcess>, LaunchError> {
        debug!("Spawning: {}", command);

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => LaunchError::NotFound(command.program.clone()),
                _ => LaunchError::Spawn {
                    program: command.program.clone(),
                    source: e,
                },
            })?;

        let stdout = child.stdout.take().ok_or(LaunchError::NoStdout)?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut kept = Vec::with_capacity(1024);
                let mut buf = [0u8; 1024];
                loop {
                    match stderr.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            let room = STDERR_LIMIT.saturating_sub(kept.len());
                            kept.extend_from_slice(&buf[..n.min(room)]);
                        }
                        Err(e) => {
                            warn!("Error reading probe stderr: {}", e);
                            break;
                        }
                    }
                }
                String::from_utf8_lossy(&kept).trim().to_string()
            })
        });

        Ok(Box::new(TokioProcess {
            child,
            stdout: LossyLines::new(BufReader::new(stdout)),
            stderr_task,
        }))
    }
}

struct TokioProcess {
    child: Child,
    stdout: LossyLines<BufReader<ChildStdout>>,
    stderr_task: Option<JoinHandle<String>>,
}

#[async_trait]
impl ProbeProcess for TokioProcess {
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.stdout.next_line().await
    }

    async fn wait(&mut self) -> std::io::Result<ProbeExit> {
        let status = self.child.wait().await?;
        let stderr = match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        Ok(ProbeExit {
            code: status.code(),
            stderr,
        })
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        match self.child.kill().await {
            Ok(()) => Ok(()),
            // already exited
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }
}
