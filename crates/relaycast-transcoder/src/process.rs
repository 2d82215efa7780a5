//! OS process seam.
//!
//! The supervisor only talks to [`ProcessSpawner`] and [`ChildProcess`], so
//! tests can substitute scripted processes for the real transcoder.

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::DIAGNOSTIC_CHANNEL_CAPACITY;

/// How a process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// A running child process.
#[async_trait]
pub trait ChildProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Ask the process to finish its output and exit.
    async fn terminate(&mut self) -> io::Result<()>;

    /// Kill the process without waiting.
    fn kill(&mut self) -> io::Result<()>;

    /// Wait for exit. Must be safe to cancel and call again.
    async fn wait(&mut self) -> io::Result<ExitInfo>;
}

/// A freshly spawned process and its stderr lines.
pub struct SpawnedProcess {
    pub child: Box<dyn ChildProcess>,
    pub diagnostics: mpsc::Receiver<String>,
}

/// Starts processes.
#[async_trait]
pub trait ProcessSpawner: Send + Sync + 'static {
    async fn spawn(&self, program: &Path, args: &[String]) -> io::Result<SpawnedProcess>;
}

/// Spawns real OS processes through tokio.
#[derive(Debug, Clone, Default)]
pub struct CommandSpawner;

#[async_trait]
impl ProcessSpawner for CommandSpawner {
    async fn spawn(&self, program: &Path, args: &[String]) -> io::Result<SpawnedProcess> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take();
        let (tx, rx) = mpsc::channel(DIAGNOSTIC_CHANNEL_CAPACITY);

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    trace!(target: "relaycast::transcoder::stderr", "{}", line);
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }

        debug!(pid = ?child.id(), program = %program.display(), "Process spawned");

        Ok(SpawnedProcess {
            child: Box::new(OsChild { child, stdin }),
            diagnostics: rx,
        })
    }
}

struct OsChild {
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl ChildProcess for OsChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn terminate(&mut self) -> io::Result<()> {
        // ffmpeg finishes the current segment and writes the playlist on 'q'.
        if let Some(mut stdin) = self.stdin.take() {
            stdin.write_all(b"q").await?;
            stdin.flush().await?;
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn wait(&mut self) -> io::Result<ExitInfo> {
        self.child.wait().await.map(ExitInfo::from)
    }
}
