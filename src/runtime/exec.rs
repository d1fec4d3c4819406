//! One-shot process execution with a deadline
//!
//! Used for commands that run a binary to completion and report its output,
//! as opposed to supervised long-lived servers.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default execution timeout for one-shot runs
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors that can occur while running a one-shot process
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Failed to spawn {binary}: {reason}")]
    SpawnFailed { binary: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured result of a one-shot run
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutput {
    /// Interleaved stdout and stderr, in arrival order per chunk
    pub output: String,
    /// Exit code, `None` if killed by a signal or by the timeout
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

fn drain<R>(mut reader: R, buffer: SharedBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => match buffer.lock() {
                    Ok(mut buf) => buf.extend_from_slice(&chunk[..n]),
                    Err(poisoned) => poisoned.into_inner().extend_from_slice(&chunk[..n]),
                },
                Err(e) => {
                    debug!("Output stream closed: {}", e);
                    break;
                }
            }
        }
    })
}

/// Run `binary` with `args`, capturing combined output.
///
/// When the deadline passes the process is killed and whatever output was
/// produced so far is returned with `timed_out` set.
pub async fn run_with_timeout(
    binary: &Path,
    args: &[String],
    limit: Duration,
) -> Result<ExecOutput, ExecError> {
    let started = std::time::Instant::now();
    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExecError::SpawnFailed {
            binary: binary.display().to_string(),
            reason: e.to_string(),
        })?;

    let buffer: SharedBuffer = Arc::new(Mutex::new(Vec::new()));
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(drain(stdout, Arc::clone(&buffer)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(drain(stderr, Arc::clone(&buffer)));
    }

    let (exit_code, timed_out) = match tokio::time::timeout(limit, child.wait()).await {
        Ok(status) => (status?.code(), false),
        Err(_) => {
            warn!("{} exceeded {:?}, killing", binary.display(), limit);
            if let Err(e) = child.kill().await {
                debug!("Kill after timeout reported: {}", e);
            }
            (None, true)
        }
    };

    // Grandchildren may keep the pipes open; don't wait on them forever
    for reader in readers {
        if tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .is_err()
        {
            debug!("Output reader still open after exit, abandoning");
        }
    }

    let output = match buffer.lock() {
        Ok(buf) => String::from_utf8_lossy(&buf).into_owned(),
        Err(poisoned) => String::from_utf8_lossy(&poisoned.into_inner()).into_owned(),
    };

    Ok(ExecOutput {
        output,
        exit_code,
        timed_out,
        elapsed: started.elapsed(),
    })
}
