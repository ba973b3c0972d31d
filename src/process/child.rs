//! Runtime process management
//!
//! Spawns the launcher with piped stdio, including:
//! - Chunked stdout/stderr streaming
//! - Exit status reporting
//! - At-most-once graceful termination

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::server::OutputCategory;

/// Exit code reported when the OS gives neither a code nor a signal
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Size of a single stdout/stderr read
const READ_CHUNK_SIZE: usize = 8192;

/// How long the exit watcher waits for the stream pumps after exit
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that can occur during process operations
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn {}: {source}", program.display())]
    SpawnFailed {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to capture {0} of spawned process")]
    MissingPipe(&'static str),
}

/// Result type for process operations
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Reason for process exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Process exited with a status code
    Normal,
    /// Process was killed by a signal
    Signal,
    /// Neither code nor signal available
    Unknown,
}

/// Event emitted when a process exits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// OS process id
    pub pid: Option<u32>,
    /// Exit code; `-signal` when killed by a signal
    pub exit_code: i32,
    /// Exit reason
    pub reason: ExitReason,
}

impl ProcessExit {
    /// Map an OS exit status to a definite exit code
    pub fn from_status(pid: Option<u32>, status: ExitStatus) -> Self {
        let (exit_code, reason) = exit_code_of(status);
        Self {
            pid,
            exit_code,
            reason,
        }
    }
}

fn exit_code_of(status: ExitStatus) -> (i32, ExitReason) {
    if let Some(code) = status.code() {
        return (code, ExitReason::Normal);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return (-signal, ExitReason::Signal);
        }
    }

    (UNKNOWN_EXIT_CODE, ExitReason::Unknown)
}

/// Something the running process did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A chunk of text from stdout or stderr
    Output {
        category: OutputCategory,
        text: String,
    },
    /// The process has exited; always the last event
    Exited(ProcessExit),
}

/// Result of asking a process to terminate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The termination signal was requested now
    Signalled,
    /// A termination signal was already requested earlier
    AlreadyRequested,
    /// The process has already exited
    NotRunning,
}

/// Handle to a spawned runtime process
///
/// The child itself is owned by a watcher task; this handle receives its
/// events and can ask it to terminate.
pub struct RuntimeProcess {
    /// OS process id
    pid: Option<u32>,
    /// Channel for receiving output and exit events
    events_rx: mpsc::Receiver<ProcessEvent>,
    /// One-shot termination request to the watcher
    terminate_tx: Option<oneshot::Sender<()>>,
    /// Set by the watcher once the child has been reaped
    exited: Arc<AtomicBool>,
}

impl RuntimeProcess {
    /// Spawn a new process with piped stdout/stderr
    ///
    /// # Arguments
    /// * `program` - Path of the binary to run
    /// * `args` - Command arguments
    /// * `cwd` - Working directory (inherited when `None`)
    /// * `env` - Variables added to the inherited environment
    pub fn spawn(
        program: &Path,
        args: &[String],
        cwd: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> ProcessResult<Self> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::SpawnFailed {
            program: program.to_path_buf(),
            source,
        })?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::MissingPipe("stderr"))?;

        let (events_tx, events_rx) = mpsc::channel(1024);
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let exited = Arc::new(AtomicBool::new(false));

        let pumps = vec![
            tokio::spawn(pump(stdout, OutputCategory::Stdout, events_tx.clone())),
            tokio::spawn(pump(stderr, OutputCategory::Stderr, events_tx.clone())),
        ];

        tokio::spawn(watch_exit(
            child,
            pid,
            pumps,
            terminate_rx,
            Arc::clone(&exited),
            events_tx,
        ));

        debug!("Spawned {} with pid {:?}", program.display(), pid);

        Ok(Self {
            pid,
            events_rx,
            terminate_tx: Some(terminate_tx),
            exited,
        })
    }

    /// Get the OS process id
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Check if the process has exited
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Check if termination has been requested
    pub fn termination_requested(&self) -> bool {
        self.terminate_tx.is_none()
    }

    /// Receive the next event
    ///
    /// Returns `None` once the exit event has been consumed.
    pub async fn recv(&mut self) -> Option<ProcessEvent> {
        self.events_rx.recv().await
    }

    /// Ask the process to shut down gracefully
    ///
    /// Only the first call on a running process sends a signal.
    pub fn terminate(&mut self) -> TerminationOutcome {
        if self.has_exited() {
            return TerminationOutcome::NotRunning;
        }

        match self.terminate_tx.take() {
            Some(tx) => {
                if tx.send(()).is_ok() {
                    TerminationOutcome::Signalled
                } else {
                    TerminationOutcome::NotRunning
                }
            }
            None => TerminationOutcome::AlreadyRequested,
        }
    }
}

impl Drop for RuntimeProcess {
    fn drop(&mut self) {
        if !self.has_exited() && self.terminate() == TerminationOutcome::Signalled {
            debug!("Requested termination of pid {:?} on drop", self.pid);
        }
    }
}

/// Forward one output stream as events until EOF
async fn pump<R>(mut reader: R, category: OutputCategory, events_tx: mpsc::Sender<ProcessEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_CHUNK_SIZE];
    let mut decoder = Utf8Chunks::default();

    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buffer[..n]);
                if text.is_empty() {
                    continue;
                }
                if events_tx
                    .send(ProcessEvent::Output { category, text })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                warn!("Failed to read {:?}: {}", category, e);
                break;
            }
        }
    }

    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = events_tx
            .send(ProcessEvent::Output {
                category,
                text: rest,
            })
            .await;
    }
}

/// Own the child until it exits, delivering at most one termination signal
async fn watch_exit(
    mut child: Child,
    pid: Option<u32>,
    pumps: Vec<JoinHandle<()>>,
    terminate_rx: oneshot::Receiver<()>,
    exited: Arc<AtomicBool>,
    events_tx: mpsc::Sender<ProcessEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = terminate_rx => {
            send_graceful_termination(&mut child, pid);
            child.wait().await
        }
    };
    exited.store(true, Ordering::SeqCst);

    let exit = match status {
        Ok(status) => ProcessExit::from_status(pid, status),
        Err(e) => {
            warn!("Failed to wait for pid {:?}: {}", pid, e);
            ProcessExit {
                pid,
                exit_code: UNKNOWN_EXIT_CODE,
                reason: ExitReason::Unknown,
            }
        }
    };

    // Output written before exit goes out before the exit event
    for pump in pumps {
        if tokio::time::timeout(STREAM_DRAIN_TIMEOUT, pump).await.is_err() {
            debug!("Output stream of pid {:?} still open after exit", pid);
        }
    }

    debug!("Process {:?} exited with code {}", pid, exit.exit_code);
    let _ = events_tx.send(ProcessEvent::Exited(exit)).await;
}

#[cfg(unix)]
fn send_graceful_termination(_child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!("Failed to send SIGTERM to pid {}: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn send_graceful_termination(child: &mut Child, pid: Option<u32>) {
    // No advisory signal on this platform
    if let Err(e) = child.start_kill() {
        warn!("Failed to terminate pid {:?}: {}", pid, e);
    }
}

/// Incremental UTF-8 decoding across read boundaries
#[derive(Debug, Default)]
struct Utf8Chunks {
    pending: Vec<u8>,
}

impl Utf8Chunks {
    /// Decode `bytes`, holding back an incomplete trailing sequence
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let keep = incomplete_suffix_len(&self.pending);
        let split = self.pending.len() - keep;
        let text = String::from_utf8_lossy(&self.pending[..split]).into_owned();
        self.pending.drain(..split);
        text
    }

    /// Flush whatever is still held back
    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a truncated multi-byte sequence at the end of `bytes`
fn incomplete_suffix_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            // continuation byte, keep looking for the lead byte
            continue;
        }
        let width = match byte {
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}
