use crate::error::{RuntimeFailure, SupervisorError};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, error, info, warn};

/// Marker the Go HTTP server logs when a handler panics
pub const PANIC_MARKER: &str = "http: panic serving";

/// Quiet period that ends a panic blob on stderr
const BLOB_SETTLE: Duration = Duration::from_millis(100);

/// How often the readiness probe reports that it is still waiting
const WAITING_NOTICE: Duration = Duration::from_secs(5);

const APP_ERROR_BANNER: &str = "----------- Application Error -----------";

/// State of a supervised backend process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawned, not yet accepting connections
    Starting,
    /// Passed the readiness probe
    Ready,
}

/// Runtime failures captured from backend stderr, newest last.
///
/// Each failure gets a sequence number when its blob begins, so a request can
/// ask for failures begun after a [`mark`](FailureLog::mark) it took, and
/// whether one is still being collected.
#[derive(Debug, Clone, Default)]
pub struct FailureLog {
    inner: Arc<Mutex<FailureSlot>>,
}

#[derive(Debug, Default)]
struct FailureSlot {
    seq: u64,
    collecting: bool,
    last: Option<(u64, RuntimeFailure)>,
}

impl FailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A panic marker was seen; the blob follows
    pub fn begin(&self) -> u64 {
        let mut slot = self.inner.lock();
        slot.seq += 1;
        slot.collecting = true;
        slot.seq
    }

    /// Store a complete blob under the sequence number of its `begin`, or a
    /// fresh one if none is open
    pub fn record(&self, failure: RuntimeFailure) -> u64 {
        let mut slot = self.inner.lock();
        if !slot.collecting {
            slot.seq += 1;
        }
        slot.collecting = false;
        let seq = slot.seq;
        slot.last = Some((seq, failure));
        seq
    }

    /// Cursor to compare later failures against
    pub fn mark(&self) -> u64 {
        self.inner.lock().seq
    }

    /// The last failure, if it was recorded after `mark`
    pub fn since(&self, mark: u64) -> Option<RuntimeFailure> {
        match &self.inner.lock().last {
            Some((seq, failure)) if *seq > mark => Some(failure.clone()),
            _ => None,
        }
    }

    pub fn pending_since(&self, mark: u64) -> bool {
        let slot = self.inner.lock();
        slot.collecting && slot.seq > mark
    }
}

/// One running instance of the backend
pub struct SupervisedProcess {
    port: u16,
    artifact: PathBuf,
    child: Child,
    state: ProcessState,
    generation: u64,
}

impl SupervisedProcess {
    /// Launch `artifact`, handing it `port` through `port_flag` if given.
    ///
    /// stdout passes through; stderr is echoed and scanned for panics.
    pub fn spawn(
        artifact: &Path,
        port: u16,
        port_flag: Option<&str>,
        generation: u64,
        failures: FailureLog,
    ) -> Result<Self, SupervisorError> {
        let mut cmd = Command::new(artifact);
        if let Some(flag) = port_flag {
            cmd.arg(flag).arg(port.to_string());
        }
        cmd.env("PORT", port.to_string());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            SupervisorError::Startup(format!("failed to launch {}: {}", artifact.display(), e))
        })?;
        let pid = child.id().unwrap_or(0);
        info!(port, pid, generation, artifact = %artifact.display(), "Backend process spawned");

        if let Some(stderr) = child.stderr.take() {
            intercept_stderr(stderr, port, failures);
        }

        Ok(Self {
            port,
            artifact: artifact.to_path_buf(),
            child,
            state: ProcessState::Starting,
            generation,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Whether the process has exited; reaps it if so
    pub fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    /// Ready and still alive
    pub fn is_running(&mut self) -> bool {
        self.state == ProcessState::Ready && !self.has_exited()
    }

    /// Poll-dial the port until it accepts, the child exits, or `timeout`
    /// elapses.
    pub async fn wait_ready(
        &mut self,
        timeout: Duration,
        interval: Duration,
    ) -> Result<(), SupervisorError> {
        let port = self.port;
        let started = Instant::now();
        let mut last_notice = started;

        loop {
            if let Some(status) = self.child.try_wait()? {
                return Err(SupervisorError::Startup(format!(
                    "process exited with {} before listening on port {}",
                    status, port
                )));
            }

            let dial = tokio::time::timeout(
                Duration::from_secs(1),
                TcpStream::connect(("127.0.0.1", port)),
            )
            .await;
            if let Ok(Ok(_)) = dial {
                self.state = ProcessState::Ready;
                info!(
                    port,
                    generation = self.generation,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Backend is now ready"
                );
                return Ok(());
            }

            if started.elapsed() >= timeout {
                return Err(SupervisorError::Startup(format!(
                    "timed out after {}s waiting for port {}",
                    timeout.as_secs(),
                    port
                )));
            }

            if last_notice.elapsed() >= WAITING_NOTICE {
                info!(port, "Waiting for backend to listen");
                last_notice = Instant::now();
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// Kill immediately and wait for the exit. No-op if already gone.
    pub async fn kill(&mut self) {
        if self.has_exited() {
            debug!(port = self.port, "Backend already exited");
            return;
        }

        let pid = self.pid().unwrap_or(0);
        info!(port = self.port, pid, generation = self.generation, "Killing backend");
        if let Err(e) = self.child.start_kill() {
            warn!(port = self.port, error = %e, "Failed to kill backend");
            return;
        }
        match self.child.wait().await {
            Ok(status) => debug!(port = self.port, ?status, "Backend exited"),
            Err(e) => warn!(port = self.port, error = %e, "Error waiting for backend to exit"),
        }
    }
}

/// Echo stderr lines and turn panic blobs into recorded failures
fn intercept_stderr(stderr: ChildStderr, port: u16, failures: FailureLog) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut blob: Option<String> = None;

        loop {
            let next = if blob.is_some() {
                match tokio::time::timeout(BLOB_SETTLE, lines.next_line()).await {
                    Ok(next) => next,
                    Err(_) => {
                        publish(&failures, port, blob.take());
                        continue;
                    }
                }
            } else {
                lines.next_line().await
            };

            match next {
                Ok(Some(line)) => {
                    if line.contains(PANIC_MARKER) {
                        publish(&failures, port, blob.take());
                        failures.begin();
                        blob = Some(line);
                    } else if let Some(blob) = blob.as_mut() {
                        blob.push('\n');
                        blob.push_str(&line);
                    } else {
                        info!(target: "backend", port, "{}", line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(port, error = %e, "Backend stderr closed");
                    break;
                }
            }
        }

        publish(&failures, port, blob.take());
    });
}

fn publish(failures: &FailureLog, port: u16, blob: Option<String>) {
    let Some(raw) = blob else {
        return;
    };

    error!(target: "backend", port, "{}", APP_ERROR_BANNER);
    for line in raw.lines() {
        error!(target: "backend", port, "{}", line);
    }
    error!(target: "backend", port, "{}", APP_ERROR_BANNER);

    failures.record(RuntimeFailure::new(raw));
}

/// Check whether a port is available on loopback
pub fn is_port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}
