//! Build/run lifecycle of the supervised backend
//!
//! `Supervisor` is shared behind an `Arc`: the proxy, the change watcher's
//! rebuild callback, and the console all drive it concurrently. Start and
//! Restart are single-flighted so N concurrent callers cause one build. Start,
//! Restart, rotation and Stop serialize on one lifecycle lock.

use crate::config::{AppConfig, PortRange};
use crate::error::{RuntimeFailure, SupervisorError};
use crate::flight::SingleFlight;
use crate::process::{is_port_available, FailureLog, SupervisedProcess};
use crate::toolchain::{remove_artifact, Toolchain};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

type Outcome = Result<(), SupervisorError>;

pub struct Supervisor {
    toolchain: Toolchain,
    ports: PortRange,
    port_flag: Option<String>,
    startup_timeout: Duration,
    probe_interval: Duration,
    /// Tracked processes keyed by port
    processes: DashMap<u16, Mutex<SupervisedProcess>>,
    current_port: AtomicU16,
    switch_pending: AtomicBool,
    latest_artifact: Mutex<Option<PathBuf>>,
    failures: FailureLog,
    generation: AtomicU64,
    start_flight: SingleFlight<Outcome>,
    restart_flight: SingleFlight<Outcome>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Supervisor {
    /// Create a supervisor for the configured app.
    ///
    /// Returns `Arc<Self>` because lifecycle operations run on spawned tasks
    /// that hold their own reference.
    pub fn new(config: &AppConfig) -> anyhow::Result<Arc<Self>> {
        let toolchain = Toolchain::from_config(config)?;
        let ports = config.ports();

        Ok(Arc::new(Self {
            toolchain,
            ports,
            port_flag: config.port_flag.clone(),
            startup_timeout: config.startup_timeout(),
            probe_interval: config.probe_interval(),
            processes: DashMap::new(),
            current_port: AtomicU16::new(ports.start),
            switch_pending: AtomicBool::new(false),
            latest_artifact: Mutex::new(None),
            failures: FailureLog::new(),
            generation: AtomicU64::new(0),
            start_flight: SingleFlight::new(),
            restart_flight: SingleFlight::new(),
            lifecycle: tokio::sync::Mutex::new(()),
        }))
    }

    pub fn current_port(&self) -> u16 {
        self.current_port.load(Ordering::SeqCst)
    }

    pub fn ports(&self) -> PortRange {
        self.ports
    }

    pub fn is_multi_port(&self) -> bool {
        self.ports.len() > 1
    }

    pub fn latest_artifact(&self) -> Option<PathBuf> {
        self.latest_artifact.lock().clone()
    }

    /// Build (if `build`) then run on the current port. Concurrent callers
    /// share the in-flight outcome. Without `build` an already running
    /// backend is left alone.
    pub async fn start(self: &Arc<Self>, build: bool) -> Result<(), SupervisorError> {
        let this = Arc::clone(self);
        self.start_flight
            .run(async move {
                let _lifecycle = this.lifecycle.lock().await;
                if !build && this.is_running(None) {
                    return Ok(());
                }
                let artifact = if build {
                    this.build_locked().await?
                } else {
                    this.latest_artifact().ok_or_else(|| {
                        SupervisorError::Startup("no artifact has been built yet".to_string())
                    })?
                };
                this.run_locked(this.current_port(), artifact).await
            })
            .await?
    }

    /// Rebuild, then replace the process on the current port.
    ///
    /// A failed build leaves the running process untouched.
    pub async fn restart(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let this = Arc::clone(self);
        self.restart_flight
            .run(async move {
                let _lifecycle = this.lifecycle.lock().await;
                let port = this.current_port();
                info!(port, "Restarting backend");
                let artifact = this.build_locked().await?;
                this.take_down(port, true).await;
                this.run_locked(port, artifact).await
            })
            .await?
    }

    /// Compile a fresh artifact
    pub async fn build(&self) -> Result<PathBuf, SupervisorError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.build_locked().await
    }

    /// Run the newest artifact on `port`
    pub async fn run(&self, port: u16) -> Result<(), SupervisorError> {
        let _lifecycle = self.lifecycle.lock().await;
        let artifact = self.latest_artifact().ok_or_else(|| {
            SupervisorError::Startup("no artifact has been built yet".to_string())
        })?;
        self.run_locked(port, artifact).await
    }

    /// Kill the process on `port` and remove its artifact
    pub async fn stop(&self, port: u16) {
        let _lifecycle = self.lifecycle.lock().await;
        self.take_down(port, true).await;
    }

    /// Stop everything on ports other than the current one
    pub async fn clean(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let current = self.current_port();
        let stale: Vec<u16> = self
            .processes
            .iter()
            .map(|entry| *entry.key())
            .filter(|port| *port != current)
            .collect();

        for port in stale {
            self.take_down(port, true).await;
        }
    }

    pub async fn stop_all(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let ports: Vec<u16> = self.processes.iter().map(|entry| *entry.key()).collect();
        for port in ports {
            self.take_down(port, true).await;
        }
    }

    /// Build and run on a free port alongside the serving process, then make
    /// it current. The proxy picks up the switch with [`take_switch`].
    ///
    /// [`take_switch`]: Supervisor::take_switch
    pub async fn rotate(&self) -> Result<u16, SupervisorError> {
        let _lifecycle = self.lifecycle.lock().await;
        let artifact = self.build_locked().await?;

        let Some(port) = self.pick_free_port() else {
            remove_artifact(&artifact).await;
            return Err(SupervisorError::Startup(format!(
                "no free port in range {}",
                self.ports
            )));
        };

        self.run_locked(port, artifact).await?;
        Ok(port)
    }

    /// Whether the process on `port` (default: current) passed readiness and
    /// is still alive
    pub fn is_running(&self, port: Option<u16>) -> bool {
        let port = port.unwrap_or_else(|| self.current_port());
        self.processes
            .get(&port)
            .map(|process| process.lock().is_running())
            .unwrap_or(false)
    }

    /// Whether the process on `port` (default: current) exited on its own
    pub fn is_quit(&self, port: Option<u16>) -> bool {
        let port = port.unwrap_or_else(|| self.current_port());
        self.processes
            .get(&port)
            .map(|process| process.lock().has_exited())
            .unwrap_or(false)
    }

    /// The new current port if a run switched ports since the last call
    pub fn take_switch(&self) -> Option<u16> {
        if self.switch_pending.swap(false, Ordering::SeqCst) {
            Some(self.current_port())
        } else {
            None
        }
    }

    /// Wait for any in-flight start or restart to finish
    pub async fn settle(&self) {
        for flight in [&self.start_flight, &self.restart_flight] {
            if flight.is_in_flight() {
                debug!(epoch = flight.epoch(), "Waiting for in-flight lifecycle operation");
                let _ = flight.wait().await;
            }
        }
    }

    /// Cursor for [`runtime_failure_since`](Supervisor::runtime_failure_since)
    pub fn mark_failures(&self) -> u64 {
        self.failures.mark()
    }

    pub fn runtime_failure_since(&self, mark: u64) -> Option<RuntimeFailure> {
        self.failures.since(mark)
    }

    /// Whether a panic blob that began after `mark` is still being collected
    pub fn failure_pending_since(&self, mark: u64) -> bool {
        self.failures.pending_since(mark)
    }

    async fn build_locked(&self) -> Result<PathBuf, SupervisorError> {
        let artifact = self.toolchain.build().await?;
        let previous = self.latest_artifact.lock().replace(artifact.clone());

        // A superseded artifact that never ran, or whose process is gone
        if let Some(previous) = previous {
            let in_use = self
                .processes
                .iter()
                .any(|entry| entry.value().lock().artifact() == previous);
            if !in_use {
                remove_artifact(&previous).await;
            }
        }
        Ok(artifact)
    }

    async fn run_locked(&self, port: u16, artifact: PathBuf) -> Result<(), SupervisorError> {
        let previous = self
            .processes
            .get(&port)
            .map(|process| process.lock().artifact().to_path_buf());
        if let Some(previous) = previous {
            self.take_down(port, previous != artifact).await;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut process = SupervisedProcess::spawn(
            &artifact,
            port,
            self.port_flag.as_deref(),
            generation,
            self.failures.clone(),
        )?;

        if let Err(e) = process
            .wait_ready(self.startup_timeout, self.probe_interval)
            .await
        {
            error!(port, error = %e, "Backend failed to start");
            process.kill().await;
            return Err(e);
        }

        self.processes.insert(port, Mutex::new(process));
        let previous_port = self.current_port.swap(port, Ordering::SeqCst);
        if previous_port != port {
            info!(from = previous_port, to = port, "Backend switched ports");
            self.switch_pending.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Remove the entry for `port`, kill it if still alive, and optionally
    /// delete its artifact
    async fn take_down(&self, port: u16, remove: bool) {
        let Some((_, process)) = self.processes.remove(&port) else {
            return;
        };
        let mut process = process.into_inner();
        process.kill().await;

        if remove {
            let artifact = process.artifact().to_path_buf();
            remove_artifact(&artifact).await;
            let mut latest = self.latest_artifact.lock();
            if latest.as_ref() == Some(&artifact) {
                *latest = None;
            }
        }
        debug!(port, "Backend entry removed");
    }

    fn pick_free_port(&self) -> Option<u16> {
        let current = self.current_port();
        self.ports.iter().find(|port| {
            *port != current && !self.processes.contains_key(port) && is_port_available(*port)
        })
    }
}
