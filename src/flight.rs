//! Single-flight coordination for lifecycle operations
//!
//! [`SingleFlight`] runs at most one instance of an operation at a time.
//! Callers arriving while it is in flight await the same outcome instead of
//! starting their own. Once the operation completes the flight is done and
//! the next call starts a fresh one.
//!
//! The operation is spawned onto the runtime, so dropping a caller (for
//! example a request whose client went away) never cancels a build halfway.
//!
//! [`Gate`] is the lighter sibling used by the proxy: the first request
//! through becomes the leader, everyone else waits until it is done and then
//! proceeds on their own.

use parking_lot::Mutex;
use std::future::Future;
use tokio::sync::watch;

/// Observable phase of a [`SingleFlight`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing has run yet, or the last flight was aborted
    Idle,
    /// An operation is running
    InFlight,
    /// The last operation completed; its outcome is retained
    Done,
}

/// The in-flight operation panicked or was torn down before producing a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation aborted before completing")]
pub struct Aborted;

struct Flight<T> {
    epoch: u64,
    rx: watch::Receiver<Option<T>>,
}

impl<T> Flight<T> {
    fn phase(&self) -> Phase {
        if self.rx.borrow().is_some() {
            Phase::Done
        } else if self.rx.has_changed().is_err() {
            // Sender dropped without a value
            Phase::Idle
        } else {
            Phase::InFlight
        }
    }
}

pub struct SingleFlight<T> {
    current: Mutex<Option<Flight<T>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation`, or join the flight already running.
    ///
    /// `operation` is only polled when this call starts a new flight.
    pub async fn run<F>(&self, operation: F) -> Result<T, Aborted>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let rx = {
            let mut current = self.current.lock();
            match current.as_ref() {
                Some(flight) if flight.phase() == Phase::InFlight => flight.rx.clone(),
                _ => {
                    let epoch = current.as_ref().map(|f| f.epoch).unwrap_or(0) + 1;
                    let (tx, rx) = watch::channel(None);
                    *current = Some(Flight {
                        epoch,
                        rx: rx.clone(),
                    });
                    tokio::spawn(async move {
                        let outcome = operation.await;
                        let _ = tx.send(Some(outcome));
                    });
                    rx
                }
            }
        };

        Self::outcome(rx).await
    }

    /// Wait for the in-flight operation, if any. Returns its outcome, or
    /// `None` when nothing was running.
    pub async fn wait(&self) -> Option<Result<T, Aborted>> {
        let rx = {
            let current = self.current.lock();
            match current.as_ref() {
                Some(flight) if flight.phase() == Phase::InFlight => flight.rx.clone(),
                _ => return None,
            }
        };
        Some(Self::outcome(rx).await)
    }

    async fn outcome(mut rx: watch::Receiver<Option<T>>) -> Result<T, Aborted> {
        match rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone().ok_or(Aborted),
            Err(_) => Err(Aborted),
        }
    }

    pub fn phase(&self) -> Phase {
        self.current
            .lock()
            .as_ref()
            .map(Flight::phase)
            .unwrap_or(Phase::Idle)
    }

    pub fn is_in_flight(&self) -> bool {
        self.phase() == Phase::InFlight
    }

    /// Number of flights started so far
    pub fn epoch(&self) -> u64 {
        self.current.lock().as_ref().map(|f| f.epoch).unwrap_or(0)
    }
}

/// Lets one caller through at a time while the others wait for it, then
/// releases all waiters at once.
#[derive(Default)]
pub struct Gate {
    open: Mutex<Option<watch::Receiver<()>>>,
}

/// Result of passing a [`Gate`]
pub enum Pass<'a> {
    /// This caller holds the gate until the guard is dropped
    Leader(GateGuard<'a>),
    /// Another caller held the gate and has since released it
    Follower,
}

impl Pass<'_> {
    pub fn is_leader(&self) -> bool {
        matches!(self, Pass::Leader(_))
    }
}

pub struct GateGuard<'a> {
    gate: &'a Gate,
    _release: watch::Sender<()>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        // Followers wake when `_release` drops, after the gate is clear
        self.gate.open.lock().take();
    }
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pass(&self) -> Pass<'_> {
        let mut rx = {
            let mut open = self.open.lock();
            match open.as_ref() {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(());
                    *open = Some(rx);
                    return Pass::Leader(GateGuard {
                        gate: self,
                        _release: tx,
                    });
                }
            }
        };

        // Nothing is ever sent; this resolves when the leader's guard drops
        let _ = rx.changed().await;
        Pass::Follower
    }

    /// Wait until no leader holds the gate, without taking it
    pub async fn wait_open(&self) {
        let rx = self.open.lock().clone();
        if let Some(mut rx) = rx {
            let _ = rx.changed().await;
        }
    }
}
