//! Graceful shutdown coordination.
//!
//! A single-fire latch that drives the service lifecycle:
//! - the first shutdown request (from a signal handler or from code) moves
//!   the phase from `Running` to `Stopping`
//! - the owning server performs its teardown and marks the phase `Stopped`
//! - every later request, concurrent ones included, is a no-op
//!
//! Both phase changes are backed by `CancellationToken`, so they stay
//! observable after they fire: awaiting a phase that has already been
//! reached completes immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Signal that triggered shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT: interactive interrupt (Ctrl-C).
    Interrupt,
    /// SIGTERM: stop requested by the supervisor.
    Terminate,
}

/// Lifecycle phase of a coordinated service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// Accepting work; no shutdown requested yet.
    Running,
    /// Shutdown requested; teardown in progress.
    Stopping,
    /// Teardown complete. Terminal.
    Stopped,
}

/// Coordinates graceful shutdown of a server instance.
///
/// Clones share state: any clone may request shutdown, observe the current
/// phase, or wait for a phase change.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    triggered: Arc<AtomicBool>,
    stopping: CancellationToken,
    stopped: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a coordinator in the `Running` phase.
    pub fn new() -> Self {
        Self {
            triggered: Arc::new(AtomicBool::new(false)),
            stopping: CancellationToken::new(),
            stopped: CancellationToken::new(),
        }
    }

    /// Request shutdown.
    ///
    /// The first call wins and moves the phase to `Stopping`; every later
    /// call is a no-op. Returns `true` if this call performed the
    /// transition.
    pub fn request_shutdown(&self) -> bool {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Shutdown requested");
            self.stopping.cancel();
            true
        } else {
            false
        }
    }

    /// Whether a shutdown request has been observed.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> LifecyclePhase {
        if self.stopped.is_cancelled() {
            LifecyclePhase::Stopped
        } else if self.stopping.is_cancelled() {
            LifecyclePhase::Stopping
        } else {
            LifecyclePhase::Running
        }
    }

    /// Wait until shutdown has been requested.
    ///
    /// Completes immediately if the phase is already past `Running`.
    pub async fn stopping(&self) {
        self.stopping.cancelled().await;
    }

    /// Wait until teardown has completed.
    ///
    /// Completes immediately if the phase is already `Stopped`, and may be
    /// awaited any number of times.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await;
    }

    /// Mark teardown complete: `Stopping` becomes `Stopped`.
    ///
    /// Called by the owning server once its shutdown actions have run.
    /// `Stopped` is terminal; repeated calls are no-ops.
    pub fn mark_stopped(&self) {
        self.stopped.cancel();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for a termination signal (SIGINT or SIGTERM).
///
/// Returns which signal arrived; wiring it to
/// [`ShutdownCoordinator::request_shutdown`] is the caller's job, keeping
/// signal delivery just one shutdown trigger among others.
pub async fn wait_for_signal() -> ShutdownSignal {
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, initiating graceful shutdown");
            ShutdownSignal::Interrupt
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, initiating graceful shutdown");
            ShutdownSignal::Terminate
        }
    }
}
