//! # diorama-lifecycle
//!
//! Process lifecycle coordination for diorama services: a single-fire
//! shutdown latch with observable `Running -> Stopping -> Stopped` phases,
//! plus a helper that maps POSIX termination signals onto it.

mod shutdown;

pub use shutdown::{wait_for_signal, LifecyclePhase, ShutdownCoordinator, ShutdownSignal};
