//! Lifecycle module - from pending request to terminal outcome
//!
//! This module provides:
//! - `LifecycleCoordinator`, which races confirmation, rejection and timeout
//! - `Outcome` and `OutcomeStatus`, the immutable result of one lifecycle
//! - Progress sinks for the live countdown

mod coordinator;
mod outcome;
mod progress;

pub use coordinator::{LifecycleCoordinator, SignalCounters, TimeoutBudget};
pub use outcome::{Outcome, OutcomeStatus};
pub use progress::{ProgressSink, TerminalCountdown, TracingProgress};
