//! Keel engine: desired-state synthesis, the reconcile state machine, and the runner that
//! drives it from the per-key trigger queue.

#![forbid(unsafe_code)]

pub mod config;
pub mod context;
pub mod reconciler;
pub mod runner;
pub mod synth;

pub use config::{EngineConfig, RunnerConfig};
pub use context::{Clock, ManualClock, PassContext, SystemClock};
pub use reconciler::{Cleanup, Directive, LogCleanup, Reconciler};
pub use runner::Runner;
pub use synth::{synthesize, Desired};
