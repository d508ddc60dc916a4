//! Step reporting for the bootstrap pipeline.
//!
//! The orchestrator announces every step, sub-step and retry through a
//! [`StepLogger`] it receives at construction time. Presentation lives in the
//! implementations; the pipeline only calls the trait.

use tracing::{debug, info, warn};

/// How a step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    Skipped,
    Failed,
}

/// Receiver of pipeline progress.
pub trait StepLogger: Send + Sync {
    fn step_started(&self, name: &str);

    fn step_finished(&self, name: &str, outcome: StepOutcome);

    fn substep(&self, name: &str);

    /// Called once per attempt after the first one of a retried operation.
    fn log_retry(&self);

    fn log(&self, message: &str);
}

/// Step logger that forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStepLogger;

impl StepLogger for TracingStepLogger {
    fn step_started(&self, name: &str) {
        info!(step = name, "starting");
    }

    fn step_finished(&self, name: &str, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Done => info!(step = name, "done"),
            StepOutcome::Skipped => debug!(step = name, "skipped"),
            StepOutcome::Failed => warn!(step = name, "failed"),
        }
    }

    fn substep(&self, name: &str) {
        info!(substep = name);
    }

    fn log_retry(&self) {
        warn!("retrying");
    }

    fn log(&self, message: &str) {
        info!("{message}");
    }
}
