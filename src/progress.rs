//! Progress reporting plumbing shared by the LLM pass runner, the TTS worker
//! pool and the pipeline runner.
//!
//! The teacher crate reports progress with an `indicatif::ProgressBar` owned
//! directly by `WorkflowManager`. The core has no UI of its own (§1
//! Non-goals), so it reports through an injected callback instead and lets
//! the host (here, the demonstration CLI) drive an `indicatif` bar from it.

use std::sync::Arc;

/// One step's progress, or a cross-cutting warning (e.g. the TTS pool's
/// health-recovery warning in §4.6).
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A named step has made progress. `completed`/`total` follow whatever
    /// unit that step counts in (blocks, sentences, fragments, ...).
    Step {
        step: &'static str,
        completed: u64,
        total: u64,
    },
    /// A step started.
    StepStarted { step: &'static str },
    /// A step finished.
    StepFinished { step: &'static str },
    /// A non-fatal warning surfaced without aborting the run (§4.6, §7).
    Warning { message: String },
}

pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// A no-op callback, useful for tests and library consumers that don't care
/// about progress.
pub fn noop_callback() -> ProgressCallback {
    Arc::new(|_event| {})
}
