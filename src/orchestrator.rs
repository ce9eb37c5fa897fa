//! C10 Conversion Orchestrator (§4.10).
//!
//! Grounded on the teacher's `main.rs` native entry point, which wires
//! `Config::load` → `llm::create_llm` → `NativeStorage` → `tts::create_tts_client`
//! → `WorkflowManager::new().run()` as an explicit composition root — the
//! same shape here, generalized into a reusable `run(text, file_names)`
//! entry point instead of a one-shot `main` (§9 Dependency injection: typed
//! builder passed into the orchestrator, not runtime service lookup).

use std::sync::Arc;

use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::error::{ConversionError, ErrorKind};
use crate::pipeline::steps::{self, PipelineDeps};
use crate::pipeline::{ConversionContext, PipelineRunner};
use crate::progress::{noop_callback, ProgressCallback};

/// Validates preconditions, builds the fixed pipeline, runs it to
/// completion or cancellation, and releases resources on any terminal
/// outcome (§4.10).
pub struct ConversionOrchestrator {
    deps: Arc<PipelineDeps>,
    cancel: CancellationToken,
    progress: ProgressCallback,
}

impl ConversionOrchestrator {
    pub fn new(deps: PipelineDeps) -> Self {
        Self {
            deps: Arc::new(deps),
            cancel: CancellationToken::new(),
            progress: noop_callback(),
        }
    }

    /// Wires an external progress observer, replacing the no-op default.
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    /// A cancellation handle safe to hold and call independently of `run`.
    pub fn cancellation_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cooperative and idempotent: calling this a second time is a no-op
    /// (§5 Cancellation).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn validate_preconditions(&self, text: &str) -> Result<(), ConversionError> {
        if text.trim().is_empty() {
            return Err(ConversionError::new(
                ErrorKind::ConversionNoContent,
                "input text is empty",
            ));
        }
        if self.deps.enabled_voices.is_empty() && self.deps.narrator_voice.full_value.is_empty() {
            return Err(ConversionError::new(
                ErrorKind::LlmNotConfigured,
                "no narrator voice configured",
            ));
        }
        Ok(())
    }

    /// Runs one conversion end-to-end. On terminal success, failure, or
    /// cancellation, resources (TTS connections held by workers, the
    /// cancellation token itself) are released as the pipeline and its
    /// workers unwind (§4.10).
    pub async fn run(&self, text: String, output_filename: Option<String>) -> Result<(), ConversionError> {
        self.validate_preconditions(&text)?;

        let mut ctx = ConversionContext {
            text,
            ..ConversionContext::default()
        };
        if let Some(filename) = output_filename {
            ctx.file_group_map.insert(0, filename);
        }

        let runner = PipelineRunner::new(vec![
            steps::character_extraction(self.deps.clone()),
            steps::voice_assignment(self.deps.clone()),
            steps::speaker_assignment(self.deps.clone()),
            steps::text_sanitization(),
            steps::dictionary_processing(self.deps.clone()),
            steps::tts_conversion(self.deps.clone()),
            steps::audio_merge(self.deps.clone()),
            steps::save(self.deps.clone()),
        ]);

        info!("conversion started ({} chars)", ctx.text.len());
        let result = runner.run(&mut ctx, &self.cancel, &self.progress).await;
        match &result {
            Ok(()) => info!("conversion completed"),
            Err(e) if e.is_cancellation() => info!("conversion cancelled"),
            Err(e) => error!("conversion failed: {e}"),
        }
        result
    }
}
