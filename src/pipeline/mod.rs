//! C8 Pipeline Runner (§4.8).
//!
//! Grounded on `WorkflowManager::process_chapter`'s per-chapter sequence
//! (analyze characters → generate script → synthesize → merge → cleanup),
//! generalized into the fixed, named step sequence §4.8 specifies, with an
//! explicit shared context instead of the teacher's struct fields mutated
//! directly on `self`.

pub mod steps;

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::audio::FileGroupMap;
use crate::cast::Cast;
use crate::error::ConversionError;
use crate::progress::{ProgressCallback, ProgressEvent};
use crate::text::{Sentence, TextBlock};
use crate::tts::AudioFragment;
use crate::voice::assigner::VoiceAssignment;
use crate::voice::VoicePool;

/// Shared mutable state threaded through every step (§4.8).
#[derive(Default)]
pub struct ConversionContext {
    pub text: String,
    pub sentences: Vec<Sentence>,
    pub extraction_blocks: Vec<TextBlock>,
    pub assignment_blocks: Vec<TextBlock>,
    pub cast: Option<Cast>,
    pub voice_pool_snapshot: Option<VoicePool>,
    pub voice_assignment: Option<VoiceAssignment>,
    /// `sentence_index -> speaker canonical name`.
    pub speaker_list: Vec<(usize, String)>,
    pub audio_fragments: Vec<AudioFragment>,
    pub file_group_map: FileGroupMap,
    pub written_files: Vec<String>,
}

type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ConversionError>> + Send + 'a>>;

/// A named pipeline step: a progress weight and a run function over the
/// shared context (§4.8).
pub struct PipelineStep {
    pub name: &'static str,
    pub weight: f32,
    #[allow(clippy::type_complexity)]
    run: Box<
        dyn for<'a> Fn(&'a mut ConversionContext, &'a CancellationToken, &'a ProgressCallback) -> StepFuture<'a>
            + Send
            + Sync,
    >,
}

impl PipelineStep {
    pub fn new<F>(name: &'static str, weight: f32, run: F) -> Self
    where
        F: for<'a> Fn(&'a mut ConversionContext, &'a CancellationToken, &'a ProgressCallback) -> StepFuture<'a>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name,
            weight,
            run: Box::new(run),
        }
    }
}

/// Executes the fixed step sequence in order, checking cancellation at each
/// step boundary and short-circuiting on the first failure (§4.8).
pub struct PipelineRunner {
    steps: Vec<PipelineStep>,
}

impl PipelineRunner {
    pub fn new(steps: Vec<PipelineStep>) -> Self {
        Self { steps }
    }

    pub async fn run(
        &self,
        ctx: &mut ConversionContext,
        cancel: &CancellationToken,
        progress: &ProgressCallback,
    ) -> Result<(), ConversionError> {
        for step in &self.steps {
            if cancel.is_cancelled() {
                return Err(ConversionError::cancelled());
            }
            progress(ProgressEvent::StepStarted { step: step.name });
            (step.run)(ctx, cancel, progress).await?;
            progress(ProgressEvent::StepFinished { step: step.name });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::noop_callback;

    #[tokio::test]
    async fn runner_short_circuits_on_first_failure() {
        let ran_second = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_second_clone = ran_second.clone();

        let steps = vec![
            PipelineStep::new("first", 1.0, move |_ctx, _cancel, _progress| {
                Box::pin(async move { Err(ConversionError::cancelled()) })
            }),
            PipelineStep::new("second", 1.0, move |_ctx, _cancel, _progress| {
                let ran_second_clone = ran_second_clone.clone();
                Box::pin(async move {
                    ran_second_clone.store(true, std::sync::atomic::Ordering::SeqCst);
                    Ok(())
                })
            }),
        ];
        let runner = PipelineRunner::new(steps);
        let mut ctx = ConversionContext::default();
        let cancel = CancellationToken::new();
        let progress = noop_callback();

        let result = runner.run(&mut ctx, &cancel, &progress).await;
        assert!(result.is_err());
        assert!(!ran_second.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn runner_checks_cancellation_before_each_step() {
        let steps = vec![PipelineStep::new("never_runs", 1.0, |_ctx, _cancel, _progress| {
            Box::pin(async move { panic!("should not run after cancellation") })
        })];
        let runner = PipelineRunner::new(steps);
        let mut ctx = ConversionContext::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let progress = noop_callback();

        let result = runner.run(&mut ctx, &cancel, &progress).await;
        assert!(result.unwrap_err().is_cancellation());
    }
}
