//! Concrete step builders for the fixed sequence of §4.8:
//! `character_extraction, voice_assignment, speaker_assignment,
//! text_sanitization, dictionary_processing, tts_conversion, audio_merge,
//! save`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::audio::{self, AudioBackend, FileGroupMap};
use crate::cast;
use crate::error::{ConversionError, ErrorKind};
use crate::llm::pass::{run_assign_pass, run_extract_pass};
use crate::llm::LlmClient;
use crate::retry::RetryStrategy;
use crate::storage::Storage;
use crate::text::{block::EXTRACTION_BUDGET, pack_blocks, split_sentences, ASSIGNMENT_BUDGET};
use crate::tts::pool::run_pool;
use crate::tts::{AudioFragment, SynthesisTask, TtsConnector};
use crate::voice::assigner::assign_voices;
use crate::voice::{Voice, VoicePool};

use super::PipelineStep;

/// Everything a pipeline's steps need beyond what they compute themselves.
/// Built once by the orchestrator and shared by `Arc` across step closures.
pub struct PipelineDeps {
    pub llm_client: Arc<dyn LlmClient>,
    pub llm_strategy: Arc<dyn RetryStrategy>,
    pub llm_threads: usize,
    pub tts_connector: Arc<dyn TtsConnector>,
    pub tts_threads: usize,
    pub audio_backend: Option<Arc<dyn AudioBackend>>,
    pub storage: Arc<dyn Storage>,
    pub narrator_voice: Voice,
    pub enabled_voices: Vec<Voice>,
    pub rate: i32,
    pub pitch: i32,
    pub output_format: String,
    pub silence_removal: bool,
    pub normalization: bool,
    pub output_filename: String,
    /// Word -> replacement pronunciation substitutions (dictionary_processing).
    pub pronunciation_dictionary: HashMap<String, String>,
    /// When set, completed fragments are cached under this directory keyed
    /// by `part_index` so a rerun of the same conversion skips re-synthesis
    /// of already-produced fragments — the per-conversion analog of the
    /// teacher's `state.json`/`chunk_{:04}.mp3` resume check.
    pub cache_dir: Option<String>,
}

fn fragment_cache_path(cache_dir: &str, part_index: u64) -> String {
    format!("{cache_dir}/fragment_{part_index:08}.bin")
}

fn render_extract_prompt(block: &crate::text::TextBlock) -> String {
    format!(
        "Identify every named character in the following passage. Respond with a JSON array of \
         {{\"canonicalName\": string, \"variations\": string[], \"gender\": \"male\"|\"female\"|\"unknown\"}}.\n\n{}",
        block.joined_text()
    )
}

fn render_assign_prompt(block: &crate::text::TextBlock, character_table: &[String]) -> String {
    format!(
        "Known speakers: {}. For each numbered sentence below, respond with a JSON object mapping \
         the sentence index to the speaking character's name.\n\n{}",
        character_table.join(", "),
        block
            .sentences
            .iter()
            .map(|s| format!("{}: {}", s.index, s.text))
            .collect::<Vec<_>>()
            .join("\n")
    )
}

/// Strips markdown code fences and emphasis markers the way the teacher's
/// `script::strip_code_blocks` strips fenced LLM output, generalized here to
/// sanitize narrative sentence text before synthesis.
fn sanitize_text(text: &str) -> String {
    let mut cleaned = text.trim();
    for fence in ["```json", "```"] {
        if cleaned.starts_with(fence) {
            cleaned = cleaned.trim_start_matches(fence);
        }
    }
    cleaned = cleaned.trim_end_matches("```").trim();
    cleaned.replace(['*', '_', '#'], "")
}

pub fn character_extraction(deps: Arc<PipelineDeps>) -> PipelineStep {
    PipelineStep::new("character_extraction", 0.08, move |ctx, cancel, progress| {
        let deps = deps.clone();
        Box::pin(async move {
            if ctx.text.trim().is_empty() {
                return Err(ConversionError::new(
                    ErrorKind::ConversionNoContent,
                    "input text is empty",
                ));
            }
            ctx.sentences = split_sentences(&ctx.text);
            ctx.extraction_blocks = pack_blocks(&ctx.sentences, EXTRACTION_BUDGET);

            let per_block = run_extract_pass(
                &ctx.extraction_blocks,
                deps.llm_client.as_ref(),
                deps.llm_strategy.as_ref(),
                deps.llm_threads,
                cancel,
                progress,
                render_extract_prompt,
            )
            .await?;

            ctx.cast = Some(cast::aggregate(per_block));
            Ok(())
        })
    })
}

pub fn voice_assignment(deps: Arc<PipelineDeps>) -> PipelineStep {
    PipelineStep::new("voice_assignment", 0.06, move |ctx, _cancel, _progress| {
        let deps = deps.clone();
        Box::pin(async move {
            let cast = ctx
                .cast
                .as_ref()
                .expect("character_extraction runs before voice_assignment");
            let pool = VoicePool::new(deps.enabled_voices.clone());
            let pool_snapshot = pool.clone();
            let assignment = assign_voices(cast, pool, deps.narrator_voice.clone())?;
            ctx.voice_pool_snapshot = Some(pool_snapshot);
            ctx.voice_assignment = Some(assignment);
            Ok(())
        })
    })
}

pub fn speaker_assignment(deps: Arc<PipelineDeps>) -> PipelineStep {
    PipelineStep::new("speaker_assignment", 0.12, move |ctx, cancel, progress| {
        let deps = deps.clone();
        Box::pin(async move {
            ctx.assignment_blocks = pack_blocks(&ctx.sentences, ASSIGNMENT_BUDGET);
            let character_table: Vec<String> = ctx
                .cast
                .as_ref()
                .expect("character_extraction runs before speaker_assignment")
                .characters()
                .iter()
                .map(|c| c.canonical_name.clone())
                .collect();

            let pairs = run_assign_pass(
                &ctx.assignment_blocks,
                &character_table,
                deps.llm_client.as_ref(),
                deps.llm_strategy.as_ref(),
                deps.llm_threads,
                cancel,
                progress,
                |block| render_assign_prompt(block, &character_table),
            )
            .await?;

            ctx.speaker_list = pairs;
            Ok(())
        })
    })
}

pub fn text_sanitization() -> PipelineStep {
    PipelineStep::new("text_sanitization", 0.02, move |ctx, _cancel, _progress| {
        Box::pin(async move {
            for sentence in &mut ctx.sentences {
                sentence.text = sanitize_text(&sentence.text);
            }
            Ok(())
        })
    })
}

pub fn dictionary_processing(deps: Arc<PipelineDeps>) -> PipelineStep {
    PipelineStep::new("dictionary_processing", 0.02, move |ctx, _cancel, _progress| {
        let deps = deps.clone();
        Box::pin(async move {
            if deps.pronunciation_dictionary.is_empty() {
                return Ok(());
            }
            for sentence in &mut ctx.sentences {
                for (word, replacement) in &deps.pronunciation_dictionary {
                    if sentence.text.contains(word.as_str()) {
                        sentence.text = sentence.text.replace(word.as_str(), replacement);
                    }
                }
            }
            Ok(())
        })
    })
}

pub fn tts_conversion(deps: Arc<PipelineDeps>) -> PipelineStep {
    PipelineStep::new("tts_conversion", 0.22, move |ctx, cancel, progress| {
        let deps = deps.clone();
        Box::pin(async move {
            let assignment = ctx
                .voice_assignment
                .as_ref()
                .expect("voice_assignment runs before tts_conversion");
            let speakers: HashMap<usize, String> = ctx.speaker_list.iter().cloned().collect();

            let mut tasks = Vec::with_capacity(ctx.sentences.len());
            let mut cached_fragments = Vec::new();
            for sentence in &ctx.sentences {
                let part_index = sentence.index as u64;

                if let Some(cache_dir) = &deps.cache_dir {
                    let cache_path = fragment_cache_path(cache_dir, part_index);
                    if deps.storage.exists(&cache_path).await.unwrap_or(false) {
                        if let Ok(bytes) = deps.storage.read(&cache_path).await {
                            cached_fragments.push(AudioFragment { part_index, bytes });
                            continue;
                        }
                    }
                }

                let speaker = speakers
                    .get(&sentence.index)
                    .cloned()
                    .unwrap_or_else(|| cast::RESERVED_NARRATOR.to_string());
                let voice = assignment
                    .voice_for(&speaker)
                    .or_else(|| assignment.voice_for(cast::RESERVED_NARRATOR))
                    .expect("narrator voice is always assigned");
                tasks.push(SynthesisTask {
                    part_index,
                    text: sentence.text.clone(),
                    voice_id: voice.full_value.clone(),
                    rate: deps.rate,
                    pitch: deps.pitch,
                });
            }

            let mut fragments = run_pool(
                deps.tts_connector.clone(),
                tasks,
                deps.tts_threads,
                cancel.clone(),
                progress.clone(),
            )
            .await?;

            if let Some(cache_dir) = &deps.cache_dir {
                for fragment in &fragments {
                    let cache_path = fragment_cache_path(cache_dir, fragment.part_index);
                    let _ = deps.storage.write(&cache_path, &fragment.bytes).await;
                }
            }

            fragments.extend(cached_fragments);
            ctx.audio_fragments = fragments;
            Ok(())
        })
    })
}

pub fn audio_merge(deps: Arc<PipelineDeps>) -> PipelineStep {
    PipelineStep::new("audio_merge", 0.1, move |ctx, _cancel, _progress| {
        let deps = deps.clone();
        Box::pin(async move {
            if ctx.file_group_map.is_empty() {
                // No explicit chapter boundaries were configured: everything
                // goes to a single output file.
                let mut map = FileGroupMap::new();
                map.insert(0, deps.output_filename.clone());
                ctx.file_group_map = map;
            }

            let groups = ctx.file_group_map.group(std::mem::take(&mut ctx.audio_fragments));
            ctx.written_files = groups.iter().map(|(name, _)| name.clone()).collect();
            audio::merge_and_write(
                groups,
                &deps.output_format,
                deps.audio_backend.as_deref(),
                deps.silence_removal,
                deps.normalization,
                deps.storage.as_ref(),
            )
            .await
            .map_err(|e| {
                ConversionError::new(ErrorKind::FileSystemError, e.to_string()).with_cause(e)
            })?;
            Ok(())
        })
    })
}

pub fn save(deps: Arc<PipelineDeps>) -> PipelineStep {
    PipelineStep::new("save", 0.01, move |ctx, _cancel, _progress| {
        let deps = deps.clone();
        Box::pin(async move {
            for filename in &ctx.written_files {
                let written = deps
                    .storage
                    .exists(filename)
                    .await
                    .map_err(|e| ConversionError::new(ErrorKind::FileSystemError, e.to_string()).with_cause(e))?;
                if !written {
                    return Err(ConversionError::new(
                        ErrorKind::FileSystemError,
                        format!("expected output file {filename} was not written"),
                    ));
                }
            }
            Ok(())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConversionError as CErr;
    use crate::llm::LlmClient;
    use crate::pipeline::{ConversionContext, PipelineRunner};
    use crate::progress::noop_callback;
    use crate::retry::ExponentialBackoff;
    use crate::storage::NativeStorage;
    use crate::text::Sentence;
    use crate::tts::TtsConnection;
    use crate::voice::assigner::assign_voices;
    use crate::voice::VoiceGender;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn sanitize_text_strips_fences_and_emphasis() {
        assert_eq!(sanitize_text("```json\nhello\n```"), "hello");
        assert_eq!(sanitize_text("**bold** and _italic_"), "bold and italic");
    }

    struct UnreachableLlm;

    #[async_trait]
    impl LlmClient for UnreachableLlm {
        async fn completion(&self, _prompt: &str) -> Result<String, CErr> {
            panic!("tts_conversion must not call the LLM")
        }
    }

    /// Fails every request: proves a cached `part_index` is never re-sent.
    struct PoisonedConnection;

    #[async_trait]
    impl TtsConnection for PoisonedConnection {
        async fn send(&mut self, _text: &str, _voice_id: &str, _rate: i32, _pitch: i32) -> Result<Vec<u8>, CErr> {
            Err(ConversionError::new(ErrorKind::TtsInvalidVoice, "should never be reached"))
        }
        async fn close(&mut self) {}
    }

    struct PoisonedConnector;

    #[async_trait]
    impl crate::tts::TtsConnector for PoisonedConnector {
        async fn open(&self) -> Result<Box<dyn TtsConnection>, CErr> {
            Ok(Box::new(PoisonedConnection))
        }
    }

    fn test_voice(id: &str, gender: VoiceGender) -> Voice {
        Voice {
            full_value: id.to_string(),
            locale: "en-US".to_string(),
            gender,
            name: id.to_string(),
        }
    }

    fn test_deps(cache_dir: String) -> PipelineDeps {
        let enabled_voices = vec![
            test_voice("m1", VoiceGender::Male),
            test_voice("m2", VoiceGender::Male),
            test_voice("f1", VoiceGender::Female),
            test_voice("f2", VoiceGender::Female),
            test_voice("ml1", VoiceGender::Multilingual),
        ];
        PipelineDeps {
            llm_client: Arc::new(UnreachableLlm),
            llm_strategy: Arc::new(ExponentialBackoff {
                base: Duration::from_millis(1),
                multiplier: 1.0,
                max_delay: Duration::from_millis(2),
                max_attempts: 1,
            }),
            llm_threads: 1,
            tts_connector: Arc::new(PoisonedConnector),
            tts_threads: 1,
            audio_backend: None,
            storage: Arc::new(NativeStorage::new()),
            narrator_voice: test_voice("narrator", VoiceGender::Multilingual),
            enabled_voices,
            rate: 0,
            pitch: 0,
            output_format: "mp3".to_string(),
            silence_removal: false,
            normalization: false,
            output_filename: "out.mp3".to_string(),
            pronunciation_dictionary: HashMap::new(),
            cache_dir: Some(cache_dir),
        }
    }

    #[tokio::test]
    async fn tts_conversion_skips_synthesis_for_a_cached_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().to_str().unwrap().to_string();
        let deps = test_deps(cache_dir.clone());

        // Pre-populate the cache for sentence 0; sentence 0 is the only
        // sentence, so if the step reaches the connector at all it hits the
        // poisoned one and fails the step.
        let cache_path = fragment_cache_path(&cache_dir, 0);
        deps.storage.write(&cache_path, b"cached bytes").await.unwrap();

        let pool = crate::voice::VoicePool::new(deps.enabled_voices.clone());
        let cast = crate::cast::aggregate(vec![]);
        let assignment = assign_voices(&cast, pool, deps.narrator_voice.clone()).unwrap();

        let mut ctx = ConversionContext {
            sentences: vec![Sentence {
                index: 0,
                text: "Hello.".to_string(),
            }],
            voice_assignment: Some(assignment),
            ..ConversionContext::default()
        };

        let runner = PipelineRunner::new(vec![tts_conversion(Arc::new(deps))]);
        let cancel = CancellationToken::new();
        let progress = noop_callback();
        runner.run(&mut ctx, &cancel, &progress).await.unwrap();

        assert_eq!(ctx.audio_fragments.len(), 1);
        assert_eq!(ctx.audio_fragments[0].bytes, b"cached bytes".to_vec());
    }
}
