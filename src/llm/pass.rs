//! C7 LLM Pass Runner: Extract and Assign passes over text blocks (§4.7).
//!
//! Grounded on the teacher's `WorkflowManager::process_chapter`, which
//! builds an LLM prompt from a chapter's text and character map, then uses
//! `futures_util::stream::iter(...).buffer_unordered(max_concurrency)` to
//! bound parallel work — the same bounded-concurrency idiom is used here
//! for both passes, parameterized by `llmThreads`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use log::warn;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::cast::{Character, Gender};
use crate::error::{ConversionError, ErrorKind};
use crate::llm::LlmClient;
use crate::progress::{ProgressCallback, ProgressEvent};
use crate::retry::{run_with_retry, RetryStrategy};
use crate::text::TextBlock;

#[derive(Debug, Deserialize)]
struct ExtractRecord {
    #[serde(rename = "canonicalName")]
    canonical_name: String,
    #[serde(default)]
    variations: Vec<String>,
    gender: String,
}

fn parse_gender(raw: &str) -> Result<Gender, ()> {
    match raw {
        "male" => Ok(Gender::Male),
        "female" => Ok(Gender::Female),
        "unknown" => Ok(Gender::Unknown),
        _ => Err(()),
    }
}

/// Parses and validates an Extract response: a JSON array of
/// `{canonicalName, variations, gender}` records with gender in the allowed
/// set (§4.7).
fn validate_extract_response(raw: &str) -> Result<Vec<Character>, ConversionError> {
    let records: Vec<ExtractRecord> = serde_json::from_str(raw).map_err(|e| {
        ConversionError::new(
            ErrorKind::LlmValidationError,
            format!("extract response is not a valid JSON array: {e}"),
        )
    })?;

    records
        .into_iter()
        .map(|r| {
            let gender = parse_gender(&r.gender).map_err(|_| {
                ConversionError::new(
                    ErrorKind::LlmValidationError,
                    format!("invalid gender value: {}", r.gender),
                )
            })?;
            Ok(Character {
                canonical_name: r.canonical_name,
                variations: r.variations,
                gender,
            })
        })
        .collect()
}

/// Parses and validates an Assign response: one `index:CODE` pair per input
/// sentence, every CODE present in `character_table` (§4.7).
fn validate_assign_response(
    raw: &str,
    expected_indices: &[usize],
    character_table: &[String],
) -> Result<Vec<(usize, String)>, ConversionError> {
    let parsed: HashMap<String, String> = serde_json::from_str(raw).map_err(|e| {
        ConversionError::new(
            ErrorKind::LlmValidationError,
            format!("assign response is not a valid JSON object: {e}"),
        )
    })?;

    if parsed.len() != expected_indices.len() {
        return Err(ConversionError::new(
            ErrorKind::LlmValidationError,
            format!(
                "expected {} index:CODE pairs, got {}",
                expected_indices.len(),
                parsed.len()
            ),
        ));
    }

    let mut pairs = Vec::with_capacity(expected_indices.len());
    for &index in expected_indices {
        let code = parsed.get(&index.to_string()).ok_or_else(|| {
            ConversionError::new(
                ErrorKind::LlmValidationError,
                format!("missing speaker code for sentence {index}"),
            )
        })?;
        if !character_table.iter().any(|c| c.eq_ignore_ascii_case(code)) {
            return Err(ConversionError::new(
                ErrorKind::LlmValidationError,
                format!("unknown speaker code '{code}' for sentence {index}"),
            ));
        }
        pairs.push((index, code.clone()));
    }
    Ok(pairs)
}

async fn invoke_block<F>(
    client: &dyn LlmClient,
    strategy: &dyn RetryStrategy,
    cancel: &CancellationToken,
    render_prompt: &F,
    block: &TextBlock,
) -> Result<String, ConversionError>
where
    F: Fn(&TextBlock) -> String + Sync,
{
    let prompt = render_prompt(block);
    run_with_retry(strategy, cancel, |attempt| {
        let prompt = prompt.clone();
        async move {
            if attempt > 0 {
                warn!("retrying block {} (attempt {attempt})", block.block_index);
            }
            client.completion(&prompt).await
        }
    })
    .await
}

/// Runs the Extract pass over `blocks`, returning one character list per
/// block in block order, for consumption by [`crate::cast::aggregate`].
pub async fn run_extract_pass<F>(
    blocks: &[TextBlock],
    client: &dyn LlmClient,
    strategy: &dyn RetryStrategy,
    llm_threads: usize,
    cancel: &CancellationToken,
    progress: &ProgressCallback,
    render_prompt: F,
) -> Result<Vec<Vec<Character>>, ConversionError>
where
    F: Fn(&TextBlock) -> String + Sync,
{
    let total = blocks.len() as u64;
    let completed = Arc::new(AtomicU64::new(0));

    let results = stream::iter(blocks.iter().enumerate())
        .map(|(i, block)| {
            let completed = completed.clone();
            let progress = progress.clone();
            let render_prompt = &render_prompt;
            async move {
                if cancel.is_cancelled() {
                    return (i, Err(ConversionError::cancelled()));
                }
                let raw = invoke_block(client, strategy, cancel, render_prompt, block).await;
                let result = raw.and_then(|text| validate_extract_response(&text));
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                progress(ProgressEvent::Step {
                    step: "character_extraction",
                    completed: done,
                    total,
                });
                (i, result)
            }
        })
        .buffer_unordered(llm_threads.max(1))
        .collect::<Vec<_>>()
        .await;

    let mut ordered: Vec<Option<Vec<Character>>> = (0..blocks.len()).map(|_| None).collect();
    for (i, result) in results {
        ordered[i] = Some(result?);
    }
    Ok(ordered.into_iter().map(|o| o.unwrap_or_default()).collect())
}

/// Runs the Assign pass over `blocks`, returning the full per-sentence
/// `(sentence_index, speaker_code)` list sorted by sentence index.
pub async fn run_assign_pass<F>(
    blocks: &[TextBlock],
    character_table: &[String],
    client: &dyn LlmClient,
    strategy: &dyn RetryStrategy,
    llm_threads: usize,
    cancel: &CancellationToken,
    progress: &ProgressCallback,
    render_prompt: F,
) -> Result<Vec<(usize, String)>, ConversionError>
where
    F: Fn(&TextBlock) -> String + Sync,
{
    let total = blocks.len() as u64;
    let completed = Arc::new(AtomicU64::new(0));

    let results = stream::iter(blocks.iter())
        .map(|block| {
            let completed = completed.clone();
            let progress = progress.clone();
            let render_prompt = &render_prompt;
            async move {
                if cancel.is_cancelled() {
                    return Err(ConversionError::cancelled());
                }
                let expected_indices: Vec<usize> = block.sentences.iter().map(|s| s.index).collect();
                let raw = invoke_block(client, strategy, cancel, render_prompt, block).await?;
                let pairs = validate_assign_response(&raw, &expected_indices, character_table)?;
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                progress(ProgressEvent::Step {
                    step: "speaker_assignment",
                    completed: done,
                    total,
                });
                Ok(pairs)
            }
        })
        .buffer_unordered(llm_threads.max(1))
        .collect::<Vec<Result<Vec<(usize, String)>, ConversionError>>>()
        .await;

    let mut flattened = Vec::new();
    for result in results {
        flattened.extend(result?);
    }
    flattened.sort_by_key(|(index, _)| *index);
    Ok(flattened)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::noop_callback;
    use crate::retry::ExponentialBackoff;
    use crate::text::Sentence;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedLlm {
        responses: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn completion(&self, _prompt: &str) -> Result<String, ConversionError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(ConversionError::new(ErrorKind::LlmApiError, "exhausted"));
            }
            Ok(responses.remove(0))
        }
    }

    fn block(index: usize, sentence_index: usize) -> TextBlock {
        TextBlock {
            block_index: index,
            sentence_start_index: sentence_index,
            sentences: vec![Sentence {
                index: sentence_index,
                text: "Hello there.".to_string(),
            }],
        }
    }

    fn fast_strategy() -> ExponentialBackoff {
        ExponentialBackoff {
            base: Duration::from_millis(1),
            multiplier: 1.0,
            max_delay: Duration::from_millis(2),
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn extract_pass_parses_valid_response() {
        let client = ScriptedLlm {
            responses: Mutex::new(vec![
                r#"[{"canonicalName":"Alice","variations":["Al"],"gender":"female"}]"#.to_string(),
            ]),
        };
        let strategy = fast_strategy();
        let cancel = CancellationToken::new();
        let progress = noop_callback();

        let result = run_extract_pass(&[block(0, 0)], &client, &strategy, 2, &cancel, &progress, |_| {
            "prompt".to_string()
        })
        .await
        .unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0][0].canonical_name, "Alice");
    }

    #[tokio::test]
    async fn extract_pass_fails_with_validation_error_on_malformed_json() {
        let client = ScriptedLlm {
            responses: Mutex::new(vec!["not json".to_string(), "not json".to_string(), "not json".to_string()]),
        };
        let strategy = fast_strategy();
        let cancel = CancellationToken::new();
        let progress = noop_callback();

        let err = run_extract_pass(&[block(0, 0)], &client, &strategy, 1, &cancel, &progress, |_| {
            "prompt".to_string()
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::LlmValidationError);
    }

    #[tokio::test]
    async fn assign_pass_validates_speaker_codes_against_table() {
        let client = ScriptedLlm {
            responses: Mutex::new(vec![r#"{"0":"Alice"}"#.to_string()]),
        };
        let strategy = fast_strategy();
        let cancel = CancellationToken::new();
        let progress = noop_callback();
        let table = vec!["Alice".to_string(), "Narrator".to_string()];

        let result = run_assign_pass(&[block(0, 0)], &table, &client, &strategy, 1, &cancel, &progress, |_| {
            "prompt".to_string()
        })
        .await
        .unwrap();

        assert_eq!(result, vec![(0, "Alice".to_string())]);
    }

    #[tokio::test]
    async fn assign_pass_rejects_unknown_speaker_code() {
        let client = ScriptedLlm {
            responses: Mutex::new(vec![
                r#"{"0":"Ghost"}"#.to_string(),
                r#"{"0":"Ghost"}"#.to_string(),
                r#"{"0":"Ghost"}"#.to_string(),
            ]),
        };
        let strategy = fast_strategy();
        let cancel = CancellationToken::new();
        let progress = noop_callback();
        let table = vec!["Alice".to_string()];

        let err = run_assign_pass(&[block(0, 0)], &table, &client, &strategy, 1, &cancel, &progress, |_| {
            "prompt".to_string()
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::LlmValidationError);
    }
}
