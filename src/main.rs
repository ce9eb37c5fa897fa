//! `novel2audiobookctl`: a thin composition-root CLI around the library.
//!
//! Grounded on the teacher's native `main.rs`, which wires
//! `Config::load` -> `llm::create_llm` -> `NativeStorage` ->
//! `tts::create_tts_client` -> `WorkflowManager::new().run()` as an explicit
//! composition root. The same shape is kept here, but `WorkflowManager` is
//! replaced by [`novel2audiobook_core::orchestrator::ConversionOrchestrator`]
//! and the concrete `LlmClient`/`TtsConnector` adapters below are minimal
//! reference implementations — the wire formats they speak are out of scope
//! for the core (§1 Non-goals) and exist here only so the binary has
//! something real to run against.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use inquire::Confirm;
use serde_json::json;

use novel2audiobook_core::config::Config;
use novel2audiobook_core::error::{ConversionError, ErrorKind};
use novel2audiobook_core::llm::LlmClient;
use novel2audiobook_core::orchestrator::ConversionOrchestrator;
use novel2audiobook_core::pipeline::steps::PipelineDeps;
use novel2audiobook_core::progress::ProgressEvent;
use novel2audiobook_core::retry::FixedDelays;
use novel2audiobook_core::storage::{NativeStorage, Storage};
use novel2audiobook_core::tts::{TtsConnection, TtsConnector};
use novel2audiobook_core::voice::{Voice, VoiceGender};

/// A generic OpenAI-chat-compatible completion client, reachable over HTTP.
/// Grounded on the teacher's `GeminiClient`/`OllamaClient`: one request
/// builder, one response parser, no retry logic of its own (retries are
/// layered on by [`novel2audiobook_core::retry`]).
struct HttpLlmClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl HttpLlmClient {
    fn new(cfg: &novel2audiobook_core::config::LlmConfig) -> Result<Self> {
        if cfg.api_url.is_empty() {
            anyhow::bail!("llm.api_url is not configured");
        }
        Ok(Self {
            client: reqwest::Client::new(),
            api_url: cfg.api_url.clone(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn completion(&self, prompt: &str) -> Result<String, ConversionError> {
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ConversionError::new(ErrorKind::LlmTimeout, "LLM request timed out").with_cause(e.into())
                } else {
                    ConversionError::new(ErrorKind::LlmApiError, e.to_string()).with_cause(e.into())
                }
            })?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ConversionError::new(ErrorKind::LlmRateLimited, "rate limited by LLM endpoint"));
        }
        if !response.status().is_success() {
            return Err(ConversionError::new(
                ErrorKind::LlmApiError,
                format!("LLM endpoint returned {}", response.status()),
            ));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ConversionError::new(ErrorKind::LlmApiError, e.to_string()).with_cause(e.into()))?;

        value
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ConversionError::new(ErrorKind::LlmApiError, "unexpected LLM response shape"))
    }
}

/// One HTTP-backed TTS connection. A "persistent connection" here is just a
/// reused [`reqwest::Client`]; the teacher's `acgnai`/`gpt_sovits`/`qwen3_tts`
/// clients make one HTTP call per utterance the same way, so the streaming
/// connection §4.6 describes is left to whatever real TTS backend a host
/// plugs in.
struct HttpTtsConnection {
    client: reqwest::Client,
    api_url: String,
}

#[async_trait]
impl TtsConnection for HttpTtsConnection {
    async fn send(&mut self, text: &str, voice_id: &str, rate: i32, pitch: i32) -> Result<Vec<u8>, ConversionError> {
        let body = json!({"text": text, "voice": voice_id, "rate": rate, "pitch": pitch});
        let response = self
            .client
            .post(&self.api_url)
            .timeout(Duration::from_secs(30))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ConversionError::new(ErrorKind::TtsTimeout, "TTS read timed out")
                } else {
                    ConversionError::new(ErrorKind::TtsWebsocketFailed, e.to_string())
                }
            })?;

        if response.status() == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            return Err(ConversionError::new(ErrorKind::TtsInvalidVoice, format!("invalid voice id '{voice_id}'")));
        }
        if !response.status().is_success() {
            return Err(ConversionError::new(
                ErrorKind::TtsWebsocketFailed,
                format!("TTS endpoint returned {}", response.status()),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ConversionError::new(ErrorKind::TtsWebsocketFailed, e.to_string()))?;
        if bytes.is_empty() {
            return Err(ConversionError::new(ErrorKind::TtsEmptyResponse, "TTS endpoint returned no audio"));
        }
        Ok(bytes.to_vec())
    }

    async fn close(&mut self) {}
}

struct HttpTtsConnector {
    api_url: String,
}

#[async_trait]
impl TtsConnector for HttpTtsConnector {
    async fn open(&self) -> Result<Box<dyn TtsConnection>, ConversionError> {
        Ok(Box::new(HttpTtsConnection {
            client: reqwest::Client::new(),
            api_url: self.api_url.clone(),
        }))
    }
}

fn parse_voice_gender(raw: &str) -> VoiceGender {
    match raw.to_ascii_lowercase().as_str() {
        "male" => VoiceGender::Male,
        "female" => VoiceGender::Female,
        _ => VoiceGender::Multilingual,
    }
}

fn build_progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {pos}/{len}")
            .unwrap()
            .progress_chars("=>-"),
    );
    bar
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = Config::load("config.yml").context("loading config.yml")?;
    config.ensure_directories()?;

    let llm_client: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(&config.llm)?);
    let llm_strategy = Arc::new(FixedDelays::llm());

    let tts_connector: Arc<dyn TtsConnector> = Arc::new(HttpTtsConnector {
        api_url: config.tts.api_url.clone(),
    });

    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());

    let enabled_voices: Vec<Voice> = config
        .tts
        .enabled_voices
        .iter()
        .map(|v| Voice {
            full_value: v.id.clone(),
            locale: v.locale.clone(),
            gender: parse_voice_gender(&v.gender),
            name: if v.name.is_empty() { v.id.clone() } else { v.name.clone() },
        })
        .collect();
    let narrator_voice = enabled_voices
        .iter()
        .find(|v| v.full_value == config.tts.narrator_voice)
        .cloned()
        .unwrap_or_else(|| Voice {
            full_value: config.tts.narrator_voice.clone(),
            locale: String::new(),
            gender: VoiceGender::Multilingual,
            name: config.tts.narrator_voice.clone(),
        });

    let files = storage.list(&config.input_folder).await?;
    let text_files: Vec<String> = files.into_iter().filter(|f| f.ends_with(".txt")).collect();
    if text_files.is_empty() {
        eprintln!("no .txt files found in {}", config.input_folder);
        return Ok(());
    }

    let chapter_count = text_files.len();
    for (chapter_index, path) in text_files.into_iter().enumerate() {
        let filename = Path::new(&path)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".to_string());
        println!("converting {path}");

        let text = String::from_utf8(storage.read(&path).await?).context("input file is not valid UTF-8")?;
        let output_name = format!("{}/{}.{}", config.output_folder, filename, config.audio.output_format);

        let deps = PipelineDeps {
            llm_client: llm_client.clone(),
            llm_strategy: llm_strategy.clone(),
            llm_threads: config.llm.llm_threads,
            tts_connector: tts_connector.clone(),
            tts_threads: config.tts.tts_threads,
            audio_backend: None,
            storage: storage.clone(),
            narrator_voice: narrator_voice.clone(),
            enabled_voices: enabled_voices.clone(),
            rate: config.tts.rate,
            pitch: config.tts.pitch,
            output_format: config.audio.output_format.clone(),
            silence_removal: config.audio.silence_removal,
            normalization: config.audio.normalization,
            output_filename: output_name,
            pronunciation_dictionary: Default::default(),
            cache_dir: Some(format!("{}/{}", config.build_folder, filename)),
        };

        let bar = build_progress_bar();
        let bar_handle = bar.clone();
        let orchestrator = ConversionOrchestrator::new(deps).with_progress(Arc::new(move |event| match event {
            ProgressEvent::StepStarted { step } => {
                bar_handle.set_message(step.to_string());
                bar_handle.set_position(0);
            }
            ProgressEvent::Step { completed, total, .. } => {
                bar_handle.set_length(total.max(1));
                bar_handle.set_position(completed);
            }
            ProgressEvent::StepFinished { .. } => {}
            ProgressEvent::Warning { message } => {
                bar_handle.println(format!("warning: {message}"));
            }
        }));

        if let Err(err) = orchestrator.run(text, None).await {
            bar.finish_and_clear();
            eprintln!("conversion failed for {path}: {err}");
            if !err.is_cancellation() {
                return Err(err.into());
            }
        } else {
            bar.finish_with_message("done");
        }

        let more_chapters_remain = chapter_index + 1 < chapter_count;
        if more_chapters_remain && !config.unattended {
            let proceed = Confirm::new("Continue to the next chapter?")
                .with_default(true)
                .prompt()
                .unwrap_or(false);
            if !proceed {
                break;
            }
        }
    }

    Ok(())
}
