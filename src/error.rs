//! The error taxonomy surfaced across the conversion pipeline.
//!
//! Every fatal error that crosses a pipeline step boundary is translated into
//! a [`ConversionError`] tagged by [`ErrorKind`]. Everywhere else (storage
//! I/O, config parsing, retry bookkeeping) plain `anyhow::Result` is used, the
//! way the teacher crate's `Storage`/`LlmClient`/`TtsClient` traits do.

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use thiserror::Error;

/// Discriminator for a [`ConversionError`]. Retriability is a pure function
/// of the kind (see [`ErrorKind::is_retriable`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConversionCancelled,
    ConversionNoContent,
    LlmNotConfigured,
    LlmApiError,
    LlmTimeout,
    LlmRateLimited,
    LlmValidationError,
    TtsWebsocketFailed,
    TtsTimeout,
    TtsEmptyResponse,
    TtsInvalidVoice,
    InsufficientVoices,
    FfmpegLoadFailed,
    FfmpegProcessError,
    FilePermissionDenied,
    FileSystemError,
    UnknownError,
}

impl ErrorKind {
    /// Whether [`crate::retry`] strategies should ever retry an error of this
    /// kind. Cancellation always overrides this: `should_retry` returns
    /// `false` for cancellation regardless of what this reports.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorKind::LlmApiError
                | ErrorKind::LlmTimeout
                | ErrorKind::LlmRateLimited
                | ErrorKind::LlmValidationError
                | ErrorKind::TtsWebsocketFailed
                | ErrorKind::TtsTimeout
                | ErrorKind::TtsEmptyResponse
                | ErrorKind::FfmpegLoadFailed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConversionCancelled => "CONVERSION_CANCELLED",
            ErrorKind::ConversionNoContent => "CONVERSION_NO_CONTENT",
            ErrorKind::LlmNotConfigured => "LLM_NOT_CONFIGURED",
            ErrorKind::LlmApiError => "LLM_API_ERROR",
            ErrorKind::LlmTimeout => "LLM_TIMEOUT",
            ErrorKind::LlmRateLimited => "LLM_RATE_LIMITED",
            ErrorKind::LlmValidationError => "LLM_VALIDATION_ERROR",
            ErrorKind::TtsWebsocketFailed => "TTS_WEBSOCKET_FAILED",
            ErrorKind::TtsTimeout => "TTS_TIMEOUT",
            ErrorKind::TtsEmptyResponse => "TTS_EMPTY_RESPONSE",
            ErrorKind::TtsInvalidVoice => "TTS_INVALID_VOICE",
            ErrorKind::InsufficientVoices => "INSUFFICIENT_VOICES",
            ErrorKind::FfmpegLoadFailed => "FFMPEG_LOAD_FAILED",
            ErrorKind::FfmpegProcessError => "FFMPEG_PROCESS_ERROR",
            ErrorKind::FilePermissionDenied => "FILE_PERMISSION_DENIED",
            ErrorKind::FileSystemError => "FILE_SYSTEM_ERROR",
            ErrorKind::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fatal, surfaced error: a code, a human message, an optional cause chain
/// and context bag, and a timestamp (§7).
#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct ConversionError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub cause: Option<anyhow::Error>,
    pub context: HashMap<String, String>,
    pub timestamp: SystemTime,
}

impl ConversionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            context: HashMap::new(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn with_cause(mut self, cause: anyhow::Error) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::ConversionCancelled, "conversion was cancelled")
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind == ErrorKind::ConversionCancelled
    }
}
