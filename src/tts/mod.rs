//! The TTS connection contract and data model for C6 (§4.6, §6).
//!
//! Grounded on the teacher's `services::tts::TtsClient` trait and
//! `Qwen3TtsClient::synthesize`, generalized to a persistent-connection
//! shape (`open`/`send`/`close`) since the wire protocol and connection
//! lifetime are interface-only here (§1 Non-goals), while §4.6 requires one
//! long-lived connection per worker rather than a one-shot request.

pub mod pool;

use async_trait::async_trait;

use crate::error::ConversionError;

/// One long-lived streaming connection to the TTS service. Implementations
/// own the underlying socket/stream; `send` issues one synthesis request
/// over it.
#[async_trait]
pub trait TtsConnection: Send {
    async fn send(&mut self, text: &str, voice_id: &str, rate: i32, pitch: i32) -> Result<Vec<u8>, ConversionError>;
    async fn close(&mut self);
}

/// Opens fresh [`TtsConnection`]s. Workers call this once on start and again
/// on every `reconnecting → working` transition (§4.6).
#[async_trait]
pub trait TtsConnector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn TtsConnection>, ConversionError>;
}

/// One unit of dispatch to the worker pool.
#[derive(Debug, Clone)]
pub struct SynthesisTask {
    pub part_index: u64,
    pub text: String,
    pub voice_id: String,
    pub rate: i32,
    pub pitch: i32,
}

/// One completed synthesis result, keyed by the originating task's
/// `part_index` for reassembly by C9.
#[derive(Debug, Clone)]
pub struct AudioFragment {
    pub part_index: u64,
    pub bytes: Vec<u8>,
}

/// A worker's lifecycle state (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Working,
    Reconnecting,
    Terminated,
}
