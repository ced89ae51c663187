//! 外部协作方契约：语音识别、翻译、语音合成、播放与身份信息。

pub mod client;
pub mod http;

pub use client::TranslationClient;
pub use http::{HttpEndpoint, HttpSynthesizer, HttpTranslator};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::store::LanguageTag;

/// Failure of a request/response collaborator call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("{operation} timed out after {elapsed_ms}ms")]
    Timeout {
        operation: &'static str,
        elapsed_ms: u64,
    },
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("service rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid service response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecognitionError {
    #[error("speech recognizer unavailable: {0}")]
    Unavailable(String),
    #[error("recognition already running")]
    AlreadyRunning,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("audio device error: {0}")]
    Device(String),
    #[error("playback interrupted")]
    Interrupted,
}

/// 连续识别流上的事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    Partial {
        text: String,
        language: Option<LanguageTag>,
    },
    Final {
        text: String,
        language: LanguageTag,
    },
    NoMatch,
    Canceled {
        reason: String,
    },
}

/// Receiving end of a continuous recognition session. Closing the channel ends the stream.
pub type RecognitionStream = mpsc::Receiver<RecognitionEvent>;

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Starts continuous recognition with automatic detection among `candidates`.
    async fn start_continuous(
        &self,
        candidates: &[LanguageTag],
    ) -> Result<RecognitionStream, RecognitionError>;

    async fn stop(&self);
}

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        text: &str,
        from: &LanguageTag,
        to: &LanguageTag,
    ) -> Result<String, ServiceError>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, language: &LanguageTag) -> Result<Bytes, ServiceError>;
}

#[async_trait]
pub trait AudioPlayer: Send + Sync {
    /// Resolves once the clip has finished playing or failed.
    async fn play(&self, audio: Bytes) -> Result<(), PlaybackError>;

    async fn stop(&self);
}

/// 会话开始时由身份服务提供的参与者信息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantProfile {
    pub participant_id: String,
    pub language: LanguageTag,
    /// Balance hint; the ledger is authoritative once it has history.
    pub balance: i64,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn profile(&self, participant_id: &str) -> Result<ParticipantProfile, ServiceError>;
}
