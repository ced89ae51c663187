use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;
use tracing::debug;

use super::{ServiceError, SpeechSynthesizer, Translator};
use crate::store::LanguageTag;
use crate::telemetry::events::duration_to_ms;

/// Stateless wrapper that bounds every translation and synthesis call with a timeout.
#[derive(Clone)]
pub struct TranslationClient {
    translator: Arc<dyn Translator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    translate_timeout: Duration,
    synthesize_timeout: Duration,
}

impl TranslationClient {
    pub fn new(
        translator: Arc<dyn Translator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        translate_timeout: Duration,
        synthesize_timeout: Duration,
    ) -> Self {
        Self {
            translator,
            synthesizer,
            translate_timeout,
            synthesize_timeout,
        }
    }

    pub async fn translate(
        &self,
        text: &str,
        from: &LanguageTag,
        to: &LanguageTag,
    ) -> Result<String, ServiceError> {
        if text.trim().is_empty() {
            return Ok(String::new());
        }

        // 同语种无需翻译。
        if from.same_language(to) {
            debug!(target: "playback", language = %to, "same-language target, skipping translation");
            return Ok(text.to_string());
        }

        match timeout(self.translate_timeout, self.translator.translate(text, from, to)).await {
            Ok(Ok(translated)) if translated.trim().is_empty() => Err(
                ServiceError::InvalidResponse("translator returned empty text".into()),
            ),
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout {
                operation: "translate",
                elapsed_ms: duration_to_ms(self.translate_timeout),
            }),
        }
    }

    pub async fn synthesize(&self, text: &str, language: &LanguageTag) -> Result<Bytes, ServiceError> {
        match timeout(
            self.synthesize_timeout,
            self.synthesizer.synthesize(text, language),
        )
        .await
        {
            Ok(Ok(audio)) if audio.is_empty() => Err(ServiceError::InvalidResponse(
                "synthesizer returned no audio".into(),
            )),
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout {
                operation: "synthesize",
                elapsed_ms: duration_to_ms(self.synthesize_timeout),
            }),
        }
    }
}
