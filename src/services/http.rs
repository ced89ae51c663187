//! JSON-over-HTTP translator and synthesizer backed by `ureq`.

use std::io::Read;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{ServiceError, SpeechSynthesizer, Translator};
use crate::store::LanguageTag;

const MAX_AUDIO_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpEndpoint {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

impl HttpEndpoint {
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            timeout_ms: default_http_timeout_ms(),
        }
    }

    pub fn with_api_key<S: Into<String>>(mut self, api_key: S) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn agent(&self) -> ureq::Agent {
        ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.timeout_ms))
            .build()
    }

    fn post(&self, agent: &ureq::Agent) -> ureq::Request {
        let request = agent.post(&self.url).set("Accept", "application/json");
        match &self.api_key {
            Some(key) => request.set("Authorization", &format!("Bearer {key}")),
            None => request,
        }
    }
}

fn map_ureq_error(operation: &'static str, err: ureq::Error) -> ServiceError {
    match err {
        ureq::Error::Status(status, response) => {
            let message = response
                .into_string()
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            ServiceError::Rejected { status, message }
        }
        ureq::Error::Transport(transport) => {
            warn!(target: "services", operation, error = %transport, "http transport failure");
            ServiceError::Unavailable(transport.to_string())
        }
    }
}

async fn run_blocking<T, F>(operation: &'static str, job: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|err| ServiceError::Unavailable(format!("{operation} worker failed: {err}")))?
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TranslateRequest<'a> {
    text: &'a str,
    from: &'a str,
    to: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslateResponse {
    translated_text: String,
}

/// Posts `{text, from, to}` and reads `{translatedText}`.
#[derive(Clone)]
pub struct HttpTranslator {
    endpoint: HttpEndpoint,
    agent: ureq::Agent,
}

impl HttpTranslator {
    pub fn new(endpoint: HttpEndpoint) -> Self {
        let agent = endpoint.agent();
        Self { endpoint, agent }
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(
        &self,
        text: &str,
        from: &LanguageTag,
        to: &LanguageTag,
    ) -> Result<String, ServiceError> {
        let body = serde_json::to_value(TranslateRequest {
            text,
            from: from.as_str(),
            to: to.as_str(),
        })
        .map_err(|err| ServiceError::InvalidResponse(err.to_string()))?;
        let request = self.endpoint.post(&self.agent);

        run_blocking("translate", move || {
            let response = request
                .send_json(body)
                .map_err(|err| map_ureq_error("translate", err))?;
            let parsed: TranslateResponse = response
                .into_json()
                .map_err(|err| ServiceError::InvalidResponse(err.to_string()))?;
            Ok(parsed.translated_text)
        })
        .await
    }
}

#[derive(Debug, Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    language: &'a str,
}

/// Posts `{text, language}` and reads the raw audio body.
#[derive(Clone)]
pub struct HttpSynthesizer {
    endpoint: HttpEndpoint,
    agent: ureq::Agent,
}

impl HttpSynthesizer {
    pub fn new(endpoint: HttpEndpoint) -> Self {
        let agent = endpoint.agent();
        Self { endpoint, agent }
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, language: &LanguageTag) -> Result<Bytes, ServiceError> {
        let body = serde_json::to_value(SynthesizeRequest {
            text,
            language: language.as_str(),
        })
        .map_err(|err| ServiceError::InvalidResponse(err.to_string()))?;
        let request = self.endpoint.post(&self.agent);

        run_blocking("synthesize", move || {
            let response = request
                .send_json(body)
                .map_err(|err| map_ureq_error("synthesize", err))?;
            let mut audio = Vec::new();
            response
                .into_reader()
                .take(MAX_AUDIO_BYTES)
                .read_to_end(&mut audio)
                .map_err(|err| ServiceError::InvalidResponse(err.to_string()))?;
            Ok(Bytes::from(audio))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_config_defaults_timeout() {
        let endpoint: HttpEndpoint =
            serde_json::from_str(r#"{"url":"https://translate.internal/v1"}"#).expect("valid json");
        assert_eq!(endpoint.timeout_ms, 10_000);
        assert!(endpoint.api_key.is_none());
    }

    #[test]
    fn translate_request_uses_camel_case() {
        let body = serde_json::to_value(TranslateRequest {
            text: "hi",
            from: "en",
            to: "ja",
        })
        .expect("serializable");
        assert_eq!(body, serde_json::json!({"text": "hi", "from": "en", "to": "ja"}));

        let parsed: TranslateResponse =
            serde_json::from_str(r#"{"translatedText":"こんにちは"}"#).expect("parse");
        assert_eq!(parsed.translated_text, "こんにちは");
    }

    #[tokio::test]
    async fn unreachable_endpoint_maps_to_unavailable() {
        let translator = HttpTranslator::new(HttpEndpoint {
            url: "http://127.0.0.1:9/translate".into(),
            api_key: None,
            timeout_ms: 500,
        });
        let result = translator
            .translate("hello", &"en".into(), &"fr".into())
            .await;
        assert!(matches!(result, Err(ServiceError::Unavailable(_))));
    }
}
