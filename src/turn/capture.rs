//! 语音采集适配：包装连续识别流，支持幂等中止。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::constants::COORDINATOR_TARGET;
use super::types::RecognitionEndReason;
use crate::services::{RecognitionError, RecognitionEvent, RecognitionStream, SpeechRecognizer};
use crate::store::LanguageTag;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    Partial {
        text: String,
        language: Option<LanguageTag>,
    },
    Final {
        text: String,
        language: LanguageTag,
    },
    Ended(RecognitionEndReason),
    Aborted,
}

/// Owns at most one running recognition session.
pub struct SpeechCaptureAdapter {
    recognizer: Arc<dyn SpeechRecognizer>,
    active: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
}

impl SpeechCaptureAdapter {
    pub fn new(recognizer: Arc<dyn SpeechRecognizer>) -> Self {
        Self {
            recognizer,
            active: AtomicBool::new(false),
            cancel: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Starts continuous recognition. `cancel` ends the returned stream early.
    pub async fn start(
        &self,
        candidates: &[LanguageTag],
        cancel: CancellationToken,
    ) -> Result<CaptureStream, RecognitionError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(RecognitionError::AlreadyRunning);
        }

        match self.recognizer.start_continuous(candidates).await {
            Ok(events) => {
                *self.cancel.lock() = Some(cancel.clone());
                debug!(
                    target: COORDINATOR_TARGET,
                    candidates = candidates.len(),
                    "speech recognition started"
                );
                Ok(CaptureStream { events, cancel })
            }
            Err(err) => {
                self.active.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Stops the running recognition, if any. Returns whether something was stopped.
    pub async fn stop(&self) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.cancel.lock().take();
        self.recognizer.stop().await;
        true
    }

    /// Cancels the stream and stops the recognizer. A no-op when nothing is running.
    pub async fn abort(&self) -> bool {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        let stopped = self.stop().await;
        if stopped {
            info!(target: COORDINATOR_TARGET, "speech recognition aborted");
        }
        stopped
    }
}

pub struct CaptureStream {
    events: RecognitionStream,
    cancel: CancellationToken,
}

impl CaptureStream {
    /// Next recognition event. Empty final text is reported as [`RecognitionEndReason::Empty`].
    pub async fn next(&mut self) -> CaptureEvent {
        let event = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return CaptureEvent::Aborted,
            event = self.events.recv() => event,
        };

        match event {
            Some(RecognitionEvent::Partial { text, language }) => {
                CaptureEvent::Partial { text, language }
            }
            Some(RecognitionEvent::Final { text, .. }) if text.trim().is_empty() => {
                CaptureEvent::Ended(RecognitionEndReason::Empty)
            }
            Some(RecognitionEvent::Final { text, language }) => CaptureEvent::Final {
                text: text.trim().to_string(),
                language,
            },
            Some(RecognitionEvent::NoMatch) => CaptureEvent::Ended(RecognitionEndReason::NoMatch),
            Some(RecognitionEvent::Canceled { reason }) => {
                CaptureEvent::Ended(RecognitionEndReason::Canceled(reason))
            }
            None => CaptureEvent::Ended(RecognitionEndReason::Canceled(
                "recognition stream closed".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    struct ScriptedRecognizer {
        script: Mutex<Vec<RecognitionEvent>>,
        stops: AtomicUsize,
        keep_open: Mutex<Option<mpsc::Sender<RecognitionEvent>>>,
    }

    impl ScriptedRecognizer {
        fn new(script: Vec<RecognitionEvent>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                stops: AtomicUsize::new(0),
                keep_open: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl SpeechRecognizer for ScriptedRecognizer {
        async fn start_continuous(
            &self,
            _candidates: &[LanguageTag],
        ) -> Result<RecognitionStream, RecognitionError> {
            let (tx, rx) = mpsc::channel(8);
            for event in self.script.lock().drain(..) {
                tx.try_send(event).expect("script fits channel");
            }
            *self.keep_open.lock() = Some(tx);
            Ok(rx)
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.keep_open.lock().take();
        }
    }

    #[tokio::test]
    async fn stream_maps_recognition_events() {
        let recognizer = ScriptedRecognizer::new(vec![
            RecognitionEvent::Partial {
                text: "hel".into(),
                language: None,
            },
            RecognitionEvent::Final {
                text: " hello ".into(),
                language: "en-US".into(),
            },
            RecognitionEvent::Final {
                text: "  ".into(),
                language: "en-US".into(),
            },
            RecognitionEvent::NoMatch,
        ]);
        let adapter = SpeechCaptureAdapter::new(recognizer.clone());
        let mut stream = adapter
            .start(&["en-US".into()], CancellationToken::new())
            .await
            .expect("start succeeds");

        assert!(matches!(stream.next().await, CaptureEvent::Partial { .. }));
        assert_eq!(
            stream.next().await,
            CaptureEvent::Final {
                text: "hello".into(),
                language: "en-US".into()
            }
        );
        assert_eq!(
            stream.next().await,
            CaptureEvent::Ended(RecognitionEndReason::Empty)
        );
        assert_eq!(
            stream.next().await,
            CaptureEvent::Ended(RecognitionEndReason::NoMatch)
        );
    }

    #[tokio::test]
    async fn abort_is_idempotent_and_cancels_stream() {
        let recognizer = ScriptedRecognizer::new(Vec::new());
        let adapter = SpeechCaptureAdapter::new(recognizer.clone());
        let mut stream = adapter
            .start(&["ja".into()], CancellationToken::new())
            .await
            .expect("start succeeds");

        assert!(matches!(
            adapter.start(&["ja".into()], CancellationToken::new()).await,
            Err(RecognitionError::AlreadyRunning)
        ));

        assert!(adapter.abort().await);
        assert!(!adapter.abort().await);
        assert_eq!(recognizer.stops.load(Ordering::SeqCst), 1);
        assert_eq!(stream.next().await, CaptureEvent::Aborted);
        assert!(!adapter.is_active());
    }
}
