mod handle;
mod task;
mod worker;

pub use handle::{CoordinatorError, StartOutcome, TurnCoordinatorHandle};

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::billing::{BillingState, FlushHandle, SyncError, UsageMeter};
use crate::clock::Clock;
use crate::services::{AudioPlayer, SpeechRecognizer, SpeechSynthesizer, TranslationClient, Translator};
use crate::store::{DocumentStore, LanguageTag, SessionDocument};
use crate::turn::capture::SpeechCaptureAdapter;
use crate::turn::config::CoordinatorConfig;
use crate::turn::constants::{COMMAND_CHANNEL_CAPACITY, EVENT_CHANNEL_CAPACITY};
use crate::turn::lock::TurnLockManager;
use crate::turn::playback::PlaybackSequencer;
use crate::turn::types::{DeliveryReport, RecognitionEndReason, TurnEvent, TurnPhase};

use self::worker::CoordinatorWorker;

/// External collaborators a coordinator talks to.
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub store: Arc<dyn DocumentStore>,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub translator: Arc<dyn Translator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub player: Arc<dyn AudioPlayer>,
    pub clock: Arc<dyn Clock>,
}

/// The local participant a coordinator acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantContext {
    pub session_id: String,
    pub participant_id: String,
    pub language: LanguageTag,
}

pub(crate) enum CoordinatorCommand {
    StartTurn(oneshot::Sender<StartOutcome>),
    Abort(oneshot::Sender<bool>),
    TopUp {
        tokens: i64,
        reply: oneshot::Sender<BillingState>,
    },
    Shutdown(oneshot::Sender<Result<usize, SyncError>>),
}

/// How a turn task ended.
#[derive(Debug)]
pub(crate) enum TurnFinish {
    Ended(RecognitionEndReason),
    Delivered {
        report: DeliveryReport,
        active_ms: u64,
    },
    Canceled,
}

/// Messages from turn tasks and timers back to the coordinator loop.
#[derive(Debug)]
pub(crate) enum TurnSignal {
    Phase { turn_id: u64, phase: TurnPhase },
    Event { turn_id: u64, event: TurnEvent },
    Finished { turn_id: u64, finish: TurnFinish },
    InactivityTimeout { generation: u64 },
}

/// Spawns the per-participant turn coordinator actor.
///
/// `document` is the session as last read; later changes arrive through the
/// store's change feed. `flusher` is shut down (with a final flush) when the
/// coordinator stops.
pub fn spawn_coordinator(
    config: CoordinatorConfig,
    deps: CoordinatorDeps,
    participant: ParticipantContext,
    document: SessionDocument,
    meter: UsageMeter,
    flusher: Option<FlushHandle>,
) -> TurnCoordinatorHandle {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let initial_phase = if meter.has_outstanding() {
        TurnPhase::Disabled
    } else {
        TurnPhase::default()
    };
    let (phase_tx, phase_rx) = watch::channel(initial_phase);
    let (billing_tx, billing_rx) = watch::channel(meter.state());

    let changes = deps.store.subscribe(&participant.session_id);
    let lock_manager = TurnLockManager::new(
        Arc::clone(&deps.store),
        Arc::clone(&deps.clock),
        config.lock.clone(),
    );
    let capture = Arc::new(SpeechCaptureAdapter::new(Arc::clone(&deps.recognizer)));
    let client = TranslationClient::new(
        Arc::clone(&deps.translator),
        Arc::clone(&deps.synthesizer),
        config.delivery.translate_timeout(),
        config.delivery.synthesize_timeout(),
    );
    let sequencer = Arc::new(PlaybackSequencer::new(
        client,
        Arc::clone(&deps.player),
        config.delivery.playback_timeout(),
    ));

    let session_id = participant.session_id.clone();
    let participant_id = participant.participant_id.clone();

    let worker = CoordinatorWorker::new(
        config,
        participant,
        Arc::clone(&deps.store),
        lock_manager,
        capture,
        sequencer,
        meter,
        flusher,
        document,
        command_rx,
        signal_tx,
        signal_rx,
        events_tx.clone(),
        phase_tx,
        billing_tx,
        changes,
    );

    TurnCoordinatorHandle::new(
        session_id,
        participant_id,
        command_tx,
        events_tx,
        phase_rx,
        billing_rx,
        worker.spawn(),
    )
}
