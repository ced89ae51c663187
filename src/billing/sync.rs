//! 账本同步：待同步队列与防抖批量写入。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use super::ledger::PendingItem;
use crate::store::{LedgerStore, StoreError};
use crate::telemetry::events::record_ledger_flush;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Trailing quiet window before a batch is written.
    pub debounce_ms: u64,
    pub retry_backoff_ms: u64,
    pub max_retry_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2_000,
            retry_backoff_ms: 1_000,
            max_retry_backoff_ms: 30_000,
        }
    }
}

impl SyncConfig {
    fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let backoff = self
            .retry_backoff_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_retry_backoff_ms.max(self.retry_backoff_ms));
        Duration::from_millis(backoff)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("ledger flusher is not running")]
    Stopped,
    #[error("ledger flush failed: {0}")]
    Store(#[from] StoreError),
}

/// 单个用户的待同步批次。整体换出清空，不做部分出队。
#[derive(Debug, Default)]
pub struct PendingSyncQueue {
    items: Mutex<Vec<PendingItem>>,
}

impl PendingSyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: PendingItem) {
        self.items.lock().push(item);
    }

    /// Swaps the queue out and leaves it empty.
    pub fn take_all(&self) -> Vec<PendingItem> {
        std::mem::take(&mut *self.items.lock())
    }

    /// Puts a failed batch back ahead of anything enqueued since it was taken.
    pub fn restore_front(&self, mut batch: Vec<PendingItem>) {
        let mut items = self.items.lock();
        batch.append(&mut items);
        *items = batch;
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<PendingItem> {
        self.items.lock().clone()
    }
}

enum FlushCommand {
    Nudge,
    FlushNow(oneshot::Sender<Result<usize, SyncError>>),
    Shutdown(oneshot::Sender<Result<usize, SyncError>>),
}

/// Handle to a running [`LedgerFlusher`].
#[derive(Clone)]
pub struct FlushHandle {
    tx: mpsc::UnboundedSender<FlushCommand>,
}

impl std::fmt::Debug for FlushHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl FlushHandle {
    /// Schedules a debounced flush; repeated requests within the window coalesce.
    pub fn request_flush(&self) {
        if self.tx.send(FlushCommand::Nudge).is_err() {
            debug!(target: "ledger_sync", "flush requested after flusher stopped");
        }
    }

    /// Writes whatever is queued right now, bypassing the debounce window.
    pub async fn flush_now(&self) -> Result<usize, SyncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(FlushCommand::FlushNow(reply_tx))
            .map_err(|_| SyncError::Stopped)?;
        reply_rx.await.map_err(|_| SyncError::Stopped)?
    }

    /// Performs a last flush and stops the flusher.
    pub async fn shutdown(&self) -> Result<usize, SyncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(FlushCommand::Shutdown(reply_tx))
            .map_err(|_| SyncError::Stopped)?;
        reply_rx.await.map_err(|_| SyncError::Stopped)?
    }
}

/// Single writer that persists the pending-sync queue in debounced batches.
pub struct LedgerFlusher {
    participant_id: String,
    queue: Arc<PendingSyncQueue>,
    store: Arc<dyn LedgerStore>,
    config: SyncConfig,
    rx: mpsc::UnboundedReceiver<FlushCommand>,
    failures: u32,
    attempt: u32,
}

impl LedgerFlusher {
    pub fn spawn<S: Into<String>>(
        participant_id: S,
        queue: Arc<PendingSyncQueue>,
        store: Arc<dyn LedgerStore>,
        config: SyncConfig,
    ) -> (FlushHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let flusher = Self {
            participant_id: participant_id.into(),
            queue,
            store,
            config,
            rx,
            failures: 0,
            attempt: 0,
        };
        let task = tokio::spawn(flusher.run());
        (FlushHandle { tx }, task)
    }

    async fn run(mut self) {
        let debounce = Duration::from_millis(self.config.debounce_ms);
        let mut deadline: Option<Instant> = None;

        loop {
            let command = match deadline {
                Some(at) => tokio::select! {
                    command = self.rx.recv() => command,
                    _ = sleep_until(at) => {
                        deadline = self.flush_scheduled().await;
                        continue;
                    }
                },
                None => self.rx.recv().await,
            };

            match command {
                Some(FlushCommand::Nudge) => {
                    // 重试退避期间不因新的请求提前写入。
                    if self.failures == 0 || deadline.is_none() {
                        deadline = Some(Instant::now() + debounce);
                    }
                }
                Some(FlushCommand::FlushNow(reply)) => {
                    let result = self.flush_once().await;
                    if result.is_err() {
                        deadline = Some(Instant::now() + self.config.backoff(self.failures));
                    }
                    let _ = reply.send(result);
                }
                Some(FlushCommand::Shutdown(reply)) => {
                    let result = self.flush_once().await;
                    let _ = reply.send(result);
                    break;
                }
                None => {
                    if let Err(err) = self.flush_once().await {
                        warn!(
                            target: "ledger_sync",
                            participant_id = %self.participant_id,
                            %err,
                            pending = self.queue.len(),
                            "final ledger flush failed, entries remain queued"
                        );
                    }
                    break;
                }
            }
        }
    }

    /// Returns the next deadline: none after success, a backoff after failure.
    async fn flush_scheduled(&mut self) -> Option<Instant> {
        match self.flush_once().await {
            Ok(_) => None,
            Err(_) => Some(Instant::now() + self.config.backoff(self.failures)),
        }
    }

    async fn flush_once(&mut self) -> Result<usize, SyncError> {
        let batch = self.queue.take_all();
        if batch.is_empty() {
            return Ok(0);
        }

        self.attempt = self.attempt.saturating_add(1);
        let size = batch.len();

        match self.store.append_batch(&batch).await {
            Ok(written) => {
                self.failures = 0;
                record_ledger_flush(&self.participant_id, size, "success", self.attempt);
                debug!(
                    target: "ledger_sync",
                    participant_id = %self.participant_id,
                    size,
                    written,
                    "ledger batch persisted"
                );
                Ok(written)
            }
            Err(err) => {
                self.failures = self.failures.saturating_add(1);
                self.queue.restore_front(batch);
                record_ledger_flush(&self.participant_id, size, "failure", self.attempt);
                warn!(
                    target: "ledger_sync",
                    participant_id = %self.participant_id,
                    %err,
                    size,
                    failures = self.failures,
                    "ledger batch write failed, keeping entries queued"
                );
                Err(SyncError::Store(err))
            }
        }
    }
}
