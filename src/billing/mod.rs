//! 用量计量与计费对账。

pub mod ledger;
pub mod meter;
pub mod sync;

pub use ledger::{ActionType, LedgerEntry, LedgerHistory, PendingItem, UsageDelta};
pub use meter::{BillingConfig, BillingState, ChargeOutcome, UsageMeter, BILLABLE_MINUTE_MS};
pub use sync::{FlushHandle, LedgerFlusher, PendingSyncQueue, SyncConfig, SyncError};

#[cfg(test)]
mod tests;
