//! Scheduler
//!
//! Promotes wallets whose unlock time falls inside the lookahead window (or
//! who have no unlock time at all) into the execution queue. Promotion is
//! allowed to be early: the pipeline only claims balances that are already
//! unlocked when it builds the transaction.

use crate::store::WalletStore;
use crate::types::{WalletPatch, WalletRecord, WalletStatus};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

/// True when `wallet` should enter the queue at `now`.
pub fn is_due(wallet: &WalletRecord, now: DateTime<Utc>, lookahead: Duration) -> bool {
    let effective_unlock = wallet.unlock_time.unwrap_or(now);
    effective_unlock <= now + lookahead
}

/// Run one scheduling pass. Returns the number of promoted wallets.
pub async fn promote_due(
    store: &dyn WalletStore,
    now: DateTime<Utc>,
    lookahead: Duration,
) -> Result<usize> {
    let mut candidates = store.list_by_status(WalletStatus::Scheduled).await?;
    candidates.extend(store.list_by_status(WalletStatus::Pending).await?);

    let mut promoted = 0;
    for wallet in candidates.iter().filter(|w| is_due(w, now, lookahead)) {
        debug!(
            "Promoting wallet {:?} (unlock {:?})",
            wallet.public_key, wallet.unlock_time
        );
        // Skipped when a force run took the wallet since the listing
        let patch =
            WalletPatch::new(wallet.secret_phrase.clone()).status(WalletStatus::AwaitingExecution);
        if store
            .upsert_if(patch, &[WalletStatus::Scheduled, WalletStatus::Pending])
            .await?
            .is_some()
        {
            promoted += 1;
        }
    }

    if promoted > 0 {
        info!("Scheduler promoted {} wallet(s) to AWAITING_EXECUTION", promoted);
    }

    Ok(promoted)
}
