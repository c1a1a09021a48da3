//! Assignment
//!
//! Pairs queued wallets with idle sponsors, index for index, bounded by the
//! remaining concurrency budget.

use crate::orchestrator::RunContext;
use crate::sponsor_pool::SponsorLease;
use crate::types::{WalletPatch, WalletRecord, WalletStatus, truncate_key};
use anyhow::Result;
use tracing::{debug, info, warn};

/// A wallet bound to the sponsor that will pay for its run.
pub struct Assignment {
    pub wallet: WalletRecord,
    pub lease: SponsorLease,
}

/// `min(queued, available, limit - busy)`
pub fn pairing_count(queued: usize, available: usize, limit: usize, busy: usize) -> usize {
    queued.min(available).min(limit.saturating_sub(busy))
}

pub async fn assign(context: &RunContext) -> Result<Vec<Assignment>> {
    let queue = context
        .store
        .list_by_status(WalletStatus::AwaitingExecution)
        .await?;
    if queue.is_empty() {
        return Ok(Vec::new());
    }

    let available = context.pool.list_available();
    let count = pairing_count(
        queue.len(),
        available.len(),
        context.concurrency_limit(),
        context.pool.busy_count(),
    );

    let mut assignments = Vec::with_capacity(count);
    for (wallet, sponsor) in queue.into_iter().zip(available).take(count) {
        let Some(lease) = context.pool.try_acquire(&sponsor) else {
            continue;
        };

        let patch = WalletPatch::new(wallet.secret_phrase.clone())
            .status(WalletStatus::Executing)
            .sponsor(lease.public_key());
        match context
            .store
            .upsert_if(patch, &[WalletStatus::AwaitingExecution])
            .await
        {
            Ok(Some(wallet)) => {
                info!(
                    "[Assign] sponsor {} -> wallet {:?}",
                    truncate_key(lease.public_key()),
                    wallet.public_key.as_deref().map(truncate_key)
                );
                lease.bind_wallet(wallet.public_key.clone());
                assignments.push(Assignment { wallet, lease });
            }
            Ok(None) => {
                debug!("Wallet left the queue before binding, sponsor stays idle");
                lease.release();
            }
            Err(e) => {
                warn!("Failed to bind wallet to sponsor: {:#}", e);
                lease.release();
            }
        }
    }

    Ok(assignments)
}
