//! Pipeline Engine
//!
//! Drives one bound (wallet, sponsor) pair through
//! Fund → Execute → Sweep → Finalize.
//!
//! * Fund failure skips Execute and Sweep.
//! * A funded run whose wallet is still locked holds its sponsor until the
//!   recorded unlock time before executing.
//! * Sweep always runs once Fund succeeded; its failure is alerted but never
//!   changes the wallet outcome.
//! * Finalize always runs: it writes the terminal status exactly once and
//!   releases the sponsor. Panics inside the earlier steps are caught here.

use crate::amount::Amount;
use crate::error::{LedgerError, PipelineError};
use crate::funding::{self, FundingAction};
use crate::keys::Keypair;
use crate::ledger::{AccountInfo, ClaimableBalance, Operation, TransactionRequest};
use crate::orchestrator::RunContext;
use crate::sponsor_pool::SponsorLease;
use crate::types::{PipelinePhase, TaskOutcome, WalletPatch, WalletRecord, truncate_key};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, info, warn};

/// Consecutive funding failures after which each further failure is logged
/// as a funder-level problem.
pub const FUNDING_FAILURE_ESCALATION: u32 = 3;

/// What Execute will put in the transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub claims: Vec<ClaimableBalance>,
    /// Amount forwarded to the recipient; zero means no payment operation.
    pub sendable: Amount,
}

/// Decide what to claim and send. Only balances unlocked at `now` are
/// claimed; the payment never dips the wallet below its minimum reserve.
pub fn plan_transfer(
    account: &AccountInfo,
    claimables: Vec<ClaimableBalance>,
    now: DateTime<Utc>,
    base_reserve: Amount,
) -> Result<TransferPlan, PipelineError> {
    let claims: Vec<ClaimableBalance> = claimables
        .into_iter()
        .filter(|c| c.is_unlocked(now))
        .collect();

    let claimed: Amount = claims.iter().map(|c| c.amount).sum();
    let total = account.native_balance + claimed;
    let reserve = account.minimum_balance(base_reserve);
    let sendable = if total > reserve {
        total - reserve
    } else {
        Amount::ZERO
    };

    if claims.is_empty() && !sendable.is_positive() {
        return Err(PipelineError::NothingToSend);
    }

    Ok(TransferPlan { claims, sendable })
}

pub async fn run(context: &RunContext, wallet: WalletRecord, lease: SponsorLease) -> TaskOutcome {
    let outcome = match AssertUnwindSafe(drive(context, &wallet, &lease))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            error!(
                "Pipeline for wallet {:?} aborted unexpectedly",
                wallet.public_key
            );
            TaskOutcome::Failed("internal error: pipeline aborted unexpectedly".to_string())
        }
    };

    finalize(context, &wallet, lease, &outcome).await;
    outcome
}

async fn drive(context: &RunContext, wallet: &WalletRecord, lease: &SponsorLease) -> TaskOutcome {
    lease.bind_wallet(wallet.public_key.clone());
    let sponsor_label = truncate_key(lease.public_key());
    let wallet_label = wallet
        .public_key
        .as_deref()
        .map(truncate_key)
        .unwrap_or_else(|| "<underived>".to_string());

    info!("[Pipeline] sponsor {} -> wallet {}", sponsor_label, wallet_label);

    lease.set_phase(PipelinePhase::Funding);
    match funding::ensure_funded(context, lease.keypair()).await {
        Ok(action) => {
            context.record_funding_success();
            if action != FundingAction::AlreadyFunded {
                debug!("Sponsor {} funded: {:?}", sponsor_label, action);
            }
        }
        Err(e) => {
            let failures = context.record_funding_failure();
            let err = PipelineError::Funding(e);
            error!("[Pipeline] {} for sponsor {}", err, sponsor_label);
            if failures >= FUNDING_FAILURE_ESCALATION {
                error!(
                    "{} consecutive funding failures: funder {} is likely exhausted or misconfigured",
                    failures,
                    context.funder.public_key()
                );
            }
            return TaskOutcome::Failed(err.reason());
        }
    }

    let evaluate_at = match wallet.unlock_time {
        Some(unlock_time) => {
            wait_for_unlock(lease, unlock_time, &wallet_label).await;
            Utc::now().max(unlock_time)
        }
        None => Utc::now(),
    };

    lease.set_phase(PipelinePhase::Executing);
    let pending = match execute(context, wallet, lease, evaluate_at).await {
        Ok(hash) => {
            info!("[Pipeline] wallet {} forwarded (tx {})", wallet_label, hash);
            TaskOutcome::Success(hash)
        }
        Err(e) => {
            warn!("[Pipeline] wallet {} failed: {}", wallet_label, e);
            TaskOutcome::Failed(e.reason())
        }
    };

    lease.set_phase(PipelinePhase::Sweeping);
    match sweep(context, lease.keypair()).await {
        Ok(Some(amount)) => info!("[Sweep] {} returned from sponsor {}", amount, sponsor_label),
        Ok(None) => debug!("[Sweep] nothing to reclaim from sponsor {}", sponsor_label),
        Err(e) => {
            error!("[Sweep] failed for sponsor {}: {}", sponsor_label, e);
            context.alerts.notify(format!(
                "SWEEP FAILED for sponsor {}: {}. Funds may be stranded, manual recovery required.",
                lease.public_key(),
                e
            ));
        }
    }

    pending
}

/// Sleep until `unlock_time`. Returns at once when it has already passed.
async fn wait_for_unlock(lease: &SponsorLease, unlock_time: DateTime<Utc>, wallet_label: &str) {
    let Ok(remaining) = (unlock_time - Utc::now()).to_std() else {
        return;
    };
    if remaining.is_zero() {
        return;
    }

    lease.set_phase(PipelinePhase::AwaitingUnlock);
    info!(
        "[Pipeline] wallet {} unlocks at {}, waiting {}s",
        wallet_label,
        unlock_time,
        remaining.as_secs()
    );
    tokio::time::sleep(remaining).await;
}

/// Claim every balance unlocked at `evaluate_at` and forward the sendable
/// amount in one transaction paid for by the sponsor and co-signed by the
/// wallet.
async fn execute(
    context: &RunContext,
    wallet: &WalletRecord,
    lease: &SponsorLease,
    evaluate_at: DateTime<Utc>,
) -> Result<String, PipelineError> {
    let target = Keypair::from_phrase(&wallet.secret_phrase)
        .map_err(|e| PipelineError::Derivation(format!("{:#}", e)))?;
    let target_key = target.public_key().to_string();

    let account = context
        .ledger
        .load_account(&target_key)
        .await
        .map_err(PipelineError::Execution)?
        .ok_or_else(|| PipelineError::Execution(LedgerError::NotFound(target_key.clone())))?;
    let claimables = context
        .ledger
        .claimable_balances(&target_key)
        .await
        .map_err(PipelineError::Execution)?;

    let plan = plan_transfer(&account, claimables, evaluate_at, context.settings.base_reserve)?;
    debug!(
        "Wallet {}: {} claim(s), sending {}",
        truncate_key(&target_key),
        plan.claims.len(),
        plan.sendable
    );

    let _sequence = context.sequences.lock(lease.public_key()).await;
    let sponsor = context
        .ledger
        .load_account(lease.public_key())
        .await
        .map_err(PipelineError::Execution)?
        .ok_or_else(|| {
            PipelineError::Execution(LedgerError::NotFound(lease.public_key().to_string()))
        })?;
    let base_fee = context
        .ledger
        .base_fee()
        .await
        .map_err(PipelineError::Execution)?;

    let mut request = TransactionRequest::new(&sponsor, base_fee, context.settings.submit_timeout);
    for claim in &plan.claims {
        request = request.with_operation(Operation::ClaimClaimableBalance {
            source: Some(target_key.clone()),
            balance_id: claim.id.clone(),
        });
    }
    if plan.sendable.is_positive() {
        request = request.with_operation(Operation::Payment {
            source: Some(target_key.clone()),
            destination: context.config.recipient.clone(),
            amount: plan.sendable,
        });
    }

    let receipt = context
        .ledger
        .submit(&request, &[lease.keypair(), &target])
        .await
        .map_err(PipelineError::Execution)?;

    Ok(receipt.hash)
}

/// Return everything the sponsor holds above its reserve and one fee to the
/// funder. `Ok(None)` when there is nothing worth sweeping.
pub async fn sweep(context: &RunContext, sponsor: &Keypair) -> Result<Option<Amount>, LedgerError> {
    let _sequence = context.sequences.lock(sponsor.public_key()).await;

    let Some(account) = context.ledger.load_account(sponsor.public_key()).await? else {
        return Ok(None);
    };
    let base_fee = context.ledger.base_fee().await?;

    let fee = Amount::from_stroops(i64::from(base_fee));
    let amount = account
        .spendable(context.settings.base_reserve)
        .saturating_sub(fee);
    if !amount.is_positive() {
        return Ok(None);
    }

    let request = TransactionRequest::new(&account, base_fee, context.settings.submit_timeout)
        .with_operation(Operation::Payment {
            source: None,
            destination: context.funder.public_key().to_string(),
            amount,
        });
    context.ledger.submit(&request, &[sponsor]).await?;

    Ok(Some(amount))
}

async fn finalize(
    context: &RunContext,
    wallet: &WalletRecord,
    lease: SponsorLease,
    outcome: &TaskOutcome,
) {
    lease.set_phase(PipelinePhase::Finalizing);

    let patch = WalletPatch::new(wallet.secret_phrase.clone())
        .status(outcome.status())
        .reason(outcome.reason());
    if let Err(e) = context.store.upsert(patch).await {
        error!(
            "Failed to record {} for wallet {:?}: {:#}",
            outcome.status(),
            wallet.public_key,
            e
        );
    }

    let sponsor = lease.public_key().to_string();
    lease.release();
    info!("[System] sponsor {} available again", truncate_key(&sponsor));
}
