//! Sponsor funding check shared by the pipeline's fund step and the
//! maintenance loop.

use crate::amount::Amount;
use crate::error::LedgerError;
use crate::keys::Keypair;
use crate::ledger::{Operation, TransactionRequest, minimum_balance};
use crate::orchestrator::RunContext;
use crate::types::truncate_key;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingAction {
    /// Sponsor account did not exist and was created with this balance.
    Activated(Amount),
    /// Sponsor was short by this amount and was topped up.
    ToppedUp(Amount),
    AlreadyFunded,
}

/// Make sure `sponsor` holds at least the configured funding amount above
/// its reserve, paying any shortfall from the funder.
pub async fn ensure_funded(
    context: &RunContext,
    sponsor: &Keypair,
) -> Result<FundingAction, LedgerError> {
    let target = context.config.funding_amount;
    let base_reserve = context.settings.base_reserve;

    let (operation, action) = match context.ledger.load_account(sponsor.public_key()).await? {
        None => {
            let starting_balance = minimum_balance(0, base_reserve) + target;
            (
                Operation::CreateAccount {
                    destination: sponsor.public_key().to_string(),
                    starting_balance,
                },
                FundingAction::Activated(starting_balance),
            )
        }
        Some(account) => {
            let spendable = account.spendable(base_reserve);
            if spendable >= target {
                debug!(
                    "Sponsor {} already funded ({} spendable)",
                    truncate_key(sponsor.public_key()),
                    spendable
                );
                return Ok(FundingAction::AlreadyFunded);
            }
            let shortfall = target - spendable;
            (
                Operation::Payment {
                    source: None,
                    destination: sponsor.public_key().to_string(),
                    amount: shortfall,
                },
                FundingAction::ToppedUp(shortfall),
            )
        }
    };

    let funder_key = context.funder.public_key();
    let _sequence = context.sequences.lock(funder_key).await;

    let funder = context
        .ledger
        .load_account(funder_key)
        .await?
        .ok_or_else(|| LedgerError::NotFound(funder_key.to_string()))?;
    let base_fee = context.ledger.base_fee().await?;

    let request = TransactionRequest::new(&funder, base_fee, context.settings.submit_timeout)
        .with_operation(operation);
    let receipt = context.ledger.submit(&request, &[&context.funder]).await?;

    info!(
        "Funder -> sponsor {}: {:?} (tx {})",
        truncate_key(sponsor.public_key()),
        action,
        receipt.hash
    );

    Ok(action)
}
