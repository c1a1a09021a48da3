//! Maintenance Loop
//!
//! Keeps the idle part of the pool ledger-ready so assignment never waits on
//! an activation. Busy sponsors are never touched: each idle sponsor is
//! leased for the duration of its check.

use crate::funding::{self, FundingAction};
use crate::orchestrator::RunContext;
use crate::types::{PipelinePhase, truncate_key};
use tracing::{debug, info, warn};

/// Returns how many sponsors were activated or topped up.
pub async fn run_once(context: &RunContext) -> usize {
    let mut funded = 0;

    for sponsor in context.pool.list_available() {
        let Some(lease) = context.pool.try_acquire(&sponsor) else {
            continue;
        };
        lease.set_phase(PipelinePhase::Maintenance);

        match funding::ensure_funded(context, lease.keypair()).await {
            Ok(FundingAction::AlreadyFunded) => {}
            Ok(action) => {
                info!(
                    "[Maintenance] sponsor {}: {:?}",
                    truncate_key(lease.public_key()),
                    action
                );
                funded += 1;
            }
            Err(e) => warn!(
                "[Maintenance] could not fund sponsor {}: {}",
                truncate_key(lease.public_key()),
                e
            ),
        }
    }

    debug!("Maintenance pass complete: {} sponsor(s) funded", funded);
    funded
}
