//! Wallet intake
//!
//! Classifies raw secret phrases into the lifecycle: `INVALID` (bad phrase
//! or unusable ledger response), `INACTIVE` (account missing), `SCHEDULED`
//! (future unlock found) or `PENDING` (nothing time-locked ahead).

use crate::keys::{Keypair, validate_phrase};
use crate::ledger::LedgerGateway;
use crate::store::WalletStore;
use crate::types::{ScheduleStats, WalletPatch, WalletStatus, normalize_phrase, truncate_key};
use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
enum Bucket {
    Scheduled,
    Pending,
    Invalid,
}

pub async fn schedule_new(
    ledger: &dyn LedgerGateway,
    store: &dyn WalletStore,
    phrases: &[String],
    now: DateTime<Utc>,
) -> Result<ScheduleStats> {
    let mut stats = ScheduleStats::default();

    for raw in phrases {
        let phrase = normalize_phrase(raw);
        if phrase.is_empty() {
            continue;
        }

        if store.find(&phrase).await?.is_some() {
            stats.duplicates += 1;
            continue;
        }

        let (patch, bucket) = classify(ledger, phrase, now).await;

        // A concurrent intake of the same phrase may have won since `find`.
        if store.insert_if_absent(patch).await?.is_none() {
            stats.duplicates += 1;
            continue;
        }
        match bucket {
            Bucket::Scheduled => stats.scheduled += 1,
            Bucket::Pending => stats.pending += 1,
            Bucket::Invalid => stats.invalid += 1,
        }
    }

    info!(
        "Intake complete: scheduled {}, pending {}, invalid {}, duplicates {}",
        stats.scheduled, stats.pending, stats.invalid, stats.duplicates
    );
    Ok(stats)
}

async fn classify(
    ledger: &dyn LedgerGateway,
    phrase: String,
    now: DateTime<Utc>,
) -> (WalletPatch, Bucket) {
    if !validate_phrase(&phrase) {
        let patch = WalletPatch::new(phrase)
            .status(WalletStatus::Invalid)
            .reason("invalid BIP39 phrase");
        return (patch, Bucket::Invalid);
    }

    let keypair = match Keypair::from_phrase(&phrase) {
        Ok(keypair) => keypair,
        Err(e) => {
            let patch = WalletPatch::new(phrase)
                .status(WalletStatus::Invalid)
                .reason(format!("{:#}", e));
            return (patch, Bucket::Invalid);
        }
    };
    let public_key = keypair.public_key().to_string();

    let lookup = match ledger.load_account(&public_key).await {
        Ok(Some(_)) => ledger.claimable_balances(&public_key).await.map(Some),
        Ok(None) => Ok(None),
        Err(e) => Err(e),
    };

    let patch = WalletPatch::new(phrase).public_key(public_key.clone());
    match lookup {
        Ok(None) => {
            debug!("Wallet {} not found on ledger", truncate_key(&public_key));
            let patch = patch
                .status(WalletStatus::Inactive)
                .reason("account not found on ledger");
            (patch, Bucket::Invalid)
        }
        Err(e) => {
            warn!("Intake lookup failed for {}: {}", truncate_key(&public_key), e);
            (
                patch.status(WalletStatus::Invalid).reason(e.to_string()),
                Bucket::Invalid,
            )
        }
        Ok(Some(claimables)) => {
            let next_unlock = claimables
                .iter()
                .filter_map(|c| c.predicate.unlock_time())
                .filter(|at| *at > now)
                .min();

            match next_unlock {
                Some(unlock_time) => (
                    patch
                        .status(WalletStatus::Scheduled)
                        .unlock_time(unlock_time),
                    Bucket::Scheduled,
                ),
                None => (
                    patch
                        .status(WalletStatus::Pending)
                        .reason("no upcoming lockup"),
                    Bucket::Pending,
                ),
            }
        }
    }
}
